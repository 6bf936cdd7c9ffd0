//! ACL management endpoints

use super::fsm::Command;
use super::server::{Dispatch, Server};
use crate::acl::{new_secret, AclToken, TokenType};
use crate::common::{AuditEventType, Error, Result};
use crate::structs::{
    AclBootstrapRequest, AclPolicyUpsertRequest, AclTokenCreateRequest, AclTokenCreateResponse,
    WriteMeta,
};
use chrono::{Duration, Utc};
use tracing::info;

impl Server {
    /// Create the initial management token. Succeeds once per cluster.
    pub async fn acl_bootstrap(&self, mut req: AclBootstrapRequest) -> Result<AclTokenCreateResponse> {
        self.metrics.rpc_requests.inc();
        if let Some(resp) = self.forward(&mut req).await? {
            return Ok(resp);
        }
        let _timer = self.metrics.timer(&["volplane", "acl", "bootstrap"]);

        if !self.acl.enabled() {
            return Err(Error::Validation("ACL support is disabled".into()));
        }
        if self.acl.is_bootstrapped() {
            return Err(Error::Conflict("ACL bootstrap already done".into()));
        }

        let secret = new_secret();
        let token = AclToken::new(&secret, "Bootstrap Token", TokenType::Management);
        let accessor_id = token.accessor_id.clone();
        let index = self.raft_apply(Command::AclBootstrap { token }).await?;

        info!(accessor = %accessor_id, index, "ACL system bootstrapped");
        self.audit.log_event(
            AuditEventType::AclBootstrapped,
            "anonymous",
            None,
            Some(accessor_id.clone()),
            format!("bootstrap token created at index {index}"),
        );
        Ok(AclTokenCreateResponse {
            accessor_id,
            secret_id: secret,
            meta: WriteMeta { index },
        })
    }

    /// Create or replace a policy. Management only.
    pub async fn acl_upsert_policy(&self, mut req: AclPolicyUpsertRequest) -> Result<WriteMeta> {
        let call = match self.endpoint(&mut req, &["volplane", "acl", "upsert_policy"]).await? {
            Dispatch::Forwarded(resp) => return Ok(resp),
            Dispatch::Local(call) => call,
        };
        if !call.identity.is_management() {
            return Err(self.denied(&call.identity, "*", "policy upsert"));
        }
        req.policy.validate()?;

        let name = req.policy.name.clone();
        let index = self
            .raft_apply(Command::AclPolicyUpsert { policy: req.policy })
            .await?;

        self.audit.log_event(
            AuditEventType::AclPolicyUpserted,
            call.identity.actor(),
            None,
            Some(name),
            format!("policy written at index {index}"),
        );
        Ok(WriteMeta { index })
    }

    /// Mint a token. Management only; the secret is returned once and never stored.
    pub async fn acl_create_token(
        &self,
        mut req: AclTokenCreateRequest,
    ) -> Result<AclTokenCreateResponse> {
        let call = match self.endpoint(&mut req, &["volplane", "acl", "create_token"]).await? {
            Dispatch::Forwarded(resp) => return Ok(resp),
            Dispatch::Local(call) => call,
        };
        if !call.identity.is_management() {
            return Err(self.denied(&call.identity, "*", "token create"));
        }

        let token_type = if req.management {
            TokenType::Management
        } else {
            if req.policies.is_empty() {
                return Err(Error::Validation(
                    "client token must have at least one policy".into(),
                ));
            }
            if let Some(missing) = req.policies.iter().find(|p| self.acl.policy(p).is_none()) {
                return Err(Error::Validation(format!("policy {missing} does not exist")));
            }
            TokenType::Client
        };

        let secret = new_secret();
        let mut token = AclToken::new(&secret, req.name, token_type);
        token.policies = req.policies;
        if let Some(ttl) = req.ttl_secs {
            let expires_at = i64::try_from(ttl)
                .ok()
                .and_then(Duration::try_seconds)
                .and_then(|ttl| Utc::now().checked_add_signed(ttl))
                .ok_or_else(|| Error::Validation(format!("token TTL {ttl}s is out of range")))?;
            token.expires_at = Some(expires_at);
        }
        let accessor_id = token.accessor_id.clone();
        let index = self.raft_apply(Command::AclTokenUpsert { token }).await?;

        self.audit.log_event(
            AuditEventType::AclTokenCreated,
            call.identity.actor(),
            None,
            Some(accessor_id.clone()),
            format!("{token_type:?} token created at index {index}"),
        );
        Ok(AclTokenCreateResponse {
            accessor_id,
            secret_id: secret,
            meta: WriteMeta { index },
        })
    }
}
