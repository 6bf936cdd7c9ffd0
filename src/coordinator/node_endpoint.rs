//! Node registration

use super::fsm::Command;
use super::server::{Dispatch, Server};
use crate::common::{AuditEventType, Result};
use crate::structs::{NodeRegisterRequest, WriteMeta};
use tracing::info;

impl Server {
    /// Register a client node. Management only; the node's secret then
    /// works as its token.
    pub async fn node_register(&self, mut req: NodeRegisterRequest) -> Result<WriteMeta> {
        let call = match self.endpoint(&mut req, &["volplane", "node", "register"]).await? {
            Dispatch::Forwarded(resp) => return Ok(resp),
            Dispatch::Local(call) => call,
        };
        if !call.identity.is_management() {
            return Err(self.denied(&call.identity, "*", "node register"));
        }

        req.node.validate()?;
        let node_id = req.node.id.clone();
        let index = self
            .raft_apply(Command::NodeRegister { node: req.node })
            .await?;

        info!(node_id = %node_id, index, "Node registered");
        self.audit.log_event(
            AuditEventType::NodeRegistered,
            call.identity.actor(),
            None,
            Some(node_id),
            format!("registered at index {index}"),
        );
        Ok(WriteMeta { index })
    }
}
