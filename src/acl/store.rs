//! ACL policy and token storage with a compiled-ACL cache

use super::compiled::Acl;
use super::policy::Policy;
use crate::common::{Error, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex, PoisonError, RwLock};
use tracing::{debug, info};

/// Name of the policy applied to requests that carry no token
pub const ANONYMOUS_POLICY: &str = "anonymous";

/// Resolves a bearer secret to its capabilities
#[async_trait]
pub trait AclResolver: Send + Sync {
    /// `Ok(None)` when no token has this secret
    async fn resolve_token(&self, secret: &str) -> Result<Option<Arc<Acl>>>;
}

/// Static ACL configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AclConfig {
    /// With ACLs disabled every caller gets management access
    #[serde(default)]
    pub enabled: bool,

    /// Policies loaded at start-up
    #[serde(default)]
    pub policies: Vec<Policy>,

    /// Tokens loaded at start-up
    #[serde(default)]
    pub tokens: Vec<TokenConfig>,
}

/// A token seeded from configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TokenConfig {
    pub secret: String,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub policies: Vec<String>,
    #[serde(default)]
    pub management: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TokenType {
    Client,
    Management,
}

/// A stored token. Only the SHA-256 digest of the secret is kept.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AclToken {
    pub accessor_id: String,
    pub secret_hash: String,
    pub name: String,
    pub token_type: TokenType,
    #[serde(default)]
    pub policies: Vec<String>,
    #[serde(default)]
    pub expires_at: Option<DateTime<Utc>>,
    pub create_time: DateTime<Utc>,
}

impl AclToken {
    /// Build a token around `secret`
    pub fn new(secret: &str, name: impl Into<String>, token_type: TokenType) -> Self {
        Self {
            accessor_id: uuid::Uuid::new_v4().to_string(),
            secret_hash: hash_secret(secret),
            name: name.into(),
            token_type,
            policies: Vec::new(),
            expires_at: None,
            create_time: Utc::now(),
        }
    }

    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_at.is_some_and(|at| now >= at)
    }
}

/// Hex SHA-256 of a secret, the key tokens are looked up by
pub fn hash_secret(secret: &str) -> String {
    hex::encode(Sha256::digest(secret.as_bytes()))
}

/// Generate a fresh random secret
pub fn new_secret() -> String {
    uuid::Uuid::new_v4().to_string()
}

#[derive(Debug, Default)]
struct AclState {
    policies: BTreeMap<String, Policy>,
    /// secret hash → token
    tokens: HashMap<String, AclToken>,
    bootstrapped: bool,
}

/// Node-wide ACL state
#[derive(Debug)]
pub struct AclStore {
    enabled: bool,
    state: RwLock<AclState>,
    /// sorted policy names → compiled ACL
    cache: Mutex<HashMap<Vec<String>, Arc<Acl>>>,
    management: Arc<Acl>,
}

impl AclStore {
    pub fn new(enabled: bool) -> Self {
        Self {
            enabled,
            state: RwLock::new(AclState::default()),
            cache: Mutex::new(HashMap::new()),
            management: Arc::new(Acl::management()),
        }
    }

    /// Build a store seeded with the configured policies and tokens
    pub fn from_config(config: &AclConfig) -> Result<Self> {
        let store = Self::new(config.enabled);
        for policy in &config.policies {
            store.upsert_policy(policy.clone())?;
        }
        for token in &config.tokens {
            let token_type = if token.management {
                TokenType::Management
            } else {
                TokenType::Client
            };
            let mut t = AclToken::new(&token.secret, token.name.clone(), token_type);
            t.policies = token.policies.clone();
            store.upsert_token(t)?;
        }
        info!(
            enabled = config.enabled,
            policies = config.policies.len(),
            tokens = config.tokens.len(),
            "ACL store initialized"
        );
        Ok(store)
    }

    pub fn enabled(&self) -> bool {
        self.enabled
    }

    fn read(&self) -> std::sync::RwLockReadGuard<'_, AclState> {
        self.state.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> std::sync::RwLockWriteGuard<'_, AclState> {
        self.state.write().unwrap_or_else(PoisonError::into_inner)
    }

    fn invalidate_cache(&self) {
        self.cache
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clear();
    }

    pub fn upsert_policy(&self, policy: Policy) -> Result<()> {
        policy.validate()?;
        debug!(policy = %policy.name, "Upserting ACL policy");
        self.write().policies.insert(policy.name.clone(), policy);
        self.invalidate_cache();
        Ok(())
    }

    pub fn policy(&self, name: &str) -> Option<Policy> {
        self.read().policies.get(name).cloned()
    }

    /// Store a token. Client tokens must name only existing policies.
    pub fn upsert_token(&self, token: AclToken) -> Result<()> {
        let mut state = self.write();
        if token.token_type == TokenType::Client {
            if token.policies.is_empty() {
                return Err(Error::Validation(
                    "client token must have at least one policy".into(),
                ));
            }
            if let Some(missing) = token
                .policies
                .iter()
                .find(|p| !state.policies.contains_key(*p))
            {
                return Err(Error::Validation(format!("policy {missing} does not exist")));
            }
        }
        state.tokens.insert(token.secret_hash.clone(), token);
        Ok(())
    }

    pub fn is_bootstrapped(&self) -> bool {
        self.read().bootstrapped
    }

    /// Install the bootstrap management token. Only allowed once.
    pub fn bootstrap(&self, token: AclToken) -> Result<()> {
        if token.token_type != TokenType::Management {
            return Err(Error::Validation("bootstrap token must be a management token".into()));
        }
        let mut state = self.write();
        if state.bootstrapped {
            return Err(Error::Conflict("ACL bootstrap already done".into()));
        }
        state.bootstrapped = true;
        state.tokens.insert(token.secret_hash.clone(), token);
        Ok(())
    }

    /// The token holding `secret`, if any
    pub fn token_by_secret(&self, secret: &str) -> Option<AclToken> {
        self.read().tokens.get(&hash_secret(secret)).cloned()
    }

    fn compile_policies(&self, names: &[String]) -> Result<Arc<Acl>> {
        let mut key = names.to_vec();
        key.sort();
        key.dedup();

        let mut cache = self.cache.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(acl) = cache.get(&key) {
            return Ok(Arc::clone(acl));
        }

        let state = self.read();
        let mut policies = Vec::with_capacity(key.len());
        for name in &key {
            let policy = state
                .policies
                .get(name)
                .ok_or_else(|| Error::Acl(format!("policy {name} does not exist")))?;
            policies.push(policy);
        }
        let acl = Arc::new(Acl::compile(policies));
        cache.insert(key, Arc::clone(&acl));
        Ok(acl)
    }

    fn resolve(&self, secret: &str) -> Result<Option<Arc<Acl>>> {
        if !self.enabled {
            return Ok(Some(Arc::clone(&self.management)));
        }

        if secret.is_empty() {
            if self.read().policies.contains_key(ANONYMOUS_POLICY) {
                return self
                    .compile_policies(&[ANONYMOUS_POLICY.to_string()])
                    .map(Some);
            }
            return Ok(None);
        }

        let Some(token) = self.token_by_secret(secret) else {
            return Ok(None);
        };
        if token.is_expired(Utc::now()) {
            return Err(Error::TokenExpired);
        }
        match token.token_type {
            TokenType::Management => Ok(Some(Arc::clone(&self.management))),
            TokenType::Client => self.compile_policies(&token.policies).map(Some),
        }
    }
}

#[async_trait]
impl AclResolver for AclStore {
    async fn resolve_token(&self, secret: &str) -> Result<Option<Arc<Acl>>> {
        self.resolve(secret)
    }
}
