//! Client node records, used as the fallback identity path

use crate::common::{Error, Result};
use serde::{Deserialize, Serialize};

/// A compute node known to the cluster
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Node {
    pub id: String,
    /// Shared secret the node presents as its auth token
    pub secret_id: String,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub create_index: u64,
    #[serde(default)]
    pub modify_index: u64,
}

impl Node {
    pub fn validate(&self) -> Result<()> {
        if self.id.is_empty() {
            return Err(Error::Validation("missing node ID".into()));
        }
        if self.secret_id.is_empty() {
            return Err(Error::Validation(format!(
                "node {}: missing secret ID",
                self.id
            )));
        }
        Ok(())
    }

    /// Copy safe to return to callers
    pub fn sanitized(&self) -> Node {
        Node {
            secret_id: String::new(),
            ..self.clone()
        }
    }
}
