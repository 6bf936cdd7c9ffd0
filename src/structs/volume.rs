//! Volume entity and its invariants

use crate::common::{Error, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

pub const DEFAULT_NAMESPACE: &str = "default";

/// A registered external storage volume
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Volume {
    pub id: String,
    pub driver: String,
    pub namespace: String,
    /// Active mount claims
    #[serde(default)]
    pub claim: u32,
    pub max_claim: u32,
    #[serde(default)]
    pub mode_read_many: bool,
    #[serde(default)]
    pub mode_write_one: bool,
    #[serde(default)]
    pub topology: BTreeMap<String, String>,
    #[serde(default)]
    pub created_index: u64,
    #[serde(default)]
    pub modified_index: u64,
}

impl Volume {
    /// Another read-only mount can be claimed
    pub fn can_mount_read_only(&self) -> bool {
        self.claim < self.max_claim
    }

    /// The exclusive writer claim is free
    pub fn can_mount_writable(&self) -> bool {
        self.claim < 1 && self.mode_write_one
    }

    /// Value equality, ignoring the store-assigned indices
    pub fn value_eq(&self, other: &Volume) -> bool {
        self.id == other.id
            && self.driver == other.driver
            && self.namespace == other.namespace
            && self.claim == other.claim
            && self.max_claim == other.max_claim
            && self.mode_read_many == other.mode_read_many
            && self.mode_write_one == other.mode_write_one
            && self.topology == other.topology
    }

    /// Check the registration invariants
    pub fn validate(&self) -> Result<()> {
        let mut errs = Vec::new();
        if self.id.is_empty() {
            errs.push("missing volume ID");
        }
        if self.driver.is_empty() {
            errs.push("missing driver");
        }
        if self.namespace.is_empty() {
            errs.push("missing namespace");
        }
        if self.max_claim == 0 {
            errs.push("max_claim must be greater than zero");
        }
        if self.claim > self.max_claim {
            errs.push("claim exceeds max_claim");
        }
        if !self.mode_read_many && !self.mode_write_one {
            errs.push("one of mode_read_many or mode_write_one is required");
        }
        if self.topology.is_empty() {
            errs.push("missing topology");
        }

        if errs.is_empty() {
            Ok(())
        } else {
            let id = if self.id.is_empty() { "<unnamed>" } else { &self.id };
            Err(Error::Validation(format!("volume {}: {}", id, errs.join(", "))))
        }
    }
}

/// How a claim uses the volume
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ClaimMode {
    ReadOnly,
    ReadWrite,
}

impl std::fmt::Display for ClaimMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ClaimMode::ReadOnly => write!(f, "read-only"),
            ClaimMode::ReadWrite => write!(f, "read-write"),
        }
    }
}
