//! Replicated commands and the state machine that applies them

use crate::acl::{AclStore, AclToken, Policy};
use crate::common::Result;
use crate::state::StateStore;
use crate::structs::{ClaimMode, Node, Volume};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::debug;

/// One log entry's worth of state change
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Command {
    VolumeRegister {
        volumes: Vec<Volume>,
    },
    VolumeDeregister {
        ids: Vec<String>,
    },
    VolumeClaim {
        ids: Vec<String>,
        mode: ClaimMode,
        release: bool,
    },
    NodeRegister {
        node: Node,
    },
    AclPolicyUpsert {
        policy: Policy,
    },
    AclTokenUpsert {
        token: AclToken,
    },
    AclBootstrap {
        token: AclToken,
    },
}

impl Command {
    pub fn encode(&self) -> Result<Vec<u8>> {
        Ok(bincode::serialize(self)?)
    }

    pub fn decode(data: &[u8]) -> Result<Self> {
        Ok(bincode::deserialize(data)?)
    }

    pub fn name(&self) -> &'static str {
        match self {
            Command::VolumeRegister { .. } => "volume_register",
            Command::VolumeDeregister { .. } => "volume_deregister",
            Command::VolumeClaim { .. } => "volume_claim",
            Command::NodeRegister { .. } => "node_register",
            Command::AclPolicyUpsert { .. } => "acl_policy_upsert",
            Command::AclTokenUpsert { .. } => "acl_token_upsert",
            Command::AclBootstrap { .. } => "acl_bootstrap",
        }
    }
}

/// Applies committed commands to the state and ACL stores
pub struct Fsm {
    state: Arc<StateStore>,
    acl: Arc<AclStore>,
}

impl Fsm {
    pub fn new(state: Arc<StateStore>, acl: Arc<AclStore>) -> Self {
        Self { state, acl }
    }

    pub fn state(&self) -> &Arc<StateStore> {
        &self.state
    }

    /// Apply `cmd` at `index`. The index is recorded as applied even when
    /// the command itself fails.
    pub fn apply(&self, index: u64, cmd: Command) -> Result<()> {
        debug!(index, command = cmd.name(), "Applying log entry");
        let applied = match cmd {
            Command::VolumeRegister { volumes } => self.state.volume_register(index, volumes),
            Command::VolumeDeregister { ids } => self.state.volume_deregister(index, &ids),
            Command::VolumeClaim { ids, mode, release } => {
                self.state.volume_claim(index, &ids, mode, release)
            }
            Command::NodeRegister { node } => self.state.upsert_node(index, node),
            Command::AclPolicyUpsert { mut policy } => {
                policy.modify_index = index;
                self.acl.upsert_policy(policy)
            }
            Command::AclTokenUpsert { token } => self.acl.upsert_token(token),
            Command::AclBootstrap { token } => self.acl.bootstrap(token),
        };
        self.state.set_log_index(index)?;
        applied
    }

    /// Decode and apply a raw log entry
    pub fn apply_raw(&self, index: u64, data: &[u8]) -> Result<()> {
        match Command::decode(data) {
            Ok(cmd) => self.apply(index, cmd),
            Err(e) => {
                self.state.set_log_index(index)?;
                Err(e)
            }
        }
    }
}
