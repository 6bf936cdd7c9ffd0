//! Configuration for volplane servers

use crate::acl::AclConfig;
use crate::common::{Error, Result};
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

/// Environment variable pointing at the TOML config file
pub const CONFIG_ENV: &str = "VOLPLANE_CONFIG";

/// Server configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Node ID (unique within the cluster)
    pub node_id: String,

    /// Bind address for the HTTP API and internal RPC
    #[serde(default = "default_bind_addr")]
    pub bind_addr: SocketAddr,

    /// Directory holding the RocksDB state
    #[serde(default = "default_data_dir")]
    pub data_dir: PathBuf,

    /// Other servers in the cluster
    #[serde(default)]
    pub peers: Vec<PeerConfig>,

    /// Start as the cluster leader
    #[serde(default)]
    pub bootstrap: bool,

    /// Known leader ID when starting as a follower
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub leader: Option<String>,

    /// Shared secret servers present to each other on the internal routes
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rpc_secret: Option<String>,

    /// Access control
    #[serde(default)]
    pub acl: AclConfig,

    /// Blocking query limits
    #[serde(default)]
    pub query: QueryConfig,

    /// How long a request waits for a leader before failing
    #[serde(default = "default_rpc_hold_timeout")]
    pub rpc_hold_timeout_ms: u64,

    /// JSON-lines audit log path (stdout only when unset)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub audit_log: Option<PathBuf>,

    /// Logging level
    #[serde(default = "default_log_level")]
    pub log_level: String,
}

/// A cluster peer
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PeerConfig {
    pub id: String,
    /// Base URL of the peer's HTTP API, e.g. `http://10.0.0.2:4646`
    pub addr: String,
}

/// Blocking query configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueryConfig {
    /// Wait applied when the caller asks to block without a wait time
    #[serde(default = "default_max_query_time")]
    pub default_max_query_time_ms: u64,

    /// Upper bound on any requested wait
    #[serde(default = "max_query_time_cap")]
    pub max_query_time_ms: u64,

    /// Random jitter added to a wait is in `[0, wait / jitter_fraction)`
    #[serde(default = "default_jitter_fraction")]
    pub jitter_fraction: u32,
}

fn default_bind_addr() -> SocketAddr {
    SocketAddr::from(([0, 0, 0, 0], 4646))
}
fn default_data_dir() -> PathBuf {
    PathBuf::from("./volplane-data")
}
fn default_rpc_hold_timeout() -> u64 {
    5_000
}
fn default_log_level() -> String {
    "info".to_string()
}
fn default_max_query_time() -> u64 {
    300_000
}
fn max_query_time_cap() -> u64 {
    600_000
}
fn default_jitter_fraction() -> u32 {
    16
}

impl Default for QueryConfig {
    fn default() -> Self {
        Self {
            default_max_query_time_ms: default_max_query_time(),
            max_query_time_ms: max_query_time_cap(),
            jitter_fraction: default_jitter_fraction(),
        }
    }
}

impl QueryConfig {
    pub fn default_max_query_time(&self) -> Duration {
        Duration::from_millis(self.default_max_query_time_ms)
    }

    pub fn max_query_time(&self) -> Duration {
        Duration::from_millis(self.max_query_time_ms)
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            node_id: "server-1".to_string(),
            bind_addr: default_bind_addr(),
            data_dir: default_data_dir(),
            peers: Vec::new(),
            bootstrap: false,
            leader: None,
            rpc_secret: None,
            acl: AclConfig::default(),
            query: QueryConfig::default(),
            rpc_hold_timeout_ms: default_rpc_hold_timeout(),
            audit_log: None,
            log_level: default_log_level(),
        }
    }
}

impl Config {
    /// Load configuration from the file named by `VOLPLANE_CONFIG` (default
    /// `volplane.toml`, optional) overlaid with `VOLPLANE_*` environment variables.
    pub fn load() -> Result<Self> {
        let path = std::env::var(CONFIG_ENV).unwrap_or_else(|_| "volplane.toml".to_string());
        config::Config::builder()
            .set_default("node_id", "server-1")
            .map_err(|e| Error::InvalidConfig(e.to_string()))?
            .add_source(config::File::with_name(&path).required(false))
            .add_source(config::Environment::with_prefix("VOLPLANE").separator("__"))
            .build()
            .and_then(|settings| settings.try_deserialize())
            .map_err(|e| Error::InvalidConfig(e.to_string()))
    }

    /// Check cross-field constraints
    pub fn validate(&self) -> Result<()> {
        if self.node_id.is_empty() {
            return Err(Error::InvalidConfig("node_id must be set".into()));
        }
        if self.query.jitter_fraction == 0 {
            return Err(Error::InvalidConfig(
                "query.jitter_fraction must be positive".into(),
            ));
        }
        if self.query.default_max_query_time_ms > self.query.max_query_time_ms {
            return Err(Error::InvalidConfig(
                "query.default_max_query_time_ms exceeds query.max_query_time_ms".into(),
            ));
        }
        let has_peers = self.peers.iter().any(|p| p.id != self.node_id);
        if has_peers && self.rpc_secret.as_deref().map_or(true, str::is_empty) {
            return Err(Error::InvalidConfig(
                "rpc_secret must be set when peers are configured".into(),
            ));
        }
        if !self.bootstrap {
            if let Some(leader) = &self.leader {
                if self.peer_addr(leader).is_none() {
                    return Err(Error::InvalidConfig(format!(
                        "leader {leader} is not listed in peers"
                    )));
                }
            }
        }
        Ok(())
    }

    /// HTTP address of a peer by ID
    pub fn peer_addr(&self, id: &str) -> Option<&str> {
        self.peers
            .iter()
            .find(|p| p.id == id)
            .map(|p| p.addr.as_str())
    }

    pub fn rpc_hold_timeout(&self) -> Duration {
        Duration::from_millis(self.rpc_hold_timeout_ms)
    }
}
