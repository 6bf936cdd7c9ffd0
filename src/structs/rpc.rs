//! RPC request and response envelopes
//!
//! Every request carries either [`QueryOptions`] (reads) or [`WriteRequest`]
//! (writes); every reply carries [`QueryMeta`] or [`WriteMeta`]. The
//! [`RpcRequest`] trait ties each request type to its method name and reply
//! type so leader forwarding can relay it unchanged.

use super::{ClaimMode, Node, Volume, DEFAULT_NAMESPACE};
use crate::acl::Policy;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;

/// Options common to all read requests
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct QueryOptions {
    /// Restrict results to one namespace; `None` means all visible namespaces
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub namespace: Option<String>,

    #[serde(default)]
    pub auth_token: String,

    /// Block until the table index is greater than this value
    #[serde(default)]
    pub min_query_index: u64,

    /// Upper bound on blocking, in milliseconds (0 = server default)
    #[serde(default)]
    pub max_query_time_ms: u64,

    /// Allow a follower to answer from its local state
    #[serde(default)]
    pub allow_stale: bool,

    /// Set by the node that relayed this request to the leader
    #[serde(default)]
    pub forwarded: bool,
}

impl QueryOptions {
    pub fn max_query_time(&self) -> Option<Duration> {
        (self.max_query_time_ms > 0).then(|| Duration::from_millis(self.max_query_time_ms))
    }
}

/// Consistency metadata returned with every read
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueryMeta {
    /// Index of the last write to the table(s) the reply was built from
    pub index: u64,
    /// Milliseconds since the answering server last heard from the leader
    pub last_contact_ms: u64,
    pub known_leader: bool,
}

/// Options common to all write requests
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WriteRequest {
    #[serde(default = "default_namespace")]
    pub namespace: String,

    #[serde(default)]
    pub auth_token: String,

    #[serde(default)]
    pub forwarded: bool,
}

impl Default for WriteRequest {
    fn default() -> Self {
        Self {
            namespace: default_namespace(),
            auth_token: String::new(),
            forwarded: false,
        }
    }
}

fn default_namespace() -> String {
    DEFAULT_NAMESPACE.to_string()
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct WriteMeta {
    pub index: u64,
}

/// A request that can be routed to the leader
pub trait RpcRequest: Serialize + DeserializeOwned + Send + Sync + 'static {
    /// Wire method name, e.g. `Volume.List`
    const METHOD: &'static str;

    type Response: Serialize + DeserializeOwned + Send + 'static;

    fn is_read(&self) -> bool;
    fn auth_token(&self) -> &str;
    fn allow_stale(&self) -> bool;
    fn is_forwarded(&self) -> bool;
    fn set_forwarded(&mut self);
}

macro_rules! query_rpc {
    ($req:ty, $resp:ty, $method:literal) => {
        impl RpcRequest for $req {
            const METHOD: &'static str = $method;
            type Response = $resp;

            fn is_read(&self) -> bool {
                true
            }
            fn auth_token(&self) -> &str {
                &self.query.auth_token
            }
            fn allow_stale(&self) -> bool {
                self.query.allow_stale
            }
            fn is_forwarded(&self) -> bool {
                self.query.forwarded
            }
            fn set_forwarded(&mut self) {
                self.query.forwarded = true;
            }
        }
    };
}

macro_rules! write_rpc {
    ($req:ty, $resp:ty, $method:literal) => {
        impl RpcRequest for $req {
            const METHOD: &'static str = $method;
            type Response = $resp;

            fn is_read(&self) -> bool {
                false
            }
            fn auth_token(&self) -> &str {
                &self.write.auth_token
            }
            fn allow_stale(&self) -> bool {
                false
            }
            fn is_forwarded(&self) -> bool {
                self.write.forwarded
            }
            fn set_forwarded(&mut self) {
                self.write.forwarded = true;
            }
        }
    };
}

// ========================================
// Volume envelopes

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct VolumeListRequest {
    /// Only volumes using this driver
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub driver: Option<String>,
    #[serde(flatten)]
    pub query: QueryOptions,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct VolumeListResponse {
    pub volumes: Vec<Arc<Volume>>,
    #[serde(flatten)]
    pub meta: QueryMeta,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct VolumeGetRequest {
    pub id: String,
    #[serde(flatten)]
    pub query: QueryOptions,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct VolumeGetResponse {
    pub volume: Arc<Volume>,
    #[serde(flatten)]
    pub meta: QueryMeta,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct VolumeRegisterRequest {
    pub volumes: Vec<Volume>,
    #[serde(flatten)]
    pub write: WriteRequest,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct VolumeDeregisterRequest {
    pub volume_ids: Vec<String>,
    #[serde(flatten)]
    pub write: WriteRequest,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VolumeClaimRequest {
    pub volume_ids: Vec<String>,
    pub mode: ClaimMode,
    /// Release a previously taken claim instead of taking one
    #[serde(default)]
    pub release: bool,
    #[serde(flatten)]
    pub write: WriteRequest,
}

// ========================================
// Node envelopes

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct NodeRegisterRequest {
    pub node: Node,
    #[serde(flatten)]
    pub write: WriteRequest,
}

// ========================================
// ACL envelopes

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AclBootstrapRequest {
    #[serde(flatten)]
    pub write: WriteRequest,
}

/// A newly created token. The secret is only ever returned here.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AclTokenCreateResponse {
    pub accessor_id: String,
    pub secret_id: String,
    #[serde(flatten)]
    pub meta: WriteMeta,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AclPolicyUpsertRequest {
    pub policy: Policy,
    #[serde(flatten)]
    pub write: WriteRequest,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AclTokenCreateRequest {
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub policies: Vec<String>,
    #[serde(default)]
    pub management: bool,
    /// Lifetime in seconds; never expires when unset
    #[serde(default)]
    pub ttl_secs: Option<u64>,
    #[serde(flatten)]
    pub write: WriteRequest,
}

query_rpc!(VolumeListRequest, VolumeListResponse, "Volume.List");
query_rpc!(VolumeGetRequest, VolumeGetResponse, "Volume.Get");
write_rpc!(VolumeRegisterRequest, WriteMeta, "Volume.Register");
write_rpc!(VolumeDeregisterRequest, WriteMeta, "Volume.Deregister");
write_rpc!(VolumeClaimRequest, WriteMeta, "Volume.Claim");
write_rpc!(NodeRegisterRequest, WriteMeta, "Node.Register");
write_rpc!(AclBootstrapRequest, AclTokenCreateResponse, "ACL.Bootstrap");
write_rpc!(AclPolicyUpsertRequest, WriteMeta, "ACL.UpsertPolicy");
write_rpc!(AclTokenCreateRequest, AclTokenCreateResponse, "ACL.CreateToken");
