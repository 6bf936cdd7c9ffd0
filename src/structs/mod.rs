//! Shared data model: entities and RPC envelopes

pub mod node;
pub mod rpc;
pub mod volume;

pub use node::Node;
pub use rpc::{
    AclBootstrapRequest, AclPolicyUpsertRequest, AclTokenCreateRequest, AclTokenCreateResponse,
    NodeRegisterRequest, QueryMeta, QueryOptions, RpcRequest, VolumeClaimRequest,
    VolumeDeregisterRequest, VolumeGetRequest, VolumeGetResponse, VolumeListRequest,
    VolumeListResponse, VolumeRegisterRequest, WriteMeta, WriteRequest,
};
pub use volume::{ClaimMode, Volume, DEFAULT_NAMESPACE};
