//! Access control: policies, tokens and resolved caller identities

pub mod compiled;
pub mod policy;
pub mod store;

pub use compiled::Acl;
pub use policy::{Capability, NamespaceRule, Policy, PolicyLevel};
pub use store::{
    hash_secret, new_secret, AclConfig, AclResolver, AclStore, AclToken, TokenConfig, TokenType,
    ANONYMOUS_POLICY,
};

use crate::structs::Node;
use std::sync::Arc;

/// Who is making a request
#[derive(Debug, Clone)]
pub enum Identity {
    /// A caller holding an ACL token
    Acl(Arc<Acl>),
    /// A client node presenting its secret ID
    Node(Arc<Node>),
}

impl Identity {
    /// Capability check scoped to `namespace`.
    ///
    /// A node may read volumes and take mount claims anywhere, nothing else.
    pub fn allow_namespace_op(&self, namespace: &str, cap: Capability) -> bool {
        match self {
            Identity::Acl(acl) => acl.allow_namespace_op(namespace, cap),
            Identity::Node(_) => matches!(cap, Capability::VolumeRead | Capability::VolumeMount),
        }
    }

    /// Is `cap` allowed in at least one namespace?
    pub fn allow_any_namespace(&self, cap: Capability) -> bool {
        match self {
            Identity::Acl(acl) => acl.allow_any_namespace(cap),
            Identity::Node(_) => matches!(cap, Capability::VolumeRead | Capability::VolumeMount),
        }
    }

    pub fn is_management(&self) -> bool {
        matches!(self, Identity::Acl(acl) if acl.is_management())
    }

    /// Short name for logs and audit records
    pub fn actor(&self) -> String {
        match self {
            Identity::Acl(acl) if acl.is_management() => "management".to_string(),
            Identity::Acl(_) => "acl-token".to_string(),
            Identity::Node(node) => format!("node:{}", node.id),
        }
    }
}
