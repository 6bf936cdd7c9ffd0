//! ACL enforcement and node identities

mod common;

use async_trait::async_trait;
use common::{leader_config, single_server, volume, Loopback};
use std::sync::Arc;
use volplane::acl::{Acl, AclResolver, Identity, NamespaceRule, Policy, PolicyLevel};
use volplane::common::{Error, Result};
use volplane::coordinator::Command;
use volplane::state::StateStore;
use volplane::structs::{
    AclBootstrapRequest, AclPolicyUpsertRequest, AclTokenCreateRequest, Node,
    NodeRegisterRequest, QueryOptions, VolumeGetRequest, VolumeListRequest,
    VolumeRegisterRequest, WriteRequest,
};
use volplane::{Config, Server};

fn acl_server() -> Arc<Server> {
    let mut config = leader_config("s1");
    config.acl.enabled = true;
    single_server(config)
}

fn write(ns: &str, token: &str) -> WriteRequest {
    WriteRequest {
        namespace: ns.to_string(),
        auth_token: token.to_string(),
        forwarded: false,
    }
}

fn query(token: &str) -> QueryOptions {
    QueryOptions {
        auth_token: token.to_string(),
        ..Default::default()
    }
}

fn read_policy(name: &str, ns: &str) -> Policy {
    Policy {
        name: name.into(),
        description: String::new(),
        namespaces: vec![NamespaceRule {
            name: ns.into(),
            policy: Some(PolicyLevel::Read),
            capabilities: vec![],
        }],
        modify_index: 0,
    }
}

/// Bootstrap, then seed `prod` and `dev` with one volume each. Returns the management secret.
async fn seed(server: &Server) -> String {
    let boot = server
        .acl_bootstrap(AclBootstrapRequest::default())
        .await
        .unwrap();
    let root = boot.secret_id;

    for (ns, id) in [("prod", "vol-prod"), ("dev", "vol-dev")] {
        server
            .volume_register(VolumeRegisterRequest {
                volumes: vec![volume(id, "ebs")],
                write: write(ns, &root),
            })
            .await
            .unwrap();
    }
    root
}

async fn client_token(server: &Server, root: &str, policy: Policy) -> String {
    let name = policy.name.clone();
    server
        .acl_upsert_policy(AclPolicyUpsertRequest {
            policy,
            write: write("default", root),
        })
        .await
        .unwrap();
    server
        .acl_create_token(AclTokenCreateRequest {
            name: "reader".into(),
            policies: vec![name],
            write: write("default", root),
            ..Default::default()
        })
        .await
        .unwrap()
        .secret_id
}

#[tokio::test]
async fn test_bootstrap_only_once() {
    let server = acl_server();
    server
        .acl_bootstrap(AclBootstrapRequest::default())
        .await
        .unwrap();
    assert!(matches!(
        server.acl_bootstrap(AclBootstrapRequest::default()).await,
        Err(Error::Conflict(_))
    ));
}

#[tokio::test]
async fn test_list_returns_authorized_subset() {
    let server = acl_server();
    let root = seed(&server).await;
    let token = client_token(&server, &root, read_policy("prod-read", "prod")).await;

    let resp = server
        .volume_list(VolumeListRequest {
            driver: None,
            query: query(&token),
        })
        .await
        .unwrap();
    let ids: Vec<_> = resp.volumes.iter().map(|v| v.id.as_str()).collect();
    assert_eq!(ids, ["vol-prod"]);

    let by_driver = server
        .volume_list(VolumeListRequest {
            driver: Some("ebs".into()),
            query: query(&token),
        })
        .await
        .unwrap();
    assert_eq!(by_driver.volumes.len(), 1);

    let dev_only = server
        .volume_list(VolumeListRequest {
            driver: None,
            query: QueryOptions {
                namespace: Some("dev".into()),
                ..query(&token)
            },
        })
        .await
        .unwrap();
    assert!(dev_only.volumes.is_empty());
}

#[tokio::test]
async fn test_get_outside_policy_is_denied() {
    let server = acl_server();
    let root = seed(&server).await;
    let token = client_token(&server, &root, read_policy("prod-read", "prod")).await;

    let ok = server
        .volume_get(VolumeGetRequest {
            id: "vol-prod".into(),
            query: query(&token),
        })
        .await;
    assert!(ok.is_ok());

    let denied = server
        .volume_get(VolumeGetRequest {
            id: "vol-dev".into(),
            query: query(&token),
        })
        .await;
    assert!(matches!(denied, Err(Error::PermissionDenied)));
}

#[tokio::test]
async fn test_read_token_cannot_register() {
    let server = acl_server();
    let root = seed(&server).await;
    let token = client_token(&server, &root, read_policy("prod-read", "prod")).await;

    let err = server
        .volume_register(VolumeRegisterRequest {
            volumes: vec![volume("vol-new", "ebs")],
            write: write("prod", &token),
        })
        .await
        .unwrap_err();
    assert!(matches!(err, Error::PermissionDenied));

    let err = server
        .acl_upsert_policy(AclPolicyUpsertRequest {
            policy: read_policy("sneaky", "*"),
            write: write("default", &token),
        })
        .await
        .unwrap_err();
    assert!(matches!(err, Error::PermissionDenied));
}

#[tokio::test]
async fn test_unknown_token_fails_authentication() {
    let server = acl_server();
    seed(&server).await;

    let err = server
        .volume_list(VolumeListRequest {
            driver: None,
            query: query("not-a-token"),
        })
        .await
        .unwrap_err();
    assert!(matches!(err, Error::TokenNotFound));
    assert!(err.is_auth_failure());

    let err = server
        .volume_list(VolumeListRequest::default())
        .await
        .unwrap_err();
    assert!(matches!(err, Error::TokenNotFound));
}

#[tokio::test]
async fn test_expired_token_is_rejected() {
    let server = acl_server();
    let root = seed(&server).await;
    server
        .acl_upsert_policy(AclPolicyUpsertRequest {
            policy: read_policy("prod-read", "prod"),
            write: write("default", &root),
        })
        .await
        .unwrap();
    let token = server
        .acl_create_token(AclTokenCreateRequest {
            policies: vec!["prod-read".into()],
            ttl_secs: Some(0),
            write: write("default", &root),
            ..Default::default()
        })
        .await
        .unwrap()
        .secret_id;

    let err = server
        .volume_list(VolumeListRequest {
            driver: None,
            query: query(&token),
        })
        .await
        .unwrap_err();
    assert!(matches!(err, Error::TokenExpired));
}

#[tokio::test]
async fn test_create_token_requires_existing_policy() {
    let server = acl_server();
    let root = seed(&server).await;
    let err = server
        .acl_create_token(AclTokenCreateRequest {
            policies: vec!["ghost".into()],
            write: write("default", &root),
            ..Default::default()
        })
        .await
        .unwrap_err();
    assert!(matches!(err, Error::Validation(_)));
}

#[tokio::test]
async fn test_node_secret_is_an_identity() {
    let server = acl_server();
    let root = seed(&server).await;

    server
        .node_register(NodeRegisterRequest {
            node: Node {
                id: "node-1".into(),
                secret_id: "node-secret".into(),
                ..Default::default()
            },
            write: write("default", &root),
        })
        .await
        .unwrap();

    let resp = server
        .volume_list(VolumeListRequest {
            driver: None,
            query: query("node-secret"),
        })
        .await
        .unwrap();
    assert_eq!(resp.volumes.len(), 2);

    let err = server
        .volume_register(VolumeRegisterRequest {
            volumes: vec![volume("vol-node", "ebs")],
            write: write("prod", "node-secret"),
        })
        .await
        .unwrap_err();
    assert!(matches!(err, Error::PermissionDenied));

    let err = server
        .node_register(NodeRegisterRequest {
            node: Node {
                id: "node-1".into(),
                secret_id: "other-secret".into(),
                ..Default::default()
            },
            write: write("default", &root),
        })
        .await
        .unwrap_err();
    assert!(matches!(err, Error::PermissionDenied));
}

fn node(id: &str, secret: &str) -> Node {
    Node {
        id: id.into(),
        secret_id: secret.into(),
        ..Default::default()
    }
}

#[tokio::test]
async fn test_node_register_requires_management() {
    let server = acl_server();
    let root = seed(&server).await;

    let err = server
        .node_register(NodeRegisterRequest {
            node: node("rogue", "rogue-secret"),
            write: WriteRequest::default(),
        })
        .await
        .unwrap_err();
    assert!(matches!(err, Error::TokenNotFound));
    assert!(matches!(
        server
            .volume_list(VolumeListRequest {
                driver: None,
                query: query("rogue-secret"),
            })
            .await,
        Err(Error::TokenNotFound)
    ));

    let token = client_token(&server, &root, read_policy("prod-read", "prod")).await;
    let err = server
        .node_register(NodeRegisterRequest {
            node: node("rogue", "rogue-secret"),
            write: write("default", &token),
        })
        .await
        .unwrap_err();
    assert!(matches!(err, Error::PermissionDenied));

    // A registered node cannot enroll another one
    server
        .node_register(NodeRegisterRequest {
            node: node("node-1", "node-secret"),
            write: write("default", &root),
        })
        .await
        .unwrap();
    let err = server
        .node_register(NodeRegisterRequest {
            node: node("node-2", "second-secret"),
            write: write("default", "node-secret"),
        })
        .await
        .unwrap_err();
    assert!(matches!(err, Error::PermissionDenied));
}

/// Resolver whose backend always fails with the error `fail` builds
struct FailingResolver {
    fail: fn() -> Error,
}

#[async_trait]
impl AclResolver for FailingResolver {
    async fn resolve_token(&self, _secret: &str) -> Result<Option<Arc<Acl>>> {
        Err((self.fail)())
    }
}

fn server_with_resolver(fail: fn() -> Error) -> Arc<Server> {
    let mut config = leader_config("s1");
    config.acl.enabled = true;
    let server = Server::new(
        config,
        Arc::new(StateStore::new()),
        Arc::new(Loopback::default()),
    )
    .unwrap()
    .with_resolver(Arc::new(FailingResolver { fail }));
    Arc::new(server)
}

#[tokio::test]
async fn test_resolver_failure_is_combined_with_node_miss() {
    let server = server_with_resolver(|| Error::Store("token backend offline".into()));

    let err = server.resolve_identity("unknown").await.unwrap_err();
    match &err {
        Error::Resolution(causes) => {
            assert_eq!(causes.len(), 2);
            assert!(matches!(&causes[0], Error::Store(msg) if msg == "token backend offline"));
            assert!(matches!(causes[1], Error::TokenNotFound));
        }
        other => panic!("unexpected error: {other:?}"),
    }
    assert!(err.is_auth_failure());

    // Endpoints surface the same combined error
    let err = server
        .volume_list(VolumeListRequest {
            driver: None,
            query: query("unknown"),
        })
        .await
        .unwrap_err();
    assert!(matches!(err, Error::Resolution(_)));

    // A node secret still resolves while the ACL backend is down
    server
        .raft_apply(Command::NodeRegister {
            node: node("node-1", "node-secret"),
        })
        .await
        .unwrap();
    let identity = server.resolve_identity("node-secret").await.unwrap();
    assert!(matches!(identity, Identity::Node(n) if n.id == "node-1"));
}

#[tokio::test]
async fn test_resolver_auth_failure_passes_through() {
    let server = server_with_resolver(|| Error::TokenExpired);
    let err = server.resolve_identity("stale").await.unwrap_err();
    assert!(matches!(err, Error::TokenExpired));
}

#[tokio::test]
async fn test_seeded_tokens_from_config() {
    let raw = r#"
        node_id = "s1"
        bootstrap = true

        [acl]
        enabled = true

        [[acl.policies]]
        name = "dev-write"
        namespaces = [{ name = "dev", policy = "write" }]

        [[acl.tokens]]
        secret = "dev-writer"
        policies = ["dev-write"]
    "#;
    let config: Config = config::Config::builder()
        .add_source(config::File::from_str(raw, config::FileFormat::Toml))
        .build()
        .unwrap()
        .try_deserialize()
        .unwrap();
    let server = single_server(config);

    server
        .volume_register(VolumeRegisterRequest {
            volumes: vec![volume("vol-dev", "ebs")],
            write: write("dev", "dev-writer"),
        })
        .await
        .unwrap();
    let err = server
        .volume_register(VolumeRegisterRequest {
            volumes: vec![volume("vol-prod", "ebs")],
            write: write("prod", "dev-writer"),
        })
        .await
        .unwrap_err();
    assert!(matches!(err, Error::PermissionDenied));
}
