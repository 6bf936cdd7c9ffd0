//! HTTP API through the axum router

mod common;

use axum::body::{to_bytes, Body};
use axum::http::{Request, StatusCode};
use axum::Router;
use common::{leader_config, single_server, volume, RPC_SECRET};
use serde_json::{json, Value};
use std::sync::Arc;
use tower::ServiceExt;
use volplane::acl::{AclToken, TokenType};
use volplane::common::{Error, PeerConfig};
use volplane::coordinator::http::create_router;
use volplane::coordinator::{AppendRequest, Command, LogEntry};

fn router() -> Router {
    create_router(single_server(leader_config("s1")))
}

async fn send(app: &Router, req: Request<Body>) -> (StatusCode, axum::http::HeaderMap, Value) {
    let resp = app.clone().oneshot(req).await.unwrap();
    let status = resp.status();
    let headers = resp.headers().clone();
    let bytes = to_bytes(resp.into_body(), usize::MAX).await.unwrap();
    let body = if bytes.is_empty() {
        Value::Null
    } else {
        serde_json::from_slice(&bytes).unwrap_or_else(|_| {
            Value::String(String::from_utf8_lossy(&bytes).into_owned())
        })
    };
    (status, headers, body)
}

fn json_request(method: &str, uri: &str, body: Value) -> Request<Body> {
    Request::builder()
        .method(method)
        .uri(uri)
        .header("content-type", "application/json")
        .body(Body::from(body.to_string()))
        .unwrap()
}

fn get(uri: &str) -> Request<Body> {
    Request::builder().uri(uri).body(Body::empty()).unwrap()
}

#[tokio::test]
async fn test_register_list_and_get() {
    let app = router();

    let (status, headers, body) = send(
        &app,
        json_request(
            "PUT",
            "/v1/volumes?namespace=prod",
            json!({ "volumes": [volume("vol-1", "ebs"), volume("vol-2", "nfs")] }),
        ),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    let index = body["index"].as_u64().unwrap();
    assert!(index > 0);
    assert_eq!(headers["x-volplane-index"], index.to_string().as_str());

    let (status, headers, body) = send(&app, get("/v1/volumes?driver=nfs")).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body.as_array().unwrap().len(), 1);
    assert_eq!(body[0]["id"], "vol-2");
    assert_eq!(body[0]["namespace"], "prod");
    assert_eq!(headers["x-volplane-knownleader"], "true");
    assert_eq!(headers["x-volplane-lastcontact"], "0");

    let (status, _, body) = send(&app, get("/v1/volume/vol-1")).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["driver"], "ebs");
    assert_eq!(body["created_index"], index);
}

#[tokio::test]
async fn test_errors_map_to_status_codes() {
    let app = router();

    let (status, _, body) = send(&app, get("/v1/volume/ghost")).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(body["code"], "not_found");

    let (status, _, body) = send(
        &app,
        json_request("PUT", "/v1/volumes", json!({ "volumes": [{ "id": "x" }] })),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["code"], "validation");

    let (status, _, _) = send(&app, get("/v1/volumes?wait=forever")).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);

    let (status, _, _) = send(&app, get("/v1/nothing/here")).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn test_acl_flow_over_http() {
    let mut config = leader_config("s1");
    config.acl.enabled = true;
    let app = create_router(single_server(config));

    let (status, _, body) = send(&app, get("/v1/volumes")).await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
    assert_eq!(body["code"], "token_not_found");

    let (status, _, body) = send(
        &app,
        Request::builder()
            .method("POST")
            .uri("/v1/acl/bootstrap")
            .body(Body::empty())
            .unwrap(),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    let root = body["secret_id"].as_str().unwrap().to_string();

    let (status, _, _) = send(
        &app,
        Request::builder()
            .uri("/v1/volumes")
            .header("authorization", format!("Bearer {root}"))
            .body(Body::empty())
            .unwrap(),
    )
    .await;
    assert_eq!(status, StatusCode::OK);

    let mut policy = json_request(
        "PUT",
        "/v1/acl/policy/dev-read",
        json!({ "name": "ignored", "namespaces": [{ "name": "dev", "policy": "read" }] }),
    );
    policy
        .headers_mut()
        .insert("x-volplane-token", root.parse().unwrap());
    let (status, _, _) = send(&app, policy).await;
    assert_eq!(status, StatusCode::OK);

    let mut token = json_request("POST", "/v1/acl/token", json!({ "policies": ["dev-read"] }));
    token
        .headers_mut()
        .insert("x-volplane-token", root.parse().unwrap());
    let (status, _, body) = send(&app, token).await;
    assert_eq!(status, StatusCode::CREATED);
    let reader = body["secret_id"].as_str().unwrap().to_string();

    let mut register = json_request(
        "PUT",
        "/v1/volumes?namespace=dev",
        json!({ "volumes": [volume("vol-1", "ebs")] }),
    );
    register
        .headers_mut()
        .insert("x-volplane-token", reader.parse().unwrap());
    let (status, _, body) = send(&app, register).await;
    assert_eq!(status, StatusCode::FORBIDDEN);
    assert_eq!(body["code"], "permission_denied");
}

#[tokio::test]
async fn test_status_routes() {
    let app = router();

    let (status, _, body) = send(&app, get("/health")).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["role"], "leader");

    let (status, _, body) = send(&app, get("/v1/status/leader")).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["leader"], "s1");

    send(&app, get("/v1/volumes")).await;
    let (status, _, body) = send(&app, get("/v1/metrics")).await;
    assert_eq!(status, StatusCode::OK);
    let text = body.as_str().unwrap();
    assert!(text.contains("volplane_raft_leader 1"));
}

fn internal(uri: &str, body: Value, secret: Option<&str>) -> Request<Body> {
    let mut req = json_request("POST", uri, body);
    if let Some(secret) = secret {
        req.headers_mut()
            .insert("x-volplane-rpc-secret", secret.parse().unwrap());
    }
    req
}

#[tokio::test]
async fn test_internal_rpc_route() {
    let app = router();
    let (status, _, body) = send(
        &app,
        internal(
            "/v1/internal/rpc/Volume.Register",
            json!({ "volumes": [volume("vol-1", "ebs")], "forwarded": true }),
            Some(RPC_SECRET),
        ),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert!(body["index"].as_u64().unwrap() > 0);

    let (status, _, body) = send(
        &app,
        internal("/v1/internal/rpc/Volume.Nope", json!({}), Some(RPC_SECRET)),
    )
    .await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(body["code"], "not_found");
}

#[tokio::test]
async fn test_internal_rpc_requires_cluster_secret() {
    let mut config = leader_config("s1");
    config.acl.enabled = true;
    let app = create_router(single_server(config));

    // A forwarded read would otherwise skip leader routing
    for secret in [None, Some("wrong")] {
        let (status, _, body) = send(
            &app,
            internal(
                "/v1/internal/rpc/Volume.Register",
                json!({ "volumes": [volume("vol-1", "ebs")], "forwarded": true }),
                secret,
            ),
        )
        .await;
        assert_eq!(status, StatusCode::FORBIDDEN);
        assert_eq!(body["code"], "permission_denied");
    }

    // Servers without a cluster secret keep the internal routes closed
    let mut open = leader_config("s1");
    open.rpc_secret = None;
    let app = create_router(single_server(open));
    let (status, _, _) = send(
        &app,
        internal("/v1/internal/rpc/Volume.List", json!({}), Some("")),
    )
    .await;
    assert_eq!(status, StatusCode::FORBIDDEN);
}

#[tokio::test]
async fn test_append_from_outside_the_cluster_is_rejected() {
    let mut config = leader_config("s1");
    config.acl.enabled = true;
    config.peers = vec![
        PeerConfig {
            id: "s1".into(),
            addr: "http://127.0.0.1:4646".into(),
        },
        PeerConfig {
            id: "s2".into(),
            addr: "http://127.0.0.1:4647".into(),
        },
    ];
    let server = single_server(config);
    let app = create_router(Arc::clone(&server));

    let token = AclToken::new("intruder", "intruder", TokenType::Management);
    let entries = vec![LogEntry {
        term: 99,
        index: 1,
        data: Command::AclBootstrap { token }.encode().unwrap(),
    }];
    let append = |leader: &str| {
        serde_json::to_value(AppendRequest {
            term: 99,
            leader_id: leader.to_string(),
            prev_log_index: 0,
            entries: entries.clone(),
        })
        .unwrap()
    };

    let (status, _, _) = send(&app, internal("/v1/internal/raft/append", append("s2"), None)).await;
    assert_eq!(status, StatusCode::FORBIDDEN);

    // Right secret, but the sender is not a configured peer
    let (status, _, _) = send(
        &app,
        internal("/v1/internal/raft/append", append("intruder"), Some(RPC_SECRET)),
    )
    .await;
    assert_eq!(status, StatusCode::FORBIDDEN);

    assert!(server.raft().is_leader());
    assert_eq!(server.raft().term(), 1);
    assert_eq!(server.raft().last_index(), 0);
    assert!(matches!(
        server.resolve_identity("intruder").await,
        Err(Error::TokenNotFound)
    ));
}
