//! HTTP API
//!
//! Public routes translate HTTP requests into RPC envelopes and call the
//! same endpoints that forwarded requests reach through
//! `/v1/internal/rpc/:method`. Read replies carry their consistency
//! metadata in `X-Volplane-*` headers; `?index=` and `?wait=` turn a read
//! into a blocking query.

use super::raft_node::{AppendRequest, AppendResponse};
use super::server::Server;
use crate::acl::Policy;
use crate::common::{Error, Result};
use crate::structs::{
    AclBootstrapRequest, AclPolicyUpsertRequest, AclTokenCreateRequest, NodeRegisterRequest,
    QueryMeta, QueryOptions, VolumeClaimRequest, VolumeDeregisterRequest, VolumeGetRequest,
    VolumeListRequest, VolumeRegisterRequest, WriteMeta, WriteRequest,
};
use axum::{
    body::Bytes,
    extract::{DefaultBodyLimit, Path, Query, State},
    http::{header, HeaderMap, HeaderValue, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post, put},
    Json, Router,
};
use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use tower_http::trace::TraceLayer;

pub const TOKEN_HEADER: &str = "x-volplane-token";
pub const INDEX_HEADER: &str = "x-volplane-index";
pub const KNOWN_LEADER_HEADER: &str = "x-volplane-knownleader";
pub const LAST_CONTACT_HEADER: &str = "x-volplane-lastcontact";
/// Cluster secret required on the internal routes
pub const RPC_SECRET_HEADER: &str = "x-volplane-rpc-secret";

/// Largest accepted request body
const MAX_BODY_BYTES: usize = 4 * 1024 * 1024;

type SharedServer = Arc<Server>;

/// Creates the HTTP router with the public API and the internal cluster routes.
pub fn create_router(server: SharedServer) -> Router {
    Router::new()
        .route("/v1/volumes", get(list_volumes).put(register_volumes))
        .route("/v1/volumes/claim", post(claim_volumes))
        .route("/v1/volume/:id", get(get_volume).delete(deregister_volume))
        .route("/v1/node/register", put(register_node))
        .route("/v1/acl/bootstrap", post(acl_bootstrap))
        .route("/v1/acl/policy/:name", put(acl_upsert_policy))
        .route("/v1/acl/token", post(acl_create_token))
        .route("/v1/internal/rpc/:method", post(internal_rpc))
        .route("/v1/internal/raft/append", post(raft_append))
        .route("/v1/status/leader", get(status_leader))
        .route("/v1/metrics", get(metrics))
        .route("/health", get(health))
        .fallback(not_found)
        .layer(DefaultBodyLimit::max(MAX_BODY_BYTES))
        .layer(TraceLayer::new_for_http())
        .with_state(server)
}

// ========================================
// Errors

/// An [`Error`] rendered as status code plus wire body
pub struct ApiError(Error);

impl From<Error> for ApiError {
    fn from(e: Error) -> Self {
        Self(e)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        (self.0.to_http_status(), Json(self.0.to_wire())).into_response()
    }
}

type ApiResult<T> = std::result::Result<T, ApiError>;

async fn not_found() -> ApiError {
    ApiError(Error::NotFound("no such route".into()))
}

// ========================================
// Request helpers

/// Query string shared by the volume routes
#[derive(Debug, Default, Deserialize)]
pub struct ApiParams {
    namespace: Option<String>,
    driver: Option<String>,
    index: Option<u64>,
    wait: Option<String>,
    /// Present (with any value) to allow a stale read
    stale: Option<String>,
}

impl ApiParams {
    fn query_options(&self, token: String) -> Result<QueryOptions> {
        let max_query_time_ms = match &self.wait {
            Some(raw) => parse_wait(raw)?.as_millis() as u64,
            None => 0,
        };
        Ok(QueryOptions {
            namespace: self.namespace.clone().filter(|ns| !ns.is_empty()),
            auth_token: token,
            min_query_index: self.index.unwrap_or(0),
            max_query_time_ms,
            allow_stale: self.stale.is_some(),
            forwarded: false,
        })
    }

    fn write_request(&self, token: String) -> WriteRequest {
        let mut write = WriteRequest {
            auth_token: token,
            ..Default::default()
        };
        if let Some(ns) = self.namespace.as_ref().filter(|ns| !ns.is_empty()) {
            write.namespace = ns.clone();
        }
        write
    }
}

/// Parse a wait such as `30s`, `500ms` or `5m`; a bare number is seconds
pub fn parse_wait(raw: &str) -> Result<Duration> {
    let raw = raw.trim();
    let split = raw
        .find(|c: char| !c.is_ascii_digit())
        .unwrap_or(raw.len());
    let (digits, unit) = raw.split_at(split);
    let value: u64 = digits
        .parse()
        .map_err(|_| Error::Validation(format!("invalid wait {raw:?}")))?;
    match unit {
        "" | "s" => Ok(Duration::from_secs(value)),
        "ms" => Ok(Duration::from_millis(value)),
        "m" => Ok(Duration::from_secs(value.saturating_mul(60))),
        _ => Err(Error::Validation(format!("invalid wait unit in {raw:?}"))),
    }
}

/// Token from `X-Volplane-Token`, else from `Authorization: Bearer`
pub fn auth_token(headers: &HeaderMap) -> String {
    if let Some(token) = headers.get(TOKEN_HEADER).and_then(|v| v.to_str().ok()) {
        return token.trim().to_string();
    }
    headers
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
        .map(|t| t.trim().to_string())
        .unwrap_or_default()
}

/// Decode a JSON body; an empty body decodes as the type's default
fn decode<T: DeserializeOwned + Default>(body: &Bytes) -> Result<T> {
    if body.iter().all(u8::is_ascii_whitespace) {
        return Ok(T::default());
    }
    decode_required(body)
}

fn decode_required<T: DeserializeOwned>(body: &Bytes) -> Result<T> {
    serde_json::from_slice(body).map_err(|e| Error::Validation(format!("invalid request body: {e}")))
}

fn query_headers(meta: &QueryMeta) -> HeaderMap {
    let mut headers = HeaderMap::new();
    headers.insert(INDEX_HEADER, HeaderValue::from(meta.index));
    headers.insert(
        KNOWN_LEADER_HEADER,
        HeaderValue::from_static(if meta.known_leader { "true" } else { "false" }),
    );
    headers.insert(LAST_CONTACT_HEADER, HeaderValue::from(meta.last_contact_ms));
    headers
}

fn write_reply(meta: WriteMeta) -> impl IntoResponse {
    let mut headers = HeaderMap::new();
    headers.insert(INDEX_HEADER, HeaderValue::from(meta.index));
    (headers, Json(meta))
}

// ========================================
// Volume routes

async fn list_volumes(
    State(server): State<SharedServer>,
    Query(params): Query<ApiParams>,
    headers: HeaderMap,
) -> ApiResult<impl IntoResponse> {
    let req = VolumeListRequest {
        driver: params.driver.clone().filter(|d| !d.is_empty()),
        query: params.query_options(auth_token(&headers))?,
    };
    let resp = server.record(server.volume_list(req).await)?;
    Ok((query_headers(&resp.meta), Json(resp.volumes)))
}

async fn get_volume(
    State(server): State<SharedServer>,
    Path(id): Path<String>,
    Query(params): Query<ApiParams>,
    headers: HeaderMap,
) -> ApiResult<impl IntoResponse> {
    let req = VolumeGetRequest {
        id,
        query: params.query_options(auth_token(&headers))?,
    };
    let resp = server.record(server.volume_get(req).await)?;
    Ok((query_headers(&resp.meta), Json(resp.volume)))
}

async fn register_volumes(
    State(server): State<SharedServer>,
    Query(params): Query<ApiParams>,
    headers: HeaderMap,
    body: Bytes,
) -> ApiResult<impl IntoResponse> {
    let mut req: VolumeRegisterRequest = decode_required(&body)?;
    let body_namespace = req.write.namespace.clone();
    req.write = params.write_request(auth_token(&headers));
    if params.namespace.as_deref().map_or(true, str::is_empty) {
        req.write.namespace = body_namespace;
    }
    let meta = server.record(server.volume_register(req).await)?;
    Ok(write_reply(meta))
}

async fn deregister_volume(
    State(server): State<SharedServer>,
    Path(id): Path<String>,
    Query(params): Query<ApiParams>,
    headers: HeaderMap,
) -> ApiResult<impl IntoResponse> {
    let req = VolumeDeregisterRequest {
        volume_ids: vec![id],
        write: params.write_request(auth_token(&headers)),
    };
    let meta = server.record(server.volume_deregister(req).await)?;
    Ok(write_reply(meta))
}

async fn claim_volumes(
    State(server): State<SharedServer>,
    Query(params): Query<ApiParams>,
    headers: HeaderMap,
    body: Bytes,
) -> ApiResult<impl IntoResponse> {
    let mut req: VolumeClaimRequest = decode_required(&body)?;
    let body_namespace = req.write.namespace.clone();
    req.write = params.write_request(auth_token(&headers));
    if params.namespace.as_deref().map_or(true, str::is_empty) {
        req.write.namespace = body_namespace;
    }
    let meta = server.record(server.volume_claim(req).await)?;
    Ok(write_reply(meta))
}

// ========================================
// Node and ACL routes

async fn register_node(
    State(server): State<SharedServer>,
    headers: HeaderMap,
    body: Bytes,
) -> ApiResult<impl IntoResponse> {
    let mut req: NodeRegisterRequest = decode_required(&body)?;
    req.write.auth_token = auth_token(&headers);
    req.write.forwarded = false;
    let meta = server.record(server.node_register(req).await)?;
    Ok(write_reply(meta))
}

async fn acl_bootstrap(
    State(server): State<SharedServer>,
    body: Bytes,
) -> ApiResult<impl IntoResponse> {
    let mut req: AclBootstrapRequest = decode(&body)?;
    req.write.forwarded = false;
    let resp = server.record(server.acl_bootstrap(req).await)?;
    Ok(Json(resp))
}

async fn acl_upsert_policy(
    State(server): State<SharedServer>,
    Path(name): Path<String>,
    headers: HeaderMap,
    body: Bytes,
) -> ApiResult<impl IntoResponse> {
    let mut policy: Policy = decode_required(&body)?;
    policy.name = name;
    let req = AclPolicyUpsertRequest {
        policy,
        write: WriteRequest {
            auth_token: auth_token(&headers),
            ..Default::default()
        },
    };
    let meta = server.record(server.acl_upsert_policy(req).await)?;
    Ok(write_reply(meta))
}

async fn acl_create_token(
    State(server): State<SharedServer>,
    headers: HeaderMap,
    body: Bytes,
) -> ApiResult<impl IntoResponse> {
    let mut req: AclTokenCreateRequest = decode(&body)?;
    req.write = WriteRequest {
        auth_token: auth_token(&headers),
        ..Default::default()
    };
    let resp = server.record(server.acl_create_token(req).await)?;
    Ok((StatusCode::CREATED, Json(resp)))
}

// ========================================
// Internal cluster routes

fn rpc_secret(headers: &HeaderMap) -> Option<&str> {
    headers.get(RPC_SECRET_HEADER).and_then(|v| v.to_str().ok())
}

async fn internal_rpc(
    State(server): State<SharedServer>,
    Path(method): Path<String>,
    headers: HeaderMap,
    body: Bytes,
) -> ApiResult<impl IntoResponse> {
    server.record(server.check_rpc_secret(rpc_secret(&headers)))?;
    let reply = server.handle_rpc(&method, &body).await?;
    Ok(([(header::CONTENT_TYPE, "application/json")], reply))
}

async fn raft_append(
    State(server): State<SharedServer>,
    headers: HeaderMap,
    body: Bytes,
) -> ApiResult<Json<AppendResponse>> {
    server.check_rpc_secret(rpc_secret(&headers))?;
    let req: AppendRequest = decode_required(&body)?;
    Ok(Json(server.handle_append(req)?))
}

// ========================================
// Status routes

async fn status_leader(State(server): State<SharedServer>) -> impl IntoResponse {
    let leader = server.raft().leader();
    let addr = leader
        .as_deref()
        .and_then(|id| server.config().peer_addr(id))
        .map(str::to_string);
    Json(json!({
        "leader": leader,
        "address": addr,
        "term": server.raft().term(),
    }))
}

async fn metrics(State(server): State<SharedServer>) -> impl IntoResponse {
    let mut out = server.metrics().to_prometheus();
    out += &format!(
        "volplane_raft_leader {}\n",
        u8::from(server.raft().is_leader())
    );
    out += &format!(
        "volplane_volumes_index {}\n",
        server.state().index(crate::state::TABLE_VOLUMES)
    );
    (
        [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
        out,
    )
}

/// Health check endpoint for node status and raft role.
async fn health(State(server): State<SharedServer>) -> impl IntoResponse {
    Json(json!({
        "status": "healthy",
        "node_id": server.config().node_id,
        "role": server.raft().role().to_string(),
        "is_leader": server.raft().is_leader(),
        "applied_index": server.raft().last_index(),
        "version": env!("CARGO_PKG_VERSION"),
    }))
}
