//! Transport between servers: leader forwarding and log replication

use super::http::RPC_SECRET_HEADER;
use super::raft_node::{AppendRequest, AppendResponse};
use crate::common::{Error, Result, WireError};
use async_trait::async_trait;
use std::time::Duration;

/// Relays an encoded RPC to the leader and returns its encoded reply
#[async_trait]
pub trait RpcForwarder: Send + Sync {
    async fn forward(&self, leader_addr: &str, method: &str, body: Vec<u8>) -> Result<Vec<u8>>;
}

/// Pushes log entries to a follower
#[async_trait]
pub trait RaftTransport: Send + Sync {
    async fn append_entries(&self, peer_addr: &str, req: &AppendRequest) -> Result<AppendResponse>;
}

/// HTTP implementation of both transports
#[derive(Debug, Clone)]
pub struct HttpTransport {
    client: reqwest::Client,
    rpc_secret: Option<String>,
}

impl HttpTransport {
    pub fn new(timeout: Duration, rpc_secret: Option<String>) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| Error::Internal(format!("building HTTP client: {e}")))?;
        Ok(Self { client, rpc_secret })
    }

    fn post(&self, url: &str) -> reqwest::RequestBuilder {
        let req = self.client.post(url);
        match &self.rpc_secret {
            Some(secret) => req.header(RPC_SECRET_HEADER, secret),
            None => req,
        }
    }

    fn failed(addr: &str, e: impl std::fmt::Display) -> Error {
        Error::Forwarding {
            leader: addr.to_string(),
            reason: e.to_string(),
        }
    }
}

#[async_trait]
impl RpcForwarder for HttpTransport {
    async fn forward(&self, leader_addr: &str, method: &str, body: Vec<u8>) -> Result<Vec<u8>> {
        let url = format!(
            "{}/v1/internal/rpc/{}",
            leader_addr.trim_end_matches('/'),
            method
        );
        let resp = self
            .post(&url)
            .header(reqwest::header::CONTENT_TYPE, "application/json")
            .body(body)
            .send()
            .await
            .map_err(|e| Self::failed(leader_addr, e))?;

        let status = resp.status();
        let bytes = resp
            .bytes()
            .await
            .map_err(|e| Self::failed(leader_addr, e))?;
        if status.is_success() {
            return Ok(bytes.to_vec());
        }
        // The leader's error travels back verbatim
        match serde_json::from_slice::<WireError>(&bytes) {
            Ok(wire) => Err(wire.into()),
            Err(_) => Err(Self::failed(leader_addr, format!("HTTP {status}"))),
        }
    }
}

#[async_trait]
impl RaftTransport for HttpTransport {
    async fn append_entries(&self, peer_addr: &str, req: &AppendRequest) -> Result<AppendResponse> {
        let url = format!("{}/v1/internal/raft/append", peer_addr.trim_end_matches('/'));
        let resp = self
            .post(&url)
            .json(req)
            .send()
            .await
            .map_err(|e| Self::failed(peer_addr, e))?
            .error_for_status()
            .map_err(|e| Self::failed(peer_addr, e))?;
        resp.json::<AppendResponse>()
            .await
            .map_err(|e| Self::failed(peer_addr, e))
    }
}
