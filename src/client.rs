//! HTTP API client used by the CLI

use crate::common::{Error, Result, WireError};
use crate::coordinator::http::{INDEX_HEADER, KNOWN_LEADER_HEADER, LAST_CONTACT_HEADER, TOKEN_HEADER};
use crate::structs::{QueryMeta, Volume, WriteMeta};
use percent_encoding::{utf8_percent_encode, NON_ALPHANUMERIC};
use reqwest::{RequestBuilder, Response};
use serde::de::DeserializeOwned;
use serde_json::json;

/// Options for list and status calls
#[derive(Debug, Clone, Default)]
pub struct ReadOptions {
    pub namespace: Option<String>,
    pub driver: Option<String>,
    /// Block until the index passes this value
    pub index: Option<u64>,
    /// Blocking wait, e.g. `30s`
    pub wait: Option<String>,
    pub stale: bool,
}

pub struct Client {
    base: String,
    token: Option<String>,
    http: reqwest::Client,
}

impl Client {
    pub fn new(address: impl Into<String>, token: Option<String>) -> Self {
        Self {
            base: address.into().trim_end_matches('/').to_string(),
            token: token.filter(|t| !t.is_empty()),
            http: reqwest::Client::new(),
        }
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base, path)
    }

    fn authed(&self, req: RequestBuilder) -> RequestBuilder {
        match &self.token {
            Some(token) => req.header(TOKEN_HEADER, token),
            None => req,
        }
    }

    fn read_query(opts: &ReadOptions) -> Vec<(&'static str, String)> {
        let mut query = Vec::new();
        if let Some(ns) = &opts.namespace {
            query.push(("namespace", ns.clone()));
        }
        if let Some(driver) = &opts.driver {
            query.push(("driver", driver.clone()));
        }
        if let Some(index) = opts.index {
            query.push(("index", index.to_string()));
        }
        if let Some(wait) = &opts.wait {
            query.push(("wait", wait.clone()));
        }
        if opts.stale {
            query.push(("stale", String::new()));
        }
        query
    }

    async fn send(&self, req: RequestBuilder) -> Result<Response> {
        let resp = self
            .authed(req)
            .send()
            .await
            .map_err(|e| Error::Other(format!("request to {} failed: {e}", self.base)))?;
        if resp.status().is_success() {
            return Ok(resp);
        }
        let status = resp.status();
        match resp.json::<WireError>().await {
            Ok(wire) => Err(wire.into()),
            Err(_) => Err(Error::Other(format!("unexpected HTTP {status}"))),
        }
    }

    async fn body<T: DeserializeOwned>(resp: Response) -> Result<T> {
        resp.json()
            .await
            .map_err(|e| Error::Other(format!("decoding response: {e}")))
    }

    /// Volumes visible to the caller, newest first
    pub async fn list_volumes(&self, opts: &ReadOptions) -> Result<(Vec<Volume>, QueryMeta)> {
        let req = self
            .http
            .get(self.url("/v1/volumes"))
            .query(&Self::read_query(opts));
        let resp = self.send(req).await?;
        let meta = query_meta(&resp);
        let mut volumes: Vec<Volume> = Self::body(resp).await?;
        volumes.sort_by(|a, b| b.created_index.cmp(&a.created_index));
        Ok((volumes, meta))
    }

    pub async fn volume(&self, id: &str, opts: &ReadOptions) -> Result<(Volume, QueryMeta)> {
        let path = format!("/v1/volume/{}", encode(id));
        let req = self.http.get(self.url(&path)).query(&Self::read_query(opts));
        let resp = self.send(req).await?;
        let meta = query_meta(&resp);
        Ok((Self::body(resp).await?, meta))
    }

    pub async fn register_volumes(&self, volumes: &[Volume], namespace: &str) -> Result<WriteMeta> {
        let req = self
            .http
            .put(self.url("/v1/volumes"))
            .query(&[("namespace", namespace)])
            .json(&json!({ "volumes": volumes }));
        Self::body(self.send(req).await?).await
    }

    pub async fn deregister_volume(&self, id: &str, namespace: &str) -> Result<WriteMeta> {
        let path = format!("/v1/volume/{}", encode(id));
        let req = self
            .http
            .delete(self.url(&path))
            .query(&[("namespace", namespace)]);
        Self::body(self.send(req).await?).await
    }

    /// Current leader ID, if any
    pub async fn leader(&self) -> Result<Option<String>> {
        let resp = self.send(self.http.get(self.url("/v1/status/leader"))).await?;
        let value: serde_json::Value = Self::body(resp).await?;
        Ok(value["leader"].as_str().map(str::to_string))
    }
}

fn encode(segment: &str) -> String {
    utf8_percent_encode(segment, NON_ALPHANUMERIC).to_string()
}

fn query_meta(resp: &Response) -> QueryMeta {
    let header = |name: &str| {
        resp.headers()
            .get(name)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string)
    };
    QueryMeta {
        index: header(INDEX_HEADER)
            .and_then(|v| v.parse().ok())
            .unwrap_or(0),
        last_contact_ms: header(LAST_CONTACT_HEADER)
            .and_then(|v| v.parse().ok())
            .unwrap_or(0),
        known_leader: header(KNOWN_LEADER_HEADER).as_deref() == Some("true"),
    }
}
