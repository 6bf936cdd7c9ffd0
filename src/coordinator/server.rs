//! Volplane server: shared endpoint plumbing, log application and the serve loop

use super::blocking::BlockingContext;
use super::forward::{HttpTransport, RaftTransport, RpcForwarder};
use super::fsm::{Command, Fsm};
use super::http::create_router;
use super::raft_node::{AppendRequest, AppendResponse, LogEntry, RaftNode};
use crate::acl::{hash_secret, AclResolver, AclStore, Identity};
use crate::common::{
    AuditEventType, AuditLogger, Config, Error, MetricsRegistry, MetricsTimer, Result,
};
use crate::state::StateStore;
use crate::structs::{
    AclBootstrapRequest, AclPolicyUpsertRequest, AclTokenCreateRequest, NodeRegisterRequest,
    QueryMeta, RpcRequest, VolumeClaimRequest, VolumeDeregisterRequest, VolumeGetRequest,
    VolumeListRequest, VolumeRegisterRequest,
};
use rand::Rng;
use std::future::Future;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, Instant};
use tokio::sync::watch;
use tracing::{debug, info, warn};

/// Interval between leader heartbeats
const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(1);

/// Outcome of the shared endpoint pre-flight
pub(crate) enum Dispatch<T> {
    /// The leader answered on our behalf
    Forwarded(T),
    /// Handle locally as `identity`; the timer records when the call ends
    Local(Call),
}

pub(crate) struct Call {
    pub identity: Identity,
    _timer: MetricsTimer,
}

pub struct Server {
    pub(crate) config: Config,
    pub(crate) raft: Arc<RaftNode>,
    pub(crate) state: Arc<StateStore>,
    pub(crate) acl: Arc<AclStore>,
    pub(crate) metrics: Arc<MetricsRegistry>,
    pub(crate) audit: AuditLogger,
    fsm: Fsm,
    resolver: Arc<dyn AclResolver>,
    forwarder: Arc<dyn RpcForwarder>,
    transport: Arc<dyn RaftTransport>,
    apply_lock: Mutex<()>,
    shutdown: watch::Sender<bool>,
}

impl Server {
    /// Build a server over `state`, talking to peers through `transport`
    pub fn new<T>(config: Config, state: Arc<StateStore>, transport: Arc<T>) -> Result<Self>
    where
        T: RpcForwarder + RaftTransport + 'static,
    {
        config.validate()?;
        let acl = Arc::new(AclStore::from_config(&config.acl)?);
        let raft = Arc::new(RaftNode::new(config.node_id.clone(), state.log_index()));
        if config.bootstrap {
            raft.become_leader();
        } else {
            raft.follow(config.leader.clone());
        }

        let (shutdown, _) = watch::channel(false);
        Ok(Self {
            audit: AuditLogger::new(config.audit_log.as_deref()),
            fsm: Fsm::new(Arc::clone(&state), Arc::clone(&acl)),
            resolver: Arc::clone(&acl) as Arc<dyn AclResolver>,
            forwarder: Arc::clone(&transport) as Arc<dyn RpcForwarder>,
            transport,
            metrics: Arc::new(MetricsRegistry::new()),
            apply_lock: Mutex::new(()),
            config,
            raft,
            state,
            acl,
            shutdown,
        })
    }

    /// Resolve tokens through `resolver` instead of the local ACL store
    pub fn with_resolver(mut self, resolver: Arc<dyn AclResolver>) -> Self {
        self.resolver = resolver;
        self
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn raft(&self) -> &Arc<RaftNode> {
        &self.raft
    }

    pub fn state(&self) -> &Arc<StateStore> {
        &self.state
    }

    pub fn metrics(&self) -> &Arc<MetricsRegistry> {
        &self.metrics
    }

    /// Wake every blocking query and stop background tasks
    pub fn shutdown(&self) {
        self.shutdown.send_replace(true);
    }

    pub(crate) fn blocking(&self) -> BlockingContext<'_> {
        BlockingContext {
            state: &self.state,
            config: &self.config.query,
            metrics: &self.metrics,
            shutdown: self.shutdown.subscribe(),
        }
    }

    // ========================================
    // Endpoint pre-flight

    /// Forward if needed, start timing, then resolve the caller
    pub(crate) async fn endpoint<R: RpcRequest>(
        &self,
        req: &mut R,
        metric: &'static [&'static str],
    ) -> Result<Dispatch<R::Response>> {
        self.metrics.rpc_requests.inc();
        if let Some(resp) = self.forward(req).await? {
            return Ok(Dispatch::Forwarded(resp));
        }
        let timer = self.metrics.timer(metric);
        let identity = self.resolve_identity(req.auth_token()).await?;
        Ok(Dispatch::Local(Call {
            identity,
            _timer: timer,
        }))
    }

    /// Relay `req` to the leader unless it can be served here.
    ///
    /// Returns `None` when this server should handle the request itself.
    /// While no leader is known the request is held for up to the RPC hold
    /// timeout before failing with `NoLeader`.
    pub(crate) async fn forward<R: RpcRequest>(&self, req: &mut R) -> Result<Option<R::Response>> {
        if req.is_forwarded() || (req.is_read() && req.allow_stale()) {
            return Ok(None);
        }

        let hold = self.config.rpc_hold_timeout();
        let started = Instant::now();
        loop {
            if self.raft.is_leader() {
                return Ok(None);
            }
            if let Some(leader) = self.raft.leader() {
                return self.forward_to(&leader, req).await.map(Some);
            }
            if started.elapsed() >= hold {
                warn!(method = R::METHOD, "No cluster leader within the hold timeout");
                return Err(Error::NoLeader);
            }
            let max_backoff = (hold.as_millis() as u64 / 16).max(10);
            let backoff = rand::thread_rng().gen_range(5..=max_backoff);
            tokio::time::sleep(Duration::from_millis(backoff)).await;
        }
    }

    async fn forward_to<R: RpcRequest>(&self, leader: &str, req: &mut R) -> Result<R::Response> {
        let addr = self
            .config
            .peer_addr(leader)
            .ok_or_else(|| Error::Forwarding {
                leader: leader.to_string(),
                reason: "no address known for leader".into(),
            })?;

        req.set_forwarded();
        let body = serde_json::to_vec(req)
            .map_err(|e| Error::Internal(format!("encoding {}: {e}", R::METHOD)))?;

        self.metrics.rpc_forwarded.inc();
        debug!(method = R::METHOD, leader = %leader, "Forwarding RPC to leader");
        let raw = self.forwarder.forward(addr, R::METHOD, body).await?;
        serde_json::from_slice(&raw).map_err(|e| Error::Forwarding {
            leader: leader.to_string(),
            reason: format!("decoding reply: {e}"),
        })
    }

    /// Token → ACL, falling back to the token as a node secret ID.
    ///
    /// A token neither path knows is `TokenNotFound`. An auth failure from the
    /// ACL path (an expired token) is returned as is; any other ACL error is
    /// combined with the node path's miss.
    pub async fn resolve_identity(&self, token: &str) -> Result<Identity> {
        let acl_err = match self.resolver.resolve_token(token).await {
            Ok(Some(acl)) => return Ok(Identity::Acl(acl)),
            Ok(None) => None,
            Err(e) => Some(e),
        };

        if !token.is_empty() {
            if let Some(node) = self.state.snapshot().node_by_secret_id(None, token) {
                return Ok(Identity::Node(node));
            }
        }

        let err = match acl_err {
            None => Error::TokenNotFound,
            Some(e) if e.is_auth_failure() => e,
            Some(e) => Error::Resolution(vec![e, Error::TokenNotFound]),
        };
        self.audit.log_event(
            AuditEventType::AuthFailure,
            "anonymous",
            None,
            None,
            err.to_string(),
        );
        Err(err)
    }

    /// Record a denied capability and build the error
    pub(crate) fn denied(&self, identity: &Identity, namespace: &str, what: &str) -> Error {
        self.audit.log_event(
            AuditEventType::PermissionDenied,
            identity.actor(),
            Some(namespace),
            None,
            format!("{what} denied"),
        );
        Error::PermissionDenied
    }

    /// Fill in leader-contact metadata on a read reply
    pub fn set_query_meta(&self, meta: &mut QueryMeta) {
        meta.known_leader = self.raft.leader().is_some();
        meta.last_contact_ms = self
            .raft
            .last_contact()
            .map(|d| d.as_millis() as u64)
            .unwrap_or(0);
    }

    // ========================================
    // Log application

    /// Append `cmd` to the log, apply it and push it to followers.
    ///
    /// Returns the entry's index. The entry is replicated even if applying
    /// it fails, since every server fails it the same way.
    pub async fn raft_apply(&self, cmd: Command) -> Result<u64> {
        let data = cmd.encode()?;
        let (entry, applied) = {
            let _guard = self.apply_lock.lock().unwrap_or_else(PoisonError::into_inner);
            let entry = self.raft.append(data)?;
            let applied = self.fsm.apply(entry.index, cmd);
            (entry, applied)
        };
        self.metrics.raft_applied_index.set(entry.index);
        let index = entry.index;
        self.replicate(entry);
        applied.map(|()| index)
    }

    fn peers(&self) -> Vec<String> {
        self.config
            .peers
            .iter()
            .filter(|p| p.id != self.config.node_id)
            .map(|p| p.addr.clone())
            .collect()
    }

    /// Best-effort push of one entry to every follower
    fn replicate(&self, entry: LogEntry) {
        for addr in self.peers() {
            let raft = Arc::clone(&self.raft);
            let transport = Arc::clone(&self.transport);
            let entry = entry.clone();
            tokio::spawn(async move {
                let req = AppendRequest {
                    term: raft.term(),
                    leader_id: raft.node_id().to_string(),
                    prev_log_index: entry.index - 1,
                    entries: vec![entry],
                };
                push_entries(&raft, transport.as_ref(), &addr, req).await;
            });
        }
    }

    /// Check the cluster secret presented on an internal route.
    ///
    /// Internal routes stay closed on a server with no `rpc_secret`.
    pub fn check_rpc_secret(&self, presented: Option<&str>) -> Result<()> {
        let expected = self.config.rpc_secret.as_deref();
        match (expected, presented) {
            (Some(expected), Some(presented)) if hash_secret(expected) == hash_secret(presented) => {
                Ok(())
            }
            _ => {
                self.audit.log_event(
                    AuditEventType::AuthFailure,
                    "anonymous",
                    None,
                    None,
                    "internal route without a valid cluster secret".to_string(),
                );
                Err(Error::PermissionDenied)
            }
        }
    }

    /// Accept entries from the leader and apply them in order.
    ///
    /// Only a configured peer may act as leader.
    pub fn handle_append(&self, req: AppendRequest) -> Result<AppendResponse> {
        if req.leader_id == self.config.node_id || self.config.peer_addr(&req.leader_id).is_none() {
            warn!(leader = %req.leader_id, "Rejected log entries from an unknown server");
            return Err(Error::PermissionDenied);
        }
        let _guard = self.apply_lock.lock().unwrap_or_else(PoisonError::into_inner);
        let (entries, resp) = self.raft.handle_append_entries(req);
        for entry in entries {
            if let Err(e) = self.fsm.apply_raw(entry.index, &entry.data) {
                // The leader saw the same failure and reported it to its caller
                debug!(index = entry.index, error = %e, "Log entry failed to apply");
            }
            self.metrics.raft_applied_index.set(entry.index);
        }
        Ok(resp)
    }

    /// Leader heartbeats; followers use them to track leader contact and catch up
    pub fn start_heartbeats(self: &Arc<Self>) -> tokio::task::JoinHandle<()> {
        let server = Arc::clone(self);
        let mut stop = self.shutdown.subscribe();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(HEARTBEAT_INTERVAL);
            loop {
                tokio::select! {
                    _ = ticker.tick() => {}
                    _ = stop.wait_for(|s| *s) => return,
                }
                if !server.raft.is_leader() {
                    continue;
                }
                for addr in server.peers() {
                    let req = AppendRequest {
                        term: server.raft.term(),
                        leader_id: server.raft.node_id().to_string(),
                        prev_log_index: server.raft.last_index(),
                        entries: Vec::new(),
                    };
                    push_entries(&server.raft, server.transport.as_ref(), &addr, req).await;
                }
            }
        })
    }

    // ========================================
    // Internal RPC

    /// Decode a forwarded request, run it and encode the reply
    pub async fn handle_rpc(&self, method: &str, body: &[u8]) -> Result<Vec<u8>> {
        let result = match method {
            m if m == VolumeListRequest::METHOD => call(body, |r| self.volume_list(r)).await,
            m if m == VolumeGetRequest::METHOD => call(body, |r| self.volume_get(r)).await,
            m if m == VolumeRegisterRequest::METHOD => {
                call(body, |r| self.volume_register(r)).await
            }
            m if m == VolumeDeregisterRequest::METHOD => {
                call(body, |r| self.volume_deregister(r)).await
            }
            m if m == VolumeClaimRequest::METHOD => call(body, |r| self.volume_claim(r)).await,
            m if m == NodeRegisterRequest::METHOD => call(body, |r| self.node_register(r)).await,
            m if m == AclBootstrapRequest::METHOD => call(body, |r| self.acl_bootstrap(r)).await,
            m if m == AclPolicyUpsertRequest::METHOD => {
                call(body, |r| self.acl_upsert_policy(r)).await
            }
            m if m == AclTokenCreateRequest::METHOD => {
                call(body, |r| self.acl_create_token(r)).await
            }
            other => Err(Error::NotFound(format!("RPC method {other}"))),
        };
        self.record(result)
    }

    /// Count failed calls
    pub(crate) fn record<T>(&self, result: Result<T>) -> Result<T> {
        if result.is_err() {
            self.metrics.rpc_errors.inc();
        }
        result
    }

    // ========================================
    // Serving

    /// Serve the HTTP API until ctrl-c
    pub async fn serve(self: Arc<Self>) -> Result<()> {
        info!("Starting volplane server: {}", self.config.node_id);
        info!("  HTTP API: {}", self.config.bind_addr);
        info!("  Data dir: {}", self.config.data_dir.display());
        info!("  ACLs: {}", if self.acl.enabled() { "enabled" } else { "disabled" });

        let heartbeats = self.start_heartbeats();
        let router = create_router(Arc::clone(&self));
        let listener = tokio::net::TcpListener::bind(self.config.bind_addr).await?;

        info!(
            role = %self.raft.role(),
            leader = ?self.raft.leader(),
            "Server ready"
        );

        let server = Arc::clone(&self);
        axum::serve(listener, router)
            .with_graceful_shutdown(async move {
                let _ = tokio::signal::ctrl_c().await;
                info!("Shutting down");
                server.shutdown();
            })
            .await?;

        heartbeats.abort();
        self.state.flush()?;
        Ok(())
    }
}

/// Default transport for a configured server
pub fn http_transport(config: &Config) -> Result<Arc<HttpTransport>> {
    // Forwarded blocking queries may wait up to the query cap
    let timeout = config.query.max_query_time() + config.query.max_query_time() / 16
        + Duration::from_secs(5);
    Ok(Arc::new(HttpTransport::new(timeout, config.rpc_secret.clone())?))
}

async fn call<R, F, Fut>(body: &[u8], handler: F) -> Result<Vec<u8>>
where
    R: RpcRequest,
    F: FnOnce(R) -> Fut,
    Fut: Future<Output = Result<R::Response>>,
{
    let req: R = serde_json::from_slice(body)
        .map_err(|e| Error::Validation(format!("decoding {}: {e}", R::METHOD)))?;
    let resp = handler(req).await?;
    serde_json::to_vec(&resp).map_err(|e| Error::Internal(format!("encoding reply: {e}")))
}

/// Send `req` to a follower, resending from its last index if it reports a gap
async fn push_entries(raft: &RaftNode, transport: &dyn RaftTransport, addr: &str, req: AppendRequest) {
    let leader_last = raft.last_index();
    let resp = match transport.append_entries(addr, &req).await {
        Ok(resp) => resp,
        Err(e) => {
            debug!(peer = %addr, error = %e, "Append entries failed");
            return;
        }
    };
    if resp.term > req.term || resp.last_index >= leader_last {
        return;
    }

    let missing = raft.entries_since(resp.last_index);
    if missing.first().map(|e| e.index) != Some(resp.last_index + 1) {
        warn!(
            peer = %addr,
            follower_index = resp.last_index,
            "Follower is behind the in-memory log and cannot catch up"
        );
        return;
    }
    let retry = AppendRequest {
        term: req.term,
        leader_id: req.leader_id,
        prev_log_index: resp.last_index,
        entries: missing,
    };
    if let Err(e) = transport.append_entries(addr, &retry).await {
        debug!(peer = %addr, error = %e, "Append entries retry failed");
    }
}
