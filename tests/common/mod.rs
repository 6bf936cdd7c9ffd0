//! Shared fixtures: an in-process transport and server builders

#![allow(dead_code)]

use async_trait::async_trait;
use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, RwLock, Weak};
use std::time::Duration;
use volplane::common::{Error, PeerConfig, Result};
use volplane::coordinator::{AppendRequest, AppendResponse, RaftTransport, RpcForwarder};
use volplane::state::StateStore;
use volplane::structs::Volume;
use volplane::{Config, Server};

/// Routes forwarded RPCs and log pushes straight to other in-process servers.
///
/// Errors cross it in wire form, as they would over HTTP.
#[derive(Default)]
pub struct Loopback {
    servers: RwLock<HashMap<String, Weak<Server>>>,
}

impl Loopback {
    pub fn attach(&self, addr: &str, server: &Arc<Server>) {
        self.servers
            .write()
            .unwrap()
            .insert(addr.to_string(), Arc::downgrade(server));
    }

    fn get(&self, addr: &str) -> Result<Arc<Server>> {
        self.servers
            .read()
            .unwrap()
            .get(addr)
            .and_then(Weak::upgrade)
            .ok_or_else(|| Error::Forwarding {
                leader: addr.to_string(),
                reason: "unreachable".into(),
            })
    }
}

#[async_trait]
impl RpcForwarder for Loopback {
    async fn forward(&self, leader_addr: &str, method: &str, body: Vec<u8>) -> Result<Vec<u8>> {
        let server = self.get(leader_addr)?;
        server
            .handle_rpc(method, &body)
            .await
            .map_err(|e| Error::from(e.to_wire()))
    }
}

#[async_trait]
impl RaftTransport for Loopback {
    async fn append_entries(&self, peer_addr: &str, req: &AppendRequest) -> Result<AppendResponse> {
        self.get(peer_addr)?.handle_append(req.clone())
    }
}

/// Cluster secret shared by the test servers
pub const RPC_SECRET: &str = "test-cluster-secret";

pub fn leader_config(node_id: &str) -> Config {
    Config {
        node_id: node_id.to_string(),
        bootstrap: true,
        rpc_secret: Some(RPC_SECRET.to_string()),
        ..Default::default()
    }
}

/// A single leader over in-memory state
pub fn single_server(config: Config) -> Arc<Server> {
    let state = Arc::new(StateStore::new());
    let transport = Arc::new(Loopback::default());
    let server = Arc::new(Server::new(config, state, Arc::clone(&transport)).unwrap());
    transport.attach(&server.config().node_id.clone(), &server);
    server
}

/// A leader `s1` and follower `s2` sharing one loopback transport
pub fn two_servers() -> (Arc<Server>, Arc<Server>) {
    let transport = Arc::new(Loopback::default());
    let peers = vec![
        PeerConfig {
            id: "s1".into(),
            addr: "s1".into(),
        },
        PeerConfig {
            id: "s2".into(),
            addr: "s2".into(),
        },
    ];

    let leader_conf = Config {
        peers: peers.clone(),
        ..leader_config("s1")
    };
    let follower_conf = Config {
        node_id: "s2".into(),
        peers,
        leader: Some("s1".into()),
        rpc_secret: Some(RPC_SECRET.to_string()),
        ..Default::default()
    };

    let leader = Arc::new(
        Server::new(leader_conf, Arc::new(StateStore::new()), Arc::clone(&transport)).unwrap(),
    );
    let follower = Arc::new(
        Server::new(follower_conf, Arc::new(StateStore::new()), Arc::clone(&transport)).unwrap(),
    );
    transport.attach("s1", &leader);
    transport.attach("s2", &follower);
    (leader, follower)
}

pub fn volume(id: &str, driver: &str) -> Volume {
    Volume {
        id: id.to_string(),
        driver: driver.to_string(),
        namespace: "default".to_string(),
        max_claim: 2,
        mode_read_many: true,
        mode_write_one: true,
        topology: BTreeMap::from([("zone".to_string(), "us-east-1a".to_string())]),
        ..Default::default()
    }
}

/// Poll `check` until it holds or two seconds pass
pub async fn eventually(mut check: impl FnMut() -> bool) -> bool {
    for _ in 0..200 {
        if check() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    check()
}
