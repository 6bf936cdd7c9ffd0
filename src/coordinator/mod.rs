//! Volplane server with a replicated log
//!
//! The server is responsible for:
//! - Volume, node and ACL endpoints (forward, authenticate, authorize)
//! - Blocking queries over the state store
//! - Applying replicated commands through the FSM
//! - The HTTP API and the internal cluster routes

pub mod acl_endpoint;
pub mod blocking;
pub mod forward;
pub mod fsm;
pub mod http;
pub mod node_endpoint;
pub mod raft_node;
pub mod server;
pub mod volume_endpoint;

pub use forward::{HttpTransport, RaftTransport, RpcForwarder};
pub use fsm::{Command, Fsm};
pub use raft_node::{AppendRequest, AppendResponse, LogEntry, RaftNode, RaftRole};
pub use server::{http_transport, Server};
