//! # volplane
//!
//! Control plane for shared external storage volumes (CSI volumes):
//! - A transactional in-memory volume store with watch channels, persisted to RocksDB
//! - Namespace-scoped ACLs with client node secrets as a fallback identity
//! - Leader forwarding over a replicated command log
//! - Blocking queries driven by table indices
//!
//! ## Architecture
//!
//! ```text
//!  client ──HTTP──▶ server (follower) ──forward──▶ server (leader)
//!                        ▲                              │
//!                        └────── append entries ────────┘
//!                                                       │
//!                              FSM ──▶ StateStore (MemDb + RocksDB)
//! ```
//!
//! ## Usage
//!
//! ### Start a server
//! ```bash
//! volplane-server --node-id server-1 --bind 127.0.0.1:4646 --data ./data --bootstrap
//! ```
//!
//! ### Use the CLI
//! ```bash
//! volplane volume register ./volumes.json --namespace prod
//! volplane volume list --driver ebs.csi.aws.com
//! volplane volume status vol-1
//! volplane volume deregister vol-1
//! ```

#![allow(clippy::result_large_err)]

pub mod acl;
pub mod client;
pub mod common;
pub mod coordinator;
pub mod state;
pub mod structs;

pub use common::{Config, Error, Result};
pub use coordinator::Server;

/// Current version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
