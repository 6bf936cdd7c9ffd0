//! Raft consensus node (simplified)
//!
//! Leadership is static: one server starts as leader (`bootstrap`) and the
//! others follow a configured leader. The leader appends commands to an
//! in-memory log and pushes them to followers; followers apply what they
//! receive in order and report the last index they hold when they see a gap.

use crate::common::{Error, Result};
use serde::{Deserialize, Serialize};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

/// Raft role
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RaftRole {
    Follower,
    Leader,
}

impl std::fmt::Display for RaftRole {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RaftRole::Follower => write!(f, "follower"),
            RaftRole::Leader => write!(f, "leader"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogEntry {
    pub term: u64,
    pub index: u64,
    /// bincode-encoded command
    pub data: Vec<u8>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppendRequest {
    pub term: u64,
    pub leader_id: String,
    /// Index of the entry preceding `entries` (or the leader's last index for a heartbeat)
    pub prev_log_index: u64,
    pub entries: Vec<LogEntry>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AppendResponse {
    pub term: u64,
    pub success: bool,
    /// Last index the follower holds
    pub last_index: u64,
}

#[derive(Debug)]
struct RaftState {
    role: RaftRole,
    term: u64,
    leader_id: Option<String>,
    /// Index of the last entry, applied or appended
    last_index: u64,
    log: Vec<LogEntry>,
    last_contact: Option<Instant>,
}

/// Raft node state
#[derive(Debug)]
pub struct RaftNode {
    node_id: String,
    state: Mutex<RaftState>,
}

impl RaftNode {
    /// A follower whose log starts after `last_index` (restored from disk)
    pub fn new(node_id: impl Into<String>, last_index: u64) -> Self {
        Self {
            node_id: node_id.into(),
            state: Mutex::new(RaftState {
                role: RaftRole::Follower,
                term: 0,
                leader_id: None,
                last_index,
                log: Vec::new(),
                last_contact: None,
            }),
        }
    }

    fn lock(&self) -> MutexGuard<'_, RaftState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn node_id(&self) -> &str {
        &self.node_id
    }

    pub fn is_leader(&self) -> bool {
        self.lock().role == RaftRole::Leader
    }

    pub fn role(&self) -> RaftRole {
        self.lock().role
    }

    pub fn leader(&self) -> Option<String> {
        self.lock().leader_id.clone()
    }

    pub fn term(&self) -> u64 {
        self.lock().term
    }

    pub fn last_index(&self) -> u64 {
        self.lock().last_index
    }

    /// Take leadership in a new term
    pub fn become_leader(&self) {
        let mut s = self.lock();
        s.role = RaftRole::Leader;
        s.term += 1;
        s.leader_id = Some(self.node_id.clone());
        tracing::info!(node_id = %self.node_id, term = s.term, "Became leader");
    }

    /// Follow `leader_id` (which may be unknown yet)
    pub fn follow(&self, leader_id: Option<String>) {
        let mut s = self.lock();
        s.role = RaftRole::Follower;
        s.leader_id = leader_id;
    }

    /// Time since the leader was last heard from; zero on the leader itself
    pub fn last_contact(&self) -> Option<Duration> {
        let s = self.lock();
        match s.role {
            RaftRole::Leader => Some(Duration::ZERO),
            RaftRole::Follower => s.last_contact.map(|at| at.elapsed()),
        }
    }

    /// Append a new entry on the leader, returning it
    pub fn append(&self, data: Vec<u8>) -> Result<LogEntry> {
        let mut s = self.lock();
        if s.role != RaftRole::Leader {
            return Err(match &s.leader_id {
                Some(id) => Error::NotLeader(id.clone()),
                None => Error::NoLeader,
            });
        }
        s.last_index += 1;
        let entry = LogEntry {
            term: s.term,
            index: s.last_index,
            data,
        };
        s.log.push(entry.clone());
        Ok(entry)
    }

    /// Entries after `index` still held in memory
    pub fn entries_since(&self, index: u64) -> Vec<LogEntry> {
        self.lock()
            .log
            .iter()
            .filter(|e| e.index > index)
            .cloned()
            .collect()
    }

    /// Accept entries from the leader.
    ///
    /// Returns the entries the caller must apply, in order, together with the
    /// response to send back. Entries already held are skipped; a gap rejects
    /// the whole request.
    pub fn handle_append_entries(&self, req: AppendRequest) -> (Vec<LogEntry>, AppendResponse) {
        let mut s = self.lock();
        if req.term < s.term {
            let resp = AppendResponse {
                term: s.term,
                success: false,
                last_index: s.last_index,
            };
            return (Vec::new(), resp);
        }

        s.term = req.term;
        s.role = RaftRole::Follower;
        s.leader_id = Some(req.leader_id);
        s.last_contact = Some(Instant::now());

        if req.prev_log_index > s.last_index && !req.entries.is_empty() {
            let resp = AppendResponse {
                term: s.term,
                success: false,
                last_index: s.last_index,
            };
            return (Vec::new(), resp);
        }

        let mut accepted = Vec::new();
        for entry in req.entries {
            if entry.index <= s.last_index {
                continue;
            }
            if entry.index != s.last_index + 1 {
                break;
            }
            s.last_index = entry.index;
            s.log.push(entry.clone());
            accepted.push(entry);
        }

        let resp = AppendResponse {
            term: s.term,
            success: true,
            last_index: s.last_index,
        };
        (accepted, resp)
    }
}
