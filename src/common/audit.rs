//! Audit logging
//!
//! Structured JSON-lines records for security-relevant actions: failed
//! authentication, denied capabilities, volume writes and ACL changes.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::Path;
use std::sync::Mutex;

/// Audit log event types
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuditEventType {
    AuthFailure,
    PermissionDenied,
    VolumeRegistered,
    VolumeDeregistered,
    VolumeClaimed,
    NodeRegistered,
    AclBootstrapped,
    AclPolicyUpserted,
    AclTokenCreated,
}

/// Audit log entry
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditEntry {
    #[serde(with = "chrono::serde::ts_seconds")]
    pub timestamp: DateTime<Utc>,
    pub event: AuditEventType,
    /// Token accessor, node ID, or "anonymous"
    pub actor: String,
    pub namespace: Option<String>,
    pub target: Option<String>,
    pub message: String,
}

pub struct AuditLogger {
    file: Option<Mutex<File>>,
}

impl AuditLogger {
    /// Create a logger appending to `path`; with no path entries only go to tracing
    pub fn new(path: Option<&Path>) -> Self {
        let file = path.and_then(|p| {
            OpenOptions::new()
                .create(true)
                .append(true)
                .open(p)
                .map_err(|e| tracing::warn!("audit log {} unavailable: {}", p.display(), e))
                .ok()
                .map(Mutex::new)
        });
        Self { file }
    }

    pub fn disabled() -> Self {
        Self { file: None }
    }

    pub fn log(&self, entry: AuditEntry) {
        let line = serde_json::to_string(&entry).unwrap_or_else(|_| "{}".to_string());
        if let Some(file) = &self.file {
            if let Ok(mut f) = file.lock() {
                let _ = writeln!(f, "{}", line);
            }
        }
        tracing::info!(target: "volplane::audit", event = ?entry.event, actor = %entry.actor, "{}", line);
    }

    pub fn log_event(
        &self,
        event: AuditEventType,
        actor: impl Into<String>,
        namespace: Option<&str>,
        target: Option<String>,
        message: impl Into<String>,
    ) {
        self.log(AuditEntry {
            timestamp: Utc::now(),
            event,
            actor: actor.into(),
            namespace: namespace.map(str::to_string),
            target,
            message: message.into(),
        });
    }
}
