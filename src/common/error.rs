//! Error types for volplane

use serde::{Deserialize, Serialize};
use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Error, Debug)]
pub enum Error {
    // === I/O Errors ===
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    // === Identity & ACL Errors ===
    #[error("ACL token not found")]
    TokenNotFound,

    #[error("ACL token expired")]
    TokenExpired,

    #[error("Permission denied")]
    PermissionDenied,

    #[error("ACL error: {0}")]
    Acl(String),

    /// Both identity paths failed with unexpected errors
    #[error("identity resolution failed: {}", join_errors(.0))]
    Resolution(Vec<Error>),

    // === Volume Errors ===
    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Validation failed: {0}")]
    Validation(String),

    #[error("Conflict: {0}")]
    Conflict(String),

    #[error("Claim unavailable: {0}")]
    ClaimUnavailable(String),

    // === Store Errors ===
    #[error("State store error: {0}")]
    Store(String),

    #[error("RocksDB error: {0}")]
    RocksDb(#[from] rocksdb::Error),

    #[error("Corrupted data: {0}")]
    Corrupted(String),

    // === Raft / Forwarding Errors ===
    #[error("No cluster leader")]
    NoLeader,

    #[error("Not leader: current leader is {0}")]
    NotLeader(String),

    #[error("Forwarding to {leader} failed: {reason}")]
    Forwarding { leader: String, reason: String },

    // === Config Errors ===
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    // === Generic ===
    #[error("Internal error: {0}")]
    Internal(String),

    #[error("{0}")]
    Other(String),
}

fn join_errors(errors: &[Error]) -> String {
    errors
        .iter()
        .map(|e| e.to_string())
        .collect::<Vec<_>>()
        .join("; ")
}

impl Error {
    /// Is this a retryable error?
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Error::NoLeader | Error::NotLeader(_) | Error::Forwarding { .. }
        )
    }

    /// Is this an authentication failure (as opposed to an authorization one)?
    pub fn is_auth_failure(&self) -> bool {
        matches!(
            self,
            Error::TokenNotFound | Error::TokenExpired | Error::Resolution(_)
        )
    }

    /// Convert to HTTP status code
    pub fn to_http_status(&self) -> axum::http::StatusCode {
        use axum::http::StatusCode;
        match self {
            Error::TokenNotFound | Error::TokenExpired | Error::Resolution(_) => {
                StatusCode::UNAUTHORIZED
            }
            Error::PermissionDenied => StatusCode::FORBIDDEN,
            Error::NotFound(_) => StatusCode::NOT_FOUND,
            Error::Validation(_) | Error::InvalidConfig(_) => StatusCode::BAD_REQUEST,
            Error::Conflict(_) | Error::ClaimUnavailable(_) => StatusCode::CONFLICT,
            Error::NoLeader | Error::NotLeader(_) | Error::Forwarding { .. } => {
                StatusCode::SERVICE_UNAVAILABLE
            }
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Serializable form carried back over the forwarding transport
    pub fn to_wire(&self) -> WireError {
        let code = match self {
            Error::TokenNotFound => ErrorCode::TokenNotFound,
            Error::TokenExpired => ErrorCode::TokenExpired,
            Error::PermissionDenied => ErrorCode::PermissionDenied,
            Error::Resolution(_) => ErrorCode::Resolution,
            Error::NotFound(_) => ErrorCode::NotFound,
            Error::Validation(_) => ErrorCode::Validation,
            Error::Conflict(_) => ErrorCode::Conflict,
            Error::ClaimUnavailable(_) => ErrorCode::ClaimUnavailable,
            Error::NoLeader | Error::NotLeader(_) => ErrorCode::NoLeader,
            Error::Forwarding { .. } => ErrorCode::Forwarding,
            Error::Store(_) | Error::RocksDb(_) | Error::Corrupted(_) => ErrorCode::Store,
            _ => ErrorCode::Internal,
        };
        WireError {
            code,
            message: self.to_string(),
            detail: self.detail(),
        }
    }

    /// The variant payload, without the display prefix
    fn detail(&self) -> Option<String> {
        match self {
            Error::NotFound(s)
            | Error::Validation(s)
            | Error::Conflict(s)
            | Error::ClaimUnavailable(s)
            | Error::Store(s)
            | Error::Corrupted(s)
            | Error::Internal(s) => Some(s.clone()),
            _ => None,
        }
    }
}

/// Stable error classification used on the wire
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCode {
    TokenNotFound,
    TokenExpired,
    PermissionDenied,
    Resolution,
    NotFound,
    Validation,
    Conflict,
    ClaimUnavailable,
    NoLeader,
    Forwarding,
    Store,
    Internal,
}

/// Error body returned by the HTTP API and the internal RPC route
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WireError {
    pub code: ErrorCode,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
}

impl From<WireError> for Error {
    fn from(w: WireError) -> Self {
        let detail = w.detail.unwrap_or_else(|| w.message.clone());
        match w.code {
            ErrorCode::TokenNotFound => Error::TokenNotFound,
            ErrorCode::TokenExpired => Error::TokenExpired,
            ErrorCode::PermissionDenied => Error::PermissionDenied,
            ErrorCode::Resolution => Error::Resolution(vec![Error::Other(w.message)]),
            ErrorCode::NotFound => Error::NotFound(detail),
            ErrorCode::Validation => Error::Validation(detail),
            ErrorCode::Conflict => Error::Conflict(detail),
            ErrorCode::ClaimUnavailable => Error::ClaimUnavailable(detail),
            ErrorCode::NoLeader => Error::NoLeader,
            ErrorCode::Forwarding => Error::Forwarding {
                leader: "unknown".to_string(),
                reason: w.message,
            },
            ErrorCode::Store => Error::Store(detail),
            ErrorCode::Internal => Error::Internal(detail),
        }
    }
}

impl From<bincode::Error> for Error {
    fn from(e: bincode::Error) -> Self {
        Error::Corrupted(e.to_string())
    }
}

impl From<&str> for Error {
    fn from(s: &str) -> Self {
        Error::Other(s.to_string())
    }
}

impl From<String> for Error {
    fn from(s: String) -> Self {
        Error::Other(s)
    }
}
