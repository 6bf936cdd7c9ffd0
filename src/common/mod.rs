//! Common utilities and types shared across volplane

pub mod audit;
pub mod config;
pub mod error;
pub mod metrics;

pub use audit::{AuditEventType, AuditLogger};
pub use config::{Config, PeerConfig, QueryConfig};
pub use error::{Error, ErrorCode, Result, WireError};
pub use metrics::{MetricsRegistry, MetricsTimer};
