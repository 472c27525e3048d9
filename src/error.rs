//! Error types for lanscan.

use std::time::Duration;

use uuid::Uuid;

/// Top-level error type.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Database error: {0}")]
    Database(#[from] DatabaseError),

    #[error("Scan error: {0}")]
    Scan(#[from] ScanError),

    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),
}

/// Configuration-related errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Invalid configuration value for {key}: {message}")]
    InvalidValue { key: String, message: String },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Database-related errors.
#[derive(Debug, thiserror::Error)]
pub enum DatabaseError {
    #[error("Connection error: {0}")]
    Pool(String),

    #[error("Query failed: {0}")]
    Query(String),

    #[error("Constraint violation: {0}")]
    Constraint(String),

    #[error("Migration failed: {0}")]
    Migration(String),

    #[error("Serialization error: {0}")]
    Serialization(String),
}

/// Errors surfaced synchronously by the scan coordinator.
///
/// Worker-side failures (`worker_unreachable`, `timeout`) are never returned
/// here; they only show up as a job's terminal status and its `scan_status`
/// event.
#[derive(Debug, thiserror::Error)]
pub enum ScanError {
    #[error("Invalid scan request: {0}")]
    Validation(String),

    #[error("User {user} is not allowed to {action}")]
    Forbidden { user: String, action: &'static str },

    #[error("Scan {active} is already active for scope {scope}")]
    Conflict { scope: String, active: Uuid },

    #[error("Scan {id} not found")]
    NotFound { id: Uuid },

    #[error("Scan {id} has no result in status {status}")]
    NoResult { id: Uuid, status: String },

    #[error("Storage failure: {0}")]
    Database(#[from] DatabaseError),
}

/// Worker control-channel errors.
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("Worker transport unavailable")]
    TransportUnavailable,

    #[error("Send to worker timed out after {0:?}")]
    SendTimeout(Duration),

    #[error("Failed to encode worker command: {0}")]
    Encode(#[from] serde_json::Error),

    #[error("Worker event stream already taken")]
    StreamTaken,

    #[error("Connection failed: {0}")]
    Connect(String),
}

/// Reasons recorded on jobs that end in `failed`.
pub mod reason {
    /// Start command could not be delivered after all retries.
    pub const WORKER_UNREACHABLE: &str = "worker_unreachable";
    /// Watchdog fired on a silent running job.
    pub const TIMEOUT: &str = "timeout";
    /// Job was left active by a previous coordinator process.
    pub const COORDINATOR_RESTART: &str = "coordinator_restart";
}

/// Result type alias.
pub type Result<T> = std::result::Result<T, Error>;
