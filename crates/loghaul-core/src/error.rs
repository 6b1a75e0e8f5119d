//! Error types for loghaul
//!
//! One structured error enum shared across the shipper. The variants mirror
//! how failures are routed: parse errors fall back to a default partition,
//! transient errors are retried with backoff, invariant violations are bugs
//! and abort the process.

use thiserror::Error;

/// Result type alias for shipper operations
pub type Result<T> = std::result::Result<T, ShipperError>;

/// Main error type for the shipper
#[derive(Error, Debug)]
pub enum ShipperError {
    /// Configuration error (fatal at startup)
    #[error("configuration error: {0}")]
    Config(String),

    /// Message parse failure (non-fatal, routed to the fallback partition)
    #[error("parse error: {0}")]
    Parse(String),

    /// A local or remote path that does not follow the log-file layout
    #[error("malformed path: {0}")]
    MalformedPath(String),

    /// Record framing error while reading a log file
    #[error("framing error: {0}")]
    Framing(String),

    /// Missing or incompatible record schema (fatal for that topic)
    #[error("schema error: {0}")]
    Schema(String),

    /// Transient error that may succeed on retry
    #[error("transient error (retryable): {0}")]
    Transient(String),

    /// Upload to the blob store failed
    #[error("upload error: {0}")]
    Upload(String),

    /// Offset store read or write failed
    #[error("offset store error: {0}")]
    OffsetStore(String),

    /// Broken internal invariant (a bug, fatal process-wide)
    #[error("invariant violation: {0}")]
    Invariant(String),

    /// IO error
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON error
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),

    /// YAML error
    #[error("yaml error: {0}")]
    Yaml(#[from] serde_yaml::Error),
}

impl ShipperError {
    /// Check if this error is retryable
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::Transient(_) | Self::Upload(_) | Self::OffsetStore(_)
        )
    }

    /// Create a configuration error
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }

    /// Create a parse error
    pub fn parse(msg: impl Into<String>) -> Self {
        Self::Parse(msg.into())
    }

    /// Create a malformed path error
    pub fn malformed_path(msg: impl Into<String>) -> Self {
        Self::MalformedPath(msg.into())
    }

    /// Create a framing error
    pub fn framing(msg: impl Into<String>) -> Self {
        Self::Framing(msg.into())
    }

    /// Create a transient error
    pub fn transient(msg: impl Into<String>) -> Self {
        Self::Transient(msg.into())
    }

    /// Create an upload error
    pub fn upload(msg: impl Into<String>) -> Self {
        Self::Upload(msg.into())
    }

    /// Create an offset store error
    pub fn offset_store(msg: impl Into<String>) -> Self {
        Self::OffsetStore(msg.into())
    }

    /// Create an invariant violation
    pub fn invariant(msg: impl Into<String>) -> Self {
        Self::Invariant(msg.into())
    }
}
