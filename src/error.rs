// error.rs - Centralized error handling using thiserror

use serde::{Deserialize, Serialize};

/// Crate-wide Result type
pub type Result<T> = std::result::Result<T, Error>;

/// Main error type for the replication engine
///
/// Uses thiserror for ergonomic error handling and automatic Display impl.
/// All errors are serializable so they can travel on the engine state stream.
#[derive(Debug, Clone, thiserror::Error, Serialize, Deserialize)]
#[serde(tag = "type", content = "message")]
pub enum Error {
    #[error("Network error: {0}")]
    Network(String),

    #[error("Request timed out: {0}")]
    Timeout(String),

    #[error("Protocol version mismatch: {0}")]
    VersionMismatch(String),

    #[error("Authentication failed: {0}")]
    Auth(String),

    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    #[error("Rate limited: {0}")]
    RateLimited(String),

    #[error("Storage error: {0}")]
    Storage(String),

    #[error("Wire format error: {0}")]
    Format(String),

    #[error("Invalid state: {0}")]
    State(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Unknown database: {0}")]
    UnknownDatabase(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl Error {
    /// True for errors the sync engine must not retry automatically:
    /// version/auth rejections, malformed traffic, and storage faults
    /// (a broken local disk does not heal under backoff).
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            Error::VersionMismatch(_)
                | Error::Auth(_)
                | Error::InvalidRequest(_)
                | Error::Format(_)
                | Error::Storage(_)
                | Error::Config(_)
        )
    }

    /// True for transient errors worth another attempt after backoff.
    /// Exact complement of `is_fatal`; every error is one or the other.
    pub fn is_retryable(&self) -> bool {
        !self.is_fatal()
    }

    /// The wire-level code carried in an ErrorResponse.
    pub fn code(&self) -> SyncErrorCode {
        match self {
            Error::Network(_) => SyncErrorCode::NetworkError,
            Error::Timeout(_) => SyncErrorCode::Timeout,
            Error::VersionMismatch(_) => SyncErrorCode::VersionMismatch,
            Error::Auth(_) => SyncErrorCode::AuthenticationFailed,
            Error::InvalidRequest(_) | Error::Format(_) => SyncErrorCode::InvalidRequest,
            Error::RateLimited(_) => SyncErrorCode::RateLimited,
            Error::Storage(_) => SyncErrorCode::StorageError,
            Error::UnknownDatabase(_) => SyncErrorCode::UnknownDatabase,
            Error::State(_) | Error::Config(_) | Error::Internal(_) => SyncErrorCode::Internal,
        }
    }
}

/// Typed error codes exchanged on the wire.
///
/// `StateLost` is reserved for deployments that truncate the oplog: a pull
/// below the retention floor must fail with it so clients can rebase.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum SyncErrorCode {
    NetworkError,
    Timeout,
    VersionMismatch,
    AuthenticationFailed,
    Conflict,
    InvalidRequest,
    RateLimited,
    StorageError,
    UnknownDatabase,
    StateLost,
    Internal,
}

impl SyncErrorCode {
    /// Stable string form used inside wire maps.
    pub fn as_str(&self) -> &'static str {
        match self {
            SyncErrorCode::NetworkError => "networkError",
            SyncErrorCode::Timeout => "timeout",
            SyncErrorCode::VersionMismatch => "versionMismatch",
            SyncErrorCode::AuthenticationFailed => "authenticationFailed",
            SyncErrorCode::Conflict => "conflict",
            SyncErrorCode::InvalidRequest => "invalidRequest",
            SyncErrorCode::RateLimited => "rateLimited",
            SyncErrorCode::StorageError => "storageError",
            SyncErrorCode::UnknownDatabase => "unknownDatabase",
            SyncErrorCode::StateLost => "stateLost",
            SyncErrorCode::Internal => "internal",
        }
    }

    /// Parses the stable string form back into a code.
    pub fn parse(s: &str) -> Option<Self> {
        Some(match s {
            "networkError" => SyncErrorCode::NetworkError,
            "timeout" => SyncErrorCode::Timeout,
            "versionMismatch" => SyncErrorCode::VersionMismatch,
            "authenticationFailed" => SyncErrorCode::AuthenticationFailed,
            "conflict" => SyncErrorCode::Conflict,
            "invalidRequest" => SyncErrorCode::InvalidRequest,
            "rateLimited" => SyncErrorCode::RateLimited,
            "storageError" => SyncErrorCode::StorageError,
            "unknownDatabase" => SyncErrorCode::UnknownDatabase,
            "stateLost" => SyncErrorCode::StateLost,
            "internal" => SyncErrorCode::Internal,
            _ => return None,
        })
    }
}

impl From<std::io::Error> for Error {
    fn from(err: std::io::Error) -> Self {
        Error::Storage(err.to_string())
    }
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Error::Storage(err.to_string())
    }
}

impl From<reqwest::Error> for Error {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            Error::Timeout(err.to_string())
        } else {
            Error::Network(err.to_string())
        }
    }
}
