//! NetState Error Types

use thiserror::Error;

/// Result type alias for NetState operations
pub type Result<T> = std::result::Result<T, Error>;

/// NetState error types
#[derive(Error, Debug)]
pub enum Error {
    // Configuration errors
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Invalid configuration file: {0}")]
    ConfigParse(#[from] toml::de::Error),

    // Encoding errors
    #[error("Serialization error: {0}")]
    Serialization(#[from] bincode::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    // Mastership errors
    #[error("No master known for device {0}")]
    NoMaster(String),

    #[error("Not master for device {device}: current master is {master}")]
    NotMaster { device: String, master: String },

    #[error("Timestamp unavailable for device {0}")]
    TimestampUnavailable(String),

    // Network errors
    #[error("Network error: {0}")]
    Network(String),

    #[error("Connection failed to {address}: {reason}")]
    ConnectionFailed { address: String, reason: String },

    #[error("Connection timeout to {0}")]
    ConnectionTimeout(String),

    // Cluster errors
    #[error("Node not found: {0}")]
    NodeNotFound(String),

    // Store errors
    #[error("Group not found: {0}")]
    GroupNotFound(String),

    #[error("Store invariant violated: {0}")]
    InvariantViolation(String),

    // I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    // Internal errors
    #[error("Internal error: {0}")]
    Internal(String),

    #[error("Shutdown in progress")]
    ShuttingDown,
}

impl Error {
    /// Check if the failed operation may succeed when resubmitted later
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Error::NoMaster(_)
                | Error::TimestampUnavailable(_)
                | Error::ConnectionTimeout(_)
                | Error::ConnectionFailed { .. }
                | Error::Network(_)
        )
    }
}
