//! Error types shared across the fleet

use thiserror::Error;

/// Result type alias for zen operations
pub type Result<T> = std::result::Result<T, ZenError>;

/// Main error type for zen
#[derive(Error, Debug)]
pub enum ZenError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Database error: {0}")]
    Database(String),

    /// Pool acquire timed out. Callers back off and retry.
    #[error("Connection pool exhausted: {0}")]
    ConnectionExhausted(String),

    /// The partition key a process computed for `link` differs from the
    /// pinned one. Never retried: writing it would break `(link, partition_key)`
    /// uniqueness.
    #[error("Partition key mismatch for {link}: expected {expected}, got {actual}")]
    PartitionKeyMismatch {
        link: String,
        expected: i32,
        actual: i32,
    },

    #[error("Invalid link: {0:?}")]
    InvalidLink(String),

    /// A background task panicked or was cancelled unexpectedly
    #[error("Internal error: {0}")]
    Internal(String),
}

impl ZenError {
    /// Whether retrying the same operation later can succeed.
    pub fn is_recoverable(&self) -> bool {
        !matches!(
            self,
            ZenError::PartitionKeyMismatch { .. }
                | ZenError::Config(_)
                | ZenError::InvalidLink(_)
                | ZenError::Internal(_)
        )
    }
}
