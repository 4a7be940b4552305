//! Error types for eventline

use thiserror::Error;

/// Errors that can occur in the event delivery system
#[derive(Debug, Error)]
pub enum EventError {
    /// No broker exists for the requested handle
    #[error("No broker found for handle '{0}'")]
    NotFound(String),

    /// Backend storage failure (event query, index read, handle upsert)
    #[error("Storage error: {0}")]
    Storage(String),

    /// Subscribe failure
    #[error("Failed to subscribe consumer '{consumer}' on handle '{handle}': {reason}")]
    Subscribe {
        handle: String,
        consumer: String,
        reason: String,
    },

    /// Acknowledgement failure
    #[error("Failed to acknowledge event {number}: {reason}")]
    Ack {
        number: u64,
        reason: String,
    },

    /// Serialization/deserialization failure
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// Bounded call wait expired
    #[error("Operation timed out: {0}")]
    Timeout(String),

    /// The broker task is gone (shut down or panicked)
    #[error("Broker unavailable: {0}")]
    Closed(String),
}

/// Result type alias for event delivery operations
pub type Result<T> = std::result::Result<T, EventError>;
