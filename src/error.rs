//! Relay Error Types
//!
//! This module defines every error an invocation, the bucket store, or the
//! response channel can surface.

use std::time::Duration;

use crate::relay::envelope::CorrelationId;

/// Error types for relay operations
#[derive(Debug, thiserror::Error)]
pub enum RelayError {
    /// Bucket has no capacity right now (transient, retried by admission)
    #[error("Admission denied for bucket {bucket_id}, retry after {retry_after:?}")]
    AdmissionDenied {
        bucket_id: String,
        retry_after: Duration,
    },

    /// Queue transport rejected or never acknowledged the envelope
    #[error("Relay unavailable: {0}")]
    RelayUnavailable(String),

    /// Correlation id already registered in the table
    #[error("Duplicate correlation id: {0}")]
    DuplicateCorrelationId(CorrelationId),

    /// Deadline elapsed before a response arrived
    #[error("Request {0} timed out after {1}ms")]
    Timeout(CorrelationId, u64),

    /// Cancellation token fired
    #[error("Request cancelled")]
    Cancelled,

    /// The remote call itself failed
    #[error("Remote failure (status {status_code:?}): {detail}")]
    RemoteFailure {
        status_code: Option<u16>,
        detail: String,
    },

    /// The remote API rate limited the executed call
    #[error("Remote rate limited, retry after {retry_after:?}")]
    RemoteRateLimited { retry_after: Option<Duration> },

    /// Bucket store failure
    #[error("Bucket store error: {0}")]
    Store(String),

    /// Malformed frame on the response channel
    #[error("Frame error: {0}")]
    Frame(String),

    /// Envelope (de)serialization failure
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// Network error
    #[error("Network error: {0}")]
    Network(String),

    /// Invalid configuration
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),
}

impl RelayError {
    /// Label used for the invocation outcome metric
    pub fn outcome_label(&self) -> &'static str {
        match self {
            RelayError::AdmissionDenied { .. } => "admission_denied",
            RelayError::RelayUnavailable(_) => "send_failed",
            RelayError::DuplicateCorrelationId(_) => "duplicate_id",
            RelayError::Timeout(..) => "timed_out",
            RelayError::Cancelled => "cancelled",
            RelayError::RemoteFailure { .. } => "remote_failure",
            RelayError::RemoteRateLimited { .. } => "remote_rate_limited",
            RelayError::Store(_) => "store_error",
            RelayError::Frame(_) | RelayError::Serialization(_) | RelayError::Network(_) => {
                "transport_error"
            }
            RelayError::InvalidConfig(_) => "invalid_config",
        }
    }
}

impl From<std::io::Error> for RelayError {
    fn from(err: std::io::Error) -> Self {
        RelayError::Network(err.to_string())
    }
}

impl From<rusqlite::Error> for RelayError {
    fn from(err: rusqlite::Error) -> Self {
        RelayError::Store(err.to_string())
    }
}

impl From<serde_json::Error> for RelayError {
    fn from(err: serde_json::Error) -> Self {
        RelayError::Serialization(err.to_string())
    }
}

/// Result alias for relay operations
pub type Result<T> = std::result::Result<T, RelayError>;
