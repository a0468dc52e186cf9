use std::time::Duration;

use common::RequestId;
use thiserror::Error;
use transport::TransportError;

/// Errors returned to a caller awaiting a correlated response.
#[derive(Debug, Error)]
pub enum CorrelationError {
    /// No response arrived before the deadline. The pending entry has been
    /// removed; a late response will be dropped.
    #[error("No response for request {request_id} within {timeout:?}")]
    Timeout {
        request_id: RequestId,
        timeout: Duration,
    },

    /// A request with the same ID is already awaiting its response.
    #[error("Request {0} is already pending")]
    DuplicateRequest(RequestId),

    /// The request could not be published.
    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),

    /// The request could not be encoded.
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl CorrelationError {
    pub fn is_timeout(&self) -> bool {
        matches!(self, CorrelationError::Timeout { .. })
    }
}

/// Result type for correlation operations.
pub type Result<T> = std::result::Result<T, CorrelationError>;
