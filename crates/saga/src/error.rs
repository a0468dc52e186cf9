//! Saga error types.

use common::RequestId;
use resource_store::StoreError;
use thiserror::Error;

use crate::state::SagaState;

/// Errors surfaced synchronously by the coordinator.
///
/// Per-leg failures are never errors: they are captured as leg outcomes and
/// folded into the commit/compensate decision.
#[derive(Debug, Error)]
pub enum SagaError {
    /// The request is malformed. Nothing was reserved.
    #[error("Invalid reservation request: {0}")]
    Validation(String),

    /// A saga with this request ID already exists.
    #[error("Request {0} has already been received")]
    DuplicateRequest(RequestId),

    /// No saga with this request ID exists.
    #[error("Saga not found: {0}")]
    NotFound(RequestId),

    /// Saga is in an invalid state for the requested operation.
    #[error("Invalid saga state: expected {expected}, actual {actual}")]
    InvalidState {
        expected: String,
        actual: SagaState,
    },

    /// Another cancellation of the same request is still running.
    #[error("Cancellation of request {0} is already in progress")]
    CancellationInProgress(RequestId),

    /// The local store failed outside a leg, e.g. while cancelling records.
    #[error("Store error: {0}")]
    Store(#[from] StoreError),
}

impl SagaError {
    /// Returns true if the caller sent something the coordinator refuses,
    /// as opposed to an internal failure.
    pub fn is_client_error(&self) -> bool {
        matches!(
            self,
            SagaError::Validation(_)
                | SagaError::DuplicateRequest(_)
                | SagaError::NotFound(_)
                | SagaError::CancellationInProgress(_)
        )
    }
}

/// Convenience type alias for saga results.
pub type Result<T> = std::result::Result<T, SagaError>;
