use common::{RequestId, ResourceId};
use thiserror::Error;

/// Errors that can occur when interacting with a resource store.
///
/// Business refusals (taken, under maintenance, unknown id) are reported as
/// [`ReserveOutcome`](crate::ReserveOutcome) values, not errors.
#[derive(Debug, Error)]
pub enum StoreError {
    /// The resource does not exist on this node.
    #[error("Resource not found: {0}")]
    NotFound(ResourceId),

    /// The resource lock could not be acquired within the configured wait.
    #[error("Timed out waiting for the lock on resource {0}")]
    LockTimeout(ResourceId),

    /// A second active reservation record was offered for a resource.
    #[error("Resource {resource_id} already has an active reservation for request {existing}")]
    Conflict {
        resource_id: ResourceId,
        existing: RequestId,
    },

    /// The resource definition is malformed.
    #[error("Invalid resource: {0}")]
    InvalidResource(String),

    /// A database error occurred.
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    /// A database migration error occurred.
    #[error("Migration error: {0}")]
    Migration(#[from] sqlx::migrate::MigrateError),
}

/// Result type for resource store operations.
pub type Result<T> = std::result::Result<T, StoreError>;
