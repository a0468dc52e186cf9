//! Shared types for station reservation nodes and their clients.

pub mod messages;
pub mod topics;
pub mod types;

pub use messages::{ReservationRequest, ReservationResponse, ResponseStatus};
pub use types::{ClientId, NodeId, RequestId, ResourceId, ResourceRef};
