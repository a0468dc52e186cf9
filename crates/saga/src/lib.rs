//! Saga coordination for multi-node station reservations.
//!
//! A reservation request may name stations owned by several nodes. The
//! coordinator reserves the local ones first, then asks each owning peer to
//! reserve its leg, and commits only if every leg succeeded:
//! 1. Reserve local legs in request order; stop at the first failure
//! 2. Reserve peer legs concurrently, bounded by the saga deadline
//! 3. Record every leg, or release every held leg if anything failed
//!
//! There is no consensus protocol behind this. A node crashing mid-saga can
//! leave a station held with no record. Peer calls whose outcome is unknown
//! are released through the owner's holder check, which frees the station
//! only if this request took it.

pub mod aggregate;
pub mod coordinator;
pub mod error;
pub mod events;
pub mod leg;
pub mod outcome;
pub mod peer;
pub mod state;

pub use aggregate::SagaInstance;
pub use coordinator::{SagaConfig, SagaCoordinator};
pub use error::{Result, SagaError};
pub use events::SagaEvent;
pub use leg::{LegOutcome, LegState, ReservationLeg};
pub use outcome::ReservationOutcome;
pub use peer::{
    ConfirmReply, Confirmation, HttpPeerClient, HttpPeerConfig, InMemoryPeerClient, PeerCall,
    PeerClient, PeerError, ReleaseBody, ReleaseReply, ReserveBody, ReserveReply,
};
pub use state::SagaState;
