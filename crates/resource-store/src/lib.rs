//! Per-node authoritative store of reservable stations.
//!
//! The store is the only writer of station availability. Its central
//! operation, [`ResourceStore::check_and_reserve`], reads and flips
//! availability inside one critical section scoped to the station, so two
//! callers can never both observe the station as free.

pub mod error;
pub mod memory;
pub mod postgres;
pub mod resource;
pub mod store;

pub use error::{Result, StoreError};
pub use memory::InMemoryResourceStore;
pub use postgres::PostgresResourceStore;
pub use resource::{
    RecordStatus, ReleaseOutcome, ReservationFilter, ReservationRecord, ReserveOutcome, Resource,
    ResourceFilter,
};
pub use store::ResourceStore;
