//! Request/response correlation over publish/subscribe.
//!
//! A [`RequestCorrelator`] registers a waiter under the request's ID, then
//! publishes. Responses are routed back by the process's inbound dispatcher
//! through [`RequestCorrelator::handle_inbound`]. Each request ends exactly
//! once, with its response or with [`CorrelationError::Timeout`].

pub mod client;
pub mod correlator;
pub mod error;
pub mod table;

pub use client::ReservationClient;
pub use correlator::{Correlated, CorrelatorConfig, RequestCorrelator};
pub use error::{CorrelationError, Result};
pub use table::{CorrelationTable, Resolution};
