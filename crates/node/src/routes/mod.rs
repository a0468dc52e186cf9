pub mod ops;
pub mod reservations;
pub mod resources;
