use std::time::Duration;

use thiserror::Error;

/// Errors raised by the publish/subscribe transport.
#[derive(Debug, Error)]
pub enum TransportError {
    /// No broker connection is currently established.
    #[error("Not connected to the broker")]
    NotConnected,

    /// The connection was closed while in use.
    #[error("Connection to the broker was closed")]
    Disconnected,

    /// The broker refused the connection.
    #[error("Broker refused connection: {0}")]
    ConnectionRefused(String),

    /// No connection was established within the allotted time.
    #[error("Timed out after {0:?} waiting for a broker connection")]
    ConnectTimeout(Duration),

    /// A subscription filter is malformed.
    #[error("Invalid topic filter '{filter}': {reason}")]
    InvalidFilter { filter: String, reason: String },

    /// A publish topic is empty or contains wildcards.
    #[error("Invalid topic '{0}'")]
    InvalidTopic(String),

    /// A wire frame could not be decoded.
    #[error("Malformed frame: {0}")]
    Frame(String),

    /// An I/O error occurred on the broker connection.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// A payload could not be encoded as JSON.
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Result type for transport operations.
pub type Result<T> = std::result::Result<T, TransportError>;
