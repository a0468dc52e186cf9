//! Publish/subscribe transport.
//!
//! A [`TransportAdapter`] owns one broker connection, re-establishing it with
//! capped exponential backoff, and funnels every inbound message into one
//! channel that a [`Dispatcher`] consumes. Brokers are reached through a
//! [`Connector`]: [`InMemoryBroker`] in-process, [`TcpConnector`] over TCP
//! against a [`TcpBroker`].

pub mod adapter;
pub mod connector;
pub mod dispatcher;
pub mod error;
pub mod memory;
pub mod message;
pub mod tcp;

pub use adapter::{TransportAdapter, TransportConfig};
pub use connector::{Connection, Connector, Publish};
pub use dispatcher::{Dispatcher, MessageHandler};
pub use error::{Result, TransportError};
pub use memory::InMemoryBroker;
pub use message::{Message, TopicFilter};
pub use tcp::{FrameCodec, TcpBroker, TcpConnector};
