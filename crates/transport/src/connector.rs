use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::mpsc;

use crate::{Message, Result, TopicFilter};

/// Outbound half of a broker connection.
#[async_trait]
pub trait Publish: Send + Sync {
    /// Sends a message to the broker. Fails with `Disconnected` once the
    /// connection is gone.
    async fn publish(&self, message: Message) -> Result<()>;
}

/// An established broker connection.
///
/// The inbound receiver yields every message matching the subscriptions
/// given at connect time and closes when the connection ends.
pub struct Connection {
    pub publisher: Arc<dyn Publish>,
    pub inbound: mpsc::Receiver<Message>,
}

/// Opens broker connections. The adapter calls this again after every
/// disconnect, so implementations must be able to connect repeatedly.
#[async_trait]
pub trait Connector: Send + Sync {
    async fn connect(&self, client_id: &str, subscriptions: &[TopicFilter]) -> Result<Connection>;
}

#[async_trait]
impl<T: Connector + ?Sized> Connector for Arc<T> {
    async fn connect(&self, client_id: &str, subscriptions: &[TopicFilter]) -> Result<Connection> {
        (**self).connect(client_id, subscriptions).await
    }
}
