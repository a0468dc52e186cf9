//! Reconnecting wrapper around a broker connection.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::Serialize;
use tokio::sync::{RwLock, mpsc, watch};
use tokio_util::sync::CancellationToken;

use crate::connector::{Connector, Publish};
use crate::message::validate_topic;
use crate::{Message, Result, TopicFilter, TransportError};

/// Settings for a [`TransportAdapter`].
#[derive(Debug, Clone)]
pub struct TransportConfig {
    /// Identity presented to the broker.
    pub client_id: String,
    /// Filters subscribed on every (re)connect.
    pub subscriptions: Vec<TopicFilter>,
    /// Capacity of the inbound channel handed to the caller.
    pub inbound_capacity: usize,
    /// Delay before the first reconnect attempt; doubled after each failure.
    pub initial_backoff: Duration,
    /// Upper bound for the reconnect delay.
    pub max_backoff: Duration,
    /// Time allowed for a single connect attempt.
    pub connect_timeout: Duration,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            client_id: "client".to_string(),
            subscriptions: Vec::new(),
            inbound_capacity: 1024,
            initial_backoff: Duration::from_millis(50),
            max_backoff: Duration::from_secs(5),
            connect_timeout: Duration::from_secs(3),
        }
    }
}

impl TransportConfig {
    pub fn new(client_id: impl Into<String>) -> Self {
        Self {
            client_id: client_id.into(),
            ..Self::default()
        }
    }

    pub fn subscribe(mut self, filter: TopicFilter) -> Self {
        self.subscriptions.push(filter);
        self
    }
}

struct Inner {
    client_id: String,
    publisher: RwLock<Option<Arc<dyn Publish>>>,
    connected: watch::Sender<bool>,
    shutdown: CancellationToken,
}

/// Owns the broker connection for one process.
///
/// Inbound messages from every connection the adapter ever opens are funneled
/// into the single receiver returned by [`start`](Self::start). Publishing
/// while disconnected fails fast with `NotConnected`; nothing is buffered.
#[derive(Clone)]
pub struct TransportAdapter {
    inner: Arc<Inner>,
}

enum ConnectionEnd {
    Lost,
    Shutdown,
}

impl TransportAdapter {
    /// Spawns the connection task and returns immediately. Use
    /// [`wait_connected`](Self::wait_connected) to block until the first
    /// connection is up.
    pub fn start<C>(connector: C, config: TransportConfig) -> (Self, mpsc::Receiver<Message>)
    where
        C: Connector + 'static,
    {
        let (inbound_tx, inbound_rx) = mpsc::channel(config.inbound_capacity.max(1));
        let (connected, _) = watch::channel(false);
        let adapter = Self {
            inner: Arc::new(Inner {
                client_id: config.client_id.clone(),
                publisher: RwLock::new(None),
                connected,
                shutdown: CancellationToken::new(),
            }),
        };

        tokio::spawn(adapter.clone().connection_loop(connector, config, inbound_tx));
        (adapter, inbound_rx)
    }

    pub fn client_id(&self) -> &str {
        &self.inner.client_id
    }

    pub fn is_connected(&self) -> bool {
        *self.inner.connected.borrow()
    }

    /// Waits until a connection is established.
    pub async fn wait_connected(&self, timeout: Duration) -> Result<()> {
        let mut rx = self.inner.connected.subscribe();
        match tokio::time::timeout(timeout, rx.wait_for(|connected| *connected)).await {
            Ok(Ok(_)) => Ok(()),
            Ok(Err(_)) => Err(TransportError::Disconnected),
            Err(_) => Err(TransportError::ConnectTimeout(timeout)),
        }
    }

    #[tracing::instrument(skip(self, message), fields(topic = %message.topic, client_id = %self.inner.client_id))]
    pub async fn publish(&self, message: Message) -> Result<()> {
        validate_topic(&message.topic)?;

        let publisher = self
            .inner
            .publisher
            .read()
            .await
            .clone()
            .ok_or(TransportError::NotConnected)?;

        publisher.publish(message).await.inspect_err(|e| {
            metrics::counter!("transport_publish_failures_total").increment(1);
            tracing::warn!(error = %e, "Publish failed");
        })
    }

    pub async fn publish_json<T: Serialize>(&self, topic: &str, value: &T) -> Result<()> {
        self.publish(Message::json(topic, value)?).await
    }

    /// Stops the connection task. Publishing fails with `NotConnected`
    /// afterwards and the inbound receiver closes.
    pub fn shutdown(&self) {
        self.inner.shutdown.cancel();
    }

    pub fn is_shutdown(&self) -> bool {
        self.inner.shutdown.is_cancelled()
    }

    async fn set_publisher(&self, publisher: Option<Arc<dyn Publish>>) {
        let up = publisher.is_some();
        *self.inner.publisher.write().await = publisher;
        self.inner.connected.send_replace(up);
    }

    async fn connection_loop<C: Connector>(
        self,
        connector: C,
        config: TransportConfig,
        inbound_tx: mpsc::Sender<Message>,
    ) {
        let shutdown = self.inner.shutdown.clone();
        let mut backoff = config.initial_backoff;
        let mut has_connected = false;

        loop {
            let attempt = tokio::time::timeout(
                config.connect_timeout,
                connector.connect(&config.client_id, &config.subscriptions),
            );
            let result = tokio::select! {
                _ = shutdown.cancelled() => break,
                result = attempt => result,
            };

            match result {
                Ok(Ok(connection)) => {
                    if has_connected {
                        metrics::counter!("transport_reconnects_total").increment(1);
                    }
                    has_connected = true;
                    backoff = config.initial_backoff;

                    tracing::info!(client_id = %config.client_id, "Connected to broker");
                    self.set_publisher(Some(connection.publisher)).await;

                    let end = forward(connection.inbound, &inbound_tx, &shutdown).await;
                    self.set_publisher(None).await;

                    match end {
                        ConnectionEnd::Shutdown => break,
                        ConnectionEnd::Lost => {
                            tracing::warn!(client_id = %config.client_id, "Broker connection lost");
                        }
                    }
                }
                Ok(Err(e)) => {
                    metrics::counter!("transport_connect_failures_total").increment(1);
                    tracing::warn!(
                        client_id = %config.client_id,
                        error = %e,
                        retry_in_ms = backoff.as_millis() as u64,
                        "Broker connect failed"
                    );
                }
                Err(_) => {
                    metrics::counter!("transport_connect_failures_total").increment(1);
                    tracing::warn!(
                        client_id = %config.client_id,
                        timeout_ms = config.connect_timeout.as_millis() as u64,
                        "Broker connect timed out"
                    );
                }
            }

            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = tokio::time::sleep(backoff) => {}
            }
            backoff = (backoff * 2).min(config.max_backoff);
        }

        self.set_publisher(None).await;
        tracing::info!(client_id = %config.client_id, "Transport stopped");
    }
}

#[async_trait]
impl Publish for TransportAdapter {
    async fn publish(&self, message: Message) -> Result<()> {
        TransportAdapter::publish(self, message).await
    }
}

async fn forward(
    mut inbound: mpsc::Receiver<Message>,
    out: &mpsc::Sender<Message>,
    shutdown: &CancellationToken,
) -> ConnectionEnd {
    let mut consumer_alive = true;
    loop {
        tokio::select! {
            _ = shutdown.cancelled() => return ConnectionEnd::Shutdown,
            message = inbound.recv() => match message {
                Some(message) => {
                    if consumer_alive && out.send(message).await.is_err() {
                        // Publish-only users may drop the receiver.
                        tracing::debug!("Inbound receiver dropped; discarding deliveries");
                        consumer_alive = false;
                    }
                }
                None => return ConnectionEnd::Lost,
            },
        }
    }
}
