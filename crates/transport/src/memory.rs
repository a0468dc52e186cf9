//! In-process broker.
//!
//! Used directly by tests and as the routing core of [`TcpBroker`](crate::TcpBroker).

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::{RwLock, mpsc};

use crate::connector::{Connection, Connector, Publish};
use crate::message::validate_topic;
use crate::{Message, Result, TopicFilter, TransportError};

/// Capacity of each session's delivery queue.
pub const SESSION_CAPACITY: usize = 256;

pub type SessionId = u64;

struct Session {
    client_id: String,
    filters: Vec<TopicFilter>,
    tx: mpsc::Sender<Message>,
}

#[derive(Default)]
struct BrokerState {
    sessions: HashMap<SessionId, Session>,
    next_session: SessionId,
    offline: bool,
    published: u64,
}

/// Routes published messages to every session whose filters match.
///
/// Delivery is at-most-once: messages published while nobody is subscribed
/// are dropped, and nothing is retained.
#[derive(Clone, Default)]
pub struct InMemoryBroker {
    state: Arc<RwLock<BrokerState>>,
}

impl InMemoryBroker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a session and returns its ID and delivery queue.
    pub async fn open_session(
        &self,
        client_id: &str,
        filters: Vec<TopicFilter>,
    ) -> Result<(SessionId, mpsc::Receiver<Message>)> {
        let mut state = self.state.write().await;
        if state.offline {
            return Err(TransportError::ConnectionRefused(
                "broker is offline".to_string(),
            ));
        }

        let (tx, rx) = mpsc::channel(SESSION_CAPACITY);
        let id = state.next_session;
        state.next_session += 1;
        state.sessions.insert(
            id,
            Session {
                client_id: client_id.to_string(),
                filters,
                tx,
            },
        );
        tracing::debug!(session_id = id, client_id, "Session opened");
        Ok((id, rx))
    }

    /// Adds a filter to an open session.
    pub async fn subscribe(&self, session: SessionId, filter: TopicFilter) -> Result<()> {
        let mut state = self.state.write().await;
        let session = state
            .sessions
            .get_mut(&session)
            .ok_or(TransportError::Disconnected)?;
        session.filters.push(filter);
        Ok(())
    }

    /// Removes a session; its delivery queue closes.
    pub async fn close_session(&self, session: SessionId) {
        if self.state.write().await.sessions.remove(&session).is_some() {
            tracing::debug!(session_id = session, "Session closed");
        }
    }

    async fn is_open(&self, session: SessionId) -> bool {
        self.state.read().await.sessions.contains_key(&session)
    }

    /// Delivers a message to every matching session and returns how many
    /// sessions received it.
    pub async fn publish(&self, message: Message) -> Result<usize> {
        validate_topic(&message.topic)?;

        let targets: Vec<(SessionId, mpsc::Sender<Message>)> = {
            let mut state = self.state.write().await;
            state.published += 1;
            state
                .sessions
                .iter()
                .filter(|(_, s)| s.filters.iter().any(|f| f.matches(&message.topic)))
                .map(|(id, s)| (*id, s.tx.clone()))
                .collect()
        };

        let mut delivered = 0;
        let mut gone = Vec::new();
        for (id, tx) in targets {
            match tx.send(message.clone()).await {
                Ok(()) => delivered += 1,
                Err(_) => gone.push(id),
            }
        }

        for id in gone {
            self.close_session(id).await;
        }

        tracing::trace!(topic = %message.topic, delivered, "Message routed");
        Ok(delivered)
    }

    /// Drops every session of `client_id`, as a broker restart or network
    /// partition would.
    pub async fn disconnect(&self, client_id: &str) -> usize {
        let mut state = self.state.write().await;
        let before = state.sessions.len();
        state.sessions.retain(|_, s| s.client_id != client_id);
        before - state.sessions.len()
    }

    /// While offline, new connections are refused. Going offline also drops
    /// every existing session.
    pub async fn set_offline(&self, offline: bool) {
        let mut state = self.state.write().await;
        state.offline = offline;
        if offline {
            state.sessions.clear();
        }
    }

    pub async fn session_count(&self) -> usize {
        self.state.read().await.sessions.len()
    }

    /// Number of sessions currently open for `client_id`.
    pub async fn sessions_for(&self, client_id: &str) -> usize {
        self.state
            .read()
            .await
            .sessions
            .values()
            .filter(|s| s.client_id == client_id)
            .count()
    }

    /// Total messages accepted for routing since creation.
    pub async fn published_count(&self) -> u64 {
        self.state.read().await.published
    }
}

struct BrokerPublisher {
    broker: InMemoryBroker,
    session: SessionId,
}

#[async_trait]
impl Publish for BrokerPublisher {
    async fn publish(&self, message: Message) -> Result<()> {
        if !self.broker.is_open(self.session).await {
            return Err(TransportError::Disconnected);
        }
        self.broker.publish(message).await.map(|_| ())
    }
}

#[async_trait]
impl Connector for InMemoryBroker {
    async fn connect(&self, client_id: &str, subscriptions: &[TopicFilter]) -> Result<Connection> {
        let (session, inbound) = self.open_session(client_id, subscriptions.to_vec()).await?;
        Ok(Connection {
            publisher: Arc::new(BrokerPublisher {
                broker: self.clone(),
                session,
            }),
            inbound,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn filters(list: &[&str]) -> Vec<TopicFilter> {
        list.iter().map(|f| TopicFilter::parse(f).unwrap()).collect()
    }

    #[tokio::test]
    async fn routes_only_to_matching_sessions() {
        let broker = InMemoryBroker::new();
        let mut a = broker
            .connect("a", &filters(&["responses/a"]))
            .await
            .unwrap();
        let mut b = broker
            .connect("b", &filters(&["nodes/+/reservations/request"]))
            .await
            .unwrap();

        a.publisher
            .publish(Message::new("nodes/node-1/reservations/request", "hi"))
            .await
            .unwrap();

        let got = b.inbound.recv().await.unwrap();
        assert_eq!(got.topic, "nodes/node-1/reservations/request");
        assert!(a.inbound.try_recv().is_err());
    }

    #[tokio::test]
    async fn unmatched_publish_is_dropped() {
        let broker = InMemoryBroker::new();
        let delivered = broker.publish(Message::new("nobody/home", "x")).await.unwrap();
        assert_eq!(delivered, 0);
        assert_eq!(broker.published_count().await, 1);
    }

    #[tokio::test]
    async fn disconnect_closes_inbound_and_publisher() {
        let broker = InMemoryBroker::new();
        let mut conn = broker.connect("a", &filters(&["x"])).await.unwrap();

        assert_eq!(broker.disconnect("a").await, 1);
        assert!(conn.inbound.recv().await.is_none());
        assert!(matches!(
            conn.publisher.publish(Message::new("x", "y")).await,
            Err(TransportError::Disconnected)
        ));
    }

    #[tokio::test]
    async fn offline_refuses_connections() {
        let broker = InMemoryBroker::new();
        let _conn = broker.connect("a", &filters(&["x"])).await.unwrap();

        broker.set_offline(true).await;
        assert_eq!(broker.session_count().await, 0);
        assert!(matches!(
            broker.connect("a", &[]).await,
            Err(TransportError::ConnectionRefused(_))
        ));

        broker.set_offline(false).await;
        assert!(broker.connect("a", &[]).await.is_ok());
    }

    #[tokio::test]
    async fn rejects_wildcard_publish() {
        let broker = InMemoryBroker::new();
        assert!(matches!(
            broker.publish(Message::new("responses/+", "x")).await,
            Err(TransportError::InvalidTopic(_))
        ));
    }

    #[tokio::test]
    async fn subscribe_after_open() {
        let broker = InMemoryBroker::new();
        let (session, mut rx) = broker.open_session("a", Vec::new()).await.unwrap();
        broker
            .subscribe(session, TopicFilter::parse("t/#").unwrap())
            .await
            .unwrap();
        broker.publish(Message::new("t/1", "x")).await.unwrap();
        assert_eq!(rx.recv().await.unwrap().topic, "t/1");
    }
}
