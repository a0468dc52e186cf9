//! Awaitable request/response over fire-and-forget publish.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::Duration;

use common::{RequestId, ReservationRequest, ReservationResponse};
use serde::Serialize;
use serde::de::DeserializeOwned;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use transport::{Message, Publish};

use crate::error::{CorrelationError, Result};
use crate::table::{CorrelationTable, Resolution};

/// A message that carries a correlation key.
pub trait Correlated {
    fn request_id(&self) -> &RequestId;

    /// Replaces the key. Only called on outgoing requests whose key is blank.
    fn set_request_id(&mut self, request_id: RequestId);
}

impl Correlated for ReservationRequest {
    fn request_id(&self) -> &RequestId {
        &self.request_id
    }

    fn set_request_id(&mut self, request_id: RequestId) {
        self.request_id = request_id;
    }
}

impl Correlated for ReservationResponse {
    fn request_id(&self) -> &RequestId {
        &self.request_id
    }

    fn set_request_id(&mut self, request_id: RequestId) {
        self.request_id = request_id;
    }
}

/// Settings for a [`RequestCorrelator`].
#[derive(Debug, Clone)]
pub struct CorrelatorConfig {
    /// Wait used when the caller does not pass one.
    pub default_timeout: Duration,
    /// Period of the background sweep for abandoned entries.
    pub sweep_interval: Duration,
}

impl Default for CorrelatorConfig {
    fn default() -> Self {
        Self {
            default_timeout: Duration::from_secs(30),
            sweep_interval: Duration::from_secs(1),
        }
    }
}

type SharedTable<R> = Arc<Mutex<CorrelationTable<R>>>;

fn lock<R>(table: &Mutex<CorrelationTable<R>>) -> MutexGuard<'_, CorrelationTable<R>> {
    // The table holds no invariant a panicking holder could break halfway.
    table.lock().unwrap_or_else(PoisonError::into_inner)
}

fn record_pending(len: usize) {
    metrics::gauge!("correlator_pending").set(len as f64);
}

/// Removes the caller's entry if its future is dropped before completion.
struct PendingGuard<R> {
    table: SharedTable<R>,
    request_id: RequestId,
    armed: bool,
}

impl<R> PendingGuard<R> {
    fn disarm(&mut self) {
        self.armed = false;
    }
}

impl<R> Drop for PendingGuard<R> {
    fn drop(&mut self) {
        if self.armed {
            let mut table = lock(&self.table);
            if table.expire(&self.request_id) {
                tracing::debug!(request_id = %self.request_id, "Abandoned request removed");
            }
            record_pending(table.len());
        }
    }
}

/// Turns a publish plus an eventual reply on another topic into one
/// awaitable call.
///
/// Responses reach the correlator through [`handle_inbound`](Self::handle_inbound),
/// which the process's single inbound dispatcher calls for every message on
/// the response topic.
pub struct RequestCorrelator<R> {
    table: SharedTable<R>,
    publisher: Arc<dyn Publish>,
    config: CorrelatorConfig,
}

impl<R> Clone for RequestCorrelator<R> {
    fn clone(&self) -> Self {
        Self {
            table: self.table.clone(),
            publisher: self.publisher.clone(),
            config: self.config.clone(),
        }
    }
}

impl<R> RequestCorrelator<R>
where
    R: Correlated + DeserializeOwned + Send + 'static,
{
    pub fn new(publisher: Arc<dyn Publish>, config: CorrelatorConfig) -> Self {
        Self {
            table: Arc::new(Mutex::new(CorrelationTable::new())),
            publisher,
            config,
        }
    }

    pub fn config(&self) -> &CorrelatorConfig {
        &self.config
    }

    /// Publishes `request` on `topic` and waits for the response with the
    /// same request ID.
    ///
    /// A blank request ID is replaced with a generated one. The entry is
    /// registered before publishing so a fast reply cannot be missed.
    #[tracing::instrument(skip(self, request), fields(request_id))]
    pub async fn send_and_await<Q>(
        &self,
        topic: &str,
        mut request: Q,
        timeout: Duration,
    ) -> Result<R>
    where
        Q: Correlated + Serialize + Send,
    {
        if request.request_id().is_blank() {
            request.set_request_id(RequestId::generate());
        }
        let request_id = request.request_id().clone();
        tracing::Span::current().record("request_id", tracing::field::display(&request_id));

        let message = Message::json(topic, &request)?;

        let mut rx = {
            let mut table = lock(&self.table);
            let rx = table.register(request_id.clone(), timeout)?;
            record_pending(table.len());
            rx
        };
        let mut guard = PendingGuard {
            table: self.table.clone(),
            request_id: request_id.clone(),
            armed: true,
        };

        self.publisher.publish(message).await?;
        metrics::counter!("correlator_requests_total").increment(1);

        let outcome = match tokio::time::timeout(timeout, &mut rx).await {
            Ok(Ok(response)) => Ok(response),
            // The sweeper dropped the entry at its deadline.
            Ok(Err(_)) => Err(()),
            Err(_) => {
                let mut table = lock(&self.table);
                if table.expire(&request_id) {
                    record_pending(table.len());
                    Err(())
                } else {
                    // A resolver removed the entry first; its send happened
                    // under the same lock, so the response is already queued.
                    rx.try_recv().map_err(|_| ())
                }
            }
        };
        guard.disarm();

        match outcome {
            Ok(response) => Ok(response),
            Err(()) => {
                metrics::counter!("correlator_timeouts_total").increment(1);
                tracing::warn!(timeout_ms = timeout.as_millis() as u64, "Request timed out");
                Err(CorrelationError::Timeout {
                    request_id,
                    timeout,
                })
            }
        }
    }

    /// Like [`send_and_await`](Self::send_and_await) with the configured
    /// default timeout.
    pub async fn send<Q>(&self, topic: &str, request: Q) -> Result<R>
    where
        Q: Correlated + Serialize + Send,
    {
        self.send_and_await(topic, request, self.config.default_timeout)
            .await
    }

    /// Routes a response to its waiting caller. Returns how it was handled;
    /// anything but `Delivered` is logged and dropped.
    pub fn handle_inbound(&self, message: &Message) -> Resolution {
        let response: R = match message.decode() {
            Ok(r) => r,
            Err(e) => {
                metrics::counter!("correlator_unmatched_total", "reason" => "malformed")
                    .increment(1);
                tracing::warn!(topic = %message.topic, error = %e, "Undecodable response dropped");
                return Resolution::Unmatched;
            }
        };
        self.resolve(response)
    }

    /// Routes an already decoded response.
    pub fn resolve(&self, response: R) -> Resolution {
        let request_id = response.request_id().clone();
        let resolution = {
            let mut table = lock(&self.table);
            let resolution = table.resolve(&request_id, response);
            record_pending(table.len());
            resolution
        };

        match resolution {
            Resolution::Delivered => {
                tracing::debug!(%request_id, "Response delivered");
            }
            Resolution::Unmatched => {
                metrics::counter!("correlator_unmatched_total", "reason" => "unknown").increment(1);
                tracing::info!(%request_id, "Response for unknown or expired request dropped");
            }
            Resolution::CallerGone => {
                metrics::counter!("correlator_unmatched_total", "reason" => "caller_gone")
                    .increment(1);
                tracing::info!(%request_id, "Response arrived after caller left; dropped");
            }
        }
        resolution
    }

    /// Removes entries past their deadline. Returns how many were removed.
    pub fn sweep(&self) -> usize {
        let mut table = lock(&self.table);
        let expired = table.sweep(Instant::now());
        record_pending(table.len());
        for id in &expired {
            tracing::debug!(request_id = %id, "Swept expired request");
        }
        expired.len()
    }

    /// Starts a periodic sweep using the configured interval. The task ends
    /// on its own once every clone of this correlator is dropped.
    pub fn spawn_sweeper(&self) -> JoinHandle<()> {
        let table: Weak<Mutex<CorrelationTable<R>>> = Arc::downgrade(&self.table);
        let interval = self.config.sweep_interval;
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                let Some(table) = table.upgrade() else {
                    break;
                };
                let mut table = lock(&table);
                let expired = table.sweep(Instant::now());
                if !expired.is_empty() {
                    tracing::debug!(count = expired.len(), "Swept expired requests");
                }
                record_pending(table.len());
            }
        })
    }

    pub fn pending_count(&self) -> usize {
        lock(&self.table).len()
    }

    pub fn is_pending(&self, request_id: &RequestId) -> bool {
        lock(&self.table).contains(request_id)
    }
}

#[cfg(test)]
mod tests {
    use async_trait::async_trait;
    use common::{ClientId, NodeId, ResourceRef};
    use tokio::sync::mpsc;

    use super::*;

    /// Captures published messages instead of sending them anywhere.
    struct Capture(mpsc::UnboundedSender<Message>);

    #[async_trait]
    impl Publish for Capture {
        async fn publish(&self, message: Message) -> transport::Result<()> {
            let _ = self.0.send(message);
            Ok(())
        }
    }

    struct Broken;

    #[async_trait]
    impl Publish for Broken {
        async fn publish(&self, _message: Message) -> transport::Result<()> {
            Err(transport::TransportError::NotConnected)
        }
    }

    fn request(id: &str) -> ReservationRequest {
        ReservationRequest {
            request_id: RequestId::from(id),
            client_id: ClientId::from("car-1"),
            target_node_id: NodeId::from("node-1"),
            resource_refs: vec![ResourceRef::new("node-1", "R1")],
            payload: serde_json::Value::Null,
        }
    }

    fn setup() -> (
        RequestCorrelator<ReservationResponse>,
        mpsc::UnboundedReceiver<Message>,
    ) {
        let (tx, rx) = mpsc::unbounded_channel();
        (
            RequestCorrelator::new(Arc::new(Capture(tx)), CorrelatorConfig::default()),
            rx,
        )
    }

    fn reply_to(message: &Message) -> Message {
        let request: ReservationRequest = message.decode().unwrap();
        let mut response = ReservationResponse::error(request.request_id, "");
        response.status = common::ResponseStatus::Reserved;
        Message::json("responses/car-1", &response).unwrap()
    }

    #[tokio::test]
    async fn response_resolves_waiting_caller() {
        let (correlator, mut outbound) = setup();
        let responder = correlator.clone();
        tokio::spawn(async move {
            let sent = outbound.recv().await.unwrap();
            assert_eq!(responder.handle_inbound(&reply_to(&sent)), Resolution::Delivered);
        });

        let response = correlator
            .send_and_await("nodes/node-1/reservations/request", request("r1"), Duration::from_secs(5))
            .await
            .unwrap();
        assert!(response.is_reserved());
        assert_eq!(correlator.pending_count(), 0);
    }

    #[tokio::test]
    async fn blank_request_id_is_generated() {
        let (correlator, mut outbound) = setup();
        let responder = correlator.clone();
        tokio::spawn(async move {
            let sent = outbound.recv().await.unwrap();
            responder.handle_inbound(&reply_to(&sent));
        });

        let response = correlator
            .send_and_await("t", request(""), Duration::from_secs(5))
            .await
            .unwrap();
        assert!(!response.request_id.is_blank());
    }

    #[tokio::test(start_paused = true)]
    async fn timeout_removes_entry_and_late_reply_is_dropped() {
        let (correlator, mut outbound) = setup();
        let started = Instant::now();

        let err = correlator
            .send_and_await("t", request("r1"), Duration::from_secs(5))
            .await
            .unwrap_err();

        assert!(err.is_timeout());
        let waited = started.elapsed();
        assert!(waited >= Duration::from_secs(5) && waited < Duration::from_millis(5100));
        assert!(!correlator.is_pending(&RequestId::from("r1")));

        let sent = outbound.recv().await.unwrap();
        assert_eq!(correlator.handle_inbound(&reply_to(&sent)), Resolution::Unmatched);
    }

    #[tokio::test]
    async fn duplicate_in_flight_id_is_refused() {
        let (correlator, _outbound) = setup();
        let first = {
            let c = correlator.clone();
            tokio::spawn(async move {
                c.send_and_await("t", request("dup"), Duration::from_secs(5))
                    .await
            })
        };
        while !correlator.is_pending(&RequestId::from("dup")) {
            tokio::task::yield_now().await;
        }

        let second = correlator
            .send_and_await("t", request("dup"), Duration::from_secs(5))
            .await;
        assert!(matches!(second, Err(CorrelationError::DuplicateRequest(_))));
        first.abort();
    }

    #[tokio::test]
    async fn publish_failure_leaves_nothing_pending() {
        let correlator: RequestCorrelator<ReservationResponse> =
            RequestCorrelator::new(Arc::new(Broken), CorrelatorConfig::default());
        let err = correlator
            .send_and_await("t", request("r1"), Duration::from_secs(5))
            .await
            .unwrap_err();
        assert!(matches!(err, CorrelationError::Transport(_)));
        assert_eq!(correlator.pending_count(), 0);
    }

    #[tokio::test]
    async fn cancelled_caller_leaves_nothing_pending() {
        let (correlator, _outbound) = setup();
        let c = correlator.clone();
        let task = tokio::spawn(async move {
            c.send_and_await("t", request("r1"), Duration::from_secs(60))
                .await
        });
        while !correlator.is_pending(&RequestId::from("r1")) {
            tokio::task::yield_now().await;
        }

        task.abort();
        let _ = task.await;
        assert_eq!(correlator.pending_count(), 0);
    }

    #[test]
    fn malformed_response_is_unmatched() {
        let (correlator, _outbound) = setup();
        let message = Message::new("responses/car-1", "not json");
        assert_eq!(correlator.handle_inbound(&message), Resolution::Unmatched);
    }
}
