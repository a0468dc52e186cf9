//! Reservation requests arriving over pub/sub.
//!
//! One dispatcher loop drains the transport's inbound channel; each request
//! runs in its own task so a slow saga never holds up the next message.

use std::sync::Arc;

use common::topics::{request_topic, response_topic};
use common::{ClientId, RequestId, ReservationRequest, ReservationResponse};
use saga::{ReservationOutcome, SagaError};
use transport::{Dispatcher, Message, Publish};

use crate::state::AppState;

/// Builds the dispatcher routing this node's request topic to a
/// [`RequestHandler`].
pub fn request_dispatcher(
    state: Arc<AppState>,
    publisher: Arc<dyn Publish>,
) -> transport::Result<Dispatcher> {
    let topic = request_topic(&state.node_id);
    let handler = RequestHandler::new(state, publisher);
    Dispatcher::new().on_message(&topic, move |message: Message| {
        let handler = handler.clone();
        async move {
            tokio::spawn(async move { handler.handle(message).await });
        }
    })
}

/// Runs the coordinator for one inbound request and publishes the response
/// to `responses/<client_id>`.
#[derive(Clone)]
pub struct RequestHandler {
    state: Arc<AppState>,
    publisher: Arc<dyn Publish>,
}

impl RequestHandler {
    pub fn new(state: Arc<AppState>, publisher: Arc<dyn Publish>) -> Self {
        Self { state, publisher }
    }

    #[tracing::instrument(skip_all, fields(topic = %message.topic))]
    pub async fn handle(&self, message: Message) {
        metrics::counter!("node_inbound_requests_total").increment(1);

        let request: ReservationRequest = match message.decode() {
            Ok(request) => request,
            Err(e) => {
                self.reply_malformed(&message, &e).await;
                return;
            }
        };

        let client_id = request.client_id.clone();
        let request_id = request.request_id.clone();
        let response = match self.state.coordinator.handle_reservation_request(request).await {
            Ok(outcome) => {
                let local = self.state.local_resources(&outcome);
                self.state.announce_resources(&local).await;
                outcome.to_response()
            }
            Err(SagaError::DuplicateRequest(_)) => {
                match self.finished_response(&request_id, &client_id).await {
                    Some(response) => {
                        tracing::info!(%request_id, "Redelivered request answered from the journal");
                        response
                    }
                    // Still running; its own saga answers.
                    None => {
                        tracing::info!(%request_id, "Redelivered request ignored");
                        return;
                    }
                }
            }
            Err(e) => ReservationResponse::error(request_id, e.to_string()),
        };

        self.respond(&client_id, &response).await;
    }

    /// The journaled answer to a finished request, if the same client asks again.
    async fn finished_response(
        &self,
        request_id: &RequestId,
        client_id: &ClientId,
    ) -> Option<ReservationResponse> {
        let saga = self.state.coordinator.get_saga(request_id).await?;
        if !saga.state().is_terminal() || saga.client_id() != Some(client_id) {
            return None;
        }
        Some(ReservationOutcome::from_saga(&saga).to_response())
    }

    /// Answers an undecodable request if a client ID can still be read from it.
    async fn reply_malformed(&self, message: &Message, error: &serde_json::Error) {
        metrics::counter!("node_malformed_requests_total").increment(1);

        let value: Option<serde_json::Value> = serde_json::from_slice(&message.payload).ok();
        let field = |name: &str| {
            value
                .as_ref()
                .and_then(|v| v.get(name))
                .and_then(|v| v.as_str())
                .filter(|s| !s.trim().is_empty())
                .map(str::to_string)
        };

        let Some(client_id) = field("client_id").map(ClientId::from) else {
            tracing::warn!(error = %error, "Malformed request without a reply address dropped");
            return;
        };
        let request_id = RequestId::from(field("request_id").unwrap_or_default());

        tracing::warn!(%client_id, %request_id, error = %error, "Malformed request");
        let response =
            ReservationResponse::error(request_id, format!("Malformed reservation request: {error}"));
        self.respond(&client_id, &response).await;
    }

    async fn respond(&self, client_id: &ClientId, response: &ReservationResponse) {
        if client_id.is_blank() {
            tracing::warn!(request_id = %response.request_id, "No client to answer; response dropped");
            return;
        }

        let published = match Message::json(response_topic(client_id), response) {
            Ok(message) => self.publisher.publish(message).await,
            Err(e) => Err(e),
        };
        match published {
            Ok(()) => tracing::debug!(%client_id, status = response.status.as_str(), "Response published"),
            Err(e) => {
                metrics::counter!("node_response_publish_failures_total").increment(1);
                tracing::warn!(%client_id, error = %e, "Response not delivered");
            }
        }
    }
}
