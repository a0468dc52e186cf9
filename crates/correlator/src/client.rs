//! Client side of the reservation exchange.

use std::sync::Arc;
use std::time::Duration;

use common::topics::{request_topic, response_topic};
use common::{ClientId, NodeId, RequestId, ReservationRequest, ReservationResponse, ResourceRef};
use tokio::task::JoinHandle;
use transport::{Connector, Dispatcher, Message, TopicFilter, TransportAdapter, TransportConfig};

use crate::correlator::{CorrelatorConfig, RequestCorrelator};
use crate::error::Result;

/// Publishes reservation requests and awaits their responses on
/// `responses/<client_id>`.
pub struct ReservationClient {
    client_id: ClientId,
    transport: TransportAdapter,
    correlator: RequestCorrelator<ReservationResponse>,
    pump: JoinHandle<()>,
    sweeper: JoinHandle<()>,
}

impl ReservationClient {
    /// Connects to the broker, subscribes to the client's response topic and
    /// starts the inbound pump.
    pub async fn connect<C>(
        connector: C,
        client_id: ClientId,
        config: CorrelatorConfig,
        connect_timeout: Duration,
    ) -> Result<Self>
    where
        C: Connector + 'static,
    {
        let topic = response_topic(&client_id);
        let filter = TopicFilter::parse(&topic)?;
        let (transport, inbound) = TransportAdapter::start(
            connector,
            TransportConfig::new(client_id.as_str()).subscribe(filter),
        );

        let correlator: RequestCorrelator<ReservationResponse> =
            RequestCorrelator::new(Arc::new(transport.clone()), config);

        let handler = correlator.clone();
        let dispatcher = Dispatcher::new().on_message(&topic, move |message: Message| {
            let handler = handler.clone();
            async move {
                handler.handle_inbound(&message);
            }
        })?;
        let pump = tokio::spawn(dispatcher.run(inbound));
        let sweeper = correlator.spawn_sweeper();

        if let Err(e) = transport.wait_connected(connect_timeout).await {
            transport.shutdown();
            pump.abort();
            sweeper.abort();
            return Err(e.into());
        }

        Ok(Self {
            client_id,
            transport,
            correlator,
            pump,
            sweeper,
        })
    }

    pub fn client_id(&self) -> &ClientId {
        &self.client_id
    }

    /// Builds a request with a fresh ID and sends it.
    pub async fn reserve(
        &self,
        target_node_id: NodeId,
        resource_refs: Vec<ResourceRef>,
        payload: serde_json::Value,
    ) -> Result<ReservationResponse> {
        let request = ReservationRequest {
            request_id: RequestId::generate(),
            client_id: self.client_id.clone(),
            target_node_id,
            resource_refs,
            payload,
        };
        self.send(request, self.correlator.config().default_timeout)
            .await
    }

    /// Sends a prepared request. The client ID is overwritten with this
    /// client's so the response comes back here.
    #[tracing::instrument(skip(self, request), fields(client_id = %self.client_id, target = %request.target_node_id))]
    pub async fn send(
        &self,
        mut request: ReservationRequest,
        timeout: Duration,
    ) -> Result<ReservationResponse> {
        request.client_id = self.client_id.clone();
        let topic = request_topic(&request.target_node_id);
        self.correlator
            .send_and_await(&topic, request, timeout)
            .await
    }

    pub fn pending_count(&self) -> usize {
        self.correlator.pending_count()
    }

    pub fn shutdown(&self) {
        self.transport.shutdown();
        self.sweeper.abort();
        self.pump.abort();
    }
}

impl Drop for ReservationClient {
    fn drop(&mut self) {
        self.shutdown();
    }
}
