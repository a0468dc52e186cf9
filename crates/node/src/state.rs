//! Shared state handed to every handler.

use std::sync::Arc;

use common::{NodeId, ResourceId};
use resource_store::ResourceStore;
use saga::{PeerClient, ReservationOutcome, SagaConfig, SagaCoordinator};
use transport::TransportAdapter;

use crate::announce::StatusAnnouncer;

/// The coordinator as wired in a node: trait objects for the store and peers.
pub type NodeCoordinator = SagaCoordinator<Arc<dyn ResourceStore>, Arc<dyn PeerClient>>;

/// Shared application state accessible from all handlers.
pub struct AppState {
    pub node_id: NodeId,
    pub store: Arc<dyn ResourceStore>,
    pub coordinator: Arc<NodeCoordinator>,
    pub announcer: StatusAnnouncer,
    /// The node's pub/sub connection, if it has one.
    pub transport: Option<TransportAdapter>,
}

impl AppState {
    /// Builds state without a pub/sub connection.
    pub fn new(
        config: SagaConfig,
        store: Arc<dyn ResourceStore>,
        peers: Arc<dyn PeerClient>,
    ) -> Self {
        let node_id = config.node_id.clone();
        let coordinator = Arc::new(SagaCoordinator::new(config, store.clone(), peers));
        Self {
            announcer: StatusAnnouncer::disabled(node_id.clone()),
            node_id,
            store,
            coordinator,
            transport: None,
        }
    }

    /// Attaches the pub/sub connection; status changes are announced on it.
    pub fn with_transport(mut self, transport: TransportAdapter) -> Self {
        self.announcer = StatusAnnouncer::new(self.node_id.clone(), Arc::new(transport.clone()));
        self.transport = Some(transport);
        self
    }

    /// Announces the current status of each listed resource this node owns.
    pub async fn announce_resources(&self, resource_ids: &[ResourceId]) {
        if !self.announcer.is_enabled() {
            return;
        }
        for resource_id in resource_ids {
            match self.store.get_resource(resource_id).await {
                Ok(Some(resource)) => self.announcer.announce(&resource).await,
                Ok(None) => {}
                Err(e) => {
                    tracing::debug!(%resource_id, error = %e, "Status not announced");
                }
            }
        }
    }

    /// Resources of an outcome's legs that this node owns.
    pub fn local_resources(&self, outcome: &ReservationOutcome) -> Vec<ResourceId> {
        outcome
            .legs
            .iter()
            .filter(|leg| leg.owner_node_id == self.node_id)
            .map(|leg| leg.resource_id.clone())
            .collect()
    }
}
