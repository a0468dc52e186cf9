//! Saga coordinator for multi-node reservations.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::{Arc, Weak};
use std::time::Duration;

use chrono::{DateTime, Utc};
use common::{NodeId, RequestId, ReservationRequest, ResourceId};
use futures_util::StreamExt;
use futures_util::future::join_all;
use futures_util::stream::FuturesUnordered;
use resource_store::{RecordStatus, ReservationRecord, ResourceStore};
use tokio::sync::RwLock;
use tokio::task::JoinHandle;
use tokio::time::Instant;

use crate::aggregate::SagaInstance;
use crate::error::{Result, SagaError};
use crate::events::SagaEvent;
use crate::leg::LegOutcome;
use crate::outcome::ReservationOutcome;
use crate::peer::{Confirmation, PeerClient};
use crate::state::SagaState;

/// Settings for a [`SagaCoordinator`].
#[derive(Debug, Clone)]
pub struct SagaConfig {
    /// The node this coordinator runs on; legs it owns are reserved locally.
    pub node_id: NodeId,
    /// Overall budget for the peer phase, measured from the saga's start.
    pub deadline: Duration,
    /// Validity window written on each reservation record.
    pub reservation_validity: chrono::Duration,
    /// How long a finished saga stays in the journal. Until it is pruned its
    /// request ID is refused as a duplicate.
    pub retention: chrono::Duration,
}

impl Default for SagaConfig {
    fn default() -> Self {
        Self {
            node_id: NodeId::from("node-1"),
            deadline: Duration::from_secs(5),
            reservation_validity: chrono::Duration::days(1),
            retention: chrono::Duration::hours(24),
        }
    }
}

impl SagaConfig {
    pub fn new(node_id: impl Into<NodeId>) -> Self {
        Self {
            node_id: node_id.into(),
            ..Self::default()
        }
    }
}

/// Sagas by request ID, plus the requests whose cancellation is running.
#[derive(Default)]
struct Journal {
    sagas: HashMap<RequestId, SagaInstance>,
    cancelling: HashSet<RequestId>,
}

impl Journal {
    /// Drops finished sagas that ended before `cutoff`.
    fn prune(&mut self, cutoff: DateTime<Utc>) -> usize {
        let before = self.sagas.len();
        let cancelling = &self.cancelling;
        self.sagas.retain(|id, saga| {
            cancelling.contains(id)
                || !saga.state().is_terminal()
                || saga.finished_at().is_none_or(|at| at >= cutoff)
        });
        before - self.sagas.len()
    }
}

/// Orchestrates reservation sagas.
///
/// Local legs are reserved first, in request order, and the first failure
/// stops the saga before any peer is contacted. Peer legs are then requested
/// concurrently under the saga deadline. The saga commits only if every leg
/// reports reserved; otherwise every leg still holding its resource is
/// released, even if some releases fail.
pub struct SagaCoordinator<S, P>
where
    S: ResourceStore,
    P: PeerClient,
{
    config: SagaConfig,
    store: S,
    peers: P,
    journal: Arc<RwLock<Journal>>,
}

impl<S, P> SagaCoordinator<S, P>
where
    S: ResourceStore,
    P: PeerClient,
{
    pub fn new(config: SagaConfig, store: S, peers: P) -> Self {
        Self {
            config,
            store,
            peers,
            journal: Arc::new(RwLock::new(Journal::default())),
        }
    }

    pub fn config(&self) -> &SagaConfig {
        &self.config
    }

    pub fn node_id(&self) -> &NodeId {
        &self.config.node_id
    }

    /// Checks a request without side effects.
    pub fn validate(&self, request: &ReservationRequest) -> Result<()> {
        let invalid = |msg: String| Err(SagaError::Validation(msg));

        if request.request_id.is_blank() {
            return invalid("request_id must not be empty".into());
        }
        if request.client_id.is_blank() {
            return invalid("client_id must not be empty".into());
        }
        if request.target_node_id != self.config.node_id {
            return invalid(format!(
                "request is addressed to node {} but this is node {}",
                request.target_node_id, self.config.node_id
            ));
        }
        if request.resource_refs.is_empty() {
            return invalid("resource_refs must not be empty".into());
        }
        if !(request.payload.is_null() || request.payload.is_object()) {
            return invalid("payload must be a JSON object".into());
        }

        let mut seen = HashSet::new();
        for r in &request.resource_refs {
            if r.node_id.is_blank() || r.resource_id.is_blank() {
                return invalid("resource references need a node_id and a resource_id".into());
            }
            if !seen.insert(r) {
                return invalid(format!("resource {r} is listed more than once"));
            }
        }
        Ok(())
    }

    /// Runs a reservation saga to a terminal state.
    ///
    /// Returns `Err` only for requests refused before anything was touched
    /// (validation, duplicate request ID). Every leg failure is reported in
    /// the returned outcome instead.
    #[tracing::instrument(
        skip(self, request),
        fields(
            request_id = %request.request_id,
            client_id = %request.client_id,
            legs = request.resource_refs.len()
        )
    )]
    pub async fn handle_reservation_request(
        &self,
        request: ReservationRequest,
    ) -> Result<ReservationOutcome> {
        if let Err(e) = self.validate(&request) {
            metrics::counter!("saga_rejected_total", "reason" => "validation").increment(1);
            tracing::warn!(error = %e, "Reservation request rejected");
            return Err(e);
        }

        let saga_start = std::time::Instant::now();
        let deadline = Instant::now() + self.config.deadline;

        let mut saga = SagaInstance::default();
        saga.apply(SagaEvent::saga_started(
            request.request_id.clone(),
            request.client_id.clone(),
            self.config.node_id.clone(),
            request.resource_refs.clone(),
        ));

        {
            let mut journal = self.journal.write().await;
            if journal.sagas.contains_key(&request.request_id) {
                metrics::counter!("saga_rejected_total", "reason" => "duplicate").increment(1);
                tracing::warn!("Duplicate request ignored");
                return Err(SagaError::DuplicateRequest(request.request_id));
            }
            journal
                .sagas
                .insert(request.request_id.clone(), saga.clone());
        }
        metrics::counter!("saga_executions_total").increment(1);

        self.run(&mut saga, &request, deadline).await;

        let duration = saga_start.elapsed().as_secs_f64();
        metrics::histogram!("saga_duration_seconds").record(duration);
        tracing::info!(state = %saga.state(), duration, "Saga finished");

        Ok(ReservationOutcome::from_saga(&saga))
    }

    async fn run(&self, saga: &mut SagaInstance, request: &ReservationRequest, deadline: Instant) {
        let request_id = &request.request_id;

        // Local phase: fail fast, before any peer is contacted.
        let local: Vec<(usize, ResourceId)> = saga
            .legs()
            .iter()
            .enumerate()
            .filter(|(_, leg)| leg.local)
            .map(|(i, leg)| (i, leg.resource_id.clone()))
            .collect();

        for (index, resource_id) in local {
            let outcome = match self
                .store
                .reserve_for(&resource_id, Some(request_id))
                .await
            {
                Ok(outcome) => LegOutcome::from(outcome),
                Err(e) => {
                    tracing::error!(%resource_id, error = %e, "Local reservation failed");
                    LegOutcome::StoreError {
                        reason: e.to_string(),
                    }
                }
            };

            if outcome.is_reserved() {
                tracing::debug!(%resource_id, "Local leg reserved");
                self.record(saga, SagaEvent::leg_reserved(index)).await;
                continue;
            }

            let reason = format!("{resource_id}: {outcome}");
            tracing::info!(%resource_id, %outcome, "Local leg failed");
            self.record(saga, SagaEvent::leg_failed(index, outcome)).await;

            if saga.any_reserved() {
                self.compensate(saga, request_id, reason).await;
            } else {
                metrics::counter!("saga_failed_upfront_total").increment(1);
                self.record(saga, SagaEvent::saga_failed_upfront(reason))
                    .await;
            }
            return;
        }

        self.record(saga, SagaEvent::LocalLegsReserved).await;

        // Peer phase.
        let peer: Vec<(usize, NodeId, ResourceId)> = saga
            .peer_legs()
            .into_iter()
            .map(|i| {
                let leg = &saga.legs()[i];
                (i, leg.owner_node_id.clone(), leg.resource_id.clone())
            })
            .collect();

        if !peer.is_empty() {
            self.record(saga, SagaEvent::peer_check_started(peer.len()))
                .await;

            let mut first_failure = None;
            for (index, outcome) in self.check_peers(&peer, request_id, deadline).await {
                if outcome.is_reserved() {
                    self.record(saga, SagaEvent::leg_reserved(index)).await;
                } else {
                    if first_failure.is_none() {
                        let leg = &saga.legs()[index];
                        first_failure = Some(format!(
                            "{} on {}: {outcome}",
                            leg.resource_id, leg.owner_node_id
                        ));
                    }
                    self.record(saga, SagaEvent::leg_failed(index, outcome))
                        .await;
                }
            }

            if let Some(reason) = first_failure {
                self.compensate(saga, request_id, reason).await;
                return;
            }
        }

        self.commit(saga, request).await;
    }

    /// Requests every peer leg concurrently. Legs without an answer when the
    /// deadline passes are reported as `DeadlineExceeded`; their calls are
    /// dropped and any later answer is ignored.
    async fn check_peers(
        &self,
        legs: &[(usize, NodeId, ResourceId)],
        request_id: &RequestId,
        deadline: Instant,
    ) -> Vec<(usize, LegOutcome)> {
        let mut in_flight: FuturesUnordered<_> = legs
            .iter()
            .map(|(index, node, resource_id)| async move {
                let result = self
                    .peers
                    .check_and_reserve_remote(node, resource_id, request_id)
                    .await;
                (*index, node, resource_id, result)
            })
            .collect();

        let mut outcomes: BTreeMap<usize, LegOutcome> = BTreeMap::new();
        let expired = tokio::time::sleep_until(deadline);
        tokio::pin!(expired);

        loop {
            tokio::select! {
                biased;
                next = in_flight.next() => match next {
                    Some((index, node, resource_id, result)) => {
                        let outcome = match result {
                            Ok(outcome) => LegOutcome::from(outcome),
                            Err(e) => {
                                tracing::warn!(
                                    peer = %node,
                                    %resource_id,
                                    error = %e,
                                    "Peer call failed; treating leg as unavailable"
                                );
                                LegOutcome::from(&e)
                            }
                        };
                        outcomes.insert(index, outcome);
                    }
                    None => break,
                },
                _ = &mut expired => {
                    tracing::warn!(
                        in_flight = in_flight.len(),
                        "Saga deadline passed with peer calls outstanding"
                    );
                    break;
                }
            }
        }
        drop(in_flight);

        legs.iter()
            .map(|(index, _, _)| {
                let outcome = outcomes
                    .remove(index)
                    .unwrap_or(LegOutcome::DeadlineExceeded);
                (*index, outcome)
            })
            .collect()
    }

    /// Releases every held leg, and every peer leg whose outcome is unknown,
    /// then ends the saga as compensated.
    #[tracing::instrument(skip(self, saga))]
    async fn compensate(&self, saga: &mut SagaInstance, request_id: &RequestId, reason: String) {
        metrics::counter!("saga_compensations_total").increment(1);
        self.record(saga, SagaEvent::compensation_started(&reason))
            .await;

        let mut legs = saga.held_legs();
        legs.extend(saga.ambiguous_legs());
        legs.sort_unstable();
        self.release_legs(saga, request_id, &legs).await;

        self.record(saga, SagaEvent::saga_compensated(reason)).await;
    }

    /// Releases the given legs in order, each only if this request holds it.
    /// A failed release is logged and recorded; the remaining legs are still
    /// released.
    async fn release_legs(&self, saga: &mut SagaInstance, request_id: &RequestId, legs: &[usize]) {
        for &index in legs {
            let leg = saga.legs()[index].clone();
            let result = if leg.local {
                self.store
                    .release_for(&leg.resource_id, Some(request_id))
                    .await
                    .map_err(|e| e.to_string())
            } else {
                self.peers
                    .release_remote(&leg.owner_node_id, &leg.resource_id, request_id)
                    .await
                    .map_err(|e| e.to_string())
            };

            match result {
                Ok(outcome) => {
                    tracing::debug!(
                        resource_id = %leg.resource_id,
                        outcome = outcome.as_str(),
                        unconfirmed = !leg.state.holds_resource(),
                        "Leg released"
                    );
                    self.record(saga, SagaEvent::leg_released(index)).await;
                }
                Err(error) => {
                    metrics::counter!("saga_compensation_failures_total").increment(1);
                    tracing::error!(
                        owner = %leg.owner_node_id,
                        resource_id = %leg.resource_id,
                        %error,
                        "Release failed; resource may stay falsely reserved"
                    );
                    self.record(saga, SagaEvent::compensation_step_failed(index, error))
                        .await;
                }
            }
        }
    }

    /// Persists a record per leg and ends the saga as committed.
    ///
    /// Local records are written first; if one cannot be written the saga is
    /// still able to back out and compensates instead. Peer confirmations
    /// follow. A peer confirmation that fails after retries is logged and
    /// does not undo the commit.
    async fn commit(&self, saga: &mut SagaInstance, request: &ReservationRequest) {
        let request_id = &request.request_id;
        let valid_from = Utc::now();
        let valid_until = valid_from + self.config.reservation_validity;

        let local: Vec<(usize, ResourceId)> = saga
            .legs()
            .iter()
            .enumerate()
            .filter(|(_, leg)| leg.local)
            .map(|(i, leg)| (i, leg.resource_id.clone()))
            .collect();

        for (index, resource_id) in local {
            let record = ReservationRecord {
                request_id: request_id.clone(),
                resource_id: resource_id.clone(),
                client_id: request.client_id.clone(),
                valid_from,
                valid_until,
                status: RecordStatus::Confirmed,
                created_at: Utc::now(),
            };
            if let Err(e) = self.store.record_reservation(record).await {
                tracing::error!(%resource_id, error = %e, "Could not record reservation");
                if let Err(e) = self.store.cancel_reservations(request_id).await {
                    tracing::error!(error = %e, "Could not cancel partial records");
                }
                self.compensate(
                    saga,
                    request_id,
                    format!("could not record reservation for {resource_id}: {e}"),
                )
                .await;
                return;
            }
            self.record(saga, SagaEvent::leg_confirmed(index)).await;
        }

        let confirmation = Confirmation {
            request_id: request_id.clone(),
            client_id: request.client_id.clone(),
            valid_from,
            valid_until,
        };
        let peer: Vec<(usize, NodeId, ResourceId)> = saga
            .peer_legs()
            .into_iter()
            .map(|i| {
                let leg = &saga.legs()[i];
                (i, leg.owner_node_id.clone(), leg.resource_id.clone())
            })
            .collect();

        let confirms = peer.iter().map(|(index, node, resource_id)| {
            let confirmation = &confirmation;
            async move {
                let result = self
                    .peers
                    .confirm_remote(node, resource_id, confirmation)
                    .await;
                (*index, node, resource_id, result)
            }
        });

        for (index, node, resource_id, result) in join_all(confirms).await {
            match result {
                Ok(()) => self.record(saga, SagaEvent::leg_confirmed(index)).await,
                Err(e) => {
                    metrics::counter!("saga_confirm_failures_total").increment(1);
                    tracing::error!(
                        peer = %node,
                        %resource_id,
                        error = %e,
                        "Peer did not record committed leg"
                    );
                    self.record(saga, SagaEvent::confirm_failed(index, e.to_string()))
                        .await;
                }
            }
        }

        metrics::counter!("saga_commits_total").increment(1);
        self.record(saga, SagaEvent::saga_committed()).await;
    }

    /// Cancels a committed reservation: marks its local records cancelled and
    /// releases every leg. Calling it again retries legs whose release failed.
    ///
    /// Only one cancellation of a request runs at a time; a concurrent call
    /// fails with [`SagaError::CancellationInProgress`].
    #[tracing::instrument(skip(self))]
    pub async fn cancel_reservation(&self, request_id: &RequestId) -> Result<ReservationOutcome> {
        let mut saga = {
            let mut journal = self.journal.write().await;
            let saga = journal
                .sagas
                .get(request_id)
                .cloned()
                .ok_or_else(|| SagaError::NotFound(request_id.clone()))?;

            if saga.state() != SagaState::Committed {
                return Err(SagaError::InvalidState {
                    expected: "Committed".to_string(),
                    actual: saga.state(),
                });
            }
            if saga.is_cancelled() && saga.held_legs().is_empty() {
                return Ok(ReservationOutcome::from_saga(&saga));
            }
            if !journal.cancelling.insert(request_id.clone()) {
                tracing::info!("Cancellation already running");
                return Err(SagaError::CancellationInProgress(request_id.clone()));
            }
            saga
        };

        let result = self.run_cancellation(&mut saga, request_id).await;
        self.journal.write().await.cancelling.remove(request_id);
        result
    }

    async fn run_cancellation(
        &self,
        saga: &mut SagaInstance,
        request_id: &RequestId,
    ) -> Result<ReservationOutcome> {
        let cancelled = self.store.cancel_reservations(request_id).await?;
        tracing::info!(records = cancelled.len(), "Local records cancelled");

        let held = saga.held_legs();
        self.release_legs(saga, request_id, &held).await;
        if !saga.is_cancelled() {
            self.record(saga, SagaEvent::reservation_cancelled()).await;
            metrics::counter!("saga_cancellations_total").increment(1);
        }

        Ok(ReservationOutcome::from_saga(saga))
    }

    /// Returns the journal entry for a request.
    pub async fn get_saga(&self, request_id: &RequestId) -> Option<SagaInstance> {
        self.journal.read().await.sagas.get(request_id).cloned()
    }

    /// Returns every saga, oldest first.
    pub async fn list_sagas(&self) -> Vec<SagaInstance> {
        let mut sagas: Vec<SagaInstance> =
            self.journal.read().await.sagas.values().cloned().collect();
        sagas.sort_by_key(|s| s.started_at());
        sagas
    }

    pub async fn saga_count(&self) -> usize {
        self.journal.read().await.sagas.len()
    }

    /// Drops finished sagas that ended before `cutoff` and returns how many
    /// were dropped. Running sagas and running cancellations are kept.
    pub async fn prune_finished_before(&self, cutoff: DateTime<Utc>) -> usize {
        self.journal.write().await.prune(cutoff)
    }

    /// Drops finished sagas older than the configured retention.
    pub async fn prune_expired(&self) -> usize {
        self.prune_finished_before(Utc::now() - self.config.retention)
            .await
    }

    /// Prunes the journal every `every` until the coordinator is dropped.
    pub fn spawn_pruner(&self, every: Duration) -> JoinHandle<()> {
        let journal: Weak<RwLock<Journal>> = Arc::downgrade(&self.journal);
        let retention = self.config.retention;
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(every);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                let Some(journal) = journal.upgrade() else {
                    break;
                };
                let pruned = journal.write().await.prune(Utc::now() - retention);
                if pruned > 0 {
                    tracing::debug!(pruned, "Pruned finished sagas");
                }
            }
        })
    }

    /// Applies an event and publishes the new snapshot to the journal.
    async fn record(&self, saga: &mut SagaInstance, event: SagaEvent) {
        tracing::trace!(event = event.event_type(), "Saga event");
        saga.apply(event);
        if let Some(id) = saga.request_id() {
            self.journal
                .write()
                .await
                .sagas
                .insert(id.clone(), saga.clone());
        }
    }
}
