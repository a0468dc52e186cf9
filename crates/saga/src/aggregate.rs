//! Saga instance built from its journal.

use chrono::{DateTime, Utc};
use common::{ClientId, NodeId, RequestId, ResourceId};
use serde::{Deserialize, Serialize};

use crate::events::SagaEvent;
use crate::leg::{LegOutcome, LegState, ReservationLeg};
use crate::state::SagaState;

/// One reservation saga, rebuilt by applying its events in order.
///
/// The coordinator keeps these in memory only; they are not a durable log
/// and do not survive a restart.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SagaInstance {
    request_id: Option<RequestId>,
    client_id: Option<ClientId>,
    node_id: Option<NodeId>,
    state: SagaState,
    legs: Vec<ReservationLeg>,
    /// Reason for failure, if any.
    failure_reason: Option<String>,
    started_at: Option<DateTime<Utc>>,
    finished_at: Option<DateTime<Utc>>,
    cancelled_at: Option<DateTime<Utc>>,
    history: Vec<SagaEvent>,
}

impl SagaInstance {
    /// Builds an instance from a sequence of events.
    pub fn from_events(events: impl IntoIterator<Item = SagaEvent>) -> Self {
        let mut saga = Self::default();
        for event in events {
            saga.apply(event);
        }
        saga
    }

    pub fn apply(&mut self, event: SagaEvent) {
        match &event {
            SagaEvent::SagaStarted(data) => {
                self.request_id = Some(data.request_id.clone());
                self.client_id = Some(data.client_id.clone());
                self.node_id = Some(data.node_id.clone());
                self.started_at = Some(data.started_at);
                self.state = SagaState::Init;
                self.legs = data
                    .resource_refs
                    .iter()
                    .enumerate()
                    .map(|(i, r)| {
                        ReservationLeg::new(&data.request_id, i, r, r.node_id == data.node_id)
                    })
                    .collect();
            }
            SagaEvent::LegReserved(data) => {
                if let Some(leg) = self.legs.get_mut(data.index) {
                    leg.state = LegState::Reserved;
                    leg.outcome = Some(LegOutcome::Reserved);
                }
            }
            SagaEvent::LegFailed(data) => {
                if let Some(leg) = self.legs.get_mut(data.index) {
                    leg.state = LegState::Failed;
                    leg.outcome = Some(data.outcome.clone());
                }
            }
            SagaEvent::LocalLegsReserved => {
                self.state = SagaState::LocalReserved;
            }
            SagaEvent::PeerCheckStarted(_) => {
                self.state = SagaState::PeerChecking;
            }
            SagaEvent::CompensationStarted(data) => {
                self.state = SagaState::Compensating;
                self.failure_reason = Some(data.reason.clone());
            }
            SagaEvent::LegReleased(data) => {
                if let Some(leg) = self.legs.get_mut(data.index) {
                    leg.state = LegState::Cancelled;
                    leg.compensation_failed = false;
                }
            }
            SagaEvent::CompensationStepFailed(data) => {
                if let Some(leg) = self.legs.get_mut(data.index) {
                    leg.compensation_failed = true;
                    leg.last_error = Some(data.error.clone());
                }
            }
            SagaEvent::LegConfirmed(data) => {
                if let Some(leg) = self.legs.get_mut(data.index) {
                    leg.state = LegState::Confirmed;
                }
            }
            SagaEvent::ConfirmFailed(data) => {
                // The leg stays reserved on the peer without a record.
                if let Some(leg) = self.legs.get_mut(data.index) {
                    leg.last_error = Some(data.error.clone());
                }
            }
            SagaEvent::SagaCommitted(data) => {
                self.state = SagaState::Committed;
                self.finished_at = Some(data.at);
            }
            SagaEvent::SagaCompensated(data) => {
                self.state = SagaState::Compensated;
                self.failure_reason = Some(data.reason.clone());
                self.finished_at = Some(data.at);
            }
            SagaEvent::SagaFailedUpfront(data) => {
                self.state = SagaState::FailedUpfront;
                self.failure_reason = Some(data.reason.clone());
                self.finished_at = Some(data.at);
            }
            SagaEvent::ReservationCancelled(data) => {
                self.cancelled_at = Some(data.at);
            }
        }
        self.history.push(event);
    }
}

// Query methods
impl SagaInstance {
    pub fn request_id(&self) -> Option<&RequestId> {
        self.request_id.as_ref()
    }

    pub fn client_id(&self) -> Option<&ClientId> {
        self.client_id.as_ref()
    }

    pub fn node_id(&self) -> Option<&NodeId> {
        self.node_id.as_ref()
    }

    pub fn state(&self) -> SagaState {
        self.state
    }

    pub fn legs(&self) -> &[ReservationLeg] {
        &self.legs
    }

    pub fn leg(&self, index: usize) -> Option<&ReservationLeg> {
        self.legs.get(index)
    }

    /// Indices of legs currently holding their resource, in request order.
    pub fn held_legs(&self) -> Vec<usize> {
        self.legs
            .iter()
            .enumerate()
            .filter(|(_, leg)| leg.state.holds_resource())
            .map(|(i, _)| i)
            .collect()
    }

    /// Indices of failed legs whose peer may still have reserved the station,
    /// in request order.
    pub fn ambiguous_legs(&self) -> Vec<usize> {
        self.legs
            .iter()
            .enumerate()
            .filter(|(_, leg)| {
                leg.state == LegState::Failed
                    && leg.outcome.as_ref().is_some_and(LegOutcome::is_ambiguous)
            })
            .map(|(i, _)| i)
            .collect()
    }

    /// Indices of legs owned by peer nodes.
    pub fn peer_legs(&self) -> Vec<usize> {
        self.legs
            .iter()
            .enumerate()
            .filter(|(_, leg)| !leg.local)
            .map(|(i, _)| i)
            .collect()
    }

    /// True once any leg has been reserved.
    pub fn any_reserved(&self) -> bool {
        self.legs.iter().any(|l| l.outcome.as_ref().is_some_and(LegOutcome::is_reserved))
    }

    pub fn all_reserved(&self) -> bool {
        !self.legs.is_empty() && self.legs.iter().all(ReservationLeg::is_reserved)
    }

    /// Resources whose release failed during compensation or cancellation.
    pub fn compensation_failures(&self) -> Vec<ResourceId> {
        self.legs
            .iter()
            .filter(|l| l.compensation_failed)
            .map(|l| l.resource_id.clone())
            .collect()
    }

    pub fn failure_reason(&self) -> Option<&str> {
        self.failure_reason.as_deref()
    }

    pub fn started_at(&self) -> Option<DateTime<Utc>> {
        self.started_at
    }

    pub fn finished_at(&self) -> Option<DateTime<Utc>> {
        self.finished_at
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled_at.is_some()
    }

    pub fn history(&self) -> &[SagaEvent] {
        &self.history
    }
}

#[cfg(test)]
mod tests {
    use common::ResourceRef;

    use super::*;

    fn started() -> SagaEvent {
        SagaEvent::saga_started(
            RequestId::from("req-1"),
            ClientId::from("car-1"),
            NodeId::from("node-1"),
            vec![
                ResourceRef::new("node-1", "R1"),
                ResourceRef::new("node-2", "R2"),
            ],
        )
    }

    #[test]
    fn test_saga_started_lays_out_legs() {
        let saga = SagaInstance::from_events([started()]);
        assert_eq!(saga.state(), SagaState::Init);
        assert_eq!(saga.legs().len(), 2);
        assert!(saga.legs()[0].local);
        assert!(!saga.legs()[1].local);
        assert_eq!(saga.peer_legs(), vec![1]);
        assert_eq!(saga.request_id(), Some(&RequestId::from("req-1")));
    }

    #[test]
    fn test_commit_path() {
        let saga = SagaInstance::from_events([
            started(),
            SagaEvent::leg_reserved(0),
            SagaEvent::LocalLegsReserved,
            SagaEvent::peer_check_started(1),
            SagaEvent::leg_reserved(1),
            SagaEvent::leg_confirmed(0),
            SagaEvent::leg_confirmed(1),
            SagaEvent::saga_committed(),
        ]);
        assert_eq!(saga.state(), SagaState::Committed);
        assert!(saga.state().is_terminal());
        assert_eq!(saga.held_legs(), vec![0, 1]);
        assert!(saga.finished_at().is_some());
        assert_eq!(saga.history().len(), 8);
    }

    #[test]
    fn test_compensation_path() {
        let saga = SagaInstance::from_events([
            started(),
            SagaEvent::leg_reserved(0),
            SagaEvent::LocalLegsReserved,
            SagaEvent::peer_check_started(1),
            SagaEvent::leg_failed(1, LegOutcome::Unavailable),
            SagaEvent::compensation_started("R2 unavailable"),
            SagaEvent::leg_released(0),
            SagaEvent::saga_compensated("R2 unavailable"),
        ]);
        assert_eq!(saga.state(), SagaState::Compensated);
        assert!(saga.held_legs().is_empty());
        assert!(saga.any_reserved());
        assert!(!saga.all_reserved());
        assert_eq!(saga.failure_reason(), Some("R2 unavailable"));
        assert_eq!(saga.legs()[0].state, LegState::Cancelled);
        assert_eq!(saga.legs()[1].state, LegState::Failed);
    }

    #[test]
    fn test_failed_compensation_keeps_leg_held() {
        let saga = SagaInstance::from_events([
            started(),
            SagaEvent::leg_reserved(0),
            SagaEvent::LocalLegsReserved,
            SagaEvent::peer_check_started(1),
            SagaEvent::leg_reserved(1),
            SagaEvent::compensation_started("deadline"),
            SagaEvent::leg_released(0),
            SagaEvent::compensation_step_failed(1, "peer down"),
            SagaEvent::saga_compensated("deadline"),
        ]);
        assert_eq!(saga.held_legs(), vec![1]);
        assert_eq!(saga.compensation_failures(), vec![ResourceId::from("R2")]);
        assert_eq!(saga.legs()[1].last_error.as_deref(), Some("peer down"));
    }

    #[test]
    fn test_unknown_peer_outcome_is_ambiguous_until_released() {
        let mut saga = SagaInstance::from_events([
            started(),
            SagaEvent::leg_reserved(0),
            SagaEvent::LocalLegsReserved,
            SagaEvent::peer_check_started(1),
            SagaEvent::leg_failed(1, LegOutcome::PeerTimeout),
        ]);
        assert_eq!(saga.ambiguous_legs(), vec![1]);
        assert_eq!(saga.held_legs(), vec![0]);

        saga.apply(SagaEvent::leg_released(1));
        assert!(saga.ambiguous_legs().is_empty());
    }

    #[test]
    fn test_failed_upfront() {
        let saga = SagaInstance::from_events([
            started(),
            SagaEvent::leg_failed(0, LegOutcome::Unavailable),
            SagaEvent::saga_failed_upfront("R1 unavailable"),
        ]);
        assert_eq!(saga.state(), SagaState::FailedUpfront);
        assert!(!saga.any_reserved());
    }

    #[test]
    fn test_out_of_range_leg_index_is_ignored() {
        let saga = SagaInstance::from_events([started(), SagaEvent::leg_reserved(9)]);
        assert!(saga.held_legs().is_empty());
    }

    #[test]
    fn test_cancellation() {
        let saga = SagaInstance::from_events([
            started(),
            SagaEvent::leg_reserved(0),
            SagaEvent::LocalLegsReserved,
            SagaEvent::saga_committed(),
            SagaEvent::leg_released(0),
            SagaEvent::reservation_cancelled(),
        ]);
        assert!(saga.is_cancelled());
        assert_eq!(saga.state(), SagaState::Committed);
    }
}
