use std::collections::BTreeMap;

use common::{ClientId, RequestId, ReservationResponse, ResourceId, ResourceRef, ResponseStatus};
use serde::{Deserialize, Serialize};

use crate::aggregate::SagaInstance;
use crate::leg::{LegOutcome, ReservationLeg};
use crate::state::SagaState;

/// What [`SagaCoordinator::handle_reservation_request`](crate::SagaCoordinator::handle_reservation_request)
/// returns once a saga reaches a terminal state.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReservationOutcome {
    pub request_id: RequestId,
    pub client_id: ClientId,
    pub state: SagaState,
    /// True for each leg that was reserved, false otherwise, keyed by
    /// [`ResourceRef::key`].
    pub availability_map: BTreeMap<String, bool>,
    pub legs: Vec<ReservationLeg>,
    pub message: String,
    /// Resources left falsely held because their release failed.
    pub compensation_failures: Vec<ResourceId>,
}

impl ReservationOutcome {
    pub fn from_saga(saga: &SagaInstance) -> Self {
        let availability_map = saga
            .legs()
            .iter()
            .map(|leg| {
                let reserved = leg.outcome.as_ref().is_some_and(LegOutcome::is_reserved);
                let key = ResourceRef::new(leg.owner_node_id.clone(), leg.resource_id.clone()).key();
                (key, reserved)
            })
            .collect();

        let message = match saga.state() {
            SagaState::Committed => format!("{} resource(s) reserved", saga.legs().len()),
            _ => saga
                .failure_reason()
                .unwrap_or("reservation failed")
                .to_string(),
        };

        Self {
            request_id: saga.request_id().cloned().unwrap_or_else(|| RequestId::new("")),
            client_id: saga.client_id().cloned().unwrap_or_else(|| ClientId::new("")),
            state: saga.state(),
            availability_map,
            legs: saga.legs().to_vec(),
            message,
            compensation_failures: saga.compensation_failures(),
        }
    }

    pub fn is_committed(&self) -> bool {
        self.state == SagaState::Committed
    }

    /// The message published to the client's response topic.
    pub fn to_response(&self) -> ReservationResponse {
        ReservationResponse {
            request_id: self.request_id.clone(),
            status: if self.is_committed() {
                ResponseStatus::Reserved
            } else {
                ResponseStatus::Unavailable
            },
            availability_map: self.availability_map.clone(),
            message: self.message.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use common::NodeId;

    use super::*;
    use crate::events::SagaEvent;

    fn saga(events: Vec<SagaEvent>) -> SagaInstance {
        let mut all = vec![SagaEvent::saga_started(
            RequestId::from("req-1"),
            ClientId::from("car-1"),
            NodeId::from("node-1"),
            vec![
                ResourceRef::new("node-1", "R1"),
                ResourceRef::new("node-2", "R2"),
            ],
        )];
        all.extend(events);
        SagaInstance::from_events(all)
    }

    #[test]
    fn committed_outcome_reports_reserved() {
        let outcome = ReservationOutcome::from_saga(&saga(vec![
            SagaEvent::leg_reserved(0),
            SagaEvent::LocalLegsReserved,
            SagaEvent::peer_check_started(1),
            SagaEvent::leg_reserved(1),
            SagaEvent::saga_committed(),
        ]));
        let response = outcome.to_response();
        assert_eq!(response.status, ResponseStatus::Reserved);
        assert!(response.availability_map.values().all(|v| *v));
        assert_eq!(response.request_id, RequestId::from("req-1"));
    }

    #[test]
    fn compensated_outcome_reports_per_resource_map() {
        let outcome = ReservationOutcome::from_saga(&saga(vec![
            SagaEvent::leg_reserved(0),
            SagaEvent::LocalLegsReserved,
            SagaEvent::peer_check_started(1),
            SagaEvent::leg_failed(1, LegOutcome::Unavailable),
            SagaEvent::compensation_started("R2 unavailable"),
            SagaEvent::leg_released(0),
            SagaEvent::saga_compensated("R2 unavailable"),
        ]));
        let response = outcome.to_response();
        assert_eq!(response.status, ResponseStatus::Unavailable);
        assert!(response.availability_map["node-1/R1"]);
        assert!(!response.availability_map["node-2/R2"]);
        assert_eq!(response.message, "R2 unavailable");
    }
}
