//! Reservation legs and their outcomes.

use common::{NodeId, RequestId, ResourceId, ResourceRef};
use resource_store::ReserveOutcome;
use serde::{Deserialize, Serialize};

use crate::peer::PeerError;

/// Lifecycle of one leg.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum LegState {
    #[default]
    Pending,
    Reserved,
    Confirmed,
    Cancelled,
    Failed,
}

impl LegState {
    pub fn as_str(&self) -> &'static str {
        match self {
            LegState::Pending => "pending",
            LegState::Reserved => "reserved",
            LegState::Confirmed => "confirmed",
            LegState::Cancelled => "cancelled",
            LegState::Failed => "failed",
        }
    }

    /// Returns true if the leg's station is held and must be released to undo it.
    pub fn holds_resource(&self) -> bool {
        matches!(self, LegState::Reserved | LegState::Confirmed)
    }
}

/// What a reservation attempt for one leg produced.
///
/// Every variant other than `Reserved` counts as a failure for the commit
/// decision; the distinction is kept for logs and status queries.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum LegOutcome {
    Reserved,
    Unavailable,
    NotFound,
    UnderMaintenance,
    /// The local store failed.
    StoreError { reason: String },
    /// The peer could not be reached.
    PeerUnreachable { reason: String },
    /// The peer did not answer within the peer timeout.
    PeerTimeout,
    /// The peer answered with an error.
    PeerRejected { reason: String },
    /// The saga deadline passed while the call was in flight.
    DeadlineExceeded,
}

impl LegOutcome {
    pub fn is_reserved(&self) -> bool {
        matches!(self, LegOutcome::Reserved)
    }

    /// Returns true if the peer may have applied the reservation even though
    /// the caller never learned of it.
    pub fn is_ambiguous(&self) -> bool {
        matches!(self, LegOutcome::PeerTimeout | LegOutcome::DeadlineExceeded)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            LegOutcome::Reserved => "reserved",
            LegOutcome::Unavailable => "unavailable",
            LegOutcome::NotFound => "not_found",
            LegOutcome::UnderMaintenance => "under_maintenance",
            LegOutcome::StoreError { .. } => "store_error",
            LegOutcome::PeerUnreachable { .. } => "peer_unreachable",
            LegOutcome::PeerTimeout => "peer_timeout",
            LegOutcome::PeerRejected { .. } => "peer_rejected",
            LegOutcome::DeadlineExceeded => "deadline_exceeded",
        }
    }
}

impl From<ReserveOutcome> for LegOutcome {
    fn from(outcome: ReserveOutcome) -> Self {
        match outcome {
            ReserveOutcome::Reserved => LegOutcome::Reserved,
            ReserveOutcome::Unavailable => LegOutcome::Unavailable,
            ReserveOutcome::NotFound => LegOutcome::NotFound,
            ReserveOutcome::UnderMaintenance => LegOutcome::UnderMaintenance,
        }
    }
}

impl From<&PeerError> for LegOutcome {
    fn from(error: &PeerError) -> Self {
        match error {
            PeerError::Timeout { .. } => LegOutcome::PeerTimeout,
            PeerError::Rejected { .. } | PeerError::InvalidResponse { .. } => {
                LegOutcome::PeerRejected {
                    reason: error.to_string(),
                }
            }
            PeerError::Unreachable { .. } | PeerError::UnknownPeer(_) => {
                LegOutcome::PeerUnreachable {
                    reason: error.to_string(),
                }
            }
        }
    }
}

impl std::fmt::Display for LegOutcome {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            LegOutcome::StoreError { reason }
            | LegOutcome::PeerUnreachable { reason }
            | LegOutcome::PeerRejected { reason } => write!(f, "{}: {reason}", self.as_str()),
            _ => f.write_str(self.as_str()),
        }
    }
}

/// One resource-reservation step of a request, owned by exactly one node.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReservationLeg {
    pub leg_id: String,
    pub owner_node_id: NodeId,
    pub resource_id: ResourceId,
    /// True if the coordinating node owns the resource.
    pub local: bool,
    pub state: LegState,
    pub outcome: Option<LegOutcome>,
    /// Set when releasing this leg failed; the station may be falsely held.
    pub compensation_failed: bool,
    /// Last error seen while releasing or confirming the leg.
    pub last_error: Option<String>,
}

impl ReservationLeg {
    pub fn new(request_id: &RequestId, index: usize, resource: &ResourceRef, local: bool) -> Self {
        Self {
            leg_id: format!("{request_id}:{index}"),
            owner_node_id: resource.node_id.clone(),
            resource_id: resource.resource_id.clone(),
            local,
            state: LegState::Pending,
            outcome: None,
            compensation_failed: false,
            last_error: None,
        }
    }

    pub fn is_reserved(&self) -> bool {
        self.state == LegState::Reserved
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;

    #[test]
    fn leg_ids_follow_request_order() {
        let request_id = RequestId::from("req-1");
        let leg = ReservationLeg::new(&request_id, 2, &ResourceRef::new("node-2", "R9"), false);
        assert_eq!(leg.leg_id, "req-1:2");
        assert_eq!(leg.state, LegState::Pending);
        assert!(!leg.local);
    }

    #[test]
    fn peer_errors_map_to_failures() {
        let timeout = PeerError::Timeout {
            node: NodeId::from("node-2"),
            timeout: Duration::from_secs(2),
        };
        assert_eq!(LegOutcome::from(&timeout), LegOutcome::PeerTimeout);
        assert!(LegOutcome::from(&timeout).is_ambiguous());

        let down = PeerError::Unreachable {
            node: NodeId::from("node-2"),
            reason: "connection refused".into(),
        };
        let outcome = LegOutcome::from(&down);
        assert!(matches!(outcome, LegOutcome::PeerUnreachable { .. }));
        assert!(!outcome.is_reserved());
        assert!(!outcome.is_ambiguous());
    }

    #[test]
    fn store_outcomes_convert() {
        assert!(LegOutcome::from(ReserveOutcome::Reserved).is_reserved());
        assert_eq!(
            LegOutcome::from(ReserveOutcome::UnderMaintenance),
            LegOutcome::UnderMaintenance
        );
    }

    #[test]
    fn outcome_wire_format() {
        let json = serde_json::to_value(LegOutcome::PeerRejected {
            reason: "500".into(),
        })
        .unwrap();
        assert_eq!(json["kind"], "peer_rejected");
        assert_eq!(json["reason"], "500");
    }

    #[test]
    fn held_states() {
        assert!(LegState::Reserved.holds_resource());
        assert!(LegState::Confirmed.holds_resource());
        assert!(!LegState::Failed.holds_resource());
        assert!(!LegState::Cancelled.holds_resource());
    }
}
