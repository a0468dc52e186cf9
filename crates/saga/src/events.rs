//! Saga journal events.

use chrono::{DateTime, Utc};
use common::{ClientId, NodeId, RequestId, ResourceRef};
use serde::{Deserialize, Serialize};

use crate::leg::LegOutcome;

/// Events recorded while a reservation saga runs.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "data")]
pub enum SagaEvent {
    /// The request passed validation and its legs were laid out.
    SagaStarted(SagaStartedData),

    /// A leg's resource was reserved.
    LegReserved(LegData),

    /// A leg's reservation attempt failed.
    LegFailed(LegFailedData),

    /// Every local leg is reserved.
    LocalLegsReserved,

    /// Peer legs were requested.
    PeerCheckStarted(PeerCheckData),

    /// A leg failed and reserved legs are being released.
    CompensationStarted(CompensationData),

    /// A reserved or confirmed leg's resource was released.
    LegReleased(LegData),

    /// Releasing a leg failed (logged, compensation continues).
    CompensationStepFailed(StepFailedData),

    /// A leg's reservation record was persisted.
    LegConfirmed(LegData),

    /// Persisting a peer leg's record failed after retries.
    ConfirmFailed(StepFailedData),

    /// Every leg was reserved.
    SagaCommitted(TimestampData),

    /// Compensation finished.
    SagaCompensated(SagaFailedData),

    /// The first local leg failed; nothing was held.
    SagaFailedUpfront(SagaFailedData),

    /// A committed reservation was cancelled by its client.
    ReservationCancelled(TimestampData),
}

impl SagaEvent {
    pub fn event_type(&self) -> &'static str {
        match self {
            SagaEvent::SagaStarted(_) => "SagaStarted",
            SagaEvent::LegReserved(_) => "LegReserved",
            SagaEvent::LegFailed(_) => "LegFailed",
            SagaEvent::LocalLegsReserved => "LocalLegsReserved",
            SagaEvent::PeerCheckStarted(_) => "PeerCheckStarted",
            SagaEvent::CompensationStarted(_) => "CompensationStarted",
            SagaEvent::LegReleased(_) => "LegReleased",
            SagaEvent::CompensationStepFailed(_) => "CompensationStepFailed",
            SagaEvent::LegConfirmed(_) => "LegConfirmed",
            SagaEvent::ConfirmFailed(_) => "ConfirmFailed",
            SagaEvent::SagaCommitted(_) => "SagaCommitted",
            SagaEvent::SagaCompensated(_) => "SagaCompensated",
            SagaEvent::SagaFailedUpfront(_) => "SagaFailedUpfront",
            SagaEvent::ReservationCancelled(_) => "ReservationCancelled",
        }
    }
}

/// Data for SagaStarted event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SagaStartedData {
    pub request_id: RequestId,
    pub client_id: ClientId,
    /// The coordinating node.
    pub node_id: NodeId,
    /// Legs in request order.
    pub resource_refs: Vec<ResourceRef>,
    pub started_at: DateTime<Utc>,
}

/// Identifies a leg by its position in the request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LegData {
    pub index: usize,
}

/// Data for LegFailed event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LegFailedData {
    pub index: usize,
    pub outcome: LegOutcome,
}

/// Data for PeerCheckStarted event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PeerCheckData {
    pub peer_legs: usize,
}

/// Data for CompensationStarted event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CompensationData {
    pub reason: String,
}

/// Data for failed release or confirm steps.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepFailedData {
    pub index: usize,
    pub error: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TimestampData {
    pub at: DateTime<Utc>,
}

/// Data for the failure terminal events.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SagaFailedData {
    pub reason: String,
    pub at: DateTime<Utc>,
}

// Convenience constructors
impl SagaEvent {
    pub fn saga_started(
        request_id: RequestId,
        client_id: ClientId,
        node_id: NodeId,
        resource_refs: Vec<ResourceRef>,
    ) -> Self {
        SagaEvent::SagaStarted(SagaStartedData {
            request_id,
            client_id,
            node_id,
            resource_refs,
            started_at: Utc::now(),
        })
    }

    pub fn leg_reserved(index: usize) -> Self {
        SagaEvent::LegReserved(LegData { index })
    }

    pub fn leg_failed(index: usize, outcome: LegOutcome) -> Self {
        SagaEvent::LegFailed(LegFailedData { index, outcome })
    }

    pub fn peer_check_started(peer_legs: usize) -> Self {
        SagaEvent::PeerCheckStarted(PeerCheckData { peer_legs })
    }

    pub fn compensation_started(reason: impl Into<String>) -> Self {
        SagaEvent::CompensationStarted(CompensationData {
            reason: reason.into(),
        })
    }

    pub fn leg_released(index: usize) -> Self {
        SagaEvent::LegReleased(LegData { index })
    }

    pub fn compensation_step_failed(index: usize, error: impl Into<String>) -> Self {
        SagaEvent::CompensationStepFailed(StepFailedData {
            index,
            error: error.into(),
        })
    }

    pub fn leg_confirmed(index: usize) -> Self {
        SagaEvent::LegConfirmed(LegData { index })
    }

    pub fn confirm_failed(index: usize, error: impl Into<String>) -> Self {
        SagaEvent::ConfirmFailed(StepFailedData {
            index,
            error: error.into(),
        })
    }

    pub fn saga_committed() -> Self {
        SagaEvent::SagaCommitted(TimestampData { at: Utc::now() })
    }

    pub fn saga_compensated(reason: impl Into<String>) -> Self {
        SagaEvent::SagaCompensated(SagaFailedData {
            reason: reason.into(),
            at: Utc::now(),
        })
    }

    pub fn saga_failed_upfront(reason: impl Into<String>) -> Self {
        SagaEvent::SagaFailedUpfront(SagaFailedData {
            reason: reason.into(),
            at: Utc::now(),
        })
    }

    pub fn reservation_cancelled() -> Self {
        SagaEvent::ReservationCancelled(TimestampData { at: Utc::now() })
    }
}
