//! Point-to-point calls to peer nodes.
//!
//! Used for legs whose resource is owned by another node. Reserve calls are
//! never retried; release and confirm are idempotent on the peer and may be.

mod http;
mod memory;

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use common::{ClientId, NodeId, RequestId, ResourceId};
use resource_store::{
    RecordStatus, ReleaseOutcome, ReservationRecord, ReserveOutcome, ResourceStore, StoreError,
};
use serde::{Deserialize, Serialize};
use thiserror::Error;

pub use http::{HttpPeerClient, HttpPeerConfig};
pub use memory::{InMemoryPeerClient, PeerCall};

/// Failure of a call to a peer node.
///
/// For the commit decision every variant counts as "unavailable".
#[derive(Debug, Error)]
pub enum PeerError {
    /// The peer is not in this node's directory.
    #[error("Unknown peer node: {0}")]
    UnknownPeer(NodeId),

    /// The peer could not be reached.
    #[error("Peer {node} unreachable: {reason}")]
    Unreachable { node: NodeId, reason: String },

    /// The peer did not answer in time. It may still have applied the call.
    #[error("Peer {node} did not answer within {timeout:?}")]
    Timeout { node: NodeId, timeout: Duration },

    /// The peer answered with a non-success status.
    #[error("Peer {node} rejected the call with status {status}: {body}")]
    Rejected {
        node: NodeId,
        status: u16,
        body: String,
    },

    /// The peer's answer could not be decoded.
    #[error("Peer {node} sent an invalid response: {reason}")]
    InvalidResponse { node: NodeId, reason: String },
}

impl PeerError {
    pub fn node(&self) -> &NodeId {
        match self {
            PeerError::UnknownPeer(node)
            | PeerError::Unreachable { node, .. }
            | PeerError::Timeout { node, .. }
            | PeerError::Rejected { node, .. }
            | PeerError::InvalidResponse { node, .. } => node,
        }
    }

    /// Label used for the failure metric.
    pub fn kind(&self) -> &'static str {
        match self {
            PeerError::UnknownPeer(_) => "unknown_peer",
            PeerError::Unreachable { .. } => "unreachable",
            PeerError::Timeout { .. } => "timeout",
            PeerError::Rejected { .. } => "rejected",
            PeerError::InvalidResponse { .. } => "invalid_response",
        }
    }
}

/// Optional body of `POST /resources/{id}/reserve`. The named request is
/// remembered as the station's holder, so a later release for it cannot free
/// a station someone else has taken since.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ReserveBody {
    #[serde(default)]
    pub request_id: Option<RequestId>,
}

/// Body of a peer's answer to `POST /resources/{id}/reserve`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReserveReply {
    pub outcome: ReserveOutcome,
}

/// Optional body of `POST /resources/{id}/release`. When a request ID is
/// given, the peer cancels that request's records and releases the station
/// only if that request holds it.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ReleaseBody {
    #[serde(default)]
    pub request_id: Option<RequestId>,
}

/// Body of a peer's answer to `POST /resources/{id}/release`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReleaseReply {
    pub ack: bool,
    pub outcome: ReleaseOutcome,
}

/// Body of `POST /resources/{id}/confirm`: the record the peer must persist
/// for a committed leg. Keyed by `request_id`, so repeating it is harmless.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Confirmation {
    pub request_id: RequestId,
    pub client_id: ClientId,
    pub valid_from: DateTime<Utc>,
    pub valid_until: DateTime<Utc>,
}

impl Confirmation {
    pub fn into_record(self, resource_id: ResourceId) -> ReservationRecord {
        ReservationRecord {
            request_id: self.request_id,
            resource_id,
            client_id: self.client_id,
            valid_from: self.valid_from,
            valid_until: self.valid_until,
            status: RecordStatus::Confirmed,
            created_at: Utc::now(),
        }
    }
}

/// Body of a peer's answer to `POST /resources/{id}/confirm`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConfirmReply {
    pub ack: bool,
}

/// Calls to the node that owns a resource.
#[async_trait]
pub trait PeerClient: Send + Sync {
    /// Asks the peer to atomically reserve one of its resources for
    /// `request_id`. Single attempt.
    async fn check_and_reserve_remote(
        &self,
        peer: &NodeId,
        resource_id: &ResourceId,
        request_id: &RequestId,
    ) -> Result<ReserveOutcome, PeerError>;

    /// Asks the peer to release a resource held for `request_id`. A station
    /// held by another request is left alone.
    async fn release_remote(
        &self,
        peer: &NodeId,
        resource_id: &ResourceId,
        request_id: &RequestId,
    ) -> Result<ReleaseOutcome, PeerError>;

    /// Asks the peer to persist the record of a committed leg.
    async fn confirm_remote(
        &self,
        peer: &NodeId,
        resource_id: &ResourceId,
        confirmation: &Confirmation,
    ) -> Result<(), PeerError>;
}

#[async_trait]
impl<T: PeerClient + ?Sized> PeerClient for Arc<T> {
    async fn check_and_reserve_remote(
        &self,
        peer: &NodeId,
        resource_id: &ResourceId,
        request_id: &RequestId,
    ) -> Result<ReserveOutcome, PeerError> {
        (**self)
            .check_and_reserve_remote(peer, resource_id, request_id)
            .await
    }

    async fn release_remote(
        &self,
        peer: &NodeId,
        resource_id: &ResourceId,
        request_id: &RequestId,
    ) -> Result<ReleaseOutcome, PeerError> {
        (**self).release_remote(peer, resource_id, request_id).await
    }

    async fn confirm_remote(
        &self,
        peer: &NodeId,
        resource_id: &ResourceId,
        confirmation: &Confirmation,
    ) -> Result<(), PeerError> {
        (**self).confirm_remote(peer, resource_id, confirmation).await
    }
}

/// Peer-side handling of a reserve.
pub async fn reserve_owned<S: ResourceStore + ?Sized>(
    store: &S,
    resource_id: &ResourceId,
    request_id: Option<&RequestId>,
) -> resource_store::Result<ReserveOutcome> {
    store.reserve_for(resource_id, request_id).await
}

/// Peer-side handling of a release. With a request named, its records are
/// cancelled and the station is released only if that request holds it;
/// without one the station is released unconditionally.
pub async fn release_owned<S: ResourceStore + ?Sized>(
    store: &S,
    resource_id: &ResourceId,
    request_id: Option<&RequestId>,
) -> resource_store::Result<ReleaseOutcome> {
    if let Some(request_id) = request_id {
        let cancelled = store.cancel_reservations(request_id).await?;
        if !cancelled.is_empty() {
            tracing::info!(%request_id, count = cancelled.len(), "Cancelled records before release");
        }
    }
    let outcome = store.release_for(resource_id, request_id).await?;
    if outcome == ReleaseOutcome::HeldByOther {
        tracing::info!(%resource_id, "Station held by another request; left reserved");
    }
    Ok(outcome)
}

/// Peer-side handling of a confirm.
pub async fn confirm_owned<S: ResourceStore + ?Sized>(
    store: &S,
    resource_id: &ResourceId,
    confirmation: Confirmation,
) -> resource_store::Result<()> {
    store
        .record_reservation(confirmation.into_record(resource_id.clone()))
        .await
}

/// HTTP-like status a peer returns for a store error.
pub fn status_for_store_error(error: &StoreError) -> u16 {
    match error {
        StoreError::NotFound(_) => 404,
        StoreError::Conflict { .. } => 409,
        StoreError::InvalidResource(_) => 400,
        StoreError::LockTimeout(_) => 503,
        StoreError::Database(_) | StoreError::Migration(_) => 500,
    }
}
