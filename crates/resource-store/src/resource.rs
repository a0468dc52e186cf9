//! Stations, reservation records and the outcomes of store operations.

use chrono::{DateTime, Duration, Utc};
use common::{ClientId, NodeId, RequestId, ResourceId};
use serde::{Deserialize, Serialize};

/// A reservable station owned by exactly one node.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Resource {
    pub id: ResourceId,
    pub name: String,
    pub location: String,
    pub owner_node_id: NodeId,
    pub available: bool,
    pub under_maintenance: bool,
    /// Request holding the station, when the reservation named one.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub held_by: Option<RequestId>,
    pub updated_at: DateTime<Utc>,
}

impl Resource {
    /// Creates an available station that is not under maintenance.
    pub fn new(
        id: impl Into<ResourceId>,
        name: impl Into<String>,
        location: impl Into<String>,
        owner_node_id: impl Into<NodeId>,
    ) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            location: location.into(),
            owner_node_id: owner_node_id.into(),
            available: true,
            under_maintenance: false,
            held_by: None,
            updated_at: Utc::now(),
        }
    }

    /// Marks the station as under maintenance.
    pub fn with_maintenance(mut self, under_maintenance: bool) -> Self {
        self.under_maintenance = under_maintenance;
        self
    }

    /// Marks the station as already taken.
    pub fn unavailable(mut self) -> Self {
        self.available = false;
        self
    }

    /// Returns true if a reservation attempt would currently succeed.
    pub fn is_reservable(&self) -> bool {
        self.available && !self.under_maintenance
    }

    /// Evaluates a reservation attempt and applies it in place.
    ///
    /// Must be called while holding the resource's exclusive lock.
    pub(crate) fn try_reserve(&mut self, holder: Option<&RequestId>) -> ReserveOutcome {
        if self.under_maintenance {
            ReserveOutcome::UnderMaintenance
        } else if !self.available {
            ReserveOutcome::Unavailable
        } else {
            self.available = false;
            self.held_by = holder.cloned();
            self.updated_at = Utc::now();
            ReserveOutcome::Reserved
        }
    }

    /// Flips the station back to available. A no-op if it already is.
    ///
    /// With a holder, only a hold taken by that request is released.
    pub(crate) fn release(&mut self, holder: Option<&RequestId>) -> ReleaseOutcome {
        if self.available {
            return ReleaseOutcome::AlreadyAvailable;
        }
        if holder.is_some_and(|h| self.held_by.as_ref() != Some(h)) {
            return ReleaseOutcome::HeldByOther;
        }
        self.available = true;
        self.held_by = None;
        self.updated_at = Utc::now();
        ReleaseOutcome::Released
    }

    pub(crate) fn validate(&self) -> Result<(), String> {
        if self.id.is_blank() {
            return Err("resource id must not be empty".to_string());
        }
        if self.owner_node_id.is_blank() {
            return Err(format!("resource {} has no owner node", self.id));
        }
        Ok(())
    }
}

/// Result of an atomic check-and-reserve.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReserveOutcome {
    /// The station was available and is now held for the caller.
    Reserved,
    /// The station is taken, or its lock is held by a concurrent caller.
    Unavailable,
    /// No station with that ID exists on this node.
    NotFound,
    /// The station exists but is out of service.
    UnderMaintenance,
}

impl ReserveOutcome {
    pub fn is_reserved(&self) -> bool {
        matches!(self, ReserveOutcome::Reserved)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ReserveOutcome::Reserved => "reserved",
            ReserveOutcome::Unavailable => "unavailable",
            ReserveOutcome::NotFound => "not_found",
            ReserveOutcome::UnderMaintenance => "under_maintenance",
        }
    }
}

impl std::fmt::Display for ReserveOutcome {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Result of a release.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReleaseOutcome {
    Released,
    AlreadyAvailable,
    NotFound,
    /// The station is held, but not by the request named in the release.
    HeldByOther,
}

impl ReleaseOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            ReleaseOutcome::Released => "released",
            ReleaseOutcome::AlreadyAvailable => "already_available",
            ReleaseOutcome::NotFound => "not_found",
            ReleaseOutcome::HeldByOther => "held_by_other",
        }
    }
}

/// Lifecycle of a committed reservation record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RecordStatus {
    /// The reservation holds the station.
    Confirmed,
    /// The reservation was cancelled by its client.
    Cancelled,
    /// The station was released after use.
    Completed,
}

impl RecordStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            RecordStatus::Confirmed => "confirmed",
            RecordStatus::Cancelled => "cancelled",
            RecordStatus::Completed => "completed",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "confirmed" => Some(RecordStatus::Confirmed),
            "cancelled" => Some(RecordStatus::Cancelled),
            "completed" => Some(RecordStatus::Completed),
            _ => None,
        }
    }
}

/// Durable proof that a leg of a committed request holds a station.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReservationRecord {
    pub request_id: RequestId,
    pub resource_id: ResourceId,
    pub client_id: ClientId,
    pub valid_from: DateTime<Utc>,
    pub valid_until: DateTime<Utc>,
    pub status: RecordStatus,
    pub created_at: DateTime<Utc>,
}

impl ReservationRecord {
    /// Creates a confirmed record valid from now for the given window.
    pub fn confirmed(
        request_id: RequestId,
        resource_id: ResourceId,
        client_id: ClientId,
        validity: Duration,
    ) -> Self {
        let now = Utc::now();
        Self {
            request_id,
            resource_id,
            client_id,
            valid_from: now,
            valid_until: now + validity,
            status: RecordStatus::Confirmed,
            created_at: now,
        }
    }

    pub fn is_active(&self) -> bool {
        self.status == RecordStatus::Confirmed
    }
}

/// Filter for listing stations.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ResourceFilter {
    pub available: Option<bool>,
    pub under_maintenance: Option<bool>,
}

impl ResourceFilter {
    pub fn matches(&self, resource: &Resource) -> bool {
        self.available.is_none_or(|a| resource.available == a)
            && self
                .under_maintenance
                .is_none_or(|m| resource.under_maintenance == m)
    }
}

/// Filter for listing reservation records.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ReservationFilter {
    pub client_id: Option<ClientId>,
    pub status: Option<RecordStatus>,
}

impl ReservationFilter {
    pub fn matches(&self, record: &ReservationRecord) -> bool {
        self.client_id
            .as_ref()
            .is_none_or(|c| &record.client_id == c)
            && self.status.is_none_or(|s| record.status == s)
    }
}
