use std::sync::Arc;

use async_trait::async_trait;
use common::{RequestId, ResourceId};

use crate::{
    ReleaseOutcome, ReservationFilter, ReservationRecord, ReserveOutcome, Resource, ResourceFilter,
    Result,
};

/// Authoritative state of the stations owned by one node.
///
/// This is the only component allowed to write station availability. All
/// implementations must be thread-safe (Send + Sync).
#[async_trait]
pub trait ResourceStore: Send + Sync {
    /// Reads availability and takes the station in one critical section,
    /// without naming a holder.
    async fn check_and_reserve(&self, resource_id: &ResourceId) -> Result<ReserveOutcome> {
        self.reserve_for(resource_id, None).await
    }

    /// Reads availability and takes the station in one critical section,
    /// remembering `holder` as the request holding it.
    ///
    /// If another caller holds the station's lock for longer than the
    /// configured wait, returns `Unavailable` instead of blocking.
    async fn reserve_for(
        &self,
        resource_id: &ResourceId,
        holder: Option<&RequestId>,
    ) -> Result<ReserveOutcome>;

    /// Makes the station available again, whoever holds it.
    async fn release(&self, resource_id: &ResourceId) -> Result<ReleaseOutcome> {
        self.release_for(resource_id, None).await
    }

    /// Makes the station available again.
    ///
    /// With a holder, the station is released only if that request holds
    /// it; otherwise `HeldByOther` is returned and nothing changes.
    /// Idempotent: releasing an available station is a no-op. Any confirmed
    /// record still holding the station is closed as completed.
    async fn release_for(
        &self,
        resource_id: &ResourceId,
        holder: Option<&RequestId>,
    ) -> Result<ReleaseOutcome>;

    /// Loads a single station.
    async fn get_resource(&self, resource_id: &ResourceId) -> Result<Option<Resource>>;

    /// Lists stations ordered by ID.
    async fn list_resources(&self, filter: ResourceFilter) -> Result<Vec<Resource>>;

    /// Adds a station or replaces its descriptive fields and flags.
    async fn upsert_resource(&self, resource: Resource) -> Result<()>;

    /// Puts a station in or out of maintenance.
    async fn set_maintenance(
        &self,
        resource_id: &ResourceId,
        under_maintenance: bool,
    ) -> Result<Resource>;

    /// Persists the record of a committed leg.
    ///
    /// Idempotent on `(request_id, resource_id)`. Fails with `Conflict` if a
    /// different request already holds an active record for the station.
    async fn record_reservation(&self, record: ReservationRecord) -> Result<()>;

    /// Returns the records written for a request, in resource order.
    async fn reservations_for_request(
        &self,
        request_id: &RequestId,
    ) -> Result<Vec<ReservationRecord>>;

    /// Lists records, oldest first.
    async fn list_reservations(&self, filter: ReservationFilter)
    -> Result<Vec<ReservationRecord>>;

    /// Marks every active record of a request as cancelled and returns them.
    async fn cancel_reservations(&self, request_id: &RequestId) -> Result<Vec<ReservationRecord>>;
}

#[async_trait]
impl<T: ResourceStore + ?Sized> ResourceStore for Arc<T> {
    async fn reserve_for(
        &self,
        resource_id: &ResourceId,
        holder: Option<&RequestId>,
    ) -> Result<ReserveOutcome> {
        (**self).reserve_for(resource_id, holder).await
    }

    async fn release_for(
        &self,
        resource_id: &ResourceId,
        holder: Option<&RequestId>,
    ) -> Result<ReleaseOutcome> {
        (**self).release_for(resource_id, holder).await
    }

    async fn get_resource(&self, resource_id: &ResourceId) -> Result<Option<Resource>> {
        (**self).get_resource(resource_id).await
    }

    async fn list_resources(&self, filter: ResourceFilter) -> Result<Vec<Resource>> {
        (**self).list_resources(filter).await
    }

    async fn upsert_resource(&self, resource: Resource) -> Result<()> {
        (**self).upsert_resource(resource).await
    }

    async fn set_maintenance(
        &self,
        resource_id: &ResourceId,
        under_maintenance: bool,
    ) -> Result<Resource> {
        (**self).set_maintenance(resource_id, under_maintenance).await
    }

    async fn record_reservation(&self, record: ReservationRecord) -> Result<()> {
        (**self).record_reservation(record).await
    }

    async fn reservations_for_request(
        &self,
        request_id: &RequestId,
    ) -> Result<Vec<ReservationRecord>> {
        (**self).reservations_for_request(request_id).await
    }

    async fn list_reservations(
        &self,
        filter: ReservationFilter,
    ) -> Result<Vec<ReservationRecord>> {
        (**self).list_reservations(filter).await
    }

    async fn cancel_reservations(&self, request_id: &RequestId) -> Result<Vec<ReservationRecord>> {
        (**self).cancel_reservations(request_id).await
    }
}
