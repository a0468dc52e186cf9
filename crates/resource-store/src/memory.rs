use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use common::{RequestId, ResourceId};
use tokio::sync::{Mutex, MutexGuard, RwLock};

use crate::{
    RecordStatus, ReleaseOutcome, ReservationFilter, ReservationRecord, ReserveOutcome, Resource,
    ResourceFilter, Result, StoreError, store::ResourceStore,
};

/// How long release and maintenance updates wait for a station lock.
///
/// Reservation attempts use the much shorter `lock_wait` instead; a release
/// that gives up would leave the station falsely reserved.
pub const DEFAULT_RELEASE_WAIT: Duration = Duration::from_secs(1);

type Slot = Arc<Mutex<Resource>>;

/// In-memory resource store.
///
/// Each station sits behind its own mutex, so reservations of different
/// stations never contend and reservations of the same station are
/// linearized. Cloning shares the underlying state.
#[derive(Clone)]
pub struct InMemoryResourceStore {
    slots: Arc<RwLock<HashMap<ResourceId, Slot>>>,
    records: Arc<RwLock<Vec<ReservationRecord>>>,
    lock_wait: Duration,
    release_wait: Duration,
}

impl Default for InMemoryResourceStore {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryResourceStore {
    /// Creates an empty store that refuses immediately on a busy lock.
    pub fn new() -> Self {
        Self::with_lock_wait(Duration::ZERO)
    }

    /// Creates an empty store that waits up to `lock_wait` for a busy
    /// station before reporting it unavailable.
    pub fn with_lock_wait(lock_wait: Duration) -> Self {
        Self {
            slots: Arc::new(RwLock::new(HashMap::new())),
            records: Arc::new(RwLock::new(Vec::new())),
            lock_wait,
            release_wait: DEFAULT_RELEASE_WAIT.max(lock_wait),
        }
    }

    /// Creates a store pre-populated with stations.
    pub async fn seeded(resources: impl IntoIterator<Item = Resource>) -> Result<Self> {
        let store = Self::new();
        for resource in resources {
            store.upsert_resource(resource).await?;
        }
        Ok(store)
    }

    /// Returns the number of stations held.
    pub async fn resource_count(&self) -> usize {
        self.slots.read().await.len()
    }

    /// Returns the number of reservation records held, in any status.
    pub async fn record_count(&self) -> usize {
        self.records.read().await.len()
    }

    /// Holds a station's lock for `hold`, simulating a slow concurrent writer.
    pub async fn hold_lock_for(&self, resource_id: &ResourceId, hold: Duration) -> Result<()> {
        let slot = self
            .slot(resource_id)
            .await
            .ok_or_else(|| StoreError::NotFound(resource_id.clone()))?;
        let _guard = slot.lock().await;
        tokio::time::sleep(hold).await;
        Ok(())
    }

    async fn slot(&self, resource_id: &ResourceId) -> Option<Slot> {
        self.slots.read().await.get(resource_id).cloned()
    }

    async fn acquire(slot: &Slot, wait: Duration) -> Option<MutexGuard<'_, Resource>> {
        if wait.is_zero() {
            slot.try_lock().ok()
        } else {
            tokio::time::timeout(wait, slot.lock()).await.ok()
        }
    }

    async fn close_active_records(&self, resource_id: &ResourceId, status: RecordStatus) {
        let mut records = self.records.write().await;
        for record in records
            .iter_mut()
            .filter(|r| &r.resource_id == resource_id && r.is_active())
        {
            record.status = status;
        }
    }
}

#[async_trait]
impl ResourceStore for InMemoryResourceStore {
    #[tracing::instrument(skip(self, holder), fields(%resource_id))]
    async fn reserve_for(
        &self,
        resource_id: &ResourceId,
        holder: Option<&RequestId>,
    ) -> Result<ReserveOutcome> {
        let Some(slot) = self.slot(resource_id).await else {
            return Ok(ReserveOutcome::NotFound);
        };

        let outcome = match Self::acquire(&slot, self.lock_wait).await {
            Some(mut resource) => resource.try_reserve(holder),
            None => {
                tracing::debug!("station lock busy, reporting unavailable");
                ReserveOutcome::Unavailable
            }
        };

        metrics::counter!("resource_reserve_total", "outcome" => outcome.as_str()).increment(1);
        Ok(outcome)
    }

    #[tracing::instrument(skip(self, holder), fields(%resource_id))]
    async fn release_for(
        &self,
        resource_id: &ResourceId,
        holder: Option<&RequestId>,
    ) -> Result<ReleaseOutcome> {
        let Some(slot) = self.slot(resource_id).await else {
            return Ok(ReleaseOutcome::NotFound);
        };

        let outcome = {
            let mut resource = Self::acquire(&slot, self.release_wait)
                .await
                .ok_or_else(|| StoreError::LockTimeout(resource_id.clone()))?;
            resource.release(holder)
        };

        if outcome == ReleaseOutcome::Released {
            self.close_active_records(resource_id, RecordStatus::Completed)
                .await;
        }
        metrics::counter!("resource_release_total", "outcome" => outcome.as_str()).increment(1);
        Ok(outcome)
    }

    async fn get_resource(&self, resource_id: &ResourceId) -> Result<Option<Resource>> {
        let Some(slot) = self.slot(resource_id).await else {
            return Ok(None);
        };
        let resource = Self::acquire(&slot, self.release_wait)
            .await
            .ok_or_else(|| StoreError::LockTimeout(resource_id.clone()))?;
        Ok(Some(resource.clone()))
    }

    async fn list_resources(&self, filter: ResourceFilter) -> Result<Vec<Resource>> {
        let slots: Vec<Slot> = self.slots.read().await.values().cloned().collect();

        let mut resources = Vec::with_capacity(slots.len());
        for slot in slots {
            let resource = slot.lock().await.clone();
            if filter.matches(&resource) {
                resources.push(resource);
            }
        }
        resources.sort_by(|a, b| a.id.cmp(&b.id));
        Ok(resources)
    }

    async fn upsert_resource(&self, resource: Resource) -> Result<()> {
        resource.validate().map_err(StoreError::InvalidResource)?;

        let existing = self.slot(&resource.id).await;
        match existing {
            Some(slot) => {
                let mut current = Self::acquire(&slot, self.release_wait)
                    .await
                    .ok_or_else(|| StoreError::LockTimeout(resource.id.clone()))?;
                *current = resource;
            }
            None => {
                let mut slots = self.slots.write().await;
                slots
                    .entry(resource.id.clone())
                    .or_insert_with(|| Arc::new(Mutex::new(resource)));
            }
        }
        Ok(())
    }

    async fn set_maintenance(
        &self,
        resource_id: &ResourceId,
        under_maintenance: bool,
    ) -> Result<Resource> {
        let slot = self
            .slot(resource_id)
            .await
            .ok_or_else(|| StoreError::NotFound(resource_id.clone()))?;
        let mut resource = Self::acquire(&slot, self.release_wait)
            .await
            .ok_or_else(|| StoreError::LockTimeout(resource_id.clone()))?;
        resource.under_maintenance = under_maintenance;
        resource.updated_at = Utc::now();
        Ok(resource.clone())
    }

    async fn record_reservation(&self, record: ReservationRecord) -> Result<()> {
        if self.slot(&record.resource_id).await.is_none() {
            return Err(StoreError::NotFound(record.resource_id));
        }

        let mut records = self.records.write().await;
        if records
            .iter()
            .any(|r| r.request_id == record.request_id && r.resource_id == record.resource_id)
        {
            return Ok(());
        }
        if let Some(active) = records
            .iter()
            .find(|r| r.resource_id == record.resource_id && r.is_active())
        {
            return Err(StoreError::Conflict {
                resource_id: record.resource_id,
                existing: active.request_id.clone(),
            });
        }
        records.push(record);
        Ok(())
    }

    async fn reservations_for_request(
        &self,
        request_id: &RequestId,
    ) -> Result<Vec<ReservationRecord>> {
        let records = self.records.read().await;
        let mut matching: Vec<_> = records
            .iter()
            .filter(|r| &r.request_id == request_id)
            .cloned()
            .collect();
        matching.sort_by(|a, b| a.resource_id.cmp(&b.resource_id));
        Ok(matching)
    }

    async fn list_reservations(
        &self,
        filter: ReservationFilter,
    ) -> Result<Vec<ReservationRecord>> {
        let records = self.records.read().await;
        Ok(records.iter().filter(|r| filter.matches(r)).cloned().collect())
    }

    async fn cancel_reservations(&self, request_id: &RequestId) -> Result<Vec<ReservationRecord>> {
        let mut records = self.records.write().await;
        let mut cancelled = Vec::new();
        for record in records
            .iter_mut()
            .filter(|r| &r.request_id == request_id && r.is_active())
        {
            record.status = RecordStatus::Cancelled;
            cancelled.push(record.clone());
        }
        Ok(cancelled)
    }
}
