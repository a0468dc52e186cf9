//! PostgreSQL integration tests
//!
//! These tests use a shared PostgreSQL container for efficiency.
//! Run with:
//!
//! ```bash
//! cargo test -p resource-store --test postgres_integration -- --test-threads=1
//! ```

use std::sync::Arc;
use std::time::Duration;

use chrono::Duration as ChronoDuration;
use common::{ClientId, RequestId, ResourceId};
use resource_store::{
    PostgresResourceStore, RecordStatus, ReleaseOutcome, ReservationFilter, ReservationRecord,
    ReserveOutcome, Resource, ResourceFilter, ResourceStore, StoreError,
};
use serial_test::serial;
use sqlx::PgPool;
use testcontainers::{ContainerAsync, runners::AsyncRunner};
use testcontainers_modules::postgres::Postgres;
use tokio::sync::OnceCell;

/// Shared container info - container stays alive for all tests
struct ContainerInfo {
    #[allow(dead_code)] // Container must stay alive for tests
    container: ContainerAsync<Postgres>,
    connection_string: String,
}

/// Global shared container
static CONTAINER: OnceCell<Arc<ContainerInfo>> = OnceCell::const_new();

async fn get_container_info() -> Arc<ContainerInfo> {
    CONTAINER
        .get_or_init(|| async {
            let container = Postgres::default().start().await.unwrap();

            let host = container.get_host().await.unwrap();
            let port = container.get_host_port_ipv4(5432).await.unwrap();

            let connection_string =
                format!("postgres://postgres:postgres@{}:{}/postgres", host, port);

            let temp_pool = PgPool::connect(&connection_string).await.unwrap();
            for migration in [
                include_str!("../../../migrations/001_create_resources_table.sql"),
                include_str!("../../../migrations/002_add_resource_holder.sql"),
            ] {
                sqlx::raw_sql(migration).execute(&temp_pool).await.unwrap();
            }
            temp_pool.close().await;

            Arc::new(ContainerInfo {
                container,
                connection_string,
            })
        })
        .await
        .clone()
}

/// Get a fresh store with its own pool and cleared tables
async fn get_test_store(lock_wait: Duration) -> PostgresResourceStore {
    let info = get_container_info().await;

    let pool = sqlx::postgres::PgPoolOptions::new()
        .max_connections(8)
        .connect(&info.connection_string)
        .await
        .unwrap();

    sqlx::query("TRUNCATE TABLE reservation_records, resources")
        .execute(&pool)
        .await
        .unwrap();

    let store = PostgresResourceStore::with_lock_wait(pool, lock_wait);
    for id in ["R1", "R2", "R3"] {
        store
            .upsert_resource(Resource::new(id, format!("Station {id}"), "Salvador", "node-1"))
            .await
            .unwrap();
    }
    store
}

fn record(request: &str, resource: &str) -> ReservationRecord {
    ReservationRecord::confirmed(
        RequestId::new(request),
        ResourceId::new(resource),
        ClientId::new("car-1"),
        ChronoDuration::hours(24),
    )
}

#[tokio::test]
#[serial]
async fn test_reserve_then_unavailable() {
    let store = get_test_store(Duration::ZERO).await;
    let r1 = ResourceId::new("R1");

    assert_eq!(
        store.check_and_reserve(&r1).await.unwrap(),
        ReserveOutcome::Reserved
    );
    assert_eq!(
        store.check_and_reserve(&r1).await.unwrap(),
        ReserveOutcome::Unavailable
    );
    assert_eq!(
        store
            .check_and_reserve(&ResourceId::new("missing"))
            .await
            .unwrap(),
        ReserveOutcome::NotFound
    );
}

#[tokio::test]
#[serial]
async fn test_maintenance_blocks_reservation() {
    let store = get_test_store(Duration::ZERO).await;
    let r2 = ResourceId::new("R2");

    let updated = store.set_maintenance(&r2, true).await.unwrap();
    assert!(updated.under_maintenance);
    assert_eq!(
        store.check_and_reserve(&r2).await.unwrap(),
        ReserveOutcome::UnderMaintenance
    );
}

#[tokio::test]
#[serial]
async fn test_locked_row_reports_unavailable() {
    let store = get_test_store(Duration::ZERO).await;

    // Hold the row lock from a separate transaction.
    let mut blocker = store.pool().begin().await.unwrap();
    sqlx::query("SELECT id FROM resources WHERE id = 'R1' FOR UPDATE")
        .execute(&mut *blocker)
        .await
        .unwrap();

    assert_eq!(
        store.check_and_reserve(&ResourceId::new("R1")).await.unwrap(),
        ReserveOutcome::Unavailable
    );

    blocker.rollback().await.unwrap();
    assert_eq!(
        store.check_and_reserve(&ResourceId::new("R1")).await.unwrap(),
        ReserveOutcome::Reserved
    );
}

#[tokio::test]
#[serial]
async fn test_concurrent_reservations_admit_exactly_one() {
    let store = get_test_store(Duration::from_millis(500)).await;

    let handles: Vec<_> = (0..8)
        .map(|_| {
            let store = store.clone();
            tokio::spawn(async move {
                store
                    .check_and_reserve(&ResourceId::new("R3"))
                    .await
                    .unwrap()
            })
        })
        .collect();

    let mut reserved = 0;
    for handle in handles {
        if handle.await.unwrap().is_reserved() {
            reserved += 1;
        }
    }
    assert_eq!(reserved, 1);
}

#[tokio::test]
#[serial]
async fn test_release_is_idempotent() {
    let store = get_test_store(Duration::ZERO).await;
    let r1 = ResourceId::new("R1");

    store.check_and_reserve(&r1).await.unwrap();
    assert_eq!(store.release(&r1).await.unwrap(), ReleaseOutcome::Released);
    assert_eq!(
        store.release(&r1).await.unwrap(),
        ReleaseOutcome::AlreadyAvailable
    );
    assert!(store.get_resource(&r1).await.unwrap().unwrap().available);
    assert_eq!(
        store.release(&ResourceId::new("missing")).await.unwrap(),
        ReleaseOutcome::NotFound
    );
}

#[tokio::test]
#[serial]
async fn test_release_for_checks_the_holder() {
    let store = get_test_store(Duration::ZERO).await;
    let r1 = ResourceId::new("R1");
    let (first, second) = (RequestId::new("req-1"), RequestId::new("req-2"));

    store.reserve_for(&r1, Some(&first)).await.unwrap();
    let held = store.get_resource(&r1).await.unwrap().unwrap();
    assert_eq!(held.held_by, Some(first.clone()));

    assert_eq!(
        store.release_for(&r1, Some(&second)).await.unwrap(),
        ReleaseOutcome::HeldByOther
    );
    assert!(!store.get_resource(&r1).await.unwrap().unwrap().available);

    assert_eq!(
        store.release_for(&r1, Some(&first)).await.unwrap(),
        ReleaseOutcome::Released
    );
    let freed = store.get_resource(&r1).await.unwrap().unwrap();
    assert!(freed.available);
    assert_eq!(freed.held_by, None);
}

#[tokio::test]
#[serial]
async fn test_records_are_idempotent_and_exclusive() {
    let store = get_test_store(Duration::ZERO).await;

    store.record_reservation(record("req-1", "R1")).await.unwrap();
    store.record_reservation(record("req-1", "R1")).await.unwrap();

    let err = store
        .record_reservation(record("req-2", "R1"))
        .await
        .unwrap_err();
    assert!(matches!(err, StoreError::Conflict { existing, .. } if existing.as_str() == "req-1"));

    let err = store
        .record_reservation(record("req-3", "missing"))
        .await
        .unwrap_err();
    assert!(matches!(err, StoreError::NotFound(_)));
}

#[tokio::test]
#[serial]
async fn test_cancel_and_list_reservations() {
    let store = get_test_store(Duration::ZERO).await;
    store.record_reservation(record("req-1", "R1")).await.unwrap();
    store.record_reservation(record("req-1", "R2")).await.unwrap();

    let for_request = store
        .reservations_for_request(&RequestId::new("req-1"))
        .await
        .unwrap();
    assert_eq!(for_request.len(), 2);

    let cancelled = store
        .cancel_reservations(&RequestId::new("req-1"))
        .await
        .unwrap();
    assert_eq!(cancelled.len(), 2);
    assert!(cancelled.iter().all(|r| r.status == RecordStatus::Cancelled));

    let active = store
        .list_reservations(ReservationFilter {
            status: Some(RecordStatus::Confirmed),
            ..Default::default()
        })
        .await
        .unwrap();
    assert!(active.is_empty());

    // A cancelled record no longer blocks the station.
    store.record_reservation(record("req-2", "R1")).await.unwrap();
}

#[tokio::test]
#[serial]
async fn test_list_resources_filters() {
    let store = get_test_store(Duration::ZERO).await;
    store.check_and_reserve(&ResourceId::new("R2")).await.unwrap();

    let all = store.list_resources(ResourceFilter::default()).await.unwrap();
    assert_eq!(all.len(), 3);

    let taken = store
        .list_resources(ResourceFilter {
            available: Some(false),
            under_maintenance: None,
        })
        .await
        .unwrap();
    assert_eq!(taken.len(), 1);
    assert_eq!(taken[0].id.as_str(), "R2");
}
