use std::time::Duration;

use async_trait::async_trait;
use common::{ClientId, NodeId, RequestId, ResourceId};
use sqlx::{PgPool, Postgres, Row, Transaction, postgres::PgRow};

use crate::{
    RecordStatus, ReleaseOutcome, ReservationFilter, ReservationRecord, ReserveOutcome, Resource,
    ResourceFilter, Result, StoreError, memory::DEFAULT_RELEASE_WAIT, store::ResourceStore,
};

/// SQLSTATE raised when `NOWAIT` or `lock_timeout` gives up on a row lock.
const LOCK_NOT_AVAILABLE: &str = "55P03";
/// SQLSTATE for a foreign key violation.
const FOREIGN_KEY_VIOLATION: &str = "23503";
const ACTIVE_RESERVATION_INDEX: &str = "unique_active_reservation";

/// PostgreSQL-backed resource store.
///
/// Check-and-reserve runs as a single transaction holding the station's row
/// lock; a lock held by another transaction is reported as `Unavailable`
/// instead of queueing behind it.
#[derive(Clone)]
pub struct PostgresResourceStore {
    pool: PgPool,
    lock_wait: Duration,
    release_wait: Duration,
}

impl PostgresResourceStore {
    /// Creates a store that refuses immediately on a locked row.
    pub fn new(pool: PgPool) -> Self {
        Self::with_lock_wait(pool, Duration::ZERO)
    }

    /// Creates a store that waits up to `lock_wait` for a locked row.
    pub fn with_lock_wait(pool: PgPool, lock_wait: Duration) -> Self {
        Self {
            pool,
            lock_wait,
            release_wait: DEFAULT_RELEASE_WAIT.max(lock_wait),
        }
    }

    /// Gets a reference to the underlying connection pool.
    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Runs the database migrations.
    pub async fn run_migrations(&self) -> Result<()> {
        sqlx::migrate!("../../migrations").run(&self.pool).await?;
        Ok(())
    }

    /// Starts a transaction whose row-lock waits are bounded by `wait`.
    async fn begin_bounded(&self, wait: Duration) -> Result<Transaction<'_, Postgres>> {
        let mut tx = self.pool.begin().await?;
        if !wait.is_zero() {
            // SET does not accept bind parameters.
            sqlx::query(&format!("SET LOCAL lock_timeout = '{}ms'", wait.as_millis()))
                .execute(&mut *tx)
                .await?;
        }
        Ok(tx)
    }

    fn row_to_resource(row: PgRow) -> Result<Resource> {
        Ok(Resource {
            id: ResourceId::new(row.try_get::<String, _>("id")?),
            name: row.try_get("name")?,
            location: row.try_get("location")?,
            owner_node_id: NodeId::new(row.try_get::<String, _>("owner_node_id")?),
            available: row.try_get("available")?,
            under_maintenance: row.try_get("under_maintenance")?,
            held_by: row
                .try_get::<Option<String>, _>("held_by")?
                .map(RequestId::new),
            updated_at: row.try_get("updated_at")?,
        })
    }

    fn row_to_record(row: PgRow) -> Result<ReservationRecord> {
        let status: String = row.try_get("status")?;
        let status = RecordStatus::parse(&status).ok_or_else(|| {
            StoreError::Database(sqlx::Error::Decode(
                format!("unknown reservation status '{status}'").into(),
            ))
        })?;

        Ok(ReservationRecord {
            request_id: RequestId::new(row.try_get::<String, _>("request_id")?),
            resource_id: ResourceId::new(row.try_get::<String, _>("resource_id")?),
            client_id: ClientId::new(row.try_get::<String, _>("client_id")?),
            valid_from: row.try_get("valid_from")?,
            valid_until: row.try_get("valid_until")?,
            status,
            created_at: row.try_get("created_at")?,
        })
    }

    async fn active_record_holder(&self, resource_id: &ResourceId) -> Result<Option<RequestId>> {
        let holder: Option<String> = sqlx::query_scalar(
            "SELECT request_id FROM reservation_records WHERE resource_id = $1 AND status = 'confirmed'",
        )
        .bind(resource_id.as_str())
        .fetch_optional(&self.pool)
        .await?;
        Ok(holder.map(RequestId::new))
    }
}

fn has_sqlstate(err: &sqlx::Error, code: &str) -> bool {
    if let sqlx::Error::Database(db_err) = err
        && db_err.code().as_deref() == Some(code)
    {
        return true;
    }
    false
}

#[async_trait]
impl ResourceStore for PostgresResourceStore {
    #[tracing::instrument(skip(self, holder), fields(%resource_id))]
    async fn reserve_for(
        &self,
        resource_id: &ResourceId,
        holder: Option<&RequestId>,
    ) -> Result<ReserveOutcome> {
        let mut tx = self.begin_bounded(self.lock_wait).await?;

        let lock_clause = if self.lock_wait.is_zero() {
            "FOR UPDATE NOWAIT"
        } else {
            "FOR UPDATE"
        };
        let row = sqlx::query(&format!(
            "SELECT available, under_maintenance FROM resources WHERE id = $1 {lock_clause}"
        ))
        .bind(resource_id.as_str())
        .fetch_optional(&mut *tx)
        .await;

        let outcome = match row {
            Err(e) if has_sqlstate(&e, LOCK_NOT_AVAILABLE) => {
                tracing::debug!("station row locked, reporting unavailable");
                ReserveOutcome::Unavailable
            }
            Err(e) => return Err(e.into()),
            Ok(None) => ReserveOutcome::NotFound,
            Ok(Some(row)) => {
                let available: bool = row.try_get("available")?;
                let under_maintenance: bool = row.try_get("under_maintenance")?;
                if under_maintenance {
                    ReserveOutcome::UnderMaintenance
                } else if !available {
                    ReserveOutcome::Unavailable
                } else {
                    sqlx::query(
                        "UPDATE resources SET available = FALSE, held_by = $2, updated_at = NOW() WHERE id = $1",
                    )
                    .bind(resource_id.as_str())
                    .bind(holder.map(RequestId::as_str))
                    .execute(&mut *tx)
                    .await?;
                    ReserveOutcome::Reserved
                }
            }
        };

        if outcome.is_reserved() {
            tx.commit().await?;
        } else {
            tx.rollback().await?;
        }

        metrics::counter!("resource_reserve_total", "outcome" => outcome.as_str()).increment(1);
        Ok(outcome)
    }

    #[tracing::instrument(skip(self, holder), fields(%resource_id))]
    async fn release_for(
        &self,
        resource_id: &ResourceId,
        holder: Option<&RequestId>,
    ) -> Result<ReleaseOutcome> {
        let mut tx = self.begin_bounded(self.release_wait).await?;

        let released = sqlx::query(
            r#"
            UPDATE resources SET available = TRUE, held_by = NULL, updated_at = NOW()
            WHERE id = $1 AND NOT available
              AND ($2::TEXT IS NULL OR held_by = $2)
            RETURNING id
            "#,
        )
        .bind(resource_id.as_str())
        .bind(holder.map(RequestId::as_str))
        .fetch_optional(&mut *tx)
        .await
        .map_err(|e| {
            if has_sqlstate(&e, LOCK_NOT_AVAILABLE) {
                StoreError::LockTimeout(resource_id.clone())
            } else {
                StoreError::Database(e)
            }
        })?;

        let outcome = if released.is_some() {
            sqlx::query(
                "UPDATE reservation_records SET status = 'completed' WHERE resource_id = $1 AND status = 'confirmed'",
            )
            .bind(resource_id.as_str())
            .execute(&mut *tx)
            .await?;
            ReleaseOutcome::Released
        } else {
            let available: Option<bool> =
                sqlx::query_scalar("SELECT available FROM resources WHERE id = $1")
                    .bind(resource_id.as_str())
                    .fetch_optional(&mut *tx)
                    .await?;
            match available {
                Some(true) => ReleaseOutcome::AlreadyAvailable,
                Some(false) => ReleaseOutcome::HeldByOther,
                None => ReleaseOutcome::NotFound,
            }
        };
        tx.commit().await?;

        metrics::counter!("resource_release_total", "outcome" => outcome.as_str()).increment(1);
        Ok(outcome)
    }

    async fn get_resource(&self, resource_id: &ResourceId) -> Result<Option<Resource>> {
        let row = sqlx::query(
            r#"
            SELECT id, name, location, owner_node_id, available, under_maintenance, held_by, updated_at
            FROM resources
            WHERE id = $1
            "#,
        )
        .bind(resource_id.as_str())
        .fetch_optional(&self.pool)
        .await?;

        row.map(Self::row_to_resource).transpose()
    }

    async fn list_resources(&self, filter: ResourceFilter) -> Result<Vec<Resource>> {
        let rows = sqlx::query(
            r#"
            SELECT id, name, location, owner_node_id, available, under_maintenance, held_by, updated_at
            FROM resources
            WHERE ($1::BOOLEAN IS NULL OR available = $1)
              AND ($2::BOOLEAN IS NULL OR under_maintenance = $2)
            ORDER BY id ASC
            "#,
        )
        .bind(filter.available)
        .bind(filter.under_maintenance)
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(Self::row_to_resource).collect()
    }

    async fn upsert_resource(&self, resource: Resource) -> Result<()> {
        resource.validate().map_err(StoreError::InvalidResource)?;

        let mut tx = self.begin_bounded(self.release_wait).await?;
        sqlx::query(
            r#"
            INSERT INTO resources (id, name, location, owner_node_id, available, under_maintenance, held_by, updated_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
            ON CONFLICT (id) DO UPDATE SET
                name = EXCLUDED.name,
                location = EXCLUDED.location,
                owner_node_id = EXCLUDED.owner_node_id,
                available = EXCLUDED.available,
                under_maintenance = EXCLUDED.under_maintenance,
                held_by = EXCLUDED.held_by,
                updated_at = EXCLUDED.updated_at
            "#,
        )
        .bind(resource.id.as_str())
        .bind(&resource.name)
        .bind(&resource.location)
        .bind(resource.owner_node_id.as_str())
        .bind(resource.available)
        .bind(resource.under_maintenance)
        .bind(resource.held_by.as_ref().map(RequestId::as_str))
        .bind(resource.updated_at)
        .execute(&mut *tx)
        .await
        .map_err(|e| {
            if has_sqlstate(&e, LOCK_NOT_AVAILABLE) {
                StoreError::LockTimeout(resource.id.clone())
            } else {
                StoreError::Database(e)
            }
        })?;
        tx.commit().await?;
        Ok(())
    }

    async fn set_maintenance(
        &self,
        resource_id: &ResourceId,
        under_maintenance: bool,
    ) -> Result<Resource> {
        let mut tx = self.begin_bounded(self.release_wait).await?;
        let row = sqlx::query(
            r#"
            UPDATE resources SET under_maintenance = $2, updated_at = NOW()
            WHERE id = $1
            RETURNING id, name, location, owner_node_id, available, under_maintenance, held_by, updated_at
            "#,
        )
        .bind(resource_id.as_str())
        .bind(under_maintenance)
        .fetch_optional(&mut *tx)
        .await
        .map_err(|e| {
            if has_sqlstate(&e, LOCK_NOT_AVAILABLE) {
                StoreError::LockTimeout(resource_id.clone())
            } else {
                StoreError::Database(e)
            }
        })?
        .ok_or_else(|| StoreError::NotFound(resource_id.clone()))?;
        tx.commit().await?;

        Self::row_to_resource(row)
    }

    #[tracing::instrument(skip(self, record), fields(request_id = %record.request_id, resource_id = %record.resource_id))]
    async fn record_reservation(&self, record: ReservationRecord) -> Result<()> {
        let inserted = sqlx::query(
            r#"
            INSERT INTO reservation_records
                (request_id, resource_id, client_id, valid_from, valid_until, status, created_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7)
            ON CONFLICT (request_id, resource_id) DO NOTHING
            "#,
        )
        .bind(record.request_id.as_str())
        .bind(record.resource_id.as_str())
        .bind(record.client_id.as_str())
        .bind(record.valid_from)
        .bind(record.valid_until)
        .bind(record.status.as_str())
        .bind(record.created_at)
        .execute(&self.pool)
        .await;

        match inserted {
            Ok(_) => Ok(()),
            Err(e) if has_sqlstate(&e, FOREIGN_KEY_VIOLATION) => {
                Err(StoreError::NotFound(record.resource_id))
            }
            Err(sqlx::Error::Database(db_err))
                if db_err.constraint() == Some(ACTIVE_RESERVATION_INDEX) =>
            {
                let existing = self
                    .active_record_holder(&record.resource_id)
                    .await?
                    .unwrap_or_else(|| record.request_id.clone());
                Err(StoreError::Conflict {
                    resource_id: record.resource_id,
                    existing,
                })
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn reservations_for_request(
        &self,
        request_id: &RequestId,
    ) -> Result<Vec<ReservationRecord>> {
        let rows = sqlx::query(
            r#"
            SELECT request_id, resource_id, client_id, valid_from, valid_until, status, created_at
            FROM reservation_records
            WHERE request_id = $1
            ORDER BY resource_id ASC
            "#,
        )
        .bind(request_id.as_str())
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(Self::row_to_record).collect()
    }

    async fn list_reservations(
        &self,
        filter: ReservationFilter,
    ) -> Result<Vec<ReservationRecord>> {
        let rows = sqlx::query(
            r#"
            SELECT request_id, resource_id, client_id, valid_from, valid_until, status, created_at
            FROM reservation_records
            WHERE ($1::TEXT IS NULL OR client_id = $1)
              AND ($2::TEXT IS NULL OR status = $2)
            ORDER BY created_at ASC
            "#,
        )
        .bind(filter.client_id.as_ref().map(|c| c.as_str()))
        .bind(filter.status.map(|s| s.as_str()))
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(Self::row_to_record).collect()
    }

    async fn cancel_reservations(&self, request_id: &RequestId) -> Result<Vec<ReservationRecord>> {
        let rows = sqlx::query(
            r#"
            UPDATE reservation_records SET status = 'cancelled'
            WHERE request_id = $1 AND status = 'confirmed'
            RETURNING request_id, resource_id, client_id, valid_from, valid_until, status, created_at
            "#,
        )
        .bind(request_id.as_str())
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(Self::row_to_record).collect()
    }
}
