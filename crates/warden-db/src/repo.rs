//! Repository layer for worker and snapshot persistence

use crate::models::{QuotaSnapshotRow, WorkerRow};
use crate::pool::DbPool;
use crate::DbError;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use warden_core::scrape::QuotaSnapshot;
use warden_core::store::{SnapshotStore, WorkerStore};
use warden_core::worker::{ProviderClass, Worker};

/// Repository for database operations
#[derive(Debug, Clone)]
pub struct Repository {
    pool: DbPool,
}

impl Repository {
    /// Create new repository
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }

    /// Insert or update a worker row
    pub async fn upsert_worker(&self, worker: &Worker) -> Result<(), DbError> {
        let row = WorkerRow::from_worker(worker, Utc::now())?;
        sqlx::query(
            r#"
            INSERT OR REPLACE INTO workers (
                id, provider_class, account_id, status,
                session_started_at, session_duration_seconds,
                weekly_usage_seconds, week_started_at,
                max_session_seconds, max_weekly_seconds, cooldown_seconds,
                cooldown_until, scheduled_stop_at, session_cap_seconds,
                provider_can_start, last_heartbeat_at, last_work_at,
                last_error, capabilities, updated_at
            )
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&row.id)
        .bind(&row.provider_class)
        .bind(&row.account_id)
        .bind(&row.status)
        .bind(&row.session_started_at)
        .bind(row.session_duration_seconds)
        .bind(row.weekly_usage_seconds)
        .bind(&row.week_started_at)
        .bind(row.max_session_seconds)
        .bind(row.max_weekly_seconds)
        .bind(row.cooldown_seconds)
        .bind(&row.cooldown_until)
        .bind(&row.scheduled_stop_at)
        .bind(row.session_cap_seconds)
        .bind(row.provider_can_start)
        .bind(&row.last_heartbeat_at)
        .bind(&row.last_work_at)
        .bind(&row.last_error)
        .bind(&row.capabilities)
        .bind(&row.updated_at)
        .execute(self.pool.inner())
        .await?;
        Ok(())
    }

    /// Get worker by ID
    pub async fn get_worker(&self, id: &str) -> Result<Option<Worker>, DbError> {
        let row = sqlx::query_as::<_, WorkerRow>("SELECT * FROM workers WHERE id = ?")
            .bind(id)
            .fetch_optional(self.pool.inner())
            .await?;
        row.map(Worker::try_from).transpose()
    }

    /// Get all workers
    pub async fn list_workers(&self) -> Result<Vec<Worker>, DbError> {
        let rows = sqlx::query_as::<_, WorkerRow>("SELECT * FROM workers")
            .fetch_all(self.pool.inner())
            .await?;
        rows.into_iter().map(Worker::try_from).collect()
    }

    /// Append a quota snapshot
    pub async fn insert_snapshot(&self, snapshot: &QuotaSnapshot) -> Result<(), DbError> {
        let row = QuotaSnapshotRow::from_snapshot(snapshot);
        sqlx::query(
            r#"
            INSERT INTO quota_snapshots (
                id, provider_class, account_id,
                session_remaining_seconds, weekly_remaining_seconds,
                can_start, should_stop, success, error,
                scrape_duration_ms, captured_at, expires_at
            )
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&row.id)
        .bind(&row.provider_class)
        .bind(&row.account_id)
        .bind(row.session_remaining_seconds)
        .bind(row.weekly_remaining_seconds)
        .bind(row.can_start)
        .bind(row.should_stop)
        .bind(row.success)
        .bind(&row.error)
        .bind(row.scrape_duration_ms)
        .bind(&row.captured_at)
        .bind(&row.expires_at)
        .execute(self.pool.inner())
        .await?;
        Ok(())
    }

    /// Most recent snapshot for an account and provider class
    pub async fn latest_snapshot_for(
        &self,
        provider_class: ProviderClass,
        account_id: &str,
    ) -> Result<Option<QuotaSnapshot>, DbError> {
        let row = sqlx::query_as::<_, QuotaSnapshotRow>(
            r#"
            SELECT * FROM quota_snapshots
            WHERE provider_class = ? AND account_id = ?
            ORDER BY captured_at DESC
            LIMIT 1
            "#,
        )
        .bind(provider_class.as_str())
        .bind(account_id)
        .fetch_optional(self.pool.inner())
        .await?;
        row.map(QuotaSnapshot::try_from).transpose()
    }

    /// Delete snapshots past their expiry, returning how many were removed
    pub async fn purge_expired_snapshots(&self, now: DateTime<Utc>) -> Result<u64, DbError> {
        let result = sqlx::query("DELETE FROM quota_snapshots WHERE expires_at <= ?")
            .bind(crate::models::datetime_to_string(now))
            .execute(self.pool.inner())
            .await?;
        Ok(result.rows_affected())
    }
}

fn to_core(err: DbError) -> warden_core::Error {
    warden_core::Error::storage(err.to_string())
}

#[async_trait]
impl WorkerStore for Repository {
    async fn save_worker(&self, worker: &Worker) -> warden_core::Result<()> {
        self.upsert_worker(worker).await.map_err(to_core)
    }

    async fn load_workers(&self) -> warden_core::Result<Vec<Worker>> {
        self.list_workers().await.map_err(to_core)
    }
}

#[async_trait]
impl SnapshotStore for Repository {
    async fn save_snapshot(&self, snapshot: &QuotaSnapshot) -> warden_core::Result<()> {
        self.insert_snapshot(snapshot).await.map_err(to_core)
    }

    async fn latest_snapshot(
        &self,
        provider_class: ProviderClass,
        account_id: &str,
    ) -> warden_core::Result<Option<QuotaSnapshot>> {
        self.latest_snapshot_for(provider_class, account_id)
            .await
            .map_err(to_core)
    }

    async fn purge_expired(&self, now: DateTime<Utc>) -> warden_core::Result<u64> {
        self.purge_expired_snapshots(now).await.map_err(to_core)
    }
}
