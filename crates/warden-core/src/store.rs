//! Persistence seams
//!
//! The core owns authoritative in-memory state; storage is a sink behind
//! these traits so the ledger survives restarts without depending on a
//! concrete database.

use crate::error::Result;
use crate::scrape::QuotaSnapshot;
use crate::worker::{ProviderClass, Worker};
use async_trait::async_trait;
use chrono::{DateTime, Utc};

/// Worker persistence interface
#[async_trait]
pub trait WorkerStore: Send + Sync {
    /// Insert or update a worker record
    async fn save_worker(&self, worker: &Worker) -> Result<()>;

    /// Load all worker records
    async fn load_workers(&self) -> Result<Vec<Worker>>;
}

/// Quota snapshot persistence interface
#[async_trait]
pub trait SnapshotStore: Send + Sync {
    /// Append a snapshot
    async fn save_snapshot(&self, snapshot: &QuotaSnapshot) -> Result<()>;

    /// Most recent snapshot for an account and provider class
    async fn latest_snapshot(
        &self,
        provider_class: ProviderClass,
        account_id: &str,
    ) -> Result<Option<QuotaSnapshot>>;

    /// Drop snapshots past their expiry, returning how many were removed
    async fn purge_expired(&self, now: DateTime<Utc>) -> Result<u64>;
}
