//! Round-trip tests against an in-memory database

use chrono::{Duration, TimeZone, Utc};
use std::time::Duration as StdDuration;
use warden_core::scrape::QuotaSnapshot;
use warden_core::store::{SnapshotStore, WorkerStore};
use warden_core::worker::{ProviderClass, Worker, WorkerSpec, WorkerStatus};
use warden_db::{DbPool, Repository};

fn t0() -> chrono::DateTime<Utc> {
    Utc.with_ymd_and_hms(2025, 3, 3, 12, 0, 0).unwrap()
}

async fn repo() -> Repository {
    Repository::new(DbPool::in_memory().await.unwrap())
}

#[tokio::test]
async fn test_worker_upsert_and_load() {
    let repo = repo().await;

    let mut worker = Worker::from_spec(
        WorkerSpec::new(ProviderClass::OnDemandWeekly, "acct-1").with_capability("gpu", "T4"),
        t0(),
    );
    repo.upsert_worker(&worker).await.unwrap();

    // mutate and upsert again: the row is replaced, not duplicated
    worker.status = WorkerStatus::Online;
    worker.session_started_at = Some(t0());
    worker.weekly_usage_seconds = 7200;
    repo.upsert_worker(&worker).await.unwrap();

    let loaded = repo.get_worker(&worker.id).await.unwrap().unwrap();
    assert_eq!(loaded.status, WorkerStatus::Online);
    assert_eq!(loaded.weekly_usage_seconds, 7200);
    assert_eq!(loaded.session_started_at, Some(t0()));

    let all = repo.list_workers().await.unwrap();
    assert_eq!(all.len(), 1);
}

#[tokio::test]
async fn test_missing_worker_is_none() {
    let repo = repo().await;
    assert!(repo.get_worker("nope").await.unwrap().is_none());
}

#[tokio::test]
async fn test_snapshot_insert_and_latest() {
    let repo = repo().await;

    let older = QuotaSnapshot::parse(
        ProviderClass::FixedCooldown,
        "acct-1",
        r#"{"sessionRemaining": 3600, "weeklyRemaining": 36000, "canStart": true}"#,
        t0(),
        StdDuration::from_secs(900),
        250,
    )
    .unwrap();
    let newer = QuotaSnapshot::parse(
        ProviderClass::FixedCooldown,
        "acct-1",
        r#"{"sessionRemaining": 1800, "weeklyRemaining": 34000, "canStart": false}"#,
        t0() + Duration::minutes(10),
        StdDuration::from_secs(900),
        300,
    )
    .unwrap();

    repo.insert_snapshot(&older).await.unwrap();
    repo.insert_snapshot(&newer).await.unwrap();

    let latest = repo
        .latest_snapshot_for(ProviderClass::FixedCooldown, "acct-1")
        .await
        .unwrap()
        .unwrap();
    assert_eq!(latest.id, newer.id);
    assert_eq!(latest.weekly_remaining_seconds, 34000);
    assert!(!latest.can_start);

    // a different provider class sees nothing
    assert!(repo
        .latest_snapshot_for(ProviderClass::OnDemandWeekly, "acct-1")
        .await
        .unwrap()
        .is_none());
}

#[tokio::test]
async fn test_purge_expired_snapshots() {
    let repo = repo().await;

    let snapshot = QuotaSnapshot::failed(
        ProviderClass::OnDemandWeekly,
        "acct-1",
        "timed out",
        t0(),
        StdDuration::from_secs(900),
        100,
    );
    repo.insert_snapshot(&snapshot).await.unwrap();

    // before expiry nothing is purged
    let purged = repo
        .purge_expired_snapshots(t0() + Duration::minutes(5))
        .await
        .unwrap();
    assert_eq!(purged, 0);

    let purged = repo
        .purge_expired_snapshots(t0() + Duration::minutes(20))
        .await
        .unwrap();
    assert_eq!(purged, 1);
}

#[tokio::test]
async fn test_store_traits_back_the_core() {
    let repo = repo().await;
    let store: &dyn WorkerStore = &repo;

    let worker = Worker::from_spec(WorkerSpec::new(ProviderClass::FixedCooldown, "acct-2"), t0());
    store.save_worker(&worker).await.unwrap();
    let loaded = store.load_workers().await.unwrap();
    assert_eq!(loaded.len(), 1);
    assert_eq!(loaded[0].account_id, "acct-2");

    let snapshots: &dyn SnapshotStore = &repo;
    let snapshot = QuotaSnapshot::failed(
        ProviderClass::FixedCooldown,
        "acct-2",
        "x",
        t0(),
        StdDuration::from_secs(900),
        1,
    );
    snapshots.save_snapshot(&snapshot).await.unwrap();
    let latest = snapshots
        .latest_snapshot(ProviderClass::FixedCooldown, "acct-2")
        .await
        .unwrap();
    assert!(latest.is_some());
}
