//! Sync scheduler
//!
//! Periodic driver that refreshes quota snapshots from the external scraper
//! and reconciles them into the ledger. Cycles never overlap (a running
//! cycle makes the next firing skip with a log line), scrapes run under a
//! bounded semaphore because provider pages throttle concurrent logins, and
//! every scrape carries a hard timeout. An account whose every provider
//! scrape fails is invalidated rather than silently treated as zero usage.

use crate::alert::{dispatch, AlertSink};
use crate::clock::Clock;
use crate::compliance::AlertSeverity;
use crate::error::Error;
use crate::ledger::{QuotaLedger, StopReason};
use crate::lifecycle::SessionLifecycleManager;
use crate::scrape::{QuotaScraper, QuotaSnapshot};
use crate::store::SnapshotStore;
use crate::trigger::RecurringTrigger;
use crate::worker::Worker;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Semaphore;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Sync scheduler tuning
#[derive(Debug, Clone)]
pub struct SyncConfig {
    /// Cycle cadence
    pub interval: Duration,
    /// Hard per-scrape timeout, independent of cycle timing
    pub scrape_timeout: Duration,
    /// Concurrent scrapes across accounts
    pub max_concurrent: usize,
    /// Snapshot freshness window
    pub snapshot_ttl: Duration,
    /// Heartbeat silence after which an online worker is folded and stopped
    pub heartbeat_silence: Duration,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(600),
            scrape_timeout: Duration::from_secs(180),
            max_concurrent: 2,
            snapshot_ttl: Duration::from_secs(900),
            heartbeat_silence: Duration::from_secs(300),
        }
    }
}

/// Periodic quota reconciliation driver
pub struct SyncScheduler {
    scraper: Arc<dyn QuotaScraper>,
    ledger: Arc<QuotaLedger>,
    lifecycle: Arc<SessionLifecycleManager>,
    snapshots: Option<Arc<dyn SnapshotStore>>,
    sink: Arc<dyn AlertSink>,
    clock: Arc<dyn Clock>,
    config: SyncConfig,
    trigger: Arc<RecurringTrigger>,
    in_flight: AtomicBool,
    scrape_slots: Arc<Semaphore>,
}

impl SyncScheduler {
    /// Wire a sync scheduler
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        scraper: Arc<dyn QuotaScraper>,
        ledger: Arc<QuotaLedger>,
        lifecycle: Arc<SessionLifecycleManager>,
        snapshots: Option<Arc<dyn SnapshotStore>>,
        sink: Arc<dyn AlertSink>,
        clock: Arc<dyn Clock>,
        config: SyncConfig,
    ) -> Self {
        let trigger = Arc::new(RecurringTrigger::interval(config.interval));
        let scrape_slots = Arc::new(Semaphore::new(config.max_concurrent.max(1)));
        Self {
            scraper,
            ledger,
            lifecycle,
            snapshots,
            sink,
            clock,
            config,
            trigger,
            in_flight: AtomicBool::new(false),
            scrape_slots,
        }
    }

    /// Spawn the periodic loop
    pub fn start(self: Arc<Self>) -> JoinHandle<()> {
        let trigger = Arc::clone(&self.trigger);
        trigger.start(move || {
            let scheduler = Arc::clone(&self);
            async move {
                scheduler.run_cycle().await;
            }
        })
    }

    /// Trigger an immediate cycle
    pub fn run_now(&self) {
        self.trigger.run_now();
    }

    /// Stop the periodic loop
    pub fn shutdown(&self) {
        self.trigger.shutdown();
    }

    /// The underlying trigger, for enable/disable control
    pub fn trigger(&self) -> &Arc<RecurringTrigger> {
        &self.trigger
    }

    /// One full sync cycle. Guarded against overlap: if the previous cycle
    /// is still in flight this one is skipped and logged.
    pub async fn run_cycle(self: Arc<Self>) {
        if self.in_flight.swap(true, Ordering::SeqCst) {
            warn!("previous sync cycle still in flight, skipping");
            return;
        }

        let workers = self.ledger.list().await;
        debug!(workers = workers.len(), "sync cycle started");

        let mut tasks = Vec::new();
        for worker in workers {
            let scheduler = Arc::clone(&self);
            tasks.push(tokio::spawn(async move {
                let account = worker.account_id.clone();
                let ok = scheduler.sync_worker(worker).await;
                (account, ok)
            }));
        }

        // per-account failure tally: an account is invalidated only when
        // every one of its provider workers failed this cycle
        let mut account_results: HashMap<String, (u32, u32)> = HashMap::new();
        for task in tasks {
            match task.await {
                Ok((account, ok)) => {
                    let entry = account_results.entry(account).or_insert((0, 0));
                    if ok {
                        entry.0 += 1;
                    } else {
                        entry.1 += 1;
                    }
                }
                Err(err) => warn!("sync task panicked: {err}"),
            }
        }

        for (account, (succeeded, failed)) in account_results {
            if succeeded == 0 && failed > 0 {
                self.ledger
                    .invalidate_account(&account, "all provider scrapes failed")
                    .await;
                dispatch(
                    Arc::clone(&self.sink),
                    AlertSeverity::Critical,
                    "account invalid",
                    format!("account {account}: every provider scrape failed, re-authentication required"),
                    HashMap::new(),
                );
            }
        }

        self.sweep_silent_workers().await;

        if let Some(store) = &self.snapshots {
            match store.purge_expired(self.clock.now()).await {
                Ok(purged) if purged > 0 => debug!(purged, "expired snapshots purged"),
                Ok(_) => {}
                Err(err) => warn!("snapshot purge failed: {err}"),
            }
        }

        self.in_flight.store(false, Ordering::SeqCst);
        debug!("sync cycle finished");
    }

    /// Scrape and reconcile one worker. Returns false when the scrape
    /// failed (any classification).
    async fn sync_worker(&self, worker: Worker) -> bool {
        let _slot = match self.scrape_slots.acquire().await {
            Ok(permit) => permit,
            Err(_) => return false,
        };

        let started = std::time::Instant::now();
        let scraped = tokio::time::timeout(
            self.config.scrape_timeout,
            self.scraper
                .scrape(&worker.account_id, worker.provider_class),
        )
        .await;
        let scrape_duration_ms = started.elapsed().as_millis() as u64;
        let captured_at = self.clock.now();

        let (snapshot, ok) = match scraped {
            Ok(Ok(raw)) => match QuotaSnapshot::parse(
                worker.provider_class,
                &worker.account_id,
                &raw,
                captured_at,
                self.config.snapshot_ttl,
                scrape_duration_ms,
            ) {
                Ok(snapshot) => (snapshot, true),
                Err(err) => {
                    // fail safe: a payload we cannot read is treated as
                    // "assume worst case, do not start", never defaulted
                    warn!(
                        worker_id = %worker.id,
                        "quota payload rejected: {err}"
                    );
                    dispatch(
                        Arc::clone(&self.sink),
                        AlertSeverity::Warning,
                        "quota payload rejected",
                        err.to_string(),
                        HashMap::new(),
                    );
                    (
                        QuotaSnapshot::failed(
                            worker.provider_class,
                            &worker.account_id,
                            err.to_string(),
                            captured_at,
                            self.config.snapshot_ttl,
                            scrape_duration_ms,
                        ),
                        false,
                    )
                }
            },
            Ok(Err(err)) => {
                let auth_expired = matches!(err, Error::ScrapeAuthExpired(_));
                warn!(worker_id = %worker.id, "scrape failed: {err}");
                if auth_expired {
                    self.ledger
                        .invalidate_account(&worker.account_id, err.to_string())
                        .await;
                }
                (
                    QuotaSnapshot::failed(
                        worker.provider_class,
                        &worker.account_id,
                        err.to_string(),
                        captured_at,
                        self.config.snapshot_ttl,
                        scrape_duration_ms,
                    ),
                    false,
                )
            }
            Err(_) => {
                warn!(
                    worker_id = %worker.id,
                    "scrape exceeded {:?}", self.config.scrape_timeout
                );
                (
                    QuotaSnapshot::failed(
                        worker.provider_class,
                        &worker.account_id,
                        format!("scrape exceeded {:?}", self.config.scrape_timeout),
                        captured_at,
                        self.config.snapshot_ttl,
                        scrape_duration_ms,
                    ),
                    false,
                )
            }
        };

        if let Some(store) = &self.snapshots {
            if let Err(err) = store.save_snapshot(&snapshot).await {
                warn!(worker_id = %worker.id, "snapshot persist failed: {err}");
            }
        }

        match self.ledger.reconcile(&worker.id, &snapshot).await {
            Ok(outcome) => {
                if outcome.should_stop {
                    info!(worker_id = %worker.id, "provider asked for a stop");
                    if let Err(err) = self
                        .lifecycle
                        .force_stop(&worker.id, StopReason::ProviderSignal)
                        .await
                    {
                        warn!(worker_id = %worker.id, "provider-signalled stop failed: {err}");
                    }
                }
                if !outcome.can_start {
                    // a critical observation also cancels any in-flight start
                    self.lifecycle.cancel_pending(&worker.id);
                }
            }
            Err(err) => warn!(worker_id = %worker.id, "reconcile failed: {err}"),
        }

        ok
    }

    /// Fold and stop online workers that went silent. Their sessions may
    /// still be consuming provider time, so the usage is folded
    /// conservatively instead of dropped.
    async fn sweep_silent_workers(&self) {
        let silence = match chrono::Duration::from_std(self.config.heartbeat_silence) {
            Ok(duration) => duration,
            Err(_) => return,
        };
        for id in self.ledger.stale_online_workers(silence).await {
            warn!(worker_id = %id, "worker silent past the heartbeat limit, stopping");
            if let Err(err) = self.lifecycle.force_stop(&id, StopReason::HeartbeatLost).await {
                warn!(worker_id = %id, "silent-worker stop failed: {err}");
            }
        }
    }
}
