//! Quota ledger
//!
//! Authoritative usage counters per worker. All session-critical fields have
//! a single logical owner: every mutating operation locks the worker's own
//! mutex, so a heartbeat racing a forced stop can never lose an update.
//! Session duration is derived from the start timestamp rather than
//! accumulated, which makes heartbeats idempotent under duplication or loss.
//!
//! Locks are held only around the in-memory transition; persistence happens
//! on a cloned record after the lock is released.

use crate::clock::Clock;
use crate::compliance::ComplianceMonitor;
use crate::error::{Error, Result};
use crate::randomizer::{BehaviorRandomizer, SessionRandomization};
use crate::scrape::QuotaSnapshot;
use crate::store::WorkerStore;
use crate::worker::{ProviderClass, Worker, WorkerId, WorkerSpec, WorkerStatus};
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{Mutex, RwLock};
use tracing::{debug, info, warn};

/// Why a session ended
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StopReason {
    /// Randomized planned stop instant reached
    Scheduled,
    /// Elapsed time hit the effective session cap
    SessionCapReached,
    /// Compliance monitor flagged critical
    Compliance,
    /// No work arrived within the idle timeout
    IdleTimeout,
    /// Worker stopped sending heartbeats
    HeartbeatLost,
    /// Provider-side stop recommendation from a fresh quota snapshot
    ProviderSignal,
    /// Operator request
    Manual,
    /// Account credentials became invalid
    AuthInvalid,
}

impl StopReason {
    /// Stable string form
    pub fn as_str(&self) -> &'static str {
        match self {
            StopReason::Scheduled => "scheduled",
            StopReason::SessionCapReached => "session_cap_reached",
            StopReason::Compliance => "compliance",
            StopReason::IdleTimeout => "idle_timeout",
            StopReason::HeartbeatLost => "heartbeat_lost",
            StopReason::ProviderSignal => "provider_signal",
            StopReason::Manual => "manual",
            StopReason::AuthInvalid => "auth_invalid",
        }
    }
}

impl std::fmt::Display for StopReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Result of folding a finished session into the weekly counters
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionSummary {
    /// Worker the session belonged to
    pub worker_id: WorkerId,
    /// Why the session ended
    pub reason: StopReason,
    /// Final derived session duration
    pub duration_seconds: u64,
    /// Weekly usage after folding
    pub weekly_usage_seconds: u64,
    /// When the session ended
    pub ended_at: DateTime<Utc>,
    /// Cooldown applied, for the fixed-cooldown class
    pub cooldown_until: Option<DateTime<Utc>>,
}

/// Result of reconciling an external quota observation
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ReconcileOutcome {
    /// Counters were updated from the observation
    pub applied: bool,
    /// Snapshot was past its TTL and ignored
    pub stale: bool,
    /// New weekly usage value when the external observation won
    pub weekly_adjusted_to: Option<u64>,
    /// Provider asked for the running session to stop
    pub should_stop: bool,
    /// Provider-side verdict on starting a new session
    pub can_start: bool,
}

// tolerance between internal and external weekly figures before the
// external observation overwrites the counter
const RECONCILE_TOLERANCE_SECONDS: u64 = 60;

/// Authoritative, persisted usage counters per worker
pub struct QuotaLedger {
    clock: Arc<dyn Clock>,
    monitor: ComplianceMonitor,
    randomizer: Arc<BehaviorRandomizer>,
    workers: RwLock<HashMap<WorkerId, Arc<Mutex<Worker>>>>,
    store: Option<Arc<dyn WorkerStore>>,
}

impl QuotaLedger {
    /// Create an empty ledger
    pub fn new(
        clock: Arc<dyn Clock>,
        monitor: ComplianceMonitor,
        randomizer: Arc<BehaviorRandomizer>,
        store: Option<Arc<dyn WorkerStore>>,
    ) -> Self {
        Self {
            clock,
            monitor,
            randomizer,
            workers: RwLock::new(HashMap::new()),
            store,
        }
    }

    /// Register a new worker
    pub async fn register(&self, spec: WorkerSpec) -> Worker {
        let worker = Worker::from_spec(spec, self.clock.now());
        info!(
            worker_id = %worker.id,
            provider = %worker.provider_class,
            account = %worker.account_id,
            "worker registered"
        );
        self.workers
            .write()
            .await
            .insert(worker.id.clone(), Arc::new(Mutex::new(worker.clone())));
        self.persist(&worker).await;
        worker
    }

    /// Reload workers from the persistence sink, replacing in-memory state
    pub async fn restore(&self) -> Result<usize> {
        let Some(store) = &self.store else {
            return Ok(0);
        };
        let loaded = store.load_workers().await?;
        let count = loaded.len();
        let mut workers = self.workers.write().await;
        workers.clear();
        for worker in loaded {
            workers.insert(worker.id.clone(), Arc::new(Mutex::new(worker)));
        }
        info!(count, "ledger restored from store");
        Ok(count)
    }

    /// Snapshot of one worker
    pub async fn get(&self, id: &str) -> Result<Worker> {
        let slot = self.slot(id).await?;
        let worker = slot.lock().await;
        Ok(worker.clone())
    }

    /// Snapshots of all workers
    pub async fn list(&self) -> Vec<Worker> {
        let slots: Vec<_> = self.workers.read().await.values().cloned().collect();
        let mut all = Vec::with_capacity(slots.len());
        for slot in slots {
            all.push(slot.lock().await.clone());
        }
        all
    }

    /// Claim a worker for provisioning. Applies the full start guard and
    /// moves the worker to `Provisioning` so a concurrent start attempt
    /// fails instead of double-provisioning.
    pub async fn begin_provisioning(&self, id: &str) -> Result<Worker> {
        let slot = self.slot(id).await?;
        let snapshot = {
            let mut worker = slot.lock().await;
            let now = self.clock.now();
            if worker.status == WorkerStatus::Provisioning {
                return Err(Error::invalid_transition("starting", "starting"));
            }
            self.check_start_allowed(&mut worker, now)?;
            worker.status = WorkerStatus::Provisioning;
            worker.clone()
        };
        self.persist(&snapshot).await;
        Ok(snapshot)
    }

    /// Roll back a failed provisioning claim
    pub async fn abort_provisioning(&self, id: &str, error: impl Into<String>) -> Result<Worker> {
        let slot = self.slot(id).await?;
        let snapshot = {
            let mut worker = slot.lock().await;
            worker.status = WorkerStatus::Error;
            worker.clear_session();
            worker.last_error = Some(error.into());
            worker.clone()
        };
        self.persist(&snapshot).await;
        Ok(snapshot)
    }

    /// Open a session. Allowed only while compliant and outside cooldown;
    /// fails with [`Error::QuotaExceeded`] when a budget is exhausted.
    pub async fn start_session(
        &self,
        id: &str,
        randomization: &SessionRandomization,
    ) -> Result<Worker> {
        let slot = self.slot(id).await?;
        let snapshot = {
            let mut worker = slot.lock().await;
            let now = self.clock.now();
            if worker.status != WorkerStatus::Provisioning {
                self.check_start_allowed(&mut worker, now)?;
            }
            let cap = randomization
                .randomized_seconds
                .min(worker.limits.max_session_seconds);
            worker.status = WorkerStatus::Online;
            worker.session_started_at = Some(now);
            worker.session_duration_seconds = 0;
            worker.session_cap_seconds = Some(cap);
            worker.scheduled_stop_at = Some(now + Duration::seconds(cap as i64));
            worker.last_work_at = Some(now);
            worker.last_heartbeat_at = Some(now);
            worker.last_error = None;
            info!(
                worker_id = %worker.id,
                cap_seconds = cap,
                scheduled_stop = %worker.scheduled_stop_at.unwrap_or(now),
                "session started"
            );
            worker.clone()
        };
        self.persist(&snapshot).await;
        Ok(snapshot)
    }

    /// Recompute the derived session duration. Idempotent by construction:
    /// calling twice at the same instant yields the same value, missed
    /// calls never cause drift.
    pub async fn heartbeat(&self, id: &str) -> Result<u64> {
        let slot = self.slot(id).await?;
        let (elapsed, snapshot) = {
            let mut worker = slot.lock().await;
            if worker.session_started_at.is_none() {
                return Err(Error::no_active_session(id));
            }
            let now = self.clock.now();
            let elapsed = worker.session_elapsed(now);
            worker.session_duration_seconds = elapsed;
            worker.last_heartbeat_at = Some(now);
            (elapsed, worker.clone())
        };
        self.persist(&snapshot).await;
        Ok(elapsed)
    }

    /// Record that work arrived for the worker, feeding the idle timeout
    pub async fn note_work(&self, id: &str) -> Result<()> {
        let slot = self.slot(id).await?;
        let mut worker = slot.lock().await;
        if worker.session_started_at.is_none() {
            return Err(Error::no_active_session(id));
        }
        worker.last_work_at = Some(self.clock.now());
        Ok(())
    }

    /// Close the session and fold its final duration into the weekly
    /// counter. The 7-day window is rolled before folding, so usage from a
    /// new week never lands in the old one. The fixed-cooldown class enters
    /// its randomized mandatory cooldown here.
    pub async fn end_session(&self, id: &str, reason: StopReason) -> Result<SessionSummary> {
        let slot = self.slot(id).await?;
        let (summary, snapshot) = {
            let mut worker = slot.lock().await;
            if worker.session_started_at.is_none() {
                return Err(Error::no_active_session(id));
            }
            let now = self.clock.now();
            let final_duration = worker.session_elapsed(now);

            Self::roll_week_if_needed(&mut worker, now);
            worker.weekly_usage_seconds += final_duration;
            worker.status = WorkerStatus::Offline;
            worker.clear_session();

            let cooldown_until = if worker.provider_class == ProviderClass::FixedCooldown
                && worker.limits.cooldown_seconds > 0
            {
                let jittered = self.randomizer.jitter_cooldown(worker.limits.cooldown_seconds);
                let until = now + Duration::seconds(jittered as i64);
                worker.cooldown_until = Some(until);
                Some(until)
            } else {
                None
            };

            info!(
                worker_id = %worker.id,
                %reason,
                duration_seconds = final_duration,
                weekly_seconds = worker.weekly_usage_seconds,
                "session ended"
            );

            (
                SessionSummary {
                    worker_id: worker.id.clone(),
                    reason,
                    duration_seconds: final_duration,
                    weekly_usage_seconds: worker.weekly_usage_seconds,
                    ended_at: now,
                    cooldown_until,
                },
                worker.clone(),
            )
        };
        self.persist(&snapshot).await;
        Ok(summary)
    }

    /// Fold an external quota observation into the counters. A fresh
    /// successful snapshot is provider-side ground truth and wins over the
    /// internal figure (a session may have started outside this system's
    /// control); failed snapshots never adjust counters but do withdraw the
    /// permission to start.
    pub async fn reconcile(
        &self,
        id: &str,
        snapshot: &QuotaSnapshot,
    ) -> Result<ReconcileOutcome> {
        let slot = self.slot(id).await?;
        let (outcome, persisted) = {
            let mut worker = slot.lock().await;
            let now = self.clock.now();

            if !snapshot.is_fresh(now) {
                debug!(worker_id = %worker.id, "ignoring stale quota snapshot");
                return Ok(ReconcileOutcome {
                    stale: true,
                    can_start: worker.provider_can_start,
                    ..ReconcileOutcome::default()
                });
            }

            if !snapshot.success {
                worker.provider_can_start = false;
                worker.last_error = snapshot.error.clone();
                let outcome = ReconcileOutcome {
                    applied: false,
                    stale: false,
                    weekly_adjusted_to: None,
                    should_stop: false,
                    can_start: false,
                };
                (outcome, worker.clone())
            } else {
                Self::roll_week_if_needed(&mut worker, now);
                let session_elapsed = worker.session_elapsed(now);
                let external_total = worker
                    .limits
                    .max_weekly_seconds
                    .saturating_sub(snapshot.weekly_remaining_seconds);
                let internal_total = worker.weekly_usage_seconds + session_elapsed;

                let weekly_adjusted_to =
                    if external_total.abs_diff(internal_total) > RECONCILE_TOLERANCE_SECONDS {
                        let adjusted = external_total.saturating_sub(session_elapsed);
                        warn!(
                            worker_id = %worker.id,
                            internal = internal_total,
                            external = external_total,
                            "external quota observation disagrees, adopting provider figure"
                        );
                        worker.weekly_usage_seconds = adjusted;
                        Some(adjusted)
                    } else {
                        None
                    };

                worker.provider_can_start = snapshot.can_start;
                let should_stop = snapshot.should_stop
                    || (worker.session_started_at.is_some()
                        && snapshot.session_remaining_seconds == 0);

                let outcome = ReconcileOutcome {
                    applied: true,
                    stale: false,
                    weekly_adjusted_to,
                    should_stop,
                    can_start: snapshot.can_start,
                };
                (outcome, worker.clone())
            }
        };
        self.persist(&persisted).await;
        Ok(outcome)
    }

    /// Mark a worker offline without touching its counters
    pub async fn mark_offline(&self, id: &str) -> Result<Worker> {
        let slot = self.slot(id).await?;
        let snapshot = {
            let mut worker = slot.lock().await;
            worker.status = WorkerStatus::Offline;
            worker.clear_session();
            worker.clone()
        };
        self.persist(&snapshot).await;
        Ok(snapshot)
    }

    /// Record a classified failure against the worker
    pub async fn mark_error(&self, id: &str, error: impl Into<String>) -> Result<Worker> {
        let slot = self.slot(id).await?;
        let snapshot = {
            let mut worker = slot.lock().await;
            worker.status = WorkerStatus::Error;
            worker.clear_session();
            worker.last_error = Some(error.into());
            worker.clone()
        };
        self.persist(&snapshot).await;
        Ok(snapshot)
    }

    /// Invalidate every worker of an account after its credentials stopped
    /// working. Active sessions are folded first so their usage is not
    /// silently dropped, then the workers are parked in `Error` until an
    /// external re-authentication flow revives them.
    pub async fn invalidate_account(
        &self,
        account_id: &str,
        reason: impl Into<String>,
    ) -> Vec<WorkerId> {
        let reason = reason.into();
        let slots: Vec<_> = self.workers.read().await.values().cloned().collect();
        let mut invalidated = Vec::new();
        for slot in slots {
            let snapshot = {
                let mut worker = slot.lock().await;
                if worker.account_id != account_id {
                    continue;
                }
                let now = self.clock.now();
                if worker.session_started_at.is_some() {
                    let final_duration = worker.session_elapsed(now);
                    Self::roll_week_if_needed(&mut worker, now);
                    worker.weekly_usage_seconds += final_duration;
                }
                worker.status = WorkerStatus::Error;
                worker.clear_session();
                worker.provider_can_start = false;
                worker.last_error = Some(reason.clone());
                invalidated.push(worker.id.clone());
                worker.clone()
            };
            self.persist(&snapshot).await;
        }
        if !invalidated.is_empty() {
            warn!(
                account = account_id,
                workers = invalidated.len(),
                "account invalidated: {reason}"
            );
        }
        invalidated
    }

    /// Online workers whose last heartbeat is older than `max_silence`
    pub async fn stale_online_workers(&self, max_silence: Duration) -> Vec<WorkerId> {
        let now = self.clock.now();
        self.list()
            .await
            .into_iter()
            .filter(|w| {
                w.status == WorkerStatus::Online
                    && w.last_heartbeat_at
                        .map(|at| now - at >= max_silence)
                        .unwrap_or(false)
            })
            .map(|w| w.id)
            .collect()
    }

    /// The clock this ledger runs on
    pub fn clock(&self) -> &Arc<dyn Clock> {
        &self.clock
    }

    /// The compliance monitor used for start guards
    pub fn monitor(&self) -> &ComplianceMonitor {
        &self.monitor
    }

    async fn slot(&self, id: &str) -> Result<Arc<Mutex<Worker>>> {
        self.workers
            .read()
            .await
            .get(id)
            .cloned()
            .ok_or_else(|| Error::worker_not_found(id))
    }

    fn check_start_allowed(&self, worker: &mut Worker, now: DateTime<Utc>) -> Result<()> {
        Self::roll_week_if_needed(worker, now);
        if worker.status == WorkerStatus::Online {
            return Err(Error::invalid_transition("running", "running"));
        }
        if worker.in_cooldown(now) {
            return Err(Error::quota_exceeded(
                &worker.id,
                format!(
                    "mandatory cooldown until {}",
                    worker.cooldown_until.unwrap_or(now)
                ),
            ));
        }
        if !worker.provider_can_start {
            return Err(Error::quota_exceeded(
                &worker.id,
                "provider-side observation forbids starting",
            ));
        }
        let report = self.monitor.evaluate(worker, now);
        if !report.is_compliant {
            return Err(Error::quota_exceeded(
                &worker.id,
                format!("usage not compliant, risk {}", report.risk_level),
            ));
        }
        Ok(())
    }

    fn roll_week_if_needed(worker: &mut Worker, now: DateTime<Utc>) {
        if worker.week_boundary_passed(now) {
            debug!(
                worker_id = %worker.id,
                previous_seconds = worker.weekly_usage_seconds,
                "rolling weekly usage window"
            );
            worker.weekly_usage_seconds = 0;
            worker.week_started_at = now;
        }
    }

    async fn persist(&self, worker: &Worker) {
        if let Some(store) = &self.store {
            if let Err(err) = store.save_worker(worker).await {
                warn!(worker_id = %worker.id, "worker persist failed: {err}");
            }
        }
    }
}
