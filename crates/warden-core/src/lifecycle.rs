//! Session lifecycle state machine
//!
//! Ties the ledger, randomizer, compliance monitor and provisioning pipeline
//! together: decides when a session may start, forces it to stop before any
//! limit is breached, and cancels in-flight provisioning when compliance
//! turns critical. Forced stops are unconditional; safety takes precedence
//! over caller convenience.

use crate::alert::{dispatch, AlertHistory, AlertSink};
use crate::clock::Clock;
use crate::compliance::{AlertSeverity, ComplianceMonitor, ComplianceReport};
use crate::error::Result;
use crate::ledger::{QuotaLedger, SessionSummary, StopReason};
use crate::provision::{ProvisionRequest, ProvisioningPipeline, SessionHandle};
use crate::randomizer::BehaviorRandomizer;
use crate::worker::{Worker, WorkerId};
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

/// Session lifecycle states
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    /// No session, no cooldown
    Idle,
    /// Provisioning in flight
    Starting,
    /// Session active
    Running,
    /// Forced or scheduled stop in progress
    Stopping,
    /// Mandatory cooldown before the next start
    Cooldown,
}

impl SessionState {
    /// Stable string form
    pub fn as_str(&self) -> &'static str {
        match self {
            SessionState::Idle => "idle",
            SessionState::Starting => "starting",
            SessionState::Running => "running",
            SessionState::Stopping => "stopping",
            SessionState::Cooldown => "cooldown",
        }
    }
}

impl std::fmt::Display for SessionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Derive the lifecycle state from ledger fields. The ledger is the single
/// source of truth; no parallel state is kept that could fall out of sync.
pub fn session_state(worker: &Worker, now: DateTime<Utc>) -> SessionState {
    use crate::worker::WorkerStatus;
    match worker.status {
        WorkerStatus::Provisioning => SessionState::Starting,
        WorkerStatus::Online => SessionState::Running,
        WorkerStatus::Pending | WorkerStatus::Offline | WorkerStatus::Error => {
            if worker.in_cooldown(now) {
                SessionState::Cooldown
            } else {
                SessionState::Idle
            }
        }
    }
}

/// Session state transition rules
pub struct SessionTransition;

impl SessionTransition {
    /// Check if a transition is valid
    pub fn is_valid(from: SessionState, to: SessionState) -> bool {
        match (from, to) {
            (SessionState::Idle, SessionState::Starting) => true,
            (SessionState::Starting, SessionState::Running) => true,
            (SessionState::Starting, SessionState::Idle) => true,
            (SessionState::Running, SessionState::Stopping) => true,
            (SessionState::Stopping, SessionState::Idle) => true,
            (SessionState::Stopping, SessionState::Cooldown) => true,
            (SessionState::Cooldown, SessionState::Idle) => true,
            _ if from == to => true,
            _ => false,
        }
    }
}

/// Lifecycle tuning
#[derive(Debug, Clone)]
pub struct LifecycleConfig {
    /// Stop a running session when no work arrived for this long
    pub idle_timeout: Duration,
    /// Expected heartbeat cadence, used by status surfaces
    pub heartbeat_interval: Duration,
    /// Callback target handed to the provisioner
    pub callback_url: String,
}

impl Default for LifecycleConfig {
    fn default() -> Self {
        Self {
            idle_timeout: Duration::from_secs(600),
            heartbeat_interval: Duration::from_secs(30),
            callback_url: "http://localhost:5000/api/workers".to_string(),
        }
    }
}

/// Outcome of one lifecycle tick
#[derive(Debug)]
pub enum TickOutcome {
    /// Nothing to do
    Idle,
    /// Provisioning in flight; compliance was evaluated
    Starting {
        /// Report for the provisioning worker
        report: ComplianceReport,
    },
    /// Session continues
    Running {
        /// Derived elapsed seconds
        elapsed_seconds: u64,
        /// Report for this tick
        report: ComplianceReport,
    },
    /// A stop condition fired and the session was folded
    Stopped {
        /// Fold summary
        summary: SessionSummary,
    },
}

/// Drives sessions through their lifecycle
pub struct SessionLifecycleManager {
    ledger: Arc<QuotaLedger>,
    randomizer: Arc<BehaviorRandomizer>,
    pipeline: Arc<ProvisioningPipeline>,
    monitor: ComplianceMonitor,
    sink: Arc<dyn AlertSink>,
    history: Arc<AlertHistory>,
    clock: Arc<dyn Clock>,
    config: LifecycleConfig,
    cancels: Mutex<HashMap<WorkerId, CancellationToken>>,
    handles: Mutex<HashMap<WorkerId, SessionHandle>>,
}

impl SessionLifecycleManager {
    /// Wire a lifecycle manager
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        ledger: Arc<QuotaLedger>,
        randomizer: Arc<BehaviorRandomizer>,
        pipeline: Arc<ProvisioningPipeline>,
        monitor: ComplianceMonitor,
        sink: Arc<dyn AlertSink>,
        history: Arc<AlertHistory>,
        clock: Arc<dyn Clock>,
        config: LifecycleConfig,
    ) -> Self {
        Self {
            ledger,
            randomizer,
            pipeline,
            monitor,
            sink,
            history,
            clock,
            config,
            cancels: Mutex::new(HashMap::new()),
            handles: Mutex::new(HashMap::new()),
        }
    }

    /// Current lifecycle state of a worker
    pub async fn state(&self, id: &str) -> Result<SessionState> {
        let worker = self.ledger.get(id).await?;
        Ok(session_state(&worker, self.clock.now()))
    }

    /// Start a session on demand. The quota guard runs before provisioning:
    /// an exhausted budget surfaces [`Error::QuotaExceeded`] to the caller
    /// without entering `Starting`.
    pub async fn request_start(&self, id: &str) -> Result<SessionHandle> {
        let worker = self.ledger.begin_provisioning(id).await?;
        let now = self.clock.now();
        let randomization = self.randomizer.randomize_session(
            worker.provider_class,
            &worker.limits,
            now,
            now,
        );

        let token = CancellationToken::new();
        self.cancels
            .lock()
            .expect("cancel map lock poisoned")
            .insert(worker.id.clone(), token.clone());

        let request = ProvisionRequest {
            worker_id: worker.id.clone(),
            account_id: worker.account_id.clone(),
            provider_class: worker.provider_class,
            callback_url: self.config.callback_url.clone(),
            capabilities: worker.capabilities.clone(),
        };
        let provisioned = self.pipeline.provision(&request, &token).await;
        self.cancels
            .lock()
            .expect("cancel map lock poisoned")
            .remove(&worker.id);

        let handle = match provisioned {
            Ok(handle) => handle,
            Err(err) => {
                // Starting -> Idle: no session recorded
                self.ledger
                    .abort_provisioning(id, err.to_string())
                    .await
                    .ok();
                dispatch(
                    Arc::clone(&self.sink),
                    AlertSeverity::Warning,
                    "provisioning failed",
                    err.to_string(),
                    self.context(id),
                );
                return Err(err);
            }
        };

        match self.ledger.start_session(id, &randomization).await {
            Ok(_) => {
                self.handles
                    .lock()
                    .expect("handle map lock poisoned")
                    .insert(worker.id.clone(), handle.clone());
                dispatch(
                    Arc::clone(&self.sink),
                    AlertSeverity::Info,
                    "session started",
                    format!(
                        "worker {} running with a {}s cap",
                        worker.id, randomization.randomized_seconds
                    ),
                    self.context(id),
                );
                Ok(handle)
            }
            Err(err) => {
                // the guard re-ran under the worker lock and said no; the
                // provider-side session is live and must be torn down
                warn!(worker_id = %worker.id, "start rejected after provisioning: {err}");
                self.pipeline.terminate(&handle).await.ok();
                self.ledger
                    .abort_provisioning(id, err.to_string())
                    .await
                    .ok();
                Err(err)
            }
        }
    }

    /// One heartbeat-driven tick. Recomputes the derived duration, grades
    /// compliance, and fires the forced stop when any stop condition holds.
    pub async fn tick(&self, id: &str) -> Result<TickOutcome> {
        let worker = self.ledger.get(id).await?;
        let now = self.clock.now();

        match session_state(&worker, now) {
            SessionState::Starting => {
                let report = self.monitor.evaluate(&worker, now);
                self.record_alerts(&report);
                if !report.is_compliant {
                    self.cancel_pending(id);
                }
                Ok(TickOutcome::Starting { report })
            }
            SessionState::Running => {
                let elapsed = self.ledger.heartbeat(id).await?;
                let worker = self.ledger.get(id).await?;
                let report = self.monitor.evaluate(&worker, now);
                self.record_alerts(&report);

                let idle_for = worker
                    .last_work_at
                    .map(|at| now - at)
                    .unwrap_or_else(chrono::Duration::zero);
                let idle_limit = chrono::Duration::from_std(self.config.idle_timeout)
                    .unwrap_or_else(|_| chrono::Duration::minutes(10));

                let stop_reason = if elapsed >= worker.effective_session_cap() {
                    Some(StopReason::SessionCapReached)
                } else if worker.scheduled_stop_at.map(|at| now >= at).unwrap_or(false) {
                    Some(StopReason::Scheduled)
                } else if !report.is_compliant {
                    Some(StopReason::Compliance)
                } else if idle_for >= idle_limit {
                    Some(StopReason::IdleTimeout)
                } else {
                    None
                };

                match stop_reason {
                    Some(reason) => {
                        let summary = self.force_stop(id, reason).await?;
                        Ok(TickOutcome::Stopped { summary })
                    }
                    None => Ok(TickOutcome::Running {
                        elapsed_seconds: elapsed,
                        report,
                    }),
                }
            }
            SessionState::Idle | SessionState::Cooldown | SessionState::Stopping => {
                Ok(TickOutcome::Idle)
            }
        }
    }

    /// Stop a session now. Unconditional: does not wait for caller
    /// acknowledgment. Folds usage into the weekly ledger and, for the
    /// fixed-cooldown class, enters the mandatory cooldown.
    pub async fn force_stop(&self, id: &str, reason: StopReason) -> Result<SessionSummary> {
        let summary = self.ledger.end_session(id, reason).await?;

        let handle = self
            .handles
            .lock()
            .expect("handle map lock poisoned")
            .remove(id);
        if let Some(handle) = handle {
            if let Err(err) = self.pipeline.terminate(&handle).await {
                warn!(worker_id = id, "session terminate failed: {err}");
            }
        }

        let severity = match reason {
            StopReason::Scheduled | StopReason::Manual | StopReason::IdleTimeout => {
                AlertSeverity::Info
            }
            StopReason::Compliance => AlertSeverity::Critical,
            _ => AlertSeverity::Warning,
        };
        dispatch(
            Arc::clone(&self.sink),
            severity,
            "session stopped",
            format!(
                "worker {id} stopped ({reason}) after {}s",
                summary.duration_seconds
            ),
            self.context(id),
        );
        info!(worker_id = id, %reason, "forced stop completed");
        Ok(summary)
    }

    /// Record that work arrived for the worker
    pub async fn note_work(&self, id: &str) -> Result<()> {
        self.ledger.note_work(id).await
    }

    /// Cancel an in-flight provisioning attempt, if any. Used when the
    /// compliance monitor flags critical mid-provision.
    pub fn cancel_pending(&self, id: &str) {
        let cancels = self.cancels.lock().expect("cancel map lock poisoned");
        if let Some(token) = cancels.get(id) {
            warn!(worker_id = id, "cancelling in-flight provisioning");
            token.cancel();
        }
    }

    /// The bounded alert history
    pub fn history(&self) -> &Arc<AlertHistory> {
        &self.history
    }

    fn record_alerts(&self, report: &ComplianceReport) {
        for alert in &report.alerts {
            self.history.push(alert.clone());
            if alert.severity >= AlertSeverity::Warning {
                dispatch(
                    Arc::clone(&self.sink),
                    alert.severity,
                    alert.metric.as_str(),
                    alert.message.clone(),
                    self.context(&alert.worker_id),
                );
            }
        }
    }

    fn context(&self, worker_id: &str) -> HashMap<String, String> {
        let mut context = HashMap::new();
        context.insert("worker_id".to_string(), worker_id.to_string());
        context
    }
}
