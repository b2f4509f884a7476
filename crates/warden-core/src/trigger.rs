//! Recurring trigger
//!
//! Generic periodic driver decoupled from any scheduling library: a fixed
//! interval or a cron expression, an immediate "run now" override, and
//! enable/disable without tearing the loop down.

use crate::error::{Error, Result};
use chrono::Utc;
use cron::Schedule;
use std::future::Future;
use std::str::FromStr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

/// When the trigger fires
#[derive(Debug, Clone)]
pub enum TriggerSpec {
    /// Fixed interval between runs
    Interval(Duration),
    /// Cron expression evaluated in UTC
    Cron(String),
}

/// Periodic driver with run-now override and enable/disable
pub struct RecurringTrigger {
    spec: TriggerSpec,
    schedule: Option<Schedule>,
    enabled: AtomicBool,
    shutting_down: AtomicBool,
    run_now: Notify,
    shutdown_signal: Notify,
}

impl RecurringTrigger {
    /// Create an interval trigger
    pub fn interval(every: Duration) -> Self {
        Self {
            spec: TriggerSpec::Interval(every),
            schedule: None,
            enabled: AtomicBool::new(true),
            shutting_down: AtomicBool::new(false),
            run_now: Notify::new(),
            shutdown_signal: Notify::new(),
        }
    }

    /// Create a cron trigger; the expression is validated up front
    pub fn cron(expression: impl Into<String>) -> Result<Self> {
        let expression = expression.into();
        let schedule = Schedule::from_str(&expression)
            .map_err(|e| Error::config(format!("invalid cron expression {expression:?}: {e}")))?;
        Ok(Self {
            spec: TriggerSpec::Cron(expression),
            schedule: Some(schedule),
            enabled: AtomicBool::new(true),
            shutting_down: AtomicBool::new(false),
            run_now: Notify::new(),
            shutdown_signal: Notify::new(),
        })
    }

    /// The configured spec
    pub fn spec(&self) -> &TriggerSpec {
        &self.spec
    }

    /// Fire the task immediately, regardless of the schedule
    pub fn run_now(&self) {
        self.run_now.notify_one();
    }

    /// Resume firing on schedule
    pub fn enable(&self) {
        self.enabled.store(true, Ordering::Relaxed);
    }

    /// Keep the loop alive but skip firings
    pub fn disable(&self) {
        self.enabled.store(false, Ordering::Relaxed);
    }

    /// Whether the trigger currently fires
    pub fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::Relaxed)
    }

    /// Request the loop to terminate
    pub fn shutdown(&self) {
        self.shutting_down.store(true, Ordering::Relaxed);
        // notify_one stores a permit, so a shutdown issued before the loop
        // reaches its select is not lost
        self.shutdown_signal.notify_one();
    }

    /// Whether shutdown was requested
    pub fn is_shutting_down(&self) -> bool {
        self.shutting_down.load(Ordering::Relaxed)
    }

    fn next_delay(&self) -> Duration {
        match &self.spec {
            TriggerSpec::Interval(every) => *every,
            TriggerSpec::Cron(_) => {
                let next = self
                    .schedule
                    .as_ref()
                    .and_then(|s| s.upcoming(Utc).next());
                match next {
                    Some(at) => (at - Utc::now()).to_std().unwrap_or(Duration::ZERO),
                    None => {
                        warn!("cron schedule has no upcoming firing, falling back to 1h");
                        Duration::from_secs(3600)
                    }
                }
            }
        }
    }

    /// Spawn the trigger loop, invoking `task` on every firing. A trigger
    /// that was shut down can be started again.
    pub fn start<F, Fut>(self: Arc<Self>, mut task: F) -> JoinHandle<()>
    where
        F: FnMut() -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send,
    {
        self.shutting_down.store(false, Ordering::Relaxed);
        tokio::spawn(async move {
            loop {
                if self.is_shutting_down() {
                    break;
                }
                let delay = self.next_delay();
                tokio::select! {
                    _ = tokio::time::sleep(delay) => {}
                    _ = self.run_now.notified() => {
                        debug!("trigger fired by run_now override");
                    }
                    _ = self.shutdown_signal.notified() => break,
                }
                if self.is_shutting_down() {
                    break;
                }
                if self.is_enabled() {
                    task().await;
                }
            }
            debug!("trigger loop terminated");
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicU32;

    #[tokio::test]
    async fn test_run_now_fires_immediately() {
        let trigger = Arc::new(RecurringTrigger::interval(Duration::from_secs(3600)));
        let fired = Arc::new(AtomicU32::new(0));

        let fired_clone = fired.clone();
        let handle = trigger.clone().start(move || {
            let fired = fired_clone.clone();
            async move {
                fired.fetch_add(1, Ordering::SeqCst);
            }
        });

        // without the override nothing fires for an hour
        trigger.run_now();
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(fired.load(Ordering::SeqCst), 1);

        trigger.shutdown();
        handle.await.unwrap();
    }

    #[tokio::test]
    async fn test_disabled_trigger_skips_firing() {
        let trigger = Arc::new(RecurringTrigger::interval(Duration::from_secs(3600)));
        trigger.disable();
        let fired = Arc::new(AtomicU32::new(0));

        let fired_clone = fired.clone();
        let handle = trigger.clone().start(move || {
            let fired = fired_clone.clone();
            async move {
                fired.fetch_add(1, Ordering::SeqCst);
            }
        });

        trigger.run_now();
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(fired.load(Ordering::SeqCst), 0);

        trigger.enable();
        trigger.run_now();
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(fired.load(Ordering::SeqCst), 1);

        trigger.shutdown();
        handle.await.unwrap();
    }

    #[tokio::test]
    async fn test_interval_trigger_fires_repeatedly() {
        let trigger = Arc::new(RecurringTrigger::interval(Duration::from_millis(10)));
        let fired = Arc::new(AtomicU32::new(0));

        let fired_clone = fired.clone();
        let handle = trigger.clone().start(move || {
            let fired = fired_clone.clone();
            async move {
                fired.fetch_add(1, Ordering::SeqCst);
            }
        });

        tokio::time::sleep(Duration::from_millis(100)).await;
        trigger.shutdown();
        handle.await.unwrap();
        assert!(fired.load(Ordering::SeqCst) >= 2);
    }

    #[test]
    fn test_invalid_cron_rejected() {
        assert!(RecurringTrigger::cron("not a cron").is_err());
        assert!(RecurringTrigger::cron("0 */10 * * * *").is_ok());
    }
}
