//! Worker data model
//!
//! A worker is one tracked compute backend instance on a free-tier provider
//! account. Session usage fields are only ever mutated through the
//! [`QuotaLedger`](crate::ledger::QuotaLedger).

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::str::FromStr;

/// Unique worker identifier
pub type WorkerId = String;

/// Usage-policy family of a provider
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProviderClass {
    /// Short on-demand activation bursts gated by a rolling weekly cap
    OnDemandWeekly,
    /// Fixed-length session followed by a mandatory multi-hour cooldown
    FixedCooldown,
}

impl ProviderClass {
    /// Stable string form, used for persistence and logging
    pub fn as_str(&self) -> &'static str {
        match self {
            ProviderClass::OnDemandWeekly => "on_demand_weekly",
            ProviderClass::FixedCooldown => "fixed_cooldown",
        }
    }
}

impl std::fmt::Display for ProviderClass {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ProviderClass {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "on_demand_weekly" => Ok(ProviderClass::OnDemandWeekly),
            "fixed_cooldown" => Ok(ProviderClass::FixedCooldown),
            other => Err(format!("unknown provider class: {other}")),
        }
    }
}

/// Worker status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkerStatus {
    /// Registered but never provisioned
    Pending,
    /// Provisioning attempt in flight
    Provisioning,
    /// Session active, consuming provider-visible quota
    Online,
    /// No active session
    Offline,
    /// Last operation failed; `last_error` holds the classified cause
    Error,
}

impl WorkerStatus {
    /// Stable string form, used for persistence and logging
    pub fn as_str(&self) -> &'static str {
        match self {
            WorkerStatus::Pending => "pending",
            WorkerStatus::Provisioning => "provisioning",
            WorkerStatus::Online => "online",
            WorkerStatus::Offline => "offline",
            WorkerStatus::Error => "error",
        }
    }
}

impl std::fmt::Display for WorkerStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for WorkerStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(WorkerStatus::Pending),
            "provisioning" => Ok(WorkerStatus::Provisioning),
            "online" => Ok(WorkerStatus::Online),
            "offline" => Ok(WorkerStatus::Offline),
            "error" => Ok(WorkerStatus::Error),
            other => Err(format!("unknown worker status: {other}")),
        }
    }
}

/// Provider-specific hard ceilings. These are the true limits that must
/// never be crossed; safe operating bands sit strictly below them.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProviderLimits {
    /// Hard per-session ceiling
    pub max_session_seconds: u64,
    /// Hard rolling-weekly ceiling
    pub max_weekly_seconds: u64,
    /// Base mandatory cooldown after a session (0 for providers without one)
    pub cooldown_seconds: u64,
}

impl ProviderLimits {
    /// Default ceilings per provider class
    pub fn defaults_for(class: ProviderClass) -> Self {
        match class {
            // 12h sessions against a 30h rolling week, no mandatory cooldown
            ProviderClass::OnDemandWeekly => Self {
                max_session_seconds: 12 * 3600,
                max_weekly_seconds: 30 * 3600,
                cooldown_seconds: 0,
            },
            // 12h sessions, 30h week, 36h cooldown between sessions
            ProviderClass::FixedCooldown => Self {
                max_session_seconds: 12 * 3600,
                max_weekly_seconds: 30 * 3600,
                cooldown_seconds: 36 * 3600,
            },
        }
    }
}

/// Registration request for a new worker
#[derive(Debug, Clone)]
pub struct WorkerSpec {
    /// Provider class the account belongs to
    pub provider_class: ProviderClass,
    /// Provider account identifier
    pub account_id: String,
    /// Override the class-default ceilings
    pub limits: Option<ProviderLimits>,
    /// Reported hardware capabilities (gpu model, vram, ...)
    pub capabilities: HashMap<String, String>,
}

impl WorkerSpec {
    /// Create a registration request with class-default limits
    pub fn new(provider_class: ProviderClass, account_id: impl Into<String>) -> Self {
        Self {
            provider_class,
            account_id: account_id.into(),
            limits: None,
            capabilities: HashMap::new(),
        }
    }

    /// Override the provider ceilings
    pub fn with_limits(mut self, limits: ProviderLimits) -> Self {
        self.limits = Some(limits);
        self
    }

    /// Attach a capability entry
    pub fn with_capability(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.capabilities.insert(key.into(), value.into());
        self
    }
}

/// One tracked compute backend instance
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Worker {
    /// Unique identifier
    pub id: WorkerId,

    /// Provider class
    pub provider_class: ProviderClass,

    /// Provider account identifier
    pub account_id: String,

    /// Current status
    pub status: WorkerStatus,

    /// Start of the active session, if any
    pub session_started_at: Option<DateTime<Utc>>,

    /// Derived elapsed time of the active session. Recomputed from
    /// `session_started_at` on every heartbeat, never accumulated.
    pub session_duration_seconds: u64,

    /// Accumulated usage in the current rolling week
    pub weekly_usage_seconds: u64,

    /// Start of the current rolling 7-day window
    pub week_started_at: DateTime<Utc>,

    /// Provider hard ceilings
    pub limits: ProviderLimits,

    /// End of the mandatory cooldown, if one is active
    pub cooldown_until: Option<DateTime<Utc>>,

    /// Randomized planned stop instant for the active session
    pub scheduled_stop_at: Option<DateTime<Utc>>,

    /// Randomized effective duration cap for the active session
    pub session_cap_seconds: Option<u64>,

    /// Whether the latest external observation permits starting a session.
    /// Conservative default is overridden by reconciliation (§ sync).
    pub provider_can_start: bool,

    /// Last heartbeat instant
    pub last_heartbeat_at: Option<DateTime<Utc>>,

    /// Last instant work arrived for this worker; feeds the idle timeout
    pub last_work_at: Option<DateTime<Utc>>,

    /// Last classified error, for status surfaces
    pub last_error: Option<String>,

    /// Reported hardware capabilities
    pub capabilities: HashMap<String, String>,
}

impl Worker {
    /// Create a worker from a registration request
    pub fn from_spec(spec: WorkerSpec, now: DateTime<Utc>) -> Self {
        let limits = spec
            .limits
            .unwrap_or_else(|| ProviderLimits::defaults_for(spec.provider_class));
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            provider_class: spec.provider_class,
            account_id: spec.account_id,
            status: WorkerStatus::Pending,
            session_started_at: None,
            session_duration_seconds: 0,
            weekly_usage_seconds: 0,
            week_started_at: now,
            limits,
            cooldown_until: None,
            scheduled_stop_at: None,
            session_cap_seconds: None,
            provider_can_start: true,
            last_heartbeat_at: None,
            last_work_at: None,
            last_error: None,
            capabilities: spec.capabilities,
        }
    }

    /// Elapsed seconds of the active session at `now`, 0 when no session
    /// is active. Derived, so duplicate or missed heartbeats converge.
    pub fn session_elapsed(&self, now: DateTime<Utc>) -> u64 {
        match self.session_started_at {
            Some(started) => (now - started).num_seconds().max(0) as u64,
            None => 0,
        }
    }

    /// Whether a mandatory cooldown is active at `now`
    pub fn in_cooldown(&self, now: DateTime<Utc>) -> bool {
        matches!(self.cooldown_until, Some(until) if now < until)
    }

    /// Effective duration cap for the active session: the randomized cap,
    /// never above the provider hard ceiling
    pub fn effective_session_cap(&self) -> u64 {
        self.session_cap_seconds
            .map(|cap| cap.min(self.limits.max_session_seconds))
            .unwrap_or(self.limits.max_session_seconds)
    }

    /// Whether the rolling 7-day window has elapsed
    pub fn week_boundary_passed(&self, now: DateTime<Utc>) -> bool {
        now - self.week_started_at >= Duration::days(7)
    }

    /// Clear all session fields. Workers in `Error`/`Offline` must not
    /// carry an active session.
    pub fn clear_session(&mut self) {
        self.session_started_at = None;
        self.session_duration_seconds = 0;
        self.scheduled_stop_at = None;
        self.session_cap_seconds = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2025, 3, 3, 12, 0, 0).unwrap()
    }

    #[test]
    fn test_provider_class_round_trip() {
        for class in [ProviderClass::OnDemandWeekly, ProviderClass::FixedCooldown] {
            assert_eq!(class.as_str().parse::<ProviderClass>().unwrap(), class);
        }
        assert!("colab".parse::<ProviderClass>().is_err());
    }

    #[test]
    fn test_status_round_trip() {
        for status in [
            WorkerStatus::Pending,
            WorkerStatus::Provisioning,
            WorkerStatus::Online,
            WorkerStatus::Offline,
            WorkerStatus::Error,
        ] {
            assert_eq!(status.as_str().parse::<WorkerStatus>().unwrap(), status);
        }
    }

    #[test]
    fn test_session_elapsed_is_derived() {
        let mut worker = Worker::from_spec(
            WorkerSpec::new(ProviderClass::OnDemandWeekly, "acct-1"),
            t0(),
        );
        assert_eq!(worker.session_elapsed(t0()), 0);

        worker.session_started_at = Some(t0());
        let later = t0() + Duration::minutes(90);
        assert_eq!(worker.session_elapsed(later), 90 * 60);
        // asking twice at the same instant converges
        assert_eq!(worker.session_elapsed(later), 90 * 60);
    }

    #[test]
    fn test_effective_cap_never_exceeds_ceiling() {
        let mut worker = Worker::from_spec(
            WorkerSpec::new(ProviderClass::FixedCooldown, "acct-1"),
            t0(),
        );
        worker.session_cap_seconds = Some(worker.limits.max_session_seconds + 3600);
        assert_eq!(
            worker.effective_session_cap(),
            worker.limits.max_session_seconds
        );
    }

    #[test]
    fn test_cooldown_window() {
        let mut worker = Worker::from_spec(
            WorkerSpec::new(ProviderClass::FixedCooldown, "acct-1"),
            t0(),
        );
        worker.cooldown_until = Some(t0() + Duration::hours(36));
        assert!(worker.in_cooldown(t0() + Duration::hours(35)));
        assert!(!worker.in_cooldown(t0() + Duration::hours(36)));
    }
}
