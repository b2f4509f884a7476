//! Compliance monitor
//!
//! Pure evaluation of a worker's usage against provider limits. The monitor
//! never mutates state and never talks to the network, so any historical
//! worker snapshot can be replayed through [`ComplianceMonitor::evaluate`]
//! for tests and incident forensics.

use crate::worker::Worker;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Alert severity, ordered from least to most severe
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AlertSeverity {
    /// Informational
    Info,
    /// Soft threshold crossed
    Warning,
    /// Hard safety threshold crossed; forced stop expected
    Critical,
    /// A provider rule is actively being broken
    Violation,
}

impl AlertSeverity {
    /// Stable string form
    pub fn as_str(&self) -> &'static str {
        match self {
            AlertSeverity::Info => "info",
            AlertSeverity::Warning => "warning",
            AlertSeverity::Critical => "critical",
            AlertSeverity::Violation => "violation",
        }
    }
}

impl std::fmt::Display for AlertSeverity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Metric a compliance alert refers to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QuotaMetric {
    /// Elapsed time of the active session
    SessionDuration,
    /// Accumulated usage in the rolling week
    WeeklyUsage,
    /// Mandatory cooldown between sessions
    Cooldown,
}

impl QuotaMetric {
    /// Stable string form
    pub fn as_str(&self) -> &'static str {
        match self {
            QuotaMetric::SessionDuration => "session_duration",
            QuotaMetric::WeeklyUsage => "weekly_usage",
            QuotaMetric::Cooldown => "cooldown",
        }
    }
}

impl std::fmt::Display for QuotaMetric {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One graded compliance alert
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ComplianceAlert {
    /// Worker the alert is about
    pub worker_id: String,
    /// Severity
    pub severity: AlertSeverity,
    /// Metric that crossed a threshold
    pub metric: QuotaMetric,
    /// Current usage in seconds
    pub current_seconds: u64,
    /// Hard limit in seconds
    pub limit_seconds: u64,
    /// Threshold ratio that was crossed
    pub threshold: f64,
    /// Human-readable description
    pub message: String,
    /// Evaluation instant
    pub timestamp: DateTime<Utc>,
}

/// Aggregate risk level
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RiskLevel {
    /// No warnings
    Low,
    /// Exactly one warning
    Moderate,
    /// Two or more warnings
    High,
    /// At least one critical or violation alert
    Critical,
}

impl RiskLevel {
    /// Stable string form
    pub fn as_str(&self) -> &'static str {
        match self {
            RiskLevel::Low => "low",
            RiskLevel::Moderate => "moderate",
            RiskLevel::High => "high",
            RiskLevel::Critical => "critical",
        }
    }
}

impl std::fmt::Display for RiskLevel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Result of one evaluation
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ComplianceReport {
    /// Worker evaluated
    pub worker_id: String,
    /// True when no critical or violation alert exists
    pub is_compliant: bool,
    /// Aggregate risk
    pub risk_level: RiskLevel,
    /// All alerts produced by this evaluation
    pub alerts: Vec<ComplianceAlert>,
    /// Evaluation instant
    pub evaluated_at: DateTime<Utc>,
}

impl ComplianceReport {
    /// Highest severity among the alerts, if any
    pub fn max_severity(&self) -> Option<AlertSeverity> {
        self.alerts.iter().map(|a| a.severity).max()
    }
}

/// Warning/critical ratios per metric, against the provider hard limit.
///
/// The critical ratios are absolute safe caps expressed as ratios: they sit
/// strictly below 1.0 so the forced stop always fires before the provider's
/// own enforcement would.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct ComplianceThresholds {
    /// Session soft threshold
    pub session_warning_ratio: f64,
    /// Session hard safety threshold (11h of a 12h ceiling by default)
    pub session_critical_ratio: f64,
    /// Weekly soft threshold
    pub weekly_warning_ratio: f64,
    /// Weekly hard safety threshold (26.1h of a 30h ceiling by default)
    pub weekly_critical_ratio: f64,
}

impl Default for ComplianceThresholds {
    fn default() -> Self {
        Self {
            session_warning_ratio: 0.85,
            session_critical_ratio: 0.9167,
            weekly_warning_ratio: 0.60,
            weekly_critical_ratio: 0.87,
        }
    }
}

/// Pure compliance evaluator
#[derive(Debug, Clone, Copy)]
pub struct ComplianceMonitor {
    thresholds: ComplianceThresholds,
}

impl ComplianceMonitor {
    /// Create a monitor with the given thresholds
    pub fn new(thresholds: ComplianceThresholds) -> Self {
        Self { thresholds }
    }

    /// The configured thresholds
    pub fn thresholds(&self) -> &ComplianceThresholds {
        &self.thresholds
    }

    /// Evaluate a worker snapshot at `now`
    pub fn evaluate(&self, worker: &Worker, now: DateTime<Utc>) -> ComplianceReport {
        let mut alerts = Vec::new();
        let session_elapsed = worker.session_elapsed(now);

        if worker.session_started_at.is_some() {
            self.grade(
                &mut alerts,
                worker,
                now,
                QuotaMetric::SessionDuration,
                session_elapsed,
                worker.limits.max_session_seconds,
                self.thresholds.session_warning_ratio,
                self.thresholds.session_critical_ratio,
            );
        }

        // project the active session into the weekly figure so the weekly
        // cap is enforced while the session is still running
        let weekly_projected = worker.weekly_usage_seconds + session_elapsed;
        self.grade(
            &mut alerts,
            worker,
            now,
            QuotaMetric::WeeklyUsage,
            weekly_projected,
            worker.limits.max_weekly_seconds,
            self.thresholds.weekly_warning_ratio,
            self.thresholds.weekly_critical_ratio,
        );

        if worker.in_cooldown(now) && worker.session_started_at.is_some() {
            alerts.push(ComplianceAlert {
                worker_id: worker.id.clone(),
                severity: AlertSeverity::Violation,
                metric: QuotaMetric::Cooldown,
                current_seconds: session_elapsed,
                limit_seconds: worker.limits.cooldown_seconds,
                threshold: 1.0,
                message: "session active during mandatory cooldown".to_string(),
                timestamp: now,
            });
        }

        let criticals = alerts
            .iter()
            .filter(|a| a.severity >= AlertSeverity::Critical)
            .count();
        let warnings = alerts
            .iter()
            .filter(|a| a.severity == AlertSeverity::Warning)
            .count();

        let risk_level = if criticals > 0 {
            RiskLevel::Critical
        } else if warnings >= 2 {
            RiskLevel::High
        } else if warnings == 1 {
            RiskLevel::Moderate
        } else {
            RiskLevel::Low
        };

        ComplianceReport {
            worker_id: worker.id.clone(),
            is_compliant: criticals == 0,
            risk_level,
            alerts,
            evaluated_at: now,
        }
    }

    #[allow(clippy::too_many_arguments)]
    fn grade(
        &self,
        alerts: &mut Vec<ComplianceAlert>,
        worker: &Worker,
        now: DateTime<Utc>,
        metric: QuotaMetric,
        current: u64,
        limit: u64,
        warning_ratio: f64,
        critical_ratio: f64,
    ) {
        if limit == 0 {
            return;
        }
        let utilization = current as f64 / limit as f64;
        let (severity, threshold) = if utilization > critical_ratio {
            (AlertSeverity::Critical, critical_ratio)
        } else if utilization > warning_ratio {
            (AlertSeverity::Warning, warning_ratio)
        } else {
            return;
        };
        alerts.push(ComplianceAlert {
            worker_id: worker.id.clone(),
            severity,
            metric,
            current_seconds: current,
            limit_seconds: limit,
            threshold,
            message: format!(
                "{metric} at {:.1}% of limit ({current}s of {limit}s)",
                utilization * 100.0
            ),
            timestamp: now,
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::worker::{ProviderClass, Worker, WorkerSpec, WorkerStatus};
    use chrono::{Duration, TimeZone};

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2025, 3, 3, 12, 0, 0).unwrap()
    }

    fn weekly_worker() -> Worker {
        Worker::from_spec(WorkerSpec::new(ProviderClass::OnDemandWeekly, "acct"), t0())
    }

    fn monitor() -> ComplianceMonitor {
        ComplianceMonitor::new(ComplianceThresholds::default())
    }

    #[test]
    fn test_idle_worker_is_low_risk() {
        let report = monitor().evaluate(&weekly_worker(), t0());
        assert!(report.is_compliant);
        assert_eq!(report.risk_level, RiskLevel::Low);
        assert!(report.alerts.is_empty());
    }

    #[test]
    fn test_weekly_warning_at_soft_threshold() {
        let mut worker = weekly_worker();
        // 20h of a 30h weekly limit: 66.7%, past the 60% soft threshold
        worker.weekly_usage_seconds = 20 * 3600;
        let report = monitor().evaluate(&worker, t0());
        assert!(report.is_compliant);
        assert_eq!(report.risk_level, RiskLevel::Moderate);
        assert_eq!(report.alerts.len(), 1);
        assert_eq!(report.alerts[0].metric, QuotaMetric::WeeklyUsage);
        assert_eq!(report.alerts[0].severity, AlertSeverity::Warning);
    }

    #[test]
    fn test_weekly_critical_at_safe_cap() {
        let mut worker = weekly_worker();
        // past 26.1h of a 30h limit (87% safe cap)
        worker.weekly_usage_seconds = 26 * 3600 + 7 * 60;
        let report = monitor().evaluate(&worker, t0());
        assert!(!report.is_compliant);
        assert_eq!(report.risk_level, RiskLevel::Critical);
    }

    #[test]
    fn test_session_critical_past_safe_band() {
        let mut worker = Worker::from_spec(
            WorkerSpec::new(ProviderClass::FixedCooldown, "acct"),
            t0(),
        );
        worker.status = WorkerStatus::Online;
        worker.session_started_at = Some(t0());

        // 11h of a 12h ceiling stays just below the critical ratio
        let at_band = monitor().evaluate(&worker, t0() + Duration::hours(11));
        assert!(at_band.is_compliant);

        // a couple of minutes past the band crosses it
        let past_band =
            monitor().evaluate(&worker, t0() + Duration::hours(11) + Duration::minutes(3));
        assert!(!past_band.is_compliant);
        assert_eq!(past_band.risk_level, RiskLevel::Critical);
        assert!(past_band
            .alerts
            .iter()
            .any(|a| a.metric == QuotaMetric::SessionDuration
                && a.severity == AlertSeverity::Critical));
    }

    #[test]
    fn test_two_warnings_is_high_risk() {
        let mut worker = weekly_worker();
        worker.status = WorkerStatus::Online;
        worker.session_started_at = Some(t0());
        // 10.5h session (87.5% of 12h, past the 85% session warning) with
        // 8h already on the week: projected 18.5h of 30h (61.7%, past 60%)
        worker.weekly_usage_seconds = 8 * 3600;
        let now = t0() + Duration::minutes(630);
        let report = monitor().evaluate(&worker, now);
        assert!(report.is_compliant);
        assert_eq!(report.risk_level, RiskLevel::High);
        assert_eq!(
            report
                .alerts
                .iter()
                .filter(|a| a.severity == AlertSeverity::Warning)
                .count(),
            2
        );
    }

    #[test]
    fn test_session_during_cooldown_is_violation() {
        let mut worker = Worker::from_spec(
            WorkerSpec::new(ProviderClass::FixedCooldown, "acct"),
            t0(),
        );
        worker.status = WorkerStatus::Online;
        worker.session_started_at = Some(t0());
        worker.cooldown_until = Some(t0() + Duration::hours(36));

        let report = monitor().evaluate(&worker, t0() + Duration::minutes(5));
        assert!(!report.is_compliant);
        assert_eq!(report.max_severity(), Some(AlertSeverity::Violation));
    }

    #[test]
    fn test_replayable_over_snapshots() {
        let mut worker = weekly_worker();
        worker.weekly_usage_seconds = 20 * 3600;
        let m = monitor();
        let a = m.evaluate(&worker, t0());
        let b = m.evaluate(&worker, t0());
        assert_eq!(a.risk_level, b.risk_level);
        assert_eq!(a.alerts.len(), b.alerts.len());
    }
}
