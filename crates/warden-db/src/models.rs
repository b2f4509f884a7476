//! Database row models and conversions to/from core types

use crate::DbError;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use warden_core::scrape::QuotaSnapshot;
use warden_core::worker::{ProviderLimits, Worker};

/// Database row for the workers table
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct WorkerRow {
    pub id: String,
    pub provider_class: String,
    pub account_id: String,
    pub status: String,
    pub session_started_at: Option<String>,
    pub session_duration_seconds: i64,
    pub weekly_usage_seconds: i64,
    pub week_started_at: String,
    pub max_session_seconds: i64,
    pub max_weekly_seconds: i64,
    pub cooldown_seconds: i64,
    pub cooldown_until: Option<String>,
    pub scheduled_stop_at: Option<String>,
    pub session_cap_seconds: Option<i64>,
    pub provider_can_start: bool,
    pub last_heartbeat_at: Option<String>,
    pub last_work_at: Option<String>,
    pub last_error: Option<String>,
    pub capabilities: String,
    pub updated_at: String,
}

/// Database row for the quota_snapshots table
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct QuotaSnapshotRow {
    pub id: String,
    pub provider_class: String,
    pub account_id: String,
    pub session_remaining_seconds: i64,
    pub weekly_remaining_seconds: i64,
    pub can_start: bool,
    pub should_stop: bool,
    pub success: bool,
    pub error: Option<String>,
    pub scrape_duration_ms: i64,
    pub captured_at: String,
    pub expires_at: String,
}

/// Convert a DateTime to an RFC3339 string
pub fn datetime_to_string(dt: DateTime<Utc>) -> String {
    dt.to_rfc3339()
}

/// Parse an RFC3339 string to a DateTime
pub fn string_to_datetime(s: &str) -> Result<DateTime<Utc>, DbError> {
    DateTime::parse_from_rfc3339(s)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| DbError::validation(format!("bad timestamp {s:?}: {e}")))
}

fn optional_datetime(s: &Option<String>) -> Result<Option<DateTime<Utc>>, DbError> {
    s.as_deref().map(string_to_datetime).transpose()
}

impl WorkerRow {
    /// Build a row from a core worker, stamping `updated_at`
    pub fn from_worker(worker: &Worker, updated_at: DateTime<Utc>) -> Result<Self, DbError> {
        Ok(Self {
            id: worker.id.clone(),
            provider_class: worker.provider_class.as_str().to_string(),
            account_id: worker.account_id.clone(),
            status: worker.status.as_str().to_string(),
            session_started_at: worker.session_started_at.map(datetime_to_string),
            session_duration_seconds: worker.session_duration_seconds as i64,
            weekly_usage_seconds: worker.weekly_usage_seconds as i64,
            week_started_at: datetime_to_string(worker.week_started_at),
            max_session_seconds: worker.limits.max_session_seconds as i64,
            max_weekly_seconds: worker.limits.max_weekly_seconds as i64,
            cooldown_seconds: worker.limits.cooldown_seconds as i64,
            cooldown_until: worker.cooldown_until.map(datetime_to_string),
            scheduled_stop_at: worker.scheduled_stop_at.map(datetime_to_string),
            session_cap_seconds: worker.session_cap_seconds.map(|s| s as i64),
            provider_can_start: worker.provider_can_start,
            last_heartbeat_at: worker.last_heartbeat_at.map(datetime_to_string),
            last_work_at: worker.last_work_at.map(datetime_to_string),
            last_error: worker.last_error.clone(),
            capabilities: serde_json::to_string(&worker.capabilities)?,
            updated_at: datetime_to_string(updated_at),
        })
    }
}

impl TryFrom<WorkerRow> for Worker {
    type Error = DbError;

    fn try_from(row: WorkerRow) -> Result<Self, Self::Error> {
        let provider_class = row
            .provider_class
            .parse()
            .map_err(DbError::Validation)?;
        let status = row.status.parse().map_err(DbError::Validation)?;
        Ok(Worker {
            id: row.id,
            provider_class,
            account_id: row.account_id,
            status,
            session_started_at: optional_datetime(&row.session_started_at)?,
            session_duration_seconds: row.session_duration_seconds.max(0) as u64,
            weekly_usage_seconds: row.weekly_usage_seconds.max(0) as u64,
            week_started_at: string_to_datetime(&row.week_started_at)?,
            limits: ProviderLimits {
                max_session_seconds: row.max_session_seconds.max(0) as u64,
                max_weekly_seconds: row.max_weekly_seconds.max(0) as u64,
                cooldown_seconds: row.cooldown_seconds.max(0) as u64,
            },
            cooldown_until: optional_datetime(&row.cooldown_until)?,
            scheduled_stop_at: optional_datetime(&row.scheduled_stop_at)?,
            session_cap_seconds: row.session_cap_seconds.map(|s| s.max(0) as u64),
            provider_can_start: row.provider_can_start,
            last_heartbeat_at: optional_datetime(&row.last_heartbeat_at)?,
            last_work_at: optional_datetime(&row.last_work_at)?,
            last_error: row.last_error,
            capabilities: serde_json::from_str(&row.capabilities)?,
        })
    }
}

impl QuotaSnapshotRow {
    /// Build a row from a core snapshot
    pub fn from_snapshot(snapshot: &QuotaSnapshot) -> Self {
        Self {
            id: snapshot.id.clone(),
            provider_class: snapshot.provider_class.as_str().to_string(),
            account_id: snapshot.account_id.clone(),
            session_remaining_seconds: snapshot.session_remaining_seconds as i64,
            weekly_remaining_seconds: snapshot.weekly_remaining_seconds as i64,
            can_start: snapshot.can_start,
            should_stop: snapshot.should_stop,
            success: snapshot.success,
            error: snapshot.error.clone(),
            scrape_duration_ms: snapshot.scrape_duration_ms as i64,
            captured_at: datetime_to_string(snapshot.captured_at),
            expires_at: datetime_to_string(snapshot.expires_at),
        }
    }
}

impl TryFrom<QuotaSnapshotRow> for QuotaSnapshot {
    type Error = DbError;

    fn try_from(row: QuotaSnapshotRow) -> Result<Self, Self::Error> {
        Ok(QuotaSnapshot {
            id: row.id,
            provider_class: row
                .provider_class
                .parse()
                .map_err(DbError::Validation)?,
            account_id: row.account_id,
            session_remaining_seconds: row.session_remaining_seconds.max(0) as u64,
            weekly_remaining_seconds: row.weekly_remaining_seconds.max(0) as u64,
            can_start: row.can_start,
            should_stop: row.should_stop,
            success: row.success,
            error: row.error,
            scrape_duration_ms: row.scrape_duration_ms.max(0) as u64,
            captured_at: string_to_datetime(&row.captured_at)?,
            expires_at: string_to_datetime(&row.expires_at)?,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use warden_core::worker::{ProviderClass, WorkerSpec};

    #[test]
    fn test_worker_row_round_trip() {
        let now = Utc.with_ymd_and_hms(2025, 3, 3, 12, 0, 0).unwrap();
        let mut worker = Worker::from_spec(
            WorkerSpec::new(ProviderClass::FixedCooldown, "acct-1")
                .with_capability("gpu", "T4 x2"),
            now,
        );
        worker.session_started_at = Some(now);
        worker.session_cap_seconds = Some(39600);
        worker.weekly_usage_seconds = 7200;

        let row = WorkerRow::from_worker(&worker, now).unwrap();
        let back = Worker::try_from(row).unwrap();

        assert_eq!(back.id, worker.id);
        assert_eq!(back.provider_class, worker.provider_class);
        assert_eq!(back.session_started_at, worker.session_started_at);
        assert_eq!(back.session_cap_seconds, Some(39600));
        assert_eq!(back.weekly_usage_seconds, 7200);
        assert_eq!(back.capabilities.get("gpu").map(String::as_str), Some("T4 x2"));
    }

    #[test]
    fn test_bad_enum_rejected() {
        let now = Utc.with_ymd_and_hms(2025, 3, 3, 12, 0, 0).unwrap();
        let worker = Worker::from_spec(WorkerSpec::new(ProviderClass::OnDemandWeekly, "a"), now);
        let mut row = WorkerRow::from_worker(&worker, now).unwrap();
        row.status = "sleeping".to_string();
        assert!(matches!(
            Worker::try_from(row),
            Err(DbError::Validation(_))
        ));
    }
}
