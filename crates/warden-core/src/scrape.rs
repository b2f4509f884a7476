//! Quota scrape boundary
//!
//! The external scraper drives a logged-in provider UI and reports raw quota
//! numbers. Payloads are loosely typed on the wire, so they are parsed into a
//! validated [`QuotaSnapshot`] right here at the ingestion boundary. A
//! payload that does not parse is a [`Error::ScrapeFormat`]: the snapshot is
//! recorded as failed and treated as "assume worst case, do not start" —
//! never silently replaced with optimistic defaults.

use crate::error::{Error, Result};
use crate::worker::ProviderClass;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Loosely-typed quota payload as the scraper reports it
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RawQuotaPayload {
    /// Remaining session time in seconds
    pub session_remaining: f64,
    /// Remaining weekly time in seconds
    pub weekly_remaining: f64,
    /// Provider-side verdict on whether a session may start
    pub can_start: bool,
    /// Provider-side recommendation to stop the running session
    #[serde(default)]
    pub should_stop: bool,
}

/// Immutable, TTL'd observation of provider-side quota state
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QuotaSnapshot {
    /// Snapshot identifier
    pub id: String,
    /// Provider class observed
    pub provider_class: ProviderClass,
    /// Account observed
    pub account_id: String,
    /// Remaining session seconds reported by the provider
    pub session_remaining_seconds: u64,
    /// Remaining weekly seconds reported by the provider
    pub weekly_remaining_seconds: u64,
    /// Provider-side verdict on whether a session may start
    pub can_start: bool,
    /// Provider-side recommendation to stop
    pub should_stop: bool,
    /// Whether the scrape produced usable numbers
    pub success: bool,
    /// Error text for failed scrapes
    pub error: Option<String>,
    /// How long the scrape took
    pub scrape_duration_ms: u64,
    /// Observation instant
    pub captured_at: DateTime<Utc>,
    /// Instant after which the snapshot is stale
    pub expires_at: DateTime<Utc>,
}

impl QuotaSnapshot {
    /// Parse a raw JSON payload into a validated snapshot.
    /// Fails with [`Error::ScrapeFormat`] on shape or range problems.
    pub fn parse(
        provider_class: ProviderClass,
        account_id: impl Into<String>,
        raw_json: &str,
        captured_at: DateTime<Utc>,
        ttl: Duration,
        scrape_duration_ms: u64,
    ) -> Result<Self> {
        let payload: RawQuotaPayload = serde_json::from_str(raw_json)
            .map_err(|e| Error::scrape_format(format!("quota payload: {e}")))?;

        for (field, value) in [
            ("sessionRemaining", payload.session_remaining),
            ("weeklyRemaining", payload.weekly_remaining),
        ] {
            if !value.is_finite() || value < 0.0 {
                return Err(Error::scrape_format(format!(
                    "{field} out of range: {value}"
                )));
            }
        }

        Ok(Self {
            id: uuid::Uuid::new_v4().to_string(),
            provider_class,
            account_id: account_id.into(),
            session_remaining_seconds: payload.session_remaining as u64,
            weekly_remaining_seconds: payload.weekly_remaining as u64,
            can_start: payload.can_start,
            should_stop: payload.should_stop,
            success: true,
            error: None,
            scrape_duration_ms,
            captured_at,
            expires_at: captured_at
                + chrono::Duration::from_std(ttl).unwrap_or_else(|_| chrono::Duration::minutes(15)),
        })
    }

    /// Build a failed snapshot: no usable numbers, `can_start` pinned to
    /// false so a broken scrape can never green-light a start
    pub fn failed(
        provider_class: ProviderClass,
        account_id: impl Into<String>,
        error: impl Into<String>,
        captured_at: DateTime<Utc>,
        ttl: Duration,
        scrape_duration_ms: u64,
    ) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            provider_class,
            account_id: account_id.into(),
            session_remaining_seconds: 0,
            weekly_remaining_seconds: 0,
            can_start: false,
            should_stop: false,
            success: false,
            error: Some(error.into()),
            scrape_duration_ms,
            captured_at,
            expires_at: captured_at
                + chrono::Duration::from_std(ttl).unwrap_or_else(|_| chrono::Duration::minutes(15)),
        }
    }

    /// Whether the snapshot is still authoritative at `now`
    pub fn is_fresh(&self, now: DateTime<Utc>) -> bool {
        now < self.expires_at
    }
}

/// External collaborator extracting quota numbers from a provider UI.
///
/// Returns the raw JSON payload; parsing happens in the core. Failures are
/// classified: [`Error::ScrapeAuthExpired`] triggers re-authentication,
/// [`Error::ScrapeTransient`] is retried on the next cycle.
#[async_trait]
pub trait QuotaScraper: Send + Sync {
    /// Scrape quota state for one authenticated account
    async fn scrape(&self, account_id: &str, provider_class: ProviderClass) -> Result<String>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2025, 3, 3, 12, 0, 0).unwrap()
    }

    #[test]
    fn test_parse_valid_payload() {
        let raw = r#"{"sessionRemaining": 3600, "weeklyRemaining": 72000.5, "canStart": true, "shouldStop": false}"#;
        let snapshot = QuotaSnapshot::parse(
            ProviderClass::OnDemandWeekly,
            "acct-1",
            raw,
            t0(),
            Duration::from_secs(900),
            412,
        )
        .unwrap();

        assert!(snapshot.success);
        assert_eq!(snapshot.session_remaining_seconds, 3600);
        assert_eq!(snapshot.weekly_remaining_seconds, 72000);
        assert!(snapshot.can_start);
        assert!(!snapshot.should_stop);
        assert_eq!(snapshot.expires_at, t0() + chrono::Duration::minutes(15));
    }

    #[test]
    fn test_should_stop_defaults_false() {
        let raw = r#"{"sessionRemaining": 100, "weeklyRemaining": 200, "canStart": false}"#;
        let snapshot = QuotaSnapshot::parse(
            ProviderClass::FixedCooldown,
            "acct-1",
            raw,
            t0(),
            Duration::from_secs(900),
            100,
        )
        .unwrap();
        assert!(!snapshot.should_stop);
    }

    #[test]
    fn test_malformed_payload_is_format_error() {
        for raw in [
            "not json",
            r#"{"sessionRemaining": "plenty", "weeklyRemaining": 1, "canStart": true}"#,
            r#"{"weeklyRemaining": 1, "canStart": true}"#,
            r#"{"sessionRemaining": -5, "weeklyRemaining": 1, "canStart": true}"#,
        ] {
            let result = QuotaSnapshot::parse(
                ProviderClass::OnDemandWeekly,
                "acct-1",
                raw,
                t0(),
                Duration::from_secs(900),
                50,
            );
            assert!(
                matches!(result, Err(Error::ScrapeFormat(_))),
                "payload should be rejected: {raw}"
            );
        }
    }

    #[test]
    fn test_failed_snapshot_blocks_start() {
        let snapshot = QuotaSnapshot::failed(
            ProviderClass::OnDemandWeekly,
            "acct-1",
            "timed out",
            t0(),
            Duration::from_secs(900),
            180_000,
        );
        assert!(!snapshot.success);
        assert!(!snapshot.can_start);
        assert_eq!(snapshot.error.as_deref(), Some("timed out"));
    }

    #[test]
    fn test_staleness() {
        let snapshot = QuotaSnapshot::failed(
            ProviderClass::OnDemandWeekly,
            "acct-1",
            "x",
            t0(),
            Duration::from_secs(900),
            1,
        );
        assert!(snapshot.is_fresh(t0() + chrono::Duration::minutes(14)));
        assert!(!snapshot.is_fresh(t0() + chrono::Duration::minutes(15)));
    }
}
