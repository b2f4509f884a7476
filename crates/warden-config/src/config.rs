//! Configuration structures
//!
//! The YAML surface for everything the runtime lets an operator tune:
//! provider ceilings, safe bands, compliance thresholds, retry and breaker
//! policy, sync cadence. Values convert into `warden-core` runtime types
//! after validation; nothing here is reloaded mid-run.

use crate::{Error, Result};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use warden_core::compliance::ComplianceThresholds;
use warden_core::lifecycle::LifecycleConfig;
use warden_core::randomizer::{DurationBand, RandomizerConfig};
use warden_core::resilience::{BreakerConfig, RetryPolicy};
use warden_core::runtime::RuntimeConfig;
use warden_core::sync::SyncConfig;
use warden_core::worker::ProviderLimits;

/// Main configuration structure
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WardenConfig {
    /// Version of the config format
    #[serde(default = "default_version")]
    pub version: String,

    /// Provider ceilings per class
    #[serde(default)]
    pub providers: ProvidersSection,

    /// Compliance threshold ratios
    #[serde(default)]
    pub compliance: ComplianceSection,

    /// Randomizer bands and jitters
    #[serde(default)]
    pub randomizer: RandomizerSection,

    /// Provisioning retry policy
    #[serde(default)]
    pub retry: RetrySection,

    /// Circuit breaker settings
    #[serde(default)]
    pub circuit_breaker: BreakerSection,

    /// Provisioning call settings
    #[serde(default)]
    pub provisioning: ProvisioningSection,

    /// Lifecycle timeouts
    #[serde(default)]
    pub lifecycle: LifecycleSection,

    /// Sync scheduler cadence
    #[serde(default)]
    pub sync: SyncSection,

    /// Alerting settings
    #[serde(default)]
    pub alerts: AlertsSection,

    /// Optional database sink
    #[serde(default)]
    pub database: Option<DatabaseSection>,
}

fn default_version() -> String {
    "1.0".to_string()
}

/// Ceilings for one provider class
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct ProviderSection {
    /// Hard per-session ceiling
    pub max_session_seconds: u64,
    /// Hard rolling-weekly ceiling
    pub max_weekly_seconds: u64,
    /// Base mandatory cooldown after a session
    pub cooldown_seconds: u64,
}

impl From<ProviderSection> for ProviderLimits {
    fn from(section: ProviderSection) -> Self {
        ProviderLimits {
            max_session_seconds: section.max_session_seconds,
            max_weekly_seconds: section.max_weekly_seconds,
            cooldown_seconds: section.cooldown_seconds,
        }
    }
}

/// Provider ceilings per class
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct ProvidersSection {
    /// On-demand weekly class (burst sessions under a weekly cap)
    #[serde(default = "default_on_demand")]
    pub on_demand_weekly: ProviderSection,
    /// Fixed-cooldown class (long sessions with mandatory cooldown)
    #[serde(default = "default_fixed")]
    pub fixed_cooldown: ProviderSection,
}

fn default_on_demand() -> ProviderSection {
    ProviderSection {
        max_session_seconds: 12 * 3600,
        max_weekly_seconds: 30 * 3600,
        cooldown_seconds: 0,
    }
}

fn default_fixed() -> ProviderSection {
    ProviderSection {
        max_session_seconds: 12 * 3600,
        max_weekly_seconds: 30 * 3600,
        cooldown_seconds: 36 * 3600,
    }
}

impl Default for ProvidersSection {
    fn default() -> Self {
        Self {
            on_demand_weekly: default_on_demand(),
            fixed_cooldown: default_fixed(),
        }
    }
}

/// Compliance threshold ratios against the hard limits
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct ComplianceSection {
    /// Session soft threshold
    #[serde(default = "default_session_warning")]
    pub session_warning_ratio: f64,
    /// Session hard safety threshold
    #[serde(default = "default_session_critical")]
    pub session_critical_ratio: f64,
    /// Weekly soft threshold
    #[serde(default = "default_weekly_warning")]
    pub weekly_warning_ratio: f64,
    /// Weekly hard safety threshold
    #[serde(default = "default_weekly_critical")]
    pub weekly_critical_ratio: f64,
}

fn default_session_warning() -> f64 {
    0.85
}

fn default_session_critical() -> f64 {
    0.9167
}

fn default_weekly_warning() -> f64 {
    0.60
}

fn default_weekly_critical() -> f64 {
    0.87
}

impl Default for ComplianceSection {
    fn default() -> Self {
        Self {
            session_warning_ratio: default_session_warning(),
            session_critical_ratio: default_session_critical(),
            weekly_warning_ratio: default_weekly_warning(),
            weekly_critical_ratio: default_weekly_critical(),
        }
    }
}

/// One duration band in seconds
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct BandSection {
    /// Shortest duration
    pub min_seconds: u64,
    /// Longest duration
    pub max_seconds: u64,
}

/// Randomizer tuning
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct RandomizerSection {
    /// Session band for the on-demand weekly class
    #[serde(default = "default_on_demand_band")]
    pub on_demand_band: BandSection,
    /// Session band for the fixed-cooldown class
    #[serde(default = "default_fixed_band")]
    pub fixed_band: BandSection,
    /// Maximum absolute start jitter
    #[serde(default = "default_start_jitter")]
    pub start_jitter_seconds: u64,
    /// Cooldown jitter as a fraction of the base cooldown
    #[serde(default = "default_cooldown_jitter")]
    pub cooldown_jitter_fraction: f64,
    /// Attempt bound for finding an acceptable start instant
    #[serde(default = "default_start_attempts")]
    pub max_start_attempts: u32,
}

fn default_on_demand_band() -> BandSection {
    BandSection {
        min_seconds: 3 * 3600,
        max_seconds: 5 * 3600,
    }
}

fn default_fixed_band() -> BandSection {
    BandSection {
        min_seconds: 10 * 3600 + 1800,
        max_seconds: 11 * 3600,
    }
}

fn default_start_jitter() -> u64 {
    600
}

fn default_cooldown_jitter() -> f64 {
    0.05
}

fn default_start_attempts() -> u32 {
    16
}

impl Default for RandomizerSection {
    fn default() -> Self {
        Self {
            on_demand_band: default_on_demand_band(),
            fixed_band: default_fixed_band(),
            start_jitter_seconds: default_start_jitter(),
            cooldown_jitter_fraction: default_cooldown_jitter(),
            max_start_attempts: default_start_attempts(),
        }
    }
}

/// Retry policy for provisioning calls
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct RetrySection {
    /// Maximum retries after the first attempt
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    /// Delay before the first retry
    #[serde(default = "default_base_delay")]
    pub base_delay_seconds: u64,
    /// Exponential multiplier per retry
    #[serde(default = "default_multiplier")]
    pub multiplier: f64,
    /// Cap on any single delay
    #[serde(default = "default_max_delay")]
    pub max_delay_seconds: u64,
    /// Jitter as a fraction of the computed delay
    #[serde(default = "default_jitter_factor")]
    pub jitter_factor: f64,
}

fn default_max_retries() -> u32 {
    3
}

fn default_base_delay() -> u64 {
    2
}

fn default_multiplier() -> f64 {
    2.0
}

fn default_max_delay() -> u64 {
    60
}

fn default_jitter_factor() -> f64 {
    0.5
}

impl Default for RetrySection {
    fn default() -> Self {
        Self {
            max_retries: default_max_retries(),
            base_delay_seconds: default_base_delay(),
            multiplier: default_multiplier(),
            max_delay_seconds: default_max_delay(),
            jitter_factor: default_jitter_factor(),
        }
    }
}

/// Circuit breaker settings
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct BreakerSection {
    /// Consecutive failures before the circuit opens
    #[serde(default = "default_failure_threshold")]
    pub failure_threshold: u32,
    /// How long the circuit stays open
    #[serde(default = "default_reset_timeout")]
    pub reset_timeout_seconds: u64,
}

fn default_failure_threshold() -> u32 {
    5
}

fn default_reset_timeout() -> u64 {
    60
}

impl Default for BreakerSection {
    fn default() -> Self {
        Self {
            failure_threshold: default_failure_threshold(),
            reset_timeout_seconds: default_reset_timeout(),
        }
    }
}

/// Provisioning call settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProvisioningSection {
    /// Hard per-call timeout
    #[serde(default = "default_provision_timeout")]
    pub call_timeout_seconds: u64,
    /// Callback target handed to the provisioner
    #[serde(default = "default_callback_url")]
    pub callback_url: String,
}

fn default_provision_timeout() -> u64 {
    120
}

fn default_callback_url() -> String {
    "http://localhost:5000/api/workers".to_string()
}

impl Default for ProvisioningSection {
    fn default() -> Self {
        Self {
            call_timeout_seconds: default_provision_timeout(),
            callback_url: default_callback_url(),
        }
    }
}

/// Lifecycle timeouts
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct LifecycleSection {
    /// Stop a session when no work arrived for this long
    #[serde(default = "default_idle_timeout")]
    pub idle_timeout_seconds: u64,
    /// Expected heartbeat cadence
    #[serde(default = "default_heartbeat_interval")]
    pub heartbeat_interval_seconds: u64,
}

fn default_idle_timeout() -> u64 {
    600
}

fn default_heartbeat_interval() -> u64 {
    30
}

impl Default for LifecycleSection {
    fn default() -> Self {
        Self {
            idle_timeout_seconds: default_idle_timeout(),
            heartbeat_interval_seconds: default_heartbeat_interval(),
        }
    }
}

/// Sync scheduler cadence
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct SyncSection {
    /// Cycle cadence
    #[serde(default = "default_sync_interval")]
    pub interval_seconds: u64,
    /// Hard per-scrape timeout
    #[serde(default = "default_scrape_timeout")]
    pub scrape_timeout_seconds: u64,
    /// Concurrent scrapes
    #[serde(default = "default_max_concurrent")]
    pub max_concurrent: usize,
    /// Snapshot freshness window
    #[serde(default = "default_snapshot_ttl")]
    pub snapshot_ttl_seconds: u64,
    /// Heartbeat silence after which an online worker is stopped
    #[serde(default = "default_heartbeat_silence")]
    pub heartbeat_silence_seconds: u64,
}

fn default_sync_interval() -> u64 {
    600
}

fn default_scrape_timeout() -> u64 {
    180
}

fn default_max_concurrent() -> usize {
    2
}

fn default_snapshot_ttl() -> u64 {
    900
}

fn default_heartbeat_silence() -> u64 {
    300
}

impl Default for SyncSection {
    fn default() -> Self {
        Self {
            interval_seconds: default_sync_interval(),
            scrape_timeout_seconds: default_scrape_timeout(),
            max_concurrent: default_max_concurrent(),
            snapshot_ttl_seconds: default_snapshot_ttl(),
            heartbeat_silence_seconds: default_heartbeat_silence(),
        }
    }
}

/// Alerting settings
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct AlertsSection {
    /// Bounded in-memory alert history size
    #[serde(default = "default_history_capacity")]
    pub history_capacity: usize,
}

fn default_history_capacity() -> usize {
    256
}

impl Default for AlertsSection {
    fn default() -> Self {
        Self {
            history_capacity: default_history_capacity(),
        }
    }
}

/// Database sink settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseSection {
    /// Connection URL, e.g. `sqlite://warden.db`
    pub url: String,
}

impl Default for WardenConfig {
    fn default() -> Self {
        Self {
            version: default_version(),
            providers: ProvidersSection::default(),
            compliance: ComplianceSection::default(),
            randomizer: RandomizerSection::default(),
            retry: RetrySection::default(),
            circuit_breaker: BreakerSection::default(),
            provisioning: ProvisioningSection::default(),
            lifecycle: LifecycleSection::default(),
            sync: SyncSection::default(),
            alerts: AlertsSection::default(),
            database: None,
        }
    }
}

impl WardenConfig {
    /// Validate cross-field constraints
    pub fn validate(&self) -> Result<()> {
        for (name, ratio) in [
            ("session_warning_ratio", self.compliance.session_warning_ratio),
            ("session_critical_ratio", self.compliance.session_critical_ratio),
            ("weekly_warning_ratio", self.compliance.weekly_warning_ratio),
            ("weekly_critical_ratio", self.compliance.weekly_critical_ratio),
        ] {
            if !(0.0..1.0).contains(&ratio) {
                return Err(Error::validation(format!(
                    "{name} must be within (0, 1), got {ratio}"
                )));
            }
        }
        if self.compliance.session_warning_ratio >= self.compliance.session_critical_ratio {
            return Err(Error::validation(
                "session warning ratio must sit below the critical ratio",
            ));
        }
        if self.compliance.weekly_warning_ratio >= self.compliance.weekly_critical_ratio {
            return Err(Error::validation(
                "weekly warning ratio must sit below the critical ratio",
            ));
        }

        for (name, band, ceiling) in [
            (
                "on_demand_band",
                self.randomizer.on_demand_band,
                self.providers.on_demand_weekly.max_session_seconds,
            ),
            (
                "fixed_band",
                self.randomizer.fixed_band,
                self.providers.fixed_cooldown.max_session_seconds,
            ),
        ] {
            if band.min_seconds > band.max_seconds {
                return Err(Error::validation(format!("{name} is inverted")));
            }
            if band.max_seconds > ceiling {
                return Err(Error::validation(format!(
                    "{name} exceeds the provider session ceiling"
                )));
            }
        }

        if !(0.0..=1.0).contains(&self.retry.jitter_factor) {
            return Err(Error::validation("retry jitter_factor must be within [0, 1]"));
        }
        if self.sync.max_concurrent == 0 {
            return Err(Error::validation("sync max_concurrent must be at least 1"));
        }
        Ok(())
    }

    /// Validate and convert into the core runtime configuration
    pub fn to_runtime_config(&self) -> Result<RuntimeConfig> {
        self.validate()?;
        Ok(RuntimeConfig {
            on_demand_limits: self.providers.on_demand_weekly.into(),
            fixed_limits: self.providers.fixed_cooldown.into(),
            thresholds: ComplianceThresholds {
                session_warning_ratio: self.compliance.session_warning_ratio,
                session_critical_ratio: self.compliance.session_critical_ratio,
                weekly_warning_ratio: self.compliance.weekly_warning_ratio,
                weekly_critical_ratio: self.compliance.weekly_critical_ratio,
            },
            randomizer: RandomizerConfig {
                on_demand_band: DurationBand {
                    min_seconds: self.randomizer.on_demand_band.min_seconds,
                    max_seconds: self.randomizer.on_demand_band.max_seconds,
                },
                fixed_band: DurationBand {
                    min_seconds: self.randomizer.fixed_band.min_seconds,
                    max_seconds: self.randomizer.fixed_band.max_seconds,
                },
                start_jitter_seconds: self.randomizer.start_jitter_seconds,
                cooldown_jitter_fraction: self.randomizer.cooldown_jitter_fraction,
                max_start_attempts: self.randomizer.max_start_attempts,
            },
            retry: RetryPolicy {
                max_retries: self.retry.max_retries,
                base_delay: Duration::from_secs(self.retry.base_delay_seconds),
                multiplier: self.retry.multiplier,
                max_delay: Duration::from_secs(self.retry.max_delay_seconds),
                jitter_factor: self.retry.jitter_factor,
            },
            breaker: BreakerConfig {
                failure_threshold: self.circuit_breaker.failure_threshold,
                reset_timeout: Duration::from_secs(self.circuit_breaker.reset_timeout_seconds),
            },
            provision_timeout: Duration::from_secs(self.provisioning.call_timeout_seconds),
            lifecycle: LifecycleConfig {
                idle_timeout: Duration::from_secs(self.lifecycle.idle_timeout_seconds),
                heartbeat_interval: Duration::from_secs(self.lifecycle.heartbeat_interval_seconds),
                callback_url: self.provisioning.callback_url.clone(),
            },
            sync: SyncConfig {
                interval: Duration::from_secs(self.sync.interval_seconds),
                scrape_timeout: Duration::from_secs(self.sync.scrape_timeout_seconds),
                max_concurrent: self.sync.max_concurrent,
                snapshot_ttl: Duration::from_secs(self.sync.snapshot_ttl_seconds),
                heartbeat_silence: Duration::from_secs(self.sync.heartbeat_silence_seconds),
            },
            alert_history_capacity: self.alerts.history_capacity,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_default_is_valid() {
        let config = WardenConfig::default();
        assert_eq!(config.version, "1.0");
        config.validate().unwrap();

        let runtime = config.to_runtime_config().unwrap();
        assert_eq!(runtime.on_demand_limits.max_weekly_seconds, 30 * 3600);
        assert_eq!(runtime.fixed_limits.cooldown_seconds, 36 * 3600);
        assert_eq!(runtime.sync.interval, Duration::from_secs(600));
    }

    #[test]
    fn test_partial_yaml_fills_defaults() {
        let yaml = r#"
providers:
  fixed_cooldown:
    max_session_seconds: 32400
    max_weekly_seconds: 108000
    cooldown_seconds: 129600
randomizer:
  fixed_band:
    min_seconds: 28800
    max_seconds: 30600
"#;
        let config: WardenConfig = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(config.providers.fixed_cooldown.max_session_seconds, 32400);
        assert_eq!(config.randomizer.fixed_band.max_seconds, 30600);
        // untouched sections keep their defaults
        assert_eq!(config.retry.max_retries, 3);
        assert_eq!(config.sync.max_concurrent, 2);
        config.validate().unwrap();
    }

    #[test]
    fn test_inverted_band_rejected() {
        let mut config = WardenConfig::default();
        config.randomizer.fixed_band = BandSection {
            min_seconds: 11 * 3600,
            max_seconds: 10 * 3600,
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_band_above_ceiling_rejected() {
        let mut config = WardenConfig::default();
        config.randomizer.fixed_band.max_seconds = 13 * 3600;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_warning_above_critical_rejected() {
        let mut config = WardenConfig::default();
        config.compliance.weekly_warning_ratio = 0.9;
        assert!(config.validate().is_err());
    }
}
