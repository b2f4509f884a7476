//! Behavior randomizer
//!
//! Free-tier providers fingerprint mechanical usage: identical session
//! lengths, starts on the exact hour, activity at dead hours. Every duration
//! and instant this module produces is drawn from a bounded band strictly
//! below the provider hard ceiling, so the randomization can never push
//! usage past a limit. The RNG is injectable via [`BehaviorRandomizer::with_seed`]
//! so tests can assert exact distributions.

use crate::worker::{ProviderClass, ProviderLimits};
use chrono::{DateTime, Duration, Timelike, Utc};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};
use std::sync::Mutex;

/// Inclusive duration band in seconds
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DurationBand {
    /// Shortest acceptable duration
    pub min_seconds: u64,
    /// Longest acceptable duration
    pub max_seconds: u64,
}

impl DurationBand {
    /// Midpoint of the band, the nominal duration
    pub fn midpoint(&self) -> u64 {
        (self.min_seconds + self.max_seconds) / 2
    }
}

/// Randomizer tuning
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RandomizerConfig {
    /// Session band for the on-demand weekly class (short bursts)
    pub on_demand_band: DurationBand,
    /// Session band for the fixed-cooldown class (near-full sessions)
    pub fixed_band: DurationBand,
    /// Maximum absolute start jitter
    pub start_jitter_seconds: u64,
    /// Cooldown jitter as a fraction of the base cooldown
    pub cooldown_jitter_fraction: f64,
    /// Attempt bound for [`BehaviorRandomizer::suggest_start`]
    pub max_start_attempts: u32,
}

impl Default for RandomizerConfig {
    fn default() -> Self {
        Self {
            // 3h - 5h bursts
            on_demand_band: DurationBand {
                min_seconds: 3 * 3600,
                max_seconds: 5 * 3600,
            },
            // 10.5h - 11h out of the 12h ceiling
            fixed_band: DurationBand {
                min_seconds: 10 * 3600 + 1800,
                max_seconds: 11 * 3600,
            },
            start_jitter_seconds: 600,
            cooldown_jitter_fraction: 0.05,
            max_start_attempts: 16,
        }
    }
}

impl RandomizerConfig {
    /// The session band for a provider class
    pub fn band_for(&self, class: ProviderClass) -> DurationBand {
        match class {
            ProviderClass::OnDemandWeekly => self.on_demand_band,
            ProviderClass::FixedCooldown => self.fixed_band,
        }
    }
}

/// Verdict on a candidate start instant
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StartVerdict {
    /// Instant looks organic
    Accepted,
    /// Instant matches a mechanical pattern
    Rejected(&'static str),
}

impl StartVerdict {
    /// Whether the candidate was accepted
    pub fn is_accepted(&self) -> bool {
        matches!(self, StartVerdict::Accepted)
    }
}

/// Result of randomizing one session
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionRandomization {
    /// Band midpoint
    pub nominal_seconds: u64,
    /// Drawn session duration, the effective cap for this session
    pub randomized_seconds: u64,
    /// randomized - nominal
    pub delta_seconds: i64,
    /// Applied start offset
    pub start_jitter_seconds: i64,
    /// Jittered, pattern-checked start instant
    pub planned_start: DateTime<Utc>,
    /// Instant the session actually started
    pub actual_start: DateTime<Utc>,
}

/// Draws randomized session parameters from provider-safe bands
#[derive(Debug)]
pub struct BehaviorRandomizer {
    config: RandomizerConfig,
    rng: Mutex<StdRng>,
}

impl BehaviorRandomizer {
    /// Create a randomizer seeded from OS entropy
    pub fn new(config: RandomizerConfig) -> Self {
        Self {
            config,
            rng: Mutex::new(StdRng::from_entropy()),
        }
    }

    /// Create a deterministic randomizer for reproducible tests
    pub fn with_seed(config: RandomizerConfig, seed: u64) -> Self {
        Self {
            config,
            rng: Mutex::new(StdRng::seed_from_u64(seed)),
        }
    }

    /// Draw a session duration from the class band, clamped so even the
    /// band extreme never exceeds the provider hard ceiling
    pub fn randomize_duration(&self, class: ProviderClass, limits: &ProviderLimits) -> u64 {
        let band = self.config.band_for(class);
        let hi = band.max_seconds.min(limits.max_session_seconds);
        let lo = band.min_seconds.min(hi);
        let mut rng = self.rng.lock().expect("rng lock poisoned");
        rng.gen_range(lo..=hi)
    }

    /// Offset a nominal start by a bounded random jitter
    pub fn jitter_start(&self, nominal: DateTime<Utc>, _class: ProviderClass) -> DateTime<Utc> {
        let bound = self.config.start_jitter_seconds as i64;
        if bound == 0 {
            return nominal;
        }
        let offset = {
            let mut rng = self.rng.lock().expect("rng lock poisoned");
            rng.gen_range(-bound..=bound)
        };
        nominal + Duration::seconds(offset)
    }

    /// Offset a base cooldown by a bounded fraction in either direction
    pub fn jitter_cooldown(&self, base_seconds: u64) -> u64 {
        let bound = (base_seconds as f64 * self.config.cooldown_jitter_fraction) as i64;
        if bound == 0 {
            return base_seconds;
        }
        let offset = {
            let mut rng = self.rng.lock().expect("rng lock poisoned");
            rng.gen_range(-bound..=bound)
        };
        (base_seconds as i64 + offset).max(0) as u64
    }

    /// Reject mechanically regular start instants
    pub fn is_acceptable_start(&self, candidate: DateTime<Utc>) -> StartVerdict {
        if candidate.minute() == 0 && candidate.second() == 0 {
            return StartVerdict::Rejected("exact top of hour");
        }
        if (2..5).contains(&candidate.hour()) {
            return StartVerdict::Rejected("low-traffic window");
        }
        StartVerdict::Accepted
    }

    /// Advance a candidate start by random increments until it passes the
    /// pattern check; bounded attempts, best-effort fallback
    pub fn suggest_start(&self, base: DateTime<Utc>, class: ProviderClass) -> DateTime<Utc> {
        let mut candidate = self.jitter_start(base, class);
        for _ in 0..self.config.max_start_attempts {
            if self.is_acceptable_start(candidate).is_accepted() {
                return candidate;
            }
            let advance = {
                let mut rng = self.rng.lock().expect("rng lock poisoned");
                rng.gen_range(180..=1200)
            };
            candidate += Duration::seconds(advance);
        }
        candidate
    }

    /// Compute the full randomization for one session
    pub fn randomize_session(
        &self,
        class: ProviderClass,
        limits: &ProviderLimits,
        nominal_start: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> SessionRandomization {
        let band = self.config.band_for(class);
        let nominal = band.midpoint();
        let randomized = self.randomize_duration(class, limits);
        let planned_start = self.suggest_start(nominal_start, class);
        SessionRandomization {
            nominal_seconds: nominal,
            randomized_seconds: randomized,
            delta_seconds: randomized as i64 - nominal as i64,
            start_jitter_seconds: (planned_start - nominal_start).num_seconds(),
            planned_start,
            actual_start: now,
        }
    }
}
