//! Retry, backoff and circuit breaking
//!
//! Generic wrapper for any fallible external action (provisioning, webhook
//! delivery, scraping). Failures are classified before any retry decision:
//! permanent and capacity errors abort immediately, only transient errors
//! consume retry budget. A circuit breaker in front stops hammering a
//! dependency that keeps failing.

use crate::clock::Clock;
use crate::error::{Error, Result};
use chrono::{DateTime, Utc};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tracing::{debug, warn};

/// Failure classification driving the retry decision
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureClass {
    /// Client/validation-class error; retrying cannot help
    Permanent,
    /// Provider explicitly reported no capacity; the caller should wait,
    /// not retry
    QuotaExhausted,
    /// Timeout, rate limit, server error or network failure; retried
    Transient,
}

impl FailureClass {
    /// Stable string form
    pub fn as_str(&self) -> &'static str {
        match self {
            FailureClass::Permanent => "permanent",
            FailureClass::QuotaExhausted => "quota_exhausted",
            FailureClass::Transient => "transient",
        }
    }
}

impl std::fmt::Display for FailureClass {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl Error {
    /// Classify this error for retry purposes
    pub fn failure_class(&self) -> FailureClass {
        match self {
            Error::TransientProvisioning(_) | Error::ScrapeTransient(_) | Error::Io(_) => {
                FailureClass::Transient
            }
            Error::ProviderExhausted(_) | Error::QuotaExceeded { .. } => {
                FailureClass::QuotaExhausted
            }
            Error::RetriesExhausted { class, .. } => *class,
            _ => FailureClass::Permanent,
        }
    }
}

/// Exponential backoff policy with jitter
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Maximum number of retries after the first attempt
    pub max_retries: u32,
    /// Delay before the first retry
    pub base_delay: Duration,
    /// Exponential multiplier per retry
    pub multiplier: f64,
    /// Cap on any single delay
    pub max_delay: Duration,
    /// Jitter as a fraction of the computed delay (0.5 = +/-50%)
    pub jitter_factor: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay: Duration::from_secs(2),
            multiplier: 2.0,
            max_delay: Duration::from_secs(60),
            jitter_factor: 0.5,
        }
    }
}

impl RetryPolicy {
    /// Delay before retry number `retry` (0-based), with jitter applied.
    /// Jitter spreads synchronized retry storms; the envelope stays within
    /// `computed * (1 +/- jitter_factor)` capped at `max_delay * (1 + jitter_factor)`.
    pub fn delay_for(&self, retry: u32, rng: &mut impl Rng) -> Duration {
        let exp = self.base_delay.as_secs_f64() * self.multiplier.powi(retry as i32);
        let capped = exp.min(self.max_delay.as_secs_f64());
        let jitter = 1.0 + self.jitter_factor * (rng.gen::<f64>() * 2.0 - 1.0);
        Duration::from_secs_f64((capped * jitter).max(0.0))
    }
}

/// Circuit breaker configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BreakerConfig {
    /// Consecutive failures before the circuit opens
    pub failure_threshold: u32,
    /// How long the circuit stays open before admitting a trial call
    pub reset_timeout: Duration,
}

impl Default for BreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            reset_timeout: Duration::from_secs(60),
        }
    }
}

/// Observable circuit state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CircuitState {
    /// Calls pass through
    Closed,
    /// Calls fail fast
    Open,
    /// One trial call is admitted
    HalfOpen,
}

#[derive(Debug)]
struct BreakerInner {
    state: CircuitState,
    consecutive_failures: u32,
    opened_at: Option<DateTime<Utc>>,
    probe_in_flight: bool,
}

/// Consecutive-failure circuit breaker
#[derive(Debug)]
pub struct CircuitBreaker {
    config: BreakerConfig,
    clock: Arc<dyn Clock>,
    inner: Mutex<BreakerInner>,
}

impl CircuitBreaker {
    /// Create a breaker in the closed state
    pub fn new(config: BreakerConfig, clock: Arc<dyn Clock>) -> Self {
        Self {
            config,
            clock,
            inner: Mutex::new(BreakerInner {
                state: CircuitState::Closed,
                consecutive_failures: 0,
                opened_at: None,
                probe_in_flight: false,
            }),
        }
    }

    /// Gate a call. `Err(CircuitOpen)` means the wrapped function must not
    /// be invoked. When the reset timeout has elapsed exactly one caller is
    /// admitted as the half-open trial.
    pub fn try_acquire(&self) -> Result<()> {
        let mut inner = self.inner.lock().expect("breaker lock poisoned");
        match inner.state {
            CircuitState::Closed => Ok(()),
            CircuitState::Open => {
                let elapsed_enough = inner.opened_at.map_or(true, |at| {
                    (self.clock.now() - at).to_std().unwrap_or_default() >= self.config.reset_timeout
                });
                if elapsed_enough {
                    inner.state = CircuitState::HalfOpen;
                    inner.probe_in_flight = true;
                    debug!("circuit half-open, admitting trial call");
                    Ok(())
                } else {
                    Err(Error::CircuitOpen)
                }
            }
            CircuitState::HalfOpen => {
                if inner.probe_in_flight {
                    Err(Error::CircuitOpen)
                } else {
                    inner.probe_in_flight = true;
                    Ok(())
                }
            }
        }
    }

    /// Record a successful call. Any success closes the circuit and zeroes
    /// the failure count immediately.
    pub fn record_success(&self) {
        let mut inner = self.inner.lock().expect("breaker lock poisoned");
        inner.state = CircuitState::Closed;
        inner.consecutive_failures = 0;
        inner.opened_at = None;
        inner.probe_in_flight = false;
    }

    /// Record a failed call
    pub fn record_failure(&self) {
        let mut inner = self.inner.lock().expect("breaker lock poisoned");
        inner.consecutive_failures += 1;
        let reopen = inner.state == CircuitState::HalfOpen
            || inner.consecutive_failures >= self.config.failure_threshold;
        inner.probe_in_flight = false;
        if reopen {
            if inner.state != CircuitState::Open {
                warn!(
                    failures = inner.consecutive_failures,
                    "circuit opened, failing fast for {:?}", self.config.reset_timeout
                );
            }
            inner.state = CircuitState::Open;
            inner.opened_at = Some(self.clock.now());
        }
    }

    /// Current circuit state
    pub fn state(&self) -> CircuitState {
        self.inner.lock().expect("breaker lock poisoned").state
    }

    /// Current consecutive failure count
    pub fn consecutive_failures(&self) -> u32 {
        self.inner
            .lock()
            .expect("breaker lock poisoned")
            .consecutive_failures
    }
}

/// Combines the breaker gate, failure classification and jittered backoff
/// into one call wrapper
#[derive(Debug)]
pub struct ResilientCaller {
    policy: RetryPolicy,
    breaker: Arc<CircuitBreaker>,
    rng: Mutex<StdRng>,
}

impl ResilientCaller {
    /// Create a caller with entropy-seeded jitter
    pub fn new(policy: RetryPolicy, breaker: Arc<CircuitBreaker>) -> Self {
        Self {
            policy,
            breaker,
            rng: Mutex::new(StdRng::from_entropy()),
        }
    }

    /// Create a caller with deterministic jitter for tests
    pub fn with_seed(policy: RetryPolicy, breaker: Arc<CircuitBreaker>, seed: u64) -> Self {
        Self {
            policy,
            breaker,
            rng: Mutex::new(StdRng::seed_from_u64(seed)),
        }
    }

    /// The shared breaker
    pub fn breaker(&self) -> &Arc<CircuitBreaker> {
        &self.breaker
    }

    /// Invoke `op` under the breaker and retry policy. `op` receives the
    /// 1-based attempt number. Transient failures are retried with jittered
    /// exponential backoff up to `max_retries`; permanent and capacity
    /// failures abort immediately with the original error.
    pub async fn call<T, F, Fut>(&self, mut op: F) -> Result<T>
    where
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let mut attempts: u32 = 0;
        loop {
            self.breaker.try_acquire()?;
            attempts += 1;
            match op(attempts).await {
                Ok(value) => {
                    self.breaker.record_success();
                    return Ok(value);
                }
                Err(err) => {
                    self.breaker.record_failure();
                    let class = err.failure_class();
                    match class {
                        FailureClass::Permanent | FailureClass::QuotaExhausted => {
                            debug!(attempt = attempts, %class, "aborting, not retryable: {err}");
                            return Err(err);
                        }
                        FailureClass::Transient => {
                            if attempts > self.policy.max_retries {
                                return Err(Error::RetriesExhausted {
                                    class,
                                    attempts,
                                    message: err.to_string(),
                                });
                            }
                            let delay = {
                                let mut rng = self.rng.lock().expect("rng lock poisoned");
                                self.policy.delay_for(attempts - 1, &mut *rng)
                            };
                            debug!(
                                attempt = attempts,
                                delay_ms = delay.as_millis() as u64,
                                "transient failure, backing off: {err}"
                            );
                            tokio::time::sleep(delay).await;
                        }
                    }
                }
            }
        }
    }
}
