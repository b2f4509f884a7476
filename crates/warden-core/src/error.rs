//! Error types for warden-core

use thiserror::Error;

/// Result type alias for warden-core operations
pub type Result<T> = std::result::Result<T, Error>;

/// Core error types
#[derive(Error, Debug)]
pub enum Error {
    /// Weekly or cooldown budget is exhausted; the caller must wait for a
    /// future window
    #[error("quota exceeded for worker {worker_id}: {reason}")]
    QuotaExceeded {
        /// The worker whose budget is exhausted
        worker_id: String,
        /// Which budget blocked the start
        reason: String,
    },

    /// A compliance limit was breached; handled internally via forced stop
    #[error("compliance violation: {0}")]
    ComplianceViolation(String),

    /// Provisioning failure worth retrying (timeout, rate limit, server error)
    #[error("transient provisioning failure: {0}")]
    TransientProvisioning(String),

    /// Provisioning failure that retrying cannot fix
    #[error("permanent provisioning failure: {0}")]
    PermanentProvisioning(String),

    /// Provider explicitly reported no free capacity
    #[error("provider reports no capacity: {0}")]
    ProviderExhausted(String),

    /// Retry budget spent without a success; tagged with classification and
    /// attempt count
    #[error("gave up after {attempts} attempts ({class}): {message}")]
    RetriesExhausted {
        /// Classification of the last failure
        class: crate::resilience::FailureClass,
        /// Number of attempts made
        attempts: u32,
        /// Last error message
        message: String,
    },

    /// Circuit breaker is open; calls fail fast without reaching the provider
    #[error("circuit open: dependency is failing, calls are short-circuited")]
    CircuitOpen,

    /// Scraper credentials are no longer valid; re-authentication required
    #[error("scraper authentication expired for account {0}")]
    ScrapeAuthExpired(String),

    /// Scrape failure worth retrying on the next cycle
    #[error("transient scrape failure: {0}")]
    ScrapeTransient(String),

    /// Quota payload did not parse into the expected shape
    #[error("malformed quota payload: {0}")]
    ScrapeFormat(String),

    /// Unknown worker id
    #[error("worker not found: {0}")]
    WorkerNotFound(String),

    /// No session is active for the worker
    #[error("no active session for worker {0}")]
    NoActiveSession(String),

    /// Session state machine rejected the transition
    #[error("invalid session transition: {from} -> {to}")]
    InvalidTransition {
        /// Current state
        from: String,
        /// Requested state
        to: String,
    },

    /// Persistence sink failure
    #[error("storage error: {0}")]
    Storage(String),

    /// Configuration error
    #[error("configuration error: {0}")]
    Config(String),

    /// Serialization error
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// IO error
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl Error {
    /// Create a quota exceeded error
    pub fn quota_exceeded(worker_id: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::QuotaExceeded {
            worker_id: worker_id.into(),
            reason: reason.into(),
        }
    }

    /// Create a compliance violation error
    pub fn compliance_violation(msg: impl Into<String>) -> Self {
        Self::ComplianceViolation(msg.into())
    }

    /// Create a transient provisioning error
    pub fn transient_provisioning(msg: impl Into<String>) -> Self {
        Self::TransientProvisioning(msg.into())
    }

    /// Create a permanent provisioning error
    pub fn permanent_provisioning(msg: impl Into<String>) -> Self {
        Self::PermanentProvisioning(msg.into())
    }

    /// Create a provider exhausted error
    pub fn provider_exhausted(msg: impl Into<String>) -> Self {
        Self::ProviderExhausted(msg.into())
    }

    /// Create a scrape auth expired error
    pub fn scrape_auth_expired(account: impl Into<String>) -> Self {
        Self::ScrapeAuthExpired(account.into())
    }

    /// Create a transient scrape error
    pub fn scrape_transient(msg: impl Into<String>) -> Self {
        Self::ScrapeTransient(msg.into())
    }

    /// Create a scrape format error
    pub fn scrape_format(msg: impl Into<String>) -> Self {
        Self::ScrapeFormat(msg.into())
    }

    /// Create a worker not found error
    pub fn worker_not_found(id: impl Into<String>) -> Self {
        Self::WorkerNotFound(id.into())
    }

    /// Create a no active session error
    pub fn no_active_session(id: impl Into<String>) -> Self {
        Self::NoActiveSession(id.into())
    }

    /// Create an invalid transition error
    pub fn invalid_transition(from: impl Into<String>, to: impl Into<String>) -> Self {
        Self::InvalidTransition {
            from: from.into(),
            to: to.into(),
        }
    }

    /// Create a storage error
    pub fn storage(msg: impl Into<String>) -> Self {
        Self::Storage(msg.into())
    }

    /// Create a config error
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }
}
