//! Resilient provisioning pipeline
//!
//! Wraps the external provisioner (browser automation, notebook launcher)
//! behind the retry/breaker layer, a hard per-call timeout, and a
//! cancellation seam. A compliance-critical flag raised while an attempt is
//! in flight cancels the attempt; a handle that was already produced is
//! terminated, because a just-provisioned session still consumes
//! provider-visible time.

use crate::error::{Error, Result};
use crate::resilience::ResilientCaller;
use crate::worker::{ProviderClass, WorkerId};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Request to start one compute session
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProvisionRequest {
    /// Worker the session is for
    pub worker_id: WorkerId,
    /// Provider account to start the session under
    pub account_id: String,
    /// Provider class
    pub provider_class: ProviderClass,
    /// Callback target the remote worker reports to
    pub callback_url: String,
    /// Capability hints forwarded to the provisioner
    pub capabilities: HashMap<String, String>,
}

/// Handle to a provisioned session
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionHandle {
    /// Provider-side session identifier
    pub session_id: String,
    /// Tunnel endpoint the session is reachable at, if any
    pub endpoint: Option<String>,
    /// When the session was provisioned
    pub provisioned_at: DateTime<Utc>,
}

/// External collaborator that actually starts and stops sessions.
///
/// Implementations classify their failures through the core error taxonomy:
/// [`Error::TransientProvisioning`] is retried, [`Error::PermanentProvisioning`]
/// aborts, [`Error::ProviderExhausted`] is surfaced so the caller can wait.
#[async_trait]
pub trait Provisioner: Send + Sync {
    /// Start a session, returning a handle
    async fn provision(&self, request: &ProvisionRequest) -> Result<SessionHandle>;

    /// Stop a session
    async fn terminate(&self, handle: &SessionHandle) -> Result<()>;
}

/// Retry/breaker/timeout wrapper around a [`Provisioner`]
pub struct ProvisioningPipeline {
    provisioner: Arc<dyn Provisioner>,
    caller: ResilientCaller,
    call_timeout: Duration,
}

impl ProvisioningPipeline {
    /// Wrap a provisioner
    pub fn new(
        provisioner: Arc<dyn Provisioner>,
        caller: ResilientCaller,
        call_timeout: Duration,
    ) -> Self {
        Self {
            provisioner,
            caller,
            call_timeout,
        }
    }

    /// Provision a session with retries, backoff and fail-fast breaker.
    /// The hard per-attempt timeout is independent of retry timing; the
    /// cancellation token interrupts an attempt mid-flight.
    pub async fn provision(
        &self,
        request: &ProvisionRequest,
        cancel: &CancellationToken,
    ) -> Result<SessionHandle> {
        let handle = self
            .caller
            .call(|attempt| {
                let provisioner = Arc::clone(&self.provisioner);
                let cancel = cancel.clone();
                async move {
                    debug!(
                        worker_id = %request.worker_id,
                        attempt,
                        "provisioning attempt"
                    );
                    tokio::select! {
                        _ = cancel.cancelled() => {
                            Err(Error::permanent_provisioning("attempt cancelled"))
                        }
                        outcome = tokio::time::timeout(
                            self.call_timeout,
                            provisioner.provision(request),
                        ) => match outcome {
                            Ok(result) => result,
                            Err(_) => Err(Error::transient_provisioning(format!(
                                "provision call exceeded {:?}",
                                self.call_timeout
                            ))),
                        }
                    }
                }
            })
            .await?;

        // the cancel flag may have been raised between the provider
        // returning and us observing the handle; the session is live on the
        // provider side, so it has to be torn down, not just dropped
        if cancel.is_cancelled() {
            warn!(
                worker_id = %request.worker_id,
                session_id = %handle.session_id,
                "provisioned session cancelled, terminating"
            );
            self.terminate(&handle).await.ok();
            return Err(Error::permanent_provisioning(
                "provisioning cancelled after session start",
            ));
        }

        info!(
            worker_id = %request.worker_id,
            session_id = %handle.session_id,
            "session provisioned"
        );
        Ok(handle)
    }

    /// Terminate a session, best effort with the per-call timeout applied
    pub async fn terminate(&self, handle: &SessionHandle) -> Result<()> {
        match tokio::time::timeout(self.call_timeout, self.provisioner.terminate(handle)).await {
            Ok(result) => result,
            Err(_) => Err(Error::transient_provisioning(format!(
                "terminate call exceeded {:?}",
                self.call_timeout
            ))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::resilience::{BreakerConfig, CircuitBreaker, RetryPolicy};
    use chrono::TimeZone;
    use std::sync::atomic::{AtomicU32, Ordering};

    struct FlakyProvisioner {
        calls: AtomicU32,
        fail_first: u32,
    }

    #[async_trait]
    impl Provisioner for FlakyProvisioner {
        async fn provision(&self, _request: &ProvisionRequest) -> Result<SessionHandle> {
            let n = self.calls.fetch_add(1, Ordering::SeqCst);
            if n < self.fail_first {
                Err(Error::transient_provisioning("tunnel not ready"))
            } else {
                Ok(SessionHandle {
                    session_id: format!("sess-{n}"),
                    endpoint: Some("https://tunnel.example".to_string()),
                    provisioned_at: Utc.with_ymd_and_hms(2025, 3, 3, 12, 0, 0).unwrap(),
                })
            }
        }

        async fn terminate(&self, _handle: &SessionHandle) -> Result<()> {
            Ok(())
        }
    }

    fn pipeline(provisioner: Arc<dyn Provisioner>) -> ProvisioningPipeline {
        let clock = Arc::new(ManualClock::new(
            Utc.with_ymd_and_hms(2025, 3, 3, 12, 0, 0).unwrap(),
        ));
        let breaker = Arc::new(CircuitBreaker::new(BreakerConfig::default(), clock));
        let caller = ResilientCaller::with_seed(
            RetryPolicy {
                max_retries: 3,
                base_delay: Duration::from_millis(1),
                multiplier: 2.0,
                max_delay: Duration::from_millis(4),
                jitter_factor: 0.5,
            },
            breaker,
            7,
        );
        ProvisioningPipeline::new(provisioner, caller, Duration::from_secs(5))
    }

    fn request() -> ProvisionRequest {
        ProvisionRequest {
            worker_id: "w-1".to_string(),
            account_id: "acct-1".to_string(),
            provider_class: ProviderClass::OnDemandWeekly,
            callback_url: "https://warden.example/api".to_string(),
            capabilities: HashMap::new(),
        }
    }

    #[tokio::test]
    async fn test_retries_until_success() {
        let provisioner = Arc::new(FlakyProvisioner {
            calls: AtomicU32::new(0),
            fail_first: 2,
        });
        let p = pipeline(provisioner.clone());
        let handle = p
            .provision(&request(), &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(handle.session_id, "sess-2");
        assert_eq!(provisioner.calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_exhausted_retries_surfaced_with_attempts() {
        let provisioner = Arc::new(FlakyProvisioner {
            calls: AtomicU32::new(0),
            fail_first: u32::MAX,
        });
        let p = pipeline(provisioner);
        let err = p
            .provision(&request(), &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            Error::RetriesExhausted { attempts: 4, .. }
        ));
    }

    #[tokio::test]
    async fn test_pre_cancelled_attempt_aborts() {
        let provisioner = Arc::new(FlakyProvisioner {
            calls: AtomicU32::new(0),
            fail_first: 0,
        });
        let p = pipeline(provisioner.clone());
        let cancel = CancellationToken::new();
        cancel.cancel();
        let err = p.provision(&request(), &cancel).await.unwrap_err();
        assert!(matches!(err, Error::PermanentProvisioning(_)));
    }
}
