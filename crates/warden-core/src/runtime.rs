//! Composition root
//!
//! Explicit, dependency-injected wiring with a start/stop lifecycle: no
//! module-level singletons. The builder takes the external collaborators
//! (scraper, provisioner, alert sink, stores) and the configuration surface,
//! and produces one runtime owning every component.

use crate::alert::{AlertHistory, AlertSink, TracingSink};
use crate::clock::{Clock, SystemClock};
use crate::compliance::{ComplianceMonitor, ComplianceThresholds};
use crate::error::{Error, Result};
use crate::ledger::QuotaLedger;
use crate::lifecycle::{LifecycleConfig, SessionLifecycleManager};
use crate::provision::{Provisioner, ProvisioningPipeline};
use crate::randomizer::{BehaviorRandomizer, RandomizerConfig};
use crate::resilience::{BreakerConfig, CircuitBreaker, ResilientCaller, RetryPolicy};
use crate::scrape::QuotaScraper;
use crate::store::{SnapshotStore, WorkerStore};
use crate::sync::{SyncConfig, SyncScheduler};
use crate::worker::{ProviderClass, ProviderLimits, Worker, WorkerSpec};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tracing::{info, warn};

/// Process-wide configuration surface. Not reloaded mid-run; restart to
/// apply changes.
#[derive(Debug, Clone)]
pub struct RuntimeConfig {
    /// Ceilings for the on-demand weekly class
    pub on_demand_limits: ProviderLimits,
    /// Ceilings for the fixed-cooldown class
    pub fixed_limits: ProviderLimits,
    /// Warning/critical threshold ratios
    pub thresholds: ComplianceThresholds,
    /// Randomizer bands and jitters
    pub randomizer: RandomizerConfig,
    /// Retry policy for provisioning calls
    pub retry: RetryPolicy,
    /// Circuit breaker settings
    pub breaker: BreakerConfig,
    /// Hard per-call provisioning timeout
    pub provision_timeout: Duration,
    /// Lifecycle tuning
    pub lifecycle: LifecycleConfig,
    /// Sync scheduler tuning
    pub sync: SyncConfig,
    /// Bounded alert history size
    pub alert_history_capacity: usize,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            on_demand_limits: ProviderLimits::defaults_for(ProviderClass::OnDemandWeekly),
            fixed_limits: ProviderLimits::defaults_for(ProviderClass::FixedCooldown),
            thresholds: ComplianceThresholds::default(),
            randomizer: RandomizerConfig::default(),
            retry: RetryPolicy::default(),
            breaker: BreakerConfig::default(),
            provision_timeout: Duration::from_secs(120),
            lifecycle: LifecycleConfig::default(),
            sync: SyncConfig::default(),
            alert_history_capacity: 256,
        }
    }
}

impl RuntimeConfig {
    /// The configured ceilings for a provider class
    pub fn limits_for(&self, class: ProviderClass) -> ProviderLimits {
        match class {
            ProviderClass::OnDemandWeekly => self.on_demand_limits,
            ProviderClass::FixedCooldown => self.fixed_limits,
        }
    }
}

/// Builder for [`WardenRuntime`]
pub struct WardenRuntimeBuilder {
    config: RuntimeConfig,
    clock: Arc<dyn Clock>,
    sink: Arc<dyn AlertSink>,
    scraper: Option<Arc<dyn QuotaScraper>>,
    provisioner: Option<Arc<dyn Provisioner>>,
    worker_store: Option<Arc<dyn WorkerStore>>,
    snapshot_store: Option<Arc<dyn SnapshotStore>>,
    randomizer_seed: Option<u64>,
}

impl Default for WardenRuntimeBuilder {
    fn default() -> Self {
        Self {
            config: RuntimeConfig::default(),
            clock: Arc::new(SystemClock),
            sink: Arc::new(TracingSink),
            scraper: None,
            provisioner: None,
            worker_store: None,
            snapshot_store: None,
            randomizer_seed: None,
        }
    }
}

impl WardenRuntimeBuilder {
    /// Override the configuration
    pub fn with_config(mut self, config: RuntimeConfig) -> Self {
        self.config = config;
        self
    }

    /// Override the clock (simulations, tests)
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Set the alert sink
    pub fn with_alert_sink(mut self, sink: Arc<dyn AlertSink>) -> Self {
        self.sink = sink;
        self
    }

    /// Set the quota scraper (required)
    pub fn with_scraper(mut self, scraper: Arc<dyn QuotaScraper>) -> Self {
        self.scraper = Some(scraper);
        self
    }

    /// Set the provisioner (required)
    pub fn with_provisioner(mut self, provisioner: Arc<dyn Provisioner>) -> Self {
        self.provisioner = Some(provisioner);
        self
    }

    /// Attach a worker persistence sink
    pub fn with_worker_store(mut self, store: Arc<dyn WorkerStore>) -> Self {
        self.worker_store = Some(store);
        self
    }

    /// Attach a snapshot persistence sink
    pub fn with_snapshot_store(mut self, store: Arc<dyn SnapshotStore>) -> Self {
        self.snapshot_store = Some(store);
        self
    }

    /// Seed the behavior randomizer for reproducible runs
    pub fn with_randomizer_seed(mut self, seed: u64) -> Self {
        self.randomizer_seed = Some(seed);
        self
    }

    /// Wire everything together
    pub fn build(self) -> Result<WardenRuntime> {
        let scraper = self
            .scraper
            .ok_or_else(|| Error::config("a quota scraper is required"))?;
        let provisioner = self
            .provisioner
            .ok_or_else(|| Error::config("a provisioner is required"))?;

        let monitor = ComplianceMonitor::new(self.config.thresholds);
        let randomizer = Arc::new(match self.randomizer_seed {
            Some(seed) => BehaviorRandomizer::with_seed(self.config.randomizer.clone(), seed),
            None => BehaviorRandomizer::new(self.config.randomizer.clone()),
        });

        let ledger = Arc::new(QuotaLedger::new(
            Arc::clone(&self.clock),
            monitor,
            Arc::clone(&randomizer),
            self.worker_store.clone(),
        ));

        let breaker = Arc::new(CircuitBreaker::new(
            self.config.breaker.clone(),
            Arc::clone(&self.clock),
        ));
        let pipeline = Arc::new(ProvisioningPipeline::new(
            provisioner,
            ResilientCaller::new(self.config.retry.clone(), breaker),
            self.config.provision_timeout,
        ));

        let history = Arc::new(AlertHistory::new(self.config.alert_history_capacity));
        let lifecycle = Arc::new(SessionLifecycleManager::new(
            Arc::clone(&ledger),
            randomizer,
            pipeline,
            monitor,
            Arc::clone(&self.sink),
            Arc::clone(&history),
            Arc::clone(&self.clock),
            self.config.lifecycle.clone(),
        ));

        let sync = Arc::new(SyncScheduler::new(
            scraper,
            Arc::clone(&ledger),
            Arc::clone(&lifecycle),
            self.snapshot_store.clone(),
            Arc::clone(&self.sink),
            Arc::clone(&self.clock),
            self.config.sync.clone(),
        ));

        Ok(WardenRuntime {
            config: self.config,
            ledger,
            lifecycle,
            sync,
            history,
            tasks: Mutex::new(Vec::new()),
            started: AtomicBool::new(false),
        })
    }
}

/// Owns all core components with an explicit start/stop lifecycle
pub struct WardenRuntime {
    config: RuntimeConfig,
    ledger: Arc<QuotaLedger>,
    lifecycle: Arc<SessionLifecycleManager>,
    sync: Arc<SyncScheduler>,
    history: Arc<AlertHistory>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    started: AtomicBool,
}

impl std::fmt::Debug for WardenRuntime {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WardenRuntime")
            .field("config", &self.config)
            .field("started", &self.started)
            .finish_non_exhaustive()
    }
}

impl WardenRuntime {
    /// Start building a runtime
    pub fn builder() -> WardenRuntimeBuilder {
        WardenRuntimeBuilder::default()
    }

    /// The quota ledger
    pub fn ledger(&self) -> &Arc<QuotaLedger> {
        &self.ledger
    }

    /// The session lifecycle manager
    pub fn lifecycle(&self) -> &Arc<SessionLifecycleManager> {
        &self.lifecycle
    }

    /// The sync scheduler
    pub fn sync(&self) -> &Arc<SyncScheduler> {
        &self.sync
    }

    /// The bounded alert history
    pub fn history(&self) -> &Arc<AlertHistory> {
        &self.history
    }

    /// The active configuration
    pub fn config(&self) -> &RuntimeConfig {
        &self.config
    }

    /// Register a worker, applying the configured class ceilings when the
    /// spec does not carry its own
    pub async fn register_worker(&self, mut spec: WorkerSpec) -> Worker {
        if spec.limits.is_none() {
            spec.limits = Some(self.config.limits_for(spec.provider_class));
        }
        self.ledger.register(spec).await
    }

    /// Restore persisted state and start the background loops
    pub async fn start(&self) -> Result<()> {
        if self.started.swap(true, Ordering::SeqCst) {
            return Err(Error::config("runtime already started"));
        }
        if let Err(err) = self.ledger.restore().await {
            warn!("ledger restore failed, starting empty: {err}");
        }
        let mut tasks = self.tasks.lock().await;
        tasks.push(Arc::clone(&self.sync).start());
        info!("warden runtime started");
        Ok(())
    }

    /// Stop the background loops and wait for them to finish
    pub async fn shutdown(&self) {
        self.sync.shutdown();
        let mut tasks = self.tasks.lock().await;
        for task in tasks.drain(..) {
            if let Err(err) = task.await {
                warn!("background task join failed: {err}");
            }
        }
        self.started.store(false, Ordering::SeqCst);
        info!("warden runtime stopped");
    }
}
