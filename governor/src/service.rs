//! The assembled governor
//!
//! [`ResourceGovernor`] wires the estimator, table, breakers, admission
//! queue, module loader and orchestrator together and exposes the external
//! interface. Construct one per process and share it as
//! [`SharedResourceGovernor`].

use serde::Serialize;
use std::fmt::Display;
use std::future::Future;
use std::sync::Arc;
use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::breaker::{BreakerRegistry, BreakerSnapshot, BreakerState};
use crate::config::GovernorConfig;
use crate::degradation::{DegradationPolicy, DegradationTable};
use crate::error::{ConfigResult, GovernorError};
use crate::events::{EmergencyNotification, NotificationBus, SharedNotificationBus};
use crate::governor::{GovernorCounters, RequestGovernor};
use crate::loader::{ModuleLoad, ModuleLoadRetrier};
use crate::orchestrator::{CacheEvictor, EmergencyOrchestrator, EmergencyState, Transition};
use crate::pressure::{
    MemoryProbe, PressureEstimator, PressureReading, PressureSignals, SystemMemoryProbe,
};

/// Shared reference to a ResourceGovernor
pub type SharedResourceGovernor = Arc<ResourceGovernor>;

/// Read-only snapshot for dashboards and monitors.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct GovernorStatus {
    pub emergency_mode: bool,
    pub resource_pressure: f64,
    pub active_requests: usize,
    pub queued_requests: usize,
    /// State of the primary dependency's breaker.
    pub breaker_state: BreakerState,
    pub failed_modules: Vec<String>,
    pub breakers: Vec<BreakerSnapshot>,
    pub policy: DegradationPolicy,
    pub emergency: EmergencyState,
}

pub struct ResourceGovernor {
    config: GovernorConfig,
    signals: Arc<PressureSignals>,
    breakers: Arc<BreakerRegistry>,
    governor: Arc<RequestGovernor>,
    loader: Arc<ModuleLoadRetrier>,
    bus: SharedNotificationBus,
    orchestrator: Arc<EmergencyOrchestrator>,
}

impl ResourceGovernor {
    /// Build with the host memory probe.
    pub fn new(config: GovernorConfig) -> ConfigResult<Self> {
        Self::with_probe(config, Arc::new(SystemMemoryProbe::new()))
    }

    /// Build with an explicit memory probe.
    pub fn with_probe(config: GovernorConfig, probe: Arc<dyn MemoryProbe>) -> ConfigResult<Self> {
        config.validate()?;
        let table: DegradationTable = config.table()?;
        let baseline = table.policy_for(0.0);

        let signals = PressureSignals::new(&config.pressure).shared();
        let (policy_tx, policy_rx) = watch::channel(baseline);

        let breakers = Arc::new(BreakerRegistry::new(config.breaker.clone()));
        breakers.get(&config.primary_dependency);

        let governor = Arc::new(RequestGovernor::new(
            Arc::clone(&breakers),
            Arc::clone(&signals),
            policy_rx.clone(),
            config.queue_expiry(),
        ));
        let loader = Arc::new(ModuleLoadRetrier::new(
            policy_rx,
            Arc::clone(&signals),
            config.module_load_timeout(),
        ));
        let bus = NotificationBus::new().shared();

        let estimator = PressureEstimator::new(
            config.pressure.clone(),
            Arc::clone(&signals),
            probe,
            baseline.max_concurrent_requests,
        );
        let orchestrator = Arc::new(EmergencyOrchestrator::new(
            config.emergency.clone(),
            table,
            estimator,
            Arc::clone(&governor),
            Arc::clone(&loader),
            Arc::clone(&bus),
            policy_tx,
        ));

        info!(
            primary = %config.primary_dependency,
            max_concurrent = baseline.max_concurrent_requests,
            emergency_threshold = config.emergency.emergency_threshold,
            recovery_threshold = config.emergency.recovery_threshold,
            "Resource governor initialized"
        );

        Ok(Self {
            config,
            signals,
            breakers,
            governor,
            loader,
            bus,
            orchestrator,
        })
    }

    /// Wrap in an `Arc` for sharing across tasks.
    pub fn shared(self) -> SharedResourceGovernor {
        Arc::new(self)
    }

    /// The validated configuration in use.
    pub fn config(&self) -> &GovernorConfig {
        &self.config
    }

    /// Run `op` against dependency `name` under admission control and its
    /// breaker.
    pub async fn submit<T, E, F, Fut>(&self, name: &str, op: F) -> Result<T, GovernorError<E>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        self.governor.submit(name, op).await
    }

    /// Submit against the primary dependency.
    pub async fn submit_primary<T, E, F, Fut>(&self, op: F) -> Result<T, GovernorError<E>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        self.governor.submit(&self.config.primary_dependency, op).await
    }

    /// Load a deferred module with budgeted retry; never fails.
    pub async fn load<M, E, F, Fut>(&self, module_id: &str, import_fn: F) -> ModuleLoad<M>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<M, E>>,
        E: Display,
    {
        self.loader.load(module_id, import_fn).await
    }

    /// Manual retry for a module showing its fallback.
    pub async fn retry_module<M, E, F, Fut>(&self, module_id: &str, import_fn: F) -> ModuleLoad<M>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<M, E>>,
        E: Display,
    {
        self.loader.retry(module_id, import_fn).await
    }

    /// Read-only snapshot for dashboards.
    pub fn status(&self) -> GovernorStatus {
        let counters = self.governor.counters();
        let resource_pressure = self
            .orchestrator
            .last_reading()
            .map(|reading| reading.value)
            .unwrap_or(0.0);
        let breaker_state = self
            .breakers
            .find(&self.config.primary_dependency)
            .map(|breaker| breaker.state())
            .unwrap_or(BreakerState::Closed);

        GovernorStatus {
            emergency_mode: self.orchestrator.is_emergency(),
            resource_pressure,
            active_requests: counters.active_requests,
            queued_requests: counters.queued_requests,
            breaker_state,
            failed_modules: self.loader.failed_modules(),
            breakers: self.breakers.snapshots(),
            policy: self.orchestrator.current_policy(),
            emergency: self.orchestrator.emergency_state(),
        }
    }

    /// Admission counters, including peak and expired totals.
    pub fn counters(&self) -> GovernorCounters {
        self.governor.counters()
    }

    /// Whether emergency mode is active.
    pub fn is_emergency(&self) -> bool {
        self.orchestrator.is_emergency()
    }

    /// Receive every emergency transition from now on.
    pub fn subscribe(&self) -> broadcast::Receiver<EmergencyNotification> {
        self.bus.subscribe()
    }

    /// The notification bus, including recent history.
    pub fn notifications(&self) -> &SharedNotificationBus {
        &self.bus
    }

    /// Live inputs to the pressure estimator.
    pub fn signals(&self) -> &Arc<PressureSignals> {
        &self.signals
    }

    /// Add a cache to evict from on emergency entry.
    pub fn register_evictor(&self, evictor: Arc<dyn CacheEvictor>) {
        self.orchestrator.register_evictor(evictor);
    }

    /// Start periodic sampling. Stops when `shutdown` is cancelled.
    pub fn start(&self, shutdown: CancellationToken) -> JoinHandle<()> {
        Arc::clone(&self.orchestrator).spawn(shutdown)
    }

    /// Take one sample immediately.
    pub fn tick(&self) -> PressureReading {
        self.orchestrator.tick()
    }

    /// Feed an externally produced reading to the state machine.
    pub fn observe(&self, reading: PressureReading) -> Option<Transition> {
        self.orchestrator.observe(reading)
    }

    /// Operator reset: close every breaker, expire queued requests, clear
    /// the failure window and leave emergency mode.
    pub fn reset(&self) {
        self.breakers.reset_all();
        self.governor.reset();
        self.signals.clear_history();
        self.orchestrator.reset();
        info!("Resource governor reset");
    }

    /// Operator action: clear every permanently failed module.
    pub fn clear_failed_modules(&self) -> usize {
        self.loader.clear_failed_modules()
    }
}
