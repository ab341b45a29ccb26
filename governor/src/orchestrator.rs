//! Emergency orchestration
//!
//! Owns the sampling timer, the active-policy pointer and the emergency
//! state machine:
//!
//! ```text
//!            pressure ≥ emergency_threshold
//!   NORMAL ─────────────────────────────────▶ EMERGENCY
//!     ▲                                          │
//!     └──────────────────────────────────────────┘
//!            pressure ≤ recovery_threshold
//! ```
//!
//! The two thresholds are distinct so the system does not oscillate around a
//! single boundary.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::degradation::{DegradationPolicy, DegradationTable};
use crate::error::{ConfigError, ConfigResult};
use crate::events::{EmergencyNotification, SharedNotificationBus};
use crate::governor::RequestGovernor;
use crate::loader::ModuleLoadRetrier;
use crate::pressure::{PressureEstimator, PressureReading, MAX_PRESSURE};

/// Emergency thresholds and recovery timing.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EmergencyConfig {
    /// Pressure at or above which emergency mode is entered.
    pub emergency_threshold: f64,
    /// Pressure at or below which emergency mode is left.
    pub recovery_threshold: f64,
    /// Delay after recovery before failed-module latches are cleared.
    pub module_latch_grace_ms: u64,
}

impl EmergencyConfig {
    pub fn validate(&self) -> ConfigResult<()> {
        if !(0.0..=MAX_PRESSURE).contains(&self.emergency_threshold)
            || !(0.0..=MAX_PRESSURE).contains(&self.recovery_threshold)
        {
            return Err(ConfigError::invalid(
                "emergency thresholds must lie within [0, 100]",
            ));
        }
        if self.recovery_threshold >= self.emergency_threshold {
            return Err(ConfigError::invalid(format!(
                "recovery_threshold ({}) must be below emergency_threshold ({})",
                self.recovery_threshold, self.emergency_threshold
            )));
        }
        Ok(())
    }

    pub fn module_latch_grace(&self) -> Duration {
        Duration::from_millis(self.module_latch_grace_ms)
    }
}

impl Default for EmergencyConfig {
    fn default() -> Self {
        Self {
            emergency_threshold: 90.0,
            recovery_threshold: 30.0,
            module_latch_grace_ms: 30_000,
        }
    }
}

/// Process-wide emergency state. Observers learn about it through
/// notifications and status snapshots.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct EmergencyState {
    pub active: bool,
    pub entered_at: Option<DateTime<Utc>>,
    pub reason: Option<String>,
}

/// Cache that can shed non-essential entries on emergency entry.
pub trait CacheEvictor: Send + Sync {
    fn name(&self) -> &str;

    /// Best-effort eviction. Returns the number of entries dropped.
    fn evict_non_essential(&self) -> usize;
}

/// A state change produced by [`EmergencyOrchestrator::observe`].
#[derive(Debug, Clone, PartialEq)]
pub enum Transition {
    Entered { pressure: f64, reason: String },
    Exited { pressure: f64 },
}

#[derive(Default)]
struct OrchestratorState {
    emergency: EmergencyState,
    last_reading: Option<PressureReading>,
    latch_clear: Option<JoinHandle<()>>,
}

/// Drives pressure sampling, degradation and emergency transitions.
pub struct EmergencyOrchestrator {
    config: EmergencyConfig,
    table: DegradationTable,
    estimator: PressureEstimator,
    governor: Arc<RequestGovernor>,
    loader: Arc<ModuleLoadRetrier>,
    bus: SharedNotificationBus,
    policy_tx: watch::Sender<DegradationPolicy>,
    state: Mutex<OrchestratorState>,
    /// Held for a whole transition, side effects included.
    transitions: Mutex<()>,
    evictors: Mutex<Vec<Arc<dyn CacheEvictor>>>,
}

impl EmergencyOrchestrator {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        config: EmergencyConfig,
        table: DegradationTable,
        estimator: PressureEstimator,
        governor: Arc<RequestGovernor>,
        loader: Arc<ModuleLoadRetrier>,
        bus: SharedNotificationBus,
        policy_tx: watch::Sender<DegradationPolicy>,
    ) -> Self {
        Self {
            config,
            table,
            estimator,
            governor,
            loader,
            bus,
            policy_tx,
            state: Mutex::new(OrchestratorState::default()),
            transitions: Mutex::new(()),
            evictors: Mutex::new(Vec::new()),
        }
    }

    fn lock(&self) -> MutexGuard<'_, OrchestratorState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn serialize_transition(&self) -> MutexGuard<'_, ()> {
        self.transitions.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn register_evictor(&self, evictor: Arc<dyn CacheEvictor>) {
        debug!(cache = evictor.name(), "Registered cache evictor");
        self.evictors
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(evictor);
    }

    pub fn is_emergency(&self) -> bool {
        self.lock().emergency.active
    }

    pub(crate) fn emergency_state(&self) -> EmergencyState {
        self.lock().emergency.clone()
    }

    pub fn last_reading(&self) -> Option<PressureReading> {
        self.lock().last_reading
    }

    pub fn current_policy(&self) -> DegradationPolicy {
        *self.policy_tx.borrow()
    }

    pub fn estimator(&self) -> &PressureEstimator {
        &self.estimator
    }

    pub fn table(&self) -> &DegradationTable {
        &self.table
    }

    /// Sample pressure and feed it to the state machine.
    pub fn tick(&self) -> PressureReading {
        let reading = self.estimator.sample();
        self.observe(reading);
        reading
    }

    /// Apply one pressure reading.
    ///
    /// Concurrent callers and [`reset`](Self::reset) are serialized, so the
    /// emergency flag, the last notification and the active policy always
    /// agree once a call returns.
    pub fn observe(&self, reading: PressureReading) -> Option<Transition> {
        let _serial = self.serialize_transition();
        let pressure = reading.value;
        let (transition, emergency) = {
            let mut state = self.lock();
            state.last_reading = Some(reading);

            if !state.emergency.active && pressure >= self.config.emergency_threshold {
                let reason = reading.describe();
                state.emergency = EmergencyState {
                    active: true,
                    entered_at: Some(Utc::now()),
                    reason: Some(reason.clone()),
                };
                if let Some(pending) = state.latch_clear.take() {
                    pending.abort();
                }
                (Some(Transition::Entered { pressure, reason }), true)
            } else if state.emergency.active && pressure <= self.config.recovery_threshold {
                state.emergency = EmergencyState::default();
                (Some(Transition::Exited { pressure }), false)
            } else {
                (None, state.emergency.active)
            }
        };

        match &transition {
            Some(Transition::Entered { pressure, reason }) => self.enter(*pressure, reason),
            Some(Transition::Exited { pressure }) => self.exit(*pressure),
            None if emergency => {
                debug!(pressure, "Emergency mode holding");
                self.apply_policy(self.table.most_restrictive());
            }
            None => {
                self.apply_policy(self.table.policy_for(pressure));
            }
        }
        transition
    }

    fn enter(&self, pressure: f64, reason: &str) {
        self.apply_policy(self.table.most_restrictive());
        warn!(pressure, reason, "Entering emergency mode");
        self.bus
            .publish(EmergencyNotification::entered(pressure, reason));

        let evictors: Vec<Arc<dyn CacheEvictor>> = self
            .evictors
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();
        for evictor in evictors {
            let evicted = evictor.evict_non_essential();
            info!(cache = evictor.name(), evicted, "Evicted non-essential cache entries");
        }
    }

    fn exit(&self, pressure: f64) {
        info!(pressure, "Leaving emergency mode");
        self.bus.publish(EmergencyNotification::exited(pressure));
        self.apply_policy(self.table.policy_for(pressure));
        self.governor.drain();
        self.schedule_latch_clear();
    }

    fn schedule_latch_clear(&self) {
        let grace = self.config.module_latch_grace();
        let loader = Arc::clone(&self.loader);
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                let task = handle.spawn(async move {
                    tokio::time::sleep(grace).await;
                    loader.clear_failed_modules();
                });
                if let Some(previous) = self.lock().latch_clear.replace(task) {
                    previous.abort();
                }
            }
            Err(_) => {
                debug!("No runtime for deferred latch clearing, clearing now");
                loader.clear_failed_modules();
            }
        }
    }

    /// Publish `policy` as the active one; drain the queue if it changed.
    fn apply_policy(&self, policy: DegradationPolicy) {
        let changed = self.policy_tx.send_if_modified(|current| {
            if *current == policy {
                false
            } else {
                *current = policy;
                true
            }
        });
        if changed {
            debug!(
                max_concurrent = policy.max_concurrent_requests,
                timeout_ms = policy.request_timeout_ms,
                "Degradation policy changed"
            );
            self.governor.drain();
        }
    }

    /// Operator reset: leave emergency mode without waiting for recovery.
    pub fn reset(&self) {
        let _serial = self.serialize_transition();
        let (was_active, pending) = {
            let mut state = self.lock();
            let was_active = state.emergency.active;
            state.emergency = EmergencyState::default();
            (was_active, state.latch_clear.take())
        };
        if let Some(pending) = pending {
            pending.abort();
        }

        let reading = self.estimator.sample();
        self.lock().last_reading = Some(reading);
        if was_active {
            info!(pressure = reading.value, "Emergency mode reset by operator");
            self.bus
                .publish(EmergencyNotification::exited(reading.value));
        }
        self.apply_policy(self.table.policy_for(reading.value));
        self.governor.drain();
    }

    /// Run the sampling loop until `shutdown` is cancelled.
    ///
    /// The first sample is taken immediately.
    pub fn spawn(self: Arc<Self>, shutdown: CancellationToken) -> JoinHandle<()> {
        let period = self.estimator.config().sample_interval();
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(period);
            interval.set_missed_tick_behavior(MissedTickBehavior::Skip);
            info!(interval_ms = period.as_millis() as u64, "Pressure sampling started");
            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    _ = interval.tick() => {
                        let reading = self.tick();
                        debug!(pressure = reading.value, "Pressure sampled");
                    }
                }
            }
            info!("Pressure sampling stopped");
        })
    }
}
