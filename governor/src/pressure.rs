//! Resource pressure estimation
//!
//! Reduces live signals to a single scalar in `[0, 100]`:
//!
//! ```text
//! factor              | contribution               | cap
//! --------------------|----------------------------|----
//! active requests     | active / capacity × 40     | 40
//! recent failures     | count × points_per_failure | 30
//! memory              | used / total × 50          | 50
//! latency             | avg / saturation × 20      | 20
//! failed module loads | count × points_per_module  | 30
//! ```
//!
//! Each factor is capped before summation so no single signal saturates the
//! score; the total is clamped to 100.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::time::Instant;

/// Upper bound of the pressure scale.
pub const MAX_PRESSURE: f64 = 100.0;

/// Weights, caps and windows for the estimator.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PressureConfig {
    /// Cadence of the orchestrator's sampling timer.
    pub sample_interval_ms: u64,
    pub active_requests_cap: f64,
    pub failures_cap: f64,
    pub points_per_failure: f64,
    /// Failures older than this no longer count as "recent".
    pub failure_window_ms: u64,
    pub memory_cap: f64,
    pub latency_cap: f64,
    /// Average latency at which the latency factor reaches its cap.
    pub latency_saturation_ms: f64,
    /// Number of round-trips kept in the rolling latency window.
    pub latency_window: usize,
    pub module_failures_cap: f64,
    pub points_per_module_failure: f64,
}

impl PressureConfig {
    pub fn sample_interval(&self) -> Duration {
        Duration::from_millis(self.sample_interval_ms)
    }

    pub fn failure_window(&self) -> Duration {
        Duration::from_millis(self.failure_window_ms)
    }
}

impl Default for PressureConfig {
    fn default() -> Self {
        Self {
            sample_interval_ms: 5_000,
            active_requests_cap: 40.0,
            failures_cap: 30.0,
            points_per_failure: 3.0,
            failure_window_ms: 60_000,
            memory_cap: 50.0,
            latency_cap: 20.0,
            latency_saturation_ms: 5_000.0,
            latency_window: 20,
            module_failures_cap: 30.0,
            points_per_module_failure: 10.0,
        }
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Live counters fed by the governor, breakers and module retrier.
///
/// Each signal has its own lock or atomic so writers never contend with
/// each other.
#[derive(Debug)]
pub struct PressureSignals {
    active_requests: AtomicUsize,
    failed_modules: AtomicUsize,
    failures: Mutex<VecDeque<Instant>>,
    latencies_ms: Mutex<VecDeque<u64>>,
    failure_window: Duration,
    /// Failures beyond this many add no pressure, so older ones are dropped.
    max_failures: usize,
    latency_window: usize,
}

impl PressureSignals {
    pub fn new(config: &PressureConfig) -> Self {
        Self {
            active_requests: AtomicUsize::new(0),
            failed_modules: AtomicUsize::new(0),
            failures: Mutex::new(VecDeque::new()),
            latencies_ms: Mutex::new(VecDeque::with_capacity(config.latency_window)),
            failure_window: config.failure_window(),
            max_failures: saturation_count(config.failures_cap, config.points_per_failure),
            latency_window: config.latency_window.max(1),
        }
    }

    pub fn shared(self) -> Arc<Self> {
        Arc::new(self)
    }

    pub fn set_active_requests(&self, active: usize) {
        self.active_requests.store(active, Ordering::Relaxed);
    }

    pub fn set_failed_modules(&self, count: usize) {
        self.failed_modules.store(count, Ordering::Relaxed);
    }

    /// Record one operation failure (error or timeout).
    pub fn record_failure(&self) {
        let now = Instant::now();
        let mut failures = lock(&self.failures);
        failures.push_back(now);
        prune(&mut failures, now, self.failure_window);
        while failures.len() > self.max_failures {
            failures.pop_front();
        }
    }

    /// Record one completed round-trip.
    pub fn record_latency(&self, latency: Duration) {
        let ms = u64::try_from(latency.as_millis()).unwrap_or(u64::MAX);
        let mut latencies = lock(&self.latencies_ms);
        if latencies.len() == self.latency_window {
            latencies.pop_front();
        }
        latencies.push_back(ms);
    }

    pub fn recent_failures(&self) -> usize {
        let mut failures = lock(&self.failures);
        prune(&mut failures, Instant::now(), self.failure_window);
        failures.len()
    }

    pub fn average_latency_ms(&self) -> Option<f64> {
        let latencies = lock(&self.latencies_ms);
        if latencies.is_empty() {
            return None;
        }
        let total: u64 = latencies.iter().sum();
        Some(total as f64 / latencies.len() as f64)
    }

    pub fn active_requests(&self) -> usize {
        self.active_requests.load(Ordering::Relaxed)
    }

    pub fn failed_modules(&self) -> usize {
        self.failed_modules.load(Ordering::Relaxed)
    }

    /// Forget failures and latencies. Gauges are owned by their publishers
    /// and left alone.
    pub fn clear_history(&self) {
        lock(&self.failures).clear();
        lock(&self.latencies_ms).clear();
    }
}

/// Smallest failure count at which the failure factor reaches its cap.
fn saturation_count(cap: f64, points_each: f64) -> usize {
    let ratio = cap / points_each;
    if ratio.is_finite() && ratio > 0.0 {
        (ratio.ceil() as usize).max(1)
    } else {
        1
    }
}

fn prune(failures: &mut VecDeque<Instant>, now: Instant, window: Duration) {
    while let Some(&oldest) = failures.front() {
        if now.saturating_duration_since(oldest) > window {
            failures.pop_front();
        } else {
            break;
        }
    }
}

/// Host memory telemetry.
pub trait MemoryProbe: Send + Sync {
    /// Used / total memory in `[0, 1]`, or `None` when the host exposes nothing.
    fn memory_ratio(&self) -> Option<f64>;
}

/// Reads system memory usage through `sysinfo`.
pub struct SystemMemoryProbe {
    system: Mutex<sysinfo::System>,
}

impl SystemMemoryProbe {
    pub fn new() -> Self {
        Self {
            system: Mutex::new(sysinfo::System::new()),
        }
    }
}

impl Default for SystemMemoryProbe {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryProbe for SystemMemoryProbe {
    fn memory_ratio(&self) -> Option<f64> {
        let mut system = lock(&self.system);
        system.refresh_memory();
        let total = system.total_memory();
        if total == 0 {
            return None;
        }
        Some((system.used_memory() as f64 / total as f64).clamp(0.0, 1.0))
    }
}

/// Fixed memory ratio; for tests and hosts without telemetry.
#[derive(Debug, Default)]
pub struct StaticMemoryProbe {
    ratio: Mutex<Option<f64>>,
}

impl StaticMemoryProbe {
    pub fn new(ratio: Option<f64>) -> Self {
        Self {
            ratio: Mutex::new(ratio),
        }
    }

    pub fn set(&self, ratio: Option<f64>) {
        *lock(&self.ratio) = ratio;
    }
}

impl MemoryProbe for StaticMemoryProbe {
    fn memory_ratio(&self) -> Option<f64> {
        *lock(&self.ratio)
    }
}

/// Raw inputs for one estimate.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct PressureInputs {
    pub active_requests: usize,
    /// Nominal concurrency the active-request ratio is measured against.
    pub capacity: usize,
    pub recent_failures: usize,
    pub memory_ratio: Option<f64>,
    pub avg_latency_ms: Option<f64>,
    pub failed_modules: usize,
}

/// Capped points contributed by each factor.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct PressureBreakdown {
    pub active_requests: f64,
    pub failures: f64,
    pub memory: f64,
    pub latency: f64,
    pub module_failures: f64,
}

impl PressureBreakdown {
    pub fn total(&self) -> f64 {
        (self.active_requests + self.failures + self.memory + self.latency + self.module_failures)
            .clamp(0.0, MAX_PRESSURE)
    }

    /// Name and points of the largest contributor.
    pub fn dominant(&self) -> (&'static str, f64) {
        [
            ("active_requests", self.active_requests),
            ("failures", self.failures),
            ("memory", self.memory),
            ("latency", self.latency),
            ("module_failures", self.module_failures),
        ]
        .into_iter()
        .fold(("none", 0.0), |best, candidate| {
            if candidate.1 > best.1 {
                candidate
            } else {
                best
            }
        })
    }
}

/// One pressure estimate.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct PressureReading {
    /// Scalar in `[0, 100]`.
    pub value: f64,
    pub breakdown: PressureBreakdown,
    pub sampled_at: DateTime<Utc>,
}

impl PressureReading {
    /// A reading with only a value; used when replaying synthetic sequences.
    pub fn synthetic(value: f64) -> Self {
        Self {
            value: value.clamp(0.0, MAX_PRESSURE),
            breakdown: PressureBreakdown::default(),
            sampled_at: Utc::now(),
        }
    }

    /// Human-readable explanation naming the dominant factor.
    pub fn describe(&self) -> String {
        let (factor, points) = self.breakdown.dominant();
        if points > 0.0 {
            format!(
                "resource pressure {:.0} (dominant factor: {} at {:.0} points)",
                self.value, factor, points
            )
        } else {
            format!("resource pressure {:.0}", self.value)
        }
    }
}

/// Samples [`PressureSignals`] plus host telemetry into a [`PressureReading`].
pub struct PressureEstimator {
    config: PressureConfig,
    signals: Arc<PressureSignals>,
    probe: Arc<dyn MemoryProbe>,
    capacity: usize,
}

impl PressureEstimator {
    pub fn new(
        config: PressureConfig,
        signals: Arc<PressureSignals>,
        probe: Arc<dyn MemoryProbe>,
        capacity: usize,
    ) -> Self {
        Self {
            config,
            signals,
            probe,
            capacity: capacity.max(1),
        }
    }

    pub fn signals(&self) -> &Arc<PressureSignals> {
        &self.signals
    }

    pub fn config(&self) -> &PressureConfig {
        &self.config
    }

    /// Gather the current inputs.
    pub fn inputs(&self) -> PressureInputs {
        PressureInputs {
            active_requests: self.signals.active_requests(),
            capacity: self.capacity,
            recent_failures: self.signals.recent_failures(),
            memory_ratio: self.probe.memory_ratio(),
            avg_latency_ms: self.signals.average_latency_ms(),
            failed_modules: self.signals.failed_modules(),
        }
    }

    /// Sample the live signals. No side effects beyond reading them.
    pub fn sample(&self) -> PressureReading {
        self.estimate(&self.inputs())
    }

    /// Pure weighted sum over explicit inputs.
    pub fn estimate(&self, inputs: &PressureInputs) -> PressureReading {
        let c = &self.config;
        let capacity = inputs.capacity.max(1) as f64;

        let breakdown = PressureBreakdown {
            active_requests: capped(
                inputs.active_requests as f64 / capacity * c.active_requests_cap,
                c.active_requests_cap,
            ),
            failures: capped(
                inputs.recent_failures as f64 * c.points_per_failure,
                c.failures_cap,
            ),
            memory: capped(
                inputs.memory_ratio.unwrap_or(0.0) * c.memory_cap,
                c.memory_cap,
            ),
            latency: match inputs.avg_latency_ms {
                Some(avg) if c.latency_saturation_ms > 0.0 => {
                    capped(avg / c.latency_saturation_ms * c.latency_cap, c.latency_cap)
                }
                _ => 0.0,
            },
            module_failures: capped(
                inputs.failed_modules as f64 * c.points_per_module_failure,
                c.module_failures_cap,
            ),
        };

        PressureReading {
            value: breakdown.total(),
            breakdown,
            sampled_at: Utc::now(),
        }
    }
}

fn capped(points: f64, cap: f64) -> f64 {
    if points.is_nan() {
        return 0.0;
    }
    points.clamp(0.0, cap.max(0.0))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn estimator_with(memory: Option<f64>) -> PressureEstimator {
        let config = PressureConfig::default();
        let signals = PressureSignals::new(&config).shared();
        PressureEstimator::new(
            config,
            signals,
            Arc::new(StaticMemoryProbe::new(memory)),
            10,
        )
    }

    #[test]
    fn test_idle_system_has_zero_pressure() {
        let estimator = estimator_with(None);
        let reading = estimator.sample();
        assert_eq!(reading.value, 0.0);
        assert_eq!(reading.breakdown.dominant().0, "none");
    }

    #[test]
    fn test_each_factor_is_capped() {
        let estimator = estimator_with(None);
        let reading = estimator.estimate(&PressureInputs {
            active_requests: 500,
            capacity: 10,
            recent_failures: 1_000,
            memory_ratio: Some(4.0),
            avg_latency_ms: Some(1_000_000.0),
            failed_modules: 99,
        });
        assert_eq!(reading.breakdown.active_requests, 40.0);
        assert_eq!(reading.breakdown.failures, 30.0);
        assert_eq!(reading.breakdown.memory, 50.0);
        assert_eq!(reading.breakdown.latency, 20.0);
        assert_eq!(reading.breakdown.module_failures, 30.0);
        assert_eq!(reading.value, MAX_PRESSURE);
    }

    #[test]
    fn test_weighted_sum() {
        let estimator = estimator_with(None);
        let reading = estimator.estimate(&PressureInputs {
            active_requests: 5,
            capacity: 10,
            recent_failures: 2,
            memory_ratio: Some(0.5),
            avg_latency_ms: Some(2_500.0),
            failed_modules: 1,
        });
        // 20 + 6 + 25 + 10 + 10
        assert!((reading.value - 71.0).abs() < 1e-9);
        assert_eq!(reading.breakdown.dominant(), ("memory", 25.0));
        assert!(reading.describe().contains("memory"));
    }

    #[test]
    fn test_missing_memory_contributes_nothing() {
        let estimator = estimator_with(None);
        let inputs = PressureInputs {
            capacity: 10,
            ..PressureInputs::default()
        };
        assert_eq!(estimator.estimate(&inputs).breakdown.memory, 0.0);
    }

    #[test]
    fn test_sample_reads_live_signals() {
        let estimator = estimator_with(Some(0.2));
        let signals = Arc::clone(estimator.signals());
        signals.set_active_requests(10);
        signals.record_failure();
        signals.set_failed_modules(1);

        let reading = estimator.sample();
        assert_eq!(reading.breakdown.active_requests, 40.0);
        assert_eq!(reading.breakdown.failures, 3.0);
        assert!((reading.breakdown.memory - 10.0).abs() < 1e-9);
        assert_eq!(reading.breakdown.module_failures, 10.0);
    }

    #[test]
    fn test_failure_window_bounded_at_saturation() {
        let estimator = estimator_with(None);
        let signals = Arc::clone(estimator.signals());
        for _ in 0..10_000 {
            signals.record_failure();
        }
        // 30 points at 3 points each saturates at 10 failures.
        assert_eq!(signals.recent_failures(), 10);
        assert_eq!(estimator.sample().breakdown.failures, 30.0);

        let uneven = PressureSignals::new(&PressureConfig {
            failures_cap: 25.0,
            points_per_failure: 3.0,
            ..PressureConfig::default()
        });
        for _ in 0..100 {
            uneven.record_failure();
        }
        assert_eq!(uneven.recent_failures(), 9);
    }

    #[test]
    fn test_latency_window_is_rolling() {
        let config = PressureConfig {
            latency_window: 2,
            ..PressureConfig::default()
        };
        let signals = PressureSignals::new(&config);
        assert_eq!(signals.average_latency_ms(), None);
        signals.record_latency(Duration::from_millis(100));
        signals.record_latency(Duration::from_millis(300));
        signals.record_latency(Duration::from_millis(500));
        assert_eq!(signals.average_latency_ms(), Some(400.0));
    }

    #[tokio::test(start_paused = true)]
    async fn test_failures_age_out_of_window() {
        let config = PressureConfig {
            failure_window_ms: 1_000,
            ..PressureConfig::default()
        };
        let signals = PressureSignals::new(&config);
        signals.record_failure();
        signals.record_failure();
        assert_eq!(signals.recent_failures(), 2);

        tokio::time::advance(Duration::from_millis(1_500)).await;
        signals.record_failure();
        assert_eq!(signals.recent_failures(), 1);

        signals.clear_history();
        assert_eq!(signals.recent_failures(), 0);
    }

    #[test]
    fn test_synthetic_reading_is_clamped() {
        assert_eq!(PressureReading::synthetic(140.0).value, 100.0);
        assert_eq!(PressureReading::synthetic(-3.0).value, 0.0);
    }
}
