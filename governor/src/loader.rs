//! Deferred module loading with bounded retries.
//!
//! A module whose loader keeps failing is retried with linear backoff until
//! the active policy's `module_retry_budget` is spent, then latched as
//! permanently failed. Latched modules return [`ModuleLoad::Fallback`]
//! immediately, without touching the loader, until the latch is cleared.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt::Display;
use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::sync::watch;
use tracing::{debug, info, warn};

use crate::degradation::DegradationPolicy;
use crate::pressure::PressureSignals;

/// Default per-attempt timeout for a module load.
pub const DEFAULT_MODULE_LOAD_TIMEOUT: Duration = Duration::from_secs(10);

/// Per-module retry state.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModuleLoadRecord {
    pub retry_count: u32,
    /// One-way latch, cleared only by an explicit reset.
    pub permanently_failed: bool,
    pub last_error: Option<String>,
}

/// Stand-in returned when a module cannot be loaded.
///
/// Carries enough for a UI to render a labeled placeholder and offer a
/// manual retry through [`ModuleLoadRetrier::retry`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FallbackModule {
    pub module_id: String,
    /// Failed attempts recorded for this module.
    pub attempts: u32,
    pub reason: String,
}

impl FallbackModule {
    /// Placeholder text for the unavailable module.
    pub fn message(&self) -> String {
        format!(
            "Module '{}' is unavailable after {} attempt(s): {}",
            self.module_id, self.attempts, self.reason
        )
    }
}

/// Outcome of [`ModuleLoadRetrier::load`]. Never an error.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ModuleLoad<M> {
    Loaded(M),
    Fallback(FallbackModule),
}

impl<M> ModuleLoad<M> {
    pub fn is_loaded(&self) -> bool {
        matches!(self, Self::Loaded(_))
    }

    pub fn is_fallback(&self) -> bool {
        matches!(self, Self::Fallback(_))
    }

    pub fn loaded(self) -> Option<M> {
        match self {
            Self::Loaded(module) => Some(module),
            Self::Fallback(_) => None,
        }
    }

    pub fn fallback(&self) -> Option<&FallbackModule> {
        match self {
            Self::Fallback(fallback) => Some(fallback),
            Self::Loaded(_) => None,
        }
    }
}

/// Wraps deferred module loads with retry, backoff and a permanent fallback.
pub struct ModuleLoadRetrier {
    policy: watch::Receiver<DegradationPolicy>,
    signals: Arc<PressureSignals>,
    load_timeout: Duration,
    records: Mutex<HashMap<String, ModuleLoadRecord>>,
}

impl ModuleLoadRetrier {
    pub fn new(
        policy: watch::Receiver<DegradationPolicy>,
        signals: Arc<PressureSignals>,
        load_timeout: Duration,
    ) -> Self {
        Self {
            policy,
            signals,
            load_timeout,
            records: Mutex::new(HashMap::new()),
        }
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<String, ModuleLoadRecord>> {
        self.records.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn publish_failed_count(&self, records: &HashMap<String, ModuleLoadRecord>) {
        let failed = records.values().filter(|r| r.permanently_failed).count();
        self.signals.set_failed_modules(failed);
    }

    fn latched(&self, module_id: &str) -> Option<FallbackModule> {
        self.lock()
            .get(module_id)
            .filter(|record| record.permanently_failed)
            .map(|record| FallbackModule {
                module_id: module_id.to_string(),
                attempts: record.retry_count,
                reason: record
                    .last_error
                    .clone()
                    .unwrap_or_else(|| "permanently failed".to_string()),
            })
    }

    /// Load `module_id` through `import_fn`, retrying within budget.
    ///
    /// The budget belongs to the module, not the caller: concurrent loads of
    /// the same `module_id` share one retry count, and once any of them
    /// latches the module the others return the fallback at their next
    /// attempt.
    pub async fn load<M, E, F, Fut>(&self, module_id: &str, mut import_fn: F) -> ModuleLoad<M>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<M, E>>,
        E: Display,
    {
        loop {
            if let Some(fallback) = self.latched(module_id) {
                debug!(module_id, "Module latched as failed, serving fallback");
                return ModuleLoad::Fallback(fallback);
            }

            let error = match tokio::time::timeout(self.load_timeout, import_fn()).await {
                Ok(Ok(module)) => {
                    let mut records = self.lock();
                    if records.remove(module_id).is_some() {
                        info!(module_id, "Module loaded after retry");
                    }
                    self.publish_failed_count(&records);
                    return ModuleLoad::Loaded(module);
                }
                Ok(Err(e)) => e.to_string(),
                Err(_) => format!(
                    "module load timed out after {}ms",
                    self.load_timeout.as_millis()
                ),
            };

            let policy = *self.policy.borrow();
            let (retry_count, exhausted) = {
                let mut records = self.lock();
                let record = records.entry(module_id.to_string()).or_default();
                record.retry_count += 1;
                record.last_error = Some(error.clone());
                if record.retry_count >= policy.module_retry_budget {
                    record.permanently_failed = true;
                }
                let outcome = (record.retry_count, record.permanently_failed);
                self.publish_failed_count(&records);
                outcome
            };

            if exhausted {
                warn!(
                    module_id,
                    attempts = retry_count,
                    error = %error,
                    "Module load budget exhausted, latching fallback"
                );
                return ModuleLoad::Fallback(FallbackModule {
                    module_id: module_id.to_string(),
                    attempts: retry_count,
                    reason: error,
                });
            }

            let delay = policy.retry_delay(retry_count);
            debug!(
                module_id,
                retry_count,
                delay_ms = delay.as_millis() as u64,
                error = %error,
                "Module load failed, retrying"
            );
            tokio::time::sleep(delay).await;
        }
    }

    /// Manual retry: clear this module's latch and load again.
    pub async fn retry<M, E, F, Fut>(&self, module_id: &str, import_fn: F) -> ModuleLoad<M>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<M, E>>,
        E: Display,
    {
        self.reset_module(module_id);
        self.load(module_id, import_fn).await
    }

    /// Forget one module's record. Returns true if it was latched.
    pub fn reset_module(&self, module_id: &str) -> bool {
        let mut records = self.lock();
        let was_latched = records
            .remove(module_id)
            .is_some_and(|record| record.permanently_failed);
        self.publish_failed_count(&records);
        was_latched
    }

    /// Clear every permanently-failed latch. Returns how many were cleared.
    pub fn clear_failed_modules(&self) -> usize {
        let mut records = self.lock();
        let before = records.len();
        records.retain(|_, record| !record.permanently_failed);
        let cleared = before - records.len();
        self.publish_failed_count(&records);
        if cleared > 0 {
            info!(cleared, "Cleared failed module latches");
        }
        cleared
    }

    /// Identifiers of permanently-failed modules, sorted.
    pub fn failed_modules(&self) -> Vec<String> {
        let mut failed: Vec<String> = self
            .lock()
            .iter()
            .filter(|(_, record)| record.permanently_failed)
            .map(|(id, _)| id.clone())
            .collect();
        failed.sort();
        failed
    }

    pub fn record(&self, module_id: &str) -> Option<ModuleLoadRecord> {
        self.lock().get(module_id).cloned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pressure::PressureConfig;
    use std::sync::atomic::{AtomicU32, Ordering};
    use tokio::time::Instant;

    fn retrier_with(policy: DegradationPolicy) -> (ModuleLoadRetrier, watch::Sender<DegradationPolicy>) {
        let (tx, rx) = watch::channel(policy);
        let signals = PressureSignals::new(&PressureConfig::default()).shared();
        (
            ModuleLoadRetrier::new(rx, signals, DEFAULT_MODULE_LOAD_TIMEOUT),
            tx,
        )
    }

    fn retrier() -> (ModuleLoadRetrier, watch::Sender<DegradationPolicy>) {
        retrier_with(DegradationPolicy::default())
    }

    #[tokio::test(start_paused = true)]
    async fn test_loads_on_first_try() {
        let (retrier, _tx) = retrier();
        let loaded = retrier
            .load("reports", || async { Ok::<_, String>("reports-module") })
            .await;
        assert_eq!(loaded, ModuleLoad::Loaded("reports-module"));
        assert!(retrier.record("reports").is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_concurrent_loads_share_module_budget() {
        let (retrier, _tx) = retrier();
        let calls = AtomicU32::new(0);
        let import = || async {
            calls.fetch_add(1, Ordering::SeqCst);
            Err::<(), _>("chunk missing")
        };

        let (a, b) = tokio::join!(
            retrier.load("charts", import),
            retrier.load("charts", import)
        );
        assert!(a.is_fallback());
        assert!(b.is_fallback());
        assert_eq!(calls.load(Ordering::SeqCst), 3);
        assert_eq!(retrier.record("charts").unwrap().retry_count, 3);
        assert_eq!(retrier.failed_modules(), vec!["charts".to_string()]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_always_failing_module_retried_exactly_budget_times() {
        let (retrier, _tx) = retrier();
        let calls = AtomicU32::new(0);
        let import = || async {
            calls.fetch_add(1, Ordering::SeqCst);
            Err::<(), _>("ChunkLoadError: Loading chunk 7 failed")
        };

        let first = retrier.load("templates", import).await;
        assert!(first.is_fallback());
        assert_eq!(calls.load(Ordering::SeqCst), 3);
        let fallback = first.fallback().unwrap();
        assert_eq!(fallback.attempts, 3);
        assert!(fallback.message().contains("ChunkLoadError"));

        for _ in 0..5 {
            assert!(retrier.load("templates", import).await.is_fallback());
        }
        assert_eq!(calls.load(Ordering::SeqCst), 3);
        assert_eq!(retrier.failed_modules(), vec!["templates".to_string()]);
        assert_eq!(retrier.signals.failed_modules(), 1);

        assert_eq!(retrier.clear_failed_modules(), 1);
        assert!(retrier.failed_modules().is_empty());
        assert_eq!(retrier.signals.failed_modules(), 0);
        assert!(retrier.load("templates", import).await.is_fallback());
        assert_eq!(calls.load(Ordering::SeqCst), 6);
    }

    #[tokio::test(start_paused = true)]
    async fn test_linear_backoff_between_attempts() {
        let (retrier, _tx) = retrier();
        let started = Instant::now();
        let _ = retrier
            .load("drive", || async { Err::<(), _>("offline") })
            .await;
        // 1000ms after the first failure, 2000ms after the second.
        assert_eq!(started.elapsed(), Duration::from_millis(3_000));
    }

    #[tokio::test(start_paused = true)]
    async fn test_recovers_within_budget() {
        let (retrier, _tx) = retrier();
        let calls = AtomicU32::new(0);
        let loaded = retrier
            .load("directory", || async {
                if calls.fetch_add(1, Ordering::SeqCst) == 0 {
                    Err("transient")
                } else {
                    Ok(5u8)
                }
            })
            .await;
        assert_eq!(loaded.loaded(), Some(5));
        assert_eq!(calls.load(Ordering::SeqCst), 2);
        assert!(retrier.record("directory").is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout_counts_as_failed_attempt() {
        let (retrier, _tx) = retrier_with(DegradationPolicy {
            module_retry_budget: 1,
            ..DegradationPolicy::default()
        });
        let loaded = retrier
            .load("slow", || async {
                tokio::time::sleep(Duration::from_secs(60)).await;
                Ok::<_, String>(())
            })
            .await;
        let fallback = loaded.fallback().cloned().unwrap();
        assert!(fallback.reason.contains("timed out"));
        assert!(retrier.record("slow").unwrap().permanently_failed);
    }

    #[tokio::test(start_paused = true)]
    async fn test_budget_follows_active_policy() {
        let (retrier, tx) = retrier();
        tx.send(DegradationPolicy {
            module_retry_budget: 1,
            ..DegradationPolicy::default()
        })
        .unwrap();
        let calls = AtomicU32::new(0);
        let _ = retrier
            .load("messaging", || async {
                calls.fetch_add(1, Ordering::SeqCst);
                Err::<(), _>("nope")
            })
            .await;
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_manual_retry_clears_latch() {
        let (retrier, _tx) = retrier();
        let _ = retrier
            .load("analytics", || async { Err::<u8, _>("down") })
            .await;
        assert!(retrier.record("analytics").unwrap().permanently_failed);

        let retried = retrier
            .retry("analytics", || async { Ok::<_, String>(9u8) })
            .await;
        assert_eq!(retried.loaded(), Some(9));
        assert!(!retrier.reset_module("analytics"));
    }
}
