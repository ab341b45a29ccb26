//! Named circuit breakers for remote dependencies.
//!
//! ```text
//!            failures ≥ failure_threshold
//!   CLOSED ───────────────────────────────▶ OPEN
//!     ▲                                      │  now ≥ next_attempt_at
//!     │ successes ≥ success_threshold        ▼  (checked on next call)
//!     └────────────────────────────────── HALF_OPEN
//!                                            │  any failure
//!                                            └──────────▶ OPEN
//! ```
//!
//! Every transition goes through the breaker's single mutex. While
//! HALF_OPEN, one probe call is in flight at a time; other callers fail fast.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::error::GovernorError;

/// Circuit breaker state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum BreakerState {
    /// Healthy: requests allowed.
    Closed,
    /// Tripped: requests blocked until the recovery timeout expires.
    Open,
    /// Recovery timeout expired: probe requests allowed one at a time.
    HalfOpen,
}

impl std::fmt::Display for BreakerState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Closed => write!(f, "CLOSED"),
            Self::Open => write!(f, "OPEN"),
            Self::HalfOpen => write!(f, "HALF_OPEN"),
        }
    }
}

/// Thresholds shared by every breaker in a registry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct BreakerConfig {
    /// Consecutive failures in CLOSED before the circuit opens.
    pub failure_threshold: u32,
    /// Consecutive probe successes in HALF_OPEN before the circuit closes.
    pub success_threshold: u32,
    /// Milliseconds the circuit stays OPEN before allowing a probe.
    pub recovery_timeout_ms: u64,
}

impl BreakerConfig {
    pub fn recovery_timeout(&self) -> Duration {
        Duration::from_millis(self.recovery_timeout_ms)
    }
}

impl Default for BreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            success_threshold: 3,
            recovery_timeout_ms: 30_000,
        }
    }
}

#[derive(Debug)]
struct BreakerInner {
    state: BreakerState,
    failure_count: u32,
    success_count: u32,
    next_attempt_at: Option<Instant>,
    probe_in_flight: bool,
    times_opened: u64,
}

impl BreakerInner {
    fn closed() -> Self {
        Self {
            state: BreakerState::Closed,
            failure_count: 0,
            success_count: 0,
            next_attempt_at: None,
            probe_in_flight: false,
            times_opened: 0,
        }
    }
}

/// Point-in-time view of a breaker, for status reporting.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BreakerSnapshot {
    pub name: String,
    pub state: BreakerState,
    pub failure_count: u32,
    pub success_count: u32,
    /// Milliseconds until the next probe is allowed, while OPEN.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub retry_after_ms: Option<u64>,
    pub times_opened: u64,
}

/// Tri-state breaker guarding one named dependency.
#[derive(Debug)]
pub struct CircuitBreaker {
    name: String,
    config: BreakerConfig,
    inner: Mutex<BreakerInner>,
}

impl CircuitBreaker {
    pub fn new(name: impl Into<String>, config: BreakerConfig) -> Self {
        Self {
            name: name.into(),
            config,
            inner: Mutex::new(BreakerInner::closed()),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    fn lock(&self) -> MutexGuard<'_, BreakerInner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Current state without applying the lazy OPEN → HALF_OPEN check.
    pub fn state(&self) -> BreakerState {
        self.lock().state
    }

    /// Whether a call attempted right now would be refused outright.
    pub fn is_open(&self) -> bool {
        let inner = self.lock();
        match inner.state {
            BreakerState::Open => inner
                .next_attempt_at
                .is_some_and(|at| Instant::now() < at),
            BreakerState::HalfOpen => inner.probe_in_flight,
            BreakerState::Closed => false,
        }
    }

    /// Milliseconds until a probe is allowed, when OPEN.
    pub fn retry_after_ms(&self) -> Option<u64> {
        let inner = self.lock();
        retry_after(&inner, Instant::now())
    }

    /// Admit one call or refuse it. Applies OPEN → HALF_OPEN when due.
    pub fn try_acquire(&self) -> Result<BreakerCall<'_>, u64> {
        let now = Instant::now();
        let mut inner = self.lock();
        match inner.state {
            BreakerState::Closed => Ok(BreakerCall::new(self, false)),
            BreakerState::Open => {
                let due = inner.next_attempt_at.map_or(true, |at| now >= at);
                if !due {
                    return Err(retry_after(&inner, now).unwrap_or(0));
                }
                inner.state = BreakerState::HalfOpen;
                inner.success_count = 0;
                inner.probe_in_flight = true;
                info!(breaker = %self.name, "Circuit half-open, allowing probe");
                Ok(BreakerCall::new(self, true))
            }
            BreakerState::HalfOpen => {
                if inner.probe_in_flight {
                    debug!(breaker = %self.name, "Probe already in flight, refusing call");
                    return Err(0);
                }
                inner.probe_in_flight = true;
                Ok(BreakerCall::new(self, true))
            }
        }
    }

    /// Run `op` through the breaker with a timeout.
    ///
    /// Fails fast with [`GovernorError::CircuitOpen`] without invoking `op`
    /// while the circuit is open. Timeouts and errors both count as failures.
    pub async fn execute<T, E, F, Fut>(&self, timeout: Duration, op: F) -> Result<T, GovernorError<E>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        let call = self
            .try_acquire()
            .map_err(|retry_after_ms| GovernorError::circuit_open(&self.name, retry_after_ms))?;

        match tokio::time::timeout(timeout, op()).await {
            Ok(Ok(value)) => {
                call.succeed();
                Ok(value)
            }
            Ok(Err(e)) => {
                call.fail();
                Err(GovernorError::Operation(e))
            }
            Err(_) => {
                call.fail();
                let timeout_ms = u64::try_from(timeout.as_millis()).unwrap_or(u64::MAX);
                warn!(breaker = %self.name, timeout_ms, "Call timed out");
                Err(GovernorError::timeout(&self.name, timeout_ms))
            }
        }
    }

    fn on_success(&self, probe: bool) {
        let mut inner = self.lock();
        match inner.state {
            BreakerState::Closed => {
                inner.failure_count = 0;
            }
            BreakerState::HalfOpen if probe => {
                inner.probe_in_flight = false;
                inner.success_count += 1;
                if inner.success_count >= self.config.success_threshold {
                    inner.state = BreakerState::Closed;
                    inner.failure_count = 0;
                    inner.success_count = 0;
                    inner.next_attempt_at = None;
                    info!(breaker = %self.name, "Circuit closed after successful probes");
                }
            }
            // Results from calls admitted before the circuit tripped do not
            // count toward recovery.
            _ => {}
        }
    }

    fn on_failure(&self, probe: bool) {
        let now = Instant::now();
        let mut inner = self.lock();
        match inner.state {
            BreakerState::Closed => {
                inner.failure_count += 1;
                if inner.failure_count >= self.config.failure_threshold {
                    self.trip(&mut inner, now);
                }
            }
            BreakerState::HalfOpen if probe => {
                inner.probe_in_flight = false;
                self.trip(&mut inner, now);
            }
            _ => {}
        }
    }

    fn trip(&self, inner: &mut BreakerInner, now: Instant) {
        inner.state = BreakerState::Open;
        inner.success_count = 0;
        inner.next_attempt_at = Some(now + self.config.recovery_timeout());
        inner.times_opened += 1;
        warn!(
            breaker = %self.name,
            failures = inner.failure_count,
            recovery_timeout_ms = self.config.recovery_timeout_ms,
            "Circuit opened"
        );
    }

    /// A probe was abandoned without an outcome; let the next caller probe.
    fn on_abandoned(&self) {
        let mut inner = self.lock();
        if inner.state == BreakerState::HalfOpen {
            inner.probe_in_flight = false;
        }
    }

    /// Operator reset back to CLOSED with zeroed counters.
    pub fn reset(&self) {
        let mut inner = self.lock();
        let times_opened = inner.times_opened;
        *inner = BreakerInner::closed();
        inner.times_opened = times_opened;
        info!(breaker = %self.name, "Circuit reset");
    }

    pub fn snapshot(&self) -> BreakerSnapshot {
        let inner = self.lock();
        BreakerSnapshot {
            name: self.name.clone(),
            state: inner.state,
            failure_count: inner.failure_count,
            success_count: inner.success_count,
            retry_after_ms: retry_after(&inner, Instant::now()),
            times_opened: inner.times_opened,
        }
    }
}

fn retry_after(inner: &BreakerInner, now: Instant) -> Option<u64> {
    if inner.state != BreakerState::Open {
        return None;
    }
    inner.next_attempt_at.map(|at| {
        let remaining = at.saturating_duration_since(now);
        u64::try_from(remaining.as_millis()).unwrap_or(u64::MAX)
    })
}

/// One admitted call. Report its outcome with [`succeed`](Self::succeed) or
/// [`fail`](Self::fail); dropping it unreported releases a HALF_OPEN probe
/// slot without counting an outcome.
#[must_use = "report the call outcome with succeed() or fail()"]
pub struct BreakerCall<'a> {
    breaker: &'a CircuitBreaker,
    probe: bool,
    settled: bool,
}

impl<'a> BreakerCall<'a> {
    fn new(breaker: &'a CircuitBreaker, probe: bool) -> Self {
        Self {
            breaker,
            probe,
            settled: false,
        }
    }

    pub fn is_probe(&self) -> bool {
        self.probe
    }

    pub fn succeed(mut self) {
        self.settled = true;
        self.breaker.on_success(self.probe);
    }

    pub fn fail(mut self) {
        self.settled = true;
        self.breaker.on_failure(self.probe);
    }
}

impl Drop for BreakerCall<'_> {
    fn drop(&mut self) {
        if !self.settled && self.probe {
            self.breaker.on_abandoned();
        }
    }
}

/// Lazily created breakers keyed by dependency name.
#[derive(Debug)]
pub struct BreakerRegistry {
    config: BreakerConfig,
    breakers: Mutex<HashMap<String, Arc<CircuitBreaker>>>,
}

impl BreakerRegistry {
    pub fn new(config: BreakerConfig) -> Self {
        Self {
            config,
            breakers: Mutex::new(HashMap::new()),
        }
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<String, Arc<CircuitBreaker>>> {
        self.breakers.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Breaker for `name`, created CLOSED on first use.
    pub fn get(&self, name: &str) -> Arc<CircuitBreaker> {
        let mut breakers = self.lock();
        if let Some(existing) = breakers.get(name) {
            return Arc::clone(existing);
        }
        debug!(breaker = %name, "Creating circuit breaker");
        let breaker = Arc::new(CircuitBreaker::new(name, self.config.clone()));
        breakers.insert(name.to_string(), Arc::clone(&breaker));
        breaker
    }

    /// Breaker for `name` if one has been created.
    pub fn find(&self, name: &str) -> Option<Arc<CircuitBreaker>> {
        self.lock().get(name).cloned()
    }

    /// Snapshots sorted by name.
    pub fn snapshots(&self) -> Vec<BreakerSnapshot> {
        let breakers: Vec<Arc<CircuitBreaker>> = self.lock().values().cloned().collect();
        let mut snapshots: Vec<BreakerSnapshot> =
            breakers.iter().map(|b| b.snapshot()).collect();
        snapshots.sort_by(|a, b| a.name.cmp(&b.name));
        snapshots
    }

    pub fn reset_all(&self) {
        let breakers: Vec<Arc<CircuitBreaker>> = self.lock().values().cloned().collect();
        for breaker in breakers {
            breaker.reset();
        }
    }

    pub fn config(&self) -> &BreakerConfig {
        &self.config
    }
}

impl Default for BreakerRegistry {
    fn default() -> Self {
        Self::new(BreakerConfig::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    const TIMEOUT: Duration = Duration::from_secs(5);

    fn breaker(failure_threshold: u32, success_threshold: u32, recovery_ms: u64) -> CircuitBreaker {
        CircuitBreaker::new(
            "supabase",
            BreakerConfig {
                failure_threshold,
                success_threshold,
                recovery_timeout_ms: recovery_ms,
            },
        )
    }

    async fn fail_once(cb: &CircuitBreaker) {
        let result: Result<(), GovernorError<&str>> =
            cb.execute(TIMEOUT, || async { Err("boom") }).await;
        assert!(result.is_err());
    }

    async fn succeed_once(cb: &CircuitBreaker) -> Result<u32, GovernorError<&'static str>> {
        cb.execute(TIMEOUT, || async { Ok(7) }).await
    }

    #[tokio::test]
    async fn test_circuit_starts_closed() {
        let cb = breaker(5, 3, 30_000);
        assert_eq!(cb.state(), BreakerState::Closed);
        assert!(!cb.is_open());
        assert_eq!(succeed_once(&cb).await.unwrap(), 7);
    }

    #[tokio::test]
    async fn test_circuit_opens_after_threshold() {
        let cb = breaker(5, 3, 30_000);
        for _ in 0..4 {
            fail_once(&cb).await;
        }
        assert_eq!(cb.state(), BreakerState::Closed);
        fail_once(&cb).await;
        assert_eq!(cb.state(), BreakerState::Open);
        assert!(cb.is_open());
    }

    #[tokio::test]
    async fn test_success_resets_failure_count() {
        let cb = breaker(3, 1, 30_000);
        fail_once(&cb).await;
        fail_once(&cb).await;
        succeed_once(&cb).await.unwrap();
        assert_eq!(cb.snapshot().failure_count, 0);
        fail_once(&cb).await;
        fail_once(&cb).await;
        assert_eq!(cb.state(), BreakerState::Closed);
    }

    #[tokio::test(start_paused = true)]
    async fn test_open_circuit_short_circuits() {
        let cb = breaker(1, 1, 30_000);
        fail_once(&cb).await;

        let invoked = AtomicU32::new(0);
        let result: Result<(), GovernorError<&str>> = cb
            .execute(TIMEOUT, || async {
                invoked.fetch_add(1, Ordering::SeqCst);
                Ok(())
            })
            .await;

        assert!(matches!(
            result,
            Err(GovernorError::CircuitOpen { retry_after_ms: 30_000, .. })
        ));
        assert_eq!(invoked.load(Ordering::SeqCst), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_half_open_after_recovery_timeout() {
        let cb = breaker(1, 3, 1_000);
        fail_once(&cb).await;
        assert_eq!(cb.retry_after_ms(), Some(1_000));

        tokio::time::advance(Duration::from_millis(1_000)).await;
        // The transition is lazy: still OPEN until someone calls.
        assert_eq!(cb.state(), BreakerState::Open);
        assert!(!cb.is_open());

        succeed_once(&cb).await.unwrap();
        assert_eq!(cb.state(), BreakerState::HalfOpen);
        assert_eq!(cb.snapshot().success_count, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_half_open_allows_single_probe() {
        let cb = Arc::new(breaker(1, 3, 1_000));
        fail_once(&cb).await;
        tokio::time::advance(Duration::from_millis(1_001)).await;

        let (release_tx, release_rx) = tokio::sync::oneshot::channel::<()>();
        let probe_cb = Arc::clone(&cb);
        let probe = tokio::spawn(async move {
            probe_cb
                .execute(TIMEOUT, || async move {
                    let _ = release_rx.await;
                    Ok::<_, &str>(())
                })
                .await
        });
        tokio::task::yield_now().await;
        assert_eq!(cb.state(), BreakerState::HalfOpen);

        let invoked = AtomicU32::new(0);
        let second: Result<(), GovernorError<&str>> = cb
            .execute(TIMEOUT, || async {
                invoked.fetch_add(1, Ordering::SeqCst);
                Ok(())
            })
            .await;
        assert!(matches!(second, Err(GovernorError::CircuitOpen { .. })));
        assert_eq!(invoked.load(Ordering::SeqCst), 0);

        release_tx.send(()).unwrap();
        probe.await.unwrap().unwrap();
        assert_eq!(cb.snapshot().success_count, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_half_open_closes_after_success_threshold() {
        let cb = breaker(1, 3, 1_000);
        fail_once(&cb).await;
        tokio::time::advance(Duration::from_millis(1_000)).await;

        succeed_once(&cb).await.unwrap();
        succeed_once(&cb).await.unwrap();
        assert_eq!(cb.state(), BreakerState::HalfOpen);
        succeed_once(&cb).await.unwrap();
        assert_eq!(cb.state(), BreakerState::Closed);
        assert_eq!(cb.retry_after_ms(), None);
    }

    #[tokio::test(start_paused = true)]
    async fn test_half_open_failure_reopens() {
        let cb = breaker(1, 3, 1_000);
        fail_once(&cb).await;
        tokio::time::advance(Duration::from_millis(1_000)).await;

        succeed_once(&cb).await.unwrap();
        fail_once(&cb).await;
        assert_eq!(cb.state(), BreakerState::Open);
        assert_eq!(cb.retry_after_ms(), Some(1_000));
        assert_eq!(cb.snapshot().times_opened, 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout_counts_as_failure() {
        let cb = breaker(1, 1, 30_000);
        let result: Result<(), GovernorError<&str>> = cb
            .execute(Duration::from_millis(50), || async {
                tokio::time::sleep(Duration::from_secs(10)).await;
                Ok(())
            })
            .await;
        assert!(matches!(
            result,
            Err(GovernorError::RequestTimeout { timeout_ms: 50, .. })
        ));
        assert_eq!(cb.state(), BreakerState::Open);
    }

    #[tokio::test(start_paused = true)]
    async fn test_abandoned_probe_frees_slot() {
        let cb = breaker(1, 2, 1_000);
        fail_once(&cb).await;
        tokio::time::advance(Duration::from_millis(1_000)).await;

        let call = cb.try_acquire().unwrap();
        assert!(call.is_probe());
        assert!(cb.try_acquire().is_err());
        drop(call);
        assert!(cb.try_acquire().is_ok());
    }

    #[tokio::test]
    async fn test_reset_closes_circuit() {
        let cb = breaker(1, 1, 30_000);
        fail_once(&cb).await;
        assert_eq!(cb.state(), BreakerState::Open);
        cb.reset();
        assert_eq!(cb.state(), BreakerState::Closed);
        assert_eq!(cb.snapshot().times_opened, 1);
    }

    #[tokio::test]
    async fn test_registry_isolates_dependencies() {
        let registry = BreakerRegistry::new(BreakerConfig {
            failure_threshold: 1,
            ..BreakerConfig::default()
        });
        fail_once(&registry.get("supabase")).await;

        assert_eq!(registry.get("supabase").state(), BreakerState::Open);
        assert_eq!(registry.get("drive").state(), BreakerState::Closed);
        assert!(Arc::ptr_eq(&registry.get("drive"), &registry.get("drive")));

        let names: Vec<String> = registry.snapshots().into_iter().map(|s| s.name).collect();
        assert_eq!(names, vec!["drive".to_string(), "supabase".to_string()]);

        registry.reset_all();
        assert_eq!(registry.get("supabase").state(), BreakerState::Closed);
        assert!(registry.find("unknown").is_none());
    }

    #[test]
    fn test_state_serializes_screaming_case() {
        let json = serde_json::to_string(&BreakerState::HalfOpen).unwrap();
        assert_eq!(json, "\"HALF_OPEN\"");
        assert_eq!(BreakerState::Open.to_string(), "OPEN");
    }
}
