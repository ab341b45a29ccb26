//! Request admission control.
//!
//! ```text
//! submit(name, op)
//!   ├─ breaker OPEN ─────────────────────────▶ Err(CircuitOpen)
//!   ├─ active < max && queue empty ──────────▶ run under breaker + timeout
//!   └─ otherwise ─▶ queue (FIFO) ─┬─ slot released ─▶ run
//!                                 └─ expiry horizon ─▶ Err(RequestExpired)
//! ```
//!
//! Queue processing happens only when a slot is released (or on an explicit
//! [`RequestGovernor::drain`]); there is no polling loop. The active counter
//! and the queue share one mutex that is never held across an `.await`.

use std::collections::VecDeque;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::sync::{oneshot, watch};
use tokio::time::Instant;
use tracing::{debug, warn};

use crate::breaker::BreakerRegistry;
use crate::degradation::DegradationPolicy;
use crate::error::GovernorError;
use crate::pressure::PressureSignals;

/// Default horizon after which queued work is rejected.
pub const DEFAULT_QUEUE_EXPIRY: Duration = Duration::from_secs(30);

enum Admission {
    Granted,
    Expired,
}

struct QueuedRequest {
    id: u64,
    name: String,
    enqueued_at: Instant,
    admit: oneshot::Sender<Admission>,
}

#[derive(Default)]
struct GovernorInner {
    active: usize,
    queue: VecDeque<QueuedRequest>,
    peak_active: usize,
    completed: u64,
    expired: u64,
}

/// Counters for dashboards.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct GovernorCounters {
    pub active_requests: usize,
    pub queued_requests: usize,
    pub peak_active: usize,
    pub completed: u64,
    pub expired: u64,
}

/// Concurrency-limited admission queue in front of named dependencies.
pub struct RequestGovernor {
    breakers: Arc<BreakerRegistry>,
    signals: Arc<PressureSignals>,
    policy: watch::Receiver<DegradationPolicy>,
    queue_expiry: Duration,
    inner: Mutex<GovernorInner>,
    next_id: AtomicU64,
}

impl RequestGovernor {
    /// Build a governor that reads its ceiling and timeout from `policy`.
    pub fn new(
        breakers: Arc<BreakerRegistry>,
        signals: Arc<PressureSignals>,
        policy: watch::Receiver<DegradationPolicy>,
        queue_expiry: Duration,
    ) -> Self {
        Self {
            breakers,
            signals,
            policy,
            queue_expiry,
            inner: Mutex::new(GovernorInner::default()),
            next_id: AtomicU64::new(1),
        }
    }

    fn lock(&self) -> MutexGuard<'_, GovernorInner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// The policy currently published by the orchestrator.
    pub fn policy(&self) -> DegradationPolicy {
        *self.policy.borrow()
    }

    fn max_concurrent(&self) -> usize {
        self.policy.borrow().max_concurrent_requests.max(1)
    }

    /// Operations currently holding a slot.
    pub fn active_requests(&self) -> usize {
        self.lock().active
    }

    /// Callers waiting for a slot.
    pub fn queued_requests(&self) -> usize {
        self.lock().queue.len()
    }

    /// Snapshot of the admission counters.
    pub fn counters(&self) -> GovernorCounters {
        let inner = self.lock();
        GovernorCounters {
            active_requests: inner.active,
            queued_requests: inner.queue.len(),
            peak_active: inner.peak_active,
            completed: inner.completed,
            expired: inner.expired,
        }
    }

    /// Breakers consulted on admission.
    pub fn breakers(&self) -> &Arc<BreakerRegistry> {
        &self.breakers
    }

    /// Run `op` against dependency `name` once admitted.
    ///
    /// Suspends until the operation settles or its queue entry expires.
    /// Timeouts and operation errors feed the pressure signals and the
    /// breaker; admission rejections do not.
    pub async fn submit<T, E, F, Fut>(&self, name: &str, op: F) -> Result<T, GovernorError<E>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        let breaker = self.breakers.get(name);
        if breaker.is_open() {
            let retry_after_ms = breaker.retry_after_ms().unwrap_or(0);
            debug!(name, retry_after_ms, "Rejecting request, circuit open");
            return Err(GovernorError::circuit_open(name, retry_after_ms));
        }

        let slot = match self.admit_or_enqueue(name) {
            Ok(slot) => slot,
            Err(ticket) => ticket.wait().await?,
        };

        let timeout = self.policy.borrow().request_timeout();
        let started = Instant::now();
        let result = breaker.execute(timeout, op).await;

        match &result {
            Ok(_) => self.signals.record_latency(started.elapsed()),
            Err(e) if e.is_failure_signal() => {
                self.signals.record_failure();
                debug!(name, code = e.code(), "Governed request failed");
            }
            Err(_) => {}
        }

        drop(slot);
        result
    }

    fn admit_or_enqueue(&self, name: &str) -> Result<SlotGuard<'_>, QueueTicket<'_>> {
        let max = self.max_concurrent();
        let mut inner = self.lock();
        if inner.active < max && inner.queue.is_empty() {
            self.acquire_locked(&mut inner);
            debug!(name, active = inner.active, max, "Request admitted");
            return Ok(SlotGuard { governor: self });
        }

        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (admit, rx) = oneshot::channel();
        let enqueued_at = Instant::now();
        inner.queue.push_back(QueuedRequest {
            id,
            name: name.to_string(),
            enqueued_at,
            admit,
        });
        debug!(name, queued = inner.queue.len(), active = inner.active, max, "Request queued");
        Err(QueueTicket {
            governor: self,
            id,
            name: name.to_string(),
            enqueued_at,
            rx: Some(rx),
        })
    }

    fn acquire_locked(&self, inner: &mut GovernorInner) {
        inner.active += 1;
        inner.peak_active = inner.peak_active.max(inner.active);
        self.signals.set_active_requests(inner.active);
    }

    fn release_locked(&self, inner: &mut GovernorInner) {
        inner.active = inner.active.saturating_sub(1);
        inner.completed += 1;
        self.signals.set_active_requests(inner.active);
        self.drain_locked(inner);
    }

    /// Admit queued entries, oldest first, while capacity allows.
    fn drain_locked(&self, inner: &mut GovernorInner) {
        let max = self.max_concurrent();
        let now = Instant::now();
        while inner.active < max {
            let Some(entry) = inner.queue.pop_front() else {
                break;
            };
            let waited = now.saturating_duration_since(entry.enqueued_at);
            if waited >= self.queue_expiry {
                inner.expired += 1;
                warn!(
                    name = %entry.name,
                    waited_ms = waited.as_millis() as u64,
                    "Queued request expired"
                );
                let _ = entry.admit.send(Admission::Expired);
                continue;
            }
            if entry.admit.send(Admission::Granted).is_ok() {
                self.acquire_locked(inner);
                debug!(name = %entry.name, queued = inner.queue.len(), "Queued request admitted");
            }
        }
    }

    /// Admit queued work up to the current ceiling. Called after the active
    /// policy changes.
    pub fn drain(&self) {
        let mut inner = self.lock();
        self.drain_locked(&mut inner);
    }

    /// Drop every queued entry. Their callers receive `RequestExpired`.
    /// In-flight operations keep their slots until they settle.
    pub fn reset(&self) {
        let dropped: Vec<QueuedRequest> = {
            let mut inner = self.lock();
            inner.queue.drain(..).collect()
        };
        if !dropped.is_empty() {
            warn!(dropped = dropped.len(), "Governor queue cleared");
        }
    }
}

/// One occupied concurrency slot. Dropping it releases the slot and drains
/// the queue, whichever way the operation ended.
struct SlotGuard<'a> {
    governor: &'a RequestGovernor,
}

impl Drop for SlotGuard<'_> {
    fn drop(&mut self) {
        let mut inner = self.governor.lock();
        self.governor.release_locked(&mut inner);
    }
}

/// A caller's place in the queue.
struct QueueTicket<'a> {
    governor: &'a RequestGovernor,
    id: u64,
    name: String,
    enqueued_at: Instant,
    rx: Option<oneshot::Receiver<Admission>>,
}

impl<'a> QueueTicket<'a> {
    async fn wait<E>(mut self) -> Result<SlotGuard<'a>, GovernorError<E>> {
        let deadline = self.enqueued_at + self.governor.queue_expiry;
        let outcome = match self.rx.as_mut() {
            Some(rx) => tokio::time::timeout_at(deadline, rx).await,
            None => return Err(self.expired_error()),
        };

        match outcome {
            Ok(Ok(Admission::Granted)) => {
                self.rx = None;
                Ok(SlotGuard {
                    governor: self.governor,
                })
            }
            Ok(Ok(Admission::Expired)) | Ok(Err(_)) => {
                self.rx = None;
                Err(self.expired_error())
            }
            Err(_) => {
                // The deadline passed; a grant that raced in under the lock
                // is still honoured.
                if self.withdraw() {
                    Ok(SlotGuard {
                        governor: self.governor,
                    })
                } else {
                    let mut inner = self.governor.lock();
                    inner.expired += 1;
                    drop(inner);
                    warn!(name = %self.name, "Queued request expired");
                    Err(self.expired_error())
                }
            }
        }
    }

    /// Leave the queue. Returns true if a slot had already been granted.
    fn withdraw(&mut self) -> bool {
        let Some(mut rx) = self.rx.take() else {
            return false;
        };
        let mut inner = self.governor.lock();
        if let Some(pos) = inner.queue.iter().position(|e| e.id == self.id) {
            inner.queue.remove(pos);
            return false;
        }
        matches!(rx.try_recv(), Ok(Admission::Granted))
    }

    fn expired_error<E>(&self) -> GovernorError<E> {
        let waited = Instant::now().saturating_duration_since(self.enqueued_at);
        GovernorError::expired(&self.name, waited.as_millis() as u64)
    }
}

impl Drop for QueueTicket<'_> {
    fn drop(&mut self) {
        // Caller cancelled while queued: give back any slot granted to us.
        if self.withdraw() {
            let mut inner = self.governor.lock();
            self.governor.release_locked(&mut inner);
        }
    }
}
