//! Admission property tests: randomized completion orders and outcomes
//! against the concurrency ceiling.
//!
//! Tests verify:
//! - `active_requests` never exceeds the policy maximum, whether operations
//!   succeed, fail or time out
//! - Every submitted operation is either active, queued or settled
//! - Admission order is FIFO regardless of completion order

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use resource_governor::{
    DegradationPolicy, DegradationTier, GovernorConfig, GovernorError, ResourceGovernor,
    SharedResourceGovernor, StaticMemoryProbe,
};
use tokio::sync::oneshot;
use tokio::task::JoinHandle;

/// Small deterministic LCG so failures reproduce from the seed.
struct Lcg(u64);

impl Lcg {
    fn next(&mut self) -> u64 {
        self.0 = self
            .0
            .wrapping_mul(6_364_136_223_846_793_005)
            .wrapping_add(1_442_695_040_888_963_407);
        self.0 >> 33
    }

    fn below(&mut self, n: usize) -> usize {
        (self.next() % n as u64) as usize
    }
}

fn governor(max: usize) -> SharedResourceGovernor {
    let config = GovernorConfig {
        tiers: vec![DegradationTier {
            threshold: 0.0,
            policy: DegradationPolicy {
                max_concurrent_requests: max,
                request_timeout_ms: 120_000,
                ..DegradationPolicy::default()
            },
        }],
        ..GovernorConfig::default()
    };
    ResourceGovernor::with_probe(config, Arc::new(StaticMemoryProbe::new(None)))
        .unwrap()
        .shared()
}

async fn settle() {
    for _ in 0..8 {
        tokio::task::yield_now().await;
    }
}

type Handle = JoinHandle<Result<usize, GovernorError<&'static str>>>;

struct Harness {
    gates: Vec<Option<oneshot::Sender<()>>>,
    handles: Vec<Handle>,
    current: Arc<AtomicUsize>,
    peak: Arc<AtomicUsize>,
    admitted: Arc<Mutex<Vec<usize>>>,
}

async fn submit_gated(governor: &SharedResourceGovernor, count: usize) -> Harness {
    let current = Arc::new(AtomicUsize::new(0));
    let peak = Arc::new(AtomicUsize::new(0));
    let admitted = Arc::new(Mutex::new(Vec::new()));
    let mut gates = Vec::new();
    let mut handles = Vec::new();

    for i in 0..count {
        let (tx, rx) = oneshot::channel::<()>();
        gates.push(Some(tx));
        let governor = Arc::clone(governor);
        let current = Arc::clone(&current);
        let peak = Arc::clone(&peak);
        let admitted = Arc::clone(&admitted);
        handles.push(tokio::spawn(async move {
            governor
                .submit("api", || async move {
                    let now = current.fetch_add(1, Ordering::SeqCst) + 1;
                    peak.fetch_max(now, Ordering::SeqCst);
                    admitted.lock().unwrap().push(i);
                    let _ = rx.await;
                    current.fetch_sub(1, Ordering::SeqCst);
                    Ok::<_, &'static str>(i)
                })
                .await
        }));
        settle().await;
    }

    Harness {
        gates,
        handles,
        current,
        peak,
        admitted,
    }
}

// ── Property: active never exceeds the ceiling ─────────────────────

#[derive(Debug, Clone, Copy, PartialEq)]
enum Outcome {
    Succeed,
    Fail,
    Hang,
}

/// Decrements the running count however the operation ends, including when
/// its future is dropped by the request timeout.
struct Running(Arc<AtomicUsize>);

impl Drop for Running {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

fn mixed_governor(max: usize) -> SharedResourceGovernor {
    let mut config = GovernorConfig {
        tiers: vec![DegradationTier {
            threshold: 0.0,
            policy: DegradationPolicy {
                max_concurrent_requests: max,
                request_timeout_ms: 100,
                ..DegradationPolicy::default()
            },
        }],
        ..GovernorConfig::default()
    };
    config.breaker.failure_threshold = 1_000;
    ResourceGovernor::with_probe(config, Arc::new(StaticMemoryProbe::new(None)))
        .unwrap()
        .shared()
}

#[tokio::test(start_paused = true)]
async fn prop_active_bounded_under_mixed_outcomes() {
    for seed in [1u64, 7, 42, 1_234, 98_765] {
        let mut rng = Lcg(seed);
        let max = 1 + rng.below(4);
        let count = 6 + rng.below(10);
        let governor = mixed_governor(max);
        let current = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));
        let admitted = Arc::new(Mutex::new(Vec::new()));

        let mut outcomes = Vec::new();
        let mut handles = Vec::new();
        for i in 0..count {
            let outcome = match rng.below(3) {
                0 => Outcome::Succeed,
                1 => Outcome::Fail,
                _ => Outcome::Hang,
            };
            let work = Duration::from_millis(1 + rng.below(50) as u64);
            outcomes.push(outcome);

            let governor = Arc::clone(&governor);
            let current = Arc::clone(&current);
            let peak = Arc::clone(&peak);
            let admitted = Arc::clone(&admitted);
            handles.push(tokio::spawn(async move {
                governor
                    .submit("api", || async move {
                        let now = current.fetch_add(1, Ordering::SeqCst) + 1;
                        let _running = Running(current);
                        peak.fetch_max(now, Ordering::SeqCst);
                        admitted.lock().unwrap().push(i);
                        match outcome {
                            Outcome::Succeed => {
                                tokio::time::sleep(work).await;
                                Ok::<usize, &'static str>(i)
                            }
                            Outcome::Fail => {
                                tokio::time::sleep(work).await;
                                Err("boom")
                            }
                            Outcome::Hang => {
                                tokio::time::sleep(Duration::from_secs(600)).await;
                                Ok(i)
                            }
                        }
                    })
                    .await
            }));
            settle().await;
        }

        while handles.iter().any(|h| !h.is_finished()) {
            let counters = governor.counters();
            assert!(
                counters.active_requests <= max,
                "seed {seed}: active {} > max {max}",
                counters.active_requests
            );
            assert_eq!(
                counters.active_requests + counters.queued_requests + counters.completed as usize,
                count,
                "seed {seed}: submissions unaccounted for"
            );
            tokio::time::sleep(Duration::from_millis(1)).await;
        }

        for (i, handle) in handles.into_iter().enumerate() {
            let result = handle.await.unwrap();
            match outcomes[i] {
                Outcome::Succeed => assert_eq!(result.unwrap(), i, "seed {seed}"),
                Outcome::Fail => assert!(
                    matches!(result, Err(GovernorError::Operation("boom"))),
                    "seed {seed}: op {i}"
                ),
                Outcome::Hang => assert!(
                    matches!(result, Err(GovernorError::RequestTimeout { .. })),
                    "seed {seed}: op {i}"
                ),
            }
        }

        assert!(peak.load(Ordering::SeqCst) <= max, "seed {seed}");
        assert_eq!(current.load(Ordering::SeqCst), 0, "seed {seed}");
        assert_eq!(*admitted.lock().unwrap(), (0..count).collect::<Vec<_>>(), "seed {seed}");
        let counters = governor.counters();
        assert_eq!(counters.active_requests, 0);
        assert_eq!(counters.queued_requests, 0);
        assert_eq!(counters.completed as usize, count);
    }
}

// ── Property: admission order is FIFO ──────────────────────────────

#[tokio::test]
async fn prop_admission_is_fifo() {
    for seed in [3u64, 11, 2_024] {
        let mut rng = Lcg(seed);
        let max = 1 + rng.below(3);
        let count = 8;
        let governor = governor(max);
        let mut harness = submit_gated(&governor, count).await;

        // Release whichever admitted operation the RNG picks.
        while harness.gates.iter().any(Option::is_some) {
            let running: Vec<usize> = harness
                .admitted
                .lock()
                .unwrap()
                .iter()
                .copied()
                .filter(|i| harness.gates[*i].is_some())
                .collect();
            assert!(!running.is_empty(), "seed {seed}: nothing running");
            let pick = running[rng.below(running.len())];
            if let Some(gate) = harness.gates[pick].take() {
                let _ = gate.send(());
            }
            settle().await;
        }

        for handle in harness.handles.drain(..) {
            handle.await.unwrap().unwrap();
        }
        assert!(harness.peak.load(Ordering::SeqCst) <= max, "seed {seed}");
        assert_eq!(harness.current.load(Ordering::SeqCst), 0, "seed {seed}");
        assert_eq!(
            *harness.admitted.lock().unwrap(),
            (0..count).collect::<Vec<_>>(),
            "seed {seed}"
        );
    }
}
