//! Degradation tiers: pressure-indexed limits for requests and module loads.
//!
//! ```text
//! pressure  0 ──── 25 ──── 50 ──── 75 ──── 90 ──── 100
//!           │ tier0 │ tier1 │ tier2 │ tier3 │ tier4 │
//! ```
//!
//! Selection picks the tier with the highest threshold that is ≤ pressure.

use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::error::{ConfigError, ConfigResult};

/// Limits applied while a pressure tier is active.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DegradationPolicy {
    /// Ceiling on concurrently executing governed operations.
    pub max_concurrent_requests: usize,
    /// Per-operation timeout in milliseconds.
    pub request_timeout_ms: u64,
    /// Base delay for module-load retry backoff in milliseconds.
    pub retry_delay_ms: u64,
    /// Failed attempts allowed per module before the fallback latches.
    pub module_retry_budget: u32,
}

impl DegradationPolicy {
    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }

    /// Linear backoff for the given (1-based) retry count.
    pub fn retry_delay(&self, retry_count: u32) -> Duration {
        Duration::from_millis(self.retry_delay_ms.saturating_mul(u64::from(retry_count)))
    }
}

impl Default for DegradationPolicy {
    fn default() -> Self {
        Self {
            max_concurrent_requests: 10,
            request_timeout_ms: 30_000,
            retry_delay_ms: 1_000,
            module_retry_budget: 3,
        }
    }
}

/// One row of the degradation table.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct DegradationTier {
    /// Lowest pressure (inclusive) at which this tier applies.
    pub threshold: f64,
    #[serde(flatten)]
    pub policy: DegradationPolicy,
}

impl DegradationTier {
    pub const fn new(threshold: f64, policy: DegradationPolicy) -> Self {
        Self { threshold, policy }
    }
}

/// Ordered pressure → policy lookup table.
#[derive(Debug, Clone, PartialEq)]
pub struct DegradationTable {
    /// Sorted ascending by threshold.
    tiers: Vec<DegradationTier>,
}

impl DegradationTable {
    /// Build a table from arbitrary rows. Rows are sorted by threshold.
    pub fn new(mut tiers: Vec<DegradationTier>) -> ConfigResult<Self> {
        tiers.sort_by(|a, b| a.threshold.total_cmp(&b.threshold));
        validate_tiers(&tiers)?;
        Ok(Self { tiers })
    }

    /// The default five-tier table.
    pub fn default_tiers() -> Vec<DegradationTier> {
        vec![
            DegradationTier::new(0.0, DegradationPolicy::default()),
            DegradationTier::new(
                25.0,
                DegradationPolicy {
                    max_concurrent_requests: 6,
                    request_timeout_ms: 20_000,
                    retry_delay_ms: 2_000,
                    module_retry_budget: 3,
                },
            ),
            DegradationTier::new(
                50.0,
                DegradationPolicy {
                    max_concurrent_requests: 4,
                    request_timeout_ms: 15_000,
                    retry_delay_ms: 3_000,
                    module_retry_budget: 2,
                },
            ),
            DegradationTier::new(
                75.0,
                DegradationPolicy {
                    max_concurrent_requests: 2,
                    request_timeout_ms: 10_000,
                    retry_delay_ms: 5_000,
                    module_retry_budget: 2,
                },
            ),
            DegradationTier::new(
                90.0,
                DegradationPolicy {
                    max_concurrent_requests: 1,
                    request_timeout_ms: 5_000,
                    retry_delay_ms: 10_000,
                    module_retry_budget: 1,
                },
            ),
        ]
    }

    /// Policy of the greatest threshold ≤ `pressure`.
    ///
    /// Pressures below the first threshold (or NaN) fall back to the
    /// least restrictive tier.
    pub fn policy_for(&self, pressure: f64) -> DegradationPolicy {
        self.tiers
            .iter()
            .rev()
            .find(|tier| tier.threshold <= pressure)
            .or_else(|| self.tiers.first())
            .map(|tier| tier.policy)
            .unwrap_or_default()
    }

    /// Policy of the highest threshold.
    pub fn most_restrictive(&self) -> DegradationPolicy {
        self.tiers
            .last()
            .map(|tier| tier.policy)
            .unwrap_or_default()
    }

    /// Index of the tier selected for `pressure`.
    pub fn tier_index(&self, pressure: f64) -> usize {
        self.tiers
            .iter()
            .rposition(|tier| tier.threshold <= pressure)
            .unwrap_or(0)
    }

    pub fn tiers(&self) -> &[DegradationTier] {
        &self.tiers
    }
}

impl Default for DegradationTable {
    fn default() -> Self {
        Self {
            tiers: Self::default_tiers(),
        }
    }
}

fn validate_tiers(tiers: &[DegradationTier]) -> ConfigResult<()> {
    if tiers.is_empty() {
        return Err(ConfigError::invalid("degradation table needs at least one tier"));
    }
    for pair in tiers.windows(2) {
        if pair[0].threshold == pair[1].threshold {
            return Err(ConfigError::invalid(format!(
                "duplicate degradation threshold {}",
                pair[0].threshold
            )));
        }
    }
    for tier in tiers {
        if !(0.0..=100.0).contains(&tier.threshold) {
            return Err(ConfigError::invalid(format!(
                "degradation threshold {} outside [0, 100]",
                tier.threshold
            )));
        }
        let policy = &tier.policy;
        if policy.max_concurrent_requests == 0 {
            return Err(ConfigError::invalid(format!(
                "tier {}: max_concurrent_requests must be at least 1",
                tier.threshold
            )));
        }
        if policy.request_timeout_ms == 0 {
            return Err(ConfigError::invalid(format!(
                "tier {}: request_timeout_ms must be non-zero",
                tier.threshold
            )));
        }
        if policy.module_retry_budget == 0 {
            return Err(ConfigError::invalid(format!(
                "tier {}: module_retry_budget must be at least 1",
                tier.threshold
            )));
        }
    }
    Ok(())
}
