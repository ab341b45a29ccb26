//! Governor configuration
//!
//! Defaults reproduce the documented thresholds. Every value can be
//! overridden from a TOML file or from `GOVERNOR_*` environment variables:
//!
//! ```toml
//! queue_expiry_ms = 30000
//! module_load_timeout_ms = 10000
//! primary_dependency = "supabase"
//!
//! [emergency]
//! emergency_threshold = 90
//! recovery_threshold = 30
//!
//! [breaker]
//! failure_threshold = 5
//!
//! [[tiers]]
//! threshold = 0
//! max_concurrent_requests = 10
//! request_timeout_ms = 30000
//! retry_delay_ms = 1000
//! module_retry_budget = 3
//! ```

use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

use crate::breaker::BreakerConfig;
use crate::degradation::{DegradationTable, DegradationTier};
use crate::error::{ConfigError, ConfigResult};
use crate::orchestrator::EmergencyConfig;
use crate::pressure::PressureConfig;

/// Default dependency reported as `breakerState` in status snapshots.
pub const DEFAULT_PRIMARY_DEPENDENCY: &str = "backend";

/// Complete configuration for a [`crate::ResourceGovernor`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct GovernorConfig {
    /// Milliseconds a queued request may wait before it is rejected.
    pub queue_expiry_ms: u64,
    /// Per-attempt timeout for deferred module loads.
    pub module_load_timeout_ms: u64,
    /// Dependency whose breaker is surfaced as `breakerState`.
    pub primary_dependency: String,
    pub pressure: PressureConfig,
    pub breaker: BreakerConfig,
    pub emergency: EmergencyConfig,
    pub tiers: Vec<DegradationTier>,
}

impl Default for GovernorConfig {
    fn default() -> Self {
        Self {
            queue_expiry_ms: 30_000,
            module_load_timeout_ms: 10_000,
            primary_dependency: DEFAULT_PRIMARY_DEPENDENCY.to_string(),
            pressure: PressureConfig::default(),
            breaker: BreakerConfig::default(),
            emergency: EmergencyConfig::default(),
            tiers: DegradationTable::default_tiers(),
        }
    }
}

impl GovernorConfig {
    /// Parse a TOML document. Missing fields take their defaults.
    pub fn from_toml_str(document: &str) -> ConfigResult<Self> {
        let config: Self = toml::from_str(document)?;
        config.validate()?;
        Ok(config)
    }

    /// Read and parse a TOML file.
    pub fn from_file(path: impl AsRef<Path>) -> ConfigResult<Self> {
        let path = path.as_ref();
        let document = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_toml_str(&document)
    }

    /// Defaults with environment overrides applied.
    pub fn from_env() -> ConfigResult<Self> {
        let mut config = Self::default();
        config.apply_env_overrides();
        config.validate()?;
        Ok(config)
    }

    /// Apply `GOVERNOR_*` environment variables on top of this config.
    ///
    /// - `GOVERNOR_EMERGENCY_THRESHOLD`: pressure entering emergency (default: 90)
    /// - `GOVERNOR_RECOVERY_THRESHOLD`: pressure leaving emergency (default: 30)
    /// - `GOVERNOR_SAMPLE_INTERVAL_MS`: sampling cadence (default: 5000)
    /// - `GOVERNOR_QUEUE_EXPIRY_MS`: queue horizon (default: 30000)
    /// - `GOVERNOR_FAILURE_THRESHOLD`: failures before a breaker opens (default: 5)
    /// - `GOVERNOR_RECOVERY_TIMEOUT_MS`: breaker cooldown (default: 30000)
    /// - `GOVERNOR_MODULE_LOAD_TIMEOUT_MS`: per-attempt module timeout (default: 10000)
    /// - `GOVERNOR_PRIMARY_DEPENDENCY`: breaker reported in status
    ///
    /// Unparsable values are ignored.
    pub fn apply_env_overrides(&mut self) {
        self.apply_overrides(|key| std::env::var(key).ok());
    }

    /// Apply overrides from any key lookup; `apply_env_overrides` uses the
    /// process environment.
    pub fn apply_overrides<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(v) = parse_var::<f64, _>(&lookup, "GOVERNOR_EMERGENCY_THRESHOLD") {
            self.emergency.emergency_threshold = v;
        }
        if let Some(v) = parse_var::<f64, _>(&lookup, "GOVERNOR_RECOVERY_THRESHOLD") {
            self.emergency.recovery_threshold = v;
        }
        if let Some(v) = parse_var::<u64, _>(&lookup, "GOVERNOR_SAMPLE_INTERVAL_MS").filter(|v| *v > 0)
        {
            self.pressure.sample_interval_ms = v;
        }
        if let Some(v) = parse_var::<u64, _>(&lookup, "GOVERNOR_QUEUE_EXPIRY_MS").filter(|v| *v > 0) {
            self.queue_expiry_ms = v;
        }
        if let Some(v) = parse_var::<u32, _>(&lookup, "GOVERNOR_FAILURE_THRESHOLD").filter(|v| *v > 0)
        {
            self.breaker.failure_threshold = v;
        }
        if let Some(v) = parse_var::<u64, _>(&lookup, "GOVERNOR_RECOVERY_TIMEOUT_MS") {
            self.breaker.recovery_timeout_ms = v;
        }
        if let Some(v) =
            parse_var::<u64, _>(&lookup, "GOVERNOR_MODULE_LOAD_TIMEOUT_MS").filter(|v| *v > 0)
        {
            self.module_load_timeout_ms = v;
        }
        if let Some(v) = lookup("GOVERNOR_PRIMARY_DEPENDENCY").filter(|v| !v.trim().is_empty()) {
            self.primary_dependency = v.trim().to_string();
        }
    }

    /// Reject inconsistent configuration.
    pub fn validate(&self) -> ConfigResult<()> {
        self.emergency.validate()?;
        DegradationTable::new(self.tiers.clone())?;
        if self.queue_expiry_ms == 0 {
            return Err(ConfigError::invalid("queue_expiry_ms must be non-zero"));
        }
        if self.module_load_timeout_ms == 0 {
            return Err(ConfigError::invalid("module_load_timeout_ms must be non-zero"));
        }
        if self.pressure.sample_interval_ms == 0 {
            return Err(ConfigError::invalid("pressure.sample_interval_ms must be non-zero"));
        }
        if self.breaker.failure_threshold == 0 || self.breaker.success_threshold == 0 {
            return Err(ConfigError::invalid(
                "breaker failure_threshold and success_threshold must be at least 1",
            ));
        }
        if self.primary_dependency.trim().is_empty() {
            return Err(ConfigError::invalid("primary_dependency must not be empty"));
        }
        Ok(())
    }

    /// The validated degradation table.
    pub fn table(&self) -> ConfigResult<DegradationTable> {
        DegradationTable::new(self.tiers.clone())
    }

    pub fn queue_expiry(&self) -> Duration {
        Duration::from_millis(self.queue_expiry_ms)
    }

    pub fn module_load_timeout(&self) -> Duration {
        Duration::from_millis(self.module_load_timeout_ms)
    }

    /// Render as TOML.
    pub fn to_toml_string(&self) -> ConfigResult<String> {
        Ok(toml::to_string_pretty(self)?)
    }
}

fn parse_var<T, F>(lookup: &F, key: &str) -> Option<T>
where
    T: std::str::FromStr,
    F: Fn(&str) -> Option<String>,
{
    lookup(key).and_then(|v| v.trim().parse::<T>().ok())
}
