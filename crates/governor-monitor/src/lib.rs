//! Operator tooling for the resource governor.
//!
//! Every subcommand builds a fresh [`ResourceGovernor`] from a TOML file (or
//! the defaults) with `GOVERNOR_*` environment overrides applied on top.

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use futures::future::join_all;
use resource_governor::{
    EmergencyNotification, GovernorConfig, GovernorError, GovernorStatus, MemoryProbe,
    ResourceGovernor,
};
use serde::Serialize;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

/// Command-line arguments
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Print the effective configuration as TOML
    Config(ConfigArgs),
    /// Run synthetic operations through a governor and report the outcome
    Simulate(SimulateArgs),
    /// Take one pressure sample and print the status snapshot as JSON
    Status(ConfigArgs),
}

#[derive(Args, Debug, Clone, Default)]
pub struct ConfigArgs {
    /// Path to a governor TOML file (defaults apply when omitted)
    #[arg(long)]
    pub config: Option<PathBuf>,
}

#[derive(Args, Debug, Clone)]
pub struct SimulateArgs {
    #[command(flatten)]
    pub source: ConfigArgs,

    /// Number of synthetic operations to submit
    #[arg(long, default_value_t = 50)]
    pub requests: usize,

    /// Fraction of operations that fail, between 0 and 1
    #[arg(long, default_value_t = 0.0)]
    pub failure_rate: f64,

    /// Simulated round-trip time per operation
    #[arg(long, default_value_t = 50)]
    pub latency_ms: u64,

    /// Cap every tier's concurrency at this value
    #[arg(long)]
    pub max_concurrency: Option<usize>,

    /// Seed for the failure pattern
    #[arg(long, default_value_t = 7)]
    pub seed: u64,
}

/// Load `path` if given, otherwise the defaults, then apply the environment.
pub fn load_config(path: Option<&Path>) -> Result<GovernorConfig> {
    let mut config = match path {
        Some(path) => GovernorConfig::from_file(path)
            .with_context(|| format!("Failed to load governor config from {}", path.display()))?,
        None => GovernorConfig::default(),
    };
    config.apply_env_overrides();
    config
        .validate()
        .context("Environment overrides produced an invalid config")?;
    Ok(config)
}

/// Outcome of a simulation run.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SimulationReport {
    pub requests: usize,
    pub succeeded: usize,
    pub failed: usize,
    pub rejected: usize,
    pub expired: usize,
    pub peak_active: usize,
    pub notifications: Vec<EmergencyNotification>,
    pub status: GovernorStatus,
}

#[derive(Default)]
struct Tally {
    succeeded: usize,
    failed: usize,
    rejected: usize,
    expired: usize,
}

impl Tally {
    fn record(&mut self, outcome: &Result<usize, GovernorError<String>>) {
        match outcome {
            Ok(_) => self.succeeded += 1,
            Err(GovernorError::CircuitOpen { .. }) => self.rejected += 1,
            Err(GovernorError::RequestExpired { .. }) => self.expired += 1,
            Err(GovernorError::RequestTimeout { .. }) | Err(GovernorError::Operation(_)) => {
                self.failed += 1
            }
        }
    }
}

/// Deterministic failure pattern.
struct FailurePattern {
    state: u64,
    rate: f64,
}

impl FailurePattern {
    fn new(seed: u64, rate: f64) -> Self {
        Self {
            state: seed,
            rate: rate.clamp(0.0, 1.0),
        }
    }

    fn next_fails(&mut self) -> bool {
        self.state = self
            .state
            .wrapping_mul(6_364_136_223_846_793_005)
            .wrapping_add(1_442_695_040_888_963_407);
        let unit = (self.state >> 11) as f64 / (1u64 << 53) as f64;
        unit < self.rate
    }
}

/// Submit `args.requests` synthetic operations against the primary
/// dependency, all at once, while the sampler runs.
pub async fn run_simulation(
    mut config: GovernorConfig,
    args: &SimulateArgs,
    probe: Arc<dyn MemoryProbe>,
) -> Result<SimulationReport> {
    if let Some(cap) = args.max_concurrency {
        anyhow::ensure!(cap > 0, "--max-concurrency must be at least 1");
        for tier in &mut config.tiers {
            tier.policy.max_concurrent_requests = tier.policy.max_concurrent_requests.min(cap);
        }
    }

    let governor = ResourceGovernor::with_probe(config, probe)
        .context("Failed to build resource governor")?
        .shared();
    let shutdown = CancellationToken::new();
    let sampler = governor.start(shutdown.clone());

    let mut pattern = FailurePattern::new(args.seed, args.failure_rate);
    let latency = Duration::from_millis(args.latency_ms);
    info!(
        requests = args.requests,
        failure_rate = args.failure_rate,
        latency_ms = args.latency_ms,
        "Simulation starting"
    );

    let tally = Arc::new(Mutex::new(Tally::default()));
    let operations = (0..args.requests).map(|i| {
        let governor = Arc::clone(&governor);
        let tally = Arc::clone(&tally);
        let fails = pattern.next_fails();
        async move {
            let outcome = governor
                .submit_primary(|| async move {
                    tokio::time::sleep(latency).await;
                    if fails {
                        Err(format!("synthetic failure #{i}"))
                    } else {
                        Ok(i)
                    }
                })
                .await;
            if let Err(e) = &outcome {
                debug!(op = i, code = e.code(), "Synthetic operation did not succeed");
            }
            tally
                .lock()
                .unwrap_or_else(std::sync::PoisonError::into_inner)
                .record(&outcome);
        }
    });
    join_all(operations).await;

    shutdown.cancel();
    sampler.await.context("Sampler task panicked")?;

    let counters = governor.counters();
    let tally = std::mem::take(
        &mut *tally
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner),
    );
    let report = SimulationReport {
        requests: args.requests,
        succeeded: tally.succeeded,
        failed: tally.failed,
        rejected: tally.rejected,
        expired: tally.expired,
        peak_active: counters.peak_active,
        notifications: governor.notifications().recent(),
        status: governor.status(),
    };
    info!(
        succeeded = report.succeeded,
        failed = report.failed,
        rejected = report.rejected,
        expired = report.expired,
        "Simulation finished"
    );
    Ok(report)
}

/// Status of a fresh governor after one sample.
pub fn sample_status(config: GovernorConfig, probe: Arc<dyn MemoryProbe>) -> Result<GovernorStatus> {
    let governor =
        ResourceGovernor::with_probe(config, probe).context("Failed to build resource governor")?;
    governor.tick();
    Ok(governor.status())
}
