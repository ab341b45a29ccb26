use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use governor_monitor::{load_config, run_simulation, sample_status, Cli, Command};
use resource_governor::SystemMemoryProbe;
use tracing::info;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .init();

    let cli = Cli::parse();
    match cli.command {
        Command::Config(args) => {
            let config = load_config(args.config.as_deref())?;
            print!("{}", config.to_toml_string().context("Failed to render config")?);
        }
        Command::Simulate(args) => {
            let config = load_config(args.source.config.as_deref())?;
            let report = run_simulation(config, &args, Arc::new(SystemMemoryProbe::new())).await?;
            for notification in &report.notifications {
                println!(
                    "{} {}",
                    notification.event_name(),
                    serde_json::to_string(notification)?
                );
            }
            println!("{}", serde_json::to_string_pretty(&report.status)?);
            info!(
                succeeded = report.succeeded,
                failed = report.failed,
                rejected = report.rejected,
                expired = report.expired,
                peak_active = report.peak_active,
                "Simulation summary"
            );
        }
        Command::Status(args) => {
            let config = load_config(args.config.as_deref())?;
            let status = sample_status(config, Arc::new(SystemMemoryProbe::new()))?;
            println!("{}", serde_json::to_string_pretty(&status)?);
        }
    }

    Ok(())
}
