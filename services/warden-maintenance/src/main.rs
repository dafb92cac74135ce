//! Warden Maintenance Runner
//!
//! Runs the engine's maintenance pass on a fixed interval: anchoring newly
//! committed ledger entries, pruning velocity history and expiring stale
//! approvals. Every task is idempotent, so restarting the runner or running
//! two of them side by side is safe.
//!
//! # Usage
//!
//! ```bash
//! # Run forever with defaults (every 60 seconds)
//! warden-maintenance
//!
//! # Single pass, report printed as JSON
//! warden-maintenance --once
//!
//! # Custom config with environment overrides
//! WARDEN__MAINTENANCE__INTERVAL_SECS=30 warden-maintenance --config /etc/warden/warden.toml
//! ```

mod config;

use std::future::Future;
use std::time::Duration;

use clap::Parser;
use tokio::signal;
use tokio::time::MissedTickBehavior;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use warden_engine::{LogFormat, LoggingConfig, Warden, WardenConfig};

// =============================================================================
// CLI Arguments
// =============================================================================

/// Warden maintenance runner - anchoring, velocity pruning and approval expiry
#[derive(Parser, Debug)]
#[command(name = "warden-maintenance")]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Path to configuration file (TOML, JSON, or YAML)
    #[arg(short, long, env = "WARDEN_CONFIG")]
    config: Option<String>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, env = "WARDEN_LOG_LEVEL")]
    log_level: Option<String>,

    /// Log format (json, pretty)
    #[arg(long, env = "WARDEN_LOG_FORMAT")]
    log_format: Option<LogFormat>,

    /// Seconds between maintenance runs
    #[arg(short, long, env = "WARDEN_INTERVAL_SECS")]
    interval_secs: Option<u64>,

    /// Run a single pass, print the report and exit
    #[arg(long)]
    once: bool,
}

impl Args {
    /// Apply command-line overrides on top of the loaded configuration
    fn apply(&self, config: &mut WardenConfig) -> anyhow::Result<()> {
        if let Some(level) = &self.log_level {
            config.logging.level = level.clone();
        }
        if let Some(format) = self.log_format {
            config.logging.format = format;
        }
        if let Some(secs) = self.interval_secs {
            config.maintenance.interval_secs = secs;
        }
        config.validate()?;
        Ok(())
    }
}

// =============================================================================
// Main Entry Point
// =============================================================================

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let mut warden_config = config::load(args.config.as_deref())?;
    args.apply(&mut warden_config)?;

    init_logging(&warden_config.logging)?;

    tracing::info!(
        version = env!("CARGO_PKG_VERSION"),
        interval_secs = warden_config.maintenance.interval_secs,
        anchor_enabled = warden_config.maintenance.anchor_enabled,
        "Starting Warden maintenance runner"
    );

    let period = warden_config.maintenance.interval();
    let warden = Warden::new(warden_config)?;

    if args.once {
        let report = warden.run_maintenance().await;
        println!("{}", serde_json::to_string_pretty(&report)?);
        if !report.is_clean() {
            anyhow::bail!("{} maintenance task(s) failed", report.failures.len());
        }
        return Ok(());
    }

    let runs = run_loop(&warden, period, shutdown_signal()).await;

    tracing::info!(runs = runs, "Maintenance runner stopped");

    Ok(())
}

// =============================================================================
// Initialization Functions
// =============================================================================

/// Initialize tracing/logging
fn init_logging(config: &LoggingConfig) -> anyhow::Result<()> {
    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(&config.level));

    let subscriber = tracing_subscriber::registry().with(env_filter);

    match config.format {
        LogFormat::Json => {
            subscriber
                .with(fmt::layer().json().with_target(true))
                .try_init()?;
        }
        LogFormat::Pretty => {
            subscriber
                .with(fmt::layer().pretty().with_target(true))
                .try_init()?;
        }
    }

    Ok(())
}

// =============================================================================
// Scheduling
// =============================================================================

/// Run maintenance every `period` until `shutdown` resolves
///
/// The first pass starts immediately. A pass that is already running when
/// the shutdown signal arrives is finished before the loop exits. Returns
/// the number of completed passes.
async fn run_loop<F>(warden: &Warden, period: Duration, shutdown: F) -> usize
where
    F: Future<Output = ()>,
{
    let mut ticker = tokio::time::interval(period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    tokio::pin!(shutdown);

    let mut runs = 0;
    loop {
        tokio::select! {
            biased;
            _ = &mut shutdown => break,
            _ = ticker.tick() => {
                let report = warden.run_maintenance().await;
                runs += 1;
                if !report.is_clean() {
                    for failure in &report.failures {
                        tracing::warn!(
                            task = %failure.task,
                            error_code = %failure.error_code,
                            "Maintenance task will be retried on the next pass"
                        );
                    }
                }
            }
        }
    }
    runs
}

// =============================================================================
// Graceful Shutdown
// =============================================================================

/// Wait for shutdown signal (Ctrl+C or SIGTERM)
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(err) = signal::ctrl_c().await {
            tracing::error!(error = %err, "Failed to install Ctrl+C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(err) => {
                tracing::error!(error = %err, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            tracing::info!("Received Ctrl+C, finishing current pass...");
        }
        _ = terminate => {
            tracing::info!("Received SIGTERM, finishing current pass...");
        }
    }
}

// =============================================================================
// Tests
// =============================================================================
