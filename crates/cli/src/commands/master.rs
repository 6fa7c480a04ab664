//! `master` command implementation.

use anyhow::{Context, Result};
use contracts::{NodeBlueprint, NodeRole};
use coordinator::MasterCoordinator;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn, Instrument};

use super::{build_instrument, init_metrics, load_blueprint, shutdown_signal};
use crate::cli::MasterArgs;
use crate::error::CliError;
use crate::pipeline::{RunnerConfig, SessionRunner};

/// Execute the `master` command
pub async fn run_master(args: &MasterArgs) -> Result<()> {
    info!(config = %args.config.display(), "Loading configuration");

    let blueprint = load_blueprint(&args.config, NodeRole::Master, args.output.as_ref())?;
    if args.sessions == 0 {
        return Err(CliError::invalid_argument("sessions", "must be at least 1").into());
    }
    if let Some(duration) = args.duration {
        if !(duration > 0.0 && duration.is_finite()) {
            return Err(
                CliError::invalid_argument("duration", format!("{duration} is not positive")).into(),
            );
        }
    }

    info!(
        node = %blueprint.node.name,
        slave = %blueprint.network.slave_host,
        channels = ?args.channels.as_ref().unwrap_or(&blueprint.acquisition.channels),
        sessions = args.sessions,
        "Configuration loaded"
    );

    if args.dry_run {
        info!("Dry run mode - configuration is valid, exiting");
        print_config_summary(&blueprint, args);
        return Ok(());
    }

    let span = observability::node_span(blueprint.role(), &blueprint.node.name);
    run_sessions(blueprint, args).instrument(span).await
}

/// Bind the master and run the requested sessions
async fn run_sessions(blueprint: NodeBlueprint, args: &MasterArgs) -> Result<()> {
    init_metrics(args.metrics_port)?;

    let instrument = build_instrument(&blueprint.instrument);
    let master = MasterCoordinator::bind(blueprint, instrument)
        .await
        .context("Failed to start master node")?;

    let cancel = CancellationToken::new();
    let signal_task = tokio::spawn({
        let cancel = cancel.clone();
        async move {
            tokio::select! {
                _ = shutdown_signal() => {
                    warn!("Received shutdown signal, stopping sessions...");
                    cancel.cancel();
                }
                _ = cancel.cancelled() => {}
            }
        }
    });

    let runner = SessionRunner::new(
        master,
        RunnerConfig {
            sessions: args.sessions,
            duration: args.duration,
            channels: args.channels.clone(),
            ..RunnerConfig::default()
        },
    );

    let stats = runner.run(&cancel).await;
    cancel.cancel();
    let _ = signal_task.await;
    runner.shutdown().await;

    info!(
        completed = stats.sessions_completed,
        failed = stats.sessions_failed(),
        duration_secs = stats.duration.as_secs_f64(),
        "Master finished"
    );
    stats.print_summary();

    if stats.sessions_failed() > 0 {
        return Err(CliError::SessionsFailed {
            failed: stats.sessions_failed(),
            total: stats.sessions_started,
        }
        .into());
    }
    Ok(())
}

/// Print configuration summary for dry-run mode
fn print_config_summary(blueprint: &NodeBlueprint, args: &MasterArgs) {
    let network = &blueprint.network;
    let acquisition = &blueprint.acquisition;

    println!("\n=== Configuration Summary ===\n");
    println!("Node:");
    println!("  Name: {}", blueprint.node.name);
    println!("  Bind: {}", network.bind_host);
    println!(
        "  Slave: {} (trigger {}, command {})",
        network.slave_host, network.trigger_port, network.command_port
    );
    println!(
        "  Master ports: status {}, notify {}, data {}",
        network.status_port, network.notify_port, network.data_port
    );

    println!("\nAcquisition:");
    println!(
        "  Channels: {:?}",
        args.channels.as_ref().unwrap_or(&acquisition.channels)
    );
    println!(
        "  Duration: {}s",
        args.duration.unwrap_or(acquisition.duration_seconds)
    );
    println!(
        "  Window: PWID {}ms, PPER {}ms",
        acquisition.pwid_ms,
        acquisition.pper().as_millis()
    );
    println!("  Sessions: {}", args.sessions);

    println!("\nEstimation:");
    println!("  Fraction: {}", blueprint.estimation.fraction);
    println!(
        "  Ratio band: [{}, {}]",
        blueprint.estimation.ratio_min, blueprint.estimation.ratio_max
    );
    println!("  Transfer: {:?}", blueprint.estimation.transfer);

    println!("\nOutput: {}", blueprint.output.dir.display());
    println!();
}
