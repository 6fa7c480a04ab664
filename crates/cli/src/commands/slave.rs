//! `slave` command implementation.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use contracts::{NodeBlueprint, NodeRole};
use coordinator::SlaveCoordinator;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn, Instrument};

use super::{build_instrument, init_metrics, load_blueprint, shutdown_signal};
use crate::cli::SlaveArgs;

/// Execute the `slave` command
pub async fn run_slave(args: &SlaveArgs) -> Result<()> {
    info!(config = %args.config.display(), "Loading configuration");

    let blueprint = load_blueprint(&args.config, NodeRole::Slave, args.output.as_ref())?;
    info!(
        node = %blueprint.node.name,
        master = %blueprint.network.master_host,
        channels = ?blueprint.acquisition.channels,
        "Configuration loaded"
    );

    let span = observability::node_span(blueprint.role(), &blueprint.node.name);
    serve_node(blueprint, args).instrument(span).await
}

/// Bind the slave and serve until a signal, the timeout or a serve error
async fn serve_node(blueprint: NodeBlueprint, args: &SlaveArgs) -> Result<()> {
    init_metrics(args.metrics_port)?;

    let instrument = build_instrument(&blueprint.instrument);
    let slave = Arc::new(
        SlaveCoordinator::bind(blueprint, instrument)
            .await
            .context("Failed to start slave node")?,
    );
    info!(
        command = %slave.command_addr(),
        trigger = %slave.trigger_addr(),
        "Slave listening"
    );

    let shutdown = CancellationToken::new();
    let mut serve = tokio::spawn(Arc::clone(&slave).serve(shutdown.clone()).in_current_span());

    let timeout = async {
        if args.timeout == 0 {
            std::future::pending::<()>().await
        } else {
            tokio::time::sleep(Duration::from_secs(args.timeout)).await
        }
    };

    let served = tokio::select! {
        result = &mut serve => Some(result),
        _ = shutdown_signal() => {
            warn!("Received shutdown signal, stopping slave...");
            None
        }
        _ = timeout => {
            info!(timeout_secs = args.timeout, "Serve timeout reached");
            None
        }
    };

    let served = match served {
        Some(result) => result,
        None => {
            shutdown.cancel();
            serve.await
        }
    };

    let status = slave.status();
    info!(
        state = ?status.state,
        last_sequence = ?status.sequence_id,
        last_completed = ?status.last_completed,
        "Slave finished"
    );

    match served.context("Slave serve task panicked")? {
        Ok(()) => Ok(()),
        Err(e) => {
            error!(error = %e, "Slave stopped with error");
            Err(e.into())
        }
    }
}
