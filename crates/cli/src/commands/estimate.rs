//! `estimate` command implementation - offline offset estimation between two files.

use anyhow::{Context, Result};
use contracts::{EstimationConfig, MergeSummary, OutputConfig, ReportArtifacts, TransferMode};
use coordinator::{estimate_session, EstimationInputs};
use tracing::info;

use crate::cli::EstimateArgs;
use crate::error::CliError;

/// Execute the `estimate` command
pub fn run_estimate(args: &EstimateArgs) -> Result<()> {
    if !(args.fraction > 0.0 && args.fraction <= 1.0) {
        return Err(CliError::invalid_argument(
            "fraction",
            format!("{} is outside (0, 1]", args.fraction),
        )
        .into());
    }

    let master = dispatcher::read_records(&args.master)
        .with_context(|| format!("Failed to read {}", args.master.display()))?;
    let peer = dispatcher::read_timestamps(&args.slave)
        .with_context(|| format!("Failed to read {}", args.slave.display()))?;

    info!(
        master = master.len(),
        slave = peer.len(),
        fraction = args.fraction,
        partial = args.partial,
        unit = args.unit.as_str(),
        "Estimating offset"
    );

    let estimation = EstimationConfig {
        fraction: args.fraction,
        transfer: if args.partial {
            TransferMode::Partial
        } else {
            TransferMode::Full
        },
        ..EstimationConfig::default()
    };
    let output = OutputConfig {
        dir: args.output.clone(),
        write_text: true,
        ..OutputConfig::default()
    };
    let inputs = EstimationInputs {
        sequence_id: args.sequence_id,
        master_trigger_timestamp_ns: 0,
        slave_trigger_timestamp_ns: 0,
        merge: MergeSummary {
            records_emitted: master.len() as u64,
            ..MergeSummary::default()
        },
        master,
        peer,
        peer_is_partial: args.partial,
        artifacts: ReportArtifacts {
            merged_binary: Some(args.master.display().to_string()),
            peer_sample: Some(args.slave.display().to_string()),
            ..ReportArtifacts::default()
        },
    };

    let result = estimate_session(&estimation, args.unit, &output, inputs)?;

    println!("{}", dispatcher::render_text(&result.report));
    println!("📄 Report: {}", result.report_text.display());
    Ok(())
}
