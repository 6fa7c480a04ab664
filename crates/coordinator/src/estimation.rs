//! Offset estimation over a finished session
//!
//! Mode A on the leading fraction, Mode B start alignment, corrected / aligned
//! artifacts and the report. Shared by the master session and the offline CLI command.

use std::path::PathBuf;

use contracts::{
    EstimationConfig, MergeSummary, MergedRecord, NodeRole, OffsetEstimate, OutputConfig,
    ReportArtifacts, SyncError, SyncReport, TimeUnit,
};
use dispatcher::{report_timestamp, write_binary, write_report, write_text, ArtifactNames};
use sync_engine::OffsetEstimator;
use tracing::{info, instrument, warn};

/// Everything the estimation step consumes
#[derive(Debug, Clone)]
pub struct EstimationInputs {
    pub sequence_id: u64,
    pub master_trigger_timestamp_ns: u64,
    pub slave_trigger_timestamp_ns: u64,
    /// Local merged records
    pub master: Vec<MergedRecord>,
    /// Peer timestamps as received
    pub peer: Vec<u64>,
    /// `peer` is already the leading fraction of the peer sequence
    pub peer_is_partial: bool,
    pub merge: MergeSummary,
    /// Artifacts produced before estimation (merged stream, peer sample)
    pub artifacts: ReportArtifacts,
}

/// Written report and where it went
#[derive(Debug, Clone)]
pub struct EstimationOutput {
    pub report: SyncReport,
    pub report_text: PathBuf,
    pub report_json: PathBuf,
}

/// Run both estimation modes and write every derived artifact under `output.dir`
///
/// Insufficient data only omits the estimate; the report is still written.
#[instrument(
    name = "session_estimation",
    skip_all,
    fields(
        sequence_id = inputs.sequence_id,
        master = inputs.master.len(),
        peer = inputs.peer.len(),
        partial = inputs.peer_is_partial
    )
)]
pub fn estimate_session(
    estimation: &EstimationConfig,
    time_unit: TimeUnit,
    output: &OutputConfig,
    inputs: EstimationInputs,
) -> Result<EstimationOutput, SyncError> {
    std::fs::create_dir_all(&output.dir)?;

    let estimator = OffsetEstimator::new(estimation, time_unit);
    let names = ArtifactNames::new(NodeRole::Master, inputs.sequence_id);
    let master_timestamps: Vec<u64> = inputs.master.iter().map(|r| r.timestamp).collect();
    let mut artifacts = inputs.artifacts;

    let result = if inputs.peer_is_partial {
        estimator.estimate_prefix(estimator.leading_fraction(&master_timestamps), &inputs.peer)
    } else {
        estimator.estimate(&master_timestamps, &inputs.peer)
    };
    let (estimate, estimate_note) = match result {
        Ok(estimate) => {
            observability::record_offset_estimate(&estimate);
            write_corrected(
                &estimator,
                output,
                &names,
                &inputs.master,
                &master_timestamps,
                &estimate,
                &mut artifacts,
            )?;
            info!(
                mean_offset_ns = estimate.mean_offset_ns,
                std_dev_ns = estimate.std_dev_ns,
                quality = %estimate.quality(),
                samples = estimate.sample_count,
                "offset estimated"
            );
            (Some(estimate), None)
        }
        Err(err) if err.is_degraded_only() => (None, Some(err.to_string())),
        Err(err) => return Err(err),
    };

    let alignment = match estimator.align_start(&master_timestamps, &inputs.peer) {
        Ok((alignment, _)) => {
            let aligned: Vec<MergedRecord> = inputs
                .master
                .iter()
                .filter(|r| r.timestamp >= alignment.sync_point)
                .copied()
                .collect();
            let name = names.aligned_binary();
            write_binary(&output.dir.join(&name), &aligned, output.layout)?;
            artifacts.aligned_binary = Some(name);
            Some(alignment)
        }
        Err(err) => {
            warn!(error = %err, "start alignment skipped");
            None
        }
    };

    let report = SyncReport {
        sequence_id: inputs.sequence_id,
        created_at: report_timestamp(),
        master_trigger_timestamp_ns: inputs.master_trigger_timestamp_ns,
        slave_trigger_timestamp_ns: inputs.slave_trigger_timestamp_ns,
        fraction: estimation.fraction,
        time_unit: time_unit.as_str().to_string(),
        estimate,
        estimate_note,
        alignment,
        master_record_count: inputs.master.len() as u64,
        peer_record_count: inputs.peer.len() as u64,
        merge: inputs.merge,
        artifacts,
    };
    let (report_text, report_json) = write_report(&output.dir, &report)?;

    Ok(EstimationOutput {
        report,
        report_text,
        report_json,
    })
}

fn write_corrected(
    estimator: &OffsetEstimator,
    output: &OutputConfig,
    names: &ArtifactNames,
    master: &[MergedRecord],
    timestamps: &[u64],
    estimate: &OffsetEstimate,
    artifacts: &mut ReportArtifacts,
) -> Result<(), SyncError> {
    let corrected: Vec<MergedRecord> = master
        .iter()
        .zip(estimator.apply_offset(timestamps, estimate))
        .map(|(record, timestamp)| MergedRecord {
            timestamp,
            ..*record
        })
        .collect();

    let binary = names.corrected_binary();
    write_binary(&output.dir.join(&binary), &corrected, output.layout)?;
    artifacts.corrected_binary = Some(binary);

    if output.write_text {
        let text = names.corrected_text();
        let header = [
            "tagsync corrected stream".to_string(),
            format!("sequence_id: {}", names.sequence_id()),
            format!("time_unit: {}", estimator.time_unit.as_str()),
            format!("offset_applied_ns: {:.3}", estimate.mean_offset_ns),
        ];
        write_text(&output.dir.join(&text), &corrected, &header)?;
        artifacts.corrected_text = Some(text);
    }
    Ok(())
}
