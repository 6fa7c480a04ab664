//! Synchronization report and artifact naming

use std::fmt::{self, Write as _};
use std::fs;
use std::path::{Path, PathBuf};

use contracts::SyncReport;
use tracing::{info, instrument};

use crate::error::Result;

/// Artifact file names of one session
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArtifactNames {
    role: String,
    sequence_id: u64,
}

impl ArtifactNames {
    pub fn new(role: impl fmt::Display, sequence_id: u64) -> Self {
        Self {
            role: role.to_string(),
            sequence_id,
        }
    }

    pub fn sequence_id(&self) -> u64 {
        self.sequence_id
    }

    pub fn merged_binary(&self) -> String {
        format!("{}_{}_merged.bin", self.role, self.sequence_id)
    }

    pub fn merged_text(&self) -> String {
        format!("{}_{}_merged.txt", self.role, self.sequence_id)
    }

    /// Leading fraction exported for the peer
    pub fn partial_export(&self) -> String {
        format!("{}_{}_partial.bin", self.role, self.sequence_id)
    }

    /// Sample received from the peer
    pub fn peer_sample(&self, full: bool) -> String {
        let kind = if full { "full" } else { "partial" };
        format!("peer_{}_{kind}.bin", self.sequence_id)
    }

    pub fn corrected_binary(&self) -> String {
        format!("{}_{}_corrected.bin", self.role, self.sequence_id)
    }

    pub fn corrected_text(&self) -> String {
        format!("{}_{}_corrected.txt", self.role, self.sequence_id)
    }

    pub fn aligned_binary(&self) -> String {
        format!("{}_{}_aligned.bin", self.role, self.sequence_id)
    }

    pub fn report_text(&self) -> String {
        format!("sync_report_{}.txt", self.sequence_id)
    }

    pub fn report_json(&self) -> String {
        format!("sync_report_{}.json", self.sequence_id)
    }
}

/// RFC 3339 creation time for a report
pub fn report_timestamp() -> String {
    chrono::Utc::now().to_rfc3339_opts(chrono::SecondsFormat::Millis, true)
}

/// Render the plain-text report
pub fn render_text(report: &SyncReport) -> String {
    let mut out = String::new();
    // Writing to a String cannot fail
    let _ = write_text_report(&mut out, report);
    out
}

fn write_text_report(out: &mut String, report: &SyncReport) -> fmt::Result {
    writeln!(out, "=== Synchronization Report ===")?;
    writeln!(out, "Sequence ID:          {}", report.sequence_id)?;
    writeln!(out, "Created:              {}", report.created_at)?;
    writeln!(out, "Time unit:            {}", report.time_unit)?;
    writeln!(out, "Master trigger (ns):  {}", report.master_trigger_timestamp_ns)?;
    writeln!(out, "Slave trigger (ns):   {}", report.slave_trigger_timestamp_ns)?;
    if report.master_trigger_timestamp_ns > 0 && report.slave_trigger_timestamp_ns > 0 {
        let skew = i128::from(report.slave_trigger_timestamp_ns)
            - i128::from(report.master_trigger_timestamp_ns);
        writeln!(out, "Trigger skew (ns):    {skew}")?;
    }
    writeln!(out)?;

    writeln!(
        out,
        "--- Offset Estimate (Mode A, leading {:.1}%) ---",
        report.fraction * 100.0
    )?;
    match &report.estimate {
        Some(estimate) => {
            writeln!(out, "Mean offset:          {:.3} ns", estimate.mean_offset_ns)?;
            writeln!(
                out,
                "Min / Max:            {:.3} / {:.3} ns",
                estimate.min_offset_ns, estimate.max_offset_ns
            )?;
            writeln!(out, "Std dev:              {:.3} ns", estimate.std_dev_ns)?;
            writeln!(out, "Samples:              {}", estimate.sample_count)?;
            writeln!(
                out,
                "Quality:              {:.2}% ({})",
                estimate.quality_percent,
                estimate.quality()
            )?;
        }
        None => {
            let note = report.estimate_note.as_deref().unwrap_or("no estimate");
            writeln!(out, "Unavailable:          {note}")?;
        }
    }
    writeln!(out)?;

    writeln!(out, "--- Start Alignment (Mode B) ---")?;
    match &report.alignment {
        Some(alignment) => {
            writeln!(out, "Sync point:           {}", alignment.sync_point)?;
            writeln!(out, "Master start:         {}", alignment.master_start)?;
            writeln!(out, "Slave start:          {}", alignment.slave_start)?;
            writeln!(
                out,
                "Removed / kept:       {} / {}",
                alignment.removed_count, alignment.kept_count
            )?;
        }
        None => writeln!(out, "Unavailable")?,
    }
    writeln!(out)?;

    let merge = &report.merge;
    writeln!(out, "--- Merge ---")?;
    writeln!(out, "Master records:       {}", report.master_record_count)?;
    writeln!(out, "Peer records:         {}", report.peer_record_count)?;
    writeln!(out, "Windows merged:       {}", merge.windows_merged)?;
    writeln!(out, "Windows stalled:      {}", merge.windows_stalled)?;
    writeln!(out, "Trailing dropped:     {}", merge.trailing_windows_dropped)?;
    writeln!(out, "Late blocks dropped:  {}", merge.late_blocks_dropped)?;
    writeln!(out, "Overflow dropped:     {}", merge.overflow_blocks_dropped)?;
    writeln!(out, "Order violations:     {}", merge.order_violations)?;
    if !merge.closed_channels.is_empty() {
        writeln!(out, "Closed channels:      {:?}", merge.closed_channels)?;
    }
    for (channel, message) in &merge.channel_failures {
        writeln!(out, "Channel {channel} failed:     {message}")?;
    }
    writeln!(out)?;

    writeln!(out, "--- Artifacts ---")?;
    let artifacts = &report.artifacts;
    for (label, name) in [
        ("merged binary", &artifacts.merged_binary),
        ("merged text", &artifacts.merged_text),
        ("peer sample", &artifacts.peer_sample),
        ("corrected binary", &artifacts.corrected_binary),
        ("corrected text", &artifacts.corrected_text),
        ("aligned binary", &artifacts.aligned_binary),
    ] {
        if let Some(name) = name {
            writeln!(out, "{label:<22}{name}")?;
        }
    }
    Ok(())
}

/// Write `sync_report_<seq>.txt` and `sync_report_<seq>.json` into `dir`
#[instrument(name = "report_write", skip(report), fields(sequence_id = report.sequence_id))]
pub fn write_report(dir: &Path, report: &SyncReport) -> Result<(PathBuf, PathBuf)> {
    fs::create_dir_all(dir)?;
    let names = ArtifactNames::new("master", report.sequence_id);

    let text_path = dir.join(names.report_text());
    fs::write(&text_path, render_text(report))?;

    let json_path = dir.join(names.report_json());
    fs::write(&json_path, serde_json::to_string_pretty(report)?)?;

    info!(
        text = %text_path.display(),
        json = %json_path.display(),
        "sync report written"
    );
    Ok((text_path, json_path))
}
