//! OffsetEstimate / SyncReport - Estimation outputs
//!
//! Immutable once computed; one of each per completed session at most.

use serde::{Deserialize, Serialize};
use std::fmt;

use crate::MergeSummary;

/// Mode A result: clock offset of the slave relative to the master
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct OffsetEstimate {
    /// Mean of accepted candidates (ns)
    pub mean_offset_ns: f64,
    /// Minimum candidate (ns)
    pub min_offset_ns: f64,
    /// Maximum candidate (ns)
    pub max_offset_ns: f64,
    /// Sample standard deviation (ns)
    pub std_dev_ns: f64,
    /// 0-100
    pub quality_percent: f64,
    /// Accepted candidates
    pub sample_count: usize,
}

impl OffsetEstimate {
    pub fn quality(&self) -> QualityLabel {
        QualityLabel::from_percent(self.quality_percent)
    }
}

/// Quality assessment
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QualityLabel {
    Excellent,
    Good,
    Fair,
    Poor,
}

impl QualityLabel {
    pub fn from_percent(quality_percent: f64) -> Self {
        if quality_percent >= 90.0 {
            QualityLabel::Excellent
        } else if quality_percent >= 70.0 {
            QualityLabel::Good
        } else if quality_percent >= 50.0 {
            QualityLabel::Fair
        } else {
            QualityLabel::Poor
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            QualityLabel::Excellent => "excellent",
            QualityLabel::Good => "good",
            QualityLabel::Fair => "fair",
            QualityLabel::Poor => "poor",
        }
    }
}

impl fmt::Display for QualityLabel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Mode B result: common start point of both sequences
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct StartAlignment {
    /// max(min(slave), min(master)), instrument units
    pub sync_point: u64,
    pub master_start: u64,
    pub slave_start: u64,
    /// Master values below the sync point
    pub removed_count: usize,
    /// Master values kept
    pub kept_count: usize,
}

/// Artifact file names written for a session (relative to the output dir)
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReportArtifacts {
    pub merged_binary: Option<String>,
    pub merged_text: Option<String>,
    pub peer_sample: Option<String>,
    pub corrected_binary: Option<String>,
    pub corrected_text: Option<String>,
    pub aligned_binary: Option<String>,
}

/// Synchronization report, created once per completed session
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncReport {
    pub sequence_id: u64,
    /// RFC 3339
    pub created_at: String,
    pub master_trigger_timestamp_ns: u64,
    pub slave_trigger_timestamp_ns: u64,
    /// Leading fraction used for Mode A
    pub fraction: f64,
    /// Instrument time unit name
    pub time_unit: String,
    /// Absent when the estimator had insufficient data
    pub estimate: Option<OffsetEstimate>,
    /// Why the estimate is absent
    pub estimate_note: Option<String>,
    pub alignment: Option<StartAlignment>,
    pub master_record_count: u64,
    pub peer_record_count: u64,
    pub merge: MergeSummary,
    pub artifacts: ReportArtifacts,
}
