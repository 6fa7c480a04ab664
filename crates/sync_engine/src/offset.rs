//! Clock offset estimation between the master and slave sequences.
//!
//! - Mode A: inter-arrival ratio filter, offset statistics over accepted pairs
//! - Mode B: start-point alignment (trims leading master data, no shift)
//! - Correction: shift a sequence by the mean offset, clamped at zero

use contracts::{EstimationConfig, OffsetEstimate, StartAlignment, SyncError, TimeUnit};
use observability::RunningStats;
use tracing::{debug, instrument, warn};

/// Offset estimator
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct OffsetEstimator {
    /// Leading fraction of each sequence used for estimation
    pub fraction: f64,
    /// Accepted interval ratio lower bound
    pub ratio_min: f64,
    /// Accepted interval ratio upper bound
    pub ratio_max: f64,
    /// Unit of the input timestamps
    pub time_unit: TimeUnit,
}

impl Default for OffsetEstimator {
    fn default() -> Self {
        Self::new(&EstimationConfig::default(), TimeUnit::default())
    }
}

impl OffsetEstimator {
    pub fn new(config: &EstimationConfig, time_unit: TimeUnit) -> Self {
        Self {
            fraction: config.fraction,
            ratio_min: config.ratio_min,
            ratio_max: config.ratio_max,
            time_unit,
        }
    }

    /// Number of leading samples used out of `len`
    ///
    /// `max(1, floor(len × fraction))`, never more than `len`.
    pub fn sample_len(&self, len: usize) -> usize {
        if len == 0 {
            return 0;
        }
        let n = (len as f64 * self.fraction).floor() as usize;
        n.max(1).min(len)
    }

    /// Leading fraction of a sequence
    pub fn leading_fraction<'a>(&self, sequence: &'a [u64]) -> &'a [u64] {
        &sequence[..self.sample_len(sequence.len())]
    }

    /// Mode A over the leading fraction of both full sequences
    pub fn estimate(&self, master: &[u64], slave: &[u64]) -> Result<OffsetEstimate, SyncError> {
        self.estimate_prefix(self.leading_fraction(master), self.leading_fraction(slave))
    }

    /// Mode A over samples that are already bounded (e.g. the received partial file)
    #[instrument(
        name = "offset_estimate",
        skip(self, master, slave),
        fields(master_len = master.len(), slave_len = slave.len())
    )]
    pub fn estimate_prefix(
        &self,
        master: &[u64],
        slave: &[u64],
    ) -> Result<OffsetEstimate, SyncError> {
        if master.is_empty() || slave.is_empty() {
            let err = SyncError::insufficient_data(format!(
                "empty sequence (master {}, slave {})",
                master.len(),
                slave.len()
            ));
            warn!(error = %err, "offset estimation skipped");
            return Err(err);
        }

        let n = master.len().min(slave.len());
        let mut stats = RunningStats::default();
        let mut rejected = 0usize;

        for i in 0..n.saturating_sub(1) {
            let master_delta = master[i + 1] as f64 - master[i] as f64;
            let slave_delta = slave[i + 1] as f64 - slave[i] as f64;
            if master_delta <= 0.0 {
                rejected += 1;
                continue;
            }
            let ratio = slave_delta / master_delta;
            if ratio < self.ratio_min || ratio > self.ratio_max {
                rejected += 1;
                continue;
            }
            let candidate = slave[i] as f64 - master[i] as f64;
            stats.push(self.time_unit.to_ns(candidate));
        }

        if stats.count() == 0 {
            let err = SyncError::insufficient_data(format!(
                "no offset candidate survived the ratio filter ({} pairs, {rejected} rejected)",
                n.saturating_sub(1)
            ));
            warn!(error = %err, "offset estimation failed");
            return Err(err);
        }

        let mean = stats.mean();
        let std_dev = stats.std_dev();
        let estimate = OffsetEstimate {
            mean_offset_ns: mean,
            min_offset_ns: stats.min(),
            max_offset_ns: stats.max(),
            std_dev_ns: std_dev,
            quality_percent: quality_percent(mean, std_dev),
            sample_count: stats.count() as usize,
        };
        debug!(
            mean_ns = estimate.mean_offset_ns,
            std_dev_ns = estimate.std_dev_ns,
            quality = estimate.quality_percent,
            samples = estimate.sample_count,
            rejected,
            "offset estimated"
        );
        Ok(estimate)
    }

    /// Mode B: trim the master sequence to the later of the two starts
    ///
    /// Returns the alignment and the kept master values.
    pub fn align_start(
        &self,
        master: &[u64],
        slave: &[u64],
    ) -> Result<(StartAlignment, Vec<u64>), SyncError> {
        let (Some(master_start), Some(slave_start)) =
            (master.iter().min().copied(), slave.iter().min().copied())
        else {
            return Err(SyncError::insufficient_data(
                "start alignment needs two non-empty sequences",
            ));
        };

        let sync_point = master_start.max(slave_start);
        let kept: Vec<u64> = master.iter().copied().filter(|v| *v >= sync_point).collect();
        let alignment = StartAlignment {
            sync_point,
            master_start,
            slave_start,
            removed_count: master.len() - kept.len(),
            kept_count: kept.len(),
        };
        debug!(
            sync_point,
            removed = alignment.removed_count,
            kept = alignment.kept_count,
            "start aligned"
        );
        Ok((alignment, kept))
    }

    /// Shift values by the estimated mean offset, clamped at zero
    pub fn apply_offset(&self, values: &[u64], estimate: &OffsetEstimate) -> Vec<u64> {
        let shift = self.time_unit.from_ns(estimate.mean_offset_ns).round();
        values
            .iter()
            .map(|value| {
                let corrected = *value as f64 + shift;
                if corrected <= 0.0 {
                    0
                } else {
                    corrected as u64
                }
            })
            .collect()
    }
}

/// `100 × (1 − min(std/|mean|, 1))`, clamped to [0, 100]
pub fn quality_percent(mean: f64, std_dev: f64) -> f64 {
    if mean == 0.0 {
        return if std_dev == 0.0 { 100.0 } else { 0.0 };
    }
    let cv = (std_dev / mean.abs()).min(1.0);
    (100.0 * (1.0 - cv)).clamp(0.0, 100.0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use contracts::QualityLabel;

    fn estimator_ns() -> OffsetEstimator {
        OffsetEstimator {
            time_unit: TimeUnit::Ns,
            ..Default::default()
        }
    }

    #[test]
    fn test_constant_offset() {
        let master = [1000, 2000, 3000, 4000];
        let slave = [1050, 2051, 3049, 4052];
        let estimate = estimator_ns().estimate_prefix(&master, &slave).unwrap();

        assert_eq!(estimate.sample_count, 3);
        assert!((estimate.mean_offset_ns - 50.0).abs() < 1e-9);
        assert_eq!(estimate.min_offset_ns, 49.0);
        assert_eq!(estimate.max_offset_ns, 51.0);
        assert!(estimate.quality_percent > 97.0);
        assert_eq!(estimate.quality(), QualityLabel::Excellent);
    }

    #[test]
    fn test_outlier_excluded() {
        let master = [1000, 2000, 3000, 4000, 5000];
        // interval 2 is five times the master interval
        let slave = [1050, 2050, 7050, 8050, 9050];
        let estimate = estimator_ns().estimate_prefix(&master, &slave).unwrap();

        assert_eq!(estimate.sample_count, 3);
        // candidates at i = 0, 2, 3; i = 1 rejected
        assert_eq!(estimate.min_offset_ns, 50.0);
        assert_eq!(estimate.max_offset_ns, 4050.0);
    }

    #[test]
    fn test_picosecond_conversion() {
        let estimator = OffsetEstimator {
            fraction: 1.0,
            ..Default::default()
        };
        let master = [0, 1_000_000, 2_000_000];
        let slave = [2_500, 1_002_500, 2_002_500];
        let estimate = estimator.estimate(&master, &slave).unwrap();
        assert_eq!(estimate.mean_offset_ns, 2.5);
        assert_eq!(estimate.std_dev_ns, 0.0);
        assert_eq!(estimate.quality_percent, 100.0);
    }

    #[test]
    fn test_empty_sequence_fails() {
        let err = estimator_ns().estimate(&[], &[1, 2]).unwrap_err();
        assert!(matches!(err, SyncError::EstimationInsufficientData { .. }));
    }

    #[test]
    fn test_all_outliers_fail() {
        let master = [0, 10, 20];
        let slave = [0, 100, 1000];
        let err = estimator_ns().estimate_prefix(&master, &slave).unwrap_err();
        assert!(err.to_string().contains("ratio filter"));
    }

    #[test]
    fn test_single_sample_has_no_interval() {
        let err = estimator_ns().estimate_prefix(&[5], &[7]).unwrap_err();
        assert!(matches!(err, SyncError::EstimationInsufficientData { .. }));
    }

    #[test]
    fn test_leading_fraction_bounds() {
        let estimator = OffsetEstimator::default();
        assert_eq!(estimator.sample_len(0), 0);
        assert_eq!(estimator.sample_len(5), 1);
        assert_eq!(estimator.sample_len(100), 10);
        assert_eq!(estimator.sample_len(109), 10);

        let values: Vec<u64> = (0..30).collect();
        assert_eq!(estimator.leading_fraction(&values), &[0, 1, 2]);
    }

    #[test]
    fn test_start_alignment() {
        let estimator = OffsetEstimator::default();
        let (alignment, kept) = estimator
            .align_start(&[100, 200, 300], &[250, 350, 450])
            .unwrap();
        assert_eq!(alignment.sync_point, 250);
        assert_eq!(alignment.master_start, 100);
        assert_eq!(alignment.slave_start, 250);
        assert_eq!(alignment.removed_count, 2);
        assert_eq!(alignment.kept_count, 1);
        assert_eq!(kept, vec![300]);
    }

    #[test]
    fn test_start_alignment_master_later() {
        let estimator = OffsetEstimator::default();
        let (alignment, kept) = estimator.align_start(&[500, 600], &[100, 200]).unwrap();
        assert_eq!(alignment.sync_point, 500);
        assert_eq!(alignment.removed_count, 0);
        assert_eq!(kept, vec![500, 600]);
    }

    #[test]
    fn test_apply_offset_clamps_at_zero() {
        let estimator = estimator_ns();
        let estimate = OffsetEstimate {
            mean_offset_ns: -150.0,
            ..Default::default()
        };
        assert_eq!(
            estimator.apply_offset(&[100, 150, 1000], &estimate),
            vec![0, 0, 850]
        );
    }

    #[test]
    fn test_apply_offset_picoseconds() {
        let estimator = OffsetEstimator::default();
        let estimate = OffsetEstimate {
            mean_offset_ns: 2.5,
            ..Default::default()
        };
        assert_eq!(estimator.apply_offset(&[0, 10], &estimate), vec![2_500, 2_510]);
    }

    #[test]
    fn test_quality_zero_mean() {
        assert_eq!(quality_percent(0.0, 0.0), 100.0);
        assert_eq!(quality_percent(0.0, 1.0), 0.0);
        assert_eq!(quality_percent(10.0, 20.0), 0.0);
        assert_eq!(quality_percent(-10.0, 1.0), 90.0);
    }
}
