//! Window timing: how long the merger waits for a late block.

use std::time::Duration;

use contracts::{AcquisitionConfig, MergeConfig};

/// Wait bounds derived from the window period
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct WindowTiming {
    /// Window period PPER = PWID + dead time
    pub pper: Duration,
    /// Lower bound of the wait
    pub min_wait: Duration,
    /// Multiplier applied to PPER
    pub wait_factor: f64,
    /// Consecutive missing windows before a channel is closed
    pub stall_windows: u32,
}

impl WindowTiming {
    pub fn from_config(acquisition: &AcquisitionConfig, merge: &MergeConfig) -> Self {
        Self {
            pper: acquisition.pper(),
            min_wait: merge.min_wait(),
            wait_factor: merge.wait_factor,
            stall_windows: merge.stall_windows.max(1),
        }
    }

    /// Maximum wait for the missing blocks of a window
    ///
    /// `max(min_wait, PPER × wait_factor)`
    pub fn max_wait(&self) -> Duration {
        let scaled = self.pper.mul_f64(self.wait_factor.max(0.0));
        scaled.max(self.min_wait)
    }
}

impl Default for WindowTiming {
    fn default() -> Self {
        Self::from_config(&AcquisitionConfig::default(), &MergeConfig::default())
    }
}
