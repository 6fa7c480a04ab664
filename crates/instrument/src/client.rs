//! Instrument client abstraction
//!
//! Defines the trait the coordinator uses to drive a time tagger, supporting real drivers and
//! the mock instrument.

use std::future::Future;
use std::time::Duration;

use contracts::{AcquisitionConfig, ChannelId, TimeUnit};

use crate::error::Result;

/// What the instrument should stream for one acquisition
#[derive(Debug, Clone, PartialEq)]
pub struct AcquisitionPlan {
    /// Session sequence id
    pub sequence_id: u64,

    /// Listener host the producers connect to
    pub listener_host: String,

    /// Channel → listener port
    pub channels: Vec<(ChannelId, u16)>,

    /// Sub-acquisition window width
    pub pwid: Duration,

    /// Window period (PWID + dead time)
    pub pper: Duration,

    /// Timestamp unit
    pub time_unit: TimeUnit,
}

impl AcquisitionPlan {
    /// Build a plan from the acquisition section, skipping channels whose port overflows
    pub fn from_config(
        sequence_id: u64,
        listener_host: impl Into<String>,
        channels: &[ChannelId],
        acquisition: &AcquisitionConfig,
    ) -> Self {
        Self {
            sequence_id,
            listener_host: listener_host.into(),
            channels: channels
                .iter()
                .filter_map(|ch| acquisition.listener_port(*ch).map(|port| (*ch, port)))
                .collect(),
            pwid: acquisition.pwid(),
            pper: acquisition.pper(),
            time_unit: acquisition.time_unit,
        }
    }

    pub fn listener_addr(&self, port: u16) -> String {
        format!("{}:{}", self.listener_host, port)
    }
}

/// Instrument client trait
///
/// Abstracts the hardware command surface so the coordinator can run against a real driver or
/// `MockInstrument`. Once started, the instrument connects one producer stream per channel to
/// the listener ports in the plan; `stop` closes those streams (end-of-stream for the listeners).
pub trait InstrumentClient: Send + Sync + 'static {
    /// Connect to the instrument
    fn connect(&mut self) -> impl Future<Output = Result<()>> + Send;

    /// Apply channel and window configuration
    fn configure(&self, plan: &AcquisitionPlan) -> impl Future<Output = Result<()>> + Send;

    /// Start streaming for the configured plan
    ///
    /// # Arguments
    /// * `trigger_timestamp_ns` - Trigger wall-clock time the acquisition is aligned to
    fn start(&self, trigger_timestamp_ns: u64) -> impl Future<Output = Result<()>> + Send;

    /// Stop streaming
    ///
    /// Idempotent: returns Ok when not running
    fn stop(&self) -> impl Future<Output = Result<()>> + Send;

    /// Whether producer streams are active
    fn is_running(&self) -> bool;
}
