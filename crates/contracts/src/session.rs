//! AcquisitionSession - Coordinator runtime state
//!
//! One synchronized run across master and slave.

use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;

use crate::ChannelId;

/// Node role
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeRole {
    Master,
    Slave,
}

impl NodeRole {
    pub fn as_str(&self) -> &'static str {
        match self {
            NodeRole::Master => "master",
            NodeRole::Slave => "slave",
        }
    }
}

impl fmt::Display for NodeRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Session state machine
///
/// `Idle → Preparing → ReadyForTrigger → Triggered → Acquiring → Stopping → Completed`,
/// `Error` from any non-terminal state.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    #[default]
    Idle,
    Preparing,
    ReadyForTrigger,
    Triggered,
    Acquiring,
    Stopping,
    Completed,
    Error,
}

impl SessionState {
    /// Terminal states end a session
    pub fn is_terminal(&self) -> bool {
        matches!(self, SessionState::Completed | SessionState::Error)
    }

    /// Whether the instrument is (about to be) running
    pub fn is_running(&self) -> bool {
        matches!(
            self,
            SessionState::Triggered | SessionState::Acquiring | SessionState::Stopping
        )
    }

    /// Legal forward transition
    pub fn can_transition_to(&self, next: SessionState) -> bool {
        use SessionState::*;
        match (self, next) {
            (_, Error) => !self.is_terminal() || *self == Error,
            (Idle, Preparing) => true,
            (Preparing, ReadyForTrigger) => true,
            // Slave goes straight from Idle/Preparing to Triggered when the trigger arrives
            (Idle | Preparing | ReadyForTrigger, Triggered) => true,
            (Triggered, Acquiring) => true,
            (Acquiring, Stopping) => true,
            (Stopping, Completed) => true,
            (Completed | Error, Idle) => true,
            _ => false,
        }
    }
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            SessionState::Idle => "idle",
            SessionState::Preparing => "preparing",
            SessionState::ReadyForTrigger => "ready_for_trigger",
            SessionState::Triggered => "triggered",
            SessionState::Acquiring => "acquiring",
            SessionState::Stopping => "stopping",
            SessionState::Completed => "completed",
            SessionState::Error => "error",
        };
        f.write_str(s)
    }
}

/// One synchronized run
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AcquisitionSession {
    /// Monotonic per coordinator
    pub sequence_id: u64,

    /// Requested acquisition time
    pub requested_duration_seconds: f64,

    /// Non-empty set of active channels
    pub channel_set: BTreeSet<ChannelId>,

    /// Master-side trigger timestamp (ns since UNIX epoch)
    pub master_trigger_timestamp_ns: u64,

    /// Slave-side trigger receipt timestamp (0 until received)
    pub slave_trigger_timestamp_ns: u64,

    /// Current state
    pub state: SessionState,

    /// Present only in `Error`
    pub error_message: Option<String>,
}

impl AcquisitionSession {
    pub fn new(
        sequence_id: u64,
        requested_duration_seconds: f64,
        channel_set: BTreeSet<ChannelId>,
    ) -> Self {
        Self {
            sequence_id,
            requested_duration_seconds,
            channel_set,
            master_trigger_timestamp_ns: 0,
            slave_trigger_timestamp_ns: 0,
            state: SessionState::Idle,
            error_message: None,
        }
    }

    /// Trigger receipt delay observed at the slave (diagnostic only)
    pub fn trigger_skew_ns(&self) -> Option<i64> {
        if self.master_trigger_timestamp_ns == 0 || self.slave_trigger_timestamp_ns == 0 {
            return None;
        }
        Some(self.slave_trigger_timestamp_ns as i64 - self.master_trigger_timestamp_ns as i64)
    }
}

/// Status snapshot exchanged on the command and heartbeat channels
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StatusReport {
    /// Node name
    pub node: String,

    /// Current state
    pub state: SessionState,

    /// Sequence id of the current / last session
    pub sequence_id: Option<u64>,

    /// Whether an acquisition is in progress
    pub acquisition_active: bool,

    /// Progress of the current acquisition (0-1)
    pub progress: f64,

    /// Last error message
    pub error_message: Option<String>,

    /// Last completed session (available for data requests)
    pub last_completed: Option<u64>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn forward_path_is_legal() {
        use SessionState::*;
        let path = [
            Idle,
            Preparing,
            ReadyForTrigger,
            Triggered,
            Acquiring,
            Stopping,
            Completed,
            Idle,
        ];
        for pair in path.windows(2) {
            assert!(pair[0].can_transition_to(pair[1]), "{:?}", pair);
        }
    }

    #[test]
    fn completed_cannot_fail() {
        assert!(!SessionState::Completed.can_transition_to(SessionState::Error));
        assert!(SessionState::Acquiring.can_transition_to(SessionState::Error));
        assert!(!SessionState::Idle.can_transition_to(SessionState::Acquiring));
    }

    #[test]
    fn trigger_skew_requires_both_timestamps() {
        let mut session = AcquisitionSession::new(1, 1.0, BTreeSet::from([1]));
        session.master_trigger_timestamp_ns = 1_000;
        assert_eq!(session.trigger_skew_ns(), None);
        session.slave_trigger_timestamp_ns = 1_250;
        assert_eq!(session.trigger_skew_ns(), Some(250));
    }
}
