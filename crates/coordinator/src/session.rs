//! NodeContext - per-node session state shared by every worker
//!
//! 会话状态 (state / progress / error / trigger 时间戳) 由 `Mutex` 保护，
//! `acquisition_active` 为原子标志，由 RAII guard 在所有退出路径上复位。

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use contracts::{
    AcquisitionSession, MergeSummary, NodeBlueprint, NodeRole, SessionState, StatusReport,
    SyncError,
};
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Local result of a finished acquisition, kept for data requests
#[derive(Debug, Clone)]
pub struct CompletedSession {
    pub sequence_id: u64,
    /// Merged binary artifact
    pub merged_binary: PathBuf,
    pub record_count: u64,
    pub summary: MergeSummary,
}

#[derive(Debug, Default)]
struct SessionStatus {
    /// Current session, or the last one once terminal
    session: Option<AcquisitionSession>,
    progress: f64,
    completed: Option<CompletedSession>,
}

/// Clears `acquisition_active` when dropped
#[derive(Debug)]
pub struct ActiveGuard {
    flag: Arc<AtomicBool>,
}

impl Drop for ActiveGuard {
    fn drop(&mut self) {
        self.flag.store(false, Ordering::SeqCst);
    }
}

/// Node context
///
/// Owned by the coordinator and shared (`Arc`) with its workers; no global state.
#[derive(Debug)]
pub struct NodeContext {
    blueprint: NodeBlueprint,
    status: Mutex<SessionStatus>,
    acquisition_active: Arc<AtomicBool>,
    next_sequence: AtomicU64,
    state_changed: Notify,
    shutdown: CancellationToken,
}

impl NodeContext {
    pub fn new(blueprint: NodeBlueprint) -> Self {
        Self {
            blueprint,
            status: Mutex::new(SessionStatus::default()),
            acquisition_active: Arc::new(AtomicBool::new(false)),
            next_sequence: AtomicU64::new(1),
            state_changed: Notify::new(),
            shutdown: CancellationToken::new(),
        }
    }

    fn status(&self) -> MutexGuard<'_, SessionStatus> {
        self.status.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn blueprint(&self) -> &NodeBlueprint {
        &self.blueprint
    }

    pub fn role(&self) -> NodeRole {
        self.blueprint.role()
    }

    /// Cancelled when the node shuts down
    pub fn shutdown_token(&self) -> &CancellationToken {
        &self.shutdown
    }

    /// Allocate the next sequence id (monotonic)
    pub fn next_sequence_id(&self) -> u64 {
        self.next_sequence.fetch_add(1, Ordering::SeqCst)
    }

    /// Claim the acquisition slot
    ///
    /// # Errors
    /// `SessionBusy` while another acquisition holds it.
    pub fn try_activate(&self) -> Result<ActiveGuard, SyncError> {
        if self
            .acquisition_active
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            let active_sequence_id = self
                .status()
                .session
                .as_ref()
                .map_or(0, |s| s.sequence_id);
            return Err(SyncError::SessionBusy { active_sequence_id });
        }
        Ok(ActiveGuard {
            flag: Arc::clone(&self.acquisition_active),
        })
    }

    pub fn is_active(&self) -> bool {
        self.acquisition_active.load(Ordering::SeqCst)
    }

    /// Make `session` the current session
    ///
    /// A stored result with the same sequence id belongs to an earlier run and is dropped.
    pub fn open_session(&self, session: AcquisitionSession) {
        info!(
            sequence_id = session.sequence_id,
            channels = ?session.channel_set,
            duration_seconds = session.requested_duration_seconds,
            "session opened"
        );
        {
            let mut status = self.status();
            if status
                .completed
                .as_ref()
                .is_some_and(|c| c.sequence_id == session.sequence_id)
            {
                status.completed = None;
            }
            status.session = Some(session);
            status.progress = 0.0;
        }
        self.state_changed.notify_waiters();
    }

    /// Current (or last) session
    pub fn session(&self) -> Option<AcquisitionSession> {
        self.status().session.clone()
    }

    /// State of session `sequence_id`, if it is the current one
    pub fn state_of(&self, sequence_id: u64) -> Option<SessionState> {
        self.status()
            .session
            .as_ref()
            .filter(|s| s.sequence_id == sequence_id)
            .map(|s| s.state)
    }

    /// Apply a legal state transition; illegal ones are logged and ignored
    pub fn transition(&self, sequence_id: u64, next: SessionState) -> bool {
        let changed = {
            let mut status = self.status();
            match status.session.as_mut() {
                Some(session) if session.sequence_id == sequence_id => {
                    if session.state.can_transition_to(next) {
                        debug!(sequence_id, from = %session.state, to = %next, "session transition");
                        session.state = next;
                        true
                    } else {
                        warn!(sequence_id, from = %session.state, to = %next, "illegal session transition ignored");
                        false
                    }
                }
                _ => {
                    warn!(sequence_id, to = %next, "transition for unknown session ignored");
                    false
                }
            }
        };
        if changed {
            self.state_changed.notify_waiters();
        }
        changed
    }

    /// Mutate the session record (trigger timestamps)
    pub fn update_session(&self, sequence_id: u64, f: impl FnOnce(&mut AcquisitionSession)) {
        let mut status = self.status();
        if let Some(session) = status
            .session
            .as_mut()
            .filter(|s| s.sequence_id == sequence_id)
        {
            f(session);
        }
    }

    pub fn set_progress(&self, progress: f64) {
        self.status().progress = progress.clamp(0.0, 1.0);
    }

    /// Move the session to `Error` with a message naming the failed phase
    pub fn fail(&self, sequence_id: u64, err: &SyncError) -> String {
        let message = err.session_message();
        {
            let mut status = self.status();
            if let Some(session) = status
                .session
                .as_mut()
                .filter(|s| s.sequence_id == sequence_id)
            {
                if session.state.can_transition_to(SessionState::Error) {
                    session.state = SessionState::Error;
                }
                session.error_message = Some(message.clone());
            }
        }
        error!(sequence_id, phase = %err.phase(), error = %err, "session failed");
        observability::record_session_outcome(Some(err.phase().as_str()));
        self.state_changed.notify_waiters();
        message
    }

    /// Record the local result of an acquisition (before the session completes)
    pub fn store_result(&self, completed: CompletedSession) {
        self.status().completed = Some(completed);
    }

    /// Move the session to `Completed`
    pub fn complete(&self, sequence_id: u64) {
        if self.transition(sequence_id, SessionState::Completed) {
            self.status().progress = 1.0;
            observability::record_session_outcome(None);
            info!(sequence_id, "session completed");
        }
    }

    /// Stored local result for `sequence_id`
    pub fn completed(&self, sequence_id: u64) -> Option<CompletedSession> {
        self.status()
            .completed
            .clone()
            .filter(|c| c.sequence_id == sequence_id)
    }

    /// Forget the current session and the stored result
    pub fn reset(&self) {
        {
            let mut status = self.status();
            status.session = None;
            status.completed = None;
            status.progress = 0.0;
        }
        info!("session state reset");
        self.state_changed.notify_waiters();
    }

    /// Snapshot for the command and heartbeat channels
    ///
    /// A terminal session reports `Idle`: the node accepts a new session.
    pub fn status_report(&self) -> StatusReport {
        let status = self.status();
        let session = status.session.as_ref();
        let state = session
            .map(|s| s.state)
            .filter(|state| !state.is_terminal())
            .unwrap_or(SessionState::Idle);
        StatusReport {
            node: self.blueprint.node.name.clone(),
            state,
            sequence_id: session.map(|s| s.sequence_id),
            acquisition_active: self.is_active(),
            progress: status.progress,
            error_message: session.and_then(|s| s.error_message.clone()),
            last_completed: status.completed.as_ref().map(|c| c.sequence_id),
        }
    }

    /// Resolves on the next state change
    pub async fn state_changed(&self) {
        self.state_changed.notified().await;
    }
}
