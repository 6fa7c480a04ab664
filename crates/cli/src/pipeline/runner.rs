//! Session runner - drives back-to-back master sessions.

use std::time::{Duration, Instant};

use contracts::ChannelId;
use coordinator::MasterCoordinator;
use instrument::InstrumentClient;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use super::RunStats;

/// Runner configuration
#[derive(Debug, Clone)]
pub struct RunnerConfig {
    /// Number of sessions to run
    pub sessions: u32,

    /// Duration override (None = from configuration)
    pub duration: Option<f64>,

    /// Channel override (None = from configuration)
    pub channels: Option<Vec<ChannelId>>,

    /// Pause between sessions
    pub pause: Duration,
}

impl Default for RunnerConfig {
    fn default() -> Self {
        Self {
            sessions: 1,
            duration: None,
            channels: None,
            pause: Duration::from_millis(200),
        }
    }
}

/// Runs sessions on a bound master
pub struct SessionRunner<C: InstrumentClient> {
    master: MasterCoordinator<C>,
    config: RunnerConfig,
}

impl<C: InstrumentClient> SessionRunner<C> {
    pub fn new(master: MasterCoordinator<C>, config: RunnerConfig) -> Self {
        Self { master, config }
    }

    /// Run every configured session, stopping early on cancellation.
    ///
    /// A failed session is recorded and the next one still runs.
    pub async fn run(&self, cancel: &CancellationToken) -> RunStats {
        let start_time = Instant::now();
        let mut stats = RunStats::default();

        for index in 1..=self.config.sessions {
            if cancel.is_cancelled() {
                warn!(completed = index - 1, "Run cancelled before next session");
                break;
            }
            if index > 1 && !self.config.pause.is_zero() {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = tokio::time::sleep(self.config.pause) => {}
                }
            }

            stats.sessions_started += 1;
            info!(
                session = index,
                total = self.config.sessions,
                "Starting session"
            );

            let session = self
                .master
                .run_session(self.config.duration, self.config.channels.clone());
            let result = tokio::select! {
                result = session => result,
                _ = cancel.cancelled() => {
                    // the master's shutdown token stops a running acquisition
                    self.master.shutdown_token().cancel();
                    warn!(session = index, "Session interrupted");
                    break;
                }
            };

            match result {
                Ok(result) => {
                    info!(
                        session = index,
                        sequence_id = result.session.sequence_id,
                        records = result.outcome.record_count(),
                        report = %result.report_text.display(),
                        "Session completed"
                    );
                    stats.record_success(&result);
                }
                Err(e) => {
                    error!(session = index, error = %e, "Session failed");
                    stats.record_failure(&e);
                }
            }
        }

        stats.duration = start_time.elapsed();
        stats
    }

    /// Stop background tasks and the instrument
    pub async fn shutdown(self) {
        self.master.shutdown().await;
    }
}
