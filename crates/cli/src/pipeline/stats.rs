//! Statistics over a run of master sessions.

use std::path::PathBuf;
use std::time::Duration;

use contracts::SyncError;
use coordinator::SessionResult;
use observability::RunningStats;

/// Statistics from a run of sessions
#[derive(Debug, Clone, Default)]
pub struct RunStats {
    /// Sessions started
    pub sessions_started: u32,

    /// Sessions that reached `Completed`
    pub sessions_completed: u32,

    /// `(phase, message)` of every failed session
    pub failures: Vec<(String, String)>,

    /// Merged records written by the master
    pub records_written: u64,

    /// Sessions whose estimate was omitted for lack of data
    pub estimates_missing: u32,

    /// Mean offset per session (ns)
    pub offsets: RunningStats,

    /// Quality per session (%)
    pub quality: RunningStats,

    /// Report of the most recent completed session
    pub last_report: Option<PathBuf>,

    /// Wall time of the whole run
    pub duration: Duration,
}

impl RunStats {
    pub fn record_success(&mut self, result: &SessionResult) {
        self.sessions_completed += 1;
        self.records_written += result.outcome.record_count();
        match &result.report.estimate {
            Some(estimate) => {
                self.offsets.push(estimate.mean_offset_ns);
                self.quality.push(estimate.quality_percent);
            }
            None => self.estimates_missing += 1,
        }
        self.last_report = Some(result.report_text.clone());
    }

    pub fn record_failure(&mut self, err: &SyncError) {
        self.failures
            .push((err.phase().as_str().to_string(), err.to_string()));
    }

    pub fn sessions_failed(&self) -> u32 {
        self.failures.len() as u32
    }

    /// Print detailed summary
    pub fn print_summary(&self) {
        println!("\n╔══════════════════════════════════════════════════════════════╗");
        println!("║                    Session Statistics                        ║");
        println!("╚══════════════════════════════════════════════════════════════╝\n");

        println!("📊 Overview");
        println!("   ├─ Duration: {:.2}s", self.duration.as_secs_f64());
        println!("   ├─ Sessions started: {}", self.sessions_started);
        println!("   ├─ Sessions completed: {}", self.sessions_completed);
        println!("   ├─ Sessions failed: {}", self.sessions_failed());
        println!("   └─ Records written: {}", self.records_written);

        if self.offsets.count() > 0 {
            println!("\n📈 Offset Estimates");
            println!("   ├─ Mean offset: {:.3} ns", self.offsets.mean());
            if self.offsets.count() > 1 {
                println!("   ├─ Spread across sessions: {:.3} ns", self.offsets.std_dev());
            }
            println!(
                "   ├─ Range: [{:.3}, {:.3}] ns",
                self.offsets.min(),
                self.offsets.max()
            );
            println!("   └─ Mean quality: {:.1}%", self.quality.mean());
        }
        if self.estimates_missing > 0 {
            println!(
                "\n⚠️  {} session(s) completed without an estimate",
                self.estimates_missing
            );
        }

        if !self.failures.is_empty() {
            println!("\n❌ Failures");
            for (i, (phase, message)) in self.failures.iter().enumerate() {
                let prefix = if i + 1 == self.failures.len() {
                    "└─"
                } else {
                    "├─"
                };
                println!("   {} [{}] {}", prefix, phase, message);
            }
        }

        if let Some(report) = &self.last_report {
            println!("\n📄 Last report: {}", report.display());
        }
        println!();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_failures_are_counted_by_phase() {
        let mut stats = RunStats::default();
        stats.record_failure(&SyncError::HandshakeTimeout {
            attempts: 3,
            waited_ms: 900,
            message: "no ready".into(),
        });
        stats.record_failure(&SyncError::transfer("peer_2_partial.bin", "closed"));

        assert_eq!(stats.sessions_failed(), 2);
        assert_eq!(stats.failures[0].0, "handshake");
        assert_eq!(stats.failures[1].0, "transfer");
    }
}
