//! Master session orchestration module.

mod runner;
mod stats;

pub use runner::{RunnerConfig, SessionRunner};
pub use stats::RunStats;
