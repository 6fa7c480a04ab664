//! CLI argument definitions using clap.

use clap::{Parser, Subcommand, ValueEnum};
use std::path::PathBuf;

/// tagsync - Two-node time-tag synchronization
#[derive(Parser, Debug)]
#[command(
    name = "tagsync",
    author,
    version,
    about = "Two-node time-tag acquisition and clock offset estimation",
    long_about = "Coordinates a master and a slave acquisition node over the network.\n\n\
                  The master handshakes with the slave, broadcasts a trigger, merges its \n\
                  own channel streams, retrieves a sample of the slave stream and \n\
                  estimates the clock offset between the two nodes."
)]
pub struct Cli {
    /// Increase logging verbosity (-v for debug, -vv for trace)
    #[arg(short, long, action = clap::ArgAction::Count, global = true, env = "TAGSYNC_VERBOSE")]
    pub verbose: u8,

    /// Suppress all output except errors
    #[arg(short, long, global = true, conflicts_with = "verbose")]
    pub quiet: bool,

    /// Log output format
    #[arg(
        long,
        value_enum,
        default_value = "pretty",
        global = true,
        env = "TAGSYNC_LOG_FORMAT"
    )]
    pub log_format: LogFormat,

    #[command(subcommand)]
    pub command: Commands,
}

/// Available CLI commands
#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Run synchronized sessions as the master node
    Master(MasterArgs),

    /// Serve the master as the slave node until interrupted
    Slave(SlaveArgs),

    /// Validate configuration file without running
    Validate(ValidateArgs),

    /// Display configuration information
    Info(InfoArgs),

    /// Convert a timestamp file between text and binary
    Convert(ConvertArgs),

    /// Estimate the offset between two recorded files
    Estimate(EstimateArgs),
}

/// Arguments for the `master` command
#[derive(Parser, Debug, Clone)]
pub struct MasterArgs {
    /// Path to configuration file (TOML or JSON)
    #[arg(short, long, default_value = "master.toml", env = "TAGSYNC_CONFIG")]
    pub config: PathBuf,

    /// Acquisition duration in seconds (overrides configuration)
    #[arg(short, long, env = "TAGSYNC_DURATION")]
    pub duration: Option<f64>,

    /// Comma-separated channel list, e.g. `1,2` (overrides configuration)
    #[arg(long, value_delimiter = ',', env = "TAGSYNC_CHANNELS")]
    pub channels: Option<Vec<u8>>,

    /// Number of sessions to run back to back
    #[arg(long, default_value = "1", env = "TAGSYNC_SESSIONS")]
    pub sessions: u32,

    /// Override the output directory from configuration
    #[arg(short, long, env = "TAGSYNC_OUTPUT")]
    pub output: Option<PathBuf>,

    /// Validate configuration and exit without running
    #[arg(long)]
    pub dry_run: bool,

    /// Metrics server port (0 = disabled)
    #[arg(long, default_value = "0", env = "TAGSYNC_METRICS_PORT")]
    pub metrics_port: u16,
}

/// Arguments for the `slave` command
#[derive(Parser, Debug, Clone)]
pub struct SlaveArgs {
    /// Path to configuration file (TOML or JSON)
    #[arg(short, long, default_value = "slave.toml", env = "TAGSYNC_CONFIG")]
    pub config: PathBuf,

    /// Override the output directory from configuration
    #[arg(short, long, env = "TAGSYNC_OUTPUT")]
    pub output: Option<PathBuf>,

    /// Stop serving after this many seconds (0 = until interrupted)
    #[arg(long, default_value = "0", env = "TAGSYNC_TIMEOUT")]
    pub timeout: u64,

    /// Metrics server port (0 = disabled)
    #[arg(long, default_value = "0", env = "TAGSYNC_METRICS_PORT")]
    pub metrics_port: u16,
}

/// Arguments for the `validate` command
#[derive(Parser, Debug)]
pub struct ValidateArgs {
    /// Path to configuration file to validate
    #[arg(short, long, default_value = "master.toml")]
    pub config: PathBuf,

    /// Output validation result as JSON
    #[arg(long)]
    pub json: bool,
}

/// Arguments for the `info` command
#[derive(Parser, Debug)]
pub struct InfoArgs {
    /// Path to configuration file
    #[arg(short, long, default_value = "master.toml")]
    pub config: PathBuf,

    /// Output as JSON
    #[arg(long)]
    pub json: bool,

    /// Show timing details (handshake, merge, transfer)
    #[arg(long)]
    pub timing: bool,
}

/// Arguments for the `convert` command
#[derive(Parser, Debug)]
pub struct ConvertArgs {
    /// Input file (`.txt` / `.csv` text, anything else binary)
    #[arg(short, long)]
    pub input: PathBuf,

    /// Output file, format chosen by extension
    #[arg(short, long)]
    pub output: PathBuf,

    /// Binary record layout when writing binary
    #[arg(long, value_enum, default_value = "tagged")]
    pub layout: LayoutArg,
}

/// Arguments for the `estimate` command
#[derive(Parser, Debug)]
pub struct EstimateArgs {
    /// Master-side merged file
    #[arg(long)]
    pub master: PathBuf,

    /// Slave-side file (full stream, or a partial sample with `--partial`)
    #[arg(long)]
    pub slave: PathBuf,

    /// Leading fraction used for Mode A
    #[arg(long, default_value = "0.1")]
    pub fraction: f64,

    /// The slave file already holds only the leading fraction
    #[arg(long)]
    pub partial: bool,

    /// Time unit of both files
    #[arg(long, default_value = "ps", value_parser = parse_time_unit)]
    pub unit: contracts::TimeUnit,

    /// Directory for the report and derived files
    #[arg(short, long, default_value = "output")]
    pub output: PathBuf,

    /// Sequence id used in artifact names
    #[arg(long, default_value = "0")]
    pub sequence_id: u64,
}

fn parse_time_unit(s: &str) -> Result<contracts::TimeUnit, String> {
    contracts::TimeUnit::parse(s).ok_or_else(|| format!("unknown time unit '{s}' (ps | ns)"))
}

/// Binary record layout
#[derive(ValueEnum, Clone, Copy, Debug, Default)]
pub enum LayoutArg {
    /// Timestamp only
    Plain,
    /// Timestamp and channel
    #[default]
    Tagged,
}

impl From<LayoutArg> for contracts::RecordLayout {
    fn from(layout: LayoutArg) -> Self {
        match layout {
            LayoutArg::Plain => contracts::RecordLayout::Plain,
            LayoutArg::Tagged => contracts::RecordLayout::Tagged,
        }
    }
}

/// Log output format
#[derive(ValueEnum, Clone, Debug, Default)]
pub enum LogFormat {
    /// JSON structured logging
    Json,
    /// Human-readable pretty format
    #[default]
    Pretty,
    /// Compact single-line format
    Compact,
}

impl From<LogFormat> for observability::LogFormat {
    fn from(format: LogFormat) -> Self {
        match format {
            LogFormat::Json => observability::LogFormat::Json,
            LogFormat::Pretty => observability::LogFormat::Pretty,
            LogFormat::Compact => observability::LogFormat::Compact,
        }
    }
}
