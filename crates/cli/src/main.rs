//! # tagsync CLI
//!
//! 命令行接口入口点。
//!
//! 提供：
//! - master / slave 节点运行
//! - 配置验证与信息展示
//! - 时间戳文件格式转换与离线偏移估计

mod cli;
mod commands;
mod error;
mod pipeline;

use anyhow::Result;
use clap::Parser;
use tracing::info;

use cli::{Cli, Commands};
use commands::{run_convert, run_estimate, run_info, run_master, run_slave, run_validate};

#[tokio::main]
async fn main() -> Result<()> {
    // Load .env file if present
    dotenvy::dotenv().ok();

    let cli = Cli::parse();

    observability::init_with_config(&observability_config(&cli))?;

    info!(version = env!("CARGO_PKG_VERSION"), "tagsync CLI starting");

    let result = match &cli.command {
        Commands::Master(args) => run_master(args).await,
        Commands::Slave(args) => run_slave(args).await,
        Commands::Validate(args) => run_validate(args),
        Commands::Info(args) => run_info(args),
        Commands::Convert(args) => run_convert(args),
        Commands::Estimate(args) => run_estimate(args),
    };

    if let Err(ref e) = result {
        tracing::error!(error = %e, "Command failed");
    }

    result
}

/// Logging setup from the global flags
fn observability_config(cli: &Cli) -> observability::ObservabilityConfig {
    let (log_level, env_override) = if cli.quiet {
        ("warn", false)
    } else {
        let level = match cli.verbose {
            0 => "info",
            1 => "debug",
            _ => "trace",
        };
        (level, true)
    };
    observability::ObservabilityConfig {
        log_format: cli.log_format.clone().into(),
        log_level: log_level.to_string(),
        env_override,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_quiet_pins_warn_level() {
        let cli = Cli::try_parse_from(["tagsync", "-q", "info", "--config", "n.toml"]).unwrap();
        let config = observability_config(&cli);
        assert_eq!(config.log_level, "warn");
        assert!(!config.env_override);

        let cli = Cli::try_parse_from(["tagsync", "-vv", "--log-format", "json", "info", "--config", "n.toml"])
            .unwrap();
        let config = observability_config(&cli);
        assert_eq!(config.log_level, "trace");
        assert_eq!(config.log_format, observability::LogFormat::Json);
    }
}
