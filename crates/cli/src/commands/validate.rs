//! `validate` command implementation.

use anyhow::{Context, Result};
use contracts::{NodeBlueprint, NodeRole, TransferMode};
use serde::Serialize;
use tracing::info;

use crate::cli::ValidateArgs;

/// Handshake bound above which a warning is emitted (ms)
const LONG_HANDSHAKE_MS: u128 = 120_000;

/// Validation result for JSON output
#[derive(Serialize)]
struct ValidationResult {
    valid: bool,
    config_path: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    warnings: Option<Vec<String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    summary: Option<ConfigSummary>,
}

#[derive(Serialize)]
struct ConfigSummary {
    version: String,
    role: NodeRole,
    node: String,
    channels: Vec<u8>,
    duration_seconds: f64,
    master_host: String,
    slave_host: String,
    ports: Vec<(String, u16)>,
    transfer: TransferMode,
    output_dir: String,
}

/// Execute the `validate` command
pub fn run_validate(args: &ValidateArgs) -> Result<()> {
    info!(config = %args.config.display(), "Validating configuration");

    let result = validate_config(args);

    if args.json {
        let json = serde_json::to_string_pretty(&result)
            .context("Failed to serialize validation result")?;
        println!("{}", json);
    } else {
        print_validation_result(&result);
    }

    if result.valid {
        Ok(())
    } else {
        anyhow::bail!("Configuration validation failed")
    }
}

fn validate_config(args: &ValidateArgs) -> ValidationResult {
    let config_path = args.config.display().to_string();

    if !args.config.exists() {
        return ValidationResult {
            valid: false,
            config_path,
            error: Some(format!("File not found: {}", args.config.display())),
            warnings: None,
            summary: None,
        };
    }

    match config_loader::ConfigLoader::load_from_path(&args.config) {
        Ok(blueprint) => {
            let warnings = collect_warnings(&blueprint);
            ValidationResult {
                valid: true,
                config_path,
                error: None,
                warnings: if warnings.is_empty() {
                    None
                } else {
                    Some(warnings)
                },
                summary: Some(summarize(&blueprint)),
            }
        }
        Err(e) => ValidationResult {
            valid: false,
            config_path,
            error: Some(e.to_string()),
            warnings: None,
            summary: None,
        },
    }
}

fn summarize(blueprint: &NodeBlueprint) -> ConfigSummary {
    ConfigSummary {
        version: format!("{:?}", blueprint.version),
        role: blueprint.role(),
        node: blueprint.node.name.clone(),
        channels: blueprint.acquisition.channels.clone(),
        duration_seconds: blueprint.acquisition.duration_seconds,
        master_host: blueprint.network.master_host.clone(),
        slave_host: blueprint.network.slave_host.clone(),
        ports: blueprint
            .network
            .ports()
            .iter()
            .map(|(name, port)| (name.to_string(), *port))
            .collect(),
        transfer: blueprint.estimation.transfer,
        output_dir: blueprint.output.dir.display().to_string(),
    }
}

/// Collect configuration warnings (non-fatal issues)
fn collect_warnings(blueprint: &NodeBlueprint) -> Vec<String> {
    let mut warnings = Vec::new();
    let instrument = &blueprint.instrument;

    if blueprint.role() == NodeRole::Master && instrument.clock_offset != 0 {
        warnings.push(format!(
            "instrument.clock_offset = {} on the master - offsets are reported relative to it",
            instrument.clock_offset
        ));
    }

    let silent: Vec<_> = instrument
        .silent_channels
        .iter()
        .filter(|ch| blueprint.acquisition.channels.contains(ch))
        .collect();
    if !silent.is_empty() {
        warnings.push(format!(
            "instrument.silent_channels {:?} are active - their windows will stall",
            silent
        ));
    }

    if blueprint.role() == NodeRole::Master
        && blueprint.estimation.transfer == TransferMode::Full
    {
        warnings.push(
            "estimation.transfer = full - the whole slave stream is transferred every session"
                .to_string(),
        );
    }

    let bound = blueprint.handshake.max_handshake_time();
    if bound.as_millis() > LONG_HANDSHAKE_MS {
        warnings.push(format!(
            "handshake may take up to {}s before giving up",
            bound.as_secs()
        ));
    }

    if blueprint.network.master_host == blueprint.network.slave_host {
        warnings.push(format!(
            "master_host and slave_host are both {} - loopback setup",
            blueprint.network.master_host
        ));
    }

    warnings
}

fn print_validation_result(result: &ValidationResult) {
    if result.valid {
        println!("✓ Configuration is valid: {}", result.config_path);

        if let Some(ref summary) = result.summary {
            println!("\n  Version: {}", summary.version);
            println!("  Role: {} ({})", summary.role, summary.node);
            println!("  Channels: {:?}", summary.channels);
            println!("  Duration: {}s", summary.duration_seconds);
            println!(
                "  Hosts: master {}, slave {}",
                summary.master_host, summary.slave_host
            );
            for (name, port) in &summary.ports {
                println!("  {}: {}", name, port);
            }
            println!("  Transfer: {:?}", summary.transfer);
            println!("  Output: {}", summary.output_dir);
        }

        if let Some(ref warnings) = result.warnings {
            println!("\n⚠ Warnings:");
            for warning in warnings {
                println!("  - {}", warning);
            }
        }
    } else {
        println!("✗ Configuration is invalid: {}", result.config_path);
        if let Some(ref error) = result.error {
            println!("\n  Error: {}", error);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_warnings_for_master() {
        let mut blueprint = NodeBlueprint::for_role(NodeRole::Master);
        blueprint.instrument.clock_offset = 10;
        blueprint.instrument.silent_channels = vec![2, 9];
        blueprint.estimation.transfer = TransferMode::Full;

        let warnings = collect_warnings(&blueprint);
        assert!(warnings.iter().any(|w| w.contains("clock_offset")));
        assert!(warnings.iter().any(|w| w.contains("[2]")));
        assert!(warnings.iter().any(|w| w.contains("transfer = full")));
    }

    #[test]
    fn test_invalid_config_reports_error() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("bad.toml");
        std::fs::write(&path, "[node]\nrole = \"slave\"\n[estimation]\nfraction = 0.0\n").unwrap();

        let result = validate_config(&ValidateArgs {
            config: path,
            json: true,
        });
        assert!(!result.valid);
        assert!(result.error.is_some());
    }
}
