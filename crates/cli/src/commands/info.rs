//! `info` command implementation.

use anyhow::{Context, Result};
use contracts::{NodeBlueprint, NodeRole, RecordLayout, TimeUnit, TransferMode};
use serde::Serialize;
use sync_engine::WindowTiming;
use tracing::info;

use crate::cli::InfoArgs;
use crate::error::CliError;

/// Configuration info for JSON output
#[derive(Serialize)]
struct ConfigInfo {
    version: String,
    node: NodeInfo,
    network: NetworkInfo,
    acquisition: AcquisitionInfo,
    estimation: EstimationInfo,
    output: OutputInfo,
    #[serde(skip_serializing_if = "Option::is_none")]
    timing: Option<TimingInfo>,
}

#[derive(Serialize)]
struct NodeInfo {
    role: NodeRole,
    name: String,
    instrument: String,
}

#[derive(Serialize)]
struct NetworkInfo {
    master_host: String,
    slave_host: String,
    bind_host: String,
    trigger_port: u16,
    command_port: u16,
    status_port: u16,
    notify_port: u16,
    data_port: u16,
}

#[derive(Serialize)]
struct AcquisitionInfo {
    channels: Vec<u8>,
    listener_ports: Vec<u16>,
    duration_seconds: f64,
    pwid_ms: u64,
    pper_ms: u64,
    time_unit: TimeUnit,
}

#[derive(Serialize)]
struct EstimationInfo {
    fraction: f64,
    ratio_min: f64,
    ratio_max: f64,
    transfer: TransferMode,
}

#[derive(Serialize)]
struct OutputInfo {
    dir: String,
    write_text: bool,
    layout: RecordLayout,
    log_sink: bool,
}

#[derive(Serialize)]
struct TimingInfo {
    handshake_attempts: u32,
    request_timeout_ms: u64,
    ready_timeout_ms: u64,
    max_handshake_ms: u64,
    trigger_grace_ms: u64,
    trigger_resend_attempts: u32,
    heartbeat_interval_ms: u64,
    merge_wait_bound_ms: u64,
    stall_windows: u32,
    transfer_timeout_ms: u64,
}

/// Execute the `info` command
pub fn run_info(args: &InfoArgs) -> Result<()> {
    info!(config = %args.config.display(), "Loading configuration info");

    if !args.config.exists() {
        return Err(CliError::config_not_found(args.config.display().to_string()).into());
    }

    let blueprint = config_loader::ConfigLoader::load_from_path(&args.config)
        .with_context(|| format!("Failed to load config from {}", args.config.display()))?;

    if args.json {
        let info = build_config_info(&blueprint, args.timing);
        let json =
            serde_json::to_string_pretty(&info).context("Failed to serialize config info")?;
        println!("{}", json);
    } else {
        print_config_info(&blueprint, args.timing);
    }

    Ok(())
}

fn merge_wait_bound_ms(blueprint: &NodeBlueprint) -> u64 {
    WindowTiming::from_config(&blueprint.acquisition, &blueprint.merge)
        .max_wait()
        .as_millis() as u64
}

fn build_config_info(blueprint: &NodeBlueprint, timing: bool) -> ConfigInfo {
    let network = &blueprint.network;
    let acquisition = &blueprint.acquisition;

    let timing = timing.then(|| TimingInfo {
        handshake_attempts: blueprint.handshake.max_attempts,
        request_timeout_ms: blueprint.handshake.request_timeout_ms,
        ready_timeout_ms: blueprint.handshake.ready_timeout_ms,
        max_handshake_ms: blueprint.handshake.max_handshake_time().as_millis() as u64,
        trigger_grace_ms: blueprint.handshake.trigger_grace_ms,
        trigger_resend_attempts: blueprint.handshake.trigger_resend_attempts,
        heartbeat_interval_ms: blueprint.status.heartbeat_interval_ms,
        merge_wait_bound_ms: merge_wait_bound_ms(blueprint),
        stall_windows: blueprint.merge.stall_windows,
        transfer_timeout_ms: blueprint.transfer.timeout_ms,
    });

    ConfigInfo {
        version: format!("{:?}", blueprint.version),
        node: NodeInfo {
            role: blueprint.role(),
            name: blueprint.node.name.clone(),
            instrument: format!("{:?}", blueprint.instrument.kind),
        },
        network: NetworkInfo {
            master_host: network.master_host.clone(),
            slave_host: network.slave_host.clone(),
            bind_host: network.bind_host.clone(),
            trigger_port: network.trigger_port,
            command_port: network.command_port,
            status_port: network.status_port,
            notify_port: network.notify_port,
            data_port: network.data_port,
        },
        acquisition: AcquisitionInfo {
            channels: acquisition.channels.clone(),
            listener_ports: acquisition
                .channels
                .iter()
                .filter_map(|ch| acquisition.listener_port(*ch))
                .collect(),
            duration_seconds: acquisition.duration_seconds,
            pwid_ms: acquisition.pwid_ms,
            pper_ms: acquisition.pper().as_millis() as u64,
            time_unit: acquisition.time_unit,
        },
        estimation: EstimationInfo {
            fraction: blueprint.estimation.fraction,
            ratio_min: blueprint.estimation.ratio_min,
            ratio_max: blueprint.estimation.ratio_max,
            transfer: blueprint.estimation.transfer,
        },
        output: OutputInfo {
            dir: blueprint.output.dir.display().to_string(),
            write_text: blueprint.output.write_text,
            layout: blueprint.output.layout,
            log_sink: blueprint.output.log_sink,
        },
        timing,
    }
}

fn print_config_info(blueprint: &NodeBlueprint, timing: bool) {
    let network = &blueprint.network;
    let acquisition = &blueprint.acquisition;

    println!("╔══════════════════════════════════════════════════════════════╗");
    println!("║                  tagsync Configuration                       ║");
    println!("╚══════════════════════════════════════════════════════════════╝\n");

    println!("🛰  Node");
    println!("   ├─ Version: {:?}", blueprint.version);
    println!("   ├─ Role: {}", blueprint.role());
    println!("   ├─ Name: {}", blueprint.node.name);
    println!("   └─ Instrument: {:?}", blueprint.instrument.kind);

    println!("\n🌐 Network");
    println!("   ├─ Master: {}", network.master_host);
    println!("   ├─ Slave: {}", network.slave_host);
    println!("   ├─ Bind: {}", network.bind_host);
    let ports = network.ports();
    for (i, (name, port)) in ports.iter().enumerate() {
        let prefix = if i == ports.len() - 1 { "└─" } else { "├─" };
        println!("   {} {}: {}", prefix, name, port);
    }

    println!("\n⏱  Acquisition");
    println!("   ├─ Duration: {}s", acquisition.duration_seconds);
    println!(
        "   ├─ Window: PWID {}ms, PPER {}ms",
        acquisition.pwid_ms,
        acquisition.pper().as_millis()
    );
    println!("   ├─ Time unit: {}", acquisition.time_unit.as_str());
    println!("   └─ Channels ({})", acquisition.channels.len());
    for (i, channel) in acquisition.channels.iter().enumerate() {
        let prefix = if i == acquisition.channels.len() - 1 {
            "└─"
        } else {
            "├─"
        };
        match acquisition.listener_port(*channel) {
            Some(port) => println!("      {} ch{} → port {}", prefix, channel, port),
            None => println!("      {} ch{} → port out of range", prefix, channel),
        }
    }

    let estimation = &blueprint.estimation;
    println!("\n📐 Estimation");
    println!("   ├─ Fraction: {}", estimation.fraction);
    println!(
        "   ├─ Ratio band: [{}, {}]",
        estimation.ratio_min, estimation.ratio_max
    );
    println!("   └─ Transfer: {:?}", estimation.transfer);

    let output = &blueprint.output;
    println!("\n📤 Output");
    println!("   ├─ Dir: {}", output.dir.display());
    println!("   ├─ Layout: {:?}", output.layout);
    println!("   ├─ Text copy: {}", output.write_text);
    println!("   └─ Log sink: {}", output.log_sink);

    if timing {
        let handshake = &blueprint.handshake;
        println!("\n⚙️  Timing");
        println!(
            "   ├─ Handshake: {} × ({}ms + {}ms), bound {}ms",
            handshake.max_attempts,
            handshake.request_timeout_ms,
            handshake.ready_timeout_ms,
            handshake.max_handshake_time().as_millis()
        );
        println!(
            "   ├─ Trigger grace: {}ms, {} resend(s)",
            handshake.trigger_grace_ms, handshake.trigger_resend_attempts
        );
        println!(
            "   ├─ Heartbeat: every {}ms",
            blueprint.status.heartbeat_interval_ms
        );
        println!(
            "   ├─ Merge wait bound: {}ms, close after {} missed window(s)",
            merge_wait_bound_ms(blueprint),
            blueprint.merge.stall_windows
        );
        println!("   └─ Transfer timeout: {}ms", blueprint.transfer.timeout_ms);
    }

    println!();
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_merge_wait_bound() {
        let mut blueprint = NodeBlueprint::for_role(NodeRole::Slave);
        // PPER 110ms × 3.0 > min_wait 250ms
        assert!((329..=330).contains(&merge_wait_bound_ms(&blueprint)));

        blueprint.merge.min_wait_ms = 1_000;
        assert_eq!(merge_wait_bound_ms(&blueprint), 1_000);
    }

    #[test]
    fn test_timing_section_is_optional() {
        let blueprint = NodeBlueprint::for_role(NodeRole::Master);
        let plain = serde_json::to_value(build_config_info(&blueprint, false)).unwrap();
        assert!(plain.get("timing").is_none());

        let timed = serde_json::to_value(build_config_info(&blueprint, true)).unwrap();
        assert_eq!(timed["timing"]["max_handshake_ms"], 5 * 7_000);
        assert_eq!(timed["node"]["role"], "master");
    }
}
