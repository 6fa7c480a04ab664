//! # Observability
//!
//! tagsync 节点的日志与指标。
//!
//! - `init_with_config`: 安装 tracing subscriber；JSON 格式会附带当前 span 链，
//!   因此 `node{role,node}` 与 `master_session{sequence_id}` 字段出现在每条事件上
//! - `install_metrics`: Prometheus exporter (可选)
//! - `node_span`: 节点级根 span，master / slave 命令在其中运行
//! - [`metrics`]: 合并 / 握手 / 传输 / 偏移估计指标与 `RunningStats`

pub mod metrics;

use std::net::SocketAddr;

use anyhow::{Context, Result};
use contracts::NodeRole;
use metrics_exporter_prometheus::PrometheusBuilder;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer};

pub use crate::metrics::{
    record_batch_dispatched, record_batch_metrics, record_buffer_depth, record_handshake_attempt,
    record_merge_summary, record_offset_estimate, record_session_outcome, record_transfer_bytes,
    record_trigger_resend, RunningStats, SessionMetricsAggregator,
};

/// 日志配置
#[derive(Debug, Clone)]
pub struct ObservabilityConfig {
    pub log_format: LogFormat,
    /// 默认过滤级别 (`info`, `debug`, `tagsync=trace,...`)
    pub log_level: String,
    /// `RUST_LOG` 优先于 `log_level`
    pub env_override: bool,
}

impl Default for ObservabilityConfig {
    fn default() -> Self {
        Self {
            log_format: LogFormat::Pretty,
            log_level: "info".to_string(),
            env_override: true,
        }
    }
}

/// 日志格式
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum LogFormat {
    /// 每行一个 JSON 对象，带 span 链
    Json,
    #[default]
    Pretty,
    /// 单行，省略 target
    Compact,
}

fn build_filter(config: &ObservabilityConfig) -> EnvFilter {
    if config.env_override {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.log_level))
    } else {
        EnvFilter::new(&config.log_level)
    }
}

/// 安装全局 tracing subscriber
pub fn init_with_config(config: &ObservabilityConfig) -> Result<()> {
    let fmt_layer = match config.log_format {
        LogFormat::Json => fmt::layer()
            .json()
            .with_target(true)
            .with_thread_ids(true)
            .with_current_span(true)
            .with_span_list(true)
            .boxed(),
        LogFormat::Pretty => fmt::layer().pretty().boxed(),
        LogFormat::Compact => fmt::layer().compact().with_target(false).boxed(),
    };

    tracing_subscriber::registry()
        .with(build_filter(config))
        .with(fmt_layer)
        .try_init()
        .context("Failed to initialize tracing subscriber")?;
    Ok(())
}

/// 安装 Prometheus exporter，监听 `0.0.0.0:<port>`
pub fn install_metrics(port: u16) -> Result<SocketAddr> {
    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    PrometheusBuilder::new()
        .with_http_listener(addr)
        .install()
        .context("Failed to install Prometheus recorder")?;

    tracing::info!(%addr, "Prometheus metrics endpoint initialized");
    Ok(addr)
}

/// 节点根 span
pub fn node_span(role: NodeRole, node: &str) -> tracing::Span {
    tracing::info_span!("node", %role, node)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_filter_ignores_env_when_pinned() {
        let config = ObservabilityConfig {
            log_level: "warn".to_string(),
            env_override: false,
            ..ObservabilityConfig::default()
        };
        assert_eq!(build_filter(&config).to_string(), "warn");
    }

    #[test]
    fn test_default_config() {
        let config = ObservabilityConfig::default();
        assert_eq!(config.log_format, LogFormat::Pretty);
        assert!(config.env_override);
    }
}
