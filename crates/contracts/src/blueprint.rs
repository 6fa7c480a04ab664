//! NodeBlueprint - Config Loader 输出
//!
//! 描述一个节点的完整配置：角色、网络端口、采集参数、握手/合并/估计/传输策略、输出。
//! 除 `node.role` 外所有字段都有默认值。

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;
use validator::Validate;

use crate::{ChannelId, NodeRole};

/// 配置版本
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum ConfigVersion {
    #[default]
    V1,
}

/// 单节点配置蓝图
#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
pub struct NodeBlueprint {
    /// 配置版本
    #[serde(default)]
    pub version: ConfigVersion,

    /// 节点身份
    #[validate(nested)]
    pub node: NodeConfig,

    #[serde(default)]
    #[validate(nested)]
    pub network: NetworkConfig,

    #[serde(default)]
    #[validate(nested)]
    pub acquisition: AcquisitionConfig,

    #[serde(default)]
    #[validate(nested)]
    pub handshake: HandshakeConfig,

    #[serde(default)]
    #[validate(nested)]
    pub status: StatusConfig,

    #[serde(default)]
    #[validate(nested)]
    pub merge: MergeConfig,

    #[serde(default)]
    #[validate(nested)]
    pub ingestion: IngestionConfig,

    #[serde(default)]
    #[validate(nested)]
    pub estimation: EstimationConfig,

    #[serde(default)]
    #[validate(nested)]
    pub transfer: TransferConfig,

    #[serde(default)]
    #[validate(nested)]
    pub output: OutputConfig,

    #[serde(default)]
    #[validate(nested)]
    pub instrument: InstrumentConfig,
}

impl NodeBlueprint {
    /// Blueprint with every section at its default
    pub fn for_role(role: NodeRole) -> Self {
        Self {
            version: ConfigVersion::V1,
            node: NodeConfig {
                role,
                name: default_node_name(),
            },
            network: NetworkConfig::default(),
            acquisition: AcquisitionConfig::default(),
            handshake: HandshakeConfig::default(),
            status: StatusConfig::default(),
            merge: MergeConfig::default(),
            ingestion: IngestionConfig::default(),
            estimation: EstimationConfig::default(),
            transfer: TransferConfig::default(),
            output: OutputConfig::default(),
            instrument: InstrumentConfig::default(),
        }
    }

    pub fn role(&self) -> NodeRole {
        self.node.role
    }
}

/// 节点身份
#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
pub struct NodeConfig {
    /// master / slave
    pub role: NodeRole,

    /// 节点名称 (日志 / 状态报告)
    #[serde(default = "default_node_name")]
    #[validate(length(min = 1))]
    pub name: String,
}

fn default_node_name() -> String {
    "tagsync".to_string()
}

/// 网络配置：主从地址与五个控制端口
#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
#[serde(default)]
pub struct NetworkConfig {
    /// 主节点地址 (status / notify / data 端口所在)
    #[validate(length(min = 1))]
    pub master_host: String,

    /// 从节点地址 (trigger / command 端口所在)
    #[validate(length(min = 1))]
    pub slave_host: String,

    /// 本节点监听地址
    #[validate(length(min = 1))]
    pub bind_host: String,

    /// 触发端口 (UDP, slave)
    pub trigger_port: u16,

    /// 命令端口 (TCP, slave)
    pub command_port: u16,

    /// 心跳端口 (UDP, master)
    pub status_port: u16,

    /// 通知端口 (TCP, master)
    pub notify_port: u16,

    /// 数据/文件端口 (TCP, master)
    pub data_port: u16,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            master_host: "127.0.0.1".to_string(),
            slave_host: "127.0.0.1".to_string(),
            bind_host: "127.0.0.1".to_string(),
            trigger_port: 47_100,
            command_port: 47_101,
            status_port: 47_102,
            notify_port: 47_103,
            data_port: 47_104,
        }
    }
}

impl NetworkConfig {
    /// All five ports, named
    pub fn ports(&self) -> [(&'static str, u16); 5] {
        [
            ("trigger_port", self.trigger_port),
            ("command_port", self.command_port),
            ("status_port", self.status_port),
            ("notify_port", self.notify_port),
            ("data_port", self.data_port),
        ]
    }

    pub fn trigger_addr(&self) -> String {
        format!("{}:{}", self.slave_host, self.trigger_port)
    }

    pub fn command_addr(&self) -> String {
        format!("{}:{}", self.slave_host, self.command_port)
    }

    pub fn status_addr(&self) -> String {
        format!("{}:{}", self.master_host, self.status_port)
    }

    pub fn notify_addr(&self) -> String {
        format!("{}:{}", self.master_host, self.notify_port)
    }

    pub fn data_addr(&self) -> String {
        format!("{}:{}", self.master_host, self.data_port)
    }

    pub fn bind_addr(&self, port: u16) -> String {
        format!("{}:{}", self.bind_host, port)
    }
}

/// 时间单位 (仪器时间戳)
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TimeUnit {
    /// 皮秒 (参考协议)
    #[default]
    Ps,
    /// 纳秒
    Ns,
}

impl TimeUnit {
    /// Instrument units per nanosecond
    pub fn units_per_ns(&self) -> f64 {
        match self {
            TimeUnit::Ps => 1_000.0,
            TimeUnit::Ns => 1.0,
        }
    }

    pub fn to_ns(&self, units: f64) -> f64 {
        units / self.units_per_ns()
    }

    pub fn from_ns(&self, ns: f64) -> f64 {
        ns * self.units_per_ns()
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            TimeUnit::Ps => "ps",
            TimeUnit::Ns => "ns",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s.to_ascii_lowercase().as_str() {
            "ps" => Some(TimeUnit::Ps),
            "ns" => Some(TimeUnit::Ns),
            _ => None,
        }
    }
}

/// 采集配置
#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
#[serde(default)]
pub struct AcquisitionConfig {
    /// 活动通道 (非空、唯一、>= 1)
    #[validate(length(min = 1))]
    pub channels: Vec<ChannelId>,

    /// 默认采集时长 (秒)
    #[validate(range(exclusive_min = 0.0))]
    pub duration_seconds: f64,

    /// 通道监听端口 = base + channel
    #[validate(range(min = 1))]
    pub listener_base_port: u16,

    /// 子采集窗口宽度 PWID (ms)
    #[validate(range(min = 1))]
    pub pwid_ms: u64,

    /// 窗口间死区 (ms)，PPER = PWID + dead_time
    pub dead_time_ms: u64,

    /// 时间戳单位
    pub time_unit: TimeUnit,
}

impl Default for AcquisitionConfig {
    fn default() -> Self {
        Self {
            channels: vec![1, 2],
            duration_seconds: 1.0,
            listener_base_port: 48_000,
            pwid_ms: 100,
            dead_time_ms: 10,
            time_unit: TimeUnit::Ps,
        }
    }
}

impl AcquisitionConfig {
    pub fn pwid(&self) -> Duration {
        Duration::from_millis(self.pwid_ms)
    }

    /// Window period PPER
    pub fn pper(&self) -> Duration {
        Duration::from_millis(self.pwid_ms + self.dead_time_ms)
    }

    /// Listener port for a channel, `None` when it does not fit in u16
    pub fn listener_port(&self, channel: ChannelId) -> Option<u16> {
        self.listener_base_port.checked_add(u16::from(channel))
    }
}

/// 握手配置
#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
#[serde(default)]
pub struct HandshakeConfig {
    /// 最大尝试次数
    #[validate(range(min = 1))]
    pub max_attempts: u32,

    /// 等待命令应答超时 (ms)
    #[validate(range(min = 1))]
    pub request_timeout_ms: u64,

    /// 等待 ready_for_trigger 超时 (ms)
    #[validate(range(min = 1))]
    pub ready_timeout_ms: u64,

    /// 从节点发送 ready_for_trigger 前的准备延时 (ms)
    pub settle_delay_ms: u64,

    /// 等待 trigger_received 的宽限期 (ms)
    #[validate(range(min = 1))]
    pub trigger_grace_ms: u64,

    /// 触发重发次数
    pub trigger_resend_attempts: u32,
}

impl Default for HandshakeConfig {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            request_timeout_ms: 2_000,
            ready_timeout_ms: 5_000,
            settle_delay_ms: 100,
            trigger_grace_ms: 500,
            trigger_resend_attempts: 2,
        }
    }
}

impl HandshakeConfig {
    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }

    pub fn ready_timeout(&self) -> Duration {
        Duration::from_millis(self.ready_timeout_ms)
    }

    pub fn settle_delay(&self) -> Duration {
        Duration::from_millis(self.settle_delay_ms)
    }

    pub fn trigger_grace(&self) -> Duration {
        Duration::from_millis(self.trigger_grace_ms)
    }

    /// Upper bound of the handshake loop
    pub fn max_handshake_time(&self) -> Duration {
        (self.request_timeout() + self.ready_timeout()) * self.max_attempts
    }
}

/// 心跳配置
#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
#[serde(default)]
pub struct StatusConfig {
    /// 心跳周期 (ms)
    #[validate(range(min = 1))]
    pub heartbeat_interval_ms: u64,

    /// 接收超时 (ms)
    #[validate(range(min = 1))]
    pub receive_timeout_ms: u64,
}

impl Default for StatusConfig {
    fn default() -> Self {
        Self {
            heartbeat_interval_ms: 1_000,
            receive_timeout_ms: 200,
        }
    }
}

impl StatusConfig {
    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_millis(self.heartbeat_interval_ms)
    }

    pub fn receive_timeout(&self) -> Duration {
        Duration::from_millis(self.receive_timeout_ms)
    }
}

/// 合并配置 (停滞策略)
#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
#[serde(default)]
pub struct MergeConfig {
    /// 窗口最短等待 (ms)
    #[validate(range(min = 1))]
    pub min_wait_ms: u64,

    /// 等待上限 = max(min_wait, PPER × wait_factor)
    #[validate(range(min = 1.0))]
    pub wait_factor: f64,

    /// 连续缺失多少个窗口后关闭通道
    #[validate(range(min = 1))]
    pub stall_windows: u32,

    /// 每通道缓冲块数
    #[validate(range(min = 1))]
    pub buffer_capacity: usize,

    /// 合并线程轮询周期 (ms)
    #[validate(range(min = 1))]
    pub poll_interval_ms: u64,

    /// 仪器停止后等待监听器排空的时间 (ms)
    pub drain_grace_ms: u64,
}

impl Default for MergeConfig {
    fn default() -> Self {
        Self {
            min_wait_ms: 250,
            wait_factor: 3.0,
            stall_windows: 5,
            buffer_capacity: 64,
            poll_interval_ms: 20,
            drain_grace_ms: 300,
        }
    }
}

impl MergeConfig {
    pub fn min_wait(&self) -> Duration {
        Duration::from_millis(self.min_wait_ms)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn drain_grace(&self) -> Duration {
        Duration::from_millis(self.drain_grace_ms)
    }
}

/// 监听器配置
#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
#[serde(default)]
pub struct IngestionConfig {
    /// 单次 accept / receive 超时 (ms)
    #[validate(range(min = 1))]
    pub receive_timeout_ms: u64,

    /// 单帧最大字节数
    #[validate(range(min = 8))]
    pub max_frame_bytes: usize,

    /// 监听器 → 合并线程队列容量
    #[validate(range(min = 1))]
    pub queue_capacity: usize,
}

impl Default for IngestionConfig {
    fn default() -> Self {
        Self {
            receive_timeout_ms: 100,
            max_frame_bytes: 16 * 1024 * 1024,
            queue_capacity: 256,
        }
    }
}

impl IngestionConfig {
    pub fn receive_timeout(&self) -> Duration {
        Duration::from_millis(self.receive_timeout_ms)
    }
}

/// 数据请求方式
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransferMode {
    /// 只取前导比例
    #[default]
    Partial,
    /// 全部数据
    Full,
}

/// 偏移估计配置
#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
#[serde(default)]
pub struct EstimationConfig {
    /// 前导比例 (0, 1]
    #[validate(range(exclusive_min = 0.0, max = 1.0))]
    pub fraction: f64,

    /// 间隔比下限
    #[validate(range(exclusive_min = 0.0))]
    pub ratio_min: f64,

    /// 间隔比上限
    #[validate(range(exclusive_min = 0.0))]
    pub ratio_max: f64,

    /// 数据请求方式
    pub transfer: TransferMode,
}

impl Default for EstimationConfig {
    fn default() -> Self {
        Self {
            fraction: 0.1,
            ratio_min: 0.9,
            ratio_max: 1.1,
            transfer: TransferMode::Partial,
        }
    }
}

/// 文件传输配置
#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
#[serde(default)]
pub struct TransferConfig {
    /// 分块大小 (字节)
    #[validate(range(min = 1))]
    pub chunk_size: usize,

    /// Busy 时的轮询间隔 (ms)
    #[validate(range(min = 1))]
    pub poll_interval_ms: u64,

    /// 整体超时 (ms)
    #[validate(range(min = 1))]
    pub timeout_ms: u64,
}

impl Default for TransferConfig {
    fn default() -> Self {
        Self {
            chunk_size: 64 * 1024,
            poll_interval_ms: 200,
            timeout_ms: 30_000,
        }
    }
}

impl TransferConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}

/// 二进制记录布局
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RecordLayout {
    /// 8 字节时间戳
    Plain,
    /// 8 字节时间戳 + 8 字节通道
    #[default]
    Tagged,
}

impl RecordLayout {
    pub fn record_size(&self) -> u64 {
        match self {
            RecordLayout::Plain => 8,
            RecordLayout::Tagged => 16,
        }
    }
}

/// 输出配置
#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
#[serde(default)]
pub struct OutputConfig {
    /// 产物目录
    pub dir: PathBuf,

    /// 同时写文本格式
    pub write_text: bool,

    /// 二进制布局
    pub layout: RecordLayout,

    /// 是否附加日志 sink
    pub log_sink: bool,

    /// 每个 sink 的队列容量
    #[validate(range(min = 1))]
    pub queue_capacity: usize,
}

impl Default for OutputConfig {
    fn default() -> Self {
        Self {
            dir: PathBuf::from("output"),
            write_text: true,
            layout: RecordLayout::Tagged,
            log_sink: false,
            queue_capacity: 64,
        }
    }
}

/// 仪器后端
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InstrumentKind {
    /// 内置模拟仪器
    #[default]
    Mock,
}

/// 仪器配置
#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
#[serde(default)]
pub struct InstrumentConfig {
    pub kind: InstrumentKind,

    /// 事件序列随机种子 (主从一致时事件间隔相同)
    pub seed: u64,

    /// 每窗口每通道事件数
    pub events_per_window: u32,

    /// 相对 trigger 的时钟偏移 (仪器单位)
    pub clock_offset: i64,

    /// 时间戳抖动上限 (仪器单位)
    pub jitter: u64,

    /// 不发送任何数据的通道 (模拟故障)
    pub silent_channels: Vec<ChannelId>,

    /// 连接监听器超时 (ms)
    #[validate(range(min = 1))]
    pub connect_timeout_ms: u64,
}

impl Default for InstrumentConfig {
    fn default() -> Self {
        Self {
            kind: InstrumentKind::Mock,
            seed: 42,
            events_per_window: 100,
            clock_offset: 0,
            jitter: 0,
            silent_channels: Vec::new(),
            connect_timeout_ms: 2_000,
        }
    }
}

impl InstrumentConfig {
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_valid() {
        let blueprint = NodeBlueprint::for_role(NodeRole::Master);
        assert!(blueprint.validate().is_ok());
        assert_eq!(blueprint.acquisition.pper(), Duration::from_millis(110));
    }

    #[test]
    fn listener_port_overflow() {
        let mut acquisition = AcquisitionConfig::default();
        acquisition.listener_base_port = u16::MAX - 1;
        assert_eq!(acquisition.listener_port(1), Some(u16::MAX));
        assert_eq!(acquisition.listener_port(2), None);
    }

    #[test]
    fn time_unit_conversion() {
        assert_eq!(TimeUnit::Ps.to_ns(1_500.0), 1.5);
        assert_eq!(TimeUnit::Ps.from_ns(2.0), 2_000.0);
        assert_eq!(TimeUnit::Ns.to_ns(7.0), 7.0);
        assert_eq!(TimeUnit::parse("NS"), Some(TimeUnit::Ns));
    }

    #[test]
    fn handshake_bound() {
        let handshake = HandshakeConfig {
            max_attempts: 3,
            request_timeout_ms: 10,
            ready_timeout_ms: 20,
            ..Default::default()
        };
        assert_eq!(handshake.max_handshake_time(), Duration::from_millis(90));
    }

    #[test]
    fn range_violation_is_reported() {
        let mut blueprint = NodeBlueprint::for_role(NodeRole::Slave);
        blueprint.estimation.fraction = 0.0;
        assert!(blueprint.validate().is_err());
    }
}
