//! # Coordinator
//!
//! 双节点时间戳同步会话协调。
//!
//! 负责：
//! - 会话状态机与 `acquisition_active` 互斥
//! - Master: 握手 / 触发 / 采集 / 取回从节点样本 / 偏移估计与报告
//! - Slave: 命令服务 / 触发接收 / 心跳 / 按触发采集并推送数据
//! - 控制通道帧编解码与文件分块传输
//!
//! ## 使用示例
//!
//! ```ignore
//! use coordinator::{Master, SyncCoordinator};
//! use instrument::MockInstrument;
//!
//! let instrument = MockInstrument::new(blueprint.instrument.clone());
//! let master = SyncCoordinator::<Master, _>::bind(blueprint, instrument).await?;
//! let result = master.run_session(None, None).await?;
//! println!("{}", result.report_text.display());
//! master.shutdown().await;
//! ```

mod acquisition;
mod coordinator;
pub mod error;
mod estimation;
mod master;
mod role;
mod session;
mod slave;
pub mod transfer;
pub mod wire;

#[cfg(test)]
mod test_support;

pub use acquisition::{run_acquisition, AcquisitionOutcome, AcquisitionRequest};
pub use coordinator::SyncCoordinator;
pub use error::{CoordinatorError, Result};
pub use estimation::{estimate_session, EstimationInputs, EstimationOutput};
pub use master::{MasterState, SessionResult};
pub use role::{Master, Role, Slave};
pub use session::{ActiveGuard, CompletedSession, NodeContext};
pub use slave::SlaveState;
pub use transfer::{receive_file, send_file, ReceivedFile};
pub use wire::ChannelKind;

/// Master coordinator over instrument `C`
pub type MasterCoordinator<C> = SyncCoordinator<Master, C>;

/// Slave coordinator over instrument `C`
pub type SlaveCoordinator<C> = SyncCoordinator<Slave, C>;
