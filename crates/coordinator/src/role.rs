//! Role markers

use contracts::NodeRole;

use crate::master::MasterState;
use crate::slave::SlaveState;

/// Role of a `SyncCoordinator`
///
/// The marker is zero-sized; sockets and tasks owned by one role live in `State`.
pub trait Role: Send + Sync + 'static {
    const ROLE: NodeRole;

    type State: Send + Sync + 'static;
}

/// Initiator: handshakes, triggers, collects the peer sample and estimates the offset
#[derive(Debug, Clone, Copy, Default)]
pub struct Master;

/// Responder: serves commands, acquires on trigger, pushes its merged sample
#[derive(Debug, Clone, Copy, Default)]
pub struct Slave;

impl Role for Master {
    const ROLE: NodeRole = NodeRole::Master;

    type State = MasterState;
}

impl Role for Slave {
    const ROLE: NodeRole = NodeRole::Slave;

    type State = SlaveState;
}
