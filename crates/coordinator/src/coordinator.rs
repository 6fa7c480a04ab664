//! SyncCoordinator - behaviour shared by both roles

use std::marker::PhantomData;
use std::sync::Arc;

use contracts::{AcquisitionSession, NodeBlueprint, StatusReport, SyncError};
use instrument::InstrumentClient;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::acquisition::{run_acquisition, AcquisitionOutcome, AcquisitionRequest};
use crate::role::Role;
use crate::session::{CompletedSession, NodeContext};

/// Node coordinator
///
/// `R` selects the protocol side (`Master` initiates, `Slave` responds); `C` is the
/// instrument boundary.
pub struct SyncCoordinator<R: Role, C: InstrumentClient> {
    pub(crate) ctx: Arc<NodeContext>,
    pub(crate) instrument: Arc<C>,
    pub(crate) state: R::State,
    _role: PhantomData<R>,
}

impl<R: Role, C: InstrumentClient> SyncCoordinator<R, C> {
    /// Check the configured role and connect the instrument
    pub(crate) async fn prepare(
        blueprint: NodeBlueprint,
        mut instrument: C,
    ) -> Result<(Arc<NodeContext>, Arc<C>), SyncError> {
        if blueprint.role() != R::ROLE {
            return Err(SyncError::config_validation(
                "node.role",
                format!(
                    "configuration is for a {} node, expected {}",
                    blueprint.role(),
                    R::ROLE
                ),
            ));
        }
        instrument.connect().await?;
        info!(role = %R::ROLE, node = %blueprint.node.name, "instrument connected");
        Ok((Arc::new(NodeContext::new(blueprint)), Arc::new(instrument)))
    }

    pub(crate) fn from_parts(ctx: Arc<NodeContext>, instrument: Arc<C>, state: R::State) -> Self {
        Self {
            ctx,
            instrument,
            state,
            _role: PhantomData,
        }
    }

    pub fn context(&self) -> &Arc<NodeContext> {
        &self.ctx
    }

    pub fn blueprint(&self) -> &NodeBlueprint {
        self.ctx.blueprint()
    }

    /// Status snapshot, as served on the command and heartbeat channels
    pub fn status(&self) -> StatusReport {
        self.ctx.status_report()
    }

    /// Current (or last) session
    pub fn session(&self) -> Option<AcquisitionSession> {
        self.ctx.session()
    }

    /// Cancelled when the node shuts down
    pub fn shutdown_token(&self) -> CancellationToken {
        self.ctx.shutdown_token().clone()
    }

    /// Local acquisition; the result is kept for later data requests
    pub(crate) async fn acquire(
        &self,
        request: &AcquisitionRequest,
        stop: &CancellationToken,
    ) -> Result<AcquisitionOutcome, SyncError> {
        let outcome = run_acquisition(&self.ctx, self.instrument.as_ref(), request, stop).await?;
        self.ctx.store_result(CompletedSession {
            sequence_id: outcome.sequence_id,
            merged_binary: outcome.merged_binary.clone(),
            record_count: outcome.record_count(),
            summary: outcome.summary.clone(),
        });
        Ok(outcome)
    }

    /// Stop the instrument, logging failures
    pub(crate) async fn stop_instrument(&self) {
        if self.instrument.is_running() {
            if let Err(e) = self.instrument.stop().await {
                warn!(error = %e, "instrument stop failed during shutdown");
            }
        }
    }
}
