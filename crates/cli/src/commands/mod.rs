//! Command implementations.

mod convert;
mod estimate;
mod info;
mod master;
mod slave;
mod validate;

pub use convert::run_convert;
pub use estimate::run_estimate;
pub use info::run_info;
pub use master::run_master;
pub use slave::run_slave;
pub use validate::run_validate;

use std::path::{Path, PathBuf};

use contracts::{InstrumentConfig, InstrumentKind, NodeBlueprint, NodeRole};
use instrument::MockInstrument;
use tracing::info;

use crate::error::{CliError, Result};

/// Load a configuration for `role`, applying the output directory override
pub(crate) fn load_blueprint(
    path: &Path,
    role: NodeRole,
    output: Option<&PathBuf>,
) -> Result<NodeBlueprint> {
    if !path.exists() {
        return Err(CliError::config_not_found(path.display().to_string()));
    }
    let mut blueprint = config_loader::ConfigLoader::load_from_path(path)?;
    if blueprint.role() != role {
        return Err(CliError::RoleMismatch {
            path: path.display().to_string(),
            found: blueprint.role(),
            expected: role,
        });
    }
    if let Some(dir) = output {
        info!(dir = %dir.display(), "Overriding output directory from CLI");
        blueprint.output.dir = dir.clone();
    }
    Ok(blueprint)
}

/// Instrument backend named by the configuration
pub(crate) fn build_instrument(config: &InstrumentConfig) -> MockInstrument {
    match config.kind {
        InstrumentKind::Mock => MockInstrument::new(config.clone()),
    }
}

/// Install the Prometheus exporter when a port is given
pub(crate) fn init_metrics(port: u16) -> anyhow::Result<()> {
    if port != 0 {
        observability::install_metrics(port)?;
    }
    Ok(())
}

/// Setup Ctrl+C and SIGTERM signal handlers
pub(crate) async fn shutdown_signal() {
    let ctrl_c = async {
        tokio::signal::ctrl_c()
            .await
            .expect("Failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("Failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_load_blueprint_checks_role() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("slave.toml");
        std::fs::write(&path, "[node]\nrole = \"slave\"\n").unwrap();

        let blueprint = load_blueprint(&path, NodeRole::Slave, None).unwrap();
        assert_eq!(blueprint.role(), NodeRole::Slave);

        let err = load_blueprint(&path, NodeRole::Master, None).unwrap_err();
        assert!(matches!(err, CliError::RoleMismatch { .. }));

        let missing = load_blueprint(&dir.path().join("none.toml"), NodeRole::Slave, None);
        assert!(matches!(missing, Err(CliError::ConfigNotFound { .. })));
    }

    #[test]
    fn test_output_override() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("master.toml");
        std::fs::write(&path, "[node]\nrole = \"master\"\n").unwrap();

        let out = dir.path().join("out");
        let blueprint = load_blueprint(&path, NodeRole::Master, Some(&out)).unwrap();
        assert_eq!(blueprint.output.dir, out);
    }
}
