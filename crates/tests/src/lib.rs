//! # Integration Tests
//!
//! 集成测试与端到端测试。
//!
//! 负责：
//! - 配置往返测试
//! - 回环 e2e 测试（主从节点在同一主机）
//! - 文件格式转换

#[cfg(test)]
mod support {
    use std::net::TcpListener;
    use std::path::Path;

    use contracts::{NodeBlueprint, NodeRole};

    pub fn free_port() -> u16 {
        let socket = TcpListener::bind("127.0.0.1:0").unwrap();
        socket.local_addr().unwrap().port()
    }

    pub fn free_base_port(channels: u16) -> u16 {
        loop {
            let base = free_port();
            if base.checked_add(channels).is_some()
                && (1..=channels).all(|ch| TcpListener::bind(("127.0.0.1", base + ch)).is_ok())
            {
                return base;
            }
        }
    }

    /// Master and slave blueprints sharing the five control ports
    pub fn loopback_pair(dir: &Path) -> (NodeBlueprint, NodeBlueprint) {
        let mut master = NodeBlueprint::for_role(NodeRole::Master);
        master.node.name = "master".into();
        master.network.trigger_port = free_port();
        master.network.command_port = free_port();
        master.network.status_port = free_port();
        master.network.notify_port = free_port();
        master.network.data_port = free_port();

        master.acquisition.channels = vec![1, 2];
        master.acquisition.duration_seconds = 0.3;
        master.acquisition.listener_base_port = free_base_port(2);
        master.acquisition.pwid_ms = 10;
        master.acquisition.dead_time_ms = 2;

        master.handshake.max_attempts = 3;
        master.handshake.request_timeout_ms = 500;
        master.handshake.ready_timeout_ms = 1_000;
        master.handshake.settle_delay_ms = 10;
        master.handshake.trigger_grace_ms = 200;
        master.status.heartbeat_interval_ms = 50;
        master.status.receive_timeout_ms = 50;

        master.merge.min_wait_ms = 40;
        master.merge.wait_factor = 1.0;
        master.merge.stall_windows = 2;
        master.merge.poll_interval_ms = 5;
        master.merge.drain_grace_ms = 200;

        master.transfer.poll_interval_ms = 20;
        master.transfer.timeout_ms = 10_000;
        master.estimation.fraction = 0.2;
        master.instrument.events_per_window = 5;
        master.output.dir = dir.join("master");

        let mut slave = master.clone();
        slave.node.role = NodeRole::Slave;
        slave.node.name = "slave".into();
        slave.acquisition.listener_base_port = free_base_port(2);
        slave.output.dir = dir.join("slave");

        (master, slave)
    }
}

#[cfg(test)]
mod config_tests {
    use config_loader::{ConfigFormat, ConfigLoader};
    use contracts::{NodeBlueprint, NodeRole, TransferMode};

    #[test]
    fn test_blueprint_survives_toml_and_json() {
        let mut blueprint = NodeBlueprint::for_role(NodeRole::Slave);
        blueprint.acquisition.channels = vec![1, 4];
        blueprint.estimation.transfer = TransferMode::Full;
        blueprint.instrument.clock_offset = -2_500;

        let toml = ConfigLoader::to_toml(&blueprint).unwrap();
        let from_toml = ConfigLoader::load_from_str(&toml, ConfigFormat::Toml).unwrap();
        assert_eq!(from_toml.role(), NodeRole::Slave);
        assert_eq!(from_toml.acquisition.channels, vec![1, 4]);
        assert_eq!(from_toml.instrument.clock_offset, -2_500);

        let json = ConfigLoader::to_json(&blueprint).unwrap();
        let from_json = ConfigLoader::load_from_str(&json, ConfigFormat::Json).unwrap();
        assert_eq!(from_json.estimation.transfer, TransferMode::Full);
    }

    #[test]
    fn test_port_collision_is_rejected() {
        let mut blueprint = NodeBlueprint::for_role(NodeRole::Master);
        blueprint.network.data_port = blueprint.network.notify_port;
        let toml = ConfigLoader::to_toml(&blueprint).unwrap();

        let err = ConfigLoader::load_from_str(&toml, ConfigFormat::Toml).unwrap_err();
        assert_eq!(err.phase(), contracts::Phase::Config);
    }
}

#[cfg(test)]
mod e2e_tests {
    use std::sync::Arc;
    use std::time::{Duration, Instant};

    use contracts::{NodeBlueprint, SessionState, SyncError, TransferMode};
    use coordinator::{MasterCoordinator, SlaveCoordinator};
    use instrument::MockInstrument;
    use tokio::task::JoinHandle;
    use tokio_util::sync::CancellationToken;

    use crate::support::loopback_pair;

    /// Slave clock offset in instrument units (ps)
    const SLAVE_OFFSET_PS: i64 = 50_000;

    struct RunningSlave {
        slave: Arc<SlaveCoordinator<MockInstrument>>,
        shutdown: CancellationToken,
        task: JoinHandle<Result<(), SyncError>>,
    }

    impl RunningSlave {
        async fn start(blueprint: NodeBlueprint) -> Self {
            let instrument = MockInstrument::new(blueprint.instrument.clone());
            let slave = Arc::new(SlaveCoordinator::bind(blueprint, instrument).await.unwrap());
            let shutdown = CancellationToken::new();
            let task = tokio::spawn(Arc::clone(&slave).serve(shutdown.clone()));
            Self {
                slave,
                shutdown,
                task,
            }
        }

        async fn stop(self) {
            self.shutdown.cancel();
            self.task.await.unwrap().unwrap();
        }
    }

    async fn start_master(blueprint: NodeBlueprint) -> MasterCoordinator<MockInstrument> {
        let instrument = MockInstrument::new(blueprint.instrument.clone());
        MasterCoordinator::bind(blueprint, instrument).await.unwrap()
    }

    /// End-to-end test: handshake -> trigger -> acquisition on both nodes -> partial
    /// transfer -> Mode A recovers the configured slave clock offset
    #[tokio::test]
    async fn test_loopback_session_recovers_offset() {
        let dir = tempfile::tempdir().unwrap();
        let (master_bp, mut slave_bp) = loopback_pair(dir.path());
        slave_bp.instrument.clock_offset = SLAVE_OFFSET_PS;

        let slave = RunningSlave::start(slave_bp).await;
        let master = start_master(master_bp).await;

        let result = master.run_session(None, None).await.unwrap();

        assert_eq!(result.session.state, SessionState::Completed);
        assert!(result.session.master_trigger_timestamp_ns > 0);
        assert!(result.session.slave_trigger_timestamp_ns > 0);
        assert!(result.outcome.record_count() > 0);

        let estimate = result.report.estimate.clone().expect("offset estimate");
        assert!(
            (estimate.mean_offset_ns - 50.0).abs() < 1e-6,
            "mean offset {}",
            estimate.mean_offset_ns
        );
        assert!(estimate.std_dev_ns.abs() < 1e-6);
        assert!(estimate.quality_percent > 99.0);

        let alignment = result.report.alignment.clone().expect("start alignment");
        assert!(alignment.slave_start > alignment.master_start);

        let artifacts = &result.report.artifacts;
        let master_dir = dir.path().join("master");
        for name in [
            artifacts.merged_binary.as_ref(),
            artifacts.peer_sample.as_ref(),
            artifacts.corrected_binary.as_ref(),
            artifacts.aligned_binary.as_ref(),
        ] {
            let name = name.expect("artifact recorded");
            assert!(master_dir.join(name).exists(), "{name} missing");
        }
        assert!(result.report_text.exists());
        assert!(result.report_json.exists());

        // slave keeps its own merged copy and returns to an accepting state
        assert!(dir.path().join("slave").join("slave_1_merged.bin").exists());
        assert_eq!(slave.slave.status().last_completed, Some(1));

        master.shutdown().await;
        slave.stop().await;
    }

    #[tokio::test]
    async fn test_back_to_back_sessions_with_full_transfer() {
        let dir = tempfile::tempdir().unwrap();
        let (mut master_bp, mut slave_bp) = loopback_pair(dir.path());
        master_bp.estimation.transfer = TransferMode::Full;
        slave_bp.instrument.clock_offset = -SLAVE_OFFSET_PS;
        master_bp.instrument.clock_offset = 0;

        let slave = RunningSlave::start(slave_bp).await;
        let master = start_master(master_bp).await;

        let first = master.run_session(Some(0.2), None).await.unwrap();
        let second = master.run_session(Some(0.2), Some(vec![1])).await.unwrap();

        assert_eq!(first.session.sequence_id + 1, second.session.sequence_id);
        assert_eq!(second.session.channel_set.len(), 1);
        for result in [&first, &second] {
            let estimate = result.report.estimate.clone().expect("offset estimate");
            assert!((estimate.mean_offset_ns + 50.0).abs() < 1e-6);
            assert_eq!(
                result.report.peer_record_count,
                dispatcher::read_timestamps(
                    &dir.path()
                        .join("master")
                        .join(result.report.artifacts.peer_sample.as_ref().unwrap())
                )
                .unwrap()
                .len() as u64
            );
        }

        master.shutdown().await;
        slave.stop().await;
    }

    /// A slave outlives master restarts; each new master starts again at sequence id 1
    #[tokio::test]
    async fn test_restarted_master_against_running_slave() {
        let dir = tempfile::tempdir().unwrap();
        let (master_bp, mut slave_bp) = loopback_pair(dir.path());
        slave_bp.instrument.clock_offset = SLAVE_OFFSET_PS;

        let slave = RunningSlave::start(slave_bp).await;

        for run in 0..2 {
            let master = start_master(master_bp.clone()).await;
            let result = master
                .run_session(None, None)
                .await
                .unwrap_or_else(|e| panic!("master run {run} failed: {e}"));

            assert_eq!(result.session.sequence_id, 1);
            assert_eq!(result.session.state, SessionState::Completed);
            assert!(result.session.slave_trigger_timestamp_ns > 0);
            let estimate = result.report.estimate.clone().expect("offset estimate");
            assert!((estimate.mean_offset_ns - 50.0).abs() < 1e-6);
            master.shutdown().await;
        }

        assert_eq!(slave.slave.status().last_completed, Some(1));
        slave.stop().await;
    }

    #[tokio::test]
    async fn test_handshake_without_slave_is_bounded() {
        let dir = tempfile::tempdir().unwrap();
        let (mut master_bp, _) = loopback_pair(dir.path());
        master_bp.handshake.max_attempts = 2;
        master_bp.handshake.request_timeout_ms = 100;
        master_bp.handshake.ready_timeout_ms = 100;
        let bound = master_bp.handshake.max_handshake_time();

        let master = start_master(master_bp).await;
        let started = Instant::now();
        let err = master.run_session(None, None).await.unwrap_err();

        assert!(matches!(err, SyncError::HandshakeTimeout { attempts: 2, .. }));
        assert!(started.elapsed() < bound + Duration::from_secs(2));

        let session = master.session().unwrap();
        assert_eq!(session.state, SessionState::Error);
        assert!(session.error_message.unwrap().starts_with("handshake failed"));
        assert!(!master.status().acquisition_active);

        master.shutdown().await;
    }

    /// A channel that never produces data closes after the stall bound; the
    /// session still completes on the remaining channel
    #[tokio::test]
    async fn test_silent_slave_channel_degrades() {
        let dir = tempfile::tempdir().unwrap();
        let (master_bp, mut slave_bp) = loopback_pair(dir.path());
        slave_bp.instrument.silent_channels = vec![2];

        let slave = RunningSlave::start(slave_bp).await;
        let master = start_master(master_bp).await;

        let result = master.run_session(None, None).await.unwrap();
        assert_eq!(result.session.state, SessionState::Completed);
        assert!(result.report.peer_record_count > 0);
        assert!(result.report.estimate.is_some() || result.report.estimate_note.is_some());

        master.shutdown().await;
        slave.stop().await;
    }
}

#[cfg(test)]
mod format_tests {
    use contracts::{MergedRecord, RecordLayout};

    #[test]
    fn test_convert_chain_keeps_timestamps() {
        let dir = tempfile::tempdir().unwrap();
        let records: Vec<MergedRecord> = (0..50u64)
            .map(|i| MergedRecord {
                global_index: i,
                timestamp: 1_000_000 + i * 137,
                channel: (i % 3) as u8 + 1,
            })
            .collect();

        let text = dir.path().join("merged.txt");
        dispatcher::write_text(&text, &records, &["loopback".to_string()]).unwrap();

        let tagged = dir.path().join("merged.bin");
        assert_eq!(dispatcher::convert(&text, &tagged, RecordLayout::Tagged).unwrap(), 50);
        assert_eq!(dispatcher::read_records(&tagged).unwrap(), records);

        let plain = dir.path().join("plain.bin");
        dispatcher::convert(&tagged, &plain, RecordLayout::Plain).unwrap();
        let back = dir.path().join("plain.txt");
        dispatcher::convert(&plain, &back, RecordLayout::Tagged).unwrap();

        let restored = dispatcher::read_records(&back).unwrap();
        assert_eq!(restored.len(), records.len());
        assert!(restored.iter().all(|r| r.channel == 0));
        assert!(restored
            .iter()
            .zip(&records)
            .all(|(a, b)| a.timestamp == b.timestamp));
    }
}
