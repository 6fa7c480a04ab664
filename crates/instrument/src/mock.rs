//! Mock 时间标记仪
//!
//! 为每个通道建立到监听端口的 TCP 连接，按 PPER 周期发送时间戳块。
//! 事件间隔由 (seed, channel, window) 决定，主从节点使用相同 seed 时序列一致，
//! 仅相差配置的 `clock_offset`。

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use bytes::{BufMut, Bytes, BytesMut};
use contracts::{wall_clock_ns, ChannelId, InstrumentConfig};
use futures::SinkExt;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use tokio::net::TcpStream;
use tokio::task::JoinHandle;
use tokio::time::{interval_at, timeout, Instant, MissedTickBehavior};
use tokio_util::codec::{FramedWrite, LengthDelimitedCodec};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, trace, warn};

use crate::client::{AcquisitionPlan, InstrumentClient};
use crate::error::{InstrumentError, Result};

/// 时钟原点 (ns)，负偏移不会下溢
const CLOCK_ORIGIN_NS: f64 = 1_000_000_000.0;

/// 注入失败场景
#[derive(Debug, Default, Clone)]
pub struct MockFaults {
    pub fail_connect: bool,
    pub fail_configure: bool,
    pub fail_start: bool,
}

/// 运行中的生产者
struct Producers {
    cancel: CancellationToken,
    stop_after: Arc<AtomicU64>,
    started: Instant,
    pper: Duration,
    tasks: Vec<JoinHandle<()>>,
}

/// Mock 时间标记仪
pub struct MockInstrument {
    config: InstrumentConfig,
    faults: MockFaults,
    connected: AtomicBool,
    running: Arc<AtomicBool>,
    plan: Mutex<Option<AcquisitionPlan>>,
    producers: Mutex<Option<Producers>>,
}

impl MockInstrument {
    pub fn new(config: InstrumentConfig) -> Self {
        Self::with_faults(config, MockFaults::default())
    }

    pub fn with_faults(config: InstrumentConfig, faults: MockFaults) -> Self {
        Self {
            config,
            faults,
            connected: AtomicBool::new(false),
            running: Arc::new(AtomicBool::new(false)),
            plan: Mutex::new(None),
            producers: Mutex::new(None),
        }
    }

    fn plan(&self) -> MutexGuard<'_, Option<AcquisitionPlan>> {
        self.plan.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn producers(&self) -> MutexGuard<'_, Option<Producers>> {
        self.producers.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn ensure_connected(&self) -> Result<()> {
        if self.connected.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(InstrumentError::NotConnected)
        }
    }
}

impl InstrumentClient for MockInstrument {
    #[instrument(name = "mock_instrument_connect", skip(self))]
    async fn connect(&mut self) -> Result<()> {
        if self.faults.fail_connect {
            return Err(InstrumentError::command("connect", "injected failure"));
        }
        self.connected.store(true, Ordering::SeqCst);
        Ok(())
    }

    #[instrument(
        name = "mock_instrument_configure",
        skip(self, plan),
        fields(sequence_id = plan.sequence_id, channels = plan.channels.len())
    )]
    async fn configure(&self, plan: &AcquisitionPlan) -> Result<()> {
        self.ensure_connected()?;
        if self.faults.fail_configure {
            return Err(InstrumentError::command("configure", "injected failure"));
        }
        if self.running.load(Ordering::SeqCst) {
            return Err(InstrumentError::command("configure", "acquisition running"));
        }
        *self.plan() = Some(plan.clone());
        Ok(())
    }

    #[instrument(name = "mock_instrument_start", skip(self))]
    async fn start(&self, trigger_timestamp_ns: u64) -> Result<()> {
        self.ensure_connected()?;
        if self.faults.fail_start {
            return Err(InstrumentError::command("start", "injected failure"));
        }
        let plan = self
            .plan()
            .clone()
            .ok_or_else(|| InstrumentError::command("start", "not configured"))?;
        if self.running.swap(true, Ordering::SeqCst) {
            return Err(InstrumentError::command("start", "already running"));
        }

        let cancel = CancellationToken::new();
        let stop_after = Arc::new(AtomicU64::new(u64::MAX));
        let started = Instant::now();

        let mut tasks = Vec::with_capacity(plan.channels.len());
        for (channel, port) in &plan.channels {
            if self.config.silent_channels.contains(channel) {
                debug!(channel, "silent channel, no producer started");
                continue;
            }
            let producer = Producer {
                channel: *channel,
                addr: plan.listener_addr(*port),
                connect_timeout: self.config.connect_timeout(),
                pper: plan.pper,
                started,
                generator: BlockGenerator::new(&self.config, &plan, *channel),
            };
            tasks.push(tokio::spawn(producer.run(cancel.clone(), stop_after.clone())));
        }

        info!(
            sequence_id = plan.sequence_id,
            trigger_timestamp_ns,
            producers = tasks.len(),
            "mock acquisition started"
        );

        *self.producers() = Some(Producers {
            cancel,
            stop_after,
            started,
            pper: plan.pper,
            tasks,
        });
        Ok(())
    }

    #[instrument(name = "mock_instrument_stop", skip(self))]
    async fn stop(&self) -> Result<()> {
        let Some(producers) = self.producers().take() else {
            return Ok(());
        };

        // 所有通道在同一窗口处结束
        let pper_ns = producers.pper.as_nanos().max(1);
        let elapsed_windows = (producers.started.elapsed().as_nanos() / pper_ns) as u64 + 1;
        producers.stop_after.store(elapsed_windows, Ordering::SeqCst);

        let grace = producers.pper * 2 + Duration::from_millis(100);
        for task in producers.tasks {
            let abort = task.abort_handle();
            if timeout(grace, task).await.is_err() {
                warn!("producer did not finish in time, cancelling");
                producers.cancel.cancel();
                abort.abort();
            }
        }
        producers.cancel.cancel();

        self.running.store(false, Ordering::SeqCst);
        info!(windows = elapsed_windows, "mock acquisition stopped");
        Ok(())
    }

    fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }
}

/// 单通道生产者
struct Producer {
    channel: ChannelId,
    addr: String,
    connect_timeout: Duration,
    pper: Duration,
    started: Instant,
    generator: BlockGenerator,
}

impl Producer {
    async fn run(mut self, cancel: CancellationToken, stop_after: Arc<AtomicU64>) {
        let stream = tokio::select! {
            _ = cancel.cancelled() => return,
            result = connect_with_retry(self.channel, &self.addr, self.connect_timeout) => match result {
                Ok(stream) => stream,
                Err(e) => {
                    warn!(channel = self.channel, error = %e, "producer could not connect");
                    return;
                }
            },
        };

        let mut framed = FramedWrite::new(stream, LengthDelimitedCodec::new());
        let mut ticker = interval_at(self.started, self.pper);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Burst);

        let mut window: u64 = 0;
        loop {
            if window >= stop_after.load(Ordering::SeqCst) {
                break;
            }
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {
                    let timestamps = self.generator.window(window);
                    trace!(channel = self.channel, window, events = timestamps.len(), "block sent");
                    if let Err(e) = framed.send(encode_block(&timestamps)).await {
                        warn!(channel = self.channel, error = %e, "producer send failed");
                        break;
                    }
                    window += 1;
                }
            }
        }

        if let Err(e) = SinkExt::<Bytes>::close(&mut framed).await {
            debug!(channel = self.channel, error = %e, "producer close failed");
        }
        debug!(channel = self.channel, windows = window, "producer finished");
    }
}

async fn connect_with_retry(
    channel: ChannelId,
    addr: &str,
    connect_timeout: Duration,
) -> Result<TcpStream> {
    let deadline = Instant::now() + connect_timeout;
    loop {
        match TcpStream::connect(addr).await {
            Ok(stream) => {
                stream.set_nodelay(true)?;
                return Ok(stream);
            }
            Err(e) if Instant::now() >= deadline => {
                return Err(InstrumentError::stream(channel, addr, e.to_string()));
            }
            Err(_) => tokio::time::sleep(Duration::from_millis(20)).await,
        }
    }
}

/// Raw little-endian u64 frame payload
fn encode_block(timestamps: &[u64]) -> Bytes {
    let mut buf = BytesMut::with_capacity(timestamps.len() * 8);
    for ts in timestamps {
        buf.put_u64_le(*ts);
    }
    buf.freeze()
}

/// 确定性时间戳生成
struct BlockGenerator {
    seed: u64,
    channel: ChannelId,
    events: u32,
    origin: u64,
    pwid_units: u64,
    pper_units: u64,
    jitter: u64,
    jitter_rng: StdRng,
}

impl BlockGenerator {
    fn new(config: &InstrumentConfig, plan: &AcquisitionPlan, channel: ChannelId) -> Self {
        let unit = plan.time_unit;
        let origin = unit.from_ns(CLOCK_ORIGIN_NS) as i128 + i128::from(config.clock_offset);
        Self {
            seed: config.seed,
            channel,
            events: config.events_per_window,
            origin: origin.max(0) as u64,
            pwid_units: (unit.from_ns(plan.pwid.as_nanos() as f64) as u64).max(1),
            pper_units: (unit.from_ns(plan.pper.as_nanos() as f64) as u64).max(1),
            jitter: config.jitter,
            jitter_rng: StdRng::seed_from_u64(wall_clock_ns() ^ u64::from(channel)),
        }
    }

    fn window(&mut self, window: u64) -> Vec<u64> {
        let mut rng = StdRng::seed_from_u64(
            self.seed
                ^ (u64::from(self.channel) << 48)
                ^ window.wrapping_mul(0x9E37_79B9_7F4A_7C15),
        );
        let base = self.origin + window * self.pper_units;
        let mut timestamps: Vec<u64> = (0..self.events)
            .map(|_| base + rng.random_range(0..self.pwid_units))
            .collect();
        if self.jitter > 0 {
            for ts in timestamps.iter_mut() {
                *ts += self.jitter_rng.random_range(0..=self.jitter);
            }
        }
        timestamps.sort_unstable();
        timestamps
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use contracts::TimeUnit;
    use futures::StreamExt;
    use tokio::net::TcpListener;
    use tokio_util::codec::FramedRead;

    fn plan(port: u16) -> AcquisitionPlan {
        AcquisitionPlan {
            sequence_id: 1,
            listener_host: "127.0.0.1".into(),
            channels: vec![(1, port)],
            pwid: Duration::from_millis(10),
            pper: Duration::from_millis(12),
            time_unit: TimeUnit::Ps,
        }
    }

    fn decode(frame: &[u8]) -> Vec<u64> {
        frame
            .chunks_exact(8)
            .map(|c| u64::from_le_bytes(c.try_into().unwrap()))
            .collect()
    }

    #[test]
    fn generator_is_deterministic_per_seed() {
        let config = InstrumentConfig::default();
        let p = plan(1);
        let mut a = BlockGenerator::new(&config, &p, 1);
        let mut b = BlockGenerator::new(&config, &p, 1);
        assert_eq!(a.window(3), b.window(3));
        assert_eq!(a.window(3).len(), config.events_per_window as usize);
    }

    #[test]
    fn clock_offset_shifts_every_timestamp() {
        let base = InstrumentConfig::default();
        let shifted = InstrumentConfig {
            clock_offset: 5_000,
            ..InstrumentConfig::default()
        };
        let p = plan(1);
        let a = BlockGenerator::new(&base, &p, 2).window(0);
        let b = BlockGenerator::new(&shifted, &p, 2).window(0);
        for (x, y) in a.iter().zip(&b) {
            assert_eq!(y - x, 5_000);
        }
    }

    #[test]
    fn windows_stay_inside_pwid() {
        let config = InstrumentConfig::default();
        let p = plan(1);
        let mut generator = BlockGenerator::new(&config, &p, 1);
        let w = generator.window(4);
        let start = generator.origin + 4 * generator.pper_units;
        assert!(w.iter().all(|t| *t >= start && *t < start + generator.pwid_units));
        assert!(w.windows(2).all(|p| p[0] <= p[1]));
    }

    #[tokio::test]
    async fn start_requires_connect_and_configure() {
        let mut mock = MockInstrument::new(InstrumentConfig::default());
        assert!(matches!(
            mock.start(1).await,
            Err(InstrumentError::NotConnected)
        ));
        mock.connect().await.unwrap();
        assert!(mock.start(1).await.is_err());
        assert!(!mock.is_running());
    }

    #[tokio::test]
    async fn injected_start_failure() {
        let mut mock = MockInstrument::with_faults(
            InstrumentConfig::default(),
            MockFaults {
                fail_start: true,
                ..Default::default()
            },
        );
        mock.connect().await.unwrap();
        mock.configure(&plan(1)).await.unwrap();
        let err = mock.start(1).await.unwrap_err();
        assert!(err.to_string().contains("start"));
    }

    #[tokio::test]
    async fn streams_blocks_until_stopped() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();

        let config = InstrumentConfig {
            events_per_window: 8,
            ..InstrumentConfig::default()
        };
        let mut mock = MockInstrument::new(config);
        mock.connect().await.unwrap();
        mock.configure(&plan(port)).await.unwrap();
        mock.start(wall_clock_ns()).await.unwrap();
        assert!(mock.is_running());

        let (stream, _) = listener.accept().await.unwrap();
        let mut frames = FramedRead::new(stream, LengthDelimitedCodec::new());

        let first = frames.next().await.unwrap().unwrap();
        assert_eq!(decode(&first).len(), 8);

        tokio::time::sleep(Duration::from_millis(40)).await;
        mock.stop().await.unwrap();
        assert!(!mock.is_running());

        // Remaining frames drain, then EOF
        let mut count = 1;
        while let Some(frame) = frames.next().await {
            frame.unwrap();
            count += 1;
        }
        assert!(count >= 2, "got {count} frames");
    }

    #[tokio::test]
    async fn stop_is_idempotent() {
        let mock = MockInstrument::new(InstrumentConfig::default());
        assert!(mock.stop().await.is_ok());
        assert!(mock.stop().await.is_ok());
    }
}
