//! Session 指标收集模块
//!
//! 记录合并、握手、偏移估计与传输的运行指标，并在内存中聚合会话摘要。

use std::collections::BTreeMap;

use contracts::{ChannelId, MergeSummary, MergedBatch, OffsetEstimate};
use metrics::{counter, gauge, histogram};

/// 从 MergedBatch 记录指标
///
/// 每次合并线程释放一个窗口时调用。
///
/// # Example
///
/// ```ignore
/// use observability::metrics::record_batch_metrics;
///
/// for batch in merger.push(block) {
///     record_batch_metrics(&batch);
///     // ...
/// }
/// ```
pub fn record_batch_metrics(batch: &MergedBatch) {
    counter!("tagsync_windows_released_total").increment(1);
    gauge!("tagsync_last_window_index").set(batch.window_index as f64);

    counter!("tagsync_records_emitted_total").increment(batch.len() as u64);
    histogram!("tagsync_window_records").record(batch.len() as f64);

    // 停滞窗口
    if batch.is_degraded() {
        counter!("tagsync_windows_stalled_total").increment(1);
        for channel in &batch.missing_channels {
            counter!("tagsync_channel_stalls_total", "channel" => channel.to_string())
                .increment(1);
        }
    } else {
        counter!("tagsync_windows_merged_total").increment(1);
    }
}

/// 记录合并结束时的丢弃计数
pub fn record_merge_summary(summary: &MergeSummary) {
    counter!("tagsync_late_blocks_dropped_total").increment(summary.late_blocks_dropped);
    counter!("tagsync_overflow_blocks_dropped_total").increment(summary.overflow_blocks_dropped);
    counter!("tagsync_trailing_windows_dropped_total")
        .increment(summary.trailing_windows_dropped);
    counter!("tagsync_order_violations_total").increment(summary.order_violations);
    gauge!("tagsync_channels_closed").set(summary.closed_channels.len() as f64);
}

/// 记录缓冲区深度
pub fn record_buffer_depth(channel: ChannelId, depth: usize) {
    gauge!("tagsync_buffer_depth", "channel" => channel.to_string()).set(depth as f64);
}

/// 记录握手尝试
pub fn record_handshake_attempt(success: bool) {
    let status = if success { "success" } else { "failure" };
    counter!("tagsync_handshake_attempts_total", "status" => status).increment(1);
}

/// 记录触发重发
pub fn record_trigger_resend() {
    counter!("tagsync_trigger_resends_total").increment(1);
}

/// 记录会话结果
pub fn record_session_outcome(phase: Option<&'static str>) {
    match phase {
        None => counter!("tagsync_sessions_total", "status" => "completed").increment(1),
        Some(phase) => {
            counter!("tagsync_sessions_total", "status" => "error", "phase" => phase).increment(1)
        }
    }
}

/// 记录偏移估计
pub fn record_offset_estimate(estimate: &OffsetEstimate) {
    gauge!("tagsync_offset_mean_ns").set(estimate.mean_offset_ns);
    gauge!("tagsync_offset_std_dev_ns").set(estimate.std_dev_ns);
    gauge!("tagsync_offset_quality_percent").set(estimate.quality_percent);
    histogram!("tagsync_offset_samples").record(estimate.sample_count as f64);
}

/// 记录传输字节
pub fn record_transfer_bytes(direction: &'static str, bytes: u64) {
    counter!("tagsync_transfer_bytes_total", "direction" => direction).increment(bytes);
}

/// 记录批次分发
pub fn record_batch_dispatched(sink_name: &str, success: bool) {
    let status = if success { "success" } else { "failure" };
    counter!(
        "tagsync_batches_dispatched_total",
        "sink" => sink_name.to_string(),
        "status" => status.to_string()
    )
    .increment(1);
}

/// 会话指标聚合器
///
/// 在内存中聚合指标，便于统计和输出摘要。
#[derive(Debug, Clone, Default)]
pub struct SessionMetricsAggregator {
    /// 释放的窗口数
    pub total_windows: u64,

    /// 输出记录数
    pub total_records: u64,

    /// 有缺失通道的窗口数
    pub degraded_windows: u64,

    /// 每窗口记录数统计
    pub window_records: RunningStats,

    /// 各通道记录数
    pub channel_records: BTreeMap<ChannelId, u64>,

    /// 各通道缺失次数
    pub missing_counts: BTreeMap<ChannelId, u64>,
}

impl SessionMetricsAggregator {
    /// 创建新的聚合器
    pub fn new() -> Self {
        Self::default()
    }

    /// 更新聚合统计
    pub fn update(&mut self, batch: &MergedBatch) {
        self.total_windows += 1;
        self.total_records += batch.len() as u64;
        self.window_records.push(batch.len() as f64);

        for record in &batch.records {
            *self.channel_records.entry(record.channel).or_insert(0) += 1;
        }

        if batch.is_degraded() {
            self.degraded_windows += 1;
            for channel in &batch.missing_channels {
                *self.missing_counts.entry(*channel).or_insert(0) += 1;
            }
        }
    }

    /// 有缺失通道的窗口占比 (%)
    pub fn degraded_rate(&self) -> f64 {
        if self.total_windows == 0 {
            0.0
        } else {
            self.degraded_windows as f64 / self.total_windows as f64 * 100.0
        }
    }
}

/// 在线统计计算器 (Welford's algorithm)
#[derive(Debug, Clone, Default)]
pub struct RunningStats {
    count: u64,
    mean: f64,
    m2: f64,
    min: f64,
    max: f64,
}

impl RunningStats {
    /// 添加新值
    pub fn push(&mut self, value: f64) {
        self.count += 1;

        if self.count == 1 {
            self.min = value;
            self.max = value;
            self.mean = value;
            self.m2 = 0.0;
        } else {
            self.min = self.min.min(value);
            self.max = self.max.max(value);

            let delta = value - self.mean;
            self.mean += delta / self.count as f64;
            let delta2 = value - self.mean;
            self.m2 += delta * delta2;
        }
    }

    /// 样本数量
    pub fn count(&self) -> u64 {
        self.count
    }

    /// 均值
    pub fn mean(&self) -> f64 {
        if self.count == 0 {
            0.0
        } else {
            self.mean
        }
    }

    /// 方差
    pub fn variance(&self) -> f64 {
        if self.count < 2 {
            0.0
        } else {
            self.m2 / (self.count - 1) as f64
        }
    }

    /// 标准差
    pub fn std_dev(&self) -> f64 {
        self.variance().sqrt()
    }

    /// 最小值
    pub fn min(&self) -> f64 {
        self.min
    }

    /// 最大值
    pub fn max(&self) -> f64 {
        self.max
    }
}
