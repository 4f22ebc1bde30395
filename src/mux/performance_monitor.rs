//! 性能监控模块
//!
//! 按面板统计读写字节数和读事件速率。热路径上只有原子自增，不持有任何锁

use dashmap::DashMap;
use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Instant, SystemTime, UNIX_EPOCH};
use tracing::{debug, warn};

use crate::mux::PaneId;

/// 单个面板的计数器，由 I/O 线程直接持有
#[derive(Debug)]
pub struct PaneCounters {
    bytes_read: AtomicU64,
    bytes_written: AtomicU64,
    read_events: AtomicU64,
    write_events: AtomicU64,
    last_activity_ms: AtomicU64,
    created_at: Instant,
}

impl PaneCounters {
    fn new() -> Self {
        Self {
            bytes_read: AtomicU64::new(0),
            bytes_written: AtomicU64::new(0),
            read_events: AtomicU64::new(0),
            write_events: AtomicU64::new(0),
            last_activity_ms: AtomicU64::new(unix_millis()),
            created_at: Instant::now(),
        }
    }

    pub fn record_read(&self, bytes: usize) {
        self.bytes_read.fetch_add(bytes as u64, Ordering::Relaxed);
        self.read_events.fetch_add(1, Ordering::Relaxed);
        self.last_activity_ms.store(unix_millis(), Ordering::Relaxed);
    }

    pub fn record_write(&self, bytes: usize) {
        self.bytes_written.fetch_add(bytes as u64, Ordering::Relaxed);
        self.write_events.fetch_add(1, Ordering::Relaxed);
        self.last_activity_ms.store(unix_millis(), Ordering::Relaxed);
    }

    fn snapshot(&self, pane_id: PaneId) -> PaneMetrics {
        let elapsed = self.created_at.elapsed().as_secs_f64();
        let bytes_read = self.bytes_read.load(Ordering::Relaxed);
        let read_events = self.read_events.load(Ordering::Relaxed);
        let (read_event_rate, read_throughput) = if elapsed > 0.0 {
            (read_events as f64 / elapsed, bytes_read as f64 / elapsed)
        } else {
            (0.0, 0.0)
        };

        PaneMetrics {
            pane_id,
            bytes_read,
            bytes_written: self.bytes_written.load(Ordering::Relaxed),
            read_events,
            write_events: self.write_events.load(Ordering::Relaxed),
            read_event_rate,
            read_throughput,
            age_seconds: self.created_at.elapsed().as_secs(),
            last_activity_ms: self.last_activity_ms.load(Ordering::Relaxed),
        }
    }
}

fn unix_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or_default()
}

/// 单个面板的指标快照
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PaneMetrics {
    pub pane_id: PaneId,
    pub bytes_read: u64,
    pub bytes_written: u64,
    pub read_events: u64,
    pub write_events: u64,
    /// 每秒读事件数（自面板创建起）
    pub read_event_rate: f64,
    /// 每秒读取字节数（自面板创建起）
    pub read_throughput: f64,
    pub age_seconds: u64,
    pub last_activity_ms: u64,
}

/// 性能指标
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PerformanceMetrics {
    /// 当前活跃面板数量
    pub active_panes: usize,
    /// 已退役面板累计读取字节数也计入总数
    pub total_bytes_read: u64,
    pub total_bytes_written: u64,
    pub total_read_events: u64,
    /// 平均每次读事件的字节数
    pub avg_chunk_size: f64,
    /// 运行时长（秒）
    pub uptime_seconds: u64,
    pub panes: Vec<PaneMetrics>,
}

/// 性能监控器
pub struct PerformanceMonitor {
    start_time: Instant,
    panes: DashMap<PaneId, Arc<PaneCounters>>,
    retired_bytes_read: AtomicU64,
    retired_bytes_written: AtomicU64,
    retired_read_events: AtomicU64,
}

impl PerformanceMonitor {
    pub fn new() -> Self {
        debug!("启动性能监控器");
        Self {
            start_time: Instant::now(),
            panes: DashMap::new(),
            retired_bytes_read: AtomicU64::new(0),
            retired_bytes_written: AtomicU64::new(0),
            retired_read_events: AtomicU64::new(0),
        }
    }

    /// 为面板注册计数器，重复注册返回同一个实例
    pub fn register(&self, pane_id: PaneId) -> Arc<PaneCounters> {
        Arc::clone(
            self.panes
                .entry(pane_id)
                .or_insert_with(|| Arc::new(PaneCounters::new()))
                .value(),
        )
    }

    /// 注销面板，计数并入累计值
    pub fn unregister(&self, pane_id: PaneId) {
        if let Some((_, counters)) = self.panes.remove(&pane_id) {
            self.retired_bytes_read
                .fetch_add(counters.bytes_read.load(Ordering::Relaxed), Ordering::Relaxed);
            self.retired_bytes_written.fetch_add(
                counters.bytes_written.load(Ordering::Relaxed),
                Ordering::Relaxed,
            );
            self.retired_read_events
                .fetch_add(counters.read_events.load(Ordering::Relaxed), Ordering::Relaxed);
        }
    }

    pub fn counters(&self, pane_id: PaneId) -> Option<Arc<PaneCounters>> {
        self.panes.get(&pane_id).map(|entry| Arc::clone(entry.value()))
    }

    pub fn pane_metrics(&self, pane_id: PaneId) -> Option<PaneMetrics> {
        self.panes
            .get(&pane_id)
            .map(|entry| entry.value().snapshot(pane_id))
    }

    /// 收集性能指标
    pub fn snapshot(&self) -> PerformanceMetrics {
        let mut panes: Vec<PaneMetrics> = self
            .panes
            .iter()
            .map(|entry| entry.value().snapshot(*entry.key()))
            .collect();
        panes.sort_by_key(|metrics| metrics.pane_id);

        let total_bytes_read = self.retired_bytes_read.load(Ordering::Relaxed)
            + panes.iter().map(|p| p.bytes_read).sum::<u64>();
        let total_bytes_written = self.retired_bytes_written.load(Ordering::Relaxed)
            + panes.iter().map(|p| p.bytes_written).sum::<u64>();
        let total_read_events = self.retired_read_events.load(Ordering::Relaxed)
            + panes.iter().map(|p| p.read_events).sum::<u64>();

        let avg_chunk_size = if total_read_events > 0 {
            total_bytes_read as f64 / total_read_events as f64
        } else {
            0.0
        };

        PerformanceMetrics {
            active_panes: panes.len(),
            total_bytes_read,
            total_bytes_written,
            total_read_events,
            avg_chunk_size,
            uptime_seconds: self.start_time.elapsed().as_secs(),
            panes,
        }
    }

    /// 检查性能警告
    pub fn check_performance_warnings(&self, metrics: &PerformanceMetrics, warn_pane_count: usize) {
        if metrics.active_panes > warn_pane_count {
            warn!("活跃面板数量较多: {}", metrics.active_panes);
        }

        for pane in &metrics.panes {
            // 大量极小的读事件意味着订阅端压力集中在事件数而不是字节数
            if pane.read_events > 10_000 {
                let avg = pane.bytes_read as f64 / pane.read_events as f64;
                if avg < 16.0 {
                    warn!(
                        "面板 {} 平均读块仅 {:.2} 字节，读事件速率 {:.1}/s",
                        pane.pane_id, avg, pane.read_event_rate
                    );
                }
            }
        }
    }

    /// 生成性能报告
    pub fn generate_report(&self, metrics: &PerformanceMetrics) -> String {
        let throughput = if metrics.uptime_seconds > 0 {
            metrics.total_bytes_read as f64 / metrics.uptime_seconds as f64
        } else {
            0.0
        };

        let mut report = format!(
            r#"
=== OrbitX Mux 性能报告 ===
运行时长: {}
活跃面板: {}
总读取: {}
总写入: {}
总读事件数: {}
平均读块大小: {:.2} 字节
平均吞吐量: {}/s
"#,
            utils::format_duration(metrics.uptime_seconds),
            metrics.active_panes,
            utils::format_bytes(metrics.total_bytes_read),
            utils::format_bytes(metrics.total_bytes_written),
            metrics.total_read_events,
            metrics.avg_chunk_size,
            utils::format_bytes(throughput as u64),
        );

        for pane in &metrics.panes {
            report.push_str(&format!(
                "面板 {}: 读 {} / 写 {}, {:.1} 事件/s\n",
                pane.pane_id,
                utils::format_bytes(pane.bytes_read),
                utils::format_bytes(pane.bytes_written),
                pane.read_event_rate
            ));
        }
        report.push_str("===========================\n");
        report
    }

    /// 比较两个指标的差异
    pub fn compare_metrics(
        &self,
        current: &PerformanceMetrics,
        previous: &PerformanceMetrics,
    ) -> String {
        let pane_diff = current.active_panes as i64 - previous.active_panes as i64;
        let read_diff = current
            .total_bytes_read
            .saturating_sub(previous.total_bytes_read);
        let write_diff = current
            .total_bytes_written
            .saturating_sub(previous.total_bytes_written);
        let event_diff = current
            .total_read_events
            .saturating_sub(previous.total_read_events);

        format!(
            r#"
=== 性能指标变化 ===
面板数变化: {:+}
新读取: {}
新写入: {}
新读事件数: {}
==================
"#,
            pane_diff,
            utils::format_bytes(read_diff),
            utils::format_bytes(write_diff),
            event_diff
        )
    }
}

impl Default for PerformanceMonitor {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for PerformanceMonitor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PerformanceMonitor")
            .field("tracked_panes", &self.panes.len())
            .finish()
    }
}

/// 性能监控工具函数
pub mod utils {
    /// 格式化字节数为人类可读格式
    pub fn format_bytes(bytes: u64) -> String {
        const UNITS: &[&str] = &["B", "KB", "MB", "GB", "TB"];
        let mut size = bytes as f64;
        let mut unit_index = 0;

        while size >= 1024.0 && unit_index < UNITS.len() - 1 {
            size /= 1024.0;
            unit_index += 1;
        }

        format!("{:.2} {}", size, UNITS[unit_index])
    }

    /// 格式化持续时间为人类可读格式
    pub fn format_duration(seconds: u64) -> String {
        let hours = seconds / 3600;
        let minutes = (seconds % 3600) / 60;
        let secs = seconds % 60;

        if hours > 0 {
            format!("{}h {}m {}s", hours, minutes, secs)
        } else if minutes > 0 {
            format!("{}m {}s", minutes, secs)
        } else {
            format!("{}s", secs)
        }
    }
}
