//! Window statistics owned by the aggregator task.

use serde::Serialize;
use std::collections::HashMap;
use std::time::Duration;
use tokio::time::Instant;

use super::latency::{LatencyDistribution, Percentiles};

const KIB: f64 = 1024.0;
const MIB: f64 = 1024.0 * 1024.0;
const GIB: f64 = 1024.0 * 1024.0 * 1024.0;

/// One flushed reporting window.
#[derive(Debug, Clone, Serialize)]
pub struct WindowReport {
    /// Busy operation-time over wall-time, in-flight work included.
    pub load: f64,
    pub bytes: u64,
    pub ops: u64,
    pub bytes_per_sec: f64,
    pub ops_per_sec: f64,
    #[serde(with = "humantime_serde")]
    pub window: Duration,
    /// `[max, p99, p95, p50, min]` latencies of operations completed in the window.
    #[serde(with = "humantime_serde")]
    pub lat_max: Duration,
    #[serde(with = "humantime_serde")]
    pub lat_99: Duration,
    #[serde(with = "humantime_serde")]
    pub lat_95: Duration,
    #[serde(with = "humantime_serde")]
    pub lat_50: Duration,
    #[serde(with = "humantime_serde")]
    pub lat_min: Duration,
    /// Operations still active when the window closed.
    pub active: usize,
}

impl WindowReport {
    pub const HEADER: &'static str = "Load   Bytes    Ops   Max  99th  95th  50th   Min";

    /// Fixed-width line matching [`WindowReport::HEADER`].
    pub fn line(&self) -> String {
        format!(
            "{:4.1} {} {} {} {} {} {} {}",
            self.load,
            format_bytes_rate(self.bytes_per_sec),
            format_ops_rate(self.ops_per_sec),
            format_duration(self.lat_max),
            format_duration(self.lat_99),
            format_duration(self.lat_95),
            format_duration(self.lat_50),
            format_duration(self.lat_min),
        )
    }
}

/// Counters and in-flight operations for the current window.
///
/// Only the aggregator task touches this; every method takes `now` so the
/// arithmetic is independent of the clock.
#[derive(Debug)]
pub struct WindowStats {
    window_start: Instant,
    completed_ops: u64,
    completed_bytes: u64,
    completed_op_time: Duration,
    latency: LatencyDistribution,
    percentiles: Percentiles,
    active_ops: HashMap<String, Instant>,
}

impl WindowStats {
    pub fn new(now: Instant, percentiles: Percentiles) -> Self {
        Self {
            window_start: now,
            completed_ops: 0,
            completed_bytes: 0,
            completed_op_time: Duration::ZERO,
            latency: LatencyDistribution::new(),
            percentiles,
            active_ops: HashMap::new(),
        }
    }

    pub fn active(&self) -> usize {
        self.active_ops.len()
    }

    pub fn completed_ops(&self) -> u64 {
        self.completed_ops
    }

    pub fn completed_bytes(&self) -> u64 {
        self.completed_bytes
    }

    pub fn start_op(&mut self, id: &str, now: Instant) {
        self.active_ops.insert(id.to_string(), now);
    }

    /// Forget an operation. Windows already flushed keep whatever load it
    /// contributed; nothing is counted from here on.
    pub fn cancel_op(&mut self, id: &str) {
        self.active_ops.remove(id);
    }

    /// Complete an operation and return its runtime; zero for unknown ids.
    pub fn done_op(&mut self, id: &str, bytes: u64, now: Instant) -> Duration {
        let Some(started) = self.active_ops.remove(id) else {
            return Duration::ZERO;
        };

        let runtime = now.saturating_duration_since(started);
        self.completed_ops += 1;
        self.completed_bytes += bytes;
        self.completed_op_time += now.saturating_duration_since(started.max(self.window_start));
        self.latency.add(1, runtime);
        runtime
    }

    /// Close the window: compute the report, then reset counters and latency
    /// while keeping active operations.
    pub fn flush(&mut self, now: Instant) -> WindowReport {
        let window = now.saturating_duration_since(self.window_start);
        let latencies = self.latency.percentiles(&self.percentiles);
        let lat = |i: usize| latencies.get(i).copied().unwrap_or_default();

        let mut busy = self.completed_op_time;
        for started in self.active_ops.values() {
            busy += now.saturating_duration_since((*started).max(self.window_start));
        }

        let secs = window.as_secs_f64();
        let per_sec = |v: f64| if secs > 0.0 { v / secs } else { 0.0 };

        let report = WindowReport {
            load: per_sec(busy.as_secs_f64()),
            bytes: self.completed_bytes,
            ops: self.completed_ops,
            bytes_per_sec: per_sec(self.completed_bytes as f64),
            ops_per_sec: per_sec(self.completed_ops as f64),
            window,
            lat_max: lat(0),
            lat_99: lat(1),
            lat_95: lat(2),
            lat_50: lat(3),
            lat_min: lat(4),
            active: self.active_ops.len(),
        };

        self.window_start = now;
        self.completed_ops = 0;
        self.completed_bytes = 0;
        self.completed_op_time = Duration::ZERO;
        self.latency.clear();

        report
    }
}

pub(crate) fn format_duration(d: Duration) -> String {
    if d >= Duration::from_secs(60) {
        format!("{:3}m ", d.as_secs() / 60)
    } else if d >= Duration::from_secs(1) {
        format!("{:3}s ", d.as_secs())
    } else if d >= Duration::from_millis(1) {
        format!("{:3}ms", d.as_millis())
    } else if d >= Duration::from_micros(1) {
        format!("{:3}μs", d.as_micros())
    } else {
        format!("{:3}ns", d.as_nanos())
    }
}

pub(crate) fn format_bytes_rate(bytes: f64) -> String {
    if bytes > GIB {
        format!("{:3.0}GB/s", bytes / GIB)
    } else if bytes > MIB {
        format!("{:3.0}MB/s", bytes / MIB)
    } else if bytes > KIB {
        format!("{:3.0}KB/s", bytes / KIB)
    } else {
        format!("{:3.0} B/s", bytes)
    }
}

pub(crate) fn format_ops_rate(ops: f64) -> String {
    if ops > 1e9 {
        format!("{:3.0}g/s", ops / 1e9)
    } else if ops > 1e6 {
        format!("{:3.0}m/s", ops / 1e6)
    } else if ops > 1e3 {
        format!("{:3.0}k/s", ops / 1e3)
    } else {
        format!("{:3.0} /s", ops)
    }
}
