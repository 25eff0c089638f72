//! Live operational telemetry.
//!
//! A single aggregator task owns all window statistics and is mutated only by
//! events taken from its FIFO queue, so no lock guards the counters:
//! ```text
//!   StatsHandle::start_task ─┐
//!   StatsHandle::done_task  ─┼─▶ [ event queue ] ─▶ aggregator task ─▶ report log line
//!   StatsHandle::cancel_task ┘                          │
//!                                                       └─▶ idle timeout ─▶ cancel token
//! ```
//! Events from one producer are applied in send order; callers must send
//! `Start` before the matching `Done`/`Cancel`.

mod latency;
mod window;

pub use latency::{LatencyDistribution, Percentiles};
pub use window::{WindowReport, WindowStats};

use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{interval_at, sleep_until, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

use crate::types::{CorrelationId, StatsConfig};

/// Telemetry event, consumed exactly once by the aggregator.
#[derive(Debug, Clone, PartialEq)]
pub enum StatsEvent {
    Start { id: CorrelationId },
    Cancel { id: CorrelationId },
    Done { id: CorrelationId, bytes: u64 },
    /// `None` disables the idle timeout.
    SetIdleTimeout { timeout: Option<Duration> },
}

/// Cheap, cloneable sender side of the event queue.
///
/// The only legal way to mutate telemetry state.
#[derive(Debug, Clone)]
pub struct StatsHandle {
    tx: mpsc::UnboundedSender<StatsEvent>,
}

impl StatsHandle {
    pub fn start_task(&self, id: impl Into<CorrelationId>) {
        self.send(StatsEvent::Start { id: id.into() });
    }

    pub fn cancel_task(&self, id: impl Into<CorrelationId>) {
        self.send(StatsEvent::Cancel { id: id.into() });
    }

    pub fn done_task(&self, id: impl Into<CorrelationId>, bytes: u64) {
        self.send(StatsEvent::Done {
            id: id.into(),
            bytes,
        });
    }

    pub fn set_idle_timeout(&self, timeout: Option<Duration>) {
        self.send(StatsEvent::SetIdleTimeout { timeout });
    }

    fn send(&self, event: StatsEvent) {
        if self.tx.send(event).is_err() {
            tracing::debug!("stats aggregator stopped, event dropped");
        }
    }
}

/// Owner of the aggregator task.
#[derive(Debug)]
pub struct StatsService {
    handle: StatsHandle,
    shutdown: CancellationToken,
    task: JoinHandle<()>,
}

impl StatsService {
    /// Spawn the aggregator.
    ///
    /// `cancel` is the process-wide token: the aggregator exits when it fires
    /// and fires it itself once the idle timeout elapses.
    pub fn spawn(config: &StatsConfig, cancel: CancellationToken) -> Self {
        Self::spawn_inner(config, cancel, None)
    }

    /// Spawn the aggregator and also receive every window report.
    pub fn spawn_with_reports(
        config: &StatsConfig,
        cancel: CancellationToken,
    ) -> (Self, mpsc::UnboundedReceiver<WindowReport>) {
        let (report_tx, report_rx) = mpsc::unbounded_channel();
        (Self::spawn_inner(config, cancel, Some(report_tx)), report_rx)
    }

    fn spawn_inner(
        config: &StatsConfig,
        cancel: CancellationToken,
        reports: Option<mpsc::UnboundedSender<WindowReport>>,
    ) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        let shutdown = CancellationToken::new();

        tracing::info!(
            frequency = ?config.freq,
            log_all = config.log_all,
            "showing statistics"
        );

        let aggregator = Aggregator {
            rx,
            cancel,
            shutdown: shutdown.clone(),
            freq: config.freq,
            log_all: config.log_all,
            log_json: config.log_json,
            reports,
            header_shown: false,
        };
        let task = tokio::spawn(aggregator.run());

        Self {
            handle: StatsHandle { tx },
            shutdown,
            task,
        }
    }

    pub fn handle(&self) -> StatsHandle {
        self.handle.clone()
    }

    /// Close the queue, apply what is already queued, log a final flush and
    /// wait for the aggregator to exit.
    pub async fn stop(self) {
        self.shutdown.cancel();
        if let Err(e) = self.task.await {
            tracing::error!("stats aggregator failed: {}", e);
        }
    }
}

#[derive(Debug)]
struct Aggregator {
    rx: mpsc::UnboundedReceiver<StatsEvent>,
    cancel: CancellationToken,
    shutdown: CancellationToken,
    freq: Duration,
    log_all: bool,
    log_json: bool,
    reports: Option<mpsc::UnboundedSender<WindowReport>>,
    header_shown: bool,
}

impl Aggregator {
    async fn run(mut self) {
        let start = Instant::now();
        let mut window = WindowStats::new(start, Percentiles::report());
        let mut ticker = interval_at(start + self.freq, self.freq);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        let mut idle_timeout: Option<Duration> = None;
        let mut idle_since: Option<Instant> = None;

        loop {
            let idle_deadline = idle_since.zip(idle_timeout).map(|(since, t)| since + t);

            tokio::select! {
                _ = self.cancel.cancelled() => {
                    self.drain(&mut window, &mut idle_timeout).await;
                    break;
                }
                _ = self.shutdown.cancelled() => {
                    self.drain(&mut window, &mut idle_timeout).await;
                    break;
                }
                event = self.rx.recv() => {
                    let Some(event) = event else { break };
                    self.apply(&mut window, &mut idle_timeout, event);

                    if window.active() == 0 {
                        idle_since.get_or_insert_with(Instant::now);
                    } else {
                        idle_since = None;
                    }
                }
                _ = ticker.tick() => {
                    let report = window.flush(Instant::now());
                    self.emit(report);
                }
                _ = wait_until(idle_deadline) => {
                    tracing::info!(idle_timeout = ?idle_timeout, "idle timeout reached, cancelling");
                    self.cancel.cancel();
                    idle_since = None;
                }
            }
        }

        let report = window.flush(Instant::now());
        self.emit(report);
    }

    /// Apply whatever is already queued; later events are dropped.
    async fn drain(&mut self, window: &mut WindowStats, idle_timeout: &mut Option<Duration>) {
        self.rx.close();
        while let Some(event) = self.rx.recv().await {
            self.apply(window, idle_timeout, event);
        }
    }

    fn apply(
        &self,
        window: &mut WindowStats,
        idle_timeout: &mut Option<Duration>,
        event: StatsEvent,
    ) {
        let now = Instant::now();
        match event {
            StatsEvent::Start { id } => {
                if self.log_all {
                    tracing::info!(id = %id, active = window.active(), "taskStart");
                }
                window.start_op(id.as_str(), now);
            }
            StatsEvent::Cancel { id } => window.cancel_op(id.as_str()),
            StatsEvent::Done { id, bytes } => {
                let runtime = window.done_op(id.as_str(), bytes, now);
                if self.log_all {
                    tracing::info!(id = %id, runtime = ?runtime, bytes, "task");
                }
            }
            StatsEvent::SetIdleTimeout { timeout } => {
                tracing::debug!(idle_timeout = ?timeout, "idle timeout set");
                *idle_timeout = timeout;
            }
        }
    }

    fn emit(&mut self, report: WindowReport) {
        if self.log_json {
            tracing::info!(
                load = report.load,
                bytes = report.bytes,
                ops = report.ops,
                bytes_per_sec = report.bytes_per_sec,
                ops_per_sec = report.ops_per_sec,
                lat_max = ?report.lat_max,
                lat_99 = ?report.lat_99,
                lat_95 = ?report.lat_95,
                lat_50 = ?report.lat_50,
                lat_min = ?report.lat_min,
                active = report.active,
                "statistics"
            );
        } else {
            if !self.header_shown {
                tracing::info!("{}", WindowReport::HEADER);
                self.header_shown = true;
            }
            tracing::info!("{}", report.line());
        }

        if let Some(reports) = &self.reports {
            let _ = reports.send(report);
        }
    }
}

async fn wait_until(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config(freq: Duration) -> StatsConfig {
        StatsConfig {
            freq,
            ..Default::default()
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_idle_timeout_cancels_after_last_done() {
        let cancel = CancellationToken::new();
        let stats = StatsService::spawn(&config(Duration::from_secs(5)), cancel.clone());
        let handle = stats.handle();

        handle.set_idle_timeout(Some(Duration::from_millis(200)));
        handle.start_task("a");
        tokio::time::sleep(Duration::from_millis(500)).await;
        assert!(!cancel.is_cancelled(), "must not fire while work is active");

        handle.done_task("a", 1);
        let done_at = Instant::now();

        tokio::time::sleep(Duration::from_millis(150)).await;
        assert!(!cancel.is_cancelled(), "fired before the timeout elapsed");

        cancel.cancelled().await;
        let elapsed = done_at.elapsed();
        assert!(elapsed >= Duration::from_millis(200));
        assert!(elapsed <= Duration::from_millis(210));

        stats.stop().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_new_start_clears_idle_clock() {
        let cancel = CancellationToken::new();
        let stats = StatsService::spawn(&config(Duration::from_secs(5)), cancel.clone());
        let handle = stats.handle();

        handle.set_idle_timeout(Some(Duration::from_millis(200)));
        tokio::time::sleep(Duration::from_millis(100)).await;
        handle.start_task("a");
        tokio::time::sleep(Duration::from_millis(300)).await;
        assert!(!cancel.is_cancelled());

        handle.cancel_task("a");
        tokio::time::sleep(Duration::from_millis(250)).await;
        assert!(cancel.is_cancelled());

        stats.stop().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_disabled_idle_timeout_never_cancels() {
        let cancel = CancellationToken::new();
        let stats = StatsService::spawn(&config(Duration::from_secs(1)), cancel.clone());
        let handle = stats.handle();

        handle.start_task("a");
        handle.done_task("a", 1);
        tokio::time::sleep(Duration::from_secs(30)).await;
        assert!(!cancel.is_cancelled());

        stats.stop().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_periodic_reports_and_final_flush() {
        let cancel = CancellationToken::new();
        let (stats, mut reports) =
            StatsService::spawn_with_reports(&config(Duration::from_secs(1)), cancel);
        let handle = stats.handle();

        handle.start_task("a");
        tokio::time::sleep(Duration::from_millis(100)).await;
        handle.done_task("a", 64);

        let first = reports.recv().await.unwrap();
        assert_eq!(first.ops, 1);
        assert_eq!(first.bytes, 64);
        assert_eq!(first.lat_max, Duration::from_millis(100));

        handle.start_task("b");
        handle.done_task("b", 1);
        handle.done_task("b", 1);
        stats.stop().await;

        let mut ops = 0;
        while let Some(report) = reports.recv().await {
            ops += report.ops;
        }
        assert_eq!(ops, 1, "duplicate done must not be counted");
    }

    #[tokio::test]
    async fn test_events_after_stop_are_dropped() {
        let cancel = CancellationToken::new();
        let stats = StatsService::spawn(&config(Duration::from_secs(5)), cancel);
        let handle = stats.handle();
        stats.stop().await;
        handle.start_task("late");
    }
}
