//! Load generators: drive a backend or a topic from a payload file.
//!
//! Both share one pipeline: source lines, optionally looped, throttled to
//! the configured rate and ramp, then fanned out over `max_parallel`
//! workers. Every unit of work is bracketed by telemetry so the periodic
//! reports show round-trip latency and throughput.

use bytes::Bytes;
use futures::stream::BoxStream;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;

use crate::broker::{OutboundMessage, Publisher, Subscription};
use crate::flow::{apply_parallel, throttle, ThrottleConfig};
use crate::invoke::Invoke;
use crate::source::read_lines;
use crate::stats::StatsHandle;
use crate::types::{CorrelationId, Error, JobId, Result, SourceConfig, CORRELATION_ATTRIBUTE};

/// Attribute carrying the publish time in Unix nanoseconds.
pub const SOURCE_TIME_ATTRIBUTE: &str = "srcTimeNano";

const RESPONSE_BATCH: usize = 100;

/// The throttled payload sequence described by `source`.
pub fn payloads(
    source: &SourceConfig,
    cancel: CancellationToken,
) -> Result<BoxStream<'static, Result<Bytes>>> {
    let path = source
        .path
        .clone()
        .ok_or_else(|| Error::config("a source file must be configured"))?;
    let lines = read_lines(path, source.looped, cancel.clone());
    Ok(throttle(lines, ThrottleConfig::from(source), cancel))
}

/// Numbers the messages of one load-test run.
#[derive(Debug, Clone)]
struct Sequence {
    job: Arc<JobId>,
    next: Arc<AtomicU64>,
}

impl Sequence {
    fn new() -> Self {
        let job = JobId::new();
        tracing::info!(%job, "starting load test");
        Self {
            job: Arc::new(job),
            next: Arc::new(AtomicU64::new(1)),
        }
    }

    fn next_id(&self) -> CorrelationId {
        self.job.message_id(self.next.fetch_add(1, Ordering::Relaxed))
    }
}

/// Invoke the backend once per payload, stopping at the first failure.
pub async fn run_invoke_load(
    source: &SourceConfig,
    invoker: Arc<dyn Invoke>,
    stats: StatsHandle,
    cancel: CancellationToken,
) -> Result<()> {
    let sequence = Sequence::new();
    let workers = source.max_parallel.max(1);

    apply_parallel(payloads(source, cancel)?, workers, move |payload: Bytes| {
        let (invoker, stats) = (invoker.clone(), stats.clone());
        let id = sequence.next_id();
        async move {
            stats.start_task(id.clone());
            let request_bytes = payload.len();
            match invoker.invoke(payload).await {
                Ok(response) => {
                    stats.done_task(id, (request_bytes + response.len()) as u64);
                    Ok(())
                }
                Err(e) => {
                    stats.cancel_task(id);
                    Err(Error::remote(format!("failed calling backend: {}", e)))
                }
            }
        }
    })
    .await
}

/// Publish one message per payload and measure the round trip.
///
/// With a `responses` subscription, every received response is acked and
/// closes the telemetry bracket of its `srcId`; without one, the publish
/// confirmation closes it. Once the source is exhausted the idle timeout is
/// set to zero, so the run ends as soon as nothing is outstanding.
pub async fn run_publish_load(
    source: &SourceConfig,
    publisher: Arc<dyn Publisher>,
    responses: Option<Arc<dyn Subscription>>,
    stats: StatsHandle,
    cancel: CancellationToken,
) -> Result<()> {
    tracing::info!("statistics are for messages (ops/second = messages per second)");

    let sequence = Sequence::new();
    let workers = source.max_parallel.max(1);
    let publishes = TaskTracker::new();
    let done_on_publish = responses.is_none();

    let receiver = responses.map(|subscription| {
        tokio::spawn(collect_responses(subscription, stats.clone(), cancel.clone()))
    });

    let outstanding = Arc::new(Semaphore::new(source.max_outstanding.max(1)));
    let pending = publishes.clone();
    let (publish_stats, publish_cancel) = (stats.clone(), cancel.clone());
    let sent = apply_parallel(payloads(source, cancel.clone())?, workers, move |payload: Bytes| {
        let id = sequence.next_id();
        let (publisher, outstanding, pending) =
            (publisher.clone(), outstanding.clone(), pending.clone());
        let (stats, cancel) = (publish_stats.clone(), publish_cancel.clone());

        async move {
            // Held until the publish is confirmed.
            let permit = outstanding
                .acquire_owned()
                .await
                .map_err(|_| Error::internal("publish permits closed"))?;

            let message = OutboundMessage {
                data: payload,
                attributes: request_attributes(id.as_str()),
            };
            let bytes = message.data.len() as u64;
            tracing::debug!(src_id = %id, "publishing request");

            stats.start_task(id.clone());
            let confirmation = publisher.publish(message);
            pending.spawn(async move {
                match confirmation.await {
                    Ok(_) if done_on_publish => stats.done_task(id, bytes),
                    Ok(_) => {}
                    Err(e) => {
                        stats.cancel_task(id);
                        if !cancel.is_cancelled() {
                            tracing::warn!(error = %e, "error publishing");
                        }
                    }
                }
                drop(permit);
            });
            Ok::<(), Error>(())
        }
    })
    .await;

    if sent.is_ok() {
        stats.set_idle_timeout(Some(Duration::ZERO));
        cancel.cancelled().await;
        tracing::info!("all sent messages received");
    } else {
        cancel.cancel();
    }

    publishes.close();
    publishes.wait().await;
    if let Some(receiver) = receiver {
        if let Err(e) = receiver.await {
            tracing::warn!(error = %e, "response receiver failed");
        }
    }
    sent
}

/// Ack every response and record its completion until cancelled.
async fn collect_responses(
    subscription: Arc<dyn Subscription>,
    stats: StatsHandle,
    cancel: CancellationToken,
) {
    loop {
        let pulled = tokio::select! {
            _ = cancel.cancelled() => break,
            pulled = subscription.pull(RESPONSE_BATCH) => pulled,
        };
        let batch = match pulled {
            Ok(batch) => batch,
            Err(e) => {
                tracing::warn!(error = %e, "subscription error");
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = tokio::time::sleep(Duration::from_secs(1)) => continue,
                }
            }
        };

        for received in batch {
            let (message, acker) = received.into_parts();
            tracing::debug!(message_id = %message.id, "receiving response");
            if let Err(e) = acker.ack().await {
                tracing::warn!(message_id = %message.id, error = %e, "message acknowledgment failed");
            }
            if let Some(src_id) = message.attributes.get(CORRELATION_ATTRIBUTE) {
                stats.done_task(src_id.as_str(), message.data.len() as u64);
            }
        }
    }
}

fn unix_nanos() -> i64 {
    chrono::Utc::now().timestamp_nanos_opt().unwrap_or_default()
}

fn request_attributes(id: &str) -> HashMap<String, String> {
    HashMap::from([
        (CORRELATION_ATTRIBUTE.to_string(), id.to_string()),
        (SOURCE_TIME_ATTRIBUTE.to_string(), unix_nanos().to_string()),
    ])
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agent::testing::UppercaseInvoker;
    use crate::broker::MemoryBroker;
    use crate::stats::StatsService;
    use crate::types::StatsConfig;
    use futures::future::BoxFuture;
    use std::io::Write;

    fn source(lines: &str, max_parallel: usize) -> (tempfile::NamedTempFile, SourceConfig) {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(lines.as_bytes()).unwrap();
        let config = SourceConfig {
            path: Some(file.path().to_path_buf()),
            max_parallel,
            ..Default::default()
        };
        (file, config)
    }

    #[tokio::test]
    async fn test_invoke_load_counts_every_payload() {
        let (_file, config) = source("a\nb\nc\nd\n", 2);
        let cancel = CancellationToken::new();
        let (stats, mut reports) =
            StatsService::spawn_with_reports(&StatsConfig::default(), cancel.clone());
        let invoker = Arc::new(UppercaseInvoker::default());

        run_invoke_load(&config, invoker.clone(), stats.handle(), cancel)
            .await
            .unwrap();
        stats.stop().await;

        assert_eq!(invoker.calls.load(Ordering::SeqCst), 4);
        let mut ops = 0;
        while let Some(report) = reports.recv().await {
            ops += report.ops;
        }
        assert_eq!(ops, 4);
    }

    #[tokio::test]
    async fn test_invoke_load_stops_on_failure() {
        let (_file, config) = source("a\nbad\nc\n", 1);
        let cancel = CancellationToken::new();
        let stats = StatsService::spawn(&StatsConfig::default(), cancel.clone());
        let invoker = Arc::new(UppercaseInvoker {
            fail: Some("bad"),
            ..Default::default()
        });

        let err = run_invoke_load(&config, invoker, stats.handle(), cancel)
            .await
            .unwrap_err();
        stats.stop().await;
        assert!(err.to_string().contains("failed calling backend"));
    }

    #[tokio::test]
    async fn test_missing_source_is_config_error() {
        let cancel = CancellationToken::new();
        assert!(matches!(
            payloads(&SourceConfig::default(), cancel),
            Err(Error::Config(_))
        ));
    }

    #[tokio::test]
    async fn test_publish_load_ends_when_idle() {
        let (_file, config) = source("x\ny\nz\n", 2);
        let broker = MemoryBroker::new();
        broker.create_subscription("requests", "requests-sub").await;

        let cancel = CancellationToken::new();
        let stats = StatsService::spawn(&StatsConfig::default(), cancel.clone());
        run_publish_load(
            &config,
            Arc::new(broker.publisher("requests")),
            None,
            stats.handle(),
            cancel.clone(),
        )
        .await
        .unwrap();
        stats.stop().await;

        assert!(cancel.is_cancelled());
        let published = broker.published("requests").await;
        assert_eq!(published.len(), 3);
        for message in &published {
            assert!(message.attributes[CORRELATION_ATTRIBUTE].starts_with("Job-"));
            assert!(message.attributes.contains_key(SOURCE_TIME_ATTRIBUTE));
        }
    }

    /// Confirms each publish after a delay, tracking how many are unconfirmed.
    #[derive(Debug, Default)]
    struct SlowPublisher {
        outstanding: Arc<AtomicU64>,
        peak: Arc<AtomicU64>,
        published: Arc<AtomicU64>,
    }

    impl Publisher for SlowPublisher {
        fn publish(&self, _message: OutboundMessage) -> BoxFuture<'static, Result<String>> {
            let now = self.outstanding.fetch_add(1, Ordering::SeqCst) + 1;
            self.peak.fetch_max(now, Ordering::SeqCst);
            let (outstanding, published) = (self.outstanding.clone(), self.published.clone());
            Box::pin(async move {
                tokio::time::sleep(Duration::from_millis(20)).await;
                outstanding.fetch_sub(1, Ordering::SeqCst);
                Ok(published.fetch_add(1, Ordering::SeqCst).to_string())
            })
        }
    }

    #[tokio::test]
    async fn test_publish_load_bounds_outstanding_publishes() {
        let (_file, mut config) = source("0\n1\n2\n3\n4\n5\n6\n7\n8\n9\n", 4);
        config.max_outstanding = 3;
        let publisher = Arc::new(SlowPublisher::default());

        let cancel = CancellationToken::new();
        let stats = StatsService::spawn(&StatsConfig::default(), cancel.clone());
        run_publish_load(&config, publisher.clone(), None, stats.handle(), cancel)
            .await
            .unwrap();
        stats.stop().await;

        assert_eq!(publisher.published.load(Ordering::SeqCst), 10);
        assert!(publisher.peak.load(Ordering::SeqCst) <= 3);
        assert_eq!(publisher.outstanding.load(Ordering::SeqCst), 0);
    }
}
