//! Delivery agent: broker message in, invocation, response published, ack.
//!
//! Every inbound message is bracketed by telemetry: `Start` before the
//! invocation, then `Done` once the response publish is confirmed or
//! `Cancel` when either step fails. The original message is acknowledged
//! only after its response publish succeeds; any failure nacks it and
//! leaves the retry to broker redelivery. Redelivered duplicates are not
//! filtered, so the backend must tolerate repeated requests.

mod file;
mod pull;
mod push;

pub use file::process_file;
pub use pull::receive;
pub use push::{router, serve, PushEnvelope, PushMessage};

use futures::future::BoxFuture;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::sync::{mpsc, Mutex};
use tokio::time::{sleep_until, Instant};
use tokio_util::sync::CancellationToken;

use crate::broker::{BrokerMessage, OutboundMessage, Publisher, Subscription};
use crate::flow::{ThrottleConfig, ThrottleState};
use crate::invoke::{ByteInvoker, Invoke};
use crate::stats::{StatsHandle, StatsService, WindowReport};
use crate::types::{
    Config, CorrelationId, EncodingConfig, Error, ReceiveConfig, Result, StatsConfig,
};

/// Response attribute naming the agent host.
pub const HOSTNAME_ATTRIBUTE: &str = "Hostname";

/// Correlates one inbound message with its telemetry bracket.
#[derive(Debug, Clone)]
pub struct InvocationContext {
    pub id: CorrelationId,
    pub message_id: String,
    pub attributes: HashMap<String, String>,
    request_bytes: u64,
}

impl InvocationContext {
    fn new(message: &BrokerMessage) -> Self {
        Self {
            id: CorrelationId::from_attributes(&message.attributes),
            message_id: message.id.clone(),
            attributes: message.attributes.clone(),
            request_bytes: message.data.len() as u64,
        }
    }
}

/// An open `Start` bracket; dropped while open it emits `Cancel`.
///
/// Covers work abandoned mid-flight, such as a push request future dropped
/// by a disconnected client or an aborted task.
#[derive(Debug)]
struct TaskBracket {
    id: CorrelationId,
    stats: StatsHandle,
    open: bool,
}

impl TaskBracket {
    fn start(stats: &StatsHandle, id: CorrelationId) -> Self {
        stats.start_task(id.clone());
        Self {
            id,
            stats: stats.clone(),
            open: true,
        }
    }

    fn done(mut self, bytes: u64) {
        self.open = false;
        self.stats.done_task(self.id.clone(), bytes);
    }

    /// Closes with `Cancel` through `Drop`.
    fn cancel(self) {}
}

impl Drop for TaskBracket {
    fn drop(&mut self) {
        if self.open {
            self.stats.cancel_task(self.id.clone());
        }
    }
}

/// A response submitted to the broker, not yet confirmed.
pub struct PendingPublish {
    context: InvocationContext,
    response_bytes: u64,
    publish: BoxFuture<'static, Result<String>>,
    bracket: TaskBracket,
}

impl std::fmt::Debug for PendingPublish {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PendingPublish")
            .field("context", &self.context)
            .field("response_bytes", &self.response_bytes)
            .finish_non_exhaustive()
    }
}

impl PendingPublish {
    pub fn context(&self) -> &InvocationContext {
        &self.context
    }

    /// Await the publish confirmation and close the telemetry bracket.
    pub async fn confirm(self) -> Result<String> {
        match self.publish.await {
            Ok(published_id) => {
                let total = self.context.request_bytes + self.response_bytes;
                self.bracket.done(total);
                tracing::debug!(
                    src_id = %self.context.id,
                    message_id = %self.context.message_id,
                    %published_id,
                    "response published"
                );
                Ok(published_id)
            }
            Err(e) => {
                self.bracket.cancel();
                log_failure("failed publishing result", &self.context, &e);
                Err(e)
            }
        }
    }
}

/// Shared dispatch pacing for every message the agent handles.
#[derive(Debug)]
struct Pacer {
    state: Mutex<ThrottleState>,
    cancel: CancellationToken,
}

impl Pacer {
    async fn wait(&self) -> Result<()> {
        let now = Instant::now();
        let dispatch = self.state.lock().await.schedule(now);
        if dispatch <= now {
            return Ok(());
        }
        tokio::select! {
            _ = self.cancel.cancelled() => Err(Error::cancelled("waiting for a dispatch slot")),
            _ = sleep_until(dispatch) => Ok(()),
        }
    }
}

#[derive(Debug)]
struct ProcessorInner {
    invoker: Arc<dyn Invoke>,
    publisher: Arc<dyn Publisher>,
    stats: StatsHandle,
    hostname: String,
    pacer: Option<Pacer>,
}

/// The per-message invocation logic shared by the pull and push fronts.
#[derive(Debug, Clone)]
pub struct MessageProcessor {
    inner: Arc<ProcessorInner>,
}

impl MessageProcessor {
    pub fn new(
        invoker: Arc<dyn Invoke>,
        publisher: Arc<dyn Publisher>,
        stats: StatsHandle,
        hostname: impl Into<String>,
    ) -> Self {
        Self::build(invoker, publisher, stats, hostname.into(), None)
    }

    fn build(
        invoker: Arc<dyn Invoke>,
        publisher: Arc<dyn Publisher>,
        stats: StatsHandle,
        hostname: String,
        pacer: Option<Pacer>,
    ) -> Self {
        Self {
            inner: Arc::new(ProcessorInner {
                invoker,
                publisher,
                stats,
                hostname,
                pacer,
            }),
        }
    }

    pub fn stats(&self) -> &StatsHandle {
        &self.inner.stats
    }

    /// Invoke the backend for `message` and submit the response.
    ///
    /// On error the telemetry bracket is already closed with `Cancel` and
    /// nothing was published; the caller nacks or reports the failure.
    pub async fn process(&self, message: BrokerMessage) -> Result<PendingPublish> {
        tracing::debug!(
            message_id = %message.id,
            attributes = ?message.attributes,
            "received request"
        );

        if let Some(pacer) = &self.inner.pacer {
            pacer.wait().await?;
        }

        let context = InvocationContext::new(&message);
        let bracket = TaskBracket::start(&self.inner.stats, context.id.clone());

        let response = match self.inner.invoker.invoke(message.data).await {
            Ok(response) => response,
            Err(e) => {
                bracket.cancel();
                log_failure("failed calling service", &context, &e);
                return Err(e);
            }
        };

        let mut attributes = context.attributes.clone();
        attributes.insert(HOSTNAME_ATTRIBUTE.to_string(), self.inner.hostname.clone());
        let response_bytes = response.len() as u64;
        let publish = self.inner.publisher.publish(OutboundMessage {
            data: response,
            attributes,
        });

        Ok(PendingPublish {
            context,
            response_bytes,
            publish,
            bracket,
        })
    }

    /// Process and wait for the publish confirmation.
    pub async fn process_and_confirm(&self, message: BrokerMessage) -> Result<String> {
        self.process(message).await?.confirm().await
    }
}

fn log_failure(what: &str, context: &InvocationContext, error: &Error) {
    if error.is_cancelled() {
        tracing::debug!(src_id = %context.id, error = %error, "{}", what);
    } else {
        tracing::warn!(
            src_id = %context.id,
            message_id = %context.message_id,
            error = %error,
            "{}",
            what
        );
    }
}

/// Everything needed to build a [`DeliveryAgent`].
#[derive(Debug, Clone)]
pub struct AgentSettings {
    /// Report frequency, idle timeout and report logging.
    pub stats: StatsConfig,
    /// Concurrency limits of the pull front.
    pub receive: ReceiveConfig,
    /// Dispatch rate and ramp (rate 0 = unlimited).
    pub throttle: ThrottleConfig,
    /// Payload encodings used by the invoker.
    pub encoding: EncodingConfig,
    pub hostname: String,
}

impl AgentSettings {
    pub fn from_config(config: &Config) -> Self {
        Self {
            stats: config.stats.clone(),
            receive: config.receive.clone(),
            throttle: ThrottleConfig::from(&config.source),
            encoding: config.encoding,
            hostname: config.hostname(),
        }
    }
}

/// A ready-to-run delivery agent with its own telemetry aggregator.
#[derive(Debug)]
pub struct DeliveryAgent {
    processor: MessageProcessor,
    stats: StatsService,
    reports: Option<mpsc::UnboundedReceiver<WindowReport>>,
    receive: ReceiveConfig,
    cancel: CancellationToken,
}

impl DeliveryAgent {
    pub fn new(
        settings: AgentSettings,
        invoker: Arc<dyn Invoke>,
        publisher: Arc<dyn Publisher>,
        cancel: CancellationToken,
    ) -> Self {
        let (stats, reports) = StatsService::spawn_with_reports(&settings.stats, cancel.clone());
        if let Some(idle_timeout) = settings.stats.idle_timeout {
            tracing::info!(?idle_timeout, "shutting down after an idle timeout");
            stats.handle().set_idle_timeout(Some(idle_timeout));
        }

        let pacer = ThrottleState::new(&settings.throttle, Instant::now()).map(|state| Pacer {
            state: Mutex::new(state),
            cancel: cancel.clone(),
        });
        tracing::debug!(
            input = %settings.encoding.input,
            output = %settings.encoding.output,
            max_outstanding = settings.receive.max_outstanding,
            rate = settings.throttle.rate,
            "delivery agent ready"
        );

        let processor =
            MessageProcessor::build(invoker, publisher, stats.handle(), settings.hostname, pacer);

        Self {
            processor,
            stats,
            reports: Some(reports),
            receive: settings.receive,
            cancel,
        }
    }

    /// Build the HTTP-backed invoker from `config` and the agent around it.
    pub async fn connect(
        config: &Config,
        publisher: Arc<dyn Publisher>,
        cancel: CancellationToken,
    ) -> Result<Self> {
        let invoker =
            ByteInvoker::from_config(config, config.encoding.input, config.encoding.output).await?;
        Ok(Self::new(
            AgentSettings::from_config(config),
            Arc::new(invoker),
            publisher,
            cancel,
        ))
    }

    /// Take the stream of window reports. Unclaimed reports are discarded.
    pub fn take_reports(&mut self) -> Option<mpsc::UnboundedReceiver<WindowReport>> {
        self.reports.take()
    }

    pub fn processor(&self) -> &MessageProcessor {
        &self.processor
    }

    /// Pull from `subscription` until cancelled, then stop telemetry.
    pub async fn run_pull(mut self, subscription: Arc<dyn Subscription>) -> Result<()> {
        self.reports = None;
        let result = receive(
            subscription,
            self.processor.clone(),
            &self.receive,
            self.cancel.clone(),
        )
        .await;
        self.stats.stop().await;
        result
    }

    /// Serve push deliveries on `listener` until cancelled, then stop telemetry.
    pub async fn run_push(mut self, listener: TcpListener) -> Result<()> {
        self.reports = None;
        let result = serve(listener, self.processor.clone(), self.cancel.clone()).await;
        self.stats.stop().await;
        result
    }

    /// Stop telemetry without running a front.
    pub async fn shutdown(self) {
        self.stats.stop().await;
    }
}

#[cfg(test)]
pub(crate) mod testing {
    //! Collaborators shared by the agent tests.

    use super::*;
    use async_trait::async_trait;
    use bytes::Bytes;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Uppercases the payload; fails payloads equal to `fail`.
    #[derive(Debug, Default)]
    pub struct UppercaseInvoker {
        pub calls: AtomicUsize,
        pub fail: Option<&'static str>,
    }

    #[async_trait]
    impl Invoke for UppercaseInvoker {
        async fn invoke(&self, payload: Bytes) -> Result<Bytes> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if self.fail.is_some_and(|f| f.as_bytes() == payload.as_ref()) {
                return Err(Error::remote("backend rejected the request"));
            }
            Ok(Bytes::from(payload.to_ascii_uppercase()))
        }
    }

    pub fn message(src_id: &str, data: &'static str) -> BrokerMessage {
        BrokerMessage {
            id: format!("msg-{}", src_id),
            data: Bytes::from_static(data.as_bytes()),
            attributes: HashMap::from([(
                crate::types::CORRELATION_ATTRIBUTE.to_string(),
                src_id.to_string(),
            )]),
            publish_time: None,
            delivery_attempt: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::testing::*;
    use super::*;
    use crate::broker::MemoryBroker;
    use bytes::Bytes;
    use std::time::Duration;
    use tracing_test::traced_test;

    fn settings() -> AgentSettings {
        AgentSettings {
            stats: StatsConfig::default(),
            receive: ReceiveConfig::default(),
            throttle: ThrottleConfig {
                rate: 0.0,
                ramp_steps: 0,
                ramp: Duration::ZERO,
            },
            encoding: EncodingConfig::default(),
            hostname: "worker-1".to_string(),
        }
    }

    async fn broker() -> MemoryBroker {
        let broker = MemoryBroker::new();
        broker.create_topic("responses").await;
        broker
    }

    #[tokio::test]
    async fn test_success_publishes_with_hostname() {
        let broker = broker().await;
        let mut agent = DeliveryAgent::new(
            settings(),
            Arc::new(UppercaseInvoker::default()),
            Arc::new(broker.publisher("responses")),
            CancellationToken::new(),
        );
        let mut reports = agent.take_reports().unwrap();

        agent
            .processor()
            .process_and_confirm(message("m1", "abc"))
            .await
            .unwrap();
        agent.shutdown().await;

        let published = broker.published("responses").await;
        assert_eq!(published.len(), 1);
        assert_eq!(published[0].data, Bytes::from_static(b"ABC"));
        assert_eq!(published[0].attributes["srcId"], "m1");
        assert_eq!(published[0].attributes[HOSTNAME_ATTRIBUTE], "worker-1");

        let mut ops = 0;
        let mut bytes = 0;
        while let Some(report) = reports.recv().await {
            ops += report.ops;
            bytes += report.bytes;
        }
        assert_eq!(ops, 1);
        assert_eq!(bytes, 6);
    }

    #[tokio::test]
    #[traced_test]
    async fn test_invocation_failure_publishes_nothing() {
        let broker = broker().await;
        let invoker = Arc::new(UppercaseInvoker {
            fail: Some("bad"),
            ..Default::default()
        });
        let agent = DeliveryAgent::new(
            settings(),
            invoker,
            Arc::new(broker.publisher("responses")),
            CancellationToken::new(),
        );

        let err = agent
            .processor()
            .process(message("m1", "bad"))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Remote(_)));
        assert!(broker.published("responses").await.is_empty());
        assert!(logs_contain("failed calling service"));
        agent.shutdown().await;
    }

    #[tokio::test]
    async fn test_publish_failure_surfaces_on_confirm() {
        let broker = broker().await;
        broker.fail_publishes("responses").await;
        let agent = DeliveryAgent::new(
            settings(),
            Arc::new(UppercaseInvoker::default()),
            Arc::new(broker.publisher("responses")),
            CancellationToken::new(),
        );

        let pending = agent.processor().process(message("m1", "abc")).await.unwrap();
        assert_eq!(pending.context().id.as_str(), "m1");
        assert!(matches!(pending.confirm().await, Err(Error::Publish(_))));
        agent.shutdown().await;
    }

    #[tokio::test]
    async fn test_missing_correlation_id_is_empty() {
        let context = InvocationContext::new(&BrokerMessage {
            id: "1".to_string(),
            data: Bytes::new(),
            attributes: HashMap::new(),
            publish_time: None,
            delivery_attempt: None,
        });
        assert_eq!(context.id.as_str(), "");
    }

    #[derive(Debug)]
    struct StalledInvoker;

    #[async_trait::async_trait]
    impl Invoke for StalledInvoker {
        async fn invoke(&self, payload: Bytes) -> Result<Bytes> {
            tokio::time::sleep(Duration::from_secs(10)).await;
            Ok(payload)
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_abandoned_message_closes_its_bracket() {
        let broker = broker().await;
        let cancel = CancellationToken::new();
        let mut settings = settings();
        settings.stats.idle_timeout = Some(Duration::from_millis(200));
        let mut agent = DeliveryAgent::new(
            settings,
            Arc::new(StalledInvoker),
            Arc::new(broker.publisher("responses")),
            cancel.clone(),
        );
        let mut reports = agent.take_reports().unwrap();

        let processor = agent.processor().clone();
        let task = tokio::spawn(async move {
            processor.process_and_confirm(message("m1", "abc")).await
        });
        tokio::time::sleep(Duration::from_millis(50)).await;
        task.abort();
        assert!(task.await.unwrap_err().is_cancelled());

        tokio::time::sleep(Duration::from_secs(1)).await;
        assert!(cancel.is_cancelled());

        agent.shutdown().await;
        let mut last_active = None;
        while let Some(report) = reports.recv().await {
            last_active = Some(report.active);
        }
        assert_eq!(last_active, Some(0));
        assert!(broker.published("responses").await.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_rate_paces_dispatch() {
        let broker = broker().await;
        let mut settings = settings();
        settings.throttle.rate = 10.0;
        let agent = DeliveryAgent::new(
            settings,
            Arc::new(UppercaseInvoker::default()),
            Arc::new(broker.publisher("responses")),
            CancellationToken::new(),
        );

        let start = Instant::now();
        for i in 0..3 {
            agent
                .processor()
                .process_and_confirm(message(&format!("m{}", i), "x"))
                .await
                .unwrap();
        }
        assert!(start.elapsed() >= Duration::from_millis(200));
        agent.shutdown().await;
    }
}
