//! Shared collaborators for the integration tests.

#![allow(dead_code)]

use async_trait::async_trait;
use bytes::Bytes;
use htc_agent::agent::AgentSettings;
use htc_agent::broker::{MemoryBroker, OutboundMessage, Publisher};
use htc_agent::flow::ThrottleConfig;
use htc_agent::invoke::Invoke;
use htc_agent::types::{EncodingConfig, ReceiveConfig, StatsConfig, CORRELATION_ATTRIBUTE};
use htc_agent::{Error, Result};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

/// Backend stand-in: uppercases the payload, rejects `fail`.
#[derive(Debug, Default)]
pub struct UppercaseBackend {
    pub calls: AtomicUsize,
    pub fail: Option<&'static str>,
}

impl UppercaseBackend {
    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Invoke for UppercaseBackend {
    async fn invoke(&self, payload: Bytes) -> Result<Bytes> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if self.fail.is_some_and(|f| f.as_bytes() == payload.as_ref()) {
            return Err(Error::remote("backend rejected the request"));
        }
        Ok(Bytes::from(payload.to_ascii_uppercase()))
    }
}

pub fn settings(receive: ReceiveConfig) -> AgentSettings {
    AgentSettings {
        stats: StatsConfig::default(),
        receive,
        throttle: ThrottleConfig {
            rate: 0.0,
            ramp_steps: 0,
            ramp: Duration::ZERO,
        },
        encoding: EncodingConfig::default(),
        hostname: "worker-1".to_string(),
    }
}

/// Publish one request per `(srcId, payload)` pair to `topic`.
pub async fn publish_requests(broker: &MemoryBroker, topic: &str, requests: &[(&str, &str)]) {
    let publisher = broker.publisher(topic);
    for (src_id, payload) in requests {
        let message = OutboundMessage::new(Bytes::copy_from_slice(payload.as_bytes()))
            .with_attribute(CORRELATION_ATTRIBUTE, *src_id);
        publisher.publish(message).await.unwrap();
    }
}

/// Poll `check` until it holds or five seconds pass.
pub async fn eventually<F, Fut>(mut check: F)
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = bool>,
{
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    while !check().await {
        assert!(
            tokio::time::Instant::now() < deadline,
            "condition not reached in time"
        );
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
}
