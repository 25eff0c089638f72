//! Google Cloud Pub/Sub over its REST API.
//!
//! Pulled messages hold a lease: their ack deadline is extended every half
//! deadline until they are acked, nacked, or `max_extension` has elapsed.
//! A nack sets the deadline to zero so the message is redelivered promptly.

use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use futures::future::{BoxFuture, FutureExt};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::Duration;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use super::{Acker, BrokerMessage, OutboundMessage, Publisher, ReceivedMessage, Subscription};
use crate::types::{Error, PubSubConfig, ReceiveConfig, Result};

/// Environment variable naming the emulator `host:port`.
pub const EMULATOR_HOST_ENV: &str = "PUBSUB_EMULATOR_HOST";

const MIN_ACK_DEADLINE_SECS: u64 = 10;
const MAX_ACK_DEADLINE_SECS: u64 = 600;

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct PublishRequest<'a> {
    messages: [WireOutbound<'a>; 1],
}

#[derive(Serialize)]
struct WireOutbound<'a> {
    data: String,
    attributes: &'a HashMap<String, String>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct PublishResponse {
    #[serde(default)]
    message_ids: Vec<String>,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct PullRequest {
    max_messages: usize,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct PullResponse {
    #[serde(default)]
    received_messages: Vec<WireReceived>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct WireReceived {
    ack_id: String,
    message: WireMessage,
    #[serde(default)]
    delivery_attempt: Option<u32>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct WireMessage {
    #[serde(default)]
    data: String,
    #[serde(default)]
    attributes: HashMap<String, String>,
    message_id: String,
    #[serde(default)]
    publish_time: Option<DateTime<Utc>>,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct AcknowledgeRequest<'a> {
    ack_ids: [&'a str; 1],
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct ModifyAckDeadlineRequest<'a> {
    ack_ids: [&'a str; 1],
    ack_deadline_seconds: u64,
}

#[derive(Deserialize)]
struct Empty {}

/// REST client bound to one project.
#[derive(Debug, Clone)]
pub struct PubSubClient {
    http: reqwest::Client,
    base_url: String,
    project: String,
    access_token: Option<String>,
}

impl PubSubClient {
    pub fn new(
        base_url: impl Into<String>,
        project: impl Into<String>,
        access_token: Option<String>,
    ) -> Self {
        Self {
            http: reqwest::Client::new(),
            base_url: base_url.into().trim_end_matches('/').to_string(),
            project: project.into(),
            access_token,
        }
    }

    /// Build from configuration; the emulator, when set, wins over `api_base`.
    pub fn from_config(config: &PubSubConfig) -> Result<Self> {
        let project = config
            .project
            .clone()
            .or_else(|| std::env::var("GOOGLE_CLOUD_PROJECT").ok())
            .filter(|p| !p.is_empty())
            .ok_or_else(|| Error::config("a Pub/Sub project must be configured"))?;

        let emulator = config
            .emulator_host
            .clone()
            .or_else(|| std::env::var(EMULATOR_HOST_ENV).ok())
            .filter(|h| !h.is_empty());

        Ok(match emulator {
            Some(host) => {
                tracing::info!(%host, "using the Pub/Sub emulator");
                Self::new(format!("http://{}", host), project, None)
            }
            None => Self::new(config.api_base.clone(), project, config.access_token.clone()),
        })
    }

    pub fn topic(&self, topic: &str) -> PubSubTopic {
        PubSubTopic {
            client: self.clone(),
            path: self.resource_path("topics", topic),
        }
    }

    pub fn subscription(&self, subscription: &str, receive: &ReceiveConfig) -> PubSubSubscription {
        PubSubSubscription {
            client: self.clone(),
            path: self.resource_path("subscriptions", subscription),
            min_extension: receive.min_extension,
            max_extension: receive.max_extension,
        }
    }

    fn resource_path(&self, kind: &str, name: &str) -> String {
        if name.starts_with("projects/") {
            name.to_string()
        } else {
            format!("projects/{}/{}/{}", self.project, kind, name)
        }
    }

    async fn post<B, R>(&self, path: &str, body: &B, kind: fn(String) -> Error) -> Result<R>
    where
        B: Serialize + ?Sized,
        R: DeserializeOwned,
    {
        let url = format!("{}/v1/{}", self.base_url, path);
        let mut builder = self.http.post(&url).json(body);
        if let Some(token) = &self.access_token {
            builder = builder.bearer_auth(token);
        }

        let response = builder
            .send()
            .await
            .map_err(|e| kind(format!("{}: {}", path, e)))?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(kind(format!("{} returned {}: {}", path, status, body.trim())));
        }
        response
            .json()
            .await
            .map_err(|e| kind(format!("{}: invalid response: {}", path, e)))
    }

    async fn modify_ack_deadline(&self, subscription: &str, ack_id: &str, seconds: u64) -> Result<()> {
        let request = ModifyAckDeadlineRequest {
            ack_ids: [ack_id],
            ack_deadline_seconds: seconds,
        };
        let _: Empty = self
            .post(
                &format!("{}:modifyAckDeadline", subscription),
                &request,
                Error::Broker,
            )
            .await?;
        Ok(())
    }
}

/// Publisher for one topic.
#[derive(Debug, Clone)]
pub struct PubSubTopic {
    client: PubSubClient,
    path: String,
}

impl Publisher for PubSubTopic {
    fn publish(&self, message: OutboundMessage) -> BoxFuture<'static, Result<String>> {
        let client = self.client.clone();
        let path = format!("{}:publish", self.path);
        async move {
            let request = PublishRequest {
                messages: [WireOutbound {
                    data: BASE64.encode(&message.data),
                    attributes: &message.attributes,
                }],
            };
            let response: PublishResponse = client.post(&path, &request, Error::Publish).await?;
            response
                .message_ids
                .into_iter()
                .next()
                .ok_or_else(|| Error::publish(format!("{}: no message id returned", path)))
        }
        .boxed()
    }
}

/// Pull subscription with automatic lease extension.
#[derive(Debug, Clone)]
pub struct PubSubSubscription {
    client: PubSubClient,
    path: String,
    min_extension: Duration,
    max_extension: Duration,
}

impl PubSubSubscription {
    fn spawn_lease(&self, ack_id: String) -> CancellationToken {
        let lease = CancellationToken::new();
        let stop = lease.clone();
        let client = self.client.clone();
        let subscription = self.path.clone();
        let max_extension = self.max_extension;
        let deadline = self
            .min_extension
            .as_secs()
            .clamp(MIN_ACK_DEADLINE_SECS, MAX_ACK_DEADLINE_SECS);
        let period = Duration::from_secs(deadline) / 2;

        tokio::spawn(async move {
            let started = Instant::now();
            loop {
                if stop.is_cancelled() {
                    break;
                }
                if started.elapsed() >= max_extension {
                    tracing::debug!(%ack_id, "maximum lease extension reached");
                    break;
                }
                if let Err(e) = client
                    .modify_ack_deadline(&subscription, &ack_id, deadline)
                    .await
                {
                    tracing::warn!(error = %e, "failed extending message lease");
                    break;
                }
                tokio::select! {
                    _ = stop.cancelled() => break,
                    _ = tokio::time::sleep(period) => {}
                }
            }
        });

        lease
    }
}

#[async_trait]
impl Subscription for PubSubSubscription {
    async fn pull(&self, max_messages: usize) -> Result<Vec<ReceivedMessage>> {
        let response: PullResponse = self
            .client
            .post(
                &format!("{}:pull", self.path),
                &PullRequest { max_messages },
                Error::Broker,
            )
            .await?;

        let mut batch = Vec::with_capacity(response.received_messages.len());
        for received in response.received_messages {
            let data = match BASE64.decode(received.message.data.as_bytes()) {
                Ok(data) => data,
                Err(e) => {
                    tracing::warn!(
                        message_id = %received.message.message_id,
                        error = %e,
                        "message has invalid base64 data, returning it to the broker"
                    );
                    if let Err(e) = self
                        .client
                        .modify_ack_deadline(&self.path, &received.ack_id, 0)
                        .await
                    {
                        tracing::warn!(error = %e, "failed returning undecodable message");
                    }
                    continue;
                }
            };
            let message = BrokerMessage {
                id: received.message.message_id,
                data: Bytes::from(data),
                attributes: received.message.attributes,
                publish_time: received.message.publish_time,
                delivery_attempt: received.delivery_attempt,
            };
            let acker = PubSubAcker {
                client: self.client.clone(),
                subscription: self.path.clone(),
                lease: self.spawn_lease(received.ack_id.clone()),
                ack_id: received.ack_id,
            };
            batch.push(ReceivedMessage::new(message, Box::new(acker)));
        }
        Ok(batch)
    }
}

#[derive(Debug)]
struct PubSubAcker {
    client: PubSubClient,
    subscription: String,
    ack_id: String,
    lease: CancellationToken,
}

impl Drop for PubSubAcker {
    fn drop(&mut self) {
        self.lease.cancel();
    }
}

#[async_trait]
impl Acker for PubSubAcker {
    async fn ack(self: Box<Self>) -> Result<()> {
        self.lease.cancel();
        let _: Empty = self
            .client
            .post(
                &format!("{}:acknowledge", self.subscription),
                &AcknowledgeRequest {
                    ack_ids: [self.ack_id.as_str()],
                },
                Error::Broker,
            )
            .await?;
        Ok(())
    }

    async fn nack(self: Box<Self>) -> Result<()> {
        self.lease.cancel();
        self.client
            .modify_ack_deadline(&self.subscription, &self.ack_id, 0)
            .await
    }
}
