//! Broker abstraction: publish, pull and per-message ack/nack.
//!
//! The agent never implements broker semantics itself. Redelivery, storage
//! and lease bookkeeping belong to the implementations here: an in-memory
//! broker for tests and local runs, and a Pub/Sub REST client.

mod memory;
mod pubsub;

pub use memory::{MemoryBroker, MemoryPublisher, MemorySubscription};
pub use pubsub::{PubSubClient, PubSubSubscription, PubSubTopic};

use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use futures::future::BoxFuture;
use std::collections::HashMap;
use std::fmt::{self, Debug};

use crate::types::Result;

/// A message delivered by the broker.
#[derive(Debug, Clone, PartialEq)]
pub struct BrokerMessage {
    /// Broker-assigned message id.
    pub id: String,
    pub data: Bytes,
    pub attributes: HashMap<String, String>,
    pub publish_time: Option<DateTime<Utc>>,
    /// 1 on first delivery, when the broker reports it.
    pub delivery_attempt: Option<u32>,
}

/// A message to publish.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct OutboundMessage {
    pub data: Bytes,
    pub attributes: HashMap<String, String>,
}

impl OutboundMessage {
    pub fn new(data: impl Into<Bytes>) -> Self {
        Self {
            data: data.into(),
            attributes: HashMap::new(),
        }
    }

    pub fn with_attribute(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.attributes.insert(key.into(), value.into());
        self
    }
}

/// Publishes to one topic.
pub trait Publisher: Send + Sync + Debug {
    /// Submit a message. The returned future resolves with the broker's
    /// message id once the publish is confirmed.
    fn publish(&self, message: OutboundMessage) -> BoxFuture<'static, Result<String>>;
}

/// Acknowledgment handle of one received message. Consumed by either call.
#[async_trait]
pub trait Acker: Send + Sync + Debug {
    async fn ack(self: Box<Self>) -> Result<()>;

    /// Negative acknowledgment; the broker redelivers promptly.
    async fn nack(self: Box<Self>) -> Result<()>;
}

/// A pulled message with its acknowledgment handle.
pub struct ReceivedMessage {
    pub message: BrokerMessage,
    acker: Box<dyn Acker>,
}

impl ReceivedMessage {
    pub fn new(message: BrokerMessage, acker: Box<dyn Acker>) -> Self {
        Self { message, acker }
    }

    pub fn into_parts(self) -> (BrokerMessage, Box<dyn Acker>) {
        (self.message, self.acker)
    }
}

impl fmt::Debug for ReceivedMessage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ReceivedMessage")
            .field("id", &self.message.id)
            .field("attributes", &self.message.attributes)
            .finish_non_exhaustive()
    }
}

/// Pull side of a subscription.
#[async_trait]
pub trait Subscription: Send + Sync + Debug {
    /// Pull up to `max_messages`. May return an empty batch after waiting.
    async fn pull(&self, max_messages: usize) -> Result<Vec<ReceivedMessage>>;
}
