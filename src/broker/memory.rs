//! In-process broker with at-least-once delivery.

use async_trait::async_trait;
use chrono::Utc;
use futures::future::{BoxFuture, FutureExt};
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Notify, RwLock};

use super::{Acker, BrokerMessage, OutboundMessage, Publisher, ReceivedMessage, Subscription};
use crate::types::{Error, Result, CORRELATION_ATTRIBUTE};

const DEFAULT_PULL_WAIT: Duration = Duration::from_millis(100);

#[derive(Debug, Default)]
struct TopicState {
    subscriptions: Vec<String>,
    published: Vec<BrokerMessage>,
    fail_all: bool,
    /// Correlation ids whose publishes are rejected.
    fail_ids: HashSet<String>,
}

#[derive(Debug, Default)]
struct SubscriptionState {
    pending: VecDeque<BrokerMessage>,
    outstanding: HashMap<String, BrokerMessage>,
    acked: Vec<String>,
    nacked: Vec<String>,
}

#[derive(Debug, Default)]
struct BrokerState {
    next_id: u64,
    topics: HashMap<String, TopicState>,
    subscriptions: HashMap<String, SubscriptionState>,
}

/// Topics fan out to their subscriptions; a nack puts the message back at
/// the end of the queue unless redelivery is disabled.
#[derive(Debug, Clone)]
pub struct MemoryBroker {
    state: Arc<RwLock<BrokerState>>,
    notify: Arc<Notify>,
    redeliver: bool,
    pull_wait: Duration,
}

impl Default for MemoryBroker {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryBroker {
    pub fn new() -> Self {
        Self {
            state: Arc::new(RwLock::new(BrokerState::default())),
            notify: Arc::new(Notify::new()),
            redeliver: true,
            pull_wait: DEFAULT_PULL_WAIT,
        }
    }

    /// Drop nacked messages instead of redelivering them.
    pub fn without_redelivery(mut self) -> Self {
        self.redeliver = false;
        self
    }

    pub async fn create_topic(&self, topic: &str) {
        self.state
            .write()
            .await
            .topics
            .entry(topic.to_string())
            .or_default();
    }

    pub async fn create_subscription(&self, topic: &str, subscription: &str) {
        let mut state = self.state.write().await;
        state
            .topics
            .entry(topic.to_string())
            .or_default()
            .subscriptions
            .push(subscription.to_string());
        state
            .subscriptions
            .entry(subscription.to_string())
            .or_default();
    }

    pub fn publisher(&self, topic: &str) -> MemoryPublisher {
        MemoryPublisher {
            broker: self.clone(),
            topic: topic.to_string(),
        }
    }

    pub fn subscription(&self, subscription: &str) -> MemorySubscription {
        MemorySubscription {
            broker: self.clone(),
            name: subscription.to_string(),
        }
    }

    /// Reject every publish to `topic`.
    pub async fn fail_publishes(&self, topic: &str) {
        self.state
            .write()
            .await
            .topics
            .entry(topic.to_string())
            .or_default()
            .fail_all = true;
    }

    /// Reject publishes to `topic` carrying the given correlation id.
    pub async fn fail_publishes_for(&self, topic: &str, correlation_id: &str) {
        self.state
            .write()
            .await
            .topics
            .entry(topic.to_string())
            .or_default()
            .fail_ids
            .insert(correlation_id.to_string());
    }

    pub async fn published(&self, topic: &str) -> Vec<BrokerMessage> {
        self.state
            .read()
            .await
            .topics
            .get(topic)
            .map(|t| t.published.clone())
            .unwrap_or_default()
    }

    /// Message ids acked on `subscription`, in ack order.
    pub async fn acked(&self, subscription: &str) -> Vec<String> {
        self.state
            .read()
            .await
            .subscriptions
            .get(subscription)
            .map(|s| s.acked.clone())
            .unwrap_or_default()
    }

    /// Message ids nacked on `subscription`, in nack order.
    pub async fn nacked(&self, subscription: &str) -> Vec<String> {
        self.state
            .read()
            .await
            .subscriptions
            .get(subscription)
            .map(|s| s.nacked.clone())
            .unwrap_or_default()
    }

    async fn publish_to(&self, topic: &str, message: OutboundMessage) -> Result<String> {
        let mut state = self.state.write().await;
        state.next_id += 1;
        let id = state.next_id.to_string();

        let topic_state = state
            .topics
            .get(topic)
            .ok_or_else(|| Error::publish(format!("topic {} not found", topic)))?;
        let correlation = message
            .attributes
            .get(CORRELATION_ATTRIBUTE)
            .map(String::as_str)
            .unwrap_or_default();
        if topic_state.fail_all || topic_state.fail_ids.contains(correlation) {
            return Err(Error::publish(format!("publish to {} rejected", topic)));
        }

        let delivered = BrokerMessage {
            id: id.clone(),
            data: message.data,
            attributes: message.attributes,
            publish_time: Some(Utc::now()),
            delivery_attempt: None,
        };
        let subscriptions = topic_state.subscriptions.clone();
        if let Some(topic_state) = state.topics.get_mut(topic) {
            topic_state.published.push(delivered.clone());
        }
        for name in subscriptions {
            if let Some(sub) = state.subscriptions.get_mut(&name) {
                sub.pending.push_back(delivered.clone());
            }
        }
        drop(state);

        self.notify.notify_waiters();
        Ok(id)
    }

    async fn take(&self, subscription: &str, max_messages: usize) -> Result<Vec<BrokerMessage>> {
        let mut state = self.state.write().await;
        let sub = state
            .subscriptions
            .get_mut(subscription)
            .ok_or_else(|| Error::broker(format!("subscription {} not found", subscription)))?;

        let count = max_messages.min(sub.pending.len());
        let mut batch = Vec::with_capacity(count);
        for mut message in sub.pending.drain(..count) {
            message.delivery_attempt = Some(message.delivery_attempt.unwrap_or(0) + 1);
            sub.outstanding.insert(message.id.clone(), message.clone());
            batch.push(message);
        }
        Ok(batch)
    }

    async fn settle(&self, subscription: &str, id: &str, ack: bool) -> Result<()> {
        let mut state = self.state.write().await;
        let sub = state
            .subscriptions
            .get_mut(subscription)
            .ok_or_else(|| Error::broker(format!("subscription {} not found", subscription)))?;
        let message = sub
            .outstanding
            .remove(id)
            .ok_or_else(|| Error::broker(format!("message {} is not outstanding", id)))?;

        if ack {
            sub.acked.push(message.id);
            return Ok(());
        }

        sub.nacked.push(message.id.clone());
        if self.redeliver {
            sub.pending.push_back(message);
            drop(state);
            self.notify.notify_waiters();
        }
        Ok(())
    }
}

/// Publisher handle of one [`MemoryBroker`] topic.
#[derive(Debug, Clone)]
pub struct MemoryPublisher {
    broker: MemoryBroker,
    topic: String,
}

impl Publisher for MemoryPublisher {
    fn publish(&self, message: OutboundMessage) -> BoxFuture<'static, Result<String>> {
        let broker = self.broker.clone();
        let topic = self.topic.clone();
        async move { broker.publish_to(&topic, message).await }.boxed()
    }
}

/// Pull handle of one [`MemoryBroker`] subscription.
#[derive(Debug, Clone)]
pub struct MemorySubscription {
    broker: MemoryBroker,
    name: String,
}

#[async_trait]
impl Subscription for MemorySubscription {
    async fn pull(&self, max_messages: usize) -> Result<Vec<ReceivedMessage>> {
        let notified = self.broker.notify.notified();
        let mut batch = self.broker.take(&self.name, max_messages).await?;
        if batch.is_empty() {
            let _ = tokio::time::timeout(self.broker.pull_wait, notified).await;
            batch = self.broker.take(&self.name, max_messages).await?;
        }

        Ok(batch
            .into_iter()
            .map(|message| {
                let acker = MemoryAcker {
                    broker: self.broker.clone(),
                    subscription: self.name.clone(),
                    id: message.id.clone(),
                };
                ReceivedMessage::new(message, Box::new(acker))
            })
            .collect())
    }
}

#[derive(Debug)]
struct MemoryAcker {
    broker: MemoryBroker,
    subscription: String,
    id: String,
}

#[async_trait]
impl Acker for MemoryAcker {
    async fn ack(self: Box<Self>) -> Result<()> {
        self.broker.settle(&self.subscription, &self.id, true).await
    }

    async fn nack(self: Box<Self>) -> Result<()> {
        self.broker.settle(&self.subscription, &self.id, false).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn broker() -> MemoryBroker {
        let broker = MemoryBroker::new();
        broker.create_subscription("requests", "requests-sub").await;
        broker
    }

    #[tokio::test]
    async fn test_publish_fans_out_to_subscription() {
        let broker = broker().await;
        let id = broker
            .publisher("requests")
            .publish(OutboundMessage::new("payload").with_attribute("srcId", "m1"))
            .await
            .unwrap();

        let batch = broker.subscription("requests-sub").pull(10).await.unwrap();
        assert_eq!(batch.len(), 1);
        assert_eq!(batch[0].message.id, id);
        assert_eq!(batch[0].message.attributes["srcId"], "m1");
        assert_eq!(batch[0].message.delivery_attempt, Some(1));
    }

    #[tokio::test]
    async fn test_nack_redelivers() {
        let broker = broker().await;
        broker
            .publisher("requests")
            .publish(OutboundMessage::new("payload"))
            .await
            .unwrap();

        let sub = broker.subscription("requests-sub");
        let (message, acker) = sub.pull(1).await.unwrap().remove(0).into_parts();
        acker.nack().await.unwrap();

        let (again, acker) = sub.pull(1).await.unwrap().remove(0).into_parts();
        assert_eq!(again.id, message.id);
        assert_eq!(again.delivery_attempt, Some(2));
        acker.ack().await.unwrap();

        assert_eq!(broker.acked("requests-sub").await, vec![message.id.clone()]);
        assert_eq!(broker.nacked("requests-sub").await, vec![message.id]);
    }

    #[tokio::test]
    async fn test_nack_without_redelivery_drops() {
        let broker = MemoryBroker::new().without_redelivery();
        broker.create_subscription("requests", "requests-sub").await;
        broker
            .publisher("requests")
            .publish(OutboundMessage::new("payload"))
            .await
            .unwrap();

        let sub = broker.subscription("requests-sub");
        let (_, acker) = sub.pull(1).await.unwrap().remove(0).into_parts();
        acker.nack().await.unwrap();
        assert!(sub.pull(1).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_publish_failure_injection() {
        let broker = broker().await;
        broker.fail_publishes_for("requests", "m3").await;
        let publisher = broker.publisher("requests");

        assert!(publisher
            .publish(OutboundMessage::new("a").with_attribute("srcId", "m1"))
            .await
            .is_ok());
        let err = publisher
            .publish(OutboundMessage::new("b").with_attribute("srcId", "m3"))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Publish(_)));
        assert_eq!(broker.published("requests").await.len(), 1);
    }

    #[tokio::test]
    async fn test_unknown_topic_fails() {
        let broker = MemoryBroker::new();
        assert!(broker
            .publisher("missing")
            .publish(OutboundMessage::new("x"))
            .await
            .is_err());
    }
}
