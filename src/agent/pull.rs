//! Pull front: receive loops over a subscription.

use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;

use super::MessageProcessor;
use crate::broker::{Acker, ReceivedMessage, Subscription};
use crate::types::{Error, ReceiveConfig, Result};

/// Consecutive pull failures tolerated before a receive loop gives up.
const MAX_PULL_FAILURES: u32 = 5;
const PULL_RETRY_DELAY: Duration = Duration::from_secs(1);

/// Receive from `subscription` until `cancel` fires.
///
/// Runs `pull_concurrency` loops sharing `max_outstanding` permits. A permit
/// is taken before a message is pulled and released once its ack or nack
/// resolves. After cancellation no new messages are pulled; in-flight
/// messages still finish and settle before this returns.
pub async fn receive(
    subscription: Arc<dyn Subscription>,
    processor: MessageProcessor,
    settings: &ReceiveConfig,
    cancel: CancellationToken,
) -> Result<()> {
    let permits = Arc::new(Semaphore::new(settings.max_outstanding.max(1)));
    let in_flight = TaskTracker::new();
    let stop = cancel.child_token();

    tracing::info!(
        max_outstanding = settings.max_outstanding,
        pull_concurrency = settings.pull_concurrency,
        synchronous = settings.synchronous,
        "receiving messages"
    );

    let mut loops = JoinSet::new();
    for worker in 0..settings.pull_concurrency.max(1) {
        let receiver = Receiver {
            worker,
            subscription: subscription.clone(),
            processor: processor.clone(),
            permits: permits.clone(),
            in_flight: in_flight.clone(),
            max_batch: settings.max_outstanding.max(1),
            synchronous: settings.synchronous,
            stop: stop.clone(),
        };
        loops.spawn(receiver.run());
    }

    let mut first_error = None;
    while let Some(joined) = loops.join_next().await {
        let failure = match joined {
            Ok(Ok(())) => continue,
            Ok(Err(e)) => e,
            Err(e) => Error::internal(format!("receive loop failed: {}", e)),
        };
        if first_error.is_none() {
            stop.cancel();
            first_error = Some(failure);
        }
    }

    in_flight.close();
    tracing::debug!(outstanding = in_flight.len(), "waiting for in-flight messages");
    in_flight.wait().await;

    match first_error {
        Some(e) => Err(e),
        None => Ok(()),
    }
}

struct Receiver {
    worker: usize,
    subscription: Arc<dyn Subscription>,
    processor: MessageProcessor,
    permits: Arc<Semaphore>,
    in_flight: TaskTracker,
    max_batch: usize,
    synchronous: bool,
    stop: CancellationToken,
}

impl Receiver {
    async fn run(self) -> Result<()> {
        let mut failures = 0;
        loop {
            let first = tokio::select! {
                _ = self.stop.cancelled() => break,
                permit = self.permits.clone().acquire_owned() => {
                    permit.map_err(|_| Error::internal("receive permits closed"))?
                }
            };
            let mut held = vec![first];
            while held.len() < self.max_batch {
                match self.permits.clone().try_acquire_owned() {
                    Ok(permit) => held.push(permit),
                    Err(_) => break,
                }
            }

            let pulled = tokio::select! {
                _ = self.stop.cancelled() => break,
                pulled = self.subscription.pull(held.len()) => pulled,
            };
            let batch = match pulled {
                Ok(batch) => {
                    failures = 0;
                    batch
                }
                Err(e) => {
                    failures += 1;
                    if failures >= MAX_PULL_FAILURES {
                        tracing::error!(worker = self.worker, error = %e, "giving up pulling");
                        return Err(e);
                    }
                    tracing::warn!(worker = self.worker, error = %e, failures, "pull failed, retrying");
                    drop(held);
                    tokio::select! {
                        _ = self.stop.cancelled() => break,
                        _ = tokio::time::sleep(PULL_RETRY_DELAY) => continue,
                    }
                }
            };

            // Surplus permits are released when `held` drops.
            for (received, permit) in batch.into_iter().zip(held.drain(..)) {
                if self.synchronous {
                    handle(self.processor.clone(), received, permit, &self.in_flight).await;
                } else {
                    let processor = self.processor.clone();
                    let in_flight = self.in_flight.clone();
                    self.in_flight.spawn(async move {
                        handle(processor, received, permit, &in_flight).await;
                    });
                }
            }
        }

        tracing::debug!(worker = self.worker, "receive loop stopped");
        Ok(())
    }
}

/// Process one message; the ack/nack waits for the publish in a detached task.
async fn handle(
    processor: MessageProcessor,
    received: ReceivedMessage,
    permit: OwnedSemaphorePermit,
    in_flight: &TaskTracker,
) {
    let (message, acker) = received.into_parts();
    let message_id = message.id.clone();

    match processor.process(message).await {
        Err(_) => {
            settle(acker, false, &message_id).await;
            drop(permit);
        }
        Ok(pending) => {
            in_flight.spawn(async move {
                let published = pending.confirm().await.is_ok();
                settle(acker, published, &message_id).await;
                drop(permit);
            });
        }
    }
}

async fn settle(acker: Box<dyn Acker>, ack: bool, message_id: &str) {
    let result = if ack { acker.ack().await } else { acker.nack().await };
    if let Err(e) = result {
        tracing::warn!(
            message_id,
            ack,
            error = %e,
            "message acknowledgment failed"
        );
    }
}
