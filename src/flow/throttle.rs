//! Rate throttling of lazy sequences, with an optional linear ramp.
//!
//! Items are spaced by a delay derived from the target rate. With a ramp the
//! delay starts at `ramp / ramp_steps` and shrinks linearly to the target
//! delay over the ramp duration. Errors pass through without delay.

use futures::stream::{BoxStream, Stream, StreamExt};
use std::time::Duration;
use tokio::time::{sleep_until, Instant};
use tokio_util::sync::CancellationToken;

use crate::types::{Result, SourceConfig};

/// Throttle configuration.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ThrottleConfig {
    /// Items per second; `0` disables throttling.
    pub rate: f64,
    pub ramp_steps: u32,
    pub ramp: Duration,
}

impl From<&SourceConfig> for ThrottleConfig {
    fn from(source: &SourceConfig) -> Self {
        Self {
            rate: source.rate,
            ramp_steps: source.ramp_steps,
            ramp: source.ramp,
        }
    }
}

#[derive(Debug, Clone, Copy)]
struct Ramp {
    initial_delay: Duration,
    duration: Duration,
}

/// Dispatch schedule, owned by the task driving the sequence.
#[derive(Debug)]
pub struct ThrottleState {
    target_delay: Duration,
    ramp: Option<Ramp>,
    ramp_start: Instant,
    next_dispatch: Instant,
}

impl ThrottleState {
    /// Returns `None` when the rate is unlimited.
    pub fn new(config: &ThrottleConfig, now: Instant) -> Option<Self> {
        if config.rate <= 0.0 {
            return None;
        }
        let target_delay = Duration::from_nanos((1e9 / config.rate) as u64);

        let mut ramp = None;
        if !config.ramp.is_zero() && config.ramp_steps > 0 {
            let initial_delay = target_delay.max(config.ramp / config.ramp_steps);
            if initial_delay <= target_delay {
                tracing::debug!(
                    initial = ?initial_delay,
                    target = ?target_delay,
                    "initial ramp delay is not larger than the target delay, ramp has no effect"
                );
            } else {
                ramp = Some(Ramp {
                    initial_delay,
                    duration: config.ramp,
                });
            }
        }

        Some(Self {
            target_delay,
            ramp,
            ramp_start: now,
            next_dispatch: now,
        })
    }

    pub fn target_delay(&self) -> Duration {
        self.target_delay
    }

    /// Delay to apply after an item dispatched at `now`.
    pub fn current_delay(&mut self, now: Instant) -> Duration {
        let Some(ramp) = self.ramp else {
            return self.target_delay;
        };

        let elapsed = now.saturating_duration_since(self.ramp_start);
        if elapsed >= ramp.duration {
            // Ramp complete; lock to the target from here on.
            self.ramp = None;
            return self.target_delay;
        }

        let progress = elapsed.as_secs_f64() / ramp.duration.as_secs_f64();
        let delta = (ramp.initial_delay - self.target_delay).as_secs_f64();
        let delay = ramp.initial_delay.as_secs_f64() - delta * progress;
        Duration::from_secs_f64(delay.max(0.0)).clamp(self.target_delay, ramp.initial_delay)
    }

    /// Reserve the next dispatch slot for an item ready at `now`.
    ///
    /// Returns the instant the item may be dispatched. The deadline advances
    /// by the current delay from that instant, however late the item was.
    pub fn schedule(&mut self, now: Instant) -> Instant {
        let delay = self.current_delay(now);
        let dispatch = self.next_dispatch.max(now);
        self.next_dispatch = dispatch + delay;
        dispatch
    }
}

/// Throttle a sequence.
///
/// Waiting for a slot is interrupted by `cancel`, which ends the sequence
/// without yielding the pending item.
pub fn throttle<S, T>(
    stream: S,
    config: ThrottleConfig,
    cancel: CancellationToken,
) -> BoxStream<'static, Result<T>>
where
    S: Stream<Item = Result<T>> + Send + 'static,
    T: Send + 'static,
{
    let Some(state) = ThrottleState::new(&config, Instant::now()) else {
        return stream.boxed();
    };

    futures::stream::unfold(
        (stream.boxed(), state, cancel),
        |(mut stream, mut state, cancel)| async move {
            let item = stream.next().await?;
            if item.is_ok() {
                let now = Instant::now();
                let dispatch = state.schedule(now);
                if dispatch > now {
                    tokio::select! {
                        _ = cancel.cancelled() => return None,
                        _ = sleep_until(dispatch) => {}
                    }
                }
            }
            Some((item, (stream, state, cancel)))
        },
    )
    .boxed()
}
