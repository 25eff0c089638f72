//! Bounded parallel execution over a lazy sequence.

use futures::stream::{Stream, StreamExt};
use std::future::Future;
use std::num::NonZeroUsize;
use tokio::task::{JoinError, JoinSet};

use crate::types::{Error, Result};

/// Resolve a worker count; `0` means the host's available parallelism.
pub fn resolve_workers(workers: usize) -> usize {
    if workers > 0 {
        return workers;
    }
    std::thread::available_parallelism()
        .map(NonZeroUsize::get)
        .unwrap_or(1)
}

/// Run `work` over every item with at most `workers` tasks in flight.
///
/// The first error (from the sequence itself or from a finished task) stops
/// dispatching; tasks already running are drained, never aborted. Returns the
/// first error observed, or `Ok(())` if every dispatched task succeeded.
pub async fn apply_parallel<S, T, F, Fut>(stream: S, workers: usize, work: F) -> Result<()>
where
    S: Stream<Item = Result<T>>,
    T: Send + 'static,
    F: Fn(T) -> Fut,
    Fut: Future<Output = Result<()>> + Send + 'static,
{
    let workers = resolve_workers(workers);
    let mut stream = std::pin::pin!(stream);
    let mut tasks = JoinSet::new();
    let mut first_error: Option<Error> = None;

    while let Some(item) = stream.next().await {
        let item = match item {
            Ok(item) => item,
            Err(e) => {
                first_error = Some(e);
                break;
            }
        };

        // At the limit: wait for a slot before dispatching.
        if tasks.len() >= workers {
            if let Some(joined) = tasks.join_next().await {
                if let Err(e) = flatten(joined) {
                    first_error = Some(e);
                    break;
                }
            }
        }

        tasks.spawn(work(item));
    }

    if first_error.is_some() {
        tracing::debug!(outstanding = tasks.len(), "stopped dispatching, draining workers");
    }

    while let Some(joined) = tasks.join_next().await {
        if let Err(e) = flatten(joined) {
            if first_error.is_none() {
                first_error = Some(e);
            }
        }
    }

    match first_error {
        Some(e) => Err(e),
        None => Ok(()),
    }
}

fn flatten(joined: std::result::Result<Result<()>, JoinError>) -> Result<()> {
    joined.map_err(|e| Error::internal(format!("worker task failed: {}", e)))?
}
