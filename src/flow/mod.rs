//! Flow control for work sources: rate throttling and bounded parallelism.
//!
//! Both operate on lazy sequences (`Stream<Item = Result<T>>`), so a source
//! can be throttled and then fed to the executor without buffering.

mod parallel;
mod throttle;

pub use parallel::{apply_parallel, resolve_workers};
pub use throttle::{throttle, ThrottleConfig, ThrottleState};
