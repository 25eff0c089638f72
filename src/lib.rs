//! # HTC Agent - broker-driven invocation with live telemetry
//!
//! Takes work from a message broker (or a file), invokes a remote unary
//! method for each payload and publishes the responses, reporting latency
//! percentiles and throughput as it goes:
//! - Telemetry aggregation through a single-writer event queue
//! - Rate throttling with a linear ramp to the target rate
//! - Bounded parallel execution with first-error-wins
//! - Byte-level invocation of a resolved remote method
//! - Pull and push delivery fronts that ack only after the response is published
//!
//! ## Architecture
//!
//! ```text
//!   source ─▶ throttle ─▶ parallel executor ─┐
//!                                             ├─▶ ByteInvoker ─▶ backend
//!   broker ─▶ pull / push front ─────────────┘         │
//!      ▲                                                ▼
//!      └──────── ack / nack ◀──── publish response ◀────┘
//!
//!   every unit of work ─▶ Start / Done / Cancel ─▶ stats aggregator ─▶ reports
//! ```

// Enforce strict safety at compile time
#![deny(unsafe_code)]
#![warn(missing_debug_implementations)]
#![warn(rust_2018_idioms)]

pub mod agent;
pub mod broker;
pub mod flow;
pub mod invoke;
pub mod loadgen;
pub mod source;
pub mod stats;
pub mod types;

// Internal utilities
pub mod observability;

pub use types::{Config, Error, Result};
