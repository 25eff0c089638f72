//! Core types for the agent.
//!
//! This module provides foundational types used throughout the system:
//! - **IDs**: Correlation and load-test job identifiers
//! - **Errors**: Application error types with thiserror derives
//! - **Config**: Configuration structures for telemetry, backend, broker and sources

mod config;
mod errors;
mod ids;

pub use config::{
    BackendConfig, Config, EncodingConfig, PubSubConfig, PushConfig, ReceiveConfig,
    SourceConfig, StatsConfig,
};
pub use errors::{Error, Result};
pub use ids::{CorrelationId, JobId, CORRELATION_ATTRIBUTE};
