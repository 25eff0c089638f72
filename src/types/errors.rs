//! Application error types.
//!
//! All errors use `thiserror` for automatic Error trait derivation and provide
//! clear error messages with context.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use thiserror::Error;

/// Application result type.
pub type Result<T> = std::result::Result<T, Error>;

/// Main error enum for the agent.
#[derive(Error, Debug)]
pub enum Error {
    /// Invalid or missing configuration. Fatal, raised before work starts.
    #[error("configuration error: {0}")]
    Config(String),

    /// Malformed inbound payload (maps to HTTP 400).
    #[error("decode error: {0}")]
    Decode(String),

    /// Response could not be encoded to the requested output format.
    #[error("encode error: {0}")]
    Encode(String),

    /// Remote invocation failed (network or remote status).
    #[error("remote error: {0}")]
    Remote(String),

    /// Publishing the response to the broker failed.
    #[error("publish error: {0}")]
    Publish(String),

    /// Broker rejected an ack/nack or a pull request.
    #[error("broker error: {0}")]
    Broker(String),

    /// Cancellation of the process-wide token.
    #[error("operation cancelled: {0}")]
    Cancelled(String),

    /// Internal errors (task panics, invariant breaks).
    #[error("internal error: {0}")]
    Internal(String),

    /// Serialization/deserialization errors.
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// HTTP transport errors.
    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),

    /// I/O errors.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl Error {
    /// True for cancellation, which is a clean shutdown rather than a failure.
    pub fn is_cancelled(&self) -> bool {
        matches!(self, Error::Cancelled(_))
    }

    /// HTTP status used when the error answers a push delivery.
    pub fn http_status(&self) -> StatusCode {
        match self {
            Error::Config(_) | Error::Decode(_) | Error::Encode(_) | Error::Serialization(_) => {
                StatusCode::BAD_REQUEST
            }
            Error::Remote(_) | Error::Publish(_) | Error::Broker(_) | Error::Http(_) => {
                StatusCode::BAD_GATEWAY
            }
            Error::Cancelled(_) => StatusCode::SERVICE_UNAVAILABLE,
            Error::Internal(_) | Error::Io(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

// Convenience constructors
impl Error {
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }

    pub fn decode(msg: impl Into<String>) -> Self {
        Self::Decode(msg.into())
    }

    pub fn encode(msg: impl Into<String>) -> Self {
        Self::Encode(msg.into())
    }

    pub fn remote(msg: impl Into<String>) -> Self {
        Self::Remote(msg.into())
    }

    pub fn publish(msg: impl Into<String>) -> Self {
        Self::Publish(msg.into())
    }

    pub fn broker(msg: impl Into<String>) -> Self {
        Self::Broker(msg.into())
    }

    pub fn cancelled(msg: impl Into<String>) -> Self {
        Self::Cancelled(msg.into())
    }

    pub fn internal(msg: impl Into<String>) -> Self {
        Self::Internal(msg.into())
    }
}

// Lets push handlers return `Result<_, Error>` directly.
impl IntoResponse for Error {
    fn into_response(self) -> Response {
        (self.http_status(), self.to_string()).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_mapping() {
        assert_eq!(Error::decode("bad").http_status(), StatusCode::BAD_REQUEST);
        assert_eq!(Error::remote("down").http_status(), StatusCode::BAD_GATEWAY);
        assert_eq!(Error::publish("lost").http_status(), StatusCode::BAD_GATEWAY);
        assert_eq!(
            Error::cancelled("shutdown").http_status(),
            StatusCode::SERVICE_UNAVAILABLE
        );
    }

    #[test]
    fn test_cancelled_is_distinguished() {
        assert!(Error::cancelled("ctx").is_cancelled());
        assert!(!Error::remote("ctx").is_cancelled());
    }
}
