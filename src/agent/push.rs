//! Push front: Pub/Sub push deliveries over HTTP.
//!
//! The response status is the acknowledgment: 200 only after the response
//! publish is confirmed, an error status otherwise so the broker redelivers.

use axum::body::Bytes;
use axum::extract::State;
use axum::http::StatusCode;
use axum::routing::post;
use axum::Router;
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use chrono::{DateTime, Utc};
use serde::Deserialize;
use std::collections::HashMap;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;

use super::MessageProcessor;
use crate::broker::BrokerMessage;
use crate::types::{Error, Result};

/// Pub/Sub push request body.
#[derive(Debug, Clone, Deserialize)]
pub struct PushEnvelope {
    pub message: PushMessage,
    #[serde(default)]
    pub subscription: String,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PushMessage {
    /// Base64 payload.
    #[serde(default)]
    pub data: String,
    #[serde(default)]
    pub attributes: HashMap<String, String>,
    #[serde(default)]
    pub message_id: String,
    #[serde(default)]
    pub publish_time: Option<DateTime<Utc>>,
}

impl PushEnvelope {
    pub fn decode(body: &[u8]) -> Result<BrokerMessage> {
        let envelope: PushEnvelope = serde_json::from_slice(body)
            .map_err(|e| Error::decode(format!("invalid push envelope: {}", e)))?;
        let data = BASE64
            .decode(envelope.message.data.as_bytes())
            .map_err(|e| Error::decode(format!("invalid base64 message data: {}", e)))?;

        Ok(BrokerMessage {
            id: envelope.message.message_id,
            data: data.into(),
            attributes: envelope.message.attributes,
            publish_time: envelope.message.publish_time,
            delivery_attempt: None,
        })
    }
}

pub fn router(processor: MessageProcessor) -> Router {
    Router::new()
        .route("/", post(handle_push))
        .with_state(processor)
}

async fn handle_push(
    State(processor): State<MessageProcessor>,
    body: Bytes,
) -> std::result::Result<StatusCode, Error> {
    let message = PushEnvelope::decode(&body).map_err(|e| {
        tracing::warn!(error = %e, "rejected push delivery");
        e
    })?;
    // Runs to completion even if the client goes away mid-request.
    let processing = tokio::spawn(async move { processor.process_and_confirm(message).await });
    processing
        .await
        .map_err(|e| Error::internal(format!("push processing failed: {}", e)))??;
    Ok(StatusCode::OK)
}

/// Serve push deliveries until `cancel` fires; in-flight requests finish.
pub async fn serve(
    listener: TcpListener,
    processor: MessageProcessor,
    cancel: CancellationToken,
) -> Result<()> {
    let addr = listener.local_addr()?;
    tracing::info!(%addr, "listening for push deliveries");

    axum::serve(listener, router(processor))
        .with_graceful_shutdown(async move { cancel.cancelled().await })
        .await?;

    tracing::info!("push front stopped");
    Ok(())
}
