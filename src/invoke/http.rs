//! HTTP transport for unary remote calls.

use async_trait::async_trait;
use bytes::Bytes;
use reqwest::header::{ACCEPT, CONTENT_TYPE};
use std::time::Duration;

use super::codec::{DynamicMessage, Encoding, MessageBody};
use super::endpoint::Endpoint;
use super::schema::MethodSchema;
use super::RemoteCall;
use crate::types::{Error, Result};

/// Posts each request to `<base>/<service>/<method>` and reads one response.
#[derive(Debug, Clone)]
pub struct HttpBackend {
    client: reqwest::Client,
    base_url: String,
    access_token: Option<String>,
}

impl HttpBackend {
    pub fn new(endpoint: &Endpoint, timeout: Duration, access_token: Option<String>) -> Result<Self> {
        let client = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self {
            client,
            base_url: endpoint.base_url(),
            access_token,
        })
    }
}

#[async_trait]
impl RemoteCall for HttpBackend {
    async fn call(&self, method: &MethodSchema, request: DynamicMessage) -> Result<DynamicMessage> {
        let full_method = method.full_method();
        let url = format!("{}{}", self.base_url, full_method);
        let encoding = request.body.encoding();

        let mut builder = self
            .client
            .post(&url)
            .header(CONTENT_TYPE, encoding.content_type())
            .header(ACCEPT, encoding.content_type())
            .body(request.body.to_bytes()?);
        if let Some(token) = &self.access_token {
            builder = builder.bearer_auth(token);
        }

        let response = builder
            .send()
            .await
            .map_err(|e| Error::remote(format!("calling {}: {}", full_method, e)))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(Error::remote(format!(
                "{} returned {}: {}",
                full_method,
                status,
                body.trim()
            )));
        }

        let response_encoding = response
            .headers()
            .get(CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .and_then(Encoding::from_content_type)
            .unwrap_or(encoding);
        let bytes: Bytes = response
            .bytes()
            .await
            .map_err(|e| Error::remote(format!("reading {} response: {}", full_method, e)))?;

        let body = match response_encoding {
            Encoding::Json => MessageBody::Json(serde_json::from_slice(&bytes).map_err(|e| {
                Error::remote(format!("invalid JSON response from {}: {}", full_method, e))
            })?),
            Encoding::Binary => MessageBody::Binary(bytes),
        };

        Ok(DynamicMessage {
            type_name: method.response_type.clone(),
            body,
        })
    }
}
