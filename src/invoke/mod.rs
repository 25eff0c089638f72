//! Byte-level invocation of a remote unary method.
//!
//! A [`ByteInvoker`] is bound once to a target method: the schema pair is
//! resolved at construction and streaming methods are refused there. Each
//! call decodes the payload into the request type, performs exactly one
//! remote call and encodes the response into the output format.

mod codec;
mod endpoint;
mod http;
mod schema;

pub use codec::{DynamicMessage, Encoding, MessageBody, MessageCodec, PassthroughCodec};
pub use endpoint::Endpoint;
pub use http::HttpBackend;
pub use schema::{MethodSchema, SchemaResolver, StaticSchemaResolver};

use async_trait::async_trait;
use bytes::Bytes;
use std::fmt::Debug;
use std::sync::Arc;

use crate::types::{Config, Error, Result};

/// Payload bytes in, response bytes out.
#[async_trait]
pub trait Invoke: Send + Sync + Debug {
    async fn invoke(&self, payload: Bytes) -> Result<Bytes>;
}

/// One unary call on a remote method with structured messages.
#[async_trait]
pub trait RemoteCall: Send + Sync + Debug {
    async fn call(&self, method: &MethodSchema, request: DynamicMessage) -> Result<DynamicMessage>;
}

/// Invoker bound to one resolved unary method.
#[derive(Debug, Clone)]
pub struct ByteInvoker {
    schema: Arc<MethodSchema>,
    input: Encoding,
    output: Encoding,
    codec: Arc<dyn MessageCodec>,
    remote: Arc<dyn RemoteCall>,
}

impl ByteInvoker {
    /// Resolve the endpoint's method and bind an invoker to it.
    pub async fn connect(
        resolver: &dyn SchemaResolver,
        endpoint: &Endpoint,
        remote: Arc<dyn RemoteCall>,
        codec: Arc<dyn MessageCodec>,
        input: Encoding,
        output: Encoding,
    ) -> Result<Self> {
        if !codec.supports(input, output) {
            return Err(Error::config(format!(
                "codec {:?} cannot read {} payloads and answer in {}",
                codec, input, output
            )));
        }

        let schema = resolver.resolve(&endpoint.service, &endpoint.method).await?;
        if schema.is_streaming() {
            return Err(Error::config(format!(
                "method {} is streaming, only unary methods are supported",
                schema.full_method()
            )));
        }

        tracing::debug!(
            method = %schema.full_method(),
            request_type = %schema.request_type,
            response_type = %schema.response_type,
            %input,
            %output,
            "bound invoker"
        );

        Ok(Self {
            schema: Arc::new(schema),
            input,
            output,
            codec,
            remote,
        })
    }

    /// Build the HTTP-backed invoker described by the configuration.
    pub async fn from_config(config: &Config, input: Encoding, output: Encoding) -> Result<Self> {
        let url = config
            .backend
            .endpoint
            .as_deref()
            .ok_or_else(|| Error::config("the backend endpoint must be configured"))?;
        let endpoint = Endpoint::parse(url)?;
        let resolver = StaticSchemaResolver::new(config.backend.methods.iter().cloned());
        let backend = HttpBackend::new(
            &endpoint,
            config.backend.timeout,
            config.backend.access_token.clone(),
        )?;

        Self::connect(
            &resolver,
            &endpoint,
            Arc::new(backend),
            Arc::new(PassthroughCodec),
            input,
            output,
        )
        .await
    }

    pub fn schema(&self) -> &MethodSchema {
        &self.schema
    }
}

#[async_trait]
impl Invoke for ByteInvoker {
    async fn invoke(&self, payload: Bytes) -> Result<Bytes> {
        let request = self
            .codec
            .decode(&self.schema.request_type, self.input, &payload)?;
        let response = self.remote.call(&self.schema, request).await?;
        self.codec.encode(&response, self.output)
    }
}
