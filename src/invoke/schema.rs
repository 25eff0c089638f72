//! Remote method schemas and their resolution.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt::Debug;

use crate::types::{Error, Result};

/// Request/response schema pair of one remote method.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MethodSchema {
    pub service: String,
    pub method: String,
    pub request_type: String,
    pub response_type: String,
    #[serde(default)]
    pub client_streaming: bool,
    #[serde(default)]
    pub server_streaming: bool,
}

impl MethodSchema {
    /// Unary request/response schema pair.
    pub fn unary(
        service: impl Into<String>,
        method: impl Into<String>,
        request_type: impl Into<String>,
        response_type: impl Into<String>,
    ) -> Self {
        Self {
            service: service.into(),
            method: method.into(),
            request_type: request_type.into(),
            response_type: response_type.into(),
            client_streaming: false,
            server_streaming: false,
        }
    }

    pub fn is_streaming(&self) -> bool {
        self.client_streaming || self.server_streaming
    }

    /// `/<service>/<method>`.
    pub fn full_method(&self) -> String {
        format!("/{}/{}", self.service, self.method)
    }
}

/// Resolves a service and method name to its schema pair.
#[async_trait]
pub trait SchemaResolver: Send + Sync + Debug {
    async fn resolve(&self, service: &str, method: &str) -> Result<MethodSchema>;
}

/// Resolver over a fixed set of schemas, typically from configuration.
#[derive(Debug, Default, Clone)]
pub struct StaticSchemaResolver {
    services: HashMap<String, HashMap<String, MethodSchema>>,
}

impl StaticSchemaResolver {
    pub fn new(methods: impl IntoIterator<Item = MethodSchema>) -> Self {
        let mut services: HashMap<String, HashMap<String, MethodSchema>> = HashMap::new();
        for schema in methods {
            services
                .entry(schema.service.clone())
                .or_default()
                .insert(schema.method.clone(), schema);
        }
        Self { services }
    }
}

#[async_trait]
impl SchemaResolver for StaticSchemaResolver {
    async fn resolve(&self, service: &str, method: &str) -> Result<MethodSchema> {
        let methods = self
            .services
            .get(service)
            .ok_or_else(|| Error::config(format!("service {} not found", service)))?;

        methods.get(method).cloned().ok_or_else(|| {
            Error::config(format!(
                "service {} does not have a method {}",
                service, method
            ))
        })
    }
}
