//! Identifiers used to correlate telemetry and broker messages.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;

/// Message attribute carrying the correlation id.
pub const CORRELATION_ATTRIBUTE: &str = "srcId";

/// Caller-supplied identifier bracketing one unit of work's telemetry.
///
/// Unlike most ids this may be empty: messages without a `srcId` attribute
/// all share the empty id.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct CorrelationId(String);

impl CorrelationId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Extract from message attributes, defaulting to the empty id.
    pub fn from_attributes(attributes: &HashMap<String, String>) -> Self {
        Self(
            attributes
                .get(CORRELATION_ATTRIBUTE)
                .cloned()
                .unwrap_or_default(),
        )
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for CorrelationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for CorrelationId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl From<String> for CorrelationId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

/// Load-test job identifier; prefixes every generated correlation id.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct JobId(String);

impl JobId {
    pub fn new() -> Self {
        Self(uuid::Uuid::new_v4().simple().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Correlation id of the `n`th message of this job.
    pub fn message_id(&self, n: u64) -> CorrelationId {
        CorrelationId(format!("Job-{}-Msg-{}", self.0, n))
    }
}

impl Default for JobId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for JobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_missing_attribute_defaults_to_empty() {
        let attributes = HashMap::new();
        assert_eq!(CorrelationId::from_attributes(&attributes).as_str(), "");
    }

    #[test]
    fn test_attribute_is_extracted() {
        let attributes = HashMap::from([(CORRELATION_ATTRIBUTE.to_string(), "m1".to_string())]);
        assert_eq!(CorrelationId::from_attributes(&attributes).as_str(), "m1");
    }

    #[test]
    fn test_job_message_ids_are_distinct() {
        let job = JobId::new();
        assert_ne!(job.message_id(1), job.message_id(2));
        assert!(job.message_id(3).as_str().ends_with("-Msg-3"));
    }
}
