//! Payload encodings and the bytes ⇄ structured message codec.

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::fmt::{self, Debug};
use std::str::FromStr;

use crate::types::{Error, Result};

/// Wire encoding of a payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum Encoding {
    /// Structured JSON.
    #[default]
    Json,
    /// Schema-described binary message.
    Binary,
}

impl Encoding {
    pub fn content_type(self) -> &'static str {
        match self {
            Encoding::Json => "application/json",
            Encoding::Binary => "application/proto",
        }
    }

    pub fn from_content_type(content_type: &str) -> Option<Self> {
        let mime = content_type.split(';').next().unwrap_or("").trim();
        match mime {
            "application/json" => Some(Encoding::Json),
            "application/proto" | "application/protobuf" | "application/x-protobuf" => {
                Some(Encoding::Binary)
            }
            _ => None,
        }
    }
}

impl fmt::Display for Encoding {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Encoding::Json => write!(f, "json"),
            Encoding::Binary => write!(f, "binary"),
        }
    }
}

impl FromStr for Encoding {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "json" => Ok(Encoding::Json),
            "binary" | "proto" => Ok(Encoding::Binary),
            other => Err(Error::config(format!(
                "unknown encoding '{}', expecting json or binary",
                other
            ))),
        }
    }
}

/// Body of a structured message in one of its two forms.
#[derive(Debug, Clone, PartialEq)]
pub enum MessageBody {
    Json(serde_json::Value),
    Binary(Bytes),
}

impl MessageBody {
    pub fn encoding(&self) -> Encoding {
        match self {
            MessageBody::Json(_) => Encoding::Json,
            MessageBody::Binary(_) => Encoding::Binary,
        }
    }

    pub fn to_bytes(&self) -> Result<Bytes> {
        match self {
            MessageBody::Json(value) => Ok(Bytes::from(serde_json::to_vec(value)?)),
            MessageBody::Binary(bytes) => Ok(bytes.clone()),
        }
    }
}

/// A message of a named schema type.
#[derive(Debug, Clone, PartialEq)]
pub struct DynamicMessage {
    pub type_name: String,
    pub body: MessageBody,
}

/// Converts payload bytes to structured messages and back.
pub trait MessageCodec: Send + Sync + Debug {
    /// Whether payloads can be read as `input` and answered as `output`.
    fn supports(&self, input: Encoding, output: Encoding) -> bool;

    fn decode(&self, type_name: &str, encoding: Encoding, bytes: &[u8]) -> Result<DynamicMessage>;

    fn encode(&self, message: &DynamicMessage, encoding: Encoding) -> Result<Bytes>;
}

/// Codec without schema knowledge.
///
/// JSON payloads must be objects; binary payloads are carried opaquely.
/// Converting between the two needs a schema compiler and is refused.
#[derive(Debug, Default, Clone, Copy)]
pub struct PassthroughCodec;

impl MessageCodec for PassthroughCodec {
    fn supports(&self, input: Encoding, output: Encoding) -> bool {
        input == output
    }

    fn decode(&self, type_name: &str, encoding: Encoding, bytes: &[u8]) -> Result<DynamicMessage> {
        let body = match encoding {
            Encoding::Json => {
                let value: serde_json::Value = serde_json::from_slice(bytes).map_err(|e| {
                    Error::decode(format!("error converting JSON to {}: {}", type_name, e))
                })?;
                if !value.is_object() {
                    return Err(Error::decode(format!(
                        "expected a JSON object for {}",
                        type_name
                    )));
                }
                MessageBody::Json(value)
            }
            Encoding::Binary => MessageBody::Binary(Bytes::copy_from_slice(bytes)),
        };

        Ok(DynamicMessage {
            type_name: type_name.to_string(),
            body,
        })
    }

    fn encode(&self, message: &DynamicMessage, encoding: Encoding) -> Result<Bytes> {
        if message.body.encoding() != encoding {
            return Err(Error::encode(format!(
                "cannot transcode {} from {} to {} without a schema-aware codec",
                message.type_name,
                message.body.encoding(),
                encoding
            )));
        }
        message.body.to_bytes()
    }
}
