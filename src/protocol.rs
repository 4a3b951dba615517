//! Wire envelopes exchanged over the bridge sockets.
//!
//! There is no framing: each message is one JSON document, sent as-is and read
//! back with a single bounded read. Documents larger than the peer's read
//! buffer arrive truncated, and back-to-back documents may arrive in one read.
//! Neither case is reassembled.
//!
//! **Request:**
//! ```json
//! {"type":"txt2img","options":{"prompt":"a cat","seed":42}}
//! ```
//!
//! **Response:**
//! ```json
//! {"response":["/tmp/out1.png"]}
//! ```

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::fmt;

use crate::error::{BridgeError, Result};

/// Compute capability requested by the host.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RequestKind {
    Txt2img,
    Img2img,
}

impl RequestKind {
    pub fn as_str(self) -> &'static str {
        match self {
            RequestKind::Txt2img => "txt2img",
            RequestKind::Img2img => "img2img",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw {
            "txt2img" => Some(RequestKind::Txt2img),
            "img2img" => Some(RequestKind::Img2img),
            _ => None,
        }
    }
}

impl fmt::Display for RequestKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Request sent from the host to the worker.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RequestEnvelope {
    #[serde(rename = "type")]
    pub kind: RequestKind,
    /// Free-form generation options, passed to the backend untouched.
    #[serde(default)]
    pub options: Map<String, Value>,
}

impl RequestEnvelope {
    pub fn new(kind: RequestKind, options: Map<String, Value>) -> Self {
        Self { kind, options }
    }

    /// Parse one received payload.
    ///
    /// Malformed JSON, a missing `type` and an unknown `type` are all
    /// [`BridgeError::Protocol`].
    pub fn from_wire(bytes: &[u8]) -> Result<Self> {
        let value: Value = serde_json::from_slice(bytes)
            .map_err(|e| BridgeError::Protocol(format!("payload is not JSON: {}", e)))?;
        let Value::Object(mut object) = value else {
            return Err(BridgeError::Protocol("payload is not a JSON object".into()));
        };
        let kind = match object.get("type") {
            None => return Err(BridgeError::Protocol("missing field `type`".into())),
            Some(Value::String(raw)) => RequestKind::parse(raw).ok_or_else(|| {
                BridgeError::Protocol(format!("unsupported request type {:?}", raw))
            })?,
            Some(other) => {
                return Err(BridgeError::Protocol(format!(
                    "field `type` must be a string, got {}",
                    other
                )))
            }
        };
        let options = match object.remove("options") {
            None | Some(Value::Null) => Map::new(),
            Some(Value::Object(options)) => options,
            Some(other) => {
                return Err(BridgeError::Protocol(format!(
                    "field `options` must be an object, got {}",
                    other
                )))
            }
        };
        Ok(Self { kind, options })
    }

    pub fn to_value(&self) -> Value {
        let mut object = Map::new();
        object.insert("type".into(), Value::String(self.kind.as_str().into()));
        object.insert("options".into(), Value::Object(self.options.clone()));
        Value::Object(object)
    }
}

/// Response sent from the worker to the host.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResponseEnvelope {
    pub response: Value,
}

impl ResponseEnvelope {
    /// Wrap a raw backend result.
    ///
    /// Bytes holding a JSON document are embedded as that document, anything
    /// else as a (lossy) UTF-8 string.
    pub fn from_result_bytes(bytes: &[u8]) -> Self {
        let response = serde_json::from_slice(bytes)
            .unwrap_or_else(|_| Value::String(String::from_utf8_lossy(bytes).into_owned()));
        Self { response }
    }

    pub fn to_wire(&self) -> Result<Vec<u8>> {
        Ok(serde_json::to_vec(self)?)
    }
}

/// A payload received by the host-side client.
#[derive(Debug, Clone, PartialEq)]
pub enum InboundMessage {
    Response(ResponseEnvelope),
    /// Valid JSON that is not a response envelope.
    Other(Value),
}

impl InboundMessage {
    pub fn classify(bytes: &[u8]) -> Result<Self> {
        let value: Value = serde_json::from_slice(bytes)
            .map_err(|e| BridgeError::Protocol(format!("payload is not JSON: {}", e)))?;
        match value {
            Value::Object(mut object) if object.contains_key("response") => {
                let response = object.remove("response").unwrap_or(Value::Null);
                Ok(InboundMessage::Response(ResponseEnvelope { response }))
            }
            other => Ok(InboundMessage::Other(other)),
        }
    }
}

/// Serialize an outbound message to its wire form.
pub fn encode(message: &Value) -> Result<Vec<u8>> {
    Ok(serde_json::to_vec(message)?)
}
