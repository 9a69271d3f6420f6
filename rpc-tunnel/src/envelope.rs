//! JSON-RPC envelopes exchanged over either transport.
//!
//! # Wire Format
//!
//! ```text
//! Request:  {"jsonrpc":"2.0", "id"?: <int>, "method": <string>, "params": [<value>...]}
//! Reply:    {"id": <int>, "result"?: <value>, "error"?: <value>}
//! Event:    {"id": <string event name>, "result": <value>}
//! ```
//!
//! A numeric `id` always names a call; a textual `id` always names an event.

use base64::Engine;
use bytes::Bytes;
use serde::Serialize;
use serde_json::{Map, Value};

use crate::correlation::CallIdFactory;
use crate::error::CallError;

/// Protocol version carried by every request.
pub const PROTOCOL_VERSION: &str = "2.0";

/// Control method subscribing the streaming connection to an event.
pub const SUBSCRIBE_METHOD: &str = "rpc.on";

/// Control method unsubscribing the streaming connection from an event.
pub const UNSUBSCRIBE_METHOD: &str = "rpc.off";

/// Outbound request envelope.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Request {
    jsonrpc: &'static str,

    /// Call identifier, present only when a reply is expected.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub id: Option<u64>,

    /// Remote method name.
    pub method: String,

    /// Ordered positional parameters.
    pub params: Vec<Value>,
}

impl Request {
    /// Create a request with an explicit identifier.
    pub fn new(method: impl Into<String>, params: Vec<Value>, id: Option<u64>) -> Self {
        Self {
            jsonrpc: PROTOCOL_VERSION,
            id,
            method: method.into(),
            params,
        }
    }

    /// Build a request, drawing an identifier from `ids` only when a reply
    /// is expected.
    pub fn build(
        method: impl Into<String>,
        params: Vec<Value>,
        expect_reply: bool,
        ids: &CallIdFactory,
    ) -> Self {
        let id = expect_reply.then(|| ids.next());
        Self::new(method, params, id)
    }

    /// Whether the sender waits for a reply.
    pub fn expects_reply(&self) -> bool {
        self.id.is_some()
    }

    /// Serialize to the JSON wire format.
    pub fn to_json(&self) -> Result<String, CallError> {
        serde_json::to_string(self).map_err(|e| CallError::MalformedEnvelope(e.to_string()))
    }
}

/// A reply to a call.
#[derive(Debug, Clone, PartialEq)]
pub struct ReplyEnvelope {
    /// Identifier of the call this answers. Unary replies may omit it when
    /// they carry an error.
    pub id: Option<u64>,

    /// `result` member, `Some(Value::Null)` when present as `null`.
    pub result: Option<Value>,

    /// `error` member. A `null` error counts as absent.
    pub error: Option<Value>,
}

impl ReplyEnvelope {
    fn from_object(id: Option<u64>, mut object: Map<String, Value>) -> Result<Self, CallError> {
        let result = object.remove("result");
        let error = object.remove("error").filter(|e| !e.is_null());
        if result.is_none() && error.is_none() {
            return Err(CallError::MalformedEnvelope(
                "reply carries neither result nor error".to_string(),
            ));
        }
        Ok(Self { id, result, error })
    }

    /// Parse the structured body of a unary response.
    ///
    /// Returns `Ok(None)` when the body is empty or `null`.
    pub fn parse_unary(body: &[u8]) -> Result<Option<Self>, CallError> {
        if body.iter().all(u8::is_ascii_whitespace) {
            return Ok(None);
        }
        let value: Value = serde_json::from_slice(body)
            .map_err(|e| CallError::MalformedEnvelope(e.to_string()))?;
        let object = match value {
            Value::Null => return Ok(None),
            Value::Object(object) => object,
            other => {
                return Err(CallError::MalformedEnvelope(format!(
                    "expected object, got {other}"
                )))
            }
        };
        let id = object.get("id").and_then(Value::as_u64);
        if id.is_none() && !has_error(&object) {
            return Err(CallError::MalformedEnvelope("reply is missing id".to_string()));
        }
        Self::from_object(id, object).map(Some)
    }
}

fn has_error(object: &Map<String, Value>) -> bool {
    object.get("error").is_some_and(|e| !e.is_null())
}

/// A message received on the streaming connection.
#[derive(Debug, Clone, PartialEq)]
pub enum Inbound {
    /// Reply to an outstanding call.
    Reply(ReplyEnvelope),

    /// Server-pushed event.
    Event {
        /// Event name carried in the textual `id`.
        name: String,
        /// Raw `result` payload, `Null` when absent.
        payload: Value,
    },

    /// Reply with a numeric id but neither `result` nor `error`.
    ///
    /// Kept apart from other malformed input because the call it names can
    /// be failed instead of left waiting.
    Incomplete {
        /// Identifier of the call the reply names.
        id: u64,
    },
}

impl Inbound {
    /// Classify a text frame.
    pub fn parse(text: &str) -> Result<Self, CallError> {
        let value: Value =
            serde_json::from_str(text).map_err(|e| CallError::MalformedEnvelope(e.to_string()))?;
        let Value::Object(mut object) = value else {
            return Err(CallError::MalformedEnvelope(
                "message is not an object".to_string(),
            ));
        };
        match object.remove("id") {
            None | Some(Value::Null) => {
                Err(CallError::MalformedEnvelope("message is missing id".to_string()))
            }
            Some(Value::String(name)) => {
                let payload = object.remove("result").unwrap_or(Value::Null);
                Ok(Inbound::Event { name, payload })
            }
            Some(id) => match id.as_u64() {
                Some(id) if !object.contains_key("result") && !has_error(&object) => {
                    Ok(Inbound::Incomplete { id })
                }
                Some(id) => ReplyEnvelope::from_object(Some(id), object).map(Inbound::Reply),
                None => Err(CallError::MalformedEnvelope(format!("invalid id: {id}"))),
            },
        }
    }
}

/// What a transport delivers for a call, before the handle interprets it.
#[derive(Debug, Clone, PartialEq)]
pub enum Payload {
    /// Structured (JSON) reply.
    Structured(ReplyEnvelope),
    /// Opaque binary body.
    Binary(Bytes),
}

impl Payload {
    /// Surface an embedded `error` as [`CallError::Remote`], otherwise
    /// unwrap the result.
    pub fn into_reply(self) -> Result<Reply, CallError> {
        match self {
            Payload::Structured(ReplyEnvelope {
                error: Some(error), ..
            }) => Err(CallError::Remote(error)),
            Payload::Structured(ReplyEnvelope { result, .. }) => {
                Ok(Reply::Value(result.unwrap_or(Value::Null)))
            }
            Payload::Binary(bytes) => Ok(Reply::Binary(bytes)),
        }
    }
}

/// Successful outcome of a call.
#[derive(Debug, Clone, PartialEq)]
pub enum Reply {
    /// The structured `result` value.
    Value(Value),
    /// Raw bytes from a non-structured response, unmodified.
    Binary(Bytes),
}

impl Reply {
    /// The structured value, if any.
    pub fn as_value(&self) -> Option<&Value> {
        match self {
            Reply::Value(value) => Some(value),
            Reply::Binary(_) => None,
        }
    }

    /// Consume into the structured value.
    pub fn into_value(self) -> Result<Value, CallError> {
        match self {
            Reply::Value(value) => Ok(value),
            Reply::Binary(_) => Err(CallError::Decode(
                "expected structured reply, got binary".to_string(),
            )),
        }
    }

    /// Consume into bytes.
    ///
    /// Binary replies pass through; a structured string is decoded as
    /// base64, which is how binary results travel inside JSON.
    pub fn into_bytes(self) -> Result<Bytes, CallError> {
        match self {
            Reply::Binary(bytes) => Ok(bytes),
            Reply::Value(Value::String(text)) => base64::engine::general_purpose::STANDARD
                .decode(text)
                .map(Bytes::from)
                .map_err(|e| CallError::Decode(e.to_string())),
            Reply::Value(other) => Err(CallError::Decode(format!(
                "expected binary reply, got {other}"
            ))),
        }
    }
}
