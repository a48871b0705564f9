//! Typed envelope model for the rgate wire protocol.
//!
//! Every frame on the control channel is one JSON object:
//!
//! ```text
//! { "type": "request"|"response"|"event"|"error"|"ping"|"pong",
//!   "id": "<correlation-id>",
//!   "payload": { ... },
//!   "ts": <epoch-millis> }
//! ```
//!
//! The `type` tag selects exactly one [`Payload`] variant. Fields the codec
//! does not know about are kept in `extra` maps so pass-through envelopes
//! re-encode without loss.

use crate::error::{ErrorKind, GatewayError};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::time::{SystemTime, UNIX_EPOCH};

/// Protocol version advertised during the handshake.
pub const PROTOCOL_VERSION: &str = "rgate-v1";

/// Envelope type tag.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MsgType {
    Request,
    Response,
    Event,
    Error,
    Ping,
    Pong,
}

impl MsgType {
    pub fn as_str(&self) -> &'static str {
        match self {
            MsgType::Request => "request",
            MsgType::Response => "response",
            MsgType::Event => "event",
            MsgType::Error => "error",
            MsgType::Ping => "ping",
            MsgType::Pong => "pong",
        }
    }

    pub fn parse(tag: &str) -> Option<Self> {
        match tag {
            "request" => Some(MsgType::Request),
            "response" => Some(MsgType::Response),
            "event" => Some(MsgType::Event),
            "error" => Some(MsgType::Error),
            "ping" => Some(MsgType::Ping),
            "pong" => Some(MsgType::Pong),
            _ => None,
        }
    }

    /// Whether envelopes of this type must carry a correlation id.
    pub fn requires_id(&self) -> bool {
        matches!(self, MsgType::Request | MsgType::Response)
    }
}

/// `request` body: the operation name plus its arguments.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RequestPayload {
    pub op: String,
    #[serde(flatten)]
    pub args: Map<String, Value>,
}

/// `event` body: uncorrelated notification.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventPayload {
    pub event: String,
    #[serde(flatten)]
    pub data: Map<String, Value>,
}

/// `error` body.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorPayload {
    pub kind: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(flatten)]
    pub details: Map<String, Value>,
}

impl ErrorPayload {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind: kind.as_str().to_string(),
            message: Some(message.into()),
            details: Map::new(),
        }
    }

    /// Convert a remote error body into a local error.
    pub fn into_error(self) -> GatewayError {
        match self.kind.as_str() {
            "RequestTimeout" => GatewayError::RequestTimeout,
            "SessionTerminated" => GatewayError::SessionTerminated,
            _ => GatewayError::Remote {
                kind: self.kind,
                message: self.message.unwrap_or_default(),
            },
        }
    }
}

impl From<&GatewayError> for ErrorPayload {
    fn from(err: &GatewayError) -> Self {
        ErrorPayload::new(err.kind(), err.to_string())
    }
}

impl GatewayError {
    /// The single error envelope that answers a failed request.
    pub fn to_envelope(&self, id: Option<String>) -> Envelope {
        Envelope::from_error(id, self)
    }
}

/// `ping` / `pong` body.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct HeartbeatPayload {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub seq: Option<u64>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

/// Payload variant, one per [`MsgType`].
#[derive(Debug, Clone, PartialEq)]
pub enum Payload {
    Request(RequestPayload),
    Response(Value),
    Event(EventPayload),
    Error(ErrorPayload),
    Ping(HeartbeatPayload),
    Pong(HeartbeatPayload),
}

impl Payload {
    pub fn msg_type(&self) -> MsgType {
        match self {
            Payload::Request(_) => MsgType::Request,
            Payload::Response(_) => MsgType::Response,
            Payload::Event(_) => MsgType::Event,
            Payload::Error(_) => MsgType::Error,
            Payload::Ping(_) => MsgType::Ping,
            Payload::Pong(_) => MsgType::Pong,
        }
    }
}

/// One wire unit.
#[derive(Debug, Clone, PartialEq)]
pub struct Envelope {
    pub msg_type: MsgType,
    pub id: Option<String>,
    pub payload: Payload,
    /// Epoch milliseconds at creation.
    pub ts: u64,
    /// Unknown top-level fields, preserved for pass-through.
    pub extra: Map<String, Value>,
}

impl Envelope {
    fn build(id: Option<String>, payload: Payload) -> Self {
        Self {
            msg_type: payload.msg_type(),
            id,
            payload,
            ts: now_millis(),
            extra: Map::new(),
        }
    }

    pub fn request(id: impl Into<String>, op: impl Into<String>, args: Map<String, Value>) -> Self {
        Self::build(
            Some(id.into()),
            Payload::Request(RequestPayload {
                op: op.into(),
                args,
            }),
        )
    }

    pub fn response(id: impl Into<String>, result: Value) -> Self {
        Self::build(Some(id.into()), Payload::Response(result))
    }

    pub fn event(name: impl Into<String>, data: Map<String, Value>) -> Self {
        Self::build(
            None,
            Payload::Event(EventPayload {
                event: name.into(),
                data,
            }),
        )
    }

    /// Error envelope. `id` is `None` only when the failed envelope carried
    /// no recoverable correlation id.
    pub fn error(id: Option<String>, payload: ErrorPayload) -> Self {
        Self::build(id, Payload::Error(payload))
    }

    pub fn from_error(id: Option<String>, err: &GatewayError) -> Self {
        Self::error(id, ErrorPayload::from(err))
    }

    pub fn ping(seq: u64) -> Self {
        Self::build(
            None,
            Payload::Ping(HeartbeatPayload {
                seq: Some(seq),
                extra: Map::new(),
            }),
        )
    }

    pub fn pong(seq: Option<u64>) -> Self {
        Self::build(
            None,
            Payload::Pong(HeartbeatPayload {
                seq,
                extra: Map::new(),
            }),
        )
    }
}

/// Current wall-clock time in epoch milliseconds.
pub fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}
