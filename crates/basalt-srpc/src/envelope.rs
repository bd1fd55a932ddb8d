//! The SRPC wire envelope: request/response payloads, ping/pong, and
//! byte-substream operations, all carried in one container message per the
//! distilled spec's data model.
//!
//! `${prefix}Request` / `${prefix}Response` dynamic field access becomes
//! [`Payload`], a tagged variant with a `prefix()` accessor; the
//! [`crate::handler::HandlerRegistry`] maps `prefix -> handler` the way the
//! distilled spec's own Design Notes describe.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Distributed tracing context, carried opaquely — the core never inspects
/// it beyond forwarding it on requests that include one.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TraceCtx {
    pub trace_id: String,
    pub span_id: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PingPong {
    Ping,
    Pong,
}

/// One operation against a multiplexed byte substream, carried inside an
/// envelope whose other fields (`request_id`, `reply`, ...) are unset.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum ByteStreamOp {
    Write { chunk: Vec<u8> },
    Finish,
    Destroy { error: Option<String> },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ByteStreamOperation {
    pub stream_id: u32,
    #[serde(flatten)]
    pub op: ByteStreamOp,
}

/// The request/response payload of a non-ping, non-byte-stream envelope.
///
/// `Request { prefix, data }` carries a `${prefix}Request`; `Response`
/// carries the matching `${prefix}Response`. An envelope with `error: Some`
/// set has `payload: Payload::None` — the error replaces the response body.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Payload {
    Request {
        prefix: String,
        data: Value,
    },
    Response {
        prefix: String,
        data: Value,
    },
    #[default]
    None,
}

impl Payload {
    /// The `${prefix}` shared by the request/response pair, if this payload
    /// carries one.
    pub fn prefix(&self) -> Option<&str> {
        match self {
            Self::Request { prefix, .. } | Self::Response { prefix, .. } => Some(prefix),
            Self::None => None,
        }
    }

    pub fn data(&self) -> Option<&Value> {
        match self {
            Self::Request { data, .. } | Self::Response { data, .. } => Some(data),
            Self::None => None,
        }
    }
}

/// The container message carried over one SRPC stream.
///
/// Invariant (distilled spec data model): every envelope that is neither a
/// ping/pong nor a byte-stream operation must carry `request_id`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct Envelope {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub request_id: Option<String>,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub reply: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub trace: Option<TraceCtx>,
    #[serde(default, skip_serializing_if = "is_none_payload")]
    pub payload: Payload,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ping_pong: Option<PingPong>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub byte_stream_operation: Option<ByteStreamOperation>,
}

fn is_none_payload(payload: &Payload) -> bool {
    matches!(payload, Payload::None)
}

impl Envelope {
    pub fn ping() -> Self {
        Self {
            ping_pong: Some(PingPong::Ping),
            ..Default::default()
        }
    }

    pub fn pong() -> Self {
        Self {
            ping_pong: Some(PingPong::Pong),
            ..Default::default()
        }
    }

    pub fn request(request_id: impl Into<String>, prefix: impl Into<String>, data: Value) -> Self {
        Self {
            request_id: Some(request_id.into()),
            payload: Payload::Request {
                prefix: prefix.into(),
                data,
            },
            ..Default::default()
        }
    }

    pub fn response(request_id: impl Into<String>, prefix: impl Into<String>, data: Value) -> Self {
        Self {
            request_id: Some(request_id.into()),
            reply: true,
            payload: Payload::Response {
                prefix: prefix.into(),
                data,
            },
            ..Default::default()
        }
    }

    pub fn error_reply(request_id: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            request_id: Some(request_id.into()),
            reply: true,
            error: Some(message.into()),
            ..Default::default()
        }
    }

    pub fn byte_stream(stream_id: u32, op: ByteStreamOp) -> Self {
        Self {
            byte_stream_operation: Some(ByteStreamOperation { stream_id, op }),
            ..Default::default()
        }
    }

    pub fn with_trace(mut self, trace: Option<TraceCtx>) -> Self {
        self.trace = trace;
        self
    }

    pub fn is_ping_pong(&self) -> bool {
        self.ping_pong.is_some()
    }

    pub fn is_byte_stream_op(&self) -> bool {
        self.byte_stream_operation.is_some()
    }

    /// An inbound envelope is well-formed iff it is a ping/pong, a
    /// byte-stream op, or carries a `request_id`.
    pub fn has_required_request_id(&self) -> bool {
        self.is_ping_pong() || self.is_byte_stream_op() || self.request_id.is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn ping_pong_round_trips_through_json() {
        let ping = Envelope::ping();
        let encoded = serde_json::to_string(&ping).unwrap();
        let decoded: Envelope = serde_json::from_str(&encoded).unwrap();
        assert_eq!(decoded, ping);
        assert!(decoded.has_required_request_id());
    }

    #[test]
    fn request_response_round_trip() {
        let req = Envelope::request("r1", "uEcho", json!({"text": "hi"}));
        let encoded = serde_json::to_string(&req).unwrap();
        let decoded: Envelope = serde_json::from_str(&encoded).unwrap();
        assert_eq!(decoded.payload.prefix(), Some("uEcho"));
        assert_eq!(decoded.request_id.as_deref(), Some("r1"));

        let resp = Envelope::response("r1", "uEcho", json!({"text": "echo: hi"}));
        assert!(resp.reply);
        assert_eq!(resp.payload.data(), Some(&json!({"text": "echo: hi"})));
    }

    #[test]
    fn envelope_missing_request_id_fails_requirement_check() {
        let malformed = Envelope {
            payload: Payload::Request {
                prefix: "uEcho".to_string(),
                data: json!({}),
            },
            ..Default::default()
        };
        assert!(!malformed.has_required_request_id());
    }

    #[test]
    fn byte_stream_op_round_trips() {
        let env = Envelope::byte_stream(3, ByteStreamOp::Write { chunk: vec![1, 2, 3] });
        let encoded = serde_json::to_string(&env).unwrap();
        let decoded: Envelope = serde_json::from_str(&encoded).unwrap();
        assert_eq!(decoded, env);
        assert!(decoded.has_required_request_id());
    }
}
