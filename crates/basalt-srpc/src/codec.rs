//! `FrameCodec`: encode/decode [`Envelope`]s over binary WebSocket frames.
//!
//! The distilled spec treats payload (de)serialization as supplied by an
//! "application-level codec" — the core only needs `encode`/`decode`. We
//! model that as the [`WireCodec`] trait so a real deployment can swap in a
//! protobuf/flatbuffers codec without touching [`FrameCodec`] or anything
//! above it; [`JsonWireCodec`] is the default, dependency-light
//! implementation used by every test in this crate.

use tokio_tungstenite::tungstenite::Message;

use crate::envelope::Envelope;
use crate::error::{Result, SrpcError};

/// Serializes an [`Envelope`] to/from the bytes carried in a binary
/// WebSocket frame. Implementations must be deterministic and side-effect
/// free; `FrameCodec` assumes `decode(encode(e)) == e`.
pub trait WireCodec: Send + Sync + 'static {
    fn encode(&self, envelope: &Envelope) -> Result<Vec<u8>>;
    fn decode(&self, bytes: &[u8]) -> Result<Envelope>;
}

/// JSON-over-binary-frame codec. Not the most compact wire format, but
/// dependency-light and trivially debuggable; swapped out by real deployments
/// that want a binary schema.
#[derive(Debug, Clone, Copy, Default)]
pub struct JsonWireCodec;

impl WireCodec for JsonWireCodec {
    fn encode(&self, envelope: &Envelope) -> Result<Vec<u8>> {
        Ok(serde_json::to_vec(envelope)?)
    }

    fn decode(&self, bytes: &[u8]) -> Result<Envelope> {
        Ok(serde_json::from_slice(bytes)?)
    }
}

/// Encodes/decodes [`Envelope`]s as binary WebSocket [`Message`]s, delegating
/// payload (de)serialization to an injected [`WireCodec`].
pub struct FrameCodec<C = JsonWireCodec> {
    codec: C,
}

impl<C: WireCodec> FrameCodec<C> {
    pub fn new(codec: C) -> Self {
        Self { codec }
    }

    pub fn encode(&self, envelope: &Envelope) -> Result<Message> {
        Ok(Message::Binary(self.codec.encode(envelope)?.into()))
    }

    /// Decodes a binary frame into an [`Envelope`]. Text frames, pings,
    /// pongs and close frames carried by the transport itself are not
    /// envelopes and decode to `Ok(None)` so the caller can ignore them
    /// without treating them as a protocol violation.
    pub fn decode(&self, message: &Message) -> Result<Option<Envelope>> {
        match message {
            Message::Binary(bytes) => Ok(Some(self.codec.decode(bytes)?)),
            Message::Close(_) => Ok(None),
            Message::Ping(_) | Message::Pong(_) => Ok(None),
            Message::Text(_) | Message::Frame(_) => Err(SrpcError::ProtocolError {
                reason: "srpc envelopes must be carried in binary frames".to_string(),
            }),
        }
    }
}

impl Default for FrameCodec<JsonWireCodec> {
    fn default() -> Self {
        Self::new(JsonWireCodec)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn round_trips_through_binary_frame() {
        let codec = FrameCodec::default();
        let envelope = Envelope::request("r1", "uEcho", json!({"text": "hi"}));

        let message = codec.encode(&envelope).unwrap();
        assert!(matches!(message, Message::Binary(_)));

        let decoded = codec.decode(&message).unwrap().unwrap();
        assert_eq!(decoded, envelope);
    }

    #[test]
    fn rejects_text_frames() {
        let codec = FrameCodec::default();
        let result = codec.decode(&Message::Text("not an envelope".into()));
        assert!(matches!(result, Err(SrpcError::ProtocolError { .. })));
    }

    #[test]
    fn ignores_close_frames() {
        let codec = FrameCodec::default();
        assert_eq!(codec.decode(&Message::Close(None)).unwrap(), None);
    }
}
