//! Error taxonomy for the SRPC duplex protocol (handshake, request/response,
//! and byte substreams).

use thiserror::Error;

pub type Result<T> = std::result::Result<T, SrpcError>;

/// Which side of a byte substream a [`SrpcError::PipeError`] occurred on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PipeSide {
    Input,
    Output,
}

impl std::fmt::Display for PipeSide {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            Self::Input => "input",
            Self::Output => "output",
        })
    }
}

#[derive(Debug, Error)]
pub enum SrpcError {
    /// HMAC/clock-drift/authorizer check failed during handshake.
    #[error("srpc authentication failed: {reason}")]
    AuthFailed { reason: String },

    /// An inbound envelope violated the wire protocol: missing request id on
    /// a non-ping/non-byte-stream envelope, or a reply referencing an
    /// unknown request id.
    #[error("srpc protocol error: {reason}")]
    ProtocolError { reason: String },

    /// `invoke` saw no reply before its deadline.
    #[error("srpc request {request_id} timed out")]
    RequestTimeout { request_id: String },

    /// The remote handler ran and reported an error.
    #[error("srpc handler for {prefix} failed: {reason}")]
    HandlerError { prefix: String, reason: String },

    /// The remote peer has no handler registered for this request prefix.
    #[error("srpc peer has no handler for {prefix}")]
    NoHandler { prefix: String },

    /// The connection was closed (or never established) while the request
    /// was in flight; every pending `invoke` is rejected with this on
    /// disconnect.
    #[error("srpc peer disconnected")]
    Disconnected,

    /// A byte-substream sender/receiver pair failed on `side`.
    #[error("srpc byte substream {side} error: {cause}")]
    PipeError { side: PipeSide, cause: String },

    /// A `PendingReceiver` was not created within its TTL.
    #[error("pending receiver for substream {substream_id} expired before creation")]
    PendingReceiverExpired { substream_id: u32 },

    /// A `PendingReceiver`'s byte cap was exceeded before creation.
    #[error("pending receiver for substream {substream_id} exceeded its byte cap")]
    PendingReceiverOverflow { substream_id: u32 },

    /// The substream id does not exist (neither sender nor receiver), and the
    /// operation required one to already be registered.
    #[error("no such substream {substream_id}")]
    UnknownSubstream { substream_id: u32 },

    /// The WebSocket transport failed.
    #[error("websocket error: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),

    /// Envelope (de)serialization failed.
    #[error("envelope (de)serialization failed: {0}")]
    Codec(#[from] serde_json::Error),

    /// Underlying I/O failure (handshake connect, etc).
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}
