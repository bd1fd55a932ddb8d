//! Error types for the mutex, leader election and mesh RPC services.

use thiserror::Error;

pub type Result<T> = std::result::Result<T, CoordinationError>;

#[derive(Debug, Error)]
pub enum CoordinationError {
    /// `with_mutex` could not acquire the lock within `retry_count * retry_delay_ms`.
    #[error("lock timeout acquiring {key}")]
    LockTimeout { key: String },

    /// The renewal ticker observed `RENEW` return 0: another holder already
    /// has the key, or it expired before renewal fired.
    #[error("lock lost for {key}: renewal failed mid-body")]
    LockLost { key: String },

    /// `Mesh::invoke` saw no reply before its deadline.
    #[error("mesh request {request_id} to instance {target} timed out")]
    MeshRequestTimeout { request_id: String, target: u32 },

    /// The remote handler ran and reported a runtime error.
    #[error("mesh handler for {message_type} on instance {target} failed: {reason}")]
    MeshHandlerError {
        message_type: String,
        target: u32,
        reason: String,
    },

    /// The remote peer has no handler registered for this message type.
    #[error("mesh instance {target} has no handler for {message_type}")]
    MeshNoHandler { message_type: String, target: u32 },

    /// The mesh service was stopped while the request was in flight.
    #[error("mesh stopped while request {request_id} was in flight")]
    MeshStopped { request_id: String },

    /// The mesh has no registered handler for `invoke(self, ...)`.
    #[error("no local handler registered for {message_type}")]
    MeshNoLocalHandler { message_type: String },

    /// Underlying Redis command failure.
    #[error("redis error: {0}")]
    Redis(#[from] redis::RedisError),

    /// JSON (de)serialization of a mesh RPC envelope failed.
    #[error("mesh envelope (de)serialization failed: {0}")]
    Serialization(#[from] serde_json::Error),

    /// A pub/sub subscription could not be established.
    #[error("failed to subscribe to {channel}: {reason}")]
    SubscribeFailed { channel: String, reason: String },
}
