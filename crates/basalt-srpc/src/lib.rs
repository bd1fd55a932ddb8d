//! A bidirectional request/response protocol carried over a single
//! WebSocket per peer: authenticated handshake, heartbeat/timeout, and
//! multiplexed binary substreams with backpressure and race-safe receiver
//! buffering.
//!
//! [`server::SrpcServer`] accepts already-upgraded connections (claimed via
//! [`upgrade_arbiter::UpgradeArbiter`] when several subsystems share one HTTP
//! server); [`client::SrpcClient`] dials one. Both sides speak the same
//! [`envelope::Envelope`] wire format, encoded by [`codec::FrameCodec`], and
//! both can layer [`substream::ByteSubstream`]s over their connection.

pub mod auth;
pub mod client;
pub mod codec;
pub mod envelope;
pub mod error;
pub mod handler;
pub mod server;
pub mod substream;
pub(crate) mod transport;
pub mod upgrade_arbiter;

pub use client::{SrpcClient, SrpcClientOptions};
pub use codec::{FrameCodec, JsonWireCodec, WireCodec};
pub use envelope::Envelope;
pub use error::{PipeSide, Result, SrpcError};
pub use handler::HandlerRegistry;
pub use server::{
    AllowAllAuthorizer, AuthorizerOutcome, ClientAuthorizer, ClientKeyFetcher, SrpcServer,
    SrpcServerOptions, Stream,
};
pub use substream::{ByteSubstreamReceiver, ByteSubstreamSender, HostStream, SubstreamManager};
pub use upgrade_arbiter::{UpgradeArbiter, UpgradeRequest};
