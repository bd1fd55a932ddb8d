//! `SrpcServer`: accepts already-upgraded WebSocket connections, authenticates
//! them, and runs the per-stream request/response/ping/byte-substream loop.
//!
//! Mirrors `basalt-coordination::mesh`'s composition style: shared state in
//! an `Arc<Shared>`, one spawned task per concern (writer, reader, ping
//! ticker), callbacks registered as plain `Fn`/`Box<dyn Fn>` rather than an
//! observer-pattern trait hierarchy.

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use async_trait::async_trait;
use basalt_types::{now_ms, RequestId, SubstreamId, SubstreamParity};
use futures_util::StreamExt;
use serde_json::Value;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::WebSocketStream;

use crate::auth::{clock_drift_ok, parse_query, verify_fields};
use crate::codec::{FrameCodec, JsonWireCodec, WireCodec};
use crate::envelope::{ByteStreamOp, Envelope, Payload, PingPong};
use crate::error::{Result, SrpcError};
use crate::handler::HandlerRegistry;
use crate::substream::{ByteSubstreamReceiver, ByteSubstreamSender, HostStream, SubstreamManager};

/// Close code 4001: missing pong within `pong_timeout_ms`.
pub const CLOSE_PONG_TIMEOUT: u16 = 4001;
/// Close code 4002: inbound envelope missing a required `request_id`.
pub const CLOSE_MISSING_REQUEST_ID: u16 = 4002;
/// Close code 4003: reply referencing an unknown `request_id`.
pub const CLOSE_UNKNOWN_REQUEST_ID: u16 = 4003;

#[derive(Debug, Clone, Copy)]
pub struct SrpcServerOptions {
    pub auth_clock_drift_ms: i64,
    pub ping_interval_ms: u64,
    pub pong_timeout_ms: u64,
}

impl Default for SrpcServerOptions {
    fn default() -> Self {
        Self {
            auth_clock_drift_ms: 30_000,
            ping_interval_ms: 30_000,
            pong_timeout_ms: 75_000,
        }
    }
}

/// Looks up the shared secret for a connecting client id. Returns `None` to
/// reject the handshake outright (the distilled spec's `clientKeyFetcher`
/// returning `false`).
#[async_trait]
pub trait ClientKeyFetcher: Send + Sync {
    async fn fetch(&self, client_id: &str) -> Option<String>;
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AuthorizerOutcome {
    Deny,
    Allow,
    /// Accept, replacing the client-supplied `m--*` meta with an enriched
    /// version (e.g. resolved from a user id to a full session record).
    AllowWithMeta(BTreeMap<String, String>),
}

#[async_trait]
pub trait ClientAuthorizer: Send + Sync {
    async fn authorize(&self, meta: BTreeMap<String, String>) -> AuthorizerOutcome;
}

/// A `ClientAuthorizer` that accepts every connection unmodified, for tests
/// and deployments with no connection-level policy.
pub struct AllowAllAuthorizer;

#[async_trait]
impl ClientAuthorizer for AllowAllAuthorizer {
    async fn authorize(&self, _meta: BTreeMap<String, String>) -> AuthorizerOutcome {
        AuthorizerOutcome::Allow
    }
}

/// Wraps the per-connection writer channel so it can serve both as the
/// envelope sink for the connection and as the [`HostStream`] substreams are
/// layered over.
struct ConnectionWriter<C: WireCodec> {
    sender: mpsc::UnboundedSender<Message>,
    buffered: Arc<AtomicUsize>,
    codec: Arc<FrameCodec<C>>,
}

impl<C: WireCodec> ConnectionWriter<C> {
    fn send_envelope(&self, envelope: &Envelope) {
        if let Ok(message) = self.codec.encode(envelope) {
            self.buffered
                .fetch_add(crate::transport::message_len(&message), Ordering::SeqCst);
            let _ = self.sender.send(message);
        }
    }

    fn send_close(&self, code: u16, reason: impl Into<String>) {
        let _ = self.sender.send(Message::Close(Some(CloseFrame {
            code: code.into(),
            reason: reason.into().into(),
        })));
    }
}

impl<C: WireCodec> HostStream for ConnectionWriter<C> {
    fn write(&self, substream_id: u32, chunk: Vec<u8>) {
        self.send_envelope(&Envelope::byte_stream(substream_id, ByteStreamOp::Write { chunk }));
    }

    fn finish(&self, substream_id: u32) {
        self.send_envelope(&Envelope::byte_stream(substream_id, ByteStreamOp::Finish));
    }

    fn destroy(&self, substream_id: u32, error: Option<String>) {
        self.send_envelope(&Envelope::byte_stream(substream_id, ByteStreamOp::Destroy { error }));
    }

    fn buffered_amount(&self) -> usize {
        self.buffered.load(Ordering::SeqCst)
    }
}

type PendingMap = StdMutex<HashMap<String, oneshot::Sender<Result<Value>>>>;

struct StreamInner<C: WireCodec> {
    stream_id: String,
    client_id: String,
    meta: BTreeMap<String, String>,
    connected_at_ms: i64,
    writer: Arc<ConnectionWriter<C>>,
    substreams: SubstreamManager,
    pending: PendingMap,
    closed: AtomicBool,
    last_ping_sent_ms: AtomicI64,
    awaiting_pong: AtomicBool,
    tasks: StdMutex<Vec<JoinHandle<()>>>,
}

/// One authenticated, established SRPC connection. Cheap to clone; clones
/// share the same writer, substream registry and pending-request map.
#[derive(Clone)]
pub struct Stream<C: WireCodec = JsonWireCodec> {
    inner: Arc<StreamInner<C>>,
}

impl<C: WireCodec> Stream<C> {
    pub fn id(&self) -> &str {
        &self.inner.stream_id
    }

    pub fn client_id(&self) -> &str {
        &self.inner.client_id
    }

    pub fn meta(&self) -> &BTreeMap<String, String> {
        &self.inner.meta
    }

    pub fn connected_at_ms(&self) -> i64 {
        self.inner.connected_at_ms
    }

    pub fn new_sender(&self) -> ByteSubstreamSender {
        self.inner.substreams.new_sender()
    }

    pub fn create_receiver(&self, id: SubstreamId) -> Result<ByteSubstreamReceiver> {
        self.inner.substreams.create_receiver(id)
    }

    /// Server-initiated request, symmetric to the client side's `invoke`.
    pub async fn invoke(&self, prefix: &str, data: Value, timeout: Duration) -> Result<Value> {
        if self.inner.closed.load(Ordering::SeqCst) {
            return Err(SrpcError::Disconnected);
        }
        let request_id = RequestId::generate().to_string();
        let (tx, rx) = oneshot::channel();
        self.inner.pending.lock().unwrap().insert(request_id.clone(), tx);
        self.inner
            .writer
            .send_envelope(&Envelope::request(request_id.clone(), prefix, data));

        match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(SrpcError::Disconnected),
            Err(_) => {
                self.inner.pending.lock().unwrap().remove(&request_id);
                Err(SrpcError::RequestTimeout { request_id })
            }
        }
    }

    /// Closes the connection with `code`, tears down substreams, and fails
    /// every pending server-initiated request with `Disconnected`. Idempotent.
    pub fn close(&self, code: u16, reason: impl Into<String>) {
        if self.inner.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        self.inner.writer.send_close(code, reason);
        self.inner.substreams.handle_disconnect();
        for (_, responder) in self.inner.pending.lock().unwrap().drain() {
            let _ = responder.send(Err(SrpcError::Disconnected));
        }
        for task in self.inner.tasks.lock().unwrap().drain(..) {
            task.abort();
        }
    }

    fn record_request_reply(&self, request_id: &str, result: Result<Value>) -> bool {
        if let Some(responder) = self.inner.pending.lock().unwrap().remove(request_id) {
            let _ = responder.send(result);
            true
        } else {
            false
        }
    }
}

struct ServerShared<C: WireCodec> {
    options: SrpcServerOptions,
    client_key_fetcher: Arc<dyn ClientKeyFetcher>,
    client_authorizer: Arc<dyn ClientAuthorizer>,
    handlers: HandlerRegistry,
    streams: StdMutex<HashMap<String, Stream<C>>>,
    on_connection_hooks: StdMutex<Vec<Box<dyn Fn(&Stream<C>) + Send + Sync>>>,
    codec: Arc<FrameCodec<C>>,
}

/// Accepts authenticated SRPC connections and dispatches requests to
/// registered handlers. Cheap to clone.
#[derive(Clone)]
pub struct SrpcServer<C: WireCodec = JsonWireCodec> {
    shared: Arc<ServerShared<C>>,
}

impl SrpcServer<JsonWireCodec> {
    pub fn new(
        options: SrpcServerOptions,
        client_key_fetcher: Arc<dyn ClientKeyFetcher>,
        client_authorizer: Arc<dyn ClientAuthorizer>,
    ) -> Self {
        Self::with_codec(options, client_key_fetcher, client_authorizer, JsonWireCodec)
    }
}

impl<C: WireCodec> SrpcServer<C> {
    pub fn with_codec(
        options: SrpcServerOptions,
        client_key_fetcher: Arc<dyn ClientKeyFetcher>,
        client_authorizer: Arc<dyn ClientAuthorizer>,
        codec: C,
    ) -> Self {
        Self {
            shared: Arc::new(ServerShared {
                options,
                client_key_fetcher,
                client_authorizer,
                handlers: HandlerRegistry::new(),
                streams: StdMutex::new(HashMap::new()),
                on_connection_hooks: StdMutex::new(Vec::new()),
                codec: Arc::new(FrameCodec::new(codec)),
            }),
        }
    }

    pub fn register_handler<F, Fut>(&self, prefix: impl Into<String>, handler: F)
    where
        F: Fn(Value) -> Fut + Send + Sync + 'static,
        Fut: std::future::Future<Output = std::result::Result<Value, String>> + Send + 'static,
    {
        self.shared.handlers.register(prefix, handler);
    }

    pub fn on_connection<F>(&self, hook: F)
    where
        F: Fn(&Stream<C>) + Send + Sync + 'static,
    {
        self.shared.on_connection_hooks.lock().unwrap().push(Box::new(hook));
    }

    pub fn get_stream(&self, stream_id: &str) -> Option<Stream<C>> {
        self.shared.streams.lock().unwrap().get(stream_id).cloned()
    }

    pub fn stream_count(&self) -> usize {
        self.shared.streams.lock().unwrap().len()
    }

    /// Authenticates and establishes one connection, as accepted by whatever
    /// HTTP layer claimed the upgrade (see [`crate::upgrade_arbiter`]).
    /// `query` is the connect URL's query string (without the leading `?`).
    pub async fn accept<S>(&self, ws: WebSocketStream<S>, query: &str) -> Result<Stream<C>>
    where
        S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        let parsed = parse_query(query).map_err(|err| SrpcError::ProtocolError {
            reason: err.to_string(),
        })?;

        if !clock_drift_ok(parsed.fields.ts_ms, now_ms(), self.shared.options.auth_clock_drift_ms) {
            return Err(SrpcError::AuthFailed {
                reason: "clock drift exceeds configured bound".to_string(),
            });
        }

        let secret = self
            .shared
            .client_key_fetcher
            .fetch(&parsed.fields.client_id)
            .await
            .ok_or_else(|| SrpcError::AuthFailed {
                reason: format!("unknown client id {}", parsed.fields.client_id),
            })?;

        if !verify_fields(&secret, &parsed.fields, &parsed.signature) {
            return Err(SrpcError::AuthFailed {
                reason: "signature mismatch".to_string(),
            });
        }

        let meta = match self.shared.client_authorizer.authorize(parsed.meta).await {
            AuthorizerOutcome::Deny => {
                return Err(SrpcError::AuthFailed {
                    reason: "client authorizer denied connection".to_string(),
                })
            }
            AuthorizerOutcome::Allow => BTreeMap::new(),
            AuthorizerOutcome::AllowWithMeta(meta) => meta,
        };

        let (sink, mut source) = ws.split();
        let (tx, rx) = mpsc::unbounded_channel();
        let buffered = Arc::new(AtomicUsize::new(0));
        let writer = Arc::new(ConnectionWriter {
            sender: tx,
            buffered: buffered.clone(),
            codec: self.shared.codec.clone(),
        });

        let writer_task = tokio::spawn(crate::transport::writer_loop(sink, rx, buffered));

        writer.send_envelope(&Envelope::ping());
        let handshake_deadline = Duration::from_millis(self.shared.options.pong_timeout_ms);
        let pong_received = tokio::time::timeout(handshake_deadline, async {
            loop {
                match source.next().await {
                    Some(Ok(message)) => {
                        if let Ok(Some(envelope)) = self.shared.codec.decode(&message) {
                            if envelope.ping_pong == Some(PingPong::Pong) {
                                return true;
                            }
                        }
                    }
                    _ => return false,
                }
            }
        })
        .await
        .unwrap_or(false);

        if !pong_received {
            writer_task.abort();
            return Err(SrpcError::AuthFailed {
                reason: "handshake did not complete with a pong".to_string(),
            });
        }

        let stream = Stream {
            inner: Arc::new(StreamInner {
                stream_id: parsed.fields.stream_id.clone(),
                client_id: parsed.fields.client_id.clone(),
                meta,
                connected_at_ms: now_ms(),
                writer: writer.clone(),
                substreams: SubstreamManager::new(writer.clone(), SubstreamParity::Even),
                pending: StdMutex::new(HashMap::new()),
                closed: AtomicBool::new(false),
                last_ping_sent_ms: AtomicI64::new(now_ms()),
                awaiting_pong: AtomicBool::new(false),
                tasks: StdMutex::new(vec![writer_task]),
            }),
        };

        let reader_task = tokio::spawn(reader_loop(
            self.shared.clone(),
            stream.clone(),
            source,
            self.shared.codec.clone(),
        ));
        let ping_task = tokio::spawn(ping_loop(self.shared.clone(), stream.clone()));
        stream.inner.tasks.lock().unwrap().push(reader_task);
        stream.inner.tasks.lock().unwrap().push(ping_task);

        self.shared
            .streams
            .lock()
            .unwrap()
            .insert(stream.inner.stream_id.clone(), stream.clone());

        for hook in self.shared.on_connection_hooks.lock().unwrap().iter() {
            hook(&stream);
        }

        Ok(stream)
    }
}

async fn reader_loop<C, So>(
    shared: Arc<ServerShared<C>>,
    stream: Stream<C>,
    mut source: So,
    codec: Arc<FrameCodec<C>>,
) where
    C: WireCodec,
    So: futures_util::Stream<Item = std::result::Result<Message, tokio_tungstenite::tungstenite::Error>> + Unpin,
{
    loop {
        let message = match source.next().await {
            Some(Ok(message)) => message,
            _ => break,
        };

        let envelope = match codec.decode(&message) {
            Ok(Some(envelope)) => envelope,
            Ok(None) => continue,
            Err(err) => {
                tracing::warn!(stream_id = %stream.inner.stream_id, error = %err, "dropping undecodable srpc envelope");
                continue;
            }
        };

        if envelope.is_ping_pong() {
            match envelope.ping_pong {
                Some(PingPong::Ping) => stream.inner.writer.send_envelope(&Envelope::pong()),
                Some(PingPong::Pong) => stream.inner.awaiting_pong.store(false, Ordering::SeqCst),
                None => {}
            }
            continue;
        }

        if envelope.is_byte_stream_op() {
            if let Some(op) = envelope.byte_stream_operation {
                let id = SubstreamId::new(op.stream_id);
                match op.op {
                    ByteStreamOp::Write { chunk } => stream.inner.substreams.handle_incoming_write(id, chunk),
                    ByteStreamOp::Finish => stream.inner.substreams.handle_incoming_finish(id),
                    ByteStreamOp::Destroy { error } => stream.inner.substreams.handle_incoming_destroy(id, error),
                }
            }
            continue;
        }

        if !envelope.has_required_request_id() {
            stream.close(CLOSE_MISSING_REQUEST_ID, "missing request id");
            break;
        }
        let request_id = envelope.request_id.clone().expect("checked above");

        if envelope.reply {
            let result = if let Some(message) = envelope.error {
                Err(SrpcError::HandlerError {
                    prefix: envelope.payload.prefix().unwrap_or_default().to_string(),
                    reason: message,
                })
            } else {
                Ok(envelope.payload.data().cloned().unwrap_or(Value::Null))
            };
            if !stream.record_request_reply(&request_id, result) {
                stream.close(CLOSE_UNKNOWN_REQUEST_ID, "reply for unknown request id");
                break;
            }
            continue;
        }

        if let Payload::Request { prefix, data } = envelope.payload {
            let handler = shared.handlers.get(&prefix);
            let stream = stream.clone();
            tokio::spawn(async move {
                match handler {
                    Some(handler) => match handler(data).await {
                        Ok(result) => stream
                            .inner
                            .writer
                            .send_envelope(&Envelope::response(request_id, prefix, result)),
                        Err(reason) => stream.inner.writer.send_envelope(&Envelope::error_reply(request_id, reason)),
                    },
                    None => stream.inner.writer.send_envelope(&Envelope::error_reply(
                        request_id,
                        format!("MESH_NO_HANDLER:{prefix}"),
                    )),
                }
            });
        } else {
            tracing::warn!(stream_id = %stream.inner.stream_id, "dropping non-request envelope carrying a request id");
        }
    }

    shared.streams.lock().unwrap().remove(&stream.inner.stream_id);
    stream.inner.substreams.handle_disconnect();
    for (_, responder) in stream.inner.pending.lock().unwrap().drain() {
        let _ = responder.send(Err(SrpcError::Disconnected));
    }
}

async fn ping_loop<C: WireCodec>(shared: Arc<ServerShared<C>>, stream: Stream<C>) {
    let mut ticker = tokio::time::interval(Duration::from_millis(shared.options.ping_interval_ms));
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    ticker.tick().await; // first tick fires immediately; skip so the priming ping stands alone

    loop {
        ticker.tick().await;
        if stream.inner.closed.load(Ordering::SeqCst) {
            return;
        }

        if stream.inner.awaiting_pong.load(Ordering::SeqCst) {
            let elapsed = now_ms() - stream.inner.last_ping_sent_ms.load(Ordering::SeqCst);
            if elapsed >= shared.options.pong_timeout_ms as i64 {
                stream.close(CLOSE_PONG_TIMEOUT, "pong timeout");
                return;
            }
        }

        stream.inner.writer.send_envelope(&Envelope::ping());
        stream.inner.awaiting_pong.store(true, Ordering::SeqCst);
        stream.inner.last_ping_sent_ms.store(now_ms(), Ordering::SeqCst);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct FixedKeyFetcher(Option<String>);

    #[async_trait]
    impl ClientKeyFetcher for FixedKeyFetcher {
        async fn fetch(&self, _client_id: &str) -> Option<String> {
            self.0.clone()
        }
    }

    #[tokio::test]
    async fn unknown_client_id_is_rejected_before_signature_check() {
        let fetcher = FixedKeyFetcher(None);
        assert!(fetcher.fetch("no-such-client").await.is_none());
    }

    #[test]
    fn default_options_match_distilled_spec_defaults() {
        let options = SrpcServerOptions::default();
        assert_eq!(options.auth_clock_drift_ms, 30_000);
        assert_eq!(options.pong_timeout_ms, 75_000);
    }

    #[tokio::test]
    async fn allow_all_authorizer_always_allows() {
        let outcome = AllowAllAuthorizer.authorize(BTreeMap::new()).await;
        assert_eq!(outcome, AuthorizerOutcome::Allow);
    }
}
