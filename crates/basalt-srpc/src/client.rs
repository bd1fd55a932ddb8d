//! `SrpcClient`: dials an [`crate::server::SrpcServer`], performs the
//! ping-primed handshake, reconnects on disconnect, and issues
//! client-initiated requests (`invoke`) while dispatching server-initiated
//! requests to locally registered handlers.
//!
//! Mirrors [`crate::server`]'s composition style: one writer task owns the
//! socket, a reader task drives the protocol loop, callbacks are plain
//! closures rather than an observer trait hierarchy.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use basalt_types::{now_ms, RequestId, SubstreamId, SubstreamParity};
use futures_util::StreamExt;
use serde_json::Value;
use tokio::sync::{mpsc, oneshot, Notify};
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::Message;

use crate::auth::{build_query, sign_fields, AuthFields};
use crate::codec::{FrameCodec, JsonWireCodec, WireCodec};
use crate::envelope::{ByteStreamOp, Envelope, Payload, PingPong};
use crate::error::{Result, SrpcError};
use crate::handler::HandlerRegistry;
use crate::substream::{ByteSubstreamReceiver, ByteSubstreamSender, HostStream, SubstreamManager};

#[derive(Debug, Clone)]
pub struct SrpcClientOptions {
    /// `ws(s)://host[:port]/{wsPath}`, without a query string — the client
    /// appends its own signed `authv`/`appv`/`ts`/`id`/`cid`/`signature`.
    pub url: String,
    pub app_version: String,
    pub client_id: String,
    pub secret: String,
    pub meta: std::collections::BTreeMap<String, String>,
    pub connect_timeout_ms: u64,
    pub ping_interval_ms: u64,
    pub pong_timeout_ms: u64,
    pub reconnect: bool,
    pub reconnect_delay_ms: u64,
    pub default_request_timeout_ms: u64,
}

impl Default for SrpcClientOptions {
    fn default() -> Self {
        Self {
            url: String::new(),
            app_version: "1".to_string(),
            client_id: String::new(),
            secret: String::new(),
            meta: std::collections::BTreeMap::new(),
            connect_timeout_ms: 10_000,
            ping_interval_ms: 55_000,
            pong_timeout_ms: 75_000,
            reconnect: true,
            reconnect_delay_ms: 1_000,
            default_request_timeout_ms: 30_000,
        }
    }
}

struct ClientWriter<C: WireCodec> {
    sender: mpsc::UnboundedSender<Message>,
    buffered: Arc<AtomicUsize>,
    codec: Arc<FrameCodec<C>>,
}

impl<C: WireCodec> ClientWriter<C> {
    fn send_envelope(&self, envelope: &Envelope) {
        if let Ok(message) = self.codec.encode(envelope) {
            self.buffered
                .fetch_add(crate::transport::message_len(&message), Ordering::SeqCst);
            let _ = self.sender.send(message);
        }
    }
}

impl<C: WireCodec> HostStream for ClientWriter<C> {
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

/// The live connection state for one dial. Torn down and replaced wholesale
/// on every reconnect.
struct Connection<C: WireCodec> {
    writer: Arc<ClientWriter<C>>,
    substreams: SubstreamManager,
    awaiting_pong: AtomicBool,
    last_ping_sent_ms: AtomicI64,
    tasks: StdMutex<Vec<JoinHandle<()>>>,
}

struct ClientShared<C: WireCodec> {
    options: SrpcClientOptions,
    handlers: HandlerRegistry,
    pending: PendingMap,
    connection: StdMutex<Option<Arc<Connection<C>>>>,
    codec: Arc<FrameCodec<C>>,
    running: AtomicBool,
    connected_notify: Notify,
}

impl<C: WireCodec> ClientShared<C> {
    fn take_connection(&self) -> Option<Arc<Connection<C>>> {
        self.connection.lock().unwrap().take()
    }

    fn current_connection(&self) -> Option<Arc<Connection<C>>> {
        self.connection.lock().unwrap().clone()
    }

    fn fail_all_pending(&self) {
        for (_, responder) in self.pending.lock().unwrap().drain() {
            let _ = responder.send(Err(SrpcError::Disconnected));
        }
    }
}

/// Dials an `SrpcServer`, reconnecting (by default) on disconnect. Cheap to
/// clone; clones share the same connection, handler registry and pending
/// request map.
#[derive(Clone)]
pub struct SrpcClient<C: WireCodec = JsonWireCodec> {
    shared: Arc<ClientShared<C>>,
}

impl SrpcClient<JsonWireCodec> {
    pub fn new(options: SrpcClientOptions) -> Self {
        Self::with_codec(options, JsonWireCodec)
    }
}

impl<C: WireCodec> SrpcClient<C> {
    pub fn with_codec(options: SrpcClientOptions, codec: C) -> Self {
        Self {
            shared: Arc::new(ClientShared {
                options,
                handlers: HandlerRegistry::new(),
                pending: StdMutex::new(HashMap::new()),
                connection: StdMutex::new(None),
                codec: Arc::new(FrameCodec::new(codec)),
                running: AtomicBool::new(false),
                connected_notify: Notify::new(),
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

    pub fn is_connected(&self) -> bool {
        self.shared.connection.lock().unwrap().is_some()
    }

    /// Starts the connect-and-reconnect supervisor as a background task.
    /// Idempotent: a second call is a no-op while the client is already
    /// running.
    pub fn start(&self) {
        if self.shared.running.swap(true, Ordering::SeqCst) {
            return;
        }
        let shared = self.shared.clone();
        tokio::spawn(async move {
            supervisor_loop(shared).await;
        });
    }

    /// Starts the client (if not already) and waits until the first
    /// handshake completes.
    pub async fn connect(&self) -> Result<()> {
        self.start();
        if self.is_connected() {
            return Ok(());
        }
        self.shared.connected_notify.notified().await;
        Ok(())
    }

    /// Stops reconnecting and tears down the live connection, if any.
    /// Idempotent.
    pub fn stop(&self) {
        self.shared.running.store(false, Ordering::SeqCst);
        if let Some(connection) = self.shared.take_connection() {
            teardown(&connection);
        }
        self.shared.fail_all_pending();
    }

    pub fn new_sender(&self) -> Result<ByteSubstreamSender> {
        let connection = self.shared.current_connection().ok_or(SrpcError::Disconnected)?;
        Ok(connection.substreams.new_sender())
    }

    pub fn create_receiver(&self, id: SubstreamId) -> Result<ByteSubstreamReceiver> {
        let connection = self.shared.current_connection().ok_or(SrpcError::Disconnected)?;
        connection.substreams.create_receiver(id)
    }

    /// Issues a client-initiated request and awaits its matching response
    /// (or `timeout`, whichever comes first). Rejects immediately with
    /// [`SrpcError::Disconnected`] if not currently connected.
    pub async fn invoke(&self, prefix: &str, data: Value, timeout: Duration) -> Result<Value> {
        let _connection = self.shared.current_connection().ok_or(SrpcError::Disconnected)?;
        let request_id = RequestId::generate().to_string();
        let (tx, rx) = oneshot::channel();
        self.shared.pending.lock().unwrap().insert(request_id.clone(), tx);

        // Re-check under the lock-free connection handle: if a reconnect
        // raced us between the check above and here, the write is simply
        // lost and the timeout below still fires correctly.
        if let Some(connection) = self.shared.current_connection() {
            connection
                .writer
                .send_envelope(&Envelope::request(request_id.clone(), prefix, data));
        }

        match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(SrpcError::Disconnected),
            Err(_) => {
                self.shared.pending.lock().unwrap().remove(&request_id);
                Err(SrpcError::RequestTimeout { request_id })
            }
        }
    }

    /// Convenience wrapper using [`SrpcClientOptions::default_request_timeout_ms`].
    pub async fn invoke_default(&self, prefix: &str, data: Value) -> Result<Value> {
        let timeout = Duration::from_millis(self.shared.options.default_request_timeout_ms);
        self.invoke(prefix, data, timeout).await
    }
}

fn teardown<C: WireCodec>(connection: &Connection<C>) {
    connection.substreams.handle_disconnect();
    for task in connection.tasks.lock().unwrap().drain(..) {
        task.abort();
    }
}

async fn supervisor_loop<C: WireCodec>(shared: Arc<ClientShared<C>>) {
    loop {
        if !shared.running.load(Ordering::SeqCst) {
            return;
        }

        match connect_once(&shared).await {
            Ok(done_rx) => {
                shared.connected_notify.notify_waiters();
                let _ = done_rx.await;
            }
            Err(err) => {
                tracing::warn!(error = %err, "srpc client connect attempt failed");
            }
        }

        shared.fail_all_pending();
        if !shared.running.load(Ordering::SeqCst) || !shared.options.reconnect {
            shared.running.store(false, Ordering::SeqCst);
            return;
        }
        tokio::time::sleep(Duration::from_millis(shared.options.reconnect_delay_ms)).await;
    }
}

fn signed_url(options: &SrpcClientOptions) -> String {
    let stream_id = uuid::Uuid::now_v7().to_string();
    let fields = AuthFields {
        authv: 1,
        appv: options.app_version.clone(),
        ts_ms: now_ms(),
        stream_id,
        client_id: options.client_id.clone(),
    };
    let signature = sign_fields(&options.secret, &fields).unwrap_or_default();
    let query = build_query(&fields, &signature, &options.meta);
    format!("{}?{}", options.url, query)
}

/// Dials, performs the ping-primed handshake, and (on success) spawns the
/// reader/ping tasks. Returns a receiver that resolves once the connection
/// tears down (read loop exit), so the supervisor can await "disconnected".
async fn connect_once<C: WireCodec>(
    shared: &Arc<ClientShared<C>>,
) -> Result<oneshot::Receiver<()>> {
    let url = signed_url(&shared.options);
    let connect_fut = tokio_tungstenite::connect_async(url.clone());
    let (ws, _response) = tokio::time::timeout(
        Duration::from_millis(shared.options.connect_timeout_ms),
        connect_fut,
    )
    .await
    .map_err(|_| SrpcError::AuthFailed {
        reason: "connect timed out".to_string(),
    })??;

    let (sink, mut source) = futures_util::StreamExt::split(ws);
    let (tx, rx) = mpsc::unbounded_channel();
    let buffered = Arc::new(AtomicUsize::new(0));
    let writer = Arc::new(ClientWriter {
        sender: tx,
        buffered: buffered.clone(),
        codec: shared.codec.clone(),
    });
    let writer_task = tokio::spawn(crate::transport::writer_loop(sink, rx, buffered));

    // Handshake: the server speaks first with a ping; reply with a pong.
    let handshake_deadline = Duration::from_millis(shared.options.pong_timeout_ms);
    let handshake_ok = tokio::time::timeout(handshake_deadline, async {
        loop {
            match source.next().await {
                Some(Ok(message)) => {
                    if let Ok(Some(envelope)) = shared.codec.decode(&message) {
                        if envelope.ping_pong == Some(PingPong::Ping) {
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

    if !handshake_ok {
        writer_task.abort();
        return Err(SrpcError::AuthFailed {
            reason: "handshake did not begin with a server ping".to_string(),
        });
    }
    writer.send_envelope(&Envelope::pong());

    let connection = Arc::new(Connection {
        writer: writer.clone(),
        substreams: SubstreamManager::new(writer.clone(), SubstreamParity::Odd),
        awaiting_pong: AtomicBool::new(false),
        last_ping_sent_ms: AtomicI64::new(now_ms()),
        tasks: StdMutex::new(vec![writer_task]),
    });

    let (done_tx, done_rx) = oneshot::channel();
    let reader_task = tokio::spawn(reader_loop(shared.clone(), connection.clone(), source, done_tx));
    let ping_task = tokio::spawn(ping_loop(shared.clone(), connection.clone()));
    connection.tasks.lock().unwrap().push(reader_task);
    connection.tasks.lock().unwrap().push(ping_task);

    *shared.connection.lock().unwrap() = Some(connection);
    Ok(done_rx)
}

async fn reader_loop<C, So>(
    shared: Arc<ClientShared<C>>,
    connection: Arc<Connection<C>>,
    mut source: So,
    done_tx: oneshot::Sender<()>,
) where
    C: WireCodec,
    So: futures_util::Stream<Item = std::result::Result<Message, tokio_tungstenite::tungstenite::Error>>
        + Unpin,
{
    loop {
        let message = match source.next().await {
            Some(Ok(message)) => message,
            _ => break,
        };

        let envelope = match shared.codec.decode(&message) {
            Ok(Some(envelope)) => envelope,
            Ok(None) => continue,
            Err(err) => {
                tracing::warn!(error = %err, "dropping undecodable srpc envelope");
                continue;
            }
        };

        if envelope.is_ping_pong() {
            match envelope.ping_pong {
                Some(PingPong::Ping) => connection.writer.send_envelope(&Envelope::pong()),
                Some(PingPong::Pong) => connection.awaiting_pong.store(false, Ordering::SeqCst),
                None => {}
            }
            continue;
        }

        if envelope.is_byte_stream_op() {
            if let Some(op) = envelope.byte_stream_operation {
                let id = SubstreamId::new(op.stream_id);
                match op.op {
                    ByteStreamOp::Write { chunk } => connection.substreams.handle_incoming_write(id, chunk),
                    ByteStreamOp::Finish => connection.substreams.handle_incoming_finish(id),
                    ByteStreamOp::Destroy { error } => connection.substreams.handle_incoming_destroy(id, error),
                }
            }
            continue;
        }

        if !envelope.has_required_request_id() {
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
            if let Some(responder) = shared.pending.lock().unwrap().remove(&request_id) {
                let _ = responder.send(result);
            }
            continue;
        }

        if let Payload::Request { prefix, data } = envelope.payload {
            let handler = shared.handlers.get(&prefix);
            let writer = connection.writer.clone();
            tokio::spawn(async move {
                match handler {
                    Some(handler) => match handler(data).await {
                        Ok(result) => writer.send_envelope(&Envelope::response(request_id, prefix, result)),
                        Err(reason) => writer.send_envelope(&Envelope::error_reply(request_id, reason)),
                    },
                    None => writer.send_envelope(&Envelope::error_reply(
                        request_id,
                        format!("MESH_NO_HANDLER:{prefix}"),
                    )),
                }
            });
        }
    }

    *shared.connection.lock().unwrap() = None;
    teardown(&connection);
    let _ = done_tx.send(());
}

async fn ping_loop<C: WireCodec>(shared: Arc<ClientShared<C>>, connection: Arc<Connection<C>>) {
    let mut ticker = tokio::time::interval(Duration::from_millis(shared.options.ping_interval_ms));
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    ticker.tick().await; // first tick fires immediately; skip it

    loop {
        ticker.tick().await;
        if shared.current_connection().is_none() {
            return;
        }

        if connection.awaiting_pong.load(Ordering::SeqCst) {
            let elapsed = now_ms() - connection.last_ping_sent_ms.load(Ordering::SeqCst);
            if elapsed >= shared.options.pong_timeout_ms as i64 {
                if let Some(current) = shared.take_connection() {
                    teardown(&current);
                }
                return;
            }
        }

        connection.writer.send_envelope(&Envelope::ping());
        connection.awaiting_pong.store(true, Ordering::SeqCst);
        connection.last_ping_sent_ms.store(now_ms(), Ordering::SeqCst);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_options_match_distilled_spec_defaults() {
        let options = SrpcClientOptions::default();
        assert_eq!(options.connect_timeout_ms, 10_000);
        assert_eq!(options.ping_interval_ms, 55_000);
        assert_eq!(options.pong_timeout_ms, 75_000);
        assert_eq!(options.reconnect_delay_ms, 1_000);
        assert!(options.reconnect);
        assert_eq!(options.default_request_timeout_ms, 30_000);
    }

    #[test]
    fn signed_url_carries_auth_query_params() {
        let options = SrpcClientOptions {
            url: "ws://localhost:9000/ws".to_string(),
            client_id: "client-1".to_string(),
            secret: "s3cr3t".to_string(),
            ..Default::default()
        };
        let url = signed_url(&options);
        assert!(url.starts_with("ws://localhost:9000/ws?authv=1"));
        assert!(url.contains("cid=client-1"));
        assert!(url.contains("signature="));
    }

    #[tokio::test]
    async fn invoke_without_a_connection_rejects_immediately() {
        let client = SrpcClient::new(SrpcClientOptions {
            url: "ws://127.0.0.1:1/ws".to_string(),
            client_id: "c".to_string(),
            secret: "s".to_string(),
            reconnect: false,
            ..Default::default()
        });
        let err = client
            .invoke("uEcho", serde_json::json!({}), Duration::from_millis(50))
            .await
            .unwrap_err();
        assert!(matches!(err, SrpcError::Disconnected));
    }

    /// End-to-end handshake + request/response against a minimal hand-rolled
    /// server loop (not `SrpcServer`, to exercise the client in isolation):
    /// accept a TCP connection, upgrade it, send the priming ping, await the
    /// pong, then answer one `uEcho` request.
    #[tokio::test]
    async fn connects_and_completes_one_request_round_trip() {
        use tokio::net::TcpListener;

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let server = tokio::spawn(async move {
            let (tcp, _) = listener.accept().await.unwrap();
            let ws = tokio_tungstenite::accept_async(tcp).await.unwrap();
            let (mut sink, mut source) = futures_util::StreamExt::split(ws);
            use futures_util::SinkExt;

            let codec = FrameCodec::<JsonWireCodec>::default();
            sink.send(codec.encode(&Envelope::ping()).unwrap()).await.unwrap();

            loop {
                let message = source.next().await.unwrap().unwrap();
                let Some(envelope) = codec.decode(&message).unwrap() else {
                    continue;
                };
                if envelope.ping_pong == Some(PingPong::Pong) {
                    continue;
                }
                if let Payload::Request { prefix, data } = envelope.payload {
                    let request_id = envelope.request_id.unwrap();
                    let response = Envelope::response(request_id, prefix, data);
                    sink.send(codec.encode(&response).unwrap()).await.unwrap();
                    break;
                }
            }
        });

        let client = SrpcClient::new(SrpcClientOptions {
            url: format!("ws://{addr}/ws"),
            client_id: "client-1".to_string(),
            secret: "secret".to_string(),
            reconnect: false,
            ..Default::default()
        });
        client.connect().await.unwrap();

        let reply = client
            .invoke("uEcho", serde_json::json!({"text": "hi"}), Duration::from_secs(2))
            .await
            .unwrap();
        assert_eq!(reply, serde_json::json!({"text": "hi"}));

        server.await.unwrap();
    }
}
