//! Per-key cluster membership and request/response RPC over per-node Redis
//! pub/sub channels.
//!
//! Composition, not inheritance: a `Mesh` owns a [`crate::leader::Leader`]
//! for `mesh:${key}` to elect which member issues `CLEANUP`; the leader has
//! no idea a mesh exists.

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use basalt_types::{now_ms, RequestId};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::{oneshot, Notify};
use tokio::task::JoinHandle;
use tokio::time::{interval, MissedTickBehavior};

use crate::error::{CoordinationError, Result};
use crate::leader::{Leader, LeaderOptions};
use crate::redis_backend::RedisSubscriberFactory;
use crate::script_runner::RedisScriptRunner;

const NO_HANDLER_PREFIX: &str = "MESH_NO_HANDLER:";

type HandlerFuture = Pin<Box<dyn Future<Output = std::result::Result<Value, String>> + Send>>;
type HandlerFn = Arc<dyn Fn(Value) -> HandlerFuture + Send + Sync>;

#[derive(Debug, Clone, Copy)]
pub struct MeshOptions {
    pub heartbeat_interval_ms: u64,
    /// `CLEANUP`'s ttl argument: a node whose last heartbeat is older than
    /// this is eligible for removal. Not fixed by the distilled spec; a
    /// multiple of the heartbeat interval keeps one missed beat from
    /// triggering a false cleanup.
    pub node_ttl_ms: i64,
    pub request_timeout_ms: i64,
    pub leader_options: LeaderOptions,
}

impl Default for MeshOptions {
    fn default() -> Self {
        Self {
            heartbeat_interval_ms: 5_000,
            node_ttl_ms: 15_000,
            request_timeout_ms: 10_000,
            leader_options: LeaderOptions::default(),
        }
    }
}

/// A member of a mesh, as returned by [`Mesh::get_nodes`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MeshNode {
    pub instance_id: u32,
    pub host: Option<String>,
    pub is_self: bool,
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
enum MeshMessage {
    Request {
        request_id: String,
        sender_instance_id: u32,
        message_type: String,
        data: Value,
        timeout_ms: i64,
    },
    Response {
        request_id: String,
        reply: bool,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        data: Option<Value>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        error: Option<String>,
    },
    Heartbeat {
        request_id: String,
    },
}

struct PendingEntry {
    target: u32,
    message_type: String,
    deadline_ms: Arc<AtomicI64>,
    heartbeat_notify: Arc<Notify>,
    responder: oneshot::Sender<Result<Value>>,
}

#[derive(Default)]
struct Shared {
    instance_id: StdMutex<Option<u32>>,
    handlers: StdMutex<HashMap<String, HandlerFn>>,
    pending: StdMutex<HashMap<String, PendingEntry>>,
    node_cleaned_up_hooks: StdMutex<Vec<Box<dyn Fn(u32) + Send + Sync>>>,
    handler_heartbeats: StdMutex<HashMap<String, JoinHandle<()>>>,
    stopped: AtomicBool,
}

/// A mesh node: cluster membership plus request/response RPC to its peers.
/// Cheap to clone; clones share the same membership state and background
/// tasks.
#[derive(Clone)]
pub struct Mesh {
    runner: RedisScriptRunner,
    subscriber_factory: Arc<dyn RedisSubscriberFactory>,
    key: String,
    host: String,
    options: MeshOptions,
    leader: Leader,
    shared: Arc<Shared>,
    heartbeat_task: Arc<StdMutex<Option<JoinHandle<()>>>>,
    recv_task: Arc<StdMutex<Option<JoinHandle<()>>>>,
    recv_stop: Arc<Notify>,
}

impl Mesh {
    pub fn new(
        runner: RedisScriptRunner,
        subscriber_factory: Arc<dyn RedisSubscriberFactory>,
        key: impl Into<String>,
        host: impl Into<String>,
        options: MeshOptions,
    ) -> Self {
        let key = key.into();
        let leader = Leader::new(
            runner.clone(),
            "leader",
            &format!("mesh:{key}"),
            options.leader_options,
        );
        Self {
            runner,
            subscriber_factory,
            key,
            host: host.into(),
            options,
            leader,
            shared: Arc::new(Shared::default()),
            heartbeat_task: Arc::new(StdMutex::new(None)),
            recv_task: Arc::new(StdMutex::new(None)),
            recv_stop: Arc::new(Notify::new()),
        }
    }

    pub fn register_handler<F, Fut>(&self, message_type: impl Into<String>, handler: F)
    where
        F: Fn(Value) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = std::result::Result<Value, String>> + Send + 'static,
    {
        self.shared
            .handlers
            .lock()
            .unwrap()
            .insert(message_type.into(), Arc::new(move |data| Box::pin(handler(data))));
    }

    pub fn on_node_cleaned_up<F>(&self, hook: F)
    where
        F: Fn(u32) + Send + Sync + 'static,
    {
        self.shared
            .node_cleaned_up_hooks
            .lock()
            .unwrap()
            .push(Box::new(hook));
    }

    pub fn instance_id(&self) -> Option<u32> {
        *self.shared.instance_id.lock().unwrap()
    }

    fn next_id_key(&self) -> String {
        format!("{}:mesh:{}:next_id", self.runner.prefix(), self.key)
    }

    fn heartbeats_key(&self) -> String {
        format!("{}:mesh:{}:heartbeats", self.runner.prefix(), self.key)
    }

    fn nodes_key(&self) -> String {
        format!("{}:mesh:{}:nodes", self.runner.prefix(), self.key)
    }

    fn node_channel(&self, instance_id: u32) -> String {
        node_channel(self.runner.prefix(), &self.key, instance_id)
    }

    /// `INCR`s a fresh instance id, opens a dedicated pub/sub subscription,
    /// heartbeats once, and starts the heartbeat ticker and cleanup leader.
    /// On any failure before the subscriber is open, nothing is registered.
    pub async fn start(&self) -> Result<()> {
        if self.shared.instance_id.lock().unwrap().is_some() {
            return Ok(()); // already started
        }

        let instance_id = self.runner.incr(&self.next_id_key()).await? as u32;
        let channel = self.node_channel(instance_id);
        let subscriber = self.subscriber_factory.subscribe(&channel).await?;

        *self.shared.instance_id.lock().unwrap() = Some(instance_id);

        self.runner
            .heartbeat(&self.heartbeats_key(), &instance_id.to_string())
            .await?;
        self.runner
            .backend()
            .hset(&self.nodes_key(), &instance_id.to_string(), &self.host)
            .await?;

        let recv_handle = tokio::spawn(recv_loop(
            self.shared.clone(),
            self.runner.clone(),
            self.options,
            self.runner.prefix().to_string(),
            self.key.clone(),
            subscriber,
            self.recv_stop.clone(),
        ));
        *self.recv_task.lock().unwrap() = Some(recv_handle);

        self.leader.start();

        let heartbeat_handle = tokio::spawn(heartbeat_loop(
            self.shared.clone(),
            self.runner.clone(),
            self.leader.clone(),
            self.heartbeats_key(),
            self.nodes_key(),
            instance_id,
            self.options,
        ));
        *self.heartbeat_task.lock().unwrap() = Some(heartbeat_handle);

        Ok(())
    }

    /// Invokes `message_type` on `target`. If `target` is this node's own
    /// instance id, the registered handler is awaited directly with no
    /// Redis traffic at all.
    pub async fn invoke(&self, target: u32, message_type: &str, data: Value) -> Result<Value> {
        let self_id = self
            .shared
            .instance_id
            .lock()
            .unwrap()
            .ok_or_else(|| CoordinationError::MeshNoLocalHandler {
                message_type: message_type.to_string(),
            })?;

        if target == self_id {
            let handler = self.shared.handlers.lock().unwrap().get(message_type).cloned();
            return match handler {
                Some(handler) => handler(data).await.map_err(|reason| CoordinationError::MeshHandlerError {
                    message_type: message_type.to_string(),
                    target,
                    reason,
                }),
                None => Err(CoordinationError::MeshNoLocalHandler {
                    message_type: message_type.to_string(),
                }),
            };
        }

        let request_id = RequestId::generate().to_string();
        let message = MeshMessage::Request {
            request_id: request_id.clone(),
            sender_instance_id: self_id,
            message_type: message_type.to_string(),
            data,
            timeout_ms: self.options.request_timeout_ms,
        };
        let payload = serde_json::to_string(&message)?;

        let (tx, rx) = oneshot::channel();
        let deadline_ms = Arc::new(AtomicI64::new(now_ms() + self.options.request_timeout_ms));
        let heartbeat_notify = Arc::new(Notify::new());
        self.shared.pending.lock().unwrap().insert(
            request_id.clone(),
            PendingEntry {
                target,
                message_type: message_type.to_string(),
                deadline_ms: deadline_ms.clone(),
                heartbeat_notify: heartbeat_notify.clone(),
                responder: tx,
            },
        );
        let reaper = spawn_reaper(self.shared.clone(), request_id.clone(), target, deadline_ms, heartbeat_notify);

        if let Err(err) = self.runner.backend().publish(&self.node_channel(target), &payload).await {
            self.shared.pending.lock().unwrap().remove(&request_id);
            reaper.abort();
            return Err(err);
        }

        rx.await.unwrap_or(Err(CoordinationError::MeshStopped { request_id }))
    }

    /// Stops the leader, every ticker, rejects all pending requests with
    /// `MeshStopped`, unsubscribes, and removes this node from the mesh.
    /// Idempotent.
    pub async fn stop(&self) {
        if self.shared.stopped.swap(true, Ordering::SeqCst) {
            return;
        }

        self.leader.stop().await;

        if let Some(handle) = self.heartbeat_task.lock().unwrap().take() {
            handle.abort();
        }
        for (_, handle) in self.shared.handler_heartbeats.lock().unwrap().drain() {
            handle.abort();
        }
        for (request_id, entry) in self.shared.pending.lock().unwrap().drain() {
            let _ = entry.responder.send(Err(CoordinationError::MeshStopped { request_id }));
        }

        self.recv_stop.notify_waiters();
        if let Some(handle) = self.recv_task.lock().unwrap().take() {
            handle.abort();
        }

        if let Some(id) = *self.shared.instance_id.lock().unwrap() {
            if let Err(err) = self.runner.backend().zrem(&self.heartbeats_key(), &id.to_string()).await {
                tracing::warn!(key = %self.key, error = %err, "mesh zrem on stop failed");
            }
            if let Err(err) = self.runner.backend().hdel(&self.nodes_key(), &id.to_string()).await {
                tracing::warn!(key = %self.key, error = %err, "mesh hdel on stop failed");
            }
        }
    }

    /// `ZRANGE` the heartbeats set, `HMGET` hostnames, and mark self.
    pub async fn get_nodes(&self) -> Result<Vec<MeshNode>> {
        let ids = self.runner.backend().zrange(&self.heartbeats_key()).await?;
        let hosts = self.runner.backend().hmget(&self.nodes_key(), &ids).await?;
        let self_id = *self.shared.instance_id.lock().unwrap();

        Ok(ids
            .into_iter()
            .zip(hosts)
            .filter_map(|(id_str, host)| {
                id_str.parse::<u32>().ok().map(|instance_id| MeshNode {
                    instance_id,
                    host,
                    is_self: Some(instance_id) == self_id,
                })
            })
            .collect())
    }
}

fn node_channel(prefix: &str, key: &str, instance_id: u32) -> String {
    format!("{prefix}:mesh:{key}:node:{instance_id}")
}

fn spawn_reaper(
    shared: Arc<Shared>,
    request_id: String,
    target: u32,
    deadline_ms: Arc<AtomicI64>,
    heartbeat_notify: Arc<Notify>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            let wait = deadline_ms.load(Ordering::SeqCst) - now_ms();
            if wait <= 0 {
                if let Some(entry) = shared.pending.lock().unwrap().remove(&request_id) {
                    let _ = entry.responder.send(Err(CoordinationError::MeshRequestTimeout {
                        request_id: request_id.clone(),
                        target,
                    }));
                }
                return;
            }
            tokio::select! {
                _ = tokio::time::sleep(Duration::from_millis(wait as u64)) => {}
                _ = heartbeat_notify.notified() => {}
            }
        }
    })
}

#[allow(clippy::too_many_arguments)]
async fn recv_loop(
    shared: Arc<Shared>,
    runner: RedisScriptRunner,
    options: MeshOptions,
    prefix: String,
    key: String,
    mut subscriber: Box<dyn crate::redis_backend::RedisSubscriber>,
    stop_notify: Arc<Notify>,
) {
    loop {
        tokio::select! {
            message = subscriber.next_message() => {
                match message {
                    Some(raw) => handle_inbound(&shared, &runner, options, &prefix, &key, raw).await,
                    None => return,
                }
            }
            _ = stop_notify.notified() => {
                if let Err(err) = subscriber.unsubscribe().await {
                    tracing::warn!(key = %key, error = %err, "mesh unsubscribe failed");
                }
                return;
            }
        }
    }
}

async fn handle_inbound(
    shared: &Arc<Shared>,
    runner: &RedisScriptRunner,
    options: MeshOptions,
    prefix: &str,
    key: &str,
    raw: String,
) {
    let message: MeshMessage = match serde_json::from_str(&raw) {
        Ok(message) => message,
        Err(err) => {
            tracing::warn!(error = %err, "dropping invalid mesh message");
            return;
        }
    };

    match message {
        MeshMessage::Request {
            request_id,
            sender_instance_id,
            message_type,
            data,
            timeout_ms,
        } => {
            handle_request(shared, runner, prefix, key, request_id, sender_instance_id, message_type, data, timeout_ms).await;
        }
        MeshMessage::Response { request_id, data, error, .. } => {
            handle_response(shared, request_id, data, error);
        }
        MeshMessage::Heartbeat { request_id } => {
            let pending = shared.pending.lock().unwrap();
            if let Some(entry) = pending.get(&request_id) {
                entry.deadline_ms.store(now_ms() + options.request_timeout_ms, Ordering::SeqCst);
                entry.heartbeat_notify.notify_waiters();
            }
        }
    }
}

#[allow(clippy::too_many_arguments)]
async fn handle_request(
    shared: &Arc<Shared>,
    runner: &RedisScriptRunner,
    prefix: &str,
    key: &str,
    request_id: String,
    sender_instance_id: u32,
    message_type: String,
    data: Value,
    timeout_ms: i64,
) {
    let sender_channel = node_channel(prefix, key, sender_instance_id);
    let handler = shared.handlers.lock().unwrap().get(&message_type).cloned();

    let hb_interval_ms = ((timeout_ms as f64) * 0.75).max(1.0) as u64;
    let hb_runner = runner.clone();
    let hb_channel = sender_channel.clone();
    let hb_request_id = request_id.clone();
    let heartbeat_task = tokio::spawn(async move {
        let mut tick = interval(Duration::from_millis(hb_interval_ms));
        tick.set_missed_tick_behavior(MissedTickBehavior::Delay);
        tick.tick().await; // first tick fires immediately
        loop {
            tick.tick().await;
            let payload = match serde_json::to_string(&MeshMessage::Heartbeat {
                request_id: hb_request_id.clone(),
            }) {
                Ok(payload) => payload,
                Err(_) => continue,
            };
            if let Err(err) = hb_runner.backend().publish(&hb_channel, &payload).await {
                tracing::warn!(error = %err, "mesh handler heartbeat publish failed");
            }
        }
    });
    shared
        .handler_heartbeats
        .lock()
        .unwrap()
        .insert(request_id.clone(), heartbeat_task);

    let result = match handler {
        Some(handler) => handler(data).await,
        None => Err(format!("{NO_HANDLER_PREFIX}{message_type}")),
    };

    if let Some(handle) = shared.handler_heartbeats.lock().unwrap().remove(&request_id) {
        handle.abort();
    }

    let response = match result {
        Ok(value) => MeshMessage::Response {
            request_id: request_id.clone(),
            reply: true,
            data: Some(value),
            error: None,
        },
        Err(reason) => MeshMessage::Response {
            request_id: request_id.clone(),
            reply: true,
            data: None,
            error: Some(reason),
        },
    };

    match serde_json::to_string(&response) {
        Ok(payload) => {
            if let Err(err) = runner.backend().publish(&sender_channel, &payload).await {
                tracing::warn!(error = %err, "mesh response publish failed");
            }
        }
        Err(err) => tracing::warn!(error = %err, "mesh response serialization failed"),
    }
}

fn handle_response(shared: &Arc<Shared>, request_id: String, data: Option<Value>, error: Option<String>) {
    let entry = shared.pending.lock().unwrap().remove(&request_id);
    let Some(entry) = entry else {
        // Late reply after the caller's own timeout already fired; the
        // handler still ran to completion, its result is simply discarded.
        tracing::warn!(request_id = %request_id, "dropping reply for unknown/expired mesh request");
        return;
    };

    let result = match error {
        Some(error) => {
            if let Some(message_type) = error.strip_prefix(NO_HANDLER_PREFIX) {
                Err(CoordinationError::MeshNoHandler {
                    message_type: message_type.to_string(),
                    target: entry.target,
                })
            } else {
                Err(CoordinationError::MeshHandlerError {
                    message_type: entry.message_type.clone(),
                    target: entry.target,
                    reason: error,
                })
            }
        }
        None => Ok(data.unwrap_or(Value::Null)),
    };

    let _ = entry.responder.send(result);
}

async fn heartbeat_loop(
    shared: Arc<Shared>,
    runner: RedisScriptRunner,
    leader: Leader,
    heartbeats_key: String,
    nodes_key: String,
    instance_id: u32,
    options: MeshOptions,
) {
    let mut tick = interval(Duration::from_millis(options.heartbeat_interval_ms));
    tick.set_missed_tick_behavior(MissedTickBehavior::Delay);
    loop {
        tick.tick().await;
        if shared.stopped.load(Ordering::SeqCst) {
            return;
        }

        if let Err(err) = runner.heartbeat(&heartbeats_key, &instance_id.to_string()).await {
            tracing::warn!(error = %err, "mesh heartbeat failed");
        }

        if leader.is_leader() {
            match runner.cleanup(&heartbeats_key, &nodes_key, options.node_ttl_ms).await {
                Ok(expired) => {
                    for id_str in expired {
                        if let Ok(id) = id_str.parse::<u32>() {
                            let hooks = shared.node_cleaned_up_hooks.lock().unwrap();
                            for hook in hooks.iter() {
                                hook(id);
                            }
                        }
                    }
                }
                Err(err) => tracing::warn!(error = %err, "mesh cleanup failed"),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{InMemoryRedisBackend, InMemorySubscriberFactory};
    use std::sync::atomic::AtomicUsize;
    use std::time::Duration as StdDuration;

    fn mesh(
        backend: Arc<InMemoryRedisBackend>,
        key: &str,
        host: &str,
        options: MeshOptions,
    ) -> Mesh {
        let runner = RedisScriptRunner::new(backend.clone(), "app");
        let factory: Arc<dyn RedisSubscriberFactory> =
            Arc::new(InMemorySubscriberFactory::new((*backend).clone()));
        Mesh::new(runner, factory, key, host, options)
    }

    fn fast_options() -> MeshOptions {
        MeshOptions {
            heartbeat_interval_ms: 20,
            node_ttl_ms: 60,
            request_timeout_ms: 500,
            leader_options: LeaderOptions {
                ttl_ms: 1_000,
                renewal_ms: 20,
                retry_delay_ms: 20,
            },
        }
    }

    #[tokio::test]
    async fn invoke_self_returns_handler_result_with_no_redis_traffic() {
        let backend = Arc::new(InMemoryRedisBackend::new());
        let node = mesh(backend.clone(), "M1", "host-a", fast_options());
        node.start().await.unwrap();
        node.register_handler("echo", |data| async move { Ok(data) });

        let before = backend.publish_count();
        let result = node.invoke(node.instance_id().unwrap(), "echo", serde_json::json!({"text": "hi"})).await.unwrap();
        assert_eq!(result, serde_json::json!({"text": "hi"}));
        assert_eq!(backend.publish_count(), before, "self-invoke must not touch Redis");

        node.stop().await;
    }

    #[tokio::test]
    async fn mesh_echo_scenario() {
        // End-to-end scenario 3.
        let backend = Arc::new(InMemoryRedisBackend::new());
        let options = fast_options();
        let n1 = mesh(backend.clone(), "M2", "host-1", options);
        let n2 = mesh(backend.clone(), "M2", "host-2", options);

        n1.start().await.unwrap();
        n2.start().await.unwrap();

        n1.register_handler("echo", |data| async move {
            let text = data.get("text").and_then(|v| v.as_str()).unwrap_or_default();
            Ok(serde_json::json!({"text": format!("echo: {text}")}))
        });
        n2.register_handler("echo", |data| async move {
            let text = data.get("text").and_then(|v| v.as_str()).unwrap_or_default();
            Ok(serde_json::json!({"text": format!("echo: {text}")}))
        });

        tokio::time::sleep(StdDuration::from_millis(100)).await;

        let reply = n2.invoke(n1.instance_id().unwrap(), "echo", serde_json::json!({"text": "hello"})).await.unwrap();
        assert_eq!(reply, serde_json::json!({"text": "echo: hello"}));

        let reply = n1.invoke(n2.instance_id().unwrap(), "echo", serde_json::json!({"text": "world"})).await.unwrap();
        assert_eq!(reply, serde_json::json!({"text": "echo: world"}));

        n1.stop().await;
        n2.stop().await;
    }

    #[tokio::test]
    async fn mesh_cleanup_scenario() {
        // End-to-end scenario 4.
        let backend = Arc::new(InMemoryRedisBackend::new());
        let options = fast_options();
        let n1 = mesh(backend.clone(), "M4", "host-1", options);
        let n2 = mesh(backend.clone(), "M4", "host-2", options);

        n1.start().await.unwrap();
        tokio::time::sleep(StdDuration::from_millis(30)).await;
        n2.start().await.unwrap();
        tokio::time::sleep(StdDuration::from_millis(30)).await;

        let cleaned = Arc::new(AtomicUsize::new(0));
        let cleaned_clone = cleaned.clone();
        let n2_id = n2.instance_id().unwrap();
        n1.on_node_cleaned_up(move |id| {
            if id == n2_id {
                cleaned_clone.fetch_add(1, Ordering::SeqCst);
            }
        });

        // Simulate a crash: N2's heartbeat and leader both stop, but it
        // never calls stop() so it stays registered until cleanup sweeps it.
        if let Some(handle) = n2.heartbeat_task.lock().unwrap().take() {
            handle.abort();
        }
        n2.leader.stop().await;

        tokio::time::sleep(StdDuration::from_millis(options.node_ttl_ms as u64 + options.heartbeat_interval_ms as u64 * 3)).await;

        assert_eq!(cleaned.load(Ordering::SeqCst), 1);

        n1.stop().await;
    }

    #[tokio::test]
    async fn stop_rejects_pending_requests() {
        let backend = Arc::new(InMemoryRedisBackend::new());
        let options = fast_options();
        let n1 = mesh(backend.clone(), "M5", "host-1", options);
        n1.start().await.unwrap();
        // Nobody is subscribed on instance 999's channel, so this request
        // never gets a reply; only `stop()` resolves it.
        let n1_clone = n1.clone();
        let invoke = tokio::spawn(async move {
            n1_clone.invoke(999, "never-registered", serde_json::json!({})).await
        });

        tokio::time::sleep(StdDuration::from_millis(10)).await;
        n1.stop().await;

        let result = invoke.await.unwrap();
        assert!(matches!(result, Err(CoordinationError::MeshStopped { .. })));
    }
}
