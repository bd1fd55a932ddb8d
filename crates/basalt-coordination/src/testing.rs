//! An in-process fake of the Redis surface in [`crate::redis_backend`], so
//! `Mutex`/`Leader`/`Mesh` tests don't require a live Redis server.
//!
//! Mirrors the semantics of the real Lua scripts exactly (including the
//! `ACQUIRE`/`RENEW`/`RELEASE` token-ownership checks and PX-style
//! expiry), backed by a single `std::sync::Mutex`-guarded map rather than a
//! network round-trip. A virtual clock (`set_time_ms`) lets tests fast
//! forward past TTLs deterministically instead of sleeping.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex as StdMutex};

use async_trait::async_trait;
use tokio::sync::mpsc;

use crate::error::Result;
use crate::redis_backend::{RedisBackend, RedisSubscriber, RedisSubscriberFactory};

#[derive(Default)]
struct Inner {
    /// key -> (value, expiry epoch ms, or None for no TTL)
    strings: HashMap<String, (String, Option<i64>)>,
    hashes: HashMap<String, HashMap<String, String>>,
    sorted_sets: HashMap<String, HashMap<String, i64>>,
    counters: HashMap<String, i64>,
    subscribers: HashMap<String, Vec<mpsc::UnboundedSender<String>>>,
    clock_ms: i64,
    /// Counts `publish` calls, so tests can assert "no Redis traffic"
    /// (e.g. a self-targeted `Mesh::invoke`) without a live server to watch.
    publish_count: usize,
}

impl Inner {
    fn now(&self) -> i64 {
        self.clock_ms
    }

    fn get_live(&mut self, key: &str) -> Option<String> {
        let now = self.now();
        match self.strings.get(key) {
            Some((_, Some(expiry))) if *expiry <= now => {
                self.strings.remove(key);
                None
            }
            Some((value, _)) => Some(value.clone()),
            None => None,
        }
    }
}

/// In-memory stand-in for [`RedisBackend`], shareable across tasks.
#[derive(Clone)]
pub struct InMemoryRedisBackend {
    inner: Arc<StdMutex<Inner>>,
}

impl InMemoryRedisBackend {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(StdMutex::new(Inner::default())),
        }
    }

    /// Advances (or sets) the fake's virtual clock used for PX expiry and
    /// the `TIME`-derived heartbeat/cleanup timestamps.
    pub fn set_time_ms(&self, ms: i64) {
        self.inner.lock().unwrap().clock_ms = ms;
    }

    pub fn advance_time_ms(&self, delta: i64) {
        let mut inner = self.inner.lock().unwrap();
        inner.clock_ms += delta;
    }

    /// Returns an in-memory subscriber for `channel`; messages published
    /// via [`RedisBackend::publish`] after this call are delivered to it.
    pub fn subscribe(&self, channel: &str) -> InMemoryRedisSubscriber {
        let (tx, rx) = mpsc::unbounded_channel();
        self.inner
            .lock()
            .unwrap()
            .subscribers
            .entry(channel.to_string())
            .or_default()
            .push(tx);
        InMemoryRedisSubscriber { rx, closed: false }
    }

    pub fn publish_count(&self) -> usize {
        self.inner.lock().unwrap().publish_count
    }
}

impl Default for InMemoryRedisBackend {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl RedisBackend for InMemoryRedisBackend {
    async fn acquire(&self, key: &str, token: &str, ttl_ms: i64) -> Result<bool> {
        let mut inner = self.inner.lock().unwrap();
        if inner.get_live(key).is_some() {
            return Ok(false);
        }
        let expiry = inner.now() + ttl_ms;
        inner
            .strings
            .insert(key.to_string(), (token.to_string(), Some(expiry)));
        Ok(true)
    }

    async fn renew(&self, key: &str, token: &str, ttl_ms: i64) -> Result<bool> {
        let mut inner = self.inner.lock().unwrap();
        match inner.get_live(key) {
            Some(current) if current == token => {
                let expiry = inner.now() + ttl_ms;
                inner
                    .strings
                    .insert(key.to_string(), (token.to_string(), Some(expiry)));
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn release(&self, key: &str, token: &str) -> Result<bool> {
        let mut inner = self.inner.lock().unwrap();
        match inner.get_live(key) {
            Some(current) if current == token => {
                inner.strings.remove(key);
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn incr(&self, key: &str) -> Result<i64> {
        let mut inner = self.inner.lock().unwrap();
        let counter = inner.counters.entry(key.to_string()).or_insert(0);
        *counter += 1;
        Ok(*counter)
    }

    async fn heartbeat(&self, heartbeats_key: &str, id: &str) -> Result<i64> {
        let mut inner = self.inner.lock().unwrap();
        let now = inner.now();
        inner
            .sorted_sets
            .entry(heartbeats_key.to_string())
            .or_default()
            .insert(id.to_string(), now);
        Ok(now)
    }

    async fn cleanup(
        &self,
        heartbeats_key: &str,
        nodes_key: &str,
        ttl_ms: i64,
    ) -> Result<Vec<String>> {
        let mut inner = self.inner.lock().unwrap();
        let now = inner.now();
        let cutoff = now - ttl_ms;
        let expired: Vec<String> = inner
            .sorted_sets
            .get(heartbeats_key)
            .map(|set| {
                set.iter()
                    .filter(|(_, score)| **score <= cutoff)
                    .map(|(id, _)| id.clone())
                    .collect()
            })
            .unwrap_or_default();

        if let Some(set) = inner.sorted_sets.get_mut(heartbeats_key) {
            for id in &expired {
                set.remove(id);
            }
        }
        if let Some(hash) = inner.hashes.get_mut(nodes_key) {
            for id in &expired {
                hash.remove(id);
            }
        }
        Ok(expired)
    }

    async fn hset(&self, key: &str, field: &str, value: &str) -> Result<()> {
        let mut inner = self.inner.lock().unwrap();
        inner
            .hashes
            .entry(key.to_string())
            .or_default()
            .insert(field.to_string(), value.to_string());
        Ok(())
    }

    async fn hdel(&self, key: &str, field: &str) -> Result<()> {
        let mut inner = self.inner.lock().unwrap();
        if let Some(hash) = inner.hashes.get_mut(key) {
            hash.remove(field);
        }
        Ok(())
    }

    async fn hmget(&self, key: &str, fields: &[String]) -> Result<Vec<Option<String>>> {
        let inner = self.inner.lock().unwrap();
        let hash = inner.hashes.get(key);
        Ok(fields
            .iter()
            .map(|f| hash.and_then(|h| h.get(f)).cloned())
            .collect())
    }

    async fn zrange(&self, key: &str) -> Result<Vec<String>> {
        let inner = self.inner.lock().unwrap();
        let mut members: Vec<(String, i64)> = inner
            .sorted_sets
            .get(key)
            .map(|s| s.iter().map(|(k, v)| (k.clone(), *v)).collect())
            .unwrap_or_default();
        members.sort_by(|a, b| a.1.cmp(&b.1).then_with(|| a.0.cmp(&b.0)));
        Ok(members.into_iter().map(|(id, _)| id).collect())
    }

    async fn zrem(&self, key: &str, member: &str) -> Result<()> {
        let mut inner = self.inner.lock().unwrap();
        if let Some(set) = inner.sorted_sets.get_mut(key) {
            set.remove(member);
        }
        Ok(())
    }

    async fn publish(&self, channel: &str, message: &str) -> Result<()> {
        let mut inner = self.inner.lock().unwrap();
        inner.publish_count += 1;
        if let Some(subs) = inner.subscribers.get_mut(channel) {
            subs.retain(|tx| tx.send(message.to_string()).is_ok());
        }
        Ok(())
    }
}

pub struct InMemoryRedisSubscriber {
    rx: mpsc::UnboundedReceiver<String>,
    closed: bool,
}

#[async_trait]
impl RedisSubscriber for InMemoryRedisSubscriber {
    async fn next_message(&mut self) -> Option<String> {
        if self.closed {
            return None;
        }
        self.rx.recv().await
    }

    async fn unsubscribe(&mut self) -> Result<()> {
        self.closed = true;
        self.rx.close();
        Ok(())
    }
}

/// Tracks which instance ids have ever been issued across every fake mesh
/// node sharing a backend, for asserting the "unique for the mesh key's
/// lifetime" invariant in tests that start and stop several nodes.
#[derive(Clone, Default)]
pub struct InstanceIdLedger {
    seen: Arc<StdMutex<HashSet<u32>>>,
}

impl InstanceIdLedger {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns `true` the first time `id` is recorded, `false` on any
    /// subsequent call (a collision).
    pub fn record(&self, id: u32) -> bool {
        self.seen.lock().unwrap().insert(id)
    }
}

/// [`RedisSubscriberFactory`] over a shared [`InMemoryRedisBackend`], for
/// tests that exercise [`crate::mesh::Mesh`] without a live Redis server.
#[derive(Clone)]
pub struct InMemorySubscriberFactory {
    backend: InMemoryRedisBackend,
}

impl InMemorySubscriberFactory {
    pub fn new(backend: InMemoryRedisBackend) -> Self {
        Self { backend }
    }
}

#[async_trait]
impl RedisSubscriberFactory for InMemorySubscriberFactory {
    async fn subscribe(&self, channel: &str) -> Result<Box<dyn RedisSubscriber>> {
        Ok(Box::new(self.backend.subscribe(channel)))
    }
}
