//! `RedisScriptRunner`: the key-prefixing facade `Mutex`, `Leader` and
//! `Mesh` share over a [`RedisBackend`].
//!
//! Every key this crate touches is namespaced `${prefix}:${category}:${key}`
//! (see [`crate::keyspace`]); this type is where that namespacing happens so
//! the script invocations themselves stay free of string-formatting detail.

use std::sync::Arc;

use crate::error::Result;
use crate::keyspace::namespaced;
use crate::redis_backend::RedisBackend;

#[derive(Clone)]
pub struct RedisScriptRunner {
    backend: Arc<dyn RedisBackend>,
    prefix: String,
}

impl RedisScriptRunner {
    pub fn new(backend: Arc<dyn RedisBackend>, prefix: impl Into<String>) -> Self {
        Self {
            backend,
            prefix: prefix.into(),
        }
    }

    /// Builds the fully-qualified key for `category`/`key` under this
    /// runner's prefix, e.g. `mutex_key("orders")` -> `app:mutex:orders`.
    pub fn namespaced_key(&self, category: &str, key: &str) -> String {
        namespaced(&self.prefix, category, key)
    }

    pub async fn acquire(&self, key: &str, token: &str, ttl_ms: i64) -> Result<bool> {
        self.backend.acquire(key, token, ttl_ms).await
    }

    pub async fn renew(&self, key: &str, token: &str, ttl_ms: i64) -> Result<bool> {
        self.backend.renew(key, token, ttl_ms).await
    }

    pub async fn release(&self, key: &str, token: &str) -> Result<bool> {
        self.backend.release(key, token).await
    }

    pub async fn incr(&self, key: &str) -> Result<i64> {
        self.backend.incr(key).await
    }

    pub async fn heartbeat(&self, heartbeats_key: &str, id: &str) -> Result<i64> {
        self.backend.heartbeat(heartbeats_key, id).await
    }

    pub async fn cleanup(
        &self,
        heartbeats_key: &str,
        nodes_key: &str,
        ttl_ms: i64,
    ) -> Result<Vec<String>> {
        self.backend.cleanup(heartbeats_key, nodes_key, ttl_ms).await
    }

    pub fn backend(&self) -> &Arc<dyn RedisBackend> {
        &self.backend
    }

    pub fn prefix(&self) -> &str {
        &self.prefix
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::InMemoryRedisBackend;

    #[tokio::test]
    async fn namespaced_key_applies_prefix_and_category() {
        let runner = RedisScriptRunner::new(Arc::new(InMemoryRedisBackend::new()), "app");
        assert_eq!(runner.namespaced_key("mutex", "orders"), "app:mutex:orders");
    }

    #[tokio::test]
    async fn acquire_renew_release_round_trip() {
        let runner = RedisScriptRunner::new(Arc::new(InMemoryRedisBackend::new()), "app");
        let key = runner.namespaced_key("mutex", "orders");

        assert!(runner.acquire(&key, "tok-1", 5_000).await.unwrap());
        assert!(!runner.acquire(&key, "tok-2", 5_000).await.unwrap());
        assert!(runner.renew(&key, "tok-1", 5_000).await.unwrap());
        assert!(!runner.renew(&key, "tok-2", 5_000).await.unwrap());
        assert!(runner.release(&key, "tok-1").await.unwrap());
        assert!(runner.acquire(&key, "tok-2", 5_000).await.unwrap());
    }
}
