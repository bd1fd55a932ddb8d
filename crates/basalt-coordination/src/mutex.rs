//! Distributed (and process-local) mutual exclusion: `with_mutex` /
//! `with_mutexes`.
//!
//! Two backends share one public API:
//! - [`MutexMode::Redis`] acquires a Redis-backed lock with retry + a
//!   renewal ticker, failing the body if renewal is ever lost mid-flight.
//! - [`MutexMode::Local`] serializes same-process callers through a
//!   per-key `tokio::sync::Mutex`, so a single process can run without
//!   Redis at all.

use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use basalt_types::{now_ms, OwnerToken};
use tokio::sync::{watch, Mutex as TokioMutex};
use tokio::time::{interval, timeout, MissedTickBehavior};

use crate::error::{CoordinationError, Result};
use crate::script_runner::RedisScriptRunner;

/// Tuning knobs for a single `with_mutex`/`with_mutexes` call.
#[derive(Debug, Clone, Copy)]
pub struct MutexOptions {
    pub retry_count: u32,
    pub retry_delay_ms: u64,
    pub renew_interval_ms: u64,
}

impl Default for MutexOptions {
    fn default() -> Self {
        Self {
            retry_count: 30,
            retry_delay_ms: 1_000,
            renew_interval_ms: 1_000,
        }
    }
}

impl MutexOptions {
    fn total_wait_budget(&self) -> Duration {
        Duration::from_millis(self.retry_delay_ms * u64::from(self.retry_count))
    }
}

/// The outcome of a successful `with_mutex` call.
pub struct MutexOutcome<T> {
    pub value: T,
    /// `true` iff more than one acquisition attempt was needed (Redis mode)
    /// or the caller had to wait for an in-flight holder (local mode).
    pub did_wait: bool,
}

#[derive(Clone)]
enum Backend {
    Redis {
        runner: RedisScriptRunner,
        category: String,
    },
    Local {
        registry: Arc<LocalRegistry>,
    },
}

/// Process-wide `key -> in-flight holder` map for [`Backend::Local`].
#[derive(Default)]
struct LocalRegistry {
    holders: StdMutex<HashMap<String, Arc<TokioMutex<()>>>>,
}

impl LocalRegistry {
    fn holder_for(&self, key: &str) -> Arc<TokioMutex<()>> {
        self.holders
            .lock()
            .unwrap()
            .entry(key.to_string())
            .or_insert_with(|| Arc::new(TokioMutex::new(())))
            .clone()
    }

    /// Drops the map entry once nobody else still references it, so the
    /// registry doesn't grow unboundedly over a long process lifetime.
    fn maybe_evict(&self, key: &str, holder: &Arc<TokioMutex<()>>) {
        let mut holders = self.holders.lock().unwrap();
        if let Some(current) = holders.get(key) {
            if Arc::ptr_eq(current, holder) && Arc::strong_count(current) == 1 {
                holders.remove(key);
            }
        }
    }
}

/// The distributed mutex service. Construct once per process and clone
/// freely (`Redis` mode clones cheaply, `Local` mode shares one registry).
#[derive(Clone)]
pub struct Mutex {
    backend: Backend,
}

impl Mutex {
    /// Redis-backed mode: `category` is the key namespace (e.g. `"mutex"`),
    /// matching `RedisScriptRunner::namespaced_key`.
    pub fn redis(runner: RedisScriptRunner, category: impl Into<String>) -> Self {
        Self {
            backend: Backend::Redis {
                runner,
                category: category.into(),
            },
        }
    }

    /// Process-local mode: no Redis traffic, callers in the same process
    /// serialize through an in-memory registry.
    pub fn local() -> Self {
        Self {
            backend: Backend::Local {
                registry: Arc::new(LocalRegistry::default()),
            },
        }
    }

    pub async fn with_mutex<T, F, Fut>(
        &self,
        key: &str,
        options: MutexOptions,
        f: F,
    ) -> Result<MutexOutcome<T>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = T>,
    {
        match &self.backend {
            Backend::Redis { runner, category } => {
                self.with_mutex_redis(runner, category, key, options, f).await
            }
            Backend::Local { registry } => {
                self.with_mutex_local(registry, key, options, f).await
            }
        }
    }

    /// Acquires `keys` in order, delegating inside like nested
    /// `with_mutex` calls, and aggregates `did_wait` with OR. Unwinding on
    /// error releases every mutex already acquired, innermost first.
    pub fn with_mutexes<'a, T, F, Fut>(
        &'a self,
        keys: &'a [String],
        options: MutexOptions,
        f: F,
    ) -> std::pin::Pin<Box<dyn Future<Output = Result<MutexOutcome<T>>> + Send + 'a>>
    where
        T: Send + 'static,
        F: FnOnce() -> Fut + Send + 'a,
        Fut: Future<Output = T> + Send + 'a,
    {
        Box::pin(async move {
            match keys.split_first() {
                None => Ok(MutexOutcome {
                    value: f().await,
                    did_wait: false,
                }),
                Some((head, rest)) => {
                    let rest = rest.to_vec();
                    let outer = self
                        .with_mutex(head, options, move || async move {
                            self.with_mutexes(&rest, options, f).await
                        })
                        .await?;
                    let inner = outer.value?;
                    Ok(MutexOutcome {
                        value: inner.value,
                        did_wait: outer.did_wait || inner.did_wait,
                    })
                }
            }
        })
    }

    async fn with_mutex_redis<T, F, Fut>(
        &self,
        runner: &RedisScriptRunner,
        category: &str,
        key: &str,
        options: MutexOptions,
        f: F,
    ) -> Result<MutexOutcome<T>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = T>,
    {
        let full_key = runner.namespaced_key(category, key);
        let token = OwnerToken::generate();
        let ttl_ms = (options.renew_interval_ms * 3) as i64;
        let deadline = now_ms() + options.total_wait_budget().as_millis() as i64;

        let mut attempts: u32 = 0;
        loop {
            if runner.acquire(&full_key, token.as_str(), ttl_ms).await? {
                break;
            }
            attempts += 1;
            if now_ms() >= deadline {
                return Err(CoordinationError::LockTimeout {
                    key: full_key.clone(),
                });
            }
            tokio::time::sleep(Duration::from_millis(options.retry_delay_ms)).await;
        }
        let did_wait = attempts > 0;

        let (lost_tx, mut lost_rx) = watch::channel(false);
        let renewal_runner = runner.clone();
        let renewal_key = full_key.clone();
        let renewal_token = token.clone();
        let renew_every = Duration::from_millis(options.renew_interval_ms / 2).max(
            Duration::from_millis(1),
        );
        let renewal_task = tokio::spawn(async move {
            let mut tick = interval(renew_every);
            tick.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                tick.tick().await;
                match renewal_runner
                    .renew(&renewal_key, renewal_token.as_str(), ttl_ms)
                    .await
                {
                    Ok(true) => {}
                    Ok(false) => {
                        let _ = lost_tx.send(true);
                        return;
                    }
                    Err(err) => {
                        tracing::warn!(key = %renewal_key, error = %err, "mutex renewal errored");
                        let _ = lost_tx.send(true);
                        return;
                    }
                }
            }
        });

        let result = tokio::select! {
            biased;
            _ = lost_rx.changed() => {
                Err(CoordinationError::LockLost { key: full_key.clone() })
            }
            value = f() => Ok(value),
        };

        renewal_task.abort();

        let released = runner.release(&full_key, token.as_str()).await;
        if let Ok(false) = released {
            tracing::warn!(key = %full_key, "lock release returned 0 (already expired or stolen)");
        } else if let Err(err) = released {
            tracing::warn!(key = %full_key, error = %err, "lock release errored");
        }

        result.map(|value| MutexOutcome { value, did_wait })
    }

    async fn with_mutex_local<T, F, Fut>(
        &self,
        registry: &Arc<LocalRegistry>,
        key: &str,
        options: MutexOptions,
        f: F,
    ) -> Result<MutexOutcome<T>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = T>,
    {
        let holder = registry.holder_for(key);

        let (guard, did_wait) = match holder.clone().try_lock_owned() {
            Ok(guard) => (guard, false),
            Err(_) => {
                let guard = timeout(options.total_wait_budget(), holder.clone().lock_owned())
                    .await
                    .map_err(|_| CoordinationError::LockTimeout {
                        key: key.to_string(),
                    })?;
                (guard, true)
            }
        };

        let value = f().await;
        drop(guard);
        registry.maybe_evict(key, &holder);

        Ok(MutexOutcome { value, did_wait })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::script_runner::RedisScriptRunner;
    use crate::testing::InMemoryRedisBackend;
    use std::sync::atomic::{AtomicBool, Ordering};
    use tokio::sync::Mutex as TMutex;

    #[tokio::test]
    async fn local_mutex_fairness_scenario() {
        // End-to-end scenario 1 from the testable-properties section: A
        // acquires key `Test1` and releases immediately (did_wait=false); B
        // is called before A releases, observes did_wait=true, and runs
        // strictly after A.
        let mutex = Arc::new(Mutex::local());
        let options = MutexOptions::default();
        let order = Arc::new(TMutex::new(Vec::new()));

        let mutex_a = mutex.clone();
        let order_a = order.clone();
        let a = tokio::spawn(async move {
            mutex_a
                .with_mutex("Test1", options, move || async move {
                    order_a.lock().await.push("A-start");
                    tokio::time::sleep(Duration::from_millis(30)).await;
                    order_a.lock().await.push("A-end");
                })
                .await
        });

        // Give A a chance to acquire before B is called.
        tokio::time::sleep(Duration::from_millis(10)).await;

        let mutex_b = mutex.clone();
        let order_b = order.clone();
        let b = tokio::spawn(async move {
            mutex_b
                .with_mutex("Test1", options, move || async move {
                    order_b.lock().await.push("B-start");
                })
                .await
        });

        let outcome_a = a.await.unwrap().unwrap();
        let outcome_b = b.await.unwrap().unwrap();

        assert!(!outcome_a.did_wait);
        assert!(outcome_b.did_wait);

        let seen = order.lock().await.clone();
        assert_eq!(seen, vec!["A-start", "A-end", "B-start"]);
    }

    #[tokio::test]
    async fn local_mutex_serializes_concurrent_callers() {
        let mutex = Arc::new(Mutex::local());
        let counter = Arc::new(AtomicBool::new(false));
        let options = MutexOptions::default();

        let m1 = mutex.clone();
        let c1 = counter.clone();
        let h1 = tokio::spawn(async move {
            m1.with_mutex("k", options, || async move {
                assert!(!c1.swap(true, Ordering::SeqCst));
                tokio::time::sleep(Duration::from_millis(20)).await;
                c1.store(false, Ordering::SeqCst);
            })
            .await
        });

        tokio::time::sleep(Duration::from_millis(5)).await;

        let m2 = mutex.clone();
        let c2 = counter.clone();
        let h2 = tokio::spawn(async move {
            m2.with_mutex("k", options, || async move {
                assert!(!c2.swap(true, Ordering::SeqCst));
                c2.store(false, Ordering::SeqCst);
            })
            .await
        });

        let (r1, r2) = tokio::join!(h1, h2);
        assert!(r1.unwrap().is_ok());
        let outcome2 = r2.unwrap().unwrap();
        assert!(outcome2.did_wait);
    }

    #[tokio::test]
    async fn redis_mutex_acquire_renew_release() {
        let backend = Arc::new(InMemoryRedisBackend::new());
        let runner = RedisScriptRunner::new(backend, "app");
        let mutex = Mutex::redis(runner, "mutex");

        let outcome = mutex
            .with_mutex("orders", MutexOptions::default(), || async { 42 })
            .await
            .unwrap();

        assert_eq!(outcome.value, 42);
        assert!(!outcome.did_wait);
    }

    #[tokio::test]
    async fn redis_mutex_times_out_when_held() {
        let backend = Arc::new(InMemoryRedisBackend::new());
        let runner = RedisScriptRunner::new(backend.clone(), "app");
        let key = runner.namespaced_key("mutex", "orders");
        backend.acquire(&key, "someone-else", 60_000).await.unwrap();

        let mutex = Mutex::redis(runner, "mutex");
        let options = MutexOptions {
            retry_count: 2,
            retry_delay_ms: 5,
            renew_interval_ms: 1_000,
        };

        let result = mutex.with_mutex("orders", options, || async {}).await;
        assert!(matches!(result, Err(CoordinationError::LockTimeout { .. })));
    }

    #[tokio::test]
    async fn with_mutexes_aggregates_did_wait_and_releases_in_reverse() {
        let backend = Arc::new(InMemoryRedisBackend::new());
        let runner = RedisScriptRunner::new(backend, "app");
        let mutex = Mutex::redis(runner, "mutex");
        let keys = vec!["a".to_string(), "b".to_string()];

        let outcome = mutex
            .with_mutexes(&keys, MutexOptions::default(), || async { "done" })
            .await
            .unwrap();

        assert_eq!(outcome.value, "done");
        assert!(!outcome.did_wait);
    }
}
