//! Long-lived per-key leader election.
//!
//! State machine: `Stopped -> Seeking -> Holding -> Lost -> Seeking (new
//! generation)`, with `Holding -> Stopped` on `stop()`. `stop()` is
//! idempotent and deliberately does not fire `on_lost_leader` — an owner
//! that calls `stop()` itself is expected to run its own teardown.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use basalt_types::OwnerToken;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tokio::time::{interval, MissedTickBehavior};

use crate::script_runner::RedisScriptRunner;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LeaderState {
    Stopped,
    Seeking,
    Holding,
    Lost,
}

#[derive(Debug, Clone, Copy)]
pub struct LeaderOptions {
    pub ttl_ms: i64,
    pub renewal_ms: u64,
    pub retry_delay_ms: u64,
}

impl Default for LeaderOptions {
    fn default() -> Self {
        Self {
            ttl_ms: 30_000,
            renewal_ms: 10_000,
            retry_delay_ms: 5_000,
        }
    }
}

type Hook = Box<dyn Fn() -> anyhow::Result<()> + Send + Sync>;

struct Shared {
    state: StdMutex<LeaderState>,
    token: StdMutex<OwnerToken>,
    generation: AtomicU64,
    became_leader: StdMutex<Vec<Hook>>,
    lost_leader: StdMutex<Vec<Hook>>,
    stop_requested: AtomicBool,
    stop_notify: Notify,
    run_id: AtomicU64,
}

/// A leader-election handle for one Redis key. Cheap to clone; clones share
/// the same election state and background task.
#[derive(Clone)]
pub struct Leader {
    runner: RedisScriptRunner,
    key: String,
    options: LeaderOptions,
    shared: Arc<Shared>,
    task: Arc<StdMutex<Option<JoinHandle<()>>>>,
}

impl Leader {
    pub fn new(runner: RedisScriptRunner, category: &str, key: &str, options: LeaderOptions) -> Self {
        let full_key = runner.namespaced_key(category, key);
        Self {
            runner,
            key: full_key,
            options,
            shared: Arc::new(Shared {
                state: StdMutex::new(LeaderState::Stopped),
                token: StdMutex::new(OwnerToken::generate()),
                generation: AtomicU64::new(0),
                became_leader: StdMutex::new(Vec::new()),
                lost_leader: StdMutex::new(Vec::new()),
                stop_requested: AtomicBool::new(false),
                stop_notify: Notify::new(),
                run_id: AtomicU64::new(0),
            }),
            task: Arc::new(StdMutex::new(None)),
        }
    }

    pub fn on_became_leader<F>(&self, hook: F)
    where
        F: Fn() -> anyhow::Result<()> + Send + Sync + 'static,
    {
        self.shared.became_leader.lock().unwrap().push(Box::new(hook));
    }

    pub fn on_lost_leader<F>(&self, hook: F)
    where
        F: Fn() -> anyhow::Result<()> + Send + Sync + 'static,
    {
        self.shared.lost_leader.lock().unwrap().push(Box::new(hook));
    }

    pub fn is_leader(&self) -> bool {
        *self.shared.state.lock().unwrap() == LeaderState::Holding
    }

    pub fn state(&self) -> LeaderState {
        *self.shared.state.lock().unwrap()
    }

    pub fn generation(&self) -> u64 {
        self.shared.generation.load(Ordering::SeqCst)
    }

    /// Starts seeking leadership. No-op if already running.
    pub fn start(&self) {
        let mut state = self.shared.state.lock().unwrap();
        if *state != LeaderState::Stopped {
            return;
        }
        *state = LeaderState::Seeking;
        drop(state);

        self.shared.stop_requested.store(false, Ordering::SeqCst);
        let run_id = self.shared.run_id.fetch_add(1, Ordering::SeqCst) + 1;

        let runner = self.runner.clone();
        let key = self.key.clone();
        let options = self.options;
        let shared = self.shared.clone();

        let handle = tokio::spawn(async move {
            run_election_loop(runner, key, options, shared, run_id).await;
        });
        *self.task.lock().unwrap() = Some(handle);
    }

    /// Idempotent. Releases the key if currently holding, cancels the
    /// background task, and sets state to `Stopped`. Does not fire
    /// `on_lost_leader`.
    pub async fn stop(&self) {
        if self.shared.stop_requested.swap(true, Ordering::SeqCst) {
            return; // already stopping/stopped
        }
        self.shared.stop_notify.notify_waiters();

        let was_holding = {
            let mut state = self.shared.state.lock().unwrap();
            let holding = *state == LeaderState::Holding;
            *state = LeaderState::Stopped;
            holding
        };

        if was_holding {
            let token = self.shared.token.lock().unwrap().clone();
            match self.runner.release(&self.key, token.as_str()).await {
                Ok(false) => tracing::warn!(key = %self.key, "leader release returned 0"),
                Err(err) => tracing::warn!(key = %self.key, error = %err, "leader release errored"),
                Ok(true) => {}
            }
        }

        if let Some(handle) = self.task.lock().unwrap().take() {
            handle.abort();
        }
    }
}

async fn run_election_loop(
    runner: RedisScriptRunner,
    key: String,
    options: LeaderOptions,
    shared: Arc<Shared>,
    run_id: u64,
) {
    loop {
        if shared.stop_requested.load(Ordering::SeqCst) {
            return;
        }
        if shared.run_id.load(Ordering::SeqCst) != run_id {
            return; // superseded by a later start()
        }

        let token = OwnerToken::generate();
        let acquired = runner.acquire(&key, token.as_str(), options.ttl_ms).await;

        match acquired {
            Ok(true) => {
                if shared.stop_requested.load(Ordering::SeqCst) {
                    // Raced with a concurrent stop(): release immediately
                    // and exit without ever becoming Holding.
                    let _ = runner.release(&key, token.as_str()).await;
                    return;
                }

                *shared.token.lock().unwrap() = token.clone();
                *shared.state.lock().unwrap() = LeaderState::Holding;
                shared.generation.fetch_add(1, Ordering::SeqCst);
                fire_hooks(&shared.became_leader, "on_became_leader");

                let lost = hold_until_lost(&runner, &key, &token, options, &shared).await;
                if !lost {
                    // stop() fired during Holding; the loop exits via the
                    // stop_requested check at the top of the next iteration.
                    return;
                }

                *shared.state.lock().unwrap() = LeaderState::Lost;
                fire_hooks(&shared.lost_leader, "on_lost_leader");

                if shared.stop_requested.load(Ordering::SeqCst) {
                    return;
                }
                *shared.state.lock().unwrap() = LeaderState::Seeking;
            }
            Ok(false) => {
                tokio::select! {
                    () = tokio::time::sleep(Duration::from_millis(options.retry_delay_ms)) => {}
                    () = shared.stop_notify.notified() => return,
                }
            }
            Err(err) => {
                tracing::warn!(key = %key, error = %err, "leader acquire errored, retrying");
                tokio::select! {
                    () = tokio::time::sleep(Duration::from_millis(options.retry_delay_ms)) => {}
                    () = shared.stop_notify.notified() => return,
                }
            }
        }
    }
}

/// Runs the renewal ticker while Holding. Returns `true` if leadership was
/// lost (RENEW returned 0 or errored), `false` if `stop()` ended the hold.
async fn hold_until_lost(
    runner: &RedisScriptRunner,
    key: &str,
    token: &OwnerToken,
    options: LeaderOptions,
    shared: &Arc<Shared>,
) -> bool {
    let mut tick = interval(Duration::from_millis(options.renewal_ms));
    tick.set_missed_tick_behavior(MissedTickBehavior::Delay);
    tick.tick().await; // first tick fires immediately; skip it

    loop {
        tokio::select! {
            _ = tick.tick() => {
                match runner.renew(key, token.as_str(), options.ttl_ms).await {
                    Ok(true) => continue,
                    Ok(false) => return true,
                    Err(err) => {
                        tracing::warn!(key = %key, error = %err, "leader renewal errored");
                        return true;
                    }
                }
            }
            () = shared.stop_notify.notified() => {
                if shared.stop_requested.load(Ordering::SeqCst) {
                    return false;
                }
            }
        }
    }
}

fn fire_hooks(hooks: &StdMutex<Vec<Hook>>, name: &str) {
    for hook in hooks.lock().unwrap().iter() {
        if let Err(err) = hook() {
            tracing::warn!(hook = name, error = %err, "leader callback failed");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::InMemoryRedisBackend;
    use std::sync::atomic::AtomicUsize;

    fn runner() -> RedisScriptRunner {
        RedisScriptRunner::new(Arc::new(InMemoryRedisBackend::new()), "app")
    }

    #[tokio::test]
    async fn single_process_becomes_leader() {
        let leader = Leader::new(runner(), "leader", "K", LeaderOptions::default());
        leader.start();
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(leader.is_leader());
        leader.stop().await;
        assert_eq!(leader.state(), LeaderState::Stopped);
    }

    #[tokio::test]
    async fn stop_is_idempotent() {
        let leader = Leader::new(runner(), "leader", "K", LeaderOptions::default());
        leader.start();
        tokio::time::sleep(Duration::from_millis(10)).await;
        leader.stop().await;
        leader.stop().await;
        assert_eq!(leader.state(), LeaderState::Stopped);
    }

    #[tokio::test]
    async fn handoff_scenario() {
        // End-to-end scenario 2: P2 starts after P1 already holds; P2 never
        // becomes leader until P1 stops.
        let backend = Arc::new(InMemoryRedisBackend::new());
        let shared_runner = RedisScriptRunner::new(backend, "app");
        let options = LeaderOptions {
            ttl_ms: 2_000,
            renewal_ms: 50,
            retry_delay_ms: 20,
        };

        let p1 = Leader::new(shared_runner.clone(), "leader", "K", options);
        let p2 = Leader::new(shared_runner.clone(), "leader", "K", options);

        let became_p2 = Arc::new(AtomicUsize::new(0));
        let became_p2_clone = became_p2.clone();
        p2.on_became_leader(move || {
            became_p2_clone.fetch_add(1, Ordering::SeqCst);
            Ok(())
        });

        p1.start();
        tokio::time::sleep(Duration::from_millis(30)).await;
        assert!(p1.is_leader());

        p2.start();
        tokio::time::sleep(Duration::from_millis(30)).await;
        assert!(!p2.is_leader());
        assert_eq!(became_p2.load(Ordering::SeqCst), 0);

        p1.stop().await;
        tokio::time::sleep(Duration::from_millis(80)).await;

        assert!(p2.is_leader());
        assert_eq!(became_p2.load(Ordering::SeqCst), 1);

        p2.stop().await;
    }

    #[tokio::test]
    async fn renewal_loss_transitions_through_lost_and_reseeks() {
        let backend = Arc::new(InMemoryRedisBackend::new());
        let runner = RedisScriptRunner::new(backend.clone(), "app");
        let options = LeaderOptions {
            ttl_ms: 500,
            renewal_ms: 20,
            retry_delay_ms: 20,
        };
        let leader = Leader::new(runner.clone(), "leader", "K", options);

        let lost_count = Arc::new(AtomicUsize::new(0));
        let lost_count_clone = lost_count.clone();
        leader.on_lost_leader(move || {
            lost_count_clone.fetch_add(1, Ordering::SeqCst);
            Ok(())
        });

        leader.start();
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(leader.is_leader());

        // Steal the key out from under the leader to force its next RENEW
        // to fail.
        let full_key = runner.namespaced_key("leader", "K");
        backend.release(&full_key, leader.shared.token.lock().unwrap().as_str()).await.unwrap();
        backend.acquire(&full_key, "intruder", 60_000).await.unwrap();

        tokio::time::sleep(Duration::from_millis(60)).await;
        assert_eq!(lost_count.load(Ordering::SeqCst), 1);

        leader.stop().await;
    }
}
