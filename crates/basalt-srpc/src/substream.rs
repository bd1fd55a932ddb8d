//! `ByteSubstream`: a bidirectional multiplexed substream layered over any
//! SRPC peer, with write-side backpressure and receive-side race-safe
//! buffering.
//!
//! ID allocation is disjoint by construction: one side of a connection
//! allocates sender ids from [`basalt_types::SubstreamParity::Odd`], the
//! other from `Even`, so concurrently created substreams on both sides can
//! never collide without negotiation.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use basalt_types::{SubstreamId, SubstreamParity};
use tokio::sync::mpsc;

use crate::error::{PipeSide, Result, SrpcError};

/// Write-side high-water mark: once the host connection reports at least
/// this many buffered bytes after a write, subsequent writes cooperatively
/// wait for the buffer to drain before returning.
pub const HIGH_WATER_MARK: usize = 256 * 1024;

/// How often a pending write polls the host's buffered-amount while
/// waiting to drain.
pub const DRAIN_POLL_INTERVAL: Duration = Duration::from_millis(10);

/// Byte cap for a [`PendingReceiver`]'s race buffer.
pub const PENDING_RECEIVER_BYTE_CAP: u32 = 2 * 1024 * 1024;

/// TTL for a [`PendingReceiver`] that is never claimed by a `create_receiver`.
pub const PENDING_RECEIVER_TTL: Duration = Duration::from_secs(5);

/// The primitives a host SRPC connection (a `Stream` on the server or the
/// single connection owned by an `SrpcClient`) exposes to substreams layered
/// on top of it.
pub trait HostStream: Send + Sync {
    fn write(&self, substream_id: u32, chunk: Vec<u8>);
    fn finish(&self, substream_id: u32);
    fn destroy(&self, substream_id: u32, error: Option<String>);
    fn buffered_amount(&self) -> usize;
}

/// An event delivered to a receiver, in sender order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReceiverEvent {
    Data(Vec<u8>),
    Finish,
    Destroy(Option<String>),
}

struct PendingReceiver {
    chunks: VecDeque<Vec<u8>>,
    bytes: u32,
    finished: bool,
    destroyed_error: Option<String>,
    latched: bool,
    created_at: std::time::Instant,
}

impl PendingReceiver {
    fn new() -> Self {
        Self {
            chunks: VecDeque::new(),
            bytes: 0,
            finished: false,
            destroyed_error: None,
            latched: false,
            created_at: std::time::Instant::now(),
        }
    }

    fn is_expired(&self) -> bool {
        self.created_at.elapsed() >= PENDING_RECEIVER_TTL
    }
}

/// A handle to write to one substream; the write side of a [`ByteSubstream`]
/// pair.
pub struct ByteSubstreamSender {
    id: SubstreamId,
    host: Arc<dyn HostStream>,
    manager: Arc<SubstreamManagerInner>,
}

impl ByteSubstreamSender {
    pub fn id(&self) -> SubstreamId {
        self.id
    }

    /// Forwards `chunk` to the host connection. If the host's buffered
    /// amount is at or above [`HIGH_WATER_MARK`] right after the write, this
    /// call cooperatively waits (polling every [`DRAIN_POLL_INTERVAL`]) until
    /// it drops back below the mark before returning. No data is ever
    /// dropped; backpressure only delays the caller.
    pub async fn write(&self, chunk: Vec<u8>) {
        self.host.write(self.id.as_u32(), chunk);
        while self.host.buffered_amount() >= HIGH_WATER_MARK {
            if self.manager.is_destroyed(self.id) {
                return;
            }
            tokio::time::sleep(DRAIN_POLL_INTERVAL).await;
        }
    }

    pub fn end(&self) {
        self.host.finish(self.id.as_u32());
        self.manager.remove_sender(self.id);
    }

    /// Destroys the substream locally and, unless the destroy was itself
    /// caused by an inbound remote destroy signal, notifies the host so the
    /// remote peer also tears its side down.
    pub fn destroy(&self, error: Option<String>) {
        if self.manager.mark_destroyed_locally(self.id) {
            self.host.destroy(self.id.as_u32(), error);
        }
    }
}

/// The read side of a [`ByteSubstream`] pair. Chunks arrive in sender order;
/// `None` marks a clean finish.
pub struct ByteSubstreamReceiver {
    id: SubstreamId,
    rx: mpsc::UnboundedReceiver<ReceiverEvent>,
    manager: Arc<SubstreamManagerInner>,
}

impl ByteSubstreamReceiver {
    pub fn id(&self) -> SubstreamId {
        self.id
    }

    /// Awaits the next event. Returns `Ok(None)` once the stream has
    /// finished cleanly; `Err` if it was destroyed (locally, remotely, or by
    /// a latched pending-receiver violation).
    pub async fn recv(&mut self) -> Result<Option<Vec<u8>>> {
        match self.rx.recv().await {
            Some(ReceiverEvent::Data(bytes)) => Ok(Some(bytes)),
            Some(ReceiverEvent::Finish) | None => Ok(None),
            Some(ReceiverEvent::Destroy(error)) => Err(SrpcError::PipeError {
                side: PipeSide::Input,
                cause: error.unwrap_or_else(|| "substream destroyed".to_string()),
            }),
        }
    }
}

impl Drop for ByteSubstreamReceiver {
    fn drop(&mut self) {
        self.manager.remove_receiver(self.id);
    }
}

struct SubstreamManagerInner {
    host: Arc<dyn HostStream>,
    next_id: AtomicU32,
    parity_step: u32,
    senders: StdMutex<std::collections::HashSet<SubstreamId>>,
    receivers: StdMutex<HashMap<SubstreamId, mpsc::UnboundedSender<ReceiverEvent>>>,
    pending: StdMutex<HashMap<SubstreamId, PendingReceiver>>,
    destroyed: StdMutex<std::collections::HashSet<SubstreamId>>,
    destroyed_by_remote: StdMutex<std::collections::HashSet<SubstreamId>>,
}

impl SubstreamManagerInner {
    fn is_destroyed(&self, id: SubstreamId) -> bool {
        self.destroyed.lock().unwrap().contains(&id)
    }

    fn remove_sender(&self, id: SubstreamId) {
        self.senders.lock().unwrap().remove(&id);
    }

    fn remove_receiver(&self, id: SubstreamId) {
        self.receivers.lock().unwrap().remove(&id);
    }

    /// Marks `id` destroyed. Returns `true` iff this call should still
    /// notify the host (i.e. the destroy was not itself triggered by an
    /// inbound remote signal).
    fn mark_destroyed_locally(&self, id: SubstreamId) -> bool {
        self.destroyed.lock().unwrap().insert(id);
        !self.destroyed_by_remote.lock().unwrap().contains(&id)
    }

    fn mark_destroyed_by_remote(&self, id: SubstreamId) {
        self.destroyed.lock().unwrap().insert(id);
        self.destroyed_by_remote.lock().unwrap().insert(id);
    }
}

/// Owns substream id allocation and the sender/receiver/pending-receiver
/// registries for one side of one SRPC connection.
#[derive(Clone)]
pub struct SubstreamManager {
    inner: Arc<SubstreamManagerInner>,
}

impl SubstreamManager {
    pub fn new(host: Arc<dyn HostStream>, parity: SubstreamParity) -> Self {
        Self {
            inner: Arc::new(SubstreamManagerInner {
                host,
                next_id: AtomicU32::new(parity.first().as_u32()),
                parity_step: 2,
                senders: StdMutex::new(std::collections::HashSet::new()),
                receivers: StdMutex::new(HashMap::new()),
                pending: StdMutex::new(HashMap::new()),
                destroyed: StdMutex::new(std::collections::HashSet::new()),
                destroyed_by_remote: StdMutex::new(std::collections::HashSet::new()),
            }),
        }
    }

    /// Allocates a fresh sender-side substream id for this side of the
    /// connection and returns its handle.
    pub fn new_sender(&self) -> ByteSubstreamSender {
        let raw = self.inner.next_id.fetch_add(self.inner.parity_step, Ordering::SeqCst);
        let id = SubstreamId::new(raw);
        self.inner.senders.lock().unwrap().insert(id);
        ByteSubstreamSender {
            id,
            host: self.inner.host.clone(),
            manager: self.inner.clone(),
        }
    }

    /// Creates a receiver for `id`. Fails if one already exists for `id`.
    /// Any data/finish/destroy that raced ahead of creation (buffered in a
    /// [`PendingReceiver`]) is replayed immediately, in order.
    pub fn create_receiver(&self, id: SubstreamId) -> Result<ByteSubstreamReceiver> {
        let mut receivers = self.inner.receivers.lock().unwrap();
        if receivers.contains_key(&id) {
            return Err(SrpcError::ProtocolError {
                reason: format!("substream receiver {id} already exists"),
            });
        }
        let (tx, rx) = mpsc::unbounded_channel();

        if let Some(pending) = self.inner.pending.lock().unwrap().remove(&id) {
            for chunk in pending.chunks {
                let _ = tx.send(ReceiverEvent::Data(chunk));
            }
            if let Some(error) = pending.destroyed_error {
                let _ = tx.send(ReceiverEvent::Destroy(Some(error)));
            } else if pending.finished {
                let _ = tx.send(ReceiverEvent::Finish);
            }
        }

        receivers.insert(id, tx);
        Ok(ByteSubstreamReceiver {
            id,
            rx,
            manager: self.inner.clone(),
        })
    }

    /// Dispatches an inbound `write` for `id`: forwards to an existing
    /// receiver, or buffers it in a [`PendingReceiver`] (subject to its byte
    /// cap) if the receiver hasn't been created yet.
    pub fn handle_incoming_write(&self, id: SubstreamId, chunk: Vec<u8>) {
        if let Some(tx) = self.inner.receivers.lock().unwrap().get(&id) {
            let _ = tx.send(ReceiverEvent::Data(chunk));
            return;
        }

        let mut pending_map = self.inner.pending.lock().unwrap();
        let pending = pending_map.entry(id).or_insert_with(PendingReceiver::new);
        if pending.latched {
            return; // already latched into an error state; further writes drop
        }
        let incoming_len = chunk.len() as u32;
        if pending.bytes.saturating_add(incoming_len) > PENDING_RECEIVER_BYTE_CAP {
            pending.latched = true;
            pending.destroyed_error = Some(
                SrpcError::PendingReceiverOverflow { substream_id: id.as_u32() }.to_string(),
            );
            return;
        }
        pending.bytes += incoming_len;
        pending.chunks.push_back(chunk);
    }

    pub fn handle_incoming_finish(&self, id: SubstreamId) {
        if let Some(tx) = self.inner.receivers.lock().unwrap().get(&id) {
            let _ = tx.send(ReceiverEvent::Finish);
            return;
        }
        let mut pending_map = self.inner.pending.lock().unwrap();
        let pending = pending_map.entry(id).or_insert_with(PendingReceiver::new);
        if !pending.latched {
            pending.finished = true;
        }
    }

    /// Dispatches a remote destroy signal: resolves to a receiver first
    /// (cancel of incoming data), then a sender (peer refusing more data);
    /// if neither exists yet, buffers the signal like a write.
    pub fn handle_incoming_destroy(&self, id: SubstreamId, error: Option<String>) {
        if let Some(tx) = self.inner.receivers.lock().unwrap().get(&id) {
            self.inner.mark_destroyed_by_remote(id);
            let _ = tx.send(ReceiverEvent::Destroy(error));
            return;
        }
        if self.inner.senders.lock().unwrap().contains(&id) {
            self.inner.mark_destroyed_by_remote(id);
            self.inner.remove_sender(id);
            return;
        }

        let mut pending_map = self.inner.pending.lock().unwrap();
        let pending = pending_map.entry(id).or_insert_with(PendingReceiver::new);
        pending.latched = true;
        pending.destroyed_error =
            Some(error.unwrap_or_else(|| "substream destroyed before creation".to_string()));
    }

    /// Locally destroys every live sender and receiver (host connection
    /// disconnected); releases anything waiting to drain.
    pub fn handle_disconnect(&self) {
        let receiver_ids: Vec<_> = self.inner.receivers.lock().unwrap().keys().copied().collect();
        for id in receiver_ids {
            if let Some(tx) = self.inner.receivers.lock().unwrap().get(&id) {
                let _ = tx.send(ReceiverEvent::Destroy(Some("connection closed".to_string())));
            }
            self.inner.destroyed.lock().unwrap().insert(id);
        }
        let sender_ids: Vec<_> = self.inner.senders.lock().unwrap().iter().copied().collect();
        for id in sender_ids {
            self.inner.destroyed.lock().unwrap().insert(id);
        }
    }

    /// Sweeps pending receivers whose TTL has elapsed, latching them into an
    /// expired error state. Intended to run on a periodic background tick.
    pub fn expire_pending(&self) {
        let mut pending_map = self.inner.pending.lock().unwrap();
        for (id, pending) in pending_map.iter_mut() {
            if !pending.latched && pending.is_expired() {
                pending.latched = true;
                pending.destroyed_error =
                    Some(SrpcError::PendingReceiverExpired { substream_id: id.as_u32() }.to_string());
            }
        }
    }

    #[cfg(test)]
    fn pending_len(&self, id: SubstreamId) -> Option<usize> {
        self.inner.pending.lock().unwrap().get(&id).map(|p| p.chunks.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize as StdAtomicUsize;

    struct FakeHost {
        buffered: StdAtomicUsize,
        written: StdMutex<Vec<(u32, Vec<u8>)>>,
        finished: StdMutex<Vec<u32>>,
        destroyed: StdMutex<Vec<(u32, Option<String>)>>,
    }

    impl FakeHost {
        fn new() -> Arc<Self> {
            Arc::new(Self {
                buffered: StdAtomicUsize::new(0),
                written: StdMutex::new(Vec::new()),
                finished: StdMutex::new(Vec::new()),
                destroyed: StdMutex::new(Vec::new()),
            })
        }
    }

    impl HostStream for FakeHost {
        fn write(&self, substream_id: u32, chunk: Vec<u8>) {
            self.written.lock().unwrap().push((substream_id, chunk));
        }
        fn finish(&self, substream_id: u32) {
            self.finished.lock().unwrap().push(substream_id);
        }
        fn destroy(&self, substream_id: u32, error: Option<String>) {
            self.destroyed.lock().unwrap().push((substream_id, error));
        }
        fn buffered_amount(&self) -> usize {
            self.buffered.load(Ordering::SeqCst)
        }
    }

    #[test]
    fn sender_ids_follow_parity_and_step_by_two() {
        let host = FakeHost::new();
        let manager = SubstreamManager::new(host, SubstreamParity::Odd);
        assert_eq!(manager.new_sender().id(), SubstreamId::new(1));
        assert_eq!(manager.new_sender().id(), SubstreamId::new(3));

        let host2 = FakeHost::new();
        let manager2 = SubstreamManager::new(host2, SubstreamParity::Even);
        assert_eq!(manager2.new_sender().id(), SubstreamId::new(2));
        assert_eq!(manager2.new_sender().id(), SubstreamId::new(4));
    }

    #[tokio::test]
    async fn chunks_arrive_in_order_when_receiver_pre_exists() {
        let host = FakeHost::new();
        let manager = SubstreamManager::new(host, SubstreamParity::Odd);
        let id = SubstreamId::new(7);
        let mut receiver = manager.create_receiver(id).unwrap();

        manager.handle_incoming_write(id, vec![1]);
        manager.handle_incoming_write(id, vec![2]);
        manager.handle_incoming_write(id, vec![3]);
        manager.handle_incoming_finish(id);

        assert_eq!(receiver.recv().await.unwrap(), Some(vec![1]));
        assert_eq!(receiver.recv().await.unwrap(), Some(vec![2]));
        assert_eq!(receiver.recv().await.unwrap(), Some(vec![3]));
        assert_eq!(receiver.recv().await.unwrap(), None);
    }

    #[tokio::test]
    async fn data_racing_ahead_of_creation_is_buffered_then_replayed() {
        let host = FakeHost::new();
        let manager = SubstreamManager::new(host, SubstreamParity::Odd);
        let id = SubstreamId::new(9);

        manager.handle_incoming_write(id, vec![10]);
        manager.handle_incoming_write(id, vec![20]);
        assert_eq!(manager.pending_len(id), Some(2));

        let mut receiver = manager.create_receiver(id).unwrap();
        assert_eq!(receiver.recv().await.unwrap(), Some(vec![10]));
        assert_eq!(receiver.recv().await.unwrap(), Some(vec![20]));
    }

    #[test]
    fn create_receiver_twice_for_same_id_fails() {
        let host = FakeHost::new();
        let manager = SubstreamManager::new(host, SubstreamParity::Odd);
        let id = SubstreamId::new(11);
        let _first = manager.create_receiver(id).unwrap();
        assert!(manager.create_receiver(id).is_err());
    }

    #[test]
    fn pending_receiver_overflow_latches_at_cap_plus_one() {
        let host = FakeHost::new();
        let manager = SubstreamManager::new(host, SubstreamParity::Odd);
        let id = SubstreamId::new(13);

        manager.handle_incoming_write(id, vec![0u8; PENDING_RECEIVER_BYTE_CAP as usize]);
        // Exactly at the cap: not yet latched.
        {
            let pending = manager.inner.pending.lock().unwrap();
            assert!(!pending.get(&id).unwrap().latched);
        }
        manager.handle_incoming_write(id, vec![0u8; 1]);
        {
            let pending = manager.inner.pending.lock().unwrap();
            assert!(pending.get(&id).unwrap().latched);
        }
    }

    #[tokio::test]
    async fn overflowed_pending_receiver_errors_on_creation() {
        let host = FakeHost::new();
        let manager = SubstreamManager::new(host, SubstreamParity::Odd);
        let id = SubstreamId::new(15);

        manager.handle_incoming_write(id, vec![0u8; PENDING_RECEIVER_BYTE_CAP as usize + 1]);
        let mut receiver = manager.create_receiver(id).unwrap();
        assert!(receiver.recv().await.is_err());
    }

    #[tokio::test]
    async fn expire_pending_latches_ttl_violation() {
        let host = FakeHost::new();
        let manager = SubstreamManager::new(host, SubstreamParity::Odd);
        let id = SubstreamId::new(17);
        manager.handle_incoming_write(id, vec![1]);

        // Not yet expired.
        manager.expire_pending();
        {
            let pending = manager.inner.pending.lock().unwrap();
            assert!(!pending.get(&id).unwrap().latched);
        }

        // Force expiry by rewriting created_at into the past.
        {
            let mut pending = manager.inner.pending.lock().unwrap();
            pending.get_mut(&id).unwrap().created_at =
                std::time::Instant::now() - PENDING_RECEIVER_TTL - Duration::from_millis(1);
        }
        manager.expire_pending();

        let mut receiver = manager.create_receiver(id).unwrap();
        assert!(matches!(
            receiver.recv().await,
            Err(SrpcError::PendingReceiverExpired { .. })
        ));
    }

    #[tokio::test]
    async fn remote_destroy_prefers_receiver_over_sender() {
        let host = FakeHost::new();
        let manager = SubstreamManager::new(host.clone(), SubstreamParity::Odd);
        let id = SubstreamId::new(19);
        let mut receiver = manager.create_receiver(id).unwrap();

        manager.handle_incoming_destroy(id, Some("remote cancel".to_string()));

        let err = receiver.recv().await.unwrap_err();
        assert!(matches!(err, SrpcError::PipeError { .. }));
    }

    #[tokio::test]
    async fn sender_destroy_does_not_loop_back_to_host_when_remote_caused() {
        let host = FakeHost::new();
        let manager = SubstreamManager::new(host.clone(), SubstreamParity::Odd);
        let sender = manager.new_sender();
        let id = sender.id();

        manager.handle_incoming_destroy(id, Some("peer refused".to_string()));
        assert!(host.destroyed.lock().unwrap().is_empty());

        // A local destroy() call after the fact must not double-notify the
        // host either, since the manager already recorded it as remote-caused.
        sender.destroy(Some("local cleanup".to_string()));
        assert!(host.destroyed.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn local_destroy_without_remote_cause_notifies_host() {
        let host = FakeHost::new();
        let manager = SubstreamManager::new(host.clone(), SubstreamParity::Odd);
        let sender = manager.new_sender();
        sender.destroy(Some("oops".to_string()));

        let destroyed = host.destroyed.lock().unwrap();
        assert_eq!(destroyed.len(), 1);
        assert_eq!(destroyed[0].1.as_deref(), Some("oops"));
    }

    #[tokio::test]
    async fn disconnect_destroys_every_live_receiver() {
        let host = FakeHost::new();
        let manager = SubstreamManager::new(host, SubstreamParity::Odd);
        let id = SubstreamId::new(21);
        let mut receiver = manager.create_receiver(id).unwrap();

        manager.handle_disconnect();

        assert!(receiver.recv().await.is_err());
    }
}
