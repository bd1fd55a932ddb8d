//! Small pieces shared by the server and client connection loops: the
//! single-writer-task discipline (one task owns the socket; every other
//! task sends through a channel) and the buffered-byte accounting
//! [`crate::substream`] backpressure reads from.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::Message;

pub(crate) fn message_len(message: &Message) -> usize {
    match message {
        Message::Binary(bytes) => bytes.len(),
        _ => 0,
    }
}

/// Drains `rx` onto `sink`, one message at a time, decrementing `buffered`
/// after each successful write. The only task permitted to write to this
/// connection's socket.
pub(crate) async fn writer_loop<Si>(
    mut sink: Si,
    mut rx: mpsc::UnboundedReceiver<Message>,
    buffered: Arc<AtomicUsize>,
) where
    Si: futures_util::Sink<Message> + Unpin,
{
    use futures_util::SinkExt;

    while let Some(message) = rx.recv().await {
        let len = message_len(&message);
        let is_close = matches!(message, Message::Close(_));
        if sink.send(message).await.is_err() {
            break;
        }
        buffered.fetch_sub(len.min(buffered.load(Ordering::SeqCst)), Ordering::SeqCst);
        if is_close {
            break;
        }
    }
}
