//! Message-oriented duplex channel
// (c) 2024 Ross Younger
//!
//! A [`Channel`] carries whole [`Message`]s in both directions. It is what the measurement
//! engine talks to; it does not care whether there is a WebSocket on the other side
//! ([`websocket::attach`]) or another task in the same process ([`Channel::pair`]).
//!
//! Sending is cheap to share: clone a [`ChannelSender`] into as many tasks as you like.
//! A send over a WebSocket completes only once the frame has been written to the socket,
//! so a sender can count what it sent without overtaking the connection.
//! The receive half is shared behind an async mutex, so several tasks may take turns
//! receiving; each message goes to exactly one of them.

pub mod websocket;

use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use serde::Serialize;
use tokio::sync::{mpsc, oneshot, Mutex};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::protocol::control::ControlMessage;

/// One whole message
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Message {
    /// Structured data (JSON)
    Text(String),
    /// Payload
    Binary(Bytes),
}

impl Message {
    /// Wraps a control message
    #[must_use]
    pub fn control(msg: &ControlMessage) -> Self {
        Self::Text(msg.to_json())
    }

    /// Attempts to interpret this message as a control message.
    /// Returns `None` for binary messages and for text that isn't a control message.
    #[must_use]
    pub fn as_control(&self) -> Option<ControlMessage> {
        match self {
            Message::Text(text) => ControlMessage::from_json(text).ok(),
            Message::Binary(_) => None,
        }
    }

    /// Payload length in bytes
    #[must_use]
    pub fn len(&self) -> usize {
        match self {
            Message::Text(text) => text.len(),
            Message::Binary(data) => data.len(),
        }
    }

    /// Is the message empty?
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Things that can go wrong on a [`Channel`]
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ChannelError {
    /// The channel was closed, by us or by the other end
    #[error("channel closed")]
    Closed,
    /// A send or receive did not complete in time
    #[error("channel operation timed out")]
    Timeout,
    /// A message could not be encoded
    #[error("malformed message: {0}")]
    Malformed(String),
}

/// A message in transit, with an optional notification once it has been written out
#[derive(Debug)]
pub(crate) struct Envelope {
    pub(crate) msg: Message,
    pub(crate) written: Option<oneshot::Sender<()>>,
}

impl From<Message> for Envelope {
    fn from(msg: Message) -> Self {
        Self { msg, written: None }
    }
}

/// The sending half of a [`Channel`]
#[derive(Debug, Clone)]
pub struct ChannelSender {
    tx: mpsc::Sender<Envelope>,
    shutdown: CancellationToken,
    send_timeout: Option<Duration>,
    /// Wait for the write to complete, not just for queue space
    confirm: bool,
}

impl ChannelSender {
    /// Sends a message.
    ///
    /// Waits for buffer space; on a confirming channel, also waits until the message has been written.
    pub async fn send(&self, msg: Message) -> Result<(), ChannelError> {
        if self.shutdown.is_cancelled() {
            return Err(ChannelError::Closed);
        }
        match self.send_timeout {
            Some(limit) => tokio::time::timeout(limit, self.deliver(msg))
                .await
                .map_err(|_| ChannelError::Timeout)?,
            None => self.deliver(msg).await,
        }
    }

    async fn deliver(&self, msg: Message) -> Result<(), ChannelError> {
        let (written, done) = if self.confirm {
            let (tx, rx) = oneshot::channel();
            (Some(tx), Some(rx))
        } else {
            (None, None)
        };
        self.tx
            .send(Envelope { msg, written })
            .await
            .map_err(|_| ChannelError::Closed)?;
        if let Some(done) = done {
            // the writer drops the notifier if the write fails
            done.await.map_err(|_| ChannelError::Closed)?;
        }
        Ok(())
    }

    /// Sends a control message
    pub async fn send_control(&self, msg: &ControlMessage) -> Result<(), ChannelError> {
        self.send(Message::control(msg)).await
    }

    /// Serializes a value to JSON and sends it as a text message
    pub async fn send_json<T: Serialize>(&self, value: &T) -> Result<(), ChannelError> {
        let text =
            serde_json::to_string(value).map_err(|e| ChannelError::Malformed(e.to_string()))?;
        self.send(Message::Text(text)).await
    }
}

/// The receiving half of a [`Channel`]
#[derive(Debug, Clone)]
pub struct ChannelReceiver {
    rx: Arc<Mutex<mpsc::Receiver<Envelope>>>,
}

impl ChannelReceiver {
    /// Waits for the next message
    pub async fn recv(&self) -> Result<Message, ChannelError> {
        let envelope = self.rx.lock().await.recv().await.ok_or(ChannelError::Closed)?;
        Ok(envelope.msg)
    }

    /// Waits for the next message, for at most `limit`
    pub async fn recv_timeout(&self, limit: Duration) -> Result<Message, ChannelError> {
        tokio::time::timeout(limit, self.recv())
            .await
            .map_err(|_| ChannelError::Timeout)?
    }

    /// Waits for the next message, giving up at `deadline`
    pub async fn recv_until(&self, deadline: Instant) -> Result<Message, ChannelError> {
        tokio::time::timeout_at(deadline, self.recv())
            .await
            .map_err(|_| ChannelError::Timeout)?
    }
}

/// A message-oriented duplex channel
#[derive(Debug)]
pub struct Channel {
    sender: ChannelSender,
    receiver: ChannelReceiver,
    /// Outbound pump, if there is one; awaited on close so queued messages are flushed
    pump: Option<JoinHandle<()>>,
}

impl Channel {
    /// `confirm` makes every send wait for the `pump` to report the message written
    pub(crate) fn from_parts(
        tx: mpsc::Sender<Envelope>,
        rx: mpsc::Receiver<Envelope>,
        shutdown: CancellationToken,
        pump: Option<JoinHandle<()>>,
        confirm: bool,
    ) -> Self {
        Self {
            sender: ChannelSender {
                tx,
                shutdown,
                send_timeout: None,
                confirm,
            },
            receiver: ChannelReceiver {
                rx: Arc::new(Mutex::new(rx)),
            },
            pump,
        }
    }

    /// Creates two connected in-memory endpoints.
    ///
    /// Each direction buffers up to `capacity` messages; a sender blocks while the buffer is full.
    /// A send completes as soon as the message is buffered.
    #[must_use]
    pub fn pair(capacity: usize) -> (Self, Self) {
        let (tx_a, rx_b) = mpsc::channel(capacity);
        let (tx_b, rx_a) = mpsc::channel(capacity);
        (
            Self::from_parts(tx_a, rx_a, CancellationToken::new(), None, false),
            Self::from_parts(tx_b, rx_b, CancellationToken::new(), None, false),
        )
    }

    /// Applies a deadline to every send made through this channel (and senders subsequently
    /// obtained from it)
    #[must_use]
    pub fn with_send_timeout(mut self, limit: Duration) -> Self {
        self.sender.send_timeout = Some(limit);
        self
    }

    /// A cloneable handle for sending
    #[must_use]
    pub fn sender(&self) -> ChannelSender {
        self.sender.clone()
    }

    /// A cloneable handle for receiving
    #[must_use]
    pub fn receiver(&self) -> ChannelReceiver {
        self.receiver.clone()
    }

    /// Sends a message
    pub async fn send(&self, msg: Message) -> Result<(), ChannelError> {
        self.sender.send(msg).await
    }

    /// Sends a control message
    pub async fn send_control(&self, msg: &ControlMessage) -> Result<(), ChannelError> {
        self.sender.send_control(msg).await
    }

    /// Serializes a value to JSON and sends it
    pub async fn send_json<T: Serialize>(&self, value: &T) -> Result<(), ChannelError> {
        self.sender.send_json(value).await
    }

    /// Waits for the next message
    pub async fn recv(&self) -> Result<Message, ChannelError> {
        self.receiver.recv().await
    }

    /// Waits for the next message, for at most `limit`
    pub async fn recv_timeout(&self, limit: Duration) -> Result<Message, ChannelError> {
        self.receiver.recv_timeout(limit).await
    }

    /// Closes the channel.
    ///
    /// Messages already queued are delivered first. Any sender handles still held elsewhere
    /// fail with [`ChannelError::Closed`] from now on.
    pub async fn close(mut self) {
        self.sender.shutdown.cancel();
        if let Some(pump) = self.pump.take() {
            let _ = pump.await;
        }
    }
}

#[cfg(test)]
mod test {
    use std::time::Duration;

    use bytes::Bytes;

    use super::{Channel, ChannelError, Message};
    use crate::protocol::control::ControlMessage;

    #[tokio::test]
    async fn pair_carries_both_kinds() {
        let (a, b) = Channel::pair(4);
        a.send_control(&ControlMessage::Complete).await.unwrap();
        a.send(Message::Binary(Bytes::from_static(b"hello")))
            .await
            .unwrap();

        let first = b.recv().await.unwrap();
        assert_eq!(first.as_control(), Some(ControlMessage::Complete));
        let second = b.recv().await.unwrap();
        assert_eq!(second, Message::Binary(Bytes::from_static(b"hello")));
        assert_eq!(second.len(), 5);
        assert_eq!(second.as_control(), None);
    }

    #[tokio::test(start_paused = true)]
    async fn silent_peer_times_out() {
        let (a, _b) = Channel::pair(1);
        let result = a.recv_timeout(Duration::from_secs(5)).await;
        assert_eq!(result, Err(ChannelError::Timeout));
    }

    #[tokio::test(start_paused = true)]
    async fn full_buffer_send_times_out() {
        let (a, _b) = Channel::pair(1);
        let a = a.with_send_timeout(Duration::from_millis(100));
        a.send(Message::Text("one".into())).await.unwrap();
        let result = a.send(Message::Text("two".into())).await;
        assert_eq!(result, Err(ChannelError::Timeout));
    }

    #[tokio::test]
    async fn closing_is_seen_by_peer() {
        let (a, b) = Channel::pair(4);
        let sender = a.sender();
        a.send(Message::Text("last words".into())).await.unwrap();
        a.close().await;

        // our own leftover handle refuses
        assert_eq!(
            sender.send(Message::Text("too late".into())).await,
            Err(ChannelError::Closed)
        );
        drop(sender);

        // the peer drains what was queued, then sees the close
        assert_eq!(b.recv().await.unwrap(), Message::Text("last words".into()));
        assert_eq!(b.recv().await, Err(ChannelError::Closed));
        assert_eq!(b.send(Message::Text("hello?".into())).await, Err(ChannelError::Closed));
    }

    #[tokio::test]
    async fn receivers_take_turns() {
        let (a, b) = Channel::pair(8);
        let r1 = b.receiver();
        let r2 = b.receiver();
        for i in 0..4u8 {
            a.send(Message::Binary(Bytes::from(vec![i]))).await.unwrap();
        }
        let mut seen = Vec::new();
        for r in [&r1, &r2, &r1, &r2] {
            if let Message::Binary(data) = r.recv().await.unwrap() {
                seen.push(data[0]);
            }
        }
        assert_eq!(seen, vec![0, 1, 2, 3]);
    }

    #[tokio::test]
    async fn send_json_is_text() {
        let (a, b) = Channel::pair(1);
        a.send_json(&serde_json::json!({"type": "result", "latency": 1.5}))
            .await
            .unwrap();
        let Message::Text(text) = b.recv().await.unwrap() else {
            panic!("expected text");
        };
        let value: serde_json::Value = serde_json::from_str(&text).unwrap();
        assert_eq!(value["type"], "result");
    }
}
