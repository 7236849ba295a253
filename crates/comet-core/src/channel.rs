//! Channel abstraction for Comet.
//!
//! A channel is the live delivery endpoint for one subscriber key. It fans a
//! pushed message out to every attached subscriber connection, enforces the
//! per-key subscriber limit, and tears itself down on close, detaching from the
//! registry that created it.
//!
//! Two backings exist, one per transport: [`WebSocketChannel`] renders messages
//! as JSON text frames, [`TcpChannel`] as length-prefixed binary frames. Both
//! share the same subscriber bookkeeping.

use async_trait::async_trait;
use comet_protocol::{codec, ProtocolError, TcpFrame};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::{debug, trace, warn};

use crate::message::Message;
use crate::registry::RegistryLink;
use crate::subscriber::{Outbound, Subscriber, SubscriberId};

/// Registry-assigned identity of a channel instance.
///
/// Keys can be re-created after a close; the id tells the instances apart.
pub type ChannelId = u64;

/// Transport protocol of a channel.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Protocol {
    /// WebSocket subscribers, JSON text frames.
    #[default]
    WebSocket,
    /// Raw TCP subscribers, length-prefixed MessagePack frames.
    Tcp,
}

impl fmt::Display for Protocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Protocol::WebSocket => f.write_str("websocket"),
            Protocol::Tcp => f.write_str("tcp"),
        }
    }
}

/// Channel errors.
#[derive(Debug, Error)]
pub enum ChannelError {
    /// The channel has been closed.
    #[error("Channel closed: {0}")]
    Closed(String),

    /// The per-key subscriber limit is reached.
    #[error("Exceeded the max subscriber connections ({max}) for key {key}")]
    LimitExceeded {
        /// Channel key.
        key: String,
        /// Configured limit.
        max: usize,
    },

    /// A subscriber of the wrong transport tried to attach.
    #[error("Subscriber protocol {actual} does not match channel protocol {expected}")]
    ProtocolMismatch {
        /// Protocol of the channel.
        expected: Protocol,
        /// Protocol of the subscriber.
        actual: Protocol,
    },

    /// Delivery failed on one or more subscriber connections.
    #[error("Push to key {key} failed on {failed} of {total} subscribers")]
    PushFailed {
        /// Channel key.
        key: String,
        /// Connections the write failed on.
        failed: usize,
        /// Connections attempted.
        total: usize,
    },

    /// One or more subscriber connections failed to close cleanly.
    #[error("Close of key {key} failed on {failed} of {total} subscribers")]
    CloseFailed {
        /// Channel key.
        key: String,
        /// Connections that failed to close.
        failed: usize,
        /// Connections closed.
        total: usize,
    },

    /// The message could not be encoded for the transport.
    #[error("Encoding error: {0}")]
    Encode(#[from] ProtocolError),
}

/// A per-key delivery endpoint.
#[async_trait]
pub trait Channel: Send + Sync + fmt::Debug {
    /// The key this channel delivers for.
    fn key(&self) -> &str;

    /// Registry-assigned identity of this instance.
    fn id(&self) -> ChannelId;

    /// Transport protocol of the channel.
    fn protocol(&self) -> Protocol;

    /// Check whether the channel has been closed.
    fn is_closed(&self) -> bool;

    /// Number of attached subscribers.
    async fn subscriber_count(&self) -> usize;

    /// Attach a subscriber connection.
    ///
    /// # Errors
    ///
    /// Fails if the channel is closed, the subscriber speaks another protocol,
    /// or the subscriber limit is reached.
    async fn attach(&self, subscriber: Arc<dyn Subscriber>) -> Result<SubscriberId, ChannelError>;

    /// Detach a subscriber connection without closing it.
    ///
    /// Returns `true` if the subscriber was attached.
    async fn detach(&self, id: SubscriberId) -> bool;

    /// Deliver a message to every attached subscriber.
    ///
    /// Returns the number of subscribers the message reached. A channel with no
    /// subscribers accepts the message and reaches nobody.
    ///
    /// # Errors
    ///
    /// Fails if the channel is closed, the message cannot be encoded, or any
    /// subscriber write fails.
    async fn push_msg(&self, message: Message) -> Result<usize, ChannelError>;

    /// Close the channel, every subscriber connection, and detach from the registry.
    ///
    /// Closing an already closed channel is a no-op.
    ///
    /// # Errors
    ///
    /// Returns [`ChannelError::CloseFailed`] when some connections failed to
    /// close; the remaining connections are still closed.
    async fn close(&self) -> Result<(), ChannelError>;
}

/// Subscriber bookkeeping shared by both channel backings.
struct Subscribers {
    key: String,
    id: ChannelId,
    protocol: Protocol,
    max: usize,
    closed: AtomicBool,
    next_subscriber: AtomicU64,
    conns: Mutex<HashMap<SubscriberId, Arc<dyn Subscriber>>>,
    link: RegistryLink,
}

impl Subscribers {
    fn new(key: String, id: ChannelId, protocol: Protocol, max: usize, link: RegistryLink) -> Self {
        Self {
            key,
            id,
            protocol,
            max,
            closed: AtomicBool::new(false),
            next_subscriber: AtomicU64::new(1),
            conns: Mutex::new(HashMap::new()),
            link,
        }
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    async fn count(&self) -> usize {
        self.conns.lock().await.len()
    }

    async fn attach(&self, subscriber: Arc<dyn Subscriber>) -> Result<SubscriberId, ChannelError> {
        if subscriber.protocol() != self.protocol {
            return Err(ChannelError::ProtocolMismatch {
                expected: self.protocol,
                actual: subscriber.protocol(),
            });
        }

        let mut conns = self.conns.lock().await;
        if self.is_closed() {
            return Err(ChannelError::Closed(self.key.clone()));
        }
        if conns.len() >= self.max {
            return Err(ChannelError::LimitExceeded {
                key: self.key.clone(),
                max: self.max,
            });
        }

        let id = self.next_subscriber.fetch_add(1, Ordering::Relaxed);
        conns.insert(id, subscriber);
        debug!(key = %self.key, subscriber = id, subscribers = conns.len(), "Subscriber attached");
        Ok(id)
    }

    async fn detach(&self, id: SubscriberId) -> bool {
        let removed = self.conns.lock().await.remove(&id).is_some();
        if removed {
            debug!(key = %self.key, subscriber = id, "Subscriber detached");
        }
        removed
    }

    async fn push(&self, payload: Outbound) -> Result<usize, ChannelError> {
        let mut conns = self.conns.lock().await;
        if self.is_closed() {
            return Err(ChannelError::Closed(self.key.clone()));
        }

        let total = conns.len();
        let mut broken = Vec::new();
        for (id, conn) in conns.iter() {
            if let Err(e) = conn.send(payload.clone()).await {
                warn!(key = %self.key, subscriber = id, error = %e, "Push to subscriber failed");
                broken.push(*id);
            }
        }

        // A connection that failed a write is dead to this channel.
        for id in &broken {
            conns.remove(id);
        }

        trace!(key = %self.key, delivered = total - broken.len(), total, "Pushed message");

        if broken.is_empty() {
            Ok(total)
        } else {
            Err(ChannelError::PushFailed {
                key: self.key.clone(),
                failed: broken.len(),
                total,
            })
        }
    }

    async fn close(&self) -> Result<(), ChannelError> {
        if self.closed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }

        self.link.detach(&self.key, self.id);

        let conns: Vec<_> = self.conns.lock().await.drain().collect();
        let total = conns.len();
        let mut failed = 0;
        for (id, conn) in conns {
            if let Err(e) = conn.close().await {
                warn!(key = %self.key, subscriber = id, error = %e, "Subscriber close failed");
                failed += 1;
            }
        }

        debug!(key = %self.key, subscribers = total, failed, "Channel closed");

        if failed == 0 {
            Ok(())
        } else {
            Err(ChannelError::CloseFailed {
                key: self.key.clone(),
                failed,
                total,
            })
        }
    }

    fn fmt_debug(&self, name: &str, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct(name)
            .field("key", &self.key)
            .field("id", &self.id)
            .field("max", &self.max)
            .field("closed", &self.is_closed())
            .finish()
    }
}

/// A channel delivering to WebSocket subscribers as JSON text frames.
pub struct WebSocketChannel {
    subscribers: Subscribers,
}

impl WebSocketChannel {
    pub(crate) fn new(key: String, id: ChannelId, max: usize, link: RegistryLink) -> Self {
        Self {
            subscribers: Subscribers::new(key, id, Protocol::WebSocket, max, link),
        }
    }

    fn encode(message: &Message) -> Result<Outbound, ChannelError> {
        let text = message.to_push_frame().to_json()?;
        Ok(Outbound::Text(text.into()))
    }
}

impl fmt::Debug for WebSocketChannel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.subscribers.fmt_debug("WebSocketChannel", f)
    }
}

#[async_trait]
impl Channel for WebSocketChannel {
    fn key(&self) -> &str {
        &self.subscribers.key
    }

    fn id(&self) -> ChannelId {
        self.subscribers.id
    }

    fn protocol(&self) -> Protocol {
        Protocol::WebSocket
    }

    fn is_closed(&self) -> bool {
        self.subscribers.is_closed()
    }

    async fn subscriber_count(&self) -> usize {
        self.subscribers.count().await
    }

    async fn attach(&self, subscriber: Arc<dyn Subscriber>) -> Result<SubscriberId, ChannelError> {
        self.subscribers.attach(subscriber).await
    }

    async fn detach(&self, id: SubscriberId) -> bool {
        self.subscribers.detach(id).await
    }

    async fn push_msg(&self, message: Message) -> Result<usize, ChannelError> {
        let payload = Self::encode(&message)?;
        self.subscribers.push(payload).await
    }

    async fn close(&self) -> Result<(), ChannelError> {
        self.subscribers.close().await
    }
}

/// A channel delivering to raw TCP subscribers as length-prefixed frames.
pub struct TcpChannel {
    subscribers: Subscribers,
}

impl TcpChannel {
    pub(crate) fn new(key: String, id: ChannelId, max: usize, link: RegistryLink) -> Self {
        Self {
            subscribers: Subscribers::new(key, id, Protocol::Tcp, max, link),
        }
    }

    fn encode(message: &Message) -> Result<Outbound, ChannelError> {
        let data = codec::encode(&TcpFrame::Push(message.to_push_frame()))?;
        Ok(Outbound::Binary(data))
    }
}

impl fmt::Debug for TcpChannel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.subscribers.fmt_debug("TcpChannel", f)
    }
}

#[async_trait]
impl Channel for TcpChannel {
    fn key(&self) -> &str {
        &self.subscribers.key
    }

    fn id(&self) -> ChannelId {
        self.subscribers.id
    }

    fn protocol(&self) -> Protocol {
        Protocol::Tcp
    }

    fn is_closed(&self) -> bool {
        self.subscribers.is_closed()
    }

    async fn subscriber_count(&self) -> usize {
        self.subscribers.count().await
    }

    async fn attach(&self, subscriber: Arc<dyn Subscriber>) -> Result<SubscriberId, ChannelError> {
        self.subscribers.attach(subscriber).await
    }

    async fn detach(&self, id: SubscriberId) -> bool {
        self.subscribers.detach(id).await
    }

    async fn push_msg(&self, message: Message) -> Result<usize, ChannelError> {
        let payload = Self::encode(&message)?;
        self.subscribers.push(payload).await
    }

    async fn close(&self) -> Result<(), ChannelError> {
        self.subscribers.close().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::subscriber::testing::RecordingSubscriber;
    use comet_protocol::PushFrame;

    fn ws_channel(max: usize) -> WebSocketChannel {
        WebSocketChannel::new("u1".into(), 1, max, RegistryLink::detached())
    }

    fn tcp_channel(max: usize) -> TcpChannel {
        TcpChannel::new("u1".into(), 1, max, RegistryLink::detached())
    }

    #[tokio::test]
    async fn test_push_reaches_every_subscriber() {
        let channel = ws_channel(4);
        let a = RecordingSubscriber::new(Protocol::WebSocket);
        let b = RecordingSubscriber::new(Protocol::WebSocket);
        channel.attach(a.clone()).await.unwrap();
        channel.attach(b.clone()).await.unwrap();

        let delivered = channel.push_msg(Message::new("hello", 7, "m1")).await.unwrap();
        assert_eq!(delivered, 2);

        for sub in [&a, &b] {
            let received = sub.received();
            assert_eq!(received.len(), 1);
            match &received[0] {
                Outbound::Text(text) => {
                    let frame: PushFrame = serde_json::from_str(text).unwrap();
                    assert_eq!(frame.msg, "hello");
                    assert_eq!(frame.expire, 7);
                    assert_eq!(frame.mid, "m1");
                }
                other => panic!("Expected text payload, got {:?}", other),
            }
        }
    }

    #[tokio::test]
    async fn test_push_without_subscribers_succeeds() {
        let channel = ws_channel(4);
        assert_eq!(channel.push_msg(Message::new("hello", 0, "m1")).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_expired_message_is_still_pushed() {
        let channel = ws_channel(4);
        let sub = RecordingSubscriber::new(Protocol::WebSocket);
        channel.attach(sub.clone()).await.unwrap();

        let expired = Message::new("late", 1, "m1");
        assert!(expired.is_expired());
        assert_eq!(channel.push_msg(expired).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_tcp_channel_pushes_binary_frames() {
        let channel = tcp_channel(4);
        let sub = RecordingSubscriber::new(Protocol::Tcp);
        channel.attach(sub.clone()).await.unwrap();

        channel.push_msg(Message::new("hello", 5, "m1")).await.unwrap();

        match &sub.received()[0] {
            Outbound::Binary(data) => {
                let frame: TcpFrame = codec::decode(data).unwrap();
                assert_eq!(
                    frame,
                    TcpFrame::Push(PushFrame {
                        msg: "hello".into(),
                        expire: 5,
                        mid: "m1".into(),
                    })
                );
            }
            other => panic!("Expected binary payload, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_subscriber_limit() {
        let channel = ws_channel(2);
        channel.attach(RecordingSubscriber::new(Protocol::WebSocket)).await.unwrap();
        channel.attach(RecordingSubscriber::new(Protocol::WebSocket)).await.unwrap();

        let result = channel.attach(RecordingSubscriber::new(Protocol::WebSocket)).await;
        assert!(matches!(result, Err(ChannelError::LimitExceeded { max: 2, .. })));
        assert_eq!(channel.subscriber_count().await, 2);
    }

    #[tokio::test]
    async fn test_detach_frees_a_slot() {
        let channel = ws_channel(1);
        let id = channel.attach(RecordingSubscriber::new(Protocol::WebSocket)).await.unwrap();
        assert!(channel.detach(id).await);
        assert!(!channel.detach(id).await);
        channel.attach(RecordingSubscriber::new(Protocol::WebSocket)).await.unwrap();
    }

    #[tokio::test]
    async fn test_protocol_mismatch() {
        let channel = ws_channel(4);
        let result = channel.attach(RecordingSubscriber::new(Protocol::Tcp)).await;
        assert!(matches!(
            result,
            Err(ChannelError::ProtocolMismatch {
                expected: Protocol::WebSocket,
                actual: Protocol::Tcp
            })
        ));
    }

    #[tokio::test]
    async fn test_push_failure_drops_broken_subscriber() {
        let channel = ws_channel(4);
        let good = RecordingSubscriber::new(Protocol::WebSocket);
        let bad = RecordingSubscriber::failing_send(Protocol::WebSocket);
        channel.attach(good.clone()).await.unwrap();
        channel.attach(bad).await.unwrap();

        let result = channel.push_msg(Message::new("hello", 0, "m1")).await;
        assert!(matches!(
            result,
            Err(ChannelError::PushFailed { failed: 1, total: 2, .. })
        ));
        assert_eq!(good.received().len(), 1);
        assert_eq!(channel.subscriber_count().await, 1);

        assert_eq!(channel.push_msg(Message::new("again", 0, "m2")).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_close_is_idempotent_and_rejects_pushes() {
        let channel = ws_channel(4);
        let sub = RecordingSubscriber::new(Protocol::WebSocket);
        channel.attach(sub.clone()).await.unwrap();

        channel.close().await.unwrap();
        assert!(channel.is_closed());
        assert!(sub.is_closed());
        assert_eq!(channel.subscriber_count().await, 0);

        channel.close().await.unwrap();

        assert!(matches!(
            channel.push_msg(Message::new("hello", 0, "m1")).await,
            Err(ChannelError::Closed(_))
        ));
        assert!(matches!(
            channel.attach(RecordingSubscriber::new(Protocol::WebSocket)).await,
            Err(ChannelError::Closed(_))
        ));
    }

    #[tokio::test]
    async fn test_close_continues_past_failures() {
        let channel = tcp_channel(4);
        let stuck = RecordingSubscriber::failing_close(Protocol::Tcp);
        let fine = RecordingSubscriber::new(Protocol::Tcp);
        channel.attach(stuck.clone()).await.unwrap();
        channel.attach(fine.clone()).await.unwrap();

        let result = channel.close().await;
        assert!(matches!(
            result,
            Err(ChannelError::CloseFailed { failed: 1, total: 2, .. })
        ));
        assert!(fine.is_closed());
        assert!(stuck.is_closed());
        assert!(channel.is_closed());
    }
}
