//! Subscriber connection contract.
//!
//! A channel never touches sockets directly: each live client is represented by
//! a [`Subscriber`] that the transport layer implements over its own stream.

use async_trait::async_trait;
use bytes::Bytes;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

use crate::channel::Protocol;

/// Identifier of a subscriber within its channel.
pub type SubscriberId = u64;

/// A pre-encoded payload, shared across every subscriber of a channel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outbound {
    /// A text frame (WebSocket).
    Text(Arc<str>),
    /// A binary frame (raw TCP).
    Binary(Bytes),
}

impl Outbound {
    /// Payload size in bytes.
    #[must_use]
    pub fn len(&self) -> usize {
        match self {
            Outbound::Text(text) => text.len(),
            Outbound::Binary(data) => data.len(),
        }
    }

    /// Check whether the payload is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Subscriber errors.
#[derive(Debug, Error)]
pub enum SubscriberError {
    /// The connection is already closed.
    #[error("Subscriber connection closed")]
    Closed,

    /// The write did not complete in time.
    #[error("Write timed out after {0:?}")]
    Timeout(Duration),

    /// The payload kind does not match the connection.
    #[error("Unsupported payload for {0} subscriber")]
    UnsupportedPayload(Protocol),

    /// The write failed.
    #[error("Send failed: {0}")]
    SendFailed(String),

    /// Closing the connection failed.
    #[error("Close failed: {0}")]
    CloseFailed(String),
}

/// A live subscriber connection.
#[async_trait]
pub trait Subscriber: Send + Sync {
    /// The transport this connection speaks.
    fn protocol(&self) -> Protocol;

    /// Write one payload to the connection.
    async fn send(&self, payload: Outbound) -> Result<(), SubscriberError>;

    /// Close the connection.
    async fn close(&self) -> Result<(), SubscriberError>;

    /// Remote address of the connection, if known.
    fn remote_addr(&self) -> Option<String> {
        None
    }
}
