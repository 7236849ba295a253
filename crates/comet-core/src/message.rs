//! Push messages.
//!
//! A message is stamped with its absolute expiry when it is published and is
//! never modified afterwards. Expiry is informational at this layer: channels
//! deliver expired messages too and leave filtering to the consumer.

use comet_protocol::{PushFrame, HEARTBEAT};
use std::time::{SystemTime, UNIX_EPOCH};

/// An opaque message identifier chosen by the producer.
pub type MessageId = String;

/// Nanoseconds per second.
pub const NANOS_PER_SEC: i64 = 1_000_000_000;

/// Current wall-clock time in nanoseconds since the Unix epoch.
#[must_use]
pub fn now_nanos() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_nanos() as i64)
        .unwrap_or_default()
}

/// Pick the expiry for a publish: the requested one if positive, else the default.
#[must_use]
pub fn resolve_expire_secs(requested: i64, default_secs: i64) -> i64 {
    if requested > 0 {
        requested
    } else {
        default_secs
    }
}

/// An immutable push message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    content: String,
    expire_at: i64,
    id: MessageId,
}

impl Message {
    /// Create a message with an absolute expiry (nanoseconds since the epoch).
    #[must_use]
    pub fn new(content: impl Into<String>, expire_at: i64, id: impl Into<MessageId>) -> Self {
        Self {
            content: content.into(),
            expire_at,
            id: id.into(),
        }
    }

    /// Create a message expiring `expire_secs` seconds from now.
    #[must_use]
    pub fn expiring_in(content: impl Into<String>, expire_secs: i64, id: impl Into<MessageId>) -> Self {
        let expire_at = now_nanos().saturating_add(expire_secs.saturating_mul(NANOS_PER_SEC));
        Self::new(content, expire_at, id)
    }

    /// Check whether this is the keep-alive message: the reserved body with
    /// no identifier.
    #[must_use]
    pub fn is_heartbeat(&self) -> bool {
        self.content == HEARTBEAT && self.id.is_empty()
    }

    /// Message content.
    #[must_use]
    pub fn content(&self) -> &str {
        &self.content
    }

    /// Absolute expiry in nanoseconds since the epoch.
    #[must_use]
    pub fn expire_at(&self) -> i64 {
        self.expire_at
    }

    /// Message identifier.
    #[must_use]
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Check whether the message had expired at `now` (nanoseconds).
    #[must_use]
    pub fn is_expired_at(&self, now: i64) -> bool {
        self.expire_at <= now
    }

    /// Check whether the message has expired.
    #[must_use]
    pub fn is_expired(&self) -> bool {
        self.is_expired_at(now_nanos())
    }

    /// The subscriber-facing representation.
    #[must_use]
    pub fn to_push_frame(&self) -> PushFrame {
        PushFrame {
            msg: self.content.clone(),
            expire: self.expire_at,
            mid: self.id.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_resolve_expire_secs() {
        assert_eq!(resolve_expire_secs(10, 30), 10);
        assert_eq!(resolve_expire_secs(0, 30), 30);
        assert_eq!(resolve_expire_secs(-5, 30), 30);
    }

    #[test]
    fn test_expiring_in_stamps_absolute_time() {
        let before = now_nanos();
        let msg = Message::expiring_in("hello", 30, "m1");
        let after = now_nanos();

        assert!(msg.expire_at() >= before + 30 * NANOS_PER_SEC);
        assert!(msg.expire_at() <= after + 30 * NANOS_PER_SEC);
        assert!(!msg.is_expired());
        assert!(msg.is_expired_at(after + 31 * NANOS_PER_SEC));
    }

    #[test]
    fn test_heartbeat() {
        assert!(Message::expiring_in(HEARTBEAT, 30, "").is_heartbeat());
        assert!(!Message::new("h", 0, "m1").is_heartbeat());
        assert!(!Message::new("hello", 0, "").is_heartbeat());
    }

    #[test]
    fn test_push_frame() {
        let frame = Message::new("hello", 99, "m1").to_push_frame();
        assert_eq!(frame.msg, "hello");
        assert_eq!(frame.expire, 99);
        assert_eq!(frame.mid, "m1");
    }
}
