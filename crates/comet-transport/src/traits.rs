//! Transport errors and the authentication hook.

use comet_core::{ChannelError, RegistryError, SubscriberError};
use comet_protocol::{ProtocolError, ResultCode};
use std::time::Duration;
use thiserror::Error;

/// Transport errors.
#[derive(Debug, Error)]
pub enum TransportError {
    /// The client sent an invalid key.
    #[error("Invalid key: {0}")]
    Registry(#[from] RegistryError),

    /// The subscriber could not be attached to its channel.
    #[error("Attach failed: {0}")]
    Attach(#[from] ChannelError),

    /// The token check rejected the client.
    #[error("Token check failed for key {0}")]
    Unauthorized(String),

    /// The client went silent.
    #[error("Connection timed out after {0:?}")]
    Timeout(Duration),

    /// The client spoke out of turn.
    #[error("Unexpected frame: {0}")]
    UnexpectedFrame(&'static str),

    /// Writing to the client failed.
    #[error("Subscriber error: {0}")]
    Subscriber(#[from] SubscriberError),

    /// Protocol error.
    #[error("Protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    /// WebSocket error.
    #[error("WebSocket error: {0}")]
    WebSocket(String),

    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl TransportError {
    /// The result code reported to the client before the session is closed.
    #[must_use]
    pub fn result_code(&self) -> ResultCode {
        match self {
            TransportError::Registry(_)
            | TransportError::Unauthorized(_)
            | TransportError::UnexpectedFrame(_) => ResultCode::Param,
            TransportError::Attach(_) => ResultCode::AddChannel,
            _ => ResultCode::Internal,
        }
    }
}

/// Token check run before a subscriber is attached.
///
/// The check itself belongs to the deployment; the node only calls it.
pub trait TokenCheck: Send + Sync {
    /// Decide whether a client presenting `token` may subscribe to `key`.
    fn check(&self, key: &str, token: Option<&str>) -> bool;
}

/// A [`TokenCheck`] that admits everyone.
#[derive(Debug, Clone, Copy, Default)]
pub struct AllowAll;

impl TokenCheck for AllowAll {
    fn check(&self, _key: &str, _token: Option<&str>) -> bool {
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_result_codes() {
        assert_eq!(
            TransportError::Attach(ChannelError::LimitExceeded {
                key: "u1".into(),
                max: 1
            })
            .result_code(),
            ResultCode::AddChannel
        );
        assert_eq!(
            TransportError::Registry(RegistryError::InvalidKey("empty")).result_code(),
            ResultCode::Param
        );
        assert_eq!(
            TransportError::Timeout(Duration::from_secs(1)).result_code(),
            ResultCode::Internal
        );
    }

    #[test]
    fn test_allow_all() {
        assert!(AllowAll.check("u1", None));
        assert!(AllowAll.check("u1", Some("token")));
    }
}
