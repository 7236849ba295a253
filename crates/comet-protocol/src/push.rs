//! Frames delivered to subscribers.
//!
//! WebSocket subscribers receive each message as a JSON text frame; raw TCP
//! subscribers exchange length-prefixed [`TcpFrame`]s. On both transports the
//! heartbeat is a reserved body that carries no message and is never counted.

use serde::{Deserialize, Serialize};

use crate::codec::ProtocolError;
use crate::rpc::ResultCode;

/// Reserved heartbeat body.
pub const HEARTBEAT: &str = "h";

/// A message as seen by a subscriber.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PushFrame {
    /// Message content.
    pub msg: String,
    /// Absolute expiry, nanoseconds since the Unix epoch.
    pub expire: i64,
    /// Message identifier.
    pub mid: String,
}

impl PushFrame {
    /// Render the frame as the JSON text sent to WebSocket subscribers.
    ///
    /// # Errors
    ///
    /// Returns an error if serialization fails.
    pub fn to_json(&self) -> Result<String, ProtocolError> {
        Ok(serde_json::to_string(self)?)
    }
}

/// Frames of the raw TCP subscriber protocol.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum TcpFrame {
    /// First frame sent by a client: which key to subscribe to.
    #[serde(rename = "handshake")]
    Handshake {
        /// Subscriber key.
        key: String,
        /// Client heartbeat interval in seconds (0 selects the server default).
        #[serde(default)]
        heartbeat: u64,
        /// Optional authentication token.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        token: Option<String>,
    },

    /// Keep-alive, sent by the client and echoed by the server.
    #[serde(rename = "heartbeat")]
    Heartbeat,

    /// A delivered message.
    #[serde(rename = "push")]
    Push(PushFrame),

    /// Session-level failure; the server closes the connection after sending it.
    #[serde(rename = "error")]
    Error {
        /// Result code describing the failure.
        code: ResultCode,
        /// Human-readable reason.
        message: String,
    },
}

impl TcpFrame {
    /// Create a handshake frame without a token.
    #[must_use]
    pub fn handshake(key: impl Into<String>, heartbeat: u64) -> Self {
        TcpFrame::Handshake {
            key: key.into(),
            heartbeat,
            token: None,
        }
    }

    /// Create an error frame.
    #[must_use]
    pub fn error(code: ResultCode, message: impl Into<String>) -> Self {
        TcpFrame::Error {
            code,
            message: message.into(),
        }
    }
}
