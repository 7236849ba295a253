//! Control-plane RPC messages.
//!
//! Coordinators and producers drive a node through four calls. Every call is
//! answered with a [`ResultCode`]; application failures never travel as
//! transport errors, so the wire contract stays stable no matter how the node
//! represents failures internally.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Result codes returned by every RPC call.
///
/// The numeric values are part of the wire contract.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(into = "u32", try_from = "u32")]
#[repr(u32)]
pub enum ResultCode {
    /// The call succeeded.
    Ok = 0,
    /// The channel could not be created.
    CreateChannel = 1,
    /// A subscriber could not be added to the channel.
    AddChannel = 2,
    /// No live channel exists for the key.
    GetChannel = 3,
    /// The channel failed to deliver the message.
    PushMsg = 4,
    /// The migration request was refused.
    Migrate = 5,
    /// The call carried missing or malformed parameters.
    Param = 65534,
    /// Unexpected internal failure.
    Internal = 65535,
}

impl ResultCode {
    /// Check whether the code reports success.
    #[must_use]
    pub fn is_ok(self) -> bool {
        self == ResultCode::Ok
    }

    /// The numeric wire value.
    #[must_use]
    pub fn as_u32(self) -> u32 {
        self as u32
    }

    /// Short human-readable description.
    #[must_use]
    pub fn description(self) -> &'static str {
        match self {
            ResultCode::Ok => "ok",
            ResultCode::CreateChannel => "create channel failed",
            ResultCode::AddChannel => "add subscriber failed",
            ResultCode::GetChannel => "channel not found",
            ResultCode::PushMsg => "push failed",
            ResultCode::Migrate => "migration refused",
            ResultCode::Param => "invalid parameters",
            ResultCode::Internal => "internal error",
        }
    }
}

impl From<ResultCode> for u32 {
    fn from(code: ResultCode) -> u32 {
        code as u32
    }
}

impl TryFrom<u32> for ResultCode {
    type Error = &'static str;

    fn try_from(value: u32) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(ResultCode::Ok),
            1 => Ok(ResultCode::CreateChannel),
            2 => Ok(ResultCode::AddChannel),
            3 => Ok(ResultCode::GetChannel),
            4 => Ok(ResultCode::PushMsg),
            5 => Ok(ResultCode::Migrate),
            65534 => Ok(ResultCode::Param),
            65535 => Ok(ResultCode::Internal),
            _ => Err("Invalid result code"),
        }
    }
}

impl fmt::Display for ResultCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_u32())
    }
}

/// Arguments of a `Publish` call.
///
/// Missing fields decode as empty so the handler can answer them with
/// [`ResultCode::Param`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PublishArgs {
    /// Subscriber key.
    #[serde(default)]
    pub key: String,
    /// Message content.
    #[serde(default)]
    pub msg: String,
    /// Requested expiry in seconds; non-positive selects the node default.
    #[serde(default)]
    pub expire: i64,
    /// Opaque message identifier chosen by the producer.
    #[serde(default)]
    pub msg_id: String,
}

/// A remotely callable operation.
///
/// Argument fields default to empty values when absent.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "method")]
pub enum RpcCall {
    /// Create the channel for a key.
    #[serde(rename = "new")]
    New {
        /// Subscriber key.
        #[serde(default)]
        key: String,
    },

    /// Close the channel for a key.
    #[serde(rename = "close")]
    Close {
        /// Subscriber key.
        #[serde(default)]
        key: String,
    },

    /// Push a message to the channel for a key.
    #[serde(rename = "publish")]
    Publish(PublishArgs),

    /// Recompute key ownership for a new node set and evict foreign keys.
    #[serde(rename = "migrate")]
    Migrate {
        /// Full node list of the cluster.
        #[serde(default)]
        nodes: Vec<String>,
        /// Virtual nodes per physical node.
        #[serde(default)]
        vnode: u32,
    },
}

impl RpcCall {
    /// Create a `New` call.
    #[must_use]
    pub fn new_channel(key: impl Into<String>) -> Self {
        RpcCall::New { key: key.into() }
    }

    /// Create a `Close` call.
    #[must_use]
    pub fn close_channel(key: impl Into<String>) -> Self {
        RpcCall::Close { key: key.into() }
    }

    /// Create a `Publish` call.
    #[must_use]
    pub fn publish(
        key: impl Into<String>,
        msg: impl Into<String>,
        expire: i64,
        msg_id: impl Into<String>,
    ) -> Self {
        RpcCall::Publish(PublishArgs {
            key: key.into(),
            msg: msg.into(),
            expire,
            msg_id: msg_id.into(),
        })
    }

    /// Create a `Migrate` call.
    #[must_use]
    pub fn migrate(nodes: Vec<String>, vnode: u32) -> Self {
        RpcCall::Migrate { nodes, vnode }
    }

    /// The method name, used for logging and metrics labels.
    #[must_use]
    pub fn method(&self) -> &'static str {
        match self {
            RpcCall::New { .. } => "new",
            RpcCall::Close { .. } => "close",
            RpcCall::Publish(_) => "publish",
            RpcCall::Migrate { .. } => "migrate",
        }
    }
}

/// A request frame: a call plus the sequence number echoed in its response.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RpcRequest {
    /// Client-chosen sequence number.
    pub seq: u64,
    /// The call to perform.
    pub call: RpcCall,
}

impl RpcRequest {
    /// Create a new request.
    #[must_use]
    pub fn new(seq: u64, call: RpcCall) -> Self {
        Self { seq, call }
    }
}

/// A response frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RpcResponse {
    /// Sequence number of the answered request.
    pub seq: u64,
    /// Outcome of the call.
    pub ret: ResultCode,
}

impl RpcResponse {
    /// Create a new response.
    #[must_use]
    pub fn new(seq: u64, ret: ResultCode) -> Self {
        Self { seq, ret }
    }
}
