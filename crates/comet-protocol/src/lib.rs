//! # comet-protocol
//!
//! Wire protocol definitions for the Comet message-delivery node.
//!
//! Two audiences speak this protocol:
//!
//! - **Control plane** - coordinators and producers drive a node through the
//!   `New` / `Close` / `Publish` / `Migrate` RPC calls ([`rpc`]).
//! - **Subscribers** - WebSocket clients receive JSON push frames, raw TCP
//!   clients exchange length-prefixed [`TcpFrame`]s ([`push`]).
//!
//! Every binary frame is a 4-byte big-endian length prefix followed by a
//! MessagePack body.
//!
//! ## Example
//!
//! ```rust
//! use comet_protocol::{codec, RpcCall, RpcRequest};
//!
//! let request = RpcRequest::new(1, RpcCall::new_channel("u1"));
//! let encoded = codec::encode(&request).unwrap();
//! let decoded: RpcRequest = codec::decode(&encoded).unwrap();
//! assert_eq!(request, decoded);
//! ```

pub mod client;
pub mod codec;
pub mod push;
pub mod rpc;

pub use client::RpcClient;
pub use codec::{decode, encode, ProtocolError};
pub use push::{PushFrame, TcpFrame, HEARTBEAT};
pub use rpc::{PublishArgs, ResultCode, RpcCall, RpcRequest, RpcResponse};
