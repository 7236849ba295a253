//! Async RPC client for the Comet control plane.
//!
//! Calls are issued one at a time over a single connection; each response must
//! echo the sequence number of the request it answers.

use bytes::BytesMut;
use tokio::net::{TcpStream, ToSocketAddrs};
use tracing::debug;

use crate::codec::{self, ProtocolError};
use crate::rpc::{ResultCode, RpcCall, RpcRequest, RpcResponse};

/// A connection to a node's RPC listener.
pub struct RpcClient {
    stream: TcpStream,
    read_buffer: BytesMut,
    next_seq: u64,
}

impl RpcClient {
    /// Connect to a node.
    ///
    /// # Errors
    ///
    /// Returns an error if the connection cannot be established.
    pub async fn connect(addr: impl ToSocketAddrs) -> Result<Self, ProtocolError> {
        let stream = TcpStream::connect(addr).await?;
        stream.set_nodelay(true)?;
        Ok(Self {
            stream,
            read_buffer: BytesMut::with_capacity(256),
            next_seq: 1,
        })
    }

    /// Issue a call and wait for its result code.
    ///
    /// # Errors
    ///
    /// Returns an error only for transport or framing faults; application
    /// failures arrive as non-`Ok` result codes.
    pub async fn call(&mut self, call: RpcCall) -> Result<ResultCode, ProtocolError> {
        let seq = self.next_seq;
        self.next_seq += 1;

        let method = call.method();
        codec::write_frame(&mut self.stream, &RpcRequest::new(seq, call)).await?;

        let response: RpcResponse = codec::read_frame(&mut self.stream, &mut self.read_buffer)
            .await?
            .ok_or(ProtocolError::ConnectionClosed)?;

        if response.seq != seq {
            return Err(ProtocolError::Invalid(format!(
                "response seq {} does not match request seq {}",
                response.seq, seq
            )));
        }

        debug!(method, seq, ret = %response.ret, "RPC call completed");
        Ok(response.ret)
    }

    /// Create the channel for `key`.
    ///
    /// # Errors
    ///
    /// See [`RpcClient::call`].
    pub async fn new_channel(&mut self, key: impl Into<String>) -> Result<ResultCode, ProtocolError> {
        self.call(RpcCall::new_channel(key)).await
    }

    /// Close the channel for `key`.
    ///
    /// # Errors
    ///
    /// See [`RpcClient::call`].
    pub async fn close_channel(
        &mut self,
        key: impl Into<String>,
    ) -> Result<ResultCode, ProtocolError> {
        self.call(RpcCall::close_channel(key)).await
    }

    /// Publish a message to the channel for `key`.
    ///
    /// # Errors
    ///
    /// See [`RpcClient::call`].
    pub async fn publish(
        &mut self,
        key: impl Into<String>,
        msg: impl Into<String>,
        expire: i64,
        msg_id: impl Into<String>,
    ) -> Result<ResultCode, ProtocolError> {
        self.call(RpcCall::publish(key, msg, expire, msg_id)).await
    }

    /// Ask the node to migrate to a new node set.
    ///
    /// # Errors
    ///
    /// See [`RpcClient::call`].
    pub async fn migrate(&mut self, nodes: Vec<String>, vnode: u32) -> Result<ResultCode, ProtocolError> {
        self.call(RpcCall::migrate(nodes, vnode)).await
    }
}
