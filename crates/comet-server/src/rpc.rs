//! RPC control surface.
//!
//! Every call is answered with a [`ResultCode`]. Parameters are checked before
//! the registry is touched, and registry or channel errors never escape as
//! faults: they are mapped to codes here. Only a malformed frame ends a
//! connection.

use bytes::BytesMut;
use comet_core::registry::validate_key;
use comet_core::{
    resolve_expire_secs, Message, MigrationError, Migrator, PushStats, Registry, MAX_VNODES,
};
use comet_protocol::{codec, ProtocolError, PublishArgs, ResultCode, RpcCall, RpcRequest, RpcResponse};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::{TcpListener, TcpStream};
use tracing::{debug, error, info, warn};

use crate::metrics::{self, ConnectionMetricsGuard};

/// Handles New/Close/Publish/Migrate calls.
#[derive(Debug, Clone)]
pub struct ChannelRpc {
    registry: Registry,
    stats: Arc<PushStats>,
    migrator: Migrator,
    default_expire_secs: i64,
}

impl ChannelRpc {
    /// Create the service.
    #[must_use]
    pub fn new(
        registry: Registry,
        stats: Arc<PushStats>,
        migrator: Migrator,
        default_expire_secs: i64,
    ) -> Self {
        Self {
            registry,
            stats,
            migrator,
            default_expire_secs,
        }
    }

    /// Publish counters.
    #[must_use]
    pub fn stats(&self) -> &Arc<PushStats> {
        &self.stats
    }

    /// Dispatch one call.
    pub async fn handle(&self, call: RpcCall) -> ResultCode {
        let method = call.method();
        let code = match call {
            RpcCall::New { key } => self.new_channel(&key),
            RpcCall::Close { key } => self.close_channel(&key).await,
            RpcCall::Publish(args) => self.publish(&args).await,
            RpcCall::Migrate { nodes, vnode } => self.migrate(&nodes, vnode).await,
        };
        metrics::record_rpc(method, code);
        code
    }

    /// Create the channel for a key.
    pub fn new_channel(&self, key: &str) -> ResultCode {
        if let Err(reason) = validate_key(key) {
            warn!(key = %key, reason, "New: invalid key");
            return ResultCode::Param;
        }
        match self.registry.new_channel(key) {
            Ok(_) => {
                debug!(key = %key, "Channel created");
                ResultCode::Ok
            }
            Err(e) => {
                warn!(key = %key, error = %e, "New failed");
                ResultCode::CreateChannel
            }
        }
    }

    /// Close the channel for a key.
    ///
    /// A close that fails on some subscribers still detaches the channel, so
    /// the call succeeds once the channel was found.
    pub async fn close_channel(&self, key: &str) -> ResultCode {
        if let Err(reason) = validate_key(key) {
            warn!(key = %key, reason, "Close: invalid key");
            return ResultCode::Param;
        }
        let channel = match self.registry.get(key) {
            Ok(channel) => channel,
            Err(e) => {
                warn!(key = %key, error = %e, "Close: channel not found");
                return ResultCode::GetChannel;
            }
        };
        if let Err(e) = channel.close().await {
            warn!(key = %key, error = %e, "Channel close failed");
            metrics::record_error("channel_close");
        }
        debug!(key = %key, "Channel closed");
        ResultCode::Ok
    }

    /// Deliver a message to a key's subscribers.
    ///
    /// Every publish that passes parameter checks bumps exactly one counter:
    /// `succeeded` on delivery, `failed` on a missing channel or a push error.
    /// A keep-alive (the heartbeat body with no message id) is relayed but
    /// never counted.
    pub async fn publish(&self, args: &PublishArgs) -> ResultCode {
        if args.key.is_empty() || args.msg.is_empty() {
            warn!(key = %args.key, "Publish: empty key or message");
            return ResultCode::Param;
        }
        if let Err(reason) = validate_key(&args.key) {
            warn!(key = %args.key, reason, "Publish: invalid key");
            return ResultCode::Param;
        }

        let expire = resolve_expire_secs(args.expire, self.default_expire_secs);
        let message = Message::expiring_in(args.msg.as_str(), expire, args.msg_id.as_str());
        let counted = !message.is_heartbeat();

        let channel = match self.registry.get(&args.key) {
            Ok(channel) => channel,
            Err(e) => {
                self.record_push(counted, false);
                warn!(key = %args.key, error = %e, "Publish: channel not found");
                return ResultCode::GetChannel;
            }
        };

        match channel.push_msg(message).await {
            Ok(reached) => {
                self.record_push(counted, true);
                debug!(key = %args.key, mid = %args.msg_id, reached, counted, "Published");
                ResultCode::Ok
            }
            Err(e) => {
                self.record_push(counted, false);
                error!(key = %args.key, mid = %args.msg_id, error = %e, "Publish failed");
                ResultCode::PushMsg
            }
        }
    }

    fn record_push(&self, counted: bool, succeeded: bool) {
        if !counted {
            return;
        }
        if succeeded {
            self.stats.incr_succeeded();
            metrics::record_push_succeeded();
        } else {
            self.stats.incr_failed();
            metrics::record_push_failed();
        }
    }

    /// Re-partition keys over a new node set.
    pub async fn migrate(&self, nodes: &[String], vnode: u32) -> ResultCode {
        if nodes.is_empty() || vnode == 0 || vnode as usize > MAX_VNODES {
            warn!(nodes = ?nodes, vnode, "Migrate: empty node list or vnodes out of range");
            return ResultCode::Param;
        }
        match self.migrator.migrate(nodes, vnode as usize).await {
            Ok(report) => {
                metrics::record_migration(report.evicted);
                if !report.is_clean() {
                    metrics::record_error("migrate_close");
                }
                ResultCode::Ok
            }
            Err(MigrationError::Ring(e)) => {
                warn!(error = %e, "Migrate: invalid node list");
                ResultCode::Param
            }
            Err(e @ MigrationError::LocalNodeMissing(_)) => {
                warn!(error = %e, "Migrate refused");
                ResultCode::Migrate
            }
            Err(e @ MigrationError::Aborted(_)) => {
                error!(error = %e, "Migrate failed");
                ResultCode::Internal
            }
        }
    }
}

/// Serve RPC connections until the task is dropped.
pub async fn serve(listener: TcpListener, rpc: ChannelRpc) {
    if let Ok(addr) = listener.local_addr() {
        info!("RPC listening on {}", addr);
    }
    loop {
        let (stream, addr) = match listener.accept().await {
            Ok(accepted) => accepted,
            Err(e) => {
                error!("RPC accept failed: {}", e);
                continue;
            }
        };
        let rpc = rpc.clone();
        tokio::spawn(async move {
            if let Err(e) = handle_connection(stream, addr, rpc).await {
                warn!("RPC connection {} closed: {}", addr, e);
                metrics::record_error("rpc_codec");
            }
        });
    }
}

async fn handle_connection(
    mut stream: TcpStream,
    addr: SocketAddr,
    rpc: ChannelRpc,
) -> Result<(), ProtocolError> {
    let _metrics_guard = ConnectionMetricsGuard::new();
    stream.set_nodelay(true)?;
    debug!("RPC connection from {}", addr);

    let mut buf = BytesMut::with_capacity(4096);
    while let Some(request) = codec::read_frame::<_, RpcRequest>(&mut stream, &mut buf).await? {
        let ret = rpc.handle(request.call).await;
        codec::write_frame(&mut stream, &RpcResponse::new(request.seq, ret)).await?;
    }

    debug!("RPC connection {} closed by peer", addr);
    Ok(())
}
