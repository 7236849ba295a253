//! Raw TCP subscriber transport.
//!
//! A client opens a connection and sends a [`TcpFrame::Handshake`] naming its
//! key. The server attaches it to the key's channel, echoes every
//! [`TcpFrame::Heartbeat`], and writes [`TcpFrame::Push`] frames as messages
//! arrive. If the session cannot start, the server writes one
//! [`TcpFrame::Error`] and closes.

use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use comet_core::{Outbound, Protocol, Subscriber, SubscriberError};
use comet_protocol::{codec, TcpFrame};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio::net::tcp::OwnedWriteHalf;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::Mutex;
use tokio::time::timeout;
use tracing::{debug, error, info, trace, warn};

use crate::session::SessionContext;
use crate::traits::TransportError;

/// Write side of a raw TCP subscriber connection.
pub struct TcpSubscriber {
    writer: Mutex<OwnedWriteHalf>,
    remote_addr: SocketAddr,
    write_timeout: Duration,
    is_open: AtomicBool,
}

impl TcpSubscriber {
    /// Wrap the write half of an accepted connection.
    #[must_use]
    pub fn new(writer: OwnedWriteHalf, remote_addr: SocketAddr, write_timeout: Duration) -> Self {
        Self {
            writer: Mutex::new(writer),
            remote_addr,
            write_timeout,
            is_open: AtomicBool::new(true),
        }
    }

    /// Encode and write a session frame.
    ///
    /// # Errors
    ///
    /// Fails if the frame cannot be encoded or written.
    pub async fn send_frame(&self, frame: &TcpFrame) -> Result<(), SubscriberError> {
        let data = codec::encode(frame).map_err(|e| SubscriberError::SendFailed(e.to_string()))?;
        self.write(data).await
    }

    async fn write(&self, data: Bytes) -> Result<(), SubscriberError> {
        if !self.is_open.load(Ordering::Acquire) {
            return Err(SubscriberError::Closed);
        }
        let mut writer = self.writer.lock().await;
        match timeout(self.write_timeout, writer.write_all(&data)).await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(e)) => Err(SubscriberError::SendFailed(e.to_string())),
            Err(_) => Err(SubscriberError::Timeout(self.write_timeout)),
        }
    }
}

#[async_trait]
impl Subscriber for TcpSubscriber {
    fn protocol(&self) -> Protocol {
        Protocol::Tcp
    }

    async fn send(&self, payload: Outbound) -> Result<(), SubscriberError> {
        match payload {
            Outbound::Binary(data) => self.write(data).await,
            Outbound::Text(_) => Err(SubscriberError::UnsupportedPayload(Protocol::Tcp)),
        }
    }

    async fn close(&self) -> Result<(), SubscriberError> {
        if !self.is_open.swap(false, Ordering::AcqRel) {
            return Ok(());
        }
        let mut writer = self.writer.lock().await;
        match timeout(self.write_timeout, writer.shutdown()).await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(e)) => Err(SubscriberError::CloseFailed(e.to_string())),
            Err(_) => Err(SubscriberError::Timeout(self.write_timeout)),
        }
    }

    fn remote_addr(&self) -> Option<String> {
        Some(self.remote_addr.to_string())
    }
}

/// Listener accepting raw TCP subscribers.
pub struct TcpTransport {
    listener: TcpListener,
    ctx: Arc<SessionContext>,
}

impl TcpTransport {
    /// Bind the listener.
    ///
    /// # Errors
    ///
    /// Returns an error if binding to the address fails.
    pub async fn bind(addr: SocketAddr, ctx: Arc<SessionContext>) -> Result<Self, TransportError> {
        let listener = TcpListener::bind(addr).await?;
        info!("TCP transport listening on {}", addr);
        Ok(Self { listener, ctx })
    }

    /// Get the local address this transport is bound to.
    #[must_use]
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.listener.local_addr().ok()
    }

    /// Accept connections until the task is dropped.
    pub async fn run(self) {
        loop {
            let (stream, addr) = match self.listener.accept().await {
                Ok(accepted) => accepted,
                Err(e) => {
                    error!("TCP accept failed: {}", e);
                    continue;
                }
            };
            debug!("Accepted TCP subscriber from {}", addr);

            let ctx = Arc::clone(&self.ctx);
            tokio::spawn(async move {
                if let Err(e) = handle_connection(stream, addr, ctx).await {
                    debug!("TCP session {} ended: {}", addr, e);
                }
            });
        }
    }
}

async fn handle_connection(
    stream: TcpStream,
    addr: SocketAddr,
    ctx: Arc<SessionContext>,
) -> Result<(), TransportError> {
    stream.set_nodelay(true)?;
    let (mut reader, writer) = stream.into_split();
    let mut buf = BytesMut::with_capacity(4096);
    let subscriber = Arc::new(TcpSubscriber::new(writer, addr, ctx.config.write_timeout));

    let handshake = timeout(
        ctx.config.handshake_timeout,
        codec::read_frame::<_, TcpFrame>(&mut reader, &mut buf),
    )
    .await
    .map_err(|_| TransportError::Timeout(ctx.config.handshake_timeout))??;

    let (key, heartbeat, token) = match handshake {
        Some(TcpFrame::Handshake {
            key,
            heartbeat,
            token,
        }) => (key, heartbeat, token),
        Some(_) => {
            let err = TransportError::UnexpectedFrame("expected handshake");
            reject(&subscriber, &err).await;
            return Err(err);
        }
        None => return Ok(()),
    };

    let attachment = match ctx
        .attach(&key, token.as_deref(), Arc::clone(&subscriber) as Arc<dyn Subscriber>)
        .await
    {
        Ok(attachment) => attachment,
        Err(e) => {
            warn!(key = %key, remote = %addr, error = %e, "TCP subscriber rejected");
            reject(&subscriber, &e).await;
            return Err(e);
        }
    };

    let heartbeat = ctx.config.heartbeat_for(heartbeat);
    let idle = ctx.config.idle_timeout(heartbeat);
    let result = loop {
        match timeout(idle, codec::read_frame::<_, TcpFrame>(&mut reader, &mut buf)).await {
            Err(_) => break Err(TransportError::Timeout(idle)),
            Ok(Ok(Some(TcpFrame::Heartbeat))) => {
                trace!(key = %key, "Heartbeat");
                if let Err(e) = subscriber.send_frame(&TcpFrame::Heartbeat).await {
                    break Err(e.into());
                }
            }
            Ok(Ok(Some(_))) => trace!(key = %key, "Ignoring client frame"),
            Ok(Ok(None)) => break Ok(()),
            Ok(Err(e)) => break Err(e.into()),
        }
    };

    attachment.detach().await;
    if let Err(e) = subscriber.close().await {
        debug!(key = %key, error = %e, "TCP subscriber close failed");
    }
    result
}

async fn reject(subscriber: &TcpSubscriber, err: &TransportError) {
    let frame = TcpFrame::error(err.result_code(), err.to_string());
    if let Err(e) = subscriber.send_frame(&frame).await {
        debug!("Failed to send error frame: {}", e);
    }
    let _ = subscriber.close().await;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::SessionConfig;
    use comet_core::{Message, Registry, RegistryConfig};
    use comet_protocol::ResultCode;

    struct Client {
        stream: TcpStream,
        buf: BytesMut,
    }

    impl Client {
        async fn connect(addr: SocketAddr) -> Self {
            Self {
                stream: TcpStream::connect(addr).await.unwrap(),
                buf: BytesMut::new(),
            }
        }

        async fn send(&mut self, frame: &TcpFrame) {
            codec::write_frame(&mut self.stream, frame).await.unwrap();
        }

        async fn recv(&mut self) -> Option<TcpFrame> {
            timeout(
                Duration::from_secs(5),
                codec::read_frame(&mut self.stream, &mut self.buf),
            )
            .await
            .unwrap()
            .unwrap()
        }
    }

    async fn start(registry: Registry, config: SessionConfig) -> SocketAddr {
        let ctx = Arc::new(SessionContext::new(registry, config));
        let transport = TcpTransport::bind("127.0.0.1:0".parse().unwrap(), ctx)
            .await
            .unwrap();
        let addr = transport.local_addr().unwrap();
        tokio::spawn(transport.run());
        addr
    }

    async fn wait_for_subscribers(registry: &Registry, key: &str, n: usize) {
        for _ in 0..200 {
            if let Ok(channel) = registry.get(key) {
                if channel.subscriber_count().await == n {
                    return;
                }
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("{} never reached {} subscribers", key, n);
    }

    fn tcp_registry(max: usize) -> Registry {
        Registry::with_config(RegistryConfig {
            protocol: Protocol::Tcp,
            max_subscribers_per_key: max,
            ..Default::default()
        })
    }

    #[tokio::test]
    async fn test_handshake_push_and_heartbeat() {
        let registry = tcp_registry(4);
        let addr = start(registry.clone(), SessionConfig::default()).await;

        let mut client = Client::connect(addr).await;
        client.send(&TcpFrame::handshake("u1", 0)).await;
        wait_for_subscribers(&registry, "u1", 1).await;

        let channel = registry.get("u1").unwrap();
        let reached = channel
            .push_msg(Message::expiring_in("hello", 60, "m1"))
            .await
            .unwrap();
        assert_eq!(reached, 1);

        match client.recv().await {
            Some(TcpFrame::Push(frame)) => {
                assert_eq!(frame.msg, "hello");
                assert_eq!(frame.mid, "m1");
            }
            other => panic!("unexpected frame: {:?}", other),
        }

        client.send(&TcpFrame::Heartbeat).await;
        assert_eq!(client.recv().await, Some(TcpFrame::Heartbeat));
    }

    #[tokio::test]
    async fn test_disconnect_detaches() {
        let registry = tcp_registry(4);
        let addr = start(registry.clone(), SessionConfig::default()).await;

        let mut client = Client::connect(addr).await;
        client.send(&TcpFrame::handshake("u1", 0)).await;
        wait_for_subscribers(&registry, "u1", 1).await;

        drop(client);
        wait_for_subscribers(&registry, "u1", 0).await;
        assert!(registry.contains("u1"));
    }

    #[tokio::test]
    async fn test_oversized_heartbeat_request_is_capped() {
        let registry = tcp_registry(4);
        let addr = start(registry.clone(), SessionConfig::default()).await;

        let mut client = Client::connect(addr).await;
        client.send(&TcpFrame::handshake("u1", u64::MAX)).await;
        wait_for_subscribers(&registry, "u1", 1).await;

        client.send(&TcpFrame::Heartbeat).await;
        assert_eq!(client.recv().await, Some(TcpFrame::Heartbeat));

        drop(client);
        wait_for_subscribers(&registry, "u1", 0).await;
    }

    #[tokio::test]
    async fn test_limit_exceeded_sends_error() {
        let registry = tcp_registry(1);
        let addr = start(registry.clone(), SessionConfig::default()).await;

        let mut first = Client::connect(addr).await;
        first.send(&TcpFrame::handshake("u1", 0)).await;
        wait_for_subscribers(&registry, "u1", 1).await;

        let mut second = Client::connect(addr).await;
        second.send(&TcpFrame::handshake("u1", 0)).await;
        match second.recv().await {
            Some(TcpFrame::Error { code, .. }) => assert_eq!(code, ResultCode::AddChannel),
            other => panic!("unexpected frame: {:?}", other),
        }
        assert_eq!(second.recv().await, None);
    }

    #[tokio::test]
    async fn test_missing_handshake_sends_error() {
        let registry = tcp_registry(4);
        let addr = start(registry.clone(), SessionConfig::default()).await;

        let mut client = Client::connect(addr).await;
        client.send(&TcpFrame::Heartbeat).await;
        match client.recv().await {
            Some(TcpFrame::Error { code, .. }) => assert_eq!(code, ResultCode::Param),
            other => panic!("unexpected frame: {:?}", other),
        }
        assert!(registry.is_empty());
    }

    #[tokio::test]
    async fn test_channel_close_ends_session() {
        let registry = tcp_registry(4);
        let addr = start(registry.clone(), SessionConfig::default()).await;

        let mut client = Client::connect(addr).await;
        client.send(&TcpFrame::handshake("u1", 0)).await;
        wait_for_subscribers(&registry, "u1", 1).await;

        registry.get("u1").unwrap().close().await.unwrap();
        assert_eq!(client.recv().await, None);
        assert!(!registry.contains("u1"));
    }

    #[tokio::test]
    async fn test_silent_client_times_out() {
        let registry = tcp_registry(4);
        let addr = start(registry.clone(), SessionConfig::default()).await;

        let mut client = Client::connect(addr).await;
        client.send(&TcpFrame::handshake("u1", 1)).await;
        wait_for_subscribers(&registry, "u1", 1).await;

        assert_eq!(client.recv().await, None);
        wait_for_subscribers(&registry, "u1", 0).await;
    }
}
