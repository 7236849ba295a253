//! WebSocket subscriber transport.
//!
//! Clients connect with `GET {path}?key=K[&heartbeat=S][&token=T]`. Pushes
//! arrive as JSON text frames; the client sends `"h"` as a heartbeat and the
//! server echoes it.

use async_trait::async_trait;
use axum::extract::ws::{Message as WsMessage, WebSocket, WebSocketUpgrade};
use axum::extract::{ConnectInfo, Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::Router;
use comet_core::registry::validate_key;
use comet_core::{Outbound, Protocol, Subscriber, SubscriberError};
use comet_protocol::HEARTBEAT;
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use serde::Deserialize;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::time::timeout;
use tracing::{debug, trace, warn};

use crate::session::SessionContext;
use crate::traits::TransportError;

/// Query parameters of the subscribe request.
#[derive(Debug, Deserialize)]
pub struct SubscribeParams {
    /// Key to subscribe to.
    pub key: String,
    /// Heartbeat interval in seconds; 0 selects the server default.
    #[serde(default)]
    pub heartbeat: u64,
    /// Optional authentication token.
    #[serde(default)]
    pub token: Option<String>,
}

/// Write side of a WebSocket subscriber connection.
pub struct WebSocketSubscriber {
    sink: Mutex<SplitSink<WebSocket, WsMessage>>,
    remote_addr: Option<SocketAddr>,
    write_timeout: Duration,
    is_open: AtomicBool,
}

impl WebSocketSubscriber {
    /// Wrap the sink half of an upgraded socket.
    #[must_use]
    pub fn new(
        sink: SplitSink<WebSocket, WsMessage>,
        remote_addr: Option<SocketAddr>,
        write_timeout: Duration,
    ) -> Self {
        Self {
            sink: Mutex::new(sink),
            remote_addr,
            write_timeout,
            is_open: AtomicBool::new(true),
        }
    }

    async fn write(&self, message: WsMessage) -> Result<(), SubscriberError> {
        if !self.is_open.load(Ordering::Acquire) {
            return Err(SubscriberError::Closed);
        }
        let mut sink = self.sink.lock().await;
        match timeout(self.write_timeout, sink.send(message)).await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(e)) => Err(SubscriberError::SendFailed(e.to_string())),
            Err(_) => Err(SubscriberError::Timeout(self.write_timeout)),
        }
    }

    /// Answer a client heartbeat.
    ///
    /// # Errors
    ///
    /// Fails if the write fails or the connection is closed.
    pub async fn send_heartbeat(&self) -> Result<(), SubscriberError> {
        self.write(WsMessage::Text(HEARTBEAT.to_string())).await
    }
}

#[async_trait]
impl Subscriber for WebSocketSubscriber {
    fn protocol(&self) -> Protocol {
        Protocol::WebSocket
    }

    async fn send(&self, payload: Outbound) -> Result<(), SubscriberError> {
        match payload {
            Outbound::Text(text) => self.write(WsMessage::Text(text.to_string())).await,
            Outbound::Binary(_) => Err(SubscriberError::UnsupportedPayload(Protocol::WebSocket)),
        }
    }

    async fn close(&self) -> Result<(), SubscriberError> {
        if !self.is_open.swap(false, Ordering::AcqRel) {
            return Ok(());
        }
        let mut sink = self.sink.lock().await;
        match timeout(self.write_timeout, sink.close()).await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(e)) => Err(SubscriberError::CloseFailed(e.to_string())),
            Err(_) => Err(SubscriberError::Timeout(self.write_timeout)),
        }
    }

    fn remote_addr(&self) -> Option<String> {
        self.remote_addr.map(|addr| addr.to_string())
    }
}

/// Router serving WebSocket subscribers at `path`.
///
/// Serve it with `into_make_service_with_connect_info::<SocketAddr>()` to have
/// remote addresses recorded.
pub fn router(path: &str, ctx: Arc<SessionContext>) -> Router {
    Router::new().route(path, get(ws_handler)).with_state(ctx)
}

/// Upgrade handler; validates the request before upgrading.
pub async fn ws_handler(
    ws: WebSocketUpgrade,
    Query(params): Query<SubscribeParams>,
    connect_info: Option<ConnectInfo<SocketAddr>>,
    State(ctx): State<Arc<SessionContext>>,
) -> Response {
    if let Err(reason) = validate_key(&params.key) {
        return (StatusCode::BAD_REQUEST, reason).into_response();
    }
    if !ctx.auth.check(&params.key, params.token.as_deref()) {
        return StatusCode::UNAUTHORIZED.into_response();
    }

    let remote_addr = connect_info.map(|ConnectInfo(addr)| addr);
    ws.on_upgrade(move |socket| async move {
        if let Err(e) = run_session(socket, params, remote_addr, ctx).await {
            debug!("WebSocket session ended: {}", e);
        }
    })
}

/// Drive one subscriber session to completion.
///
/// # Errors
///
/// Returns the reason the session ended, if it was not a clean close.
pub async fn run_session(
    socket: WebSocket,
    params: SubscribeParams,
    remote_addr: Option<SocketAddr>,
    ctx: Arc<SessionContext>,
) -> Result<(), TransportError> {
    let (sink, stream) = socket.split();
    let subscriber = Arc::new(WebSocketSubscriber::new(
        sink,
        remote_addr,
        ctx.config.write_timeout,
    ));

    let attachment = match ctx
        .attach(
            &params.key,
            params.token.as_deref(),
            Arc::clone(&subscriber) as Arc<dyn Subscriber>,
        )
        .await
    {
        Ok(attachment) => attachment,
        Err(e) => {
            warn!(key = %params.key, error = %e, "WebSocket subscriber rejected");
            let _ = subscriber.close().await;
            return Err(e);
        }
    };

    let heartbeat = ctx.config.heartbeat_for(params.heartbeat);
    let result = read_loop(
        stream,
        &subscriber,
        &params.key,
        ctx.config.idle_timeout(heartbeat),
    )
    .await;

    attachment.detach().await;
    if let Err(e) = subscriber.close().await {
        debug!(key = %params.key, error = %e, "WebSocket subscriber close failed");
    }
    result
}

async fn read_loop(
    mut stream: SplitStream<WebSocket>,
    subscriber: &WebSocketSubscriber,
    key: &str,
    idle: Duration,
) -> Result<(), TransportError> {
    loop {
        match timeout(idle, stream.next()).await {
            Err(_) => return Err(TransportError::Timeout(idle)),
            Ok(Some(Ok(WsMessage::Text(text)))) if text == HEARTBEAT => {
                trace!(key = %key, "Heartbeat");
                subscriber.send_heartbeat().await?;
            }
            Ok(Some(Ok(WsMessage::Close(_)))) | Ok(None) => return Ok(()),
            Ok(Some(Ok(_))) => trace!(key = %key, "Ignoring client frame"),
            Ok(Some(Err(e))) => return Err(TransportError::WebSocket(e.to_string())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::SessionConfig;
    use comet_core::{Message, Registry};
    use tokio_tungstenite::connect_async;
    use tokio_tungstenite::tungstenite::Message as ClientMessage;

    async fn start(registry: Registry) -> SocketAddr {
        let ctx = Arc::new(SessionContext::new(registry, SessionConfig::default()));
        let app = router("/sub", ctx);
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(
                listener,
                app.into_make_service_with_connect_info::<SocketAddr>(),
            )
            .await
            .unwrap();
        });
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

    #[tokio::test]
    async fn test_push_reaches_client() {
        let registry = Registry::new();
        let addr = start(registry.clone()).await;

        let (mut client, _) = connect_async(format!("ws://{}/sub?key=u1", addr))
            .await
            .unwrap();
        wait_for_subscribers(&registry, "u1", 1).await;

        let reached = registry
            .get("u1")
            .unwrap()
            .push_msg(Message::expiring_in("hello", 60, "m1"))
            .await
            .unwrap();
        assert_eq!(reached, 1);

        match client.next().await {
            Some(Ok(ClientMessage::Text(text))) => {
                let frame: comet_protocol::PushFrame = serde_json::from_str(&text).unwrap();
                assert_eq!(frame.msg, "hello");
                assert_eq!(frame.mid, "m1");
            }
            other => panic!("unexpected message: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_heartbeat_is_echoed() {
        let registry = Registry::new();
        let addr = start(registry.clone()).await;

        let (mut client, _) = connect_async(format!("ws://{}/sub?key=u1&heartbeat=5", addr))
            .await
            .unwrap();
        client.send(ClientMessage::Text(HEARTBEAT.into())).await.unwrap();

        match client.next().await {
            Some(Ok(ClientMessage::Text(text))) => assert_eq!(text, HEARTBEAT),
            other => panic!("unexpected message: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_oversized_heartbeat_request_is_capped() {
        let registry = Registry::new();
        let addr = start(registry.clone()).await;

        let url = format!("ws://{}/sub?key=u1&heartbeat={}", addr, u64::MAX);
        let (mut client, _) = connect_async(url).await.unwrap();
        wait_for_subscribers(&registry, "u1", 1).await;

        client.send(ClientMessage::Text(HEARTBEAT.into())).await.unwrap();
        match client.next().await {
            Some(Ok(ClientMessage::Text(text))) => assert_eq!(text, HEARTBEAT),
            other => panic!("unexpected message: {:?}", other),
        }

        client.close(None).await.unwrap();
        wait_for_subscribers(&registry, "u1", 0).await;
    }

    #[tokio::test]
    async fn test_disconnect_detaches() {
        let registry = Registry::new();
        let addr = start(registry.clone()).await;

        let (mut client, _) = connect_async(format!("ws://{}/sub?key=u1", addr))
            .await
            .unwrap();
        wait_for_subscribers(&registry, "u1", 1).await;

        client.close(None).await.unwrap();
        wait_for_subscribers(&registry, "u1", 0).await;
    }

    #[tokio::test]
    async fn test_invalid_key_is_refused() {
        let registry = Registry::new();
        let addr = start(registry.clone()).await;

        assert!(connect_async(format!("ws://{}/sub?key=", addr)).await.is_err());
        assert!(connect_async(format!("ws://{}/sub", addr)).await.is_err());
        assert!(registry.is_empty());
    }

    #[tokio::test]
    async fn test_channel_close_closes_client() {
        let registry = Registry::new();
        let addr = start(registry.clone()).await;

        let (mut client, _) = connect_async(format!("ws://{}/sub?key=u1", addr))
            .await
            .unwrap();
        wait_for_subscribers(&registry, "u1", 1).await;

        registry.get("u1").unwrap().close().await.unwrap();
        match client.next().await {
            Some(Ok(ClientMessage::Close(_))) | None => {}
            other => panic!("unexpected message: {:?}", other),
        }
    }
}
