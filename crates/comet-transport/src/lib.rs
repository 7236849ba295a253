//! # comet-transport
//!
//! Subscriber transports for the Comet message-delivery node.
//!
//! This crate connects live clients to the channel registry:
//!
//! - **WebSocket** - `GET /sub?key=K`, JSON text push frames, `"h"` heartbeats
//! - **TCP** - length-prefixed MessagePack [`TcpFrame`](comet_protocol::TcpFrame)s
//!
//! Both transports follow the same session lifecycle: authenticate the key,
//! get or create its channel, attach a [`Subscriber`](comet_core::Subscriber),
//! answer heartbeats until the client leaves or goes silent for two
//! intervals, then detach.
//!
//! ```rust,ignore
//! use comet_transport::{SessionContext, TcpTransport, websocket};
//!
//! let ctx = Arc::new(SessionContext::new(registry, SessionConfig::default()));
//! let tcp = TcpTransport::bind(tcp_addr, ctx.clone()).await?;
//! tokio::spawn(tcp.run());
//! let app = websocket::router("/sub", ctx);
//! ```

pub mod session;
pub mod tcp;
pub mod traits;
pub mod websocket;

pub use session::{SessionConfig, SessionContext};
pub use tcp::{TcpSubscriber, TcpTransport};
pub use traits::{AllowAll, TokenCheck, TransportError};
pub use websocket::WebSocketSubscriber;
