//! # comet-core
//!
//! Core types and concurrency machinery of the Comet message-delivery node.
//!
//! This crate provides the fundamental building blocks:
//!
//! - **Message** - Immutable push payload with an absolute expiry
//! - **Channel** - Per-key delivery endpoint over live subscriber connections
//! - **Registry** - Sharded concurrent map from key to channel
//! - **Ring** - Consistent-hash ring deciding which node owns a key
//! - **Migrator** - Evicts channels this node no longer owns
//! - **PushStats** - Process-wide publish counters
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────┐     ┌─────────────┐     ┌─────────────┐     ┌─────────────┐
//! │  RPC call   │────▶│  Registry   │────▶│  Channel    │────▶│ Subscribers │
//! └─────────────┘     └─────────────┘     └─────────────┘     └─────────────┘
//!                            ▲
//!                            │ shard walk
//!                     ┌─────────────┐     ┌─────────────┐
//!                     │  Migrator   │────▶│    Ring     │
//!                     └─────────────┘     └─────────────┘
//! ```

pub mod channel;
pub mod message;
pub mod migration;
pub mod registry;
pub mod ring;
pub mod stats;
pub mod subscriber;

pub use channel::{Channel, ChannelError, ChannelId, Protocol, TcpChannel, WebSocketChannel};
pub use message::{resolve_expire_secs, Message, MessageId};
pub use migration::{MigrationError, MigrationReport, Migrator};
pub use registry::{Registry, RegistryConfig, RegistryError, RegistryStats};
pub use ring::{Ring, RingError, DEFAULT_VNODES, MAX_NODES, MAX_VNODES};
pub use stats::{PushStats, PushStatsSnapshot};
pub use subscriber::{Outbound, Subscriber, SubscriberError, SubscriberId};
