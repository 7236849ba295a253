//! Subscriber session lifecycle shared by every transport.

use comet_core::{Channel, Protocol, Registry, Subscriber, SubscriberId};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

use crate::traits::{AllowAll, TokenCheck, TransportError};

/// Session timing.
#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// Heartbeat interval used when the client does not ask for one.
    pub heartbeat: Duration,
    /// Longest heartbeat interval a client may ask for.
    pub max_heartbeat: Duration,
    /// Upper bound on a single write to a subscriber.
    pub write_timeout: Duration,
    /// Time a raw TCP client has to send its handshake.
    pub handshake_timeout: Duration,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            heartbeat: Duration::from_secs(30),
            max_heartbeat: Duration::from_secs(600),
            write_timeout: Duration::from_secs(5),
            handshake_timeout: Duration::from_secs(10),
        }
    }
}

impl SessionConfig {
    /// Heartbeat interval for a client that asked for `requested_secs`,
    /// capped at `max_heartbeat`.
    #[must_use]
    pub fn heartbeat_for(&self, requested_secs: u64) -> Duration {
        if requested_secs == 0 {
            self.heartbeat
        } else {
            Duration::from_secs(requested_secs).min(self.max_heartbeat)
        }
    }

    /// Silence after which a session is considered dead: two missed heartbeats.
    #[must_use]
    pub fn idle_timeout(&self, heartbeat: Duration) -> Duration {
        heartbeat.saturating_mul(2)
    }
}

/// Everything a session needs from the node.
pub struct SessionContext {
    /// Channel registry.
    pub registry: Registry,
    /// Session timing.
    pub config: SessionConfig,
    /// Token check run before attaching.
    pub auth: Arc<dyn TokenCheck>,
}

impl SessionContext {
    /// Create a context that admits every client.
    #[must_use]
    pub fn new(registry: Registry, config: SessionConfig) -> Self {
        Self {
            registry,
            config,
            auth: Arc::new(AllowAll),
        }
    }

    /// Replace the token check.
    #[must_use]
    pub fn with_auth(mut self, auth: Arc<dyn TokenCheck>) -> Self {
        self.auth = auth;
        self
    }

    /// Authenticate, then attach `subscriber` to the channel for `key`.
    ///
    /// The channel is created with the subscriber's protocol if none exists.
    ///
    /// # Errors
    ///
    /// Fails if the key is invalid, the token is rejected, or the channel
    /// refuses the subscriber.
    pub async fn attach(
        &self,
        key: &str,
        token: Option<&str>,
        subscriber: Arc<dyn Subscriber>,
    ) -> Result<Attachment, TransportError> {
        if !self.auth.check(key, token) {
            return Err(TransportError::Unauthorized(key.to_string()));
        }
        let channel = self.registry.get_or_new(key, subscriber.protocol())?;
        let id = channel.attach(subscriber).await?;
        debug!(key = %key, subscriber = id, "Subscriber attached");
        Ok(Attachment {
            channel,
            id,
            detached: false,
        })
    }
}

impl fmt::Debug for SessionContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SessionContext")
            .field("registry", &self.registry)
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

/// A subscriber's place in a channel.
///
/// Dropping an attachment that was not detached (a cancelled or panicking
/// session) detaches it on the runtime.
#[derive(Debug)]
pub struct Attachment {
    channel: Arc<dyn Channel>,
    id: SubscriberId,
    detached: bool,
}

impl Attachment {
    /// The channel the subscriber is attached to.
    #[must_use]
    pub fn channel(&self) -> &Arc<dyn Channel> {
        &self.channel
    }

    /// Protocol of the channel.
    #[must_use]
    pub fn protocol(&self) -> Protocol {
        self.channel.protocol()
    }

    /// Leave the channel. The channel itself stays registered.
    pub async fn detach(mut self) {
        if self.channel.detach(self.id).await {
            debug!(key = %self.channel.key(), subscriber = self.id, "Subscriber detached");
        }
        self.detached = true;
    }
}

impl Drop for Attachment {
    fn drop(&mut self) {
        if self.detached {
            return;
        }
        let channel = Arc::clone(&self.channel);
        let id = self.id;
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                handle.spawn(async move {
                    if channel.detach(id).await {
                        warn!(key = %channel.key(), subscriber = id, "Detached abandoned subscriber");
                    }
                });
            }
            Err(_) => warn!(key = %channel.key(), subscriber = id, "No runtime to detach subscriber"),
        }
    }
}
