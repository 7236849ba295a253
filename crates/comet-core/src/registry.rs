//! Sharded channel registry for Comet.
//!
//! The registry is the single source of truth for which keys this node holds
//! live channels for. Keys are spread over a fixed array of independently
//! locked shards so that traffic on different keys rarely contends, and so a
//! migration pass can snapshot one shard at a time.
//!
//! Shard locks are only held for map operations. Anything that can block on
//! the network (pushing, closing) happens on the channel after the lock is
//! released.

use parking_lot::Mutex;
use std::collections::hash_map::Entry;
use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::channel::{Channel, ChannelId, Protocol, TcpChannel, WebSocketChannel};
use crate::ring::key_hash;

/// Maximum key length in bytes.
pub const MAX_KEY_LENGTH: usize = 256;

/// Default number of shards.
pub const DEFAULT_SHARDS: usize = 16;

/// Default maximum subscriber connections per key.
pub const DEFAULT_MAX_SUBSCRIBERS_PER_KEY: usize = 16;

/// Validate a subscriber key.
///
/// # Errors
///
/// Returns an error message if the key is invalid.
pub fn validate_key(key: &str) -> Result<(), &'static str> {
    if key.is_empty() {
        return Err("Key cannot be empty");
    }
    if key.len() > MAX_KEY_LENGTH {
        return Err("Key too long");
    }
    if key.chars().any(char::is_control) {
        return Err("Key contains control characters");
    }
    Ok(())
}

/// Registry errors.
#[derive(Debug, Error)]
pub enum RegistryError {
    /// Invalid key.
    #[error("Invalid key: {0}")]
    InvalidKey(&'static str),

    /// No live channel for the key.
    #[error("Channel not found: {0}")]
    NotFound(String),

    /// A live channel already exists for the key.
    #[error("Channel already exists: {0}")]
    AlreadyExists(String),
}

/// Registry configuration.
#[derive(Debug, Clone)]
pub struct RegistryConfig {
    /// Number of shards.
    pub shards: usize,
    /// Maximum subscriber connections per key.
    pub max_subscribers_per_key: usize,
    /// Protocol of channels created by [`Registry::new_channel`].
    pub protocol: Protocol,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            shards: DEFAULT_SHARDS,
            max_subscribers_per_key: DEFAULT_MAX_SUBSCRIBERS_PER_KEY,
            protocol: Protocol::default(),
        }
    }
}

type Shard = Mutex<HashMap<String, Arc<dyn Channel>>>;

struct Inner {
    shards: Box<[Shard]>,
    config: RegistryConfig,
    next_id: AtomicU64,
}

impl Inner {
    fn shard(&self, key: &str) -> &Shard {
        let index = (key_hash(key.as_bytes()) % self.shards.len() as u64) as usize;
        &self.shards[index]
    }

    /// Remove `key` only if it still maps to the channel instance `id`.
    fn remove_if(&self, key: &str, id: ChannelId) -> bool {
        let mut shard = self.shard(key).lock();
        match shard.get(key) {
            Some(channel) if channel.id() == id => {
                shard.remove(key);
                true
            }
            _ => false,
        }
    }
}

/// Handle a channel keeps to detach itself from its registry on close.
#[derive(Clone)]
pub(crate) struct RegistryLink(Weak<Inner>);

impl RegistryLink {
    pub(crate) fn detach(&self, key: &str, id: ChannelId) {
        if let Some(inner) = self.0.upgrade() {
            if inner.remove_if(key, id) {
                debug!(key = %key, channel = id, "Channel detached from registry");
            }
        }
    }

    #[cfg(test)]
    pub(crate) fn detached() -> Self {
        Self(Weak::new())
    }
}

/// The channel registry.
///
/// Cloning is cheap; clones share the same shards.
#[derive(Clone)]
pub struct Registry {
    inner: Arc<Inner>,
}

impl Registry {
    /// Create a new registry with default configuration.
    #[must_use]
    pub fn new() -> Self {
        Self::with_config(RegistryConfig::default())
    }

    /// Create a new registry with custom configuration.
    #[must_use]
    pub fn with_config(config: RegistryConfig) -> Self {
        info!("Creating registry with config: {:?}", config);
        let shards = (0..config.shards.max(1))
            .map(|_| Mutex::new(HashMap::new()))
            .collect();
        Self {
            inner: Arc::new(Inner {
                shards,
                config,
                next_id: AtomicU64::new(1),
            }),
        }
    }

    /// Get the registry configuration.
    #[must_use]
    pub fn config(&self) -> &RegistryConfig {
        &self.inner.config
    }

    /// Number of shards.
    #[must_use]
    pub fn shard_count(&self) -> usize {
        self.inner.shards.len()
    }

    /// Create the channel for `key` with the configured protocol.
    ///
    /// # Errors
    ///
    /// Returns [`RegistryError::AlreadyExists`] if a live channel exists for the key.
    pub fn new_channel(&self, key: &str) -> Result<Arc<dyn Channel>, RegistryError> {
        self.new_channel_with(key, self.inner.config.protocol)
    }

    /// Create the channel for `key` with a specific protocol.
    ///
    /// # Errors
    ///
    /// Returns an error if the key is invalid or a live channel exists for it.
    pub fn new_channel_with(
        &self,
        key: &str,
        protocol: Protocol,
    ) -> Result<Arc<dyn Channel>, RegistryError> {
        validate_key(key).map_err(RegistryError::InvalidKey)?;

        let mut shard = self.inner.shard(key).lock();
        match shard.entry(key.to_string()) {
            Entry::Occupied(mut entry) => {
                if !entry.get().is_closed() {
                    return Err(RegistryError::AlreadyExists(key.to_string()));
                }
                // Closed but not yet detached; the new instance takes the slot.
                let channel = self.make_channel(key, protocol);
                entry.insert(Arc::clone(&channel));
                debug!(key = %key, %protocol, "Replaced closed channel");
                Ok(channel)
            }
            Entry::Vacant(entry) => {
                let channel = self.make_channel(key, protocol);
                entry.insert(Arc::clone(&channel));
                debug!(key = %key, %protocol, "Created channel");
                Ok(channel)
            }
        }
    }

    /// Get the live channel for `key`.
    ///
    /// # Errors
    ///
    /// Returns [`RegistryError::NotFound`] if there is none.
    pub fn get(&self, key: &str) -> Result<Arc<dyn Channel>, RegistryError> {
        self.inner
            .shard(key)
            .lock()
            .get(key)
            .filter(|channel| !channel.is_closed())
            .cloned()
            .ok_or_else(|| RegistryError::NotFound(key.to_string()))
    }

    /// Get the live channel for `key`, creating it if needed.
    ///
    /// Used by subscriber sessions, which bring their own protocol.
    ///
    /// # Errors
    ///
    /// Returns an error if the key is invalid.
    pub fn get_or_new(&self, key: &str, protocol: Protocol) -> Result<Arc<dyn Channel>, RegistryError> {
        loop {
            match self.get(key) {
                Ok(channel) => return Ok(channel),
                Err(RegistryError::NotFound(_)) => {}
                Err(e) => return Err(e),
            }
            match self.new_channel_with(key, protocol) {
                Ok(channel) => return Ok(channel),
                // Lost a creation race; the winner's channel is there now.
                Err(RegistryError::AlreadyExists(_)) => continue,
                Err(e) => return Err(e),
            }
        }
    }

    /// Detach the channel for `key` without closing it.
    ///
    /// Idempotent: removing an absent key returns `None`.
    pub fn remove(&self, key: &str) -> Option<Arc<dyn Channel>> {
        let removed = self.inner.shard(key).lock().remove(key);
        if removed.is_some() {
            debug!(key = %key, "Removed channel");
        }
        removed
    }

    /// Check whether a live channel exists for `key`.
    #[must_use]
    pub fn contains(&self, key: &str) -> bool {
        self.get(key).is_ok()
    }

    /// Number of registered channels.
    #[must_use]
    pub fn len(&self) -> usize {
        self.inner.shards.iter().map(|s| s.lock().len()).sum()
    }

    /// Check whether the registry holds no channels.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.inner.shards.iter().all(|s| s.lock().is_empty())
    }

    /// Get all registered keys.
    #[must_use]
    pub fn keys(&self) -> Vec<String> {
        self.inner
            .shards
            .iter()
            .flat_map(|s| s.lock().keys().cloned().collect::<Vec<_>>())
            .collect()
    }

    /// Snapshot the channels of one shard whose key matches `select`.
    ///
    /// The shard lock is held for the duration of the walk and released
    /// before returning. An `index` at or past [`Registry::shard_count`]
    /// selects nothing.
    pub fn scan_shard<F>(&self, index: usize, mut select: F) -> Vec<Arc<dyn Channel>>
    where
        F: FnMut(&str) -> bool,
    {
        let Some(shard) = self.inner.shards.get(index) else {
            return Vec::new();
        };
        shard
            .lock()
            .iter()
            .filter(|(key, _)| select(key))
            .map(|(_, channel)| Arc::clone(channel))
            .collect()
    }

    /// Close every channel, tolerating individual failures.
    ///
    /// Returns the number of channels that failed to close cleanly.
    pub async fn close_all(&self) -> usize {
        let mut channels = Vec::new();
        for index in 0..self.shard_count() {
            channels.extend(self.scan_shard(index, |_| true));
        }

        let total = channels.len();
        let mut failed = 0;
        for channel in channels {
            if let Err(e) = channel.close().await {
                warn!(key = %channel.key(), error = %e, "Channel close failed");
                failed += 1;
            }
        }

        info!(channels = total, failed, "Closed all channels");
        failed
    }

    /// Get registry statistics.
    #[must_use]
    pub fn stats(&self) -> RegistryStats {
        RegistryStats {
            channel_count: self.len(),
            shard_count: self.shard_count(),
        }
    }

    fn make_channel(&self, key: &str, protocol: Protocol) -> Arc<dyn Channel> {
        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        let max = self.inner.config.max_subscribers_per_key;
        let link = RegistryLink(Arc::downgrade(&self.inner));
        match protocol {
            Protocol::WebSocket => Arc::new(WebSocketChannel::new(key.to_string(), id, max, link)),
            Protocol::Tcp => Arc::new(TcpChannel::new(key.to_string(), id, max, link)),
        }
    }
}

impl Default for Registry {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for Registry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Registry")
            .field("shards", &self.shard_count())
            .field("config", &self.inner.config)
            .finish()
    }
}

/// Registry statistics.
#[derive(Debug, Clone)]
pub struct RegistryStats {
    /// Number of registered channels.
    pub channel_count: usize,
    /// Number of shards.
    pub shard_count: usize,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::Message;
    use crate::subscriber::testing::RecordingSubscriber;

    #[test]
    fn test_get_unknown_key() {
        let registry = Registry::new();
        assert!(matches!(registry.get("u1"), Err(RegistryError::NotFound(_))));
    }

    #[test]
    fn test_new_then_get_returns_same_channel() {
        let registry = Registry::new();
        let created = registry.new_channel("u1").unwrap();
        let fetched = registry.get("u1").unwrap();
        assert!(Arc::ptr_eq(&created, &fetched));
        assert_eq!(fetched.key(), "u1");
        assert_eq!(fetched.protocol(), Protocol::WebSocket);
    }

    #[test]
    fn test_second_new_reports_already_exists() {
        let registry = Registry::new();
        let first = registry.new_channel("u1").unwrap();

        assert!(matches!(
            registry.new_channel("u1"),
            Err(RegistryError::AlreadyExists(_))
        ));
        assert!(Arc::ptr_eq(&first, &registry.get("u1").unwrap()));
    }

    #[test]
    fn test_invalid_keys() {
        let registry = Registry::new();
        assert!(matches!(registry.new_channel(""), Err(RegistryError::InvalidKey(_))));
        assert!(matches!(
            registry.new_channel(&"k".repeat(MAX_KEY_LENGTH + 1)),
            Err(RegistryError::InvalidKey(_))
        ));
        assert!(matches!(registry.new_channel("a\nb"), Err(RegistryError::InvalidKey(_))));
    }

    #[test]
    fn test_remove_is_idempotent() {
        let registry = Registry::new();
        registry.new_channel("u1").unwrap();
        assert!(registry.remove("u1").is_some());
        assert!(registry.remove("u1").is_none());
        assert!(!registry.contains("u1"));
    }

    #[tokio::test]
    async fn test_close_detaches_channel() {
        let registry = Registry::new();
        let channel = registry.new_channel("u1").unwrap();

        channel.close().await.unwrap();
        assert!(matches!(registry.get("u1"), Err(RegistryError::NotFound(_))));
        assert!(registry.is_empty());

        // The key can be created again.
        let again = registry.new_channel("u1").unwrap();
        assert_ne!(again.id(), channel.id());
    }

    #[tokio::test]
    async fn test_stale_close_does_not_detach_new_instance() {
        let registry = Registry::new();
        let old = registry.new_channel("u1").unwrap();
        registry.remove("u1");
        let new = registry.new_channel("u1").unwrap();

        old.close().await.unwrap();
        assert!(Arc::ptr_eq(&new, &registry.get("u1").unwrap()));
    }

    #[tokio::test]
    async fn test_concurrent_new_has_one_winner() {
        let registry = Registry::new();
        let mut handles = Vec::new();
        for _ in 0..16 {
            let registry = registry.clone();
            handles.push(tokio::spawn(async move { registry.new_channel("hot").is_ok() }));
        }

        let mut winners = 0;
        for handle in handles {
            if handle.await.unwrap() {
                winners += 1;
            }
        }
        assert_eq!(winners, 1);
        assert_eq!(registry.len(), 1);
    }

    #[tokio::test]
    async fn test_get_or_new() {
        let registry = Registry::new();
        let a = registry.get_or_new("u1", Protocol::Tcp).unwrap();
        let b = registry.get_or_new("u1", Protocol::Tcp).unwrap();
        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(a.protocol(), Protocol::Tcp);

        let sub = RecordingSubscriber::new(Protocol::Tcp);
        a.attach(sub.clone()).await.unwrap();
        b.push_msg(Message::new("hi", 0, "m1")).await.unwrap();
        assert_eq!(sub.received().len(), 1);
    }

    #[test]
    fn test_keys_spread_over_shards() {
        let registry = Registry::with_config(RegistryConfig {
            shards: 8,
            ..Default::default()
        });
        for i in 0..200 {
            registry.new_channel(&format!("user:{}", i)).unwrap();
        }

        assert_eq!(registry.len(), 200);
        let populated = (0..registry.shard_count())
            .filter(|&i| !registry.scan_shard(i, |_| true).is_empty())
            .count();
        assert_eq!(populated, 8);
    }

    #[test]
    fn test_scan_shard_filters_by_key() {
        let registry = Registry::with_config(RegistryConfig {
            shards: 1,
            ..Default::default()
        });
        registry.new_channel("keep:1").unwrap();
        registry.new_channel("drop:1").unwrap();
        registry.new_channel("drop:2").unwrap();

        let mut selected: Vec<String> = registry
            .scan_shard(0, |key| key.starts_with("drop:"))
            .iter()
            .map(|c| c.key().to_string())
            .collect();
        selected.sort();
        assert_eq!(selected, vec!["drop:1", "drop:2"]);
        assert_eq!(registry.len(), 3);
    }

    #[test]
    fn test_scan_shard_out_of_range() {
        let registry = Registry::with_config(RegistryConfig {
            shards: 2,
            ..Default::default()
        });
        registry.new_channel("u1").unwrap();

        assert!(registry.scan_shard(2, |_| true).is_empty());
        assert!(registry.scan_shard(usize::MAX, |_| true).is_empty());
    }

    #[tokio::test]
    async fn test_close_all_tolerates_failures() {
        let registry = Registry::new();
        let bad = registry.new_channel("bad").unwrap();
        bad.attach(RecordingSubscriber::failing_close(Protocol::WebSocket))
            .await
            .unwrap();
        registry.new_channel("good").unwrap();

        assert_eq!(registry.close_all().await, 1);
        assert!(registry.is_empty());
    }

    #[test]
    fn test_stats() {
        let registry = Registry::new();
        registry.new_channel("a").unwrap();
        registry.new_channel("b").unwrap();

        let stats = registry.stats();
        assert_eq!(stats.channel_count, 2);
        assert_eq!(stats.shard_count, DEFAULT_SHARDS);
    }
}
