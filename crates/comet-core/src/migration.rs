//! Key migration on cluster membership change.
//!
//! When the node set changes, every node rebuilds the ring from the same input
//! and closes the channels it no longer owns. Subscribers of evicted keys
//! reconnect and are routed to their new owner.
//!
//! The walk is not transactional across shards. Each shard is snapshotted
//! under its own lock, then all evictions are closed after the walk, so
//! ordinary traffic on a shard is only stalled for the length of one scan.

use thiserror::Error;
use tracing::{debug, error, info, warn};

use crate::channel::ChannelError;
use crate::registry::Registry;
use crate::ring::{Ring, RingError};

/// Migration errors.
#[derive(Debug, Error)]
pub enum MigrationError {
    /// The ring input is invalid.
    #[error("Invalid ring: {0}")]
    Ring(#[from] RingError),

    /// The new node set does not include this node.
    #[error("Local node {0} is not in the migration node list")]
    LocalNodeMissing(String),

    /// The ring build task did not complete.
    #[error("Ring build aborted: {0}")]
    Aborted(String),
}

/// Outcome of a migration pass.
#[derive(Debug, Default)]
pub struct MigrationReport {
    /// Shards walked.
    pub shards_scanned: usize,
    /// Channels this node no longer owns.
    pub evicted: usize,
    /// Evicted channels that did not close cleanly, by key.
    pub failures: Vec<(String, ChannelError)>,
}

impl MigrationReport {
    /// Check whether every eviction closed cleanly.
    #[must_use]
    pub fn is_clean(&self) -> bool {
        self.failures.is_empty()
    }
}

/// Evicts channels whose keys moved to other nodes.
#[derive(Debug, Clone)]
pub struct Migrator {
    registry: Registry,
    local_node: String,
}

impl Migrator {
    /// Create a migrator for the node named `local_node`.
    ///
    /// The name is trimmed the same way ring node names are.
    #[must_use]
    pub fn new(registry: Registry, local_node: impl Into<String>) -> Self {
        let local_node = local_node.into();
        Self {
            registry,
            local_node: local_node.trim().to_string(),
        }
    }

    /// Name of this node.
    #[must_use]
    pub fn local_node(&self) -> &str {
        &self.local_node
    }

    /// Migrate to the node set `nodes` with `vnodes` points per node.
    ///
    /// # Errors
    ///
    /// Fails without touching the registry if the ring input is invalid or does
    /// not include this node; such a ring would evict every key.
    pub async fn migrate<S: AsRef<str>>(
        &self,
        nodes: &[S],
        vnodes: usize,
    ) -> Result<MigrationReport, MigrationError> {
        let names: Vec<String> = nodes.iter().map(|n| n.as_ref().to_string()).collect();
        let ring = tokio::task::spawn_blocking(move || Ring::new(&names, vnodes))
            .await
            .map_err(|e| MigrationError::Aborted(e.to_string()))??;
        if !ring.contains(&self.local_node) {
            error!(
                node = %self.local_node,
                nodes = ?ring.nodes(),
                "Migration node list does not include this node, refusing to evict every key"
            );
            return Err(MigrationError::LocalNodeMissing(self.local_node.clone()));
        }
        Ok(self.evict(&ring).await)
    }

    /// Close every channel whose owner on `ring` is not this node.
    pub async fn evict(&self, ring: &Ring) -> MigrationReport {
        let mut report = MigrationReport::default();
        let mut evictions = Vec::new();

        for index in 0..self.registry.shard_count() {
            let moved = self.registry.scan_shard(index, |key| {
                let owner = ring.owner(key);
                if owner != self.local_node {
                    debug!(key = %key, owner = %owner, "Key moved");
                    true
                } else {
                    false
                }
            });
            debug!(shard = index, moved = moved.len(), "Migrated shard");
            evictions.extend(moved);
            report.shards_scanned += 1;
            tokio::task::yield_now().await;
        }

        info!(channels = evictions.len(), "Closing migrated channels");
        report.evicted = evictions.len();
        for channel in evictions {
            if let Err(e) = channel.close().await {
                warn!(key = %channel.key(), error = %e, "Migrated channel close failed");
                report.failures.push((channel.key().to_string(), e));
            }
        }

        info!(
            node = %self.local_node,
            evicted = report.evicted,
            failed = report.failures.len(),
            "Migration finished"
        );
        report
    }
}
