//! Consistent-hash ring deciding key ownership across the cluster.
//!
//! Every node builds its ring independently from the same `(nodes, vnodes)`
//! input, so owner lookups must be a pure function of that input: node names
//! are sorted and de-duplicated before expansion, and all hashing uses BLAKE3,
//! which is stable across platforms and releases.
//!
//! Each physical node is expanded into `vnodes` points. Points are cut from
//! BLAKE3 digests of `"{node}-{n}"`, four 64-bit points per digest, in the
//! manner of ketama. A key belongs to the first point at or after its own hash,
//! wrapping around the ring.

use thiserror::Error;

/// Default virtual nodes per physical node.
pub const DEFAULT_VNODES: usize = 160;

/// Upper bound on virtual nodes per physical node.
pub const MAX_VNODES: usize = 10_000;

/// Upper bound on distinct physical nodes.
pub const MAX_NODES: usize = 256;

/// Points cut from one digest.
const POINTS_PER_DIGEST: usize = 4;

/// Hash a key onto the ring.
#[must_use]
pub fn key_hash(key: &[u8]) -> u64 {
    let digest = blake3::hash(key);
    let bytes = digest.as_bytes();
    u64::from_le_bytes([
        bytes[0], bytes[1], bytes[2], bytes[3], bytes[4], bytes[5], bytes[6], bytes[7],
    ])
}

/// Ring construction errors.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum RingError {
    /// The node list is empty.
    #[error("Ring needs at least one node")]
    NoNodes,

    /// A node name is empty.
    #[error("Node names cannot be empty")]
    EmptyNodeName,

    /// The virtual node count is zero.
    #[error("Virtual nodes per node must be positive")]
    ZeroVirtualNodes,

    /// The virtual node count is above [`MAX_VNODES`].
    #[error("Virtual nodes per node must not exceed {MAX_VNODES}, got {0}")]
    TooManyVirtualNodes(usize),

    /// More distinct nodes than [`MAX_NODES`].
    #[error("Ring supports at most {MAX_NODES} nodes, got {0}")]
    TooManyNodes(usize),
}

/// A consistent-hash ring.
#[derive(Debug, Clone)]
pub struct Ring {
    /// Sorted `(point, node index)` pairs.
    points: Vec<(u64, usize)>,
    /// Sorted, de-duplicated node names.
    nodes: Vec<String>,
    vnodes: usize,
}

impl Ring {
    /// Build a ring over `nodes` with `vnodes` points per node.
    ///
    /// # Errors
    ///
    /// Returns an error if there are no nodes or too many, a node name is
    /// empty, or `vnodes` is outside `1..=MAX_VNODES`.
    pub fn new<S: AsRef<str>>(nodes: &[S], vnodes: usize) -> Result<Self, RingError> {
        if vnodes == 0 {
            return Err(RingError::ZeroVirtualNodes);
        }
        if vnodes > MAX_VNODES {
            return Err(RingError::TooManyVirtualNodes(vnodes));
        }

        let mut names: Vec<String> = nodes.iter().map(|n| n.as_ref().trim().to_string()).collect();
        if names.iter().any(String::is_empty) {
            return Err(RingError::EmptyNodeName);
        }
        names.sort();
        names.dedup();
        if names.is_empty() {
            return Err(RingError::NoNodes);
        }
        if names.len() > MAX_NODES {
            return Err(RingError::TooManyNodes(names.len()));
        }

        let mut points = Vec::with_capacity(names.len() * vnodes);
        for (index, name) in names.iter().enumerate() {
            let digests = vnodes.div_ceil(POINTS_PER_DIGEST);
            for n in 0..digests {
                let digest = blake3::hash(format!("{}-{}", name, n).as_bytes());
                for chunk in digest.as_bytes().chunks_exact(8).take(POINTS_PER_DIGEST) {
                    if points.len() == (index + 1) * vnodes {
                        break;
                    }
                    let mut point = [0u8; 8];
                    point.copy_from_slice(chunk);
                    points.push((u64::from_le_bytes(point), index));
                }
            }
        }
        points.sort_unstable();

        Ok(Self {
            points,
            nodes: names,
            vnodes,
        })
    }

    /// The node owning `key`.
    #[must_use]
    pub fn owner(&self, key: &str) -> &str {
        let hash = key_hash(key.as_bytes());
        let at = self.points.partition_point(|(point, _)| *point < hash);
        let (_, index) = self.points[at % self.points.len()];
        &self.nodes[index]
    }

    /// Check whether `node` is part of the ring.
    #[must_use]
    pub fn contains(&self, node: &str) -> bool {
        self.nodes.binary_search_by(|n| n.as_str().cmp(node)).is_ok()
    }

    /// Node names, sorted.
    #[must_use]
    pub fn nodes(&self) -> &[String] {
        &self.nodes
    }

    /// Virtual nodes per physical node.
    #[must_use]
    pub fn vnodes(&self) -> usize {
        self.vnodes
    }

    /// Total number of points on the ring.
    #[must_use]
    pub fn len(&self) -> usize {
        self.points.len()
    }

    /// Always `false`: a ring has at least one point.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.points.is_empty()
    }
}
