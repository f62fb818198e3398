//! Module that contains the key space mappings (ie: which host owns which
//! region of the multi-dimensional key space).
//!
//! Two interchangeable [`KeyMapping`] strategies are implemented on top of the
//! same [`PartitionTree`]:
//!  1. [`bit_trie::BitTrieMapping`] - dimension agnostic, answers ownership by
//!     descending the tree one key bit at a time
//!  2. [`zorder::ZOrderMapping`] - turns every tree leaf into an axis-aligned
//!     hyper-rectangle ([`Zone`]) on the Z-order curve and answers ownership
//!     through geometric intersection
//!
//! [`PartitionTree`]: partition_tree::PartitionTree

use serde::{Deserialize, Serialize};
use std::fmt::Display;

pub mod bit_trie;
pub mod partition_tree;
pub mod zcode;
pub mod zorder;

/// A point in the multi-dimensional key space. One coordinate per dimension,
/// each constrained to the low `depth` bits.
pub type Key = Vec<u64>;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub enum Error {
    /// The mapping holds no hosts
    Empty,
    /// The mapping was invalidated by a host removal and must be replaced
    /// before it can serve reads again
    Inconsistent,
    UnknownHost { host: String },
    DimensionMismatch { expected: usize, got: usize },
    Serialization { reason: String },
}

impl Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:?}", self)
    }
}

impl std::error::Error for Error {}

/// An axis-aligned hyper-rectangle of the key space, bounds inclusive.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Zone {
    pub start: Key,
    pub end: Key,
}

impl Zone {
    pub fn new(start: Key, end: Key) -> Self {
        Self { start, end }
    }

    /// Returns true if the given point lies inside this zone
    pub fn contains(&self, key: &[u64]) -> bool {
        key.len() == self.start.len()
            && key
                .iter()
                .zip(self.start.iter().zip(self.end.iter()))
                .all(|(k, (s, e))| s <= k && k <= e)
    }

    /// Returns true if this zone and `other` share at least one point.
    /// A partial overlap on every axis is enough.
    pub fn intersects(&self, other: &Zone) -> bool {
        self.start.len() == other.start.len()
            && self
                .start
                .iter()
                .zip(self.end.iter())
                .zip(other.start.iter().zip(other.end.iter()))
                .all(|((s, e), (os, oe))| s <= oe && os <= e)
    }
}

/// The contract shared by all key space mappings.
///
/// Hosts have a total order (the order of their zones on the curve) which is
/// what [`KeyMapping::first`] / [`KeyMapping::successor`] /
/// [`KeyMapping::predecessor`] expose for host-by-host iteration.
///
/// After [`KeyMapping::remove_host`] the mapping is inconsistent: every read
/// fails with [`Error::Inconsistent`] until a freshly built mapping replaces it.
pub trait KeyMapping: Send + Sync {
    /// Returns the host owning the given key
    fn host_for(&self, key: &[u64]) -> Result<String>;

    /// Returns every host whose zone intersects the box `[start, end]`.
    /// Zones that only partially overlap the box must be included.
    fn hosts_for(&self, start: &[u64], end: &[u64]) -> Result<Vec<String>>;

    /// Returns all hosts, in zone order
    fn hosts(&self) -> Result<Vec<String>>;

    fn first(&self) -> Result<Option<String>>;
    fn successor(&self, host: &str) -> Result<Option<String>>;
    fn predecessor(&self, host: &str) -> Result<Option<String>>;

    /// Adds a host and regenerates every zone
    fn add_host(&mut self, host: String) -> Result<()>;

    /// Removes a host, marking the mapping inconsistent
    fn remove_host(&mut self, host: &str);

    /// Moves `amount` points of size accounting from `source` to `target`
    /// without moving any data. Data migration happens elsewhere; this call
    /// only keeps the size estimates in line with it.
    fn split(&mut self, source: &str, target: &str, amount: u64) -> Result<()>;

    /// Point-count estimate for one host
    fn host_size(&self, host: &str) -> Result<u64>;

    fn len(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn version(&self) -> u64;
    fn set_version(&mut self, version: u64);
}
