//! This trait represents the interface of the per-node spatial index.
//!
//! The real storage structure behind it is an external concern; the routing
//! layer only needs these operations. Matches returned by range and
//! nearest-neighbor queries come with best-effort local ordering; the client
//! side re-ranks whenever exact order matters.

use async_trait::async_trait;
use bytes::Bytes;
use serde::Serialize;
use std::fmt::Debug;

use crate::mapping::Key;
use crate::operation::IndexEntry;

pub mod in_memory;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, Serialize)]
pub enum Error {
    /// An operation arrived before the index was created on this node
    NotCreated,
    DimensionMismatch { expected: usize, got: usize },
    InvalidIteratorToken { token: String },
    Logic { reason: String },
}

impl std::fmt::Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:?}", self)
    }
}

impl std::error::Error for Error {}

#[async_trait]
pub trait SpatialIndex: Debug + Send + Sync {
    /// (Re)creates the index with the given geometry, dropping existing data
    async fn create(&self, dim: usize, depth: u32) -> Result<()>;

    /// Stores a point, returning the value it replaces if any
    async fn put(&self, key: Key, value: Bytes) -> Result<Option<Bytes>>;

    async fn get(&self, key: &[u64]) -> Result<Option<Bytes>>;

    /// Removes a point, returning the removed value if it existed
    async fn delete(&self, key: &[u64]) -> Result<Option<Bytes>>;

    async fn contains(&self, key: &[u64]) -> Result<bool>;

    /// All entries inside the box `[start, end]`. When `distance` is set,
    /// entries farther than it from the box center are dropped.
    async fn get_range(
        &self,
        start: &[u64],
        end: &[u64],
        distance: Option<f64>,
    ) -> Result<Vec<IndexEntry>>;

    /// Up to k entries nearest to `key`, ascending by distance
    async fn get_knn(&self, key: &[u64], k: usize) -> Result<Vec<IndexEntry>>;

    /// One page of a host-local scan in curve order. An empty `token` starts
    /// from the beginning; the returned token is non-empty while more pages
    /// remain. `range` restricts the scan to a box.
    async fn get_batch(
        &self,
        token: &str,
        size: usize,
        range: Option<&(Key, Key)>,
    ) -> Result<(Vec<IndexEntry>, String)>;

    /// Number of points currently stored
    async fn size(&self) -> Result<u64>;
}
