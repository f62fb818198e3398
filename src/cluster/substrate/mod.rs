//! The coordination substrate interface.
//!
//! The substrate is an external collaborator (ZooKeeper-like): durable
//! key/value storage with change notifications, ephemeral per-node liveness
//! registration and an atomically incrementable shared counter. Everything the
//! coordinator needs is behind [`CoordinationSubstrate`] so that tests and
//! single-process clusters can run on the in-memory implementation.

use async_trait::async_trait;
use bytes::Bytes;
use std::fmt::Debug;
use tokio::sync::broadcast;

use super::error::Result;

pub mod memory;

/// Change notification emitted by the substrate. Paths follow the substrate's
/// own namespace; watchers filter for the paths they care about.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChangeEvent {
    /// The data stored at `path` was overwritten
    DataChanged { path: String },
    /// The children of `path` changed (a node registered or expired)
    ChildrenChanged { path: String },
}

#[async_trait]
pub trait CoordinationSubstrate: Send + Sync + Debug {
    /// Reads the durable value stored at `path`, `None` if absent
    async fn read(&self, path: &str) -> Result<Option<Bytes>>;

    /// Writes a durable value, creating the path if needed
    async fn write(&self, path: &str, data: Bytes) -> Result<()>;

    /// Creates an ephemeral node tied to this session
    async fn register_ephemeral(&self, path: &str, data: Bytes) -> Result<()>;

    /// Removes a previously created ephemeral node
    async fn unregister_ephemeral(&self, path: &str) -> Result<()>;

    /// Lists the child names under `path`
    async fn children(&self, path: &str) -> Result<Vec<String>>;

    /// Current value of the shared counter at `path` (0 if never written)
    async fn counter(&self, path: &str) -> Result<u64>;

    /// Compare-and-set on the shared counter. Returns false on contention.
    async fn counter_cas(&self, path: &str, expected: u64, value: u64) -> Result<bool>;

    /// Subscribes to change notifications. The channel is shared by all
    /// subscribers; slow consumers may observe lag and should re-read state.
    fn subscribe(&self) -> broadcast::Receiver<ChangeEvent>;
}
