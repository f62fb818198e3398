//! This module contains the per-node execution context: the piece of state a
//! storage node keeps between the transport (out of scope here) and its local
//! [`SpatialIndex`].
//!
//! Besides command dispatch, the context owns the node-local rebalancing
//! guard: a compare-and-swap pair ensuring a single rebalance runs against
//! the local index at a time. There is no distributed lock on top of this;
//! cluster-wide serialization of rebalances is a coordination-substrate
//! convention, not something this layer enforces.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tracing::{event, instrument, Level};

use crate::dispatcher::Dispatcher;
use crate::error::{Error, Result};
use crate::index::SpatialIndex;
use crate::mapping::Zone;
use crate::operation::{OpStatus, Request, Response};

pub struct NodeContext {
    host_id: String,
    index: Arc<dyn SpatialIndex>,
    balancing: AtomicBool,
    last_balancing_version: AtomicU64,
}

impl std::fmt::Debug for NodeContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NodeContext")
            .field("host_id", &self.host_id)
            .field("balancing", &self.balancing)
            .finish()
    }
}

impl NodeContext {
    pub fn new(host_id: String, index: Arc<dyn SpatialIndex>) -> Self {
        Self {
            host_id,
            index,
            balancing: AtomicBool::new(false),
            last_balancing_version: AtomicU64::new(0),
        }
    }

    pub fn host_id(&self) -> &str {
        &self.host_id
    }

    pub fn index(&self) -> Arc<dyn SpatialIndex> {
        Arc::clone(&self.index)
    }

    /// Executes a request against the local index. Failures come back as a
    /// failure status; nothing here takes the node down.
    #[instrument(name = "node::execute", level = "debug", skip(self, request), fields(host = %self.host_id, op = %request.op_code()))]
    pub async fn execute(&self, request: Request) -> Response {
        let result = self.try_execute(request).await;
        match result {
            Ok(response) => response,
            Err(err) => {
                event!(Level::WARN, "Command failed on {}: {}", self.host_id, err);
                Response::failure(err.to_string())
            }
        }
    }

    async fn try_execute(&self, request: Request) -> Result<Response> {
        Ok(match request {
            Request::Create { dim, depth } => {
                self.index.create(dim, depth).await?;
                Response::Status {
                    status: OpStatus::Success,
                }
            }
            Request::Put { key, value } => Response::Entry {
                entry: self
                    .index
                    .put(key.clone(), value)
                    .await?
                    .map(|previous| crate::operation::IndexEntry::new(key, previous)),
            },
            Request::Get { key } => Response::Entry {
                entry: self
                    .index
                    .get(&key)
                    .await?
                    .map(|value| crate::operation::IndexEntry::new(key, value)),
            },
            Request::Delete { key } => Response::Entry {
                entry: self
                    .index
                    .delete(&key)
                    .await?
                    .map(|value| crate::operation::IndexEntry::new(key, value)),
            },
            Request::Contains { key } => Response::Contains {
                found: self.index.contains(&key).await?,
            },
            Request::GetRange {
                start,
                end,
                distance,
            } => Response::Entries {
                entries: self.index.get_range(&start, &end, distance).await?,
            },
            Request::GetKnn { key, k } => Response::Entries {
                entries: self.index.get_knn(&key, k).await?,
            },
            Request::GetBatch {
                iterator,
                size,
                range,
            } => {
                let (entries, iterator) = self
                    .index
                    .get_batch(&iterator, size, range.as_ref())
                    .await?;
                Response::Batch { entries, iterator }
            }
        })
    }

    /// Claims the node-local rebalancing slot. A second claim fails
    /// immediately instead of queueing.
    pub fn can_start_balancing(&self) -> bool {
        self.balancing
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    /// Releases the rebalancing slot. Returns false if it was not held.
    pub fn end_balancing(&self) -> bool {
        self.balancing
            .compare_exchange(true, false, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    pub fn is_balancing(&self) -> bool {
        self.balancing.load(Ordering::Acquire)
    }

    pub fn last_balancing_version(&self) -> u64 {
        self.last_balancing_version.load(Ordering::Acquire)
    }

    pub fn set_last_balancing_version(&self, version: u64) {
        self.last_balancing_version.store(version, Ordering::Release);
    }

    /// Copies every entry of `zone` to `target` and deletes the local copies
    /// only once all copies succeeded. Any failure leaves the local index in
    /// its pre-attempt state and is reported to the caller.
    #[instrument(name = "node::move_range", level = "info", skip(self, dispatcher), fields(host = %self.host_id))]
    pub async fn move_range(
        &self,
        target: &str,
        zone: &Zone,
        dispatcher: &dyn Dispatcher,
    ) -> Result<u64> {
        if !self.can_start_balancing() {
            return Err(Error::BalancingInProgress);
        }
        let guard = BalancingGuard { context: self };

        let entries = self.index.get_range(&zone.start, &zone.end, None).await?;

        for entry in entries.iter() {
            let request = Request::Put {
                key: entry.key.clone(),
                value: entry.value.clone(),
            };
            let response = dispatcher.send(target, request).await?;
            if let Some(reason) = response.failure_reason() {
                event!(
                    Level::WARN,
                    "Aborting rebalance from {} to {}: {}",
                    self.host_id,
                    target,
                    reason
                );
                return Err(Error::Remote {
                    host: target.to_string(),
                    reason: reason.to_string(),
                });
            }
        }

        // every copy landed, the local deletes cannot lose data anymore
        for entry in entries.iter() {
            self.index.delete(&entry.key).await?;
        }

        drop(guard);
        Ok(entries.len() as u64)
    }

    /// Waits (bounded) for an in-flight rebalance to finish before the node
    /// releases its resources. The rebalance is never cancelled mid-flight.
    pub async fn shutdown(&self, timeout: Duration) -> Result<()> {
        let poll = Duration::from_millis(10);
        let mut waited = Duration::ZERO;
        while self.is_balancing() {
            if waited >= timeout {
                return Err(Error::Internal {
                    reason: format!(
                        "shutdown of {} timed out waiting for an in-flight rebalance",
                        self.host_id
                    ),
                });
            }
            tokio::time::sleep(poll).await;
            waited += poll;
        }
        Ok(())
    }
}

/// Releases the balancing slot on every exit path of a rebalance
struct BalancingGuard<'a> {
    context: &'a NodeContext,
}

impl Drop for BalancingGuard<'_> {
    fn drop(&mut self) {
        self.context.end_balancing();
    }
}
