//! Module that contains the [`IndexProxy`]: the client-facing component that
//! routes every operation to the node(s) owning the touched part of the key
//! space and merges multi-node answers.
//!
//! # Design principals
//! Every logical operation grabs ONE mapping snapshot from the coordinator
//! and uses it end-to-end, even if a newer mapping lands mid-flight; there is
//! no retro-active re-routing inside a call. Multi-host reads fan out
//! concurrently and merge by concatenation. Duplicates across transiently
//! overlapping zones are possible and are left to the caller (the
//! nearest-neighbor ranking deduplicates implicitly by re-ranking distances).

use std::sync::Arc;

use bytes::Bytes;
use futures::{stream::FuturesUnordered, StreamExt};
use tracing::{event, instrument, Level};

use crate::cluster::coordinator::ClusterCoordinator;
use crate::config::{ClientConfig, IndexConfig};
use crate::dispatcher::Dispatcher;
use crate::error::{Error, HostFailure, Result};
use crate::mapping::zorder::ZOrderMapping;
use crate::mapping::{Key, KeyMapping};
use crate::operation::{IndexEntry, Request, Response};

pub mod iterator;
pub mod knn;

use iterator::BatchIterator;

pub struct IndexProxy {
    coordinator: Arc<ClusterCoordinator>,
    dispatcher: Arc<dyn Dispatcher>,
    config: ClientConfig,
}

impl IndexProxy {
    pub fn new(
        coordinator: Arc<ClusterCoordinator>,
        dispatcher: Arc<dyn Dispatcher>,
        config: ClientConfig,
    ) -> Self {
        Self {
            coordinator,
            dispatcher,
            config,
        }
    }

    /// Creates the index on every known host. All hosts must answer with
    /// success; on a mixed outcome the partially created index is NOT rolled
    /// back, the failure is surfaced and the operator decides.
    #[instrument(level = "info", skip(self))]
    pub async fn create(&self, dim: usize, depth: u32) -> Result<()> {
        let config = IndexConfig { dim, depth };
        config
            .validate()
            .map_err(|reason| Error::InvalidConfig { reason })?;

        let hosts = self.coordinator.online_hosts()?;
        if hosts.is_empty() {
            return Err(Error::EmptyMapping);
        }

        self.fan_out("Create", &hosts, Request::Create { dim, depth })
            .await?;
        Ok(())
    }

    /// Stores a point, returning the value it replaces if any
    #[instrument(level = "debug", skip(self, value))]
    pub async fn put(&self, key: Key, value: Bytes) -> Result<Option<Bytes>> {
        let mapping = self.mapping()?;
        let host = mapping.host_for(&key)?;
        let response = self
            .send(&host, Request::Put { key, value })
            .await?;
        Self::expect_entry(&host, response).map(|entry| entry.map(|e| e.value))
    }

    /// Retrieves the value stored under `key`, `None` if the key is absent
    #[instrument(level = "debug", skip(self))]
    pub async fn get(&self, key: Key) -> Result<Option<Bytes>> {
        let mapping = self.mapping()?;
        let host = mapping.host_for(&key)?;
        let response = self.send(&host, Request::Get { key }).await?;
        Self::expect_entry(&host, response).map(|entry| entry.map(|e| e.value))
    }

    /// Removes a point, returning the removed value if it existed
    #[instrument(level = "debug", skip(self))]
    pub async fn delete(&self, key: Key) -> Result<Option<Bytes>> {
        let mapping = self.mapping()?;
        let host = mapping.host_for(&key)?;
        let response = self.send(&host, Request::Delete { key }).await?;
        Self::expect_entry(&host, response).map(|entry| entry.map(|e| e.value))
    }

    pub async fn contains(&self, key: Key) -> Result<bool> {
        let mapping = self.mapping()?;
        let host = mapping.host_for(&key)?;
        let response = self.send(&host, Request::Contains { key }).await?;
        match response {
            Response::Contains { found } => Ok(found),
            other => Err(Self::unexpected(&host, &other)),
        }
    }

    /// All entries inside the box `[start, end]`, concatenated across the
    /// owning hosts
    pub async fn get_range(&self, start: Key, end: Key) -> Result<Vec<IndexEntry>> {
        self.range_query(start, end, None).await
    }

    /// Range query keeping only entries within `distance` of the box center
    pub async fn get_range_within(
        &self,
        start: Key,
        end: Key,
        distance: f64,
    ) -> Result<Vec<IndexEntry>> {
        self.range_query(start, end, Some(distance)).await
    }

    #[instrument(name = "proxy::get_range", level = "debug", skip(self))]
    async fn range_query(
        &self,
        start: Key,
        end: Key,
        distance: Option<f64>,
    ) -> Result<Vec<IndexEntry>> {
        let mapping = self.mapping()?;
        let hosts = mapping.hosts_for(&start, &end)?;
        if hosts.is_empty() {
            return Err(Error::EmptyMapping);
        }

        let responses = self
            .fan_out(
                "GetRange",
                &hosts,
                Request::GetRange {
                    start,
                    end,
                    distance,
                },
            )
            .await?;
        Ok(Self::concat_entries(responses))
    }

    /// The k keys nearest to `key`, ascending by distance
    #[instrument(level = "debug", skip(self))]
    pub async fn get_nearest_neighbors(&self, key: Key, k: usize) -> Result<Vec<Key>> {
        let mapping = self.mapping()?;
        knn::nearest_neighbors(self, &mapping, &key, k).await
    }

    /// Iterates every entry of the index, host by host in zone order
    pub fn iter(&self) -> Result<BatchIterator> {
        let mapping = self.mapping()?;
        BatchIterator::new(
            Arc::clone(&self.dispatcher),
            mapping,
            self.config.batch_size,
            None,
        )
    }

    /// Iterates the entries inside the box `[start, end]`
    pub fn iter_range(&self, start: Key, end: Key) -> Result<BatchIterator> {
        let mapping = self.mapping()?;
        BatchIterator::new(
            Arc::clone(&self.dispatcher),
            mapping,
            self.config.batch_size,
            Some((start, end)),
        )
    }

    /// The mapping snapshot used by the current operation
    pub(crate) fn mapping(&self) -> Result<Arc<ZOrderMapping>> {
        Ok(self.coordinator.get_mapping()?)
    }

    /// Issues the same k-NN request to a set of hosts and concatenates the
    /// answers (unranked, callers re-rank)
    pub(crate) async fn knn_on_hosts(
        &self,
        hosts: &[String],
        key: &[u64],
        k: usize,
    ) -> Result<Vec<IndexEntry>> {
        let responses = self
            .fan_out(
                "GetKnn",
                hosts,
                Request::GetKnn {
                    key: key.to_vec(),
                    k,
                },
            )
            .await?;
        Ok(Self::concat_entries(responses))
    }

    async fn send(&self, host: &str, request: Request) -> Result<Response> {
        let response = self.dispatcher.send(host, request).await?;
        if let Some(reason) = response.failure_reason() {
            return Err(Error::Remote {
                host: host.to_string(),
                reason: reason.to_string(),
            });
        }
        Ok(response)
    }

    /// Concurrent fan-out of one request to many hosts. Successful responses
    /// come back re-ordered to match the input host order, keeping merges
    /// deterministic for a given candidate set; any per-host failure turns
    /// the whole call into a [`Error::PartialFailure`].
    async fn fan_out(
        &self,
        operation: &str,
        hosts: &[String],
        request: Request,
    ) -> Result<Vec<(String, Response)>> {
        let mut futures = FuturesUnordered::new();
        for host in hosts {
            let dispatcher = Arc::clone(&self.dispatcher);
            let request = request.clone();
            let host = host.clone();
            futures.push(async move {
                let result = dispatcher.send(&host, request).await;
                (host, result)
            });
        }

        let mut successes = Vec::with_capacity(hosts.len());
        let mut failures = Vec::new();
        while let Some((host, result)) = futures.next().await {
            match result {
                Ok(response) => {
                    let failure = response.failure_reason().map(|r| r.to_string());
                    match failure {
                        Some(reason) => {
                            event!(
                                Level::WARN,
                                "{} failed on host {}: {}",
                                operation,
                                host,
                                reason
                            );
                            failures.push(HostFailure { host, reason });
                        }
                        None => successes.push((host, response)),
                    }
                }
                Err(err) => {
                    event!(
                        Level::WARN,
                        "{} could not reach host {}: {}",
                        operation,
                        host,
                        err
                    );
                    failures.push(HostFailure {
                        host,
                        reason: err.to_string(),
                    });
                }
            }
        }

        if !failures.is_empty() {
            return Err(Error::PartialFailure {
                operation: operation.to_string(),
                failures,
            });
        }

        successes.sort_by_key(|(host, _)| hosts.iter().position(|h| h == host));
        Ok(successes)
    }

    fn concat_entries(responses: Vec<(String, Response)>) -> Vec<IndexEntry> {
        responses
            .into_iter()
            .flat_map(|(_, response)| match response {
                Response::Entries { entries } => entries,
                _ => Vec::new(),
            })
            .collect()
    }

    fn expect_entry(host: &str, response: Response) -> Result<Option<IndexEntry>> {
        match response {
            Response::Entry { entry } => Ok(entry),
            other => Err(Self::unexpected(host, &other)),
        }
    }

    fn unexpected(host: &str, response: &Response) -> Error {
        Error::UnexpectedResponse {
            host: host.to_string(),
            reason: format!("{:?}", response),
        }
    }
}
