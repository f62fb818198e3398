//! This file contains the [`ClusterCoordinator`]: the component every client
//! and every storage node uses to observe (and occasionally publish) the
//! authoritative [`ZOrderMapping`].
//!
//! The coordinator caches the substrate state locally. A single background
//! task subscribes to substrate notifications and atomically swaps the cached
//! snapshot behind an `RwLock`, so readers always observe either the old or
//! the new mapping, never a half-applied one. Reads are served from the cache
//! and may be briefly stale relative to the substrate; that staleness is the
//! accepted consistency model, not a bug to patch over. Substrate failures
//! after `connect` degrade to cached values and a log line; only `connect`
//! itself escalates them.

use std::sync::{Arc, RwLock};

use bytes::Bytes;
use tokio::sync::{broadcast, oneshot};
use tokio::task::JoinHandle;
use tracing::{event, instrument, Level};

use crate::config::IndexConfig;
use crate::mapping::zorder::ZOrderMapping;
use crate::mapping::KeyMapping;

use super::error::{Error, Result};
use super::substrate::{ChangeEvent, CoordinationSubstrate};

/// Substrate path holding the serialized mapping
pub const MAPPING_PATH: &str = "mapping";
/// Substrate path under which hosts register their liveness markers
pub const SERVERS_PATH: &str = "servers";
/// Substrate path of the shared mapping version counter
pub const VERSION_PATH: &str = "version";

#[derive(Debug, Default)]
struct Cached {
    mapping: Option<Arc<ZOrderMapping>>,
    hosts: Vec<String>,
    version: u64,
}

struct Connection {
    // dropping the sender is the shutdown signal for the watch task
    _shutdown: oneshot::Sender<()>,
    watch_task: JoinHandle<()>,
}

pub struct ClusterCoordinator {
    substrate: Arc<dyn CoordinationSubstrate>,
    cached: Arc<RwLock<Cached>>,
    connection: Option<Connection>,
}

impl std::fmt::Debug for ClusterCoordinator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClusterCoordinator")
            .field("connected", &self.connection.is_some())
            .field("cached", &self.cached)
            .finish()
    }
}

impl ClusterCoordinator {
    pub fn new(substrate: Arc<dyn CoordinationSubstrate>) -> Self {
        Self {
            substrate,
            cached: Arc::new(RwLock::new(Cached::default())),
            connection: None,
        }
    }

    /// Connects to the substrate: reads the current host list, mapping and
    /// version, then installs the background watch that keeps the cached
    /// snapshot fresh. Substrate failures here are escalated; this is the
    /// only place where they are.
    #[instrument(level = "info", skip(self))]
    pub async fn connect(&mut self) -> Result<()> {
        if self.connection.is_some() {
            return Err(Error::AlreadyConnected);
        }

        let hosts = self.substrate.children(SERVERS_PATH).await?;
        let mapping = read_mapping(self.substrate.as_ref()).await?;
        let version = self.substrate.counter(VERSION_PATH).await?;

        {
            let mut cached = acquire_write(&self.cached)?;
            cached.hosts = hosts;
            cached.mapping = mapping.map(Arc::new);
            cached.version = version;
        }

        let events = self.substrate.subscribe();
        let (shutdown_sender, shutdown_receiver) = oneshot::channel();
        let watch_task = tokio::spawn(watch_loop(
            Arc::clone(&self.substrate),
            Arc::clone(&self.cached),
            events,
            shutdown_receiver,
        ));

        self.connection = Some(Connection {
            _shutdown: shutdown_sender,
            watch_task,
        });
        Ok(())
    }

    /// Tears the watch down. The cached snapshot is no longer refreshed and
    /// all reads fail until `connect` is called again.
    pub async fn disconnect(&mut self) {
        if let Some(connection) = self.connection.take() {
            let Connection {
                _shutdown,
                watch_task,
            } = connection;
            drop(_shutdown);
            let _ = watch_task.await;
        }
        if let Ok(mut cached) = self.cached.write() {
            *cached = Cached::default();
        }
    }

    pub fn is_connected(&self) -> bool {
        self.connection.is_some()
    }

    /// The last observed mapping snapshot. May lag the substrate briefly.
    pub fn get_mapping(&self) -> Result<Arc<ZOrderMapping>> {
        self.check_connected()?;
        let cached = acquire_read(&self.cached)?;
        cached
            .mapping
            .clone()
            .ok_or(Error::MappingNotInitialized)
    }

    /// The last observed set of live hosts
    pub fn online_hosts(&self) -> Result<Vec<String>> {
        self.check_connected()?;
        Ok(acquire_read(&self.cached)?.hosts.clone())
    }

    /// Registers this host's ephemeral liveness marker
    #[instrument(level = "info", skip(self))]
    pub async fn register_host(&self, host: &str) -> Result<()> {
        self.check_connected()?;
        let path = format!("{}/{}", SERVERS_PATH, host);
        if let Err(err) = self
            .substrate
            .register_ephemeral(&path, Bytes::from(host.to_string()))
            .await
        {
            event!(Level::ERROR, "Failed to register host {}: {}", host, err);
            return Err(err);
        }
        // the watch will observe this change too, but our own cache should
        // reflect our own write immediately
        refresh_hosts(self.substrate.as_ref(), &self.cached).await;
        Ok(())
    }

    /// Removes the host from the published mapping (flagging it inconsistent
    /// until a rebalanced mapping replaces it) and drops its liveness marker
    #[instrument(level = "info", skip(self))]
    pub async fn unregister_host(&self, host: &str) -> Result<()> {
        self.check_connected()?;

        let updated = {
            let cached = acquire_read(&self.cached)?;
            cached.mapping.as_ref().map(|mapping| {
                let mut next = (**mapping).clone();
                next.remove_host(host);
                Arc::new(next)
            })
        };

        if let Some(mapping) = updated {
            self.publish(&mapping).await?;
            acquire_write(&self.cached)?.mapping = Some(mapping);
        }

        let path = format!("{}/{}", SERVERS_PATH, host);
        if let Err(err) = self.substrate.unregister_ephemeral(&path).await {
            event!(Level::ERROR, "Failed to unregister host {}: {}", host, err);
            return Err(err);
        }
        refresh_hosts(self.substrate.as_ref(), &self.cached).await;
        Ok(())
    }

    /// Bootstraps the cluster: computes the initial mapping from the hosts
    /// currently registered and publishes it. Only the node performing the
    /// bootstrap calls this.
    #[instrument(level = "info", skip(self))]
    pub async fn create_index(&self, config: &IndexConfig) -> Result<Arc<ZOrderMapping>> {
        self.check_connected()?;
        config.validate().map_err(|reason| Error::Logic { reason })?;

        let hosts = self.substrate.children(SERVERS_PATH).await?;
        let mut mapping = ZOrderMapping::new(config.dim, config.depth);
        mapping.add_hosts(hosts)?;
        mapping.set_version(self.get_version().await);

        let mapping = Arc::new(mapping);
        self.publish(&mapping).await?;
        acquire_write(&self.cached)?.mapping = Some(Arc::clone(&mapping));
        Ok(mapping)
    }

    /// Installs and publishes a rebalanced mapping, replacing the cached one
    pub async fn install_mapping(&self, mapping: ZOrderMapping) -> Result<Arc<ZOrderMapping>> {
        self.check_connected()?;
        let mapping = Arc::new(mapping);
        self.publish(&mapping).await?;
        acquire_write(&self.cached)?.mapping = Some(Arc::clone(&mapping));
        Ok(mapping)
    }

    /// Current mapping version. On substrate failure the last cached value is
    /// returned and the failure is logged, not surfaced.
    pub async fn get_version(&self) -> u64 {
        match self.substrate.counter(VERSION_PATH).await {
            Ok(version) => {
                if let Ok(mut cached) = self.cached.write() {
                    cached.version = version;
                }
                version
            }
            Err(err) => {
                event!(
                    Level::WARN,
                    "Failed to read mapping version, using cached value: {}",
                    err
                );
                self.cached.read().map(|c| c.version).unwrap_or(0)
            }
        }
    }

    /// Bumps the shared version counter with an optimistic compare-and-set
    /// loop, retrying on contention
    #[instrument(level = "info", skip(self))]
    pub async fn increment_version(&self) -> Result<u64> {
        self.check_connected()?;
        loop {
            let current = self.substrate.counter(VERSION_PATH).await?;
            let next = current + 1;
            if self.substrate.counter_cas(VERSION_PATH, current, next).await? {
                if let Ok(mut cached) = self.cached.write() {
                    cached.version = next;
                }
                return Ok(next);
            }
            event!(
                Level::DEBUG,
                "Version counter contention at {}, retrying",
                current
            );
        }
    }

    /// Serializes and publishes the cached mapping as-is
    pub async fn write_current_mapping(&self) -> Result<()> {
        let mapping = self.get_mapping()?;
        self.publish(&mapping).await
    }

    async fn publish(&self, mapping: &ZOrderMapping) -> Result<()> {
        event!(
            Level::INFO,
            "Publishing mapping version {} ({} hosts, consistent: {})",
            mapping.version(),
            mapping.len(),
            mapping.is_consistent()
        );
        let data = mapping.serialize()?;
        self.substrate.write(MAPPING_PATH, data).await
    }

    fn check_connected(&self) -> Result<()> {
        if self.connection.is_some() {
            Ok(())
        } else {
            Err(Error::NotConnected)
        }
    }
}

async fn read_mapping(
    substrate: &dyn CoordinationSubstrate,
) -> Result<Option<ZOrderMapping>> {
    match substrate.read(MAPPING_PATH).await? {
        Some(data) => Ok(Some(ZOrderMapping::deserialize(&data)?)),
        None => Ok(None),
    }
}

/// The single background task refreshing the cached snapshot. Listens on the
/// substrate notification channel and swaps the affected piece of state
/// atomically; exits when the coordinator disconnects.
async fn watch_loop(
    substrate: Arc<dyn CoordinationSubstrate>,
    cached: Arc<RwLock<Cached>>,
    mut events: broadcast::Receiver<ChangeEvent>,
    mut shutdown: oneshot::Receiver<()>,
) {
    loop {
        tokio::select! {
            _ = &mut shutdown => break,
            received = events.recv() => match received {
                Ok(ChangeEvent::DataChanged { path }) if path == MAPPING_PATH => {
                    refresh_mapping(substrate.as_ref(), &cached).await;
                }
                Ok(ChangeEvent::ChildrenChanged { path }) if path == SERVERS_PATH => {
                    refresh_hosts(substrate.as_ref(), &cached).await;
                }
                Ok(_) => {}
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    event!(
                        Level::WARN,
                        "Watch channel lagged by {} events, re-reading state",
                        skipped
                    );
                    refresh_mapping(substrate.as_ref(), &cached).await;
                    refresh_hosts(substrate.as_ref(), &cached).await;
                }
                Err(broadcast::error::RecvError::Closed) => break,
            }
        }
    }
}

async fn refresh_mapping(substrate: &dyn CoordinationSubstrate, cached: &RwLock<Cached>) {
    match read_mapping(substrate).await {
        Ok(Some(mapping)) => {
            if let Ok(mut guard) = cached.write() {
                guard.mapping = Some(Arc::new(mapping));
            }
        }
        Ok(None) => {
            event!(
                Level::WARN,
                "An attempt was made to overwrite the current mapping with an empty one"
            );
        }
        Err(err) => {
            event!(Level::ERROR, "Error refreshing cached mapping: {}", err);
        }
    }
}

async fn refresh_hosts(substrate: &dyn CoordinationSubstrate, cached: &RwLock<Cached>) {
    match substrate.children(SERVERS_PATH).await {
        Ok(hosts) => {
            if let Ok(mut guard) = cached.write() {
                guard.hosts = hosts;
            }
        }
        Err(err) => {
            event!(Level::ERROR, "Error refreshing cached host list: {}", err);
        }
    }
}

fn acquire_read<'a>(
    cached: &'a RwLock<Cached>,
) -> Result<std::sync::RwLockReadGuard<'a, Cached>> {
    cached.read().map_err(|_| Error::Logic {
        reason: "Unable to acquire coordinator cache lock - poisoned...".to_string(),
    })
}

fn acquire_write<'a>(
    cached: &'a RwLock<Cached>,
) -> Result<std::sync::RwLockWriteGuard<'a, Cached>> {
    cached.write().map_err(|_| Error::Logic {
        reason: "Unable to acquire coordinator cache lock - poisoned...".to_string(),
    })
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::time::Duration;

    use crate::cluster::error::Error;
    use crate::cluster::substrate::memory::InMemorySubstrate;
    use crate::cluster::substrate::CoordinationSubstrate;
    use crate::config::IndexConfig;
    use crate::mapping::KeyMapping;

    use super::ClusterCoordinator;

    async fn connected_coordinator() -> (Arc<InMemorySubstrate>, ClusterCoordinator) {
        let substrate = Arc::new(InMemorySubstrate::default());
        let mut coordinator = ClusterCoordinator::new(substrate.clone());
        coordinator.connect().await.unwrap();
        (substrate, coordinator)
    }

    async fn wait_until(mut check: impl FnMut() -> bool) {
        for _ in 0..100 {
            if check() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("condition not reached in time");
    }

    #[tokio::test]
    async fn connect_twice_fails() {
        let (_substrate, mut coordinator) = connected_coordinator().await;
        assert!(matches!(
            coordinator.connect().await.err().unwrap(),
            Error::AlreadyConnected
        ));
    }

    #[tokio::test]
    async fn mapping_reads_fail_before_bootstrap() {
        let (_substrate, coordinator) = connected_coordinator().await;
        assert!(matches!(
            coordinator.get_mapping().err().unwrap(),
            Error::MappingNotInitialized
        ));
    }

    #[tokio::test]
    async fn create_index_uses_registered_hosts() {
        let (_substrate, coordinator) = connected_coordinator().await;
        coordinator.register_host("127.0.0.1:4001").await.unwrap();
        coordinator.register_host("127.0.0.1:4002").await.unwrap();

        let mapping = coordinator
            .create_index(&IndexConfig { dim: 2, depth: 8 })
            .await
            .unwrap();
        assert_eq!(
            mapping.hosts().unwrap(),
            vec!["127.0.0.1:4001", "127.0.0.1:4002"]
        );
        assert!(coordinator.get_mapping().is_ok());
    }

    #[tokio::test]
    async fn watch_refreshes_mapping_snapshot() {
        let (substrate, coordinator) = connected_coordinator().await;
        coordinator.register_host("127.0.0.1:4001").await.unwrap();
        coordinator
            .create_index(&IndexConfig { dim: 2, depth: 8 })
            .await
            .unwrap();

        // a second coordinator (another process in real deployments)
        // publishes a grown mapping through the same substrate
        let mut other = ClusterCoordinator::new(substrate.clone());
        other.connect().await.unwrap();
        other.register_host("127.0.0.1:4002").await.unwrap();
        other
            .create_index(&IndexConfig { dim: 2, depth: 8 })
            .await
            .unwrap();

        wait_until(|| {
            coordinator
                .get_mapping()
                .map(|m| m.len() == 2)
                .unwrap_or(false)
        })
        .await;

        other.disconnect().await;
    }

    #[tokio::test]
    async fn watch_refreshes_host_list() {
        let (substrate, coordinator) = connected_coordinator().await;

        let mut other = ClusterCoordinator::new(substrate.clone());
        other.connect().await.unwrap();
        other.register_host("127.0.0.1:4009").await.unwrap();

        wait_until(|| {
            coordinator
                .online_hosts()
                .map(|hosts| hosts == vec!["127.0.0.1:4009"])
                .unwrap_or(false)
        })
        .await;

        other.disconnect().await;
    }

    #[tokio::test]
    async fn disconnect_stops_refreshing() {
        let (substrate, mut coordinator) = connected_coordinator().await;
        coordinator.disconnect().await;
        assert!(!coordinator.is_connected());
        assert!(matches!(
            coordinator.get_mapping().err().unwrap(),
            Error::NotConnected
        ));
        // publishing after disconnect must not panic anything in background
        substrate
            .write("mapping", bytes::Bytes::from_static(b"{}"))
            .await
            .ok();
    }

    #[tokio::test]
    async fn increment_version_is_monotonic_under_contention() {
        let (_substrate, coordinator) = connected_coordinator().await;
        let coordinator = Arc::new(coordinator);

        let mut handles = Vec::new();
        for _ in 0..4 {
            let coordinator = Arc::clone(&coordinator);
            handles.push(tokio::spawn(async move {
                for _ in 0..10 {
                    coordinator.increment_version().await.unwrap();
                }
            }));
        }
        for handle in handles {
            handle.await.unwrap();
        }

        assert_eq!(coordinator.get_version().await, 40);
    }

    #[tokio::test]
    async fn get_version_degrades_to_cached_value() {
        let (substrate, coordinator) = connected_coordinator().await;
        coordinator.increment_version().await.unwrap();
        assert_eq!(coordinator.get_version().await, 1);

        substrate.set_unavailable(true);
        assert_eq!(coordinator.get_version().await, 1);
        assert!(coordinator.increment_version().await.is_err());
    }

    #[tokio::test]
    async fn write_current_mapping_publishes_the_cached_snapshot() {
        let (substrate, coordinator) = connected_coordinator().await;
        coordinator.register_host("127.0.0.1:4001").await.unwrap();
        coordinator
            .create_index(&IndexConfig { dim: 2, depth: 8 })
            .await
            .unwrap();

        coordinator.write_current_mapping().await.unwrap();

        let raw = substrate.read("mapping").await.unwrap().unwrap();
        let published = crate::mapping::zorder::ZOrderMapping::deserialize(&raw).unwrap();
        assert_eq!(
            published.hosts().unwrap(),
            coordinator.get_mapping().unwrap().hosts().unwrap()
        );
    }

    #[tokio::test]
    async fn unregister_publishes_an_inconsistent_mapping() {
        let (substrate, coordinator) = connected_coordinator().await;
        coordinator.register_host("127.0.0.1:4001").await.unwrap();
        coordinator.register_host("127.0.0.1:4002").await.unwrap();
        coordinator
            .create_index(&IndexConfig { dim: 2, depth: 8 })
            .await
            .unwrap();

        coordinator.unregister_host("127.0.0.1:4002").await.unwrap();

        let mapping = coordinator.get_mapping().unwrap();
        assert!(!mapping.is_consistent());
        assert!(mapping.host_for(&[0, 0]).is_err());
        assert_eq!(substrate.children("servers").await.unwrap().len(), 1);
    }
}
