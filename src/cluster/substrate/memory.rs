//! An in-memory [`CoordinationSubstrate`] implementation.
//!
//! This implementation uses [`HashMap`]s wrapped by a [`Mutex`] and a
//! [`broadcast`] channel for notifications. It is the substrate used for
//! development/testing and for single-process clusters; it can also simulate
//! an outage (`set_unavailable`) to exercise degraded paths.

use async_trait::async_trait;
use bytes::Bytes;
use std::{
    collections::HashMap,
    sync::{Arc, Mutex, MutexGuard},
};
use tokio::sync::broadcast;

use super::super::error::{Error, Result};
use super::{ChangeEvent, CoordinationSubstrate};

const EVENT_CHANNEL_CAPACITY: usize = 64;

#[derive(Debug, Default)]
struct Inner {
    durable: HashMap<String, Bytes>,
    ephemeral: HashMap<String, Bytes>,
    counters: HashMap<String, u64>,
    unavailable: bool,
}

#[derive(Debug, Clone)]
pub struct InMemorySubstrate {
    inner: Arc<Mutex<Inner>>,
    events: broadcast::Sender<ChangeEvent>,
}

impl Default for InMemorySubstrate {
    fn default() -> Self {
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Self {
            inner: Arc::new(Mutex::new(Inner::default())),
            events,
        }
    }
}

impl InMemorySubstrate {
    fn acquire_lock(&self) -> Result<MutexGuard<Inner>> {
        match self.inner.lock() {
            Ok(guard) => Ok(guard),
            Err(_) => Err(Error::Logic {
                reason: "Unable to acquire lock for InMemorySubstrate - poisoned...".to_string(),
            }),
        }
    }

    fn check_available(guard: &MutexGuard<Inner>) -> Result<()> {
        if guard.unavailable {
            Err(Error::Unavailable {
                reason: "substrate marked unavailable".to_string(),
            })
        } else {
            Ok(())
        }
    }

    /// Simulates losing (or regaining) connectivity to the substrate
    pub fn set_unavailable(&self, unavailable: bool) {
        if let Ok(mut guard) = self.inner.lock() {
            guard.unavailable = unavailable;
        }
    }

    fn notify(&self, event: ChangeEvent) {
        // no receivers is fine, nobody is watching yet
        let _ = self.events.send(event);
    }

    fn parent_of(path: &str) -> String {
        match path.rfind('/') {
            Some(position) => path[..position].to_string(),
            None => String::new(),
        }
    }
}

#[async_trait]
impl CoordinationSubstrate for InMemorySubstrate {
    async fn read(&self, path: &str) -> Result<Option<Bytes>> {
        let guard = self.acquire_lock()?;
        Self::check_available(&guard)?;
        Ok(guard.durable.get(path).cloned())
    }

    async fn write(&self, path: &str, data: Bytes) -> Result<()> {
        {
            let mut guard = self.acquire_lock()?;
            Self::check_available(&guard)?;
            guard.durable.insert(path.to_string(), data);
        }
        self.notify(ChangeEvent::DataChanged {
            path: path.to_string(),
        });
        Ok(())
    }

    async fn register_ephemeral(&self, path: &str, data: Bytes) -> Result<()> {
        {
            let mut guard = self.acquire_lock()?;
            Self::check_available(&guard)?;
            guard.ephemeral.insert(path.to_string(), data);
        }
        self.notify(ChangeEvent::ChildrenChanged {
            path: Self::parent_of(path),
        });
        Ok(())
    }

    async fn unregister_ephemeral(&self, path: &str) -> Result<()> {
        {
            let mut guard = self.acquire_lock()?;
            Self::check_available(&guard)?;
            guard.ephemeral.remove(path);
        }
        self.notify(ChangeEvent::ChildrenChanged {
            path: Self::parent_of(path),
        });
        Ok(())
    }

    async fn children(&self, path: &str) -> Result<Vec<String>> {
        let guard = self.acquire_lock()?;
        Self::check_available(&guard)?;
        let prefix = format!("{}/", path);
        let mut children: Vec<String> = guard
            .ephemeral
            .keys()
            .filter_map(|k| k.strip_prefix(&prefix))
            .map(|name| name.to_string())
            .collect();
        children.sort();
        Ok(children)
    }

    async fn counter(&self, path: &str) -> Result<u64> {
        let guard = self.acquire_lock()?;
        Self::check_available(&guard)?;
        Ok(guard.counters.get(path).copied().unwrap_or(0))
    }

    async fn counter_cas(&self, path: &str, expected: u64, value: u64) -> Result<bool> {
        let mut guard = self.acquire_lock()?;
        Self::check_available(&guard)?;
        let current = guard.counters.get(path).copied().unwrap_or(0);
        if current != expected {
            return Ok(false);
        }
        guard.counters.insert(path.to_string(), value);
        Ok(true)
    }

    fn subscribe(&self) -> broadcast::Receiver<ChangeEvent> {
        self.events.subscribe()
    }
}

#[cfg(test)]
mod tests {
    use super::{ChangeEvent, CoordinationSubstrate, InMemorySubstrate};
    use bytes::Bytes;

    #[tokio::test]
    async fn write_read_round_trip() {
        let substrate = InMemorySubstrate::default();
        assert!(substrate.read("mapping").await.unwrap().is_none());

        substrate
            .write("mapping", Bytes::from("payload"))
            .await
            .unwrap();
        assert_eq!(
            substrate.read("mapping").await.unwrap().unwrap(),
            Bytes::from("payload")
        );
    }

    #[tokio::test]
    async fn ephemeral_registration_lists_children() {
        let substrate = InMemorySubstrate::default();
        substrate
            .register_ephemeral("servers/b", Bytes::from("b"))
            .await
            .unwrap();
        substrate
            .register_ephemeral("servers/a", Bytes::from("a"))
            .await
            .unwrap();

        assert_eq!(substrate.children("servers").await.unwrap(), vec!["a", "b"]);

        substrate.unregister_ephemeral("servers/a").await.unwrap();
        assert_eq!(substrate.children("servers").await.unwrap(), vec!["b"]);
    }

    #[tokio::test]
    async fn writes_notify_subscribers() {
        let substrate = InMemorySubstrate::default();
        let mut events = substrate.subscribe();

        substrate.write("mapping", Bytes::from("v1")).await.unwrap();
        assert_eq!(
            events.recv().await.unwrap(),
            ChangeEvent::DataChanged {
                path: "mapping".to_string()
            }
        );

        substrate
            .register_ephemeral("servers/a", Bytes::from("a"))
            .await
            .unwrap();
        assert_eq!(
            events.recv().await.unwrap(),
            ChangeEvent::ChildrenChanged {
                path: "servers".to_string()
            }
        );
    }

    #[tokio::test]
    async fn counter_cas_detects_contention() {
        let substrate = InMemorySubstrate::default();
        assert_eq!(substrate.counter("version").await.unwrap(), 0);

        assert!(substrate.counter_cas("version", 0, 1).await.unwrap());
        assert!(!substrate.counter_cas("version", 0, 2).await.unwrap());
        assert_eq!(substrate.counter("version").await.unwrap(), 1);
    }

    #[tokio::test]
    async fn unavailable_substrate_fails_every_call() {
        let substrate = InMemorySubstrate::default();
        substrate.set_unavailable(true);
        assert!(substrate.read("mapping").await.is_err());
        assert!(substrate.write("mapping", Bytes::new()).await.is_err());
        assert!(substrate.counter("version").await.is_err());

        substrate.set_unavailable(false);
        assert!(substrate.read("mapping").await.is_ok());
    }
}
