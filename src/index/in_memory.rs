//! An in-memory [`SpatialIndex`] implementation.
//!
//! Entries live in a [`BTreeMap`] keyed by their Z-address, so a plain map
//! scan already walks the space-filling curve in order. That makes batch
//! tokens trivial: a token is the hex Z-address of the last entry served, and
//! resuming is a range scan strictly past it. Used for development/testing;
//! nothing here is tuned for performance.

use async_trait::async_trait;
use bytes::Bytes;
use std::{
    collections::BTreeMap,
    ops::Bound,
    sync::{Arc, Mutex, MutexGuard},
};
use tracing::instrument;

use crate::mapping::{zcode, Key, Zone};
use crate::operation::IndexEntry;

use super::{Error, Result, SpatialIndex};

#[derive(Debug, Default)]
struct Inner {
    geometry: Option<(usize, u32)>,
    entries: BTreeMap<Vec<u8>, IndexEntry>,
}

#[derive(Debug, Clone, Default)]
pub struct InMemoryIndex {
    inner: Arc<Mutex<Inner>>,
}

impl InMemoryIndex {
    fn acquire_lock(&self) -> Result<MutexGuard<Inner>> {
        match self.inner.lock() {
            Ok(guard) => Ok(guard),
            Err(_) => Err(Error::Logic {
                reason: "Unable to acquire lock for InMemoryIndex - poisoned...".to_string(),
            }),
        }
    }
}

fn check_key(inner: &Inner, key: &[u64]) -> Result<(usize, u32)> {
    let (dim, depth) = inner.geometry.ok_or(Error::NotCreated)?;
    if key.len() != dim {
        return Err(Error::DimensionMismatch {
            expected: dim,
            got: key.len(),
        });
    }
    Ok((dim, depth))
}

fn range_center(start: &[u64], end: &[u64]) -> Key {
    start
        .iter()
        .zip(end.iter())
        .map(|(s, e)| s + (e.saturating_sub(*s)) / 2)
        .collect()
}

#[async_trait]
impl SpatialIndex for InMemoryIndex {
    #[instrument(name = "index::in_memory::create", level = "info", skip(self))]
    async fn create(&self, dim: usize, depth: u32) -> Result<()> {
        let mut guard = self.acquire_lock()?;
        guard.geometry = Some((dim, depth));
        guard.entries.clear();
        Ok(())
    }

    #[instrument(name = "index::in_memory::put", level = "debug", skip(self, value))]
    async fn put(&self, key: Key, value: Bytes) -> Result<Option<Bytes>> {
        let mut guard = self.acquire_lock()?;
        let (_, depth) = check_key(&guard, &key)?;
        let address = zcode::interleave(&key, depth);
        let previous = guard
            .entries
            .insert(address, IndexEntry::new(key, value))
            .map(|e| e.value);
        Ok(previous)
    }

    async fn get(&self, key: &[u64]) -> Result<Option<Bytes>> {
        let guard = self.acquire_lock()?;
        let (_, depth) = check_key(&guard, key)?;
        let address = zcode::interleave(key, depth);
        Ok(guard.entries.get(&address).map(|e| e.value.clone()))
    }

    async fn delete(&self, key: &[u64]) -> Result<Option<Bytes>> {
        let mut guard = self.acquire_lock()?;
        let (_, depth) = check_key(&guard, key)?;
        let address = zcode::interleave(key, depth);
        Ok(guard.entries.remove(&address).map(|e| e.value))
    }

    async fn contains(&self, key: &[u64]) -> Result<bool> {
        let guard = self.acquire_lock()?;
        let (_, depth) = check_key(&guard, key)?;
        let address = zcode::interleave(key, depth);
        Ok(guard.entries.contains_key(&address))
    }

    async fn get_range(
        &self,
        start: &[u64],
        end: &[u64],
        distance: Option<f64>,
    ) -> Result<Vec<IndexEntry>> {
        let guard = self.acquire_lock()?;
        check_key(&guard, start)?;
        check_key(&guard, end)?;
        let zone = Zone::new(start.to_vec(), end.to_vec());
        let center = range_center(start, end);

        Ok(guard
            .entries
            .values()
            .filter(|entry| zone.contains(&entry.key))
            .filter(|entry| match distance {
                Some(max) => zcode::euclidean_distance(&entry.key, &center) <= max,
                None => true,
            })
            .cloned()
            .collect())
    }

    async fn get_knn(&self, key: &[u64], k: usize) -> Result<Vec<IndexEntry>> {
        let guard = self.acquire_lock()?;
        check_key(&guard, key)?;

        let mut ranked: Vec<(f64, &IndexEntry)> = guard
            .entries
            .values()
            .map(|entry| (zcode::euclidean_distance(key, &entry.key), entry))
            .collect();
        ranked.sort_by(|a, b| {
            a.0.partial_cmp(&b.0)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then_with(|| a.1.key.cmp(&b.1.key))
        });

        Ok(ranked.into_iter().take(k).map(|(_, e)| e.clone()).collect())
    }

    async fn get_batch(
        &self,
        token: &str,
        size: usize,
        range: Option<&(Key, Key)>,
    ) -> Result<(Vec<IndexEntry>, String)> {
        let guard = self.acquire_lock()?;
        if guard.geometry.is_none() {
            return Err(Error::NotCreated);
        }

        let lower = if token.is_empty() {
            Bound::Unbounded
        } else {
            let address = hex::decode(token).map_err(|_| Error::InvalidIteratorToken {
                token: token.to_string(),
            })?;
            Bound::Excluded(address)
        };

        let zone = range.map(|(start, end)| Zone::new(start.clone(), end.clone()));
        let size = size.max(1);
        let mut page: Vec<IndexEntry> = Vec::with_capacity(size);
        let mut last_address: Vec<u8> = Vec::new();
        let mut more = false;
        for (address, entry) in guard.entries.range((lower, Bound::Unbounded)) {
            if let Some(zone) = &zone {
                if !zone.contains(&entry.key) {
                    continue;
                }
            }
            if page.len() == size {
                more = true;
                break;
            }
            last_address = address.clone();
            page.push(entry.clone());
        }

        // the resume point is the address of the last entry served
        let next_token = if more {
            hex::encode(last_address)
        } else {
            String::new()
        };
        Ok((page, next_token))
    }

    async fn size(&self) -> Result<u64> {
        let guard = self.acquire_lock()?;
        Ok(guard.entries.len() as u64)
    }
}
