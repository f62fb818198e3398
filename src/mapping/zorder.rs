//! The Z-order [`KeyMapping`] variant, the one a cluster actually publishes.
//!
//! Every [`PartitionTree`] leaf code is expanded into an axis-aligned
//! [`Zone`]. Zones are conservative: a zone may be a superset of the true
//! Z-order interval of its code, never a subset, so ownership questions are
//! answered with geometric containment/intersection over a [`ZoneIndex`]
//! instead of prefix comparisons.
//!
//! Removing a host does not recompute anything: it flags the mapping as
//! inconsistent and every read fails until a rebuilt mapping is installed.
//! The window between the two is exactly the rebalancing window, and callers
//! are expected to back off and retry through it.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use bytes::Bytes;
use tracing::{event, Level};

use super::partition_tree::PartitionTree;
use super::zcode;
use super::{Error, Key, KeyMapping, Result, Zone};

/// Flat index of zones supporting point containment and box intersection.
/// Zone counts are small (one per host), a linear scan is deliberate.
#[derive(Debug, Clone, Default)]
pub struct ZoneIndex {
    entries: Vec<(Zone, String)>,
}

impl ZoneIndex {
    fn from_zones(entries: Vec<(Zone, String)>) -> Self {
        Self { entries }
    }

    /// The host whose zone contains the point. When zones transiently overlap
    /// the first one in zone order wins.
    pub fn containing(&self, key: &[u64]) -> Option<&str> {
        self.entries
            .iter()
            .find(|(zone, _)| zone.contains(key))
            .map(|(_, host)| host.as_str())
    }

    /// All hosts whose zone intersects the box, in zone order. Partial
    /// overlaps count.
    pub fn intersecting(&self, query: &Zone) -> Vec<String> {
        self.entries
            .iter()
            .filter(|(zone, _)| zone.intersects(query))
            .map(|(_, host)| host.clone())
            .collect()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ZOrderMapping {
    dim: usize,
    depth: u32,
    /// Hosts in zone order. Kept lexicographically sorted so that every node
    /// rebuilding the mapping from the same membership arrives at the same
    /// assignment.
    hosts: Vec<String>,
    starts: BTreeMap<String, Key>,
    ends: BTreeMap<String, Key>,
    sizes: BTreeMap<String, u64>,
    version: u64,
    consistent: bool,
    #[serde(skip)]
    tree: PartitionTree,
    #[serde(skip)]
    zones: ZoneIndex,
}

impl ZOrderMapping {
    pub fn new(dim: usize, depth: u32) -> Self {
        Self {
            dim,
            depth,
            hosts: Vec::new(),
            starts: BTreeMap::new(),
            ends: BTreeMap::new(),
            sizes: BTreeMap::new(),
            version: 0,
            consistent: true,
            tree: PartitionTree::default(),
            zones: ZoneIndex::default(),
        }
    }

    pub fn dim(&self) -> usize {
        self.dim
    }

    pub fn depth(&self) -> u32 {
        self.depth
    }

    pub fn is_consistent(&self) -> bool {
        self.consistent
    }

    /// Adds several hosts with a single zone regeneration
    pub fn add_hosts(&mut self, hosts: Vec<String>) -> Result<()> {
        self.check_consistency()?;
        for host in hosts {
            if let Err(position) = self.hosts.binary_search(&host) {
                self.hosts.insert(position, host);
            }
        }
        self.regenerate();
        Ok(())
    }

    /// Adjusts a zone's lower bound after an external rebalance moved data
    pub fn set_zone_start(&mut self, host: &str, start: Key) -> Result<()> {
        self.check_host(host)?;
        self.check_dimension(&start)?;
        self.starts.insert(host.to_string(), start);
        self.rebuild_zone_index();
        Ok(())
    }

    /// Adjusts a zone's upper bound after an external rebalance moved data
    pub fn set_zone_end(&mut self, host: &str, end: Key) -> Result<()> {
        self.check_host(host)?;
        self.check_dimension(&end)?;
        self.ends.insert(host.to_string(), end);
        self.rebuild_zone_index();
        Ok(())
    }

    /// Overwrites a host's size estimate (used by rebalancing bookkeeping)
    pub fn set_host_size(&mut self, host: &str, size: u64) -> Result<()> {
        self.check_host(host)?;
        self.sizes.insert(host.to_string(), size);
        let _ = self.tree.set_size(host, size);
        Ok(())
    }

    /// The zone currently assigned to a host
    pub fn zone_of(&self, host: &str) -> Result<Zone> {
        self.check_consistency()?;
        match (self.starts.get(host), self.ends.get(host)) {
            (Some(start), Some(end)) => Ok(Zone::new(start.clone(), end.clone())),
            _ => Err(Error::UnknownHost {
                host: host.to_string(),
            }),
        }
    }

    /// Serializes the mapping for substrate persistence. Geometry, hosts,
    /// zones, sizes, version and the consistency flag round-trip exactly; the
    /// tree and zone index are derived state and are rebuilt on the way in.
    pub fn serialize(&self) -> Result<Bytes> {
        serde_json::to_vec(self)
            .map(Bytes::from)
            .map_err(|e| Error::Serialization {
                reason: e.to_string(),
            })
    }

    pub fn deserialize(data: &[u8]) -> Result<Self> {
        let mut mapping: ZOrderMapping =
            serde_json::from_slice(data).map_err(|e| Error::Serialization {
                reason: e.to_string(),
            })?;
        mapping.tree = PartitionTree::build(&mapping.hosts);
        for (host, size) in mapping.sizes.iter() {
            let _ = mapping.tree.set_size(host, *size);
        }
        mapping.rebuild_zone_index();
        Ok(mapping)
    }

    /// Rebuilds the partition tree and regenerates every zone from the
    /// current membership. Size estimates are reset; rebalancing refreshes
    /// them once data has actually moved.
    fn regenerate(&mut self) {
        self.tree = PartitionTree::build(&self.hosts);
        self.starts.clear();
        self.ends.clear();
        self.sizes.clear();
        for (code, host) in self.tree.as_prefix_map() {
            let zone = zcode::prefix_zone(&code, self.dim, self.depth);
            self.starts.insert(host.clone(), zone.start);
            self.ends.insert(host.clone(), zone.end);
            self.sizes.insert(host, 0);
        }
        self.rebuild_zone_index();
    }

    fn rebuild_zone_index(&mut self) {
        let entries = self
            .hosts
            .iter()
            .filter_map(|host| {
                let start = self.starts.get(host)?.clone();
                let end = self.ends.get(host)?.clone();
                Some((Zone::new(start, end), host.clone()))
            })
            .collect();
        self.zones = ZoneIndex::from_zones(entries);
    }

    fn check_consistency(&self) -> Result<()> {
        if self.consistent {
            Ok(())
        } else {
            Err(Error::Inconsistent)
        }
    }

    fn check_dimension(&self, key: &[u64]) -> Result<()> {
        if key.len() == self.dim {
            Ok(())
        } else {
            Err(Error::DimensionMismatch {
                expected: self.dim,
                got: key.len(),
            })
        }
    }

    fn check_host(&self, host: &str) -> Result<()> {
        if self.hosts.iter().any(|h| h == host) {
            Ok(())
        } else {
            Err(Error::UnknownHost {
                host: host.to_string(),
            })
        }
    }

    fn host_position(&self, host: &str) -> Result<usize> {
        self.hosts
            .iter()
            .position(|h| h == host)
            .ok_or_else(|| Error::UnknownHost {
                host: host.to_string(),
            })
    }
}

impl KeyMapping for ZOrderMapping {
    fn host_for(&self, key: &[u64]) -> Result<String> {
        self.check_consistency()?;
        self.check_dimension(key)?;
        if self.hosts.is_empty() {
            return Err(Error::Empty);
        }
        match self.zones.containing(key) {
            Some(host) => Ok(host.to_string()),
            // zones cover the whole space, a miss means derived state is
            // broken rather than the key being unowned
            None => Err(Error::Inconsistent),
        }
    }

    fn hosts_for(&self, start: &[u64], end: &[u64]) -> Result<Vec<String>> {
        self.check_consistency()?;
        self.check_dimension(start)?;
        self.check_dimension(end)?;
        let query = Zone::new(start.to_vec(), end.to_vec());
        let mut hosts = self.zones.intersecting(&query);
        hosts.dedup();
        Ok(hosts)
    }

    fn hosts(&self) -> Result<Vec<String>> {
        self.check_consistency()?;
        Ok(self.hosts.clone())
    }

    fn first(&self) -> Result<Option<String>> {
        self.check_consistency()?;
        Ok(self.hosts.first().cloned())
    }

    fn successor(&self, host: &str) -> Result<Option<String>> {
        self.check_consistency()?;
        let position = self.host_position(host)?;
        Ok(self.hosts.get(position + 1).cloned())
    }

    fn predecessor(&self, host: &str) -> Result<Option<String>> {
        self.check_consistency()?;
        let position = self.host_position(host)?;
        if position == 0 {
            return Ok(None);
        }
        Ok(self.hosts.get(position - 1).cloned())
    }

    fn add_host(&mut self, host: String) -> Result<()> {
        self.add_hosts(vec![host])
    }

    fn remove_host(&mut self, host: &str) {
        event!(
            Level::WARN,
            "Removing host {} - mapping version {} is now inconsistent",
            host,
            self.version
        );
        self.consistent = false;
        self.hosts.retain(|h| h != host);
        self.sizes.remove(host);
    }

    fn split(&mut self, source: &str, target: &str, amount: u64) -> Result<()> {
        self.check_consistency()?;
        self.check_host(source)?;
        self.check_host(target)?;
        let source_size = self.sizes.get(source).copied().unwrap_or(0);
        let target_size = self.sizes.get(target).copied().unwrap_or(0);
        self.sizes
            .insert(source.to_string(), source_size.saturating_sub(amount));
        self.sizes.insert(target.to_string(), target_size + amount);
        Ok(())
    }

    fn host_size(&self, host: &str) -> Result<u64> {
        self.check_consistency()?;
        self.sizes
            .get(host)
            .copied()
            .ok_or_else(|| Error::UnknownHost {
                host: host.to_string(),
            })
    }

    fn len(&self) -> usize {
        self.hosts.len()
    }

    fn version(&self) -> u64 {
        self.version
    }

    fn set_version(&mut self, version: u64) {
        self.version = version;
    }
}
