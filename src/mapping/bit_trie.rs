//! The bit-trie [`KeyMapping`] variant.
//!
//! Ownership is answered by descending the [`PartitionTree`] one key bit at a
//! time through a [`KeyBits`] adapter, so this mapping never needs to know how
//! keys are shaped. The price is precision on ranges: without zone geometry a
//! range query can only be answered conservatively with every host.

use serde::{Deserialize, Serialize};

use super::partition_tree::PartitionTree;
use super::zcode;
use super::{Error, KeyMapping, Result};

/// Adapter turning a key into the bit sequence that drives the trie descent
pub trait KeyBits: Send + Sync {
    /// The `position`-th bit of the key's code, most significant first
    fn bit(&self, key: &[u64], position: usize) -> bool;
}

/// [`KeyBits`] for multi-dimensional keys linearized on the Z-order curve
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct ZOrderBits {
    pub dim: usize,
    pub depth: u32,
}

impl KeyBits for ZOrderBits {
    fn bit(&self, key: &[u64], position: usize) -> bool {
        zcode::address_bit(key, self.depth, position)
    }
}

pub struct BitTrieMapping<C> {
    tree: PartitionTree,
    converter: C,
    version: u64,
    consistent: bool,
}

impl<C: KeyBits> BitTrieMapping<C> {
    pub fn new(converter: C) -> Self {
        Self {
            tree: PartitionTree::default(),
            converter,
            version: 0,
            consistent: true,
        }
    }

    pub fn with_hosts(converter: C, hosts: &[String]) -> Self {
        Self {
            tree: PartitionTree::build(hosts),
            converter,
            version: 0,
            consistent: true,
        }
    }

    fn check_consistency(&self) -> Result<()> {
        if self.consistent {
            Ok(())
        } else {
            Err(Error::Inconsistent)
        }
    }

    fn host_position(&self, host: &str) -> Result<usize> {
        let hosts = self.tree.leaf_hosts();
        hosts
            .iter()
            .position(|h| h == host)
            .ok_or_else(|| Error::UnknownHost {
                host: host.to_string(),
            })
    }
}

impl<C: KeyBits> KeyMapping for BitTrieMapping<C> {
    fn host_for(&self, key: &[u64]) -> Result<String> {
        self.check_consistency()?;
        self.tree
            .find_leaf(|position| self.converter.bit(key, position))
            .map(|h| h.to_string())
            .ok_or(Error::Empty)
    }

    /// Every host may hold part of the range: without zones there is nothing
    /// to intersect against, so the answer is the full host list
    fn hosts_for(&self, _start: &[u64], _end: &[u64]) -> Result<Vec<String>> {
        self.check_consistency()?;
        Ok(self.tree.leaf_hosts())
    }

    fn hosts(&self) -> Result<Vec<String>> {
        self.check_consistency()?;
        Ok(self.tree.leaf_hosts())
    }

    fn first(&self) -> Result<Option<String>> {
        self.check_consistency()?;
        Ok(self.tree.leaf_hosts().into_iter().next())
    }

    fn successor(&self, host: &str) -> Result<Option<String>> {
        self.check_consistency()?;
        let position = self.host_position(host)?;
        Ok(self.tree.leaf_hosts().into_iter().nth(position + 1))
    }

    fn predecessor(&self, host: &str) -> Result<Option<String>> {
        self.check_consistency()?;
        let position = self.host_position(host)?;
        if position == 0 {
            return Ok(None);
        }
        Ok(self.tree.leaf_hosts().into_iter().nth(position - 1))
    }

    fn add_host(&mut self, host: String) -> Result<()> {
        self.check_consistency()?;
        self.tree = self.tree.add(&host);
        Ok(())
    }

    fn remove_host(&mut self, host: &str) {
        self.consistent = false;
        self.tree = self.tree.remove(host);
    }

    fn split(&mut self, source: &str, target: &str, amount: u64) -> Result<()> {
        self.check_consistency()?;
        let source_size = self.tree.size_of(source).ok_or_else(|| Error::UnknownHost {
            host: source.to_string(),
        })?;
        let target_size = self.tree.size_of(target).ok_or_else(|| Error::UnknownHost {
            host: target.to_string(),
        })?;

        self.tree
            .set_size(source, source_size.saturating_sub(amount))?;
        self.tree.set_size(target, target_size + amount)?;
        Ok(())
    }

    fn host_size(&self, host: &str) -> Result<u64> {
        self.check_consistency()?;
        self.tree.size_of(host).ok_or_else(|| Error::UnknownHost {
            host: host.to_string(),
        })
    }

    fn len(&self) -> usize {
        self.tree.len()
    }

    fn version(&self) -> u64 {
        self.version
    }

    fn set_version(&mut self, version: u64) {
        self.version = version;
    }
}
