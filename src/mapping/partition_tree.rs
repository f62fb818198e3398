//! This file contains the [`PartitionTree`] data structure: an order
//! preserving binary tree over a sequence of host ids.
//!
//! Every leaf holds one host and the path from the root to a leaf (0 = left,
//! 1 = right) is that host's partition code. Leaves partition the code space
//! exactly: no gaps, no overlaps. The tree is arena-indexed and immutable in
//! structure; `add` and `remove` return a new generation instead of mutating
//! shared nodes, so a published tree can be read concurrently without
//! defensive copies.

use super::{Error, Result};

#[derive(Debug, Clone)]
struct TreeNode {
    host: Option<String>,
    left: Option<usize>,
    right: Option<usize>,
    parent: Option<usize>,
    /// Point-count estimate. Internal nodes accumulate their children.
    size: u64,
}

impl TreeNode {
    fn leaf(host: String, parent: Option<usize>) -> Self {
        Self {
            host: Some(host),
            left: None,
            right: None,
            parent,
            size: 0,
        }
    }

    fn is_leaf(&self) -> bool {
        self.host.is_some()
    }
}

#[derive(Debug, Clone, Default)]
pub struct PartitionTree {
    nodes: Vec<TreeNode>,
    root: Option<usize>,
}

impl PartitionTree {
    /// Builds a tree over the given host list by recursive bisection. When a
    /// list of odd length is split, the left half receives the extra element.
    /// The in-order leaf sequence equals the input order and the construction
    /// is fully deterministic, which every node of a cluster relies on when
    /// rebuilding the same mapping independently.
    pub fn build(hosts: &[String]) -> Self {
        let mut tree = Self::default();
        tree.root = tree.build_range(hosts, None);
        tree
    }

    fn build_range(&mut self, hosts: &[String], parent: Option<usize>) -> Option<usize> {
        match hosts.len() {
            0 => None,
            1 => {
                self.nodes.push(TreeNode::leaf(hosts[0].clone(), parent));
                Some(self.nodes.len() - 1)
            }
            n => {
                let index = self.nodes.len();
                self.nodes.push(TreeNode {
                    host: None,
                    left: None,
                    right: None,
                    parent,
                    size: 0,
                });

                let mid = n.div_ceil(2);
                let left = self.build_range(&hosts[..mid], Some(index));
                let right = self.build_range(&hosts[mid..], Some(index));
                self.nodes[index].left = left;
                self.nodes[index].right = right;
                Some(index)
            }
        }
    }

    /// Returns a new generation with `host` inserted at its lexicographic
    /// position among the leaves. Inserting an already present host returns
    /// an unchanged copy.
    pub fn add(&self, host: &str) -> Self {
        let mut leaves = self.leaf_hosts();
        match leaves.binary_search_by(|l| l.as_str().cmp(host)) {
            Ok(_) => self.clone(),
            Err(position) => {
                leaves.insert(position, host.to_string());
                Self::build(&leaves)
            }
        }
    }

    /// Returns a new generation without `host`. The removed leaf's parent is
    /// collapsed into the sibling subtree; codes of unrelated leaves are
    /// unchanged and no full rebuild happens.
    pub fn remove(&self, host: &str) -> Self {
        let mut next = Self::default();
        next.root = match self.root {
            Some(root) => self.copy_without(root, host, &mut next, None),
            None => None,
        };
        next
    }

    fn copy_without(
        &self,
        index: usize,
        host: &str,
        out: &mut Self,
        parent: Option<usize>,
    ) -> Option<usize> {
        let node = &self.nodes[index];
        if node.is_leaf() {
            // only reachable for a single-leaf tree; deeper matches are
            // handled by their parent below
            if node.host.as_deref() == Some(host) {
                return None;
            }
            return Some(self.copy_subtree(index, out, parent));
        }

        let left = node.left.expect("internal nodes are binary");
        let right = node.right.expect("internal nodes are binary");

        // if the removed leaf is a direct child, the sibling subtree takes
        // this node's place
        if self.nodes[left].host.as_deref() == Some(host) {
            return Some(self.copy_subtree(right, out, parent));
        }
        if self.nodes[right].host.as_deref() == Some(host) {
            return Some(self.copy_subtree(left, out, parent));
        }

        let copied_index = out.nodes.len();
        out.nodes.push(TreeNode {
            host: None,
            left: None,
            right: None,
            parent,
            size: 0,
        });

        let left = self
            .copy_without(left, host, out, Some(copied_index))
            .expect("removal below an internal node leaves the subtree non-empty");
        let right = self
            .copy_without(right, host, out, Some(copied_index))
            .expect("removal below an internal node leaves the subtree non-empty");

        let size = out.nodes[left].size + out.nodes[right].size;
        let copied = &mut out.nodes[copied_index];
        copied.left = Some(left);
        copied.right = Some(right);
        copied.size = size;
        Some(copied_index)
    }

    fn copy_subtree(&self, index: usize, out: &mut Self, parent: Option<usize>) -> usize {
        let node = &self.nodes[index];
        let copied_index = out.nodes.len();
        out.nodes.push(TreeNode {
            host: node.host.clone(),
            left: None,
            right: None,
            parent,
            size: node.size,
        });
        if let Some(left) = node.left {
            let copied = self.copy_subtree(left, out, Some(copied_index));
            out.nodes[copied_index].left = Some(copied);
        }
        if let Some(right) = node.right {
            let copied = self.copy_subtree(right, out, Some(copied_index));
            out.nodes[copied_index].right = Some(copied);
        }
        copied_index
    }

    /// The hosts of all leaves, left to right
    pub fn leaf_hosts(&self) -> Vec<String> {
        let mut hosts = Vec::new();
        if let Some(root) = self.root {
            self.collect_leaves(root, &mut |node: &TreeNode| {
                hosts.push(node.host.clone().unwrap())
            });
        }
        hosts
    }

    /// The partition code of every leaf, in leaf order. Codes are binary
    /// strings; a single-leaf tree owns the empty code (the whole space).
    pub fn as_prefix_map(&self) -> Vec<(String, String)> {
        let mut map = Vec::new();
        if let Some(root) = self.root {
            self.collect_codes(root, String::new(), &mut map);
        }
        map
    }

    fn collect_codes(&self, index: usize, code: String, out: &mut Vec<(String, String)>) {
        let node = &self.nodes[index];
        if let Some(host) = &node.host {
            out.push((code, host.clone()));
            return;
        }
        if let Some(left) = node.left {
            self.collect_codes(left, format!("{}0", code), out);
        }
        if let Some(right) = node.right {
            self.collect_codes(right, format!("{}1", code), out);
        }
    }

    fn collect_leaves(&self, index: usize, visit: &mut impl FnMut(&TreeNode)) {
        let node = &self.nodes[index];
        if node.is_leaf() {
            visit(node);
            return;
        }
        if let Some(left) = node.left {
            self.collect_leaves(left, visit);
        }
        if let Some(right) = node.right {
            self.collect_leaves(right, visit);
        }
    }

    /// Descends the tree one bit at a time: `bit_at(i)` supplies the i-th
    /// code bit, false goes left and true goes right. Returns the host of the
    /// leaf reached, or `None` on an empty tree.
    pub fn find_leaf(&self, mut bit_at: impl FnMut(usize) -> bool) -> Option<&str> {
        let mut index = self.root?;
        let mut position = 0;
        loop {
            let node = &self.nodes[index];
            if node.is_leaf() {
                return node.host.as_deref();
            }
            index = if bit_at(position) {
                node.right.expect("internal nodes are binary")
            } else {
                node.left.expect("internal nodes are binary")
            };
            position += 1;
        }
    }

    /// Updates the size estimate of a host's leaf and re-accumulates the
    /// ancestor path up to the root
    pub fn set_size(&mut self, host: &str, size: u64) -> Result<()> {
        let leaf = self
            .nodes
            .iter()
            .position(|n| n.host.as_deref() == Some(host))
            .ok_or_else(|| Error::UnknownHost {
                host: host.to_string(),
            })?;

        self.nodes[leaf].size = size;
        let mut current = self.nodes[leaf].parent;
        while let Some(index) = current {
            let left = self.nodes[index].left.map_or(0, |l| self.nodes[l].size);
            let right = self.nodes[index].right.map_or(0, |r| self.nodes[r].size);
            self.nodes[index].size = left + right;
            current = self.nodes[index].parent;
        }
        Ok(())
    }

    pub fn size_of(&self, host: &str) -> Option<u64> {
        self.nodes
            .iter()
            .find(|n| n.host.as_deref() == Some(host))
            .map(|n| n.size)
    }

    /// Total size estimate of the tree
    pub fn total_size(&self) -> u64 {
        self.root.map_or(0, |root| self.nodes[root].size)
    }

    /// The leaf with the largest size estimate, the natural candidate when a
    /// rebalance has to pick a donor. Ties resolve to the leftmost leaf.
    pub fn heaviest_leaf(&self) -> Option<(String, u64)> {
        let mut heaviest: Option<(String, u64)> = None;
        if let Some(root) = self.root {
            self.collect_leaves(root, &mut |node: &TreeNode| {
                let size = node.size;
                if heaviest.as_ref().map_or(true, |(_, max)| size > *max) {
                    heaviest = Some((node.host.clone().unwrap(), size));
                }
            });
        }
        heaviest
    }

    pub fn len(&self) -> usize {
        self.nodes.iter().filter(|n| n.is_leaf()).count()
    }

    pub fn is_empty(&self) -> bool {
        self.root.is_none()
    }
}

#[cfg(test)]
mod tests {
    use super::PartitionTree;
    use crate::utils::generate_random_ascii_string;
    use quickcheck::Arbitrary;

    fn hosts(names: &[&str]) -> Vec<String> {
        names.iter().map(|n| n.to_string()).collect()
    }

    #[test]
    fn build_assigns_ceil_half_to_the_left() {
        let tree = PartitionTree::build(&hosts(&["a", "b", "c"]));
        assert_eq!(
            tree.as_prefix_map(),
            vec![
                ("00".to_string(), "a".to_string()),
                ("01".to_string(), "b".to_string()),
                ("1".to_string(), "c".to_string()),
            ]
        );
    }

    #[test]
    fn build_single_host_owns_the_empty_code() {
        let tree = PartitionTree::build(&hosts(&["a"]));
        assert_eq!(
            tree.as_prefix_map(),
            vec![("".to_string(), "a".to_string())]
        );
    }

    #[test]
    fn add_preserves_lexicographic_leaf_order() {
        let tree = PartitionTree::build(&hosts(&["a", "c"]));
        let tree = tree.add("b");
        assert_eq!(tree.leaf_hosts(), hosts(&["a", "b", "c"]));

        // re-adding an existing host changes nothing
        let unchanged = tree.add("b");
        assert_eq!(unchanged.as_prefix_map(), tree.as_prefix_map());
    }

    #[test]
    fn remove_collapses_parent_into_sibling() {
        let tree = PartitionTree::build(&hosts(&["a", "b", "c"]));
        let tree = tree.remove("b");
        assert_eq!(
            tree.as_prefix_map(),
            vec![
                ("0".to_string(), "a".to_string()),
                ("1".to_string(), "c".to_string()),
            ]
        );
    }

    #[test]
    fn remove_does_not_disturb_unrelated_codes() {
        let tree = PartitionTree::build(&hosts(&["a", "b", "c", "d"]));
        let tree = tree.remove("a");
        assert_eq!(
            tree.as_prefix_map(),
            vec![
                ("0".to_string(), "b".to_string()),
                ("10".to_string(), "c".to_string()),
                ("11".to_string(), "d".to_string()),
            ]
        );
    }

    #[test]
    fn remove_last_leaf_empties_the_tree() {
        let tree = PartitionTree::build(&hosts(&["a"]));
        let tree = tree.remove("a");
        assert!(tree.is_empty());
        assert_eq!(tree.len(), 0);
    }

    #[test]
    fn find_leaf_follows_code_bits() {
        let tree = PartitionTree::build(&hosts(&["a", "b", "c"]));
        for (code, host) in tree.as_prefix_map() {
            let bits: Vec<bool> = code.chars().map(|c| c == '1').collect();
            let found = tree.find_leaf(|i| bits.get(i).copied().unwrap_or(false));
            assert_eq!(found, Some(host.as_str()));
        }
    }

    #[test]
    fn sizes_accumulate_to_the_root() {
        let mut tree = PartitionTree::build(&hosts(&["a", "b", "c"]));
        tree.set_size("a", 10).unwrap();
        tree.set_size("b", 20).unwrap();
        tree.set_size("c", 5).unwrap();

        assert_eq!(tree.total_size(), 35);
        assert_eq!(tree.size_of("b"), Some(20));
        assert_eq!(tree.heaviest_leaf(), Some(("b".to_string(), 20)));

        assert!(tree.set_size("nope", 1).is_err());
    }

    #[derive(Debug, Clone)]
    struct HostList {
        hosts: Vec<String>,
    }

    impl Arbitrary for HostList {
        fn arbitrary(g: &mut quickcheck::Gen) -> Self {
            let n = usize::arbitrary(g) % 40 + 1;
            let mut hosts: Vec<String> =
                (0..n).map(|_| generate_random_ascii_string(12)).collect();
            hosts.sort();
            hosts.dedup();
            Self { hosts }
        }
    }

    #[quickcheck]
    fn build_is_deterministic(input: HostList) {
        let first = PartitionTree::build(&input.hosts);
        let second = PartitionTree::build(&input.hosts);
        assert_eq!(first.as_prefix_map(), second.as_prefix_map());
        assert_eq!(first.leaf_hosts(), input.hosts);
    }

    #[quickcheck]
    fn codes_are_prefix_free(input: HostList) {
        let tree = PartitionTree::build(&input.hosts);
        let codes: Vec<String> = tree.as_prefix_map().into_iter().map(|(c, _)| c).collect();
        for (i, a) in codes.iter().enumerate() {
            for (j, b) in codes.iter().enumerate() {
                if i != j {
                    assert!(!a.starts_with(b.as_str()) && !b.starts_with(a.as_str()));
                }
            }
        }
    }
}
