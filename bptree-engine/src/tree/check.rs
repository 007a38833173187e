//! Whole-tree invariant walker, used by tests after each mutation
//!
//! Walks every block reachable from the root and asserts the structural
//! invariants: fill bounds, separator ordering, subtree key bounds, parent
//! pointers, bidirectional sibling chains at every depth, leaf-chain key
//! order, uniform leaf depth, and metadata counts.

use super::BPlusTree;
use crate::storage::key::Key;
use crate::storage::node::{BlockHeader, Leaf, Node};

pub(crate) fn verify(tree: &BPlusTree) {
    let meta = tree.info();
    assert!(meta.height >= 1, "height must be at least 1");
    assert_ne!(meta.root_offset, 0, "missing root offset");
    assert_ne!(meta.first_leaf_offset, 0, "missing first leaf offset");

    let mut walker = Walker {
        tree,
        order: meta.order as usize,
        min_fill: (meta.order as usize).div_ceil(2),
        height: meta.height,
        single_node: meta.node_count == 1,
        single_leaf: meta.leaf_count == 1,
        levels: vec![Vec::new(); meta.height as usize],
        leaves: Vec::new(),
        last_leaf_key: None,
    };
    walker.walk_node(meta.root_offset, 1, 0, None, None);

    // Exactly one root; every level and the leaf chain populated
    assert_eq!(walker.levels[0].len(), 1, "root level must hold one node");
    for level in &walker.levels {
        assert!(!level.is_empty(), "empty internal level");
        check_chain(level);
    }
    check_chain(&walker.leaves);

    let node_total: usize = walker.levels.iter().map(|l| l.len()).sum();
    assert_eq!(meta.node_count as usize, node_total, "node count drifted");
    assert_eq!(
        meta.leaf_count as usize,
        walker.leaves.len(),
        "leaf count drifted"
    );
    assert_eq!(
        meta.first_leaf_offset, walker.leaves[0].0,
        "first leaf offset drifted"
    );
}

struct Walker<'a> {
    tree: &'a BPlusTree,
    order: usize,
    min_fill: usize,
    height: u64,
    single_node: bool,
    single_leaf: bool,
    /// In-order (offset, header) per internal depth, root level first
    levels: Vec<Vec<(u64, BlockHeader)>>,
    leaves: Vec<(u64, BlockHeader)>,
    last_leaf_key: Option<Key>,
}

impl Walker<'_> {
    fn walk_node(&mut self, offset: u64, depth: u64, parent: u64, lo: Option<Key>, hi: Option<Key>) {
        let node: Node = self.tree.read_at(offset).unwrap();
        assert_eq!(node.header.parent, parent, "parent pointer drifted at {offset}");

        if parent == 0 {
            let root_min = if self.single_node { 1 } else { 2 };
            assert!(node.len() >= root_min, "root below minimum fill");
        } else {
            assert!(node.len() >= self.min_fill, "node {offset} under-full");
        }
        assert!(node.len() <= self.order, "node {offset} over-full");

        // Separators strictly ascend and stay inside the inherited bounds;
        // the last entry's key slot is undefined and skipped
        let separators = &node.entries[..node.len() - 1];
        for (i, entry) in separators.iter().enumerate() {
            if i > 0 {
                assert!(
                    separators[i - 1].key < entry.key,
                    "separators out of order at {offset}"
                );
            }
            if let Some(lo) = lo {
                assert!(entry.key >= lo, "separator below subtree bound at {offset}");
            }
            if let Some(hi) = hi {
                assert!(entry.key < hi, "separator above subtree bound at {offset}");
            }
        }

        self.levels[depth as usize - 1].push((offset, node.header));

        for (i, entry) in node.entries.iter().enumerate() {
            let child_lo = if i == 0 { lo } else { Some(node.entries[i - 1].key) };
            let child_hi = if i < node.len() - 1 {
                Some(node.entries[i].key)
            } else {
                hi
            };
            if depth == self.height {
                self.walk_leaf(entry.child, offset, child_lo, child_hi);
            } else {
                self.walk_node(entry.child, depth + 1, offset, child_lo, child_hi);
            }
        }
    }

    fn walk_leaf(&mut self, offset: u64, parent: u64, lo: Option<Key>, hi: Option<Key>) {
        let leaf: Leaf = self.tree.read_at(offset).unwrap();
        assert_eq!(leaf.header.parent, parent, "leaf parent drifted at {offset}");

        if !self.single_leaf {
            assert!(leaf.len() >= self.min_fill, "leaf {offset} under-full");
        }
        assert!(leaf.len() <= self.order, "leaf {offset} over-full");

        for record in &leaf.records {
            if let Some(last) = self.last_leaf_key {
                assert!(last < record.key, "leaf chain keys out of order at {offset}");
            }
            if let Some(lo) = lo {
                assert!(record.key >= lo, "record below subtree bound at {offset}");
            }
            if let Some(hi) = hi {
                assert!(record.key < hi, "record above subtree bound at {offset}");
            }
            self.last_leaf_key = Some(record.key);
        }

        self.leaves.push((offset, leaf.header));
    }
}

/// The in-order blocks of one depth must form one bidirectionally consistent
/// chain terminated by 0 at both ends
fn check_chain(blocks: &[(u64, BlockHeader)]) {
    assert_eq!(blocks[0].1.prev, 0, "chain head has a predecessor");
    assert_eq!(blocks[blocks.len() - 1].1.next, 0, "chain tail has a successor");
    for pair in blocks.windows(2) {
        assert_eq!(pair[0].1.next, pair[1].0, "broken next link");
        assert_eq!(pair[1].1.prev, pair[0].0, "broken prev link");
    }
}
