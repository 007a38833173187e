//! Insertion and split propagation
//!
//! A full leaf splits at `order / 2` (nudged right when the incoming key
//! sorts above the split record) and promotes the new right sibling's first
//! key into the parent. A full parent splits around its middle separator and
//! recurses; a split that reaches offset 0 grows a fresh root and the tree
//! gains a level.

use tracing::{debug, trace};

use crate::error::{TreeError, TreeResult};
use crate::storage::key::{Key, Value};
use crate::storage::node::{IndexEntry, Leaf, Node};

use super::BPlusTree;

impl BPlusTree {
    /// Insert a new record. Fails with `DuplicateKey` if an equal key is
    /// already present, leaving the tree unchanged.
    pub fn insert(&mut self, key: &Key, value: &Value) -> TreeResult<()> {
        let index_offset = self.search_index(key)?;
        let offset = self.search_leaf_from(index_offset, key)?;
        let mut leaf: Leaf = self.read_at(offset)?;

        if leaf.contains(key) {
            return Err(TreeError::DuplicateKey);
        }

        if leaf.len() < self.meta.order as usize {
            leaf.insert_record(key, value);
            return self.write_at(offset, &leaf);
        }

        // Overflow: split off a new right sibling
        trace!("splitting leaf at offset {}", offset);
        let mut new_leaf = Leaf::new();
        let new_offset = self.link_new_sibling(offset, &mut leaf, &mut new_leaf)?;

        let mut point = leaf.len() / 2;
        let place_right = *key > leaf.records[point].key;
        if place_right {
            point += 1;
        }
        new_leaf.records = leaf.records.split_off(point);

        if place_right {
            new_leaf.insert_record(key, value);
        } else {
            leaf.insert_record(key, value);
        }

        self.write_at(offset, &leaf)?;
        self.write_at(new_offset, &new_leaf)?;

        let separator = new_leaf.records[0].key;
        self.insert_separator(index_offset, &separator, offset, new_offset)
    }

    /// Promote `separator` into the node at `node_offset`, with `left` and
    /// `right` the block pair it distinguishes. Splits and recurses upward
    /// while nodes overflow; offset 0 means the old root was split and a new
    /// one is grown.
    fn insert_separator(
        &mut self,
        node_offset: u64,
        separator: &Key,
        left: u64,
        right: u64,
    ) -> TreeResult<()> {
        if node_offset == 0 {
            return self.grow_root(separator, left, right);
        }

        let mut node: Node = self.read_at(node_offset)?;
        assert!(
            node.len() <= self.meta.order as usize,
            "node above tree order"
        );

        if node.len() < self.meta.order as usize {
            node.insert_entry(separator, right);
            return self.write_at(node_offset, &node);
        }

        // Full node: split around the middle separator and push it up
        trace!("splitting internal node at offset {}", node_offset);
        let mut new_node = Node::new();
        let new_offset = self.link_new_sibling(node_offset, &mut node, &mut new_node)?;

        let mut mid = (node.len() - 1) / 2;
        let to_right = *separator > node.entries[mid].key;
        if to_right {
            mid += 1;
        }
        if to_right && *separator < node.entries[mid].key {
            mid -= 1;
        }
        let mid_key = node.entries[mid].key;

        // Entries past the middle move right; the middle entry stays as the
        // left node's (now key-less) last entry, its key promoted
        new_node.entries = node.entries.split_off(mid + 1);

        if to_right {
            new_node.insert_entry(separator, right);
        } else {
            node.insert_entry(separator, right);
        }

        self.write_at(node_offset, &node)?;
        self.write_at(new_offset, &new_node)?;

        for entry in &new_node.entries {
            self.rewrite_parent(entry.child, new_offset)?;
        }

        self.insert_separator(node.header.parent, &mid_key, node_offset, new_offset)
    }

    /// The old root split: allocate a fresh root over the pair and grow the
    /// tree by one level
    fn grow_root(&mut self, separator: &Key, left: u64, right: u64) -> TreeResult<()> {
        let mut root = Node::new();
        let root_offset = self.alloc_block::<Node>();

        root.entries.push(IndexEntry {
            key: *separator,
            child: left,
        });
        root.entries.push(IndexEntry {
            key: Key::EMPTY,
            child: right,
        });

        self.meta.root_offset = root_offset;
        self.meta.height += 1;
        debug!(
            "grew new root at offset {}, height now {}",
            root_offset, self.meta.height
        );

        self.write_meta()?;
        self.write_at(root_offset, &root)?;

        for entry in &root.entries {
            self.rewrite_parent(entry.child, root_offset)?;
        }
        Ok(())
    }
}
