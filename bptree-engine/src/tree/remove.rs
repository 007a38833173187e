//! Deletion and borrow/merge propagation
//!
//! An under-full block first tries to borrow one entry from its left
//! sibling, then from its right; failing both it merges with a sibling
//! (into the left one when it is its parent's last child, absorbing the
//! right one otherwise) and the separator that distinguished the pair is
//! demoted out of the parent, recursing. A root left with a single child
//! while other internal nodes remain collapses and the tree loses a level.
//!
//! Leaf borrows may cross parent boundaries, so their separator fixup walks
//! up through `update_parent_key`. Merges never cross: the partner is always
//! an adjacent child of the same parent.

use tracing::{debug, trace};

use crate::error::{TreeError, TreeResult};
use crate::storage::key::Key;
use crate::storage::node::{IndexEntry, Leaf, Node};

use super::BPlusTree;

impl BPlusTree {
    /// Remove the record stored under `key`
    pub fn remove(&mut self, key: &Key) -> TreeResult<()> {
        let parent_offset = self.search_index(key)?;
        let mut parent: Node = self.read_at(parent_offset)?;
        let pos = parent.find(key);
        let offset = parent.entries[pos].child;
        let mut leaf: Leaf = self.read_at(offset)?;

        let at = leaf.lower_bound(key);
        if at >= leaf.len() || leaf.records[at].key != *key {
            return Err(TreeError::NotFound);
        }

        let min = if self.meta.leaf_count == 1 {
            0
        } else {
            self.min_fill()
        };
        assert!(
            leaf.len() >= min && leaf.len() <= self.meta.order as usize,
            "leaf fill outside bounds before removal"
        );

        leaf.records.remove(at);

        if leaf.len() >= min {
            return self.write_at(offset, &leaf);
        }

        // Underflow: borrow from a neighbor, else merge with one
        let mut done = false;
        if leaf.header.prev != 0 {
            done = self.borrow_leaf_left(offset, &mut leaf)?;
        }
        if !done && leaf.header.next != 0 {
            done = self.borrow_leaf_right(&mut leaf)?;
        }
        if done {
            return self.write_at(offset, &leaf);
        }

        assert!(
            leaf.header.prev != 0 || leaf.header.next != 0,
            "under-full leaf with no sibling"
        );

        if pos == parent.len() - 1 {
            // Last child of its parent: fold into the left sibling
            let prev_offset = leaf.header.prev;
            assert_eq!(
                parent.entries[pos - 1].child,
                prev_offset,
                "leaf chain and parent entries disagree"
            );
            let mut prev: Leaf = self.read_at(prev_offset)?;
            let separator = parent.entries[pos - 1].key;
            trace!("merging leaf {} into {}", offset, prev_offset);

            prev.records.append(&mut leaf.records);
            self.unlink_sibling(&mut prev, &leaf)?;
            self.write_at(prev_offset, &prev)?;
            self.remove_separator(parent_offset, &mut parent, &separator)
        } else {
            // Absorb the right sibling
            let next_offset = leaf.header.next;
            assert_eq!(
                parent.entries[pos + 1].child,
                next_offset,
                "leaf chain and parent entries disagree"
            );
            let mut next: Leaf = self.read_at(next_offset)?;
            let separator = parent.entries[pos].key;
            trace!("merging leaf {} into {}", next_offset, offset);

            leaf.records.append(&mut next.records);
            self.unlink_sibling(&mut leaf, &next)?;
            self.write_at(offset, &leaf)?;
            self.remove_separator(parent_offset, &mut parent, &separator)
        }
    }

    // ---- leaf rebalancing ------------------------------------------------

    /// Move the left sibling's last record to this leaf's front. The
    /// separator bounding the lender becomes the moved key.
    fn borrow_leaf_left(&mut self, offset: u64, leaf: &mut Leaf) -> TreeResult<bool> {
        let lender_offset = leaf.header.prev;
        let mut lender: Leaf = self.read_at(lender_offset)?;
        assert!(lender.len() >= self.min_fill(), "lender below minimum fill");
        if lender.len() <= self.min_fill() {
            return Ok(false);
        }
        trace!("leaf {} borrows from left sibling {}", offset, lender_offset);

        let moved = *lender.records.last().unwrap();
        let lender_first = lender.records[0].key;
        self.update_parent_key(lender.header.parent, &lender_first, &moved.key)?;

        lender.records.pop();
        leaf.records.insert(0, moved);
        self.write_at(lender_offset, &lender)?;
        Ok(true)
    }

    /// Move the right sibling's first record to this leaf's tail. The
    /// separator bounding this leaf becomes the lender's next first key.
    fn borrow_leaf_right(&mut self, leaf: &mut Leaf) -> TreeResult<bool> {
        let lender_offset = leaf.header.next;
        let mut lender: Leaf = self.read_at(lender_offset)?;
        assert!(lender.len() >= self.min_fill(), "lender below minimum fill");
        if lender.len() <= self.min_fill() {
            return Ok(false);
        }

        let new_separator = lender.records[1].key;
        let leaf_first = leaf.records[0].key;
        self.update_parent_key(leaf.header.parent, &leaf_first, &new_separator)?;

        let moved = lender.records.remove(0);
        leaf.records.push(moved);
        self.write_at(lender_offset, &lender)?;
        Ok(true)
    }

    // ---- separator demotion ----------------------------------------------

    /// Remove the separator `separator` from the node at `offset`: the pair
    /// it distinguished has merged, so its left child pointer is copied over
    /// its successor and the entry array shifts left. Rebalances the node
    /// and recurses when it underflows in turn.
    fn remove_separator(
        &mut self,
        offset: u64,
        node: &mut Node,
        separator: &Key,
    ) -> TreeResult<()> {
        let min = if offset == self.meta.root_offset {
            1
        } else {
            self.min_fill()
        };
        assert!(
            node.len() >= min && node.len() <= self.meta.order as usize,
            "node fill outside bounds before separator removal"
        );

        // The pair's left entry carries the separator; separators are
        // strictly increasing so the lower bound pins it exactly
        let pos = node.entries[..node.len() - 1].partition_point(|e| e.key < *separator);
        assert!(pos < node.len() - 1, "separator missing from parent node");
        assert_eq!(
            node.entries[pos].key, *separator,
            "separator key mismatch in parent node"
        );
        node.entries[pos + 1].child = node.entries[pos].child;
        node.entries.remove(pos);

        if offset == self.meta.root_offset
            && node.len() == 1
            && self.meta.node_count != 1
        {
            return self.collapse_root(node);
        }

        if node.len() >= min {
            return self.write_at(offset, node);
        }

        self.rebalance_node(offset, node)
    }

    /// The root routes through a single child and other internal nodes
    /// remain: the child takes over as root and the tree loses a level
    fn collapse_root(&mut self, root: &Node) -> TreeResult<()> {
        self.unalloc_block::<Node>();
        self.meta.height -= 1;
        self.meta.root_offset = root.entries[0].child;
        self.rewrite_parent(self.meta.root_offset, 0)?;
        self.write_meta()?;
        debug!(
            "collapsed root into {}, height now {}",
            self.meta.root_offset, self.meta.height
        );
        Ok(())
    }

    // ---- internal-node rebalancing ---------------------------------------

    fn rebalance_node(&mut self, offset: u64, node: &mut Node) -> TreeResult<()> {
        let parent_offset = node.header.parent;
        assert_ne!(parent_offset, 0, "under-full non-root node without parent");
        let mut parent: Node = self.read_at(parent_offset)?;
        let pos = parent.position_of_child(offset);

        let mut done = false;
        if pos > 0 {
            done = self.borrow_node_left(offset, node, parent_offset, &mut parent, pos)?;
        }
        if !done && pos < parent.len() - 1 {
            done = self.borrow_node_right(offset, node, parent_offset, &mut parent, pos)?;
        }
        if done {
            return self.write_at(offset, node);
        }

        assert!(
            node.header.prev != 0 || node.header.next != 0,
            "under-full node with no sibling"
        );

        if pos == parent.len() - 1 {
            let prev_offset = node.header.prev;
            assert_eq!(
                parent.entries[pos - 1].child,
                prev_offset,
                "sibling chain and parent entries disagree"
            );
            let mut prev: Node = self.read_at(prev_offset)?;
            let separator = parent.entries[pos - 1].key;
            trace!("merging node {} into {}", offset, prev_offset);

            for entry in &node.entries {
                self.rewrite_parent(entry.child, prev_offset)?;
            }
            // The left block's key-less last entry becomes interior; its
            // bound is exactly the demoted separator
            prev.entries.last_mut().unwrap().key = separator;
            prev.entries.append(&mut node.entries);
            self.unlink_sibling(&mut prev, node)?;
            self.write_at(prev_offset, &prev)?;
            self.remove_separator(parent_offset, &mut parent, &separator)
        } else {
            let next_offset = node.header.next;
            assert_eq!(
                parent.entries[pos + 1].child,
                next_offset,
                "sibling chain and parent entries disagree"
            );
            let mut next: Node = self.read_at(next_offset)?;
            let separator = parent.entries[pos].key;
            trace!("merging node {} into {}", next_offset, offset);

            for entry in &next.entries {
                self.rewrite_parent(entry.child, offset)?;
            }
            node.entries.last_mut().unwrap().key = separator;
            node.entries.append(&mut next.entries);
            self.unlink_sibling(node, &next)?;
            self.write_at(offset, node)?;
            self.remove_separator(parent_offset, &mut parent, &separator)
        }
    }

    /// Rotate one entry in from the left sibling, turning the old parent
    /// separator into the moved entry's bound and promoting the lender's
    /// new boundary key into the parent
    fn borrow_node_left(
        &mut self,
        offset: u64,
        node: &mut Node,
        parent_offset: u64,
        parent: &mut Node,
        pos: usize,
    ) -> TreeResult<bool> {
        let lender_offset = parent.entries[pos - 1].child;
        assert_eq!(lender_offset, node.header.prev, "parent entry is not the chain predecessor");
        let mut lender: Node = self.read_at(lender_offset)?;
        assert!(lender.len() >= self.min_fill(), "lender below minimum fill");
        if lender.len() <= self.min_fill() {
            return Ok(false);
        }
        trace!("node {} borrows from left sibling {}", offset, lender_offset);

        let moved = lender.entries.pop().unwrap();
        let new_separator = lender.entries.last().unwrap().key;
        let old_separator = parent.entries[pos - 1].key;
        parent.entries[pos - 1].key = new_separator;

        node.entries.insert(
            0,
            IndexEntry {
                key: old_separator,
                child: moved.child,
            },
        );
        self.rewrite_parent(moved.child, offset)?;

        self.write_at(lender_offset, &lender)?;
        self.write_at(parent_offset, parent)?;
        Ok(true)
    }

    /// Mirror image: rotate in the right sibling's first entry. The old
    /// separator becomes the bound of this node's previously key-less last
    /// entry; the moved entry's key rises into the parent.
    fn borrow_node_right(
        &mut self,
        offset: u64,
        node: &mut Node,
        parent_offset: u64,
        parent: &mut Node,
        pos: usize,
    ) -> TreeResult<bool> {
        let lender_offset = parent.entries[pos + 1].child;
        assert_eq!(lender_offset, node.header.next, "parent entry is not the chain successor");
        let mut lender: Node = self.read_at(lender_offset)?;
        assert!(lender.len() >= self.min_fill(), "lender below minimum fill");
        if lender.len() <= self.min_fill() {
            return Ok(false);
        }
        trace!("node {} borrows from right sibling {}", offset, lender_offset);

        let moved = lender.entries.remove(0);
        let old_separator = parent.entries[pos].key;
        parent.entries[pos].key = moved.key;

        node.entries.last_mut().unwrap().key = old_separator;
        node.entries.push(IndexEntry {
            key: moved.key,
            child: moved.child,
        });
        self.rewrite_parent(moved.child, offset)?;

        self.write_at(lender_offset, &lender)?;
        self.write_at(parent_offset, parent)?;
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::super::check;
    use super::*;
    use crate::storage::key::Value;
    use tempfile::TempDir;

    fn open_tree(dir: &TempDir) -> BPlusTree {
        BPlusTree::with_order(dir.path().join("tree.idx"), true, 4).unwrap()
    }

    fn insert_all(tree: &mut BPlusTree, keys: &[&str]) {
        for k in keys {
            tree.insert(&Key::from(*k), &Value::from(*k)).unwrap();
        }
    }

    fn leaf_keys(tree: &BPlusTree) -> Vec<Vec<Key>> {
        let mut leaves = Vec::new();
        let mut offset = tree.meta.first_leaf_offset;
        while offset != 0 {
            let leaf: Leaf = tree.read_at(offset).unwrap();
            leaves.push(leaf.records.iter().map(|r| r.key).collect());
            offset = leaf.header.next;
        }
        leaves
    }

    fn root_separators(tree: &BPlusTree) -> Vec<Key> {
        let root: Node = tree.read_at(tree.meta.root_offset).unwrap();
        root.entries[..root.len() - 1]
            .iter()
            .map(|e| e.key)
            .collect()
    }

    #[test]
    fn test_remove_missing_key() {
        let dir = TempDir::new().unwrap();
        let mut tree = open_tree(&dir);
        assert!(matches!(
            tree.remove(&Key::from("a")),
            Err(TreeError::NotFound)
        ));

        insert_all(&mut tree, &["a", "b"]);
        assert!(matches!(
            tree.remove(&Key::from("c")),
            Err(TreeError::NotFound)
        ));
        check::verify(&tree);
    }

    #[test]
    fn test_remove_is_idempotent() {
        let dir = TempDir::new().unwrap();
        let mut tree = open_tree(&dir);
        insert_all(&mut tree, &["a", "b", "c"]);

        tree.remove(&Key::from("b")).unwrap();
        assert!(matches!(
            tree.lookup(&Key::from("b")),
            Err(TreeError::NotFound)
        ));
        let snapshot = tree.info();
        assert!(matches!(
            tree.remove(&Key::from("b")),
            Err(TreeError::NotFound)
        ));
        assert_eq!(tree.info(), snapshot);
        check::verify(&tree);
    }

    #[test]
    fn test_single_leaf_drains_to_empty() {
        let dir = TempDir::new().unwrap();
        let mut tree = open_tree(&dir);
        insert_all(&mut tree, &["a", "b", "c"]);

        for k in ["a", "b", "c"] {
            tree.remove(&Key::from(k)).unwrap();
            check::verify(&tree);
        }
        assert_eq!(tree.info().leaf_count, 1);
        let mut lo = Key::from("a");
        assert!(tree.range(&mut lo, &Key::from("z"), 10).unwrap().values.is_empty());
    }

    #[test]
    fn test_borrow_from_right_sibling() {
        let dir = TempDir::new().unwrap();
        let mut tree = open_tree(&dir);
        // Leaves [a b d] [e f g] under separator "e"
        insert_all(&mut tree, &["a", "b", "d", "e", "f", "g"]);
        assert_eq!(root_separators(&tree), vec![Key::from("e")]);

        tree.remove(&Key::from("b")).unwrap();
        tree.remove(&Key::from("d")).unwrap();
        check::verify(&tree);

        // Second removal underflowed [a]: it borrowed "e" from the right,
        // and the separator advanced to the lender's next key
        assert_eq!(
            leaf_keys(&tree),
            vec![
                vec![Key::from("a"), Key::from("e")],
                vec![Key::from("f"), Key::from("g")]
            ]
        );
        assert_eq!(root_separators(&tree), vec![Key::from("f")]);
    }

    #[test]
    fn test_borrow_from_left_sibling() {
        let dir = TempDir::new().unwrap();
        let mut tree = open_tree(&dir);
        // Leaves [01 02 03] [04 05 06] [07 08]
        insert_all(&mut tree, &["01", "02", "03", "04", "05", "06", "07", "08"]);
        assert_eq!(
            root_separators(&tree),
            vec![Key::from("04"), Key::from("07")]
        );

        tree.remove(&Key::from("08")).unwrap();
        check::verify(&tree);

        // [07] borrowed "06" from its left sibling; the separator bounding
        // the lender dropped to the moved key
        assert_eq!(
            leaf_keys(&tree),
            vec![
                vec![Key::from("01"), Key::from("02"), Key::from("03")],
                vec![Key::from("04"), Key::from("05")],
                vec![Key::from("06"), Key::from("07")]
            ]
        );
        assert_eq!(
            root_separators(&tree),
            vec![Key::from("04"), Key::from("06")]
        );
    }

    #[test]
    fn test_merge_with_right_sibling() {
        let dir = TempDir::new().unwrap();
        let mut tree = open_tree(&dir);
        // Leaves [01 02 03] [04 05] under separator "04"
        insert_all(&mut tree, &["01", "02", "03", "04", "05"]);

        tree.remove(&Key::from("02")).unwrap();
        // [01] underflows with no left sibling and a right sibling at
        // minimum: it absorbs the right leaf and the parent loses the
        // separator
        tree.remove(&Key::from("03")).unwrap();
        check::verify(&tree);

        assert_eq!(
            leaf_keys(&tree),
            vec![vec![Key::from("01"), Key::from("04"), Key::from("05")]]
        );
        assert_eq!(tree.info().leaf_count, 1);
        assert_eq!(tree.info().height, 1);
    }

    #[test]
    fn test_merge_into_left_sibling() {
        let dir = TempDir::new().unwrap();
        let mut tree = open_tree(&dir);
        // Leaves [01 02 03] [04 05] [06 07] after the first removal's
        // borrow from the left
        insert_all(&mut tree, &["01", "02", "03", "04", "05", "06", "07", "08"]);
        tree.remove(&Key::from("08")).unwrap();

        // The last child underflows with both borrows impossible: it folds
        // into its left sibling
        tree.remove(&Key::from("06")).unwrap();
        check::verify(&tree);

        assert_eq!(
            leaf_keys(&tree),
            vec![
                vec![Key::from("01"), Key::from("02"), Key::from("03")],
                vec![Key::from("04"), Key::from("05"), Key::from("07")]
            ]
        );
        assert_eq!(root_separators(&tree), vec![Key::from("04")]);
        assert_eq!(tree.info().leaf_count, 2);
    }

    #[test]
    fn test_root_collapse_restores_height() {
        let dir = TempDir::new().unwrap();
        let mut tree = open_tree(&dir);
        let keys: Vec<String> = (0..17u32).map(|i| format!("{:02}", i)).collect();
        for k in &keys {
            tree.insert(&Key::from(k.as_str()), &Value::from(k.as_str()))
                .unwrap();
        }
        assert!(tree.info().height >= 2);

        let mut last_height = tree.info().height;
        for k in &keys {
            tree.remove(&Key::from(k.as_str())).unwrap();
            check::verify(&tree);

            let height = tree.info().height;
            assert!(height == last_height || height + 1 == last_height);
            last_height = height;
        }

        let meta = tree.info();
        assert_eq!(meta.height, 1);
        assert_eq!(meta.node_count, 1);
        assert_eq!(meta.leaf_count, 1);
    }

    #[test]
    fn test_interleaved_churn() {
        let dir = TempDir::new().unwrap();
        let mut tree = open_tree(&dir);
        let keys: Vec<String> = (0..60u32).map(|i| format!("{:02}", i)).collect();

        // Insert everything in a strided order, remove every other key in a
        // different stride, then verify the survivors
        for i in 0..keys.len() {
            let k = &keys[(i * 13) % keys.len()];
            tree.insert(&Key::from(k.as_str()), &Value::from(k.as_str()))
                .unwrap();
            check::verify(&tree);
        }
        for i in 0..keys.len() {
            let idx = (i * 29) % keys.len();
            if idx % 2 == 0 {
                tree.remove(&Key::from(keys[idx].as_str())).unwrap();
                check::verify(&tree);
            }
        }

        for (i, k) in keys.iter().enumerate() {
            let result = tree.lookup(&Key::from(k.as_str()));
            if i % 2 == 0 {
                assert!(matches!(result, Err(TreeError::NotFound)), "key {}", k);
            } else {
                assert_eq!(result.unwrap(), Value::from(k.as_str()), "key {}", k);
            }
        }

        let mut lo = Key::from("00");
        let scan = tree.range(&mut lo, &Key::from("99"), 100).unwrap();
        assert_eq!(scan.values.len(), 30);
    }

    #[test]
    fn test_remove_after_reopen() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("tree.idx");
        {
            let mut tree = BPlusTree::with_order(&path, true, 4).unwrap();
            for i in 0..20u32 {
                let k = format!("{:02}", i);
                tree.insert(&Key::from(k.as_str()), &Value::from(k.as_str()))
                    .unwrap();
            }
        }

        let mut tree = BPlusTree::with_order(&path, false, 4).unwrap();
        for i in (0..20u32).step_by(3) {
            let k = format!("{:02}", i);
            tree.remove(&Key::from(k.as_str())).unwrap();
            check::verify(&tree);
        }
        assert!(matches!(
            tree.lookup(&Key::from("03")),
            Err(TreeError::NotFound)
        ));
        assert_eq!(tree.lookup(&Key::from("04")).unwrap(), Value::from("04"));
    }
}
