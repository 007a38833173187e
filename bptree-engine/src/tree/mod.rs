//! The B+ tree: descent, point and range reads, in-place update, and the
//! structural plumbing shared by the mutation paths
//!
//! Every inter-node link is a file offset; each traversal step re-reads the
//! block through the I/O layer (the cache keeps that cheap without breaking
//! write coherence). Insert lives in `insert`, remove in `remove`; both rely
//! on the sibling splice/unsplice and pointer-fixup helpers defined here.

mod insert;
mod remove;

#[cfg(test)]
pub(crate) mod check;

use std::path::Path;
use tracing::debug;

use crate::error::{TreeError, TreeResult};
use crate::storage::block::BlockFile;
use crate::storage::cache::CacheStats;
use crate::storage::key::{Key, Value};
use crate::storage::meta::{TreeMeta, DEFAULT_ORDER};
use crate::storage::node::{
    Block, BlockHeader, BlockKind, IndexEntry, Leaf, Node, HEADER_SIZE,
};

/// Result of a bounded range scan
#[derive(Debug, Clone)]
pub struct RangeScan {
    /// Values of the matched records, in key order
    pub values: Vec<Value>,
    /// True when the scan stopped at `max` with matching records left; the
    /// caller's `lo` has been advanced to the first unemitted key
    pub more: bool,
}

/// A disk-resident B+ tree index over one backing file
pub struct BPlusTree {
    file: BlockFile,
    meta: TreeMeta,
    meta_dirty: bool,
}

impl BPlusTree {
    /// Open a tree file at the reference order. With `force_empty` the file
    /// is truncated and reinitialized; otherwise the existing header is
    /// read, falling back to empty initialization when the read fails
    /// (missing or empty file).
    pub fn open(path: impl AsRef<Path>, force_empty: bool) -> TreeResult<Self> {
        Self::with_order(path, force_empty, DEFAULT_ORDER)
    }

    /// `open` with an explicit tree order. Block geometry derives from the
    /// order, so it is fixed at creation and validated against the header on
    /// every reopen.
    pub fn with_order(
        path: impl AsRef<Path>,
        force_empty: bool,
        order: u64,
    ) -> TreeResult<Self> {
        assert!(order >= 4, "tree order below minimum 4");

        let mut tree = BPlusTree {
            file: BlockFile::new(path.as_ref()),
            meta: TreeMeta::empty(order),
            meta_dirty: false,
        };

        if force_empty {
            tree.init_empty()?;
            return Ok(tree);
        }

        match tree.read_meta() {
            Ok(meta) => {
                meta.validate().map_err(TreeError::InvalidFormat)?;
                debug!(
                    "opened tree file {:?}: order {}, height {}, {} leaves",
                    tree.file.path(),
                    meta.order,
                    meta.height,
                    meta.leaf_count
                );
                tree.meta = meta;
            }
            Err(_) => tree.init_empty()?,
        }
        Ok(tree)
    }

    /// Metadata snapshot
    pub fn info(&self) -> TreeMeta {
        self.meta.clone()
    }

    /// Block cache counters
    pub fn cache_stats(&self) -> CacheStats {
        self.file.cache_stats()
    }

    /// Look up the value stored under `key`
    pub fn lookup(&self, key: &Key) -> TreeResult<Value> {
        let leaf: Leaf = self.read_at(self.search_leaf(key)?)?;
        let pos = leaf.lower_bound(key);
        match leaf.records.get(pos) {
            Some(record) if record.key == *key => Ok(record.value),
            _ => Err(TreeError::NotFound),
        }
    }

    /// Scan records with `lo <= key <= hi` in key order, up to `max` values.
    /// On truncation, `lo` is advanced to the first unemitted key so a
    /// follow-up call resumes the scan.
    pub fn range(&self, lo: &mut Key, hi: &Key, max: usize) -> TreeResult<RangeScan> {
        if *lo > *hi {
            return Err(TreeError::BadRange);
        }

        let mut values = Vec::new();
        let mut more = false;
        let mut offset = self.search_leaf(lo)?;

        'walk: while offset != 0 {
            let leaf: Leaf = self.read_at(offset)?;
            for record in &leaf.records[leaf.lower_bound(lo)..] {
                if record.key > *hi {
                    break 'walk;
                }
                if values.len() == max {
                    more = true;
                    *lo = record.key;
                    break 'walk;
                }
                values.push(record.value);
            }
            offset = leaf.header.next;
        }

        Ok(RangeScan { values, more })
    }

    /// Overwrite the value of an existing record in place
    pub fn update(&mut self, key: &Key, value: &Value) -> TreeResult<()> {
        let offset = self.search_leaf(key)?;
        let mut leaf: Leaf = self.read_at(offset)?;
        let pos = leaf.lower_bound(key);
        match leaf.records.get_mut(pos) {
            Some(record) => {
                if record.key != *key {
                    return Err(TreeError::KeyNotEqual);
                }
                record.value = *value;
                self.write_at(offset, &leaf)
            }
            None => Err(TreeError::NotFound),
        }
    }

    // ---- open / initialize ----------------------------------------------

    fn read_meta(&self) -> TreeResult<TreeMeta> {
        let buf = self.file.read_block(0, TreeMeta::SIZE)?;
        Ok(TreeMeta::from_bytes(&buf)?)
    }

    /// Truncate and write the smallest valid tree: metadata, one root node
    /// with a single child entry, one empty leaf
    fn init_empty(&mut self) -> TreeResult<()> {
        self.file.create().map_err(|e| match e {
            TreeError::Io(io) => TreeError::Open(io),
            other => other,
        })?;

        self.meta = TreeMeta::empty(self.meta.order);

        let mut root = Node::new();
        let root_offset = self.alloc_block::<Node>();
        let mut leaf = Leaf::new();
        let leaf_offset = self.alloc_block::<Leaf>();

        leaf.header.parent = root_offset;
        root.entries.push(IndexEntry {
            key: Key::EMPTY,
            child: leaf_offset,
        });
        self.meta.root_offset = root_offset;
        self.meta.first_leaf_offset = leaf_offset;

        self.write_meta()?;
        self.write_at(root_offset, &root)?;
        self.write_at(leaf_offset, &leaf)?;

        debug!(
            "initialized empty tree file {:?} at order {}",
            self.file.path(),
            self.meta.order
        );
        Ok(())
    }

    // ---- descent ---------------------------------------------------------

    /// Descend the internal levels to the node directly above the leaves
    fn search_index(&self, key: &Key) -> TreeResult<u64> {
        let mut offset = self.meta.root_offset;
        let mut height = self.meta.height;
        while height > 1 {
            let node: Node = self.read_at(offset)?;
            offset = node.entries[node.position_for(key)].child;
            height -= 1;
        }
        Ok(offset)
    }

    /// Final descent step: pick the leaf under a bottom-level node
    fn search_leaf_from(&self, index_offset: u64, key: &Key) -> TreeResult<u64> {
        let node: Node = self.read_at(index_offset)?;
        Ok(node.entries[node.position_for(key)].child)
    }

    fn search_leaf(&self, key: &Key) -> TreeResult<u64> {
        let index = self.search_index(key)?;
        self.search_leaf_from(index, key)
    }

    // ---- block I/O -------------------------------------------------------

    fn read_at<B: Block>(&self, offset: u64) -> TreeResult<B> {
        let buf = self.file.read_block(offset, B::disk_size(self.meta.order))?;
        Ok(B::from_bytes(&buf, self.meta.order)?)
    }

    fn write_at<B: Block>(&self, offset: u64, block: &B) -> TreeResult<()> {
        self.file.write_block(offset, &block.to_bytes(self.meta.order))
    }

    /// Read only the 32-byte frame; works for either block kind
    fn read_header(&self, offset: u64) -> TreeResult<BlockHeader> {
        let buf = self.file.read_block(offset, HEADER_SIZE)?;
        Ok(BlockHeader::from_bytes(&buf)?)
    }

    fn write_header(&self, offset: u64, header: &BlockHeader) -> TreeResult<()> {
        self.file.write_block(offset, &header.to_bytes())
    }

    /// Repoint a child block at a new parent without decoding its payload
    fn rewrite_parent(&self, offset: u64, parent: u64) -> TreeResult<()> {
        let mut header = self.read_header(offset)?;
        header.parent = parent;
        self.write_header(offset, &header)
    }

    /// Repoint a sibling's back link without decoding its payload
    fn rewrite_prev(&self, offset: u64, prev: u64) -> TreeResult<()> {
        let mut header = self.read_header(offset)?;
        header.prev = prev;
        self.write_header(offset, &header)
    }

    // ---- allocation ------------------------------------------------------

    /// Bump allocation: returns the watermark and advances it. The metadata
    /// is dirty until the caller persists it.
    fn alloc(&mut self, size: usize) -> u64 {
        let offset = self.meta.watermark;
        self.meta.watermark += size as u64;
        self.meta_dirty = true;
        offset
    }

    fn alloc_block<B: Block>(&mut self) -> u64 {
        match B::KIND {
            BlockKind::Node => self.meta.node_count += 1,
            BlockKind::Leaf => self.meta.leaf_count += 1,
        }
        self.alloc(B::disk_size(self.meta.order))
    }

    /// Accounting-only deallocation; the block itself is abandoned in place
    fn unalloc_block<B: Block>(&mut self) {
        match B::KIND {
            BlockKind::Node => self.meta.node_count -= 1,
            BlockKind::Leaf => self.meta.leaf_count -= 1,
        }
        self.meta_dirty = true;
    }

    fn write_meta(&mut self) -> TreeResult<()> {
        self.file.write_block(0, &self.meta.to_bytes())?;
        self.meta_dirty = false;
        Ok(())
    }

    /// Minimum fill for any non-root block while more than one of its kind
    /// exists
    fn min_fill(&self) -> usize {
        (self.meta.order as usize).div_ceil(2)
    }

    // ---- sibling chains --------------------------------------------------

    /// Allocate `fresh` as `block`'s new right sibling and splice it into
    /// the chain at this depth. Returns the new block's offset; neither
    /// block is written here, but a displaced right neighbor's back link is
    /// fixed on disk and the metadata (new watermark, counts) is persisted.
    fn link_new_sibling<B: Block>(
        &mut self,
        offset: u64,
        block: &mut B,
        fresh: &mut B,
    ) -> TreeResult<u64> {
        fresh.header_mut().parent = block.header().parent;
        fresh.header_mut().next = block.header().next;
        fresh.header_mut().prev = offset;
        let new_offset = self.alloc_block::<B>();
        block.header_mut().next = new_offset;

        if fresh.header().next != 0 {
            self.rewrite_prev(fresh.header().next, new_offset)?;
        }
        self.write_meta()?;
        Ok(new_offset)
    }

    /// Unsplice `right` (merged into `left`) from the chain at this depth
    /// and drop it from the accounting
    fn unlink_sibling<B: Block>(&mut self, left: &mut B, right: &B) -> TreeResult<()> {
        self.unalloc_block::<B>();
        left.header_mut().next = right.header().next;
        if right.header().next != 0 {
            self.rewrite_prev(right.header().next, right.header().prev)?;
        }
        self.write_meta()
    }

    /// Rewrite the separator that bounds a child whose first key was `old`
    /// to `new`. When the updated slot is the node's last entry the real
    /// bound lives at a higher level, so the fixup walks up.
    fn update_parent_key(&mut self, node_offset: u64, old: &Key, new: &Key) -> TreeResult<()> {
        assert_ne!(node_offset, 0, "separator fixup walked past the root");
        let mut node: Node = self.read_at(node_offset)?;
        let pos = node.find(old);
        node.entries[pos].key = *new;
        self.write_at(node_offset, &node)?;

        if pos == node.len() - 1 {
            self.update_parent_key(node.header.parent, old, new)
        } else {
            Ok(())
        }
    }
}

impl Drop for BPlusTree {
    fn drop(&mut self) {
        if self.meta_dirty {
            let _ = self.write_meta();
        }
    }
}
