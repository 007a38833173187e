//! Block framing and the two block kinds (internal node, leaf)
//!
//! Both kinds share a 32-byte frame followed by an array of exactly `order`
//! entries, zero-padded past `count`:
//! - bytes  0..8:  parent offset (u64 LE, 0 = none)
//! - bytes  8..16: prev sibling offset (u64 LE, 0 = none)
//! - bytes 16..24: next sibling offset (u64 LE, 0 = none)
//! - bytes 24..32: entry count (u64 LE)
//!
//! Internal entries are (key, child offset) pairs; leaf entries are
//! (key, value) records sorted ascending. An internal node with `count`
//! children uses entries `[0..count]`, and the key of entry `count-1` is
//! undefined: the last child has no right separator at this level. Binary
//! searches run over `[0..count-1)` only, and trailing padding past `count`
//! is never read back.
//!
//! The block kind is not self-describing; it is determined by depth relative
//! to the tree height during descent.

use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use std::io::{self, Cursor, Read};

use super::key::{Key, Value, KEY_SIZE, VALUE_SIZE};

/// Size of the common block frame in bytes
pub const HEADER_SIZE: usize = 32;

/// Size of one internal-node entry: key + child offset
pub const INDEX_ENTRY_SIZE: usize = KEY_SIZE + 8;

/// Size of one leaf record: key + value
pub const RECORD_SIZE: usize = KEY_SIZE + VALUE_SIZE;

/// Common frame shared by both block kinds
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BlockHeader {
    /// Offset of the parent node, 0 for the root
    pub parent: u64,
    /// Previous sibling at the same depth, 0 at the chain head
    pub prev: u64,
    /// Next sibling at the same depth, 0 at the chain tail
    pub next: u64,
    /// Number of live entries
    pub count: u64,
}

impl BlockHeader {
    /// Parse a frame from the first `HEADER_SIZE` bytes
    pub fn from_bytes(data: &[u8]) -> io::Result<Self> {
        if data.len() < HEADER_SIZE {
            return Err(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                "block header too short",
            ));
        }
        let mut cursor = Cursor::new(data);
        Ok(BlockHeader {
            parent: cursor.read_u64::<LittleEndian>()?,
            prev: cursor.read_u64::<LittleEndian>()?,
            next: cursor.read_u64::<LittleEndian>()?,
            count: cursor.read_u64::<LittleEndian>()?,
        })
    }

    /// Serialize the frame
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(HEADER_SIZE);
        buf.write_u64::<LittleEndian>(self.parent).unwrap();
        buf.write_u64::<LittleEndian>(self.prev).unwrap();
        buf.write_u64::<LittleEndian>(self.next).unwrap();
        buf.write_u64::<LittleEndian>(self.count).unwrap();
        buf
    }
}

/// Entry in an internal node: separator key and child offset
#[derive(Debug, Clone, Copy)]
pub struct IndexEntry {
    /// Strict upper bound on keys in `child`'s subtree; undefined in the
    /// node's last entry
    pub key: Key,
    /// Offset of the child block
    pub child: u64,
}

/// Record in a leaf: key and opaque value
#[derive(Debug, Clone, Copy)]
pub struct Record {
    pub key: Key,
    pub value: Value,
}

/// Which of the two block kinds a block is
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlockKind {
    Node,
    Leaf,
}

/// Seam over the two block kinds: identical framing, different payloads.
/// Lets splice/unsplice and allocation code run on either kind.
pub trait Block: Sized {
    const KIND: BlockKind;

    /// On-disk size of a block of this kind at the given order
    fn disk_size(order: u64) -> usize;

    fn header(&self) -> &BlockHeader;
    fn header_mut(&mut self) -> &mut BlockHeader;

    /// Decode from a full block buffer
    fn from_bytes(data: &[u8], order: u64) -> io::Result<Self>;

    /// Encode to a full zero-padded block buffer
    fn to_bytes(&self, order: u64) -> Vec<u8>;
}

/// Internal node: routes descents through separator keys
#[derive(Debug, Clone)]
pub struct Node {
    pub header: BlockHeader,
    pub entries: Vec<IndexEntry>,
}

impl Node {
    /// Fresh unlinked node with no entries
    pub fn new() -> Self {
        Node {
            header: BlockHeader::default(),
            entries: Vec::new(),
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Index of the child to descend into for `key`: the first entry whose
    /// key is strictly greater than `key`, searching `[0..count-1)` only.
    /// Falls through to the last entry when no separator exceeds `key`.
    pub fn position_for(&self, key: &Key) -> usize {
        if self.entries.len() <= 1 {
            return 0;
        }
        let separators = &self.entries[..self.entries.len() - 1];
        separators.partition_point(|e| e.key <= *key)
    }

    /// `position_for` with the empty-key sentinel: an empty query descends
    /// into the penultimate entry (the greatest-keys subtree)
    pub fn find(&self, key: &Key) -> usize {
        if !key.is_empty() {
            return self.position_for(key);
        }
        if self.entries.len() > 1 {
            self.entries.len() - 2
        } else {
            0
        }
    }

    /// Scan for the entry pointing at `child`; the caller knows the child is
    /// under this node
    pub fn position_of_child(&self, child: u64) -> usize {
        self.entries
            .iter()
            .position(|e| e.child == child)
            .expect("child offset not present in parent node")
    }

    /// Insert a separator without splitting: the new entry takes `key` and
    /// the displaced entry's child; the displaced entry's child becomes
    /// `right`. Preserves the keys-in-`[0..count-1)` / children-in-
    /// `[0..count]` layout.
    pub fn insert_entry(&mut self, key: &Key, right: u64) {
        let pos = self.position_for(key);
        let left = self.entries[pos].child;
        self.entries.insert(pos, IndexEntry { key: *key, child: left });
        self.entries[pos + 1].child = right;
    }
}

impl Block for Node {
    const KIND: BlockKind = BlockKind::Node;

    fn disk_size(order: u64) -> usize {
        HEADER_SIZE + order as usize * INDEX_ENTRY_SIZE
    }

    fn header(&self) -> &BlockHeader {
        &self.header
    }

    fn header_mut(&mut self) -> &mut BlockHeader {
        &mut self.header
    }

    fn from_bytes(data: &[u8], order: u64) -> io::Result<Self> {
        let header = BlockHeader::from_bytes(data)?;
        if header.count > order {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                "node entry count exceeds tree order",
            ));
        }
        let mut cursor = Cursor::new(&data[HEADER_SIZE..]);
        let mut entries = Vec::with_capacity(header.count as usize);
        for _ in 0..header.count {
            let mut raw = [0u8; KEY_SIZE];
            cursor.read_exact(&mut raw)?;
            let child = cursor.read_u64::<LittleEndian>()?;
            entries.push(IndexEntry {
                key: Key::from_raw(raw),
                child,
            });
        }
        Ok(Node { header, entries })
    }

    fn to_bytes(&self, order: u64) -> Vec<u8> {
        let mut header = self.header;
        header.count = self.entries.len() as u64;
        let mut buf = Vec::with_capacity(Self::disk_size(order));
        buf.extend_from_slice(&header.to_bytes());
        for entry in &self.entries {
            buf.extend_from_slice(entry.key.as_bytes());
            buf.write_u64::<LittleEndian>(entry.child).unwrap();
        }
        buf.resize(Self::disk_size(order), 0);
        buf
    }
}

/// Leaf: holds the records and threads the key-ordered sibling list
#[derive(Debug, Clone)]
pub struct Leaf {
    pub header: BlockHeader,
    pub records: Vec<Record>,
}

impl Leaf {
    /// Fresh unlinked leaf with no records
    pub fn new() -> Self {
        Leaf {
            header: BlockHeader::default(),
            records: Vec::new(),
        }
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    /// Index of the first record with key >= `key`
    pub fn lower_bound(&self, key: &Key) -> usize {
        self.records.partition_point(|r| r.key < *key)
    }

    /// True iff a record with exactly this key is present
    pub fn contains(&self, key: &Key) -> bool {
        let pos = self.lower_bound(key);
        pos < self.records.len() && self.records[pos].key == *key
    }

    /// Insert a record at its upper-bound position, keeping records sorted
    pub fn insert_record(&mut self, key: &Key, value: &Value) {
        let pos = self.records.partition_point(|r| r.key <= *key);
        self.records.insert(
            pos,
            Record {
                key: *key,
                value: *value,
            },
        );
    }
}

impl Block for Leaf {
    const KIND: BlockKind = BlockKind::Leaf;

    fn disk_size(order: u64) -> usize {
        HEADER_SIZE + order as usize * RECORD_SIZE
    }

    fn header(&self) -> &BlockHeader {
        &self.header
    }

    fn header_mut(&mut self) -> &mut BlockHeader {
        &mut self.header
    }

    fn from_bytes(data: &[u8], order: u64) -> io::Result<Self> {
        let header = BlockHeader::from_bytes(data)?;
        if header.count > order {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                "leaf record count exceeds tree order",
            ));
        }
        let mut cursor = Cursor::new(&data[HEADER_SIZE..]);
        let mut records = Vec::with_capacity(header.count as usize);
        for _ in 0..header.count {
            let mut key_raw = [0u8; KEY_SIZE];
            cursor.read_exact(&mut key_raw)?;
            let mut value_raw = [0u8; VALUE_SIZE];
            cursor.read_exact(&mut value_raw)?;
            records.push(Record {
                key: Key::from_raw(key_raw),
                value: Value::from_raw(value_raw),
            });
        }
        Ok(Leaf { header, records })
    }

    fn to_bytes(&self, order: u64) -> Vec<u8> {
        let mut header = self.header;
        header.count = self.records.len() as u64;
        let mut buf = Vec::with_capacity(Self::disk_size(order));
        buf.extend_from_slice(&header.to_bytes());
        for record in &self.records {
            buf.extend_from_slice(record.key.as_bytes());
            buf.extend_from_slice(record.value.as_bytes());
        }
        buf.resize(Self::disk_size(order), 0);
        buf
    }
}
