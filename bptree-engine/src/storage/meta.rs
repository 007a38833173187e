//! Metadata header - stored at file offset 0
//!
//! All fields are u64 little-endian so files are portable across platforms.
//! Layout (72 bytes, field order is part of the format):
//! - bytes  0..8:  order (max children per node)
//! - bytes  8..16: value_size
//! - bytes 16..24: key_size
//! - bytes 24..32: node_count (internal nodes)
//! - bytes 32..40: leaf_count
//! - bytes 40..48: height (internal levels only; a single leaf under one
//!                 root node is height 1)
//! - bytes 48..56: watermark (next free offset)
//! - bytes 56..64: root_offset
//! - bytes 64..72: first_leaf_offset

use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use std::io::{self, Cursor};

use super::key::{KEY_SIZE, VALUE_SIZE};

/// Default tree order (max children per node)
pub const DEFAULT_ORDER: u64 = 20;

/// Metadata header for a tree file
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TreeMeta {
    /// Tree order: a node is full at `order` children and under-full below
    /// `order.div_ceil(2)`
    pub order: u64,
    /// Value width in bytes
    pub value_size: u64,
    /// Key width in bytes
    pub key_size: u64,
    /// Number of live internal nodes
    pub node_count: u64,
    /// Number of live leaves
    pub leaf_count: u64,
    /// Tree height, leaves not counted
    pub height: u64,
    /// Next free file offset; bumped on every allocation, never reclaimed
    pub watermark: u64,
    /// Offset of the root internal node
    pub root_offset: u64,
    /// Offset of the leftmost leaf
    pub first_leaf_offset: u64,
}

impl TreeMeta {
    /// Serialized size of the header in bytes
    pub const SIZE: usize = 72;

    /// Fresh header for an empty tree; block offsets are filled in by the
    /// initialization path once the root and first leaf are allocated
    pub fn empty(order: u64) -> Self {
        TreeMeta {
            order,
            value_size: VALUE_SIZE as u64,
            key_size: KEY_SIZE as u64,
            node_count: 0,
            leaf_count: 0,
            height: 1,
            watermark: Self::SIZE as u64,
            root_offset: 0,
            first_leaf_offset: 0,
        }
    }

    /// Parse the header from bytes
    pub fn from_bytes(data: &[u8]) -> io::Result<Self> {
        if data.len() < Self::SIZE {
            return Err(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                "metadata header too short",
            ));
        }

        let mut cursor = Cursor::new(data);
        Ok(TreeMeta {
            order: cursor.read_u64::<LittleEndian>()?,
            value_size: cursor.read_u64::<LittleEndian>()?,
            key_size: cursor.read_u64::<LittleEndian>()?,
            node_count: cursor.read_u64::<LittleEndian>()?,
            leaf_count: cursor.read_u64::<LittleEndian>()?,
            height: cursor.read_u64::<LittleEndian>()?,
            watermark: cursor.read_u64::<LittleEndian>()?,
            root_offset: cursor.read_u64::<LittleEndian>()?,
            first_leaf_offset: cursor.read_u64::<LittleEndian>()?,
        })
    }

    /// Serialize the header
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(Self::SIZE);
        buf.write_u64::<LittleEndian>(self.order).unwrap();
        buf.write_u64::<LittleEndian>(self.value_size).unwrap();
        buf.write_u64::<LittleEndian>(self.key_size).unwrap();
        buf.write_u64::<LittleEndian>(self.node_count).unwrap();
        buf.write_u64::<LittleEndian>(self.leaf_count).unwrap();
        buf.write_u64::<LittleEndian>(self.height).unwrap();
        buf.write_u64::<LittleEndian>(self.watermark).unwrap();
        buf.write_u64::<LittleEndian>(self.root_offset).unwrap();
        buf.write_u64::<LittleEndian>(self.first_leaf_offset).unwrap();
        buf
    }

    /// Reject headers whose geometry this build cannot read
    pub fn validate(&self) -> Result<(), String> {
        if self.key_size != KEY_SIZE as u64 {
            return Err(format!(
                "key size {} does not match compiled size {}",
                self.key_size, KEY_SIZE
            ));
        }
        if self.value_size != VALUE_SIZE as u64 {
            return Err(format!(
                "value size {} does not match compiled size {}",
                self.value_size, VALUE_SIZE
            ));
        }
        if self.order < 4 {
            return Err(format!("tree order {} below minimum 4", self.order));
        }
        Ok(())
    }
}
