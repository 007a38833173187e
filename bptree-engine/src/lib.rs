//! Disk-resident B+ tree index engine
//!
//! An ordered mapping from fixed-size keys to fixed-size values, persisted
//! as a single file of fixed-width blocks. Point lookup, bounded range scan,
//! insertion, deletion, and in-place update, with the tree's structural
//! invariants (balance, key ordering, sibling chains, height) maintained
//! across every mutation and across process restarts.

pub mod error;
pub mod storage;
pub mod tree;

pub use error::{TreeError, TreeResult};
pub use storage::{CacheStats, Key, TreeMeta, Value, DEFAULT_ORDER, KEY_SIZE, VALUE_SIZE};
pub use tree::{BPlusTree, RangeScan};
