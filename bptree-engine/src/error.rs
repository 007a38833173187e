//! Error taxonomy for the B+ tree engine
//!
//! Logical outcomes (`NotFound`, `DuplicateKey`, ...) are discriminated
//! variants so callers can branch on them; I/O failures carry the underlying
//! error. Structural invariant violations are programmer errors and abort via
//! `assert!`, they never surface here.

use thiserror::Error;

/// Main error type for the B+ tree engine
#[derive(Error, Debug)]
pub enum TreeError {
    /// Underlying read/write/seek failed; on-disk state may be partial
    #[error("i/o failure: {0}")]
    Io(#[from] std::io::Error),

    /// Path could not be opened and `force_empty` was false
    #[error("cannot open index file")]
    Open(#[source] std::io::Error),

    /// Header read succeeded but the file geometry is incompatible
    #[error("invalid file format: {0}")]
    InvalidFormat(String),

    /// Key absent at a lookup/remove/update descent endpoint
    #[error("key not found")]
    NotFound,

    /// Insert into a leaf that already contains an equal key
    #[error("duplicate key")]
    DuplicateKey,

    /// Update descended to a slot whose key differs from the query
    #[error("key does not match")]
    KeyNotEqual,

    /// Range scan with lower bound above the upper bound
    #[error("invalid range bounds")]
    BadRange,
}

/// Result type for tree operations
pub type TreeResult<T> = Result<T, TreeError>;
