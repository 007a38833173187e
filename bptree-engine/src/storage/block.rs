//! Positional block I/O on the single backing file
//!
//! Offsets are absolute byte positions. The file handle is reentrancy
//! counted: it opens on the first retain and closes when the last holder
//! releases, so nested acquisitions share one handle. No OS lock is
//! asserted; single-writer single-reader access is a precondition.
//!
//! All reads and writes go through the block cache write-through, so a read
//! after a write always observes the written bytes.

use parking_lot::Mutex;
use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use super::cache::{BlockCache, CacheStats};
use crate::error::TreeResult;

struct HandleState {
    file: Option<File>,
    depth: u32,
}

/// A single tree file addressed by absolute block offsets
pub struct BlockFile {
    path: PathBuf,
    state: Mutex<HandleState>,
    cache: BlockCache,
}

/// Releases one level of the reentrant handle on drop; the handle closes
/// when the last guard goes away
pub struct FileGuard<'a> {
    owner: &'a BlockFile,
}

impl Drop for FileGuard<'_> {
    fn drop(&mut self) {
        let mut state = self.owner.state.lock();
        state.depth -= 1;
        if state.depth == 0 {
            state.file = None;
        }
    }
}

impl BlockFile {
    pub fn new(path: &Path) -> Self {
        BlockFile {
            path: path.to_path_buf(),
            state: Mutex::new(HandleState {
                file: None,
                depth: 0,
            }),
            cache: BlockCache::default(),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Acquire the shared handle, opening the file read-write if this is the
    /// outermost acquisition
    pub fn retain(&self) -> TreeResult<FileGuard<'_>> {
        let mut state = self.state.lock();
        if state.depth == 0 {
            state.file = Some(
                OpenOptions::new()
                    .read(true)
                    .write(true)
                    .open(&self.path)?,
            );
        }
        state.depth += 1;
        Ok(FileGuard { owner: self })
    }

    /// Acquire the shared handle, creating or truncating the file. Only
    /// valid as the outermost acquisition.
    pub fn create(&self) -> TreeResult<FileGuard<'_>> {
        let mut state = self.state.lock();
        assert_eq!(state.depth, 0, "cannot truncate a retained file");
        state.file = Some(
            OpenOptions::new()
                .read(true)
                .write(true)
                .create(true)
                .truncate(true)
                .open(&self.path)?,
        );
        state.depth += 1;
        Ok(FileGuard { owner: self })
    }

    /// Positional read of exactly `len` bytes; a short read is an I/O
    /// failure
    pub fn read_block(&self, offset: u64, len: usize) -> TreeResult<Vec<u8>> {
        if let Some(cached) = self.cache.get(offset, len) {
            return Ok(cached);
        }
        let _guard = self.retain()?;
        let mut buf = vec![0u8; len];
        {
            let mut state = self.state.lock();
            let file = state.file.as_mut().expect("file handle retained");
            file.seek(SeekFrom::Start(offset))?;
            file.read_exact(&mut buf)?;
        }
        self.cache.put(offset, &buf);
        Ok(buf)
    }

    /// Positional write; no flush contract beyond OS semantics
    pub fn write_block(&self, offset: u64, data: &[u8]) -> TreeResult<()> {
        let _guard = self.retain()?;
        {
            let mut state = self.state.lock();
            let file = state.file.as_mut().expect("file handle retained");
            file.seek(SeekFrom::Start(offset))?;
            file.write_all(data)?;
        }
        self.cache.put(offset, data);
        Ok(())
    }

    pub fn cache_stats(&self) -> CacheStats {
        self.cache.stats()
    }

    #[cfg(test)]
    pub(crate) fn handle_depth(&self) -> u32 {
        self.state.lock().depth
    }
}
