//! A cache store: one open cached blob file bound to its pool entry

use std::fs::File;
use std::sync::Arc;

use parking_lot::RwLock;

use super::pool::PoolInner;
use crate::vfile::SectorFile;
use crate::{Result, StrataError};

/// Handle on one cached file. Reads and refill writes take the entry's
/// read lock, so eviction's truncation (the writer) never races a
/// refill on the same file. Dropping the store decrements the pool's
/// open count; the entry itself stays.
pub struct CacheStore {
    pool: Arc<PoolInner>,
    file: File,
    key: String,
    lock: Arc<RwLock<()>>,
}

impl CacheStore {
    pub(crate) fn new(
        pool: Arc<PoolInner>,
        file: File,
        key: String,
        lock: Arc<RwLock<()>>,
    ) -> Self {
        Self {
            pool,
            file,
            key,
            lock,
        }
    }

    /// The cache key (the blob's basename)
    pub fn key(&self) -> &str {
        &self.key
    }
}

impl SectorFile for CacheStore {
    fn pread(&self, buf: &mut [u8], offset: u64) -> Result<usize> {
        let n = {
            let _r = self.lock.read();
            self.file.pread(buf, offset)?
        };
        self.pool.touch(&self.key);
        Ok(n)
    }

    /// The refill path: after the write lands, account the new file
    /// size with the pool. Crossing the risk mark runs a synchronous
    /// eviction pass on this thread, which is why the entry lock must
    /// be released first. A pool still over capacity after that pass
    /// rejects the refill.
    fn pwrite(&self, buf: &[u8], offset: u64) -> Result<usize> {
        let n = {
            let _r = self.lock.read();
            self.file.pwrite(buf, offset)?
        };
        let size = self.file.flen()?;
        self.pool.update_space(&self.key, size);
        if self.pool.is_exhausted() {
            return Err(StrataError::Exhausted(format!(
                "cache still over capacity after forced eviction (refilling {})",
                self.key
            )));
        }
        Ok(n)
    }

    fn flen(&self) -> Result<u64> {
        self.file.flen()
    }

    fn ftruncate(&self, len: u64) -> Result<()> {
        let _r = self.lock.read();
        self.file.ftruncate(len)
    }

    fn fsync(&self) -> Result<()> {
        self.file.fsync()
    }

    fn fdatasync(&self) -> Result<()> {
        self.file.fdatasync()
    }
}

impl Drop for CacheStore {
    fn drop(&mut self) {
        self.pool.release_store(&self.key);
    }
}
