//! The file seam the engine requires of any backing storage
//!
//! Layer files, cache stores and the switch wrapper all speak this
//! capability set; adaptors implement it and wrap a child. The remote
//! blob source and the tar/compression codecs live behind the same
//! trait, outside this crate.

use std::fs::File;
use std::os::unix::fs::FileExt;

use crate::Result;

/// Positioned I/O on a sector-addressed backing file.
pub trait SectorFile: Send + Sync {
    /// Read up to `buf.len()` bytes at `offset`; short reads only at EOF.
    fn pread(&self, buf: &mut [u8], offset: u64) -> Result<usize>;

    /// Write all of `buf` at `offset`.
    fn pwrite(&self, buf: &[u8], offset: u64) -> Result<usize>;

    /// Current file length in bytes.
    fn flen(&self) -> Result<u64>;

    /// Truncate (or extend) to `len` bytes.
    fn ftruncate(&self, len: u64) -> Result<()>;

    /// Flush data and metadata to stable storage.
    fn fsync(&self) -> Result<()>;

    /// Flush data to stable storage.
    fn fdatasync(&self) -> Result<()> {
        self.fsync()
    }

    /// Advisory range sync; may degrade to `fdatasync`.
    fn sync_file_range(&self, _offset: u64, _nbytes: u64) -> Result<()> {
        self.fdatasync()
    }
}

impl SectorFile for File {
    fn pread(&self, buf: &mut [u8], offset: u64) -> Result<usize> {
        let mut done = 0;
        while done < buf.len() {
            let n = self.read_at(&mut buf[done..], offset + done as u64)?;
            if n == 0 {
                break; // EOF
            }
            done += n;
        }
        Ok(done)
    }

    fn pwrite(&self, buf: &[u8], offset: u64) -> Result<usize> {
        self.write_all_at(buf, offset)?;
        Ok(buf.len())
    }

    fn flen(&self) -> Result<u64> {
        Ok(self.metadata()?.len())
    }

    fn ftruncate(&self, len: u64) -> Result<()> {
        self.set_len(len)?;
        Ok(())
    }

    fn fsync(&self) -> Result<()> {
        self.sync_all()?;
        Ok(())
    }

    fn fdatasync(&self) -> Result<()> {
        self.sync_data()?;
        Ok(())
    }
}

impl<T: SectorFile + ?Sized> SectorFile for Box<T> {
    fn pread(&self, buf: &mut [u8], offset: u64) -> Result<usize> {
        (**self).pread(buf, offset)
    }

    fn pwrite(&self, buf: &[u8], offset: u64) -> Result<usize> {
        (**self).pwrite(buf, offset)
    }

    fn flen(&self) -> Result<u64> {
        (**self).flen()
    }

    fn ftruncate(&self, len: u64) -> Result<()> {
        (**self).ftruncate(len)
    }

    fn fsync(&self) -> Result<()> {
        (**self).fsync()
    }

    fn fdatasync(&self) -> Result<()> {
        (**self).fdatasync()
    }

    fn sync_file_range(&self, offset: u64, nbytes: u64) -> Result<()> {
        (**self).sync_file_range(offset, nbytes)
    }
}

impl<T: SectorFile + ?Sized> SectorFile for std::sync::Arc<T> {
    fn pread(&self, buf: &mut [u8], offset: u64) -> Result<usize> {
        (**self).pread(buf, offset)
    }

    fn pwrite(&self, buf: &[u8], offset: u64) -> Result<usize> {
        (**self).pwrite(buf, offset)
    }

    fn flen(&self) -> Result<u64> {
        (**self).flen()
    }

    fn ftruncate(&self, len: u64) -> Result<()> {
        (**self).ftruncate(len)
    }

    fn fsync(&self) -> Result<()> {
        (**self).fsync()
    }

    fn fdatasync(&self) -> Result<()> {
        (**self).fdatasync()
    }

    fn sync_file_range(&self, offset: u64, nbytes: u64) -> Result<()> {
        (**self).sync_file_range(offset, nbytes)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempfile;

    #[test]
    fn test_file_pread_pwrite() {
        let f = tempfile().unwrap();
        f.pwrite(b"hello world", 100).unwrap();
        let mut buf = [0u8; 11];
        let n = f.pread(&mut buf, 100).unwrap();
        assert_eq!(n, 11);
        assert_eq!(&buf, b"hello world");
    }

    #[test]
    fn test_file_pread_short_at_eof() {
        let f = tempfile().unwrap();
        f.pwrite(b"abc", 0).unwrap();
        let mut buf = [0u8; 8];
        let n = f.pread(&mut buf, 0).unwrap();
        assert_eq!(n, 3);
        let n = f.pread(&mut buf, 10).unwrap();
        assert_eq!(n, 0);
    }
}
