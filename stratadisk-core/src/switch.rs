//! Hot-swappable read source
//!
//! Wraps a file whose backing can be replaced at runtime: an image
//! layer starts out streaming from the remote blob source and is
//! swapped to a fully downloaded local copy without interrupting I/O.
//!
//! Three states: S0 normal (forward I/O), S1 switch-requested, S2
//! switching. Every operation passes a gate that counts in-flight I/O
//! on S0, parks on S2, and on S1 performs the swap: drain in-flight to
//! zero, open the new source, install it, keep the old one for
//! disposal. A failed swap leaves the old source current.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU32, AtomicU8, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tracing::{error, info};

use crate::vfile::SectorFile;
use crate::Result;

/// Opens a nominated local path as a read source. The tar and
/// compression codecs live behind this callback, outside the core.
pub type SourceOpener = Box<dyn Fn(&Path) -> Result<Box<dyn SectorFile>> + Send + Sync>;

const STATE_NORMAL: u8 = 0;
const STATE_REQUESTED: u8 = 1;
const STATE_SWITCHING: u8 = 2;

/// Pause while parking on an in-progress swap
const GATE_POLL: Duration = Duration::from_millis(1);

/// Local reads slower than this are audit-logged
const AUDIT_THRESHOLD: Duration = Duration::from_millis(10);

/// A read source that can be swapped to a local file while I/O keeps
/// flowing.
pub struct SwitchFile {
    state: AtomicU8,
    io_count: AtomicU32,
    current: Mutex<Arc<dyn SectorFile>>,
    /// Previous source parked after a swap, dropped with the wrapper
    old: Mutex<Option<Arc<dyn SectorFile>>>,
    pending_path: Mutex<Option<PathBuf>>,
    local: AtomicU8,
    opener: SourceOpener,
}

impl SwitchFile {
    /// Wrap an already-open source. `local` marks a source that is a
    /// local file from the start (its slow reads are audit-logged).
    pub fn new(source: Box<dyn SectorFile>, local: bool, opener: SourceOpener) -> Self {
        Self {
            state: AtomicU8::new(STATE_NORMAL),
            io_count: AtomicU32::new(0),
            current: Mutex::new(Arc::from(source)),
            old: Mutex::new(None),
            pending_path: Mutex::new(None),
            local: AtomicU8::new(local as u8),
            opener,
        }
    }

    /// Nominate a local path to swap to. The swap itself happens on the
    /// next operation's gate.
    pub fn set_switch_file(&self, path: impl Into<PathBuf>) {
        *self.pending_path.lock() = Some(path.into());
        self.state.store(STATE_REQUESTED, Ordering::Release);
    }

    /// Whether the current source is a local file
    pub fn is_local(&self) -> bool {
        self.local.load(Ordering::Relaxed) != 0
    }

    /// Take the source parked by the last swap so the host can dispose
    /// of it (close a remote stream, release a cache store).
    pub fn take_parked(&self) -> Option<Arc<dyn SectorFile>> {
        self.old.lock().take()
    }

    /// The gate every operation passes: returns the source to use with
    /// the in-flight count held.
    fn enter(&self) -> IoGuard<'_> {
        loop {
            match self.state.load(Ordering::Acquire) {
                STATE_NORMAL => {
                    self.io_count.fetch_add(1, Ordering::AcqRel);
                    let file = self.current.lock().clone();
                    return IoGuard { owner: self, file };
                }
                STATE_SWITCHING => {
                    thread::sleep(GATE_POLL);
                }
                _ => {
                    // STATE_REQUESTED: exactly one caller performs the swap
                    if self
                        .state
                        .compare_exchange(
                            STATE_REQUESTED,
                            STATE_SWITCHING,
                            Ordering::AcqRel,
                            Ordering::Acquire,
                        )
                        .is_ok()
                    {
                        while self.io_count.load(Ordering::Acquire) > 0 {
                            thread::sleep(GATE_POLL);
                        }
                        if let Err(e) = self.do_switch() {
                            error!("switch failed, keeping current source: {}", e);
                        }
                        self.state.store(STATE_NORMAL, Ordering::Release);
                    }
                }
            }
        }
    }

    fn do_switch(&self) -> Result<()> {
        let path = self
            .pending_path
            .lock()
            .take()
            .expect("switch requested without a path");
        let file = (self.opener)(&path)?;
        info!("switched to local file {:?}", path);

        let mut current = self.current.lock();
        let previous = std::mem::replace(&mut *current, Arc::from(file));
        *self.old.lock() = Some(previous);
        self.local.store(1, Ordering::Relaxed);
        Ok(())
    }
}

struct IoGuard<'a> {
    owner: &'a SwitchFile,
    file: Arc<dyn SectorFile>,
}

impl Drop for IoGuard<'_> {
    fn drop(&mut self) {
        self.owner.io_count.fetch_sub(1, Ordering::AcqRel);
    }
}

impl SectorFile for SwitchFile {
    fn pread(&self, buf: &mut [u8], offset: u64) -> Result<usize> {
        let guard = self.enter();
        if self.is_local() {
            let begin = Instant::now();
            let n = guard.file.pread(buf, offset)?;
            let elapsed = begin.elapsed();
            if elapsed >= AUDIT_THRESHOLD {
                tracing::warn!(
                    target: "audit",
                    "slow local pread: offset {} length {} took {:?}",
                    offset,
                    buf.len(),
                    elapsed
                );
            }
            Ok(n)
        } else {
            guard.file.pread(buf, offset)
        }
    }

    fn pwrite(&self, buf: &[u8], offset: u64) -> Result<usize> {
        let guard = self.enter();
        guard.file.pwrite(buf, offset)
    }

    fn flen(&self) -> Result<u64> {
        let guard = self.enter();
        guard.file.flen()
    }

    fn ftruncate(&self, len: u64) -> Result<()> {
        let guard = self.enter();
        guard.file.ftruncate(len)
    }

    fn fsync(&self) -> Result<()> {
        let guard = self.enter();
        guard.file.fsync()
    }

    fn fdatasync(&self) -> Result<()> {
        let guard = self.enter();
        guard.file.fdatasync()
    }

    fn sync_file_range(&self, offset: u64, nbytes: u64) -> Result<()> {
        let guard = self.enter();
        guard.file.sync_file_range(offset, nbytes)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn file_with(dir: &TempDir, name: &str, content: &[u8]) -> Box<dyn SectorFile> {
        let path = dir.path().join(name);
        std::fs::write(&path, content).unwrap();
        Box::new(std::fs::File::open(path).unwrap())
    }

    fn plain_opener() -> SourceOpener {
        Box::new(|path| {
            let f = std::fs::File::open(path)?;
            Ok(Box::new(f) as Box<dyn SectorFile>)
        })
    }

    #[test]
    fn test_forwards_until_switched() {
        let dir = TempDir::new().unwrap();
        let sf = SwitchFile::new(file_with(&dir, "remote", b"remote-bytes"), false, plain_opener());

        let mut buf = vec![0u8; 12];
        sf.pread(&mut buf, 0).unwrap();
        assert_eq!(&buf, b"remote-bytes");
        assert!(!sf.is_local());
    }

    #[test]
    fn test_switch_swaps_source() {
        let dir = TempDir::new().unwrap();
        let sf = SwitchFile::new(file_with(&dir, "remote", b"old old old!"), false, plain_opener());

        std::fs::write(dir.path().join("local"), b"new new new!").unwrap();
        sf.set_switch_file(dir.path().join("local"));

        let mut buf = vec![0u8; 12];
        sf.pread(&mut buf, 0).unwrap();
        assert_eq!(&buf, b"new new new!");
        assert!(sf.is_local());

        // the previous source is parked for disposal
        assert!(sf.take_parked().is_some());
        assert!(sf.take_parked().is_none());
    }

    #[test]
    fn test_failed_switch_keeps_current() {
        let dir = TempDir::new().unwrap();
        let sf = SwitchFile::new(file_with(&dir, "remote", b"still here!!"), false, plain_opener());

        sf.set_switch_file(dir.path().join("does-not-exist"));

        let mut buf = vec![0u8; 12];
        sf.pread(&mut buf, 0).unwrap();
        assert_eq!(&buf, b"still here!!");
        assert!(!sf.is_local());

        // the gate recovered to normal: further I/O flows
        let mut buf = vec![0u8; 5];
        sf.pread(&mut buf, 0).unwrap();
        assert_eq!(&buf, b"still");
    }

    #[test]
    fn test_concurrent_readers_across_switch() {
        let dir = TempDir::new().unwrap();
        let content = vec![0x5au8; 1 << 16];
        let sf = Arc::new(SwitchFile::new(
            file_with(&dir, "remote", &content),
            false,
            plain_opener(),
        ));
        std::fs::write(dir.path().join("local"), &content).unwrap();

        let mut handles = Vec::new();
        for _ in 0..4 {
            let sf = sf.clone();
            handles.push(thread::spawn(move || {
                for i in 0..200u64 {
                    let mut buf = vec![0u8; 256];
                    sf.pread(&mut buf, (i % 200) * 256).unwrap();
                    assert!(buf.iter().all(|&b| b == 0x5a));
                }
            }));
        }
        sf.set_switch_file(dir.path().join("local"));
        for h in handles {
            h.join().unwrap();
        }
        assert!(sf.is_local());
    }
}
