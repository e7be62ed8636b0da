//! Writable top layer: append (or sparse) write path, commit and seal

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use bytes::BytesMut;
use parking_lot::{Mutex, RwLock};
use tracing::warn;
use uuid::Uuid;

use super::format::{self, HeaderTrailer, HEADER_SIZE, INDEX_RECORD_SIZE};
use super::{check_alignment, read_mapped, seal_in_place, write_ro_image, CommitArgs, DataStat, RoLayer};
use crate::config::{ALIGNMENT, DEFAULT_MAX_IO_SIZE, IO_ALIGNMENT, MAX_LENGTH};
use crate::index::{compress_raw_index, Index, Index0};
use crate::vfile::SectorFile;
use crate::{Result, Segment, SegmentMapping, StrataError};

/// Parameters for creating a writable layer
#[derive(Debug, Clone, Copy)]
pub struct LayerInfo {
    /// Virtual volume size in bytes; must be sector-aligned
    pub vsize: u64,
    /// Layer identity
    pub uuid: Uuid,
    /// Identity of the layer below, if any
    pub parent_uuid: Uuid,
    /// Sparse mode: write at logical offsets instead of appending
    pub sparse: bool,
}

impl LayerInfo {
    /// New layer info with a fresh identity and no parent
    pub fn new(vsize: u64) -> Self {
        Self {
            vsize,
            uuid: Uuid::new_v4(),
            parent_uuid: Uuid::nil(),
            sparse: false,
        }
    }

    /// Switch to sparse mode
    pub fn sparse(mut self) -> Self {
        self.sparse = true;
        self
    }

    /// Record a parent layer
    pub fn with_parent(mut self, parent: Uuid) -> Self {
        self.parent_uuid = parent;
        self
    }
}

/// Buffered writer over the append-only index log file.
///
/// Records are batched until `group_commit` bytes of data have been
/// appended since the last flush (0 flushes on every write).
struct IndexLog {
    file: Box<dyn SectorFile>,
    /// Byte offset of the next record write
    woffset: u64,
    pending: BytesMut,
    appended_since_flush: u64,
    group_commit: u64,
}

impl IndexLog {
    fn append(&mut self, mapping: SegmentMapping, data_len: u64) -> Result<()> {
        format::encode_record(&mut self.pending, &mapping);
        self.appended_since_flush += data_len;
        if self.group_commit == 0 || self.appended_since_flush >= self.group_commit {
            self.flush()?;
        }
        Ok(())
    }

    fn flush(&mut self) -> Result<()> {
        if self.pending.is_empty() {
            self.appended_since_flush = 0;
            return Ok(());
        }
        self.file.pwrite(&self.pending, self.woffset)?;
        self.woffset += self.pending.len() as u64;
        self.pending.clear();
        self.appended_since_flush = 0;
        Ok(())
    }
}

impl Drop for IndexLog {
    fn drop(&mut self) {
        if let Err(e) = self.flush() {
            warn!("failed to flush index log on drop: {}", e);
        }
    }
}

/// Serialized append state: the physical cursor and the index log move
/// together under one lock, which also linearizes concurrent writers.
struct AppendState {
    /// Next free physical sector (append mode; unused in sparse mode)
    cursor: u64,
    log: Option<IndexLog>,
}

/// The writable top layer of a virtual volume.
///
/// Owns a data file, an in-memory [`Index0`], and optionally an
/// append-only index log replayed on reopen. Reads always observe a
/// consistent index: a mapping becomes visible only after its data is
/// on the data file.
pub struct RwLayer {
    data: Box<dyn SectorFile>,
    index: Arc<RwLock<Index0>>,
    append: Mutex<AppendState>,
    vsize: u64,
    uuid: Uuid,
    parent_uuid: Uuid,
    sparse: bool,
    max_io_size: AtomicUsize,
}

impl RwLayer {
    /// Create a fresh writable layer over empty files.
    ///
    /// In append mode a header sector is written to the data file and
    /// the cursor starts right after it; in sparse mode the data file
    /// is extended to `vsize` and writes land at their logical offset.
    pub fn create(
        data: Box<dyn SectorFile>,
        index_log: Option<Box<dyn SectorFile>>,
        info: LayerInfo,
    ) -> Result<Self> {
        if info.vsize == 0 || info.vsize % ALIGNMENT != 0 {
            return Err(StrataError::Config(format!(
                "virtual size {} is not sector-aligned",
                info.vsize
            )));
        }

        let cursor = if info.sparse {
            data.ftruncate(info.vsize)?;
            0
        } else {
            let header = HeaderTrailer::header(info.uuid, info.parent_uuid, info.vsize, false);
            data.pwrite(&header.encode(), 0)?;
            1
        };

        let log = match index_log {
            Some(file) => {
                let header =
                    HeaderTrailer::header(info.uuid, info.parent_uuid, info.vsize, info.sparse);
                file.pwrite(&header.encode(), 0)?;
                Some(IndexLog {
                    file,
                    woffset: HEADER_SIZE as u64,
                    pending: BytesMut::new(),
                    appended_since_flush: 0,
                    group_commit: 0,
                })
            }
            None => None,
        };

        Ok(Self {
            data,
            index: Arc::new(RwLock::new(Index0::new())),
            append: Mutex::new(AppendState { cursor, log }),
            vsize: info.vsize,
            uuid: info.uuid,
            parent_uuid: info.parent_uuid,
            sparse: info.sparse,
            max_io_size: AtomicUsize::new(DEFAULT_MAX_IO_SIZE),
        })
    }

    /// Reopen a writable layer: replay the index log into a fresh
    /// [`Index0`] and resume appending after the last physical extent.
    ///
    /// A torn tail record (short append before a crash) is dropped and
    /// the log truncated back to the last whole record.
    pub fn open(data: Box<dyn SectorFile>, index_log: Box<dyn SectorFile>) -> Result<Self> {
        let mut block = [0u8; HEADER_SIZE];
        let n = index_log.pread(&mut block, 0)?;
        if n < HEADER_SIZE {
            return Err(StrataError::Format("index log too short".into()));
        }
        let header = HeaderTrailer::decode(&block)?;
        if header.is_trailer() {
            return Err(StrataError::Format("index log holds a trailer block".into()));
        }
        let sparse = header.is_sparse();

        let log_len = index_log.flen()?;
        let body = log_len.saturating_sub(HEADER_SIZE as u64);
        let whole = body / INDEX_RECORD_SIZE as u64;
        if body % INDEX_RECORD_SIZE as u64 != 0 {
            warn!(
                "index log has a torn tail record, dropping {} bytes",
                body % INDEX_RECORD_SIZE as u64
            );
            index_log.ftruncate(HEADER_SIZE as u64 + whole * INDEX_RECORD_SIZE as u64)?;
        }

        let mut table = vec![0u8; (whole * INDEX_RECORD_SIZE as u64) as usize];
        index_log.pread(&mut table, HEADER_SIZE as u64)?;

        // replayed records may overlap freely; Index0 insertion replays
        // the overwrite history
        let mut index = Index0::new();
        let mut cursor = 1u64;
        let mut chunk = &table[..];
        for _ in 0..whole {
            let records = format::decode_index(&chunk[..INDEX_RECORD_SIZE], 1).map_err(|_| {
                StrataError::Format("corrupt record in index log".into())
            })?;
            let m = records[0];
            cursor = cursor.max(m.moffset + m.length as u64);
            index.insert(m);
            chunk = &chunk[INDEX_RECORD_SIZE..];
        }

        if !sparse {
            // resume past any extents whose records were lost to group
            // commit batching
            let data_len = data.flen()?;
            cursor = cursor.max(data_len.div_ceil(ALIGNMENT));

            let mut block = [0u8; HEADER_SIZE];
            let n = data.pread(&mut block, 0)?;
            if n < HEADER_SIZE {
                return Err(StrataError::Format("data file too short".into()));
            }
            let data_header = HeaderTrailer::decode(&block)?;
            if data_header.uuid != header.uuid {
                return Err(StrataError::Format(
                    "data file and index log identify different layers".into(),
                ));
            }
        }

        Ok(Self {
            data,
            index: Arc::new(RwLock::new(index)),
            append: Mutex::new(AppendState {
                cursor: if sparse { 0 } else { cursor },
                log: Some(IndexLog {
                    file: index_log,
                    woffset: HEADER_SIZE as u64 + whole * INDEX_RECORD_SIZE as u64,
                    pending: BytesMut::new(),
                    appended_since_flush: 0,
                    group_commit: 0,
                }),
            }),
            vsize: header.vsize,
            uuid: header.uuid,
            parent_uuid: header.parent_uuid,
            sparse,
            max_io_size: AtomicUsize::new(DEFAULT_MAX_IO_SIZE),
        })
    }

    /// Virtual volume size in bytes
    pub fn vsize(&self) -> u64 {
        self.vsize
    }

    /// Layer identity
    pub fn uuid(&self) -> Uuid {
        self.uuid
    }

    /// Whether this layer writes sparsely at logical offsets
    pub fn is_sparse(&self) -> bool {
        self.sparse
    }

    /// The live index (shared, non-owning)
    pub fn index(&self) -> Arc<RwLock<Index0>> {
        self.index.clone()
    }

    /// Hint that index log records may be batched until `bytes` of data
    /// have been appended between flushes. 0 flushes on every write.
    pub fn set_index_group_commit(&self, bytes: u64) {
        let mut st = self.append.lock();
        if let Some(log) = &mut st.log {
            log.group_commit = bytes;
        }
    }

    /// Set the advisory split size for large operations.
    ///
    /// Values that are zero, not a multiple of 4 KiB, or beyond the
    /// maximum mapping length are rejected and the previous value is
    /// retained.
    pub fn set_max_io_size(&self, bytes: usize) -> Result<()> {
        if bytes == 0
            || bytes as u64 % IO_ALIGNMENT != 0
            || bytes as u64 > MAX_LENGTH * ALIGNMENT
        {
            return Err(StrataError::State(format!(
                "invalid max I/O size: {}",
                bytes
            )));
        }
        self.max_io_size.store(bytes, Ordering::Relaxed);
        Ok(())
    }

    /// Current advisory split size
    pub fn get_max_io_size(&self) -> usize {
        self.max_io_size.load(Ordering::Relaxed)
    }

    /// Write `buf` at the logical byte `offset`.
    ///
    /// Appends data at the physical cursor (logical offset in sparse
    /// mode) and records the mapping; larger writes are split at the
    /// advisory I/O size. Concurrent writers are serialized at the
    /// cursor.
    pub fn pwrite(&self, buf: &[u8], offset: u64) -> Result<usize> {
        if buf.is_empty() {
            return Ok(0);
        }
        check_alignment(buf.len(), offset, self.vsize)?;

        let max = self.get_max_io_size();
        let mut done = 0usize;
        while done < buf.len() {
            let n = (buf.len() - done).min(max);
            self.write_chunk(&buf[done..done + n], offset + done as u64)?;
            done += n;
        }
        Ok(buf.len())
    }

    fn write_chunk(&self, chunk: &[u8], offset: u64) -> Result<()> {
        let nsec = chunk.len() as u64 / ALIGNMENT;
        let mut st = self.append.lock();

        let moff = if self.sparse {
            offset / ALIGNMENT
        } else {
            st.cursor
        };
        self.data.pwrite(chunk, moff * ALIGNMENT)?;
        if !self.sparse {
            st.cursor += nsec;
        }

        let mapping = SegmentMapping::new(offset / ALIGNMENT, nsec as u32, moff);
        self.index.write().insert(mapping);
        if let Some(log) = &mut st.log {
            log.append(mapping, chunk.len() as u64)?;
        }
        Ok(())
    }

    /// Discard `[offset, offset + len)`: record the range as all-zero
    /// without storing data. The range shadows lower layers exactly
    /// like written data.
    pub fn discard(&self, len: u64, offset: u64) -> Result<()> {
        if len == 0 {
            return Ok(());
        }
        check_alignment(len as usize, offset, self.vsize)?;

        let mut st = self.append.lock();
        let mut pos = offset / ALIGNMENT;
        let end = (offset + len) / ALIGNMENT;
        while pos < end {
            let nsec = (end - pos).min(MAX_LENGTH) as u32;
            let mapping = SegmentMapping::zeroed(pos, nsec);
            self.index.write().insert(mapping);
            if let Some(log) = &mut st.log {
                log.append(mapping, 0)?;
            }
            pos += nsec as u64;
        }
        Ok(())
    }

    /// Read `buf.len()` bytes at the logical byte `offset`; unmapped
    /// ranges and zeroed mappings read as zero.
    pub fn pread(&self, buf: &mut [u8], offset: u64) -> Result<usize> {
        if buf.is_empty() {
            return Ok(0);
        }
        check_alignment(buf.len(), offset, self.vsize)?;

        let q = Segment::new(offset / ALIGNMENT, (buf.len() as u64 / ALIGNMENT) as u32);
        let mappings = self.index.read().lookup(q);
        read_mapped(buf, q, &mappings, |m, delta, dst| {
            self.read_extent(m, delta, dst)
        })?;
        Ok(buf.len())
    }

    pub(crate) fn read_extent(
        &self,
        m: &SegmentMapping,
        delta: u64,
        dst: &mut [u8],
    ) -> Result<()> {
        let n = self.data.pread(dst, (m.moffset + delta) * ALIGNMENT)?;
        if n < dst.len() {
            return Err(StrataError::Format(format!(
                "short read in data file at mapping {}",
                m
            )));
        }
        Ok(())
    }

    /// Flush buffered index records and sync both files.
    pub fn fsync(&self) -> Result<()> {
        let mut st = self.append.lock();
        if let Some(log) = &mut st.log {
            log.flush()?;
            log.file.fsync()?;
        }
        self.data.fsync()
    }

    /// Flush buffered index records and sync file data.
    pub fn fdatasync(&self) -> Result<()> {
        let mut st = self.append.lock();
        if let Some(log) = &mut st.log {
            log.flush()?;
            log.file.fdatasync()?;
        }
        self.data.fdatasync()
    }

    /// Advisory range sync on the data file.
    pub fn sync_file_range(&self, offset: u64, nbytes: u64) -> Result<()> {
        let mut st = self.append.lock();
        if let Some(log) = &mut st.log {
            log.flush()?;
        }
        self.data.sync_file_range(offset, nbytes)
    }

    /// Data usage of this layer
    pub fn data_stat(&self) -> DataStat {
        let valid = self.index.read().block_count() * ALIGNMENT;
        let total = if self.sparse {
            valid
        } else {
            let st = self.append.lock();
            st.cursor.saturating_sub(1) * ALIGNMENT
        };
        DataStat {
            total_data_size: total,
            valid_data_size: valid,
        }
    }

    /// Write a compacted immutable image of the current contents to
    /// `target`. The writable layer stays usable afterwards.
    pub fn commit(&self, target: &dyn SectorFile, args: &CommitArgs) -> Result<()> {
        let mut dump = self.index.read().dump();
        compress_raw_index(&mut dump);
        write_ro_image(
            target,
            self.vsize,
            args.uuid.unwrap_or(self.uuid),
            args.parent_uuid.unwrap_or(self.parent_uuid),
            &dump,
            |m, delta, dst| self.read_extent(m, delta, dst),
        )
    }

    /// Seal the layer in place: append the index table and trailer to
    /// the data file and reopen it read-only. The data area keeps any
    /// overwritten garbage; consuming `self` makes a second seal
    /// impossible by construction.
    pub fn close_seal(self) -> Result<RoLayer> {
        if self.sparse {
            return Err(StrataError::State(
                "close_seal is not supported on a sparse layer".into(),
            ));
        }

        let mut st = self.append.into_inner();
        if let Some(log) = &mut st.log {
            log.flush()?;
            log.file.fsync()?;
        }

        let index = self.index.read();
        let mut dump = index.dump();
        compress_raw_index(&mut dump);
        drop(index);

        seal_in_place(
            self.data.as_ref(),
            st.cursor,
            self.vsize,
            self.uuid,
            self.parent_uuid,
            &dump,
        )?;

        RoLayer::from_parts(
            self.data,
            Index::from_sorted(dump),
            self.vsize,
            self.uuid,
            self.parent_uuid,
        )
    }
}
