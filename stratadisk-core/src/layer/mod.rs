//! Layer files: the write path, sealed layers, and stacking
//!
//! A virtual volume is composed of one writable top layer over a stack
//! of sealed read-only layers:
//!
//! - [`RwLayer`]: append-only (or sparse) write path over a data file
//!   and an index log; commits and seals into read-only artifacts
//! - [`RoLayer`]: one immutable sealed layer
//! - [`RoStack`] / [`StackedFile`]: composition of many layers behind a
//!   single pread/pwrite surface, plus offline merging

pub mod format;

mod ro;
mod rw;
mod stacked;

pub use ro::RoLayer;
pub use rw::{LayerInfo, RwLayer};
pub use stacked::{merge_files_ro, open_files_ro, stack_files, RoStack, StackedFile};

use bytes::BytesMut;
use uuid::Uuid;

use crate::config::ALIGNMENT;
use crate::vfile::SectorFile;
use crate::{Result, Segment, SegmentMapping, StrataError};

/// Data usage of a layer
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DataStat {
    /// Bytes physically occupied by the data area, garbage included
    pub total_data_size: u64,
    /// Bytes referenced by live non-zeroed mappings
    pub valid_data_size: u64,
}

/// Identity and parameters supplied when committing a layer
#[derive(Debug, Clone, Copy, Default)]
pub struct CommitArgs {
    /// Identity of the committed layer; defaults to the source layer's
    pub uuid: Option<Uuid>,
    /// Recorded parent layer
    pub parent_uuid: Option<Uuid>,
}

/// Copy chunk size for commit/merge data compaction (2048 sectors)
const COPY_CHUNK_SECTORS: u64 = 2048;

/// Reject byte offsets and lengths that are not sector-aligned.
pub(crate) fn check_alignment(buf_len: usize, offset: u64, vsize: u64) -> Result<()> {
    if buf_len as u64 % ALIGNMENT != 0 || offset % ALIGNMENT != 0 {
        return Err(StrataError::State(format!(
            "unaligned I/O: length {} offset {}",
            buf_len, offset
        )));
    }
    if offset + buf_len as u64 > vsize {
        return Err(StrataError::State(format!(
            "I/O past virtual size: offset {} length {} vsize {}",
            offset, buf_len, vsize
        )));
    }
    Ok(())
}

/// Materialize a lookup result into `buf`: mapped ranges through
/// `read_extent`, zeroed mappings and gaps as zero bytes.
///
/// `read_extent` receives the mapping, a sector delta into it, and the
/// destination slice.
pub(crate) fn read_mapped(
    buf: &mut [u8],
    q: Segment,
    mappings: &[SegmentMapping],
    mut read_extent: impl FnMut(&SegmentMapping, u64, &mut [u8]) -> Result<()>,
) -> Result<()> {
    let base = q.offset;
    let mut pos = q.offset;
    for m in mappings {
        if m.offset > pos {
            let gap = &mut buf[((pos - base) * ALIGNMENT) as usize
                ..((m.offset - base) * ALIGNMENT) as usize];
            gap.fill(0);
        }
        let dst =
            &mut buf[((m.offset - base) * ALIGNMENT) as usize..((m.end() - base) * ALIGNMENT) as usize];
        if m.zeroed {
            dst.fill(0);
        } else {
            read_extent(m, 0, dst)?;
        }
        pos = m.end();
    }
    if pos < q.end() {
        buf[((pos - base) * ALIGNMENT) as usize..].fill(0);
    }
    Ok(())
}

/// Write a sealed read-only layer image to `target`: header, compacted
/// data area, index table, trailer.
///
/// `mappings` must be sorted and compressed; extents are copied in
/// offset order and assigned fresh contiguous physical offsets, so the
/// output carries no garbage.
pub(crate) fn write_ro_image(
    target: &dyn SectorFile,
    vsize: u64,
    uuid: Uuid,
    parent_uuid: Uuid,
    mappings: &[SegmentMapping],
    mut read_extent: impl FnMut(&SegmentMapping, u64, &mut [u8]) -> Result<()>,
) -> Result<()> {
    let header = format::HeaderTrailer::header(uuid, parent_uuid, vsize, false);
    target.pwrite(&header.encode(), 0)?;

    let mut copy_buf = vec![0u8; (COPY_CHUNK_SECTORS * ALIGNMENT) as usize];
    let mut out_index = Vec::with_capacity(mappings.len());
    let mut moff = 1u64; // data area begins after the header sector

    for m in mappings {
        if m.zeroed {
            out_index.push(SegmentMapping::zeroed(m.offset, m.length));
            continue;
        }
        let mut done = 0u64;
        while done < m.length as u64 {
            let n = COPY_CHUNK_SECTORS.min(m.length as u64 - done);
            let chunk = &mut copy_buf[..(n * ALIGNMENT) as usize];
            read_extent(m, done, chunk)?;
            target.pwrite(chunk, (moff + done) * ALIGNMENT)?;
            done += n;
        }
        out_index.push(SegmentMapping::new(m.offset, m.length, moff));
        moff += m.length as u64;
    }

    let index_offset = moff * ALIGNMENT;
    let table = format::encode_index(&out_index);
    target.pwrite(&table, index_offset)?;

    let trailer = format::HeaderTrailer::trailer(
        uuid,
        parent_uuid,
        vsize,
        index_offset,
        out_index.len() as u64,
    );
    target.pwrite(&trailer.encode(), index_offset + table.len() as u64)?;
    target.fsync()?;
    Ok(())
}

/// Append the in-place index table and trailer used by `close_seal`:
/// the data area is left as written (garbage included), only the index
/// and trailer are added at the current append cursor.
pub(crate) fn seal_in_place(
    data: &dyn SectorFile,
    cursor_sectors: u64,
    vsize: u64,
    uuid: Uuid,
    parent_uuid: Uuid,
    mappings: &[SegmentMapping],
) -> Result<()> {
    let index_offset = cursor_sectors * ALIGNMENT;
    let mut table = BytesMut::new();
    for m in mappings {
        format::encode_record(&mut table, m);
    }
    data.pwrite(&table, index_offset)?;
    let trailer = format::HeaderTrailer::trailer(
        uuid,
        parent_uuid,
        vsize,
        index_offset,
        mappings.len() as u64,
    );
    data.pwrite(&trailer.encode(), index_offset + table.len() as u64)?;
    data.fsync()?;
    Ok(())
}
