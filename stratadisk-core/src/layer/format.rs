//! On-disk format for layer files
//!
//! A sealed layer is, in order: a fixed 512-byte header, the data area
//! (concatenated extents referenced by the index), the index table of
//! fixed-width records, and a 512-byte trailer. Header and trailer share
//! one layout; the trailer additionally records where the index table
//! lives. All integers are little-endian.

use bytes::{Buf, BufMut, BytesMut};
use uuid::Uuid;

use crate::{Result, SegmentMapping, StrataError};

/// Magic bytes opening the header and trailer
pub const MAGIC: [u8; 8] = *b"STRATALR";

/// Layer format version
pub const FORMAT_VERSION: u32 = 1;

/// Header and trailer each occupy one sector
pub const HEADER_SIZE: usize = 512;

/// Fixed width of one serialized index record
pub const INDEX_RECORD_SIZE: usize = 24;

/// This block is the trailer, not the header
pub const FLAG_TRAILER: u32 = 1 << 0;
/// The layer is sealed (immutable)
pub const FLAG_SEALED: u32 = 1 << 1;
/// The writable layer was opened in sparse mode
pub const FLAG_SPARSE: u32 = 1 << 2;

/// Index record flag: the range is all-zero and stores no data
const RECORD_ZEROED: u32 = 1 << 0;

/// The fixed block written at the head and tail of a layer file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HeaderTrailer {
    pub flags: u32,
    pub uuid: Uuid,
    pub parent_uuid: Uuid,
    /// Virtual volume size in bytes
    pub vsize: u64,
    /// Byte offset of the index table (trailer only)
    pub index_offset: u64,
    /// Number of index records (trailer only)
    pub index_count: u64,
}

impl HeaderTrailer {
    /// A header block for a fresh layer
    pub fn header(uuid: Uuid, parent_uuid: Uuid, vsize: u64, sparse: bool) -> Self {
        Self {
            flags: if sparse { FLAG_SPARSE } else { 0 },
            uuid,
            parent_uuid,
            vsize,
            index_offset: 0,
            index_count: 0,
        }
    }

    /// A trailer block for a sealed layer
    pub fn trailer(
        uuid: Uuid,
        parent_uuid: Uuid,
        vsize: u64,
        index_offset: u64,
        index_count: u64,
    ) -> Self {
        Self {
            flags: FLAG_TRAILER | FLAG_SEALED,
            uuid,
            parent_uuid,
            vsize,
            index_offset,
            index_count,
        }
    }

    /// Whether this block is a trailer
    pub fn is_trailer(&self) -> bool {
        self.flags & FLAG_TRAILER != 0
    }

    /// Whether the layer is sealed
    pub fn is_sealed(&self) -> bool {
        self.flags & FLAG_SEALED != 0
    }

    /// Whether the writable layer is sparse
    pub fn is_sparse(&self) -> bool {
        self.flags & FLAG_SPARSE != 0
    }

    /// Serialize into one zero-padded sector
    pub fn encode(&self) -> [u8; HEADER_SIZE] {
        let mut buf = BytesMut::with_capacity(HEADER_SIZE);
        buf.put_slice(&MAGIC);
        buf.put_u32_le(FORMAT_VERSION);
        buf.put_u32_le(self.flags);
        buf.put_slice(self.uuid.as_bytes());
        buf.put_slice(self.parent_uuid.as_bytes());
        buf.put_u64_le(self.vsize);
        buf.put_u64_le(self.index_offset);
        buf.put_u64_le(self.index_count);

        let mut out = [0u8; HEADER_SIZE];
        out[..buf.len()].copy_from_slice(&buf);
        out
    }

    /// Parse one sector, validating magic and version
    pub fn decode(data: &[u8]) -> Result<Self> {
        if data.len() < HEADER_SIZE {
            return Err(StrataError::Format("short header block".into()));
        }
        let mut cursor = &data[..HEADER_SIZE];
        let mut magic = [0u8; 8];
        cursor.copy_to_slice(&mut magic);
        if magic != MAGIC {
            return Err(StrataError::Format("bad layer magic".into()));
        }
        let version = cursor.get_u32_le();
        if version != FORMAT_VERSION {
            return Err(StrataError::Format(format!(
                "unsupported layer version: {}",
                version
            )));
        }
        let flags = cursor.get_u32_le();
        let mut uuid = [0u8; 16];
        cursor.copy_to_slice(&mut uuid);
        let mut parent = [0u8; 16];
        cursor.copy_to_slice(&mut parent);
        Ok(Self {
            flags,
            uuid: Uuid::from_bytes(uuid),
            parent_uuid: Uuid::from_bytes(parent),
            vsize: cursor.get_u64_le(),
            index_offset: cursor.get_u64_le(),
            index_count: cursor.get_u64_le(),
        })
    }
}

/// Append one index record to `buf`
pub fn encode_record(buf: &mut BytesMut, m: &SegmentMapping) {
    buf.put_u64_le(m.offset);
    buf.put_u32_le(m.length);
    buf.put_u32_le(if m.zeroed { RECORD_ZEROED } else { 0 });
    buf.put_u64_le(if m.zeroed { 0 } else { m.moffset });
}

/// Serialize a whole index table
pub fn encode_index(mappings: &[SegmentMapping]) -> BytesMut {
    let mut buf = BytesMut::with_capacity(mappings.len() * INDEX_RECORD_SIZE);
    for m in mappings {
        encode_record(&mut buf, m);
    }
    buf
}

/// Parse `count` records; entries must arrive in ascending offset order
/// without overlap.
pub fn decode_index(data: &[u8], count: usize) -> Result<Vec<SegmentMapping>> {
    if data.len() < count * INDEX_RECORD_SIZE {
        return Err(StrataError::Format("truncated index table".into()));
    }
    let mut cursor = data;
    let mut out: Vec<SegmentMapping> = Vec::with_capacity(count);
    for _ in 0..count {
        let offset = cursor.get_u64_le();
        let length = cursor.get_u32_le();
        let flags = cursor.get_u32_le();
        let moffset = cursor.get_u64_le();
        if length == 0 {
            return Err(StrataError::Format("zero-length index record".into()));
        }
        let m = SegmentMapping {
            offset,
            length,
            moffset,
            zeroed: flags & RECORD_ZEROED != 0,
            tag: 0,
        };
        if let Some(prev) = out.last() {
            if prev.end() > m.offset {
                return Err(StrataError::Format(format!(
                    "index records out of order: {} then {}",
                    prev, m
                )));
            }
        }
        out.push(m);
    }
    Ok(out)
}
