//! Sealed read-only layer

use uuid::Uuid;

use super::format::{HeaderTrailer, HEADER_SIZE, INDEX_RECORD_SIZE};
use super::{check_alignment, format, read_mapped, DataStat};
use crate::config::ALIGNMENT;
use crate::index::{Index, LevelIndex};
use crate::vfile::SectorFile;
use crate::{Result, Segment, SegmentMapping, StrataError};

/// One immutable layer: a sealed data file plus its loaded index.
///
/// Produced by [`super::RwLayer::commit`] + [`RoLayer::open`], or
/// directly by [`super::RwLayer::close_seal`].
pub struct RoLayer {
    data: Box<dyn SectorFile>,
    /// Windowed lookup structure over the loaded index table
    index: LevelIndex,
    vsize: u64,
    uuid: Uuid,
    parent_uuid: Uuid,
}

impl RoLayer {
    /// Open a sealed layer file: read and validate the trailer, then
    /// load the index table.
    pub fn open(data: Box<dyn SectorFile>) -> Result<Self> {
        let flen = data.flen()?;
        if flen < 2 * HEADER_SIZE as u64 {
            return Err(StrataError::Format("layer file too short".into()));
        }

        let mut block = [0u8; HEADER_SIZE];
        let n = data.pread(&mut block, flen - HEADER_SIZE as u64)?;
        if n < HEADER_SIZE {
            return Err(StrataError::Format("truncated trailer".into()));
        }
        let trailer = HeaderTrailer::decode(&block)?;
        if !trailer.is_trailer() || !trailer.is_sealed() {
            return Err(StrataError::Format("missing layer trailer".into()));
        }

        let table_len = trailer.index_count * INDEX_RECORD_SIZE as u64;
        if trailer.index_offset + table_len + HEADER_SIZE as u64 > flen {
            return Err(StrataError::Format("index table past end of file".into()));
        }
        let mut table = vec![0u8; table_len as usize];
        let n = data.pread(&mut table, trailer.index_offset)?;
        if (n as u64) < table_len {
            return Err(StrataError::Format("truncated index table".into()));
        }
        let records = format::decode_index(&table, trailer.index_count as usize)?;

        Ok(Self {
            index: LevelIndex::new(&records, 0, trailer.vsize / ALIGNMENT),
            data,
            vsize: trailer.vsize,
            uuid: trailer.uuid,
            parent_uuid: trailer.parent_uuid,
        })
    }

    /// Assemble from parts already in memory (the `close_seal` path).
    pub(crate) fn from_parts(
        data: Box<dyn SectorFile>,
        index: Index,
        vsize: u64,
        uuid: Uuid,
        parent_uuid: Uuid,
    ) -> Result<Self> {
        Ok(Self {
            index: LevelIndex::new(index.buffer(), 0, vsize / ALIGNMENT),
            data,
            vsize,
            uuid,
            parent_uuid,
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

    /// Identity of the layer below, if recorded
    pub fn parent_uuid(&self) -> Uuid {
        self.parent_uuid
    }

    /// The loaded index
    pub fn index(&self) -> &LevelIndex {
        &self.index
    }

    /// Size of the backing layer file in bytes
    pub fn flen(&self) -> Result<u64> {
        self.data.flen()
    }

    /// Data usage: valid bytes referenced by non-zeroed mappings
    pub fn data_stat(&self) -> DataStat {
        let valid = self.index.block_count() * ALIGNMENT;
        DataStat {
            total_data_size: valid,
            valid_data_size: valid,
        }
    }

    /// Read `buf.len()` bytes at the logical byte `offset`; unmapped
    /// ranges and zeroed mappings read as zero.
    pub fn pread(&self, buf: &mut [u8], offset: u64) -> Result<usize> {
        if buf.is_empty() {
            return Ok(0);
        }
        check_alignment(buf.len(), offset, self.vsize)?;

        let q = Segment::new(offset / ALIGNMENT, (buf.len() as u64 / ALIGNMENT) as u32);
        let mappings = self.index.lookup(q);
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
                "short read in sealed layer at mapping {}",
                m
            )));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::super::{CommitArgs, LayerInfo, RwLayer};
    use super::*;
    use tempfile::TempDir;

    fn new_file(dir: &TempDir, name: &str) -> Box<dyn SectorFile> {
        Box::new(
            std::fs::OpenOptions::new()
                .read(true)
                .write(true)
                .create(true)
                .truncate(false)
                .open(dir.path().join(name))
                .unwrap(),
        )
    }

    fn build_rw(dir: &TempDir) -> RwLayer {
        let layer = RwLayer::create(
            new_file(dir, "rw.data"),
            Some(new_file(dir, "rw.index")),
            LayerInfo::new(1 << 20),
        )
        .unwrap();
        layer.pwrite(&vec![0x11; 2 * ALIGNMENT as usize], 0).unwrap();
        layer.pwrite(&vec![0x22; ALIGNMENT as usize], 10 * ALIGNMENT).unwrap();
        layer.pwrite(&vec![0x33; ALIGNMENT as usize], ALIGNMENT).unwrap();
        layer
    }

    fn assert_same_reads(layer: &RwLayer, ro: &RoLayer) {
        for offset in [0u64, ALIGNMENT, 9 * ALIGNMENT, 10 * ALIGNMENT] {
            let mut a = vec![0u8; 2 * ALIGNMENT as usize];
            let mut b = vec![0xffu8; 2 * ALIGNMENT as usize];
            layer.pread(&mut a, offset).unwrap();
            ro.pread(&mut b, offset).unwrap();
            assert_eq!(a, b, "mismatch at offset {}", offset);
        }
    }

    #[test]
    fn test_commit_open_round_trip() {
        let dir = TempDir::new().unwrap();
        let layer = build_rw(&dir);

        let target = new_file(&dir, "committed.layer");
        layer.commit(target.as_ref(), &CommitArgs::default()).unwrap();

        let ro = RoLayer::open(new_file(&dir, "committed.layer")).unwrap();
        assert_eq!(ro.vsize(), 1 << 20);
        assert_eq!(ro.uuid(), layer.uuid());
        assert_same_reads(&layer, &ro);

        // committed image is compacted: no garbage from the overwrite
        assert_eq!(ro.data_stat().valid_data_size, 3 * ALIGNMENT);
    }

    #[test]
    fn test_close_seal_round_trip() {
        let dir = TempDir::new().unwrap();
        let layer = build_rw(&dir);
        let uuid = layer.uuid();

        // capture expected content before sealing
        let mut expect = vec![0u8; 11 * ALIGNMENT as usize];
        layer.pread(&mut expect, 0).unwrap();

        let ro = layer.close_seal().unwrap();
        assert_eq!(ro.uuid(), uuid);
        let mut got = vec![0u8; 11 * ALIGNMENT as usize];
        ro.pread(&mut got, 0).unwrap();
        assert_eq!(got, expect);

        // the sealed file reopens from disk with identical behavior
        drop(ro);
        let ro = RoLayer::open(new_file(&dir, "rw.data")).unwrap();
        let mut got = vec![0u8; 11 * ALIGNMENT as usize];
        ro.pread(&mut got, 0).unwrap();
        assert_eq!(got, expect);
    }

    #[test]
    fn test_open_rejects_unsealed_file() {
        let dir = TempDir::new().unwrap();
        std::fs::write(dir.path().join("junk"), vec![0u8; 4096]).unwrap();
        assert!(RoLayer::open(new_file(&dir, "junk")).is_err());
    }

    #[test]
    fn test_commit_from_sparse_layer() {
        let dir = TempDir::new().unwrap();
        let layer = RwLayer::create(
            new_file(&dir, "sparse.data"),
            Some(new_file(&dir, "sparse.index")),
            LayerInfo::new(1 << 20).sparse(),
        )
        .unwrap();
        layer.pwrite(&vec![0x7e; ALIGNMENT as usize], 100 * ALIGNMENT).unwrap();

        let target = new_file(&dir, "sparse.layer");
        layer.commit(target.as_ref(), &CommitArgs::default()).unwrap();

        let ro = RoLayer::open(new_file(&dir, "sparse.layer")).unwrap();
        let mut buf = vec![0u8; ALIGNMENT as usize];
        ro.pread(&mut buf, 100 * ALIGNMENT).unwrap();
        assert!(buf.iter().all(|&b| b == 0x7e));
    }
}
