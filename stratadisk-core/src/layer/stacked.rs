//! Stacking layers behind a single I/O surface, and offline merging

use std::sync::Arc;

use tracing::warn;
use uuid::Uuid;

use super::{check_alignment, read_mapped, write_ro_image, CommitArgs, DataStat, RoLayer, RwLayer};
use crate::config::{ALIGNMENT, MAX_STACK_LAYERS};
use crate::index::{merge_memory_indexes, ComboIndex, Index};
use crate::vfile::SectorFile;
use crate::{Result, Segment, SegmentMapping, StrataError};

/// A prebuilt stack of sealed layers behind one merged index.
///
/// Mapping tags address the owning layer: tag 1 is the newest layer,
/// tag N the oldest.
pub struct RoStack {
    /// Oldest first, as passed to [`open_files_ro`]
    layers: Vec<RoLayer>,
    merged: Arc<Index>,
    vsize: u64,
}

/// Open a read-only stack. `files[0]` is the oldest (lowest) layer.
///
/// Builds the merged index: the newest layer covering a byte wins it.
pub fn open_files_ro(files: Vec<Box<dyn SectorFile>>) -> Result<RoStack> {
    if files.is_empty() {
        return Err(StrataError::Config("empty layer stack".into()));
    }
    if files.len() > MAX_STACK_LAYERS {
        return Err(StrataError::Config(format!(
            "too many layers: {} (max {})",
            files.len(),
            MAX_STACK_LAYERS
        )));
    }

    let mut layers = Vec::with_capacity(files.len());
    for file in files {
        layers.push(RoLayer::open(file)?);
    }
    let vsize = layers.last().expect("non-empty").vsize();

    // merge newest-first so the newest layer receives tag 1
    let flats: Vec<Index> = layers
        .iter()
        .rev()
        .map(|l| Index::from_sorted(l.index().buffer().to_vec()))
        .collect();
    let refs: Vec<&Index> = flats.iter().collect();
    let merged = merge_memory_indexes(&refs);

    Ok(RoStack {
        layers,
        merged: Arc::new(merged),
        vsize,
    })
}

impl RoStack {
    /// Number of layers
    pub fn layer_count(&self) -> usize {
        self.layers.len()
    }

    /// Virtual volume size in bytes (taken from the newest layer)
    pub fn vsize(&self) -> u64 {
        self.vsize
    }

    /// The merged index over all layers
    pub fn index(&self) -> &Arc<Index> {
        &self.merged
    }

    /// Identity of the layer at `layer_idx` (0 = oldest)
    pub fn uuid(&self, layer_idx: usize) -> Option<Uuid> {
        self.layers.get(layer_idx).map(|l| l.uuid())
    }

    /// Data usage across the stack: bytes reachable through the merged
    /// view
    pub fn data_stat(&self) -> DataStat {
        let valid = self.merged.block_count() * ALIGNMENT;
        DataStat {
            total_data_size: valid,
            valid_data_size: valid,
        }
    }

    /// Sealing an already-sealed stack is meaningless.
    pub fn close_seal(&self) -> Result<()> {
        Err(StrataError::Unsupported("close_seal on a read-only stack"))
    }

    /// Committing a read-only stack is meaningless; use
    /// [`merge_files_ro`] to compact layers.
    pub fn commit(&self, _target: &dyn SectorFile, _args: &CommitArgs) -> Result<()> {
        Err(StrataError::Unsupported("commit on a read-only stack"))
    }

    fn layer_for_tag(&self, tag: u8) -> &RoLayer {
        debug_assert!(tag >= 1 && (tag as usize) <= self.layers.len());
        &self.layers[self.layers.len() - tag as usize]
    }

    pub(crate) fn read_extent(
        &self,
        m: &SegmentMapping,
        delta: u64,
        dst: &mut [u8],
    ) -> Result<()> {
        self.layer_for_tag(m.tag).read_extent(m, delta, dst)
    }

    /// Read `buf.len()` bytes at the logical byte `offset` across the
    /// stack; uncovered ranges read as zero.
    pub fn pread(&self, buf: &mut [u8], offset: u64) -> Result<usize> {
        if buf.is_empty() {
            return Ok(0);
        }
        check_alignment(buf.len(), offset, self.vsize)?;

        let q = Segment::new(offset / ALIGNMENT, (buf.len() as u64 / ALIGNMENT) as u32);
        let mappings = self.merged.lookup(q);
        read_mapped(buf, q, &mappings, |m, delta, dst| {
            self.read_extent(m, delta, dst)
        })?;
        Ok(buf.len())
    }
}

/// One writable layer stacked over a read-only stack: a single
/// read/write virtual volume.
pub struct StackedFile {
    upper: RwLayer,
    lower: RoStack,
    combo: ComboIndex,
    vsize: u64,
}

/// Compose a writable top over a prebuilt stack. The stacked file owns
/// both; dropping it closes everything.
pub fn stack_files(upper: RwLayer, lower: RoStack) -> Result<StackedFile> {
    if upper.vsize() != lower.vsize() {
        warn!(
            "stacking layers of differing virtual sizes: upper {} lower {}",
            upper.vsize(),
            lower.vsize()
        );
    }
    let vsize = upper.vsize();
    let combo = ComboIndex::new(upper.index(), lower.index().clone());
    Ok(StackedFile {
        upper,
        lower,
        combo,
        vsize,
    })
}

impl StackedFile {
    /// Virtual volume size in bytes
    pub fn vsize(&self) -> u64 {
        self.vsize
    }

    /// The writable top layer
    pub fn upper(&self) -> &RwLayer {
        &self.upper
    }

    /// The read-only stack below
    pub fn lower(&self) -> &RoStack {
        &self.lower
    }

    /// Read through the combined view: the top wins every contested
    /// byte; holes read as zero.
    pub fn pread(&self, buf: &mut [u8], offset: u64) -> Result<usize> {
        if buf.is_empty() {
            return Ok(0);
        }
        check_alignment(buf.len(), offset, self.vsize)?;

        let q = Segment::new(offset / ALIGNMENT, (buf.len() as u64 / ALIGNMENT) as u32);
        let mappings = self.combo.lookup(q);
        read_mapped(buf, q, &mappings, |m, delta, dst| {
            if m.tag == 0 {
                self.upper.read_extent(m, delta, dst)
            } else {
                self.lower.read_extent(m, delta, dst)
            }
        })?;
        Ok(buf.len())
    }

    /// Write through to the top layer unconditionally.
    pub fn pwrite(&self, buf: &[u8], offset: u64) -> Result<usize> {
        self.upper.pwrite(buf, offset)
    }

    /// Record `[offset, offset + len)` as all-zero in the top layer,
    /// shadowing whatever the stack holds there.
    pub fn discard(&self, len: u64, offset: u64) -> Result<()> {
        self.upper.discard(len, offset)
    }

    /// Flush the top layer.
    pub fn fsync(&self) -> Result<()> {
        self.upper.fsync()
    }

    /// Flush the top layer's data.
    pub fn fdatasync(&self) -> Result<()> {
        self.upper.fdatasync()
    }

    /// Data usage of the writable top
    pub fn data_stat(&self) -> DataStat {
        self.upper.data_stat()
    }

    /// Commit the writable top as a new sealed layer.
    pub fn commit(&self, target: &dyn SectorFile, args: &CommitArgs) -> Result<()> {
        self.upper.commit(target, args)
    }

    /// Advisory split size of the top layer; invalid values rejected.
    pub fn set_max_io_size(&self, bytes: usize) -> Result<()> {
        self.upper.set_max_io_size(bytes)
    }

    /// Current advisory split size
    pub fn get_max_io_size(&self) -> usize {
        self.upper.get_max_io_size()
    }

    /// Batch top-layer index records between flushes.
    pub fn set_index_group_commit(&self, bytes: u64) {
        self.upper.set_index_group_commit(bytes)
    }

    /// Tear down into parts, releasing ownership.
    pub fn into_parts(self) -> (RwLayer, RoStack) {
        (self.upper, self.lower)
    }
}

/// Merge sealed layers into a single new sealed layer written to
/// `target`. `files[0]` is the oldest layer.
///
/// The output index equals the merged in-memory index and the data area
/// is a compaction of all live mappings, equivalent to committing a
/// hypothetical writable layer that replayed every write in history
/// order.
pub fn merge_files_ro(files: Vec<Box<dyn SectorFile>>, target: &dyn SectorFile) -> Result<()> {
    let stack = open_files_ro(files)?;
    let newest_uuid = stack
        .uuid(stack.layer_count() - 1)
        .expect("stack is non-empty");

    write_ro_image(
        target,
        stack.vsize(),
        Uuid::new_v4(),
        newest_uuid,
        stack.index().buffer(),
        |m, delta, dst| stack.read_extent(m, delta, dst),
    )
}

#[cfg(test)]
mod tests {
    use super::super::LayerInfo;
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

    const VSIZE: u64 = 1 << 20;

    /// Build a sealed layer containing the given (sector, byte) writes.
    fn build_layer(dir: &TempDir, name: &str, writes: &[(u64, u8)]) -> Box<dyn SectorFile> {
        let rw = RwLayer::create(
            new_file(dir, &format!("{}.data", name)),
            None,
            LayerInfo::new(VSIZE),
        )
        .unwrap();
        for &(sector, byte) in writes {
            rw.pwrite(&vec![byte; ALIGNMENT as usize], sector * ALIGNMENT)
                .unwrap();
        }
        let target = new_file(dir, name);
        rw.commit(target.as_ref(), &CommitArgs::default()).unwrap();
        new_file(dir, name)
    }

    #[test]
    fn test_stack_shadowing() {
        let dir = TempDir::new().unwrap();
        // oldest writes sectors 0..4, newer layer overwrites 1..3
        let old = build_layer(&dir, "old.layer", &[(0, 0x10), (1, 0x10), (2, 0x10), (3, 0x10)]);
        let new = build_layer(&dir, "new.layer", &[(1, 0x20), (2, 0x20)]);

        let stack = open_files_ro(vec![old, new]).unwrap();
        let mut buf = vec![0u8; 4 * ALIGNMENT as usize];
        stack.pread(&mut buf, 0).unwrap();
        assert_eq!(buf[0], 0x10);
        assert_eq!(buf[ALIGNMENT as usize], 0x20);
        assert_eq!(buf[2 * ALIGNMENT as usize], 0x20);
        assert_eq!(buf[3 * ALIGNMENT as usize], 0x10);

        assert!(stack.close_seal().is_err());
        let sink = new_file(&dir, "sink");
        assert!(matches!(
            stack.commit(sink.as_ref(), &CommitArgs::default()),
            Err(StrataError::Unsupported(_))
        ));
    }

    #[test]
    fn test_stacked_file_write_wins() {
        let dir = TempDir::new().unwrap();
        let lower = build_layer(&dir, "l0.layer", &[(0, 0x10), (5, 0x10)]);
        let stack = open_files_ro(vec![lower]).unwrap();

        let upper = RwLayer::create(
            new_file(&dir, "top.data"),
            Some(new_file(&dir, "top.index")),
            LayerInfo::new(VSIZE),
        )
        .unwrap();
        let file = stack_files(upper, stack).unwrap();

        file.pwrite(&vec![0x99; ALIGNMENT as usize], 0).unwrap();

        let mut buf = vec![0u8; 6 * ALIGNMENT as usize];
        file.pread(&mut buf, 0).unwrap();
        assert_eq!(buf[0], 0x99); // top wins
        assert_eq!(buf[ALIGNMENT as usize], 0); // hole
        assert_eq!(buf[5 * ALIGNMENT as usize], 0x10); // falls through
    }

    #[test]
    fn test_discard_shadows_lower_layers() {
        let dir = TempDir::new().unwrap();
        let lower = build_layer(&dir, "base.layer", &[(0, 0x10), (1, 0x10), (2, 0x10)]);
        let stack = open_files_ro(vec![lower]).unwrap();

        let upper = RwLayer::create(
            new_file(&dir, "d.data"),
            Some(new_file(&dir, "d.index")),
            LayerInfo::new(VSIZE),
        )
        .unwrap();
        let file = stack_files(upper, stack).unwrap();

        file.discard(ALIGNMENT, ALIGNMENT).unwrap();

        let mut buf = vec![0xffu8; 3 * ALIGNMENT as usize];
        file.pread(&mut buf, 0).unwrap();
        assert_eq!(buf[0], 0x10);
        assert!(buf[ALIGNMENT as usize..2 * ALIGNMENT as usize]
            .iter()
            .all(|&b| b == 0));
        assert_eq!(buf[2 * ALIGNMENT as usize], 0x10);
    }

    #[test]
    fn test_merge_equals_stack() {
        let dir = TempDir::new().unwrap();
        let files: Vec<_> = (0..3)
            .map(|i| {
                build_layer(
                    &dir,
                    &format!("m{}.layer", i),
                    &[(i, 0x40 + i as u8), (10 + i, 0x40 + i as u8)],
                )
            })
            .collect();

        let reopen = |dir: &TempDir| -> Vec<Box<dyn SectorFile>> {
            (0..3).map(|i| new_file(dir, &format!("m{}.layer", i))).collect()
        };

        let target = new_file(&dir, "merged.layer");
        merge_files_ro(files, target.as_ref()).unwrap();

        let stack = open_files_ro(reopen(&dir)).unwrap();
        let merged = RoLayer::open(new_file(&dir, "merged.layer")).unwrap();

        let mut a = vec![0u8; 16 * ALIGNMENT as usize];
        let mut b = vec![0xffu8; 16 * ALIGNMENT as usize];
        stack.pread(&mut a, 0).unwrap();
        merged.pread(&mut b, 0).unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn test_open_files_ro_rejects_empty() {
        assert!(open_files_ro(Vec::new()).is_err());
    }
}
