//! Combined view of the writable top index over a merged read-only stack

use std::sync::Arc;

use parking_lot::RwLock;

use super::{compress_raw_index, Index, Index0};
use crate::{Segment, SegmentMapping};

/// One [`Index0`] (the top, tag 0) composed with the merged view of the
/// read-only stack (tags 1..N, newest first).
///
/// For every byte of a query the top wins, zeroed mappings included;
/// uncontested bytes come from the merged index with their layer tags;
/// bytes no layer covers produce no mapping.
pub struct ComboIndex {
    top: Arc<RwLock<Index0>>,
    merged: Arc<Index>,
}

impl ComboIndex {
    /// Compose a live top index with a prebuilt merged stack view
    pub fn new(top: Arc<RwLock<Index0>>, merged: Arc<Index>) -> Self {
        Self { top, merged }
    }

    /// The live top index
    pub fn top(&self) -> &Arc<RwLock<Index0>> {
        &self.top
    }

    /// The merged read-only view
    pub fn merged(&self) -> &Index {
        &self.merged
    }

    /// Insert into the top index (overwrite semantics)
    pub fn insert(&self, mapping: SegmentMapping) {
        self.top.write().insert(mapping);
    }

    /// Resolve `q` across the composition: sorted, clipped to `q`,
    /// compressed only across adjacent same-layer entries.
    pub fn lookup(&self, q: Segment) -> Vec<SegmentMapping> {
        let top_hits = self.top.read().lookup(q);

        let mut out = Vec::with_capacity(top_hits.len());
        let mut pos = q.offset;
        for t in top_hits {
            if t.offset > pos {
                self.fill_gap(pos, t.offset, &mut out);
            }
            pos = t.end();
            out.push(t);
        }
        if pos < q.end() {
            self.fill_gap(pos, q.end(), &mut out);
        }

        compress_raw_index(&mut out);
        out
    }

    /// Pull mappings for an uncontested `[start, end)` hole from the
    /// merged stack, keeping their layer tags.
    fn fill_gap(&self, start: u64, end: u64, out: &mut Vec<SegmentMapping>) {
        let mut pos = start;
        while pos < end {
            let length = (end - pos).min(u32::MAX as u64) as u32;
            let hits = self.merged.lookup(Segment::new(pos, length));
            out.extend(hits.iter().copied());
            pos += length as u64;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::index::merge_memory_indexes;

    fn m(offset: u64, length: u32, moffset: u64) -> SegmentMapping {
        SegmentMapping::new(offset, length, moffset)
    }

    fn t(offset: u64, length: u32, moffset: u64, tag: u8) -> SegmentMapping {
        SegmentMapping::new(offset, length, moffset).with_tag(tag)
    }

    fn layer(entries: &[SegmentMapping]) -> Index {
        Index::from_sorted(entries.to_vec())
    }

    // the four-layer fixture: top plus up to three RO layers, newest first
    fn top() -> Vec<SegmentMapping> {
        vec![m(5, 5, 0), m(10, 10, 50), m(100, 10, 20)]
    }

    fn lower1() -> Vec<SegmentMapping> {
        vec![
            m(0, 1, 7),
            m(2, 4, 5),
            m(15, 10, 22),
            m(30, 15, 89),
            m(87, 50, 32),
            m(150, 10, 84),
        ]
    }

    fn lower2() -> Vec<SegmentMapping> {
        vec![
            m(1, 3, 134),
            m(8, 4, 873),
            m(18, 72, 320),
            m(100, 100, 4893),
            m(1000, 1000, 39823),
        ]
    }

    fn lower3() -> Vec<SegmentMapping> {
        vec![
            m(23, 10, 0),
            m(65, 10, 50),
            m(89, 10, 20),
            m(230, 43, 432),
            m(1999, 31, 2393),
        ]
    }

    fn combo_of(lowers: &[Vec<SegmentMapping>]) -> ComboIndex {
        let idxs: Vec<Index> = lowers.iter().map(|l| layer(l)).collect();
        let refs: Vec<&Index> = idxs.iter().collect();
        let merged = merge_memory_indexes(&refs);
        let top = Index0::from_mappings(top());
        ComboIndex::new(Arc::new(RwLock::new(top)), Arc::new(merged))
    }

    #[test]
    fn test_two_layers() {
        let ci = combo_of(&[lower1()]);
        let got = ci.lookup(Segment::new(0, 10000));
        let expect = vec![
            t(0, 1, 7, 1),
            t(2, 3, 5, 1),
            t(5, 5, 0, 0),
            t(10, 10, 50, 0),
            t(20, 5, 27, 1),
            t(30, 15, 89, 1),
            t(87, 13, 32, 1),
            t(100, 10, 20, 0),
            t(110, 27, 55, 1),
            t(150, 10, 84, 1),
        ];
        assert_eq!(got, expect);
    }

    #[test]
    fn test_three_layers() {
        let ci = combo_of(&[lower1(), lower2()]);
        let got = ci.lookup(Segment::new(0, 10000));
        let expect = vec![
            t(0, 1, 7, 1),
            t(1, 1, 134, 2),
            t(2, 3, 5, 1),
            t(5, 5, 0, 0),
            t(10, 10, 50, 0),
            t(20, 5, 27, 1),
            t(25, 5, 327, 2),
            t(30, 15, 89, 1),
            t(45, 42, 347, 2),
            t(87, 13, 32, 1),
            t(100, 10, 20, 0),
            t(110, 27, 55, 1),
            t(137, 13, 4930, 2),
            t(150, 10, 84, 1),
            t(160, 40, 4953, 2),
            t(1000, 1000, 39823, 2),
        ];
        assert_eq!(got, expect);
    }

    #[test]
    fn test_four_layers() {
        let ci = combo_of(&[lower1(), lower2(), lower3()]);
        let got = ci.lookup(Segment::new(0, 10000));
        let expect = vec![
            t(0, 1, 7, 1),
            t(1, 1, 134, 2),
            t(2, 3, 5, 1),
            t(5, 5, 0, 0),
            t(10, 10, 50, 0),
            t(20, 5, 27, 1),
            t(25, 5, 327, 2),
            t(30, 15, 89, 1),
            t(45, 42, 347, 2),
            t(87, 13, 32, 1),
            t(100, 10, 20, 0),
            t(110, 27, 55, 1),
            t(137, 13, 4930, 2),
            t(150, 10, 84, 1),
            t(160, 40, 4953, 2),
            t(230, 43, 432, 3),
            t(1000, 1000, 39823, 2),
            t(2000, 30, 2394, 3),
        ];
        assert_eq!(got, expect);
    }

    #[test]
    fn test_zeroed_top_shadows_lower() {
        let merged = merge_memory_indexes(&[&layer(&[m(0, 100, 500)])]);
        let top = Index0::from_mappings([SegmentMapping::zeroed(10, 10)]);
        let ci = ComboIndex::new(Arc::new(RwLock::new(top)), Arc::new(merged));
        let got = ci.lookup(Segment::new(0, 100));
        assert_eq!(
            got,
            vec![
                t(0, 10, 500, 1),
                SegmentMapping::zeroed(10, 10),
                t(20, 80, 520, 1),
            ]
        );
    }

    #[test]
    fn test_writes_show_through_live_top() {
        let ci = combo_of(&[lower1()]);
        ci.insert(m(0, 4, 777));
        let got = ci.lookup(Segment::new(0, 5));
        assert_eq!(got, vec![t(0, 4, 777, 0), t(4, 1, 7, 1)]);
    }
}
