//! Segment index: logical-to-physical mapping across stacked layers
//!
//! Three variants share one lookup contract:
//!
//! - [`Index`]: flat, ordered, read-only — the contents of one
//!   immutable layer
//! - [`LevelIndex`]: same contract, windowed to `[lo, hi)` with a
//!   two-level bucket layout for large maps
//! - [`Index0`]: mutable, overwrite semantics — the top writable layer
//!
//! [`ComboIndex`] composes one `Index0` with a merged view of the
//! read-only stack; at every contested byte the top wins.

mod combo;
mod flat;
mod index0;
mod level;

pub use combo::ComboIndex;
pub use flat::Index;
pub use index0::Index0;
pub use level::LevelIndex;

use crate::{Segment, SegmentMapping};

/// Whether two adjacent mappings can be fused into one.
///
/// `A` and `B` must abut logically, agree on `zeroed` and `tag`, and
/// (for data mappings) abut physically as well.
fn mergeable(a: &SegmentMapping, b: &SegmentMapping) -> bool {
    a.tag == b.tag
        && a.zeroed == b.zeroed
        && a.end() == b.offset
        && (a.zeroed || a.moffset + a.length as u64 == b.moffset)
        && a.length as u64 + b.length as u64 <= u32::MAX as u64
}

/// Collapse runs of fusable mappings in place; returns the new count.
///
/// Idempotent: a second pass is a no-op.
pub fn compress_raw_index(mappings: &mut Vec<SegmentMapping>) -> usize {
    if mappings.is_empty() {
        return 0;
    }
    let mut w = 0;
    for i in 1..mappings.len() {
        let b = mappings[i];
        if mergeable(&mappings[w], &b) {
            mappings[w].length += b.length;
        } else {
            w += 1;
            mappings[w] = b;
        }
    }
    mappings.truncate(w + 1);
    mappings.len()
}

/// Predict the post-compress count without mutating the input.
pub fn compress_raw_index_predict(mappings: &[SegmentMapping]) -> usize {
    if mappings.is_empty() {
        return 0;
    }
    let mut count = 1;
    let mut acc = mappings[0];
    for b in &mappings[1..] {
        if mergeable(&acc, b) {
            acc.length += b.length;
        } else {
            count += 1;
            acc = *b;
        }
    }
    count
}

/// Merge N flat indexes into one, `indexes[0]` being the **newest**.
///
/// The newest layer covering a byte wins it. Output entries carry
/// `tag = position + 1`: tag 0 stays reserved for the top writable
/// layer when the merged view is composed inside a [`ComboIndex`].
pub fn merge_memory_indexes(indexes: &[&Index]) -> Index {
    let mut acc = ShadowAccum::new();
    for (i, idx) in indexes.iter().enumerate() {
        let tag = (i + 1) as u8;
        for m in idx.buffer() {
            acc.insert_uncovered(m.with_tag(tag));
        }
    }
    let mut out = acc.into_sorted();
    compress_raw_index(&mut out);
    Index::from_sorted(out)
}

/// Accumulator for the merge sweep: later insertions only fill the
/// gaps left by earlier (newer) layers.
struct ShadowAccum {
    map: std::collections::BTreeMap<u64, SegmentMapping>,
}

impl ShadowAccum {
    fn new() -> Self {
        Self {
            map: std::collections::BTreeMap::new(),
        }
    }

    /// Insert the parts of `m` not yet covered by resident mappings.
    fn insert_uncovered(&mut self, m: SegmentMapping) {
        let end = m.end();
        let mut covered: Vec<Segment> = Vec::new();
        if let Some((_, e)) = self.map.range(..=m.offset).next_back() {
            if e.end() > m.offset {
                covered.push(e.segment());
            }
        }
        for (_, e) in self.map.range((
            std::ops::Bound::Excluded(m.offset),
            std::ops::Bound::Excluded(end),
        )) {
            covered.push(e.segment());
        }

        let mut pos = m.offset;
        for c in &covered {
            if c.offset > pos {
                self.push_piece(&m, pos, c.offset);
            }
            pos = pos.max(c.end());
            if pos >= end {
                return;
            }
        }
        if pos < end {
            self.push_piece(&m, pos, end);
        }
    }

    fn push_piece(&mut self, m: &SegmentMapping, start: u64, end: u64) {
        if let Some(piece) = m.clip_to(&Segment::new(start, (end - start) as u32)) {
            self.map.insert(piece.offset, piece);
        }
    }

    fn into_sorted(self) -> Vec<SegmentMapping> {
        self.map.into_values().collect()
    }
}

/// Binary-search a sorted non-overlapping slice and emit the clipped
/// intersections with `q`, in order. Shared by the flat and windowed
/// index variants.
pub(crate) fn lookup_sorted(entries: &[SegmentMapping], q: Segment) -> Vec<SegmentMapping> {
    let mut out = Vec::new();
    // first mapping whose end lies past the query start; ends are
    // monotonic because entries are sorted and non-overlapping
    let start = entries.partition_point(|m| m.end() <= q.offset);
    for m in &entries[start..] {
        if m.offset >= q.end() {
            break;
        }
        if let Some(clipped) = m.clip_to(&q) {
            out.push(clipped);
        }
    }
    out
}
