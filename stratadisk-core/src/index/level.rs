//! Windowed index with a two-level bucket layout
//!
//! Same lookup contract as [`Index`], restricted to a `[lo, hi)` logical
//! window. A top level samples the maximum end of every bucket so a
//! lookup touches one bucket instead of bisecting the whole map; on the
//! multi-million-entry indexes of large images this keeps the search in
//! cache-resident memory.

use super::lookup_sorted;
use crate::index::Index;
use crate::{Segment, SegmentMapping};

const BUCKET: usize = 128;

/// Flat index scoped to a `[lo, hi)` window of the virtual volume.
#[derive(Debug, Clone)]
pub struct LevelIndex {
    /// Maximum mapping end per bucket; monotonic
    tops: Vec<u64>,
    entries: Vec<SegmentMapping>,
    lo: u64,
    hi: u64,
}

impl LevelIndex {
    /// Build from sorted non-overlapping entries, keeping only the parts
    /// inside `[lo, hi)` (entries straddling the bounds are clipped).
    pub fn new(entries: &[SegmentMapping], lo: u64, hi: u64) -> Self {
        debug_assert!(lo < hi);
        // a mapping never exceeds u32 sectors, so clipping against its
        // own intersection with the window always fits a Segment
        let clipped: Vec<SegmentMapping> = entries
            .iter()
            .filter_map(|m| {
                let start = m.offset.max(lo);
                let end = m.end().min(hi);
                if start >= end {
                    return None;
                }
                m.clip_to(&Segment::new(start, (end - start) as u32))
            })
            .collect();
        let tops = clipped
            .chunks(BUCKET)
            .map(|c| c.last().map(|m| m.end()).unwrap_or(0))
            .collect();
        Self {
            tops,
            entries: clipped,
            lo,
            hi,
        }
    }

    /// Build over the whole volume
    pub fn from_index(index: &Index) -> Self {
        Self::new(index.buffer(), 0, u64::MAX)
    }

    /// The `[lo, hi)` window this index serves
    pub fn window(&self) -> (u64, u64) {
        (self.lo, self.hi)
    }

    /// Number of mappings inside the window
    pub fn size(&self) -> usize {
        self.entries.len()
    }

    /// Direct slice access to the sorted mappings
    pub fn buffer(&self) -> &[SegmentMapping] {
        &self.entries
    }

    /// Sum of `length` over non-zeroed mappings, in sectors
    pub fn block_count(&self) -> u64 {
        self.entries
            .iter()
            .filter(|m| !m.zeroed)
            .map(|m| m.length as u64)
            .sum()
    }

    /// Same contract as [`Index::lookup`]; queries outside the window
    /// return nothing.
    pub fn lookup(&self, q: Segment) -> Vec<SegmentMapping> {
        let start = q.offset.max(self.lo);
        let end = q.end().min(self.hi);
        if start >= end {
            return Vec::new();
        }
        let q = Segment::new(start, (end - start).min(u32::MAX as u64) as u32);

        // locate the first interesting bucket via the top level, then
        // search only from its start
        let b = self.tops.partition_point(|&top| top <= q.offset);
        let from = b * BUCKET;
        if from >= self.entries.len() {
            return Vec::new();
        }
        lookup_sorted(&self.entries[from..], q)
    }
}
