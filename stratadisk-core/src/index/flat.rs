//! Flat ordered read-only index: the contents of one immutable layer

use super::lookup_sorted;
use crate::{Result, Segment, SegmentMapping, StrataError};

/// Ordered, non-overlapping, read-only sequence of mappings.
#[derive(Debug, Clone, Default)]
pub struct Index {
    entries: Vec<SegmentMapping>,
}

impl Index {
    /// Build from entries already sorted by `offset` and non-overlapping.
    ///
    /// This is the form produced by [`super::Index0::dump`], the merge
    /// sweep, and the on-disk index table.
    pub fn from_sorted(entries: Vec<SegmentMapping>) -> Self {
        debug_assert!(entries.windows(2).all(|w| w[0].end() <= w[1].offset));
        Self { entries }
    }

    /// Build from unordered mappings, verifying non-overlap.
    pub fn from_unsorted(mut entries: Vec<SegmentMapping>) -> Result<Self> {
        entries.sort_by_key(|m| m.offset);
        for w in entries.windows(2) {
            if w[0].end() > w[1].offset {
                return Err(StrataError::Format(format!(
                    "overlapping mappings: {} and {}",
                    w[0], w[1]
                )));
            }
        }
        Ok(Self { entries })
    }

    /// Number of mappings
    pub fn size(&self) -> usize {
        self.entries.len()
    }

    /// Whether the index holds no mappings
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Direct slice access to the sorted mappings
    pub fn buffer(&self) -> &[SegmentMapping] {
        &self.entries
    }

    /// First mapping, if any
    pub fn front(&self) -> Option<&SegmentMapping> {
        self.entries.first()
    }

    /// Last mapping, if any
    pub fn back(&self) -> Option<&SegmentMapping> {
        self.entries.last()
    }

    /// First mapping with `offset >= pos`
    pub fn lower_bound(&self, pos: u64) -> Option<&SegmentMapping> {
        let i = self.entries.partition_point(|m| m.offset < pos);
        self.entries.get(i)
    }

    /// Sum of `length` over non-zeroed mappings, in sectors
    pub fn block_count(&self) -> u64 {
        self.entries
            .iter()
            .filter(|m| !m.zeroed)
            .map(|m| m.length as u64)
            .sum()
    }

    /// Return the parts of the index intersecting `q`, clipped to its
    /// bounds. Emissions are never merged here.
    pub fn lookup(&self, q: Segment) -> Vec<SegmentMapping> {
        lookup_sorted(&self.entries, q)
    }
}
