//! Core types for StrataDisk
//!
//! All addressing in the index subsystem is in **sectors** of
//! [`crate::config::ALIGNMENT`] bytes. The file-facing APIs take byte
//! offsets, which must be sector-aligned.

use std::fmt;

/// A half-open logical range `[offset, offset + length)` in the virtual
/// volume, counted in sectors.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Segment {
    /// Logical offset in sectors
    pub offset: u64,
    /// Length in sectors; single writes stay within `MAX_LENGTH`
    pub length: u32,
}

impl Segment {
    /// Create a new segment
    pub fn new(offset: u64, length: u32) -> Self {
        Self { offset, length }
    }

    /// Exclusive end of the range, in sectors
    pub fn end(&self) -> u64 {
        self.offset + self.length as u64
    }

    /// Check whether this segment intersects `other`
    pub fn intersects(&self, other: &Segment) -> bool {
        self.offset < other.end() && other.offset < self.end()
    }
}

/// A [`Segment`] plus the physical location of its bytes inside the
/// owning layer file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SegmentMapping {
    /// Logical offset in sectors
    pub offset: u64,
    /// Length in sectors
    pub length: u32,
    /// Physical offset inside the owning layer file, in sectors.
    /// Meaningless when `zeroed`.
    pub moffset: u64,
    /// The range is semantically all-zero and occupies no storage
    pub zeroed: bool,
    /// Owning layer inside a combo view: 0 = top writable layer,
    /// 1 = newest read-only layer, older layers higher
    pub tag: u8,
}

impl SegmentMapping {
    /// Create a plain data mapping (not zeroed, tag 0).
    ///
    /// The single-write length bound is enforced where writes are
    /// split; the compress pass may fuse mappings well past it.
    pub fn new(offset: u64, length: u32, moffset: u64) -> Self {
        debug_assert!(length > 0);
        Self {
            offset,
            length,
            moffset,
            zeroed: false,
            tag: 0,
        }
    }

    /// Create a zeroed mapping: shadows older layers but stores nothing
    pub fn zeroed(offset: u64, length: u32) -> Self {
        Self {
            offset,
            length,
            moffset: 0,
            zeroed: true,
            tag: 0,
        }
    }

    /// Attach a combo-layer tag
    pub fn with_tag(mut self, tag: u8) -> Self {
        self.tag = tag;
        self
    }

    /// Exclusive end of the logical range, in sectors
    pub fn end(&self) -> u64 {
        self.offset + self.length as u64
    }

    /// The logical range of this mapping
    pub fn segment(&self) -> Segment {
        Segment::new(self.offset, self.length)
    }

    /// Clip this mapping to the query window, shifting `moffset` forward
    /// for the clipped head. Returns `None` when the intersection is empty.
    pub fn clip_to(&self, q: &Segment) -> Option<SegmentMapping> {
        let start = self.offset.max(q.offset);
        let end = self.end().min(q.end());
        if start >= end {
            return None;
        }
        let mut out = *self;
        if !self.zeroed {
            out.moffset = self.moffset + (start - self.offset);
        }
        out.offset = start;
        out.length = (end - start) as u32;
        Some(out)
    }
}

impl fmt::Display for SegmentMapping {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.zeroed {
            write!(f, "[{}, {}) -> zero (tag {})", self.offset, self.end(), self.tag)
        } else {
            write!(
                f,
                "[{}, {}) -> {} (tag {})",
                self.offset,
                self.end(),
                self.moffset,
                self.tag
            )
        }
    }
}
