//! Mutable index for the top writable layer, with overwrite semantics

use std::collections::BTreeMap;
use std::ops::Bound;

use super::compress_raw_index;
use crate::index::Index;
use crate::{Segment, SegmentMapping};

/// Ordered set of non-overlapping mappings for the top writable layer.
///
/// `insert` has overwrite semantics: a new mapping logically replaces
/// any previously present bytes in its range. Resident mappings always
/// carry tag 0.
#[derive(Debug, Default)]
pub struct Index0 {
    map: BTreeMap<u64, SegmentMapping>,
    /// Sum of `length` over non-zeroed entries, maintained incrementally
    block_count: u64,
}

impl Index0 {
    /// Create an empty index
    pub fn new() -> Self {
        Self::default()
    }

    /// Create from mappings inserted in order, applying overwrite
    /// semantics (used when replaying an index log).
    pub fn from_mappings<I: IntoIterator<Item = SegmentMapping>>(mappings: I) -> Self {
        let mut idx = Self::new();
        for m in mappings {
            idx.insert(m);
        }
        idx
    }

    /// Number of resident mappings
    pub fn size(&self) -> usize {
        self.map.len()
    }

    /// Whether the index holds no mappings
    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }

    /// Sum of `length` over non-zeroed entries, in sectors
    pub fn block_count(&self) -> u64 {
        self.block_count
    }

    /// First mapping, if any
    pub fn front(&self) -> Option<&SegmentMapping> {
        self.map.values().next()
    }

    /// Last mapping, if any
    pub fn back(&self) -> Option<&SegmentMapping> {
        self.map.values().next_back()
    }

    /// First mapping with `offset >= pos`
    pub fn lower_bound(&self, pos: u64) -> Option<&SegmentMapping> {
        self.map.range(pos..).next().map(|(_, m)| m)
    }

    /// Insert with overwrite: fully-covered residents are removed,
    /// partially-covered ones keep their non-overlapping prefix and/or
    /// suffix (suffix `moffset` advanced for data mappings).
    ///
    /// O(log n + k) for k affected residents.
    pub fn insert(&mut self, new: SegmentMapping) {
        debug_assert!(new.length > 0);
        let mut new = new;
        new.tag = 0;
        let nend = new.end();

        let mut affected: Vec<u64> = Vec::new();
        if let Some((&k, e)) = self.map.range(..=new.offset).next_back() {
            if e.end() > new.offset {
                affected.push(k);
            }
        }
        for (&k, _) in self
            .map
            .range((Bound::Excluded(new.offset), Bound::Excluded(nend)))
        {
            affected.push(k);
        }

        for k in affected {
            let e = self.map.remove(&k).expect("affected key present");
            if !e.zeroed {
                self.block_count -= e.length as u64;
            }
            if e.offset < new.offset {
                // retained prefix
                let mut p = e;
                p.length = (new.offset - e.offset) as u32;
                if !p.zeroed {
                    self.block_count += p.length as u64;
                }
                self.map.insert(p.offset, p);
            }
            if e.end() > nend {
                // retained suffix
                let mut s = e;
                s.offset = nend;
                s.length = (e.end() - nend) as u32;
                if !s.zeroed {
                    s.moffset = e.moffset + (nend - e.offset);
                }
                if !s.zeroed {
                    self.block_count += s.length as u64;
                }
                self.map.insert(s.offset, s);
            }
        }

        if !new.zeroed {
            self.block_count += new.length as u64;
        }
        self.map.insert(new.offset, new);
    }

    /// Return the parts of the index intersecting `q`, clipped to its
    /// bounds, sorted by `offset`.
    pub fn lookup(&self, q: Segment) -> Vec<SegmentMapping> {
        if q.length == 0 {
            return Vec::new();
        }
        let mut out = Vec::new();
        if let Some((_, e)) = self.map.range(..=q.offset).next_back() {
            if let Some(clipped) = e.clip_to(&q) {
                out.push(clipped);
            }
        }
        for (_, e) in self
            .map
            .range((Bound::Excluded(q.offset), Bound::Excluded(q.end())))
        {
            if let Some(clipped) = e.clip_to(&q) {
                out.push(clipped);
            }
        }
        out
    }

    /// Flat sorted copy of the resident mappings
    pub fn dump(&self) -> Vec<SegmentMapping> {
        self.map.values().copied().collect()
    }

    /// Produce a read-only [`Index`] of the current contents, with the
    /// compress pass applied.
    pub fn to_index(&self) -> Index {
        let mut v = self.dump();
        compress_raw_index(&mut v);
        Index::from_sorted(v)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn m(offset: u64, length: u32, moffset: u64) -> SegmentMapping {
        SegmentMapping::new(offset, length, moffset)
    }

    #[test]
    fn test_insert_overwrite() {
        let idx = Index0::from_mappings([
            m(0, 20, 0),
            m(10, 15, 50),
            m(30, 100, 20),
            m(5, 10, 3),
            m(40, 10, 123),
            m(200, 10, 2133),
            m(150, 100, 21),
        ]);

        let dump = idx.dump();
        let expect = vec![
            m(0, 5, 0),
            m(5, 10, 3),
            m(15, 10, 55),
            m(30, 10, 20),
            m(40, 10, 123),
            m(50, 80, 40),
            m(150, 100, 21),
        ];
        assert_eq!(dump, expect);

        // non-overlap invariant
        for w in dump.windows(2) {
            assert!(w[0].end() <= w[1].offset);
        }

        // incremental block count agrees with a recount
        let check: u64 = dump
            .iter()
            .filter(|s| !s.zeroed)
            .map(|s| s.length as u64)
            .sum();
        assert_eq!(check, idx.block_count());
    }

    #[test]
    fn test_insert_exact_replacement() {
        let mut idx = Index0::new();
        idx.insert(m(10, 10, 0));
        idx.insert(m(10, 10, 99));
        assert_eq!(idx.dump(), vec![m(10, 10, 99)]);
        assert_eq!(idx.block_count(), 10);
    }

    #[test]
    fn test_zeroed_overwrites_and_counts_nothing() {
        let mut idx = Index0::new();
        idx.insert(m(0, 30, 7));
        idx.insert(SegmentMapping::zeroed(10, 10));
        assert_eq!(
            idx.dump(),
            vec![m(0, 10, 7), SegmentMapping::zeroed(10, 10), m(20, 10, 27)]
        );
        assert_eq!(idx.block_count(), 20);
    }

    #[test]
    fn test_lookup_clips() {
        let idx = Index0::from_mappings([m(0, 10, 0), m(10, 10, 50), m(100, 10, 20)]);
        assert_eq!(
            idx.lookup(Segment::new(5, 10)),
            vec![m(5, 5, 5), m(10, 5, 50)]
        );
        assert_eq!(idx.lookup(Segment::new(26, 10)), vec![]);
    }

    #[test]
    fn test_bounds_and_lower_bound() {
        let idx = Index0::from_mappings([m(5, 5, 0), m(100, 10, 20)]);
        assert_eq!(idx.front().unwrap().offset, 5);
        assert_eq!(idx.back().unwrap().offset, 100);
        assert_eq!(idx.lower_bound(6).unwrap().offset, 100);
        assert!(idx.lower_bound(101).is_none());
    }

    #[test]
    fn test_randomized_against_byte_oracle() {
        use rand::{Rng, SeedableRng};
        let mut rng = rand::rngs::StdRng::seed_from_u64(154574045);

        const SPAN: usize = 1 << 16;
        let mut oracle = vec![0u64; SPAN]; // 0 = hole, else moffset + 1
        let mut idx = Index0::new();

        for i in 0..2000 {
            let offset = rng.gen_range(0..SPAN as u64 - 64);
            let length = rng.gen_range(1..=64u32);
            let moffset = (i * 1000) as u64 + 1;
            idx.insert(m(offset, length, moffset - 1));
            for j in 0..length as u64 {
                oracle[(offset + j) as usize] = moffset + j;
            }
        }

        // lookup faithfulness: concatenated lookup output equals the
        // naive per-sector scan
        for _ in 0..500 {
            let offset = rng.gen_range(0..SPAN as u64 - 64);
            let length = rng.gen_range(1..=64u32);
            let q = Segment::new(offset, length);
            let mut got = vec![0u64; length as usize];
            for mp in idx.lookup(q) {
                for j in 0..mp.length as u64 {
                    got[(mp.offset - offset + j) as usize] = mp.moffset + j + 1;
                }
            }
            for j in 0..length as u64 {
                assert_eq!(got[j as usize], oracle[(offset + j) as usize]);
            }
        }

        // invariants after a long insert run
        let dump = idx.dump();
        for w in dump.windows(2) {
            assert!(w[0].end() <= w[1].offset);
        }
        let check: u64 = dump.iter().map(|s| s.length as u64).sum();
        assert_eq!(check, idx.block_count());
    }
}
