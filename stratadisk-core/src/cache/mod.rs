//! Content-addressed disk cache of remotely fetched blobs
//!
//! The pool tracks every cached file (keyed by its basename, a SHA-256
//! digest upstream) in an LRU with per-entry open counts and sizes.
//! Refills grow `total_used`; a periodic timer and a synchronous
//! force-recycle path reclaim space down to the watermark by truncating
//! least-recently-used files.

mod lru;
mod pool;
mod store;

pub use pool::{CachePool, CachePoolConfig, CacheStats};
pub use store::CacheStore;

pub(crate) use lru::{Handle, Lru};

const GIB: u64 = 1024 * 1024 * 1024;

/// Never keep more than this much headroom below capacity (50 GiB)
const MAX_FREE_SPACE: u64 = 50 * GIB;

/// Risk mark sits this close below capacity on large caches (5 GiB)
const EVICTION_MARK: u64 = 5 * GIB;

/// Watermark as a percentage of capacity
const WATER_MARK_RATIO: u64 = 90;

/// Pause between evicted files, yielding to foreground I/O
const DELETE_DELAY: std::time::Duration = std::time::Duration::from_millis(1);

/// Granularity of `st_blocks` in a stat result
const DISK_BLOCK_SIZE: u64 = 512;

/// Eviction begins when `total_used` crosses this line.
fn calc_water_mark(capacity: u64) -> u64 {
    (capacity * WATER_MARK_RATIO / 100).max(capacity.saturating_sub(MAX_FREE_SPACE))
}

/// Refills that push `total_used` past this line trigger synchronous
/// reclamation on the writing thread.
fn calc_risk_mark(capacity: u64, water_mark: u64) -> u64 {
    capacity
        .saturating_sub(EVICTION_MARK)
        .max((water_mark + capacity) / 2)
}
