//! StrataDisk Core - Layered Virtual Block Device Engine
//!
//! A log-structured overlay for container image data: a fixed-size
//! virtual volume is presented on top of a stack of immutable on-disk
//! layers plus one mutable top layer.
//!
//! # Architecture
//!
//! - **Segment index**: maps logical sector ranges to physical extents
//!   inside layer files, across one writable and N read-only layers
//! - **Layer files**: append-only write path, commit/seal into immutable
//!   read-only layers, multi-layer stacking and merging
//! - **Cache pool**: content-addressed disk cache of remote blobs with
//!   LRU bookkeeping and watermark eviction

pub mod cache;
pub mod index;
pub mod layer;
pub mod switch;
pub mod vfile;

mod error;
mod types;

pub use error::{Result, StrataError};
pub use types::*;

/// StrataDisk version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Default configuration values
pub mod config {
    /// Addressing quantum: one sector (512 B)
    pub const ALIGNMENT: u64 = 512;

    /// I/O size granularity required of `set_max_io_size` (4 KiB)
    pub const IO_ALIGNMENT: u64 = 4096;

    /// Maximum length of a single mapping, in sectors (16-bit)
    pub const MAX_LENGTH: u64 = u16::MAX as u64;

    /// Maximum read-only layers under one writable top
    pub const MAX_STACK_LAYERS: usize = 255;

    /// Default per-operation I/O split size (8 MiB)
    pub const DEFAULT_MAX_IO_SIZE: usize = 8 * 1024 * 1024;

    /// Default refill unit for the cache pool (256 KiB)
    pub const DEFAULT_REFILL_UNIT: usize = 256 * 1024;
}
