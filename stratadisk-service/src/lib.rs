//! StrataDisk Service - image service surface
//!
//! Wires the core engine to its operational surroundings: JSON
//! configuration documents, registry credential resolution, logging
//! setup, and per-image assembly with result-file reporting. The
//! remote blob filesystem itself stays behind the [`BlobSource`] trait.

mod config;
mod cred;
mod error;
mod logging;
mod service;

pub use config::{
    CacheType, DownloadConfig, GlobalConfig, ImageConfig, IoEngine, LowerConfig, UpperConfig,
    MAX_LAYER_CNT,
};
pub use cred::{parse_blob_url, resolve_credential, Credential, CredentialDocument, ImageRef};
pub use error::{Result, ServiceError};
pub use logging::init_logging;
pub use service::{BlobSource, ImageFile, ImageService};
