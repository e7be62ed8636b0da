//! Configuration documents
//!
//! Two JSON documents drive the service: the global configuration
//! (cache location and size, logging, credentials) and a per-image
//! configuration naming the layer stack. Field names follow the
//! documents' camelCase keys.

use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::{Result, ServiceError};

/// Upper bound on stacked lower layers per image
pub const MAX_LAYER_CNT: usize = 256;

/// Local cache flavor
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CacheType {
    /// One cache file per blob
    File,
    /// Block-oriented cache over a preallocated media file
    Ocf,
}

/// Kernel I/O submission flavor
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IoEngine {
    Psync,
    Libaio,
    IoUring,
}

impl TryFrom<u32> for IoEngine {
    type Error = ServiceError;

    fn try_from(value: u32) -> Result<Self> {
        match value {
            0 => Ok(IoEngine::Psync),
            1 => Ok(IoEngine::Libaio),
            2 => Ok(IoEngine::IoUring),
            other => Err(ServiceError::Config(format!(
                "unknown ioEngine: {}",
                other
            ))),
        }
    }
}

/// Background download policy for image layers
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct DownloadConfig {
    pub enable: bool,
    pub delay: u32,
    pub delay_extra: u32,
    #[serde(rename = "maxMBps")]
    pub max_mbps: u32,
    pub try_cnt: u32,
}

impl Default for DownloadConfig {
    fn default() -> Self {
        Self {
            enable: false,
            delay: 300,
            delay_extra: 30,
            max_mbps: 100,
            try_cnt: 5,
        }
    }
}

/// Process-wide configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct GlobalConfig {
    pub registry_cache_dir: String,
    #[serde(rename = "registryCacheSizeGB")]
    pub registry_cache_size_gb: u64,
    pub cache_type: CacheType,
    pub io_engine: u32,
    pub credential_file_path: String,
    pub log_path: String,
    pub log_level: u32,
    pub enable_audit: bool,
    pub audit_path: String,
    pub download: DownloadConfig,
}

impl Default for GlobalConfig {
    fn default() -> Self {
        Self {
            registry_cache_dir: "/opt/stratadisk/registry_cache".into(),
            registry_cache_size_gb: 4,
            cache_type: CacheType::File,
            io_engine: 0,
            credential_file_path: "/opt/stratadisk/cred.json".into(),
            log_path: "/var/log/stratadisk.log".into(),
            log_level: 1,
            enable_audit: true,
            audit_path: "/var/log/stratadisk-audit.log".into(),
            download: DownloadConfig::default(),
        }
    }
}

impl GlobalConfig {
    /// Load and validate from a JSON file; failures are fatal at init.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let text = std::fs::read_to_string(path.as_ref()).map_err(|e| {
            ServiceError::Config(format!(
                "cannot read global config {:?}: {}",
                path.as_ref(),
                e
            ))
        })?;
        let config: GlobalConfig = serde_json::from_str(&text)?;
        config.validate()?;
        Ok(config)
    }

    /// Reject values no component can honor.
    pub fn validate(&self) -> Result<()> {
        IoEngine::try_from(self.io_engine)?;
        if self.registry_cache_size_gb == 0 {
            return Err(ServiceError::Config(
                "registryCacheSizeGB must be positive".into(),
            ));
        }
        Ok(())
    }

    /// The validated I/O engine
    pub fn io_engine(&self) -> IoEngine {
        IoEngine::try_from(self.io_engine).expect("validated at load")
    }
}

/// One lower (read-only) layer of an image
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct LowerConfig {
    pub file: String,
    pub dir: String,
    pub digest: String,
    pub size: u64,
}

impl LowerConfig {
    /// Local path of this layer, when materialized on disk
    pub fn local_path(&self) -> Option<std::path::PathBuf> {
        if !self.file.is_empty() {
            Some(self.file.clone().into())
        } else if !self.dir.is_empty() {
            Some(Path::new(&self.dir).join("layer.strata"))
        } else {
            None
        }
    }
}

/// The writable top layer's backing files
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct UpperConfig {
    pub index: String,
    pub data: String,
}

/// Per-image configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ImageConfig {
    pub repo_blob_url: String,
    pub lowers: Vec<LowerConfig>,
    pub upper: UpperConfig,
    pub result_file: String,
    pub download: Option<DownloadConfig>,
    pub acceleration_layer: bool,
    pub record_trace_path: String,
}

impl ImageConfig {
    /// Load from a JSON file. A missing `download` section inherits the
    /// global one.
    pub fn load(path: impl AsRef<Path>, global: &GlobalConfig) -> Result<Self> {
        let text = std::fs::read_to_string(path.as_ref()).map_err(|e| {
            ServiceError::Config(format!(
                "cannot read image config {:?}: {}",
                path.as_ref(),
                e
            ))
        })?;
        let mut config: ImageConfig = serde_json::from_str(&text)?;
        if config.download.is_none() {
            config.download = Some(global.download.clone());
        }
        config.validate()?;
        Ok(config)
    }

    /// Reject stacks the engine cannot compose.
    pub fn validate(&self) -> Result<()> {
        if self.lowers.is_empty() {
            return Err(ServiceError::Config("image has no lower layers".into()));
        }
        if self.lowers.len() > MAX_LAYER_CNT {
            return Err(ServiceError::Config(format!(
                "too many lower layers: {} (max {})",
                self.lowers.len(),
                MAX_LAYER_CNT
            )));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = GlobalConfig::default();
        assert_eq!(config.registry_cache_size_gb, 4);
        assert_eq!(config.cache_type, CacheType::File);
        assert_eq!(config.io_engine(), IoEngine::Psync);
        assert!(config.enable_audit);
    }

    #[test]
    fn test_parse_document_keys() {
        let config: GlobalConfig = serde_json::from_str(
            r#"{
                "registryCacheDir": "/tmp/cache",
                "registryCacheSizeGB": 10,
                "cacheType": "ocf",
                "ioEngine": 2,
                "logLevel": 2,
                "enableAudit": false
            }"#,
        )
        .unwrap();
        assert_eq!(config.registry_cache_dir, "/tmp/cache");
        assert_eq!(config.registry_cache_size_gb, 10);
        assert_eq!(config.cache_type, CacheType::Ocf);
        assert_eq!(config.io_engine(), IoEngine::IoUring);
        assert!(!config.enable_audit);
        // untouched keys keep their defaults
        assert_eq!(config.log_path, "/var/log/stratadisk.log");
    }

    #[test]
    fn test_unknown_cache_type_rejected() {
        let parsed: std::result::Result<GlobalConfig, _> =
            serde_json::from_str(r#"{"cacheType": "ramdisk"}"#);
        assert!(parsed.is_err());
    }

    #[test]
    fn test_io_engine_range() {
        let config = GlobalConfig {
            io_engine: 3,
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_image_config_limits() {
        let mut config = ImageConfig {
            lowers: vec![LowerConfig::default(); 2],
            ..Default::default()
        };
        assert!(config.validate().is_ok());

        config.lowers = vec![LowerConfig::default(); MAX_LAYER_CNT + 1];
        assert!(config.validate().is_err());

        config.lowers.clear();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_image_download_inherits_global() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("image.json");
        std::fs::write(
            &path,
            r#"{"repoBlobUrl": "https://r.example.com/v2/ns/app/blobs",
                "lowers": [{"digest": "sha256:aa", "size": 1}]}"#,
        )
        .unwrap();

        let global = GlobalConfig {
            download: DownloadConfig {
                enable: true,
                ..Default::default()
            },
            ..Default::default()
        };
        let image = ImageConfig::load(&path, &global).unwrap();
        assert!(image.download.unwrap().enable);
    }
}
