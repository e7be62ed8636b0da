//! The image service: per-image assembly and result reporting

use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

use tracing::{error, info, warn};

use stratadisk_core::cache::{CachePool, CachePoolConfig};
use stratadisk_core::layer::{
    open_files_ro, stack_files, LayerInfo, RoStack, RwLayer, StackedFile,
};
use stratadisk_core::switch::{SourceOpener, SwitchFile};
use stratadisk_core::vfile::SectorFile;

use crate::{
    init_logging, resolve_credential, CacheType, Credential, CredentialDocument, GlobalConfig,
    ImageConfig, Result, ServiceError,
};

/// The remote blob filesystem, specified only at its seam: open one
/// blob by digest for positioned reads. The HTTPS registry client, TLS
/// setup and codecs live behind this trait.
pub trait BlobSource: Send + Sync {
    fn open_blob(&self, digest: &str, size: u64) -> stratadisk_core::Result<Box<dyn SectorFile>>;
}

/// One assembled image: a writable top stacked over its lower layers.
pub struct ImageFile {
    file: StackedFile,
}

impl ImageFile {
    /// The composed virtual volume
    pub fn file(&self) -> &StackedFile {
        &self.file
    }

    pub fn pread(&self, buf: &mut [u8], offset: u64) -> stratadisk_core::Result<usize> {
        self.file.pread(buf, offset)
    }

    pub fn pwrite(&self, buf: &[u8], offset: u64) -> stratadisk_core::Result<usize> {
        self.file.pwrite(buf, offset)
    }

    pub fn fsync(&self) -> stratadisk_core::Result<()> {
        self.file.fsync()
    }
}

/// Process-wide service state: configuration, the cache pool, and the
/// credential callback handed to the remote filesystem.
pub struct ImageService {
    config: GlobalConfig,
    cache: CachePool,
}

impl ImageService {
    /// Initialize from a validated global configuration. Failures here
    /// are fatal: logging, cache directory and cache pool must all come
    /// up.
    pub fn init(config: GlobalConfig) -> Result<ImageService> {
        config.validate()?;
        init_logging(&config)?;

        fs::create_dir_all(&config.registry_cache_dir).map_err(|e| {
            ServiceError::Config(format!(
                "cannot create cache dir {}: {}",
                config.registry_cache_dir, e
            ))
        })?;

        if config.cache_type == CacheType::Ocf {
            // block-oriented cache: namespace directory plus a media
            // file preallocated to the configured capacity
            let namespace = Path::new(&config.registry_cache_dir).join("namespace");
            fs::create_dir_all(&namespace)?;
            let media_path = Path::new(&config.registry_cache_dir).join("cache_media");
            if !media_path.exists() {
                let media = fs::OpenOptions::new()
                    .read(true)
                    .write(true)
                    .create(true)
                    .truncate(false)
                    .open(&media_path)?;
                media.set_len(config.registry_cache_size_gb * (1 << 30))?;
            }
        }

        let cache = CachePool::open(
            &config.registry_cache_dir,
            CachePoolConfig::with_capacity_gb(config.registry_cache_size_gb),
        )?;

        info!(
            "image service up: cache dir {}, capacity {} GB, type {:?}",
            config.registry_cache_dir, config.registry_cache_size_gb, config.cache_type
        );
        Ok(ImageService { config, cache })
    }

    /// The cache pool
    pub fn cache(&self) -> &CachePool {
        &self.cache
    }

    /// The global configuration
    pub fn config(&self) -> &GlobalConfig {
        &self.config
    }

    /// Credential callback for the remote filesystem: reload the
    /// document on every challenge so rotated credentials take effect
    /// without a restart. Lookup failure is a valid empty answer.
    pub fn reload_auth(&self, remote_path: &str) -> Credential {
        let doc = match CredentialDocument::load(&self.config.credential_file_path) {
            Ok(doc) => doc,
            Err(e) => {
                warn!(
                    "cannot load credential document {}: {}",
                    self.config.credential_file_path, e
                );
                return Credential::default();
            }
        };
        match resolve_credential(&doc, remote_path) {
            Ok(cred) => {
                if !cred.is_empty() {
                    info!("auth found for {}: {}", remote_path, cred.username);
                }
                cred
            }
            Err(e) => {
                warn!("credential resolution failed for {}: {}", remote_path, e);
                Credential::default()
            }
        }
    }

    /// Assemble an image per its configuration. On failure the reason
    /// lands in the result file and `None` is returned; on success the
    /// result file reads `success`.
    pub fn create_image_file(
        &self,
        image: &ImageConfig,
        source: &dyn BlobSource,
    ) -> Option<ImageFile> {
        match self.build_image(image, source) {
            Ok(file) => {
                self.set_result_file(&image.result_file, "success");
                Some(file)
            }
            Err(e) => {
                error!("create image failed: {}", e);
                self.set_result_file(&image.result_file, &format!("failed:{}", e));
                None
            }
        }
    }

    fn build_image(&self, image: &ImageConfig, source: &dyn BlobSource) -> Result<ImageFile> {
        image.validate()?;

        let mut files: Vec<Box<dyn SectorFile>> = Vec::with_capacity(image.lowers.len());
        for lower in &image.lowers {
            files.push(self.open_lower(lower, source)?);
        }
        let stack = open_files_ro(files)?;

        let upper = self.open_upper(image, &stack)?;
        let file = stack_files(upper, stack)?;
        Ok(ImageFile { file })
    }

    /// Open one lower layer: a local file when materialized, otherwise
    /// the remote blob behind a switch wrapper so a finished download
    /// can take over without remounting.
    fn open_lower(
        &self,
        lower: &crate::LowerConfig,
        source: &dyn BlobSource,
    ) -> Result<Box<dyn SectorFile>> {
        if let Some(path) = lower.local_path() {
            if path.exists() {
                let file = fs::OpenOptions::new().read(true).open(&path)?;
                return Ok(Box::new(file));
            }
        }
        if lower.digest.is_empty() {
            return Err(ServiceError::Config(
                "lower layer has neither a local file nor a digest".into(),
            ));
        }
        let remote = source.open_blob(&lower.digest, lower.size)?;
        Ok(Box::new(SwitchFile::new(remote, false, local_opener())))
    }

    /// Open or create the writable top from the configured paths; the
    /// virtual size comes from the stack below.
    fn open_upper(&self, image: &ImageConfig, stack: &RoStack) -> Result<RwLayer> {
        if image.upper.data.is_empty() || image.upper.index.is_empty() {
            return Err(ServiceError::Config(
                "image has no writable upper configured".into(),
            ));
        }
        let data_path = PathBuf::from(&image.upper.data);
        let index_path = PathBuf::from(&image.upper.index);

        let reopen = index_path.exists()
            && fs::metadata(&index_path).map(|m| m.len() > 0).unwrap_or(false);

        let open = |path: &Path| -> Result<Box<dyn SectorFile>> {
            Ok(Box::new(
                fs::OpenOptions::new()
                    .read(true)
                    .write(true)
                    .create(true)
                    .truncate(false)
                    .open(path)?,
            ))
        };

        let layer = if reopen {
            RwLayer::open(open(&data_path)?, open(&index_path)?)?
        } else {
            RwLayer::create(
                open(&data_path)?,
                Some(open(&index_path)?),
                LayerInfo::new(stack.vsize()),
            )?
        };
        Ok(layer)
    }

    /// Write the per-image result file atomically: the content lands
    /// under a temporary name and is renamed into place.
    fn set_result_file(&self, path: &str, data: &str) {
        if path.is_empty() {
            warn!("no resultFile configured, ignoring result write");
            return;
        }
        let target = Path::new(path);
        let dir = target.parent().unwrap_or_else(|| Path::new("."));
        let write = || -> Result<()> {
            let mut tmp = tempfile::NamedTempFile::new_in(dir)?;
            tmp.write_all(data.as_bytes())?;
            tmp.persist(target)
                .map_err(|e| ServiceError::Io(e.error))?;
            Ok(())
        };
        if let Err(e) = write() {
            error!("cannot write result file {}: {}", path, e);
        }
    }
}

/// Default opener used when a switch target is nominated: plain local
/// file. Hosts layering tar or compression codecs substitute their own.
fn local_opener() -> SourceOpener {
    Box::new(|path| {
        let file = fs::OpenOptions::new().read(true).open(path)?;
        Ok(Box::new(file) as Box<dyn SectorFile>)
    })
}
