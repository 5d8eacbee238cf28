//! Pipeline configuration.
//!
//! All filesystem roots the pipeline touches are configuration, not
//! hard-coded paths: the scratch/download root, the per-platform ROM root,
//! the per-platform scraped-image root and the shared image-URL cache.

use std::path::PathBuf;

/// Default cap on concurrently active download jobs.
pub const DEFAULT_MAX_CONCURRENT: usize = 4;

/// Filesystem and concurrency settings for the download pipeline.
#[derive(Debug, Clone)]
pub struct PipelineConfig {
    /// Scratch root for in-flight downloads and per-job holding folders.
    pub download_dir: PathBuf,
    /// ROM storage root; games land in `{roms_dir}/{platform_id}/`.
    pub roms_dir: PathBuf,
    /// Scraped artwork root; images land in `{images_dir}/{platform_id}/`.
    pub images_dir: PathBuf,
    /// Shared cache for direct image URLs, keyed by URL hash.
    pub image_cache_dir: PathBuf,
    /// Directory checked before PATH when locating external tools
    /// (7z, chdman, ccd2cue, ecm2bin).
    pub tools_dir: Option<PathBuf>,
    /// Maximum jobs in an active state at once; the rest queue FIFO.
    pub max_concurrent_downloads: usize,
    /// Rename a single converted output to the catalog's canonical game
    /// name when the descriptor allows it. Off by default pending product
    /// clarification.
    pub rename_single_output: bool,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        let data = dirs::data_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("romdrop");
        let cache = dirs::cache_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("romdrop");

        Self {
            download_dir: data.join("downloads"),
            roms_dir: data.join("roms"),
            images_dir: data.join("images"),
            image_cache_dir: cache.join("image-cache"),
            tools_dir: None,
            max_concurrent_downloads: DEFAULT_MAX_CONCURRENT,
            rename_single_output: false,
        }
    }
}

impl PipelineConfig {
    /// Validate settings before constructing a scheduler.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.max_concurrent_downloads == 0 {
            return Err(ConfigError::ZeroConcurrency);
        }

        if let Some(dir) = &self.tools_dir {
            if !dir.is_dir() {
                return Err(ConfigError::ToolsDirNotFound(dir.clone()));
            }
        }

        Ok(())
    }

    /// Create every directory the pipeline writes into.
    pub fn ensure_dirs(&self) -> std::io::Result<()> {
        for dir in [
            &self.download_dir,
            &self.roms_dir,
            &self.images_dir,
            &self.image_cache_dir,
        ] {
            std::fs::create_dir_all(dir)?;
        }
        Ok(())
    }

    /// ROM storage directory for one platform.
    pub fn platform_rom_dir(&self, platform_id: &str) -> PathBuf {
        self.roms_dir.join(platform_id)
    }

    /// Scraped-image directory for one platform.
    pub fn platform_image_dir(&self, platform_id: &str) -> PathBuf {
        self.images_dir.join(platform_id)
    }
}

/// Configuration errors
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("max_concurrent_downloads must be at least 1")]
    ZeroConcurrency,

    #[error("tools directory not found: {0}")]
    ToolsDirNotFound(PathBuf),
}
