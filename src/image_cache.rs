//! Shared disk cache for direct image URLs.
//!
//! Cache entries are keyed by an MD5 of the source URL and normalized to
//! PNG so every consumer can assume one format. The directory is shared
//! across jobs: concurrent readers are fine and re-downloading over an
//! existing entry is harmless.

use std::path::{Path, PathBuf};
use std::time::Duration;

use reqwest::Client;
use tracing::{debug, warn};

/// Download attempts before giving up on a URL.
const MAX_RETRIES: u32 = 3;

/// Delay between retries.
const RETRY_DELAY: Duration = Duration::from_secs(2);

const PNG_MAGIC: &[u8] = &[0x89, 0x50, 0x4E, 0x47, 0x0D, 0x0A, 0x1A, 0x0A];

/// Image cache errors
#[derive(Debug, thiserror::Error)]
pub enum CacheError {
    #[error("empty image url")]
    EmptyUrl,

    #[error("image download failed after {attempts} attempts: {last_error}")]
    DownloadFailed { attempts: u32, last_error: String },

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

/// URL-keyed image cache backed by a shared directory.
pub struct ImageCache {
    cache_dir: PathBuf,
    client: Client,
}

impl ImageCache {
    pub fn new(cache_dir: impl Into<PathBuf>, client: Client) -> std::io::Result<Self> {
        let cache_dir = cache_dir.into();
        std::fs::create_dir_all(&cache_dir)?;
        Ok(Self { cache_dir, client })
    }

    /// Deterministic cache path for a URL.
    pub fn cached_path(&self, url: &str) -> PathBuf {
        self.cache_dir
            .join(format!("{:x}.png", md5::compute(url.as_bytes())))
    }

    /// Fetch a URL through the cache, returning the cached PNG path.
    ///
    /// A hit returns immediately; a miss downloads with bounded retries,
    /// normalizes the bytes to PNG and populates the cache.
    pub async fn fetch(&self, url: &str) -> Result<PathBuf, CacheError> {
        if url.is_empty() {
            return Err(CacheError::EmptyUrl);
        }

        let cached = self.cached_path(url);
        if cached.exists() {
            debug!("Image cache hit for {}", url);
            return Ok(cached);
        }

        let mut last_error = String::new();
        for attempt in 1..=MAX_RETRIES {
            match self.download_once(url).await {
                Ok(bytes) => {
                    // Stage then rename so concurrent readers never see a
                    // half-written entry.
                    let staging = staging_path(&cached);
                    tokio::fs::write(&staging, &bytes).await?;
                    tokio::fs::rename(&staging, &cached).await?;
                    debug!("Cached {} ({} bytes)", url, bytes.len());
                    return Ok(cached);
                }
                Err(e) => {
                    warn!("Image download attempt {}/{} failed for {}: {}", attempt, MAX_RETRIES, url, e);
                    last_error = e;
                }
            }
            if attempt < MAX_RETRIES {
                tokio::time::sleep(RETRY_DELAY).await;
            }
        }

        Err(CacheError::DownloadFailed {
            attempts: MAX_RETRIES,
            last_error,
        })
    }

    async fn download_once(&self, url: &str) -> Result<Vec<u8>, String> {
        let response = self
            .client
            .get(url)
            .send()
            .await
            .map_err(|e| e.to_string())?
            .error_for_status()
            .map_err(|e| e.to_string())?;

        if let Some(content_type) = response.headers().get(reqwest::header::CONTENT_TYPE) {
            let value = content_type.to_str().unwrap_or("");
            if !value.starts_with("image/") {
                return Err(format!("unexpected content type: {value}"));
            }
        }

        let bytes = response.bytes().await.map_err(|e| e.to_string())?;
        if bytes.is_empty() {
            return Err("empty response body".to_string());
        }

        normalize_to_png(&bytes)
    }
}

/// Sibling staging path for an atomic write, unique per writer.
pub(crate) fn staging_path(target: &Path) -> PathBuf {
    static SEQ: std::sync::atomic::AtomicU64 = std::sync::atomic::AtomicU64::new(0);
    let seq = SEQ.fetch_add(1, std::sync::atomic::Ordering::Relaxed);
    let name = target
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    target.with_file_name(format!("{name}.{}.{seq}.part", std::process::id()))
}

/// Re-encode image bytes as PNG unless they already are one.
fn normalize_to_png(bytes: &[u8]) -> Result<Vec<u8>, String> {
    if bytes.starts_with(PNG_MAGIC) {
        return Ok(bytes.to_vec());
    }

    let img = image::load_from_memory(bytes).map_err(|e| format!("decode failed: {e}"))?;
    let mut out = Vec::new();
    img.write_to(&mut std::io::Cursor::new(&mut out), image::ImageFormat::Png)
        .map_err(|e| format!("png encode failed: {e}"))?;
    Ok(out)
}
