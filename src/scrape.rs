//! Cover-art scraping.
//!
//! Resolution order for a freshly installed ROM: remote metadata lookup by
//! content hash, then by cleaned file name, then the catalog's direct
//! image URL through the shared image cache. Artwork is cosmetic, so every
//! remote failure quietly degrades to the next tier; only a cache-fallback
//! failure surfaces as an error.

use std::fmt;
use std::io::Read;
use std::path::Path;

use once_cell::sync::Lazy;
use regex::Regex;
use reqwest::Client;
use serde::Deserialize;
use tracing::{debug, warn};

use crate::config::PipelineConfig;
use crate::image_cache::{staging_path, CacheError, ImageCache};
use crate::platforms;

/// Noise tokens stripped from ROM names before a name lookup.
const NAME_NOISE: &[&str] = &["nkit", "!", "&", "Disc ", "Rev ", "Rom"];

static PAREN_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"\([^)]*\)").unwrap());
static BRACKET_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"\[[^\]]*\]").unwrap());

/// Where a scraped image came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScrapeOutcome {
    /// Target image already existed; nothing done.
    AlreadyScraped,
    /// Resolved through the remote metadata service.
    Scraper,
    /// Resolved through the cached direct image URL.
    Cache,
}

impl fmt::Display for ScrapeOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ScrapeOutcome::AlreadyScraped => write!(f, "already scraped"),
            ScrapeOutcome::Scraper => write!(f, "scraped from remote service"),
            ScrapeOutcome::Cache => write!(f, "scraped from cache fallback"),
        }
    }
}

/// Scrape errors. Remote lookup failures never appear here; they degrade
/// to the cache fallback instead.
#[derive(Debug, thiserror::Error)]
pub enum ScrapeError {
    #[error("no fallback image url for this game")]
    NoFallbackUrl,

    #[error("cache fallback failed: {0}")]
    Cache(#[from] CacheError),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

/// Remote metadata service settings.
#[derive(Debug, Clone)]
pub struct ScraperConfig {
    pub api_base: String,
    pub dev_id: String,
    pub dev_password: String,
    pub user: String,
    pub password: String,
    pub software_name: String,
    /// Media type requested from the service.
    pub media_type: String,
}

impl Default for ScraperConfig {
    fn default() -> Self {
        Self {
            api_base: "https://www.screenscraper.fr/api2".to_string(),
            dev_id: String::new(),
            dev_password: String::new(),
            user: String::new(),
            password: String::new(),
            software_name: "romdrop".to_string(),
            media_type: "box-2D".to_string(),
        }
    }
}

#[derive(Debug, Deserialize)]
struct ApiEnvelope {
    response: Option<ApiResponse>,
}

#[derive(Debug, Deserialize)]
struct ApiResponse {
    jeu: Option<ApiGame>,
}

#[derive(Debug, Deserialize)]
struct ApiGame {
    #[serde(default)]
    medias: Vec<ApiMedia>,
}

#[derive(Debug, Deserialize)]
struct ApiMedia {
    #[serde(rename = "type")]
    kind: String,
    url: String,
}

/// Box-art resolver for installed ROMs.
pub struct Scraper {
    config: ScraperConfig,
    client: Client,
    cache: ImageCache,
    pipeline: PipelineConfig,
}

impl Scraper {
    pub fn new(
        config: ScraperConfig,
        pipeline: &PipelineConfig,
        client: Client,
        cache: ImageCache,
    ) -> Self {
        Self {
            config,
            client,
            cache,
            pipeline: pipeline.clone(),
        }
    }

    /// Resolve box-art for one installed file.
    ///
    /// Never fails for remote reasons; only the cache fallback itself can
    /// return an error.
    pub async fn scrape(
        &self,
        fallback_image_url: Option<&str>,
        file_name: &str,
        platform_id: &str,
    ) -> Result<ScrapeOutcome, ScrapeError> {
        let stem = Path::new(file_name)
            .file_stem()
            .map(|s| s.to_string_lossy().into_owned())
            .unwrap_or_else(|| file_name.to_string());

        let target = self
            .pipeline
            .platform_image_dir(platform_id)
            .join(format!("{stem}.png"));
        if target.exists() {
            return Ok(ScrapeOutcome::AlreadyScraped);
        }

        if let Some(parent) = target.parent() {
            std::fs::create_dir_all(parent)?;
        }

        if let Some(media_url) = self.remote_media_url(file_name, &stem, platform_id).await {
            match self.download_media(&media_url, &target).await {
                Ok(()) => return Ok(ScrapeOutcome::Scraper),
                Err(e) => warn!("Media download failed for {}: {}", file_name, e),
            }
        }

        let fallback = fallback_image_url
            .filter(|url| !url.is_empty())
            .ok_or(ScrapeError::NoFallbackUrl)?;
        let cached = self.cache.fetch(fallback).await?;
        // Stage then rename so the already-scraped check never sees a
        // partial copy.
        let staging = staging_path(&target);
        std::fs::copy(&cached, &staging)?;
        std::fs::rename(&staging, &target)?;
        Ok(ScrapeOutcome::Cache)
    }

    /// Hash lookup first, then name lookup. `None` means every remote
    /// tier came up empty or failed.
    async fn remote_media_url(
        &self,
        file_name: &str,
        stem: &str,
        platform_id: &str,
    ) -> Option<String> {
        let system_id = platforms::system_id(platform_id)?;

        let rom_path = self.pipeline.platform_rom_dir(platform_id).join(file_name);
        if rom_path.is_file() {
            match md5_file(&rom_path) {
                Ok(hash) => {
                    if let Some(url) = self.query_api(system_id, &format!("md5={hash}")).await {
                        debug!("Hash lookup hit for {}", file_name);
                        return Some(url);
                    }
                }
                Err(e) => debug!("Could not hash {}: {}", rom_path.display(), e),
            }
        }

        let cleaned = clean_rom_name(stem);
        if let Some(url) = self
            .query_api(system_id, &format!("romnom={cleaned}.zip"))
            .await
        {
            debug!("Name lookup hit for {}", file_name);
            return Some(url);
        }

        None
    }

    /// Single metadata query. The lookup key is pre-encoded, so the URL is
    /// assembled by hand rather than through a query builder.
    async fn query_api(&self, system_id: &str, key_param: &str) -> Option<String> {
        let url = format!(
            "{}/jeuInfos.php?devid={}&devpassword={}&softname={}&output=json&ssid={}&sspassword={}&systemeid={}&romtype=rom&{}",
            self.config.api_base,
            self.config.dev_id,
            self.config.dev_password,
            self.config.software_name,
            self.config.user,
            self.config.password,
            system_id,
            key_param,
        );

        let response = match self.client.get(&url).send().await {
            Ok(resp) => resp,
            Err(e) => {
                debug!("Metadata lookup failed: {}", e);
                return None;
            }
        };
        if !response.status().is_success() {
            debug!("Metadata lookup returned {}", response.status());
            return None;
        }

        let envelope: ApiEnvelope = match response.json().await {
            Ok(data) => data,
            Err(e) => {
                debug!("Metadata response parse failed: {}", e);
                return None;
            }
        };

        let game = envelope.response?.jeu?;
        game.medias
            .into_iter()
            .find(|m| m.kind == self.config.media_type)
            .map(|m| format!("{}&maxwidth=400&maxheight=580", m.url))
    }

    async fn download_media(&self, url: &str, target: &Path) -> Result<(), String> {
        let response = self
            .client
            .get(url)
            .send()
            .await
            .map_err(|e| e.to_string())?
            .error_for_status()
            .map_err(|e| e.to_string())?;
        let bytes = response.bytes().await.map_err(|e| e.to_string())?;
        if bytes.is_empty() {
            return Err("empty media body".to_string());
        }
        let staging = staging_path(target);
        std::fs::write(&staging, &bytes).map_err(|e| e.to_string())?;
        std::fs::rename(&staging, target).map_err(|e| e.to_string())?;
        Ok(())
    }
}

/// Strip noise tokens and annotations from a ROM name, then encode
/// separators the way the lookup endpoint expects.
fn clean_rom_name(name: &str) -> String {
    let mut cleaned = name.to_string();
    for noise in NAME_NOISE {
        cleaned = cleaned.replace(noise, "");
    }
    let cleaned = PAREN_RE.replace_all(&cleaned, "");
    let cleaned = BRACKET_RE.replace_all(&cleaned, "");
    cleaned
        .replace(" - ", "%20")
        .replace('-', "%20")
        .replace(' ', "%20")
}

/// Streaming MD5 of a file, hex-encoded.
fn md5_file(path: &Path) -> std::io::Result<String> {
    let mut file = std::fs::File::open(path)?;
    let mut context = md5::Context::new();
    let mut buf = [0u8; 64 * 1024];
    loop {
        let n = file.read(&mut buf)?;
        if n == 0 {
            break;
        }
        context.consume(&buf[..n]);
    }
    Ok(format!("{:x}", context.compute()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_http::{serve, CannedResponse};
    use tempfile::TempDir;

    fn test_pipeline(root: &Path) -> PipelineConfig {
        PipelineConfig {
            download_dir: root.join("downloads"),
            roms_dir: root.join("roms"),
            images_dir: root.join("images"),
            image_cache_dir: root.join("cache"),
            tools_dir: None,
            max_concurrent_downloads: 4,
            rename_single_output: false,
        }
    }

    fn scraper_with_api(root: &Path, api_base: String) -> Scraper {
        let pipeline = test_pipeline(root);
        let client = Client::new();
        let cache = ImageCache::new(&pipeline.image_cache_dir, client.clone()).unwrap();
        let config = ScraperConfig {
            api_base,
            ..ScraperConfig::default()
        };
        Scraper::new(config, &pipeline, client, cache)
    }

    fn png_fixture() -> Vec<u8> {
        let img = image::RgbaImage::from_pixel(1, 1, image::Rgba([0, 0, 0, 255]));
        let mut out = Vec::new();
        image::DynamicImage::ImageRgba8(img)
            .write_to(&mut std::io::Cursor::new(&mut out), image::ImageFormat::Png)
            .unwrap();
        out
    }

    #[test]
    fn test_clean_rom_name_strips_annotations() {
        let cleaned = clean_rom_name("Chrono Trigger (U) [!]");
        assert!(cleaned.starts_with("Chrono%20Trigger"));
        assert!(!cleaned.contains('('));
        assert!(!cleaned.contains('['));
        assert!(!cleaned.contains(' '));
    }

    #[test]
    fn test_clean_rom_name_strips_noise_tokens() {
        let cleaned = clean_rom_name("Some Game Disc 1 Rev 2");
        assert!(!cleaned.contains("Disc"));
        assert!(!cleaned.contains("Rev"));
    }

    #[test]
    fn test_md5_file() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("rom.bin");
        std::fs::write(&path, b"abc").unwrap();
        assert_eq!(
            md5_file(&path).unwrap(),
            "900150983cd24fb0d6963f7d28e17f72"
        );
    }

    #[tokio::test]
    async fn test_scrape_short_circuits_when_already_scraped() {
        let temp = TempDir::new().unwrap();
        let scraper = scraper_with_api(temp.path(), "http://127.0.0.1:1/api2".to_string());

        let target_dir = temp.path().join("images").join("SFC");
        std::fs::create_dir_all(&target_dir).unwrap();
        std::fs::write(target_dir.join("Game.png"), b"existing").unwrap();

        let outcome = scraper.scrape(None, "Game.sfc", "SFC").await.unwrap();
        assert_eq!(outcome, ScrapeOutcome::AlreadyScraped);
    }

    #[tokio::test]
    async fn test_scrape_falls_back_to_cache_when_api_unreachable() {
        let temp = TempDir::new().unwrap();
        // Nothing listens on port 1; every remote lookup fails fast.
        let scraper = scraper_with_api(temp.path(), "http://127.0.0.1:1/api2".to_string());

        let image_server = serve(CannedResponse::ok("image/png", png_fixture()), 1).await;
        let fallback = format!("http://{image_server}/cover.png");

        let outcome = scraper
            .scrape(Some(&fallback), "Game.sfc", "SFC")
            .await
            .unwrap();
        assert_eq!(outcome, ScrapeOutcome::Cache);

        let target = temp.path().join("images/SFC/Game.png");
        assert!(target.is_file());
        assert!(std::fs::metadata(&target).unwrap().len() > 0);
    }

    #[tokio::test]
    async fn test_scrape_remote_name_lookup() {
        let temp = TempDir::new().unwrap();

        let media_server = serve(CannedResponse::ok("image/png", png_fixture()), 1).await;
        let api_body = format!(
            r#"{{"response":{{"jeu":{{"medias":[{{"type":"box-2D","url":"http://{media_server}/media.php?id=1"}}]}}}}}}"#
        );
        let api_server = serve(CannedResponse::ok("application/json", api_body.into_bytes()), 1).await;

        let scraper = scraper_with_api(temp.path(), format!("http://{api_server}/api2"));
        let outcome = scraper.scrape(None, "Game.sfc", "SFC").await.unwrap();
        assert_eq!(outcome, ScrapeOutcome::Scraper);
        assert!(temp.path().join("images/SFC/Game.png").is_file());
    }

    #[tokio::test]
    async fn test_scrape_without_fallback_is_an_error() {
        let temp = TempDir::new().unwrap();
        let scraper = scraper_with_api(temp.path(), "http://127.0.0.1:1/api2".to_string());

        let err = scraper.scrape(None, "Game.sfc", "SFC").await.unwrap_err();
        assert!(matches!(err, ScrapeError::NoFallbackUrl));
    }
}
