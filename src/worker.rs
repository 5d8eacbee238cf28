//! Download worker: owns one game acquisition end to end.
//!
//! Streams the archive to a per-job scratch directory, then hands off to
//! the converter and the artwork scraper. Every stage observes the job's
//! cancellation token; the scratch directory is removed on every exit
//! path so no partial artifacts survive.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;

use futures::StreamExt;
use reqwest::Client;
use tokio::io::AsyncWriteExt;
use tracing::{debug, info, warn};

use crate::config::PipelineConfig;
use crate::convert::{ConvertError, Converter};
use crate::job::{JobShared, JobState};
use crate::process::ProcessRunner;
use crate::scrape::Scraper;

/// Worker-stage errors, flattened into the job's error message.
#[derive(Debug, thiserror::Error)]
pub enum WorkerError {
    #[error("download failed: {0}")]
    Http(String),

    #[error("processing failed: {0}")]
    Convert(ConvertError),

    #[error("cancelled")]
    Cancelled,

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<ConvertError> for WorkerError {
    fn from(err: ConvertError) -> Self {
        match err {
            ConvertError::Cancelled => WorkerError::Cancelled,
            other => WorkerError::Convert(other),
        }
    }
}

/// File name for a download URL: last path segment, percent-decoded,
/// query and fragment stripped.
pub fn filename_from_url(url: &str) -> String {
    let path = url.split(['?', '#']).next().unwrap_or(url);
    let last = path.trim_end_matches('/').rsplit('/').next().unwrap_or(path);
    let decoded = urlencoding::decode(last)
        .map(|c| c.into_owned())
        .unwrap_or_else(|_| last.to_string());
    if decoded.is_empty() {
        "download".to_string()
    } else {
        decoded
    }
}

/// Header-only size probe so the UI can show a size before starting the
/// download. Best-effort; `None` means unknown.
///
/// Reads the Content-Length header directly: a HEAD response carries no
/// body, so reqwest's body-size hint is useless here.
pub async fn fetch_size(client: &Client, url: &str) -> Option<u64> {
    let response = client.head(url).send().await.ok()?;
    if !response.status().is_success() {
        return None;
    }
    response
        .headers()
        .get(reqwest::header::CONTENT_LENGTH)?
        .to_str()
        .ok()?
        .parse::<u64>()
        .ok()
        .filter(|len| *len > 0)
}

/// Runs one job through Download → Processing → Scraping.
pub struct Worker {
    job: Arc<JobShared>,
    config: Arc<PipelineConfig>,
    client: Client,
    runner: Arc<dyn ProcessRunner>,
    scraper: Option<Arc<Scraper>>,
}

impl Worker {
    pub fn new(
        job: Arc<JobShared>,
        config: Arc<PipelineConfig>,
        client: Client,
        runner: Arc<dyn ProcessRunner>,
        scraper: Option<Arc<Scraper>>,
    ) -> Self {
        Self {
            job,
            config,
            client,
            runner,
            scraper,
        }
    }

    /// Drive the job to a terminal state and return it. Never panics and
    /// never leaves scratch files behind.
    pub async fn run(&self) -> JobState {
        let scratch = self.scratch_dir();
        let result = self.run_stages(&scratch).await;
        let _ = tokio::fs::remove_dir_all(&scratch).await;

        match result {
            Ok(()) => {
                info!("Job {} completed", self.job.key());
                self.job.set_state(JobState::Completed);
            }
            Err(WorkerError::Cancelled) => {
                info!("Job {} cancelled", self.job.key());
                self.job.set_state(JobState::Cancelled);
            }
            // A failure that races the cancel (e.g. the connection dying
            // as the stream is abandoned) still counts as cancelled.
            Err(_) if self.job.cancel.is_cancelled() => {
                info!("Job {} cancelled", self.job.key());
                self.job.set_state(JobState::Cancelled);
            }
            Err(e) => {
                warn!("Job {} failed: {}", self.job.key(), e);
                self.job.set_error(e.to_string());
            }
        }
        self.job.state()
    }

    async fn run_stages(&self, scratch: &Path) -> Result<(), WorkerError> {
        self.job.set_state(JobState::Downloading);
        self.download(scratch).await?;

        self.job.set_state(JobState::Processing);
        let converter = Converter::new(
            &self.job.game,
            &self.config,
            self.runner.as_ref(),
            self.job.as_ref(),
            &self.job.cancel,
        );
        let candidates = converter.relocate(scratch).await?;

        self.job.set_state(JobState::Scraping);
        self.scrape_all(&candidates).await
    }

    /// Stream the archive to `scratch` under a `.part` suffix, renaming
    /// into place once the transfer finishes.
    async fn download(&self, scratch: &Path) -> Result<(), WorkerError> {
        tokio::fs::create_dir_all(scratch).await?;

        let url = &self.job.game.download_url;
        let file_name = filename_from_url(url);
        let part = scratch.join(format!("{file_name}.part"));

        let response = self
            .client
            .get(url)
            .send()
            .await
            .map_err(|e| WorkerError::Http(e.to_string()))?
            .error_for_status()
            .map_err(|e| WorkerError::Http(e.to_string()))?;

        if let Some(len) = response.content_length() {
            self.job.set_total_bytes(len);
        }

        debug!("Downloading {} to {}", url, part.display());
        let mut file = tokio::fs::File::create(&part).await?;
        let mut stream = response.bytes_stream();
        let start = Instant::now();
        let mut written: u64 = 0;

        loop {
            // Select against the token so cancellation does not wait out
            // a stalled stream.
            let chunk = tokio::select! {
                _ = self.job.cancel.cancelled() => return Err(WorkerError::Cancelled),
                chunk = stream.next() => chunk,
            };
            let Some(chunk) = chunk else { break };
            let chunk = chunk.map_err(|e| WorkerError::Http(e.to_string()))?;

            file.write_all(&chunk).await?;
            written += chunk.len() as u64;
            self.job.set_current_bytes(written);

            let elapsed = start.elapsed().as_secs_f64();
            if elapsed > 0.0 {
                self.job.set_bytes_per_second(written as f64 / elapsed);
            }
        }

        file.flush().await?;
        drop(file);
        tokio::fs::rename(&part, scratch.join(&file_name)).await?;
        Ok(())
    }

    /// Best-effort artwork pass over the installed files. Scrape errors
    /// are logged, never fatal; cancellation skips the remaining files.
    async fn scrape_all(&self, candidates: &[String]) -> Result<(), WorkerError> {
        let Some(scraper) = &self.scraper else {
            return Ok(());
        };

        for name in candidates {
            if self.job.cancel.is_cancelled() {
                return Err(WorkerError::Cancelled);
            }
            match scraper
                .scrape(
                    self.job.game.image_url.as_deref(),
                    name,
                    &self.job.game.platform_id,
                )
                .await
            {
                Ok(outcome) => debug!("Artwork for {}: {}", name, outcome),
                Err(e) => warn!("Artwork scrape failed for {}: {}", name, e),
            }
        }
        Ok(())
    }

    fn scratch_dir(&self) -> PathBuf {
        let safe: String = self
            .job
            .key()
            .chars()
            .map(|c| if c == '/' { '_' } else { c })
            .collect();
        self.config.download_dir.join(safe)
    }
}
