//! romdrop - retro game acquisition pipeline
//!
//! CLI frontend for the download pipeline. Renders job status by polling
//! scheduler snapshots, the same contract a handheld frontend would use.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use clap::{Parser, Subcommand};
use indicatif::{MultiProgress, ProgressBar, ProgressStyle};
use reqwest::Client;
use tracing_subscriber::EnvFilter;

use romdrop::config::PipelineConfig;
use romdrop::image_cache::ImageCache;
use romdrop::job::{format_size, GameDescriptor, JobState, JobStatus};
use romdrop::notify::LogSink;
use romdrop::process::SystemRunner;
use romdrop::scheduler::Scheduler;
use romdrop::scrape::{Scraper, ScraperConfig};
use romdrop::worker;

/// Snapshot poll interval, matching a ~30 Hz frontend frame tick.
const POLL_INTERVAL: Duration = Duration::from_millis(33);

#[derive(Parser)]
#[command(name = "romdrop")]
#[command(version)]
#[command(about = "Retro game download and install pipeline")]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Enable verbose logging (use RUST_LOG=debug for more detail)
    #[arg(short, long, global = true)]
    verbose: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Download, convert and install one or more games
    Download {
        /// Archive URLs, one job per URL
        #[arg(required = true)]
        urls: Vec<String>,

        /// Platform identifier (e.g. SFC, PS, DC)
        #[arg(short, long)]
        platform: String,

        /// Root for downloads scratch space
        #[arg(long)]
        downloads: Option<PathBuf>,

        /// Root for installed ROMs
        #[arg(long)]
        roms: Option<PathBuf>,

        /// Root for scraped box-art
        #[arg(long)]
        images: Option<PathBuf>,

        /// Directory holding chdman/ccd2cue/ecm2bin/7z binaries
        #[arg(long)]
        tools: Option<PathBuf>,

        /// Maximum concurrent downloads
        #[arg(short, long, default_value = "4")]
        concurrent: usize,

        /// Treat archives as final payload instead of unpacking them
        #[arg(long)]
        no_extract: bool,

        /// Direct box-art URL used when the metadata service fails
        #[arg(long)]
        image_url: Option<String>,

        /// ScreenScraper developer id (enables metadata lookups)
        #[arg(long, env = "SCREENSCRAPER_DEV_ID")]
        ss_dev_id: Option<String>,

        /// ScreenScraper developer password
        #[arg(long, env = "SCREENSCRAPER_DEV_PASSWORD")]
        ss_dev_password: Option<String>,

        /// ScreenScraper user name
        #[arg(long, env = "SCREENSCRAPER_USER", default_value = "")]
        ss_user: String,

        /// ScreenScraper user password
        #[arg(long, env = "SCREENSCRAPER_PASSWORD", default_value = "")]
        ss_password: String,
    },

    /// Probe the download size of a URL without fetching it
    Size {
        url: String,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Only initialize logging if verbose or RUST_LOG is set
    if cli.verbose || std::env::var("RUST_LOG").is_ok() {
        tracing_subscriber::fmt()
            .with_env_filter(EnvFilter::from_default_env().add_directive(
                if cli.verbose {
                    "romdrop=debug".parse()?
                } else {
                    "romdrop=warn".parse()?
                },
            ))
            .init();
    }

    match cli.command {
        Commands::Download {
            urls,
            platform,
            downloads,
            roms,
            images,
            tools,
            concurrent,
            no_extract,
            image_url,
            ss_dev_id,
            ss_dev_password,
            ss_user,
            ss_password,
        } => {
            let mut config = PipelineConfig::default();
            if let Some(dir) = downloads {
                config.download_dir = dir;
            }
            if let Some(dir) = roms {
                config.roms_dir = dir;
            }
            if let Some(dir) = images {
                config.images_dir = dir;
            }
            config.tools_dir = tools;
            config.max_concurrent_downloads = concurrent;
            config.validate()?;
            config.ensure_dirs()?;
            let config = Arc::new(config);

            let client = Client::new();
            let scraper = build_scraper(
                &config,
                &client,
                ss_dev_id,
                ss_dev_password,
                ss_user,
                ss_password,
            )?;

            let scheduler = Scheduler::new(
                Arc::clone(&config),
                client,
                Arc::new(SystemRunner),
                scraper,
                Arc::new(LogSink),
            );

            for url in urls {
                let name = stem_of(&worker::filename_from_url(&url));
                let game = GameDescriptor {
                    platform_id: platform.clone(),
                    source_id: "cli".to_string(),
                    name,
                    image_url: image_url.clone(),
                    download_url: url,
                    is_extractable: !no_extract,
                    can_be_renamed: false,
                };
                if let Err(e) = scheduler.submit(game) {
                    eprintln!("Skipping: {e}");
                }
            }

            let failed = poll_until_done(&scheduler).await;
            if failed > 0 {
                std::process::exit(1);
            }
        }

        Commands::Size { url } => {
            let client = Client::new();
            match worker::fetch_size(&client, &url).await {
                Some(size) => println!("{} ({} bytes)", format_size(size), size),
                None => println!("unknown"),
            }
        }
    }

    Ok(())
}

fn build_scraper(
    config: &Arc<PipelineConfig>,
    client: &Client,
    dev_id: Option<String>,
    dev_password: Option<String>,
    user: String,
    password: String,
) -> Result<Option<Arc<Scraper>>> {
    let (Some(dev_id), Some(dev_password)) = (dev_id, dev_password) else {
        return Ok(None);
    };

    let cache = ImageCache::new(config.image_cache_dir.clone(), client.clone())?;
    let scraper_config = ScraperConfig {
        dev_id,
        dev_password,
        user,
        password,
        ..ScraperConfig::default()
    };
    Ok(Some(Arc::new(Scraper::new(
        scraper_config,
        config,
        client.clone(),
        cache,
    ))))
}

/// Poll snapshots and mirror them into progress bars until every job is
/// terminal. Returns the number of failed jobs.
async fn poll_until_done(scheduler: &Scheduler) -> usize {
    let multi = MultiProgress::new();
    let style = ProgressStyle::with_template(
        "{prefix:<30!} [{bar:30}] {percent:>3}% {msg}",
    )
    .unwrap_or_else(|_| ProgressStyle::default_bar())
    .progress_chars("=> ");

    let mut bars: HashMap<String, ProgressBar> = HashMap::new();

    loop {
        let snapshot = scheduler.snapshot();
        for status in &snapshot {
            let bar = bars.entry(status.key.clone()).or_insert_with(|| {
                let bar = multi.add(ProgressBar::new(100));
                bar.set_style(style.clone());
                bar.set_prefix(status.key.clone());
                bar
            });
            render(bar, status);
        }

        if !scheduler.has_active_jobs() {
            break;
        }
        tokio::time::sleep(POLL_INTERVAL).await;
    }

    let snapshot = scheduler.snapshot();
    let mut failed = 0;
    for status in &snapshot {
        if status.state == JobState::Error {
            failed += 1;
            eprintln!(
                "{}: {}",
                status.key,
                status.error_message.as_deref().unwrap_or("failed")
            );
        }
        let _ = scheduler.acknowledge(&status.key);
    }
    failed
}

fn render(bar: &ProgressBar, status: &JobStatus) {
    bar.set_position(status.progress as u64);
    match status.state {
        JobState::Queued => {
            let position = status.queue_position.unwrap_or(0);
            bar.set_message(format!("queued #{position}"));
        }
        JobState::Downloading => {
            bar.set_message(format!(
                "{} / {}  {}/s",
                format_size(status.current_bytes),
                format_size(status.total_bytes),
                format_size(status.bytes_per_second as u64),
            ));
        }
        JobState::Processing => {
            bar.set_message(
                status
                    .current_operation
                    .clone()
                    .unwrap_or_else(|| "processing".to_string()),
            );
        }
        JobState::Scraping => bar.set_message("scraping artwork"),
        JobState::Completed => {
            bar.set_position(100);
            bar.finish_with_message("done");
        }
        JobState::Cancelling => bar.set_message("cancelling"),
        JobState::Cancelled => bar.finish_with_message("cancelled"),
        JobState::Error => bar.finish_with_message("failed"),
    }
}

fn stem_of(file_name: &str) -> String {
    std::path::Path::new(file_name)
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_else(|| file_name.to_string())
}
