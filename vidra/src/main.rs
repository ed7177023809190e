//! Command-line entry point for direct-URL downloads.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use clap::Parser;
use tracing::info;
use tracing_subscriber::EnvFilter;
use url::Url;

use vidra::catalog::{CatalogClient, EpisodeMeta, MovieMeta};
use vidra::progress::format_percent;
use vidra::resolver::{ResolvedPlaylist, StaticResolver};
use vidra::{
    Config, ContentRef, DownloadRequest, DownloadScheduler, Error, ProgressBus, Result, Status,
};

/// Minimum interval between rendered updates per (task, lane).
const RENDER_THROTTLE: Duration = Duration::from_millis(200);

#[derive(Debug, Parser)]
#[command(name = "vidra", version, about = "Concurrent HLS video downloader")]
struct Cli {
    /// Path to a TOML configuration file.
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Master playlist URL to download.
    master_url: Url,

    /// Embed page URL sent as the Referer on every fetch.
    #[arg(short, long)]
    referer: String,

    /// Title used for the output file name.
    #[arg(short, long, default_value = "Download")]
    title: String,

    /// Release year appended to the output file name.
    #[arg(short, long)]
    year: Option<u32>,

    /// Comma-separated audio/subtitle languages, first is primary.
    #[arg(short, long)]
    languages: Option<String>,

    /// Video quality: best, worst or an exact height like 1080.
    #[arg(short, long)]
    quality: Option<String>,
}

/// Catalog backed by the command line: one movie, named by the user.
struct CliCatalog {
    title: String,
    year: Option<u32>,
}

#[async_trait]
impl CatalogClient for CliCatalog {
    async fn movie(&self, id: &str) -> Result<MovieMeta> {
        Ok(MovieMeta {
            id: id.to_string(),
            title: self.title.clone(),
            year: self.year,
        })
    }

    async fn episode(&self, id: &str, _season: u32, _episode: u32) -> Result<EpisodeMeta> {
        Err(Error::not_found("episode", id))
    }

    async fn season(&self, id: &str, _season: u32) -> Result<Vec<EpisodeMeta>> {
        Err(Error::not_found("season", id))
    }

    async fn seasons(&self, id: &str) -> Result<Vec<u32>> {
        Err(Error::not_found("series", id))
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();
    let config = Arc::new(match &cli.config {
        Some(path) => Config::load(path)?,
        None => Config::default(),
    });

    let resolver = StaticResolver::new().with_entry(
        "direct",
        ResolvedPlaylist {
            referer_url: cli.referer.clone(),
            master_playlist_url: cli.master_url.clone(),
        },
    );
    let catalog = CliCatalog {
        title: cli.title.clone(),
        year: cli.year,
    };

    let bus = Arc::new(ProgressBus::default());
    let (_subscription, mut events) = bus.subscribe();

    let scheduler = DownloadScheduler::new(
        Arc::clone(&config),
        Arc::new(catalog),
        Arc::new(resolver),
        Arc::clone(&bus),
        reqwest::Client::new(),
    );
    match scheduler.transcoder_version() {
        Some(version) => info!(%version, "Transcoder available"),
        None => {
            return Err(Error::config(format!(
                "transcoder binary `{}` not found",
                config.transcoder_binary
            )));
        }
    }

    let languages: Vec<String> = cli
        .languages
        .map(|l| l.split(',').map(|s| s.trim().to_string()).collect())
        .unwrap_or_default();
    let task = scheduler
        .admit(DownloadRequest {
            content: ContentRef::movie("direct"),
            languages,
            quality: cli.quality,
        })
        .await?;
    info!(task_id = %task.id, output = %task.output_path.display(), "Download admitted");

    // Render throttled progress until the task settles.
    let mut last_render: HashMap<(String, Option<String>), Instant> = HashMap::new();
    while let Some(event) = events.recv().await {
        let key = (event.task_id.clone(), event.sub_task_id.clone());
        let due = last_render
            .get(&key)
            .is_none_or(|at| at.elapsed() >= RENDER_THROTTLE);
        if event.is_terminal() || due {
            last_render.insert(key, Instant::now());
            render(&event);
        }

        if event.sub_task_id.is_none() && event.is_terminal() {
            break;
        }
    }

    let finished = scheduler
        .get(&task.id)
        .ok_or_else(|| Error::not_found("task", &task.id))?;
    match finished.status {
        Status::Completed => {
            println!("Saved {}", finished.output_path.display());
            Ok(())
        }
        status => Err(Error::Other(format!(
            "download ended as {status}: {}",
            finished.error.unwrap_or_default()
        ))),
    }
}

fn render(event: &vidra::ProgressEvent) {
    let lane = event.sub_task_id.as_deref().unwrap_or("task");
    let progress = event
        .progress
        .map(format_percent)
        .unwrap_or_else(|| "-".to_string());
    let speed = event
        .download_speed
        .clone()
        .or_else(|| event.bitrate.clone())
        .unwrap_or_default();
    let note = event
        .message
        .clone()
        .or_else(|| event.error_message.clone())
        .unwrap_or_default();
    println!("[{}] {lane} {progress} {speed} {note}", event.status);
}
