//! Runtime configuration.

use std::path::{Path, PathBuf};
use std::time::Duration;

use hlsio::{FetcherConfig, HlsConfig, PlaylistConfig, QualityPreference, RetryPolicy};
use serde::Deserialize;

use crate::{Error, Result};

/// Recognized configuration options with their documented defaults.
#[derive(Debug, Clone, Deserialize)]
#[serde(default, rename_all = "camelCase", deny_unknown_fields)]
pub struct Config {
    /// Root of completed artifacts.
    pub download_base_path: PathBuf,
    /// Root of per-task scratch directories.
    pub temp_path: PathBuf,
    /// Task pool size: at most this many tasks in active orchestration.
    pub parallel_downloads: usize,
    /// Per-fetcher segment pool size.
    pub segment_concurrency: usize,
    /// `best` | `worst` | `<n>[p]`.
    pub default_quality: String,
    /// Comma-separated language codes, first entry is the primary.
    pub default_languages: String,
    /// Referer base for the embed provider.
    pub extractor_base_url: String,
    /// Network timeout for the playlist resolver.
    pub resolver_timeout_seconds: Option<u64>,
    /// Per-segment retry ceiling. Unset keeps the effectively unbounded
    /// default; deployments should pin a finite value.
    pub retry_max_attempts: Option<u32>,
    /// Exponential backoff base.
    pub retry_base_delay_ms: u64,
    /// Exponential backoff ceiling.
    pub retry_max_delay_ms: u64,
    /// Transcoder binary name or path.
    pub transcoder_binary: String,
    /// Wall-clock cap on one task's sub-task wait.
    pub task_timeout_seconds: u64,
    /// Wall-clock cap on one transcoder/mux invocation.
    pub transcode_timeout_seconds: u64,
    /// Global bound on concurrently running track pipelines across all tasks.
    pub max_track_concurrency: usize,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            download_base_path: PathBuf::from("downloads"),
            temp_path: PathBuf::from("tmp"),
            parallel_downloads: 3,
            segment_concurrency: 5,
            default_quality: "best".to_string(),
            default_languages: "en".to_string(),
            extractor_base_url: String::new(),
            resolver_timeout_seconds: None,
            retry_max_attempts: None,
            retry_base_delay_ms: 500,
            retry_max_delay_ms: 30_000,
            transcoder_binary: "ffmpeg".to_string(),
            task_timeout_seconds: 2 * 60 * 60,
            transcode_timeout_seconds: 2 * 60 * 60,
            max_track_concurrency: 16,
        }
    }
}

impl Config {
    /// Load from a TOML file, falling back to defaults for absent keys.
    pub fn load(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)
            .map_err(|e| Error::config(format!("cannot read {}: {e}", path.display())))?;
        let config: Config = toml::from_str(&text)
            .map_err(|e| Error::config(format!("cannot parse {}: {e}", path.display())))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.parallel_downloads == 0 {
            return Err(Error::config("parallelDownloads must be at least 1"));
        }
        if self.segment_concurrency == 0 {
            return Err(Error::config("segmentConcurrency must be at least 1"));
        }
        if self.default_languages().is_empty() {
            return Err(Error::config("defaultLanguages must name at least one language"));
        }
        Ok(())
    }

    /// The configured language list, trimmed, in priority order.
    pub fn default_languages(&self) -> Vec<String> {
        self.default_languages
            .split(',')
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(str::to_string)
            .collect()
    }

    pub fn default_quality(&self) -> QualityPreference {
        QualityPreference::parse(&self.default_quality)
    }

    pub fn task_timeout(&self) -> Duration {
        Duration::from_secs(self.task_timeout_seconds)
    }

    pub fn transcode_timeout(&self) -> Duration {
        Duration::from_secs(self.transcode_timeout_seconds)
    }

    pub fn resolver_timeout(&self) -> Option<Duration> {
        self.resolver_timeout_seconds.map(Duration::from_secs)
    }

    /// Engine-side configuration derived from the retry/concurrency knobs.
    pub fn hls_config(&self) -> HlsConfig {
        let segment_retry = RetryPolicy {
            max_retries: self.retry_max_attempts.unwrap_or(u32::MAX),
            base_delay: Duration::from_millis(self.retry_base_delay_ms),
            max_delay: Duration::from_millis(self.retry_max_delay_ms),
            jitter: true,
        };
        HlsConfig {
            playlist: PlaylistConfig::default(),
            fetcher: FetcherConfig {
                segment_concurrency: self.segment_concurrency,
                segment_retry,
                ..FetcherConfig::default()
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_documented_table() {
        let config = Config::default();
        assert_eq!(config.parallel_downloads, 3);
        assert_eq!(config.segment_concurrency, 5);
        assert_eq!(config.default_quality, "best");
        assert_eq!(config.default_languages(), vec!["en".to_string()]);
        assert_eq!(config.retry_base_delay_ms, 500);
        assert_eq!(config.retry_max_delay_ms, 30_000);
        assert!(config.retry_max_attempts.is_none());
    }

    #[test]
    fn parses_language_list() {
        let config = Config {
            default_languages: "en, it ,de".to_string(),
            ..Config::default()
        };
        assert_eq!(config.default_languages(), vec!["en", "it", "de"]);
    }

    #[test]
    fn unbounded_retries_map_to_sentinel() {
        let config = Config::default();
        assert_eq!(config.hls_config().fetcher.segment_retry.max_retries, u32::MAX);

        let bounded = Config {
            retry_max_attempts: Some(12),
            ..Config::default()
        };
        assert_eq!(bounded.hls_config().fetcher.segment_retry.max_retries, 12);
    }

    #[test]
    fn rejects_zero_parallelism() {
        let config = Config {
            parallel_downloads: 0,
            ..Config::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn loads_partial_toml() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("vidra.toml");
        std::fs::write(
            &path,
            "downloadBasePath = \"/srv/media\"\nparallelDownloads = 2\n",
        )
        .unwrap();
        let config = Config::load(&path).unwrap();
        assert_eq!(config.download_base_path, PathBuf::from("/srv/media"));
        assert_eq!(config.parallel_downloads, 2);
        // Untouched keys keep their defaults.
        assert_eq!(config.segment_concurrency, 5);
    }
}
