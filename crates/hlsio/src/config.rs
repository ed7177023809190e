use std::time::Duration;

use crate::retry::RetryPolicy;

// --- Top-Level Configuration ---
#[derive(Debug, Clone, Default)]
pub struct HlsConfig {
    pub playlist: PlaylistConfig,
    pub fetcher: FetcherConfig,
}

// --- Playlist Configuration ---
#[derive(Debug, Clone)]
pub struct PlaylistConfig {
    /// Timeout for fetching master/media playlist text.
    pub fetch_timeout: Duration,
}

impl Default for PlaylistConfig {
    fn default() -> Self {
        Self {
            fetch_timeout: Duration::from_secs(15),
        }
    }
}

// --- Fetcher Configuration ---
#[derive(Debug, Clone)]
pub struct FetcherConfig {
    /// Max concurrent segment downloads per fetcher invocation.
    pub segment_concurrency: usize,
    /// Per-request timeout for one segment GET.
    pub segment_timeout: Duration,
    /// Retry schedule for segment fetches.
    ///
    /// The default budget is effectively unbounded; deployments are expected
    /// to lower `max_retries` to a finite ceiling.
    pub segment_retry: RetryPolicy,
    /// Per-request timeout for the decryption key GET.
    pub key_timeout: Duration,
    /// Retry schedule for key fetches.
    pub key_retry: RetryPolicy,
}

impl Default for FetcherConfig {
    fn default() -> Self {
        Self {
            segment_concurrency: 5,
            segment_timeout: Duration::from_secs(30),
            segment_retry: RetryPolicy {
                max_retries: u32::MAX,
                base_delay: Duration::from_millis(500),
                max_delay: Duration::from_secs(30),
                jitter: true,
            },
            key_timeout: Duration::from_secs(5),
            key_retry: RetryPolicy {
                max_retries: 3,
                base_delay: Duration::from_millis(200),
                max_delay: Duration::from_secs(5),
                jitter: true,
            },
        }
    }
}

impl FetcherConfig {
    /// Clamp the segment retry ceiling, keeping the rest of the schedule.
    pub fn with_max_segment_retries(mut self, max_retries: u32) -> Self {
        self.segment_retry.max_retries = max_retries;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_documented_values() {
        let config = FetcherConfig::default();
        assert_eq!(config.segment_concurrency, 5);
        assert_eq!(config.segment_retry.base_delay, Duration::from_millis(500));
        assert_eq!(config.segment_retry.max_delay, Duration::from_secs(30));
        assert_eq!(config.segment_retry.max_retries, u32::MAX);
    }

    #[test]
    fn retry_ceiling_is_configurable() {
        let config = FetcherConfig::default().with_max_segment_retries(8);
        assert_eq!(config.segment_retry.max_retries, 8);
    }
}
