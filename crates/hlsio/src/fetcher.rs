// Parallel segment download with retry, decryption and ordered concatenation.

use crate::config::FetcherConfig;
use crate::decrypt::SegmentCipher;
use crate::error::{HlsError, is_retryable_reqwest_error, is_retryable_status};
use crate::retry::{RetryAction, RetryPolicy, retry_with_backoff};
use futures::StreamExt;
use reqwest::Client;
use reqwest::header::{ACCEPT, REFERER};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::time::Instant;
use tokio::io::{AsyncWriteExt, BufWriter};
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};
use url::Url;

/// Snapshot emitted after every completed segment.
///
/// Ticks are monotonic in `completed_segments`, not in segment index.
#[derive(Debug, Clone, PartialEq)]
pub struct FetchProgress {
    pub completed_segments: usize,
    pub total_segments: usize,
    pub downloaded_bytes: u64,
    /// Extrapolated as average segment size times total segments.
    pub estimated_total_bytes: u64,
    /// Always within `[0, 100]`.
    pub percent: f64,
    pub bytes_per_second: f64,
    pub eta_seconds: Option<u64>,
}

impl FetchProgress {
    fn derive(completed: usize, total: usize, bytes: u64, elapsed_secs: f64) -> Self {
        let percent = if total == 0 {
            100.0
        } else {
            (completed as f64 / total as f64 * 100.0).min(100.0)
        };
        let estimated_total_bytes = if completed == 0 {
            0
        } else {
            (bytes as f64 / completed as f64 * total as f64) as u64
        };
        let bytes_per_second = if elapsed_secs > 0.0 {
            bytes as f64 / elapsed_secs
        } else {
            0.0
        };
        let remaining = estimated_total_bytes.saturating_sub(bytes);
        let eta_seconds = if bytes_per_second > 0.0 && remaining > 0 {
            Some((remaining as f64 / bytes_per_second) as u64)
        } else {
            None
        };
        Self {
            completed_segments: completed,
            total_segments: total,
            downloaded_bytes: bytes,
            estimated_total_bytes,
            percent,
            bytes_per_second,
            eta_seconds,
        }
    }
}

pub type ProgressFn = Arc<dyn Fn(FetchProgress) + Send + Sync>;

struct FetchCounters {
    started: Instant,
    completed: AtomicUsize,
    bytes: AtomicU64,
}

/// Removes the per-segment scratch directory on every exit path.
struct ScratchDir {
    path: PathBuf,
}

impl ScratchDir {
    async fn create(path: PathBuf) -> Result<Self, HlsError> {
        tokio::fs::create_dir_all(&path).await?;
        Ok(Self { path })
    }

    fn segment_path(&self, index: usize) -> PathBuf {
        self.path.join(format!("segment_{index:05}.ts"))
    }
}

impl Drop for ScratchDir {
    fn drop(&mut self) {
        if let Err(e) = std::fs::remove_dir_all(&self.path) {
            if e.kind() != std::io::ErrorKind::NotFound {
                warn!(path = %self.path.display(), error = %e, "Failed to remove segment scratch");
            }
        }
    }
}

/// Downloads an ordered list of segments into a single file.
pub struct SegmentFetcher {
    client: Client,
    config: FetcherConfig,
    token: CancellationToken,
}

impl SegmentFetcher {
    pub fn new(client: Client, config: FetcherConfig, token: CancellationToken) -> Self {
        Self {
            client,
            config,
            token,
        }
    }

    /// Fetch all `segments` and concatenate them, in index order, into
    /// `output`. Parallelism is bounded by the configured concurrency; the
    /// first irrecoverable failure stops the remaining workers.
    ///
    /// Returns the number of bytes written to `output`.
    pub async fn download(
        &self,
        segments: &[Url],
        referer: &str,
        cipher: Option<SegmentCipher>,
        output: &Path,
        on_progress: Option<ProgressFn>,
    ) -> Result<u64, HlsError> {
        let total = segments.len();
        if total == 0 {
            return Err(HlsError::playlist("media playlist has no segments"));
        }

        let scratch = ScratchDir::create(scratch_path_for(output)).await?;
        let counters = Arc::new(FetchCounters {
            started: Instant::now(),
            completed: AtomicUsize::new(0),
            bytes: AtomicU64::new(0),
        });

        // Child token: the first fatal error stops further fetches without
        // cancelling the caller's scope.
        let worker_token = self.token.child_token();
        let client = self.client.clone();
        let segment_timeout = self.config.segment_timeout;
        let segment_retry = self.config.segment_retry.clone();
        let referer = referer.to_string();

        let mut results = futures::stream::iter(segments.iter().cloned().enumerate().map(
            |(index, url): (usize, Url)| {
                let counters = Arc::clone(&counters);
                let on_progress = on_progress.clone();
                let worker_token = worker_token.clone();
                let segment_file = scratch.segment_path(index);
                let cipher = cipher;
                let client = client.clone();
                let segment_retry = segment_retry.clone();
                let referer = referer.clone();
                Box::pin(async move {
                    fetch_one(
                        &client,
                        segment_timeout,
                        &segment_retry,
                        index,
                        &url,
                        &referer,
                        cipher.as_ref(),
                        &segment_file,
                        &worker_token,
                    )
                    .await
                    .map(|written| {
                        let completed = counters.completed.fetch_add(1, Ordering::SeqCst) + 1;
                        let bytes = counters.bytes.fetch_add(written, Ordering::SeqCst) + written;
                        if let Some(callback) = &on_progress {
                            callback(FetchProgress::derive(
                                completed,
                                total,
                                bytes,
                                counters.started.elapsed().as_secs_f64(),
                            ));
                        }
                    })
                }) as std::pin::Pin<Box<dyn std::future::Future<Output = Result<(), HlsError>> + Send>>
            },
        ))
        .buffer_unordered(self.config.segment_concurrency.max(1));

        let mut first_error: Option<HlsError> = None;
        while let Some(result) = results.next().await {
            if let Err(err) = result
                && first_error.is_none()
            {
                worker_token.cancel();
                first_error = Some(err);
            }
        }
        drop(results);

        if let Some(err) = first_error {
            return Err(err);
        }
        if self.token.is_cancelled() {
            return Err(HlsError::Cancelled);
        }

        let written = concat_segments(&scratch.path, total, output).await?;
        debug!(
            segments = total,
            bytes = written,
            output = %output.display(),
            "Concatenated segments"
        );
        Ok(written)
    }
}

async fn fetch_one(
    client: &Client,
    segment_timeout: std::time::Duration,
    segment_retry: &RetryPolicy,
    index: usize,
    url: &Url,
    referer: &str,
    cipher: Option<&SegmentCipher>,
    segment_file: &Path,
    token: &CancellationToken,
) -> Result<u64, HlsError> {
    let data = retry_with_backoff(segment_retry, token, |_attempt| async {
            let response = tokio::select! {
                _ = token.cancelled() => return RetryAction::Fail(HlsError::Cancelled),
                response = client
                    .get(url.clone())
                    .header(ACCEPT, "*/*")
                    .header(REFERER, referer)
                    .timeout(segment_timeout)
                    .send() => response,
            };

            match response {
                Ok(response) => {
                    let status = response.status();
                    if status.is_success() {
                        let bytes = tokio::select! {
                            _ = token.cancelled() => return RetryAction::Fail(HlsError::Cancelled),
                            bytes = response.bytes() => bytes,
                        };
                        match bytes {
                            Ok(bytes) => RetryAction::Success(bytes),
                            // Body read errors mid-transfer are worth another attempt.
                            Err(e) => RetryAction::Retry(HlsError::from(e)),
                        }
                    } else if is_retryable_status(status) {
                        RetryAction::Retry(HlsError::http_status(
                            status,
                            url.as_str(),
                            "segment fetch",
                        ))
                    } else {
                        RetryAction::Fail(HlsError::http_status(
                            status,
                            url.as_str(),
                            "segment fetch",
                        ))
                    }
                }
                Err(e) => {
                    if is_retryable_reqwest_error(&e) {
                        RetryAction::Retry(HlsError::from(e))
                    } else {
                        RetryAction::Fail(HlsError::from(e))
                    }
                }
            }
        })
        .await?;

        let payload = match cipher {
            Some(cipher) => cipher.decrypt(&data, index as u64)?,
            None => data.to_vec(),
        };

    tokio::fs::write(segment_file, &payload).await?;
    trace!(index, bytes = payload.len(), "Stored segment");
    Ok(payload.len() as u64)
}

fn scratch_path_for(output: &Path) -> PathBuf {
    let name = output
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| "segments".to_string());
    output.with_file_name(format!("{name}.parts"))
}

/// Stitch `segment_00000.ts .. segment_<count-1>.ts` into `output`,
/// observing strict index order.
async fn concat_segments(scratch: &Path, count: usize, output: &Path) -> Result<u64, HlsError> {
    if let Some(parent) = output.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }

    let file = tokio::fs::File::create(output).await?;
    let mut writer = BufWriter::new(file);
    let mut written = 0u64;
    for index in 0..count {
        let path = scratch.join(format!("segment_{index:05}.ts"));
        let mut segment = tokio::fs::File::open(&path).await?;
        written += tokio::io::copy(&mut segment, &mut writer).await?;
    }
    writer.flush().await?;
    Ok(written)
}
