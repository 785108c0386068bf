// Segment fetching: streams one segment to its staging file with retry,
// byte-range support, bandwidth pacing and cancellation.

use crate::config::DownloaderConfig;
use crate::error::{DownloadError, status_is_retryable};
use crate::limiter::BandwidthLimiter;
use crate::retry::{RetryAction, is_retryable_reqwest_error, retry_with_backoff};
use crate::task::Segment;
use async_trait::async_trait;
use futures::StreamExt;
use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::fs::File;
use tokio::io::AsyncWriteExt;
use tokio_util::sync::CancellationToken;
use tracing::instrument;

/// Result of fetching one segment to disk.
#[derive(Debug, Clone, Copy)]
pub struct FetchOutcome {
    pub bytes_written: u64,
    /// Retries consumed before the fetch succeeded.
    pub retries: u32,
}

/// Source of raw segment bytes. The worker pool depends on this seam rather
/// than on HTTP directly, so tests can substitute deterministic sources.
#[async_trait]
pub trait SegmentSource: Send + Sync {
    async fn fetch(
        &self,
        segment: &Segment,
        dest: &Path,
        token: &CancellationToken,
    ) -> Result<FetchOutcome, DownloadError>;
}

/// HTTP segment source. One instance per task; the bandwidth limiter and
/// byte counter are shared across the task's workers.
pub struct SegmentFetcher {
    client: reqwest::Client,
    config: Arc<DownloaderConfig>,
    limiter: Arc<BandwidthLimiter>,
    bytes_counter: Arc<AtomicU64>,
}

impl SegmentFetcher {
    pub fn new(
        client: reqwest::Client,
        config: Arc<DownloaderConfig>,
        limiter: Arc<BandwidthLimiter>,
        bytes_counter: Arc<AtomicU64>,
    ) -> Self {
        Self {
            client,
            config,
            limiter,
            bytes_counter,
        }
    }

    async fn attempt(
        &self,
        segment: &Segment,
        dest: &Path,
        token: &CancellationToken,
    ) -> RetryAction<u64> {
        let mut request = self
            .client
            .get(&segment.url)
            .timeout(self.config.request_timeout);
        if let Some(range) = &segment.byte_range {
            request = request.header(reqwest::header::RANGE, range.header_value());
        }

        let response = tokio::select! {
            _ = token.cancelled() => return RetryAction::Fail(DownloadError::Cancelled),
            r = request.send() => match r {
                Ok(r) => r,
                Err(e) => {
                    let err = DownloadError::segment_fetch(
                        format!("request to {} failed: {e}", segment.url),
                        is_retryable_reqwest_error(&e),
                    );
                    return if err.is_retryable() {
                        RetryAction::Retry(err)
                    } else {
                        RetryAction::Fail(err)
                    };
                }
            },
        };

        let status = response.status();
        if !status.is_success() {
            let err = DownloadError::segment_fetch(
                format!("HTTP {status} for {}", segment.url),
                status_is_retryable(status),
            );
            return if status_is_retryable(status) {
                RetryAction::Retry(err)
            } else {
                RetryAction::Fail(err)
            };
        }

        match self.stream_to_file(response, dest, token).await {
            Ok(written) => RetryAction::Success(written),
            Err(err @ DownloadError::Cancelled) => RetryAction::Fail(err),
            // Disk errors must not be retried; truncated bodies may be.
            Err(err @ DownloadError::Io { .. }) => RetryAction::Fail(err),
            Err(err) => {
                if err.is_retryable() {
                    RetryAction::Retry(err)
                } else {
                    RetryAction::Fail(err)
                }
            }
        }
    }

    async fn stream_to_file(
        &self,
        response: reqwest::Response,
        dest: &Path,
        token: &CancellationToken,
    ) -> Result<u64, DownloadError> {
        // Create truncates, so a retried attempt starts from a clean file.
        let mut file = File::create(dest).await?;
        let mut written = 0u64;
        let mut stream = response.bytes_stream();

        loop {
            let next = tokio::select! {
                _ = token.cancelled() => return Err(DownloadError::Cancelled),
                chunk = stream.next() => chunk,
            };
            let Some(chunk) = next else { break };
            let chunk = chunk.map_err(|e| {
                DownloadError::segment_fetch(format!("body read failed: {e}"), true)
            })?;

            // Network chunks can exceed the configured granularity; split so
            // pacing and accounting stay smooth.
            for piece in chunk.chunks(self.config.chunk_size.max(1)) {
                self.limiter.acquire(piece.len()).await;
                file.write_all(piece).await?;
                written += piece.len() as u64;
                self.bytes_counter.fetch_add(piece.len() as u64, Ordering::Relaxed);
            }
        }

        file.flush().await?;
        Ok(written)
    }
}

#[async_trait]
impl SegmentSource for SegmentFetcher {
    #[instrument(skip(self, token), fields(index = segment.index, url = %segment.url))]
    async fn fetch(
        &self,
        segment: &Segment,
        dest: &Path,
        token: &CancellationToken,
    ) -> Result<FetchOutcome, DownloadError> {
        let policy = self.config.retry_policy();
        let (bytes_written, attempt) = retry_with_backoff(&policy, token, |attempt| async move {
            match self.attempt(segment, dest, token).await {
                RetryAction::Success(written) => RetryAction::Success((written, attempt)),
                RetryAction::Retry(e) => RetryAction::Retry(e),
                RetryAction::Fail(e) => RetryAction::Fail(e),
            }
        })
        .await?;
        Ok(FetchOutcome {
            bytes_written,
            retries: attempt,
        })
    }
}
