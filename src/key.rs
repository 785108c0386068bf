// Decryption key fetching with a process-wide TTL cache, plus IV
// derivation for segments whose playlist carries no explicit IV.

use crate::config::DownloaderConfig;
use crate::error::{DownloadError, status_is_retryable};
use crate::retry::{RetryAction, is_retryable_reqwest_error, retry_with_backoff};
use async_trait::async_trait;
use moka::future::Cache;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::debug;

/// Source of AES-128 keys. The worker pool depends on this seam so tests
/// can supply keys without a network.
#[async_trait]
pub trait KeySource: Send + Sync {
    async fn get_key(
        &self,
        uri: &str,
        token: &CancellationToken,
    ) -> Result<[u8; 16], DownloadError>;
}

/// Fetches and caches AES-128 keys. One instance is shared by every task so
/// playlists that reuse a key URI hit the network once per TTL window.
pub struct KeyProvider {
    client: reqwest::Client,
    config: Arc<DownloaderConfig>,
    cache: Cache<String, [u8; 16]>,
}

impl KeyProvider {
    pub fn new(client: reqwest::Client, config: Arc<DownloaderConfig>) -> Self {
        let cache = Cache::builder()
            .max_capacity(256)
            .time_to_live(config.key_cache_ttl)
            .build();
        Self {
            client,
            config,
            cache,
        }
    }

    /// Fetch the 16-byte key at `uri`, consulting the cache first. Transient
    /// HTTP failures are retried with the configured backoff policy.
    pub async fn get_key(
        &self,
        uri: &str,
        token: &CancellationToken,
    ) -> Result<[u8; 16], DownloadError> {
        if let Some(key) = self.cache.get(uri).await {
            return Ok(key);
        }

        let policy = self.config.retry_policy();
        let key = retry_with_backoff(&policy, token, |_attempt| self.fetch_key_once(uri)).await?;

        debug!(uri, "Fetched decryption key");
        self.cache.insert(uri.to_string(), key).await;
        Ok(key)
    }

    async fn fetch_key_once(&self, uri: &str) -> RetryAction<[u8; 16]> {
        let response = match self
            .client
            .get(uri)
            .timeout(self.config.request_timeout)
            .send()
            .await
        {
            Ok(r) => r,
            Err(e) => {
                let err = DownloadError::KeyFetch {
                    uri: uri.to_string(),
                    reason: e.to_string(),
                };
                return if is_retryable_reqwest_error(&e) {
                    RetryAction::Retry(err)
                } else {
                    RetryAction::Fail(err)
                };
            }
        };

        let status = response.status();
        if !status.is_success() {
            let err = DownloadError::KeyFetch {
                uri: uri.to_string(),
                reason: format!("HTTP {status}"),
            };
            return if status_is_retryable(status) {
                RetryAction::Retry(err)
            } else {
                RetryAction::Fail(err)
            };
        }

        let bytes = match response.bytes().await {
            Ok(b) => b,
            Err(e) => {
                return RetryAction::Retry(DownloadError::KeyFetch {
                    uri: uri.to_string(),
                    reason: format!("failed to read key body: {e}"),
                });
            }
        };

        match <[u8; 16]>::try_from(bytes.as_ref()) {
            Ok(key) => RetryAction::Success(key),
            Err(_) => RetryAction::Fail(DownloadError::KeyFetch {
                uri: uri.to_string(),
                reason: format!("key has incorrect length: {} bytes (expected 16)", bytes.len()),
            }),
        }
    }
}

#[async_trait]
impl KeySource for KeyProvider {
    async fn get_key(
        &self,
        uri: &str,
        token: &CancellationToken,
    ) -> Result<[u8; 16], DownloadError> {
        KeyProvider::get_key(self, uri, token).await
    }
}

/// IV used for a segment: the playlist's explicit IV when present, else the
/// media sequence number as a 16-byte big-endian integer.
pub fn derive_iv(explicit: Option<[u8; 16]>, sequence: u64) -> [u8; 16] {
    match explicit {
        Some(iv) => iv,
        None => {
            let mut iv = [0u8; 16];
            iv[8..].copy_from_slice(&sequence.to_be_bytes());
            iv
        }
    }
}
