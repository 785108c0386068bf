use crate::error::DownloadError;
use crate::playlist::VariantSelectionPolicy;
use crate::proxy::{ProxyConfig, build_proxy_from_config};
use crate::retry::RetryPolicy;
use reqwest::header::{HeaderMap, HeaderValue};
use std::path::PathBuf;
use std::time::Duration;

pub const DEFAULT_USER_AGENT: &str = "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/142.0.0.0 Safari/537.36";

/// Configurable options for the download engine.
///
/// This is the flat key set the embedding application's settings store maps
/// onto; everything here has a usable default.
#[derive(Debug, Clone)]
pub struct DownloaderConfig {
    /// Process-wide bound on simultaneously running tasks.
    pub max_concurrent_tasks: usize,

    /// Bound on concurrent fetch+decrypt workers within one task.
    pub max_workers_per_task: usize,

    /// Retry attempts per segment or key fetch (not counting the first try).
    pub max_retries: u32,

    /// Base delay between retries; grows exponentially with jitter.
    pub retry_delay: Duration,

    /// Cap on the computed backoff delay.
    pub max_retry_delay: Duration,

    /// Per-request timeout for playlist, key, and segment fetches.
    pub request_timeout: Duration,

    /// Connection timeout (time to establish initial connection).
    pub connect_timeout: Duration,

    /// Granularity of staged writes and bandwidth accounting.
    pub chunk_size: usize,

    /// Global bandwidth cap in bytes/sec shared by all tasks; 0 = unlimited.
    pub bandwidth_limit: u64,

    /// Where output files land when the caller does not give a full path.
    pub output_directory: PathBuf,

    /// Where per-task progress records are persisted. `None` disables
    /// persistence.
    pub state_directory: Option<PathBuf>,

    /// Proxy configuration (optional).
    pub proxy: Option<ProxyConfig>,

    /// User agent string.
    pub user_agent: String,

    /// Extra headers sent with every request.
    pub headers: HeaderMap,

    /// When false, invalid TLS certificates are accepted.
    pub verify_ssl: bool,

    /// Keep staged segment files after a successful merge.
    pub keep_temp_files: bool,

    /// Variant stream chosen when a master playlist is encountered.
    pub variant_policy: VariantSelectionPolicy,

    /// TTL for decryption keys in the process-wide cache.
    pub key_cache_ttl: Duration,

    /// Offload AES decryption to the blocking thread pool.
    pub offload_decryption: bool,

    /// Sampling interval for speed/ETA and progress events.
    pub progress_interval: Duration,

    /// EWMA smoothing factor for speed estimation, in (0, 1].
    pub speed_smoothing: f64,

    /// Maximum idle connections to keep per host.
    pub pool_max_idle_per_host: usize,

    /// Duration to keep idle connections alive before closing.
    pub pool_idle_timeout: Duration,
}

impl Default for DownloaderConfig {
    fn default() -> Self {
        Self {
            max_concurrent_tasks: 3,
            max_workers_per_task: 10,
            max_retries: 5,
            retry_delay: Duration::from_secs(2),
            max_retry_delay: Duration::from_secs(30),
            request_timeout: Duration::from_secs(30),
            connect_timeout: Duration::from_secs(30),
            chunk_size: 64 * 1024,
            bandwidth_limit: 0,
            output_directory: PathBuf::from("."),
            state_directory: None,
            proxy: None,
            user_agent: DEFAULT_USER_AGENT.to_owned(),
            headers: Self::default_headers(),
            verify_ssl: true,
            keep_temp_files: false,
            variant_policy: VariantSelectionPolicy::default(),
            key_cache_ttl: Duration::from_secs(60 * 60),
            offload_decryption: false,
            progress_interval: Duration::from_millis(500),
            speed_smoothing: 0.3,
            pool_max_idle_per_host: 10,
            pool_idle_timeout: Duration::from_secs(30),
        }
    }
}

impl DownloaderConfig {
    pub fn default_headers() -> HeaderMap {
        let mut headers = HeaderMap::new();
        headers.insert(
            reqwest::header::ACCEPT_ENCODING,
            HeaderValue::from_static("gzip, deflate"),
        );
        headers.insert(
            reqwest::header::ACCEPT,
            HeaderValue::from_static("*/*"),
        );
        headers
    }

    /// Retry policy applied to segment and key fetches.
    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_retries: self.max_retries,
            base_delay: self.retry_delay,
            max_delay: self.max_retry_delay,
            jitter: true,
        }
    }

    /// Build the shared HTTP client from this configuration.
    pub fn build_http_client(&self) -> Result<reqwest::Client, DownloadError> {
        let mut builder = reqwest::Client::builder()
            .user_agent(self.user_agent.clone())
            .default_headers(self.headers.clone())
            .connect_timeout(self.connect_timeout)
            .pool_max_idle_per_host(self.pool_max_idle_per_host)
            .pool_idle_timeout(self.pool_idle_timeout)
            .danger_accept_invalid_certs(!self.verify_ssl);

        if let Some(proxy_config) = &self.proxy {
            builder = builder.proxy(build_proxy_from_config(proxy_config)?);
        }

        builder.build().map_err(|e| DownloadError::Configuration {
            reason: format!("failed to build HTTP client: {e}"),
        })
    }
}
