use reqwest::StatusCode;

/// Error taxonomy for the download engine.
///
/// Segment-level transient failures are recovered locally via the retry
/// machinery and never surface past the worker; task-level fatal errors
/// (playlist, merge, disk) surface through the event stream.
#[derive(Debug, thiserror::Error)]
pub enum DownloadError {
    #[error("download cancelled")]
    Cancelled,

    #[error("invalid URL `{input}`: {reason}")]
    InvalidUrl { input: String, reason: String },

    #[error("playlist fetch failed for {url}: {reason}")]
    PlaylistFetch { url: String, reason: String },

    #[error("playlist parse error: {reason}")]
    PlaylistParse { reason: String },

    #[error("unsupported encryption method `{method}`")]
    UnsupportedEncryption { method: String },

    #[error("key fetch failed for {uri}: {reason}")]
    KeyFetch { uri: String, reason: String },

    #[error("segment fetch error: {reason}")]
    SegmentFetch { reason: String, retryable: bool },

    #[error("decryption error: {reason}")]
    Decryption { reason: String },

    #[error("merge aborted, segments not completed: {failed_indices:?}")]
    MergeIncomplete { failed_indices: Vec<u64> },

    #[error("HTTP request failed: {source}")]
    Network {
        #[from]
        source: reqwest::Error,
    },

    #[error("I/O error: {source}")]
    Io {
        #[from]
        source: std::io::Error,
    },

    #[error("configuration error: {reason}")]
    Configuration { reason: String },

    #[error("no task with id `{id}`")]
    TaskNotFound { id: String },

    #[error("invalid status transition from {from} to {to}")]
    InvalidTransition { from: String, to: String },

    #[error("persistence error: {reason}")]
    Persistence { reason: String },

    #[error("internal error: {reason}")]
    Internal { reason: String },
}

impl DownloadError {
    pub fn invalid_url(input: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::InvalidUrl {
            input: input.into(),
            reason: reason.into(),
        }
    }

    pub fn playlist_fetch(url: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::PlaylistFetch {
            url: url.into(),
            reason: reason.into(),
        }
    }

    pub fn segment_fetch(reason: impl Into<String>, retryable: bool) -> Self {
        Self::SegmentFetch {
            reason: reason.into(),
            retryable,
        }
    }

    pub fn persistence(reason: impl Into<String>) -> Self {
        Self::Persistence {
            reason: reason.into(),
        }
    }

    pub fn internal(reason: impl Into<String>) -> Self {
        Self::Internal {
            reason: reason.into(),
        }
    }

    /// Whether a retry loop may re-attempt the failed operation.
    ///
    /// Disk errors are deliberately non-retryable: a full disk must surface
    /// immediately rather than spin in backoff.
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Cancelled => false,
            Self::InvalidUrl { .. }
            | Self::PlaylistFetch { .. }
            | Self::PlaylistParse { .. }
            | Self::UnsupportedEncryption { .. }
            | Self::KeyFetch { .. }
            | Self::Decryption { .. }
            | Self::MergeIncomplete { .. }
            | Self::Io { .. }
            | Self::Configuration { .. }
            | Self::TaskNotFound { .. }
            | Self::InvalidTransition { .. }
            | Self::Persistence { .. }
            | Self::Internal { .. } => false,
            Self::SegmentFetch { retryable, .. } => *retryable,
            Self::Network { .. } => true,
        }
    }
}

/// HTTP statuses worth retrying: server errors and 429. Every other 4xx is
/// fatal for the resource being fetched.
pub fn status_is_retryable(status: StatusCode) -> bool {
    status.is_server_error() || status == StatusCode::TOO_MANY_REQUESTS
}
