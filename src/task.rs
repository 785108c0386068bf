// Task and segment data model shared by the worker pool, scheduler and
// persistence layer.

use crate::error::DownloadError;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Path, PathBuf};

/// Scheduling priority. High-priority tasks are admitted before Normal,
/// Normal before Low; submission order breaks ties.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum Priority {
    High,
    #[default]
    Normal,
    Low,
}

impl Priority {
    pub fn rank(self) -> u8 {
        match self {
            Priority::High => 0,
            Priority::Normal => 1,
            Priority::Low => 2,
        }
    }
}

/// Closed task state machine.
///
/// `Pending → Running → {Paused, Completed, Failed, Canceled}`,
/// `Paused → Running` (resume) and `Paused → Canceled`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TaskStatus {
    Pending,
    Running,
    Paused,
    Completed,
    Failed,
    Canceled,
}

impl TaskStatus {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            TaskStatus::Completed | TaskStatus::Failed | TaskStatus::Canceled
        )
    }

    pub fn can_transition_to(self, next: TaskStatus) -> bool {
        match self {
            TaskStatus::Pending => matches!(
                next,
                TaskStatus::Running | TaskStatus::Canceled | TaskStatus::Failed
            ),
            TaskStatus::Running => matches!(
                next,
                TaskStatus::Paused
                    | TaskStatus::Completed
                    | TaskStatus::Failed
                    | TaskStatus::Canceled
            ),
            TaskStatus::Paused => matches!(next, TaskStatus::Running | TaskStatus::Canceled),
            TaskStatus::Completed | TaskStatus::Failed | TaskStatus::Canceled => false,
        }
    }
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            TaskStatus::Pending => "pending",
            TaskStatus::Running => "running",
            TaskStatus::Paused => "paused",
            TaskStatus::Completed => "completed",
            TaskStatus::Failed => "failed",
            TaskStatus::Canceled => "canceled",
        };
        f.write_str(s)
    }
}

/// Per-segment pipeline state. Only advances forward, except the
/// `Failed → Pending` reset performed when a task is resumed for retry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SegmentState {
    Pending,
    Fetching,
    Fetched,
    Decrypting,
    Done,
    Failed,
}

/// Byte range for `EXT-X-BYTERANGE` segments (`length@offset`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ByteRangeSpec {
    pub length: u64,
    pub offset: Option<u64>,
}

impl ByteRangeSpec {
    /// HTTP `Range` header value for this byte range. Zero-length ranges
    /// are rejected at playlist parse time; the arithmetic still saturates
    /// so a degenerate spec cannot underflow.
    pub fn header_value(&self) -> String {
        let start = self.offset.unwrap_or(0);
        let end = start
            .saturating_add(self.length)
            .saturating_sub(1)
            .max(start);
        format!("bytes={start}-{end}")
    }
}

/// Encryption parameters attached to a single segment.
///
/// Carried per segment, not per task, so playlists that rotate keys
/// mid-stream (multiple `EXT-X-KEY` tags) decrypt correctly.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EncryptionSpec {
    /// Absolute key URI.
    pub key_uri: String,
    /// Explicit IV from the playlist, if present. When absent the IV is
    /// derived from the segment's media sequence number.
    pub iv: Option<[u8; 16]>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Segment {
    /// 0-based position in the merge order.
    pub index: u64,
    /// Media sequence number (`EXT-X-MEDIA-SEQUENCE` base + offset), the
    /// input to implicit IV derivation.
    pub sequence: u64,
    /// Absolute segment URL.
    pub url: String,
    pub byte_range: Option<ByteRangeSpec>,
    pub encryption: Option<EncryptionSpec>,
    pub state: SegmentState,
    /// Location of the decrypted segment bytes once `Done`.
    pub staging_path: Option<PathBuf>,
    /// Fetch retries consumed so far across all attempts.
    pub attempt_count: u32,
}

impl Segment {
    pub fn new(index: u64, sequence: u64, url: String) -> Self {
        Self {
            index,
            sequence,
            url,
            byte_range: None,
            encryption: None,
            state: SegmentState::Pending,
            staging_path: None,
            attempt_count: 0,
        }
    }
}

/// Aggregated task progress, published on the event stream and persisted.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TaskProgress {
    pub completed_count: u64,
    pub total_count: u64,
    pub bytes_downloaded: u64,
    /// Usually unknown for HLS until every segment has been fetched.
    pub total_bytes: Option<u64>,
    /// EWMA of bytes/sec.
    pub speed: f64,
    /// Estimated seconds remaining; `None` means "calculating".
    pub eta: Option<u64>,
    pub retry_count: u32,
    pub error_count: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DownloadTask {
    pub id: String,
    pub name: String,
    /// Playlist URL the task was created from.
    pub url: String,
    pub output_file: PathBuf,
    pub priority: Priority,
    pub status: TaskStatus,
    /// Ordered by `index`; captured once at playlist resolution and reused
    /// on resume so the playlist is never re-fetched.
    pub segments: Vec<Segment>,
    pub progress: TaskProgress,
    /// Whether playlist resolution already ran for this task.
    pub resolved: bool,
}

impl DownloadTask {
    pub fn new(
        id: impl Into<String>,
        name: impl Into<String>,
        url: impl Into<String>,
        output_file: PathBuf,
        priority: Priority,
    ) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            url: url.into(),
            output_file,
            priority,
            status: TaskStatus::Pending,
            segments: Vec::new(),
            progress: TaskProgress::default(),
            resolved: false,
        }
    }

    /// Directory holding staged segment files for this task.
    pub fn staging_dir(&self) -> PathBuf {
        staging_dir_for(&self.output_file)
    }

    /// Enforced transition. Returns the previous status.
    pub fn transition(&mut self, next: TaskStatus) -> Result<TaskStatus, DownloadError> {
        if !self.status.can_transition_to(next) {
            return Err(DownloadError::InvalidTransition {
                from: self.status.to_string(),
                to: next.to_string(),
            });
        }
        let old = self.status;
        self.status = next;
        Ok(old)
    }

    /// Indices of segments that still need work (everything not `Done`).
    /// In-flight states left over from an interrupted run are reset to
    /// `Pending`; `Failed` segments are reset too so a resume re-attempts
    /// exactly the segments that did not finish.
    pub fn reset_incomplete_segments(&mut self) -> Vec<usize> {
        let mut pending = Vec::new();
        for (pos, seg) in self.segments.iter_mut().enumerate() {
            if seg.state != SegmentState::Done {
                seg.state = SegmentState::Pending;
                pending.push(pos);
            }
        }
        pending
    }

    pub fn failed_indices(&self) -> Vec<u64> {
        self.segments
            .iter()
            .filter(|s| s.state == SegmentState::Failed)
            .map(|s| s.index)
            .collect()
    }
}

/// Staging directory derived from the output path: `video.mp4` stages into
/// `video.mp4.parts/` alongside the output.
pub fn staging_dir_for(output_file: &Path) -> PathBuf {
    let mut name = output_file
        .file_name()
        .map(|n| n.to_os_string())
        .unwrap_or_else(|| "output".into());
    name.push(".parts");
    output_file.with_file_name(name)
}
