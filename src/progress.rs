// Progress reporting: EWMA speed estimation, ETA, and the task event
// stream consumed by the embedding application.

use crate::task::{TaskProgress, TaskStatus};
use std::path::PathBuf;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tracing::trace;

/// Exponentially weighted moving average of download speed.
///
/// Sampled at a fixed interval from a monotonically increasing byte
/// counter; the first sample seeds the average directly.
#[derive(Debug)]
pub struct SpeedEstimator {
    alpha: f64,
    last_bytes: u64,
    last_instant: Instant,
    speed: Option<f64>,
}

impl SpeedEstimator {
    pub fn new(alpha: f64) -> Self {
        Self {
            alpha: alpha.clamp(0.01, 1.0),
            last_bytes: 0,
            last_instant: Instant::now(),
            speed: None,
        }
    }

    /// Feed the current cumulative byte count; returns the smoothed
    /// bytes/sec estimate.
    pub fn sample(&mut self, total_bytes: u64) -> f64 {
        let now = Instant::now();
        let elapsed = now.saturating_duration_since(self.last_instant).as_secs_f64();
        if elapsed <= 0.0 {
            return self.speed.unwrap_or(0.0);
        }
        let delta = total_bytes.saturating_sub(self.last_bytes) as f64;
        let instantaneous = delta / elapsed;
        self.last_bytes = total_bytes;
        self.last_instant = now;

        let smoothed = match self.speed {
            None => instantaneous,
            Some(prev) => self.alpha * instantaneous + (1.0 - self.alpha) * prev,
        };
        self.speed = Some(smoothed);
        smoothed
    }

    pub fn current(&self) -> f64 {
        self.speed.unwrap_or(0.0)
    }
}

/// Estimate seconds remaining. `None` means "still calculating": no speed
/// estimate yet, or nothing completed to extrapolate from.
pub fn estimate_eta(progress: &TaskProgress) -> Option<u64> {
    if progress.speed <= f64::EPSILON {
        return None;
    }
    let remaining_bytes = match progress.total_bytes {
        Some(total) => total.saturating_sub(progress.bytes_downloaded) as f64,
        None => {
            // Total size is unknown for HLS until every segment is fetched;
            // extrapolate from the average size of completed segments.
            if progress.completed_count == 0 {
                return None;
            }
            let avg = progress.bytes_downloaded as f64 / progress.completed_count as f64;
            let remaining = progress
                .total_count
                .saturating_sub(progress.completed_count) as f64;
            avg * remaining
        }
    };
    Some((remaining_bytes / progress.speed).ceil() as u64)
}

/// Events published by the scheduler and worker pool.
#[derive(Debug, Clone)]
pub enum TaskEvent {
    /// Periodic progress snapshot for a running task.
    Progress {
        task_id: String,
        progress: TaskProgress,
    },
    StatusChanged {
        task_id: String,
        old: TaskStatus,
        new: TaskStatus,
    },
    Completed {
        task_id: String,
        output: PathBuf,
    },
    Failed {
        task_id: String,
        error: String,
    },
}

/// Event channel handle shared by scheduler and workers.
///
/// Progress snapshots are best-effort: a slow consumer drops them rather
/// than stalling the download. Lifecycle events are awaited so they are
/// never lost.
#[derive(Clone)]
pub struct EventSender {
    tx: mpsc::Sender<TaskEvent>,
}

impl EventSender {
    pub fn channel(capacity: usize) -> (Self, mpsc::Receiver<TaskEvent>) {
        let (tx, rx) = mpsc::channel(capacity);
        (Self { tx }, rx)
    }

    pub fn emit_progress(&self, task_id: &str, progress: TaskProgress) {
        let event = TaskEvent::Progress {
            task_id: task_id.to_string(),
            progress,
        };
        if self.tx.try_send(event).is_err() {
            trace!(task_id, "Dropped progress event for slow consumer");
        }
    }

    pub async fn send(&self, event: TaskEvent) {
        // Receiver dropped means the embedder stopped listening; harmless.
        let _ = self.tx.send(event).await;
    }
}
