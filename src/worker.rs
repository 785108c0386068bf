// Per-task worker pool: drives a task's segments through the
// fetch → decrypt → stage pipeline with bounded concurrency, then merges.

use crate::config::DownloaderConfig;
use crate::decrypt::Decryptor;
use crate::error::DownloadError;
use crate::fetch::SegmentSource;
use crate::key::{KeySource, derive_iv};
use crate::merge::merge_segments;
use crate::persist::StateStore;
use crate::progress::{EventSender, SpeedEstimator, estimate_eta};
use crate::task::{DownloadTask, SegmentState};
use bytes::Bytes;
use parking_lot::{Mutex, RwLock};
use std::collections::VecDeque;
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::sync::watch;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, warn};

/// Control signal delivered to a running task through its watch channel.
/// Pause and cancel take effect at segment boundaries; cancel additionally
/// aborts in-flight fetches through the cancellation token.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobControl {
    Run,
    Pause,
    Cancel,
}

/// Terminal result of one worker-pool run. The scheduler maps this onto
/// the task status machine.
#[derive(Debug)]
pub enum TaskOutcome {
    Completed { output: PathBuf, bytes: u64 },
    Paused,
    Canceled,
    Failed(DownloadError),
}

/// Task state shared between the scheduler, the worker pool and its
/// progress sampler.
pub struct TaskShared {
    pub task: RwLock<DownloadTask>,
    /// Cumulative bytes fetched, fed by the segment source.
    pub bytes_downloaded: Arc<AtomicU64>,
}

impl TaskShared {
    pub fn new(task: DownloadTask) -> Arc<Self> {
        let bytes = task.progress.bytes_downloaded;
        Arc::new(Self {
            task: RwLock::new(task),
            bytes_downloaded: Arc::new(AtomicU64::new(bytes)),
        })
    }
}

/// Runs one task to an outcome: spawns up to `max_workers_per_task`
/// workers over the segment queue, samples progress on a timer, and
/// merges when every segment is done.
pub struct TaskWorkerPool {
    config: Arc<DownloaderConfig>,
    source: Arc<dyn SegmentSource>,
    keys: Arc<dyn KeySource>,
    decryptor: Arc<Decryptor>,
    events: EventSender,
    store: Option<Arc<StateStore>>,
}

impl TaskWorkerPool {
    pub fn new(
        config: Arc<DownloaderConfig>,
        source: Arc<dyn SegmentSource>,
        keys: Arc<dyn KeySource>,
        decryptor: Arc<Decryptor>,
        events: EventSender,
        store: Option<Arc<StateStore>>,
    ) -> Self {
        Self {
            config,
            source,
            keys,
            decryptor,
            events,
            store,
        }
    }

    pub async fn run(
        &self,
        shared: Arc<TaskShared>,
        control: watch::Receiver<JobControl>,
        token: CancellationToken,
    ) -> TaskOutcome {
        let (task_id, staging_dir, pending) = {
            let mut task = shared.task.write();
            let pending = task.reset_incomplete_segments();
            let done = task.segments.len() - pending.len();
            task.progress.total_count = task.segments.len() as u64;
            task.progress.completed_count = done as u64;
            task.progress.error_count = 0;
            (task.id.clone(), task.staging_dir(), pending)
        };

        if !pending.is_empty()
            && let Err(e) = tokio::fs::create_dir_all(&staging_dir).await
        {
            return TaskOutcome::Failed(DownloadError::from(e));
        }

        let queue: Arc<Mutex<VecDeque<usize>>> = Arc::new(Mutex::new(pending.into()));
        let worker_count = self.config.max_workers_per_task.max(1).min(queue.lock().len().max(1));

        let sampler_stop = CancellationToken::new();
        let sampler = self.spawn_sampler(shared.clone(), task_id.clone(), sampler_stop.clone());

        let mut workers = JoinSet::new();
        for _ in 0..worker_count {
            let queue = queue.clone();
            let shared = shared.clone();
            let control = control.clone();
            let token = token.clone();
            let staging_dir = staging_dir.clone();
            let source = self.source.clone();
            let keys = self.keys.clone();
            let decryptor = self.decryptor.clone();
            workers.spawn(async move {
                loop {
                    if token.is_cancelled() || *control.borrow() != JobControl::Run {
                        break;
                    }
                    let Some(pos) = queue.lock().pop_front() else {
                        break;
                    };
                    process_segment(&shared, pos, &staging_dir, &source, &keys, &decryptor, &token)
                        .await;
                }
            });
        }
        while workers.join_next().await.is_some() {}

        sampler_stop.cancel();
        let _ = sampler.await;
        self.sample_progress(&shared, &task_id);

        if let Some(store) = &self.store {
            let snapshot = shared.task.read().clone();
            if let Err(e) = store.save(&snapshot).await {
                warn!(task_id, error = %e, "Failed to persist task snapshot");
            }
        }

        if token.is_cancelled() {
            return TaskOutcome::Canceled;
        }
        match *control.borrow() {
            JobControl::Cancel => return TaskOutcome::Canceled,
            JobControl::Pause => return TaskOutcome::Paused,
            JobControl::Run => {}
        }

        let (segments, output, failed) = {
            let task = shared.task.read();
            (
                task.segments.clone(),
                task.output_file.clone(),
                task.failed_indices(),
            )
        };
        if !failed.is_empty() {
            return TaskOutcome::Failed(DownloadError::MergeIncomplete {
                failed_indices: failed,
            });
        }

        match merge_segments(&segments, &output, self.config.keep_temp_files).await {
            Ok(bytes) => {
                debug!(task_id, bytes, output = %output.display(), "Task merge complete");
                TaskOutcome::Completed { output, bytes }
            }
            Err(e) => TaskOutcome::Failed(e),
        }
    }

    fn spawn_sampler(
        &self,
        shared: Arc<TaskShared>,
        task_id: String,
        stop: CancellationToken,
    ) -> tokio::task::JoinHandle<()> {
        let interval = self.config.progress_interval;
        let alpha = self.config.speed_smoothing;
        let events = self.events.clone();
        let store = self.store.clone();
        tokio::spawn(async move {
            let mut estimator = SpeedEstimator::new(alpha);
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                tokio::select! {
                    _ = stop.cancelled() => break,
                    _ = ticker.tick() => {}
                }
                let progress = {
                    let mut task = shared.task.write();
                    let bytes = shared.bytes_downloaded.load(Ordering::Relaxed);
                    task.progress.bytes_downloaded = bytes;
                    task.progress.speed = estimator.sample(bytes);
                    task.progress.eta = estimate_eta(&task.progress);
                    task.progress.clone()
                };
                events.emit_progress(&task_id, progress);
                if let Some(store) = &store {
                    let snapshot = shared.task.read().clone();
                    if let Err(e) = store.save(&snapshot).await {
                        warn!(task_id, error = %e, "Failed to persist progress");
                    }
                }
            }
        })
    }

    /// Final synchronous progress refresh after the workers stop.
    fn sample_progress(&self, shared: &TaskShared, task_id: &str) {
        let progress = {
            let mut task = shared.task.write();
            task.progress.bytes_downloaded = shared.bytes_downloaded.load(Ordering::Relaxed);
            task.progress.eta = estimate_eta(&task.progress);
            task.progress.clone()
        };
        self.events.emit_progress(task_id, progress);
    }
}

fn set_segment_state(shared: &TaskShared, pos: usize, state: SegmentState) {
    shared.task.write().segments[pos].state = state;
}

/// Drive one segment through fetch, optional decrypt, and staging.
/// Failures mark the segment `Failed` and bump `error_count`; the worker
/// then moves on so one bad segment does not starve the rest.
async fn process_segment(
    shared: &TaskShared,
    pos: usize,
    staging_dir: &std::path::Path,
    source: &Arc<dyn SegmentSource>,
    keys: &Arc<dyn KeySource>,
    decryptor: &Arc<Decryptor>,
    token: &CancellationToken,
) {
    let segment = shared.task.read().segments[pos].clone();
    let raw_path = staging_dir.join(format!("seg{:06}.raw", segment.index));
    let final_path = staging_dir.join(format!("seg{:06}.bin", segment.index));

    set_segment_state(shared, pos, SegmentState::Fetching);

    let result = async {
        let outcome = source.fetch(&segment, &raw_path, token).await?;
        {
            let mut task = shared.task.write();
            task.segments[pos].attempt_count += outcome.retries;
            task.progress.retry_count += outcome.retries;
            task.segments[pos].state = SegmentState::Fetched;
        }

        if let Some(encryption) = &segment.encryption {
            set_segment_state(shared, pos, SegmentState::Decrypting);
            let key = keys.get_key(&encryption.key_uri, token).await?;
            let iv = derive_iv(encryption.iv, segment.sequence);

            let ciphertext = Bytes::from(tokio::fs::read(&raw_path).await?);
            let plaintext = match decryptor.decrypt(ciphertext, &key, &iv).await {
                Ok(p) => p,
                Err(DownloadError::Decryption { reason }) => {
                    // A corrupt download manifests as a padding failure.
                    // Re-fetch the segment once before giving up.
                    warn!(
                        index = segment.index,
                        reason = %reason,
                        "Decryption failed, re-fetching segment"
                    );
                    let outcome = source.fetch(&segment, &raw_path, token).await?;
                    {
                        let mut task = shared.task.write();
                        task.segments[pos].attempt_count += outcome.retries + 1;
                        task.progress.retry_count += outcome.retries + 1;
                    }
                    let ciphertext = Bytes::from(tokio::fs::read(&raw_path).await?);
                    decryptor.decrypt(ciphertext, &key, &iv).await?
                }
                Err(e) => return Err(e),
            };
            tokio::fs::write(&final_path, &plaintext).await?;
            let _ = tokio::fs::remove_file(&raw_path).await;
        } else {
            tokio::fs::rename(&raw_path, &final_path).await?;
        }
        Ok::<_, DownloadError>(())
    }
    .await;

    match result {
        Ok(()) => {
            let mut task = shared.task.write();
            task.segments[pos].state = SegmentState::Done;
            task.segments[pos].staging_path = Some(final_path);
            task.progress.completed_count += 1;
        }
        Err(DownloadError::Cancelled) => {
            // Leave the segment Pending-equivalent; the resume reset
            // re-queues anything not Done.
            set_segment_state(shared, pos, SegmentState::Pending);
        }
        Err(e) => {
            error!(index = segment.index, error = %e, "Segment failed");
            let mut task = shared.task.write();
            task.segments[pos].state = SegmentState::Failed;
            task.progress.error_count += 1;
        }
    }
}
