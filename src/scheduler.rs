// Multi-task scheduler: admission control, priority queueing, and the
// pause/resume/cancel lifecycle around the per-task worker pool.

use crate::config::DownloaderConfig;
use crate::decrypt::Decryptor;
use crate::error::DownloadError;
use crate::fetch::{SegmentFetcher, SegmentSource};
use crate::key::{KeyProvider, KeySource};
use crate::limiter::BandwidthLimiter;
use crate::persist::StateStore;
use crate::playlist::PlaylistResolver;
use crate::progress::{EventSender, TaskEvent};
use crate::task::{DownloadTask, Priority, TaskStatus};
use crate::worker::{JobControl, TaskOutcome, TaskShared, TaskWorkerPool};
use parking_lot::Mutex;
use std::cmp::Ordering;
use std::collections::{BinaryHeap, HashMap};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::{mpsc, watch};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use url::Url;

/// Queue entry ordered by priority tier, then submission order within a
/// tier (FIFO).
#[derive(Debug, Clone, PartialEq, Eq)]
struct QueuedTask {
    priority: Priority,
    seq: u64,
    id: String,
}

impl Ord for QueuedTask {
    fn cmp(&self, other: &Self) -> Ordering {
        // BinaryHeap is a max-heap: lower rank and lower seq must compare
        // greater so they pop first.
        other
            .priority
            .rank()
            .cmp(&self.priority.rank())
            .then(other.seq.cmp(&self.seq))
    }
}

impl PartialOrd for QueuedTask {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

struct TaskEntry {
    shared: Arc<TaskShared>,
    control: watch::Sender<JobControl>,
    token: CancellationToken,
    /// Whether a lifecycle run currently holds a concurrency slot.
    active: bool,
}

struct SchedState {
    entries: HashMap<String, TaskEntry>,
    queue: BinaryHeap<QueuedTask>,
    running: usize,
    next_seq: u64,
}

struct SchedulerInner {
    config: Arc<DownloaderConfig>,
    client: reqwest::Client,
    limiter: Arc<BandwidthLimiter>,
    keys: Arc<KeyProvider>,
    decryptor: Arc<Decryptor>,
    events: EventSender,
    store: Option<Arc<StateStore>>,
    state: Mutex<SchedState>,
}

/// Download scheduler. Cheap to clone; all clones share the same state.
#[derive(Clone)]
pub struct Scheduler {
    inner: Arc<SchedulerInner>,
}

impl Scheduler {
    /// Build a scheduler from configuration. Returns the scheduler and the
    /// event stream the embedding application consumes.
    pub async fn new(
        config: DownloaderConfig,
    ) -> Result<(Self, mpsc::Receiver<TaskEvent>), DownloadError> {
        let config = Arc::new(config);
        let client = config.build_http_client()?;
        let store = match &config.state_directory {
            Some(dir) => Some(Arc::new(StateStore::new(dir.clone()).await?)),
            None => None,
        };
        let (events, rx) = EventSender::channel(256);
        let inner = Arc::new(SchedulerInner {
            client: client.clone(),
            limiter: Arc::new(BandwidthLimiter::new(config.bandwidth_limit)),
            keys: Arc::new(KeyProvider::new(client, config.clone())),
            decryptor: Arc::new(Decryptor::new(config.offload_decryption)),
            events,
            store,
            state: Mutex::new(SchedState {
                entries: HashMap::new(),
                queue: BinaryHeap::new(),
                running: 0,
                next_seq: 0,
            }),
            config,
        });
        Ok((Self { inner }, rx))
    }

    /// Submit a new download. Returns the generated task id. The task is
    /// queued and starts as soon as a concurrency slot frees up.
    pub async fn submit(
        &self,
        url: &str,
        name: &str,
        output: Option<PathBuf>,
        priority: Priority,
    ) -> Result<String, DownloadError> {
        Url::parse(url).map_err(|e| DownloadError::invalid_url(url, e.to_string()))?;
        let id = uuid::Uuid::new_v4().to_string();
        let output = output.unwrap_or_else(|| self.inner.config.output_directory.join(name));
        let task = DownloadTask::new(id.clone(), name, url, output, priority);
        self.register(task, true).await?;
        Ok(id)
    }

    /// Register an existing task record, e.g. one restored from disk.
    pub async fn submit_task(&self, task: DownloadTask) -> Result<String, DownloadError> {
        let id = task.id.clone();
        self.register(task, true).await?;
        Ok(id)
    }

    async fn register(&self, task: DownloadTask, enqueue: bool) -> Result<(), DownloadError> {
        if let Some(store) = &self.inner.store {
            store.save(&task).await?;
        }
        let id = task.id.clone();
        let priority = task.priority;
        let queue_it = enqueue && task.status == TaskStatus::Pending;
        {
            let mut state = self.inner.state.lock();
            if state.entries.contains_key(&id) {
                return Err(DownloadError::Configuration {
                    reason: format!("task `{id}` is already registered"),
                });
            }
            let (control, _) = watch::channel(JobControl::Run);
            state.entries.insert(
                id.clone(),
                TaskEntry {
                    shared: TaskShared::new(task),
                    control,
                    token: CancellationToken::new(),
                    active: false,
                },
            );
            if queue_it {
                let seq = state.next_seq;
                state.next_seq += 1;
                state.queue.push(QueuedTask { priority, seq, id });
            }
        }
        self.inner.clone().maybe_admit();
        Ok(())
    }

    /// Restore persisted tasks from the state store. Tasks that were
    /// running when the process died come back `Paused`; pending tasks
    /// re-enter the queue.
    pub async fn restore(&self) -> Result<Vec<String>, DownloadError> {
        let Some(store) = &self.inner.store else {
            return Ok(Vec::new());
        };
        let mut restored = Vec::new();
        for mut task in store.load_all().await? {
            if task.status == TaskStatus::Running {
                task.status = TaskStatus::Paused;
            }
            let id = task.id.clone();
            if self.register(task, true).await.is_ok() {
                restored.push(id);
            }
        }
        info!(count = restored.len(), "Restored persisted tasks");
        Ok(restored)
    }

    /// Pause a running task. Takes effect at the next segment boundary;
    /// in-flight segments finish and their progress is kept.
    pub fn pause(&self, id: &str) -> Result<(), DownloadError> {
        let state = self.inner.state.lock();
        let entry = state
            .entries
            .get(id)
            .ok_or_else(|| DownloadError::TaskNotFound { id: id.to_string() })?;
        let status = entry.shared.task.read().status;
        if status != TaskStatus::Running {
            return Err(DownloadError::InvalidTransition {
                from: status.to_string(),
                to: TaskStatus::Paused.to_string(),
            });
        }
        entry.control.send_replace(JobControl::Pause);
        debug!(task_id = id, "Pause requested");
        Ok(())
    }

    /// Resume a paused or failed task. The task is re-queued and keeps its
    /// current status until a concurrency slot admits it; failed tasks are
    /// reset so their unfinished segments are re-attempted.
    pub async fn resume(&self, id: &str) -> Result<(), DownloadError> {
        let snapshot = {
            let mut state = self.inner.state.lock();
            let entry = state
                .entries
                .get_mut(id)
                .ok_or_else(|| DownloadError::TaskNotFound { id: id.to_string() })?;
            let mut task = entry.shared.task.write();
            match task.status {
                TaskStatus::Paused => {}
                // Failed is terminal in the forward machine; resuming a
                // failed task explicitly re-opens it as Pending.
                TaskStatus::Failed => task.status = TaskStatus::Pending,
                other => {
                    return Err(DownloadError::InvalidTransition {
                        from: other.to_string(),
                        to: TaskStatus::Running.to_string(),
                    });
                }
            }
            entry.control.send_replace(JobControl::Run);
            let priority = task.priority;
            let snapshot = task.clone();
            drop(task);

            let seq = state.next_seq;
            state.next_seq += 1;
            state.queue.push(QueuedTask {
                priority,
                seq,
                id: id.to_string(),
            });
            snapshot
        };
        if let Some(store) = &self.inner.store {
            store.save(&snapshot).await?;
        }
        self.inner.clone().maybe_admit();
        Ok(())
    }

    /// Cancel a task. Running tasks abort their in-flight fetches; queued
    /// tasks are finalized directly. Staged files are left for `remove`.
    pub async fn cancel(&self, id: &str) -> Result<(), DownloadError> {
        let snapshot = {
            let mut state = self.inner.state.lock();
            let entry = state
                .entries
                .get_mut(id)
                .ok_or_else(|| DownloadError::TaskNotFound { id: id.to_string() })?;
            let status = entry.shared.task.read().status;
            if status.is_terminal() {
                return Err(DownloadError::InvalidTransition {
                    from: status.to_string(),
                    to: TaskStatus::Canceled.to_string(),
                });
            }
            entry.control.send_replace(JobControl::Cancel);
            entry.token.cancel();
            if entry.active {
                // The lifecycle run observes the token and finalizes.
                None
            } else {
                let mut task = entry.shared.task.write();
                let old = task.transition(TaskStatus::Canceled)?;
                Some((task.clone(), old))
            }
        };
        if let Some((task, old)) = snapshot {
            self.inner
                .events
                .send(TaskEvent::StatusChanged {
                    task_id: id.to_string(),
                    old,
                    new: TaskStatus::Canceled,
                })
                .await;
            if let Some(store) = &self.inner.store {
                store.save(&task).await?;
            }
        }
        Ok(())
    }

    /// Remove a task from the scheduler. Active tasks are cancelled first.
    /// With `delete_files`, staged segments and the output file are
    /// deleted as well.
    pub async fn remove(&self, id: &str, delete_files: bool) -> Result<(), DownloadError> {
        let entry = {
            let mut state = self.inner.state.lock();
            let entry = state
                .entries
                .remove(id)
                .ok_or_else(|| DownloadError::TaskNotFound { id: id.to_string() })?;
            entry.token.cancel();
            entry.control.send_replace(JobControl::Cancel);
            entry
        };
        if let Some(store) = &self.inner.store {
            store.remove(id).await?;
        }
        if delete_files {
            let (output, staging) = {
                let task = entry.shared.task.read();
                (task.output_file.clone(), task.staging_dir())
            };
            let _ = tokio::fs::remove_file(&output).await;
            let _ = tokio::fs::remove_dir_all(&staging).await;
        }
        debug!(task_id = id, delete_files, "Removed task");
        Ok(())
    }

    /// Snapshot of one task's current state.
    pub fn snapshot(&self, id: &str) -> Result<DownloadTask, DownloadError> {
        let state = self.inner.state.lock();
        state
            .entries
            .get(id)
            .map(|e| e.shared.task.read().clone())
            .ok_or_else(|| DownloadError::TaskNotFound { id: id.to_string() })
    }

    /// Snapshots of every registered task.
    pub fn list(&self) -> Vec<DownloadTask> {
        let state = self.inner.state.lock();
        state
            .entries
            .values()
            .map(|e| e.shared.task.read().clone())
            .collect()
    }
}

/// What to do with a popped queue entry.
enum Admission {
    Admit,
    /// Admissible status but its previous run has not released the slot
    /// yet; keep the entry queued and retry when the slot frees.
    Defer,
    /// Removed, cancelled, or in a state the queue no longer applies to.
    Discard,
}

impl SchedulerInner {
    /// Admit queued tasks while concurrency slots are free. Stale queue
    /// entries are discarded; entries whose previous run is still
    /// finalizing stay queued, otherwise a resume landing in that window
    /// would be acknowledged and then lost.
    fn maybe_admit(self: Arc<Self>) {
        let mut to_spawn = Vec::new();
        {
            let mut state = self.state.lock();
            let mut deferred = Vec::new();
            while state.running < self.config.max_concurrent_tasks {
                let Some(queued) = state.queue.pop() else {
                    break;
                };
                let admission = match state.entries.get(&queued.id) {
                    None => Admission::Discard,
                    Some(e) if e.token.is_cancelled() => Admission::Discard,
                    Some(e) => match e.shared.task.read().status {
                        TaskStatus::Pending | TaskStatus::Paused => {
                            if e.active {
                                Admission::Defer
                            } else {
                                Admission::Admit
                            }
                        }
                        _ => Admission::Discard,
                    },
                };
                match admission {
                    Admission::Admit => {
                        if let Some(entry) = state.entries.get_mut(&queued.id) {
                            entry.active = true;
                            state.running += 1;
                            to_spawn.push(queued.id);
                        }
                    }
                    Admission::Defer => deferred.push(queued),
                    Admission::Discard => {}
                }
            }
            for queued in deferred {
                state.queue.push(queued);
            }
        }
        for id in to_spawn {
            let inner = self.clone();
            tokio::spawn(async move {
                run_lifecycle(inner, id).await;
            });
        }
    }
}

/// One admitted run of a task: resolve if needed, drive the worker pool,
/// finalize status, release the slot and admit the next task.
async fn run_lifecycle(inner: Arc<SchedulerInner>, id: String) {
    let lookup = {
        let state = inner.state.lock();
        state
            .entries
            .get(&id)
            .map(|e| (e.shared.clone(), e.control.subscribe(), e.token.clone()))
    };
    let Some((shared, control_rx, token)) = lookup else {
        // Removed between admission and start.
        {
            let mut state = inner.state.lock();
            state.running = state.running.saturating_sub(1);
        }
        inner.clone().maybe_admit();
        return;
    };

    let old = {
        let mut task = shared.task.write();
        match task.transition(TaskStatus::Running) {
            Ok(old) => old,
            Err(e) => {
                warn!(task_id = id, error = %e, "Task not admissible at start");
                finalize_slot(&inner, &id);
                inner.clone().maybe_admit();
                return;
            }
        }
    };
    inner
        .events
        .send(TaskEvent::StatusChanged {
            task_id: id.clone(),
            old,
            new: TaskStatus::Running,
        })
        .await;
    persist(&inner, &shared, &id).await;

    // First admission resolves the playlist; resumes reuse the captured
    // segment list.
    let resolved = shared.task.read().resolved;
    if !resolved {
        let resolver = PlaylistResolver::new(inner.client.clone(), inner.config.clone());
        let url = shared.task.read().url.clone();
        match resolver.resolve(&url).await {
            Ok(playlist) => {
                let mut task = shared.task.write();
                task.progress.total_count = playlist.segments.len() as u64;
                task.segments = playlist.segments;
                task.resolved = true;
            }
            Err(e) => {
                fail_task(&inner, &shared, &id, e).await;
                finalize_slot(&inner, &id);
                inner.clone().maybe_admit();
                return;
            }
        }
    }

    let source: Arc<dyn SegmentSource> = Arc::new(SegmentFetcher::new(
        inner.client.clone(),
        inner.config.clone(),
        inner.limiter.clone(),
        shared.bytes_downloaded.clone(),
    ));
    let keys: Arc<dyn KeySource> = inner.keys.clone();
    let pool = TaskWorkerPool::new(
        inner.config.clone(),
        source,
        keys,
        inner.decryptor.clone(),
        inner.events.clone(),
        inner.store.clone(),
    );
    let outcome = pool.run(shared.clone(), control_rx, token).await;

    match outcome {
        TaskOutcome::Completed { output, .. } => {
            set_status(&inner, &shared, &id, TaskStatus::Completed).await;
            inner
                .events
                .send(TaskEvent::Completed {
                    task_id: id.clone(),
                    output,
                })
                .await;
        }
        TaskOutcome::Paused => {
            set_status(&inner, &shared, &id, TaskStatus::Paused).await;
        }
        TaskOutcome::Canceled => {
            set_status(&inner, &shared, &id, TaskStatus::Canceled).await;
        }
        TaskOutcome::Failed(e) => {
            fail_task(&inner, &shared, &id, e).await;
        }
    }
    persist(&inner, &shared, &id).await;

    finalize_slot(&inner, &id);
    inner.clone().maybe_admit();
}

fn finalize_slot(inner: &Arc<SchedulerInner>, id: &str) {
    let mut state = inner.state.lock();
    state.running = state.running.saturating_sub(1);
    if let Some(entry) = state.entries.get_mut(id) {
        entry.active = false;
    }
}

async fn set_status(
    inner: &Arc<SchedulerInner>,
    shared: &Arc<TaskShared>,
    id: &str,
    status: TaskStatus,
) {
    let old = {
        let mut task = shared.task.write();
        match task.transition(status) {
            Ok(old) => old,
            Err(e) => {
                warn!(task_id = id, error = %e, "Skipping status transition");
                return;
            }
        }
    };
    inner
        .events
        .send(TaskEvent::StatusChanged {
            task_id: id.to_string(),
            old,
            new: status,
        })
        .await;
}

async fn fail_task(
    inner: &Arc<SchedulerInner>,
    shared: &Arc<TaskShared>,
    id: &str,
    error: DownloadError,
) {
    warn!(task_id = id, error = %error, "Task failed");
    set_status(inner, shared, id, TaskStatus::Failed).await;
    inner
        .events
        .send(TaskEvent::Failed {
            task_id: id.to_string(),
            error: error.to_string(),
        })
        .await;
}

async fn persist(inner: &Arc<SchedulerInner>, shared: &Arc<TaskShared>, id: &str) {
    if let Some(store) = &inner.store {
        let snapshot = shared.task.read().clone();
        if let Err(e) = store.save(&snapshot).await {
            warn!(task_id = id, error = %e, "Failed to persist task");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::task::Segment;
    use std::time::Duration;
    use tempfile::tempdir;

    #[test]
    fn queue_orders_by_priority_then_fifo() {
        let mut heap = BinaryHeap::new();
        heap.push(QueuedTask {
            priority: Priority::Low,
            seq: 0,
            id: "low".into(),
        });
        heap.push(QueuedTask {
            priority: Priority::Normal,
            seq: 1,
            id: "normal-a".into(),
        });
        heap.push(QueuedTask {
            priority: Priority::High,
            seq: 2,
            id: "high".into(),
        });
        heap.push(QueuedTask {
            priority: Priority::Normal,
            seq: 3,
            id: "normal-b".into(),
        });

        let order: Vec<String> = std::iter::from_fn(|| heap.pop().map(|q| q.id)).collect();
        assert_eq!(order, vec!["high", "normal-a", "normal-b", "low"]);
    }

    fn resolved_empty_task(id: &str, dir: &std::path::Path, priority: Priority) -> DownloadTask {
        let mut task = DownloadTask::new(
            id,
            id,
            "https://cdn.example.com/main.m3u8",
            dir.join(format!("{id}.ts")),
            priority,
        );
        task.resolved = true;
        task
    }

    async fn wait_for_status(
        scheduler: &Scheduler,
        id: &str,
        status: TaskStatus,
    ) {
        for _ in 0..200 {
            if scheduler.snapshot(id).unwrap().status == status {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!(
            "task {id} never reached {status}, currently {}",
            scheduler.snapshot(id).unwrap().status
        );
    }

    #[tokio::test]
    async fn resolved_tasks_run_to_completion() {
        let dir = tempdir().unwrap();
        let config = DownloaderConfig {
            max_concurrent_tasks: 2,
            output_directory: dir.path().to_path_buf(),
            ..Default::default()
        };
        let (scheduler, _rx) = Scheduler::new(config).await.unwrap();

        for i in 0..4 {
            let task = resolved_empty_task(&format!("t{i}"), dir.path(), Priority::Normal);
            scheduler.submit_task(task).await.unwrap();
        }
        for i in 0..4 {
            wait_for_status(&scheduler, &format!("t{i}"), TaskStatus::Completed).await;
            assert!(dir.path().join(format!("t{i}.ts")).exists());
        }
    }

    #[tokio::test]
    async fn rejects_duplicate_ids_and_unknown_tasks() {
        let dir = tempdir().unwrap();
        let (scheduler, _rx) = Scheduler::new(DownloaderConfig {
            output_directory: dir.path().to_path_buf(),
            ..Default::default()
        })
        .await
        .unwrap();
        let task = resolved_empty_task("dup", dir.path(), Priority::Normal);
        scheduler.submit_task(task.clone()).await.unwrap();
        wait_for_status(&scheduler, "dup", TaskStatus::Completed).await;
        assert!(scheduler.submit_task(task).await.is_err());
        assert!(matches!(
            scheduler.pause("missing"),
            Err(DownloadError::TaskNotFound { .. })
        ));
    }

    #[tokio::test]
    async fn submit_rejects_bad_url() {
        let (scheduler, _rx) = Scheduler::new(DownloaderConfig::default()).await.unwrap();
        let result = scheduler
            .submit("not a url", "clip", None, Priority::Normal)
            .await;
        assert!(matches!(result, Err(DownloadError::InvalidUrl { .. })));
    }

    #[tokio::test]
    async fn pause_requires_running_task() {
        let dir = tempdir().unwrap();
        let (scheduler, _rx) = Scheduler::new(DownloaderConfig {
            output_directory: dir.path().to_path_buf(),
            ..Default::default()
        })
        .await
        .unwrap();
        let task = resolved_empty_task("p1", dir.path(), Priority::Normal);
        scheduler.submit_task(task).await.unwrap();
        wait_for_status(&scheduler, "p1", TaskStatus::Completed).await;
        assert!(matches!(
            scheduler.pause("p1"),
            Err(DownloadError::InvalidTransition { .. })
        ));
    }

    #[tokio::test]
    async fn cancel_queued_task_finalizes_directly() {
        let dir = tempdir().unwrap();
        let config = DownloaderConfig {
            // No slots: submitted tasks stay queued.
            max_concurrent_tasks: 0,
            output_directory: dir.path().to_path_buf(),
            ..Default::default()
        };
        let (scheduler, _rx) = Scheduler::new(config).await.unwrap();
        let task = resolved_empty_task("q1", dir.path(), Priority::Normal);
        scheduler.submit_task(task).await.unwrap();
        assert_eq!(scheduler.snapshot("q1").unwrap().status, TaskStatus::Pending);

        scheduler.cancel("q1").await.unwrap();
        assert_eq!(
            scheduler.snapshot("q1").unwrap().status,
            TaskStatus::Canceled
        );
        // Terminal tasks cannot be cancelled again.
        assert!(scheduler.cancel("q1").await.is_err());
    }

    #[tokio::test]
    async fn remove_deletes_state() {
        let dir = tempdir().unwrap();
        let state_dir = dir.path().join("state");
        let config = DownloaderConfig {
            max_concurrent_tasks: 0,
            output_directory: dir.path().to_path_buf(),
            state_directory: Some(state_dir.clone()),
            ..Default::default()
        };
        let (scheduler, _rx) = Scheduler::new(config).await.unwrap();
        let task = resolved_empty_task("r1", dir.path(), Priority::Normal);
        scheduler.submit_task(task).await.unwrap();
        assert!(state_dir.join("r1.json").exists());

        scheduler.remove("r1", true).await.unwrap();
        assert!(!state_dir.join("r1.json").exists());
        assert!(scheduler.snapshot("r1").is_err());
    }

    #[tokio::test]
    async fn resume_during_run_finalization_is_not_lost() {
        let dir = tempdir().unwrap();
        let config = DownloaderConfig {
            max_concurrent_tasks: 2,
            output_directory: dir.path().to_path_buf(),
            ..Default::default()
        };
        let (scheduler, _rx) = Scheduler::new(config).await.unwrap();
        let mut task = resolved_empty_task("w1", dir.path(), Priority::Normal);
        task.status = TaskStatus::Paused;
        scheduler.submit_task(task).await.unwrap();

        // Emulate the end-of-run window: the task already reads Paused but
        // its run has not released the concurrency slot yet.
        {
            let mut state = scheduler.inner.state.lock();
            state.running = 1;
            state.entries.get_mut("w1").unwrap().active = true;
        }
        // A caller reacting to the Paused status resumes immediately. The
        // queue entry must survive until the slot frees.
        scheduler.resume("w1").await.unwrap();

        // The run finalizes and admission is retried.
        {
            let mut state = scheduler.inner.state.lock();
            state.running = 0;
            state.entries.get_mut("w1").unwrap().active = false;
        }
        scheduler.inner.clone().maybe_admit();
        wait_for_status(&scheduler, "w1", TaskStatus::Completed).await;
    }

    #[tokio::test]
    async fn restore_requeues_persisted_tasks() {
        let dir = tempdir().unwrap();
        let state_dir = dir.path().join("state");
        let config = DownloaderConfig {
            output_directory: dir.path().to_path_buf(),
            state_directory: Some(state_dir.clone()),
            ..Default::default()
        };

        // First scheduler run: a task that never got admitted.
        {
            let store = StateStore::new(&state_dir).await.unwrap();
            let mut task = resolved_empty_task("keep", dir.path(), Priority::Normal);
            task.segments
                .push(Segment::new(0, 0, "https://cdn/s0.ts".into()));
            task.status = TaskStatus::Running;
            store.save(&task).await.unwrap();
        }

        let (scheduler, _rx) = Scheduler::new(config).await.unwrap();
        let restored = scheduler.restore().await.unwrap();
        assert_eq!(restored, vec!["keep".to_string()]);
        // Interrupted running tasks come back paused.
        assert_eq!(scheduler.snapshot("keep").unwrap().status, TaskStatus::Paused);
    }

    #[tokio::test]
    async fn priority_governs_admission_order() {
        let dir = tempdir().unwrap();
        let config = DownloaderConfig {
            // Stage the queue with no slots, then observe admission order
            // indirectly through completion.
            max_concurrent_tasks: 0,
            output_directory: dir.path().to_path_buf(),
            ..Default::default()
        };
        let (scheduler, mut rx) = Scheduler::new(config).await.unwrap();
        scheduler
            .submit_task(resolved_empty_task("low", dir.path(), Priority::Low))
            .await
            .unwrap();
        scheduler
            .submit_task(resolved_empty_task("high", dir.path(), Priority::High))
            .await
            .unwrap();

        // Open one slot by resuming admission with a raised limit is not
        // possible at runtime; instead verify the queue order directly.
        let order: Vec<String> = {
            let mut state = scheduler.inner.state.lock();
            std::iter::from_fn(|| state.queue.pop().map(|q| q.id)).collect()
        };
        assert_eq!(order, vec!["high", "low"]);
        assert!(rx.try_recv().is_err());
    }
}
