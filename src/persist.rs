// Task persistence: one JSON file per task, written atomically so a crash
// mid-save never corrupts an existing record.

use crate::error::DownloadError;
use crate::task::DownloadTask;
use std::path::{Path, PathBuf};
use tokio::fs;
use tracing::warn;

pub struct StateStore {
    dir: PathBuf,
}

impl StateStore {
    pub async fn new(dir: impl Into<PathBuf>) -> Result<Self, DownloadError> {
        let dir = dir.into();
        fs::create_dir_all(&dir).await.map_err(|e| {
            DownloadError::persistence(format!(
                "failed to create state directory {}: {e}",
                dir.display()
            ))
        })?;
        Ok(Self { dir })
    }

    fn path_for(&self, task_id: &str) -> PathBuf {
        self.dir.join(format!("{task_id}.json"))
    }

    /// Persist a task snapshot. Writes to a temp file then renames, so the
    /// previous snapshot survives a crash mid-write.
    pub async fn save(&self, task: &DownloadTask) -> Result<(), DownloadError> {
        let json = serde_json::to_vec_pretty(task).map_err(|e| {
            DownloadError::persistence(format!("failed to serialize task {}: {e}", task.id))
        })?;
        let path = self.path_for(&task.id);
        let tmp = path.with_extension("json.tmp");
        fs::write(&tmp, &json).await.map_err(|e| {
            DownloadError::persistence(format!("failed to write {}: {e}", tmp.display()))
        })?;
        fs::rename(&tmp, &path).await.map_err(|e| {
            DownloadError::persistence(format!("failed to rename {}: {e}", tmp.display()))
        })?;
        Ok(())
    }

    pub async fn load(&self, task_id: &str) -> Result<DownloadTask, DownloadError> {
        let path = self.path_for(task_id);
        let bytes = fs::read(&path).await.map_err(|e| {
            DownloadError::persistence(format!("failed to read {}: {e}", path.display()))
        })?;
        serde_json::from_slice(&bytes).map_err(|e| {
            DownloadError::persistence(format!("failed to parse {}: {e}", path.display()))
        })
    }

    /// Load every readable task record. Unreadable or unparsable files are
    /// skipped with a warning so one corrupt record cannot block startup.
    pub async fn load_all(&self) -> Result<Vec<DownloadTask>, DownloadError> {
        let mut entries = fs::read_dir(&self.dir).await.map_err(|e| {
            DownloadError::persistence(format!(
                "failed to list state directory {}: {e}",
                self.dir.display()
            ))
        })?;
        let mut tasks = Vec::new();
        while let Some(entry) = entries.next_entry().await.map_err(|e| {
            DownloadError::persistence(format!("failed to walk state directory: {e}"))
        })? {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            match fs::read(&path).await {
                Ok(bytes) => match serde_json::from_slice::<DownloadTask>(&bytes) {
                    Ok(task) => tasks.push(task),
                    Err(e) => {
                        warn!(path = %path.display(), error = %e, "Skipping unparsable task record");
                    }
                },
                Err(e) => {
                    warn!(path = %path.display(), error = %e, "Skipping unreadable task record");
                }
            }
        }
        Ok(tasks)
    }

    pub async fn remove(&self, task_id: &str) -> Result<(), DownloadError> {
        let path = self.path_for(task_id);
        match fs::remove_file(&path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(DownloadError::persistence(format!(
                "failed to remove {}: {e}",
                path.display()
            ))),
        }
    }

    pub fn directory(&self) -> &Path {
        &self.dir
    }
}
