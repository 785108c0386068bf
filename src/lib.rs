//! Segmented HLS download engine.
//!
//! Resolves M3U8 playlists into ordered segment lists, downloads segments
//! with bounded per-task concurrency, decrypts AES-128 content, and merges
//! the result into a single output file. A scheduler runs multiple tasks
//! at once with priority admission, pause/resume/cancel, and persisted
//! progress for crash recovery.
//!
//! ```no_run
//! use hlsget::{DownloaderConfig, Priority, Scheduler, TaskEvent};
//!
//! # async fn demo() -> Result<(), hlsget::DownloadError> {
//! let (scheduler, mut events) = Scheduler::new(DownloaderConfig::default()).await?;
//! let id = scheduler
//!     .submit("https://cdn.example.com/main.m3u8", "clip.ts", None, Priority::Normal)
//!     .await?;
//!
//! while let Some(event) = events.recv().await {
//!     if let TaskEvent::Completed { task_id, output } = event
//!         && task_id == id
//!     {
//!         println!("saved to {}", output.display());
//!         break;
//!     }
//! }
//! # Ok(())
//! # }
//! ```

pub mod config;
pub mod decrypt;
pub mod error;
pub mod fetch;
pub mod key;
pub mod limiter;
pub mod merge;
pub mod persist;
pub mod playlist;
pub mod progress;
pub mod proxy;
pub mod retry;
pub mod scheduler;
pub mod task;
pub mod worker;

pub use config::DownloaderConfig;
pub use error::DownloadError;
pub use playlist::{ResolvedPlaylist, VariantInfo, VariantSelectionPolicy};
pub use progress::TaskEvent;
pub use proxy::{ProxyAuth, ProxyConfig, ProxyType};
pub use scheduler::Scheduler;
pub use task::{
    DownloadTask, Priority, Segment, SegmentState, TaskProgress, TaskStatus,
};
