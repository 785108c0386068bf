// Merging: concatenate staged segment files into the final output in
// strict index order.

use crate::error::DownloadError;
use crate::task::{Segment, SegmentState};
use std::path::Path;
use tokio::fs::{self, File};
use tokio::io::AsyncWriteExt;
use tracing::{debug, warn};

/// Concatenate every staged segment into `output`, in ascending index
/// order. All segments must be `Done`; otherwise the merge aborts with
/// [`DownloadError::MergeIncomplete`] and no output file is produced.
///
/// Returns the number of bytes written. Zero segments yield an empty
/// output file, which is a successful (if degenerate) merge.
pub async fn merge_segments(
    segments: &[Segment],
    output: &Path,
    keep_staging: bool,
) -> Result<u64, DownloadError> {
    let failed: Vec<u64> = segments
        .iter()
        .filter(|s| s.state != SegmentState::Done)
        .map(|s| s.index)
        .collect();
    if !failed.is_empty() {
        return Err(DownloadError::MergeIncomplete {
            failed_indices: failed,
        });
    }

    if let Some(parent) = output.parent()
        && !parent.as_os_str().is_empty()
    {
        fs::create_dir_all(parent).await?;
    }

    let mut out = File::create(output).await?;
    let mut total = 0u64;
    for segment in segments {
        let path = segment.staging_path.as_ref().ok_or_else(|| {
            DownloadError::internal(format!(
                "segment {} is Done but has no staged file",
                segment.index
            ))
        })?;
        let mut staged = File::open(path).await?;
        total += tokio::io::copy(&mut staged, &mut out).await?;
    }
    out.flush().await?;
    out.sync_all().await?;
    debug!(output = %output.display(), bytes = total, count = segments.len(), "Merged segments");

    if !keep_staging {
        cleanup_staging(segments).await;
    }
    Ok(total)
}

/// Remove staged segment files and their directory. Failures are logged
/// and ignored; leftover staging data never fails a completed download.
async fn cleanup_staging(segments: &[Segment]) {
    let mut dir = None;
    for segment in segments {
        if let Some(path) = &segment.staging_path {
            if dir.is_none() {
                dir = path.parent().map(Path::to_path_buf);
            }
            if let Err(e) = fs::remove_file(path).await {
                warn!(path = %path.display(), error = %e, "Failed to remove staged segment");
            }
        }
    }
    if let Some(dir) = dir {
        // Fails if anything else lives in the directory; that is fine.
        let _ = fs::remove_dir(&dir).await;
    }
}
