//! Byte-range planning and sidecar files for segmented downloads
//!
//! Each segment lands in its own part file named after its inclusive byte range,
//! `{task_id}_{start}_{end}.part`, under `{download_dir}/.cache/{task_id}/`. A part whose
//! size equals its range length is considered complete and is not fetched again. Part
//! files from a plan with different ranges are deleted before fetching.

use crate::error::Result;
use crate::types::TaskId;
use std::path::{Path, PathBuf};
use tokio::io::AsyncWriteExt;

/// Inclusive byte range `start..=end`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Segment {
    /// First byte
    pub start: u64,
    /// Last byte (inclusive)
    pub end: u64,
}

impl Segment {
    /// Number of bytes in the range
    pub fn len(&self) -> u64 {
        self.end - self.start + 1
    }

    /// Always false; a segment covers at least one byte
    pub fn is_empty(&self) -> bool {
        false
    }

    /// Value for the HTTP `Range` header
    pub fn range_header(&self) -> String {
        format!("bytes={}-{}", self.start, self.end)
    }
}

/// Split `total` bytes into ranges of `max(min_segment, ceil(total / threads))`
pub fn plan_segments(total: u64, threads: usize, min_segment: u64) -> Vec<Segment> {
    if total == 0 {
        return Vec::new();
    }

    let threads = threads.max(1) as u64;
    let segment_size = total.div_ceil(threads).max(min_segment).max(1);

    let mut segments = Vec::with_capacity(total.div_ceil(segment_size) as usize);
    let mut start = 0;
    while start < total {
        let end = (start + segment_size).min(total) - 1;
        segments.push(Segment { start, end });
        start = end + 1;
    }
    segments
}

/// Directory holding the part files of one task
pub fn cache_dir(download_dir: &Path, task_id: TaskId) -> PathBuf {
    download_dir.join(".cache").join(task_id.to_string())
}

/// Part file for one segment
pub fn part_path(cache_dir: &Path, task_id: TaskId, segment: Segment) -> PathBuf {
    cache_dir.join(format!("{}_{}_{}.part", task_id, segment.start, segment.end))
}

/// Whether the part file already holds exactly the segment's bytes
///
/// Only the length is compared; content is not verified.
pub async fn is_complete(path: &Path, segment: Segment) -> bool {
    match tokio::fs::metadata(path).await {
        Ok(meta) => meta.len() == segment.len(),
        Err(_) => false,
    }
}

/// Delete every `*.part` file in `cache_dir` that is not one of `keep`
///
/// Returns how many were removed. A missing directory counts as empty.
pub async fn remove_stale_parts(cache_dir: &Path, keep: &[PathBuf]) -> Result<usize> {
    let mut entries = match tokio::fs::read_dir(cache_dir).await {
        Ok(entries) => entries,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(0),
        Err(e) => return Err(e.into()),
    };

    let mut removed = 0;
    while let Some(entry) = entries.next_entry().await? {
        let path = entry.path();
        if path.extension().is_none_or(|ext| ext != "part") || keep.contains(&path) {
            continue;
        }
        match tokio::fs::remove_file(&path).await {
            Ok(()) => removed += 1,
            Err(e) => {
                tracing::warn!(path = %path.display(), error = %e, "failed to remove stale segment file");
            }
        }
    }
    Ok(removed)
}

/// Concatenate part files in order into `dest`, then remove them and `cache_dir`
pub async fn merge(parts: &[PathBuf], dest: &Path, cache_dir: &Path) -> Result<u64> {
    if let Some(parent) = dest.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }

    let mut out = tokio::fs::File::create(dest).await?;
    let mut written = 0;
    for part in parts {
        let mut input = tokio::fs::File::open(part).await?;
        written += tokio::io::copy(&mut input, &mut out).await?;
    }
    out.flush().await?;
    out.sync_all().await?;
    drop(out);

    for part in parts {
        if let Err(e) = tokio::fs::remove_file(part).await {
            tracing::warn!(path = %part.display(), error = %e, "failed to remove segment file");
        }
    }
    // Only succeeds once empty
    let _ = tokio::fs::remove_dir(cache_dir).await;

    Ok(written)
}
