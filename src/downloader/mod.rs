//! Audio transfer for a single task.
//!
//! - [`segments`] - Range planning, part files and merging
//! - [`limiter`] - Runtime-resizable concurrency limits
//! - `transfer` - HTTP fetches with backoff and play-URL refresh
//!
//! [`AudioDownloader`] resolves the task's play URL through its [`DownloadDataCache`],
//! then streams the file in one request or, above `segment_threshold`, as concurrent
//! range requests that can be resumed from their part files.
//!
//! [`DownloadDataCache`]: crate::cache::DownloadDataCache

pub mod limiter;
pub mod segments;
mod transfer;

// unwrap/expect are acceptable in tests for concise failure-on-error assertions
#[allow(clippy::unwrap_used, clippy::expect_used)]
#[cfg(test)]
mod tests;

pub use limiter::ConcurrencyLimiter;

use crate::cache::TaskCacheRegistry;
use crate::config::{Config, DownloadConfig, RetryConfig};
use crate::db::DownloadTask;
use crate::error::{Error, Result, TaskError};
use async_trait::async_trait;
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

/// Fetches the audio bytes of a task into its temp file
///
/// The workflow depends on this seam rather than on [`AudioDownloader`] directly so a
/// different transport can be plugged in.
#[async_trait]
pub trait AudioFetcher: Send + Sync {
    /// Download the task's audio into its `file_path`; returns that path
    async fn download(&self, task: &DownloadTask) -> Result<PathBuf>;

    /// Resize both concurrency limits without interrupting running transfers
    fn set_concurrency(&self, max_concurrent_downloads: usize, max_threads_per_download: usize);

    /// Current `(max_concurrent_downloads, max_threads_per_download)`
    fn concurrency(&self) -> (usize, usize);
}

/// Build the HTTP client shared by audio and artwork downloads
pub fn build_http_client(config: &DownloadConfig) -> Result<reqwest::Client> {
    reqwest::Client::builder()
        .user_agent(config.user_agent.clone())
        .timeout(config.request_timeout)
        .build()
        .map_err(Error::Network)
}

/// HTTP downloader with segmented, resumable transfers
pub struct AudioDownloader {
    caches: Arc<TaskCacheRegistry>,
    http: reqwest::Client,
    settings: DownloadConfig,
    retry: RetryConfig,
    /// Process-wide limit on tasks transferring at once
    downloads: ConcurrencyLimiter,
    /// Segment concurrency for transfers started from now on
    threads: AtomicUsize,
}

impl AudioDownloader {
    /// Create a downloader from configuration
    pub fn new(config: &Config, caches: Arc<TaskCacheRegistry>, http: reqwest::Client) -> Self {
        Self {
            caches,
            http,
            settings: config.download.clone(),
            retry: config.retry.clone(),
            downloads: ConcurrencyLimiter::new(config.download.max_concurrent_downloads),
            threads: AtomicUsize::new(config.download.max_threads_per_download.max(1)),
        }
    }

    fn max_threads(&self) -> usize {
        self.threads.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl AudioFetcher for AudioDownloader {
    async fn download(&self, task: &DownloadTask) -> Result<PathBuf> {
        let _permit = self.downloads.acquire().await?;

        let task_id = task.id;
        let dest = task
            .file_path
            .as_deref()
            .map(PathBuf::from)
            .ok_or(TaskError::MissingField {
                id: task_id.get(),
                field: "file_path",
            })?;
        if let Some(parent) = dest.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }

        let cache = self.caches.get_or_create(task_id, &task.music_id).await;
        let play_url = cache.ensure_play_url(&task.quality, false).await?;

        let transfer = transfer::Transfer::new(self, task_id, &task.quality, &cache);
        let bytes = if play_url.size > self.settings.segment_threshold {
            tracing::debug!(
                task_id = %task_id,
                size = play_url.size,
                threads = self.max_threads(),
                "segmented download"
            );
            transfer.segmented(play_url.size, &dest).await?
        } else {
            tracing::debug!(task_id = %task_id, size = play_url.size, "single-request download");
            transfer.whole(&dest).await?
        };

        tracing::info!(task_id = %task_id, bytes, path = %dest.display(), "audio downloaded");
        Ok(dest)
    }

    fn set_concurrency(&self, max_concurrent_downloads: usize, max_threads_per_download: usize) {
        self.downloads.set_capacity(max_concurrent_downloads);
        self.threads
            .store(max_threads_per_download.max(1), Ordering::SeqCst);
    }

    fn concurrency(&self) -> (usize, usize) {
        (self.downloads.capacity(), self.max_threads())
    }
}
