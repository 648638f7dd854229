//! HTTP fetches for one task, with backoff and signed-URL refresh.

use super::AudioDownloader;
use super::segments::{self, Segment};
use crate::cache::DownloadDataCache;
use crate::error::{Error, Result};
use crate::retry::with_backoff;
use crate::types::TaskId;
use futures::StreamExt;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU32, Ordering};
use tokio::io::AsyncWriteExt;
use tokio::sync::Semaphore;

/// State shared by every request of one download
pub(super) struct Transfer<'a> {
    downloader: &'a AudioDownloader,
    task_id: TaskId,
    quality: &'a str,
    cache: &'a DownloadDataCache,
    /// Play-URL refreshes used so far, across all segments
    refreshes: AtomicU32,
}

impl<'a> Transfer<'a> {
    pub(super) fn new(
        downloader: &'a AudioDownloader,
        task_id: TaskId,
        quality: &'a str,
        cache: &'a DownloadDataCache,
    ) -> Self {
        Self {
            downloader,
            task_id,
            quality,
            cache,
            refreshes: AtomicU32::new(0),
        }
    }

    /// Stream the whole file into `dest`
    pub(super) async fn whole(&self, dest: &Path) -> Result<u64> {
        self.fetch_with_refresh(None, dest).await
    }

    /// Fetch `total` bytes as range requests, skipping complete part files, then merge
    pub(super) async fn segmented(&self, total: u64, dest: &Path) -> Result<u64> {
        let settings = &self.downloader.settings;
        let threads = self.downloader.max_threads();

        let dir = segments::cache_dir(&settings.download_dir, self.task_id);
        tokio::fs::create_dir_all(&dir).await?;

        let plan = segments::plan_segments(total, threads, settings.min_segment_size);
        let parts: Vec<PathBuf> = plan
            .iter()
            .map(|segment| segments::part_path(&dir, self.task_id, *segment))
            .collect();
        let stale = segments::remove_stale_parts(&dir, &parts).await?;
        if stale > 0 {
            tracing::debug!(task_id = %self.task_id, stale, "removed part files from an earlier plan");
        }

        let limit = &Semaphore::new(threads);
        let fetches = plan.iter().zip(&parts).map(move |(segment, part)| async move {
            if segments::is_complete(part, *segment).await {
                tracing::debug!(
                    task_id = %self.task_id,
                    start = segment.start,
                    end = segment.end,
                    "segment already on disk, skipping"
                );
                return Ok(());
            }
            let _permit = limit.acquire().await.map_err(|_| Error::ShuttingDown)?;
            self.fetch_with_refresh(Some(*segment), part).await.map(|_| ())
        });
        futures::future::try_join_all(fetches).await?;

        segments::merge(&parts, dest, &dir).await
    }

    /// One file or range, retried with backoff, re-resolving the URL on 403
    async fn fetch_with_refresh(&self, range: Option<Segment>, dest: &Path) -> Result<u64> {
        let mut url = self.cache.ensure_play_url(self.quality, false).await?.url;

        loop {
            let result = with_backoff(&self.downloader.retry, || {
                self.fetch_to_file(&url, range, dest)
            })
            .await;

            match result {
                Err(Error::UrlExpired { .. }) => url = self.refresh_url(&url).await?,
                other => return other,
            }
        }
    }

    /// Obtain a fresh URL after `expired` returned 403
    ///
    /// If a sibling segment already refreshed the cache, its URL is reused without
    /// counting against the refresh budget.
    async fn refresh_url(&self, expired: &str) -> Result<String> {
        let expired_err = || Error::UrlExpired {
            task_id: self.task_id.get(),
        };

        if let Some(current) = self.cache.play_url().await {
            if current.url != expired {
                return Ok(current.url);
            }
        }

        let used = self.refreshes.fetch_add(1, Ordering::SeqCst) + 1;
        let budget = self.downloader.settings.max_url_refreshes;
        if used > budget {
            tracing::error!(task_id = %self.task_id, refreshes = budget, "play url keeps expiring");
            return Err(expired_err());
        }

        tracing::info!(task_id = %self.task_id, attempt = used, "play url expired, refreshing");
        match self.cache.ensure_play_url(self.quality, true).await {
            Ok(fresh) => Ok(fresh.url),
            Err(e) => {
                tracing::warn!(task_id = %self.task_id, error = %e, "could not refresh play url");
                Err(expired_err())
            }
        }
    }

    /// A single GET streamed to `dest`, truncating whatever was there
    async fn fetch_to_file(&self, url: &str, range: Option<Segment>, dest: &Path) -> Result<u64> {
        let mut request = self.downloader.http.get(url);
        if let Some(segment) = range {
            request = request.header(reqwest::header::RANGE, segment.range_header());
        }

        let response = request.send().await?;
        let status = response.status();
        if status == reqwest::StatusCode::FORBIDDEN {
            return Err(Error::UrlExpired {
                task_id: self.task_id.get(),
            });
        }
        if !status.is_success() {
            return Err(Error::HttpStatus {
                status: status.as_u16(),
                url: url.to_string(),
            });
        }

        let mut file = tokio::fs::File::create(dest).await?;
        let mut stream = response.bytes_stream();
        let mut written: u64 = 0;
        while let Some(chunk) = stream.next().await {
            let chunk = chunk?;
            file.write_all(&chunk).await?;
            written += chunk.len() as u64;
        }
        file.flush().await?;

        if let Some(segment) = range {
            if written != segment.len() {
                return Err(Error::Io(std::io::Error::new(
                    std::io::ErrorKind::UnexpectedEof,
                    format!(
                        "segment {}-{}: expected {} bytes, got {}",
                        segment.start,
                        segment.end,
                        segment.len(),
                        written
                    ),
                )));
            }
        }

        Ok(written)
    }
}
