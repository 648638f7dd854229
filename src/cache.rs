//! Per-task memo of catalog lookups
//!
//! A [`DownloadDataCache`] holds the song detail and play URL for one task so the
//! prepare step, the downloader and the tagging phases share a single upstream fetch.
//! Entries live in the [`TaskCacheRegistry`] from submission until the task's workflow
//! run ends, which bounds memory to the tasks currently in flight.

use crate::catalog::{CatalogGateway, CatalogResult, PlayUrl, SongDetail};
use crate::types::TaskId;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::Mutex;

/// Cached catalog data for one task
pub struct DownloadDataCache {
    music_id: String,
    catalog: Arc<dyn CatalogGateway>,
    song_detail: Mutex<Option<SongDetail>>,
    play_url: Mutex<Option<PlayUrl>>,
}

impl DownloadDataCache {
    /// Empty cache for `music_id`
    pub fn new(music_id: impl Into<String>, catalog: Arc<dyn CatalogGateway>) -> Self {
        Self {
            music_id: music_id.into(),
            catalog,
            song_detail: Mutex::new(None),
            play_url: Mutex::new(None),
        }
    }

    /// Catalog track id this cache belongs to
    pub fn music_id(&self) -> &str {
        &self.music_id
    }

    /// Song detail, fetched on first use
    ///
    /// The lock is held across the fetch, so concurrent callers wait for the first one
    /// instead of issuing their own request.
    pub async fn ensure_song_detail(&self) -> CatalogResult<SongDetail> {
        let mut slot = self.song_detail.lock().await;
        if let Some(detail) = slot.as_ref() {
            tracing::debug!(music_id = %self.music_id, "song detail cache hit");
            return Ok(detail.clone());
        }

        let detail = self.catalog.get_song_detail(&self.music_id).await?;
        *slot = Some(detail.clone());
        Ok(detail)
    }

    /// Play URL at `quality`, fetched on first use or when `force_refresh` is set
    pub async fn ensure_play_url(&self, quality: &str, force_refresh: bool) -> CatalogResult<PlayUrl> {
        let mut slot = self.play_url.lock().await;
        if !force_refresh {
            if let Some(play_url) = slot.as_ref() {
                tracing::debug!(music_id = %self.music_id, "play url cache hit");
                return Ok(play_url.clone());
            }
        }

        let play_url = self.catalog.get_play_url(&self.music_id, quality).await?;
        *slot = Some(play_url.clone());
        Ok(play_url)
    }

    /// Store a detail obtained elsewhere (bulk lookups) unless one is already cached
    pub async fn seed_song_detail(&self, detail: SongDetail) {
        let mut slot = self.song_detail.lock().await;
        if slot.is_none() {
            *slot = Some(detail);
        }
    }

    /// Cached song detail without fetching
    pub async fn song_detail(&self) -> Option<SongDetail> {
        self.song_detail.lock().await.clone()
    }

    /// Cached play URL without fetching
    pub async fn play_url(&self) -> Option<PlayUrl> {
        self.play_url.lock().await.clone()
    }
}

/// Registry of caches for tasks currently in flight
pub struct TaskCacheRegistry {
    catalog: Arc<dyn CatalogGateway>,
    caches: Mutex<HashMap<TaskId, Arc<DownloadDataCache>>>,
}

impl TaskCacheRegistry {
    /// Empty registry whose caches fetch through `catalog`
    pub fn new(catalog: Arc<dyn CatalogGateway>) -> Self {
        Self {
            catalog,
            caches: Mutex::new(HashMap::new()),
        }
    }

    /// Cache for `task_id`, creating it if needed
    pub async fn get_or_create(&self, task_id: TaskId, music_id: &str) -> Arc<DownloadDataCache> {
        let mut caches = self.caches.lock().await;
        caches
            .entry(task_id)
            .or_insert_with(|| Arc::new(DownloadDataCache::new(music_id, self.catalog.clone())))
            .clone()
    }

    /// Cache for `task_id`, if one exists
    pub async fn get(&self, task_id: TaskId) -> Option<Arc<DownloadDataCache>> {
        self.caches.lock().await.get(&task_id).cloned()
    }

    /// Drop the cache for `task_id`; returns whether one existed
    pub async fn remove(&self, task_id: TaskId) -> bool {
        self.caches.lock().await.remove(&task_id).is_some()
    }

    /// Number of live caches
    pub async fn len(&self) -> usize {
        self.caches.lock().await.len()
    }

    /// True if no task has a live cache
    pub async fn is_empty(&self) -> bool {
        self.caches.lock().await.is_empty()
    }
}
