//! Shared test helpers: scripted catalog, recording tag writer and a wired context.

use crate::catalog::{CatalogGateway, CatalogResult, PlayUrl, SongDetail};
use crate::config::Config;
use crate::context::AppContext;
use crate::downloader::AudioFetcher;
use crate::db::DownloadTask;
use crate::error::{CatalogError, Error, Result};
use crate::tagging::{TagFields, TagWriter};
use async_trait::async_trait;
use std::collections::{HashMap, VecDeque};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use tempfile::{TempDir, tempdir};

/// In-memory catalog with per-call counters and scriptable failures
#[derive(Default)]
pub(crate) struct StubCatalog {
    songs: Mutex<HashMap<String, SongDetail>>,
    play_urls: Mutex<HashMap<String, PlayUrl>>,
    lyrics: Mutex<HashMap<String, String>>,
    playlists: Mutex<HashMap<String, Vec<String>>>,
    playlist_failures: Mutex<HashMap<String, VecDeque<CatalogError>>>,
    calls: Mutex<HashMap<(&'static str, String), usize>>,
}

impl StubCatalog {
    pub(crate) fn add_song(
        &self,
        music_id: &str,
        title: &str,
        artists: &[&str],
        url: &str,
        size: u64,
        format: &str,
    ) {
        self.songs.lock().unwrap().insert(
            music_id.to_string(),
            SongDetail {
                id: music_id.to_string(),
                title: title.to_string(),
                artists: artists.iter().map(|a| a.to_string()).collect(),
                album: Some("Album".to_string()),
                track_no: 1,
                ..Default::default()
            },
        );
        self.play_urls.lock().unwrap().insert(
            music_id.to_string(),
            PlayUrl {
                url: url.to_string(),
                resolved_quality: "lossless".to_string(),
                size,
                format: format.to_string(),
                bitrate: 999_000,
            },
        );
    }

    pub(crate) fn set_cover_url(&self, music_id: &str, cover_url: &str) {
        if let Some(song) = self.songs.lock().unwrap().get_mut(music_id) {
            song.cover_url = Some(cover_url.to_string());
        }
    }

    pub(crate) fn set_play_url_target(&self, music_id: &str, url: &str) {
        if let Some(play_url) = self.play_urls.lock().unwrap().get_mut(music_id) {
            play_url.url = url.to_string();
        }
    }

    pub(crate) fn set_lyrics(&self, music_id: &str, lyrics: &str) {
        self.lyrics
            .lock()
            .unwrap()
            .insert(music_id.to_string(), lyrics.to_string());
    }

    pub(crate) fn set_playlist(&self, playlist_id: &str, music_ids: &[&str]) {
        self.playlists.lock().unwrap().insert(
            playlist_id.to_string(),
            music_ids.iter().map(|id| id.to_string()).collect(),
        );
    }

    /// Queue errors returned by the next playlist lookups before it succeeds
    pub(crate) fn fail_playlist(&self, playlist_id: &str, errors: Vec<CatalogError>) {
        self.playlist_failures
            .lock()
            .unwrap()
            .insert(playlist_id.to_string(), errors.into());
    }

    pub(crate) fn detail_calls(&self, music_id: &str) -> usize {
        self.calls_for("song_detail", music_id)
    }

    pub(crate) fn play_url_calls(&self, music_id: &str) -> usize {
        self.calls_for("play_url", music_id)
    }

    pub(crate) fn playlist_calls(&self, playlist_id: &str) -> usize {
        self.calls_for("playlist", playlist_id)
    }

    fn calls_for(&self, kind: &'static str, id: &str) -> usize {
        self.calls
            .lock()
            .unwrap()
            .get(&(kind, id.to_string()))
            .copied()
            .unwrap_or(0)
    }

    fn record(&self, kind: &'static str, id: &str) {
        *self
            .calls
            .lock()
            .unwrap()
            .entry((kind, id.to_string()))
            .or_insert(0) += 1;
    }
}

#[async_trait]
impl CatalogGateway for StubCatalog {
    async fn get_song_detail(&self, music_id: &str) -> CatalogResult<SongDetail> {
        self.record("song_detail", music_id);
        self.songs
            .lock()
            .unwrap()
            .get(music_id)
            .cloned()
            .ok_or_else(|| CatalogError::NotFound {
                kind: "song",
                id: music_id.to_string(),
            })
    }

    async fn get_play_url(&self, music_id: &str, _quality: &str) -> CatalogResult<PlayUrl> {
        self.record("play_url", music_id);
        self.play_urls
            .lock()
            .unwrap()
            .get(music_id)
            .cloned()
            .ok_or_else(|| CatalogError::Unavailable {
                id: music_id.to_string(),
            })
    }

    async fn get_playlist_track_ids(&self, playlist_id: &str) -> CatalogResult<Vec<String>> {
        self.record("playlist", playlist_id);
        if let Some(failures) = self.playlist_failures.lock().unwrap().get_mut(playlist_id) {
            if let Some(error) = failures.pop_front() {
                return Err(error);
            }
        }
        self.playlists
            .lock()
            .unwrap()
            .get(playlist_id)
            .cloned()
            .ok_or_else(|| CatalogError::NotFound {
                kind: "playlist",
                id: playlist_id.to_string(),
            })
    }

    async fn search_song_details(&self, music_ids: &[String]) -> CatalogResult<Vec<SongDetail>> {
        let songs = self.songs.lock().unwrap();
        Ok(music_ids
            .iter()
            .filter_map(|id| songs.get(id).cloned())
            .collect())
    }

    async fn get_lyrics(&self, music_id: &str) -> CatalogResult<Option<String>> {
        Ok(self.lyrics.lock().unwrap().get(music_id).cloned())
    }
}

/// What a [`RecordingTagWriter`] was asked to do
#[derive(Debug, Clone, PartialEq)]
pub(crate) enum TagCall {
    Metadata(PathBuf, TagFields),
    Artwork(PathBuf, usize),
    Lyrics(PathBuf, String),
}

/// Tag writer that records calls and can be told to fail artwork
#[derive(Default)]
pub(crate) struct RecordingTagWriter {
    calls: Mutex<Vec<TagCall>>,
    fail_artwork: std::sync::atomic::AtomicBool,
}

impl RecordingTagWriter {
    pub(crate) fn calls(&self) -> Vec<TagCall> {
        self.calls.lock().unwrap().clone()
    }

    pub(crate) fn fail_artwork(&self) {
        self.fail_artwork
            .store(true, std::sync::atomic::Ordering::SeqCst);
    }
}

#[async_trait]
impl TagWriter for RecordingTagWriter {
    async fn write_metadata(&self, path: &Path, fields: &TagFields) -> Result<()> {
        self.calls
            .lock()
            .unwrap()
            .push(TagCall::Metadata(path.to_path_buf(), fields.clone()));
        Ok(())
    }

    async fn write_artwork(&self, path: &Path, image: &[u8]) -> Result<()> {
        if self.fail_artwork.load(std::sync::atomic::Ordering::SeqCst) {
            return Err(Error::Other(
                "unsupported container for artwork".to_string(),
            ));
        }
        self.calls
            .lock()
            .unwrap()
            .push(TagCall::Artwork(path.to_path_buf(), image.len()));
        Ok(())
    }

    async fn write_lyrics(&self, path: &Path, lyrics: &str) -> Result<()> {
        self.calls
            .lock()
            .unwrap()
            .push(TagCall::Lyrics(path.to_path_buf(), lyrics.to_string()));
        Ok(())
    }
}

/// What a [`StubFetcher`] does when asked to download
#[derive(Debug, Clone)]
pub(crate) enum FetchMode {
    /// Write these bytes to the task's temp path
    Write(Vec<u8>),
    /// Fail with an HTTP 500
    Fail,
    /// Never finish (until cancelled)
    Hang,
    /// Fail the test if called at all
    Forbidden,
}

/// Audio fetcher that never touches the network
pub(crate) struct StubFetcher {
    mode: Mutex<FetchMode>,
    calls: std::sync::atomic::AtomicUsize,
    delay: std::time::Duration,
}

impl StubFetcher {
    pub(crate) fn new(mode: FetchMode) -> Self {
        Self {
            mode: Mutex::new(mode),
            calls: std::sync::atomic::AtomicUsize::new(0),
            delay: std::time::Duration::ZERO,
        }
    }

    /// Like [`StubFetcher::new`] but each download takes `delay`
    pub(crate) fn slow(mode: FetchMode, delay: std::time::Duration) -> Self {
        Self {
            delay,
            ..Self::new(mode)
        }
    }

    pub(crate) fn set_mode(&self, mode: FetchMode) {
        *self.mode.lock().unwrap() = mode;
    }

    pub(crate) fn calls(&self) -> usize {
        self.calls.load(std::sync::atomic::Ordering::SeqCst)
    }
}

#[async_trait]
impl AudioFetcher for StubFetcher {
    async fn download(&self, task: &DownloadTask) -> Result<PathBuf> {
        self.calls.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
        let mode = self.mode.lock().unwrap().clone();
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        match mode {
            FetchMode::Write(bytes) => {
                let path = PathBuf::from(task.file_path.clone().unwrap());
                tokio::fs::create_dir_all(path.parent().unwrap()).await?;
                tokio::fs::write(&path, bytes).await?;
                Ok(path)
            }
            FetchMode::Fail => Err(Error::HttpStatus {
                status: 500,
                url: format!("stub://{}", task.music_id),
            }),
            FetchMode::Hang => {
                futures::future::pending::<()>().await;
                unreachable!()
            }
            FetchMode::Forbidden => panic!("downloader must not be called for task {}", task.id),
        }
    }

    fn set_concurrency(&self, _max_concurrent_downloads: usize, _max_threads_per_download: usize) {}

    fn concurrency(&self) -> (usize, usize) {
        (1, 1)
    }
}

/// A wired context over a temp directory, plus handles to its stubs
pub(crate) struct TestContext {
    pub(crate) ctx: AppContext,
    pub(crate) catalog: Arc<StubCatalog>,
    pub(crate) tags: Arc<RecordingTagWriter>,
    pub(crate) temp_dir: TempDir,
}

impl TestContext {
    /// Storage root for jobs created in tests
    pub(crate) fn storage_path(&self) -> PathBuf {
        self.temp_dir.path().join("library")
    }
}

/// Config rooted in `root` with fast retries
pub(crate) fn test_config(root: &Path) -> Config {
    let mut config = Config::default();
    config.persistence.database_path = root.join("test.db");
    config.download.download_dir = root.join("downloads");
    config.download.request_timeout = std::time::Duration::from_secs(5);
    config.retry.max_attempts = 2;
    config.retry.initial_delay = std::time::Duration::from_millis(10);
    config.retry.max_delay = std::time::Duration::from_millis(20);
    config.retry.jitter = false;
    config.scan.playlist_retry = config.retry.clone();
    config.scan.batch_size = 2;
    config
}

/// Fully wired context with the real HTTP downloader
pub(crate) async fn create_test_context() -> TestContext {
    build(None).await
}

/// Fully wired context with `fetcher` in place of the HTTP downloader
pub(crate) async fn create_test_context_with_fetcher(fetcher: Arc<dyn AudioFetcher>) -> TestContext {
    build(Some(fetcher)).await
}

async fn build(fetcher: Option<Arc<dyn AudioFetcher>>) -> TestContext {
    let temp_dir = tempdir().unwrap();
    let config = test_config(temp_dir.path());
    std::fs::create_dir_all(temp_dir.path().join("library")).unwrap();

    let catalog = Arc::new(StubCatalog::default());
    let tags = Arc::new(RecordingTagWriter::default());

    let ctx = match fetcher {
        Some(fetcher) => {
            AppContext::with_fetcher(config, catalog.clone(), tags.clone(), fetcher).await
        }
        None => AppContext::new(config, catalog.clone(), tags.clone()).await,
    }
    .unwrap();

    TestContext {
        ctx,
        catalog,
        tags,
        temp_dir,
    }
}
