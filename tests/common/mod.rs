//! Shared fixtures for integration tests: an in-memory catalog and a wiremock audio host

#![allow(dead_code, clippy::unwrap_used, clippy::expect_used)]

use async_trait::async_trait;
use music_dl::catalog::CatalogResult;
use music_dl::{AppContext, CatalogError, CatalogGateway, Config, NoOpTagWriter, PlayUrl, SongDetail};
use std::collections::HashMap;
use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

/// Catalog backed by hash maps; audio URLs point at a wiremock server
#[derive(Default)]
pub struct MemoryCatalog {
    songs: Mutex<HashMap<String, (SongDetail, PlayUrl)>>,
    albums: Mutex<HashMap<String, Vec<String>>>,
}

impl MemoryCatalog {
    /// Register a track and serve `audio` for it from `server`
    pub async fn add_track(
        &self,
        server: &MockServer,
        music_id: &str,
        title: &str,
        artist: &str,
        audio: Vec<u8>,
    ) {
        let file = format!("/audio/{}.flac", music_id);
        Mock::given(method("GET"))
            .and(path(file.clone()))
            .respond_with(ResponseTemplate::new(200).set_body_bytes(audio.clone()))
            .mount(server)
            .await;

        let detail = SongDetail {
            id: music_id.to_string(),
            title: title.to_string(),
            artists: vec![artist.to_string()],
            album: Some("Album".to_string()),
            track_no: 1,
            ..Default::default()
        };
        let play_url = PlayUrl {
            url: format!("{}{}", server.uri(), file),
            resolved_quality: "lossless".to_string(),
            size: audio.len() as u64,
            format: "flac".to_string(),
            bitrate: 900_000,
        };
        self.songs
            .lock()
            .unwrap()
            .insert(music_id.to_string(), (detail, play_url));
    }

    /// Define an album's track listing
    pub fn set_album(&self, album_id: &str, music_ids: &[&str]) {
        self.albums.lock().unwrap().insert(
            album_id.to_string(),
            music_ids.iter().map(|s| s.to_string()).collect(),
        );
    }

    fn song(&self, music_id: &str) -> CatalogResult<(SongDetail, PlayUrl)> {
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
}

#[async_trait]
impl CatalogGateway for MemoryCatalog {
    async fn get_song_detail(&self, music_id: &str) -> CatalogResult<SongDetail> {
        Ok(self.song(music_id)?.0)
    }

    async fn get_play_url(&self, music_id: &str, _quality: &str) -> CatalogResult<PlayUrl> {
        Ok(self.song(music_id)?.1)
    }

    async fn get_playlist_track_ids(&self, playlist_id: &str) -> CatalogResult<Vec<String>> {
        Err(CatalogError::NotFound {
            kind: "playlist",
            id: playlist_id.to_string(),
        })
    }

    async fn search_song_details(&self, music_ids: &[String]) -> CatalogResult<Vec<SongDetail>> {
        let songs = self.songs.lock().unwrap();
        Ok(music_ids
            .iter()
            .filter_map(|id| songs.get(id).map(|(detail, _)| detail.clone()))
            .collect())
    }

    async fn get_album_track_ids(&self, album_id: &str) -> CatalogResult<Vec<String>> {
        self.albums
            .lock()
            .unwrap()
            .get(album_id)
            .cloned()
            .ok_or_else(|| CatalogError::NotFound {
                kind: "album",
                id: album_id.to_string(),
            })
    }
}

/// Config rooted in `root` with fast retries
pub fn test_config(root: &Path) -> Config {
    let mut config = Config::default();
    config.persistence.database_path = root.join("library.db");
    config.download.download_dir = root.join("downloads");
    config.retry.max_attempts = 2;
    config.retry.initial_delay = Duration::from_millis(10);
    config.retry.max_delay = Duration::from_millis(20);
    config.retry.jitter = false;
    config
}

/// Context over `catalog` with no tag writer
pub async fn create_context(root: &Path, catalog: Arc<MemoryCatalog>) -> AppContext {
    AppContext::new(test_config(root), catalog, Arc::new(NoOpTagWriter))
        .await
        .expect("context should build")
}

/// Deterministic audio bytes
pub fn audio(len: usize, seed: u8) -> Vec<u8> {
    (0..len).map(|i| (i as u8).wrapping_mul(31).wrapping_add(seed)).collect()
}
