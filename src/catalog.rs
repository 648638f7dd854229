//! Remote music catalog interface
//!
//! The wire protocol (authentication, request signing, account rotation) lives outside
//! this crate. Embedders implement [`CatalogGateway`] over their client of choice and
//! hand it to [`crate::AppContext::new`].

use crate::error::CatalogError;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};

/// Result type for catalog calls
pub type CatalogResult<T> = std::result::Result<T, CatalogError>;

/// Track details as reported by the catalog
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SongDetail {
    /// Catalog track id
    pub id: String,
    /// Track title
    pub title: String,
    /// Artist names, in credit order
    pub artists: Vec<String>,
    /// Album name
    pub album: Option<String>,
    /// Cover art URL
    pub cover_url: Option<String>,
    /// Duration in milliseconds
    pub duration_ms: u64,
    /// Position on the disc
    pub track_no: u32,
    /// Disc number
    pub disc_no: Option<String>,
    /// Release timestamp (milliseconds since epoch)
    pub publish_time: i64,
}

/// A resolved, short-lived audio URL
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PlayUrl {
    /// Signed URL; expires after a while (403 once it has)
    pub url: String,
    /// Quality level the catalog actually granted
    pub resolved_quality: String,
    /// Size in bytes
    pub size: u64,
    /// Container format, e.g. "flac" or "mp3"
    pub format: String,
    /// Bitrate in bits per second
    pub bitrate: u64,
}

/// Catalog calls the download pipeline depends on
///
/// Every call may fail with [`CatalogError::RateLimited`] or [`CatalogError::Server`],
/// which callers treat as retryable, distinct from [`CatalogError::NotFound`].
#[async_trait]
pub trait CatalogGateway: Send + Sync {
    /// Track details for one id
    async fn get_song_detail(&self, music_id: &str) -> CatalogResult<SongDetail>;

    /// Resolve a playable URL at (or below) the requested quality
    async fn get_play_url(&self, music_id: &str, quality: &str) -> CatalogResult<PlayUrl>;

    /// Track ids of a playlist, in playlist order
    async fn get_playlist_track_ids(&self, playlist_id: &str) -> CatalogResult<Vec<String>>;

    /// Track details for many ids in one call; unknown ids are omitted
    async fn search_song_details(&self, music_ids: &[String]) -> CatalogResult<Vec<SongDetail>>;

    /// Lyrics text (LRC or plain) for a track, if the catalog has any
    async fn get_lyrics(&self, _music_id: &str) -> CatalogResult<Option<String>> {
        Ok(None)
    }

    /// Track ids of an album
    async fn get_album_track_ids(&self, _album_id: &str) -> CatalogResult<Vec<String>> {
        Err(CatalogError::NotSupported {
            operation: "album listing",
        })
    }

    /// Track ids credited to an artist
    async fn get_artist_track_ids(&self, _artist_id: &str) -> CatalogResult<Vec<String>> {
        Err(CatalogError::NotSupported {
            operation: "artist listing",
        })
    }
}
