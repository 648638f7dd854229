//! Embedding tags into downloaded audio files
//!
//! Container-specific tag writing (FLAC vorbis comments, ID3 frames) is delegated to a
//! [`TagWriter`] supplied by the embedder. [`NoOpTagWriter`] is used when none is given.

use crate::error::Result;
use async_trait::async_trait;
use std::path::Path;

/// Text tags written into a track
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TagFields {
    /// Track title
    pub title: String,
    /// Artist names, in credit order
    pub artists: Vec<String>,
    /// Album name
    pub album: Option<String>,
    /// Position on the disc
    pub track_no: Option<u32>,
    /// Disc number
    pub disc_no: Option<String>,
    /// Release year
    pub year: Option<i32>,
    /// Catalog track id, kept as a comment for traceability
    pub music_id: String,
}

/// Writes tags into an audio file in place
#[async_trait]
pub trait TagWriter: Send + Sync {
    /// Write title/artist/album and friends
    async fn write_metadata(&self, path: &Path, fields: &TagFields) -> Result<()>;

    /// Embed cover art bytes (JPEG or PNG)
    async fn write_artwork(&self, path: &Path, image: &[u8]) -> Result<()>;

    /// Embed lyrics text
    async fn write_lyrics(&self, path: &Path, lyrics: &str) -> Result<()>;
}

/// Tag writer that accepts everything and writes nothing
#[derive(Debug, Clone, Copy, Default)]
pub struct NoOpTagWriter;

#[async_trait]
impl TagWriter for NoOpTagWriter {
    async fn write_metadata(&self, path: &Path, _fields: &TagFields) -> Result<()> {
        tracing::debug!(path = %path.display(), "metadata tagging skipped (no tag writer)");
        Ok(())
    }

    async fn write_artwork(&self, path: &Path, _image: &[u8]) -> Result<()> {
        tracing::debug!(path = %path.display(), "artwork embedding skipped (no tag writer)");
        Ok(())
    }

    async fn write_lyrics(&self, path: &Path, _lyrics: &str) -> Result<()> {
        tracing::debug!(path = %path.display(), "lyrics embedding skipped (no tag writer)");
        Ok(())
    }
}
