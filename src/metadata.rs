//! Optional tagging phases: metadata, cover art and lyrics
//!
//! Each phase returns `Ok(())` when there is nothing to embed (no cover URL, no lyrics),
//! so the corresponding progress bit is set and the task is not held back by data the
//! catalog simply does not have. Errors are left for the workflow to log and swallow.

use crate::cache::TaskCacheRegistry;
use crate::catalog::CatalogGateway;
use crate::db::{Database, DownloadTask};
use crate::error::{Error, Result, StorageError, TaskError};
use crate::tagging::{TagFields, TagWriter};
use crate::types::TaskId;
use chrono::{Datelike, TimeZone, Utc};
use std::path::PathBuf;
use std::sync::Arc;

/// Runs the optional tagging phases for a task
pub struct MetadataProcessor {
    db: Arc<Database>,
    catalog: Arc<dyn CatalogGateway>,
    caches: Arc<TaskCacheRegistry>,
    writer: Arc<dyn TagWriter>,
    http: reqwest::Client,
}

impl MetadataProcessor {
    /// Build a processor; `http` is used for cover downloads
    pub fn new(
        db: Arc<Database>,
        catalog: Arc<dyn CatalogGateway>,
        caches: Arc<TaskCacheRegistry>,
        writer: Arc<dyn TagWriter>,
        http: reqwest::Client,
    ) -> Self {
        Self {
            db,
            catalog,
            caches,
            writer,
            http,
        }
    }

    /// Write title, artists, album, track/disc number and year
    pub async fn process_metadata(&self, task_id: TaskId) -> Result<()> {
        let (task, path) = self.load(task_id).await?;
        let cache = self.caches.get_or_create(task_id, &task.music_id).await;
        let detail = cache.ensure_song_detail().await?;

        let year = Utc
            .timestamp_millis_opt(detail.publish_time)
            .single()
            .filter(|_| detail.publish_time > 0)
            .map(|t| t.year());

        let fields = TagFields {
            title: detail.title,
            artists: detail.artists,
            album: detail.album,
            track_no: (detail.track_no > 0).then_some(detail.track_no),
            disc_no: detail.disc_no,
            year,
            music_id: task.music_id,
        };

        self.writer.write_metadata(&path, &fields).await
    }

    /// Fetch the cover image and embed it
    pub async fn process_cover(&self, task_id: TaskId) -> Result<()> {
        let (task, path) = self.load(task_id).await?;
        let cache = self.caches.get_or_create(task_id, &task.music_id).await;
        let detail = cache.ensure_song_detail().await?;

        let Some(cover_url) = detail.cover_url.filter(|u| !u.is_empty()) else {
            tracing::debug!(task_id = %task_id, "no cover art for track");
            return Ok(());
        };

        let response = self.http.get(&cover_url).send().await?;
        if !response.status().is_success() {
            return Err(Error::HttpStatus {
                status: response.status().as_u16(),
                url: cover_url,
            });
        }
        let image = response.bytes().await?;

        self.writer.write_artwork(&path, &image).await
    }

    /// Fetch lyrics from the catalog and embed them
    pub async fn process_lyrics(&self, task_id: TaskId) -> Result<()> {
        let (task, path) = self.load(task_id).await?;

        match self.catalog.get_lyrics(&task.music_id).await? {
            Some(lyrics) if !lyrics.trim().is_empty() => {
                self.writer.write_lyrics(&path, &lyrics).await
            }
            _ => {
                tracing::debug!(task_id = %task_id, "no lyrics for track");
                Ok(())
            }
        }
    }

    async fn load(&self, task_id: TaskId) -> Result<(DownloadTask, PathBuf)> {
        let task = self
            .db
            .get_task(task_id)
            .await?
            .ok_or(TaskError::NotFound { id: task_id.get() })?;

        let path = task
            .file_path
            .as_deref()
            .map(PathBuf::from)
            .ok_or(TaskError::MissingField {
                id: task_id.get(),
                field: "file_path",
            })?;

        if !tokio::fs::try_exists(&path).await.unwrap_or(false) {
            return Err(StorageError::TempFileMissing { path }.into());
        }

        Ok((task, path))
    }
}

// unwrap/expect are acceptable in tests for concise failure-on-error assertions
#[allow(clippy::unwrap_used, clippy::expect_used)]
#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::{DownloadInfo, NewJob, NewTask};
    use crate::test_helpers::{RecordingTagWriter, StubCatalog, TagCall};
    use tempfile::tempdir;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    struct Fixture {
        processor: MetadataProcessor,
        catalog: Arc<StubCatalog>,
        tags: Arc<RecordingTagWriter>,
        task_id: TaskId,
        file: PathBuf,
        _dir: tempfile::TempDir,
    }

    async fn fixture() -> Fixture {
        let dir = tempdir().unwrap();
        let db = Arc::new(Database::new(&dir.path().join("t.db")).await.unwrap());
        let job = db
            .insert_job(&NewJob::manual("m", dir.path().to_string_lossy()))
            .await
            .unwrap();
        let (task, _) = db
            .insert_task_if_absent(&NewTask {
                job_id: job.id,
                music_id: "7".to_string(),
                music_title: None,
                music_artist: None,
                music_album: None,
                quality: "lossless".to_string(),
            })
            .await
            .unwrap();

        let file = dir.path().join("7.flac");
        std::fs::write(&file, b"fLaC").unwrap();
        db.update_task_download_info(
            task.id,
            &DownloadInfo {
                quality: "lossless".to_string(),
                file_path: file.to_string_lossy().into_owned(),
                file_name: "7.flac".to_string(),
                file_format: "flac".to_string(),
                file_size: Some(4),
            },
        )
        .await
        .unwrap();

        let catalog = Arc::new(StubCatalog::default());
        catalog.add_song("7", "Song", &["X", "Y"], "http://x/7.flac", 4, "flac");
        let tags = Arc::new(RecordingTagWriter::default());
        let caches = Arc::new(TaskCacheRegistry::new(catalog.clone()));
        let processor = MetadataProcessor::new(
            db,
            catalog.clone(),
            caches,
            tags.clone(),
            reqwest::Client::new(),
        );

        Fixture {
            processor,
            catalog,
            tags,
            task_id: task.id,
            file,
            _dir: dir,
        }
    }

    #[tokio::test]
    async fn metadata_fields_come_from_song_detail() {
        let f = fixture().await;
        f.processor.process_metadata(f.task_id).await.unwrap();

        let calls = f.tags.calls();
        let [TagCall::Metadata(path, fields)] = calls.as_slice() else {
            panic!("unexpected calls: {:?}", calls);
        };
        assert_eq!(path, &f.file);
        assert_eq!(fields.title, "Song");
        assert_eq!(fields.artists, vec!["X".to_string(), "Y".to_string()]);
        assert_eq!(fields.track_no, Some(1));
        assert_eq!(fields.year, None);
        assert_eq!(fields.music_id, "7");
    }

    #[tokio::test]
    async fn missing_cover_url_is_success() {
        let f = fixture().await;
        f.processor.process_cover(f.task_id).await.unwrap();
        assert!(f.tags.calls().is_empty());
    }

    #[tokio::test]
    async fn cover_is_downloaded_and_embedded() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/cover.jpg"))
            .respond_with(ResponseTemplate::new(200).set_body_bytes(vec![0xFF; 16]))
            .expect(1)
            .mount(&server)
            .await;

        let f = fixture().await;
        f.catalog
            .set_cover_url("7", &format!("{}/cover.jpg", server.uri()));
        f.processor.process_cover(f.task_id).await.unwrap();

        assert_eq!(f.tags.calls(), vec![TagCall::Artwork(f.file.clone(), 16)]);
    }

    #[tokio::test]
    async fn cover_http_error_is_reported() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(404))
            .mount(&server)
            .await;

        let f = fixture().await;
        f.catalog
            .set_cover_url("7", &format!("{}/gone.jpg", server.uri()));
        let result = f.processor.process_cover(f.task_id).await;

        assert!(matches!(result, Err(Error::HttpStatus { status: 404, .. })));
    }

    #[tokio::test]
    async fn lyrics_embedded_when_present() {
        let f = fixture().await;
        f.processor.process_lyrics(f.task_id).await.unwrap();
        assert!(f.tags.calls().is_empty());

        f.catalog.set_lyrics("7", "[00:01.00]la la");
        f.processor.process_lyrics(f.task_id).await.unwrap();
        assert_eq!(
            f.tags.calls(),
            vec![TagCall::Lyrics(f.file.clone(), "[00:01.00]la la".to_string())]
        );
    }

    #[tokio::test]
    async fn missing_file_fails_phase() {
        let f = fixture().await;
        std::fs::remove_file(&f.file).unwrap();

        let result = f.processor.process_metadata(f.task_id).await;
        assert!(matches!(
            result,
            Err(Error::Storage(StorageError::TempFileMissing { .. }))
        ));
    }
}
