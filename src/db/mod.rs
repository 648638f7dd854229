//! Database layer for music-dl
//!
//! Handles SQLite persistence for download jobs and their tasks.
//!
//! ## Submodules
//!
//! Methods on [`Database`] are organized by domain:
//! - [`migrations`] - Database lifecycle, schema migrations
//! - [`jobs`] - Job CRUD and counters
//! - [`tasks`] - Task CRUD, progress flags, dedup and copy lookups
//!
//! Each method is one unit of work: either a single statement or a transaction that
//! commits on success and rolls back when dropped on an error path.

use crate::error::{DatabaseError, Error};
use crate::types::{JobId, JobStatus, SourceType, TaskId, TaskProgress, TaskStatus};
use serde::{Deserialize, Serialize};
use sqlx::{FromRow, sqlite::SqlitePool};

mod jobs;
mod migrations;
mod tasks;

/// New job to be inserted into the database
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewJob {
    /// Display name
    pub job_name: String,
    /// What the job mirrors
    pub source_type: SourceType,
    /// Catalog id of the source (playlist id, album id, ...); empty for manual jobs
    pub source_id: String,
    /// Display name of the source
    pub source_name: Option<String>,
    /// Root directory for finalized files
    pub storage_path: String,
    /// Filename template, e.g. "{artist} - {title}"
    pub filename_template: String,
    /// Quality requested from the catalog
    pub target_quality: String,
    /// Embed cover art
    pub embed_cover: bool,
    /// Embed lyrics
    pub embed_lyrics: bool,
    /// Write tags
    pub embed_metadata: bool,
    /// Include in batch scans
    pub enabled: bool,
}

impl NewJob {
    /// A playlist job with default template, quality and embed options
    pub fn playlist(
        job_name: impl Into<String>,
        playlist_id: impl Into<String>,
        storage_path: impl Into<String>,
    ) -> Self {
        Self {
            job_name: job_name.into(),
            source_type: SourceType::Playlist,
            source_id: playlist_id.into(),
            source_name: None,
            storage_path: storage_path.into(),
            filename_template: DEFAULT_FILENAME_TEMPLATE.to_string(),
            target_quality: DEFAULT_TARGET_QUALITY.to_string(),
            embed_cover: true,
            embed_lyrics: true,
            embed_metadata: true,
            enabled: true,
        }
    }

    /// A manual job that only receives explicitly submitted tracks
    pub fn manual(job_name: impl Into<String>, storage_path: impl Into<String>) -> Self {
        Self {
            source_type: SourceType::Manual,
            source_id: String::new(),
            ..Self::playlist(job_name, "", storage_path)
        }
    }
}

/// Template used when a job does not specify one
pub const DEFAULT_FILENAME_TEMPLATE: &str = "{artist} - {title}";

/// Quality used when a job does not specify one
pub const DEFAULT_TARGET_QUALITY: &str = "lossless";

/// Partial job update; `None` fields are left unchanged
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct JobUpdate {
    /// New display name
    pub job_name: Option<String>,
    /// New source display name
    pub source_name: Option<String>,
    /// New storage root
    pub storage_path: Option<String>,
    /// New filename template
    pub filename_template: Option<String>,
    /// New target quality
    pub target_quality: Option<String>,
    /// New cover option
    pub embed_cover: Option<bool>,
    /// New lyrics option
    pub embed_lyrics: Option<bool>,
    /// New metadata option
    pub embed_metadata: Option<bool>,
    /// New enabled flag
    pub enabled: Option<bool>,
    /// New status
    pub status: Option<JobStatus>,
}

/// Job record from database
#[derive(Debug, Clone, FromRow, Serialize, Deserialize)]
pub struct DownloadJob {
    /// Unique database ID
    pub id: JobId,
    /// Display name
    pub job_name: String,
    /// What the job mirrors
    pub source_type: SourceType,
    /// Catalog id of the source
    pub source_id: String,
    /// Display name of the source
    pub source_name: Option<String>,
    /// Root directory for finalized files
    pub storage_path: String,
    /// Filename template
    pub filename_template: String,
    /// Quality requested from the catalog
    pub target_quality: String,
    /// Embed cover art
    pub embed_cover: bool,
    /// Embed lyrics
    pub embed_lyrics: bool,
    /// Write tags
    pub embed_metadata: bool,
    /// Current status
    pub status: JobStatus,
    /// Include in batch scans
    pub enabled: bool,
    /// Task rows under this job
    pub total_tasks: i64,
    /// Completed task rows under this job
    pub completed_tasks: i64,
    /// Failed task rows under this job
    pub failed_tasks: i64,
    /// Unix timestamp when the job was created
    pub created_at: i64,
    /// Unix timestamp of the last change
    pub updated_at: i64,
    /// Unix timestamp when the last scan started
    pub started_at: Option<i64>,
    /// Unix timestamp when the last scan finished
    pub completed_at: Option<i64>,
}

/// New task to be inserted into the database
#[derive(Debug, Clone)]
pub struct NewTask {
    /// Owning job
    pub job_id: JobId,
    /// Catalog track id
    pub music_id: String,
    /// Track title, if already known
    pub music_title: Option<String>,
    /// Track artists, if already known
    pub music_artist: Option<String>,
    /// Album, if already known
    pub music_album: Option<String>,
    /// Requested quality
    pub quality: String,
}

/// Task record from database
#[derive(Debug, Clone, FromRow, Serialize, Deserialize)]
pub struct DownloadTask {
    /// Unique database ID
    pub id: TaskId,
    /// Owning job
    pub job_id: JobId,
    /// Catalog track id
    pub music_id: String,
    /// Track title
    pub music_title: Option<String>,
    /// Track artists joined by ", "
    pub music_artist: Option<String>,
    /// Album
    pub music_album: Option<String>,
    /// Negotiated quality (may differ from the job's target)
    pub quality: String,
    /// Raw progress bits (see [`TaskProgress`])
    pub progress_flags: i64,
    /// Temp path while downloading, final path once finalized
    pub file_path: Option<String>,
    /// File name component of `file_path`
    pub file_name: Option<String>,
    /// Lowercase container format (flac, mp3, ...)
    pub file_format: Option<String>,
    /// Size in bytes reported by the catalog
    pub file_size: Option<i64>,
    /// Current status
    pub status: TaskStatus,
    /// Error message if the task failed
    pub error_message: Option<String>,
    /// Audit note (JSON), e.g. where a copied file came from
    pub note: Option<String>,
    /// Unix timestamp when the task was created
    pub created_at: i64,
    /// Unix timestamp of the last change
    pub updated_at: i64,
    /// Unix timestamp when the last workflow run started
    pub started_at: Option<i64>,
    /// Unix timestamp when the last workflow run ended
    pub completed_at: Option<i64>,
}

impl DownloadTask {
    /// Typed view of `progress_flags`
    pub fn progress(&self) -> TaskProgress {
        TaskProgress(self.progress_flags)
    }
}

/// Task search filter
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TaskSearch {
    /// Restrict to one job
    pub job_id: Option<JobId>,
    /// Restrict to one status
    pub status: Option<TaskStatus>,
    /// Substring match over title, artist, album and music id
    pub keyword: Option<String>,
    /// Page size (default 50)
    pub limit: Option<i64>,
    /// Rows to skip
    pub offset: Option<i64>,
}

/// One page of search results
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskPage {
    /// Matching rows on this page, newest first
    pub tasks: Vec<DownloadTask>,
    /// Matching rows across all pages
    pub total: i64,
}

/// Download location and negotiated format recorded before a workflow run
#[derive(Debug, Clone)]
pub struct DownloadInfo {
    /// Negotiated quality
    pub quality: String,
    /// Temp file path
    pub file_path: String,
    /// Temp file name
    pub file_name: String,
    /// Lowercase container format
    pub file_format: String,
    /// Size reported by the catalog
    pub file_size: Option<i64>,
}

/// Fields written when a task is satisfied by copying another task's file
#[derive(Debug, Clone)]
pub struct CopiedTask {
    /// Quality of the source file
    pub quality: String,
    /// Where the copy was placed
    pub file_path: String,
    /// File name component of `file_path`
    pub file_name: String,
    /// Format of the source file
    pub file_format: Option<String>,
    /// Size of the copy in bytes
    pub file_size: Option<i64>,
    /// Progress bits copied from the source
    pub progress_flags: i64,
    /// Source track info
    pub music_title: Option<String>,
    /// Source track info
    pub music_artist: Option<String>,
    /// Source track info
    pub music_album: Option<String>,
    /// JSON audit note
    pub note: String,
}

/// Database handle with connection pool
pub struct Database {
    pool: SqlitePool,
}

pub(crate) fn now() -> i64 {
    chrono::Utc::now().timestamp()
}

fn query_failed(action: &'static str) -> impl FnOnce(sqlx::Error) -> Error {
    move |e| {
        Error::Database(DatabaseError::QueryFailed(format!(
            "Failed to {}: {}",
            action, e
        )))
    }
}

#[cfg(test)]
impl DownloadJob {
    pub(crate) fn for_tests() -> Self {
        Self {
            id: JobId(1),
            job_name: "test".to_string(),
            source_type: SourceType::Manual,
            source_id: String::new(),
            source_name: None,
            storage_path: "/tmp".to_string(),
            filename_template: DEFAULT_FILENAME_TEMPLATE.to_string(),
            target_quality: DEFAULT_TARGET_QUALITY.to_string(),
            embed_cover: false,
            embed_lyrics: false,
            embed_metadata: false,
            status: JobStatus::Created,
            enabled: true,
            total_tasks: 0,
            completed_tasks: 0,
            failed_tasks: 0,
            created_at: 0,
            updated_at: 0,
            started_at: None,
            completed_at: None,
        }
    }
}

#[allow(clippy::unwrap_used, clippy::expect_used)]
#[cfg(test)]
mod tests;
