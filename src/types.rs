//! Core types for music-dl

use crate::db::DownloadJob;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::PathBuf;

macro_rules! id_newtype {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(pub i64);

        impl $name {
            /// Get the inner i64 value
            pub fn get(&self) -> i64 {
                self.0
            }
        }

        impl From<i64> for $name {
            fn from(id: i64) -> Self {
                Self(id)
            }
        }

        impl From<$name> for i64 {
            fn from(id: $name) -> Self {
                id.0
            }
        }

        impl std::fmt::Display for $name {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                write!(f, "{}", self.0)
            }
        }

        impl std::str::FromStr for $name {
            type Err = std::num::ParseIntError;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                Ok(Self(s.parse()?))
            }
        }

        impl sqlx::Type<sqlx::Sqlite> for $name {
            fn type_info() -> sqlx::sqlite::SqliteTypeInfo {
                <i64 as sqlx::Type<sqlx::Sqlite>>::type_info()
            }

            fn compatible(ty: &sqlx::sqlite::SqliteTypeInfo) -> bool {
                <i64 as sqlx::Type<sqlx::Sqlite>>::compatible(ty)
            }
        }

        impl<'q> sqlx::Encode<'q, sqlx::Sqlite> for $name {
            fn encode_by_ref(
                &self,
                buf: &mut Vec<sqlx::sqlite::SqliteArgumentValue<'q>>,
            ) -> Result<sqlx::encode::IsNull, sqlx::error::BoxDynError> {
                sqlx::Encode::<sqlx::Sqlite>::encode_by_ref(&self.0, buf)
            }
        }

        impl<'r> sqlx::Decode<'r, sqlx::Sqlite> for $name {
            fn decode(
                value: sqlx::sqlite::SqliteValueRef<'r>,
            ) -> Result<Self, sqlx::error::BoxDynError> {
                let id = <i64 as sqlx::Decode<sqlx::Sqlite>>::decode(value)?;
                Ok(Self(id))
            }
        }
    };
}

// Enums persisted as lowercase TEXT columns.
macro_rules! text_enum {
    ($name:ident, $label:literal, { $($variant:ident => $text:literal),+ $(,)? }) => {
        impl $name {
            /// Stored and serialized name
            pub fn as_str(&self) -> &'static str {
                match self {
                    $($name::$variant => $text),+
                }
            }
        }

        impl std::fmt::Display for $name {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                f.write_str(self.as_str())
            }
        }

        impl std::str::FromStr for $name {
            type Err = String;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                match s {
                    $($text => Ok($name::$variant),)+
                    other => Err(format!("unknown {}: {}", $label, other)),
                }
            }
        }

        impl sqlx::Type<sqlx::Sqlite> for $name {
            fn type_info() -> sqlx::sqlite::SqliteTypeInfo {
                <String as sqlx::Type<sqlx::Sqlite>>::type_info()
            }

            fn compatible(ty: &sqlx::sqlite::SqliteTypeInfo) -> bool {
                <String as sqlx::Type<sqlx::Sqlite>>::compatible(ty)
            }
        }

        impl<'q> sqlx::Encode<'q, sqlx::Sqlite> for $name {
            fn encode_by_ref(
                &self,
                buf: &mut Vec<sqlx::sqlite::SqliteArgumentValue<'q>>,
            ) -> Result<sqlx::encode::IsNull, sqlx::error::BoxDynError> {
                let text: &'q str = self.as_str();
                sqlx::Encode::<sqlx::Sqlite>::encode_by_ref(&text, buf)
            }
        }

        impl<'r> sqlx::Decode<'r, sqlx::Sqlite> for $name {
            fn decode(
                value: sqlx::sqlite::SqliteValueRef<'r>,
            ) -> Result<Self, sqlx::error::BoxDynError> {
                let text = <&str as sqlx::Decode<sqlx::Sqlite>>::decode(value)?;
                Ok(text.parse::<$name>()?)
            }
        }
    };
}

id_newtype!(
    /// Unique identifier for a download task
    TaskId
);

id_newtype!(
    /// Unique identifier for a download job
    JobId
);

/// Task status
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskStatus {
    /// Created, waiting for a workflow run
    Pending,
    /// Audio transfer in progress
    Downloading,
    /// Tagging and finalize in progress
    Processing,
    /// All required phases done
    Completed,
    /// A required phase failed
    Failed,
    /// Cancelled by the user
    Cancelled,
}

text_enum!(TaskStatus, "task status", {
    Pending => "pending",
    Downloading => "downloading",
    Processing => "processing",
    Completed => "completed",
    Failed => "failed",
    Cancelled => "cancelled",
});

impl TaskStatus {
    /// Every status, in lifecycle order
    pub const ALL: [TaskStatus; 6] = [
        TaskStatus::Pending,
        TaskStatus::Downloading,
        TaskStatus::Processing,
        TaskStatus::Completed,
        TaskStatus::Failed,
        TaskStatus::Cancelled,
    ];

    /// Whether no further workflow progress will happen without an explicit reset
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            TaskStatus::Completed | TaskStatus::Failed | TaskStatus::Cancelled
        )
    }
}

/// Job status
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    /// Never scanned
    Created,
    /// Source listing being resolved
    Scanning,
    /// Batches dispatched
    Downloading,
    /// Last scan finished
    Completed,
    /// Last scan failed
    Failed,
    /// Paused by the user
    Paused,
}

text_enum!(JobStatus, "job status", {
    Created => "created",
    Scanning => "scanning",
    Downloading => "downloading",
    Completed => "completed",
    Failed => "failed",
    Paused => "paused",
});

/// What a job mirrors
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SourceType {
    /// A catalog playlist
    Playlist,
    /// A catalog album
    Album,
    /// An artist's catalog
    Artist,
    /// Tracks submitted one by one
    Manual,
}

text_enum!(SourceType, "source type", {
    Playlist => "playlist",
    Album => "album",
    Artist => "artist",
    Manual => "manual",
});

/// Per-task progress bitmask
///
/// Flags only accumulate during a workflow run; [`crate::db::Database::reset_task`] is the
/// one place they are cleared.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TaskProgress(pub i64);

impl TaskProgress {
    /// No phase done
    pub const NONE: TaskProgress = TaskProgress(0);
    /// Audio bytes are in the temp file
    pub const MUSIC_DOWNLOADED: TaskProgress = TaskProgress(1);
    /// Tags written
    pub const METADATA_COMPLETED: TaskProgress = TaskProgress(2);
    /// Cover art embedded
    pub const COVER_COMPLETED: TaskProgress = TaskProgress(4);
    /// Lyrics embedded
    pub const LYRICS_COMPLETED: TaskProgress = TaskProgress(8);
    /// File moved to its permanent location
    pub const FILE_FINALIZED: TaskProgress = TaskProgress(16);

    /// Raw bits
    pub fn bits(&self) -> i64 {
        self.0
    }

    /// True if every bit of `other` is set in `self`
    pub fn contains(&self, other: TaskProgress) -> bool {
        self.0 & other.0 == other.0
    }

    /// Whether `self` satisfies the `required` mask
    pub fn satisfies(&self, required: TaskProgress) -> bool {
        self.contains(required)
    }
}

impl std::ops::BitOr for TaskProgress {
    type Output = TaskProgress;

    fn bitor(self, rhs: Self) -> Self::Output {
        TaskProgress(self.0 | rhs.0)
    }
}

impl std::ops::BitOrAssign for TaskProgress {
    fn bitor_assign(&mut self, rhs: Self) {
        self.0 |= rhs.0;
    }
}

/// Flags a task of `job` must carry to count as completed
///
/// Computed from the job as it is now, so toggling an embed option changes what
/// in-flight tasks need.
pub fn required_flags(job: &DownloadJob) -> TaskProgress {
    let mut required = TaskProgress::MUSIC_DOWNLOADED | TaskProgress::FILE_FINALIZED;
    if job.embed_metadata {
        required |= TaskProgress::METADATA_COMPLETED;
    }
    if job.embed_cover {
        required |= TaskProgress::COVER_COMPLETED;
    }
    if job.embed_lyrics {
        required |= TaskProgress::LYRICS_COMPLETED;
    }
    required
}

/// Event emitted during task and job lifecycle
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Event {
    /// Task created and its workflow spawned
    TaskQueued {
        /// Task ID
        task_id: TaskId,
        /// Owning job
        job_id: JobId,
        /// Catalog track id
        music_id: String,
    },

    /// Workflow run started
    TaskStarted {
        /// Task ID
        task_id: TaskId,
    },

    /// All required phases done
    TaskCompleted {
        /// Task ID
        task_id: TaskId,
        /// Final file location
        #[serde(skip_serializing_if = "Option::is_none")]
        path: Option<PathBuf>,
    },

    /// Task satisfied by copying another job's file
    TaskCopied {
        /// Task ID
        task_id: TaskId,
        /// Task whose file was copied
        source_task_id: TaskId,
    },

    /// A required phase failed
    TaskFailed {
        /// Task ID
        task_id: TaskId,
        /// Error message
        error: String,
    },

    /// Task cancelled
    TaskCancelled {
        /// Task ID
        task_id: TaskId,
    },

    /// Batch scan started
    ScanStarted,

    /// One job finished scanning
    JobScanned {
        /// Job ID
        job_id: JobId,
        /// Tasks created by this scan
        new_tasks: usize,
        /// New tasks satisfied by copy
        copied: usize,
    },

    /// A job's scan failed
    JobScanFailed {
        /// Job ID
        job_id: JobId,
        /// Error message
        error: String,
    },

    /// Batch scan finished
    ScanFinished {
        /// Jobs processed
        processed_jobs: usize,
        /// Tasks dispatched to the workflow
        submitted_tasks: usize,
    },
}

/// Orchestrator statistics
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct OrchestratorStats {
    /// Workflow futures currently registered
    pub active_tasks: usize,

    /// Task ids with a registered future
    pub active_task_ids: Vec<TaskId>,

    /// Task rows per status, from the database
    pub by_status: HashMap<TaskStatus, i64>,

    /// Task rows in total
    pub total_tasks: i64,

    /// Current task-level concurrency bound
    pub max_concurrent_downloads: usize,

    /// Current segment-level concurrency bound
    pub max_threads_per_download: usize,
}
