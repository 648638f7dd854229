//! Per-task phase runner
//!
//! A task moves through fixed phases, each recorded as a bit in `progress_flags`:
//!
//! 1. Audio download (required, skipped when already recorded)
//! 2. Metadata, cover and lyrics (each required only if the job enables it; failures are
//!    logged and leave the bit unset)
//! 3. Finalize (required)
//! 4. Completion check against [`required_flags`] of the job as it is *now*
//!
//! Bits are only ever added here, so re-running a task after a restart picks up where
//! the persisted bits left off.

use crate::db::{Database, DownloadJob, DownloadTask};
use crate::downloader::AudioFetcher;
use crate::error::{Error, Result, TaskError};
use crate::metadata::MetadataProcessor;
use crate::storage::StorageManager;
use crate::types::{TaskId, TaskProgress, TaskStatus, required_flags};
use std::future::Future;
use std::path::PathBuf;
use std::sync::Arc;

/// Drives one task through its phases
pub struct WorkflowEngine {
    db: Arc<Database>,
    fetcher: Arc<dyn AudioFetcher>,
    metadata: Arc<MetadataProcessor>,
    storage: Arc<StorageManager>,
}

impl WorkflowEngine {
    /// Create an engine over its phase handlers
    pub fn new(
        db: Arc<Database>,
        fetcher: Arc<dyn AudioFetcher>,
        metadata: Arc<MetadataProcessor>,
        storage: Arc<StorageManager>,
    ) -> Self {
        Self {
            db,
            fetcher,
            metadata,
            storage,
        }
    }

    /// Run every outstanding phase of `task_id`
    ///
    /// On success the task is `completed` and its final path is returned. A failed
    /// required phase, a failed database update or an unmet completion check leaves the
    /// task `failed` with the reason in `error_message`, and the error is returned.
    pub async fn execute(&self, task_id: TaskId) -> Result<PathBuf> {
        let loaded = self.load(task_id).await;
        let (task, job) = self.step(task_id, loaded).await?;
        let started = self.db.mark_task_started(task_id).await;
        self.step(task_id, started).await?;
        let mut progress = task.progress();

        if progress.contains(TaskProgress::MUSIC_DOWNLOADED) {
            tracing::debug!(task_id = %task_id, "audio already downloaded, skipping");
        } else {
            if let Err(e) = self.fetcher.download(&task).await {
                return self.fail(task_id, format!("Download failed: {}", e), e).await;
            }
            let recorded = self
                .record(task_id, &mut progress, TaskProgress::MUSIC_DOWNLOADED)
                .await;
            self.step(task_id, recorded).await?;
        }

        let processing = self
            .db
            .update_task_status(task_id, TaskStatus::Processing, None)
            .await;
        self.step(task_id, processing).await?;

        if job.embed_metadata {
            self.optional_phase(
                task_id,
                &mut progress,
                TaskProgress::METADATA_COMPLETED,
                "metadata",
                self.metadata.process_metadata(task_id),
            )
            .await;
        }
        if job.embed_cover {
            self.optional_phase(
                task_id,
                &mut progress,
                TaskProgress::COVER_COMPLETED,
                "cover",
                self.metadata.process_cover(task_id),
            )
            .await;
        }
        if job.embed_lyrics {
            self.optional_phase(
                task_id,
                &mut progress,
                TaskProgress::LYRICS_COMPLETED,
                "lyrics",
                self.metadata.process_lyrics(task_id),
            )
            .await;
        }

        let final_path = match self.finalize(task_id, &task, progress).await {
            Ok(path) => path,
            Err(e) => {
                return self
                    .fail(task_id, format!("Finalization failed: {}", e), e)
                    .await;
            }
        };
        let recorded = self
            .record(task_id, &mut progress, TaskProgress::FILE_FINALIZED)
            .await;
        self.step(task_id, recorded).await?;

        // The job may have changed while the phases ran
        let reloaded = self.load(task_id).await;
        let (task, job) = self.step(task_id, reloaded).await?;
        let required = required_flags(&job);
        let actual = task.progress();
        if !actual.satisfies(required) {
            let e = TaskError::Incomplete {
                id: task_id.get(),
                required: required.bits(),
                actual: actual.bits(),
            };
            return self.fail(task_id, e.to_string(), e.into()).await;
        }

        let completed = self
            .db
            .update_task_status(task_id, TaskStatus::Completed, None)
            .await;
        self.step(task_id, completed).await?;
        if let Err(e) = self.db.mark_task_finished(task_id).await {
            tracing::warn!(task_id = %task_id, error = %e, "could not stamp task end");
        }

        tracing::info!(task_id = %task_id, path = %final_path.display(), "task completed");
        Ok(final_path)
    }

    async fn load(&self, task_id: TaskId) -> Result<(DownloadTask, DownloadJob)> {
        let task = self
            .db
            .get_task(task_id)
            .await?
            .ok_or(TaskError::NotFound { id: task_id.get() })?;
        let job = self
            .db
            .get_job(task.job_id)
            .await?
            .ok_or(TaskError::JobNotFound {
                id: task.job_id.get(),
            })?;
        Ok((task, job))
    }

    async fn finalize(
        &self,
        task_id: TaskId,
        task: &DownloadTask,
        progress: TaskProgress,
    ) -> Result<PathBuf> {
        if progress.contains(TaskProgress::FILE_FINALIZED) {
            if let Some(path) = task.file_path.as_deref().map(PathBuf::from) {
                if tokio::fs::try_exists(&path).await.unwrap_or(false) {
                    tracing::debug!(task_id = %task_id, "already finalized, skipping");
                    return Ok(path);
                }
            }
        }
        self.storage.finalize(task_id).await
    }

    async fn record(
        &self,
        task_id: TaskId,
        progress: &mut TaskProgress,
        flag: TaskProgress,
    ) -> Result<()> {
        self.db.add_progress_flags(task_id, flag).await?;
        *progress |= flag;
        Ok(())
    }

    async fn optional_phase(
        &self,
        task_id: TaskId,
        progress: &mut TaskProgress,
        flag: TaskProgress,
        phase: &'static str,
        run: impl Future<Output = Result<()>>,
    ) {
        if progress.contains(flag) {
            tracing::debug!(task_id = %task_id, phase, "phase already done, skipping");
            return;
        }

        match run.await {
            Ok(()) => {
                if let Err(e) = self.record(task_id, progress, flag).await {
                    tracing::warn!(task_id = %task_id, phase, error = %e, "could not record phase");
                }
            }
            Err(e) => {
                tracing::warn!(task_id = %task_id, phase, error = %e, "optional phase failed");
            }
        }
    }

    /// Pass `result` through, failing the task if it is an error
    async fn step<T>(&self, task_id: TaskId, result: Result<T>) -> Result<T> {
        match result {
            Ok(value) => Ok(value),
            Err(e) => self.fail(task_id, format!("Task update failed: {}", e), e).await,
        }
    }

    async fn fail<T>(&self, task_id: TaskId, message: String, error: Error) -> Result<T> {
        tracing::error!(task_id = %task_id, error = %message, "task failed");
        if let Err(e) = self
            .db
            .update_task_status(task_id, TaskStatus::Failed, Some(&message))
            .await
        {
            tracing::error!(task_id = %task_id, error = %e, "could not record task failure");
        }
        if let Err(e) = self.db.mark_task_finished(task_id).await {
            tracing::warn!(task_id = %task_id, error = %e, "could not stamp task end");
        }
        Err(error)
    }
}
