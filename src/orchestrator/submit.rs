//! Task submission: single, batch, quality upgrade and startup resume.

use crate::db::NewTask;
use crate::error::{Result, TaskError};
use crate::types::{Event, JobId, TaskId};

use super::DownloadOrchestrator;

impl DownloadOrchestrator {
    /// Submit one track under a job
    ///
    /// Idempotent per `(job_id, music_id)`: if the task already exists its id is returned
    /// and no second workflow is started. Otherwise a `pending` row is created, its cache
    /// entry is created and a workflow run is spawned. `target_quality` defaults to the
    /// job's.
    pub async fn submit_download(
        &self,
        music_id: &str,
        job_id: JobId,
        target_quality: Option<&str>,
    ) -> Result<TaskId> {
        self.ensure_accepting()?;

        let job = self
            .db
            .get_job(job_id)
            .await?
            .ok_or(TaskError::JobNotFound { id: job_id.get() })?;
        let quality = target_quality.unwrap_or(&job.target_quality);

        let (task, created) = self
            .db
            .insert_task_if_absent(&NewTask {
                job_id,
                music_id: music_id.to_string(),
                music_title: None,
                music_artist: None,
                music_album: None,
                quality: quality.to_string(),
            })
            .await?;

        if !created {
            tracing::debug!(task_id = %task.id, job_id = %job_id, music_id, "task already exists");
            return Ok(task.id);
        }

        self.queue_task(task.id, job_id, music_id).await;
        tracing::info!(task_id = %task.id, job_id = %job_id, music_id, quality, "task submitted");
        Ok(task.id)
    }

    /// Submit tracks one after another; a failed submission is logged and skipped
    ///
    /// The job's `total_tasks` is set to the number of ids returned.
    pub async fn submit_batch_download(
        &self,
        job_id: JobId,
        music_ids: &[String],
    ) -> Result<Vec<TaskId>> {
        let mut task_ids = Vec::with_capacity(music_ids.len());
        for music_id in music_ids {
            match self.submit_download(music_id, job_id, None).await {
                Ok(task_id) => task_ids.push(task_id),
                Err(e) => {
                    tracing::warn!(job_id = %job_id, music_id = %music_id, error = %e, "submission failed");
                }
            }
        }

        self.db
            .set_job_total_tasks(job_id, task_ids.len() as i64)
            .await?;
        tracing::info!(
            job_id = %job_id,
            requested = music_ids.len(),
            submitted = task_ids.len(),
            "batch submitted"
        );
        Ok(task_ids)
    }

    /// Replace the task for `(job_id, music_id)` with one at `new_quality`
    ///
    /// Any in-flight run of the old task is cancelled before its row is deleted.
    pub async fn upgrade_task_quality(
        &self,
        job_id: JobId,
        music_id: &str,
        new_quality: &str,
    ) -> Result<TaskId> {
        self.ensure_accepting()?;

        if let Some(existing) = self.db.get_task_by_job_and_music(job_id, music_id).await? {
            self.tasks.cancel(existing.id).await;
            self.caches.remove(existing.id).await;
            self.discard_finalized_output(&existing).await?;
            self.db.delete_task(existing.id).await?;
            tracing::info!(
                task_id = %existing.id,
                from = %existing.quality,
                to = new_quality,
                "replacing task for quality upgrade"
            );
        }

        self.submit_download(music_id, job_id, Some(new_quality))
            .await
    }

    /// Re-spawn every `pending`, `downloading` or `processing` task
    ///
    /// Meant for startup, after a crash or restart left rows mid-flight. Progress bits
    /// are kept, so finished phases are not repeated. Returns the ids that were spawned.
    pub async fn resume_unfinished_tasks(&self) -> Result<Vec<TaskId>> {
        self.ensure_accepting()?;

        let mut resumed = Vec::new();
        for task in self.db.list_unfinished_tasks().await? {
            self.caches.get_or_create(task.id, &task.music_id).await;
            if self.spawn_workflow(task.id).await {
                resumed.push(task.id);
            }
        }

        if !resumed.is_empty() {
            tracing::info!(count = resumed.len(), "resumed unfinished tasks");
        }
        Ok(resumed)
    }

    /// Create the cache entry, announce the task and spawn its run
    pub(crate) async fn queue_task(&self, task_id: TaskId, job_id: JobId, music_id: &str) {
        self.caches.get_or_create(task_id, music_id).await;
        self.emit_event(Event::TaskQueued {
            task_id,
            job_id,
            music_id: music_id.to_string(),
        });
        self.spawn_workflow(task_id).await;
    }
}
