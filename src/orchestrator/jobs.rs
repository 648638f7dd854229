//! Job CRUD and task queries.

use crate::db::{DownloadJob, DownloadTask, JobUpdate, NewJob, TaskPage, TaskSearch};
use crate::error::Result;
use crate::types::{JobId, TaskId};

use super::DownloadOrchestrator;

impl DownloadOrchestrator {
    /// Create a job
    pub async fn create_job(&self, job: &NewJob) -> Result<DownloadJob> {
        let job = self.db.insert_job(job).await?;
        tracing::info!(
            job_id = %job.id,
            source_type = %job.source_type,
            source_id = %job.source_id,
            "job created"
        );
        Ok(job)
    }

    /// Get a job by id
    pub async fn get_job(&self, job_id: JobId) -> Result<Option<DownloadJob>> {
        self.db.get_job(job_id).await
    }

    /// All jobs, oldest first
    pub async fn list_jobs(&self) -> Result<Vec<DownloadJob>> {
        self.db.list_jobs().await
    }

    /// Apply a partial update; `None` if the job does not exist
    ///
    /// Embed options take effect for running tasks at their completion check.
    pub async fn update_job(&self, job_id: JobId, update: &JobUpdate) -> Result<Option<DownloadJob>> {
        self.db.update_job(job_id, update).await
    }

    /// Delete a job and its tasks, stopping their runs first
    pub async fn delete_job(&self, job_id: JobId) -> Result<bool> {
        let mut stopped = 0usize;
        for task in self.db.list_tasks_by_job(job_id).await? {
            if self.tasks.cancel(task.id).await {
                stopped += 1;
            }
            self.caches.remove(task.id).await;
        }

        let deleted = self.db.delete_job(job_id).await?;
        if deleted {
            tracing::info!(job_id = %job_id, stopped_runs = stopped, "job deleted");
        }
        Ok(deleted)
    }

    /// Get a task by id
    pub async fn get_task(&self, task_id: TaskId) -> Result<Option<DownloadTask>> {
        self.db.get_task(task_id).await
    }

    /// Filtered, paginated task listing
    pub async fn search_tasks(&self, search: &TaskSearch) -> Result<TaskPage> {
        self.db.search_tasks(search).await
    }

    /// Rows of the tasks that currently have a run in flight
    pub async fn list_active_tasks(&self) -> Result<Vec<DownloadTask>> {
        let mut tasks = Vec::new();
        for task_id in self.tasks.active_task_ids().await {
            if let Some(task) = self.db.get_task(task_id).await? {
                tasks.push(task);
            }
        }
        Ok(tasks)
    }
}
