//! Job CRUD and counter maintenance.

use crate::Result;
use crate::types::{JobId, JobStatus, SourceType, TaskStatus};

use super::{Database, DownloadJob, JobUpdate, NewJob, now, query_failed};

impl Database {
    /// Insert a new job and return it
    pub async fn insert_job(&self, job: &NewJob) -> Result<DownloadJob> {
        let now = now();

        let result = sqlx::query(
            r#"
            INSERT INTO download_job (
                job_name, source_type, source_id, source_name, storage_path,
                filename_template, target_quality, embed_cover, embed_lyrics,
                embed_metadata, status, enabled, created_at, updated_at
            ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&job.job_name)
        .bind(job.source_type)
        .bind(&job.source_id)
        .bind(&job.source_name)
        .bind(&job.storage_path)
        .bind(&job.filename_template)
        .bind(&job.target_quality)
        .bind(job.embed_cover)
        .bind(job.embed_lyrics)
        .bind(job.embed_metadata)
        .bind(JobStatus::Created)
        .bind(job.enabled)
        .bind(now)
        .bind(now)
        .execute(&self.pool)
        .await
        .map_err(query_failed("insert job"))?;

        let id = JobId(result.last_insert_rowid());
        self.get_job(id)
            .await?
            .ok_or_else(|| crate::error::TaskError::JobNotFound { id: id.0 }.into())
    }

    /// Get a job by ID
    pub async fn get_job(&self, id: JobId) -> Result<Option<DownloadJob>> {
        sqlx::query_as::<_, DownloadJob>("SELECT * FROM download_job WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .map_err(query_failed("get job"))
    }

    /// Find the job mirroring a given source
    pub async fn get_job_by_source(
        &self,
        source_type: SourceType,
        source_id: &str,
    ) -> Result<Option<DownloadJob>> {
        sqlx::query_as::<_, DownloadJob>(
            "SELECT * FROM download_job WHERE source_type = ? AND source_id = ? ORDER BY id LIMIT 1",
        )
        .bind(source_type)
        .bind(source_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(query_failed("get job by source"))
    }

    /// List all jobs, oldest first
    pub async fn list_jobs(&self) -> Result<Vec<DownloadJob>> {
        sqlx::query_as::<_, DownloadJob>("SELECT * FROM download_job ORDER BY id")
            .fetch_all(&self.pool)
            .await
            .map_err(query_failed("list jobs"))
    }

    /// List jobs included in batch scans
    pub async fn list_enabled_jobs(&self) -> Result<Vec<DownloadJob>> {
        sqlx::query_as::<_, DownloadJob>(
            "SELECT * FROM download_job WHERE enabled = 1 ORDER BY id",
        )
        .fetch_all(&self.pool)
        .await
        .map_err(query_failed("list enabled jobs"))
    }

    /// Apply a partial update; returns the updated job, or `None` if it doesn't exist
    pub async fn update_job(&self, id: JobId, update: &JobUpdate) -> Result<Option<DownloadJob>> {
        let result = sqlx::query(
            r#"
            UPDATE download_job SET
                job_name = COALESCE(?, job_name),
                source_name = COALESCE(?, source_name),
                storage_path = COALESCE(?, storage_path),
                filename_template = COALESCE(?, filename_template),
                target_quality = COALESCE(?, target_quality),
                embed_cover = COALESCE(?, embed_cover),
                embed_lyrics = COALESCE(?, embed_lyrics),
                embed_metadata = COALESCE(?, embed_metadata),
                enabled = COALESCE(?, enabled),
                status = COALESCE(?, status),
                updated_at = ?
            WHERE id = ?
            "#,
        )
        .bind(&update.job_name)
        .bind(&update.source_name)
        .bind(&update.storage_path)
        .bind(&update.filename_template)
        .bind(&update.target_quality)
        .bind(update.embed_cover)
        .bind(update.embed_lyrics)
        .bind(update.embed_metadata)
        .bind(update.enabled)
        .bind(update.status)
        .bind(now())
        .bind(id)
        .execute(&self.pool)
        .await
        .map_err(query_failed("update job"))?;

        if result.rows_affected() == 0 {
            return Ok(None);
        }
        self.get_job(id).await
    }

    /// Set job status, stamping scan start/finish times
    pub async fn set_job_status(&self, id: JobId, status: JobStatus) -> Result<()> {
        let now = now();
        let started_at = (status == JobStatus::Scanning).then_some(now);
        let completed_at =
            matches!(status, JobStatus::Completed | JobStatus::Failed).then_some(now);

        sqlx::query(
            r#"
            UPDATE download_job SET
                status = ?,
                started_at = COALESCE(?, started_at),
                completed_at = COALESCE(?, completed_at),
                updated_at = ?
            WHERE id = ?
            "#,
        )
        .bind(status)
        .bind(started_at)
        .bind(completed_at)
        .bind(now)
        .bind(id)
        .execute(&self.pool)
        .await
        .map_err(query_failed("set job status"))?;

        Ok(())
    }

    /// Overwrite the job's total task counter
    pub async fn set_job_total_tasks(&self, id: JobId, total: i64) -> Result<()> {
        sqlx::query("UPDATE download_job SET total_tasks = ?, updated_at = ? WHERE id = ?")
            .bind(total)
            .bind(now())
            .bind(id)
            .execute(&self.pool)
            .await
            .map_err(query_failed("set job total tasks"))?;

        Ok(())
    }

    /// Recount the job's total/completed/failed counters from its task rows
    pub async fn refresh_job_counters(&self, id: JobId) -> Result<()> {
        sqlx::query(
            r#"
            UPDATE download_job SET
                total_tasks = (SELECT COUNT(*) FROM download_task WHERE job_id = ?),
                completed_tasks = (SELECT COUNT(*) FROM download_task WHERE job_id = ? AND status = ?),
                failed_tasks = (SELECT COUNT(*) FROM download_task WHERE job_id = ? AND status = ?),
                updated_at = ?
            WHERE id = ?
            "#,
        )
        .bind(id)
        .bind(id)
        .bind(TaskStatus::Completed)
        .bind(id)
        .bind(TaskStatus::Failed)
        .bind(now())
        .bind(id)
        .execute(&self.pool)
        .await
        .map_err(query_failed("refresh job counters"))?;

        Ok(())
    }

    /// Delete a job and (by cascade) its tasks; returns whether a row was removed
    pub async fn delete_job(&self, id: JobId) -> Result<bool> {
        let result = sqlx::query("DELETE FROM download_job WHERE id = ?")
            .bind(id)
            .execute(&self.pool)
            .await
            .map_err(query_failed("delete job"))?;

        Ok(result.rows_affected() > 0)
    }
}
