//! Task CRUD, progress flags, dedup and copy lookups.

use crate::Result;
use crate::types::{JobId, TaskId, TaskProgress, TaskStatus};
use sqlx::{QueryBuilder, Sqlite};
use std::collections::HashMap;

use super::{
    CopiedTask, Database, DownloadInfo, DownloadTask, NewTask, TaskPage, TaskSearch, now,
    query_failed,
};

// SQLite default SQLITE_MAX_VARIABLE_NUMBER is 999; a task row binds 9 values.
const MAX_TASKS_PER_INSERT: usize = 110;

const DEFAULT_PAGE_SIZE: i64 = 50;

impl Database {
    /// Insert a task unless one already exists for (job_id, music_id)
    ///
    /// Returns the stored task and whether this call created it. Concurrent callers racing
    /// on the same pair see exactly one `true`.
    pub async fn insert_task_if_absent(&self, task: &NewTask) -> Result<(DownloadTask, bool)> {
        let now = now();

        let result = sqlx::query(
            r#"
            INSERT OR IGNORE INTO download_task (
                job_id, music_id, music_title, music_artist, music_album,
                quality, status, created_at, updated_at
            ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(task.job_id)
        .bind(&task.music_id)
        .bind(&task.music_title)
        .bind(&task.music_artist)
        .bind(&task.music_album)
        .bind(&task.quality)
        .bind(TaskStatus::Pending)
        .bind(now)
        .bind(now)
        .execute(&self.pool)
        .await
        .map_err(query_failed("insert task"))?;

        let created = result.rows_affected() == 1;
        let stored = self
            .get_task_by_job_and_music(task.job_id, &task.music_id)
            .await?
            .ok_or_else(|| {
                crate::Error::Database(crate::error::DatabaseError::QueryFailed(format!(
                    "task for job {} music {} vanished after insert",
                    task.job_id, task.music_id
                )))
            })?;

        Ok((stored, created))
    }

    /// Insert every task whose (job_id, music_id) pair is not stored yet
    ///
    /// Runs as one transaction of multi-row `INSERT OR IGNORE ... RETURNING` statements and
    /// returns only the rows that were actually created, in input order.
    pub async fn insert_tasks_if_absent(&self, tasks: &[NewTask]) -> Result<Vec<DownloadTask>> {
        if tasks.is_empty() {
            return Ok(Vec::new());
        }

        let now = now();
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(query_failed("begin task batch"))?;
        let mut created = Vec::new();

        for chunk in tasks.chunks(MAX_TASKS_PER_INSERT) {
            let mut query_builder = QueryBuilder::<Sqlite>::new(
                "INSERT OR IGNORE INTO download_task (job_id, music_id, music_title, music_artist, music_album, quality, status, created_at, updated_at) ",
            );

            query_builder.push_values(chunk, |mut b, task| {
                b.push_bind(task.job_id)
                    .push_bind(&task.music_id)
                    .push_bind(&task.music_title)
                    .push_bind(&task.music_artist)
                    .push_bind(&task.music_album)
                    .push_bind(&task.quality)
                    .push_bind(TaskStatus::Pending)
                    .push_bind(now)
                    .push_bind(now);
            });
            query_builder.push(" RETURNING *");

            let mut rows = query_builder
                .build_query_as::<DownloadTask>()
                .fetch_all(&mut *tx)
                .await
                .map_err(query_failed("insert task batch"))?;
            rows.sort_by_key(|t| t.id);
            created.extend(rows);
        }

        tx.commit()
            .await
            .map_err(query_failed("commit task batch"))?;

        Ok(created)
    }

    /// Get a task by ID
    pub async fn get_task(&self, id: TaskId) -> Result<Option<DownloadTask>> {
        sqlx::query_as::<_, DownloadTask>("SELECT * FROM download_task WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .map_err(query_failed("get task"))
    }

    /// Get the task for a (job, music) pair
    pub async fn get_task_by_job_and_music(
        &self,
        job_id: JobId,
        music_id: &str,
    ) -> Result<Option<DownloadTask>> {
        sqlx::query_as::<_, DownloadTask>(
            "SELECT * FROM download_task WHERE job_id = ? AND music_id = ?",
        )
        .bind(job_id)
        .bind(music_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(query_failed("get task by job and music"))
    }

    /// List a job's tasks, oldest first
    pub async fn list_tasks_by_job(&self, job_id: JobId) -> Result<Vec<DownloadTask>> {
        sqlx::query_as::<_, DownloadTask>(
            "SELECT * FROM download_task WHERE job_id = ? ORDER BY id",
        )
        .bind(job_id)
        .fetch_all(&self.pool)
        .await
        .map_err(query_failed("list tasks by job"))
    }

    /// List tasks in one status across all jobs
    pub async fn list_tasks_by_status(&self, status: TaskStatus) -> Result<Vec<DownloadTask>> {
        sqlx::query_as::<_, DownloadTask>(
            "SELECT * FROM download_task WHERE status = ? ORDER BY id",
        )
        .bind(status)
        .fetch_all(&self.pool)
        .await
        .map_err(query_failed("list tasks by status"))
    }

    /// List a job's tasks in one status
    pub async fn list_tasks_by_job_and_status(
        &self,
        job_id: JobId,
        status: TaskStatus,
    ) -> Result<Vec<DownloadTask>> {
        sqlx::query_as::<_, DownloadTask>(
            "SELECT * FROM download_task WHERE job_id = ? AND status = ? ORDER BY id",
        )
        .bind(job_id)
        .bind(status)
        .fetch_all(&self.pool)
        .await
        .map_err(query_failed("list tasks by job and status"))
    }

    /// Tasks a previous process left pending or mid-workflow
    pub async fn list_unfinished_tasks(&self) -> Result<Vec<DownloadTask>> {
        sqlx::query_as::<_, DownloadTask>(
            "SELECT * FROM download_task WHERE status IN (?, ?, ?) ORDER BY id",
        )
        .bind(TaskStatus::Pending)
        .bind(TaskStatus::Downloading)
        .bind(TaskStatus::Processing)
        .fetch_all(&self.pool)
        .await
        .map_err(query_failed("list unfinished tasks"))
    }

    /// OR `flags` into the task's progress bits
    pub async fn add_progress_flags(&self, id: TaskId, flags: TaskProgress) -> Result<()> {
        sqlx::query(
            "UPDATE download_task SET progress_flags = progress_flags | ?, updated_at = ? WHERE id = ?",
        )
        .bind(flags.bits())
        .bind(now())
        .bind(id)
        .execute(&self.pool)
        .await
        .map_err(query_failed("add progress flags"))?;

        Ok(())
    }

    /// Set status and error message
    pub async fn update_task_status(
        &self,
        id: TaskId,
        status: TaskStatus,
        error_message: Option<&str>,
    ) -> Result<()> {
        sqlx::query(
            "UPDATE download_task SET status = ?, error_message = ?, updated_at = ? WHERE id = ?",
        )
        .bind(status)
        .bind(error_message)
        .bind(now())
        .bind(id)
        .execute(&self.pool)
        .await
        .map_err(query_failed("update task status"))?;

        Ok(())
    }

    /// Enter `downloading` for a new workflow run
    pub async fn mark_task_started(&self, id: TaskId) -> Result<()> {
        let now = now();
        sqlx::query(
            r#"
            UPDATE download_task SET
                status = ?, error_message = NULL, started_at = ?,
                completed_at = NULL, updated_at = ?
            WHERE id = ?
            "#,
        )
        .bind(TaskStatus::Downloading)
        .bind(now)
        .bind(now)
        .bind(id)
        .execute(&self.pool)
        .await
        .map_err(query_failed("mark task started"))?;

        Ok(())
    }

    /// Stamp the end of a workflow run, whatever its outcome
    pub async fn mark_task_finished(&self, id: TaskId) -> Result<()> {
        let now = now();
        sqlx::query("UPDATE download_task SET completed_at = ?, updated_at = ? WHERE id = ?")
            .bind(now)
            .bind(now)
            .bind(id)
            .execute(&self.pool)
            .await
            .map_err(query_failed("mark task finished"))?;

        Ok(())
    }

    /// Record title/artist/album resolved from the catalog
    pub async fn update_task_music_info(
        &self,
        id: TaskId,
        title: &str,
        artist: &str,
        album: Option<&str>,
    ) -> Result<()> {
        sqlx::query(
            r#"
            UPDATE download_task SET
                music_title = ?, music_artist = ?, music_album = ?, updated_at = ?
            WHERE id = ?
            "#,
        )
        .bind(title)
        .bind(artist)
        .bind(album)
        .bind(now())
        .bind(id)
        .execute(&self.pool)
        .await
        .map_err(query_failed("update task music info"))?;

        Ok(())
    }

    /// Record negotiated quality and temp file location
    pub async fn update_task_download_info(&self, id: TaskId, info: &DownloadInfo) -> Result<()> {
        sqlx::query(
            r#"
            UPDATE download_task SET
                quality = ?, file_path = ?, file_name = ?, file_format = ?,
                file_size = ?, updated_at = ?
            WHERE id = ?
            "#,
        )
        .bind(&info.quality)
        .bind(&info.file_path)
        .bind(&info.file_name)
        .bind(&info.file_format)
        .bind(info.file_size)
        .bind(now())
        .bind(id)
        .execute(&self.pool)
        .await
        .map_err(query_failed("update task download info"))?;

        Ok(())
    }

    /// Point the task at its final file
    pub async fn update_task_file_location(
        &self,
        id: TaskId,
        file_path: &str,
        file_name: &str,
    ) -> Result<()> {
        sqlx::query(
            "UPDATE download_task SET file_path = ?, file_name = ?, updated_at = ? WHERE id = ?",
        )
        .bind(file_path)
        .bind(file_name)
        .bind(now())
        .bind(id)
        .execute(&self.pool)
        .await
        .map_err(query_failed("update task file location"))?;

        Ok(())
    }

    /// Clear progress bits and return the task to `pending`
    pub async fn reset_task(&self, id: TaskId) -> Result<bool> {
        let result = sqlx::query(
            r#"
            UPDATE download_task SET
                progress_flags = 0, status = ?, error_message = NULL,
                started_at = NULL, completed_at = NULL, updated_at = ?
            WHERE id = ?
            "#,
        )
        .bind(TaskStatus::Pending)
        .bind(now())
        .bind(id)
        .execute(&self.pool)
        .await
        .map_err(query_failed("reset task"))?;

        Ok(result.rows_affected() > 0)
    }

    /// Reset every task of `job_id` currently in `status`; returns the reset ids
    pub async fn reset_tasks_by_job_and_status(
        &self,
        job_id: JobId,
        status: TaskStatus,
    ) -> Result<Vec<TaskId>> {
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(query_failed("begin task reset"))?;

        let mut ids: Vec<TaskId> = sqlx::query_scalar(
            r#"
            UPDATE download_task SET
                progress_flags = 0, status = ?, error_message = NULL,
                started_at = NULL, completed_at = NULL, updated_at = ?
            WHERE job_id = ? AND status = ?
            RETURNING id
            "#,
        )
        .bind(TaskStatus::Pending)
        .bind(now())
        .bind(job_id)
        .bind(status)
        .fetch_all(&mut *tx)
        .await
        .map_err(query_failed("reset tasks"))?;

        tx.commit().await.map_err(query_failed("commit task reset"))?;

        ids.sort();
        Ok(ids)
    }

    /// Mark a task cancelled unless it already completed
    ///
    /// Returns whether a row changed.
    pub async fn cancel_task(&self, id: TaskId) -> Result<bool> {
        let result = sqlx::query(
            "UPDATE download_task SET status = ?, updated_at = ? WHERE id = ? AND status != ?",
        )
        .bind(TaskStatus::Cancelled)
        .bind(now())
        .bind(id)
        .bind(TaskStatus::Completed)
        .execute(&self.pool)
        .await
        .map_err(query_failed("cancel task"))?;

        Ok(result.rows_affected() > 0)
    }

    /// Complete a task whose file was copied from another job's task
    pub async fn complete_copied_task(&self, id: TaskId, copied: &CopiedTask) -> Result<()> {
        let now = now();
        sqlx::query(
            r#"
            UPDATE download_task SET
                quality = ?, file_path = ?, file_name = ?, file_format = ?, file_size = ?,
                progress_flags = ?, music_title = COALESCE(music_title, ?),
                music_artist = COALESCE(music_artist, ?), music_album = COALESCE(music_album, ?),
                status = ?, error_message = NULL, note = ?,
                started_at = ?, completed_at = ?, updated_at = ?
            WHERE id = ?
            "#,
        )
        .bind(&copied.quality)
        .bind(&copied.file_path)
        .bind(&copied.file_name)
        .bind(&copied.file_format)
        .bind(copied.file_size)
        .bind(copied.progress_flags)
        .bind(&copied.music_title)
        .bind(&copied.music_artist)
        .bind(&copied.music_album)
        .bind(TaskStatus::Completed)
        .bind(&copied.note)
        .bind(now)
        .bind(now)
        .bind(now)
        .bind(id)
        .execute(&self.pool)
        .await
        .map_err(query_failed("complete copied task"))?;

        Ok(())
    }

    /// Newest completed task for `music_id` in another job with the same target quality
    pub async fn find_completed_by_music_and_quality(
        &self,
        music_id: &str,
        target_quality: &str,
        exclude_job: JobId,
    ) -> Result<Option<DownloadTask>> {
        sqlx::query_as::<_, DownloadTask>(
            r#"
            SELECT t.* FROM download_task t
            JOIN download_job j ON j.id = t.job_id
            WHERE t.music_id = ?
              AND t.status = ?
              AND j.target_quality = ?
              AND t.job_id != ?
              AND t.file_path IS NOT NULL
            ORDER BY t.updated_at DESC, t.id DESC
            LIMIT 1
            "#,
        )
        .bind(music_id)
        .bind(TaskStatus::Completed)
        .bind(target_quality)
        .bind(exclude_job)
        .fetch_optional(&self.pool)
        .await
        .map_err(query_failed("find completed task"))
    }

    /// Filtered, paginated task listing, newest first
    pub async fn search_tasks(&self, search: &TaskSearch) -> Result<TaskPage> {
        let mut count_query = QueryBuilder::<Sqlite>::new("SELECT COUNT(*) FROM download_task");
        push_search_filters(&mut count_query, search);
        let total: i64 = count_query
            .build_query_scalar::<i64>()
            .fetch_one(&self.pool)
            .await
            .map_err(query_failed("count tasks"))?;

        let mut page_query = QueryBuilder::<Sqlite>::new("SELECT * FROM download_task");
        push_search_filters(&mut page_query, search);
        page_query
            .push(" ORDER BY created_at DESC, id DESC LIMIT ")
            .push_bind(search.limit.unwrap_or(DEFAULT_PAGE_SIZE).max(1))
            .push(" OFFSET ")
            .push_bind(search.offset.unwrap_or(0).max(0));

        let tasks = page_query
            .build_query_as::<DownloadTask>()
            .fetch_all(&self.pool)
            .await
            .map_err(query_failed("search tasks"))?;

        Ok(TaskPage { tasks, total })
    }

    /// Task rows per status, optionally for one job
    pub async fn count_tasks_by_status(
        &self,
        job_id: Option<JobId>,
    ) -> Result<HashMap<TaskStatus, i64>> {
        let rows: Vec<(TaskStatus, i64)> = sqlx::query_as(
            r#"
            SELECT status, COUNT(*) FROM download_task
            WHERE (? IS NULL OR job_id = ?)
            GROUP BY status
            "#,
        )
        .bind(job_id)
        .bind(job_id)
        .fetch_all(&self.pool)
        .await
        .map_err(query_failed("count tasks by status"))?;

        Ok(rows.into_iter().collect())
    }

    /// Whether any task other than `id` records `file_path` as its file
    pub async fn file_path_shared(&self, file_path: &str, id: TaskId) -> Result<bool> {
        let shared: bool = sqlx::query_scalar(
            "SELECT EXISTS(SELECT 1 FROM download_task WHERE file_path = ? AND id != ?)",
        )
        .bind(file_path)
        .bind(id)
        .fetch_one(&self.pool)
        .await
        .map_err(query_failed("file path lookup"))?;

        Ok(shared)
    }

    /// Delete one task; returns whether a row was removed
    pub async fn delete_task(&self, id: TaskId) -> Result<bool> {
        let result = sqlx::query("DELETE FROM download_task WHERE id = ?")
            .bind(id)
            .execute(&self.pool)
            .await
            .map_err(query_failed("delete task"))?;

        Ok(result.rows_affected() > 0)
    }

    /// Delete all of a job's tasks; returns the number removed
    pub async fn delete_tasks_by_job(&self, job_id: JobId) -> Result<u64> {
        let result = sqlx::query("DELETE FROM download_task WHERE job_id = ?")
            .bind(job_id)
            .execute(&self.pool)
            .await
            .map_err(query_failed("delete tasks by job"))?;

        Ok(result.rows_affected())
    }
}

fn push_search_filters(query: &mut QueryBuilder<'_, Sqlite>, search: &TaskSearch) {
    let mut separator = " WHERE ";

    if let Some(job_id) = search.job_id {
        query.push(separator).push("job_id = ").push_bind(job_id);
        separator = " AND ";
    }
    if let Some(status) = search.status {
        query.push(separator).push("status = ").push_bind(status);
        separator = " AND ";
    }
    if let Some(keyword) = search.keyword.as_deref().map(str::trim).filter(|k| !k.is_empty()) {
        let pattern = format!("%{}%", keyword);
        query
            .push(separator)
            .push("(music_title LIKE ")
            .push_bind(pattern.clone())
            .push(" OR music_artist LIKE ")
            .push_bind(pattern.clone())
            .push(" OR music_album LIKE ")
            .push_bind(pattern.clone())
            .push(" OR music_id LIKE ")
            .push_bind(pattern)
            .push(")");
    }
}
