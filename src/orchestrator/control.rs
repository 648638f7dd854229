//! Task control: cancel, reset, restart and waiting for a task to settle.

use crate::db::DownloadTask;
use crate::error::{Error, Result, TaskError};
use crate::types::{Event, JobId, TaskId, TaskProgress, TaskStatus};
use std::time::Duration;

use super::DownloadOrchestrator;

const WAIT_POLL_INTERVAL: Duration = Duration::from_millis(50);

impl DownloadOrchestrator {
    /// Cancel a task
    ///
    /// Stops its in-flight run (if any) and marks the row `cancelled`. Returns true if
    /// either happened. Completed and already-cancelled tasks are left alone and yield
    /// false, as does an unknown id.
    ///
    /// The run may finish just before the cancellation lands; the row then keeps its
    /// final status.
    pub async fn cancel_task(&self, task_id: TaskId) -> Result<bool> {
        let Some(task) = self.db.get_task(task_id).await? else {
            return Ok(false);
        };
        if matches!(task.status, TaskStatus::Completed | TaskStatus::Cancelled) {
            tracing::debug!(task_id = %task_id, status = %task.status, "nothing to cancel");
            return Ok(false);
        }

        let stopped_run = self.tasks.cancel(task_id).await;
        let marked = self.db.cancel_task(task_id).await?;

        // A stopped run records its own end and emits the event
        if !stopped_run && marked {
            self.db.mark_task_finished(task_id).await?;
            self.caches.remove(task_id).await;
            self.emit_event(Event::TaskCancelled { task_id });
        }

        tracing::info!(task_id = %task_id, stopped_run, marked, "cancel requested");
        Ok(stopped_run || marked)
    }

    /// Clear a task's progress and put it back to `pending`
    ///
    /// Does not start a run; see [`DownloadOrchestrator::rerun_task`]. Fails with
    /// `InvalidState` while the task has a run in flight.
    pub async fn reset_task(&self, task_id: TaskId) -> Result<bool> {
        if self.tasks.is_active(task_id).await {
            return Err(TaskError::InvalidState {
                id: task_id.get(),
                operation: "reset".to_string(),
                current_state: "running".to_string(),
            }
            .into());
        }

        let Some(task) = self.db.get_task(task_id).await? else {
            return Ok(false);
        };
        let reset = self.db.reset_task(task_id).await?;
        if reset {
            self.discard_finalized_output(&task).await?;
            tracing::info!(task_id = %task_id, "task reset");
        }
        Ok(reset)
    }

    /// Reset a task and start a fresh run of it
    pub async fn rerun_task(&self, task_id: TaskId) -> Result<bool> {
        self.ensure_accepting()?;
        if !self.reset_task(task_id).await? {
            return Ok(false);
        }

        let task = self
            .db
            .get_task(task_id)
            .await?
            .ok_or(TaskError::NotFound { id: task_id.get() })?;
        self.queue_task(task.id, task.job_id, &task.music_id).await;
        Ok(true)
    }

    /// Reset every `failed` task of a job and re-spawn its workflow
    pub async fn restart_failed_tasks(&self, job_id: JobId) -> Result<Vec<TaskId>> {
        self.ensure_accepting()?;

        for task in self
            .db
            .list_tasks_by_job_and_status(job_id, TaskStatus::Failed)
            .await?
        {
            self.discard_finalized_output(&task).await?;
        }
        let task_ids = self
            .db
            .reset_tasks_by_job_and_status(job_id, TaskStatus::Failed)
            .await?;
        for &task_id in &task_ids {
            match self.db.get_task(task_id).await? {
                Some(task) => self.queue_task(task.id, job_id, &task.music_id).await,
                None => tracing::warn!(task_id = %task_id, "task vanished before restart"),
            }
        }

        tracing::info!(job_id = %job_id, count = task_ids.len(), "failed tasks restarted");
        Ok(task_ids)
    }

    /// Remove the file a task finalized earlier, ahead of regenerating it
    ///
    /// The file stays if another task row (a cross-job copy sharing the path) still
    /// points at it.
    pub(crate) async fn discard_finalized_output(&self, task: &DownloadTask) -> Result<()> {
        if !task.progress().contains(TaskProgress::FILE_FINALIZED) {
            return Ok(());
        }
        let Some(path) = task.file_path.as_deref() else {
            return Ok(());
        };
        if self.db.file_path_shared(path, task.id).await? {
            tracing::debug!(task_id = %task.id, path, "finalized file shared, keeping it");
            return Ok(());
        }

        match tokio::fs::remove_file(path).await {
            Ok(()) => tracing::info!(task_id = %task.id, path, "removed previous output"),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => {
                tracing::warn!(task_id = %task.id, path, error = %e, "could not remove previous output");
            }
        }
        Ok(())
    }

    /// Wait until a task is in a terminal status and its run has been released
    ///
    /// `None` waits indefinitely. A task left unfinished by shutdown yields
    /// [`Error::ShuttingDown`] once its run is gone.
    pub async fn wait_for_task(
        &self,
        task_id: TaskId,
        timeout: Option<Duration>,
    ) -> Result<DownloadTask> {
        let wait = async {
            loop {
                let task = self
                    .db
                    .get_task(task_id)
                    .await?
                    .ok_or(TaskError::NotFound { id: task_id.get() })?;
                let active = self.tasks.is_active(task_id).await;
                if task.status.is_terminal() && !active {
                    return Ok(task);
                }
                if !active && !self.is_accepting() {
                    return Err(Error::ShuttingDown);
                }
                tokio::time::sleep(WAIT_POLL_INTERVAL).await;
            }
        };

        match timeout {
            Some(limit) => tokio::time::timeout(limit, wait).await.map_err(|_| {
                TaskError::Timeout {
                    id: task_id.get(),
                    waited: limit,
                }
            })?,
            None => wait.await,
        }
    }

    /// Wait until `task_id` has no run in flight, whatever status the run left behind
    ///
    /// Stops early with [`Error::ShuttingDown`] once the orchestrator refuses new work.
    pub(crate) async fn wait_for_run(&self, task_id: TaskId) -> Result<()> {
        while self.tasks.is_active(task_id).await {
            self.ensure_accepting()?;
            tokio::time::sleep(WAIT_POLL_INTERVAL).await;
        }
        Ok(())
    }
}
