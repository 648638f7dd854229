//! Spawning, preparing and finishing workflow runs.

use crate::db::{DownloadInfo, DownloadJob, DownloadTask};
use crate::error::{Error, Result, TaskError};
use crate::task_manager::RunTicket;
use crate::types::{Event, TaskId, TaskProgress, TaskStatus};
use crate::utils::{join_artists, sanitize_component};
use std::path::PathBuf;

use super::DownloadOrchestrator;

const UNKNOWN_ARTIST: &str = "Unknown Artist";

impl DownloadOrchestrator {
    /// Register and spawn a workflow run for `task_id`
    ///
    /// Returns false if the task already has a run in flight.
    pub(crate) async fn spawn_workflow(&self, task_id: TaskId) -> bool {
        let Some(ticket) = self.tasks.register(task_id).await else {
            tracing::debug!(task_id = %task_id, "workflow already running, not spawning another");
            return false;
        };

        let this = self.clone();
        let run = ticket.clone();
        let handle = tokio::spawn(async move {
            let outcome = tokio::select! {
                biased;
                _ = run.token.cancelled() => Err(Error::Cancelled),
                result = this.execute_download_workflow(run.task_id) => result,
            };
            this.finish_run(&run, outcome).await;
        });
        self.tasks.attach(&ticket, handle).await;

        tracing::debug!(task_id = %task_id, run_id = ticket.run_id, "workflow spawned");
        true
    }

    /// Prepare the task if needed, then run its phases
    pub(crate) async fn execute_download_workflow(&self, task_id: TaskId) -> Result<PathBuf> {
        let task = self
            .db
            .get_task(task_id)
            .await?
            .ok_or(TaskError::NotFound { id: task_id.get() })?;
        if task.status == TaskStatus::Cancelled {
            return Err(Error::Cancelled);
        }
        let job = self
            .db
            .get_job(task.job_id)
            .await?
            .ok_or(TaskError::JobNotFound {
                id: task.job_id.get(),
            })?;

        self.emit_event(Event::TaskStarted { task_id });

        if !task.progress().contains(TaskProgress::MUSIC_DOWNLOADED) {
            if let Err(e) = self.prepare(&task, &job).await {
                let message = format!("Preparation failed: {}", e);
                tracing::error!(task_id = %task_id, error = %message, "task failed");
                self.db
                    .update_task_status(task_id, TaskStatus::Failed, Some(&message))
                    .await?;
                self.db.mark_task_finished(task_id).await?;
                return Err(e);
            }
        }

        self.workflow.execute(task_id).await
    }

    /// Resolve detail and play URL, then record where and in what form the audio lands
    async fn prepare(&self, task: &DownloadTask, job: &DownloadJob) -> Result<()> {
        let cache = self.caches.get_or_create(task.id, &task.music_id).await;

        let detail = cache.ensure_song_detail().await?;
        let artist = join_artists(&detail.artists).unwrap_or_else(|| UNKNOWN_ARTIST.to_string());
        self.db
            .update_task_music_info(task.id, &detail.title, &artist, detail.album.as_deref())
            .await?;

        let quality = if task.quality.is_empty() {
            job.target_quality.as_str()
        } else {
            task.quality.as_str()
        };
        let play_url = cache.ensure_play_url(quality, false).await?;

        let format = match play_url.format.trim() {
            "" => "mp3".to_string(),
            f => f.to_lowercase(),
        };
        let download_dir = &self.config.download.download_dir;
        tokio::fs::create_dir_all(download_dir).await?;
        let file_name = format!(
            "{}-{}.{}",
            task.id,
            sanitize_component(&format!("{} - {}", artist, detail.title)),
            format
        );
        let file_path = download_dir.join(&file_name);

        self.db
            .update_task_download_info(
                task.id,
                &DownloadInfo {
                    quality: play_url.resolved_quality.clone(),
                    file_path: file_path.to_string_lossy().into_owned(),
                    file_name,
                    file_format: format,
                    file_size: i64::try_from(play_url.size).ok(),
                },
            )
            .await?;

        tracing::debug!(
            task_id = %task.id,
            quality = %play_url.resolved_quality,
            size = play_url.size,
            "task prepared"
        );
        Ok(())
    }

    /// Record how a run ended and release its registry and cache entries
    async fn finish_run(&self, ticket: &RunTicket, outcome: Result<PathBuf>) {
        let task_id = ticket.task_id;

        match outcome {
            Ok(path) => {
                self.emit_event(Event::TaskCompleted {
                    task_id,
                    path: Some(path),
                });
            }
            Err(Error::Cancelled) if !self.is_accepting() => {
                tracing::info!(task_id = %task_id, "run interrupted by shutdown");
            }
            Err(Error::Cancelled) => {
                if let Err(e) = self.db.cancel_task(task_id).await {
                    tracing::warn!(task_id = %task_id, error = %e, "could not record cancellation");
                }
                if let Err(e) = self.db.mark_task_finished(task_id).await {
                    tracing::warn!(task_id = %task_id, error = %e, "could not stamp task end");
                }
                tracing::info!(task_id = %task_id, "task cancelled");
                self.emit_event(Event::TaskCancelled { task_id });
            }
            Err(e) => {
                let cancelled = matches!(
                    self.db.get_task(task_id).await,
                    Ok(Some(task)) if task.status == TaskStatus::Cancelled
                );
                if !cancelled {
                    self.emit_event(Event::TaskFailed {
                        task_id,
                        error: e.to_string(),
                    });
                }
            }
        }

        if let Ok(Some(task)) = self.db.get_task(task_id).await
            && let Err(e) = self.db.refresh_job_counters(task.job_id).await
        {
            tracing::warn!(job_id = %task.job_id, error = %e, "could not refresh job counters");
        }

        self.caches.remove(task_id).await;
        self.tasks.complete(ticket).await;
    }
}
