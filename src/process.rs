//! Batch scanner
//!
//! One scan walks every enabled job:
//!
//! 1. Mark the job `scanning` and resolve its source track list (playlists are fetched
//!    with backoff on rate limits and server errors).
//! 2. Insert the missing `(job, music_id)` rows in one set-based statement; rows that
//!    already exist are skipped.
//! 3. Satisfy new rows from another job's completed file of the same track and quality
//!    when one exists (a file copy instead of a download).
//! 4. Run the rest through the orchestrator in fixed-size batches, waiting for each
//!    batch's runs to end before starting the next.
//! 5. Mark the job `completed` (or `failed`) and recount its counters.
//!
//! A failing job is recorded and skipped; the scan carries on with the next one.
//! Shutdown ends the scan at once and leaves the interrupted job's rows to be resumed.

use crate::cache::TaskCacheRegistry;
use crate::catalog::CatalogGateway;
use crate::config::Config;
use crate::db::{CopiedTask, Database, DownloadJob, DownloadTask, NewTask};
use crate::error::{Error, Result};
use crate::orchestrator::DownloadOrchestrator;
use crate::retry::with_backoff;
use crate::storage::generate_final_path;
use crate::types::{Event, JobId, JobStatus, SourceType, TaskId};
use crate::utils::get_unique_path;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::{Mutex, RwLock};

/// Snapshot of the current or last scan
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct ProcessStatus {
    /// A scan is in progress
    pub running: bool,
    /// Unix timestamp the scan started
    pub started_at: Option<i64>,
    /// Unix timestamp the scan finished
    pub finished_at: Option<i64>,
    /// Jobs scanned successfully
    pub processed_jobs: usize,
    /// New tasks handed to the workflow
    pub submitted_tasks: usize,
    /// New tasks satisfied by a file copy
    pub copied_tasks: usize,
    /// Source tracks that already had a task
    pub skipped_existing: usize,
    /// Jobs whose scan failed
    pub failed_jobs: usize,
    /// Job being scanned
    pub current_job_id: Option<JobId>,
    /// Batch being dispatched within the current job
    pub current_batch_index: Option<usize>,
}

#[derive(Debug, Default)]
struct JobScan {
    new_tasks: usize,
    copied: usize,
    submitted: usize,
    skipped: usize,
}

/// Job-level batch scanner
#[derive(Clone)]
pub struct DownloadProcess {
    orchestrator: DownloadOrchestrator,
    db: Arc<Database>,
    catalog: Arc<dyn CatalogGateway>,
    caches: Arc<TaskCacheRegistry>,
    config: Arc<Config>,
    scan_lock: Arc<Mutex<()>>,
    status: Arc<RwLock<ProcessStatus>>,
    music_locks: Arc<Mutex<HashMap<String, Arc<Mutex<()>>>>>,
}

impl DownloadProcess {
    /// Scanner dispatching through `orchestrator`
    pub fn new(
        orchestrator: DownloadOrchestrator,
        catalog: Arc<dyn CatalogGateway>,
        caches: Arc<TaskCacheRegistry>,
    ) -> Self {
        Self {
            db: orchestrator.database(),
            config: orchestrator.get_config(),
            orchestrator,
            catalog,
            caches,
            scan_lock: Arc::new(Mutex::new(())),
            status: Arc::new(RwLock::new(ProcessStatus::default())),
            music_locks: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Current or last scan's status
    pub async fn status(&self) -> ProcessStatus {
        self.status.read().await.clone()
    }

    /// Whether a scan is in progress
    pub fn is_running(&self) -> bool {
        self.scan_lock.try_lock().is_err()
    }

    /// Start a scan in the background; false if one is already running
    pub fn start(&self, batch_size: usize) -> bool {
        if self.is_running() {
            return false;
        }
        let this = self.clone();
        tokio::spawn(async move {
            if let Err(e) = this.run(batch_size).await {
                tracing::error!(error = %e, "background scan failed");
            }
        });
        true
    }

    /// Scan every enabled job, dispatching new tasks `batch_size` at a time
    ///
    /// Returns immediately with the in-progress snapshot if a scan is already running.
    pub async fn run(&self, batch_size: usize) -> Result<ProcessStatus> {
        let Ok(_scan) = self.scan_lock.try_lock() else {
            tracing::debug!("scan already running, not starting another");
            return Ok(self.status().await);
        };
        let batch_size = batch_size.max(1);

        *self.status.write().await = ProcessStatus {
            running: true,
            started_at: Some(crate::db::now()),
            ..Default::default()
        };
        self.orchestrator.emit_event(Event::ScanStarted);
        tracing::info!(batch_size, "scan started");

        let result = self.scan_all(batch_size).await;

        let snapshot = {
            let mut status = self.status.write().await;
            status.running = false;
            status.finished_at = Some(crate::db::now());
            status.current_job_id = None;
            status.current_batch_index = None;
            status.clone()
        };
        self.orchestrator.emit_event(Event::ScanFinished {
            processed_jobs: snapshot.processed_jobs,
            submitted_tasks: snapshot.submitted_tasks,
        });
        tracing::info!(
            processed_jobs = snapshot.processed_jobs,
            failed_jobs = snapshot.failed_jobs,
            submitted = snapshot.submitted_tasks,
            copied = snapshot.copied_tasks,
            skipped = snapshot.skipped_existing,
            "scan finished"
        );

        result.map(|()| snapshot)
    }

    async fn scan_all(&self, batch_size: usize) -> Result<()> {
        let jobs = self.db.list_enabled_jobs().await?;

        for job in jobs {
            self.orchestrator.ensure_accepting()?;
            self.status.write().await.current_job_id = Some(job.id);

            match self.scan_job(&job, batch_size).await {
                Ok(scan) => {
                    {
                        let mut status = self.status.write().await;
                        status.processed_jobs += 1;
                        status.skipped_existing += scan.skipped;
                    }
                    tracing::info!(
                        job_id = %job.id,
                        new_tasks = scan.new_tasks,
                        copied = scan.copied,
                        submitted = scan.submitted,
                        skipped = scan.skipped,
                        "job scanned"
                    );
                    self.orchestrator.emit_event(Event::JobScanned {
                        job_id: job.id,
                        new_tasks: scan.new_tasks,
                        copied: scan.copied,
                    });
                }
                Err(Error::ShuttingDown) => {
                    tracing::info!(job_id = %job.id, "scan interrupted by shutdown");
                    return Err(Error::ShuttingDown);
                }
                Err(e) => {
                    tracing::error!(job_id = %job.id, error = %e, "job scan failed");
                    if let Err(status_err) = self.db.set_job_status(job.id, JobStatus::Failed).await {
                        tracing::warn!(job_id = %job.id, error = %status_err, "could not mark job failed");
                    }
                    self.status.write().await.failed_jobs += 1;
                    self.orchestrator.emit_event(Event::JobScanFailed {
                        job_id: job.id,
                        error: e.to_string(),
                    });
                }
            }
        }
        Ok(())
    }

    async fn scan_job(&self, job: &DownloadJob, batch_size: usize) -> Result<JobScan> {
        self.db.set_job_status(job.id, JobStatus::Scanning).await?;

        let Some(music_ids) = self.resolve_source(job).await? else {
            self.db.refresh_job_counters(job.id).await?;
            self.db.set_job_status(job.id, JobStatus::Completed).await?;
            return Ok(JobScan::default());
        };

        let mut seen = HashSet::new();
        let unique: Vec<String> = music_ids
            .into_iter()
            .filter(|id| seen.insert(id.clone()))
            .collect();
        let rows: Vec<NewTask> = unique
            .iter()
            .map(|music_id| NewTask {
                job_id: job.id,
                music_id: music_id.clone(),
                music_title: None,
                music_artist: None,
                music_album: None,
                quality: job.target_quality.clone(),
            })
            .collect();
        let created = self.db.insert_tasks_if_absent(&rows).await?;

        let mut scan = JobScan {
            new_tasks: created.len(),
            skipped: unique.len() - created.len(),
            ..Default::default()
        };
        tracing::debug!(
            job_id = %job.id,
            source_tracks = unique.len(),
            new_tasks = scan.new_tasks,
            "source resolved"
        );

        self.db.set_job_status(job.id, JobStatus::Downloading).await?;
        self.prewarm_details(&created).await;

        let mut pending = Vec::with_capacity(created.len());
        for task in created {
            if self.try_copy(job, &task).await {
                self.caches.remove(task.id).await;
                scan.copied += 1;
                self.status.write().await.copied_tasks += 1;
            } else {
                pending.push(task);
            }
        }

        for (index, batch) in pending.chunks(batch_size).enumerate() {
            self.orchestrator.ensure_accepting()?;
            self.status.write().await.current_batch_index = Some(index);
            tracing::debug!(job_id = %job.id, batch = index, size = batch.len(), "dispatching batch");

            for task in batch {
                self.orchestrator
                    .queue_task(task.id, job.id, &task.music_id)
                    .await;
            }
            let waits = batch
                .iter()
                .map(|task| self.orchestrator.wait_for_run(task.id));
            for result in futures::future::join_all(waits).await {
                result?;
            }

            scan.submitted += batch.len();
            self.status.write().await.submitted_tasks += batch.len();
        }

        self.db.refresh_job_counters(job.id).await?;
        self.db.set_job_status(job.id, JobStatus::Completed).await?;
        Ok(scan)
    }

    /// Track ids of the job's source; `None` for manual jobs
    async fn resolve_source(&self, job: &DownloadJob) -> Result<Option<Vec<String>>> {
        let retry = &self.config.scan.playlist_retry;
        let source_id = job.source_id.as_str();

        let ids = match job.source_type {
            SourceType::Manual => return Ok(None),
            SourceType::Playlist => {
                with_backoff(retry, || self.catalog.get_playlist_track_ids(source_id)).await?
            }
            SourceType::Album => {
                with_backoff(retry, || self.catalog.get_album_track_ids(source_id)).await?
            }
            SourceType::Artist => {
                with_backoff(retry, || self.catalog.get_artist_track_ids(source_id)).await?
            }
        };
        Ok(Some(ids))
    }

    /// Seed song-detail caches of new tasks with bulk lookups
    async fn prewarm_details(&self, tasks: &[DownloadTask]) {
        if tasks.is_empty() {
            return;
        }

        let mut by_music_id: HashMap<&str, Vec<TaskId>> = HashMap::new();
        for task in tasks {
            self.caches.get_or_create(task.id, &task.music_id).await;
            by_music_id
                .entry(task.music_id.as_str())
                .or_default()
                .push(task.id);
        }

        let ids: Vec<String> = by_music_id.keys().map(|id| id.to_string()).collect();
        for chunk in ids.chunks(self.config.scan.detail_chunk_size.max(1)) {
            let details = match self.catalog.search_song_details(chunk).await {
                Ok(details) => details,
                Err(e) => {
                    tracing::warn!(error = %e, count = chunk.len(), "bulk detail lookup failed");
                    continue;
                }
            };
            for detail in details {
                let Some(task_ids) = by_music_id.get(detail.id.as_str()) else {
                    continue;
                };
                for &task_id in task_ids {
                    if let Some(cache) = self.caches.get(task_id).await {
                        cache.seed_song_detail(detail.clone()).await;
                    }
                }
            }
        }
    }

    /// Complete `task` from another job's file if one exists; false means download it
    async fn try_copy(&self, job: &DownloadJob, task: &DownloadTask) -> bool {
        let lock = self.music_lock(&task.music_id).await;
        let result = {
            let _guard = lock.lock().await;
            self.copy_from_existing(job, task).await
        };
        drop(lock);
        self.release_music_lock(&task.music_id).await;

        match result {
            Ok(copied) => copied,
            Err(e) => {
                tracing::warn!(
                    task_id = %task.id,
                    music_id = %task.music_id,
                    error = %e,
                    "copy failed, falling back to download"
                );
                false
            }
        }
    }

    async fn copy_from_existing(&self, job: &DownloadJob, task: &DownloadTask) -> Result<bool> {
        let Some(source) = self
            .db
            .find_completed_by_music_and_quality(&task.music_id, &job.target_quality, job.id)
            .await?
        else {
            return Ok(false);
        };
        let Some(source_path) = source.file_path.as_deref().map(PathBuf::from) else {
            return Ok(false);
        };
        if !tokio::fs::try_exists(&source_path).await.unwrap_or(false) {
            tracing::debug!(
                source_task_id = %source.id,
                path = %source_path.display(),
                "completed file is gone, not copying"
            );
            return Ok(false);
        }

        let as_target = DownloadTask {
            id: task.id,
            job_id: job.id,
            ..source.clone()
        };
        let wanted = generate_final_path(job, &as_target, &source_path);
        let target = if wanted == source_path {
            wanted
        } else {
            if let Some(parent) = wanted.parent() {
                tokio::fs::create_dir_all(parent).await?;
            }
            let target = get_unique_path(&wanted, self.config.download.file_collision)?;
            if let Err(e) = tokio::fs::copy(&source_path, &target).await {
                remove_partial(&target).await;
                return Err(e.into());
            }
            target
        };

        let note = serde_json::json!({
            "copied_from": {
                "job_id": source.job_id,
                "task_id": source.id,
                "file_path": source_path,
            }
        })
        .to_string();
        let file_name = target
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .ok_or_else(|| Error::Other(format!("no file name in {}", target.display())))?;

        let copied = CopiedTask {
            quality: source.quality.clone(),
            file_path: target.to_string_lossy().into_owned(),
            file_name,
            file_format: source.file_format.clone(),
            file_size: source.file_size,
            progress_flags: source.progress_flags,
            music_title: source.music_title.clone(),
            music_artist: source.music_artist.clone(),
            music_album: source.music_album.clone(),
            note,
        };
        if let Err(e) = self.db.complete_copied_task(task.id, &copied).await {
            if target != source_path {
                remove_partial(&target).await;
            }
            return Err(e);
        }

        tracing::info!(
            task_id = %task.id,
            source_task_id = %source.id,
            path = %target.display(),
            "task satisfied by copy"
        );
        self.orchestrator.emit_event(Event::TaskCopied {
            task_id: task.id,
            source_task_id: source.id,
        });
        Ok(true)
    }

    async fn music_lock(&self, music_id: &str) -> Arc<Mutex<()>> {
        self.music_locks
            .lock()
            .await
            .entry(music_id.to_string())
            .or_default()
            .clone()
    }

    // Drop the map entry once nobody else holds it
    async fn release_music_lock(&self, music_id: &str) {
        let mut locks = self.music_locks.lock().await;
        if locks
            .get(music_id)
            .is_some_and(|lock| Arc::strong_count(lock) == 1)
        {
            locks.remove(music_id);
        }
    }
}

async fn remove_partial(path: &Path) {
    if let Err(e) = tokio::fs::remove_file(path).await {
        if e.kind() != std::io::ErrorKind::NotFound {
            tracing::warn!(path = %path.display(), error = %e, "could not remove partial copy");
        }
    }
}
