//! Download orchestration facade split into focused submodules.
//!
//! The [`DownloadOrchestrator`] owns the task registry, the per-task cache registry and
//! the workflow engine, and exposes everything the presentation layer needs:
//! - [`submit`] - Idempotent submission, batch submission and quality upgrades
//! - [`run`] - Spawning, preparing and finishing workflow runs
//! - [`control`] - Cancel, reset, restart and waiting on tasks
//! - [`jobs`] - Job CRUD and task queries

mod control;
mod jobs;
mod run;
mod submit;

// unwrap/expect are acceptable in tests for concise failure-on-error assertions
#[allow(clippy::unwrap_used, clippy::expect_used)]
#[cfg(test)]
mod tests;

use crate::cache::TaskCacheRegistry;
use crate::config::Config;
use crate::db::Database;
use crate::downloader::AudioFetcher;
use crate::error::{Error, Result};
use crate::task_manager::TaskManager;
use crate::types::{Event, OrchestratorStats};
use crate::workflow::WorkflowEngine;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::sync::broadcast;

/// Entry point for job/task management and task execution
///
/// Cloning is cheap; every clone shares the same registries and event channel.
#[derive(Clone)]
pub struct DownloadOrchestrator {
    pub(crate) db: Arc<Database>,
    config: Arc<Config>,
    caches: Arc<TaskCacheRegistry>,
    fetcher: Arc<dyn AudioFetcher>,
    workflow: Arc<WorkflowEngine>,
    tasks: Arc<TaskManager>,
    event_tx: broadcast::Sender<Event>,
    accepting: Arc<AtomicBool>,
}

impl DownloadOrchestrator {
    /// Wire an orchestrator over already-built components
    pub fn new(
        db: Arc<Database>,
        config: Arc<Config>,
        caches: Arc<TaskCacheRegistry>,
        fetcher: Arc<dyn AudioFetcher>,
        workflow: Arc<WorkflowEngine>,
    ) -> Self {
        let (event_tx, _rx) = broadcast::channel(1000);
        Self {
            db,
            config,
            caches,
            fetcher,
            workflow,
            tasks: Arc::new(TaskManager::new()),
            event_tx,
            accepting: Arc::new(AtomicBool::new(true)),
        }
    }

    /// Subscribe to task and job lifecycle events
    ///
    /// Receivers that fall more than 1000 events behind see `RecvError::Lagged`.
    pub fn subscribe(&self) -> broadcast::Receiver<Event> {
        self.event_tx.subscribe()
    }

    /// The configuration this orchestrator was built with
    pub fn get_config(&self) -> Arc<Config> {
        Arc::clone(&self.config)
    }

    /// The underlying database handle
    pub fn database(&self) -> Arc<Database> {
        Arc::clone(&self.db)
    }

    // send() only fails without receivers, which is fine
    pub(crate) fn emit_event(&self, event: Event) {
        self.event_tx.send(event).ok();
    }

    pub(crate) fn is_accepting(&self) -> bool {
        self.accepting.load(Ordering::SeqCst)
    }

    pub(crate) fn ensure_accepting(&self) -> Result<()> {
        if self.is_accepting() {
            Ok(())
        } else {
            Err(Error::ShuttingDown)
        }
    }

    /// Running futures from the registry merged with per-status row counts from the database
    pub async fn get_stats(&self) -> Result<OrchestratorStats> {
        let active_task_ids = self.tasks.active_task_ids().await;
        let by_status = self.db.count_tasks_by_status(None).await?;
        let total_tasks = by_status.values().sum();
        let (max_concurrent_downloads, max_threads_per_download) = self.fetcher.concurrency();

        Ok(OrchestratorStats {
            active_tasks: active_task_ids.len(),
            active_task_ids,
            by_status,
            total_tasks,
            max_concurrent_downloads,
            max_threads_per_download,
        })
    }

    /// Change both concurrency bounds without restarting in-flight downloads
    pub fn update_concurrency_settings(&self, max_concurrent: usize, max_threads: usize) {
        self.fetcher.set_concurrency(max_concurrent, max_threads);
        tracing::info!(
            max_concurrent_downloads = max_concurrent,
            max_threads_per_download = max_threads,
            "concurrency settings updated"
        );
    }

    /// Stop accepting submissions and stop every running workflow
    ///
    /// Interrupted rows keep their `pending`/`downloading`/`processing` status, so
    /// `resume_unfinished_tasks` picks them up on the next start.
    pub async fn shutdown(&self) -> Result<()> {
        tracing::info!("orchestrator shutting down");
        self.accepting.store(false, Ordering::SeqCst);

        let shutdown_timeout = std::time::Duration::from_secs(30);
        match tokio::time::timeout(shutdown_timeout, self.tasks.cancel_all_and_wait()).await {
            Ok(cancelled) => {
                tracing::info!(cancelled, "all workflow runs stopped");
            }
            Err(_) => {
                tracing::warn!("timeout waiting for workflow runs to stop, proceeding with shutdown");
            }
        }
        Ok(())
    }
}
