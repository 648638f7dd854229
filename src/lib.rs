//! # music-dl
//!
//! Download orchestration for music catalogs: jobs that track a playlist, album or
//! artist, tasks that carry one track through download, tagging and finalization, and
//! a batch scanner that keeps a library in step with its sources.
//!
//! ## Pieces
//!
//! - [`DownloadOrchestrator`] - idempotent submission, cancel/reset/restart, job CRUD
//! - [`WorkflowEngine`] - resumable phases recorded in a per-task progress bitmask
//! - [`AudioDownloader`] - segmented, resumable HTTP transfer with play-URL refresh
//! - [`DownloadProcess`] - scans enabled jobs, copies files other jobs already finished
//! - [`ProcessScheduler`] - cron trigger for the scanner
//!
//! Everything is wired once into an [`AppContext`]; there are no globals.
//!
//! ## Quick Start
//!
//! ```no_run
//! use music_dl::{AppContext, Config, NewJob, NoOpTagWriter, run_with_shutdown};
//! use std::sync::Arc;
//!
//! # async fn example(catalog: Arc<dyn music_dl::CatalogGateway>) -> music_dl::Result<()> {
//! let ctx = AppContext::new(Config::default(), catalog, Arc::new(NoOpTagWriter)).await?;
//! ctx.start().await?;
//!
//! ctx.orchestrator
//!     .create_job(&NewJob::playlist("favorites", "123456", "/music/favorites"))
//!     .await?;
//! ctx.process.start(10);
//!
//! let mut events = ctx.orchestrator.subscribe();
//! tokio::spawn(async move {
//!     while let Ok(event) = events.recv().await {
//!         println!("Event: {:?}", event);
//!     }
//! });
//!
//! run_with_shutdown(ctx).await?;
//! # Ok(())
//! # }
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::unwrap_used)]
#![warn(clippy::expect_used)]

/// Per-task caches of catalog lookups
pub mod cache;
/// Music catalog gateway
pub mod catalog;
/// Configuration types
pub mod config;
/// Component wiring
pub mod context;
/// Database persistence layer
pub mod db;
/// Segmented audio downloader
pub mod downloader;
/// Error types
pub mod error;
/// Tag, artwork and lyrics phases
pub mod metadata;
/// Download orchestration (decomposed into focused submodules)
pub mod orchestrator;
/// Batch scanning of enabled jobs
pub mod process;
/// Retry logic with exponential backoff
pub mod retry;
/// Cron scheduling of batch scans
pub mod scheduler;
/// Final placement of downloaded files
pub mod storage;
/// Audio tag writing
pub mod tagging;
/// Registry of running workflow futures
pub mod task_manager;
/// Core types and events
pub mod types;
/// Utility functions
pub mod utils;
/// Phase sequencing per task
pub mod workflow;

// unwrap/expect are acceptable in tests for concise failure-on-error assertions
#[allow(clippy::unwrap_used, clippy::expect_used)]
#[cfg(test)]
pub(crate) mod test_helpers;

// Re-export commonly used types
pub use catalog::{CatalogGateway, PlayUrl, SongDetail};
pub use config::{Config, FileCollisionAction};
pub use context::AppContext;
pub use db::{Database, DownloadJob, DownloadTask, JobUpdate, NewJob, TaskSearch};
pub use downloader::{AudioDownloader, AudioFetcher};
pub use error::{CatalogError, DatabaseError, Error, Result, StorageError, TaskError};
pub use orchestrator::DownloadOrchestrator;
pub use process::{DownloadProcess, ProcessStatus};
pub use scheduler::ProcessScheduler;
pub use tagging::{NoOpTagWriter, TagWriter};
pub use types::{Event, JobId, JobStatus, OrchestratorStats, SourceType, TaskId, TaskProgress, TaskStatus};
pub use workflow::WorkflowEngine;

/// Helper function to run a context with graceful signal handling.
///
/// Waits for a termination signal and then calls the context's `shutdown()` method.
///
/// - **Unix:** listens for SIGTERM and SIGINT, with fallbacks if signal registration fails.
/// - **Windows/other:** listens for Ctrl+C via `tokio::signal::ctrl_c()`.
pub async fn run_with_shutdown(ctx: AppContext) -> Result<()> {
    wait_for_signal().await;
    ctx.shutdown().await
}

#[cfg(unix)]
async fn wait_for_signal() {
    use tokio::signal::unix::{SignalKind, signal};

    // Set up signal handlers - these may fail in restricted environments (containers, tests)
    let sigterm_result = signal(SignalKind::terminate());
    let sigint_result = signal(SignalKind::interrupt());

    match (sigterm_result, sigint_result) {
        (Ok(mut sigterm), Ok(mut sigint)) => {
            tokio::select! {
                _ = sigterm.recv() => {
                    tracing::info!("Received SIGTERM signal");
                }
                _ = sigint.recv() => {
                    tracing::info!("Received SIGINT signal (Ctrl+C)");
                }
            }
        }
        (Err(e), _) => {
            tracing::warn!(error = %e, "Could not register SIGTERM handler, waiting for SIGINT only");
            if let Ok(mut sigint) = signal(SignalKind::interrupt()) {
                sigint.recv().await;
                tracing::info!("Received SIGINT signal (Ctrl+C)");
            } else {
                tracing::error!("Could not register any signal handlers, using ctrl_c fallback");
                tokio::signal::ctrl_c().await.ok();
            }
        }
        (_, Err(e)) => {
            tracing::warn!(error = %e, "Could not register SIGINT handler, waiting for SIGTERM only");
            if let Ok(mut sigterm) = signal(SignalKind::terminate()) {
                sigterm.recv().await;
                tracing::info!("Received SIGTERM signal");
            } else {
                tracing::error!("Could not register any signal handlers, using ctrl_c fallback");
                tokio::signal::ctrl_c().await.ok();
            }
        }
    }
}

#[cfg(not(unix))]
async fn wait_for_signal() {
    match tokio::signal::ctrl_c().await {
        Ok(()) => {
            tracing::info!("Received Ctrl+C signal");
        }
        Err(e) => {
            tracing::error!(error = %e, "Failed to listen for Ctrl+C signal");
        }
    }
}
