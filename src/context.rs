//! Explicit wiring of every long-lived component.

use crate::cache::TaskCacheRegistry;
use crate::catalog::CatalogGateway;
use crate::config::Config;
use crate::db::Database;
use crate::downloader::{AudioDownloader, AudioFetcher, build_http_client};
use crate::error::Result;
use crate::metadata::MetadataProcessor;
use crate::orchestrator::DownloadOrchestrator;
use crate::process::DownloadProcess;
use crate::scheduler::ProcessScheduler;
use crate::storage::StorageManager;
use crate::tagging::TagWriter;
use crate::types::TaskId;
use crate::workflow::WorkflowEngine;
use std::sync::Arc;

/// Everything a front end needs, built once and passed by handle
///
/// There is no global state: two contexts over different databases are fully independent.
pub struct AppContext {
    /// Validated configuration
    pub config: Arc<Config>,
    /// Job and task store
    pub db: Arc<Database>,
    /// Per-task caches of catalog lookups
    pub caches: Arc<TaskCacheRegistry>,
    /// Submission, control and queries
    pub orchestrator: DownloadOrchestrator,
    /// Batch scanner over enabled jobs
    pub process: DownloadProcess,
    /// Cron trigger for the scanner
    pub scheduler: ProcessScheduler,
}

impl AppContext {
    /// Wire a context around the built-in HTTP downloader
    pub async fn new(
        config: Config,
        catalog: Arc<dyn CatalogGateway>,
        tag_writer: Arc<dyn TagWriter>,
    ) -> Result<Self> {
        config.validate()?;
        let caches = Arc::new(TaskCacheRegistry::new(Arc::clone(&catalog)));
        let http = build_http_client(&config.download)?;
        let fetcher: Arc<dyn AudioFetcher> =
            Arc::new(AudioDownloader::new(&config, Arc::clone(&caches), http.clone()));
        Self::build(config, catalog, tag_writer, fetcher, caches, http).await
    }

    /// Wire a context around a caller-supplied audio fetcher
    pub async fn with_fetcher(
        config: Config,
        catalog: Arc<dyn CatalogGateway>,
        tag_writer: Arc<dyn TagWriter>,
        fetcher: Arc<dyn AudioFetcher>,
    ) -> Result<Self> {
        config.validate()?;
        let caches = Arc::new(TaskCacheRegistry::new(Arc::clone(&catalog)));
        let http = build_http_client(&config.download)?;
        Self::build(config, catalog, tag_writer, fetcher, caches, http).await
    }

    async fn build(
        config: Config,
        catalog: Arc<dyn CatalogGateway>,
        tag_writer: Arc<dyn TagWriter>,
        fetcher: Arc<dyn AudioFetcher>,
        caches: Arc<TaskCacheRegistry>,
        http: reqwest::Client,
    ) -> Result<Self> {
        let config = Arc::new(config);
        let db = Arc::new(Database::new(&config.persistence.database_path).await?);

        let metadata = Arc::new(MetadataProcessor::new(
            Arc::clone(&db),
            Arc::clone(&catalog),
            Arc::clone(&caches),
            tag_writer,
            http,
        ));
        let storage = Arc::new(StorageManager::new(
            Arc::clone(&db),
            config.download.file_collision,
        ));
        let workflow = Arc::new(WorkflowEngine::new(
            Arc::clone(&db),
            Arc::clone(&fetcher),
            metadata,
            storage,
        ));

        let orchestrator = DownloadOrchestrator::new(
            Arc::clone(&db),
            Arc::clone(&config),
            Arc::clone(&caches),
            fetcher,
            workflow,
        );
        let process = DownloadProcess::new(orchestrator.clone(), catalog, Arc::clone(&caches));
        let scheduler = ProcessScheduler::from_config(process.clone(), &config.schedule).await?;

        tracing::info!(
            database = %config.persistence.database_path.display(),
            download_dir = %config.download.download_dir.display(),
            "context ready"
        );

        Ok(Self {
            config,
            db,
            caches,
            orchestrator,
            process,
            scheduler,
        })
    }

    /// Respawn every task left unfinished by a previous process
    pub async fn start(&self) -> Result<Vec<TaskId>> {
        let resumed = self.orchestrator.resume_unfinished_tasks().await?;
        if !resumed.is_empty() {
            tracing::info!(count = resumed.len(), "resumed unfinished tasks");
        }
        Ok(resumed)
    }

    /// Remove the schedule, then stop every running workflow
    pub async fn shutdown(&self) -> Result<()> {
        self.scheduler.shutdown().await;
        self.orchestrator.shutdown().await
    }
}
