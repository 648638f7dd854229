//! Configuration types for music-dl
//!
//! Every field has a serde default so a partial (or empty) document deserializes into a
//! working configuration. Loading the document from disk is left to the embedding
//! application.

use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

/// Main configuration for [`crate::AppContext`]
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct Config {
    /// Download behavior settings (directories, concurrency, segmenting)
    #[serde(default)]
    pub download: DownloadConfig,

    /// Retry policy for segment and whole-file fetches
    #[serde(default)]
    pub retry: RetryConfig,

    /// Batch scanner settings
    #[serde(default)]
    pub scan: ScanConfig,

    /// Cron schedule for the batch scanner
    #[serde(default)]
    pub schedule: ScheduleConfig,

    /// Data storage
    #[serde(default)]
    pub persistence: PersistenceConfig,
}

impl Config {
    /// Check values that would otherwise deadlock or panic at runtime
    pub fn validate(&self) -> Result<()> {
        if self.download.max_concurrent_downloads == 0 {
            return Err(config_error(
                "max_concurrent_downloads must be at least 1",
                "download.max_concurrent_downloads",
            ));
        }
        if self.download.max_threads_per_download == 0 {
            return Err(config_error(
                "max_threads_per_download must be at least 1",
                "download.max_threads_per_download",
            ));
        }
        if self.download.min_segment_size == 0 {
            return Err(config_error(
                "min_segment_size must be greater than zero",
                "download.min_segment_size",
            ));
        }
        if self.scan.batch_size == 0 {
            return Err(config_error(
                "batch_size must be at least 1",
                "scan.batch_size",
            ));
        }
        if self.schedule.batch_size == 0 {
            return Err(config_error(
                "batch_size must be at least 1",
                "schedule.batch_size",
            ));
        }
        if let Some(expr) = &self.schedule.cron {
            crate::scheduler::parse_cron(expr)?;
        }
        Ok(())
    }
}

fn config_error(message: &str, key: &str) -> Error {
    Error::Config {
        message: message.to_string(),
        key: Some(key.to_string()),
    }
}

/// Download behavior
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct DownloadConfig {
    /// Working directory for temp files and segment sidecars (default: "./downloads")
    #[serde(default = "default_download_dir")]
    pub download_dir: PathBuf,

    /// Maximum tasks transferring audio at once, process-wide (default: 3)
    #[serde(default = "default_max_concurrent")]
    pub max_concurrent_downloads: usize,

    /// Maximum segments of one task transferring at once (default: 4)
    #[serde(default = "default_max_threads")]
    pub max_threads_per_download: usize,

    /// Files larger than this many bytes are fetched in segments (default: 10 MiB)
    #[serde(default = "default_segment_threshold")]
    pub segment_threshold: u64,

    /// Lower bound on segment size in bytes (default: 4 MiB)
    #[serde(default = "default_min_segment_size")]
    pub min_segment_size: u64,

    /// How many times one download may re-resolve an expired play URL (default: 3)
    #[serde(default = "default_max_url_refreshes")]
    pub max_url_refreshes: u32,

    /// What to do when the final path already exists
    #[serde(default)]
    pub file_collision: FileCollisionAction,

    /// User agent sent with audio and artwork requests
    #[serde(default = "default_user_agent")]
    pub user_agent: String,

    /// Per-request timeout (default: 60 seconds)
    #[serde(default = "default_request_timeout", with = "duration_serde")]
    pub request_timeout: Duration,

    /// Quality requested when a submission does not name one (default: "lossless")
    #[serde(default = "default_quality")]
    pub default_quality: String,
}

impl Default for DownloadConfig {
    fn default() -> Self {
        Self {
            download_dir: default_download_dir(),
            max_concurrent_downloads: default_max_concurrent(),
            max_threads_per_download: default_max_threads(),
            segment_threshold: default_segment_threshold(),
            min_segment_size: default_min_segment_size(),
            max_url_refreshes: default_max_url_refreshes(),
            file_collision: FileCollisionAction::default(),
            user_agent: default_user_agent(),
            request_timeout: default_request_timeout(),
            default_quality: default_quality(),
        }
    }
}

/// Retry configuration for transient failures
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct RetryConfig {
    /// Maximum number of retry attempts (default: 3)
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,

    /// Initial delay before first retry (default: 1 second)
    #[serde(default = "default_initial_delay", with = "duration_serde")]
    pub initial_delay: Duration,

    /// Maximum delay between retries (default: 8 seconds)
    #[serde(default = "default_max_delay", with = "duration_serde")]
    pub max_delay: Duration,

    /// Multiplier for exponential backoff (default: 2.0)
    #[serde(default = "default_backoff_multiplier")]
    pub backoff_multiplier: f64,

    /// Add random jitter to delays (default: true)
    #[serde(default = "default_true")]
    pub jitter: bool,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            initial_delay: default_initial_delay(),
            max_delay: default_max_delay(),
            backoff_multiplier: default_backoff_multiplier(),
            jitter: true,
        }
    }
}

/// Batch scanner settings
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ScanConfig {
    /// Tasks dispatched per batch when none is given (default: 10)
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,

    /// Ids per song-detail lookup when pre-warming caches (default: 300)
    #[serde(default = "default_detail_chunk_size")]
    pub detail_chunk_size: usize,

    /// Backoff for playlist listing calls
    #[serde(default = "default_playlist_retry")]
    pub playlist_retry: RetryConfig,
}

impl Default for ScanConfig {
    fn default() -> Self {
        Self {
            batch_size: default_batch_size(),
            detail_chunk_size: default_detail_chunk_size(),
            playlist_retry: default_playlist_retry(),
        }
    }
}

/// Cron schedule for the batch scanner
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ScheduleConfig {
    /// Cron expression with 5 fields, or 6 with trailing seconds
    #[serde(default)]
    pub cron: Option<String>,

    /// Install the schedule at startup (default: false)
    #[serde(default)]
    pub enabled: bool,

    /// How late a tick may fire before it is dropped (default: 30 seconds)
    #[serde(default = "default_misfire_grace", with = "duration_serde")]
    pub misfire_grace: Duration,

    /// Batch size passed to scheduled runs (default: 10)
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
}

impl Default for ScheduleConfig {
    fn default() -> Self {
        Self {
            cron: None,
            enabled: false,
            misfire_grace: default_misfire_grace(),
            batch_size: default_batch_size(),
        }
    }
}

/// Data storage
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct PersistenceConfig {
    /// SQLite database file (default: "./music-dl.db")
    #[serde(default = "default_database_path")]
    pub database_path: PathBuf,
}

impl Default for PersistenceConfig {
    fn default() -> Self {
        Self {
            database_path: default_database_path(),
        }
    }
}

/// File collision handling strategy
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FileCollisionAction {
    /// Append (1), (2), etc. to filename (default)
    #[default]
    Rename,
    /// Overwrite existing file
    Overwrite,
    /// Fail the finalize step, keep existing
    Skip,
}

fn default_download_dir() -> PathBuf {
    PathBuf::from("./downloads")
}

fn default_database_path() -> PathBuf {
    PathBuf::from("./music-dl.db")
}

fn default_max_concurrent() -> usize {
    3
}

fn default_max_threads() -> usize {
    4
}

fn default_segment_threshold() -> u64 {
    10 * 1024 * 1024
}

fn default_min_segment_size() -> u64 {
    4 * 1024 * 1024
}

fn default_max_url_refreshes() -> u32 {
    3
}

fn default_user_agent() -> String {
    concat!("music-dl/", env!("CARGO_PKG_VERSION")).to_string()
}

fn default_request_timeout() -> Duration {
    Duration::from_secs(60)
}

fn default_quality() -> String {
    "lossless".to_string()
}

fn default_true() -> bool {
    true
}

fn default_max_attempts() -> u32 {
    3
}

fn default_initial_delay() -> Duration {
    Duration::from_secs(1)
}

fn default_max_delay() -> Duration {
    Duration::from_secs(8)
}

fn default_backoff_multiplier() -> f64 {
    2.0
}

fn default_batch_size() -> usize {
    10
}

fn default_detail_chunk_size() -> usize {
    300
}

fn default_playlist_retry() -> RetryConfig {
    RetryConfig {
        jitter: false,
        ..RetryConfig::default()
    }
}

fn default_misfire_grace() -> Duration {
    Duration::from_secs(30)
}

// Duration serialization helper (whole seconds)
mod duration_serde {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_u64(duration.as_secs())
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let secs = u64::deserialize(deserializer)?;
        Ok(Duration::from_secs(secs))
    }
}
