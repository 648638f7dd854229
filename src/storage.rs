//! Final placement of downloaded files
//!
//! Finalizing renders the job's filename template, moves the temp file under the job's
//! storage root and points the task row at the new location.
//!
//! Template variables: `{id}`, `{title}`, `{artist}`, `{album}`, `{quality}`,
//! `{format}`. Values are sanitized so they cannot introduce path separators; slashes
//! written in the template itself create subdirectories. A template naming any other
//! variable is replaced by [`FALLBACK_TEMPLATE`].

use crate::config::FileCollisionAction;
use crate::db::{Database, DownloadJob, DownloadTask};
use crate::error::{Result, StorageError, TaskError};
use crate::types::{TaskId, TaskProgress};
use crate::utils::{
    MAX_COMPONENT_CHARS, get_unique_path, move_file, sanitize_component, sanitize_component_within,
};
use regex::Regex;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, LazyLock};

/// Template used when the job's template names an unknown variable
pub const FALLBACK_TEMPLATE: &str = "{artist} - {title}";

#[allow(clippy::expect_used)]
static TEMPLATE_VAR: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\{(\w+)\}").expect("template variable pattern is valid"));

/// Moves finished downloads into their job's library
pub struct StorageManager {
    db: Arc<Database>,
    collision: FileCollisionAction,
}

impl StorageManager {
    /// Create a storage manager
    pub fn new(db: Arc<Database>, collision: FileCollisionAction) -> Self {
        Self { db, collision }
    }

    /// Move the task's temp file to its final path and record it
    ///
    /// Finalizing an already-finalized task whose file is in place is a no-op.
    pub async fn finalize(&self, task_id: TaskId) -> Result<PathBuf> {
        let task = self
            .db
            .get_task(task_id)
            .await?
            .ok_or(TaskError::NotFound { id: task_id.get() })?;
        let job = self
            .db
            .get_job(task.job_id)
            .await?
            .ok_or(TaskError::JobNotFound {
                id: task.job_id.get(),
            })?;

        if !task.progress().contains(TaskProgress::MUSIC_DOWNLOADED) {
            return Err(TaskError::InvalidState {
                id: task_id.get(),
                operation: "finalize".to_string(),
                current_state: "audio not downloaded".to_string(),
            }
            .into());
        }

        let temp_path = task
            .file_path
            .as_deref()
            .map(PathBuf::from)
            .ok_or(TaskError::MissingField {
                id: task_id.get(),
                field: "file_path",
            })?;
        if !tokio::fs::try_exists(&temp_path).await.unwrap_or(false) {
            return Err(StorageError::TempFileMissing { path: temp_path }.into());
        }

        let target = generate_final_path(&job, &task, &temp_path);
        if target == temp_path {
            tracing::debug!(task_id = %task_id, path = %target.display(), "already finalized");
            return Ok(target);
        }

        if let Some(parent) = target.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let target = get_unique_path(&target, self.collision)?;
        move_file(&temp_path, &target).await?;

        let file_name = target
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        self.db
            .update_task_file_location(task_id, &target.to_string_lossy(), &file_name)
            .await?;

        tracing::info!(task_id = %task_id, path = %target.display(), "file finalized");
        Ok(target)
    }
}

/// Final path of `task` under `job`, before collision handling
pub fn generate_final_path(job: &DownloadJob, task: &DownloadTask, temp_path: &Path) -> PathBuf {
    let format = task
        .file_format
        .clone()
        .or_else(|| {
            temp_path
                .extension()
                .map(|e| e.to_string_lossy().into_owned())
        })
        .unwrap_or_else(|| "mp3".to_string())
        .to_lowercase();

    let mut values = HashMap::new();
    values.insert("id", value_or(Some(task.music_id.as_str()), "UnknownID"));
    values.insert("title", value_or(task.music_title.as_deref(), "UnknownTitle"));
    values.insert("artist", value_or(task.music_artist.as_deref(), "UnknownArtist"));
    values.insert("album", value_or(task.music_album.as_deref(), "UnknownAlbum"));
    values.insert("quality", value_or(Some(task.quality.as_str()), "unknown"));
    let format = sanitize_component(&format);
    values.insert("format", format.clone());

    let suffix = format!(".{}", format);
    let rendered = render_template(&job.filename_template, &values);
    let mut components: Vec<&str> = rendered
        .split('/')
        .filter(|c| !c.trim().is_empty())
        .collect();
    let stem = components.pop().map(|c| strip_suffix(c, &suffix)).unwrap_or("");

    let mut path = PathBuf::from(&job.storage_path);
    for component in components {
        path.push(sanitize_component(component));
    }
    // The extension always survives the length cap
    let stem_cap = MAX_COMPONENT_CHARS.saturating_sub(suffix.chars().count());
    path.push(format!("{}{}", sanitize_component_within(stem, stem_cap), suffix));
    path
}

fn strip_suffix<'a>(name: &'a str, suffix: &str) -> &'a str {
    let Some(split) = name.len().checked_sub(suffix.len()) else {
        return name;
    };
    match name.get(split..) {
        Some(tail) if tail.eq_ignore_ascii_case(suffix) => &name[..split],
        _ => name,
    }
}

/// Substitute `{name}` variables; falls back to [`FALLBACK_TEMPLATE`] on unknown names
pub fn render_template(template: &str, values: &HashMap<&str, String>) -> String {
    let unknown = TEMPLATE_VAR
        .captures_iter(template)
        .find(|c| !values.contains_key(&c[1]));

    let template = match unknown {
        Some(var) => {
            tracing::warn!(
                template,
                variable = &var[1],
                "unknown template variable, using fallback template"
            );
            FALLBACK_TEMPLATE
        }
        None => template,
    };

    TEMPLATE_VAR
        .replace_all(template, |caps: &regex::Captures<'_>| {
            values.get(&caps[1]).cloned().unwrap_or_default()
        })
        .into_owned()
}

fn value_or(value: Option<&str>, default: &str) -> String {
    match value.map(str::trim).filter(|v| !v.is_empty()) {
        Some(v) => sanitize_component(v),
        None => default.to_string(),
    }
}
