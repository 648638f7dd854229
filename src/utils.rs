//! Utility functions for file operations and path manipulation

use crate::config::FileCollisionAction;
use crate::error::{Error, Result, StorageError};
use std::path::{Path, PathBuf};

/// Maximum number of rename attempts when resolving file collisions
const MAX_RENAME_ATTEMPTS: u32 = 9999;

/// Longest sanitized path component, in characters
pub const MAX_COMPONENT_CHARS: usize = 100;

/// Get a unique path for a file, handling collisions according to the specified action
///
/// For Rename, this may add a " (n)" suffix before the extension. For Skip, returns an
/// error if the file already exists. For Overwrite, returns the path unchanged.
///
/// # Examples
///
/// ```
/// use music_dl::utils::get_unique_path;
/// use music_dl::config::FileCollisionAction;
/// use std::path::Path;
///
/// let path = Path::new("/tmp/Artist - Title.flac");
/// let unique = get_unique_path(path, FileCollisionAction::Rename).unwrap();
/// // If the file exists, returns /tmp/Artist - Title (1).flac, then (2), ...
/// ```
pub fn get_unique_path(path: &Path, action: FileCollisionAction) -> Result<PathBuf> {
    match action {
        FileCollisionAction::Overwrite => Ok(path.to_path_buf()),
        FileCollisionAction::Skip => {
            if path.exists() {
                return Err(Error::Storage(StorageError::FileCollision {
                    path: path.to_path_buf(),
                    reason: "File already exists and collision action is Skip".to_string(),
                }));
            }
            Ok(path.to_path_buf())
        }
        FileCollisionAction::Rename => {
            if !path.exists() {
                return Ok(path.to_path_buf());
            }

            let stem = path.file_stem().and_then(|s| s.to_str()).ok_or_else(|| {
                Error::Storage(StorageError::InvalidPath {
                    path: path.to_path_buf(),
                    reason: "Cannot extract file stem".to_string(),
                })
            })?;

            let extension = path.extension().and_then(|e| e.to_str());

            let parent = path.parent().ok_or_else(|| {
                Error::Storage(StorageError::InvalidPath {
                    path: path.to_path_buf(),
                    reason: "Cannot extract parent directory".to_string(),
                })
            })?;

            for i in 1..=MAX_RENAME_ATTEMPTS {
                let new_name = match extension {
                    Some(ext) => format!("{} ({}).{}", stem, i, ext),
                    None => format!("{} ({})", stem, i),
                };
                let new_path = parent.join(new_name);
                if !new_path.exists() {
                    return Ok(new_path);
                }
            }

            Err(Error::Storage(StorageError::FileCollision {
                path: path.to_path_buf(),
                reason: "Could not find unique filename after 9999 attempts".to_string(),
            }))
        }
    }
}

/// Make one path component safe for common filesystems
///
/// Replaces `<>:"/\|?*` and control characters with `_`, trims surrounding spaces and
/// dots, caps the length at [`MAX_COMPONENT_CHARS`], and falls back to "Unknown" when
/// nothing is left.
///
/// ```
/// use music_dl::utils::sanitize_component;
///
/// assert_eq!(sanitize_component("AC/DC: Live?"), "AC_DC_ Live_");
/// assert_eq!(sanitize_component(" ..."), "Unknown");
/// ```
#[must_use]
pub fn sanitize_component(value: &str) -> String {
    sanitize_component_within(value, MAX_COMPONENT_CHARS)
}

/// [`sanitize_component`] with a tighter cap, for stems that still need an extension
#[must_use]
pub fn sanitize_component_within(value: &str, max_chars: usize) -> String {
    let replaced: String = value
        .chars()
        .map(|c| match c {
            '<' | '>' | ':' | '"' | '/' | '\\' | '|' | '?' | '*' => '_',
            c if c.is_control() => '_',
            c => c,
        })
        .collect();

    let trimmed = replaced.trim_matches(|c: char| c == ' ' || c == '.');
    let capped: String = trimmed.chars().take(max_chars.max(1)).collect();
    let capped = capped.trim_end_matches(|c: char| c == ' ' || c == '.');

    if capped.is_empty() {
        "Unknown".to_string()
    } else {
        capped.to_string()
    }
}

/// Join artist names the way they are stored on tasks
#[must_use]
pub fn join_artists(artists: &[String]) -> Option<String> {
    let names: Vec<&str> = artists
        .iter()
        .map(|a| a.trim())
        .filter(|a| !a.is_empty())
        .collect();
    if names.is_empty() {
        None
    } else {
        Some(names.join(", "))
    }
}

/// Move a file, falling back to copy + remove when `rename` can't cross filesystems
pub async fn move_file(source: &Path, dest: &Path) -> Result<()> {
    match tokio::fs::rename(source, dest).await {
        Ok(()) => Ok(()),
        Err(rename_err) => {
            tracing::debug!(
                source = %source.display(),
                dest = %dest.display(),
                error = %rename_err,
                "rename failed, copying instead"
            );
            let move_failed = |reason: String| {
                Error::Storage(StorageError::MoveFailed {
                    source_path: source.to_path_buf(),
                    dest_path: dest.to_path_buf(),
                    reason,
                })
            };
            if let Err(e) = tokio::fs::copy(source, dest).await {
                let _ = tokio::fs::remove_file(dest).await;
                return Err(move_failed(format!("rename: {}; copy: {}", rename_err, e)));
            }
            tokio::fs::remove_file(source)
                .await
                .map_err(|e| move_failed(format!("copied but could not remove source: {}", e)))
        }
    }
}
