//! Age-based cleanup of temporary backup artifacts
//!
//! Temp artifacts are matched by the shared filename prefix. Cleanup uses
//! filesystem mtime for age; `most_recent` instead parses the timestamp
//! embedded in the filename, because mtime can be altered by copy
//! operations while the embedded time cannot.

use std::fs;
use std::path::{Path, PathBuf};
use std::time::SystemTime;

use chrono::{DateTime, NaiveDateTime, Utc};
use log::debug;

use super::{ARTIFACT_PREFIX, ARTIFACT_TIMESTAMP_FORMAT};
use crate::error::{BackupError, BackupResult};

/// Deletes aged temp artifacts and resolves the newest one
pub struct RetentionManager {
    /// Directory holding temp artifacts
    temp_dir: PathBuf,
}

impl RetentionManager {
    /// Create a manager over the given temp directory
    pub fn new(temp_dir: PathBuf) -> Self {
        Self { temp_dir }
    }

    /// List temp artifacts matching the backup filename prefix
    pub fn list(&self) -> BackupResult<Vec<PathBuf>> {
        if !self.temp_dir.exists() {
            return Ok(Vec::new());
        }

        let mut artifacts = Vec::new();
        for entry in fs::read_dir(&self.temp_dir)
            .map_err(|e| BackupError::Io(format!("Failed to read temp directory: {}", e)))?
        {
            let entry = entry.map_err(|e| BackupError::Io(e.to_string()))?;
            let path = entry.path();
            let name = entry.file_name().to_string_lossy().to_string();
            if name.starts_with(ARTIFACT_PREFIX) && name.ends_with(".zip") && path.is_file() {
                artifacts.push(path);
            }
        }
        Ok(artifacts)
    }

    /// Artifact basenames, for display
    pub fn file_names(&self) -> BackupResult<Vec<String>> {
        Ok(self
            .list()?
            .iter()
            .filter_map(|p| p.file_name().map(|n| n.to_string_lossy().to_string()))
            .collect())
    }

    /// Delete prefix-matching artifacts older than `max_age_seconds`,
    /// judged by modification time. Returns the deleted paths.
    pub fn cleanup(&self, max_age_seconds: u64) -> BackupResult<Vec<PathBuf>> {
        let now = SystemTime::now();
        let mut deleted = Vec::new();

        for path in self.list()? {
            let modified = fs::metadata(&path)
                .and_then(|m| m.modified())
                .map_err(|e| BackupError::Io(format!("Failed to stat {}: {}", path.display(), e)))?;
            let age = now
                .duration_since(modified)
                .map(|d| d.as_secs())
                .unwrap_or(0);
            if age > max_age_seconds {
                debug!("removing stale artifact {} (age {}s)", path.display(), age);
                fs::remove_file(&path).map_err(|e| {
                    BackupError::Io(format!("Failed to delete {}: {}", path.display(), e))
                })?;
                deleted.push(path);
            }
        }

        Ok(deleted)
    }

    /// Delete a single consumed artifact, ignoring a missing file
    pub fn remove(&self, path: &Path) -> BackupResult<()> {
        match fs::remove_file(path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(BackupError::Io(format!(
                "Failed to delete {}: {}",
                path.display(),
                e
            ))),
        }
    }

    /// The artifact whose filename-embedded timestamp is latest.
    ///
    /// Candidates whose names do not parse are ignored.
    pub fn most_recent(&self) -> BackupResult<Option<PathBuf>> {
        let mut best: Option<(DateTime<Utc>, PathBuf)> = None;
        for path in self.list()? {
            let Some(name) = path.file_name().map(|n| n.to_string_lossy().to_string()) else {
                continue;
            };
            let Some(stamp) = extract_timestamp(&name) else {
                continue;
            };
            match &best {
                Some((current, _)) if *current >= stamp => {}
                _ => best = Some((stamp, path)),
            }
        }
        Ok(best.map(|(_, path)| path))
    }
}

/// Parse the timestamp embedded in an artifact filename
pub fn extract_timestamp(filename: &str) -> Option<DateTime<Utc>> {
    let date_part = filename
        .strip_prefix(ARTIFACT_PREFIX)?
        .strip_suffix(".zip")?;
    let naive = NaiveDateTime::parse_from_str(date_part, ARTIFACT_TIMESTAMP_FORMAT).ok()?;
    Some(DateTime::from_naive_utc_and_offset(naive, Utc))
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Datelike, Timelike};
    use filetime_shim::set_mtime_secs_ago;
    use std::fs::File;
    use tempfile::TempDir;

    mod filetime_shim {
        use std::fs;
        use std::path::Path;
        use std::time::{Duration, SystemTime};

        /// Rewind a file's mtime without external crates
        pub fn set_mtime_secs_ago(path: &Path, secs: u64) {
            let target = SystemTime::now() - Duration::from_secs(secs);
            let file = fs::OpenOptions::new().write(true).open(path).unwrap();
            file.set_modified(target).unwrap();
        }
    }

    fn artifact_name(stamp: &str) -> String {
        format!("{}{}.zip", ARTIFACT_PREFIX, stamp)
    }

    fn touch(path: &Path) {
        File::create(path).unwrap();
    }

    #[test]
    fn test_extract_timestamp() {
        let stamp = extract_timestamp(&artifact_name("2026-08-29-14-30-22")).unwrap();
        assert_eq!(stamp.year(), 2026);
        assert_eq!(stamp.month(), 8);
        assert_eq!(stamp.day(), 29);
        assert_eq!(stamp.hour(), 14);
        assert_eq!(stamp.second(), 22);

        assert!(extract_timestamp("unrelated.zip").is_none());
        assert!(extract_timestamp(&artifact_name("not-a-date")).is_none());
    }

    #[test]
    fn test_list_filters_by_prefix() {
        let temp = TempDir::new().unwrap();
        touch(&temp.path().join(artifact_name("2026-01-01-00-00-00")));
        touch(&temp.path().join("other.zip"));
        touch(&temp.path().join("notes.txt"));

        let manager = RetentionManager::new(temp.path().to_path_buf());
        let listed = manager.list().unwrap();
        assert_eq!(listed.len(), 1);
    }

    #[test]
    fn test_cleanup_age_boundary() {
        let temp = TempDir::new().unwrap();
        let old = temp.path().join(artifact_name("2026-01-01-00-00-00"));
        let fresh = temp.path().join(artifact_name("2026-01-01-00-00-01"));
        touch(&old);
        touch(&fresh);
        set_mtime_secs_ago(&old, 301);
        set_mtime_secs_ago(&fresh, 299);

        let manager = RetentionManager::new(temp.path().to_path_buf());
        let deleted = manager.cleanup(300).unwrap();

        assert_eq!(deleted.len(), 1);
        assert!(!old.exists());
        assert!(fresh.exists());
    }

    #[test]
    fn test_most_recent_ignores_mtime() {
        let temp = TempDir::new().unwrap();
        let older = temp.path().join(artifact_name("2026-01-01-00-00-00"));
        let newer = temp.path().join(artifact_name("2026-06-15-12-00-00"));
        touch(&older);
        touch(&newer);
        // Make the chronologically-newer artifact look stale on disk; the
        // embedded timestamp must still win.
        set_mtime_secs_ago(&newer, 86_400);

        let manager = RetentionManager::new(temp.path().to_path_buf());
        let most_recent = manager.most_recent().unwrap().unwrap();
        assert_eq!(most_recent, newer);
    }

    #[test]
    fn test_most_recent_empty() {
        let temp = TempDir::new().unwrap();
        let manager = RetentionManager::new(temp.path().to_path_buf());
        assert!(manager.most_recent().unwrap().is_none());
    }

    #[test]
    fn test_remove_is_idempotent() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join(artifact_name("2026-01-01-00-00-00"));
        touch(&path);

        let manager = RetentionManager::new(temp.path().to_path_buf());
        manager.remove(&path).unwrap();
        manager.remove(&path).unwrap();
        assert!(!path.exists());
    }
}
