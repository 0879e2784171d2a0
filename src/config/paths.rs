//! Path management for siteback
//!
//! Resolves the well-known temp directory that holds in-flight backup
//! artifacts, plus the settings file location.
//!
//! ## Path Resolution Order
//!
//! 1. `SITEBACK_TEMP_DIR` environment variable (if set)
//! 2. `<system temp dir>/siteback-backups`

use std::path::PathBuf;

use crate::error::{BackupError, BackupResult};

/// Manages all paths used by siteback
#[derive(Debug, Clone)]
pub struct BackupPaths {
    /// Directory holding temporary backup artifacts
    temp_dir: PathBuf,
}

impl BackupPaths {
    /// Create a new BackupPaths instance
    ///
    /// Path resolution:
    /// 1. `SITEBACK_TEMP_DIR` env var (explicit override)
    /// 2. `<system temp dir>/siteback-backups`
    pub fn new() -> Self {
        let temp_dir = if let Ok(custom) = std::env::var("SITEBACK_TEMP_DIR") {
            PathBuf::from(custom)
        } else {
            std::env::temp_dir().join("siteback-backups")
        };

        Self { temp_dir }
    }

    /// Create BackupPaths with a custom temp directory (useful for testing)
    pub fn with_temp_dir(temp_dir: PathBuf) -> Self {
        Self { temp_dir }
    }

    /// Get the temp directory holding backup artifacts
    pub fn temp_dir(&self) -> &PathBuf {
        &self.temp_dir
    }

    /// Get the path to the settings file
    pub fn settings_file(&self) -> PathBuf {
        self.temp_dir.join("config.json")
    }

    /// Get the path to the durable state file (tickets, history)
    pub fn state_file(&self) -> PathBuf {
        self.temp_dir.join("state.json")
    }

    /// Ensure the temp directory exists
    pub fn ensure_directories(&self) -> BackupResult<()> {
        std::fs::create_dir_all(&self.temp_dir)
            .map_err(|e| BackupError::Io(format!("Failed to create temp directory: {}", e)))?;

        Ok(())
    }
}

impl Default for BackupPaths {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_custom_temp_dir() {
        let temp_dir = TempDir::new().unwrap();
        let paths = BackupPaths::with_temp_dir(temp_dir.path().to_path_buf());

        assert_eq!(paths.temp_dir(), temp_dir.path());
        assert_eq!(paths.settings_file(), temp_dir.path().join("config.json"));
        assert_eq!(paths.state_file(), temp_dir.path().join("state.json"));
    }

    #[test]
    fn test_default_under_system_temp() {
        if std::env::var("SITEBACK_TEMP_DIR").is_ok() {
            return;
        }
        let paths = BackupPaths::new();
        assert!(paths.temp_dir().starts_with(std::env::temp_dir()));
    }

    #[test]
    fn test_ensure_directories() {
        let temp_dir = TempDir::new().unwrap();
        let paths = BackupPaths::with_temp_dir(temp_dir.path().join("nested"));

        paths.ensure_directories().unwrap();
        assert!(paths.temp_dir().exists());
    }
}
