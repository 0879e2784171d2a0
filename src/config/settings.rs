//! User settings for siteback
//!
//! Manages backup preferences: schedule, notification email, what to
//! include in the archive, resource budget, and the storage backend
//! credential. Settings persist as JSON next to the backup artifacts.

use serde::{Deserialize, Serialize};

use super::paths::BackupPaths;
use crate::error::{BackupError, BackupResult};
use crate::storage::StorageCredential;

/// How often scheduled backups run
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum BackupFrequency {
    #[default]
    Daily,
    Weekly,
    Monthly,
}

/// Which areas of the site are included in the archive
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IncludePolicy {
    #[serde(default = "default_true")]
    pub files: bool,
    #[serde(default = "default_true")]
    pub database: bool,
    #[serde(default = "default_true")]
    pub plugins: bool,
    #[serde(default = "default_true")]
    pub themes: bool,
    #[serde(default = "default_true")]
    pub uploads: bool,
}

impl Default for IncludePolicy {
    fn default() -> Self {
        Self {
            files: true,
            database: true,
            plugins: true,
            themes: true,
            uploads: true,
        }
    }
}

fn default_true() -> bool {
    true
}

/// User settings for siteback
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Settings {
    /// Schema version for migration support
    #[serde(default = "default_schema_version")]
    pub schema_version: u32,

    /// Scheduled backup frequency
    #[serde(default)]
    pub backup_frequency: BackupFrequency,

    /// Preferred time of day for scheduled backups (HH:MM, 24-hour)
    #[serde(default = "default_backup_time")]
    pub backup_time: String,

    /// Notification email, if any
    #[serde(default)]
    pub backup_email: Option<String>,

    /// Storage backend credential, if configured
    #[serde(default)]
    pub storage: Option<StorageCredential>,

    /// Which site areas to include in backups
    #[serde(default)]
    pub include: IncludePolicy,

    /// Entry names excluded from archives in addition to the
    /// dangerous-extension deny-list
    #[serde(default = "default_exclusions")]
    pub custom_exclusions: Vec<String>,

    /// Memory ceiling with a unit suffix, e.g. "512M" or "1G"
    #[serde(default = "default_memory_limit")]
    pub memory_limit: String,

    /// Temp artifacts older than this are deleted during housekeeping
    #[serde(default = "default_retention_seconds")]
    pub retention_max_age_seconds: u64,

    /// How long a published job ticket stays valid
    #[serde(default = "default_ticket_ttl_seconds")]
    pub ticket_ttl_seconds: u64,

    /// Base URL of the external checksum service, if any
    #[serde(default)]
    pub checksum_service_url: Option<String>,
}

fn default_schema_version() -> u32 {
    1
}

fn default_backup_time() -> String {
    "03:00".to_string()
}

fn default_exclusions() -> Vec<String> {
    vec![".git".to_string()]
}

fn default_memory_limit() -> String {
    "512M".to_string()
}

fn default_retention_seconds() -> u64 {
    1800
}

fn default_ticket_ttl_seconds() -> u64 {
    30
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            schema_version: default_schema_version(),
            backup_frequency: BackupFrequency::default(),
            backup_time: default_backup_time(),
            backup_email: None,
            storage: None,
            include: IncludePolicy::default(),
            custom_exclusions: default_exclusions(),
            memory_limit: default_memory_limit(),
            retention_max_age_seconds: default_retention_seconds(),
            ticket_ttl_seconds: default_ticket_ttl_seconds(),
            checksum_service_url: None,
        }
    }
}

impl Settings {
    /// Load settings from disk, or create default settings if file doesn't exist
    pub fn load_or_create(paths: &BackupPaths) -> BackupResult<Self> {
        let settings_path = paths.settings_file();

        if settings_path.exists() {
            let contents = std::fs::read_to_string(&settings_path)
                .map_err(|e| BackupError::Io(format!("Failed to read settings file: {}", e)))?;

            let settings: Settings = serde_json::from_str(&contents)
                .map_err(|e| BackupError::Config(format!("Failed to parse settings file: {}", e)))?;

            settings.validate()?;
            Ok(settings)
        } else {
            // Don't save yet - let caller decide when to persist
            Ok(Settings::default())
        }
    }

    /// Save settings to disk after validating them
    pub fn save(&self, paths: &BackupPaths) -> BackupResult<()> {
        self.validate()?;
        paths.ensure_directories()?;

        let settings_path = paths.settings_file();
        let contents = serde_json::to_string_pretty(self)
            .map_err(|e| BackupError::Config(format!("Failed to serialize settings: {}", e)))?;

        std::fs::write(&settings_path, contents)
            .map_err(|e| BackupError::Io(format!("Failed to write settings file: {}", e)))?;

        Ok(())
    }

    /// Validate field constraints that serde cannot express
    pub fn validate(&self) -> BackupResult<()> {
        if !is_valid_time(&self.backup_time) {
            return Err(BackupError::Config(format!(
                "Invalid backup time '{}': expected HH:MM",
                self.backup_time
            )));
        }

        if let Some(email) = &self.backup_email {
            if !email.contains('@') {
                return Err(BackupError::Config(format!(
                    "Invalid email address: {}",
                    email
                )));
            }
        }

        if let Some(credential) = &self.storage {
            credential.validate()?;
        }

        Ok(())
    }
}

/// Check a 24-hour HH:MM time string
fn is_valid_time(value: &str) -> bool {
    let mut parts = value.splitn(2, ':');
    match (parts.next(), parts.next()) {
        (Some(hours), Some(minutes)) if minutes.len() == 2 => matches!(
            (hours.parse::<u8>(), minutes.parse::<u8>()),
            (Ok(h), Ok(m)) if h < 24 && m < 60
        ),
        _ => false,
    }
}
