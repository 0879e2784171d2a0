//! Durable key-value collaborator, job tickets, and the history log
//!
//! The host platform provides the real durable store; the library only
//! sees the `KvStore` trait. `MemoryKvStore` backs tests; `FileKvStore`
//! persists to disk so tickets survive across CLI invocations.
//! Ticket mutation always happens through a single store call, so a
//! concurrent publisher cannot interleave a read-modify-write.

use std::collections::HashMap;
use std::fs;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use log::warn;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{BackupError, BackupResult};

/// Maximum number of retained history entries
pub const HISTORY_LIMIT: usize = 100;

const TICKET_KEY: &str = "siteback/ticket";
const HISTORY_KEY: &str = "siteback/history";
const LAST_BACKUP_KEY: &str = "siteback/last-backup";

/// Durable key-value store with optional per-key TTL
pub trait KvStore: Send + Sync {
    /// Fetch a value, or `None` if absent or expired
    fn get(&self, key: &str) -> Option<String>;
    /// Store a value, replacing any previous one atomically
    fn set(&self, key: &str, value: &str, ttl: Option<Duration>);
    /// Remove a value
    fn delete(&self, key: &str);
}

/// In-memory `KvStore` with lazy TTL expiry
#[derive(Default)]
pub struct MemoryKvStore {
    entries: Mutex<HashMap<String, (String, Option<Instant>)>>,
}

impl MemoryKvStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl KvStore for MemoryKvStore {
    fn get(&self, key: &str) -> Option<String> {
        let mut entries = self.entries.lock().unwrap_or_else(|e| e.into_inner());
        match entries.get(key) {
            Some((_, Some(deadline))) if *deadline <= Instant::now() => {
                entries.remove(key);
                None
            }
            Some((value, _)) => Some(value.clone()),
            None => None,
        }
    }

    fn set(&self, key: &str, value: &str, ttl: Option<Duration>) {
        let deadline = ttl.map(|d| Instant::now() + d);
        let mut entries = self.entries.lock().unwrap_or_else(|e| e.into_inner());
        entries.insert(key.to_string(), (value.to_string(), deadline));
    }

    fn delete(&self, key: &str) {
        let mut entries = self.entries.lock().unwrap_or_else(|e| e.into_inner());
        entries.remove(key);
    }
}

/// One persisted value with an absolute expiry
#[derive(Debug, Clone, Serialize, Deserialize)]
struct PersistedEntry {
    value: String,
    expires_at: Option<DateTime<Utc>>,
}

impl PersistedEntry {
    fn is_expired(&self) -> bool {
        matches!(self.expires_at, Some(deadline) if Utc::now() >= deadline)
    }
}

/// `KvStore` persisted as a JSON file, so the job ticket and history
/// survive across separate CLI invocations.
///
/// Expiry is stored as an absolute timestamp, not a process-relative
/// instant. A missing or unreadable file is treated as an empty store.
pub struct FileKvStore {
    path: PathBuf,
    lock: Mutex<()>,
}

impl FileKvStore {
    pub fn new(path: PathBuf) -> Self {
        Self {
            path,
            lock: Mutex::new(()),
        }
    }

    fn load(&self) -> HashMap<String, PersistedEntry> {
        let Ok(json) = fs::read_to_string(&self.path) else {
            return HashMap::new();
        };
        match serde_json::from_str(&json) {
            Ok(entries) => entries,
            Err(e) => {
                warn!("discarding unreadable state file {}: {}", self.path.display(), e);
                HashMap::new()
            }
        }
    }

    fn save(&self, entries: &HashMap<String, PersistedEntry>) {
        let json = match serde_json::to_string(entries) {
            Ok(json) => json,
            Err(e) => {
                warn!("failed to serialize state: {}", e);
                return;
            }
        };
        if let Err(e) = fs::write(&self.path, json) {
            warn!("failed to write state file {}: {}", self.path.display(), e);
        }
    }
}

impl KvStore for FileKvStore {
    fn get(&self, key: &str) -> Option<String> {
        let _guard = self.lock.lock().unwrap_or_else(|e| e.into_inner());
        let mut entries = self.load();
        match entries.get(key) {
            Some(entry) if entry.is_expired() => {
                entries.remove(key);
                self.save(&entries);
                None
            }
            Some(entry) => Some(entry.value.clone()),
            None => None,
        }
    }

    fn set(&self, key: &str, value: &str, ttl: Option<Duration>) {
        let expires_at = ttl.map(|d| {
            Utc::now() + chrono::Duration::from_std(d).unwrap_or_else(|_| chrono::Duration::seconds(0))
        });
        let _guard = self.lock.lock().unwrap_or_else(|e| e.into_inner());
        let mut entries = self.load();
        entries.insert(
            key.to_string(),
            PersistedEntry {
                value: value.to_string(),
                expires_at,
            },
        );
        self.save(&entries);
    }

    fn delete(&self, key: &str) {
        let _guard = self.lock.lock().unwrap_or_else(|e| e.into_inner());
        let mut entries = self.load();
        if entries.remove(key).is_some() {
            self.save(&entries);
        }
    }
}

/// Workflow state of a backup job
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobState {
    /// Archive built and validated (after step 1)
    Archived,
    /// Secondary payload appended (after step 2)
    Exported,
    /// Artifact uploaded and consumed (after step 3)
    Uploaded,
    /// A step failed; the caller must restart from step 0/1
    Failed,
}

/// The job ticket linking a temp artifact to its expiry and consumer.
///
/// Exactly one active ticket exists at a time; publishing a new one
/// overwrites the prior ticket.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ArchiveJob {
    /// Unique id for this job
    pub ticket_id: Uuid,
    /// Root of the tree that was archived
    pub source_root: PathBuf,
    /// Location of the temp artifact
    pub temp_artifact_path: PathBuf,
    /// When the ticket was published
    pub created_at: DateTime<Utc>,
    /// When the ticket stops being valid
    pub expires_at: DateTime<Utc>,
    /// Current workflow state
    pub state: JobState,
}

impl ArchiveJob {
    /// Create a fresh ticket for an artifact with the given TTL
    pub fn new(source_root: PathBuf, temp_artifact_path: PathBuf, ttl: Duration) -> Self {
        let created_at = Utc::now();
        let expires_at = created_at
            + chrono::Duration::from_std(ttl).unwrap_or_else(|_| chrono::Duration::seconds(30));
        Self {
            ticket_id: Uuid::new_v4(),
            source_root,
            temp_artifact_path,
            created_at,
            expires_at,
            state: JobState::Archived,
        }
    }

    /// Whether the ticket has passed its expiry
    pub fn is_expired(&self) -> bool {
        Utc::now() >= self.expires_at
    }
}

/// Single-slot ticket store over the durable KV collaborator
pub struct TicketStore {
    store: Arc<dyn KvStore>,
}

impl TicketStore {
    pub fn new(store: Arc<dyn KvStore>) -> Self {
        Self { store }
    }

    /// Publish a ticket, atomically replacing any prior one. The store
    /// TTL matches the ticket's own expiry.
    pub fn put(&self, job: &ArchiveJob) -> BackupResult<()> {
        let json = serde_json::to_string(job)
            .map_err(|e| BackupError::Json(format!("Failed to serialize ticket: {}", e)))?;
        let ttl = (job.expires_at - Utc::now())
            .to_std()
            .unwrap_or(Duration::ZERO);
        self.store.set(TICKET_KEY, &json, Some(ttl));
        Ok(())
    }

    /// The active ticket, if present and unexpired.
    ///
    /// An expired ticket is treated as absent and purged.
    pub fn get(&self) -> BackupResult<Option<ArchiveJob>> {
        let Some(json) = self.store.get(TICKET_KEY) else {
            return Ok(None);
        };
        let job: ArchiveJob = serde_json::from_str(&json)
            .map_err(|e| BackupError::Json(format!("Failed to parse ticket: {}", e)))?;
        if job.is_expired() {
            self.store.delete(TICKET_KEY);
            return Ok(None);
        }
        Ok(Some(job))
    }

    /// Drop the active ticket, if any
    pub fn expire(&self) {
        self.store.delete(TICKET_KEY);
    }
}

/// One line of the backup history
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HistoryEntry {
    pub timestamp: DateTime<Utc>,
    pub message: String,
}

/// Bounded, newest-first durable history log
pub struct HistoryLog {
    store: Arc<dyn KvStore>,
}

impl HistoryLog {
    pub fn new(store: Arc<dyn KvStore>) -> Self {
        Self { store }
    }

    /// All entries, newest first
    pub fn list(&self) -> BackupResult<Vec<HistoryEntry>> {
        let Some(json) = self.store.get(HISTORY_KEY) else {
            return Ok(Vec::new());
        };
        serde_json::from_str(&json)
            .map_err(|e| BackupError::Json(format!("Failed to parse history: {}", e)))
    }

    /// Prepend an entry, trimming to [`HISTORY_LIMIT`]
    pub fn append(&self, message: impl Into<String>) -> BackupResult<()> {
        let mut entries = self.list()?;
        entries.insert(
            0,
            HistoryEntry {
                timestamp: Utc::now(),
                message: message.into(),
            },
        );
        entries.truncate(HISTORY_LIMIT);
        let json = serde_json::to_string(&entries)
            .map_err(|e| BackupError::Json(format!("Failed to serialize history: {}", e)))?;
        self.store.set(HISTORY_KEY, &json, None);
        Ok(())
    }

    /// Remove all entries
    pub fn clear(&self) {
        self.store.delete(HISTORY_KEY);
    }

    /// Record when the last successful backup finished
    pub fn set_last_backup_time(&self, when: DateTime<Utc>) {
        self.store
            .set(LAST_BACKUP_KEY, &when.to_rfc3339(), None);
    }

    /// The last successful backup time, if any
    pub fn last_backup_time(&self) -> Option<DateTime<Utc>> {
        self.store
            .get(LAST_BACKUP_KEY)
            .and_then(|s| DateTime::parse_from_rfc3339(&s).ok())
            .map(|dt| dt.with_timezone(&Utc))
    }
}
