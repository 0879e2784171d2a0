//! RPC-style surface over the workflow
//!
//! Responses follow a `{success, data}` JSON envelope; the host layer
//! owns authorization and anti-forgery and is not modeled here. The
//! download endpoint streams binary in 1 MiB chunks instead of the
//! envelope.

use std::fs::File;
use std::io::Read;

use serde::Serialize;
use serde_json::{json, Value};

use crate::error::{BackupError, BackupResult};
use crate::storage::UPLOAD_CHUNK_SIZE;
use crate::store::ArchiveJob;
use crate::workflow::{surface_failure, ExportSource, PhaseOrchestrator};

/// The `{success, data}` response envelope
#[derive(Debug, Serialize)]
pub struct ApiResponse {
    pub success: bool,
    pub data: Value,
}

impl ApiResponse {
    fn ok(data: Value) -> Self {
        Self {
            success: true,
            data,
        }
    }

    fn fail(message: String) -> Self {
        Self {
            success: false,
            data: json!({ "message": message }),
        }
    }
}

/// Binary response for artifact downloads, chunked to bound memory
pub struct DownloadStream {
    /// Suggested filename for the Content-Disposition header
    pub filename: String,
    /// Always `application/zip`
    pub content_type: &'static str,
    /// Artifact size in bytes
    pub content_length: u64,
    file: File,
}

impl DownloadStream {
    /// Consume the stream as an iterator of at-most-1-MiB chunks
    pub fn chunks(self) -> DownloadChunks {
        DownloadChunks { file: self.file }
    }
}

pub struct DownloadChunks {
    file: File,
}

impl Iterator for DownloadChunks {
    type Item = BackupResult<Vec<u8>>;

    fn next(&mut self) -> Option<Self::Item> {
        let mut buffer = vec![0u8; UPLOAD_CHUNK_SIZE];
        match self.file.read(&mut buffer) {
            Ok(0) => None,
            Ok(n) => {
                buffer.truncate(n);
                Some(Ok(buffer))
            }
            Err(e) => Some(Err(BackupError::Io(format!(
                "Failed to read artifact chunk: {}",
                e
            )))),
        }
    }
}

/// Request handlers wrapping the orchestrator
pub struct BackupApi {
    orchestrator: PhaseOrchestrator,
}

impl BackupApi {
    pub fn new(orchestrator: PhaseOrchestrator) -> Self {
        Self { orchestrator }
    }

    pub fn orchestrator(&self) -> &PhaseOrchestrator {
        &self.orchestrator
    }

    /// Housekeeping: purge aged artifacts and stale tickets
    pub fn step0(&self) -> ApiResponse {
        match self.orchestrator.step0() {
            Ok(deleted) => ApiResponse::ok(json!({
                "message": "Housekeeping complete",
                "deleted": deleted.len(),
            })),
            Err(e) => ApiResponse::fail(surface_failure(&e)),
        }
    }

    /// Build and validate the archive, publish the ticket
    pub fn step1(&self) -> ApiResponse {
        match self.orchestrator.step1() {
            Ok(job) => ApiResponse::ok(json!({
                "message": "Archive built and validated",
                "ticket_id": job.ticket_id,
                "artifact": artifact_name(&job),
            })),
            Err(e) => ApiResponse::fail(surface_failure(&e)),
        }
    }

    /// Append the secondary payload to the active archive
    pub fn step2(&self, export: &dyn ExportSource) -> ApiResponse {
        match self.orchestrator.step2(export) {
            Ok(job) => ApiResponse::ok(json!({
                "message": "Export appended to archive",
                "ticket_id": job.ticket_id,
            })),
            Err(e) => ApiResponse::fail(surface_failure(&e)),
        }
    }

    /// Upload the artifact and consume the ticket
    pub fn step3(&self) -> ApiResponse {
        match self.orchestrator.step3() {
            Ok(job) => ApiResponse::ok(json!({
                "message": "Backup uploaded",
                "ticket_id": job.ticket_id,
            })),
            Err(e) => ApiResponse::fail(surface_failure(&e)),
        }
    }

    /// Stream the current artifact, building a fresh one if no valid
    /// ticket exists.
    pub fn download_artifact(&self) -> BackupResult<DownloadStream> {
        let job = self.orchestrator.resolve_or_build()?;
        let filename = artifact_name(&job).ok_or_else(|| {
            BackupError::Io("Ticket artifact has no file name".into())
        })?;
        let file = File::open(&job.temp_artifact_path)
            .map_err(|e| BackupError::Io(format!("Failed to open artifact: {}", e)))?;
        let content_length = file
            .metadata()
            .map_err(|e| BackupError::Io(format!("Failed to stat artifact: {}", e)))?
            .len();

        Ok(DownloadStream {
            filename,
            content_type: "application/zip",
            content_length,
            file,
        })
    }

    pub fn list_history(&self) -> ApiResponse {
        match self.orchestrator.history().list() {
            Ok(entries) => ApiResponse::ok(json!({
                "entries": entries,
                "last_backup_time": self.orchestrator.history().last_backup_time(),
            })),
            Err(e) => ApiResponse::fail(surface_failure(&e)),
        }
    }

    pub fn clear_history(&self) -> ApiResponse {
        self.orchestrator.history().clear();
        ApiResponse::ok(json!({ "message": "History cleared" }))
    }
}

fn artifact_name(job: &ArchiveJob) -> Option<String> {
    job.temp_artifact_path
        .file_name()
        .map(|n| n.to_string_lossy().to_string())
}
