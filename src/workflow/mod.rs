//! Multi-phase backup workflow
//!
//! Each step is one externally-triggered call; continuity across calls is
//! carried entirely by the single-slot job ticket. Every step gates on
//! memory headroom first, and any failure marks the active job FAILED so
//! the caller restarts from housekeeping. Nothing here retries.

use std::fs::{self, File};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use log::{error, info};

use crate::archive::{ArchiveBuilder, RetentionManager};
use crate::checksum::ChecksumManifest;
use crate::config::{BackupPaths, Settings};
use crate::error::{BackupError, BackupResult};
use crate::resource::{ResourceGovernor, STEP_MEMORY_THRESHOLD_MB};
use crate::scanner::ExclusionPolicy;
use crate::storage::{StorageAdapter, StorageCredential};
use crate::store::{ArchiveJob, HistoryLog, JobState, KvStore, TicketStore};
use crate::validate::{ArtifactValidator, MAX_ARCHIVE_SIZE, MIN_ARCHIVE_SIZE};

/// Produces the phase-2 secondary payload (e.g. a database export).
///
/// The external export mechanism is out of scope; implementations only
/// have to drop a file into `work_dir` and hand back its path.
pub trait ExportSource {
    fn produce(&self, work_dir: &Path) -> BackupResult<PathBuf>;
}

/// Everything a phase needs, threaded explicitly instead of read from
/// global state.
#[derive(Debug, Clone)]
pub struct JobContext {
    /// Root of the tree being backed up
    pub source_root: PathBuf,
    /// Temp directory and settings locations
    pub paths: BackupPaths,
    /// Exclusion rules applied while archiving
    pub policy: ExclusionPolicy,
    /// Memory and disk budget
    pub governor: ResourceGovernor,
    /// Storage backend, if one is configured
    pub storage: Option<StorageCredential>,
    /// Known-good checksums for validation, if available
    pub manifest: Option<ChecksumManifest>,
    /// Housekeeping deletes artifacts older than this
    pub retention_max_age_seconds: u64,
    /// Lifetime of a published job ticket
    pub ticket_ttl: Duration,
    /// Acceptable artifact size window
    pub min_artifact_size: u64,
    pub max_artifact_size: u64,
}

impl JobContext {
    /// Build a context from persisted settings
    pub fn from_settings(
        settings: &Settings,
        paths: BackupPaths,
        source_root: PathBuf,
    ) -> BackupResult<Self> {
        Ok(Self {
            source_root,
            paths,
            policy: ExclusionPolicy::with_custom_exclusions(settings.custom_exclusions.clone()),
            governor: ResourceGovernor::new(&settings.memory_limit)?,
            storage: settings.storage.clone(),
            manifest: None,
            retention_max_age_seconds: settings.retention_max_age_seconds,
            ticket_ttl: Duration::from_secs(settings.ticket_ttl_seconds),
            min_artifact_size: MIN_ARCHIVE_SIZE,
            max_artifact_size: MAX_ARCHIVE_SIZE,
        })
    }

    /// Attach a checksum manifest for archive validation
    pub fn with_manifest(mut self, manifest: ChecksumManifest) -> Self {
        self.manifest = Some(manifest);
        self
    }

    fn retention(&self) -> RetentionManager {
        RetentionManager::new(self.paths.temp_dir().clone())
    }
}

/// Drives the step0..step3 state machine over a job context
pub struct PhaseOrchestrator {
    context: JobContext,
    tickets: TicketStore,
    history: HistoryLog,
}

impl PhaseOrchestrator {
    pub fn new(context: JobContext, store: Arc<dyn KvStore>) -> Self {
        Self {
            context,
            tickets: TicketStore::new(Arc::clone(&store)),
            history: HistoryLog::new(store),
        }
    }

    pub fn context(&self) -> &JobContext {
        &self.context
    }

    pub fn history(&self) -> &HistoryLog {
        &self.history
    }

    pub fn tickets(&self) -> &TicketStore {
        &self.tickets
    }

    /// Step 0, housekeeping: delete aged temp artifacts and purge any
    /// stale ticket. Returns the deleted artifact paths.
    pub fn step0(&self) -> BackupResult<Vec<PathBuf>> {
        self.context.paths.ensure_directories()?;
        let deleted = self
            .context
            .retention()
            .cleanup(self.context.retention_max_age_seconds)?;
        // Resolving the ticket purges it if it has expired.
        let _ = self.tickets.get()?;
        info!("housekeeping removed {} stale artifact(s)", deleted.len());
        Ok(deleted)
    }

    /// Step 1: build the archive, validate it, publish a job ticket.
    ///
    /// A failure here never touches a previously published ticket; the
    /// new job simply never comes into existence.
    pub fn step1(&self) -> BackupResult<ArchiveJob> {
        self.context.governor.require_memory(STEP_MEMORY_THRESHOLD_MB)?;
        self.context.paths.ensure_directories()?;

        let name = ArchiveBuilder::generate_artifact_name();
        let dest = self.context.paths.temp_dir().join(&name);
        let builder = ArchiveBuilder::new(
            self.context.policy.clone(),
            self.context.governor.clone(),
        );
        builder.build(&self.context.source_root, &dest)?;

        let mut validator = ArtifactValidator::new(&self.context.governor)
            .with_size_bounds(self.context.min_artifact_size, self.context.max_artifact_size);
        if let Some(manifest) = &self.context.manifest {
            validator = validator.with_manifest(manifest, &self.context.source_root);
        }
        let outcome = validator.validate(&dest).map_err(|e| {
            let _ = fs::remove_file(&dest);
            e
        })?;
        if !outcome.is_valid() {
            let _ = fs::remove_file(&dest);
            outcome.into_result()?;
        }

        let job = ArchiveJob::new(
            self.context.source_root.clone(),
            dest,
            self.context.ticket_ttl,
        );
        self.tickets.put(&job)?;
        info!("published backup ticket {} for {}", job.ticket_id, name);
        Ok(job)
    }

    /// Step 2: produce the secondary payload and append it to the archive
    pub fn step2(&self, export: &dyn ExportSource) -> BackupResult<ArchiveJob> {
        self.context.governor.require_memory(STEP_MEMORY_THRESHOLD_MB)?;
        let job = self.resolve_active()?;
        let ticket_id = job.ticket_id;
        let result = self.append_export(job, export);
        self.fail_on_error(ticket_id, result)
    }

    fn append_export(&self, mut job: ArchiveJob, export: &dyn ExportSource) -> BackupResult<ArchiveJob> {
        let payload = export.produce(self.context.paths.temp_dir())?;
        let builder = ArchiveBuilder::new(
            self.context.policy.clone(),
            self.context.governor.clone(),
        );
        builder.append_file(&job.temp_artifact_path, &payload)?;
        let _ = fs::remove_file(&payload);

        job.state = JobState::Exported;
        self.tickets.put(&job)?;
        info!("appended export payload to ticket {}", job.ticket_id);
        Ok(job)
    }

    /// Step 3: upload the artifact via the configured storage backend,
    /// record history, and consume the ticket.
    pub fn step3(&self) -> BackupResult<ArchiveJob> {
        self.context.governor.require_memory(STEP_MEMORY_THRESHOLD_MB)?;
        let job = self.resolve_active()?;
        let ticket_id = job.ticket_id;
        let result = self.connect_and_upload(job);
        self.fail_on_error(ticket_id, result)
    }

    fn connect_and_upload(&self, job: ArchiveJob) -> BackupResult<ArchiveJob> {
        let credential = self.context.storage.as_ref().ok_or_else(|| {
            BackupError::Config("No storage backend is configured".into())
        })?;
        let mut adapter = credential.connect()?;
        self.upload(job, adapter.as_mut())
    }

    /// Step 3 against an already-resolved adapter
    pub fn step3_with_adapter(&self, adapter: &mut dyn StorageAdapter) -> BackupResult<ArchiveJob> {
        self.context.governor.require_memory(STEP_MEMORY_THRESHOLD_MB)?;
        let job = self.resolve_active()?;
        let ticket_id = job.ticket_id;
        let result = self.upload(job, adapter);
        self.fail_on_error(ticket_id, result)
    }

    fn upload(&self, mut job: ArchiveJob, adapter: &mut dyn StorageAdapter) -> BackupResult<ArchiveJob> {
        let name = job
            .temp_artifact_path
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .ok_or_else(|| BackupError::Io("Ticket artifact has no file name".into()))?;
        let mut file = File::open(&job.temp_artifact_path)
            .map_err(|e| BackupError::Io(format!("Failed to open artifact for upload: {}", e)))?;

        adapter.upload_stream(&mut file, &name)?;

        self.history
            .append(format!("Backup uploaded to remote storage ({})", name))?;
        self.history.set_last_backup_time(Utc::now());
        self.context.retention().remove(&job.temp_artifact_path)?;
        self.tickets.expire();

        job.state = JobState::Uploaded;
        info!("backup {} uploaded and consumed", job.ticket_id);
        Ok(job)
    }

    /// The active job if a usable ticket exists and its artifact is still
    /// on disk, otherwise a fresh step-1 build. Used by on-demand
    /// downloads.
    pub fn resolve_or_build(&self) -> BackupResult<ArchiveJob> {
        match self.resolve_active() {
            Ok(job) if job.temp_artifact_path.is_file() => Ok(job),
            Ok(_) => {
                // The ticket outlived its artifact; rebuild instead of
                // surfacing an open error at download time.
                self.tickets.expire();
                self.step1()
            }
            Err(BackupError::NoActiveTicket(_)) => self.step1(),
            Err(e) => Err(e),
        }
    }

    /// The active, unexpired, non-failed ticket
    fn resolve_active(&self) -> BackupResult<ArchiveJob> {
        let job = self.tickets.get()?.ok_or_else(|| {
            BackupError::NoActiveTicket(
                "the ticket is missing or expired; restart from step 1".into(),
            )
        })?;
        if job.state == JobState::Failed {
            return Err(BackupError::NoActiveTicket(
                "the previous job failed; restart from step 1".into(),
            ));
        }
        Ok(job)
    }

    /// Mark the job a failing step was operating on FAILED.
    ///
    /// Only that job: a failure elsewhere must not discard an unrelated
    /// in-flight ticket.
    fn fail_on_error<T>(&self, ticket_id: uuid::Uuid, result: BackupResult<T>) -> BackupResult<T> {
        if result.is_err() {
            if let Ok(Some(mut job)) = self.tickets.get() {
                if job.ticket_id == ticket_id {
                    job.state = JobState::Failed;
                    let _ = self.tickets.put(&job);
                }
            }
        }
        result
    }
}

/// Turn a step failure into the message shown to the caller.
///
/// Warning and danger faults carry security context the operator must
/// see and are forwarded verbatim; everything else is logged in full and
/// replaced by a generic message.
pub fn surface_failure(err: &BackupError) -> String {
    if let Some(fault) = err.fault() {
        if fault.is_surfaced() {
            return fault.to_string();
        }
    }
    error!("backup step failed: {}", err);
    "The backup step failed. Details were written to the log.".to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ValidationFault;
    use crate::store::MemoryKvStore;
    use std::io::{Read, Write};
    use std::thread::sleep;
    use tempfile::TempDir;

    struct SqlExport;

    impl ExportSource for SqlExport {
        fn produce(&self, work_dir: &Path) -> BackupResult<PathBuf> {
            let path = work_dir.join("database.sql");
            fs::write(&path, b"CREATE TABLE t (id INT);")?;
            Ok(path)
        }
    }

    /// Adapter that records what was uploaded
    #[derive(Default)]
    struct RecordingAdapter {
        uploads: Vec<(String, usize)>,
    }

    impl StorageAdapter for RecordingAdapter {
        fn upload_stream(&mut self, stream: &mut dyn Read, destination: &str) -> BackupResult<bool> {
            let mut bytes = Vec::new();
            stream
                .read_to_end(&mut bytes)
                .map_err(|e| BackupError::Upload(e.to_string()))?;
            self.uploads.push((destination.to_string(), bytes.len()));
            Ok(true)
        }
    }

    fn fixture() -> (TempDir, TempDir, PhaseOrchestrator) {
        let source = TempDir::new().unwrap();
        let mut f = fs::File::create(source.path().join("index.html")).unwrap();
        f.write_all(b"<html>site</html>").unwrap();
        fs::create_dir(source.path().join("uploads")).unwrap();

        let work = TempDir::new().unwrap();
        let context = JobContext {
            source_root: source.path().to_path_buf(),
            paths: BackupPaths::with_temp_dir(work.path().to_path_buf()),
            policy: ExclusionPolicy::default(),
            governor: ResourceGovernor::new("4G").unwrap(),
            storage: None,
            manifest: None,
            retention_max_age_seconds: 1800,
            ticket_ttl: Duration::from_secs(30),
            min_artifact_size: 0,
            max_artifact_size: MAX_ARCHIVE_SIZE,
        };
        let orchestrator = PhaseOrchestrator::new(context, Arc::new(MemoryKvStore::new()));
        (source, work, orchestrator)
    }

    #[test]
    fn test_step1_publishes_ticket() {
        let (_source, _work, orchestrator) = fixture();
        let job = orchestrator.step1().unwrap();
        assert_eq!(job.state, JobState::Archived);
        assert!(job.temp_artifact_path.exists());

        let active = orchestrator.tickets().get().unwrap().unwrap();
        assert_eq!(active.ticket_id, job.ticket_id);
    }

    #[test]
    fn test_step2_appends_payload() {
        let (_source, _work, orchestrator) = fixture();
        orchestrator.step1().unwrap();
        let job = orchestrator.step2(&SqlExport).unwrap();
        assert_eq!(job.state, JobState::Exported);

        let file = File::open(&job.temp_artifact_path).unwrap();
        let mut archive = zip::ZipArchive::new(file).unwrap();
        assert!(archive.by_name("database.sql").is_ok());
    }

    #[test]
    fn test_step3_uploads_and_consumes() {
        let (_source, _work, orchestrator) = fixture();
        let job = orchestrator.step1().unwrap();
        let artifact = job.temp_artifact_path.clone();

        let mut adapter = RecordingAdapter::default();
        let done = orchestrator.step3_with_adapter(&mut adapter).unwrap();

        assert_eq!(done.state, JobState::Uploaded);
        assert_eq!(adapter.uploads.len(), 1);
        assert!(adapter.uploads[0].1 > 0);
        assert!(!artifact.exists());
        assert!(orchestrator.tickets().get().unwrap().is_none());

        let history = orchestrator.history().list().unwrap();
        assert_eq!(history.len(), 1);
        assert!(orchestrator.history().last_backup_time().is_some());
    }

    #[test]
    fn test_step3_after_ttl_expiry_needs_fresh_build() {
        let (_source, _work, mut orchestrator) = fixture();
        orchestrator.context.ticket_ttl = Duration::from_millis(20);
        orchestrator.step1().unwrap();
        sleep(Duration::from_millis(40));

        let mut adapter = RecordingAdapter::default();
        let err = orchestrator.step3_with_adapter(&mut adapter).unwrap_err();
        assert!(matches!(err, BackupError::NoActiveTicket(_)));
        assert!(adapter.uploads.is_empty());
    }

    #[test]
    fn test_step3_without_credential_fails_and_marks_job() {
        let (_source, _work, orchestrator) = fixture();
        orchestrator.step1().unwrap();

        let err = orchestrator.step3().unwrap_err();
        assert!(matches!(err, BackupError::Config(_)));

        // The failed job is unusable; a retry is rejected too.
        let mut adapter = RecordingAdapter::default();
        let retry = orchestrator.step3_with_adapter(&mut adapter).unwrap_err();
        assert!(matches!(retry, BackupError::NoActiveTicket(_)));
    }

    #[test]
    fn test_step0_housekeeping_runs_on_empty_dir() {
        let (_source, _work, orchestrator) = fixture();
        assert!(orchestrator.step0().unwrap().is_empty());
    }

    #[test]
    fn test_resolve_or_build_reuses_valid_ticket() {
        let (_source, _work, orchestrator) = fixture();
        let first = orchestrator.step1().unwrap();
        let resolved = orchestrator.resolve_or_build().unwrap();
        assert_eq!(resolved.ticket_id, first.ticket_id);
    }

    #[test]
    fn test_resolve_or_build_builds_when_absent() {
        let (_source, _work, orchestrator) = fixture();
        let job = orchestrator.resolve_or_build().unwrap();
        assert_eq!(job.state, JobState::Archived);
        assert!(job.temp_artifact_path.exists());
    }

    #[test]
    fn test_resolve_or_build_rebuilds_when_artifact_is_gone() {
        let (_source, _work, orchestrator) = fixture();
        let first = orchestrator.step1().unwrap();
        fs::remove_file(&first.temp_artifact_path).unwrap();

        let rebuilt = orchestrator.resolve_or_build().unwrap();
        assert_ne!(rebuilt.ticket_id, first.ticket_id);
        assert!(rebuilt.temp_artifact_path.exists());
    }

    #[test]
    fn test_step1_failure_leaves_prior_ticket_usable() {
        let (_source, _work, mut orchestrator) = fixture();
        let first = orchestrator.step1().unwrap();

        orchestrator.context.source_root = PathBuf::from("/nonexistent/source/tree");
        assert!(orchestrator.step1().is_err());

        let active = orchestrator.tickets().get().unwrap().unwrap();
        assert_eq!(active.ticket_id, first.ticket_id);
        assert_eq!(active.state, JobState::Archived);

        let mut adapter = RecordingAdapter::default();
        let done = orchestrator.step3_with_adapter(&mut adapter).unwrap();
        assert_eq!(done.ticket_id, first.ticket_id);
    }

    #[test]
    fn test_surface_failure_forwards_danger_only() {
        let danger: BackupError = ValidationFault::danger("the artifact is an executable").into();
        assert_eq!(
            surface_failure(&danger),
            "DANGER: the artifact is an executable"
        );

        let generic = BackupError::Io("disk on fire".into());
        let message = surface_failure(&generic);
        assert!(!message.contains("disk on fire"));
    }
}
