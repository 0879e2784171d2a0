//! Ordered safety and integrity checks over a finished archive
//!
//! `ArtifactValidator` runs a fixed chain of checks and stops at the
//! first fault. Faults carry a structured severity; the manifest check
//! reports checksum problems as integrity errors instead, and is skipped
//! with a logged warning when memory headroom is too small to hash the
//! whole archive.

use std::collections::HashSet;
use std::fs::{self, File};
use std::io;
use std::path::Path;

use log::warn;
use sha2::{Digest, Sha256};
use zip::ZipArchive;

use crate::checksum::ChecksumManifest;
use crate::error::{BackupError, BackupResult, ValidationFault};
use crate::resource::{ResourceGovernor, MANIFEST_MEMORY_THRESHOLD_MB};
use crate::scanner::{is_dangerous_ext, is_dangerous_file};

/// Smallest plausible complete archive
pub const MIN_ARCHIVE_SIZE: u64 = 20 * 1024 * 1024;

/// Largest acceptable archive before it counts as runaway
pub const MAX_ARCHIVE_SIZE: u64 = 1024 * 1024 * 1024;

/// Directory names whose contents are third-party and expected to differ
/// from the platform manifest
const THIRD_PARTY_DIRS: &[&str] = &["themes", "plugins"];

/// Result of running the validation chain.
///
/// Checks that ran and passed are recorded by name; the first fault, if
/// any, ends the chain.
#[derive(Debug, Default)]
pub struct ValidationOutcome {
    passed: Vec<&'static str>,
    fault: Option<ValidationFault>,
}

impl ValidationOutcome {
    /// Whether every executed check passed
    pub fn is_valid(&self) -> bool {
        self.fault.is_none()
    }

    /// The fault that stopped the chain, if any
    pub fn fault(&self) -> Option<&ValidationFault> {
        self.fault.as_ref()
    }

    /// Names of the checks that passed, in execution order
    pub fn passed_checks(&self) -> &[&'static str] {
        &self.passed
    }

    /// Convert into a `BackupResult`, consuming the fault
    pub fn into_result(self) -> BackupResult<()> {
        match self.fault {
            Some(fault) => Err(fault.into()),
            None => Ok(()),
        }
    }

    fn pass(&mut self, check: &'static str) {
        self.passed.push(check);
    }
}

/// Fixed-order validator for produced backup artifacts
pub struct ArtifactValidator<'a> {
    governor: &'a ResourceGovernor,
    /// Known-good hashes, when the checksum service had a manifest
    manifest: Option<&'a ChecksumManifest>,
    /// Live tree the manifest paths are resolved against
    source_root: Option<&'a Path>,
    min_size: u64,
    max_size: u64,
}

impl<'a> ArtifactValidator<'a> {
    pub fn new(governor: &'a ResourceGovernor) -> Self {
        Self {
            governor,
            manifest: None,
            source_root: None,
            min_size: MIN_ARCHIVE_SIZE,
            max_size: MAX_ARCHIVE_SIZE,
        }
    }

    /// Enable the manifest check against `source_root`
    pub fn with_manifest(mut self, manifest: &'a ChecksumManifest, source_root: &'a Path) -> Self {
        self.manifest = Some(manifest);
        self.source_root = Some(source_root);
        self
    }

    /// Override the acceptable size window
    pub fn with_size_bounds(mut self, min_size: u64, max_size: u64) -> Self {
        self.min_size = min_size;
        self.max_size = max_size;
        self
    }

    /// Run the full chain against `artifact`, stopping at the first fault.
    ///
    /// I/O and checksum problems come back as hard errors; check failures
    /// land in the outcome as the terminating fault.
    pub fn validate(&self, artifact: &Path) -> BackupResult<ValidationOutcome> {
        let mut outcome = ValidationOutcome::default();

        // 1. Path names an existing regular file.
        if artifact.as_os_str().is_empty() {
            outcome.fault = Some(ValidationFault::fatal("no artifact path was provided"));
            return Ok(outcome);
        }
        let metadata = match fs::metadata(artifact) {
            Ok(m) if m.is_file() => m,
            _ => {
                outcome.fault = Some(ValidationFault::fatal(format!(
                    "artifact {} does not exist or is not a regular file",
                    artifact.display()
                )));
                return Ok(outcome);
            }
        };
        outcome.pass("artifact-exists");

        // 2. File is readable.
        if File::open(artifact).is_err() {
            outcome.fault = Some(ValidationFault::fatal(format!(
                "artifact {} is not readable",
                artifact.display()
            )));
            return Ok(outcome);
        }
        outcome.pass("readable");

        // 3. The artifact itself must never be an executable payload.
        if is_dangerous_file(artifact) {
            outcome.fault = Some(ValidationFault::danger(format!(
                "artifact {} is an executable or has a dangerous extension",
                artifact.display()
            )));
            return Ok(outcome);
        }
        outcome.pass("not-executable");

        // 4. Extension should be .zip.
        let is_zip = artifact
            .extension()
            .and_then(|e| e.to_str())
            .map(|e| e.eq_ignore_ascii_case("zip"))
            .unwrap_or(false);
        if !is_zip {
            outcome.fault = Some(ValidationFault::warning(format!(
                "artifact {} does not have a .zip extension",
                artifact.display()
            )));
            return Ok(outcome);
        }
        outcome.pass("zip-extension");

        // 5. Size window. Undersized means an incomplete archive, oversized
        //    a runaway one.
        let size = metadata.len();
        if size < self.min_size {
            outcome.fault = Some(ValidationFault::fatal(format!(
                "artifact is {} bytes, below the {} byte minimum; the archive looks incomplete",
                size, self.min_size
            )));
            return Ok(outcome);
        }
        if size > self.max_size {
            outcome.fault = Some(ValidationFault::fatal(format!(
                "artifact is {} bytes, above the {} byte maximum",
                size, self.max_size
            )));
            return Ok(outcome);
        }
        outcome.pass("size-bounds");

        // 6. The archive opens cleanly.
        let file = File::open(artifact)
            .map_err(|e| BackupError::Io(format!("Failed to reopen artifact: {}", e)))?;
        let mut archive = match ZipArchive::new(file) {
            Ok(archive) => archive,
            Err(e) => {
                outcome.fault = Some(ValidationFault::fatal(format!(
                    "artifact is not a readable zip archive: {}",
                    e
                )));
                return Ok(outcome);
            }
        };
        outcome.pass("opens-cleanly");

        // 7. Entry count > 0.
        if archive.is_empty() {
            outcome.fault = Some(ValidationFault::fatal("artifact contains no entries"));
            return Ok(outcome);
        }
        outcome.pass("non-empty");

        // 8. Manifest check, when a manifest is present and hashing the
        //    archive fits in the memory budget.
        if let (Some(manifest), Some(source_root)) = (self.manifest, self.source_root) {
            if self.governor.is_enough_memory(MANIFEST_MEMORY_THRESHOLD_MB) {
                self.verify_manifest(&mut archive, manifest, source_root)?;
                outcome.pass("manifest");
            } else {
                warn!(
                    "skipping checksum verification: less than {} MiB of memory headroom",
                    MANIFEST_MEMORY_THRESHOLD_MB
                );
            }
        }

        // 9. No entry may carry a dangerous extension, even if everything
        //    above passed.
        let dangerous: Vec<String> = archive
            .file_names()
            .filter(|name| is_dangerous_ext(name))
            .map(String::from)
            .collect();
        if !dangerous.is_empty() {
            outcome.fault = Some(ValidationFault::danger(format!(
                "archive contains dangerous entries: {}",
                dangerous.join(", ")
            )));
            return Ok(outcome);
        }
        outcome.pass("entry-safety");

        Ok(outcome)
    }

    /// Compare archive contents against the known-good manifest.
    ///
    /// Manifest paths absent from the live tree are tolerated (an admin may
    /// have removed them); third-party theme/plugin paths are exempt from
    /// hash comparison. Missing paths are reported together, then
    /// mismatches, each with expected and actual hashes.
    fn verify_manifest(
        &self,
        archive: &mut ZipArchive<File>,
        manifest: &ChecksumManifest,
        source_root: &Path,
    ) -> BackupResult<()> {
        let entry_names: HashSet<String> = archive
            .file_names()
            .map(normalize_entry_path)
            .collect();

        let mut missing = Vec::new();
        for path in manifest.checksums.keys() {
            let normalized = normalize_entry_path(path);
            if !source_root.join(&normalized).is_file() {
                continue;
            }
            if !entry_names.contains(&normalized) {
                missing.push(normalized);
            }
        }
        if !missing.is_empty() {
            return Err(BackupError::Integrity(format!(
                "archive is missing manifest entries: {}",
                missing.join(", ")
            )));
        }

        let mut mismatches = Vec::new();
        for (path, expected) in &manifest.checksums {
            let normalized = normalize_entry_path(path);
            if is_third_party_path(&normalized)
                || !source_root.join(&normalized).is_file()
                || !entry_names.contains(&normalized)
            {
                continue;
            }
            let mut entry = archive
                .by_name(&normalized)
                .map_err(|e| BackupError::Io(format!("Failed to read entry {}: {}", normalized, e)))?;
            let mut hasher = Sha256::new();
            io::copy(&mut entry, &mut hasher)
                .map_err(|e| BackupError::Io(format!("Failed to hash entry {}: {}", normalized, e)))?;
            let actual: String = hasher
                .finalize()
                .iter()
                .map(|b| format!("{:02x}", b))
                .collect();
            if !actual.eq_ignore_ascii_case(expected) {
                mismatches.push(format!(
                    "{} (expected {}, actual {})",
                    normalized, expected, actual
                ));
            }
        }
        if !mismatches.is_empty() {
            return Err(BackupError::Integrity(format!(
                "checksum mismatches: {}",
                mismatches.join("; ")
            )));
        }

        Ok(())
    }
}

/// Collapse duplicate separators and normalize backslashes
fn normalize_entry_path(name: &str) -> String {
    let mut out = String::with_capacity(name.len());
    let mut prev_sep = false;
    for c in name.chars() {
        let is_sep = c == '/' || c == '\\';
        if is_sep {
            if !prev_sep {
                out.push('/');
            }
        } else {
            out.push(c);
        }
        prev_sep = is_sep;
    }
    out
}

/// Whether a normalized path sits under a theme/plugin directory
fn is_third_party_path(path: &str) -> bool {
    path.split('/')
        .any(|component| THIRD_PARTY_DIRS.contains(&component))
}
