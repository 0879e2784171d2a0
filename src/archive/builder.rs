//! Streaming directory-to-archive assembly under a resource budget
//!
//! The builder walks the source tree one directory at a time and streams
//! each file into the zip writer, so the memory footprint stays roughly
//! constant regardless of total tree size. Before any archive handle is
//! opened the tree size is estimated with an early-exit walk and checked
//! against a ceiling derived from both disk space and memory pressure.

use std::fs::{self, File, OpenOptions};
use std::io;
use std::path::Path;

use chrono::Utc;
use log::debug;
use zip::write::SimpleFileOptions;
use zip::ZipWriter;

use super::{ARTIFACT_PREFIX, ARTIFACT_TIMESTAMP_FORMAT};
use crate::error::{BackupError, BackupResult};
use crate::resource::ResourceGovernor;
use crate::scanner::{ExclusionPolicy, PathScanner};

/// Default archive size ceiling: 5 GiB
pub const DEFAULT_SIZE_LIMIT: u64 = 5 * 1024 * 1024 * 1024;

/// Practical minimum the ceiling never shrinks below: 512 MiB
pub const MIN_SIZE_LIMIT: u64 = 512 * 1024 * 1024;

/// Assembles a source tree into a single zip artifact
pub struct ArchiveBuilder {
    policy: ExclusionPolicy,
    governor: ResourceGovernor,
}

impl ArchiveBuilder {
    /// Create a builder with an exclusion policy and resource governor
    pub fn new(policy: ExclusionPolicy, governor: ResourceGovernor) -> Self {
        Self { policy, governor }
    }

    /// Deterministic artifact name: `<prefix><YYYY-MM-DD-HH-MM-SS>.zip`.
    ///
    /// Second granularity: two builds within the same second collide by
    /// design, so callers must serialize builds.
    pub fn generate_artifact_name() -> String {
        format!(
            "{}{}.zip",
            ARTIFACT_PREFIX,
            Utc::now().format(ARTIFACT_TIMESTAMP_FORMAT)
        )
    }

    /// Effective archive size ceiling for this host.
    ///
    /// Starts from [`DEFAULT_SIZE_LIMIT`] and shrinks proportionally once
    /// available memory drops below half the configured ceiling, clamped
    /// to [`MIN_SIZE_LIMIT`]. Ties archive size to memory pressure, not
    /// just disk space.
    pub fn effective_size_limit(&self) -> u64 {
        let half_ceiling = self.governor.memory_limit() / 2;
        let available = self.governor.available_memory();
        if half_ceiling == 0 || available >= half_ceiling {
            return DEFAULT_SIZE_LIMIT;
        }
        let scaled = (DEFAULT_SIZE_LIMIT as u128 * available as u128 / half_ceiling as u128) as u64;
        scaled.max(MIN_SIZE_LIMIT)
    }

    /// Estimate the source tree size, stopping as soon as the running
    /// total exceeds `threshold`. Avoids paying full-tree-scan cost just
    /// to reject an oversized tree.
    pub fn estimate_tree_size(&self, root: &Path, threshold: u64) -> BackupResult<u64> {
        let mut total: u64 = 0;
        for path in PathScanner::new(root)
            .map_err(|e| BackupError::Io(format!("Failed to scan {}: {}", root.display(), e)))?
        {
            let path = path.map_err(|e| BackupError::Io(e.to_string()))?;
            if path.is_file() {
                let len = fs::metadata(&path).map(|m| m.len()).unwrap_or(0);
                total = total.saturating_add(len);
                if total > threshold {
                    break;
                }
            }
        }
        Ok(total)
    }

    /// Build a zip archive of `source_root` at `dest_path`.
    ///
    /// Empty directories are added explicitly so the directory structure
    /// survives even with no files inside. Entry names are relative to
    /// the source root. Entries matched by the exclusion policy are
    /// skipped.
    pub fn build(&self, source_root: &Path, dest_path: &Path) -> BackupResult<()> {
        let dest_dir = dest_path.parent().unwrap_or(Path::new("."));
        let free_space = self.governor.free_disk_space(dest_dir)?;

        let size_limit = self.effective_size_limit().min(free_space);
        let estimated = self.estimate_tree_size(source_root, size_limit)?;
        if estimated > size_limit {
            return Err(BackupError::ResourceExhaustion(format!(
                "Source tree exceeds the size limit of {} bytes",
                size_limit
            )));
        }
        debug!(
            "building archive of {} (~{} bytes, limit {} bytes)",
            source_root.display(),
            estimated,
            size_limit
        );

        let file = File::create(dest_path)
            .map_err(|e| BackupError::Io(format!("Failed to create archive file: {}", e)))?;
        let mut writer = ZipWriter::new(file);

        // On any failure the writer is dropped here, releasing the handle.
        let result = self.add_directory(&mut writer, source_root, source_root);
        match result {
            Ok(()) => {
                writer
                    .finish()
                    .map_err(|e| BackupError::Io(format!("Failed to finalize archive: {}", e)))?;
                Ok(())
            }
            Err(e) => Err(e),
        }
    }

    /// Append a single file (by its basename) to an existing archive.
    /// Used for the phase-2 secondary payload.
    pub fn append_file(&self, archive_path: &Path, new_file: &Path) -> BackupResult<()> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .open(archive_path)
            .map_err(|e| BackupError::Io(format!("Failed to open archive: {}", e)))?;
        let mut writer = ZipWriter::new_append(file)
            .map_err(|e| BackupError::Io(format!("Failed to open archive for append: {}", e)))?;

        let name = new_file
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .ok_or_else(|| BackupError::Io("Payload file has no name".into()))?;

        writer.start_file(name, SimpleFileOptions::default())?;
        let mut source = File::open(new_file)
            .map_err(|e| BackupError::Io(format!("Failed to open payload file: {}", e)))?;
        io::copy(&mut source, &mut writer)
            .map_err(|e| BackupError::Io(format!("Failed to append payload: {}", e)))?;
        writer.finish()?;
        Ok(())
    }

    /// Recursively add one directory's children, then descend.
    ///
    /// Invariant: a directory's children are processed before its handle
    /// is released, so at most one handle per ancestor is open.
    fn add_directory(
        &self,
        writer: &mut ZipWriter<File>,
        dir: &Path,
        root: &Path,
    ) -> BackupResult<()> {
        let entries = fs::read_dir(dir).map_err(|e| {
            BackupError::Io(format!("Unable to open directory {}: {}", dir.display(), e))
        })?;

        for entry in entries {
            let entry = entry.map_err(|e| BackupError::Io(e.to_string()))?;
            let name = entry.file_name().to_string_lossy().to_string();
            if self.policy.is_excluded(&name) {
                continue;
            }

            let path = entry.path();
            let local = relative_entry_name(&path, root)?;

            if path.is_file() {
                writer.start_file(local, SimpleFileOptions::default())?;
                let mut source = File::open(&path)
                    .map_err(|e| BackupError::Io(format!("Failed to read {}: {}", path.display(), e)))?;
                io::copy(&mut source, writer)
                    .map_err(|e| BackupError::Io(format!("Failed to add {}: {}", path.display(), e)))?;
            } else if path.is_dir() {
                writer.add_directory(local, SimpleFileOptions::default())?;
                self.add_directory(writer, &path, root)?;
            }
        }

        Ok(())
    }
}

/// Archive entry name for `path`: relative to `root`, forward slashes
fn relative_entry_name(path: &Path, root: &Path) -> BackupResult<String> {
    let relative = path
        .strip_prefix(root)
        .map_err(|_| BackupError::Io(format!("{} is outside the source root", path.display())))?;
    Ok(relative.to_string_lossy().replace('\\', "/"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;
    use std::fs::File;
    use std::io::Write;
    use tempfile::TempDir;
    use zip::ZipArchive;

    fn governor() -> ResourceGovernor {
        ResourceGovernor::new("4G").unwrap()
    }

    fn write_file(path: &Path, contents: &[u8]) {
        let mut f = File::create(path).unwrap();
        f.write_all(contents).unwrap();
    }

    fn entry_names(archive_path: &Path) -> HashSet<String> {
        let file = File::open(archive_path).unwrap();
        let mut archive = ZipArchive::new(file).unwrap();
        (0..archive.len())
            .map(|i| archive.by_index(i).unwrap().name().to_string())
            .collect()
    }

    #[test]
    fn test_artifact_name_shape() {
        let name = ArchiveBuilder::generate_artifact_name();
        assert!(name.starts_with(ARTIFACT_PREFIX));
        assert!(name.ends_with(".zip"));
        // prefix + YYYY-MM-DD-HH-MM-SS + .zip
        assert_eq!(name.len(), ARTIFACT_PREFIX.len() + 19 + 4);
    }

    #[test]
    fn test_build_excludes_dangerous_and_custom() {
        let source = TempDir::new().unwrap();
        write_file(&source.path().join("index.html"), b"<html></html>");
        write_file(&source.path().join("data.json"), b"{}");
        write_file(&source.path().join("install.sh"), b"#!/bin/sh");
        write_file(&source.path().join("secrets.txt"), b"hunter2");

        let dest = TempDir::new().unwrap();
        let archive_path = dest.path().join("out.zip");

        let policy = ExclusionPolicy::with_custom_exclusions(["secrets.txt"]);
        let builder = ArchiveBuilder::new(policy, governor());
        builder.build(source.path(), &archive_path).unwrap();

        let names = entry_names(&archive_path);
        assert_eq!(names.len(), 2);
        assert!(names.contains("index.html"));
        assert!(names.contains("data.json"));
    }

    #[test]
    fn test_build_preserves_empty_directories() {
        let source = TempDir::new().unwrap();
        fs::create_dir(source.path().join("uploads")).unwrap();
        write_file(&source.path().join("index.html"), b"x");

        let dest = TempDir::new().unwrap();
        let archive_path = dest.path().join("out.zip");

        let builder = ArchiveBuilder::new(ExclusionPolicy::default(), governor());
        builder.build(source.path(), &archive_path).unwrap();

        let names = entry_names(&archive_path);
        assert!(names.iter().any(|n| n.trim_end_matches('/') == "uploads"));
    }

    #[test]
    fn test_build_relative_nested_paths() {
        let source = TempDir::new().unwrap();
        let nested = source.path().join("a").join("b");
        fs::create_dir_all(&nested).unwrap();
        write_file(&nested.join("deep.txt"), b"deep");

        let dest = TempDir::new().unwrap();
        let archive_path = dest.path().join("out.zip");

        let builder = ArchiveBuilder::new(ExclusionPolicy::default(), governor());
        builder.build(source.path(), &archive_path).unwrap();

        let names = entry_names(&archive_path);
        assert!(names.contains("a/b/deep.txt"));
    }

    #[test]
    fn test_estimate_early_exit() {
        let source = TempDir::new().unwrap();
        for i in 0..10 {
            write_file(&source.path().join(format!("f{}.dat", i)), &[0u8; 1000]);
        }

        let builder = ArchiveBuilder::new(ExclusionPolicy::default(), governor());
        // Threshold of 1500 bytes: the walk must stop early, well short
        // of the full 10,000.
        let estimated = builder.estimate_tree_size(source.path(), 1500).unwrap();
        assert!(estimated > 1500);
        assert!(estimated < 10_000);

        let full = builder.estimate_tree_size(source.path(), u64::MAX).unwrap();
        assert_eq!(full, 10_000);
    }

    #[test]
    fn test_effective_limit_defaults_without_pressure() {
        let builder = ArchiveBuilder::new(ExclusionPolicy::default(), governor());
        assert_eq!(builder.effective_size_limit(), DEFAULT_SIZE_LIMIT);
    }

    #[cfg(target_os = "linux")]
    #[test]
    fn test_effective_limit_clamps_under_pressure() {
        // A 1K ceiling means available memory is far below 50% of any
        // real usage; the limit must clamp to the floor, not zero.
        let builder = ArchiveBuilder::new(
            ExclusionPolicy::default(),
            ResourceGovernor::new("1K").unwrap(),
        );
        assert_eq!(builder.effective_size_limit(), MIN_SIZE_LIMIT);
    }

    #[test]
    fn test_append_file() {
        let source = TempDir::new().unwrap();
        write_file(&source.path().join("index.html"), b"x");

        let dest = TempDir::new().unwrap();
        let archive_path = dest.path().join("out.zip");

        let builder = ArchiveBuilder::new(ExclusionPolicy::default(), governor());
        builder.build(source.path(), &archive_path).unwrap();

        let payload = dest.path().join("database.sql");
        write_file(&payload, b"CREATE TABLE t (id INT);");
        builder.append_file(&archive_path, &payload).unwrap();

        let names = entry_names(&archive_path);
        assert!(names.contains("index.html"));
        assert!(names.contains("database.sql"));
    }

    #[test]
    fn test_build_missing_source_fails() {
        let dest = TempDir::new().unwrap();
        let builder = ArchiveBuilder::new(ExclusionPolicy::default(), governor());
        let result = builder.build(
            Path::new("/nonexistent/source/tree"),
            &dest.path().join("out.zip"),
        );
        assert!(result.is_err());
    }
}
