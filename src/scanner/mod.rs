//! Lazy filesystem traversal and dangerous-file classification
//!
//! `PathScanner` walks a tree depth-first, yielding directories before
//! their contents, one path at a time. Nothing is materialized: memory is
//! bounded by the current directory depth, not the tree size.

use std::collections::HashSet;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};

/// Extensions that must never travel inside or as a backup artifact:
/// executables, scripts, installers, and shortcuts.
pub const DANGEROUS_EXTENSIONS: &[&str] = &[
    "exe", "com", "bat", "cmd", "sh", "bash", "bin", "msi", "vbs", "ps1", "jar", "wsf", "hta",
    "scr", "pif", "gadget", "inf", "reg", "msp", "scf", "lnk",
];

/// Check a filename's extension against the deny-list
pub fn is_dangerous_ext(filename: &str) -> bool {
    Path::new(filename)
        .extension()
        .and_then(|ext| ext.to_str())
        .map(|ext| DANGEROUS_EXTENSIONS.contains(&ext.to_lowercase().as_str()))
        .unwrap_or(false)
}

/// Check whether a file is dangerous: deny-listed extension, or the
/// filesystem reports it as executable.
pub fn is_dangerous_file(path: &Path) -> bool {
    let name = path
        .file_name()
        .map(|n| n.to_string_lossy().to_string())
        .unwrap_or_default();
    if is_dangerous_ext(&name) {
        return true;
    }
    is_executable(path)
}

#[cfg(unix)]
fn is_executable(path: &Path) -> bool {
    use std::os::unix::fs::PermissionsExt;
    fs::metadata(path)
        .map(|m| m.is_file() && m.permissions().mode() & 0o111 != 0)
        .unwrap_or(false)
}

#[cfg(not(unix))]
fn is_executable(_path: &Path) -> bool {
    false
}

/// Names excluded from archive construction and archive scanning
#[derive(Debug, Clone)]
pub struct ExclusionPolicy {
    /// Whether the dangerous-extension deny-list applies
    exclude_dangerous_extensions: bool,
    /// Entry names excluded verbatim (e.g. ".git")
    custom_exclusions: HashSet<String>,
}

impl Default for ExclusionPolicy {
    fn default() -> Self {
        Self {
            exclude_dangerous_extensions: true,
            custom_exclusions: HashSet::new(),
        }
    }
}

impl ExclusionPolicy {
    /// Policy with custom name exclusions on top of the deny-list
    pub fn with_custom_exclusions<I, S>(names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            exclude_dangerous_extensions: true,
            custom_exclusions: names.into_iter().map(Into::into).collect(),
        }
    }

    /// Disable the dangerous-extension deny-list (custom exclusions remain)
    pub fn allow_dangerous_extensions(mut self) -> Self {
        self.exclude_dangerous_extensions = false;
        self
    }

    /// Whether an entry name is excluded by this policy
    pub fn is_excluded(&self, name: &str) -> bool {
        if self.custom_exclusions.contains(name) {
            return true;
        }
        self.exclude_dangerous_extensions && is_dangerous_ext(name)
    }
}

/// Lazy depth-first walker yielding directories before their contents.
///
/// Each `next()` returns one path and advances; the only retained state is
/// one open `ReadDir` handle per ancestor directory.
pub struct PathScanner {
    stack: Vec<fs::ReadDir>,
}

impl PathScanner {
    /// Start a scan at `root`. The root itself is not yielded.
    pub fn new(root: &Path) -> io::Result<Self> {
        let entries = fs::read_dir(root)?;
        Ok(Self {
            stack: vec![entries],
        })
    }
}

impl Iterator for PathScanner {
    type Item = io::Result<PathBuf>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            let entries = self.stack.last_mut()?;
            match entries.next() {
                Some(Ok(entry)) => {
                    let path = entry.path();
                    if path.is_dir() {
                        match fs::read_dir(&path) {
                            Ok(children) => self.stack.push(children),
                            Err(e) => return Some(Err(e)),
                        }
                    }
                    return Some(Ok(path));
                }
                Some(Err(e)) => return Some(Err(e)),
                None => {
                    self.stack.pop();
                }
            }
        }
    }
}

/// Collect every dangerous file under `root`
pub fn flag_dangerous_files(root: &Path) -> io::Result<Vec<PathBuf>> {
    let mut flagged = Vec::new();
    for path in PathScanner::new(root)? {
        let path = path?;
        if path.is_file() && is_dangerous_file(&path) {
            flagged.push(path);
        }
    }
    Ok(flagged)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs::File;
    use std::io::Write;
    use tempfile::TempDir;

    fn touch(path: &Path) {
        File::create(path).unwrap();
    }

    #[test]
    fn test_dangerous_extensions() {
        assert!(is_dangerous_ext("install.exe"));
        assert!(is_dangerous_ext("run.SH"));
        assert!(is_dangerous_ext("shortcut.lnk"));
        assert!(!is_dangerous_ext("style.css"));
        assert!(!is_dangerous_ext("no_extension"));
        assert!(!is_dangerous_ext("archive.zip"));
    }

    #[test]
    fn test_scanner_yields_dirs_before_contents() {
        let temp = TempDir::new().unwrap();
        let sub = temp.path().join("sub");
        fs::create_dir(&sub).unwrap();
        touch(&sub.join("inner.txt"));
        touch(&temp.path().join("top.txt"));

        let paths: Vec<PathBuf> = PathScanner::new(temp.path())
            .unwrap()
            .map(|p| p.unwrap())
            .collect();

        assert_eq!(paths.len(), 3);
        let dir_pos = paths.iter().position(|p| p == &sub).unwrap();
        let inner_pos = paths.iter().position(|p| p == &sub.join("inner.txt")).unwrap();
        assert!(dir_pos < inner_pos);
    }

    #[test]
    fn test_scanner_empty_dir() {
        let temp = TempDir::new().unwrap();
        let count = PathScanner::new(temp.path()).unwrap().count();
        assert_eq!(count, 0);
    }

    #[test]
    fn test_flag_dangerous_files() {
        let temp = TempDir::new().unwrap();
        touch(&temp.path().join("notes.txt"));
        let mut script = File::create(temp.path().join("evil.sh")).unwrap();
        script.write_all(b"#!/bin/sh\n").unwrap();

        let flagged = flag_dangerous_files(temp.path()).unwrap();
        assert_eq!(flagged.len(), 1);
        assert!(flagged[0].ends_with("evil.sh"));
    }

    #[cfg(unix)]
    #[test]
    fn test_executable_bit_is_dangerous() {
        use std::os::unix::fs::PermissionsExt;

        let temp = TempDir::new().unwrap();
        let path = temp.path().join("innocuous.txt");
        touch(&path);
        let mut perms = fs::metadata(&path).unwrap().permissions();
        perms.set_mode(0o755);
        fs::set_permissions(&path, perms).unwrap();

        assert!(is_dangerous_file(&path));
    }

    #[test]
    fn test_exclusion_policy() {
        let policy = ExclusionPolicy::with_custom_exclusions([".git", "node_modules"]);
        assert!(policy.is_excluded(".git"));
        assert!(policy.is_excluded("payload.exe"));
        assert!(!policy.is_excluded("readme.md"));

        let relaxed = policy.clone().allow_dangerous_extensions();
        assert!(!relaxed.is_excluded("payload.exe"));
        assert!(relaxed.is_excluded(".git"));
    }
}
