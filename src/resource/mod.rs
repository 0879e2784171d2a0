//! Resource budgeting for siteback
//!
//! The ResourceGovernor estimates memory and disk headroom before any
//! expensive phase starts. Every phase checks headroom first and aborts
//! with a `ResourceExhaustion` error rather than starting work that might
//! exceed host limits.

use std::path::Path;

use crate::error::{BackupError, BackupResult};

/// Memory gate applied before each workflow step, in MiB
pub const STEP_MEMORY_THRESHOLD_MB: u64 = 64;

/// Memory gate for checksum-manifest verification, in MiB.
/// Hashing every archive entry is the most memory-hungry check.
pub const MANIFEST_MEMORY_THRESHOLD_MB: u64 = 128;

/// Estimates memory and disk headroom against a configured ceiling
#[derive(Debug, Clone)]
pub struct ResourceGovernor {
    /// Configured memory ceiling in bytes
    memory_limit_bytes: u64,
}

impl ResourceGovernor {
    /// Create a governor from a ceiling string with a unit suffix
    /// ("512M", "1G", "256K") or a bare byte count.
    pub fn new(memory_limit: &str) -> BackupResult<Self> {
        let memory_limit_bytes = parse_memory_limit(memory_limit)?;
        Ok(Self { memory_limit_bytes })
    }

    /// The configured memory ceiling in bytes
    pub fn memory_limit(&self) -> u64 {
        self.memory_limit_bytes
    }

    /// Available memory: configured ceiling minus current usage
    pub fn available_memory(&self) -> u64 {
        self.memory_limit_bytes
            .saturating_sub(current_memory_usage())
    }

    /// True iff available memory is at least `threshold_mb` MiB
    pub fn is_enough_memory(&self, threshold_mb: u64) -> bool {
        self.available_memory() >= threshold_mb * 1024 * 1024
    }

    /// Gate an expensive phase: error out unless `threshold_mb` MiB of
    /// headroom is available.
    pub fn require_memory(&self, threshold_mb: u64) -> BackupResult<()> {
        if self.is_enough_memory(threshold_mb) {
            Ok(())
        } else {
            Err(BackupError::ResourceExhaustion(format!(
                "Need {} MiB of memory headroom, have {} bytes available",
                threshold_mb,
                self.available_memory()
            )))
        }
    }

    /// Free disk space at `path` in bytes
    pub fn free_disk_space(&self, path: &Path) -> BackupResult<u64> {
        fs2::available_space(path)
            .map_err(|e| BackupError::Io(format!("Failed to determine free space on disk: {}", e)))
    }
}

/// Parse a memory ceiling string to bytes (base 1024).
///
/// Accepts a trailing `K`/`M`/`G` (case-insensitive) or a bare byte count.
pub fn parse_memory_limit(value: &str) -> BackupResult<u64> {
    let trimmed = value.trim();
    if trimmed.is_empty() {
        return Err(BackupError::Config("Empty memory limit".into()));
    }

    let (digits, multiplier) = match trimmed.chars().last() {
        Some('k') | Some('K') => (&trimmed[..trimmed.len() - 1], 1024u64),
        Some('m') | Some('M') => (&trimmed[..trimmed.len() - 1], 1024 * 1024),
        Some('g') | Some('G') => (&trimmed[..trimmed.len() - 1], 1024 * 1024 * 1024),
        _ => (trimmed, 1),
    };

    let value: u64 = digits.trim().parse().map_err(|_| {
        BackupError::Config(format!("Invalid memory limit: {}", trimmed))
    })?;

    value.checked_mul(multiplier).ok_or_else(|| {
        BackupError::Config(format!("Memory limit overflows: {}", trimmed))
    })
}

/// Resident set size of the current process, in bytes.
///
/// Reads `/proc/self/status` on Linux; other platforms report zero, which
/// makes the governor treat the full ceiling as available.
#[cfg(target_os = "linux")]
fn current_memory_usage() -> u64 {
    let Ok(status) = std::fs::read_to_string("/proc/self/status") else {
        return 0;
    };
    for line in status.lines() {
        if let Some(rest) = line.strip_prefix("VmRSS:") {
            let kb: u64 = rest
                .trim()
                .trim_end_matches("kB")
                .trim()
                .parse()
                .unwrap_or(0);
            return kb * 1024;
        }
    }
    0
}

#[cfg(not(target_os = "linux"))]
fn current_memory_usage() -> u64 {
    0
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_unit_suffixes() {
        assert_eq!(parse_memory_limit("512M").unwrap(), 536_870_912);
        assert_eq!(parse_memory_limit("1G").unwrap(), 1_073_741_824);
        assert_eq!(parse_memory_limit("256K").unwrap(), 262_144);
    }

    #[test]
    fn test_parse_lowercase_and_bare_bytes() {
        assert_eq!(parse_memory_limit("512m").unwrap(), 536_870_912);
        assert_eq!(parse_memory_limit("2g").unwrap(), 2_147_483_648);
        assert_eq!(parse_memory_limit("4096").unwrap(), 4096);
    }

    #[test]
    fn test_parse_rejects_garbage() {
        assert!(parse_memory_limit("").is_err());
        assert!(parse_memory_limit("lots").is_err());
        assert!(parse_memory_limit("M").is_err());
    }

    #[test]
    fn test_parse_rejects_overflowing_ceiling() {
        let err = parse_memory_limit("30000000000G").unwrap_err();
        assert!(matches!(err, BackupError::Config(_)));
        assert!(parse_memory_limit("99999999999999999999G").is_err());
    }

    #[test]
    fn test_is_enough_memory_boundary() {
        let governor = ResourceGovernor::new("4G").unwrap();
        // With a 4 GiB ceiling the test process cannot plausibly have
        // consumed everything; a 1 MiB ask must succeed.
        assert!(governor.is_enough_memory(1));

        let tiny = ResourceGovernor::new("1K").unwrap();
        assert!(!tiny.is_enough_memory(1));
        assert!(tiny.require_memory(1).is_err());
    }

    #[test]
    fn test_available_never_underflows() {
        let tiny = ResourceGovernor::new("1").unwrap();
        // Usage exceeds a 1-byte ceiling; available saturates at zero.
        let _ = tiny.available_memory();
    }

    #[test]
    fn test_free_disk_space() {
        let governor = ResourceGovernor::new("512M").unwrap();
        let space = governor.free_disk_space(Path::new(".")).unwrap();
        assert!(space > 0);
    }
}
