//! Custom error types for siteback
//!
//! This module defines the error hierarchy for the backup pipeline using
//! thiserror for ergonomic error definitions. Validation failures carry a
//! structured severity instead of encoding urgency in message prefixes.

use thiserror::Error;

/// Urgency of a validation fault.
///
/// `Danger` denotes an active safety risk (e.g. an executable payload);
/// `Warning` flags suspicious but non-blocking conditions; `Fatal` is an
/// ordinary hard failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Severity {
    Warning,
    Danger,
    Fatal,
}

impl std::fmt::Display for Severity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Severity::Warning => write!(f, "WARNING"),
            Severity::Danger => write!(f, "DANGER"),
            Severity::Fatal => write!(f, "FATAL"),
        }
    }
}

/// A single failed validation check.
#[derive(Debug, Clone, Error)]
#[error("{severity}: {detail}")]
pub struct ValidationFault {
    /// How urgent the fault is.
    pub severity: Severity,
    /// Human-readable description of what failed.
    pub detail: String,
}

impl ValidationFault {
    /// Create a fault with `Fatal` severity.
    pub fn fatal(detail: impl Into<String>) -> Self {
        Self {
            severity: Severity::Fatal,
            detail: detail.into(),
        }
    }

    /// Create a fault with `Warning` severity.
    pub fn warning(detail: impl Into<String>) -> Self {
        Self {
            severity: Severity::Warning,
            detail: detail.into(),
        }
    }

    /// Create a fault with `Danger` severity.
    pub fn danger(detail: impl Into<String>) -> Self {
        Self {
            severity: Severity::Danger,
            detail: detail.into(),
        }
    }

    /// Whether this fault should be surfaced verbatim to the caller.
    ///
    /// Warning and danger faults carry operator-relevant security context;
    /// everything else is reported generically.
    pub fn is_surfaced(&self) -> bool {
        matches!(self.severity, Severity::Warning | Severity::Danger)
    }
}

/// The main error type for siteback operations
#[derive(Error, Debug)]
pub enum BackupError {
    /// Configuration-related errors
    #[error("Configuration error: {0}")]
    Config(String),

    /// File I/O errors
    #[error("I/O error: {0}")]
    Io(String),

    /// JSON serialization/deserialization errors
    #[error("JSON error: {0}")]
    Json(String),

    /// A validation check on a produced archive failed
    #[error("Validation error: {0}")]
    Validation(ValidationFault),

    /// Preconditions unmet: not enough memory or disk to start the work
    #[error("Resource exhaustion: {0}")]
    ResourceExhaustion(String),

    /// Checksum mismatch or missing manifest entries
    #[error("Integrity error: {0}")]
    Integrity(String),

    /// Storage backend rejected the upload
    #[error("Upload error: {0}")]
    Upload(String),

    /// No active job ticket (missing or expired)
    #[error("No active backup ticket: {0}")]
    NoActiveTicket(String),
}

impl BackupError {
    /// Check if this is a validation error
    pub fn is_validation(&self) -> bool {
        matches!(self, Self::Validation(_))
    }

    /// The validation fault, if this error carries one
    pub fn fault(&self) -> Option<&ValidationFault> {
        match self {
            Self::Validation(fault) => Some(fault),
            _ => None,
        }
    }
}

// Implement From traits for common error types

impl From<std::io::Error> for BackupError {
    fn from(err: std::io::Error) -> Self {
        Self::Io(err.to_string())
    }
}

impl From<serde_json::Error> for BackupError {
    fn from(err: serde_json::Error) -> Self {
        Self::Json(err.to_string())
    }
}

impl From<ValidationFault> for BackupError {
    fn from(fault: ValidationFault) -> Self {
        Self::Validation(fault)
    }
}

impl From<zip::result::ZipError> for BackupError {
    fn from(err: zip::result::ZipError) -> Self {
        Self::Io(err.to_string())
    }
}

/// Result type alias for siteback operations
pub type BackupResult<T> = Result<T, BackupError>;
