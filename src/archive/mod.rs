//! Archive assembly and temp-artifact retention

pub mod builder;
pub mod retention;

pub use builder::ArchiveBuilder;
pub use retention::RetentionManager;

/// Prefix shared by every temp backup artifact filename
pub const ARTIFACT_PREFIX: &str = "siteback-site-backup-";

/// Timestamp format embedded in artifact filenames (second granularity)
pub const ARTIFACT_TIMESTAMP_FORMAT: &str = "%Y-%m-%d-%H-%M-%S";
