//! Configuration and path management

pub mod paths;
pub mod settings;

pub use paths::BackupPaths;
pub use settings::{BackupFrequency, IncludePolicy, Settings};
