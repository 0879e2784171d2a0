//! siteback - Resource-budgeted site backup pipeline
//!
//! This library assembles a site's filesystem tree into a single zip
//! artifact, validates it for safety and integrity, and drives the
//! multi-phase export workflow (archive, append export, upload) across
//! independently-invoked steps, handing the finished artifact to a
//! pluggable remote-storage backend.
//!
//! # Architecture
//!
//! The crate is organized into the following modules:
//!
//! - `config`: Settings and path management
//! - `error`: Custom error types with severity-tagged validation faults
//! - `resource`: Memory and disk headroom gating
//! - `scanner`: Lazy traversal and dangerous-file classification
//! - `archive`: Streaming zip assembly and temp-artifact retention
//! - `checksum`: Known-good manifest fetching and caching
//! - `validate`: The ordered archive validation chain
//! - `storage`: Object-storage and FTP upload backends
//! - `store`: Durable KV collaborator, job tickets, history log
//! - `workflow`: The step0..step3 phase orchestrator
//! - `api`: `{success, data}` request surface and artifact download
//!
//! # Example
//!
//! ```rust,ignore
//! use siteback::config::{BackupPaths, Settings};
//! use siteback::workflow::{JobContext, PhaseOrchestrator};
//!
//! let paths = BackupPaths::new();
//! let settings = Settings::load_or_create(&paths)?;
//! let context = JobContext::from_settings(&settings, paths, source_root)?;
//! ```

pub mod api;
pub mod archive;
pub mod checksum;
pub mod config;
pub mod error;
pub mod resource;
pub mod scanner;
pub mod storage;
pub mod store;
pub mod validate;
pub mod workflow;

pub use error::{BackupError, BackupResult};
