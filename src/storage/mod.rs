//! Remote storage backends for finished backup artifacts
//!
//! `StorageCredential` is a closed set of backend configurations; the
//! concrete adapter is resolved once when the credential is connected,
//! never by inspecting a kind string at upload time. New backends are
//! added by implementing `StorageAdapter`.

pub mod ftp;
pub mod object;

use std::io::Read;

use serde::{Deserialize, Serialize};

use crate::error::{BackupError, BackupResult};
pub use ftp::FtpAdapter;
pub use object::ObjectStorageAdapter;

/// Upload chunk size in bytes
pub const UPLOAD_CHUNK_SIZE: usize = 1024 * 1024;

/// A connected storage backend able to receive an artifact stream
pub trait StorageAdapter {
    /// Upload the stream to `destination` (a backend-relative name).
    /// Returns `true` once the backend confirms the write.
    fn upload_stream(&mut self, stream: &mut dyn Read, destination: &str) -> BackupResult<bool>;
}

/// Configuration for one of the supported storage backends
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "kebab-case")]
pub enum StorageCredential {
    /// S3-compatible object storage
    ObjectStorage {
        region: String,
        bucket: String,
        access_key: String,
        secret_key: String,
    },
    /// FTP server, optionally over TLS
    Ftp {
        host: String,
        username: String,
        password: String,
        #[serde(default = "default_ftp_port")]
        port: u16,
        #[serde(default)]
        tls: bool,
    },
}

fn default_ftp_port() -> u16 {
    21
}

impl StorageCredential {
    /// Check that every required attribute is present and plausible
    pub fn validate(&self) -> BackupResult<()> {
        match self {
            Self::ObjectStorage {
                region,
                bucket,
                access_key,
                secret_key,
            } => {
                for (name, value) in [
                    ("region", region),
                    ("bucket", bucket),
                    ("access key", access_key),
                    ("secret key", secret_key),
                ] {
                    if value.trim().is_empty() {
                        return Err(BackupError::Config(format!(
                            "Object storage credential is missing its {}",
                            name
                        )));
                    }
                }
                Ok(())
            }
            Self::Ftp {
                host,
                username,
                port,
                ..
            } => {
                if host.trim().is_empty() {
                    return Err(BackupError::Config("FTP credential is missing its host".into()));
                }
                if username.trim().is_empty() {
                    return Err(BackupError::Config(
                        "FTP credential is missing its username".into(),
                    ));
                }
                if *port == 0 {
                    return Err(BackupError::Config("FTP port must be between 1 and 65535".into()));
                }
                Ok(())
            }
        }
    }

    /// Resolve the credential to a connected adapter.
    ///
    /// FTP connects and logs in here; object storage defers network work
    /// to the upload itself.
    pub fn connect(&self) -> BackupResult<Box<dyn StorageAdapter>> {
        self.validate()?;
        match self {
            Self::ObjectStorage {
                region,
                bucket,
                access_key,
                secret_key,
            } => Ok(Box::new(ObjectStorageAdapter::new(
                region.clone(),
                bucket.clone(),
                access_key.clone(),
                secret_key.clone(),
            ))),
            Self::Ftp {
                host,
                username,
                password,
                port,
                tls,
            } => Ok(Box::new(FtpAdapter::connect(
                host, *port, username, password, *tls,
            )?)),
        }
    }
}
