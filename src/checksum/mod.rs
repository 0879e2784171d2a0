//! Known-good checksum manifests for tamper detection
//!
//! The external checksum service returns `{checksums: {relativePath:
//! hexHash}}` keyed by platform version and locale. Manifests change only
//! when the platform does, so they are cacheable for up to 60 days.
//! Absence of a manifest degrades validation rather than failing it.

use std::collections::BTreeMap;
use std::sync::{Arc, OnceLock};
use std::time::Duration;

use log::warn;
use serde::{Deserialize, Serialize};

use crate::error::{BackupError, BackupResult};
use crate::store::KvStore;

/// How long a fetched manifest stays valid in the cache
pub const MANIFEST_CACHE_TTL: Duration = Duration::from_secs(60 * 24 * 60 * 60);

/// Network timeout for manifest fetches
const FETCH_TIMEOUT: Duration = Duration::from_secs(30);

/// External known-good path-to-hash mapping, tagged by the platform
/// version and locale it was generated for.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChecksumManifest {
    /// Platform version the manifest describes
    pub platform_version: String,
    /// Locale variant
    pub locale: String,
    /// Relative path → expected hex hash
    pub checksums: BTreeMap<String, String>,
}

/// Source of checksum manifests.
///
/// `Ok(None)` means the service had no manifest for this version/locale;
/// callers degrade (skip manifest verification) rather than fail.
pub trait ChecksumProvider {
    fn fetch(&self, version: &str, locale: &str) -> BackupResult<Option<ChecksumManifest>>;
}

/// Wire shape of the checksum service response
#[derive(Debug, Deserialize)]
struct ServiceResponse {
    checksums: Option<BTreeMap<String, String>>,
}

/// HTTP-backed checksum provider using `ureq`
pub struct HttpChecksumService {
    base_url: String,
}

impl HttpChecksumService {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into(),
        }
    }

    fn manifest_url(&self, version: &str, locale: &str) -> String {
        format!(
            "{}?version={}&locale={}",
            self.base_url.trim_end_matches('/'),
            version,
            locale
        )
    }
}

impl ChecksumProvider for HttpChecksumService {
    fn fetch(&self, version: &str, locale: &str) -> BackupResult<Option<ChecksumManifest>> {
        let url = self.manifest_url(version, locale);
        let response = match http_agent().get(&url).call() {
            Ok(response) => response,
            Err(ureq::Error::StatusCode(404)) => return Ok(None),
            Err(e) => {
                return Err(BackupError::Integrity(format!(
                    "Checksum service request failed for {}: {}",
                    url, e
                )))
            }
        };

        let body: ServiceResponse = response
            .into_body()
            .read_json()
            .map_err(|e| BackupError::Integrity(format!("Invalid checksum response: {}", e)))?;

        Ok(body.checksums.map(|checksums| ChecksumManifest {
            platform_version: version.to_string(),
            locale: locale.to_string(),
            checksums,
        }))
    }
}

/// Shared `ureq` agent with request timeout configuration
fn http_agent() -> &'static ureq::Agent {
    static AGENT: OnceLock<ureq::Agent> = OnceLock::new();
    AGENT.get_or_init(|| {
        let config = ureq::Agent::config_builder()
            .timeout_global(Some(FETCH_TIMEOUT))
            .build();
        ureq::Agent::new_with_config(config)
    })
}

/// Caching wrapper storing fetched manifests in the durable KV store
/// for [`MANIFEST_CACHE_TTL`].
pub struct CachedChecksumService<P: ChecksumProvider> {
    inner: P,
    store: Arc<dyn KvStore>,
}

impl<P: ChecksumProvider> CachedChecksumService<P> {
    pub fn new(inner: P, store: Arc<dyn KvStore>) -> Self {
        Self { inner, store }
    }

    fn cache_key(version: &str, locale: &str) -> String {
        format!("siteback/checksums/{}/{}", version, locale)
    }
}

impl<P: ChecksumProvider> ChecksumProvider for CachedChecksumService<P> {
    fn fetch(&self, version: &str, locale: &str) -> BackupResult<Option<ChecksumManifest>> {
        let key = Self::cache_key(version, locale);
        if let Some(cached) = self.store.get(&key) {
            match serde_json::from_str(&cached) {
                Ok(manifest) => return Ok(Some(manifest)),
                Err(e) => {
                    // Poisoned cache entry: drop it and refetch.
                    warn!("discarding unreadable cached manifest {}: {}", key, e);
                    self.store.delete(&key);
                }
            }
        }

        let manifest = self.inner.fetch(version, locale)?;
        if let Some(manifest) = &manifest {
            let json = serde_json::to_string(manifest)
                .map_err(|e| BackupError::Json(format!("Failed to cache manifest: {}", e)))?;
            self.store.set(&key, &json, Some(MANIFEST_CACHE_TTL));
        }
        Ok(manifest)
    }
}
