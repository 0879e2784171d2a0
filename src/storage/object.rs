//! S3-compatible object storage backend
//!
//! Uploads the artifact as a single signed PUT (AWS Signature Version 4)
//! with a private ACL and the archive content type. The request is built
//! by hand over `ureq`; only the one operation the pipeline needs is
//! implemented.

use std::io::Read;
use std::sync::OnceLock;
use std::time::Duration;

use chrono::Utc;
use hmac::{Hmac, Mac};
use sha2::{Digest, Sha256};

use super::StorageAdapter;
use crate::error::{BackupError, BackupResult};

type HmacSha256 = Hmac<Sha256>;

/// Network timeout covering the whole upload
const UPLOAD_TIMEOUT: Duration = Duration::from_secs(600);

const SERVICE: &str = "s3";

/// Object storage adapter holding resolved credentials
pub struct ObjectStorageAdapter {
    region: String,
    bucket: String,
    access_key: String,
    secret_key: String,
}

impl ObjectStorageAdapter {
    pub fn new(region: String, bucket: String, access_key: String, secret_key: String) -> Self {
        Self {
            region,
            bucket,
            access_key,
            secret_key,
        }
    }

    fn host(&self) -> String {
        format!("{}.s3.{}.amazonaws.com", self.bucket, self.region)
    }

    /// Build the SigV4 authorization header for a PUT of `payload_hash`
    fn authorization(
        &self,
        host: &str,
        key_path: &str,
        payload_hash: &str,
        amz_date: &str,
        date: &str,
    ) -> BackupResult<String> {
        let canonical_headers = format!(
            "content-type:application/zip\nhost:{}\nx-amz-acl:private\nx-amz-content-sha256:{}\nx-amz-date:{}\n",
            host, payload_hash, amz_date
        );
        let signed_headers = "content-type;host;x-amz-acl;x-amz-content-sha256;x-amz-date";

        let canonical_request = format!(
            "PUT\n{}\n\n{}\n{}\n{}",
            key_path, canonical_headers, signed_headers, payload_hash
        );

        let scope = format!("{}/{}/{}/aws4_request", date, self.region, SERVICE);
        let string_to_sign = format!(
            "AWS4-HMAC-SHA256\n{}\n{}\n{}",
            amz_date,
            scope,
            sha256_hex(canonical_request.as_bytes())
        );

        let signing_key = derive_signing_key(&self.secret_key, date, &self.region, SERVICE)?;
        let signature = hex(&hmac_sha256(&signing_key, string_to_sign.as_bytes())?);

        Ok(format!(
            "AWS4-HMAC-SHA256 Credential={}/{}, SignedHeaders={}, Signature={}",
            self.access_key, scope, signed_headers, signature
        ))
    }
}

impl StorageAdapter for ObjectStorageAdapter {
    fn upload_stream(&mut self, stream: &mut dyn Read, destination: &str) -> BackupResult<bool> {
        let mut body = Vec::new();
        stream
            .read_to_end(&mut body)
            .map_err(|e| BackupError::Upload(format!("Failed to read artifact stream: {}", e)))?;

        let host = self.host();
        let key_path = format!("/{}", uri_encode_path(destination.trim_start_matches('/')));
        let payload_hash = sha256_hex(&body);

        let now = Utc::now();
        let amz_date = now.format("%Y%m%dT%H%M%SZ").to_string();
        let date = now.format("%Y%m%d").to_string();

        let authorization = self.authorization(&host, &key_path, &payload_hash, &amz_date, &date)?;
        let url = format!("https://{}{}", host, key_path);

        http_agent()
            .put(&url)
            .header("x-amz-acl", "private")
            .header("x-amz-content-sha256", &payload_hash)
            .header("x-amz-date", &amz_date)
            .header("content-type", "application/zip")
            .header("authorization", &authorization)
            .send(&body[..])
            .map_err(|e| BackupError::Upload(format!("Object storage PUT failed: {}", e)))?;

        Ok(true)
    }
}

/// Shared `ureq` agent for uploads
fn http_agent() -> &'static ureq::Agent {
    static AGENT: OnceLock<ureq::Agent> = OnceLock::new();
    AGENT.get_or_init(|| {
        let config = ureq::Agent::config_builder()
            .timeout_global(Some(UPLOAD_TIMEOUT))
            .build();
        ureq::Agent::new_with_config(config)
    })
}

/// AWS SigV4 signing key: chained HMACs over date, region, and service
fn derive_signing_key(
    secret_key: &str,
    date: &str,
    region: &str,
    service: &str,
) -> BackupResult<Vec<u8>> {
    let k_date = hmac_sha256(format!("AWS4{}", secret_key).as_bytes(), date.as_bytes())?;
    let k_region = hmac_sha256(&k_date, region.as_bytes())?;
    let k_service = hmac_sha256(&k_region, service.as_bytes())?;
    hmac_sha256(&k_service, b"aws4_request")
}

fn hmac_sha256(key: &[u8], data: &[u8]) -> BackupResult<Vec<u8>> {
    let mut mac = HmacSha256::new_from_slice(key)
        .map_err(|e| BackupError::Upload(format!("HMAC key error: {}", e)))?;
    mac.update(data);
    Ok(mac.finalize().into_bytes().to_vec())
}

fn sha256_hex(data: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(data);
    hex(&hasher.finalize())
}

fn hex(bytes: &[u8]) -> String {
    bytes.iter().map(|b| format!("{:02x}", b)).collect()
}

/// Percent-encode a key path, keeping `/` and unreserved characters
fn uri_encode_path(path: &str) -> String {
    let mut out = String::with_capacity(path.len());
    for byte in path.bytes() {
        match byte {
            b'A'..=b'Z' | b'a'..=b'z' | b'0'..=b'9' | b'-' | b'.' | b'_' | b'~' | b'/' => {
                out.push(byte as char)
            }
            _ => out.push_str(&format!("%{:02X}", byte)),
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_signing_key_matches_published_vector() {
        // Example vector from the AWS SigV4 documentation.
        let key = derive_signing_key(
            "wJalrXUtnFEMI/K7MDENG+bPxRfiCYEXAMPLEKEY",
            "20150830",
            "us-east-1",
            "iam",
        )
        .unwrap();
        assert_eq!(
            hex(&key),
            "c4afb1cc5771d871763a393e44b703571b55cc28424d1a5e86da6ed3c154a4b9"
        );
    }

    #[test]
    fn test_sha256_hex_empty() {
        assert_eq!(
            sha256_hex(b""),
            "e3b0c44298fc1c149afbf4c8996fb92427ae41e4649b934ca495991b7852b855"
        );
    }

    #[test]
    fn test_uri_encoding() {
        assert_eq!(
            uri_encode_path("backups/siteback-site-backup-2026-08-29-14-30-22.zip"),
            "backups/siteback-site-backup-2026-08-29-14-30-22.zip"
        );
        assert_eq!(uri_encode_path("a b+c.zip"), "a%20b%2Bc.zip");
    }

    #[test]
    fn test_host_layout() {
        let adapter = ObjectStorageAdapter::new(
            "eu-west-1".to_string(),
            "backups".to_string(),
            "AKIATEST".to_string(),
            "secret".to_string(),
        );
        assert_eq!(adapter.host(), "backups.s3.eu-west-1.amazonaws.com");
    }

    #[test]
    fn test_authorization_header_shape() {
        let adapter = ObjectStorageAdapter::new(
            "eu-west-1".to_string(),
            "backups".to_string(),
            "AKIATEST".to_string(),
            "secret".to_string(),
        );
        let auth = adapter
            .authorization(
                "backups.s3.eu-west-1.amazonaws.com",
                "/backup.zip",
                &sha256_hex(b"payload"),
                "20260829T143022Z",
                "20260829",
            )
            .unwrap();
        assert!(auth.starts_with("AWS4-HMAC-SHA256 Credential=AKIATEST/20260829/eu-west-1/s3/aws4_request"));
        assert!(auth.contains("SignedHeaders=content-type;host;x-amz-acl;x-amz-content-sha256;x-amz-date"));
        assert!(auth.contains("Signature="));
    }
}
