//! Archival of raw uploads to remote object storage.
//!
//! Uploads go through the S3 `PutObject` REST call signed with AWS Signature
//! Version 4. Google Cloud Storage accepts the same requests on its
//! interoperability endpoint (`storage.googleapis.com`) with HMAC keys, so
//! one implementation covers both.
//!
//! # Configuration
//!
//! ```toml
//! [archive]
//! provider = "gcs"            # or "s3", or "disabled"
//! bucket = "docgpt-archive"
//! region = "auto"
//! # endpoint_url = "http://localhost:9000"   # MinIO
//! ```
//!
//! # Environment Variables
//!
//! - `ARCHIVE_ACCESS_KEY_ID`: required
//! - `ARCHIVE_SECRET_ACCESS_KEY`: required
//! - `ARCHIVE_SESSION_TOKEN`: optional
//!
//! The object key is the original filename. There is no versioning: uploading
//! a file with the same name replaces the archived copy.

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use hmac::{Hmac, Mac};
use sha2::{Digest, Sha256};

use crate::config::ArchiveConfig;

type HmacSha256 = Hmac<Sha256>;

#[async_trait]
pub trait Archiver: Send + Sync {
    /// Human-readable destination, for logs.
    fn destination(&self) -> String;

    /// Store `bytes` under `key`, overwriting any existing object.
    async fn upload(&self, key: &str, bytes: &[u8]) -> Result<()>;
}

/// Archiver used when `archive.provider = "disabled"`.
pub struct DisabledArchiver;

#[async_trait]
impl Archiver for DisabledArchiver {
    fn destination(&self) -> String {
        "disabled".to_string()
    }

    async fn upload(&self, _key: &str, _bytes: &[u8]) -> Result<()> {
        Ok(())
    }
}

/// Credentials loaded from environment variables.
struct ArchiveCredentials {
    access_key_id: String,
    secret_access_key: String,
    session_token: Option<String>,
}

impl ArchiveCredentials {
    fn from_env() -> Result<Self> {
        let access_key_id = std::env::var("ARCHIVE_ACCESS_KEY_ID")
            .context("ARCHIVE_ACCESS_KEY_ID environment variable not set")?;
        let secret_access_key = std::env::var("ARCHIVE_SECRET_ACCESS_KEY")
            .context("ARCHIVE_SECRET_ACCESS_KEY environment variable not set")?;
        let session_token = std::env::var("ARCHIVE_SESSION_TOKEN").ok();

        Ok(Self {
            access_key_id,
            secret_access_key,
            session_token,
        })
    }
}

/// S3-compatible object store (S3, GCS interoperability, MinIO).
pub struct ObjectStoreArchiver {
    bucket: String,
    region: String,
    scheme: String,
    host: String,
    creds: ArchiveCredentials,
    client: reqwest::Client,
}

impl ObjectStoreArchiver {
    pub fn new(config: &ArchiveConfig) -> Result<Self> {
        let bucket = config
            .bucket
            .clone()
            .filter(|b| !b.is_empty())
            .ok_or_else(|| anyhow::anyhow!("archive.bucket must be set"))?;
        let (scheme, host) = match config.endpoint_url.as_deref() {
            Some(endpoint) if endpoint.starts_with("http://") => (
                "http",
                endpoint.trim_start_matches("http://").trim_end_matches('/'),
            ),
            Some(endpoint) => (
                "https",
                endpoint.trim_start_matches("https://").trim_end_matches('/'),
            ),
            None if config.provider == "s3" => ("https", ""),
            None => ("https", "storage.googleapis.com"),
        };
        let host = if host.is_empty() {
            format!("s3.{}.amazonaws.com", config.region)
        } else {
            host.to_string()
        };

        Ok(Self {
            bucket,
            region: config.region.clone(),
            scheme: scheme.to_string(),
            host,
            creds: ArchiveCredentials::from_env()?,
            client: reqwest::Client::new(),
        })
    }

    /// Path-style object path: `/<bucket>/<encoded key>`.
    fn canonical_uri(&self, key: &str) -> String {
        let encoded_key = key
            .split('/')
            .map(uri_encode)
            .collect::<Vec<_>>()
            .join("/");
        format!("/{}/{}", uri_encode(&self.bucket), encoded_key)
    }

    /// Build the signed headers for a `PUT` of `bytes` to `key` at time `now`.
    fn sign_put(&self, key: &str, bytes: &[u8], now: DateTime<Utc>) -> Vec<(String, String)> {
        let date_stamp = now.format("%Y%m%d").to_string();
        let amz_date = now.format("%Y%m%dT%H%M%SZ").to_string();
        let payload_hash = hex_sha256(bytes);

        let mut headers = vec![
            ("host".to_string(), self.host.clone()),
            ("x-amz-content-sha256".to_string(), payload_hash.clone()),
            ("x-amz-date".to_string(), amz_date.clone()),
        ];
        if let Some(ref token) = self.creds.session_token {
            headers.push(("x-amz-security-token".to_string(), token.clone()));
        }
        headers.sort_by(|a, b| a.0.cmp(&b.0));

        let signed_headers: String = headers
            .iter()
            .map(|(k, _)| k.as_str())
            .collect::<Vec<_>>()
            .join(";");

        let canonical_headers: String = headers
            .iter()
            .map(|(k, v)| format!("{}:{}\n", k, v))
            .collect();

        let canonical_request = format!(
            "PUT\n{}\n\n{}\n{}\n{}",
            self.canonical_uri(key),
            canonical_headers,
            signed_headers,
            payload_hash
        );

        let credential_scope = format!("{}/{}/s3/aws4_request", date_stamp, self.region);
        let string_to_sign = format!(
            "AWS4-HMAC-SHA256\n{}\n{}\n{}",
            amz_date,
            credential_scope,
            hex_sha256(canonical_request.as_bytes())
        );

        let signing_key = derive_signing_key(
            &self.creds.secret_access_key,
            &date_stamp,
            &self.region,
            "s3",
        );
        let signature = hex::encode(hmac_sha256(&signing_key, string_to_sign.as_bytes()));

        let authorization = format!(
            "AWS4-HMAC-SHA256 Credential={}/{}, SignedHeaders={}, Signature={}",
            self.creds.access_key_id, credential_scope, signed_headers, signature
        );

        headers.retain(|(k, _)| k != "host");
        headers.push(("authorization".to_string(), authorization));
        headers
    }
}

#[async_trait]
impl Archiver for ObjectStoreArchiver {
    fn destination(&self) -> String {
        format!("{}://{}/{}", self.scheme, self.host, self.bucket)
    }

    async fn upload(&self, key: &str, bytes: &[u8]) -> Result<()> {
        let url = format!("{}://{}{}", self.scheme, self.host, self.canonical_uri(key));
        let mut request = self.client.put(&url).body(bytes.to_vec());
        for (name, value) in self.sign_put(key, bytes, Utc::now()) {
            request = request.header(name, value);
        }

        let resp = request
            .send()
            .await
            .with_context(|| format!("Failed to upload {}/{}", self.bucket, key))?;

        if !resp.status().is_success() {
            let status = resp.status();
            let body = resp.text().await.unwrap_or_default();
            bail!(
                "PutObject failed (HTTP {}) for {}/{}: {}",
                status,
                self.bucket,
                key,
                body
            );
        }
        Ok(())
    }
}

/// Create the [`Archiver`] named by `config.provider`.
pub fn create_archiver(config: &ArchiveConfig) -> Result<Box<dyn Archiver>> {
    match config.provider.as_str() {
        "disabled" => Ok(Box::new(DisabledArchiver)),
        "s3" | "gcs" => Ok(Box::new(ObjectStoreArchiver::new(config)?)),
        other => bail!("Unknown archive provider: {}", other),
    }
}

// ============ AWS SigV4 Helpers ============

fn hex_sha256(data: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(data);
    hex::encode(hasher.finalize())
}

fn hmac_sha256(key: &[u8], data: &[u8]) -> Vec<u8> {
    // HMAC accepts keys of any length, so this never fails.
    let mut mac = HmacSha256::new_from_slice(key)
        .unwrap_or_else(|_| unreachable!("HMAC can take key of any size"));
    mac.update(data);
    mac.finalize().into_bytes().to_vec()
}

/// ```text
/// kDate    = HMAC("AWS4" + secret, dateStamp)
/// kRegion  = HMAC(kDate, region)
/// kService = HMAC(kRegion, service)
/// kSigning = HMAC(kService, "aws4_request")
/// ```
fn derive_signing_key(secret_key: &str, date_stamp: &str, region: &str, service: &str) -> Vec<u8> {
    let k_date = hmac_sha256(
        format!("AWS4{}", secret_key).as_bytes(),
        date_stamp.as_bytes(),
    );
    let k_region = hmac_sha256(&k_date, region.as_bytes());
    let k_service = hmac_sha256(&k_region, service.as_bytes());
    hmac_sha256(&k_service, b"aws4_request")
}

/// RFC 3986 encoding; only `A-Z a-z 0-9 - _ . ~` pass through.
fn uri_encode(s: &str) -> String {
    let mut result = String::new();
    for byte in s.bytes() {
        match byte {
            b'A'..=b'Z' | b'a'..=b'z' | b'0'..=b'9' | b'-' | b'_' | b'.' | b'~' => {
                result.push(byte as char);
            }
            _ => {
                result.push_str(&format!("%{:02X}", byte));
            }
        }
    }
    result
}
