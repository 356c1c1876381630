//! Object store capability: bucket/key addressed byte blobs.
//!
//! The trait has one implementation, [`OperatorStore`], over an OpenDAL
//! operator. [`OperatorStore::local`] roots it in a directory and
//! [`OperatorStore::memory`] keeps it in process memory.

pub mod local;
pub mod memory;
pub mod operator;

pub use operator::OperatorStore;

use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fmt;

use crate::error::StageError;

/// Canned access policy stored alongside an object.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum AccessPolicy {
    Private,
    PublicRead,
    PublicReadWrite,
    AuthenticatedRead,
    BucketOwnerRead,
    BucketOwnerFullControl,
}

impl fmt::Display for AccessPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            AccessPolicy::Private => "private",
            AccessPolicy::PublicRead => "public-read",
            AccessPolicy::PublicReadWrite => "public-read-write",
            AccessPolicy::AuthenticatedRead => "authenticated-read",
            AccessPolicy::BucketOwnerRead => "bucket-owner-read",
            AccessPolicy::BucketOwnerFullControl => "bucket-owner-full-control",
        };
        f.write_str(name)
    }
}

/// Options for a single put.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct PutOptions {
    /// Replace an existing object. When false, an existing key is an error.
    pub overwrite: bool,
    pub access_policy: Option<AccessPolicy>,
    pub content_encoding: Option<String>,
    pub content_type: Option<String>,
}

impl PutOptions {
    pub fn overwrite() -> Self {
        Self {
            overwrite: true,
            ..Default::default()
        }
    }
}

/// Metadata recorded for a stored object.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ObjectMeta {
    pub bucket: String,
    pub key: String,
    pub size: u64,
    /// Hex SHA-256 of the payload.
    pub sha256: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content_encoding: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content_type: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub access_policy: Option<AccessPolicy>,
    pub last_modified: DateTime<Utc>,
}

impl ObjectMeta {
    pub fn describe(bucket: &str, key: &str, payload: &[u8], options: &PutOptions) -> Self {
        Self {
            bucket: bucket.to_string(),
            key: key.to_string(),
            size: payload.len() as u64,
            sha256: sha256_hex(payload),
            content_encoding: options.content_encoding.clone(),
            content_type: options.content_type.clone(),
            access_policy: options.access_policy,
            last_modified: Utc::now(),
        }
    }

    /// `s3://bucket/key` style locator used in logs and COPY statements.
    pub fn locator(&self) -> String {
        object_locator(&self.bucket, &self.key)
    }
}

pub fn object_locator(bucket: &str, key: &str) -> String {
    format!("s3://{bucket}/{key}")
}

pub fn sha256_hex(payload: &[u8]) -> String {
    format!("{:x}", Sha256::digest(payload))
}

/// Reject keys that could escape the bucket or are otherwise unusable.
pub fn validate_location(bucket: &str, key: &str) -> Result<(), StageError> {
    let invalid = |message: &str| StageError::storage_write(bucket, key, message);
    if bucket.is_empty() || bucket.contains('/') || bucket.starts_with('.') {
        return Err(invalid("invalid bucket name"));
    }
    if key.is_empty() || key.starts_with('/') || key.ends_with('/') || key.contains('\\') {
        return Err(invalid("invalid object key"));
    }
    if key.split('/').any(|part| part.is_empty() || part == "." || part == "..") {
        return Err(invalid("object key may not contain empty, '.' or '..' segments"));
    }
    Ok(())
}

/// Trait for object store backends.
///
/// Writes are all-or-nothing per key: a failed put leaves any previous
/// object at that key untouched. Concurrent puts to one key are
/// last-writer-wins.
#[async_trait]
pub trait ObjectStore: Send + Sync {
    /// Short backend name for logs.
    fn name(&self) -> &str;

    async fn put_object(
        &self,
        bucket: &str,
        key: &str,
        payload: Bytes,
        options: PutOptions,
    ) -> Result<ObjectMeta, StageError>;

    async fn get_object(&self, bucket: &str, key: &str) -> Result<Bytes, StageError>;

    /// Metadata for a key, or `None` if absent.
    async fn head_object(&self, bucket: &str, key: &str) -> Result<Option<ObjectMeta>, StageError>;

    async fn delete_object(&self, bucket: &str, key: &str) -> Result<bool, StageError>;

    /// Keys in `bucket` starting with `prefix`, sorted.
    async fn list_objects(&self, bucket: &str, prefix: &str) -> Result<Vec<String>, StageError>;

    async fn exists(&self, bucket: &str, key: &str) -> Result<bool, StageError> {
        Ok(self.head_object(bucket, key).await?.is_some())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_validate_location() {
        assert!(validate_location("imdb-dend-analytics", "imdb/title.basics.tsv.gz").is_ok());
        assert!(validate_location("", "k").is_err());
        assert!(validate_location("b/x", "k").is_err());
        assert!(validate_location("b", "/abs").is_err());
        assert!(validate_location("b", "a/../../etc").is_err());
        assert!(validate_location("b", "a//b").is_err());
        assert!(validate_location("b", "dir/").is_err());
    }

    #[test]
    fn test_access_policy_serde() {
        let json = serde_json::to_string(&AccessPolicy::BucketOwnerFullControl).unwrap();
        assert_eq!(json, "\"bucket-owner-full-control\"");
        let parsed: AccessPolicy = serde_json::from_str("\"public-read\"").unwrap();
        assert_eq!(parsed, AccessPolicy::PublicRead);
        assert_eq!(parsed.to_string(), "public-read");
    }

    #[test]
    fn test_meta_describe() {
        let meta = ObjectMeta::describe("b", "k.tsv", b"abc", &PutOptions::overwrite());
        assert_eq!(meta.size, 3);
        assert_eq!(
            meta.sha256,
            "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad"
        );
        assert_eq!(meta.locator(), "s3://b/k.tsv");
    }
}
