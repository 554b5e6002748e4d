use std::fmt;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::errors::AppError;

/// Failure reported by a blob store, already classified for retry decisions.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BlobError {
    /// Timeouts, connection resets, 5xx, throttling.
    Transient(String),
    Unauthorized(String),
    NotFound(String),
    QuotaExceeded(String),
    /// Anything else the store refuses outright.
    Rejected(String),
}

impl BlobError {
    pub fn is_transient(&self) -> bool {
        matches!(self, BlobError::Transient(_))
    }

    pub fn into_app_error(self, key: &str) -> AppError {
        match self {
            BlobError::Unauthorized(reason) => AppError::AuthorizationFailed {
                key: key.to_string(),
                reason,
            },
            BlobError::NotFound(reason) => AppError::TransferRejected {
                key: key.to_string(),
                reason: format!("not found: {}", reason),
            },
            BlobError::QuotaExceeded(reason) => AppError::TransferRejected {
                key: key.to_string(),
                reason: format!("quota exceeded: {}", reason),
            },
            BlobError::Rejected(reason) | BlobError::Transient(reason) => {
                AppError::TransferRejected {
                    key: key.to_string(),
                    reason,
                }
            }
        }
    }
}

impl fmt::Display for BlobError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BlobError::Transient(m) => write!(f, "transient: {}", m),
            BlobError::Unauthorized(m) => write!(f, "unauthorized: {}", m),
            BlobError::NotFound(m) => write!(f, "not found: {}", m),
            BlobError::QuotaExceeded(m) => write!(f, "quota exceeded: {}", m),
            BlobError::Rejected(m) => write!(f, "rejected: {}", m),
        }
    }
}

impl std::error::Error for BlobError {}

impl From<std::io::Error> for BlobError {
    fn from(e: std::io::Error) -> Self {
        match e.kind() {
            std::io::ErrorKind::NotFound => BlobError::NotFound(e.to_string()),
            std::io::ErrorKind::PermissionDenied => BlobError::Unauthorized(e.to_string()),
            _ => BlobError::Transient(e.to_string()),
        }
    }
}

pub type BlobResult<T> = std::result::Result<T, BlobError>;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CompletedPart {
    /// 1-based, in upload order.
    pub number: u32,
    pub etag: String,
    pub size: u64,
}

/// Remote object storage as seen by the transfer engine. Multipart uploads
/// are staged: nothing is visible under `key` until `complete_upload`.
#[async_trait]
pub trait BlobStore: Send + Sync {
    /// Human-readable locator for `key`, e.g. `s3://bucket/prefix/key`.
    fn describe(&self, key: &str) -> String;

    /// Maps a locator produced by `describe` back to a key, if it belongs to
    /// this store.
    fn key_for_locator(&self, locator: &str) -> Option<String>;

    async fn put(&self, key: &str, body: Vec<u8>) -> BlobResult<()>;

    /// Reads `len` bytes starting at `offset`; shorter only at end of object.
    async fn get_range(&self, key: &str, offset: u64, len: u64) -> BlobResult<Vec<u8>>;

    /// Object size, or `None` if it does not exist.
    async fn stat(&self, key: &str) -> BlobResult<Option<u64>>;

    async fn exists(&self, key: &str) -> BlobResult<bool> {
        Ok(self.stat(key).await?.is_some())
    }

    /// Deleting a missing object is not an error.
    async fn delete(&self, key: &str) -> BlobResult<()>;

    async fn begin_upload(&self, key: &str) -> BlobResult<String>;

    async fn upload_part(
        &self,
        key: &str,
        upload_id: &str,
        number: u32,
        body: Vec<u8>,
    ) -> BlobResult<CompletedPart>;

    async fn complete_upload(
        &self,
        key: &str,
        upload_id: &str,
        parts: &[CompletedPart],
    ) -> BlobResult<()>;

    async fn abort_upload(&self, key: &str, upload_id: &str) -> BlobResult<()>;

    /// Moves the object at `from` to `to`, replacing anything already there.
    async fn promote(&self, from: &str, to: &str) -> BlobResult<()>;
}
