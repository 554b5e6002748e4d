//! Resumable, verified movement of artifacts to and from a blob store.

pub mod blob;
pub mod fs;
pub mod s3;
pub mod session;

use std::future::Future;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use tokio::io::{AsyncReadExt, AsyncSeekExt, AsyncWriteExt};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::TransferConfig;
use crate::digest::{ContentDigest, DigestAlgorithm, verify_file};
use crate::errors::{AppError, Result};
use crate::model::{Snapshot, SnapshotStatus};

pub use blob::{BlobError, BlobResult, BlobStore, CompletedPart};
pub use fs::FsBlobStore;
pub use s3::S3BlobStore;
pub use session::{Direction, MarkerStore, TransferMarker};

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TransferReport {
    pub bytes: u64,
    /// Chunks actually sent or fetched by this call; resumed chunks are not counted.
    pub chunks_transferred: u32,
    pub resumed_from: u64,
    /// Whether a failed verification forced one restart from zero.
    pub restarted: bool,
}

pub fn manifest_key(remote_key: &str) -> String {
    format!("{}.manifest.json", remote_key)
}

/// Where an upload is assembled and verified before it is promoted to its key.
pub fn staging_key(remote_key: &str) -> String {
    format!("{}.incoming", remote_key)
}

pub fn partial_path(dest: &Path) -> PathBuf {
    let mut name = dest.as_os_str().to_owned();
    name.push(".partial");
    PathBuf::from(name)
}

pub struct TransferEngine {
    store: Arc<dyn BlobStore>,
    markers: MarkerStore,
    config: TransferConfig,
}

impl TransferEngine {
    pub fn new(store: Arc<dyn BlobStore>, markers: MarkerStore, config: TransferConfig) -> Self {
        Self {
            store,
            markers,
            config,
        }
    }

    pub fn describe(&self, key: &str) -> String {
        self.store.describe(key)
    }

    pub fn key_for_locator(&self, locator: &str) -> Option<String> {
        self.store.key_for_locator(locator)
    }

    /// Uploads the snapshot's local artifact to `remote_key` and returns the
    /// snapshot in REMOTE state once the stored object has been re-read and
    /// its digest matches. The object is assembled under `staging_key` and
    /// only moved to `remote_key` after it verified.
    pub async fn upload(
        &self,
        snapshot: &Snapshot,
        remote_key: &str,
        cancel: &CancellationToken,
    ) -> Result<(Snapshot, TransferReport)> {
        let local = snapshot.local_path.clone().ok_or_else(|| {
            AppError::Catalog(format!("snapshot {} has no local artifact", snapshot.id))
        })?;
        // Never ship a corrupted artifact.
        verify_file(&local, &snapshot.digest).await?;

        info!(snapshot = %snapshot.id, key = %remote_key, bytes = snapshot.size_bytes, "Starting upload");
        let mut restarted = false;
        let report = loop {
            match self.upload_once(snapshot, &local, remote_key, cancel).await {
                Ok(report) => break report,
                Err(AppError::TransferIntegrityFailed { .. }) if !restarted => {
                    warn!(snapshot = %snapshot.id, key = %remote_key, "Uploaded object failed verification, restarting from zero");
                    restarted = true;
                }
                Err(e) => {
                    if e.is_cancellation() {
                        self.abandon_upload(&snapshot.id, remote_key).await;
                    }
                    return Err(e);
                }
            }
        };

        let location = self.store.describe(remote_key);
        let uploading = match snapshot.status {
            SnapshotStatus::Uploading => snapshot.clone(),
            _ => snapshot.transition(SnapshotStatus::Uploading)?,
        };
        let remote = uploading.stored_at(location)?;

        let mut manifest = remote.clone();
        manifest.local_path = None;
        let body = serde_json::to_vec_pretty(&manifest)?;
        let manifest_key = manifest_key(remote_key);
        self.with_retry(&manifest_key, "manifest upload", cancel, || {
            self.store.put(&manifest_key, body.clone())
        })
        .await?;
        self.markers.clear(&snapshot.id, Direction::Upload)?;

        info!(
            snapshot = %snapshot.id,
            location = remote.storage_location.as_deref().unwrap_or_default(),
            chunks = report.chunks_transferred,
            resumed_from = report.resumed_from,
            "Upload verified"
        );
        Ok((remote, TransferReport { restarted, ..report }))
    }

    async fn upload_once(
        &self,
        snapshot: &Snapshot,
        local: &Path,
        key: &str,
        cancel: &CancellationToken,
    ) -> Result<TransferReport> {
        let total = tokio::fs::metadata(local).await?.len();
        let staging = staging_key(key);
        let mut marker = match self.markers.load(&snapshot.id, Direction::Upload) {
            Some(marker) if marker.matches(key, total) => marker,
            Some(stale) => {
                if let Some(upload_id) = &stale.upload_id {
                    let stale_key = staging_key(&stale.remote_key);
                    if let Err(e) = self.store.abort_upload(&stale_key, upload_id).await {
                        warn!(key = %stale_key, upload_id = %upload_id, error = %e, "Failed to abort stale multipart upload");
                    }
                }
                TransferMarker::new(&snapshot.id, Direction::Upload, key, total)
            }
            None => TransferMarker::new(&snapshot.id, Direction::Upload, key, total),
        };
        let resumed_from = marker.bytes_completed;
        if resumed_from > 0 {
            info!(snapshot = %snapshot.id, resumed_from, total, "Resuming upload");
        }
        marker.attempt_count += 1;
        self.markers.save(&marker)?;

        let mut chunks_transferred = 0u32;
        if total == 0 {
            self.with_retry(&staging, "upload", cancel, || self.store.put(&staging, Vec::new()))
                .await?;
        } else if !marker.completed {
            let upload_id = match marker.upload_id.clone() {
                Some(id) => id,
                None => {
                    let id = self
                        .with_retry(&staging, "begin upload", cancel, || {
                            self.store.begin_upload(&staging)
                        })
                        .await?;
                    marker.upload_id = Some(id.clone());
                    self.markers.save(&marker)?;
                    id
                }
            };

            let mut file = tokio::fs::File::open(local).await?;
            file.seek(std::io::SeekFrom::Start(marker.bytes_completed)).await?;
            while marker.bytes_completed < total {
                let len = self.config.chunk_size_bytes.min(total - marker.bytes_completed);
                let mut chunk = vec![0u8; len as usize];
                file.read_exact(&mut chunk).await?;

                let number = marker.parts.len() as u32 + 1;
                let part = self
                    .with_retry(&staging, "upload part", cancel, || {
                        self.store.upload_part(&staging, &upload_id, number, chunk.clone())
                    })
                    .await?;
                marker.parts.push(part);
                marker.bytes_completed += len;
                self.markers.save(&marker)?;
                chunks_transferred += 1;
                debug!(snapshot = %snapshot.id, part = number, done = marker.bytes_completed, total, "Part uploaded");
            }

            let parts = marker.parts.clone();
            self.with_retry(&staging, "complete upload", cancel, || {
                self.store.complete_upload(&staging, &upload_id, &parts)
            })
            .await?;
            marker.completed = true;
            self.markers.save(&marker)?;
        }

        // A run interrupted right after promotion resumes with nothing left to stage.
        let promoted = marker.completed
            && !self.with_retry(&staging, "stat", cancel, || self.store.exists(&staging)).await?
            && self.with_retry(key, "stat", cancel, || self.store.exists(key)).await?;
        let verify = if promoted { key } else { staging.as_str() };

        let (actual, _) = self
            .remote_digest(verify, snapshot.digest.algorithm, cancel)
            .await?;
        if actual != snapshot.digest {
            warn!(snapshot = %snapshot.id, key = %verify, expected = %snapshot.digest, actual = %actual, "Remote digest mismatch");
            self.with_retry(verify, "delete", cancel, || self.store.delete(verify))
                .await?;
            self.markers.clear(&snapshot.id, Direction::Upload)?;
            return Err(AppError::TransferIntegrityFailed {
                key: key.to_string(),
                expected: snapshot.digest.clone(),
                actual,
            });
        }
        if !promoted {
            self.with_retry(key, "promote", cancel, || self.store.promote(&staging, key))
                .await?;
        }

        Ok(TransferReport {
            bytes: total,
            chunks_transferred,
            resumed_from,
            restarted: false,
        })
    }

    /// Best-effort cleanup after a cancelled upload.
    async fn abandon_upload(&self, artifact_id: &str, key: &str) {
        let staging = staging_key(key);
        if let Some(marker) = self.markers.load(artifact_id, Direction::Upload) {
            if let Some(upload_id) = &marker.upload_id {
                if let Err(e) = self.store.abort_upload(&staging, upload_id).await {
                    warn!(key = %key, error = %e, "Failed to abort multipart upload");
                }
            }
        }
        if let Err(e) = self.store.delete(&staging).await {
            warn!(key = %staging, error = %e, "Failed to delete staged upload");
        }
        if let Err(e) = self.markers.clear(artifact_id, Direction::Upload) {
            warn!(key = %key, error = %e, "Failed to clear upload marker");
        }
    }

    /// Downloads `remote_key` to `dest` through `<dest>.partial`, resuming a
    /// previous partial download and verifying against `expected` before the
    /// final rename.
    pub async fn download(
        &self,
        artifact_id: &str,
        remote_key: &str,
        dest: &Path,
        expected: &ContentDigest,
        cancel: &CancellationToken,
    ) -> Result<TransferReport> {
        let partial = partial_path(dest);
        if let Some(parent) = dest.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }

        info!(snapshot = %artifact_id, key = %remote_key, dest = %dest.display(), "Starting download");
        let mut restarted = false;
        loop {
            match self
                .download_once(artifact_id, remote_key, &partial, expected, cancel)
                .await
            {
                Ok(report) => {
                    tokio::fs::rename(&partial, dest).await?;
                    self.markers.clear(artifact_id, Direction::Download)?;
                    info!(snapshot = %artifact_id, dest = %dest.display(), bytes = report.bytes, "Download verified");
                    return Ok(TransferReport { restarted, ..report });
                }
                Err(AppError::TransferIntegrityFailed { .. }) if !restarted => {
                    warn!(snapshot = %artifact_id, key = %remote_key, "Downloaded data failed verification, restarting from zero");
                    self.discard_partial(artifact_id, &partial).await;
                    restarted = true;
                }
                Err(e) => {
                    if e.is_cancellation()
                        || matches!(e, AppError::TransferIntegrityFailed { .. })
                    {
                        self.discard_partial(artifact_id, &partial).await;
                    }
                    return Err(e);
                }
            }
        }
    }

    async fn download_once(
        &self,
        artifact_id: &str,
        key: &str,
        partial: &Path,
        expected: &ContentDigest,
        cancel: &CancellationToken,
    ) -> Result<TransferReport> {
        let total = self
            .with_retry(key, "stat", cancel, || self.store.stat(key))
            .await?
            .ok_or_else(|| AppError::TransferRejected {
                key: key.to_string(),
                reason: "object does not exist".to_string(),
            })?;

        let mut marker = match self.markers.load(artifact_id, Direction::Download) {
            Some(marker) if marker.matches(key, total) => marker,
            _ => TransferMarker::new(artifact_id, Direction::Download, key, total),
        };
        let on_disk = match tokio::fs::metadata(partial).await {
            Ok(meta) => meta.len(),
            Err(_) => 0,
        };
        if on_disk < marker.bytes_completed {
            marker.bytes_completed = 0;
        }
        let resumed_from = marker.bytes_completed;
        if resumed_from > 0 {
            info!(snapshot = %artifact_id, resumed_from, total, "Resuming download");
        }
        marker.attempt_count += 1;
        self.markers.save(&marker)?;

        let mut file = tokio::fs::OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(false)
            .open(partial)
            .await?;
        file.set_len(marker.bytes_completed).await?;
        file.seek(std::io::SeekFrom::Start(marker.bytes_completed)).await?;

        let mut chunks_transferred = 0u32;
        while marker.bytes_completed < total {
            let offset = marker.bytes_completed;
            let len = self.config.chunk_size_bytes.min(total - offset);
            let data = self
                .with_retry(key, "download range", cancel, || {
                    self.store.get_range(key, offset, len)
                })
                .await?;
            if data.is_empty() {
                return Err(AppError::TransferRejected {
                    key: key.to_string(),
                    reason: format!("object ended at {} of {} bytes", offset, total),
                });
            }
            file.write_all(&data).await?;
            file.sync_data().await?;
            marker.bytes_completed += data.len() as u64;
            self.markers.save(&marker)?;
            chunks_transferred += 1;
        }
        file.flush().await?;
        file.sync_all().await?;
        drop(file);

        match verify_file(partial, expected).await {
            Ok(()) => Ok(TransferReport {
                bytes: total,
                chunks_transferred,
                resumed_from,
                restarted: false,
            }),
            Err(AppError::IntegrityMismatch { actual, .. }) => {
                Err(AppError::TransferIntegrityFailed {
                    key: key.to_string(),
                    expected: expected.clone(),
                    actual,
                })
            }
            Err(e) => Err(e),
        }
    }

    /// Removes a downloaded copy of `artifact_id` at `dest`, together with any
    /// partial download and its resume marker.
    pub async fn discard_download(&self, artifact_id: &str, dest: &Path) -> Result<()> {
        match tokio::fs::remove_file(dest).await {
            Ok(()) => info!(snapshot = %artifact_id, path = %dest.display(), "Removed downloaded artifact"),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(e.into()),
        }
        self.discard_partial(artifact_id, &partial_path(dest)).await;
        Ok(())
    }

    async fn discard_partial(&self, artifact_id: &str, partial: &Path) {
        if let Err(e) = tokio::fs::remove_file(partial).await {
            if e.kind() != std::io::ErrorKind::NotFound {
                warn!(partial = %partial.display(), error = %e, "Failed to remove partial download");
            }
        }
        if let Err(e) = self.markers.clear(artifact_id, Direction::Download) {
            warn!(snapshot = %artifact_id, error = %e, "Failed to clear download marker");
        }
    }

    /// Reads the snapshot metadata stored next to an uploaded artifact.
    pub async fn fetch_manifest(
        &self,
        remote_key: &str,
        cancel: &CancellationToken,
    ) -> Result<Snapshot> {
        let key = manifest_key(remote_key);
        let size = self
            .with_retry(&key, "stat", cancel, || self.store.stat(&key))
            .await?
            .ok_or_else(|| AppError::SnapshotNotFound(self.store.describe(remote_key)))?;
        let body = self
            .with_retry(&key, "manifest download", cancel, || {
                self.store.get_range(&key, 0, size)
            })
            .await?;
        Ok(serde_json::from_slice(&body)?)
    }

    /// Removes an uploaded artifact and its manifest.
    pub async fn delete_remote(&self, remote_key: &str, cancel: &CancellationToken) -> Result<()> {
        let manifest = manifest_key(remote_key);
        self.with_retry(remote_key, "delete", cancel, || self.store.delete(remote_key))
            .await?;
        self.with_retry(&manifest, "delete", cancel, || self.store.delete(&manifest))
            .await?;
        Ok(())
    }

    async fn remote_digest(
        &self,
        key: &str,
        algorithm: DigestAlgorithm,
        cancel: &CancellationToken,
    ) -> Result<(ContentDigest, u64)> {
        let size = self
            .with_retry(key, "stat", cancel, || self.store.stat(key))
            .await?
            .ok_or_else(|| AppError::TransferRejected {
                key: key.to_string(),
                reason: "object missing after upload".to_string(),
            })?;

        let mut hasher = algorithm.hasher();
        let mut offset = 0u64;
        while offset < size {
            let len = self.config.chunk_size_bytes.min(size - offset);
            let data = self
                .with_retry(key, "verify range", cancel, || {
                    self.store.get_range(key, offset, len)
                })
                .await?;
            if data.is_empty() {
                break;
            }
            hasher.update(&data);
            offset += data.len() as u64;
        }
        let bytes = hasher.bytes();
        Ok((hasher.finish(), bytes))
    }

    /// Runs one blob operation with a per-attempt timeout, retrying transient
    /// failures with exponential backoff.
    async fn with_retry<T, F, Fut>(
        &self,
        key: &str,
        what: &str,
        cancel: &CancellationToken,
        mut op: F,
    ) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = BlobResult<T>>,
    {
        let mut attempt = 0u32;
        loop {
            attempt += 1;
            let outcome = tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    return Err(AppError::Cancelled(format!("{} of {}", what, key)));
                }
                outcome = tokio::time::timeout(self.config.chunk_timeout, op()) => outcome,
            };

            let error = match outcome {
                Ok(Ok(value)) => return Ok(value),
                Ok(Err(e)) => e,
                Err(_) => BlobError::Transient(format!(
                    "{} timed out after {:?}",
                    what, self.config.chunk_timeout
                )),
            };
            if !error.is_transient() {
                return Err(error.into_app_error(key));
            }
            if attempt >= self.config.max_attempts {
                return Err(AppError::TransferRetriesExhausted {
                    key: key.to_string(),
                    attempts: attempt,
                    last_error: error.to_string(),
                });
            }

            let delay = self.config.backoff_delay(attempt);
            warn!(
                key = %key,
                attempt,
                max_attempts = self.config.max_attempts,
                delay_ms = delay.as_millis() as u64,
                error = %error,
                "{} failed, retrying", what
            );
            tokio::select! {
                _ = cancel.cancelled() => {
                    return Err(AppError::Cancelled(format!("{} of {}", what, key)));
                }
                _ = tokio::time::sleep(delay) => {}
            }
        }
    }
}
