//! Captures a snapshot of a service into a verified local artifact.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::Utc;
use tempfile::NamedTempFile;
use tokio::io::{AsyncWriteExt, BufWriter};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::catalog::CatalogStore;
use crate::digest::{ChecksummingWriter, ContentDigest, DigestAlgorithm};
use crate::errors::{AppError, Result};
use crate::model::{Scope, ServiceKind, Snapshot, validate_name};
use crate::targets::{ServiceTarget, SnapshotSource};

/// Prefix of in-progress artifacts, followed by the owning target's name.
pub const PARTIAL_PREFIX: &str = ".snap-";
pub const PARTIAL_SUFFIX: &str = ".partial";

pub struct SnapshotProducer {
    catalog: Arc<CatalogStore>,
    artifact_dir: PathBuf,
    algorithm: DigestAlgorithm,
}

impl SnapshotProducer {
    pub fn new(catalog: Arc<CatalogStore>, artifact_dir: PathBuf, algorithm: DigestAlgorithm) -> Self {
        Self {
            catalog,
            artifact_dir,
            algorithm,
        }
    }

    /// Streams a snapshot of `target` to `<artifact_dir>/<id>.<ext>` and
    /// records it as LOCAL. Nothing is recorded and no file is left behind
    /// unless the capture succeeds.
    pub async fn produce(
        &self,
        target: &dyn ServiceTarget,
        scope: &Scope,
        cancel: &CancellationToken,
    ) -> Result<Snapshot> {
        if let Scope::NamedSubset(name) = scope {
            validate_name("subset", name)?;
            if target.kind() == ServiceKind::KeyValue {
                return Err(AppError::UnsupportedScope {
                    target: target.name().to_string(),
                    scope: scope.to_string(),
                });
            }
        }

        target.ping().await?;
        tokio::fs::create_dir_all(&self.artifact_dir).await?;

        let created_at = Utc::now();
        let reservation = self.catalog.allocate_id(target.name(), created_at);
        let pending = Snapshot::creating(
            reservation.id().to_string(),
            target.kind(),
            target.name(),
            scope.clone(),
            created_at,
            self.algorithm,
        );
        info!(snapshot = %pending.id, target_name = %target.name(), scope = %scope, "Capturing snapshot");

        let temp = tempfile::Builder::new()
            .prefix(&partial_prefix(target.name()))
            .suffix(PARTIAL_SUFFIX)
            .tempfile_in(&self.artifact_dir)?;

        // Dropping `temp` on any early return removes the partial file.
        let (size_bytes, digest) = self.capture(target, scope, &temp, cancel).await?;
        if size_bytes == 0 {
            return Err(AppError::ProducerOutputEmpty {
                target: target.name().to_string(),
            });
        }

        let dest = self.artifact_dir.join(pending.artifact_file_name());
        temp.persist_noclobber(&dest)
            .map_err(|e| AppError::Io(e.error))?;

        let snapshot = pending.captured(size_bytes, digest, dest.clone())?;
        if let Err(e) = self.catalog.put(snapshot.clone()) {
            if let Err(remove) = tokio::fs::remove_file(&dest).await {
                warn!(path = %dest.display(), error = %remove, "Failed to remove unrecorded artifact");
            }
            return Err(e);
        }
        drop(reservation);

        info!(
            snapshot = %snapshot.id,
            bytes = snapshot.size_bytes,
            digest = %snapshot.digest,
            path = %dest.display(),
            "Snapshot captured"
        );
        Ok(snapshot)
    }

    async fn capture(
        &self,
        target: &dyn ServiceTarget,
        scope: &Scope,
        temp: &NamedTempFile,
        cancel: &CancellationToken,
    ) -> Result<(u64, ContentDigest)> {
        let file = tokio::fs::File::from_std(temp.as_file().try_clone()?);
        let mut writer = ChecksummingWriter::new(BufWriter::new(file), self.algorithm);

        let SnapshotSource {
            mut stream,
            completion,
        } = target.snapshot(scope).await?;

        let copied = tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                return Err(AppError::Cancelled(format!("snapshot of {}", target.name())));
            }
            copied = tokio::io::copy(&mut stream, &mut writer) => copied,
        };
        drop(stream);

        let finished = tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                return Err(AppError::Cancelled(format!("snapshot of {}", target.name())));
            }
            finished = completion => finished,
        };
        // The exit status outranks a broken pipe on our side.
        finished?;
        let copied = copied?;
        debug!(target_name = %target.name(), bytes = copied, "Snapshot stream drained");

        writer.flush().await?;
        let (buffered, digest, size_bytes) = writer.finalize();
        buffered.get_ref().sync_all().await?;
        Ok((size_bytes, digest))
    }
}

fn partial_prefix(target_name: &str) -> String {
    format!("{}{}.", PARTIAL_PREFIX, target_name)
}

/// Target that owns a partial artifact named `.snap-<target>.<random>.partial`.
fn partial_owner(file_name: &str) -> Option<&str> {
    let inner = file_name
        .strip_prefix(PARTIAL_PREFIX)?
        .strip_suffix(PARTIAL_SUFFIX)?;
    inner.rsplit_once('.').map(|(owner, _)| owner)
}

/// Removes artifacts a crashed capture left behind. A partial is only
/// removed while `claim` holds its owning target, so captures still running
/// in another process keep their files.
pub fn sweep_partials<G>(
    artifact_dir: &Path,
    mut claim: impl FnMut(&str) -> Option<G>,
) -> Result<usize> {
    let entries = match std::fs::read_dir(artifact_dir) {
        Ok(entries) => entries,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(0),
        Err(e) => return Err(e.into()),
    };
    let mut removed = 0;
    for entry in entries {
        let entry = entry?;
        let name = entry.file_name();
        let name = name.to_string_lossy();
        if !(name.starts_with(PARTIAL_PREFIX) && name.ends_with(PARTIAL_SUFFIX)) {
            continue;
        }
        let _claim = match partial_owner(&name) {
            Some(owner) => match claim(owner) {
                Some(guard) => Some(guard),
                None => {
                    debug!(partial = %name, owner = %owner, "Capture in progress, keeping partial");
                    continue;
                }
            },
            None => None,
        };
        std::fs::remove_file(entry.path())?;
        removed += 1;
    }
    if removed > 0 {
        warn!(dir = %artifact_dir.display(), removed, "Removed stale partial artifacts");
    }
    Ok(removed)
}
