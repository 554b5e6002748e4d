//! Operation surface: backup, upload, restore, listing and retention.

mod locks;

use std::collections::HashMap;
use std::future::Future;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::catalog::{CatalogStore, SnapshotListing};
use crate::config::{AppConfig, StorageConfig};
use crate::digest::{ContentDigest, DigestAlgorithm};
use crate::errors::{AppError, Result};
use crate::model::{Scope, Snapshot, SnapshotStatus};
use crate::producer::{SnapshotProducer, sweep_partials};
use crate::restore::{RestoreCoordinator, RestoreReport, sweep_abandoned_runs};
use crate::targets::{ServiceTarget, build_target};
use crate::transfer::{BlobStore, FsBlobStore, MarkerStore, S3BlobStore, TransferEngine};

use locks::TargetLocks;

#[derive(Debug, Clone)]
pub struct BackupOptions {
    /// Upload to remote storage after capture.
    pub upload: bool,
    pub deadline: Option<Duration>,
}

impl Default for BackupOptions {
    fn default() -> Self {
        Self {
            upload: true,
            deadline: None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct RestoreRequest {
    /// Catalog id, local artifact path, or remote locator (`s3://bucket/key`, `file://...`).
    pub snapshot_ref: String,
    pub scope: Scope,
    pub force: bool,
    pub confirmation: Option<String>,
    pub deadline: Option<Duration>,
}

/// Outcome of the dry-run validation pass.
#[derive(Debug, Clone)]
pub struct RestorePreview {
    pub target: String,
    pub snapshot: Snapshot,
    pub scope: Scope,
    pub token: String,
}

/// Token binding a confirmation to one target, snapshot content and scope.
pub fn confirmation_token(target: &str, snapshot: &Snapshot, scope: &Scope) -> String {
    let material = format!("{}\n{}\n{}\n{}", target, snapshot.id, snapshot.digest, scope);
    let digest = ContentDigest::of_bytes(DigestAlgorithm::Sha256, material.as_bytes());
    digest.hex[..16].to_string()
}

pub fn remote_key(snapshot: &Snapshot) -> String {
    format!("{}/{}", snapshot.source_name, snapshot.artifact_file_name())
}

/// A snapshot reference resolved to catalog metadata.
struct Resolved {
    snapshot: Snapshot,
    /// Read from a remote manifest and not yet in the catalog.
    imported: bool,
}

/// Runs `op` under a child of `cancel`, cancelling it once `deadline` passes.
/// The operation is still awaited after the deadline so it can clean up.
async fn with_deadline<T, F, Fut>(
    deadline: Option<Duration>,
    cancel: &CancellationToken,
    what: &str,
    op: F,
) -> Result<T>
where
    F: FnOnce(CancellationToken) -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let child = cancel.child_token();
    let Some(limit) = deadline else {
        return op(child).await;
    };

    let fut = op(child.clone());
    tokio::pin!(fut);
    tokio::select! {
        result = &mut fut => result,
        _ = tokio::time::sleep(limit) => {
            child.cancel();
            match fut.await {
                Err(e) if e.is_cancellation() && !cancel.is_cancelled() => {
                    Err(AppError::DeadlineExceeded(format!(
                        "{} did not finish within {:?}",
                        what, limit
                    )))
                }
                other => other,
            }
        }
    }
}

pub struct Engine {
    catalog: Arc<CatalogStore>,
    producer: SnapshotProducer,
    transfer: Option<TransferEngine>,
    coordinator: RestoreCoordinator,
    targets: HashMap<String, Arc<dyn ServiceTarget>>,
    locks: TargetLocks,
    artifact_dir: PathBuf,
}

impl Engine {
    /// Builds the engine from configuration, connecting the configured remote storage.
    pub async fn open(config: &AppConfig) -> Result<Self> {
        let store: Option<Arc<dyn BlobStore>> = match &config.storage {
            Some(StorageConfig::S3(spaces)) => Some(Arc::new(S3BlobStore::connect(spaces).await)),
            Some(StorageConfig::Local(dir)) => Some(Arc::new(FsBlobStore::new(dir.clone()))),
            None => None,
        };
        let targets = config.targets.iter().map(build_target).collect();
        Self::new(config, store, targets)
    }

    pub fn new(
        config: &AppConfig,
        store: Option<Arc<dyn BlobStore>>,
        targets: Vec<Arc<dyn ServiceTarget>>,
    ) -> Result<Self> {
        let catalog = Arc::new(CatalogStore::open(&config.catalog_path())?);
        let artifact_dir = config.artifact_dir();
        let locks = TargetLocks::new(config.lock_dir());
        sweep_partials(&artifact_dir, |owner| locks.acquire(owner).ok())?;
        let retained = sweep_abandoned_runs(&config.staging_dir(), |target| {
            locks.acquire(target).ok()
        })?;
        if !retained.is_empty() {
            warn!(
                copies = retained.len(),
                "Pre-restore copies from interrupted restores are waiting for review"
            );
        }

        let transfer = store.map(|store| {
            TransferEngine::new(
                store,
                MarkerStore::new(config.transfer_state_dir()),
                config.transfer.clone(),
            )
        });
        if transfer.is_none() {
            info!("No remote storage configured; snapshots stay local");
        }

        Ok(Self {
            producer: SnapshotProducer::new(
                catalog.clone(),
                artifact_dir.clone(),
                DigestAlgorithm::Sha256,
            ),
            coordinator: RestoreCoordinator::new(
                catalog.clone(),
                config.staging_dir(),
                config.retain_pre_restore_copy,
            ),
            catalog,
            transfer,
            targets: targets
                .into_iter()
                .map(|target| (target.name().to_string(), target))
                .collect(),
            locks,
            artifact_dir,
        })
    }

    pub fn catalog(&self) -> &CatalogStore {
        &self.catalog
    }

    pub fn has_remote_storage(&self) -> bool {
        self.transfer.is_some()
    }

    fn target(&self, name: &str) -> Result<Arc<dyn ServiceTarget>> {
        self.targets
            .get(name)
            .cloned()
            .ok_or_else(|| AppError::Config(format!("no target named '{}' is configured", name)))
    }

    fn transfer(&self) -> Result<&TransferEngine> {
        self.transfer
            .as_ref()
            .ok_or_else(|| AppError::Config("no remote storage is configured".to_string()))
    }

    pub async fn run_backup(
        &self,
        target_name: &str,
        scope: Scope,
        options: BackupOptions,
        cancel: &CancellationToken,
    ) -> Result<Snapshot> {
        let target = self.target(target_name)?;
        if options.upload {
            self.transfer()?;
        }
        let _lease = self.locks.acquire(target_name)?;

        with_deadline(options.deadline, cancel, "backup", |cancel| async move {
            let snapshot = self
                .producer
                .produce(target.as_ref(), &scope, &cancel)
                .await
                .map_err(|e| AppError::in_phase("PRODUCE", target_name, e))?;
            if !options.upload {
                return Ok(snapshot);
            }
            self.upload_inner(snapshot, &cancel).await
        })
        .await
    }

    /// Uploads a LOCAL snapshot, or resumes one left UPLOADING.
    pub async fn upload_snapshot(&self, id: &str, cancel: &CancellationToken) -> Result<Snapshot> {
        let snapshot = self.catalog.get(id)?;
        if snapshot.status == SnapshotStatus::Remote {
            info!(snapshot = %id, "Snapshot is already stored remotely");
            return Ok(snapshot);
        }
        let _lease = self.locks.acquire(&snapshot.source_name)?;
        self.upload_inner(snapshot, cancel).await
    }

    async fn upload_inner(
        &self,
        snapshot: Snapshot,
        cancel: &CancellationToken,
    ) -> Result<Snapshot> {
        let transfer = self.transfer()?;
        let key = remote_key(&snapshot);
        let uploading = snapshot.transition(SnapshotStatus::Uploading)?;
        self.catalog.put(uploading.clone())?;

        match transfer.upload(&uploading, &key, cancel).await {
            Ok((remote, _report)) => {
                self.catalog.put(remote.clone())?;
                Ok(remote)
            }
            Err(e) => {
                // Interrupted or exhausted uploads can be resumed later.
                let next = if e.is_cancellation()
                    || matches!(e.root(), AppError::TransferRetriesExhausted { .. })
                {
                    SnapshotStatus::Local
                } else {
                    SnapshotStatus::Failed
                };
                if let Err(record) = uploading.transition(next).and_then(|s| self.catalog.put(s)) {
                    warn!(
                        snapshot = %snapshot.id,
                        error = %record,
                        "Failed to record upload outcome"
                    );
                }
                Err(AppError::in_phase("UPLOAD", snapshot.id.clone(), e))
            }
        }
    }

    /// Validates a restore without touching the target and returns the token
    /// `run_restore` needs when not forced.
    pub async fn plan_restore(
        &self,
        target_name: &str,
        snapshot_ref: &str,
        scope: Scope,
        cancel: &CancellationToken,
    ) -> Result<RestorePreview> {
        let target = self.target(target_name)?;
        let resolved = self.resolve(snapshot_ref, cancel).await?;
        let mut plan = self.coordinator.plan(resolved.snapshot, &scope)?;
        plan.snapshot = self.ensure_local(plan.snapshot, cancel).await?;
        self.coordinator
            .validate(target.as_ref(), &plan)
            .await
            .map_err(|e| AppError::in_phase("VALIDATING", plan.snapshot.id.clone(), e))?;

        let scope = plan.scope();
        let token = confirmation_token(target_name, &plan.snapshot, &scope);
        info!(
            target_name = %target_name,
            snapshot = %plan.snapshot.id,
            scope = %scope,
            "Restore plan validated"
        );
        Ok(RestorePreview {
            target: target_name.to_string(),
            snapshot: plan.snapshot,
            scope,
            token,
        })
    }

    pub async fn run_restore(
        &self,
        target_name: &str,
        request: RestoreRequest,
        cancel: &CancellationToken,
    ) -> Result<RestoreReport> {
        if !request.force && request.confirmation.is_none() {
            return Err(AppError::ConfirmationRequired {
                target: target_name.to_string(),
                snapshot: request.snapshot_ref,
            });
        }
        let target = self.target(target_name)?;
        let _lease = self.locks.acquire(target_name)?;

        with_deadline(request.deadline, cancel, "restore", |cancel| async move {
            let resolved = self.resolve(&request.snapshot_ref, &cancel).await?;
            let mut plan = self.coordinator.plan(resolved.snapshot, &request.scope)?;

            if !request.force {
                let expected = confirmation_token(target_name, &plan.snapshot, &plan.scope());
                if request.confirmation.as_deref() != Some(expected.as_str()) {
                    return Err(AppError::ConfirmationMismatch {
                        snapshot: plan.snapshot.id.clone(),
                    });
                }
            }
            if resolved.imported {
                self.import(&plan.snapshot, &request.snapshot_ref)?;
            }

            plan.snapshot = self.ensure_local(plan.snapshot, &cancel).await?;
            self.coordinator.restore(target.as_ref(), plan, &cancel).await
        })
        .await
    }

    pub fn list_snapshots(&self, source_name: Option<&str>) -> SnapshotListing {
        self.catalog.list(source_name)
    }

    /// Removes the local artifact, the remote object and the catalog entry.
    pub async fn delete_snapshot(&self, id: &str, cancel: &CancellationToken) -> Result<Snapshot> {
        let snapshot = self.catalog.get(id)?;
        let _lease = self.locks.acquire(&snapshot.source_name)?;
        self.delete_inner(snapshot, cancel).await
    }

    /// Deletes all but the newest `keep_last` snapshots of `source_name`.
    pub async fn prune(
        &self,
        source_name: &str,
        keep_last: usize,
        cancel: &CancellationToken,
    ) -> Result<Vec<Snapshot>> {
        let _lease = self.locks.acquire(source_name)?;
        let doomed: Vec<Snapshot> = self
            .catalog
            .list(Some(source_name))
            .skip(keep_last)
            .collect();

        let mut removed = Vec::with_capacity(doomed.len());
        for snapshot in doomed {
            if cancel.is_cancelled() {
                return Err(AppError::Cancelled(format!("prune of {}", source_name)));
            }
            removed.push(self.delete_inner(snapshot, cancel).await?);
        }
        info!(source = %source_name, kept = keep_last, removed = removed.len(), "Pruned snapshots");
        Ok(removed)
    }

    async fn delete_inner(
        &self,
        snapshot: Snapshot,
        cancel: &CancellationToken,
    ) -> Result<Snapshot> {
        if snapshot.storage_location.is_some() {
            let transfer = self.transfer()?;
            transfer.delete_remote(&self.key_of(&snapshot), cancel).await?;
        }
        if let Some(path) = &snapshot.local_path {
            remove_if_present(path).await?;
        }
        // A copy fetched for a restore lives here even when the catalog has no local path.
        let downloaded = self.artifact_dir.join(snapshot.artifact_file_name());
        match &self.transfer {
            Some(transfer) => transfer.discard_download(&snapshot.id, &downloaded).await?,
            None => remove_if_present(&downloaded).await?,
        }
        self.catalog.delete(&snapshot.id)
    }

    fn key_of(&self, snapshot: &Snapshot) -> String {
        snapshot
            .storage_location
            .as_deref()
            .zip(self.transfer.as_ref())
            .and_then(|(location, transfer)| transfer.key_for_locator(location))
            .unwrap_or_else(|| remote_key(snapshot))
    }

    /// Finds the snapshot a reference names: a catalog id, a remote locator
    /// (described by its manifest) or a local artifact path. Nothing is
    /// written to the catalog here.
    async fn resolve(&self, snapshot_ref: &str, cancel: &CancellationToken) -> Result<Resolved> {
        let known = |snapshot: Snapshot| Resolved {
            snapshot,
            imported: false,
        };
        if let Some(snapshot) = self.catalog.find(snapshot_ref) {
            return Ok(known(snapshot));
        }

        if let Some(transfer) = &self.transfer {
            if let Some(key) = transfer.key_for_locator(snapshot_ref) {
                let manifest = transfer
                    .fetch_manifest(&key, cancel)
                    .await
                    .map_err(|e| AppError::in_phase("DOWNLOAD", snapshot_ref.to_string(), e))?;
                if let Some(snapshot) = self.catalog.find(&manifest.id) {
                    return Ok(known(snapshot));
                }
                let mut snapshot = manifest;
                snapshot.local_path = None;
                snapshot.storage_location = Some(snapshot_ref.to_string());
                return Ok(Resolved {
                    snapshot,
                    imported: true,
                });
            }
        }

        let path = Path::new(snapshot_ref);
        if path.is_file() {
            return self.resolve_local_path(path).await.map(known);
        }
        Err(AppError::SnapshotNotFound(snapshot_ref.to_string()))
    }

    /// Records a snapshot first seen through its remote manifest.
    fn import(&self, snapshot: &Snapshot, locator: &str) -> Result<()> {
        if self.catalog.find(&snapshot.id).is_some() {
            return Ok(());
        }
        let mut record = snapshot.clone();
        record.local_path = None;
        self.catalog.put(record)?;
        info!(snapshot = %snapshot.id, locator = %locator, "Imported remote snapshot into catalog");
        Ok(())
    }

    async fn resolve_local_path(&self, path: &Path) -> Result<Snapshot> {
        let canonical = tokio::fs::canonicalize(path).await?;
        let known = self
            .catalog
            .find_by_local_path(path)
            .or_else(|| self.catalog.find_by_local_path(&canonical));
        if let Some(snapshot) = known {
            return Ok(snapshot);
        }

        let mut sidecar = canonical.as_os_str().to_owned();
        sidecar.push(".manifest.json");
        match tokio::fs::read(&sidecar).await {
            Ok(body) => {
                let mut snapshot: Snapshot = serde_json::from_slice(&body)?;
                snapshot.local_path = Some(canonical);
                Ok(snapshot)
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                Err(AppError::SnapshotNotFound(format!(
                    "{} (no catalog entry and no manifest alongside it)",
                    path.display()
                )))
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Makes sure the artifact is on local disk, downloading it if needed.
    async fn ensure_local(
        &self,
        mut snapshot: Snapshot,
        cancel: &CancellationToken,
    ) -> Result<Snapshot> {
        if snapshot.local_path.as_deref().is_some_and(Path::is_file) {
            return Ok(snapshot);
        }
        if snapshot.storage_location.is_none() {
            return Err(AppError::SnapshotNotFound(format!(
                "{} (local artifact missing and never uploaded)",
                snapshot.id
            )));
        }

        let transfer = self.transfer()?;
        let key = self.key_of(&snapshot);
        let dest = self.artifact_dir.join(snapshot.artifact_file_name());
        transfer
            .download(&snapshot.id, &key, &dest, &snapshot.digest, cancel)
            .await
            .map_err(|e| AppError::in_phase("DOWNLOAD", snapshot.id.clone(), e))?;
        snapshot.local_path = Some(dest);
        Ok(snapshot)
    }
}

async fn remove_if_present(path: &Path) -> Result<()> {
    match tokio::fs::remove_file(path).await {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e.into()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::errors::ResultCode;
    use crate::test_support::{FlakyStore, MemoryTarget, test_transfer_config, wait_until};
    use crate::transfer::manifest_key;
    use std::sync::atomic::Ordering;

    struct Fixture {
        dir: tempfile::TempDir,
        remote: PathBuf,
    }

    impl Fixture {
        fn new() -> anyhow::Result<Self> {
            let dir = tempfile::tempdir()?;
            let remote = dir.path().join("remote");
            Ok(Self { dir, remote })
        }

        fn config(&self, work: &str) -> AppConfig {
            AppConfig {
                work_dir: self.dir.path().join(work),
                storage: Some(StorageConfig::Local(self.remote.clone())),
                transfer: test_transfer_config(8),
                retain_pre_restore_copy: true,
                targets: Vec::new(),
            }
        }

        fn engine(
            &self,
            work: &str,
            targets: Vec<Arc<dyn ServiceTarget>>,
        ) -> anyhow::Result<Engine> {
            let store: Arc<dyn BlobStore> = Arc::new(FsBlobStore::new(self.remote.clone()));
            Ok(Engine::new(&self.config(work), Some(store), targets)?)
        }
    }

    fn forced(snapshot_ref: &str) -> RestoreRequest {
        RestoreRequest {
            snapshot_ref: snapshot_ref.to_string(),
            scope: Scope::Full,
            force: true,
            confirmation: None,
            deadline: None,
        }
    }

    #[tokio::test]
    async fn test_backup_uploads_and_records_remote() -> anyhow::Result<()> {
        let fx = Fixture::new()?;
        let target = Arc::new(MemoryTarget::sql("svc-a", &[("orders", "rows 1..100\n")]));
        let engine = fx.engine("work", vec![target.clone()])?;

        let snapshot = engine
            .run_backup("svc-a", Scope::Full, BackupOptions::default(), &CancellationToken::new())
            .await?;
        assert_eq!(snapshot.status, SnapshotStatus::Remote);
        assert_eq!(engine.catalog().get(&snapshot.id)?.status, SnapshotStatus::Remote);
        assert_eq!(std::fs::read(fx.remote.join(remote_key(&snapshot)))?, target.contents());
        assert!(fx.remote.join(manifest_key(&remote_key(&snapshot))).is_file());
        Ok(())
    }

    #[tokio::test]
    async fn test_backup_without_upload_stays_local() -> anyhow::Result<()> {
        let fx = Fixture::new()?;
        let target = Arc::new(MemoryTarget::key_value("cache", b"REDIS0011"));
        let engine = fx.engine("work", vec![target])?;
        let options = BackupOptions {
            upload: false,
            deadline: None,
        };
        let snapshot = engine
            .run_backup("cache", Scope::Full, options, &CancellationToken::new())
            .await?;
        assert_eq!(snapshot.status, SnapshotStatus::Local);
        assert!(!fx.remote.exists());
        Ok(())
    }

    #[tokio::test]
    async fn test_empty_backup_leaves_catalog_unchanged() -> anyhow::Result<()> {
        let fx = Fixture::new()?;
        let target = Arc::new(MemoryTarget::key_value("cache", b""));
        let engine = fx.engine("work", vec![target])?;
        let err = engine
            .run_backup("cache", Scope::Full, BackupOptions::default(), &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err.root(), AppError::ProducerOutputEmpty { .. }));
        assert_eq!(err.code(), ResultCode::BackupFailed);
        assert_eq!(engine.list_snapshots(None).count(), 0);
        Ok(())
    }

    #[tokio::test]
    async fn test_restore_during_backup_is_busy() -> anyhow::Result<()> {
        let fx = Fixture::new()?;
        let target = Arc::new(MemoryTarget::key_value("cache", b"REDIS0011 live"));
        let gate = target.hold_snapshots();
        let engine = Arc::new(fx.engine("work", vec![target.clone()])?);

        let backup = {
            let engine = engine.clone();
            tokio::spawn(async move {
                let options = BackupOptions::default();
                engine
                    .run_backup("cache", Scope::Full, options, &CancellationToken::new())
                    .await
            })
        };
        assert!(wait_until(|| target.snapshots_started.load(Ordering::SeqCst) == 1).await);

        let err = engine
            .run_restore("cache", forced("anything"), &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, AppError::TargetBusy(_)));
        assert_eq!(err.code(), ResultCode::Busy);
        assert_eq!(target.quiesced.load(Ordering::SeqCst), 0);

        gate.notify_one();
        let snapshot = backup.await??;
        assert_eq!(snapshot.status, SnapshotStatus::Remote);
        Ok(())
    }

    #[tokio::test]
    async fn test_second_process_sees_target_busy_and_keeps_partial() -> anyhow::Result<()> {
        let fx = Fixture::new()?;
        let target = Arc::new(MemoryTarget::key_value("cache", b"REDIS0011 live"));
        let gate = target.hold_snapshots();
        let first = Arc::new(fx.engine("work", vec![target.clone()])?);

        let backup = {
            let engine = first.clone();
            tokio::spawn(async move {
                let options = BackupOptions::default();
                engine
                    .run_backup("cache", Scope::Full, options, &CancellationToken::new())
                    .await
            })
        };
        assert!(wait_until(|| target.snapshots_started.load(Ordering::SeqCst) == 1).await);

        // Same work dir, separate engine: its startup sweep must not touch the
        // capture in flight, and its restore must wait its turn.
        let other = Arc::new(MemoryTarget::key_value("cache", b"REDIS0011 other"));
        let second = fx.engine("work", vec![other.clone()])?;
        let artifacts = fx.dir.path().join("work/artifacts");
        let partials = || -> usize {
            std::fs::read_dir(&artifacts)
                .map(|entries| {
                    entries
                        .flatten()
                        .filter(|e| e.file_name().to_string_lossy().starts_with(".snap-cache."))
                        .count()
                })
                .unwrap_or(0)
        };
        assert_eq!(partials(), 1);

        let err = second
            .run_restore("cache", forced("anything"), &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, AppError::TargetBusy(_)));
        assert_eq!(other.quiesced.load(Ordering::SeqCst), 0);

        gate.notify_one();
        let snapshot = backup.await??;
        assert_eq!(snapshot.status, SnapshotStatus::Remote);
        assert_eq!(partials(), 0);
        assert_eq!(second.catalog().get(&snapshot.id)?.status, SnapshotStatus::Remote);
        Ok(())
    }

    #[tokio::test]
    async fn test_startup_sweeps_abandoned_restore_runs() -> anyhow::Result<()> {
        let fx = Fixture::new()?;
        let staging = fx.dir.path().join("work/staging/cache");
        let abandoned = staging.join(uuid::Uuid::new_v4().to_string());
        std::fs::create_dir_all(&abandoned)?;
        std::fs::write(abandoned.join("artifact.rdb"), b"staged")?;
        let interrupted = staging.join(uuid::Uuid::new_v4().to_string());
        std::fs::create_dir_all(&interrupted)?;
        std::fs::write(interrupted.join("artifact.rdb"), b"staged")?;
        std::fs::write(interrupted.join("pre-restore.rdb"), b"REDIS0011 before")?;

        let target = Arc::new(MemoryTarget::key_value("cache", b"REDIS0011"));
        let _engine = fx.engine("work", vec![target])?;
        assert!(!abandoned.exists());
        assert!(!interrupted.join("artifact.rdb").exists());
        assert_eq!(std::fs::read(interrupted.join("pre-restore.rdb"))?, b"REDIS0011 before");
        Ok(())
    }

    #[tokio::test]
    async fn test_wrong_token_for_remote_locator_leaves_catalog_alone() -> anyhow::Result<()> {
        let fx = Fixture::new()?;
        let source = Arc::new(MemoryTarget::key_value("cache", b"REDIS0011 remote"));
        let producer_engine = fx.engine("site-a", vec![source])?;
        let cancel = CancellationToken::new();
        let snapshot = producer_engine
            .run_backup("cache", Scope::Full, BackupOptions::default(), &cancel)
            .await?;
        let locator = snapshot.storage_location.clone().unwrap();

        let target = Arc::new(MemoryTarget::key_value("cache", b"REDIS0011 stale"));
        let engine = fx.engine("site-b", vec![target.clone()])?;
        let preview = engine.plan_restore("cache", &locator, Scope::Full, &cancel).await?;
        assert_eq!(engine.list_snapshots(None).count(), 0);

        let wrong = RestoreRequest {
            force: false,
            confirmation: Some("0000000000000000".to_string()),
            ..forced(&locator)
        };
        let err = engine.run_restore("cache", wrong, &cancel).await.unwrap_err();
        assert!(matches!(err, AppError::ConfirmationMismatch { .. }));
        assert_eq!(engine.list_snapshots(None).count(), 0);
        assert_eq!(target.contents(), b"REDIS0011 stale");

        let confirmed = RestoreRequest {
            force: false,
            confirmation: Some(preview.token),
            ..forced(&locator)
        };
        engine.run_restore("cache", confirmed, &cancel).await?;
        assert_eq!(engine.catalog().get(&snapshot.id)?.status, SnapshotStatus::Remote);
        Ok(())
    }

    #[tokio::test]
    async fn test_delete_removes_downloaded_copy() -> anyhow::Result<()> {
        let fx = Fixture::new()?;
        let source = Arc::new(MemoryTarget::key_value("cache", b"REDIS0011 shared"));
        let producer_engine = fx.engine("site-a", vec![source])?;
        let cancel = CancellationToken::new();
        let snapshot = producer_engine
            .run_backup("cache", Scope::Full, BackupOptions::default(), &cancel)
            .await?;
        let locator = snapshot.storage_location.clone().unwrap();

        let target = Arc::new(MemoryTarget::key_value("cache", b"REDIS0011 stale"));
        let engine = fx.engine("site-b", vec![target])?;
        engine.run_restore("cache", forced(&locator), &cancel).await?;
        let downloaded = fx
            .dir
            .path()
            .join("site-b/artifacts")
            .join(snapshot.artifact_file_name());
        assert!(downloaded.is_file());
        assert_eq!(engine.catalog().get(&snapshot.id)?.local_path, None);

        engine.delete_snapshot(&snapshot.id, &cancel).await?;
        assert!(!downloaded.exists());
        assert!(!crate::transfer::partial_path(&downloaded).exists());
        assert!(engine.catalog().find(&snapshot.id).is_none());
        Ok(())
    }

    #[tokio::test]
    async fn test_restore_without_token_has_no_side_effects() -> anyhow::Result<()> {
        let fx = Fixture::new()?;
        let target = Arc::new(MemoryTarget::key_value("cache", b"REDIS0011 v1"));
        let engine = fx.engine("work", vec![target.clone()])?;
        let snapshot = engine
            .run_backup("cache", Scope::Full, BackupOptions::default(), &CancellationToken::new())
            .await?;

        let request = RestoreRequest {
            force: false,
            ..forced(&snapshot.id)
        };
        let err = engine
            .run_restore("cache", request, &CancellationToken::new())
            .await
            .unwrap_err();
        assert_eq!(err.code(), ResultCode::ValidationFailed);
        assert!(matches!(err, AppError::ConfirmationRequired { .. }));
        assert_eq!(target.quiesced.load(Ordering::SeqCst), 0);
        assert_eq!(target.applies.load(Ordering::SeqCst), 0);
        assert!(!fx.dir.path().join("work/staging").exists());
        assert!(engine.catalog().restores("cache").is_empty());
        Ok(())
    }

    #[tokio::test]
    async fn test_planned_restore_with_token() -> anyhow::Result<()> {
        let fx = Fixture::new()?;
        let target = Arc::new(MemoryTarget::sql("svc-a", &[("orders", "v1\n")]));
        let engine = fx.engine("work", vec![target.clone()])?;
        let cancel = CancellationToken::new();
        let snapshot = engine
            .run_backup("svc-a", Scope::Full, BackupOptions::default(), &cancel)
            .await?;
        target.set_database("orders", "v2\n");

        let preview = engine
            .plan_restore("svc-a", &snapshot.id, Scope::Full, &cancel)
            .await?;
        assert_eq!(target.quiesced.load(Ordering::SeqCst), 0);

        let stale = RestoreRequest {
            force: false,
            confirmation: Some("0000000000000000".to_string()),
            ..forced(&snapshot.id)
        };
        let err = engine.run_restore("svc-a", stale, &cancel).await.unwrap_err();
        assert!(matches!(err, AppError::ConfirmationMismatch { .. }));
        assert_eq!(target.database("orders"), Some(b"v2\n".to_vec()));

        let confirmed = RestoreRequest {
            force: false,
            confirmation: Some(preview.token.clone()),
            ..forced(&snapshot.id)
        };
        let report = engine.run_restore("svc-a", confirmed, &cancel).await?;
        assert_eq!(report.snapshot_id, snapshot.id);
        assert_eq!(target.database("orders"), Some(b"v1\n".to_vec()));
        assert_eq!(engine.catalog().restores("svc-a").len(), 1);
        Ok(())
    }

    #[tokio::test]
    async fn test_restore_downloads_missing_local_artifact() -> anyhow::Result<()> {
        let fx = Fixture::new()?;
        let target = Arc::new(MemoryTarget::key_value("cache", b"REDIS0011 v1"));
        let engine = fx.engine("work", vec![target.clone()])?;
        let cancel = CancellationToken::new();
        let snapshot = engine
            .run_backup("cache", Scope::Full, BackupOptions::default(), &cancel)
            .await?;
        std::fs::remove_file(snapshot.local_path.as_ref().unwrap())?;

        let fresh = Arc::new(MemoryTarget::key_value("cache", b"REDIS0011 v2"));
        let engine = fx.engine("work", vec![fresh.clone()])?;
        engine.run_restore("cache", forced(&snapshot.id), &cancel).await?;
        assert_eq!(fresh.contents(), b"REDIS0011 v1");
        Ok(())
    }

    #[tokio::test]
    async fn test_restore_from_remote_locator_imports_manifest() -> anyhow::Result<()> {
        let fx = Fixture::new()?;
        let source = Arc::new(MemoryTarget::key_value("cache", b"REDIS0011 from elsewhere"));
        let producer_engine = fx.engine("site-a", vec![source])?;
        let cancel = CancellationToken::new();
        let snapshot = producer_engine
            .run_backup("cache", Scope::Full, BackupOptions::default(), &cancel)
            .await?;
        let locator = snapshot.storage_location.clone().unwrap();

        let target = Arc::new(MemoryTarget::key_value("cache", b"REDIS0011 stale"));
        let engine = fx.engine("site-b", vec![target.clone()])?;
        assert_eq!(engine.list_snapshots(None).count(), 0);

        engine.run_restore("cache", forced(&locator), &cancel).await?;
        assert_eq!(target.contents(), b"REDIS0011 from elsewhere");
        assert_eq!(engine.catalog().get(&snapshot.id)?.status, SnapshotStatus::Remote);
        Ok(())
    }

    #[tokio::test]
    async fn test_restore_unknown_local_file_is_not_found() -> anyhow::Result<()> {
        let fx = Fixture::new()?;
        let target = Arc::new(MemoryTarget::key_value("cache", b"REDIS0011"));
        let engine = fx.engine("work", vec![target])?;
        let stray = fx.dir.path().join("stray.rdb");
        std::fs::write(&stray, b"REDIS0011 stray")?;

        let err = engine
            .run_restore("cache", forced(stray.to_str().unwrap()), &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err.root(), AppError::SnapshotNotFound(_)));
        assert_eq!(err.code(), ResultCode::ValidationFailed);
        Ok(())
    }

    #[tokio::test]
    async fn test_list_filters_by_source_newest_first() -> anyhow::Result<()> {
        let fx = Fixture::new()?;
        let a = Arc::new(MemoryTarget::key_value("svc-a", b"REDIS0011 a"));
        let b = Arc::new(MemoryTarget::key_value("svc-b", b"REDIS0011 b"));
        let engine = fx.engine("work", vec![a, b])?;
        let cancel = CancellationToken::new();
        let local = || BackupOptions {
            upload: false,
            deadline: None,
        };

        let mut produced = Vec::new();
        for _ in 0..3 {
            produced.push(engine.run_backup("svc-a", Scope::Full, local(), &cancel).await?.id);
        }
        engine.run_backup("svc-b", Scope::Full, local(), &cancel).await?;

        let listed: Vec<String> = engine.list_snapshots(Some("svc-a")).map(|s| s.id).collect();
        produced.reverse();
        assert_eq!(listed, produced);
        assert_eq!(engine.list_snapshots(None).count(), 4);
        Ok(())
    }

    #[tokio::test]
    async fn test_prune_keeps_newest() -> anyhow::Result<()> {
        let fx = Fixture::new()?;
        let target = Arc::new(MemoryTarget::key_value("cache", b"REDIS0011"));
        let engine = fx.engine("work", vec![target])?;
        let cancel = CancellationToken::new();

        let mut produced = Vec::new();
        for _ in 0..3 {
            produced.push(
                engine
                    .run_backup("cache", Scope::Full, BackupOptions::default(), &cancel)
                    .await?,
            );
        }

        let removed = engine.prune("cache", 1, &cancel).await?;
        assert_eq!(removed.len(), 2);
        let kept: Vec<String> = engine.list_snapshots(Some("cache")).map(|s| s.id).collect();
        assert_eq!(kept, vec![produced[2].id.clone()]);
        for snapshot in &produced[..2] {
            assert!(!snapshot.local_path.as_ref().unwrap().exists());
            assert!(!fx.remote.join(remote_key(snapshot)).exists());
        }
        assert!(fx.remote.join(remote_key(&produced[2])).exists());
        Ok(())
    }

    #[tokio::test]
    async fn test_exhausted_upload_returns_snapshot_to_local() -> anyhow::Result<()> {
        let fx = Fixture::new()?;
        let target = Arc::new(MemoryTarget::key_value("cache", b"REDIS0011 data"));
        let store = Arc::new(FlakyStore::new(fx.remote.clone()));
        let engine = Engine::new(&fx.config("work"), Some(store.clone()), vec![target])?;
        let cancel = CancellationToken::new();

        store.fail_transiently(100);
        let err = engine
            .run_backup("cache", Scope::Full, BackupOptions::default(), &cancel)
            .await
            .unwrap_err();
        assert_eq!(err.code(), ResultCode::TransferFailed);
        let snapshot = engine.list_snapshots(Some("cache")).next().unwrap();
        assert_eq!(snapshot.status, SnapshotStatus::Local);

        store.fail_transiently(0);
        let uploaded = engine.upload_snapshot(&snapshot.id, &cancel).await?;
        assert_eq!(uploaded.status, SnapshotStatus::Remote);
        Ok(())
    }

    #[tokio::test]
    async fn test_denied_upload_marks_snapshot_failed() -> anyhow::Result<()> {
        let fx = Fixture::new()?;
        let target = Arc::new(MemoryTarget::key_value("cache", b"REDIS0011 data"));
        let store = Arc::new(FlakyStore::new(fx.remote.clone()));
        store.deny_access(true);
        let engine = Engine::new(&fx.config("work"), Some(store), vec![target])?;

        let err = engine
            .run_backup("cache", Scope::Full, BackupOptions::default(), &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err.root(), AppError::AuthorizationFailed { .. }));
        let snapshot = engine.list_snapshots(None).next().unwrap();
        assert_eq!(snapshot.status, SnapshotStatus::Failed);
        Ok(())
    }

    #[tokio::test]
    async fn test_deadline_cancels_backup() -> anyhow::Result<()> {
        let fx = Fixture::new()?;
        let target = Arc::new(MemoryTarget::key_value("cache", b"REDIS0011"));
        let _gate = target.hold_snapshots();
        let engine = fx.engine("work", vec![target])?;

        let options = BackupOptions {
            upload: true,
            deadline: Some(Duration::from_millis(20)),
        };
        let err = engine
            .run_backup("cache", Scope::Full, options, &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, AppError::DeadlineExceeded(_)));
        assert_eq!(err.code(), ResultCode::Cancelled);
        assert_eq!(engine.list_snapshots(None).count(), 0);

        // The lease is released afterwards.
        engine.prune("cache", 0, &CancellationToken::new()).await?;
        Ok(())
    }

    #[test]
    fn test_token_depends_on_scope_and_target() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let snapshot = crate::test_support::local_artifact(dir.path(), "svc-a-1", b"dump")?;
        let full = confirmation_token("svc-a", &snapshot, &Scope::Full);
        assert_eq!(full.len(), 16);
        assert_eq!(full, confirmation_token("svc-a", &snapshot, &Scope::Full));
        assert_ne!(full, confirmation_token("svc-b", &snapshot, &Scope::Full));
        assert_ne!(
            full,
            confirmation_token("svc-a", &snapshot, &Scope::NamedSubset("orders".into()))
        );
        Ok(())
    }
}
