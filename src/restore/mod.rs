//! Transactional restore: validate, stage, then swap with rollback.

pub mod subset;

use std::fmt;
use std::future::Future;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::Utc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::catalog::{CatalogStore, RestoreOutcome, RestoreRecord};
use crate::digest::verify_file;
use crate::errors::{AppError, Result};
use crate::model::{ServiceKind, Scope, Snapshot, validate_name};
use crate::targets::ServiceTarget;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RestorePhase {
    Validating,
    Staging,
    Swapping,
    Complete,
    Failed,
    RolledBack,
}

impl RestorePhase {
    pub fn as_str(self) -> &'static str {
        match self {
            RestorePhase::Validating => "VALIDATING",
            RestorePhase::Staging => "STAGING",
            RestorePhase::Swapping => "SWAPPING",
            RestorePhase::Complete => "COMPLETE",
            RestorePhase::Failed => "FAILED",
            RestorePhase::RolledBack => "ROLLED_BACK",
        }
    }
}

impl fmt::Display for RestorePhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RestoreMode {
    Full,
    NamedSubset,
}

#[derive(Debug, Clone)]
pub struct RestorePlan {
    pub snapshot: Snapshot,
    pub mode: RestoreMode,
    pub subset_key: Option<String>,
}

impl RestorePlan {
    pub fn scope(&self) -> Scope {
        match (&self.mode, &self.subset_key) {
            (RestoreMode::NamedSubset, Some(name)) => Scope::NamedSubset(name.clone()),
            _ => Scope::Full,
        }
    }
}

#[derive(Debug, Clone)]
pub struct RestoreReport {
    pub run_id: Uuid,
    pub target: String,
    pub snapshot_id: String,
    pub scope: Scope,
    pub final_phase: RestorePhase,
    pub transitions: Vec<RestorePhase>,
    /// The first apply failed, was rolled back, and the re-attempt succeeded.
    pub rolled_back_once: bool,
}

enum PreRestore {
    NotRetained,
    /// Nothing existed for the scope before the restore.
    Absent,
    Copy(PathBuf),
}

impl PreRestore {
    fn path(&self) -> Option<PathBuf> {
        match self {
            PreRestore::Copy(path) => Some(path.clone()),
            _ => None,
        }
    }
}

struct RestoreRun<'a> {
    run_id: Uuid,
    target: &'a dyn ServiceTarget,
    plan: &'a RestorePlan,
    scope: Scope,
    stage_dir: PathBuf,
    transitions: Vec<RestorePhase>,
}

impl RestoreRun<'_> {
    fn enter(&mut self, phase: RestorePhase) {
        info!(
            run_id = %self.run_id,
            target_name = %self.target.name(),
            snapshot = %self.plan.snapshot.id,
            phase = %phase,
            "Restore phase"
        );
        self.transitions.push(phase);
    }

    fn fail(&mut self, phase: RestorePhase, err: AppError) -> AppError {
        let failed_in = self.transitions.last().copied().unwrap_or(RestorePhase::Validating);
        self.enter(phase);
        AppError::in_phase(failed_in.as_str(), self.plan.snapshot.id.clone(), err)
    }

    fn record(
        &self,
        outcome: RestoreOutcome,
        err: Option<&AppError>,
        retained_copy: Option<PathBuf>,
    ) -> RestoreRecord {
        RestoreRecord {
            run_id: self.run_id,
            target: self.target.name().to_string(),
            snapshot_id: self.plan.snapshot.id.clone(),
            scope: self.scope.clone(),
            outcome,
            reason: err.map(|e| e.to_string()),
            retained_copy,
            applied_at: Utc::now(),
        }
    }

    fn unrecoverable(&self, reason: String, pre: &PreRestore) -> AppError {
        AppError::RestoreUnrecoverable {
            target: self.target.name().to_string(),
            snapshot: self.plan.snapshot.id.clone(),
            reason,
            retained_copy: pre.path(),
        }
    }
}

const STAGED_ARTIFACT: &str = "artifact";
const PRE_RESTORE_COPY: &str = "pre-restore";

pub struct RestoreCoordinator {
    catalog: Arc<CatalogStore>,
    staging_root: PathBuf,
    retain_pre_restore_copy: bool,
}

impl RestoreCoordinator {
    pub fn new(
        catalog: Arc<CatalogStore>,
        staging_root: PathBuf,
        retain_pre_restore_copy: bool,
    ) -> Self {
        Self {
            catalog,
            staging_root,
            retain_pre_restore_copy,
        }
    }

    /// Resolves what will actually be restored. Restoring a subset snapshot
    /// without naming a subset restores that subset.
    pub fn plan(&self, snapshot: Snapshot, requested: &Scope) -> Result<RestorePlan> {
        let scope = match (requested, &snapshot.scope) {
            (Scope::Full, Scope::NamedSubset(name)) => Scope::NamedSubset(name.clone()),
            (requested, _) => requested.clone(),
        };
        if let Scope::NamedSubset(name) = &scope {
            validate_name("subset", name)?;
        }
        Ok(RestorePlan {
            snapshot,
            mode: match scope {
                Scope::Full => RestoreMode::Full,
                Scope::NamedSubset(_) => RestoreMode::NamedSubset,
            },
            subset_key: scope.subset().map(str::to_string),
        })
    }

    /// Read-only checks; never touches the target's live data.
    pub async fn validate(&self, target: &dyn ServiceTarget, plan: &RestorePlan) -> Result<()> {
        let snapshot = &plan.snapshot;
        if target.kind() != snapshot.service_kind {
            return Err(AppError::KindMismatch {
                snapshot: snapshot.id.clone(),
                target: target.name().to_string(),
                expected: target.kind().as_str().to_string(),
                actual: snapshot.service_kind.as_str().to_string(),
            });
        }

        let artifact = artifact_path(snapshot)?;
        verify_file(artifact, &snapshot.digest).await?;

        if let Some(subset) = &plan.subset_key {
            let present = match (&snapshot.service_kind, &snapshot.scope) {
                (ServiceKind::KeyValue, _) => false,
                (ServiceKind::SqlRelational, Scope::NamedSubset(captured)) => captured == subset,
                (ServiceKind::SqlRelational, Scope::Full) => {
                    subset::contains_section(artifact, subset).await?
                }
            };
            if !present {
                return Err(AppError::SubsetNotPresent {
                    snapshot: snapshot.id.clone(),
                    subset: subset.clone(),
                });
            }
        }
        Ok(())
    }

    pub async fn restore(
        &self,
        target: &dyn ServiceTarget,
        plan: RestorePlan,
        cancel: &CancellationToken,
    ) -> Result<RestoreReport> {
        let run_id = Uuid::new_v4();
        let mut run = RestoreRun {
            run_id,
            target,
            scope: plan.scope(),
            stage_dir: self.staging_root.join(target.name()).join(run_id.to_string()),
            plan: &plan,
            transitions: Vec::new(),
        };

        run.enter(RestorePhase::Validating);
        let validation = self.validate(target, &plan);
        if let Err(e) = until_cancelled(cancel, "restore validation", validation).await {
            return Err(run.fail(RestorePhase::Failed, e));
        }

        run.enter(RestorePhase::Staging);
        let staging = self.stage(&plan, &run.stage_dir);
        let staged = match until_cancelled(cancel, "restore staging", staging).await {
            Ok(staged) => staged,
            Err(e) => {
                remove_dir(&run.stage_dir).await;
                return Err(run.fail(RestorePhase::Failed, e));
            }
        };
        if cancel.is_cancelled() {
            remove_dir(&run.stage_dir).await;
            return Err(run.fail(
                RestorePhase::Failed,
                AppError::Cancelled("restore cancelled before swapping".to_string()),
            ));
        }

        // From here on the swap runs to completion or rollback regardless of
        // cancellation.
        run.enter(RestorePhase::Swapping);
        let (outcome, pre) = self.swap(&run, &staged).await;
        match outcome {
            Ok(rolled_back_once) => {
                run.enter(RestorePhase::Complete);
                self.catalog
                    .record_restore(run.record(RestoreOutcome::Complete, None, None))?;
                remove_dir(&run.stage_dir).await;
                Ok(RestoreReport {
                    run_id: run.run_id,
                    target: target.name().to_string(),
                    snapshot_id: plan.snapshot.id.clone(),
                    scope: run.scope.clone(),
                    final_phase: RestorePhase::Complete,
                    transitions: run.transitions,
                    rolled_back_once,
                })
            }
            Err(SwapError::RolledBack(e)) => {
                self.record_failure(run.record(RestoreOutcome::RolledBack, Some(&e), None));
                remove_dir(&run.stage_dir).await;
                Err(run.fail(RestorePhase::RolledBack, e))
            }
            Err(SwapError::Failed(e)) => {
                match (&e, pre.path()) {
                    (AppError::RestoreUnrecoverable { .. }, Some(copy)) => {
                        // Keep the pre-restore copy for the operator.
                        if let Err(remove) = tokio::fs::remove_file(&staged).await {
                            warn!(path = %staged.display(), error = %remove, "Failed to remove staged artifact");
                        }
                        error!(
                            run_id = %run.run_id,
                            retained_copy = %copy.display(),
                            "Restore unrecoverable, pre-restore copy retained"
                        );
                        let outcome = RestoreOutcome::Unrecoverable;
                        self.record_failure(run.record(outcome, Some(&e), Some(copy)));
                    }
                    (AppError::RestoreUnrecoverable { .. }, None) => {
                        let outcome = RestoreOutcome::Unrecoverable;
                        self.record_failure(run.record(outcome, Some(&e), None));
                        remove_dir(&run.stage_dir).await;
                    }
                    _ => {
                        self.record_failure(run.record(RestoreOutcome::Failed, Some(&e), None));
                        remove_dir(&run.stage_dir).await;
                    }
                }
                Err(run.fail(RestorePhase::Failed, e))
            }
        }
    }

    /// The restore outcome is already decided; a journal failure only loses the audit entry.
    fn record_failure(&self, record: RestoreRecord) {
        if let Err(e) = self.catalog.record_restore(record) {
            warn!(error = %e, "Failed to record restore outcome");
        }
    }

    async fn stage(&self, plan: &RestorePlan, stage_dir: &Path) -> Result<PathBuf> {
        tokio::fs::create_dir_all(stage_dir).await?;
        let snapshot = &plan.snapshot;
        let source = artifact_path(snapshot)?;
        let staged = stage_dir.join(format!(
            "{}.{}",
            STAGED_ARTIFACT,
            snapshot.service_kind.artifact_extension()
        ));

        match (&snapshot.scope, &plan.subset_key) {
            (Scope::Full, Some(subset)) => {
                let written = subset::extract_section(source, subset, &staged).await?;
                if written == 0 {
                    return Err(AppError::SubsetNotPresent {
                        snapshot: snapshot.id.clone(),
                        subset: subset.clone(),
                    });
                }
            }
            _ => {
                tokio::fs::copy(source, &staged).await?;
                verify_file(&staged, &snapshot.digest).await?;
            }
        }
        Ok(staged)
    }

    async fn swap(&self, run: &RestoreRun<'_>, staged: &Path) -> (SwapResult, PreRestore) {
        let target = run.target;
        let scope = run.scope.clone();

        if let Err(e) = target.quiesce(&scope).await {
            if let Err(resume) = target.resume(&scope).await {
                warn!(target_name = %target.name(), error = %resume, "Resume after failed quiesce also failed");
            }
            return (Err(SwapError::Failed(e)), PreRestore::NotRetained);
        }

        let (outcome, pre) = self.swap_quiesced(run, staged).await;

        match target.resume(&scope).await {
            Ok(()) => (outcome, pre),
            Err(resume) => match outcome {
                Ok(_) => (
                    Err(SwapError::Failed(AppError::RestoreFailed {
                        target: target.name().to_string(),
                        snapshot: run.plan.snapshot.id.clone(),
                        reason: format!(
                            "data was applied but the service could not be resumed: {}",
                            resume
                        ),
                    })),
                    pre,
                ),
                Err(e) => {
                    error!(target_name = %target.name(), error = %resume, "Resume failed after a failed swap");
                    (Err(e), pre)
                }
            },
        }
    }

    async fn swap_quiesced(&self, run: &RestoreRun<'_>, staged: &Path) -> (SwapResult, PreRestore) {
        let target = run.target;
        let scope = &run.scope;

        let pre = if self.retain_pre_restore_copy {
            let path = run.stage_dir.join(format!(
                "{}.{}",
                PRE_RESTORE_COPY,
                target.kind().artifact_extension()
            ));
            match target.export_live(scope, &path).await {
                Ok(true) => PreRestore::Copy(path),
                Ok(false) => PreRestore::Absent,
                // Nothing has been modified yet.
                Err(e) => return (Err(SwapError::Failed(e)), PreRestore::NotRetained),
            }
        } else {
            PreRestore::NotRetained
        };

        let first = match target.apply(staged, scope).await {
            Ok(()) => return (Ok(false), pre),
            Err(e) => e,
        };
        warn!(run_id = %run.run_id, target_name = %target.name(), error = %first, "Apply failed, rolling back");

        if let Err(reason) = self.rollback(target, scope, &pre).await {
            let reason = format!("apply failed ({}) and rollback failed ({})", first, reason);
            return (Err(SwapError::Failed(run.unrecoverable(reason, &pre))), pre);
        }

        info!(run_id = %run.run_id, target_name = %target.name(), "Rolled back, re-attempting apply");
        let second = match target.apply(staged, scope).await {
            Ok(()) => return (Ok(true), pre),
            Err(e) => e,
        };
        warn!(run_id = %run.run_id, target_name = %target.name(), error = %second, "Re-attempted apply failed, rolling back");

        match self.rollback(target, scope, &pre).await {
            Ok(()) => (
                Err(SwapError::RolledBack(AppError::RestoreFailed {
                    target: target.name().to_string(),
                    snapshot: run.plan.snapshot.id.clone(),
                    reason: format!("apply failed twice, live data rolled back: {}", second),
                })),
                pre,
            ),
            Err(reason) => {
                let reason = format!(
                    "re-attempted apply failed ({}) and rollback failed ({})",
                    second, reason
                );
                (Err(SwapError::Failed(run.unrecoverable(reason, &pre))), pre)
            }
        }
    }

    async fn rollback(
        &self,
        target: &dyn ServiceTarget,
        scope: &Scope,
        pre: &PreRestore,
    ) -> std::result::Result<(), String> {
        match pre {
            PreRestore::Copy(path) => target.apply(path, scope).await.map_err(|e| e.to_string()),
            PreRestore::Absent => target.discard(scope).await.map_err(|e| e.to_string()),
            PreRestore::NotRetained => Err("no pre-restore copy was retained".to_string()),
        }
    }
}

enum SwapError {
    /// The swap failed and live data is back to its pre-restore state.
    RolledBack(AppError),
    Failed(AppError),
}

/// `Ok(true)` when the first apply had to be rolled back before the re-attempt succeeded.
type SwapResult = std::result::Result<bool, SwapError>;

fn artifact_path(snapshot: &Snapshot) -> Result<&Path> {
    match snapshot.local_path.as_deref() {
        Some(path) if path.is_file() => Ok(path),
        _ => Err(AppError::SnapshotNotFound(format!(
            "{} (no local artifact)",
            snapshot.id
        ))),
    }
}

async fn until_cancelled<T>(
    cancel: &CancellationToken,
    what: &str,
    fut: impl Future<Output = Result<T>>,
) -> Result<T> {
    tokio::select! {
        biased;
        _ = cancel.cancelled() => Err(AppError::Cancelled(what.to_string())),
        result = fut => result,
    }
}

/// Removes what restores interrupted by a crash left under `staging_root`,
/// one target directory at a time and only while `claim` holds that target.
/// Runs that hold a pre-restore copy are kept (minus the staged artifact)
/// and their copies returned, since live data may be half-applied.
pub fn sweep_abandoned_runs<G>(
    staging_root: &Path,
    mut claim: impl FnMut(&str) -> Option<G>,
) -> Result<Vec<PathBuf>> {
    let targets = match std::fs::read_dir(staging_root) {
        Ok(entries) => entries,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => return Err(e.into()),
    };

    let mut retained = Vec::new();
    let mut removed = 0usize;
    for entry in targets {
        let entry = entry?;
        if !entry.file_type()?.is_dir() {
            continue;
        }
        let name = entry.file_name().to_string_lossy().into_owned();
        let Some(_claim) = claim(&name) else {
            debug!(target_name = %name, "Target busy, leaving its staging runs alone");
            continue;
        };

        for run in std::fs::read_dir(entry.path())? {
            let run = run?;
            if !run.file_type()?.is_dir() {
                continue;
            }
            let mut copy = None;
            for file in std::fs::read_dir(run.path())? {
                let path = file?.path();
                let stem = path.file_stem().and_then(|s| s.to_str()).unwrap_or_default();
                if stem == PRE_RESTORE_COPY {
                    copy = Some(path);
                } else if stem == STAGED_ARTIFACT {
                    std::fs::remove_file(&path)?;
                }
            }
            match copy {
                Some(copy) => {
                    warn!(
                        target_name = %name,
                        retained_copy = %copy.display(),
                        "Interrupted restore left a pre-restore copy, live data may need recovery"
                    );
                    retained.push(copy);
                }
                None => {
                    std::fs::remove_dir_all(run.path())?;
                    removed += 1;
                }
            }
        }
    }
    if removed > 0 {
        warn!(dir = %staging_root.display(), removed, "Removed abandoned restore runs");
    }
    Ok(retained)
}

async fn remove_dir(dir: &Path) {
    if let Err(e) = tokio::fs::remove_dir_all(dir).await {
        if e.kind() != std::io::ErrorKind::NotFound {
            warn!(dir = %dir.display(), error = %e, "Failed to remove staging directory");
        }
    }
}
