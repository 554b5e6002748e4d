//! Per-target exclusive leases backed by lock files, so every process sharing
//! a work dir sees the same busy set.

use std::fs::{File, OpenOptions};
use std::path::PathBuf;

use tracing::debug;

use crate::errors::{AppError, Result};
use crate::model::validate_name;

pub struct TargetLocks {
    dir: PathBuf,
}

impl TargetLocks {
    pub fn new(dir: PathBuf) -> Self {
        Self { dir }
    }

    /// Takes the target's lock without waiting; a lock held anywhere else,
    /// including by another lease in this process, is `TargetBusy`.
    pub fn acquire(&self, target: &str) -> Result<TargetLease> {
        validate_name("target", target)?;
        std::fs::create_dir_all(&self.dir)?;
        let path = self.dir.join(format!("{}.lock", target));
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(&path)?;

        match fs2::FileExt::try_lock_exclusive(&file) {
            Ok(()) => {
                debug!(target_name = %target, "Target lease acquired");
                Ok(TargetLease { _file: file })
            }
            Err(e) if e.raw_os_error() == fs2::lock_contended_error().raw_os_error() => {
                Err(AppError::TargetBusy(target.to_string()))
            }
            Err(e) => Err(e.into()),
        }
    }
}

/// Held for the duration of an operation; closing the file releases the lock.
pub struct TargetLease {
    _file: File,
}
