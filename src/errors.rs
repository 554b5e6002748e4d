use std::path::PathBuf;

use thiserror::Error;

use crate::digest::ContentDigest;

/// Abstract outcome of an operation, mapped onto the process exit code by the CLI.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResultCode {
    Ok,
    ValidationFailed,
    TransferFailed,
    RestoreFailed,
    RestoreUnrecoverable,
    Cancelled,
    Busy,
    BackupFailed,
    Internal,
}

impl ResultCode {
    pub fn as_str(self) -> &'static str {
        match self {
            ResultCode::Ok => "OK",
            ResultCode::ValidationFailed => "VALIDATION_FAILED",
            ResultCode::TransferFailed => "TRANSFER_FAILED",
            ResultCode::RestoreFailed => "RESTORE_FAILED",
            ResultCode::RestoreUnrecoverable => "RESTORE_UNRECOVERABLE",
            ResultCode::Cancelled => "CANCELLED",
            ResultCode::Busy => "BUSY",
            ResultCode::BackupFailed => "BACKUP_FAILED",
            ResultCode::Internal => "INTERNAL",
        }
    }

    pub fn exit_code(self) -> u8 {
        match self {
            ResultCode::Ok => 0,
            ResultCode::Internal => 1,
            ResultCode::ValidationFailed => 2,
            ResultCode::TransferFailed => 3,
            ResultCode::RestoreFailed => 4,
            ResultCode::RestoreUnrecoverable => 5,
            ResultCode::Cancelled => 6,
            ResultCode::Busy => 7,
            ResultCode::BackupFailed => 8,
        }
    }
}

#[derive(Error, Debug)]
pub enum AppError {
    #[error("Target {target} is unavailable: {reason}")]
    ProducerUnavailable { target: String, reason: String },

    #[error("Snapshot process for {target} exited with {status}: {stderr}")]
    ProducerProcessFailed {
        target: String,
        status: String,
        stderr: String,
    },

    #[error("Snapshot process for {target} produced no output")]
    ProducerOutputEmpty { target: String },

    #[error("Integrity mismatch for {}: expected {expected}, got {actual}", .path.display())]
    IntegrityMismatch {
        path: PathBuf,
        expected: ContentDigest,
        actual: ContentDigest,
    },

    #[error("Transfer of {key} rejected: {reason}")]
    TransferRejected { key: String, reason: String },

    #[error("Transfer of {key} failed verification: expected {expected}, got {actual}")]
    TransferIntegrityFailed {
        key: String,
        expected: ContentDigest,
        actual: ContentDigest,
    },

    #[error("Transfer of {key} failed after {attempts} attempts: {last_error}")]
    TransferRetriesExhausted {
        key: String,
        attempts: u32,
        last_error: String,
    },

    #[error("Authorization failed for {key}: {reason}")]
    AuthorizationFailed { key: String, reason: String },

    #[error("Snapshot not found: {0}")]
    SnapshotNotFound(String),

    #[error("Subset '{subset}' is not present in snapshot {snapshot}")]
    SubsetNotPresent { snapshot: String, subset: String },

    #[error("Target {target} does not support scope {scope}")]
    UnsupportedScope { target: String, scope: String },

    #[error("Snapshot {snapshot} holds {actual} data but target {target} expects {expected}")]
    KindMismatch {
        snapshot: String,
        target: String,
        expected: String,
        actual: String,
    },

    #[error("Applying artifact to {target} failed ({status}): {stderr}")]
    ApplyFailed {
        target: String,
        status: String,
        stderr: String,
    },

    #[error("{action} on {target} failed ({status}): {stderr}")]
    TargetCommandFailed {
        target: String,
        action: &'static str,
        status: String,
        stderr: String,
    },

    #[error("Restore of {snapshot} into {target} failed: {reason}")]
    RestoreFailed {
        target: String,
        snapshot: String,
        reason: String,
    },

    #[error("Restore of {snapshot} into {target} is unrecoverable, operator intervention required: {reason}{}", retained_hint(.retained_copy))]
    RestoreUnrecoverable {
        target: String,
        snapshot: String,
        reason: String,
        retained_copy: Option<PathBuf>,
    },

    #[error("Target {0} is busy with another operation")]
    TargetBusy(String),

    #[error("Operation cancelled: {0}")]
    Cancelled(String),

    #[error("Operation exceeded its deadline: {0}")]
    DeadlineExceeded(String),

    #[error("Restoring {snapshot} into {target} requires the confirmation token from a successful plan, or force")]
    ConfirmationRequired { target: String, snapshot: String },

    #[error("Confirmation token does not match the current restore plan for {snapshot}")]
    ConfirmationMismatch { snapshot: String },

    #[error("{phase} failed for snapshot {snapshot}: {source}")]
    Phase {
        phase: &'static str,
        snapshot: String,
        #[source]
        source: Box<AppError>,
    },

    #[error("Catalog error: {0}")]
    Catalog(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serde JSON error: {0}")]
    SerdeJson(#[from] serde_json::Error),
}

fn retained_hint(retained_copy: &Option<PathBuf>) -> String {
    match retained_copy {
        Some(path) => format!(" (pre-restore copy kept at {})", path.display()),
        None => String::new(),
    }
}

impl AppError {
    /// Attaches the phase and snapshot id an error surfaced from.
    pub fn in_phase(phase: &'static str, snapshot: impl Into<String>, source: AppError) -> Self {
        match source {
            // Already carries context.
            AppError::Phase { .. } => source,
            other => AppError::Phase {
                phase,
                snapshot: snapshot.into(),
                source: Box::new(other),
            },
        }
    }

    /// The underlying error with any phase context peeled off.
    pub fn root(&self) -> &AppError {
        match self {
            AppError::Phase { source, .. } => source.root(),
            other => other,
        }
    }

    pub fn is_cancellation(&self) -> bool {
        matches!(
            self.root(),
            AppError::Cancelled(_) | AppError::DeadlineExceeded(_)
        )
    }

    pub fn code(&self) -> ResultCode {
        match self {
            AppError::ProducerUnavailable { .. }
            | AppError::ProducerProcessFailed { .. }
            | AppError::ProducerOutputEmpty { .. } => ResultCode::BackupFailed,
            AppError::IntegrityMismatch { .. }
            | AppError::SnapshotNotFound(_)
            | AppError::SubsetNotPresent { .. }
            | AppError::UnsupportedScope { .. }
            | AppError::KindMismatch { .. }
            | AppError::ConfirmationRequired { .. }
            | AppError::ConfirmationMismatch { .. } => ResultCode::ValidationFailed,
            AppError::TransferRejected { .. }
            | AppError::TransferIntegrityFailed { .. }
            | AppError::TransferRetriesExhausted { .. }
            | AppError::AuthorizationFailed { .. } => ResultCode::TransferFailed,
            AppError::ApplyFailed { .. }
            | AppError::TargetCommandFailed { .. }
            | AppError::RestoreFailed { .. } => ResultCode::RestoreFailed,
            AppError::RestoreUnrecoverable { .. } => ResultCode::RestoreUnrecoverable,
            AppError::TargetBusy(_) => ResultCode::Busy,
            AppError::Cancelled(_) | AppError::DeadlineExceeded(_) => ResultCode::Cancelled,
            AppError::Phase { phase, source, .. } => match source.code() {
                ResultCode::Internal => phase_code(phase),
                code => code,
            },
            AppError::Catalog(_)
            | AppError::Config(_)
            | AppError::Io(_)
            | AppError::SerdeJson(_) => ResultCode::Internal,
        }
    }
}

fn phase_code(phase: &str) -> ResultCode {
    match phase {
        "PRODUCE" => ResultCode::BackupFailed,
        "UPLOAD" | "DOWNLOAD" => ResultCode::TransferFailed,
        "VALIDATING" => ResultCode::ValidationFailed,
        "STAGING" | "SWAPPING" => ResultCode::RestoreFailed,
        _ => ResultCode::Internal,
    }
}

pub type Result<T> = std::result::Result<T, AppError>;
