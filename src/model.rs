use std::fmt;
use std::path::PathBuf;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::digest::{ContentDigest, DigestAlgorithm};
use crate::errors::{AppError, Result};

/// What kind of service a snapshot was captured from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ServiceKind {
    SqlRelational,
    KeyValue,
}

impl ServiceKind {
    pub fn as_str(self) -> &'static str {
        match self {
            ServiceKind::SqlRelational => "SQL_RELATIONAL",
            ServiceKind::KeyValue => "KEY_VALUE",
        }
    }

    pub fn artifact_extension(self) -> &'static str {
        match self {
            ServiceKind::SqlRelational => "sql",
            ServiceKind::KeyValue => "rdb",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SnapshotStatus {
    Creating,
    Local,
    Uploading,
    Remote,
    Failed,
}

impl SnapshotStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            SnapshotStatus::Creating => "CREATING",
            SnapshotStatus::Local => "LOCAL",
            SnapshotStatus::Uploading => "UPLOADING",
            SnapshotStatus::Remote => "REMOTE",
            SnapshotStatus::Failed => "FAILED",
        }
    }

    /// REMOTE and FAILED records are never rewritten, only deleted.
    pub fn is_terminal(self) -> bool {
        matches!(self, SnapshotStatus::Remote | SnapshotStatus::Failed)
    }

    pub fn can_transition_to(self, next: SnapshotStatus) -> bool {
        use SnapshotStatus::*;
        matches!(
            (self, next),
            (Creating, Local)
                | (Creating, Failed)
                | (Local, Uploading)
                | (Local, Failed)
                | (Uploading, Uploading)
                | (Uploading, Remote)
                | (Uploading, Failed)
                | (Uploading, Local)
        )
    }
}

impl fmt::Display for SnapshotStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Whole service, or one named logical unit (a single database).
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "mode", content = "subset", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Scope {
    Full,
    NamedSubset(String),
}

impl Scope {
    pub fn from_subset(subset: Option<String>) -> Self {
        match subset {
            Some(name) => Scope::NamedSubset(name),
            None => Scope::Full,
        }
    }

    pub fn subset(&self) -> Option<&str> {
        match self {
            Scope::Full => None,
            Scope::NamedSubset(name) => Some(name),
        }
    }
}

impl fmt::Display for Scope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Scope::Full => f.write_str("FULL"),
            Scope::NamedSubset(name) => write!(f, "NAMED_SUBSET({})", name),
        }
    }
}

/// A captured artifact of a service plus its metadata.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Snapshot {
    pub id: String,
    pub service_kind: ServiceKind,
    pub source_name: String,
    pub scope: Scope,
    pub created_at: DateTime<Utc>,
    pub size_bytes: u64,
    pub digest: ContentDigest,
    #[serde(default)]
    pub local_path: Option<PathBuf>,
    pub storage_location: Option<String>,
    pub status: SnapshotStatus,
}

impl Snapshot {
    pub fn creating(
        id: String,
        service_kind: ServiceKind,
        source_name: &str,
        scope: Scope,
        created_at: DateTime<Utc>,
        algorithm: DigestAlgorithm,
    ) -> Self {
        Self {
            id,
            service_kind,
            source_name: source_name.to_string(),
            scope,
            created_at,
            size_bytes: 0,
            digest: ContentDigest::pending(algorithm),
            local_path: None,
            storage_location: None,
            status: SnapshotStatus::Creating,
        }
    }

    /// CREATING -> LOCAL once the artifact is on disk.
    pub fn captured(self, size_bytes: u64, digest: ContentDigest, local_path: PathBuf) -> Result<Self> {
        let mut next = self.transition(SnapshotStatus::Local)?;
        next.size_bytes = size_bytes;
        next.digest = digest;
        next.local_path = Some(local_path);
        Ok(next)
    }

    /// UPLOADING -> REMOTE with the location the artifact was verified at.
    pub fn stored_at(self, location: String) -> Result<Self> {
        let mut next = self.transition(SnapshotStatus::Remote)?;
        next.storage_location = Some(location);
        Ok(next)
    }

    pub fn transition(&self, next: SnapshotStatus) -> Result<Self> {
        if !self.status.can_transition_to(next) {
            return Err(AppError::Catalog(format!(
                "snapshot {} cannot move from {} to {}",
                self.id, self.status, next
            )));
        }
        let mut updated = self.clone();
        updated.status = next;
        Ok(updated)
    }

    pub fn artifact_file_name(&self) -> String {
        format!("{}.{}", self.id, self.service_kind.artifact_extension())
    }
}

/// `{source}-{YYYYMMDDTHHMMSSZ}`; the catalog appends a suffix on collision.
pub fn snapshot_id(source_name: &str, created_at: DateTime<Utc>) -> String {
    format!("{}-{}", source_name, created_at.format("%Y%m%dT%H%M%SZ"))
}

/// Names end up in file names, object keys and quoted SQL identifiers.
pub fn validate_name(kind: &str, name: &str) -> Result<()> {
    if name.trim().is_empty()
        || name.len() > 63
        || name.contains(|c: char| !c.is_ascii_alphanumeric() && c != '_' && c != '-')
    {
        return Err(AppError::Config(format!(
            "invalid {} name '{}': use letters, digits, '_' or '-' (max 63 characters)",
            kind, name
        )));
    }
    Ok(())
}
