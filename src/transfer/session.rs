use std::io::Write;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};
use tracing::warn;

use super::blob::CompletedPart;
use crate::errors::{AppError, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Direction {
    Upload,
    Download,
}

impl Direction {
    fn as_str(self) -> &'static str {
        match self {
            Direction::Upload => "upload",
            Direction::Download => "download",
        }
    }
}

/// Resume point of an interrupted transfer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransferMarker {
    pub artifact_id: String,
    pub direction: Direction,
    pub remote_key: String,
    pub bytes_completed: u64,
    pub total_bytes: u64,
    pub attempt_count: u32,
    /// Multipart upload id; uploads only.
    #[serde(default)]
    pub upload_id: Option<String>,
    #[serde(default)]
    pub parts: Vec<CompletedPart>,
    /// Set once the transfer itself finished and only verification remains.
    #[serde(default)]
    pub completed: bool,
}

impl TransferMarker {
    pub fn new(artifact_id: &str, direction: Direction, remote_key: &str, total_bytes: u64) -> Self {
        Self {
            artifact_id: artifact_id.to_string(),
            direction,
            remote_key: remote_key.to_string(),
            bytes_completed: 0,
            total_bytes,
            attempt_count: 0,
            upload_id: None,
            parts: Vec::new(),
            completed: false,
        }
    }

    /// Whether this marker can resume a transfer of the given shape.
    pub fn matches(&self, remote_key: &str, total_bytes: u64) -> bool {
        self.remote_key == remote_key && self.total_bytes == total_bytes
    }
}

/// One JSON file per artifact and direction under the transfer state directory.
pub struct MarkerStore {
    dir: PathBuf,
}

impl MarkerStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    fn path_for(&self, artifact_id: &str, direction: Direction) -> PathBuf {
        self.dir
            .join(format!("{}.{}.json", artifact_id, direction.as_str()))
    }

    /// An unreadable marker is treated as absent; the transfer starts over.
    pub fn load(&self, artifact_id: &str, direction: Direction) -> Option<TransferMarker> {
        let path = self.path_for(artifact_id, direction);
        let contents = match std::fs::read(&path) {
            Ok(contents) => contents,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return None,
            Err(e) => {
                warn!(marker = %path.display(), error = %e, "Cannot read transfer marker, starting over");
                return None;
            }
        };
        match serde_json::from_slice::<TransferMarker>(&contents) {
            Ok(marker) if marker.artifact_id == artifact_id && marker.direction == direction => {
                Some(marker)
            }
            Ok(_) => {
                warn!(marker = %path.display(), "Transfer marker belongs to another transfer, ignoring");
                None
            }
            Err(e) => {
                warn!(marker = %path.display(), error = %e, "Corrupt transfer marker, starting over");
                None
            }
        }
    }

    pub fn save(&self, marker: &TransferMarker) -> Result<()> {
        std::fs::create_dir_all(&self.dir)?;
        let path = self.path_for(&marker.artifact_id, marker.direction);
        let mut temp = tempfile::Builder::new()
            .prefix(".marker-")
            .suffix(".json")
            .tempfile_in(&self.dir)?;
        temp.write_all(&serde_json::to_vec_pretty(marker)?)?;
        temp.as_file().sync_all()?;
        temp.persist(&path).map_err(|e| AppError::Io(e.error))?;
        Ok(())
    }

    pub fn clear(&self, artifact_id: &str, direction: Direction) -> Result<()> {
        match std::fs::remove_file(self.path_for(artifact_id, direction)) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_save_load_clear() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let store = MarkerStore::new(dir.path().join("transfers"));
        let mut marker = TransferMarker::new("svc-a-1", Direction::Upload, "svc-a/svc-a-1.sql", 100);
        marker.bytes_completed = 40;
        marker.upload_id = Some("u-1".to_string());
        marker.parts.push(CompletedPart {
            number: 1,
            etag: "e1".to_string(),
            size: 40,
        });
        store.save(&marker)?;

        assert_eq!(store.load("svc-a-1", Direction::Upload), Some(marker));
        assert_eq!(store.load("svc-a-1", Direction::Download), None);

        store.clear("svc-a-1", Direction::Upload)?;
        assert_eq!(store.load("svc-a-1", Direction::Upload), None);
        store.clear("svc-a-1", Direction::Upload)?;
        Ok(())
    }

    #[test]
    fn test_corrupt_marker_is_ignored() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let store = MarkerStore::new(dir.path());
        std::fs::write(dir.path().join("snap.download.json"), b"{\"artifact_id\": ")?;
        assert_eq!(store.load("snap", Direction::Download), None);
        Ok(())
    }
}
