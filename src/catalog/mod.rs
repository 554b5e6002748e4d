//! Durable ledger of known snapshots.
//!
//! The catalog is a JSON-lines journal replayed into an in-memory index.
//! Several handles, in one process or many, may share a journal: writers
//! take an exclusive lock on `<journal>.lock`, catch up on whatever other
//! handles appended, validate against that state and only then append and
//! fsync. Readers catch up opportunistically and work off an `Arc` of the
//! index. Compaction starts the rewritten journal with a fresh generation
//! line so other handles notice the rewrite and replay from the start.

use std::collections::{HashMap, HashSet};
use std::fs::{File, OpenOptions};
use std::io::{BufRead, BufReader, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::errors::{AppError, Result};
use crate::model::{Scope, Snapshot, snapshot_id};

/// Longest first line that is still read as a generation marker.
const GENERATION_LINE_LIMIT: u64 = 4096;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RestoreOutcome {
    #[default]
    Complete,
    RolledBack,
    Failed,
    Unrecoverable,
}

/// Audit entry written when a restore run ends, successfully or not.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RestoreRecord {
    pub run_id: Uuid,
    pub target: String,
    pub snapshot_id: String,
    pub scope: Scope,
    #[serde(default)]
    pub outcome: RestoreOutcome,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    /// Copy of the live data taken before an unrecoverable swap.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retained_copy: Option<PathBuf>,
    pub applied_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
enum JournalEntry {
    /// First line of a compacted journal.
    Generation { id: Uuid },
    Put { snapshot: Snapshot },
    Delete { id: String },
    Restore { record: RestoreRecord },
}

#[derive(Debug, Clone, Default)]
struct CatalogIndex {
    snapshots: HashMap<String, Snapshot>,
    /// Ids ordered by `created_at` descending, ties broken by id descending.
    ordered: Vec<String>,
    restores: Vec<RestoreRecord>,
}

impl CatalogIndex {
    fn apply(&mut self, entry: JournalEntry) {
        match entry {
            JournalEntry::Generation { .. } => {}
            JournalEntry::Put { snapshot } => {
                let is_new = !self.snapshots.contains_key(&snapshot.id);
                self.snapshots.insert(snapshot.id.clone(), snapshot);
                if is_new {
                    self.reorder();
                }
            }
            JournalEntry::Delete { id } => {
                if self.snapshots.remove(&id).is_some() {
                    self.ordered.retain(|existing| existing != &id);
                }
            }
            JournalEntry::Restore { record } => self.restores.push(record),
        }
    }

    fn reorder(&mut self) {
        let snapshots = &self.snapshots;
        let mut ordered: Vec<String> = snapshots.keys().cloned().collect();
        ordered.sort_by(|a, b| {
            let left = &snapshots[a];
            let right = &snapshots[b];
            right
                .created_at
                .cmp(&left.created_at)
                .then_with(|| right.id.cmp(&left.id))
        });
        self.ordered = ordered;
    }

    fn entries(&self) -> Vec<JournalEntry> {
        let mut entries: Vec<JournalEntry> = self
            .ordered
            .iter()
            .rev()
            .filter_map(|id| self.snapshots.get(id))
            .map(|snapshot| JournalEntry::Put {
                snapshot: snapshot.clone(),
            })
            .collect();
        entries.extend(
            self.restores
                .iter()
                .cloned()
                .map(|record| JournalEntry::Restore { record }),
        );
        entries
    }
}

/// How much of the journal this handle has applied.
#[derive(Debug, Default)]
struct JournalCursor {
    generation: Option<Uuid>,
    offset: u64,
}

pub struct CatalogStore {
    path: PathBuf,
    lock_path: PathBuf,
    cursor: Mutex<JournalCursor>,
    index: RwLock<Arc<CatalogIndex>>,
    reserved: Mutex<HashSet<String>>,
}

impl CatalogStore {
    /// Opens (or creates) the journal at `path` and replays it.
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        OpenOptions::new().append(true).create(true).open(path)?;

        let mut lock_path = path.as_os_str().to_owned();
        lock_path.push(".lock");
        let store = Self {
            path: path.to_path_buf(),
            lock_path: PathBuf::from(lock_path),
            cursor: Mutex::new(JournalCursor::default()),
            index: RwLock::new(Arc::new(CatalogIndex::default())),
            reserved: Mutex::new(HashSet::new()),
        };

        let index = {
            let mut cursor = store.cursor.lock();
            let _lock = store.lock_journal()?;
            store.catch_up(&mut cursor, true)?
        };
        info!(
            catalog = %path.display(),
            snapshots = index.snapshots.len(),
            restores = index.restores.len(),
            "Catalog opened"
        );
        Ok(store)
    }

    /// Records `snapshot`, replacing an earlier record with the same id only if
    /// the status transition is allowed.
    pub fn put(&self, snapshot: Snapshot) -> Result<()> {
        let id = snapshot.id.clone();
        let status = snapshot.status;
        self.commit(|current| {
            if let Some(existing) = current.snapshots.get(&snapshot.id) {
                if existing.status.is_terminal() {
                    return Err(AppError::Catalog(format!(
                        "snapshot {} is {} and can no longer change",
                        existing.id, existing.status
                    )));
                }
                if !existing.status.can_transition_to(snapshot.status) {
                    return Err(AppError::Catalog(format!(
                        "snapshot {} cannot move from {} to {}",
                        existing.id, existing.status, snapshot.status
                    )));
                }
            }
            Ok((JournalEntry::Put { snapshot }, ()))
        })?;
        self.reserved.lock().remove(&id);
        debug!(snapshot = %id, status = %status, "Catalog record written");
        Ok(())
    }

    pub fn get(&self, id: &str) -> Result<Snapshot> {
        self.find(id)
            .ok_or_else(|| AppError::SnapshotNotFound(id.to_string()))
    }

    pub fn find(&self, id: &str) -> Option<Snapshot> {
        self.current().snapshots.get(id).cloned()
    }

    pub fn find_by_local_path(&self, path: &Path) -> Option<Snapshot> {
        self.current()
            .snapshots
            .values()
            .find(|snapshot| snapshot.local_path.as_deref() == Some(path))
            .cloned()
    }

    /// Newest first; optionally restricted to one source.
    pub fn list(&self, source_name: Option<&str>) -> SnapshotListing {
        SnapshotListing {
            index: self.current(),
            source_name: source_name.map(str::to_string),
            position: 0,
        }
    }

    pub fn delete(&self, id: &str) -> Result<Snapshot> {
        let existing = self.commit(|current| {
            let existing = current
                .snapshots
                .get(id)
                .cloned()
                .ok_or_else(|| AppError::SnapshotNotFound(id.to_string()))?;
            Ok((JournalEntry::Delete { id: id.to_string() }, existing))
        })?;
        info!(snapshot = %id, "Snapshot removed from catalog");
        Ok(existing)
    }

    pub fn record_restore(&self, record: RestoreRecord) -> Result<()> {
        self.commit(|_| Ok((JournalEntry::Restore { record }, ())))
    }

    pub fn restores(&self, target: &str) -> Vec<RestoreRecord> {
        self.current()
            .restores
            .iter()
            .filter(|record| record.target == target)
            .cloned()
            .collect()
    }

    /// Reserves a unique id for a snapshot being captured. The reservation is
    /// released when the guard drops unless the snapshot was `put` first.
    pub fn allocate_id(&self, source_name: &str, created_at: DateTime<Utc>) -> ReservedId<'_> {
        let base = snapshot_id(source_name, created_at);
        let index = self.current();
        let mut reserved = self.reserved.lock();

        let mut candidate = base.clone();
        let mut suffix = 2;
        while index.snapshots.contains_key(&candidate) || reserved.contains(&candidate) {
            candidate = format!("{}-{}", base, suffix);
            suffix += 1;
        }
        reserved.insert(candidate.clone());

        ReservedId {
            catalog: self,
            id: candidate,
        }
    }

    /// Rewrites the journal with one entry per live record, including the
    /// records other handles appended.
    pub fn compact(&self) -> Result<()> {
        let mut cursor = self.cursor.lock();
        let _lock = self.lock_journal()?;
        let current = self.catch_up(&mut cursor, true)?;
        let dir = self
            .path
            .parent()
            .filter(|p| !p.as_os_str().is_empty())
            .unwrap_or_else(|| Path::new("."));

        let generation = Uuid::new_v4();
        let mut temp = tempfile::Builder::new()
            .prefix(".catalog-")
            .suffix(".jsonl")
            .tempfile_in(dir)?;
        let mut written = 0u64;
        let header = JournalEntry::Generation { id: generation };
        for entry in std::iter::once(header).chain(current.entries()) {
            let mut line = serde_json::to_vec(&entry)?;
            line.push(b'\n');
            temp.write_all(&line)?;
            written += line.len() as u64;
        }
        temp.as_file().sync_all()?;
        temp.persist(&self.path).map_err(|e| AppError::Io(e.error))?;

        cursor.generation = Some(generation);
        cursor.offset = written;
        info!(catalog = %self.path.display(), generation = %generation, "Catalog journal compacted");
        Ok(())
    }

    /// Appends the entry `prepare` derives from the up-to-date index.
    fn commit<T>(
        &self,
        prepare: impl FnOnce(&CatalogIndex) -> Result<(JournalEntry, T)>,
    ) -> Result<T> {
        let mut cursor = self.cursor.lock();
        let _lock = self.lock_journal()?;
        let current = self.catch_up(&mut cursor, true)?;
        let (entry, value) = prepare(&current)?;

        let mut line = serde_json::to_vec(&entry)?;
        line.push(b'\n');
        let mut journal = OpenOptions::new().append(true).open(&self.path)?;
        journal.write_all(&line)?;
        journal.sync_data()?;
        cursor.offset += line.len() as u64;

        let mut next = CatalogIndex::clone(&current);
        next.apply(entry);
        *self.index.write() = Arc::new(next);
        Ok(value)
    }

    /// Latest view of the journal. A handle busy writing serves its cached
    /// index rather than waiting.
    fn current(&self) -> Arc<CatalogIndex> {
        if let Some(mut cursor) = self.cursor.try_lock() {
            match self.catch_up(&mut cursor, false) {
                Ok(index) => return index,
                Err(e) => {
                    warn!(catalog = %self.path.display(), error = %e, "Cannot refresh catalog, serving cached view")
                }
            }
        }
        self.index.read().clone()
    }

    /// Blocks until this handle holds the journal's write lock. Dropping the
    /// returned file releases it.
    fn lock_journal(&self) -> Result<File> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(&self.lock_path)?;
        fs2::FileExt::lock_exclusive(&file)?;
        Ok(file)
    }

    /// Applies whatever was appended since `cursor`, or replays the journal
    /// from the start if it was rewritten. With `repair` (only under the
    /// write lock) a torn final line is cut off.
    fn catch_up(&self, cursor: &mut JournalCursor, repair: bool) -> Result<Arc<CatalogIndex>> {
        let mut journal = OpenOptions::new().read(true).write(repair).open(&self.path)?;
        let len = journal.metadata()?.len();
        let generation = read_generation(&mut journal)?;
        let cached = self.index.read().clone();

        let (start, mut index) = if generation == cursor.generation && len >= cursor.offset {
            if len == cursor.offset {
                return Ok(cached);
            }
            (cursor.offset, CatalogIndex::clone(&cached))
        } else {
            if cursor.offset > 0 {
                debug!(catalog = %self.path.display(), "Catalog journal was rewritten, replaying");
            }
            (0, CatalogIndex::default())
        };

        journal.seek(SeekFrom::Start(start))?;
        let mut contents = Vec::new();
        journal.read_to_end(&mut contents)?;
        let consumed = apply_lines(&self.path, start, &contents, &mut index)?;
        let end = start + consumed as u64;
        if repair && consumed < contents.len() {
            warn!(
                catalog = %self.path.display(),
                bytes = contents.len() - consumed,
                "Discarding incomplete trailing catalog entry"
            );
            journal.set_len(end)?;
            journal.sync_data()?;
        }

        cursor.generation = generation;
        cursor.offset = end;
        let index = Arc::new(index);
        *self.index.write() = index.clone();
        Ok(index)
    }
}

pub struct ReservedId<'a> {
    catalog: &'a CatalogStore,
    id: String,
}

impl ReservedId<'_> {
    pub fn id(&self) -> &str {
        &self.id
    }
}

impl Drop for ReservedId<'_> {
    fn drop(&mut self) {
        self.catalog.reserved.lock().remove(&self.id);
    }
}

/// Lazy, restartable walk over a point-in-time view of the catalog.
#[derive(Clone)]
pub struct SnapshotListing {
    index: Arc<CatalogIndex>,
    source_name: Option<String>,
    position: usize,
}

impl SnapshotListing {
    pub fn restart(&mut self) {
        self.position = 0;
    }
}

impl Iterator for SnapshotListing {
    type Item = Snapshot;

    fn next(&mut self) -> Option<Snapshot> {
        while let Some(id) = self.index.ordered.get(self.position) {
            self.position += 1;
            let Some(snapshot) = self.index.snapshots.get(id) else {
                continue;
            };
            match &self.source_name {
                Some(source) if &snapshot.source_name != source => continue,
                _ => return Some(snapshot.clone()),
            }
        }
        None
    }
}

fn read_generation(journal: &mut File) -> Result<Option<Uuid>> {
    let mut first = Vec::new();
    BufReader::new(&mut *journal)
        .take(GENERATION_LINE_LIMIT)
        .read_until(b'\n', &mut first)?;
    if !first.ends_with(b"\n") {
        return Ok(None);
    }
    match serde_json::from_slice::<JournalEntry>(&first) {
        Ok(JournalEntry::Generation { id }) => Ok(Some(id)),
        _ => Ok(None),
    }
}

/// Applies complete lines of `contents` (journal bytes from `start`) and
/// returns how many bytes were consumed. An unterminated or unreadable last
/// line is left unconsumed: it is either a torn append or one in progress.
fn apply_lines(
    path: &Path,
    start: u64,
    contents: &[u8],
    index: &mut CatalogIndex,
) -> Result<usize> {
    let mut consumed = 0usize;
    let mut offset = 0usize;
    let lines: Vec<&[u8]> = contents.split_inclusive(|b| *b == b'\n').collect();
    let total = lines.len();

    for (number, raw) in lines.into_iter().enumerate() {
        let line_start = start + offset as u64;
        offset += raw.len();
        let terminated = raw.ends_with(b"\n");
        let line = raw.strip_suffix(b"\n").unwrap_or(raw);
        if line.iter().all(u8::is_ascii_whitespace) {
            if terminated {
                consumed = offset;
            }
            continue;
        }

        let is_last = number + 1 == total;
        match serde_json::from_slice::<JournalEntry>(line) {
            Ok(entry) if terminated => {
                index.apply(entry);
                consumed = offset;
            }
            _ if is_last => break,
            Ok(_) => {
                return Err(AppError::Catalog(format!(
                    "unterminated entry at byte {} of {}",
                    line_start,
                    path.display()
                )));
            }
            Err(e) => {
                return Err(AppError::Catalog(format!(
                    "corrupt entry at byte {} of {}: {}",
                    line_start,
                    path.display(),
                    e
                )));
            }
        }
    }
    Ok(consumed)
}
