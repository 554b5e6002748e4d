//! In-memory service target and a fault-injecting blob store for tests.

use std::collections::{BTreeMap, VecDeque};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use parking_lot::Mutex;
use tokio::io::AsyncWriteExt;
use tokio::sync::Notify;

use crate::config::TransferConfig;
use crate::digest::{ContentDigest, DigestAlgorithm};
use crate::errors::{AppError, Result};
use crate::model::{ServiceKind, Scope, Snapshot};
use crate::restore::subset;
use crate::targets::{ServiceTarget, SnapshotSource};
use crate::transfer::{BlobError, BlobResult, BlobStore, CompletedPart, FsBlobStore};

pub fn test_transfer_config(chunk_size_bytes: u64) -> TransferConfig {
    TransferConfig {
        chunk_size_bytes,
        max_attempts: 3,
        base_backoff: Duration::from_millis(1),
        max_backoff: Duration::from_millis(5),
        chunk_timeout: Duration::from_secs(5),
    }
}

/// Writes `contents` as a LOCAL snapshot artifact named `<id>.sql`.
pub fn local_artifact(dir: &Path, id: &str, contents: &[u8]) -> anyhow::Result<Snapshot> {
    std::fs::create_dir_all(dir)?;
    let path = dir.join(format!("{}.sql", id));
    std::fs::write(&path, contents)?;
    let digest = ContentDigest::of_bytes(DigestAlgorithm::Sha256, contents);
    Ok(Snapshot::creating(
        id.to_string(),
        ServiceKind::SqlRelational,
        "svc-a",
        Scope::Full,
        Utc::now(),
        DigestAlgorithm::Sha256,
    )
    .captured(contents.len() as u64, digest, path)?)
}

/// Blob store over a directory that can refuse, delay or corrupt operations.
pub struct FlakyStore {
    inner: FsBlobStore,
    root: PathBuf,
    /// Every call, successful or not.
    pub calls: AtomicU32,
    /// Successful `upload_part` calls.
    pub parts_uploaded: AtomicU32,
    reject_part: Mutex<Option<u32>>,
    transient_failures: AtomicU32,
    deny: AtomicBool,
    corrupt_completes: AtomicU32,
    stalled_reads: AtomicU32,
    stalled_parts: AtomicU32,
}

impl FlakyStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        let root = root.into();
        Self {
            inner: FsBlobStore::new(root.clone()),
            root,
            calls: AtomicU32::new(0),
            parts_uploaded: AtomicU32::new(0),
            reject_part: Mutex::new(None),
            transient_failures: AtomicU32::new(0),
            deny: AtomicBool::new(false),
            corrupt_completes: AtomicU32::new(0),
            stalled_reads: AtomicU32::new(0),
            stalled_parts: AtomicU32::new(0),
        }
    }

    /// The next `count` range reads never answer.
    pub fn stall_reads(&self, count: u32) {
        self.stalled_reads.store(count, Ordering::SeqCst);
    }

    /// The next `count` part uploads never answer.
    pub fn stall_parts(&self, count: u32) {
        self.stalled_parts.store(count, Ordering::SeqCst);
    }

    /// Refuse the given part number with a non-retryable error.
    pub fn reject_part(&self, number: Option<u32>) {
        *self.reject_part.lock() = number;
    }

    /// The next `count` calls fail with a transient error.
    pub fn fail_transiently(&self, count: u32) {
        self.transient_failures.store(count, Ordering::SeqCst);
    }

    pub fn deny_access(&self, deny: bool) {
        self.deny.store(deny, Ordering::SeqCst);
    }

    /// The next `count` completed objects get one byte flipped.
    pub fn corrupt_completed_objects(&self, count: u32) {
        self.corrupt_completes.store(count, Ordering::SeqCst);
    }

    fn gate(&self) -> BlobResult<()> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if self.deny.load(Ordering::SeqCst) {
            return Err(BlobError::Unauthorized("access denied".to_string()));
        }
        if take_one(&self.transient_failures) {
            return Err(BlobError::Transient("503 service unavailable".to_string()));
        }
        Ok(())
    }

    fn take_corruption(&self) -> bool {
        take_one(&self.corrupt_completes)
    }
}

fn take_one(counter: &AtomicU32) -> bool {
    counter
        .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
        .is_ok()
}

async fn stall_if(counter: &AtomicU32) {
    if take_one(counter) {
        std::future::pending::<()>().await;
    }
}

#[async_trait]
impl BlobStore for FlakyStore {
    fn describe(&self, key: &str) -> String {
        self.inner.describe(key)
    }

    fn key_for_locator(&self, locator: &str) -> Option<String> {
        self.inner.key_for_locator(locator)
    }

    async fn put(&self, key: &str, body: Vec<u8>) -> BlobResult<()> {
        self.gate()?;
        self.inner.put(key, body).await
    }

    async fn get_range(&self, key: &str, offset: u64, len: u64) -> BlobResult<Vec<u8>> {
        self.gate()?;
        stall_if(&self.stalled_reads).await;
        self.inner.get_range(key, offset, len).await
    }

    async fn stat(&self, key: &str) -> BlobResult<Option<u64>> {
        self.gate()?;
        self.inner.stat(key).await
    }

    async fn delete(&self, key: &str) -> BlobResult<()> {
        self.gate()?;
        self.inner.delete(key).await
    }

    async fn begin_upload(&self, key: &str) -> BlobResult<String> {
        self.gate()?;
        self.inner.begin_upload(key).await
    }

    async fn upload_part(
        &self,
        key: &str,
        upload_id: &str,
        number: u32,
        body: Vec<u8>,
    ) -> BlobResult<CompletedPart> {
        self.gate()?;
        stall_if(&self.stalled_parts).await;
        if *self.reject_part.lock() == Some(number) {
            return Err(BlobError::Rejected(format!("part {} refused", number)));
        }
        let part = self.inner.upload_part(key, upload_id, number, body).await?;
        self.parts_uploaded.fetch_add(1, Ordering::SeqCst);
        Ok(part)
    }

    async fn complete_upload(
        &self,
        key: &str,
        upload_id: &str,
        parts: &[CompletedPart],
    ) -> BlobResult<()> {
        self.gate()?;
        self.inner.complete_upload(key, upload_id, parts).await?;
        if self.take_corruption() {
            let path = self.root.join(key);
            let mut bytes = std::fs::read(&path)?;
            if let Some(first) = bytes.first_mut() {
                *first ^= 0xFF;
            }
            std::fs::write(&path, bytes)?;
        }
        Ok(())
    }

    async fn abort_upload(&self, key: &str, upload_id: &str) -> BlobResult<()> {
        self.gate()?;
        self.inner.abort_upload(key, upload_id).await
    }

    async fn promote(&self, from: &str, to: &str) -> BlobResult<()> {
        self.gate()?;
        self.inner.promote(from, to).await
    }
}

const KV_KEY: &str = "";

#[derive(Default)]
struct MemoryState {
    /// Database name -> contents for SQL targets; a single entry keyed by
    /// `KV_KEY` for key-value targets.
    live: BTreeMap<String, Vec<u8>>,
    /// Scripted outcomes for upcoming `apply` calls; `false` fails the call
    /// after damaging the live data. Empty means success.
    apply_script: VecDeque<bool>,
    snapshot_output: Option<Vec<u8>>,
}

/// A service target holding its data in memory.
pub struct MemoryTarget {
    name: String,
    kind: ServiceKind,
    state: Mutex<MemoryState>,
    unreachable: AtomicBool,
    process_fails: AtomicBool,
    hold: Mutex<Option<Arc<Notify>>>,
    pub snapshots_started: AtomicU32,
    pub applies: AtomicU32,
    pub quiesced: AtomicU32,
    pub resumed: AtomicU32,
}

impl MemoryTarget {
    pub fn sql(name: &str, databases: &[(&str, &str)]) -> Self {
        let target = Self::empty(name, ServiceKind::SqlRelational);
        {
            let mut state = target.state.lock();
            for (db, contents) in databases {
                state.live.insert(db.to_string(), contents.as_bytes().to_vec());
            }
        }
        target
    }

    pub fn key_value(name: &str, contents: &[u8]) -> Self {
        let target = Self::empty(name, ServiceKind::KeyValue);
        target.state.lock().live.insert(KV_KEY.to_string(), contents.to_vec());
        target
    }

    fn empty(name: &str, kind: ServiceKind) -> Self {
        Self {
            name: name.to_string(),
            kind,
            state: Mutex::new(MemoryState::default()),
            unreachable: AtomicBool::new(false),
            process_fails: AtomicBool::new(false),
            hold: Mutex::new(None),
            snapshots_started: AtomicU32::new(0),
            applies: AtomicU32::new(0),
            quiesced: AtomicU32::new(0),
            resumed: AtomicU32::new(0),
        }
    }

    /// Full rendering of the live data, as a snapshot would produce it.
    pub fn contents(&self) -> Vec<u8> {
        let state = self.state.lock();
        render(self.kind, &state.live)
    }

    pub fn database(&self, name: &str) -> Option<Vec<u8>> {
        self.state.lock().live.get(name).cloned()
    }

    pub fn set_database(&self, name: &str, contents: &str) {
        self.state
            .lock()
            .live
            .insert(name.to_string(), contents.as_bytes().to_vec());
    }

    pub fn script_applies(&self, outcomes: &[bool]) {
        self.state.lock().apply_script = outcomes.iter().copied().collect();
    }

    pub fn set_snapshot_output(&self, output: Option<Vec<u8>>) {
        self.state.lock().snapshot_output = output;
    }

    pub fn set_unreachable(&self, unreachable: bool) {
        self.unreachable.store(unreachable, Ordering::SeqCst);
    }

    pub fn set_process_fails(&self, fails: bool) {
        self.process_fails.store(fails, Ordering::SeqCst);
    }

    /// Snapshot streams stall until the returned handle is notified.
    pub fn hold_snapshots(&self) -> Arc<Notify> {
        let notify = Arc::new(Notify::new());
        *self.hold.lock() = Some(notify.clone());
        notify
    }

    fn scope_key(&self, scope: &Scope) -> Result<String> {
        match (self.kind, scope) {
            (ServiceKind::KeyValue, Scope::Full) => Ok(KV_KEY.to_string()),
            (ServiceKind::KeyValue, Scope::NamedSubset(_)) => Err(AppError::UnsupportedScope {
                target: self.name.clone(),
                scope: scope.to_string(),
            }),
            (ServiceKind::SqlRelational, Scope::NamedSubset(name)) => Ok(name.clone()),
            (ServiceKind::SqlRelational, Scope::Full) => Ok(String::new()),
        }
    }

    fn capture(&self, scope: &Scope) -> Result<Vec<u8>> {
        let state = self.state.lock();
        if let Some(output) = &state.snapshot_output {
            return Ok(output.clone());
        }
        match (self.kind, scope) {
            (ServiceKind::SqlRelational, Scope::NamedSubset(name)) => {
                state.live.get(name).cloned().ok_or_else(|| AppError::ProducerProcessFailed {
                    target: self.name.clone(),
                    status: "exit status: 1".to_string(),
                    stderr: format!("database \"{}\" does not exist", name),
                })
            }
            _ => {
                self.scope_key(scope)?;
                Ok(render(self.kind, &state.live))
            }
        }
    }
}

fn render(kind: ServiceKind, live: &BTreeMap<String, Vec<u8>>) -> Vec<u8> {
    match kind {
        ServiceKind::KeyValue => live.get(KV_KEY).cloned().unwrap_or_default(),
        ServiceKind::SqlRelational => {
            let mut out = b"-- PostgreSQL database cluster dump\n".to_vec();
            for (name, contents) in live {
                out.extend_from_slice(subset::section_header(name).as_bytes());
                out.extend_from_slice(contents);
            }
            out.extend_from_slice(subset::cluster_footer().as_bytes());
            out
        }
    }
}

fn strip_header(name: &str, bytes: Vec<u8>) -> Vec<u8> {
    let header = subset::section_header(name);
    match bytes.strip_prefix(header.as_bytes()) {
        Some(rest) => rest.to_vec(),
        None => bytes,
    }
}

#[async_trait]
impl ServiceTarget for MemoryTarget {
    fn name(&self) -> &str {
        &self.name
    }

    fn kind(&self) -> ServiceKind {
        self.kind
    }

    async fn ping(&self) -> Result<()> {
        if self.unreachable.load(Ordering::SeqCst) {
            return Err(AppError::ProducerUnavailable {
                target: self.name.clone(),
                reason: "connection refused".to_string(),
            });
        }
        Ok(())
    }

    async fn snapshot(&self, scope: &Scope) -> Result<SnapshotSource> {
        self.snapshots_started.fetch_add(1, Ordering::SeqCst);
        let data = self.capture(scope)?;
        let fails = self.process_fails.load(Ordering::SeqCst);
        let target = self.name.clone();
        let completion = Box::pin(async move {
            if fails {
                return Err(AppError::ProducerProcessFailed {
                    target,
                    status: "exit status: 2".to_string(),
                    stderr: "connection lost".to_string(),
                });
            }
            Ok(())
        });

        let hold = self.hold.lock().clone();
        match hold {
            Some(gate) => {
                let (mut writer, reader) = tokio::io::duplex(64);
                tokio::spawn(async move {
                    gate.notified().await;
                    let _ = writer.write_all(&data).await;
                });
                Ok(SnapshotSource {
                    stream: Box::pin(reader),
                    completion,
                })
            }
            None => Ok(SnapshotSource {
                stream: Box::pin(std::io::Cursor::new(data)),
                completion,
            }),
        }
    }

    async fn apply(&self, artifact: &Path, scope: &Scope) -> Result<()> {
        self.applies.fetch_add(1, Ordering::SeqCst);
        let key = self.scope_key(scope)?;
        let bytes = tokio::fs::read(artifact).await?;

        let succeed = self.state.lock().apply_script.pop_front().unwrap_or(true);
        if !succeed {
            let mut state = self.state.lock();
            state.live.insert(key, b"half-applied garbage".to_vec());
            return Err(AppError::ApplyFailed {
                target: self.name.clone(),
                status: "exit status: 3".to_string(),
                stderr: "ERROR: scripted failure".to_string(),
            });
        }

        match (self.kind, scope) {
            (ServiceKind::SqlRelational, Scope::Full) => {
                let mut live = BTreeMap::new();
                for name in subset::list_sections(artifact).await? {
                    let section = artifact.with_extension(format!("{}.section", name));
                    subset::extract_section(artifact, &name, &section).await?;
                    let contents = strip_header(&name, tokio::fs::read(&section).await?);
                    tokio::fs::remove_file(&section).await?;
                    live.insert(name, contents);
                }
                self.state.lock().live = live;
            }
            (ServiceKind::SqlRelational, Scope::NamedSubset(name)) => {
                self.state
                    .lock()
                    .live
                    .insert(key, strip_header(name, bytes));
            }
            (ServiceKind::KeyValue, _) => {
                self.state.lock().live.insert(key, bytes);
            }
        }
        Ok(())
    }

    async fn export_live(&self, scope: &Scope, dest: &Path) -> Result<bool> {
        let data = {
            let state = self.state.lock();
            match (self.kind, scope) {
                (ServiceKind::SqlRelational, Scope::NamedSubset(name)) => {
                    state.live.get(name).cloned()
                }
                _ => {
                    self.scope_key(scope)?;
                    Some(render(self.kind, &state.live))
                }
            }
        };
        match data {
            Some(data) => {
                tokio::fs::write(dest, data).await?;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn discard(&self, scope: &Scope) -> Result<()> {
        if let Scope::NamedSubset(name) = scope {
            self.state.lock().live.remove(name);
        }
        Ok(())
    }

    async fn quiesce(&self, scope: &Scope) -> Result<()> {
        self.scope_key(scope)?;
        self.quiesced.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn resume(&self, scope: &Scope) -> Result<()> {
        self.scope_key(scope)?;
        self.resumed.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

/// Polls `condition` until it holds or a second has passed.
pub async fn wait_until(mut condition: impl FnMut() -> bool) -> bool {
    for _ in 0..200 {
        if condition() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    condition()
}
