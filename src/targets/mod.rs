//! Services that can be snapshotted and restored.

pub mod postgres;
pub mod process;
pub mod redis;

use std::path::Path;
use std::pin::Pin;
use std::sync::Arc;

use async_trait::async_trait;
use futures::future::BoxFuture;
use tokio::io::AsyncRead;

use crate::config::TargetConfig;
use crate::errors::Result;
use crate::model::{ServiceKind, Scope};

pub use postgres::PostgresTarget;
pub use redis::RedisTarget;

/// Byte stream of a snapshot being captured, plus a future that resolves once
/// the producing process has exited. The stream must be drained before the
/// completion is awaited.
pub struct SnapshotSource {
    pub stream: Pin<Box<dyn AsyncRead + Send>>,
    pub completion: BoxFuture<'static, Result<()>>,
}

#[async_trait]
pub trait ServiceTarget: Send + Sync {
    fn name(&self) -> &str;

    fn kind(&self) -> ServiceKind;

    /// Cheap reachability check, run before anything is written.
    async fn ping(&self) -> Result<()>;

    async fn snapshot(&self, scope: &Scope) -> Result<SnapshotSource>;

    /// Replaces the live data for `scope` with the artifact at `artifact`.
    async fn apply(&self, artifact: &Path, scope: &Scope) -> Result<()>;

    /// Writes the current live data for `scope` to `dest`. Returns `false`
    /// (and writes nothing) when there is no live data for that scope yet.
    async fn export_live(&self, scope: &Scope, dest: &Path) -> Result<bool>;

    /// Removes live data for `scope`; used to roll back a restore into a
    /// subset that did not exist beforehand.
    async fn discard(&self, scope: &Scope) -> Result<()>;

    async fn quiesce(&self, scope: &Scope) -> Result<()>;

    async fn resume(&self, scope: &Scope) -> Result<()>;
}

pub fn build_target(config: &TargetConfig) -> Arc<dyn ServiceTarget> {
    match config {
        TargetConfig::Postgres(pg) => Arc::new(PostgresTarget::new(pg.clone())),
        TargetConfig::Redis(redis) => Arc::new(RedisTarget::new(redis.clone())),
    }
}
