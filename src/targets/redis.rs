use std::path::Path;

use async_trait::async_trait;
use tracing::info;

use super::process::{ToolCommand, stderr_text};
use super::{ServiceTarget, SnapshotSource};
use crate::config::RedisTargetConfig;
use crate::errors::{AppError, Result};
use crate::model::{ServiceKind, Scope};

/// A Redis instance running in a container. Snapshots are RDB files streamed
/// by `redis-cli --rdb -`; restores stop the container and copy the RDB file
/// into its data path.
pub struct RedisTarget {
    config: RedisTargetConfig,
}

impl RedisTarget {
    pub fn new(config: RedisTargetConfig) -> Self {
        Self { config }
    }

    fn redis_cli(&self) -> Result<ToolCommand> {
        let command = ToolCommand::locate("redis-cli", Some(&self.config.container)).map_err(|e| {
            AppError::ProducerUnavailable {
                target: self.config.name.clone(),
                reason: format!("docker executable not found in PATH: {}", e),
            }
        })?;
        Ok(match &self.config.password {
            Some(password) => command.env("REDISCLI_AUTH", password),
            None => command,
        })
    }

    fn docker(&self) -> Result<ToolCommand> {
        ToolCommand::host("docker").map_err(|e| AppError::ProducerUnavailable {
            target: self.config.name.clone(),
            reason: format!("docker executable not found in PATH: {}", e),
        })
    }

    fn container_path(&self) -> String {
        format!("{}:{}", self.config.container, self.config.data_path)
    }

    fn require_full(&self, scope: &Scope) -> Result<()> {
        match scope {
            Scope::Full => Ok(()),
            Scope::NamedSubset(_) => Err(AppError::UnsupportedScope {
                target: self.config.name.clone(),
                scope: scope.to_string(),
            }),
        }
    }

    async fn run(&self, action: &'static str, command: ToolCommand) -> Result<()> {
        let output = command.run().await?;
        if !output.status.success() {
            return Err(AppError::TargetCommandFailed {
                target: self.config.name.clone(),
                action,
                status: output.status.to_string(),
                stderr: stderr_text(&output),
            });
        }
        Ok(())
    }
}

#[async_trait]
impl ServiceTarget for RedisTarget {
    fn name(&self) -> &str {
        &self.config.name
    }

    fn kind(&self) -> ServiceKind {
        ServiceKind::KeyValue
    }

    async fn ping(&self) -> Result<()> {
        let output = self.redis_cli()?.arg("PING").run().await?;
        if !output.status.success() {
            return Err(AppError::ProducerUnavailable {
                target: self.config.name.clone(),
                reason: format!("redis-cli PING exited with {}: {}", output.status, stderr_text(&output)),
            });
        }
        Ok(())
    }

    async fn snapshot(&self, scope: &Scope) -> Result<SnapshotSource> {
        self.require_full(scope)?;
        self.redis_cli()?
            .args(["--rdb", "-"])
            .spawn_snapshot(&self.config.name)
    }

    async fn apply(&self, artifact: &Path, scope: &Scope) -> Result<()> {
        self.require_full(scope)?;
        let copy = self
            .docker()?
            .arg("cp")
            .arg(artifact)
            .arg(self.container_path());
        let output = copy.run().await?;
        if !output.status.success() {
            return Err(AppError::ApplyFailed {
                target: self.config.name.clone(),
                status: output.status.to_string(),
                stderr: stderr_text(&output),
            });
        }
        info!(target_name = %self.config.name, data_path = %self.config.data_path, "RDB file copied into container");
        Ok(())
    }

    async fn export_live(&self, scope: &Scope, dest: &Path) -> Result<bool> {
        self.require_full(scope)?;
        let copy = self.docker()?.arg("cp").arg(self.container_path()).arg(dest);
        self.run("export live data", copy).await?;
        Ok(true)
    }

    async fn discard(&self, scope: &Scope) -> Result<()> {
        // A quiesced instance always has a data file, so there is never
        // anything to discard.
        self.require_full(scope)
    }

    async fn quiesce(&self, scope: &Scope) -> Result<()> {
        self.require_full(scope)?;
        // Flush the dataset to the data path so the export sees current data.
        self.run("save", self.redis_cli()?.arg("SAVE")).await?;
        let stop = self.docker()?.args(["stop", self.config.container.as_str()]);
        self.run("stop container", stop).await?;
        info!(target_name = %self.config.name, container = %self.config.container, "Container stopped");
        Ok(())
    }

    async fn resume(&self, scope: &Scope) -> Result<()> {
        self.require_full(scope)?;
        let start = self.docker()?.args(["start", self.config.container.as_str()]);
        self.run("start container", start).await?;
        info!(target_name = %self.config.name, container = %self.config.container, "Container started");
        Ok(())
    }
}
