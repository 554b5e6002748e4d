//! Running external client tools, either installed on the host or inside the
//! service's container through `docker exec -i`.

use std::ffi::OsString;
use std::path::{Path, PathBuf};
use std::process::{Output, Stdio};

use tokio::io::AsyncReadExt;
use tokio::process::Command;
use tracing::debug;
use which::which;

use super::SnapshotSource;
use crate::errors::{AppError, Result};

#[derive(Debug, Clone)]
pub struct ToolCommand {
    program: PathBuf,
    container: Option<String>,
    tool: String,
    args: Vec<OsString>,
    env: Vec<(String, String)>,
}

impl ToolCommand {
    /// Resolves `tool` on the host `PATH`, or `docker` when a container is given.
    pub fn locate(tool: &str, container: Option<&str>) -> std::result::Result<Self, which::Error> {
        let program = match container {
            Some(_) => which("docker")?,
            None => which(tool)?,
        };
        Ok(Self {
            program,
            container: container.map(str::to_string),
            tool: tool.to_string(),
            args: Vec::new(),
            env: Vec::new(),
        })
    }

    /// Plain host command (`docker stop`, `docker cp`, ...).
    pub fn host(tool: &str) -> std::result::Result<Self, which::Error> {
        Self::locate(tool, None)
    }

    pub fn arg(mut self, arg: impl Into<OsString>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<OsString>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    pub fn env(mut self, key: &str, value: &str) -> Self {
        self.env.push((key.to_string(), value.to_string()));
        self
    }

    pub fn display(&self) -> String {
        let args: Vec<String> = self
            .args
            .iter()
            .map(|a| a.to_string_lossy().into_owned())
            .collect();
        match &self.container {
            Some(container) => format!("docker exec -i {} {} {}", container, self.tool, args.join(" ")),
            None => format!("{} {}", self.tool, args.join(" ")),
        }
    }

    fn command(&self) -> Command {
        let mut command = Command::new(&self.program);
        if let Some(container) = &self.container {
            command.arg("exec").arg("-i");
            // `-e KEY` without a value makes docker forward the variable from
            // its own environment, keeping secrets off the argument list.
            for (key, _) in &self.env {
                command.arg("-e").arg(key);
            }
            command.arg(container).arg(&self.tool);
        }
        command.args(&self.args);
        for (key, value) in &self.env {
            command.env(key, value);
        }
        command.kill_on_drop(true);
        command
    }

    /// Spawns the tool with stdout as the snapshot stream. The completion
    /// future resolves once the process exits and reports its status; dropping
    /// it kills the process.
    pub fn spawn_snapshot(&self, target: &str) -> Result<SnapshotSource> {
        debug!(target_name = %target, command = %self.display(), "Spawning snapshot process");
        let mut child = self
            .command()
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|e| AppError::ProducerUnavailable {
                target: target.to_string(),
                reason: format!("failed to start {}: {}", self.tool, e),
            })?;

        let stdout = child.stdout.take().ok_or_else(|| AppError::ProducerUnavailable {
            target: target.to_string(),
            reason: "snapshot process has no stdout".to_string(),
        })?;
        let mut stderr = child.stderr.take();
        let stderr_task = tokio::spawn(async move {
            let mut captured = Vec::new();
            if let Some(stderr) = stderr.as_mut() {
                let _ = stderr.read_to_end(&mut captured).await;
            }
            String::from_utf8_lossy(&captured).trim().to_string()
        });

        let target = target.to_string();
        let completion = async move {
            let status = child.wait().await?;
            let stderr = stderr_task.await.unwrap_or_default();
            if !status.success() {
                return Err(AppError::ProducerProcessFailed {
                    target,
                    status: status.to_string(),
                    stderr,
                });
            }
            Ok(())
        };

        Ok(SnapshotSource {
            stream: Box::pin(stdout),
            completion: Box::pin(completion),
        })
    }

    pub async fn run(&self) -> Result<Output> {
        debug!(command = %self.display(), "Running command");
        Ok(self.command().stdin(Stdio::null()).output().await?)
    }

    /// Runs the tool with `input` streamed from disk as its stdin.
    pub async fn run_with_stdin_file(&self, input: &Path) -> Result<Output> {
        debug!(command = %self.display(), input = %input.display(), "Running command with file input");
        let file = std::fs::File::open(input)?;
        Ok(self.command().stdin(Stdio::from(file)).output().await?)
    }
}

pub fn stderr_text(output: &Output) -> String {
    let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
    if stderr.is_empty() {
        String::from_utf8_lossy(&output.stdout).trim().to_string()
    } else {
        stderr
    }
}
