//! Snapshot backup/restore tool
//!
//! Captures, uploads and transactionally restores snapshots of PostgreSQL
//! and Redis services.

mod catalog;
mod config;
mod digest;
mod engine;
mod errors;
mod logging;
mod model;
mod producer;
mod restore;
mod targets;
#[cfg(test)]
mod test_support;
mod transfer;

use std::path::PathBuf;
use std::process::ExitCode;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tokio_util::sync::CancellationToken;

use config::AppConfig;
use engine::{BackupOptions, Engine, RestoreRequest};
use errors::{AppError, ResultCode};
use logging::LogFormat;
use model::{Scope, Snapshot};

#[derive(Debug, Parser)]
#[command(name = "snapshottool", version, about = "Snapshot, upload and restore stateful services")]
struct Cli {
    /// Path to the JSON configuration file.
    #[arg(long, default_value = "config.json")]
    config: PathBuf,
    /// Emit logs as JSON lines.
    #[arg(long)]
    json_logs: bool,
    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Capture a snapshot of a target and upload it.
    Backup {
        target: String,
        /// Capture a single database instead of the whole service.
        #[arg(long)]
        subset: Option<String>,
        /// Keep the snapshot local even when remote storage is configured.
        #[arg(long)]
        no_upload: bool,
        #[arg(long)]
        deadline_secs: Option<u64>,
    },
    /// Upload (or resume uploading) a local snapshot.
    Upload { snapshot_id: String },
    /// Validate a restore without touching the target and print its confirmation token.
    Plan {
        target: String,
        /// Catalog id, local artifact path, or remote locator.
        snapshot: String,
        #[arg(long)]
        subset: Option<String>,
    },
    /// Restore a snapshot into a target.
    Restore {
        target: String,
        snapshot: String,
        #[arg(long)]
        subset: Option<String>,
        /// Token printed by `plan`.
        #[arg(long)]
        token: Option<String>,
        /// Skip the confirmation token; validation still runs.
        #[arg(long)]
        force: bool,
        #[arg(long)]
        deadline_secs: Option<u64>,
    },
    /// List known snapshots, newest first.
    List {
        #[arg(long)]
        source: Option<String>,
        #[arg(long)]
        json: bool,
    },
    /// Delete a snapshot locally, remotely and from the catalog.
    Delete { snapshot_id: String },
    /// Delete all but the newest snapshots of a source.
    Prune {
        source: String,
        #[arg(long)]
        keep_last: usize,
    },
    /// Rewrite the catalog journal without superseded entries.
    Compact,
}

impl Command {
    fn target_name(&self) -> Option<&str> {
        match self {
            Command::Backup { target, .. }
            | Command::Plan { target, .. }
            | Command::Restore { target, .. } => Some(target),
            _ => None,
        }
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    dotenv::dotenv().ok();
    let cli = Cli::parse();
    logging::init(if cli.json_logs { LogFormat::Json } else { LogFormat::Human });

    match run_app(cli).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            let code = result_code(&e);
            eprintln!("❌ {}: {:#}", code.as_str(), e);
            ExitCode::from(code.exit_code())
        }
    }
}

fn result_code(err: &anyhow::Error) -> ResultCode {
    err.chain()
        .find_map(|cause| cause.downcast_ref::<AppError>())
        .map(AppError::code)
        .unwrap_or(ResultCode::Internal)
}

fn cancel_on_ctrl_c() -> CancellationToken {
    let cancel = CancellationToken::new();
    let token = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            eprintln!("🛑 Interrupt received, cancelling...");
            token.cancel();
        }
    });
    cancel
}

async fn run_app(cli: Cli) -> Result<()> {
    let app_config = AppConfig::load_from_json(&cli.config).context(format!(
        "Failed to load application configuration from {}",
        cli.config.display()
    ))?;
    if let Some(name) = cli.command.target_name() {
        app_config.target(name)?;
    }
    let engine = Engine::open(&app_config)
        .await
        .context("Failed to open the snapshot engine")?;
    let cancel = cancel_on_ctrl_c();

    match cli.command {
        Command::Backup {
            target,
            subset,
            no_upload,
            deadline_secs,
        } => {
            let upload = !no_upload && engine.has_remote_storage();
            println!("🚀 Starting backup of {}...", target);
            let options = BackupOptions {
                upload,
                deadline: deadline_secs.map(Duration::from_secs),
            };
            let snapshot = engine
                .run_backup(&target, Scope::from_subset(subset), options, &cancel)
                .await
                .context("Backup failed")?;
            println!(
                "✅ Snapshot {} ({}, {} bytes)",
                snapshot.id, snapshot.status, snapshot.size_bytes
            );
            println!("   digest: {}", snapshot.digest);
            match &snapshot.storage_location {
                Some(location) => println!("   stored at: {}", location),
                None => println!("   kept locally (no upload)"),
            }
        }
        Command::Upload { snapshot_id } => {
            println!("☁️ Uploading {}...", snapshot_id);
            let snapshot = engine
                .upload_snapshot(&snapshot_id, &cancel)
                .await
                .context("Upload failed")?;
            println!(
                "✅ {} stored at {}",
                snapshot.id,
                snapshot.storage_location.as_deref().unwrap_or_default()
            );
        }
        Command::Plan {
            target,
            snapshot,
            subset,
        } => {
            let preview = engine
                .plan_restore(&target, &snapshot, Scope::from_subset(subset), &cancel)
                .await
                .context("Restore plan failed validation")?;
            println!(
                "✅ Snapshot {} can be restored into {} ({})",
                preview.snapshot.id, preview.target, preview.scope
            );
            println!("   confirmation token: {}", preview.token);
            let subset_flag = preview
                .scope
                .subset()
                .map(|name| format!(" --subset {}", name))
                .unwrap_or_default();
            println!(
                "   run: snapshottool restore {} {}{} --token {}",
                preview.target, snapshot, subset_flag, preview.token
            );
        }
        Command::Restore {
            target,
            snapshot,
            subset,
            token,
            force,
            deadline_secs,
        } => {
            println!("🔄 Restoring {} into {}...", snapshot, target);
            let request = RestoreRequest {
                snapshot_ref: snapshot,
                scope: Scope::from_subset(subset),
                force,
                confirmation: token,
                deadline: deadline_secs.map(Duration::from_secs),
            };
            let report = engine
                .run_restore(&target, request, &cancel)
                .await
                .context("Restore failed")?;
            println!(
                "✅ Restored {} into {} ({}), run {}",
                report.snapshot_id, report.target, report.scope, report.run_id
            );
            if report.rolled_back_once {
                println!("   the first apply failed and was rolled back before the successful retry");
            }
        }
        Command::List { source, json } => {
            let snapshots: Vec<Snapshot> = engine.list_snapshots(source.as_deref()).collect();
            if json {
                println!("{}", serde_json::to_string_pretty(&snapshots)?);
            } else if snapshots.is_empty() {
                println!("No snapshots found.");
            } else {
                for snapshot in &snapshots {
                    print_snapshot(snapshot);
                }
            }
        }
        Command::Delete { snapshot_id } => {
            let snapshot = engine
                .delete_snapshot(&snapshot_id, &cancel)
                .await
                .context("Delete failed")?;
            println!("🗑️ Deleted {}", snapshot.id);
        }
        Command::Prune { source, keep_last } => {
            let removed = engine
                .prune(&source, keep_last, &cancel)
                .await
                .context("Prune failed")?;
            println!(
                "🗑️ Removed {} snapshot(s) of {}, kept the newest {}",
                removed.len(),
                source,
                keep_last
            );
            for snapshot in &removed {
                println!("   - {}", snapshot.id);
            }
        }
        Command::Compact => {
            engine.catalog().compact().context("Catalog compaction failed")?;
            println!("✅ Catalog compacted");
        }
    }
    Ok(())
}

fn print_snapshot(snapshot: &Snapshot) {
    println!(
        "{}  {:<9} {:<18} {:>12} bytes  {}  {}",
        snapshot.created_at.format("%Y-%m-%d %H:%M:%S"),
        snapshot.status,
        snapshot.scope,
        snapshot.size_bytes,
        snapshot.id,
        snapshot
            .storage_location
            .as_deref()
            .or_else(|| snapshot.local_path.as_deref().and_then(|p| p.to_str()))
            .unwrap_or("-"),
    );
}
