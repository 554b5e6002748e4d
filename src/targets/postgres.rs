use std::path::Path;

use async_trait::async_trait;
use sqlx::{Connection, PgConnection};
use tokio::io::AsyncWriteExt;
use tracing::{info, warn};
use url::Url;

use super::process::{ToolCommand, stderr_text};
use super::{ServiceTarget, SnapshotSource};
use crate::config::PostgresTargetConfig;
use crate::errors::{AppError, Result};
use crate::model::{ServiceKind, Scope, validate_name};

/// A PostgreSQL cluster. Full snapshots are `pg_dumpall` streams, subset
/// snapshots are single-database `pg_dump --create` streams; both are plain
/// SQL applied with `psql`.
pub struct PostgresTarget {
    config: PostgresTargetConfig,
}

impl PostgresTarget {
    pub fn new(config: PostgresTargetConfig) -> Self {
        Self { config }
    }

    fn url_for(&self, database: &str) -> Result<Url> {
        let mut url = Url::parse(&self.config.database_url).map_err(|e| {
            AppError::Config(format!(
                "invalid database_url for target {}: {}",
                self.config.name, e
            ))
        })?;
        url.set_path(&format!("/{}", database));
        Ok(url)
    }

    async fn admin_connection(&self) -> Result<PgConnection> {
        let url = self.url_for("postgres")?;
        PgConnection::connect(url.as_str())
            .await
            .map_err(|e| AppError::ProducerUnavailable {
                target: self.config.name.clone(),
                reason: format!(
                    "cannot connect to 'postgres' database on {}: {}",
                    url.host_str().unwrap_or("unknown_host"),
                    e
                ),
            })
    }

    fn tool(&self, tool: &str, database: &str) -> Result<ToolCommand> {
        let command = ToolCommand::locate(tool, self.config.container.as_deref()).map_err(|e| {
            AppError::ProducerUnavailable {
                target: self.config.name.clone(),
                reason: format!(
                    "{} executable not found in PATH ({}). Please ensure PostgreSQL client tools or docker are installed.",
                    tool, e
                ),
            }
        })?;

        let url = self.url_for(database)?;
        match &self.config.container {
            // Inside the container the tools connect over the local socket.
            Some(_) => {
                let mut command = command;
                if !url.username().is_empty() {
                    command = command.args(["-U", url.username()]);
                }
                if let Some(password) = url.password() {
                    command = command.env("PGPASSWORD", password);
                }
                Ok(command.arg(format!("--dbname={}", database)))
            }
            None => Ok(command.arg(format!("--dbname={}", url))),
        }
    }

    fn snapshot_command(&self, scope: &Scope) -> Result<ToolCommand> {
        match scope {
            Scope::Full => Ok(self
                .tool("pg_dumpall", "postgres")?
                .args(["--clean", "--if-exists"])),
            Scope::NamedSubset(database) => {
                validate_name("database", database)?;
                Ok(self
                    .tool("pg_dump", database)?
                    .args(["--clean", "--if-exists", "--create"]))
            }
        }
    }

    async fn database_exists(&self, conn: &mut PgConnection, database: &str) -> Result<bool> {
        sqlx::query_scalar("SELECT EXISTS(SELECT 1 FROM pg_database WHERE datname = $1)")
            .bind(database)
            .fetch_one(conn)
            .await
            .map_err(|e| self.sql_error("check database", e))
    }

    /// Databases affected by an operation on `scope`. `postgres` and
    /// templates are left alone since psql itself connects to `postgres`.
    async fn scoped_databases(&self, conn: &mut PgConnection, scope: &Scope) -> Result<Vec<String>> {
        match scope {
            Scope::NamedSubset(database) => {
                validate_name("database", database)?;
                if self.database_exists(&mut *conn, database).await? {
                    Ok(vec![database.clone()])
                } else {
                    Ok(Vec::new())
                }
            }
            Scope::Full => sqlx::query_scalar(
                "SELECT datname FROM pg_database WHERE datistemplate = false AND datname <> 'postgres'",
            )
            .fetch_all(conn)
            .await
            .map_err(|e| self.sql_error("list databases", e)),
        }
    }

    async fn drop_database(&self, conn: &mut PgConnection, database: &str) -> Result<()> {
        validate_name("database", database)?;
        if database.eq_ignore_ascii_case("postgres") {
            return Err(AppError::Config(
                "refusing to drop the 'postgres' system database".to_string(),
            ));
        }
        warn!(target_name = %self.config.name, database = %database, "Dropping database");
        sqlx::query(&format!(
            r#"DROP DATABASE IF EXISTS {} WITH (FORCE)"#,
            quote_ident(database)
        ))
        .execute(conn)
        .await
        .map_err(|e| self.sql_error("drop database", e))?;
        Ok(())
    }

    fn sql_error(&self, action: &'static str, e: sqlx::Error) -> AppError {
        AppError::TargetCommandFailed {
            target: self.config.name.clone(),
            action,
            status: "sql error".to_string(),
            stderr: e.to_string(),
        }
    }
}

fn quote_ident(name: &str) -> String {
    format!("\"{}\"", name.replace('"', "\"\""))
}

#[async_trait]
impl ServiceTarget for PostgresTarget {
    fn name(&self) -> &str {
        &self.config.name
    }

    fn kind(&self) -> ServiceKind {
        ServiceKind::SqlRelational
    }

    async fn ping(&self) -> Result<()> {
        let mut conn = self.admin_connection().await?;
        sqlx::query("SELECT 1")
            .execute(&mut conn)
            .await
            .map_err(|e| AppError::ProducerUnavailable {
                target: self.config.name.clone(),
                reason: e.to_string(),
            })?;
        let _ = conn.close().await;
        Ok(())
    }

    async fn snapshot(&self, scope: &Scope) -> Result<SnapshotSource> {
        self.snapshot_command(scope)?.spawn_snapshot(&self.config.name)
    }

    async fn apply(&self, artifact: &Path, scope: &Scope) -> Result<()> {
        if let Scope::NamedSubset(database) = scope {
            // The section recreates the database; it must not exist beforehand.
            let mut conn = self.admin_connection().await?;
            self.drop_database(&mut conn, database).await?;
            let _ = conn.close().await;
        }

        let psql = self
            .tool("psql", "postgres")?
            .args(["-X", "-q", "-v", "ON_ERROR_STOP=1"]);
        let output = psql.run_with_stdin_file(artifact).await?;
        if !output.status.success() {
            return Err(AppError::ApplyFailed {
                target: self.config.name.clone(),
                status: output.status.to_string(),
                stderr: stderr_text(&output),
            });
        }
        info!(target_name = %self.config.name, scope = %scope, "Artifact applied with psql");
        Ok(())
    }

    async fn export_live(&self, scope: &Scope, dest: &Path) -> Result<bool> {
        if let Scope::NamedSubset(database) = scope {
            let mut conn = self.admin_connection().await?;
            let exists = self.database_exists(&mut conn, database).await?;
            let _ = conn.close().await;
            if !exists {
                return Ok(false);
            }
        }

        let mut source = self.snapshot(scope).await?;
        let mut file = tokio::fs::File::create(dest).await?;
        tokio::io::copy(&mut source.stream, &mut file).await?;
        file.flush().await?;
        file.sync_all().await?;
        source.completion.await?;
        Ok(true)
    }

    async fn discard(&self, scope: &Scope) -> Result<()> {
        match scope {
            Scope::NamedSubset(database) => {
                let mut conn = self.admin_connection().await?;
                self.drop_database(&mut conn, database).await?;
                let _ = conn.close().await;
                Ok(())
            }
            // The cluster itself always exists.
            Scope::Full => Ok(()),
        }
    }

    async fn quiesce(&self, scope: &Scope) -> Result<()> {
        let mut conn = self.admin_connection().await?;
        for database in self.scoped_databases(&mut conn, scope).await? {
            // Superusers keep access, so the export and apply still get in.
            sqlx::query(&format!(
                "REVOKE CONNECT ON DATABASE {} FROM PUBLIC",
                quote_ident(&database)
            ))
            .execute(&mut conn)
            .await
            .map_err(|e| self.sql_error("revoke connect", e))?;

            sqlx::query(
                "SELECT pg_terminate_backend(pid) FROM pg_stat_activity WHERE datname = $1 AND pid <> pg_backend_pid()",
            )
            .bind(&database)
            .execute(&mut conn)
            .await
            .map_err(|e| self.sql_error("terminate connections", e))?;
            info!(target_name = %self.config.name, database = %database, "Database quiesced");
        }
        let _ = conn.close().await;
        Ok(())
    }

    async fn resume(&self, scope: &Scope) -> Result<()> {
        let mut conn = self.admin_connection().await?;
        for database in self.scoped_databases(&mut conn, scope).await? {
            sqlx::query(&format!(
                "GRANT CONNECT ON DATABASE {} TO PUBLIC",
                quote_ident(&database)
            ))
            .execute(&mut conn)
            .await
            .map_err(|e| self.sql_error("grant connect", e))?;
        }
        let _ = conn.close().await;
        info!(target_name = %self.config.name, scope = %scope, "Connections re-enabled");
        Ok(())
    }
}
