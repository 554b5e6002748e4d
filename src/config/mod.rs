use anyhow::{Context, Result};
use serde::Deserialize;
use std::collections::HashSet;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::warn;

use crate::model::validate_name;

/// S3 rejects multipart parts smaller than this, except the last one.
pub const MIN_S3_PART_SIZE: u64 = 5 * 1024 * 1024;

// Structs for deserializing config.json
#[derive(Debug, Clone, Deserialize)]
pub struct JsonS3StorageConfig {
    pub bucket_name: Option<String>,
    pub region: Option<String>,
    pub access_key_id: Option<String>,
    pub secret_access_key: Option<String>,
    pub endpoint_url: Option<String>,
    pub folder_prefix: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct JsonTransferOptions {
    pub chunk_size_bytes: Option<u64>,
    pub max_attempts: Option<u32>,
    pub base_backoff_ms: Option<u64>,
    pub max_backoff_ms: Option<u64>,
    pub chunk_timeout_secs: Option<u64>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct JsonRestoreOptions {
    pub retain_pre_restore_copy: Option<bool>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum JsonTargetConfig {
    Postgres {
        name: String,
        database_url: String,
        container: Option<String>,
    },
    Redis {
        name: String,
        container: String,
        data_path: Option<String>,
        password: Option<String>,
    },
}

#[derive(Debug, Clone, Deserialize)]
pub struct RawJsonConfig {
    pub work_dir: Option<PathBuf>,
    pub local_storage_dir: Option<PathBuf>,
    pub s3_storage: Option<JsonS3StorageConfig>,
    pub transfer: Option<JsonTransferOptions>,
    #[serde(alias = "restore_options")]
    pub restore: Option<JsonRestoreOptions>,
    #[serde(default)]
    pub targets: Vec<JsonTargetConfig>,
}

// Application's internal configuration structs
#[derive(Debug, Clone)]
pub struct SpacesConfig {
    pub endpoint_url: Option<String>,
    pub region: String,
    /// When both keys are absent the default AWS credential chain is used.
    pub access_key_id: Option<String>,
    pub secret_access_key: Option<String>,
    pub bucket_name: String,
    pub folder_prefix: Option<String>,
}

#[derive(Debug, Clone)]
pub enum StorageConfig {
    S3(SpacesConfig),
    /// A local directory, typically a mounted network volume.
    Local(PathBuf),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransferConfig {
    pub chunk_size_bytes: u64,
    pub max_attempts: u32,
    pub base_backoff: Duration,
    pub max_backoff: Duration,
    pub chunk_timeout: Duration,
}

impl Default for TransferConfig {
    fn default() -> Self {
        Self {
            chunk_size_bytes: 8 * 1024 * 1024,
            max_attempts: 5,
            base_backoff: Duration::from_millis(500),
            max_backoff: Duration::from_secs(30),
            chunk_timeout: Duration::from_secs(120),
        }
    }
}

impl TransferConfig {
    /// Delay before retry number `attempt` (1-based): base * 2^(attempt-1), capped.
    pub fn backoff_delay(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(20);
        self.base_backoff
            .saturating_mul(1u32 << exponent)
            .min(self.max_backoff)
    }
}

#[derive(Debug, Clone)]
pub struct PostgresTargetConfig {
    pub name: String,
    pub database_url: String,
    pub container: Option<String>,
}

#[derive(Debug, Clone)]
pub struct RedisTargetConfig {
    pub name: String,
    pub container: String,
    pub data_path: String,
    pub password: Option<String>,
}

#[derive(Debug, Clone)]
pub enum TargetConfig {
    Postgres(PostgresTargetConfig),
    Redis(RedisTargetConfig),
}

impl TargetConfig {
    pub fn name(&self) -> &str {
        match self {
            TargetConfig::Postgres(c) => &c.name,
            TargetConfig::Redis(c) => &c.name,
        }
    }
}

#[derive(Debug, Clone)]
pub struct AppConfig {
    pub work_dir: PathBuf,
    pub storage: Option<StorageConfig>,
    pub transfer: TransferConfig,
    pub retain_pre_restore_copy: bool,
    pub targets: Vec<TargetConfig>,
}

impl AppConfig {
    pub fn load_from_json(config_path: &Path) -> Result<Self> {
        let config_content = fs::read_to_string(config_path)
            .with_context(|| format!("Failed to read config file at {}", config_path.display()))?;
        let raw_json_config: RawJsonConfig = serde_json::from_str(&config_content)
            .with_context(|| {
                format!(
                    "Failed to parse JSON from config file at {}",
                    config_path.display()
                )
            })?;
        Self::from_raw(raw_json_config)
    }

    pub fn from_raw(raw: RawJsonConfig) -> Result<Self> {
        let work_dir = raw
            .work_dir
            .clone()
            .unwrap_or_else(|| PathBuf::from("./snapshots"));
        if work_dir.as_os_str().is_empty() {
            anyhow::bail!("work_dir cannot be empty in config.json.");
        }

        let spaces_config = raw.s3_storage.as_ref().and_then(parse_spaces_config);
        let storage = match (spaces_config, raw.local_storage_dir.clone()) {
            (Some(_), Some(_)) => {
                anyhow::bail!("Configure either s3_storage or local_storage_dir in config.json, not both.")
            }
            (Some(spaces), None) => Some(StorageConfig::S3(spaces)),
            (None, Some(dir)) if !dir.as_os_str().is_empty() => Some(StorageConfig::Local(dir)),
            (None, _) => None,
        };

        let transfer = parse_transfer_config(raw.transfer.clone().unwrap_or_default())?;
        if matches!(storage, Some(StorageConfig::S3(_))) && transfer.chunk_size_bytes < MIN_S3_PART_SIZE {
            anyhow::bail!(
                "transfer.chunk_size_bytes must be at least {} bytes for S3 multipart uploads",
                MIN_S3_PART_SIZE
            );
        }

        let retain_pre_restore_copy = raw
            .restore
            .as_ref()
            .and_then(|r| r.retain_pre_restore_copy)
            .unwrap_or(true);

        let mut seen = HashSet::new();
        let mut targets = Vec::with_capacity(raw.targets.len());
        for target in &raw.targets {
            let target = parse_target_config(target)?;
            if !seen.insert(target.name().to_string()) {
                anyhow::bail!("Duplicate target name '{}' in config.json", target.name());
            }
            targets.push(target);
        }

        Ok(AppConfig {
            work_dir,
            storage,
            transfer,
            retain_pre_restore_copy,
            targets,
        })
    }

    pub fn target(&self, name: &str) -> Result<&TargetConfig> {
        self.targets
            .iter()
            .find(|t| t.name() == name)
            .with_context(|| format!("No target named '{}' in config.json", name))
    }

    pub fn artifact_dir(&self) -> PathBuf {
        self.work_dir.join("artifacts")
    }

    pub fn staging_dir(&self) -> PathBuf {
        self.work_dir.join("staging")
    }

    pub fn transfer_state_dir(&self) -> PathBuf {
        self.work_dir.join("transfers")
    }

    pub fn catalog_path(&self) -> PathBuf {
        self.work_dir.join("catalog.jsonl")
    }

    /// Per-target lock files shared by every process using this work dir.
    pub fn lock_dir(&self) -> PathBuf {
        self.work_dir.join("locks")
    }
}

fn parse_spaces_config(s3_raw: &JsonS3StorageConfig) -> Option<SpacesConfig> {
    let non_empty = |v: &Option<String>| v.clone().filter(|s| !s.trim().is_empty());

    let (Some(bucket_name), Some(region)) = (non_empty(&s3_raw.bucket_name), non_empty(&s3_raw.region))
    else {
        if s3_raw.bucket_name.is_some()
            || s3_raw.region.is_some()
            || s3_raw.access_key_id.is_some()
            || s3_raw.secret_access_key.is_some()
            || s3_raw.endpoint_url.is_some()
        {
            // Only warn if some S3 fields were provided but were incomplete/empty
            warn!("S3 configuration is present in config.json but bucket_name or region is missing or empty. S3 operations will be disabled.");
        }
        return None;
    };

    let access_key_id = non_empty(&s3_raw.access_key_id);
    let secret_access_key = non_empty(&s3_raw.secret_access_key);
    if access_key_id.is_some() != secret_access_key.is_some() {
        warn!("Only one of access_key_id / secret_access_key is set in config.json. S3 operations will be disabled.");
        return None;
    }

    Some(SpacesConfig {
        endpoint_url: non_empty(&s3_raw.endpoint_url),
        region,
        access_key_id,
        secret_access_key,
        bucket_name,
        folder_prefix: non_empty(&s3_raw.folder_prefix).map(|p| p.trim_matches('/').to_string()),
    })
}

fn parse_transfer_config(raw: JsonTransferOptions) -> Result<TransferConfig> {
    let defaults = TransferConfig::default();
    let config = TransferConfig {
        chunk_size_bytes: raw.chunk_size_bytes.unwrap_or(defaults.chunk_size_bytes),
        max_attempts: raw.max_attempts.unwrap_or(defaults.max_attempts),
        base_backoff: raw
            .base_backoff_ms
            .map(Duration::from_millis)
            .unwrap_or(defaults.base_backoff),
        max_backoff: raw
            .max_backoff_ms
            .map(Duration::from_millis)
            .unwrap_or(defaults.max_backoff),
        chunk_timeout: raw
            .chunk_timeout_secs
            .map(Duration::from_secs)
            .unwrap_or(defaults.chunk_timeout),
    };

    if config.chunk_size_bytes == 0 {
        anyhow::bail!("transfer.chunk_size_bytes must be greater than zero");
    }
    if config.max_attempts == 0 {
        anyhow::bail!("transfer.max_attempts must be at least 1");
    }
    if config.chunk_timeout.is_zero() {
        anyhow::bail!("transfer.chunk_timeout_secs must be greater than zero");
    }
    if config.max_backoff < config.base_backoff {
        anyhow::bail!("transfer.max_backoff_ms cannot be smaller than transfer.base_backoff_ms");
    }
    Ok(config)
}

fn parse_target_config(raw: &JsonTargetConfig) -> Result<TargetConfig> {
    match raw {
        JsonTargetConfig::Postgres {
            name,
            database_url,
            container,
        } => {
            validate_name("target", name)?;
            let url = url::Url::parse(database_url)
                .with_context(|| format!("Invalid database_url for target '{}'", name))?;
            if !matches!(url.scheme(), "postgres" | "postgresql") {
                anyhow::bail!(
                    "database_url for target '{}' must use the postgres:// scheme",
                    name
                );
            }
            Ok(TargetConfig::Postgres(PostgresTargetConfig {
                name: name.clone(),
                database_url: database_url.clone(),
                container: container.clone().filter(|c| !c.trim().is_empty()),
            }))
        }
        JsonTargetConfig::Redis {
            name,
            container,
            data_path,
            password,
        } => {
            validate_name("target", name)?;
            if container.trim().is_empty() {
                anyhow::bail!("container must be set for redis target '{}'", name);
            }
            Ok(TargetConfig::Redis(RedisTargetConfig {
                name: name.clone(),
                container: container.clone(),
                data_path: data_path
                    .clone()
                    .filter(|p| !p.trim().is_empty())
                    .unwrap_or_else(|| "/data/dump.rdb".to_string()),
                password: password.clone().filter(|p| !p.is_empty()),
            }))
        }
    }
}
