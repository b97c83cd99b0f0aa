/// `load_config` module: loads the static YAML config and injects secrets from the environment.
///
/// This is the only place where user-supplied YAML is parsed and mapped onto the
/// core's strongly-typed configuration ([`SyncConfig`], [`GitHubConfig`], [`S3Config`]).
///
/// # Responsibilities
/// - Parse the YAML file into the `github`, `storage`, `database` and `sync` sections
/// - Read `GITHUB_TOKEN` from the environment; secrets never live in YAML
/// - Fail with a clear diagnostic on unreadable files, bad YAML or a missing token
///
/// S3 credentials are not handled here: the uploader resolves them through the
/// AWS default provider chain.
///
/// # Errors
/// All errors use `anyhow::Error` and surface at the CLI boundary.
use anyhow::{bail, Context, Result};
use artifact_mirror_core::config::{
    FilterRules, SyncConfig, DEFAULT_INTERVAL, DEFAULT_PAGE_SIZE, DEFAULT_PREFIX,
    DEFAULT_RETENTION_DAYS, MAX_PAGE_SIZE,
};
use artifact_mirror_core::download::{GitHubConfig, DEFAULT_API_URL};
use artifact_mirror_core::uploader::S3Config;
use serde::Deserialize;
use std::fs;
use std::path::Path;
use std::time::Duration;
use tracing::{error, info};

pub const GITHUB_TOKEN_ENV: &str = "GITHUB_TOKEN";
pub const DEFAULT_DATABASE_URL: &str = "sqlite://artifact-mirror.db";

#[derive(Debug, Deserialize)]
pub struct GitHubSection {
    pub owner: String,
    pub repo: String,
    #[serde(default = "default_api_url")]
    pub api_url: String,
}

#[derive(Debug, Deserialize)]
pub struct StorageSection {
    pub bucket: String,
    #[serde(default = "default_prefix")]
    pub prefix: String,
    #[serde(default)]
    pub endpoint_url: Option<String>,
    #[serde(default)]
    pub region: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct DatabaseSection {
    #[serde(default = "default_database_url")]
    pub url: String,
}

impl Default for DatabaseSection {
    fn default() -> Self {
        Self {
            url: default_database_url(),
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct SyncSection {
    #[serde(default = "default_interval_secs")]
    pub interval_secs: u64,
    #[serde(default = "default_retention_days")]
    pub retention_days: i64,
    #[serde(default = "default_page_size")]
    pub page_size: u32,
    #[serde(default)]
    pub rules: Option<FilterRules>,
}

impl Default for SyncSection {
    fn default() -> Self {
        Self {
            interval_secs: default_interval_secs(),
            retention_days: default_retention_days(),
            page_size: default_page_size(),
            rules: None,
        }
    }
}

#[derive(Debug, Deserialize)]
struct RawConfig {
    github: GitHubSection,
    storage: StorageSection,
    #[serde(default)]
    database: DatabaseSection,
    #[serde(default)]
    sync: SyncSection,
}

/// Fully resolved configuration, secrets included.
#[derive(Debug)]
pub struct CliConfig {
    pub sync: SyncConfig,
    pub github: GitHubConfig,
    pub storage: S3Config,
    pub database_url: String,
}

pub fn load_config<P: AsRef<Path>>(path: P) -> Result<CliConfig> {
    let path_ref = path.as_ref();
    info!(config_path = ?path_ref, "Loading configuration from file");

    let content = fs::read_to_string(path_ref).map_err(|e| {
        error!(error = ?e, config_path = ?path_ref, "Failed to read config file");
        anyhow::anyhow!("Failed to read config file {:?}: {}", path_ref, e)
    })?;

    let raw: RawConfig = serde_yaml::from_str(&content).map_err(|e| {
        error!(error = ?e, config_path = ?path_ref, "Failed to parse config YAML");
        anyhow::anyhow!("Failed to parse config YAML: {e}")
    })?;

    if raw.sync.page_size == 0 || raw.sync.page_size > MAX_PAGE_SIZE {
        bail!("sync.page_size must be between 1 and {MAX_PAGE_SIZE}");
    }
    if raw.sync.interval_secs == 0 {
        bail!("sync.interval_secs must be greater than zero");
    }
    if raw.sync.retention_days <= 0 {
        bail!("sync.retention_days must be greater than zero");
    }

    let token = std::env::var(GITHUB_TOKEN_ENV)
        .ok()
        .filter(|t| !t.trim().is_empty())
        .with_context(|| format!("{GITHUB_TOKEN_ENV} must be set in the environment"))?;

    let mut sync = SyncConfig::new(
        raw.github.owner.clone(),
        raw.github.repo.clone(),
        raw.storage.bucket.clone(),
    );
    sync.prefix = raw.storage.prefix.clone();
    sync.page_size = raw.sync.page_size;
    sync.interval = Duration::from_secs(raw.sync.interval_secs);
    sync.retention_days = raw.sync.retention_days;
    if let Some(rules) = raw.sync.rules {
        sync.rules = rules;
    }
    sync.trace_loaded();

    info!(config_path = ?path_ref, "Parsed config YAML successfully");
    Ok(CliConfig {
        github: GitHubConfig {
            api_url: raw.github.api_url,
            token,
            owner: raw.github.owner,
            repo: raw.github.repo,
            page_size: sync.page_size,
        },
        storage: S3Config {
            bucket: raw.storage.bucket,
            endpoint_url: raw.storage.endpoint_url,
            region: raw.storage.region,
        },
        database_url: raw.database.url,
        sync,
    })
}

fn default_api_url() -> String {
    DEFAULT_API_URL.to_string()
}

fn default_prefix() -> String {
    DEFAULT_PREFIX.to_string()
}

fn default_database_url() -> String {
    DEFAULT_DATABASE_URL.to_string()
}

fn default_interval_secs() -> u64 {
    DEFAULT_INTERVAL.as_secs()
}

fn default_retention_days() -> i64 {
    DEFAULT_RETENTION_DAYS
}

fn default_page_size() -> u32 {
    DEFAULT_PAGE_SIZE
}
