use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::{debug, info};

pub const DEFAULT_PAGE_SIZE: u32 = 30;
/// Largest `per_page` the provider honours; bigger requests are silently capped.
pub const MAX_PAGE_SIZE: u32 = 100;
pub const DEFAULT_INTERVAL: Duration = Duration::from_secs(60);
pub const DEFAULT_RETENTION_DAYS: i64 = 100;
pub const DEFAULT_PREFIX: &str = "dxmt-artifacts";

/// Everything the sync engine needs to know about what to mirror and where.
/// Built once at startup and owned by the [`crate::synchronise::Synchroniser`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncConfig {
    pub owner: String,
    pub repo: String,
    pub bucket: String,
    #[serde(default = "default_prefix")]
    pub prefix: String,
    #[serde(default = "default_page_size")]
    pub page_size: u32,
    #[serde(default = "default_interval", with = "duration_secs")]
    pub interval: Duration,
    #[serde(default = "default_retention_days")]
    pub retention_days: i64,
    #[serde(default)]
    pub rules: FilterRules,
}

impl SyncConfig {
    pub fn new(owner: impl Into<String>, repo: impl Into<String>, bucket: impl Into<String>) -> Self {
        Self {
            owner: owner.into(),
            repo: repo.into(),
            bucket: bucket.into(),
            prefix: default_prefix(),
            page_size: DEFAULT_PAGE_SIZE,
            interval: DEFAULT_INTERVAL,
            retention_days: DEFAULT_RETENTION_DAYS,
            rules: FilterRules::default(),
        }
    }

    /// Page size actually requested from the provider.
    pub fn effective_page_size(&self) -> u32 {
        self.page_size.clamp(1, MAX_PAGE_SIZE)
    }

    pub fn trace_loaded(&self) {
        info!(
            owner = %self.owner,
            repo = %self.repo,
            bucket = %self.bucket,
            prefix = %self.prefix,
            interval_secs = self.interval.as_secs(),
            retention_days = self.retention_days,
            "Loaded SyncConfig"
        );
        debug!(?self, "SyncConfig loaded (full debug)");
    }
}

/// Naming conventions the filters rely on.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct FilterRules {
    /// Runs whose workflow path contains this are native builds and never mirrored.
    pub native_path_marker: String,
    /// Artifacts built with a non-default toolchain.
    pub excluded_toolchain_marker: String,
    /// Only artifacts carrying this marker are release-configuration builds.
    pub required_config_marker: String,
    /// Artifacts (and release directories) of the 32-bit compatibility variant.
    pub compat_marker: String,
    pub default_extensions: Vec<String>,
    pub compat_extensions: Vec<String>,
    pub secondary_archive_suffix: String,
    pub release_dirs: Vec<ReleaseDir>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReleaseDir {
    pub name: String,
    #[serde(default)]
    pub compat: bool,
}

impl Default for FilterRules {
    fn default() -> Self {
        Self {
            native_path_marker: "native".into(),
            excluded_toolchain_marker: "-gcc".into(),
            required_config_marker: "release".into(),
            compat_marker: "wow64".into(),
            default_extensions: vec!["dll".into(), "so".into()],
            compat_extensions: vec!["dll".into()],
            secondary_archive_suffix: ".tar.gz".into(),
            release_dirs: vec![
                ReleaseDir {
                    name: "i386-windows".into(),
                    compat: true,
                },
                ReleaseDir {
                    name: "x86_64-windows".into(),
                    compat: false,
                },
                ReleaseDir {
                    name: "x86_64-unix".into(),
                    compat: false,
                },
            ],
        }
    }
}

fn default_prefix() -> String {
    DEFAULT_PREFIX.to_string()
}

fn default_page_size() -> u32 {
    DEFAULT_PAGE_SIZE
}

fn default_interval() -> Duration {
    DEFAULT_INTERVAL
}

fn default_retention_days() -> i64 {
    DEFAULT_RETENTION_DAYS
}

mod duration_secs {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(value.as_secs())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        u64::deserialize(deserializer).map(Duration::from_secs)
    }
}
