//! # contract: collaborator interfaces of the sync engine
//!
//! The engine talks to three external systems, each behind a trait so tests
//! and alternative backends can be plugged in:
//!
//! - [`Downloader`]: the CI provider (runs, run artifacts, releases, assets).
//! - [`Uploader`]: the object store receiving the mirrored files.
//! - [`MetadataStore`]: the relational index of what has been mirrored.
//!
//! ## Mocking & Testing
//! - Every trait is annotated for `mockall`; enable the `test-export-mocks`
//!   feature (on by default) to use `MockDownloader`, `MockUploader` and
//!   `MockMetadataStore` from other crates.
//!
//! ## Error contract
//! - All methods return [`crate::error::Result`]. A provider error is
//!   cycle-fatal, an upload error aborts the current unit before its
//!   metadata is written.

use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::Path;

#[cfg(any(test, feature = "test-export-mocks"))]
use mockall::automock;

use crate::error::Result;
use crate::model::{Artifact, Build};

/// One execution of a CI workflow.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkflowRun {
    pub id: i64,
    #[serde(default)]
    pub name: Option<String>,
    /// Workflow file path, e.g. `.github/workflows/ci.yml`.
    pub path: String,
    pub head_sha: String,
    pub display_title: String,
    #[serde(default)]
    pub status: Option<String>,
    #[serde(default)]
    pub conclusion: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl WorkflowRun {
    /// A run whose conclusion is known and is anything but `success` is not mirrored.
    pub fn is_successful(&self) -> bool {
        self.conclusion.as_deref().map_or(true, |c| c == "success")
    }
}

/// An artifact archive attached to a run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunArtifact {
    pub id: i64,
    pub name: String,
    #[serde(default)]
    pub expired: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Release {
    pub id: i64,
    pub tag_name: String,
    #[serde(default)]
    pub draft: bool,
    #[serde(default)]
    pub prerelease: bool,
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub assets: Vec<ReleaseAsset>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReleaseAsset {
    pub id: i64,
    pub name: String,
}

/// Read access to the CI provider. Pages are 1-based and newest first.
#[cfg_attr(any(test, feature = "test-export-mocks"), automock)]
#[async_trait]
pub trait Downloader: Send + Sync {
    /// Successful runs on the given page.
    async fn list_runs(&self, page: u32) -> Result<Vec<WorkflowRun>>;

    async fn list_run_artifacts(&self, run_id: i64) -> Result<Vec<RunArtifact>>;

    /// Raw zip archive of a run artifact.
    async fn download_run_artifact(&self, run_id: i64, artifact_id: i64) -> Result<Bytes>;

    async fn list_releases(&self, page: u32) -> Result<Vec<Release>>;

    async fn download_release_asset(&self, release_id: i64, asset_id: i64) -> Result<Bytes>;
}

/// Write access to the object store.
#[cfg_attr(any(test, feature = "test-export-mocks"), automock)]
#[async_trait]
pub trait Uploader: Send + Sync {
    /// Upload the file at `local_path` under `key`, overwriting any existing object.
    async fn upload(&self, local_path: &Path, key: &str) -> Result<()>;
}

/// Cursor reads and unit writes against the metadata index.
#[cfg_attr(any(test, feature = "test-export-mocks"), automock)]
#[async_trait]
pub trait MetadataStore: Send + Sync {
    /// Highest recorded run id, 0 when nothing is recorded yet.
    async fn max_run_id(&self) -> Result<i64>;

    async fn tag_exists(&self, tag: &str) -> Result<bool>;

    /// Persist a build and all of its artifacts in a single transaction.
    async fn insert_build_with_artifacts(&self, build: &Build, artifacts: &[Artifact]) -> Result<()>;
}
