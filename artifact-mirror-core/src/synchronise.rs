//! High-level pipeline: keeps the mirror in step with the CI provider.
//!
//! Each cycle runs two independent, strictly sequential pipelines:
//!   - builtin builds: successful CI runs newer than the highest recorded run id
//!     and younger than the retention window
//!   - releases: published (non-draft, non-prerelease) releases whose tag is not
//!     recorded yet
//!
//! Discovery pages newest first and stops at the first unit that is already
//! recorded; new units are then processed oldest first, so an interrupted
//! cycle resumes exactly after the last committed unit.
//!
//! A unit is downloaded, unpacked into a scratch directory, filtered, and every
//! retained file is uploaded. Only when all uploads of a unit have succeeded is
//! its build row written, together with its artifact rows, in one transaction.
//!
//! # Error Handling
//! - Provider, upload and store errors abort the cycle; the scheduler logs them
//!   and the next cycle resumes from the committed cursor.
//! - A release whose asset cannot be unpacked (or that has no asset) is recorded
//!   with zero artifacts so it is never retried.
//! - A run artifact that cannot be unpacked or holds no secondary archive is
//!   skipped.
//!
//! # Cancellation
//! The token is observed between units and during the inter-cycle sleep, never
//! inside a unit.

use chrono::{TimeDelta, Utc};
use futures::FutureExt;
use std::collections::HashSet;
use std::panic::AssertUnwindSafe;
use std::path::Path;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::config::SyncConfig;
use crate::contract::{Downloader, MetadataStore, Release, Uploader, WorkflowRun};
use crate::error::{Error, Result};
use crate::model::{object_key, Artifact, ArtifactName, Build, BuildRef, BuiltinBuild, ReleaseBuild, Variant};
use crate::preprocess::{accept_run_artifact, is_native_run, unpack_release_asset, unpack_run_artifact};

/// Outcome of one unit (a run or a release).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnitReport {
    pub unit: BuildRef,
    /// Object keys uploaded for this unit, in upload order.
    pub keys: Vec<String>,
    /// Whether a build row was written. Runs without retained files are not recorded.
    pub committed: bool,
}

#[derive(Debug, Default)]
pub struct SynchroniseReport {
    pub builtin: Vec<UnitReport>,
    pub releases: Vec<UnitReport>,
    /// The cycle stopped early at a unit boundary.
    pub cancelled: bool,
}

impl SynchroniseReport {
    pub fn committed_runs(&self) -> Vec<i64> {
        self.builtin
            .iter()
            .filter(|u| u.committed)
            .filter_map(|u| match &u.unit {
                BuildRef::Run(id) => Some(*id),
                BuildRef::Tag(_) => None,
            })
            .collect()
    }

    pub fn committed_tags(&self) -> Vec<String> {
        self.releases
            .iter()
            .filter(|u| u.committed)
            .filter_map(|u| match &u.unit {
                BuildRef::Tag(tag) => Some(tag.clone()),
                BuildRef::Run(_) => None,
            })
            .collect()
    }
}

/// The sync engine. Owns its configuration and collaborators; construct once
/// and drive with [`Synchroniser::run`] or [`Synchroniser::run_cycle`].
pub struct Synchroniser<D, U, S> {
    config: SyncConfig,
    downloader: D,
    uploader: U,
    store: S,
}

/// Files of one unit that have been uploaded so far.
#[derive(Default)]
struct UnitUploads {
    artifacts: Vec<Artifact>,
    keys: Vec<String>,
    seen: HashSet<(Variant, ArtifactName)>,
}

impl UnitUploads {
    fn has_compat(&self) -> bool {
        self.artifacts.iter().any(|a| a.variant().is_compat())
    }
}

impl<D, U, S> Synchroniser<D, U, S>
where
    D: Downloader,
    U: Uploader,
    S: MetadataStore,
{
    pub fn new(config: SyncConfig, downloader: D, uploader: U, store: S) -> Self {
        Self {
            config,
            downloader,
            uploader,
            store,
        }
    }

    pub fn config(&self) -> &SyncConfig {
        &self.config
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    /// Run cycles until `cancel` fires. A failing (or panicking) cycle is
    /// logged and the next one starts after the configured interval.
    pub async fn run(&self, cancel: CancellationToken) {
        info!(
            interval_secs = self.config.interval.as_secs(),
            "[SYNC] Scheduler started"
        );
        loop {
            if cancel.is_cancelled() {
                break;
            }

            match AssertUnwindSafe(self.run_cycle(&cancel)).catch_unwind().await {
                Ok(Ok(report)) => info!(
                    runs = ?report.committed_runs(),
                    tags = ?report.committed_tags(),
                    cancelled = report.cancelled,
                    "[SYNC] Sync cycle completed"
                ),
                Ok(Err(e)) => error!(error = %e, "[SYNC][ERROR] Sync cycle failed"),
                Err(_) => error!("[SYNC][ERROR] Sync cycle panicked"),
            }

            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = tokio::time::sleep(self.config.interval) => {}
            }
        }
        info!("[SYNC] Scheduler stopped");
    }

    /// One full cycle: builtin builds, then releases.
    pub async fn run_cycle(&self, cancel: &CancellationToken) -> Result<SynchroniseReport> {
        info!("[SYNC] Starting sync cycle");
        let mut report = SynchroniseReport::default();

        self.sync_builtin_builds(cancel, &mut report).await?;
        if !report.cancelled {
            self.sync_releases(cancel, &mut report).await?;
        }

        Ok(report)
    }

    pub async fn sync_builtin_builds(
        &self,
        cancel: &CancellationToken,
        report: &mut SynchroniseReport,
    ) -> Result<()> {
        let cursor = self.store.max_run_id().await?;
        info!(cursor, "[SYNC][BUILTIN] Syncing builtin builds");

        let runs = self.discover_runs(cursor).await?;
        info!(count = runs.len(), "[SYNC][BUILTIN] Discovered new runs");

        for run in runs.iter().rev() {
            if cancel.is_cancelled() {
                info!(run_id = run.id, "[SYNC][BUILTIN] Cancelled before unit");
                report.cancelled = true;
                return Ok(());
            }
            report.builtin.push(self.process_run(run).await?);
        }
        Ok(())
    }

    pub async fn sync_releases(
        &self,
        cancel: &CancellationToken,
        report: &mut SynchroniseReport,
    ) -> Result<()> {
        info!("[SYNC][RELEASE] Syncing releases");

        let releases = self.discover_releases().await?;
        info!(count = releases.len(), "[SYNC][RELEASE] Discovered new releases");

        for release in releases.iter().rev() {
            if cancel.is_cancelled() {
                info!(tag = %release.tag_name, "[SYNC][RELEASE] Cancelled before unit");
                report.cancelled = true;
                return Ok(());
            }
            report.releases.push(self.process_release(release).await?);
        }
        Ok(())
    }

    /// New runs, newest first.
    async fn discover_runs(&self, cursor: i64) -> Result<Vec<WorkflowRun>> {
        let cutoff = Utc::now() - TimeDelta::days(self.config.retention_days);
        let rules = &self.config.rules;
        let page_size = self.config.effective_page_size() as usize;

        let mut found = Vec::new();
        let mut seen = HashSet::new();
        let mut page = 1;
        'pages: loop {
            let runs = self.downloader.list_runs(page).await?;
            let page_len = runs.len();

            for run in runs {
                if run.id <= cursor {
                    debug!(run_id = run.id, cursor, "[SYNC][BUILTIN] Reached recorded run");
                    break 'pages;
                }
                if run.created_at < cutoff {
                    debug!(run_id = run.id, created_at = %run.created_at, "[SYNC][BUILTIN] Reached retention cutoff");
                    break 'pages;
                }
                if !run.is_successful() || is_native_run(&run, rules) {
                    debug!(run_id = run.id, path = %run.path, "[SYNC][BUILTIN] Skipping run");
                    continue;
                }
                if seen.insert(run.id) {
                    found.push(run);
                }
            }

            if page_len < page_size {
                break;
            }
            page += 1;
        }
        Ok(found)
    }

    /// New published releases, newest first.
    async fn discover_releases(&self) -> Result<Vec<Release>> {
        let page_size = self.config.effective_page_size() as usize;

        let mut found = Vec::new();
        let mut seen = HashSet::new();
        let mut page = 1;
        'pages: loop {
            let releases = self.downloader.list_releases(page).await?;
            let page_len = releases.len();

            for release in releases {
                if self.store.tag_exists(&release.tag_name).await? {
                    debug!(tag = %release.tag_name, "[SYNC][RELEASE] Reached recorded release");
                    break 'pages;
                }
                if release.draft || release.prerelease {
                    debug!(tag = %release.tag_name, "[SYNC][RELEASE] Skipping draft/prerelease");
                    continue;
                }
                if seen.insert(release.tag_name.clone()) {
                    found.push(release);
                }
            }

            if page_len < page_size {
                break;
            }
            page += 1;
        }
        Ok(found)
    }

    async fn process_run(&self, run: &WorkflowRun) -> Result<UnitReport> {
        info!(run_id = run.id, "[SYNC][BUILTIN] Processing run");
        let unit = BuildRef::Run(run.id);

        let listed = self.downloader.list_run_artifacts(run.id).await?;
        let workdir = tempfile::tempdir()?;
        let mut uploads = UnitUploads::default();

        for artifact in &listed {
            let Some(variant) = accept_run_artifact(artifact, &self.config.rules) else {
                debug!(run_id = run.id, artifact = %artifact.name, "[SYNC][BUILTIN] Artifact filtered out");
                continue;
            };

            info!(run_id = run.id, artifact = %artifact.name, "[SYNC][BUILTIN] Downloading artifact");
            let blob = self.downloader.download_run_artifact(run.id, artifact.id).await?;

            let dir = workdir.path().join(format!("artifact-{}", artifact.id));
            let rules = self.config.rules.clone();
            let unpacked =
                tokio::task::spawn_blocking(move || unpack_run_artifact(&blob, &dir, variant, &rules))
                    .await
                    .map_err(|e| Error::Archive(format!("extraction task failed: {e}")))?;

            let files = match unpacked {
                Ok(Some(files)) => files,
                Ok(None) => continue,
                Err(Error::Archive(msg)) => {
                    warn!(run_id = run.id, artifact = %artifact.name, error = %msg, "[SYNC][BUILTIN] Skipping unreadable artifact");
                    continue;
                }
                Err(e) => return Err(e),
            };

            for file in files {
                let Some(name) = file_name(&file) else { continue };
                let record = Artifact::Builtin {
                    run_id: run.id,
                    name,
                    variant,
                };
                self.upload_once(&file, record, &mut uploads).await?;
            }
        }
        workdir.close()?;

        if uploads.artifacts.is_empty() {
            info!(run_id = run.id, "[SYNC][BUILTIN] Run has no relevant artifacts, not recording");
            return Ok(UnitReport {
                unit,
                keys: Vec::new(),
                committed: false,
            });
        }

        let build = Build::Builtin(BuiltinBuild {
            run_id: run.id,
            commit_sha: run.head_sha.clone(),
            description: run.display_title.clone(),
            created_at: run.created_at,
            artifact_count: uploads.artifacts.len() as i64,
            has_wow64: uploads.has_compat(),
        });
        self.store
            .insert_build_with_artifacts(&build, &uploads.artifacts)
            .await?;
        info!(run_id = run.id, count = uploads.artifacts.len(), "[SYNC][BUILTIN] Saved run");

        Ok(UnitReport {
            unit,
            keys: uploads.keys,
            committed: true,
        })
    }

    async fn process_release(&self, release: &Release) -> Result<UnitReport> {
        info!(tag = %release.tag_name, "[SYNC][RELEASE] Processing release");

        let Some(asset) = release.assets.first() else {
            info!(tag = %release.tag_name, "[SYNC][RELEASE] Release has no assets, recording empty build");
            return self.save_release(release, UnitUploads::default(), false).await;
        };

        info!(tag = %release.tag_name, asset = %asset.name, "[SYNC][RELEASE] Downloading asset");
        let blob = self
            .downloader
            .download_release_asset(release.id, asset.id)
            .await?;

        let workdir = tempfile::tempdir()?;
        let dir = workdir.path().to_path_buf();
        let rules = self.config.rules.clone();
        let unpacked = tokio::task::spawn_blocking(move || unpack_release_asset(&blob, &dir, &rules))
            .await
            .map_err(|e| Error::Archive(format!("extraction task failed: {e}")))?;

        let (files, has_compat) = match unpacked {
            Ok(found) => found,
            Err(Error::Archive(msg)) => {
                error!(tag = %release.tag_name, asset = %asset.name, error = %msg, "[SYNC][RELEASE] Failed to extract release asset");
                workdir.close()?;
                return self.save_release(release, UnitUploads::default(), false).await;
            }
            Err(e) => return Err(e),
        };

        let mut uploads = UnitUploads::default();
        for (file, variant) in files {
            let Some(name) = file_name(&file) else { continue };
            let record = Artifact::Release {
                tag: release.tag_name.clone(),
                name,
                variant,
            };
            self.upload_once(&file, record, &mut uploads).await?;
        }
        workdir.close()?;

        self.save_release(release, uploads, has_compat).await
    }

    async fn save_release(
        &self,
        release: &Release,
        uploads: UnitUploads,
        has_wow64: bool,
    ) -> Result<UnitReport> {
        let build = Build::Release(ReleaseBuild {
            tag: release.tag_name.clone(),
            created_at: release.created_at,
            artifact_count: uploads.artifacts.len() as i64,
            has_wow64,
        });
        self.store
            .insert_build_with_artifacts(&build, &uploads.artifacts)
            .await?;
        info!(tag = %release.tag_name, count = uploads.artifacts.len(), "[SYNC][RELEASE] Saved release");

        Ok(UnitReport {
            unit: BuildRef::Tag(release.tag_name.clone()),
            keys: uploads.keys,
            committed: true,
        })
    }

    /// Upload `path` under the artifact's key unless a file with the same
    /// variant and name was already uploaded for this unit.
    async fn upload_once(&self, path: &Path, artifact: Artifact, uploads: &mut UnitUploads) -> Result<()> {
        if !uploads.seen.insert((artifact.variant(), artifact.name().clone())) {
            warn!(
                owner = %artifact.owner(),
                name = %artifact.name(),
                path = %path.display(),
                "[SYNC] Duplicate file name within unit, keeping the first"
            );
            return Ok(());
        }

        let key = object_key(&self.config.prefix, &artifact);
        self.uploader.upload(path, &key).await?;
        debug!(key = %key, "[SYNC] Uploaded artifact");

        uploads.keys.push(key);
        uploads.artifacts.push(artifact);
        Ok(())
    }
}

fn file_name(path: &Path) -> Option<ArtifactName> {
    let raw = path.file_name().and_then(|n| n.to_str());
    match raw.map(ArtifactName::new) {
        Some(Ok(name)) => Some(name),
        _ => {
            warn!(path = %path.display(), "[SYNC] Skipping file without a usable name");
            None
        }
    }
}
