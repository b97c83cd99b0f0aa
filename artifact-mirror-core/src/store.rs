//! SQLite-backed [`MetadataStore`].
//!
//! Single WAL-mode SQLite file holding the build and artifact index. The sync
//! engine is the only writer; each unit is committed in one transaction, so a
//! reader never sees a build row whose artifact rows are missing.
//!
//! Besides the cursor reads the engine needs, the store exposes the read-path
//! projections used to serve download links (builds newest first, artifacts
//! by run id, commit hash or tag).

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions, SqliteRow};
use sqlx::{Row, SqlitePool};
use std::collections::HashSet;
use std::path::Path;
use std::str::FromStr;
use std::time::Duration;
use tracing::{debug, info};

use crate::contract::MetadataStore;
use crate::error::{Error, Result};
use crate::model::{Artifact, ArtifactName, Build, BuiltinBuild, ReleaseBuild, StoredArtifact, Variant};

const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS builtin_build (
    run_id INTEGER PRIMARY KEY,
    commit_sha TEXT NOT NULL,
    description TEXT NOT NULL,
    created_at TEXT NOT NULL,
    artifact_count INTEGER NOT NULL,
    has_wow64 INTEGER NOT NULL
);

CREATE INDEX IF NOT EXISTS builtin_build_commit_idx ON builtin_build(commit_sha);

CREATE TABLE IF NOT EXISTS builtin_artifact (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    run_id INTEGER NOT NULL REFERENCES builtin_build(run_id),
    name TEXT NOT NULL,
    is_wow64 INTEGER NOT NULL,
    UNIQUE (run_id, is_wow64, name)
);

CREATE TABLE IF NOT EXISTS release_build (
    tag TEXT PRIMARY KEY,
    created_at TEXT NOT NULL,
    artifact_count INTEGER NOT NULL,
    has_wow64 INTEGER NOT NULL
);

CREATE TABLE IF NOT EXISTS release_artifact (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    tag TEXT NOT NULL REFERENCES release_build(tag),
    name TEXT NOT NULL,
    is_wow64 INTEGER NOT NULL,
    UNIQUE (tag, is_wow64, name)
);
"#;

#[derive(Clone)]
pub struct SqliteStore {
    pool: SqlitePool,
}

impl SqliteStore {
    /// Open (or create) the index at `path` and bootstrap the schema.
    pub async fn new(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                tokio::fs::create_dir_all(parent).await?;
            }
        }
        Self::connect(&format!("sqlite://{}?mode=rwc", path.display()), 5).await
    }

    /// Open from a `sqlite:` URL, e.g. `sqlite://./mirror.db`.
    pub async fn from_url(url: &str) -> Result<Self> {
        Self::connect(url, 5).await
    }

    /// A private in-memory index. One connection, kept alive for the store's lifetime.
    pub async fn in_memory() -> Result<Self> {
        Self::connect("sqlite::memory:", 1).await
    }

    async fn connect(url: &str, max_connections: u32) -> Result<Self> {
        let opts = SqliteConnectOptions::from_str(url)
            .map_err(|e| Error::store(format!("parsing database url {url}"), e))?
            .create_if_missing(true)
            .journal_mode(sqlx::sqlite::SqliteJournalMode::Wal)
            .foreign_keys(true)
            .busy_timeout(Duration::from_secs(5));

        let pool = SqlitePoolOptions::new()
            .max_connections(max_connections)
            .min_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .connect_with(opts)
            .await
            .map_err(|e| Error::store("connecting to sqlite", e))?;

        sqlx::query(SCHEMA)
            .execute(&pool)
            .await
            .map_err(|e| Error::store("schema bootstrap", e))?;

        info!(url = %url, "[STORE] Metadata store ready");
        Ok(Self { pool })
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    /// Builds of both kinds, newest first. `page` is 1-based.
    pub async fn list_builds(&self, page: u32, page_size: u32) -> Result<Vec<Build>> {
        let offset = i64::from(page.max(1) - 1) * i64::from(page_size);
        let rows = sqlx::query(
            r#"
            SELECT 'builtin' AS kind, run_id, NULL AS tag, commit_sha, description,
                   created_at, artifact_count, has_wow64
            FROM builtin_build
            UNION ALL
            SELECT 'release' AS kind, NULL AS run_id, tag, NULL AS commit_sha, NULL AS description,
                   created_at, artifact_count, has_wow64
            FROM release_build
            ORDER BY created_at DESC
            LIMIT ? OFFSET ?
            "#,
        )
        .bind(i64::from(page_size))
        .bind(offset)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| Error::store("listing builds", e))?;

        rows.iter().map(build_from_row).collect()
    }

    pub async fn builtin_build(&self, run_id: i64) -> Result<Option<BuiltinBuild>> {
        let row = sqlx::query(
            "SELECT 'builtin' AS kind, run_id, NULL AS tag, commit_sha, description, created_at, \
             artifact_count, has_wow64 FROM builtin_build WHERE run_id = ?",
        )
        .bind(run_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| Error::store("loading builtin build", e))?;

        match row.as_ref().map(build_from_row).transpose()? {
            Some(Build::Builtin(build)) => Ok(Some(build)),
            _ => Ok(None),
        }
    }

    pub async fn release_build(&self, tag: &str) -> Result<Option<ReleaseBuild>> {
        let row = sqlx::query(
            "SELECT 'release' AS kind, NULL AS run_id, tag, NULL AS commit_sha, NULL AS description, \
             created_at, artifact_count, has_wow64 FROM release_build WHERE tag = ?",
        )
        .bind(tag)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| Error::store("loading release build", e))?;

        match row.as_ref().map(build_from_row).transpose()? {
            Some(Build::Release(build)) => Ok(Some(build)),
            _ => Ok(None),
        }
    }

    pub async fn builtin_artifacts(
        &self,
        run_id: i64,
        variant: Option<Variant>,
    ) -> Result<Vec<StoredArtifact>> {
        let compat = variant.map(Variant::is_compat);
        let rows = sqlx::query(
            "SELECT id, run_id, name, is_wow64 FROM builtin_artifact \
             WHERE run_id = ? AND (? IS NULL OR is_wow64 = ?) ORDER BY id",
        )
        .bind(run_id)
        .bind(compat)
        .bind(compat)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| Error::store("listing builtin artifacts", e))?;

        rows.iter()
            .map(|row| {
                Ok(StoredArtifact {
                    id: get(row, "id")?,
                    artifact: Artifact::Builtin {
                        run_id: get(row, "run_id")?,
                        name: ArtifactName::new(get::<String>(row, "name")?)?,
                        variant: Variant::from_compat_flag(get(row, "is_wow64")?),
                    },
                })
            })
            .collect()
    }

    /// Artifacts of the newest run built from `commit_sha`.
    pub async fn builtin_artifacts_by_commit(
        &self,
        commit_sha: &str,
        variant: Option<Variant>,
    ) -> Result<Vec<StoredArtifact>> {
        let run_id: Option<i64> = sqlx::query_scalar(
            "SELECT run_id FROM builtin_build WHERE commit_sha = ? ORDER BY run_id DESC LIMIT 1",
        )
        .bind(commit_sha)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| Error::store("resolving commit", e))?;

        match run_id {
            Some(run_id) => self.builtin_artifacts(run_id, variant).await,
            None => Ok(Vec::new()),
        }
    }

    pub async fn release_artifacts(
        &self,
        tag: &str,
        variant: Option<Variant>,
    ) -> Result<Vec<StoredArtifact>> {
        let compat = variant.map(Variant::is_compat);
        let rows = sqlx::query(
            "SELECT id, tag, name, is_wow64 FROM release_artifact \
             WHERE tag = ? AND (? IS NULL OR is_wow64 = ?) ORDER BY id",
        )
        .bind(tag)
        .bind(compat)
        .bind(compat)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| Error::store("listing release artifacts", e))?;

        rows.iter()
            .map(|row| {
                Ok(StoredArtifact {
                    id: get(row, "id")?,
                    artifact: Artifact::Release {
                        tag: get(row, "tag")?,
                        name: ArtifactName::new(get::<String>(row, "name")?)?,
                        variant: Variant::from_compat_flag(get(row, "is_wow64")?),
                    },
                })
            })
            .collect()
    }
}

fn get<'r, T>(row: &'r SqliteRow, column: &str) -> Result<T>
where
    T: sqlx::Decode<'r, sqlx::Sqlite> + sqlx::Type<sqlx::Sqlite>,
{
    row.try_get(column)
        .map_err(|e| Error::store(format!("decoding column {column}"), e))
}

fn build_from_row(row: &SqliteRow) -> Result<Build> {
    let kind: String = get(row, "kind")?;
    let created_at: DateTime<Utc> = get(row, "created_at")?;
    let artifact_count: i64 = get(row, "artifact_count")?;
    let has_wow64: bool = get(row, "has_wow64")?;
    match kind.as_str() {
        "builtin" => Ok(Build::Builtin(BuiltinBuild {
            run_id: get(row, "run_id")?,
            commit_sha: get(row, "commit_sha")?,
            description: get(row, "description")?,
            created_at,
            artifact_count,
            has_wow64,
        })),
        "release" => Ok(Build::Release(ReleaseBuild {
            tag: get(row, "tag")?,
            created_at,
            artifact_count,
            has_wow64,
        })),
        other => Err(Error::Invariant(format!("unknown build kind {other:?}"))),
    }
}

/// Reject a batch that would break the build/artifact invariants before any
/// transaction is opened.
fn validate_batch(build: &Build, artifacts: &[Artifact]) -> Result<()> {
    let owner = build.owner();
    if build.artifact_count() != artifacts.len() as i64 {
        return Err(Error::Invariant(format!(
            "{owner} declares {} artifacts but {} were supplied",
            build.artifact_count(),
            artifacts.len()
        )));
    }

    let mut seen = HashSet::new();
    for artifact in artifacts {
        if artifact.owner() != owner {
            return Err(Error::Invariant(format!(
                "artifact {} belongs to {}, not {owner}",
                artifact.name(),
                artifact.owner()
            )));
        }
        if !seen.insert((artifact.variant(), artifact.name())) {
            return Err(Error::Invariant(format!(
                "duplicate artifact {} ({:?}) in {owner}",
                artifact.name(),
                artifact.variant()
            )));
        }
    }
    Ok(())
}

#[async_trait]
impl MetadataStore for SqliteStore {
    async fn max_run_id(&self) -> Result<i64> {
        let max: Option<i64> = sqlx::query_scalar("SELECT MAX(run_id) FROM builtin_build")
            .fetch_one(&self.pool)
            .await
            .map_err(|e| Error::store("reading run cursor", e))?;
        Ok(max.unwrap_or(0))
    }

    async fn tag_exists(&self, tag: &str) -> Result<bool> {
        let found: Option<i64> = sqlx::query_scalar("SELECT 1 FROM release_build WHERE tag = ?")
            .bind(tag)
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| Error::store("looking up release tag", e))?;
        Ok(found.is_some())
    }

    async fn insert_build_with_artifacts(&self, build: &Build, artifacts: &[Artifact]) -> Result<()> {
        validate_batch(build, artifacts)?;

        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| Error::store("opening transaction", e))?;

        match build {
            Build::Builtin(b) => {
                sqlx::query(
                    "INSERT INTO builtin_build \
                     (run_id, commit_sha, description, created_at, artifact_count, has_wow64) \
                     VALUES (?, ?, ?, ?, ?, ?)",
                )
                .bind(b.run_id)
                .bind(&b.commit_sha)
                .bind(&b.description)
                .bind(b.created_at)
                .bind(b.artifact_count)
                .bind(b.has_wow64)
                .execute(&mut *tx)
                .await
                .map_err(|e| Error::store(format!("inserting builtin build {}", b.run_id), e))?;
            }
            Build::Release(b) => {
                sqlx::query(
                    "INSERT INTO release_build (tag, created_at, artifact_count, has_wow64) \
                     VALUES (?, ?, ?, ?)",
                )
                .bind(&b.tag)
                .bind(b.created_at)
                .bind(b.artifact_count)
                .bind(b.has_wow64)
                .execute(&mut *tx)
                .await
                .map_err(|e| Error::store(format!("inserting release build {}", b.tag), e))?;
            }
        }

        for artifact in artifacts {
            let query = match artifact {
                Artifact::Builtin { run_id, name, variant } => sqlx::query(
                    "INSERT INTO builtin_artifact (run_id, name, is_wow64) VALUES (?, ?, ?)",
                )
                .bind(*run_id)
                .bind(name.as_str())
                .bind(variant.is_compat()),
                Artifact::Release { tag, name, variant } => sqlx::query(
                    "INSERT INTO release_artifact (tag, name, is_wow64) VALUES (?, ?, ?)",
                )
                .bind(tag.as_str())
                .bind(name.as_str())
                .bind(variant.is_compat()),
            };
            query
                .execute(&mut *tx)
                .await
                .map_err(|e| Error::store(format!("inserting artifact {}", artifact.name()), e))?;
        }

        tx.commit()
            .await
            .map_err(|e| Error::store("committing unit", e))?;

        debug!(owner = %build.owner(), count = artifacts.len(), "[STORE] Committed build");
        Ok(())
    }
}
