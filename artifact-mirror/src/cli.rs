///
/// This module implements the CLI interface for artifact-mirror: command parsing,
/// process wiring and graceful shutdown.
///
/// All core logic (data model, pipelines, storage) lives in [`artifact-mirror-core`].
/// This module only loads configuration, builds the collaborators and drives the
/// sync engine.
///
/// ## How To Use
/// - Command line: `artifact-mirror sync --config mirror.yaml [--once]`.
/// - Programmatic/integration use: call [`run`] with a constructed [`Cli`].
///
/// Ctrl-C cancels the engine; it stops at the next unit boundary and the
/// process exits once it has.
///
/// [`artifact-mirror-core`]: ../../artifact-mirror-core/
use crate::load_config::load_config;
use anyhow::{Context, Result};
use artifact_mirror_core::download::GitHubDownloader;
use artifact_mirror_core::store::SqliteStore;
use artifact_mirror_core::synchronise::Synchroniser;
use artifact_mirror_core::uploader::S3Uploader;
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

/// CLI for artifact-mirror: keep CI artifacts and releases mirrored into object storage.
#[derive(Parser)]
#[clap(
    name = "artifact-mirror",
    version,
    about = "Mirror CI run artifacts and tagged releases into an S3 bucket with a SQLite index"
)]
pub struct Cli {
    #[clap(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Synchronise builds and releases into the bucket using the given config file
    Sync {
        /// Path to the YAML config file
        #[clap(long)]
        config: PathBuf,
        /// Run a single cycle and exit instead of polling
        #[clap(long)]
        once: bool,
    },
}

/// Async CLI entrypoint shared by `main` and integration tests.
pub async fn run(cli: Cli) -> Result<()> {
    tracing::info!("trace_initialised");

    match cli.command {
        Commands::Sync { config, once } => {
            let config = load_config(config)?;
            tracing::info!(command = "sync", once, "Starting synchronisation");

            let downloader = GitHubDownloader::new(config.github)
                .context("Failed to construct GitHub client")?;
            let uploader = S3Uploader::new(&config.storage)
                .await
                .context("Failed to construct S3 uploader")?;
            let store = SqliteStore::from_url(&config.database_url)
                .await
                .with_context(|| format!("Failed to open metadata store {}", config.database_url))?;

            let engine = Arc::new(Synchroniser::new(config.sync, downloader, uploader, store));
            let cancel = CancellationToken::new();
            spawn_ctrl_c_handler(cancel.clone());

            if once {
                let report = engine.run_cycle(&cancel).await.map_err(|e| {
                    tracing::error!(command = "sync", error = %e, "Synchronisation failed");
                    anyhow::Error::new(e)
                })?;
                tracing::info!(
                    command = "sync",
                    runs = ?report.committed_runs(),
                    tags = ?report.committed_tags(),
                    cancelled = report.cancelled,
                    "Synchronisation complete"
                );
                return Ok(());
            }

            let worker = tokio::spawn({
                let engine = engine.clone();
                let cancel = cancel.clone();
                async move { engine.run(cancel).await }
            });
            worker.await.context("Sync worker terminated abnormally")?;
            tracing::info!(command = "sync", "Synchronisation stopped");
            Ok(())
        }
    }
}

fn spawn_ctrl_c_handler(cancel: CancellationToken) {
    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => {
                tracing::info!("Received Ctrl-C, stopping after the current unit");
                cancel.cancel();
            }
            Err(e) => tracing::error!(error = %e, "Failed to listen for Ctrl-C"),
        }
    });
}
