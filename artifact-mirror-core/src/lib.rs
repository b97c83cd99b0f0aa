#![doc = "artifact-mirror-core: core logic library for artifact-mirror."]

//! Data model, collaborator traits, and the sync engine that mirrors CI run
//! artifacts and tagged releases into object storage with a SQLite index.
//!
//! # Usage
//! Build a [`synchronise::Synchroniser`] from a [`config::SyncConfig`], a
//! [`contract::Downloader`], a [`contract::Uploader`] and a
//! [`contract::MetadataStore`], then drive it with `run` or `run_cycle`.

pub mod config;
pub mod contract;
pub mod download;
pub mod error;
pub mod model;
pub mod preprocess;
pub mod store;
pub mod synchronise;
pub mod uploader;
