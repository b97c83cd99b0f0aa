#![allow(dead_code)]

use artifact_mirror_core::config::SyncConfig;
use artifact_mirror_core::contract::{
    MockDownloader, MockUploader, Release, ReleaseAsset, RunArtifact, WorkflowRun,
};
use artifact_mirror_core::error::Error;
use bytes::Bytes;
use chrono::{TimeDelta, Utc};
use std::io::{Cursor, Write};
use std::sync::{Arc, Mutex};

pub const PREFIX: &str = "mirror";

pub fn config() -> SyncConfig {
    let mut config = SyncConfig::new("3Shain", "dxmt", "test-bucket");
    config.prefix = PREFIX.to_string();
    config
}

pub fn run(id: i64, days_old: i64) -> WorkflowRun {
    WorkflowRun {
        id,
        name: Some("CI".into()),
        path: ".github/workflows/ci.yml".into(),
        head_sha: format!("sha{id}"),
        display_title: format!("Commit for run {id}"),
        status: Some("completed".into()),
        conclusion: Some("success".into()),
        created_at: Utc::now() - TimeDelta::days(days_old),
    }
}

pub fn native_run(id: i64) -> WorkflowRun {
    WorkflowRun {
        path: ".github/workflows/native.yml".into(),
        ..run(id, 1)
    }
}

pub fn run_artifact(id: i64, name: &str) -> RunArtifact {
    RunArtifact {
        id,
        name: name.into(),
        expired: false,
    }
}

pub fn release(id: i64, tag: &str, asset_ids: &[i64]) -> Release {
    Release {
        id,
        tag_name: tag.into(),
        draft: false,
        prerelease: false,
        created_at: Utc::now() - TimeDelta::days(id),
        assets: asset_ids
            .iter()
            .map(|asset_id| ReleaseAsset {
                id: *asset_id,
                name: format!("dxmt-{tag}.tar.gz"),
            })
            .collect(),
    }
}

pub fn tar_gz(files: &[(&str, &str)]) -> Vec<u8> {
    let encoder = flate2::write::GzEncoder::new(Vec::new(), flate2::Compression::default());
    let mut builder = tar::Builder::new(encoder);
    for (path, data) in files {
        let mut header = tar::Header::new_gnu();
        header.set_size(data.len() as u64);
        header.set_mode(0o644);
        header.set_cksum();
        builder.append_data(&mut header, path, data.as_bytes()).unwrap();
    }
    builder.into_inner().unwrap().finish().unwrap()
}

/// A run artifact as the provider serves it: a zip wrapping one tar.gz.
pub fn run_artifact_zip(files: &[(&str, &str)]) -> Bytes {
    let inner = tar_gz(files);
    let mut writer = zip::ZipWriter::new(Cursor::new(Vec::new()));
    writer
        .start_file("dxmt.tar.gz", zip::write::SimpleFileOptions::default())
        .unwrap();
    writer.write_all(&inner).unwrap();
    Bytes::from(writer.finish().unwrap().into_inner())
}

pub fn zip_without_archive() -> Bytes {
    let mut writer = zip::ZipWriter::new(Cursor::new(Vec::new()));
    writer
        .start_file("README.txt", zip::write::SimpleFileOptions::default())
        .unwrap();
    writer.write_all(b"no tarball in here").unwrap();
    Bytes::from(writer.finish().unwrap().into_inner())
}

pub fn no_runs(downloader: &mut MockDownloader) {
    downloader.expect_list_runs().returning(|_| Ok(vec![]));
}

pub fn no_releases(downloader: &mut MockDownloader) {
    downloader.expect_list_releases().returning(|_| Ok(vec![]));
}

/// Every upload recorded as `(key, file contents)`.
pub type Uploads = Arc<Mutex<Vec<(String, String)>>>;

pub fn recording_uploader() -> (MockUploader, Uploads) {
    let uploads: Uploads = Arc::default();
    let sink = uploads.clone();
    let mut uploader = MockUploader::new();
    uploader.expect_upload().returning(move |path, key| {
        let body = std::fs::read_to_string(path).map_err(Error::Io)?;
        sink.lock().unwrap().push((key.to_string(), body));
        Ok(())
    });
    (uploader, uploads)
}

pub fn keys(uploads: &Uploads) -> Vec<String> {
    uploads.lock().unwrap().iter().map(|(key, _)| key.clone()).collect()
}
