//! # uploader: S3 implementation of [`Uploader`]
//!
//! Files are written with a single `put_object` per key. Keys are decided by
//! [`crate::model::object_key`]; this module never builds keys itself, it only
//! validates them before sending.
//!
//! Credentials come from the AWS default provider chain (environment,
//! profile, instance metadata). A custom endpoint switches the client to
//! path-style addressing so S3-compatible stores (MinIO, R2) work.

use async_trait::async_trait;
use aws_config::BehaviorVersion;
use aws_sdk_s3::config::Region;
use aws_sdk_s3::primitives::ByteStream;
use aws_sdk_s3::Client;
use std::path::Path;
use tracing::{debug, error, info};

use crate::contract::Uploader;
use crate::error::{Error, Result};

#[derive(Debug, Clone)]
pub struct S3Config {
    pub bucket: String,
    pub endpoint_url: Option<String>,
    pub region: Option<String>,
}

#[derive(Clone)]
pub struct S3Uploader {
    client: Client,
    bucket: String,
}

impl S3Uploader {
    pub async fn new(cfg: &S3Config) -> Result<Self> {
        if cfg.bucket.trim().is_empty() {
            return Err(Error::Config("bucket name must not be empty".into()));
        }

        let mut loader = aws_config::defaults(BehaviorVersion::latest());
        if let Some(region) = &cfg.region {
            loader = loader.region(Region::new(region.clone()));
        }
        if let Some(endpoint) = &cfg.endpoint_url {
            loader = loader.endpoint_url(endpoint);
        }
        let shared = loader.load().await;

        let s3_cfg = aws_sdk_s3::config::Builder::from(&shared)
            .force_path_style(cfg.endpoint_url.is_some())
            .build();

        info!(
            bucket = %cfg.bucket,
            endpoint = cfg.endpoint_url.as_deref().unwrap_or("aws"),
            "[UPLOAD] Initialised S3 uploader"
        );
        Ok(Self {
            client: Client::from_conf(s3_cfg),
            bucket: cfg.bucket.clone(),
        })
    }

    pub fn bucket(&self) -> &str {
        &self.bucket
    }
}

fn validate_key(key: &str) -> Result<()> {
    let invalid = key.trim().is_empty()
        || key.starts_with('/')
        || key.contains('\\')
        || key.split('/').any(|seg| seg.is_empty() || seg == "." || seg == "..");
    if invalid {
        return Err(Error::Invariant(format!("refusing to upload to malformed key {key:?}")));
    }
    Ok(())
}

#[async_trait]
impl Uploader for S3Uploader {
    async fn upload(&self, local_path: &Path, key: &str) -> Result<()> {
        validate_key(key)?;

        let body = ByteStream::from_path(local_path).await.map_err(|e| {
            error!(error = ?e, path = %local_path.display(), "[UPLOAD] Failed to open file for upload");
            Error::upload(key, e)
        })?;

        debug!(bucket = %self.bucket, key = %key, path = %local_path.display(), "[UPLOAD] put_object");
        self.client
            .put_object()
            .bucket(&self.bucket)
            .key(key)
            .body(body)
            .send()
            .await
            .map_err(|e| {
                error!(error = ?e, bucket = %self.bucket, key = %key, "[UPLOAD] put_object failed");
                Error::upload(key, e)
            })?;

        info!(bucket = %self.bucket, key = %key, "[UPLOAD] Uploaded file");
        Ok(())
    }
}
