//! GitHub REST implementation of [`Downloader`].

use async_trait::async_trait;
use bytes::Bytes;
use reqwest::header::{HeaderMap, HeaderValue, ACCEPT, AUTHORIZATION, USER_AGENT};
use reqwest::{Client, RequestBuilder};
use serde::de::DeserializeOwned;
use serde::Deserialize;
use tracing::{debug, error, info};

use crate::config::MAX_PAGE_SIZE;
use crate::contract::{Downloader, Release, RunArtifact, WorkflowRun};
use crate::error::{Error, Result};

pub const DEFAULT_API_URL: &str = "https://api.github.com";
const API_VERSION: &str = "2022-11-28";
const ARTIFACTS_PER_PAGE: u32 = MAX_PAGE_SIZE;

/// Where and how to reach the GitHub API.
#[derive(Debug, Clone)]
pub struct GitHubConfig {
    pub api_url: String,
    pub token: String,
    pub owner: String,
    pub repo: String,
    pub page_size: u32,
}

#[derive(Debug, Deserialize)]
struct WorkflowRunsPage {
    #[allow(dead_code)]
    total_count: i64,
    workflow_runs: Vec<WorkflowRun>,
}

#[derive(Debug, Deserialize)]
struct RunArtifactsPage {
    #[allow(dead_code)]
    total_count: i64,
    artifacts: Vec<RunArtifact>,
}

pub struct GitHubDownloader {
    client: Client,
    config: GitHubConfig,
}

impl GitHubDownloader {
    pub fn new(config: GitHubConfig) -> Result<Self> {
        if config.token.trim().is_empty() {
            return Err(Error::Config("GitHub token must not be empty".into()));
        }

        let mut headers = HeaderMap::new();
        headers.insert(ACCEPT, HeaderValue::from_static("application/vnd.github+json"));
        headers.insert("X-GitHub-Api-Version", HeaderValue::from_static(API_VERSION));
        headers.insert(
            USER_AGENT,
            HeaderValue::from_static(concat!("artifact-mirror/", env!("CARGO_PKG_VERSION"))),
        );
        let mut auth = HeaderValue::from_str(&format!("Bearer {}", config.token))
            .map_err(|e| Error::Config(format!("GitHub token is not a valid header value: {e}")))?;
        auth.set_sensitive(true);
        headers.insert(AUTHORIZATION, auth);

        let client = Client::builder()
            .default_headers(headers)
            .build()
            .map_err(|e| Error::provider("building GitHub client", e))?;

        info!(
            api_url = %config.api_url,
            owner = %config.owner,
            repo = %config.repo,
            "[GITHUB] Initialised GitHub client"
        );
        Ok(Self { client, config })
    }

    fn per_page(&self) -> String {
        self.config.page_size.clamp(1, MAX_PAGE_SIZE).to_string()
    }

    fn repo_url(&self, path: &str) -> String {
        format!(
            "{}/repos/{}/{}/{}",
            self.config.api_url.trim_end_matches('/'),
            self.config.owner,
            self.config.repo,
            path
        )
    }

    async fn send(&self, url: &str, request: RequestBuilder) -> Result<reqwest::Response> {
        let response = request.send().await.map_err(|e| {
            error!(error = ?e, url = %url, "[GITHUB] Request failed");
            Error::provider(format!("GET {url}"), e)
        })?;

        let status = response.status();
        if !status.is_success() {
            error!(status = %status, url = %url, "[GITHUB] API returned error status");
            return Err(Error::ProviderStatus {
                url: url.to_string(),
                status: status.as_u16(),
            });
        }
        Ok(response)
    }

    async fn get_json<T: DeserializeOwned>(&self, url: &str, query: &[(&str, String)]) -> Result<T> {
        debug!(url = %url, ?query, "[GITHUB] GET");
        let response = self.send(url, self.client.get(url).query(query)).await?;
        response
            .json::<T>()
            .await
            .map_err(|e| Error::provider(format!("decoding response of {url}"), e))
    }

    async fn get_bytes(&self, url: &str, accept: Option<&'static str>) -> Result<Bytes> {
        debug!(url = %url, "[GITHUB] Downloading");
        let mut request = self.client.get(url);
        if let Some(accept) = accept {
            request = request.header(ACCEPT, accept);
        }
        let response = self.send(url, request).await?;
        let body = response
            .bytes()
            .await
            .map_err(|e| Error::provider(format!("reading body of {url}"), e))?;
        info!(url = %url, size = body.len(), "[GITHUB] Download complete");
        Ok(body)
    }
}

#[async_trait]
impl Downloader for GitHubDownloader {
    async fn list_runs(&self, page: u32) -> Result<Vec<WorkflowRun>> {
        let url = self.repo_url("actions/runs");
        let query = [
            ("status", "success".to_string()),
            ("per_page", self.per_page()),
            ("page", page.to_string()),
        ];
        let page_body: WorkflowRunsPage = self.get_json(&url, &query).await?;
        debug!(page, count = page_body.workflow_runs.len(), "[GITHUB] Listed runs");
        Ok(page_body.workflow_runs)
    }

    async fn list_run_artifacts(&self, run_id: i64) -> Result<Vec<RunArtifact>> {
        let url = self.repo_url(&format!("actions/runs/{run_id}/artifacts"));
        let query = [("per_page", ARTIFACTS_PER_PAGE.to_string())];
        let page_body: RunArtifactsPage = self.get_json(&url, &query).await?;
        debug!(run_id, count = page_body.artifacts.len(), "[GITHUB] Listed run artifacts");
        Ok(page_body.artifacts)
    }

    async fn download_run_artifact(&self, run_id: i64, artifact_id: i64) -> Result<Bytes> {
        debug!(run_id, artifact_id, "[GITHUB] Downloading run artifact");
        let url = self.repo_url(&format!("actions/artifacts/{artifact_id}/zip"));
        self.get_bytes(&url, None).await
    }

    async fn list_releases(&self, page: u32) -> Result<Vec<Release>> {
        let url = self.repo_url("releases");
        let query = [
            ("per_page", self.per_page()),
            ("page", page.to_string()),
        ];
        let releases: Vec<Release> = self.get_json(&url, &query).await?;
        debug!(page, count = releases.len(), "[GITHUB] Listed releases");
        Ok(releases)
    }

    async fn download_release_asset(&self, release_id: i64, asset_id: i64) -> Result<Bytes> {
        debug!(release_id, asset_id, "[GITHUB] Downloading release asset");
        let url = self.repo_url(&format!("releases/assets/{asset_id}"));
        self.get_bytes(&url, Some("application/octet-stream")).await
    }
}
