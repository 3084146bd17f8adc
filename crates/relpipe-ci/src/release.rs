//! Release publication.
//!
//! A release is created once per tag with every platform's package attached.
//! Publishers never leave a partially published release behind: GitHub
//! releases stay drafts until all uploads succeeded, directory releases are
//! staged under a temporary name and renamed into place.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use relpipe_core::{Artifact, GitHubConfig, PipelineError, ReleaseManifest, Result};
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

/// Everything needed to create one release.
#[derive(Debug, Clone)]
pub struct ReleaseRequest {
    pub tag: String,
    pub name: String,
    /// Release notes; the triggering tag message.
    pub body: String,
    pub manifest: ReleaseManifest,
}

/// One published file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PublishedAsset {
    pub platform: String,
    pub file_name: String,
    pub sha256: String,
}

/// Record of a created release.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PublishedRelease {
    pub tag: String,
    pub name: String,
    pub body: String,
    /// Where the release can be found (web URL or directory).
    pub location: String,
    pub assets: Vec<PublishedAsset>,
    pub published_at: DateTime<Utc>,
}

/// Destination for releases.
#[async_trait]
pub trait ReleasePublisher: Send + Sync {
    /// Whether a release for `tag` already exists.
    async fn release_exists(&self, tag: &str) -> Result<bool>;

    /// Create the release with all of the manifest's artifacts attached.
    async fn publish(&self, request: &ReleaseRequest) -> Result<PublishedRelease>;
}

fn assets_of(manifest: &ReleaseManifest) -> Result<Vec<(String, &Artifact)>> {
    manifest
        .platforms()
        .map(|platform| {
            let artifact = manifest.get(platform).ok_or_else(|| {
                PipelineError::Publish(format!("manifest lost platform '{}'", platform))
            })?;
            Ok((platform.to_string(), artifact))
        })
        .collect()
}

fn published_asset(platform: &str, artifact: &Artifact) -> Result<PublishedAsset> {
    let file_name = artifact
        .file_name()
        .ok_or_else(|| {
            PipelineError::Publish(format!("{} has no file name", artifact.path().display()))
        })?
        .to_string();
    Ok(PublishedAsset {
        platform: platform.to_string(),
        file_name,
        sha256: artifact.digest().to_string(),
    })
}

/// Publishes into `<root>/<tag>/` with a `release.json` record.
pub struct DirectoryPublisher {
    root: PathBuf,
}

impl DirectoryPublisher {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn release_dir(&self, tag: &str) -> PathBuf {
        self.root.join(tag)
    }

    async fn stage(&self, staging: &Path, request: &ReleaseRequest) -> Result<Vec<PublishedAsset>> {
        tokio::fs::create_dir_all(staging).await?;
        let mut assets = Vec::new();
        for (platform, artifact) in assets_of(&request.manifest)? {
            if !artifact.verify()? {
                return Err(PipelineError::Publish(format!(
                    "{} changed after validation",
                    artifact.path().display()
                )));
            }
            let asset = published_asset(&platform, artifact)?;
            tokio::fs::copy(artifact.path(), staging.join(&asset.file_name)).await?;
            debug!(platform = %platform, file = %asset.file_name, "Asset staged");
            assets.push(asset);
        }
        Ok(assets)
    }
}

#[async_trait]
impl ReleasePublisher for DirectoryPublisher {
    async fn release_exists(&self, tag: &str) -> Result<bool> {
        Ok(tokio::fs::try_exists(self.release_dir(tag)).await?)
    }

    async fn publish(&self, request: &ReleaseRequest) -> Result<PublishedRelease> {
        let target = self.release_dir(&request.tag);
        if tokio::fs::try_exists(&target).await? {
            return Err(PipelineError::Publish(format!(
                "release {} already exists at {}",
                request.tag,
                target.display()
            )));
        }

        let staging = self.root.join(format!(".{}.partial", request.tag));
        if tokio::fs::try_exists(&staging).await? {
            tokio::fs::remove_dir_all(&staging).await?;
        }

        let assets = match self.stage(&staging, request).await {
            Ok(assets) => assets,
            Err(e) => {
                let _ = tokio::fs::remove_dir_all(&staging).await;
                return Err(e);
            }
        };

        let release = PublishedRelease {
            tag: request.tag.clone(),
            name: request.name.clone(),
            body: request.body.clone(),
            location: target.display().to_string(),
            assets,
            published_at: Utc::now(),
        };
        let record = serde_json::to_vec_pretty(&release)
            .map_err(|e| PipelineError::Publish(format!("cannot encode release record: {}", e)))?;
        tokio::fs::write(staging.join("release.json"), record).await?;
        tokio::fs::rename(&staging, &target).await?;

        info!(
            tag = %release.tag,
            dir = %target.display(),
            assets = release.assets.len(),
            "Release published"
        );
        Ok(release)
    }
}

/// Publishes GitHub releases through the REST API.
pub struct GitHubPublisher {
    config: GitHubConfig,
    token: String,
    http_client: reqwest::Client,
}

#[derive(Debug, Deserialize)]
struct GitHubRelease {
    id: u64,
    html_url: String,
}

impl GitHubPublisher {
    pub fn new(config: GitHubConfig, token: &str) -> Result<Self> {
        if token.trim().is_empty() {
            return Err(PipelineError::Configuration(
                "a GitHub token is required to publish releases".to_string(),
            ));
        }
        let http_client = reqwest::Client::builder()
            .user_agent(format!("relpipe/{}", relpipe_core::VERSION))
            .build()
            .map_err(|e| PipelineError::Configuration(format!("cannot build HTTP client: {}", e)))?;
        Ok(Self {
            config,
            token: token.to_string(),
            http_client,
        })
    }

    fn releases_url(&self) -> String {
        format!(
            "{}/repos/{}/{}/releases",
            self.config.api_url.trim_end_matches('/'),
            self.config.owner,
            self.config.repo
        )
    }

    fn tag_url(&self, tag: &str) -> String {
        format!("{}/tags/{}", self.releases_url(), tag)
    }

    fn release_url(&self, id: u64) -> String {
        format!("{}/{}", self.releases_url(), id)
    }

    fn upload_url(&self, id: u64) -> String {
        format!(
            "{}/repos/{}/{}/releases/{}/assets",
            self.config.upload_url.trim_end_matches('/'),
            self.config.owner,
            self.config.repo,
            id
        )
    }

    fn request(&self, method: reqwest::Method, url: &str) -> reqwest::RequestBuilder {
        self.http_client
            .request(method, url)
            .bearer_auth(&self.token)
            .header(reqwest::header::ACCEPT, "application/vnd.github+json")
            .header("X-GitHub-Api-Version", "2022-11-28")
    }

    async fn send(
        &self,
        builder: reqwest::RequestBuilder,
        what: &str,
    ) -> Result<reqwest::Response> {
        let response = builder
            .send()
            .await
            .map_err(|e| PipelineError::Publish(format!("{}: {}", what, e)))?;
        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }
        let body = response.text().await.unwrap_or_default();
        Err(PipelineError::Publish(format!("{}: HTTP {}: {}", what, status, body)))
    }

    async fn upload_all(&self, id: u64, request: &ReleaseRequest) -> Result<Vec<PublishedAsset>> {
        let mut assets = Vec::new();
        for (platform, artifact) in assets_of(&request.manifest)? {
            let asset = published_asset(&platform, artifact)?;
            let bytes = tokio::fs::read(artifact.path()).await?;
            if relpipe_core::ContentDigest::from_bytes(&bytes) != *artifact.digest() {
                return Err(PipelineError::Publish(format!(
                    "{} changed after validation",
                    artifact.path().display()
                )));
            }
            let upload = self
                .request(reqwest::Method::POST, &self.upload_url(id))
                .query(&[("name", asset.file_name.as_str())])
                .header(
                    reqwest::header::CONTENT_TYPE,
                    "application/vnd.debian.binary-package",
                )
                .body(bytes);
            self.send(upload, &format!("uploading {}", asset.file_name))
                .await?;
            debug!(platform = %platform, file = %asset.file_name, "Asset uploaded");
            assets.push(asset);
        }
        Ok(assets)
    }
}

#[async_trait]
impl ReleasePublisher for GitHubPublisher {
    async fn release_exists(&self, tag: &str) -> Result<bool> {
        let response = self
            .request(reqwest::Method::GET, &self.tag_url(tag))
            .send()
            .await
            .map_err(|e| PipelineError::Publish(format!("looking up release {}: {}", tag, e)))?;
        match response.status() {
            reqwest::StatusCode::NOT_FOUND => Ok(false),
            status if status.is_success() => Ok(true),
            status => Err(PipelineError::Publish(format!(
                "looking up release {}: HTTP {}",
                tag, status
            ))),
        }
    }

    async fn publish(&self, request: &ReleaseRequest) -> Result<PublishedRelease> {
        let create = self
            .request(reqwest::Method::POST, &self.releases_url())
            .json(&json!({
                "tag_name": request.tag,
                "name": request.name,
                "body": request.body,
                "draft": true,
            }));
        let draft: GitHubRelease = self
            .send(create, &format!("creating release {}", request.tag))
            .await?
            .json()
            .await
            .map_err(|e| PipelineError::Publish(format!("unexpected release response: {}", e)))?;
        info!(tag = %request.tag, id = draft.id, "Draft release created");

        let assets = match self.upload_all(draft.id, request).await {
            Ok(assets) => assets,
            Err(e) => {
                let delete = self.request(reqwest::Method::DELETE, &self.release_url(draft.id));
                if let Err(cleanup) = self.send(delete, "deleting draft release").await {
                    warn!(tag = %request.tag, error = %cleanup, "Draft release left behind");
                }
                return Err(e);
            }
        };

        let finalize = self
            .request(reqwest::Method::PATCH, &self.release_url(draft.id))
            .json(&json!({ "draft": false }));
        let published: GitHubRelease = self
            .send(finalize, &format!("publishing release {}", request.tag))
            .await?
            .json()
            .await
            .map_err(|e| PipelineError::Publish(format!("unexpected release response: {}", e)))?;

        info!(tag = %request.tag, url = %published.html_url, "Release published");
        Ok(PublishedRelease {
            tag: request.tag.clone(),
            name: request.name.clone(),
            body: request.body.clone(),
            location: published.html_url,
            assets,
            published_at: Utc::now(),
        })
    }
}
