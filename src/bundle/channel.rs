//! Deployment channel spec and release tag lookups.

use super::charts::ChartRef;
use anyhow::{bail, Context, Result};
use futures::future::BoxFuture;
use reqwest::header::{ACCEPT, AUTHORIZATION};
use serde::{Deserialize, Serialize};
use serde_yaml::{Mapping, Value};
use std::path::PathBuf;
use std::time::Duration;

pub const DEFAULT_CHANNEL_URL: &str = "https://deploy.wandb.ai/api/v1/operator/channel";
pub const OPERATOR_CONTROLLER_REPO: &str = "wandb/controller";
pub const WANDB_HELM_REPO_URL: &str = "https://charts.wandb.ai";
pub const WANDB_OPERATOR_CHART: &str = "operator";
pub const GITHUB_API_URL: &str = "https://api.github.com";

const WEAVE_TRACE_KEY: &str = "weave-trace";
const HTTP_TIMEOUT: Duration = Duration::from_secs(30);

/// Platform chart and values published on a deployment channel.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChannelSpec {
    pub chart: ChartRef,
    #[serde(default)]
    pub values: Mapping,
}

pub trait ChannelSource: Send + Sync {
    fn channel_spec(&self) -> BoxFuture<'_, Result<ChannelSpec>>;
}

/// Turns on `weave-trace.install` when the values carry a `weave-trace` section.
///
/// Returns `false` and leaves `values` untouched when the section is missing or is not a
/// mapping.
pub fn enable_weave_trace(values: &mut Mapping) -> bool {
    match values.get_mut(WEAVE_TRACE_KEY) {
        Some(Value::Mapping(section)) => {
            section.insert(Value::from("install"), Value::from(true));
            true
        }
        _ => false,
    }
}

pub(crate) fn http_client() -> Result<reqwest::Client> {
    reqwest::Client::builder()
        .user_agent(concat!("wsm/", env!("CARGO_PKG_VERSION")))
        .timeout(HTTP_TIMEOUT)
        .build()
        .context("failed to build HTTP client")
}

/// Fetches the channel spec as JSON from the deployer API.
#[derive(Debug, Clone)]
pub struct HttpChannel {
    client: reqwest::Client,
    url: String,
}

impl HttpChannel {
    pub fn new(url: impl Into<String>) -> Result<Self> {
        Ok(Self::with_client(http_client()?, url))
    }

    pub fn with_client(client: reqwest::Client, url: impl Into<String>) -> Self {
        Self {
            client,
            url: url.into(),
        }
    }
}

impl ChannelSource for HttpChannel {
    fn channel_spec(&self) -> BoxFuture<'_, Result<ChannelSpec>> {
        Box::pin(async move {
            let response = self
                .client
                .get(&self.url)
                .header(ACCEPT, "application/json")
                .send()
                .await
                .with_context(|| format!("failed to request channel spec from {}", self.url))?;

            let status = response.status();
            if !status.is_success() {
                bail!("channel endpoint {} returned {status}", self.url);
            }

            response
                .json::<ChannelSpec>()
                .await
                .with_context(|| format!("failed to decode channel spec from {}", self.url))
        })
    }
}

/// Reads a channel spec from a local YAML or JSON file, for air-gapped or pinned builds.
#[derive(Debug, Clone)]
pub struct FileChannel {
    path: PathBuf,
}

impl FileChannel {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

impl ChannelSource for FileChannel {
    fn channel_spec(&self) -> BoxFuture<'_, Result<ChannelSpec>> {
        Box::pin(async move {
            let raw = tokio::fs::read_to_string(&self.path)
                .await
                .with_context(|| format!("failed to read {}", self.path.display()))?;
            serde_yaml::from_str(&raw)
                .with_context(|| format!("failed to parse channel spec {}", self.path.display()))
        })
    }
}

/// Looks up the most recent release tag of a repository.
pub trait ReleaseSource: Send + Sync {
    fn latest_tag<'a>(&'a self, repo: &'a str) -> BoxFuture<'a, Result<String>>;
}

#[derive(Deserialize)]
struct LatestRelease {
    tag_name: String,
}

/// [`ReleaseSource`] backed by the GitHub releases API.
#[derive(Debug, Clone)]
pub struct GithubReleases {
    client: reqwest::Client,
    api_url: String,
    token: Option<String>,
}

impl GithubReleases {
    pub fn new() -> Result<Self> {
        Ok(Self {
            client: http_client()?,
            api_url: GITHUB_API_URL.to_owned(),
            token: None,
        })
    }

    /// Authenticates requests, lifting the anonymous rate limit.
    pub fn with_token(mut self, token: Option<String>) -> Self {
        self.token = token.filter(|token| !token.trim().is_empty());
        self
    }

    pub fn with_api_url(mut self, api_url: impl Into<String>) -> Self {
        self.api_url = api_url.into();
        self
    }
}

impl ReleaseSource for GithubReleases {
    fn latest_tag<'a>(&'a self, repo: &'a str) -> BoxFuture<'a, Result<String>> {
        Box::pin(async move {
            let url = format!(
                "{}/repos/{repo}/releases/latest",
                self.api_url.trim_end_matches('/')
            );
            let mut request = self
                .client
                .get(&url)
                .header(ACCEPT, "application/vnd.github+json");
            if let Some(token) = &self.token {
                request = request.header(AUTHORIZATION, format!("Bearer {token}"));
            }

            let response = request
                .send()
                .await
                .with_context(|| format!("failed to query latest release of {repo}"))?;
            let status = response.status();
            if !status.is_success() {
                bail!("GitHub returned {status} for the latest release of {repo}");
            }

            let release = response
                .json::<LatestRelease>()
                .await
                .with_context(|| format!("failed to decode latest release of {repo}"))?;
            if release.tag_name.trim().is_empty() {
                bail!("latest release of {repo} has an empty tag");
            }
            Ok(release.tag_name)
        })
    }
}

/// A release tag chosen by the operator instead of looked up.
#[derive(Debug, Clone)]
pub struct FixedRelease(pub String);

impl ReleaseSource for FixedRelease {
    fn latest_tag<'a>(&'a self, _repo: &'a str) -> BoxFuture<'a, Result<String>> {
        Box::pin(async move { Ok(self.0.clone()) })
    }
}
