//! End-to-end assembly of an offline bundle.
//!
//! The assembler resolves both charts, renders them, collects their images and
//! hands the image list to the package runner. Every external system sits behind a
//! trait so the flow can be exercised with in-memory fakes.

use super::channel::{
    enable_weave_trace, ChannelSource, ReleaseSource, OPERATOR_CONTROLLER_REPO,
    WANDB_HELM_REPO_URL, WANDB_OPERATOR_CHART,
};
use super::charts::{ChartRef, ChartRenderer, RenderedChart, ResolvedChart};
use super::configmap::ChartCache;
use super::downloader::{ImageDownloader, DEFAULT_PLATFORM};
use super::error::BundleError;
use super::images::{extract_images, remove_duplicates};
use super::layout::BundleLayout;
use crate::packages::fetch::FetchPackage;
use crate::packages::result::RunResult;
use crate::packages::runner::PackageRunner;
use crate::runtime::config::RunnerConfig;
use crate::runtime::progress::{NoopProgress, ProgressSink};
use crate::runtime::runner::Runner;
use crate::runtime::telemetry::Telemetry;
use anyhow::{Context, Result};
use serde_yaml::{Mapping, Value};
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

/// Outcome of [`BundleAssembler::assemble`].
#[derive(Debug)]
pub struct BundleReport {
    pub operator_tag: String,
    pub charts: Vec<ResolvedChart>,
    /// Deduplicated images in the order they were fetched from.
    pub images: Vec<String>,
    pub spec_path: PathBuf,
    pub result: RunResult,
}

impl BundleReport {
    /// Maps an incomplete run to the matching [`BundleError`].
    pub fn into_outcome(self) -> Result<RunResult> {
        let result = self.result;
        if result.cancelled {
            return Err(BundleError::Cancelled {
                completed: result.completed(),
                total: result.total,
            }
            .into());
        }
        if result.failed > 0 {
            return Err(BundleError::FailedImages {
                failed: result.failed,
                total: result.total,
            }
            .into());
        }
        Ok(result)
    }
}

pub struct BundleAssembler {
    releases: Arc<dyn ReleaseSource>,
    channel: Arc<dyn ChannelSource>,
    charts: Arc<dyn ChartRenderer>,
    cache: Option<Arc<dyn ChartCache>>,
    fetcher: Option<Arc<dyn FetchPackage>>,
    layout: BundleLayout,
    platform: String,
    config: RunnerConfig,
    progress: Arc<dyn ProgressSink>,
    telemetry: Arc<Telemetry>,
    shutdown: CancellationToken,
    handle_interrupts: bool,
}

impl BundleAssembler {
    pub fn new(
        releases: Arc<dyn ReleaseSource>,
        channel: Arc<dyn ChannelSource>,
        charts: Arc<dyn ChartRenderer>,
    ) -> Self {
        Self {
            releases,
            channel,
            charts,
            cache: None,
            fetcher: None,
            layout: BundleLayout::default(),
            platform: DEFAULT_PLATFORM.to_owned(),
            config: RunnerConfig::default(),
            progress: Arc::new(NoopProgress),
            telemetry: Arc::new(Telemetry::default()),
            shutdown: CancellationToken::new(),
            handle_interrupts: false,
        }
    }

    pub fn with_layout(mut self, layout: BundleLayout) -> Self {
        self.layout = layout;
        self
    }

    pub fn with_platform(mut self, platform: impl Into<String>) -> Self {
        self.platform = platform.into();
        self
    }

    pub fn with_cache(mut self, cache: Arc<dyn ChartCache>) -> Self {
        self.cache = Some(cache);
        self
    }

    /// Replaces the default `crane`-backed [`ImageDownloader`].
    pub fn with_fetcher(mut self, fetcher: Arc<dyn FetchPackage>) -> Self {
        self.fetcher = Some(fetcher);
        self
    }

    pub fn with_config(mut self, config: RunnerConfig) -> Self {
        self.config = config;
        self
    }

    pub fn with_progress(mut self, progress: Arc<dyn ProgressSink>) -> Self {
        self.progress = progress;
        self
    }

    pub fn with_telemetry(mut self, telemetry: Arc<Telemetry>) -> Self {
        self.telemetry = telemetry;
        self
    }

    pub fn with_cancellation_token(mut self, token: CancellationToken) -> Self {
        self.shutdown = token;
        self
    }

    /// Lets Ctrl-C stop the image download cooperatively instead of killing the process.
    pub fn handle_interrupts(mut self, enabled: bool) -> Self {
        self.handle_interrupts = enabled;
        self
    }

    pub fn layout(&self) -> &BundleLayout {
        &self.layout
    }

    /// Builds the bundle. Any failure before the image download aborts the whole run; image
    /// failures are reported per image in [`BundleReport::result`].
    pub async fn assemble(self) -> Result<BundleReport> {
        self.layout.reset()?;
        self.layout.prepare()?;
        let charts_dir = self.layout.charts_dir();

        let operator_tag = self
            .releases
            .latest_tag(OPERATOR_CONTROLLER_REPO)
            .await
            .context("failed to fetch the latest operator controller tag")?;
        tracing::info!(tag = %operator_tag, "resolved operator controller release");

        let operator_chart = ChartRef::latest(WANDB_HELM_REPO_URL, WANDB_OPERATOR_CHART);
        let operator = self
            .charts
            .resolve(&operator_chart, &operator_values(&operator_tag), &charts_dir)
            .await
            .context("failed to resolve the operator chart")?;

        let spec = self
            .channel
            .channel_spec()
            .await
            .context("failed to fetch the deployment channel spec")?;

        let mut download_values = spec.values.clone();
        if enable_weave_trace(&mut download_values) {
            tracing::debug!("weave-trace enabled for image discovery");
        }

        let platform = self
            .charts
            .resolve(&spec.chart, &download_values, &charts_dir)
            .await
            .with_context(|| format!("failed to resolve the {} chart", spec.chart.name))?;

        let mut images = extract_images(&platform.manifests)
            .with_context(|| format!("failed to read images of the {} chart", spec.chart.name))?;
        images.extend(
            extract_images(&operator.manifests)
                .context("failed to read images of the operator chart")?,
        );
        let images = remove_duplicates(images);
        if images.is_empty() {
            return Err(BundleError::NoImages.into());
        }
        tracing::info!(count = images.len(), "collected images to download");

        let spec_path = self.layout.write_spec(&spec.values)?;

        if let Some(cache) = &self.cache {
            let entries = cache_entries(&[(&operator_chart, &operator), (&spec.chart, &platform)])?;
            if let Err(err) = cache.upsert(&entries).await {
                tracing::warn!(error = %err, "failed to cache chart metadata; continuing");
            }
        }

        let fetcher: Arc<dyn FetchPackage> = match &self.fetcher {
            Some(fetcher) => Arc::clone(fetcher),
            None => Arc::new(ImageDownloader::new(
                self.layout.clone(),
                self.platform.clone(),
            )),
        };
        let packages = PackageRunner::new(images.clone(), fetcher)
            .with_config(self.config.clone())
            .with_progress(Arc::clone(&self.progress))
            .with_telemetry(Arc::clone(&self.telemetry));
        let runner = Runner::with_cancellation_token(packages, self.shutdown.clone());

        let result = if self.handle_interrupts {
            runner.run_until_ctrl_c().await?
        } else {
            runner.run().await?
        };

        Ok(BundleReport {
            operator_tag,
            charts: vec![operator.chart, platform.chart],
            images,
            spec_path,
            result,
        })
    }
}

fn operator_values(tag: &str) -> Mapping {
    let mut image = Mapping::new();
    image.insert(Value::from("tag"), Value::from(tag));
    let mut values = Mapping::new();
    values.insert(Value::from("image"), Value::Mapping(image));
    values
}

/// One entry per chart, keyed by chart name, holding the reference pinned to the version
/// that was actually rendered.
fn cache_entries(charts: &[(&ChartRef, &RenderedChart)]) -> Result<BTreeMap<String, String>> {
    charts
        .iter()
        .map(|(requested, rendered)| {
            let pinned = (*requested).clone().with_version(rendered.chart.version.clone());
            let yaml = serde_yaml::to_string(&pinned)
                .with_context(|| format!("failed to serialize chart {}", pinned.name))?;
            Ok((pinned.name, yaml))
        })
        .collect()
}
