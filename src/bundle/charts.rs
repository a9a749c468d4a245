//! Helm chart download and rendering.

use super::command::run_tool;
use anyhow::{Context, Result};
use futures::future::BoxFuture;
use serde::{Deserialize, Deserializer, Serialize};
use serde_yaml::Mapping;
use std::path::{Path, PathBuf};

pub const DEFAULT_HELM_PROGRAM: &str = "helm";

/// Location of a chart in a Helm repository. A missing version selects the latest release.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChartRef {
    pub url: String,
    pub name: String,
    #[serde(default, deserialize_with = "blank_as_none", skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,
}

impl ChartRef {
    pub fn latest(url: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            name: name.into(),
            version: None,
        }
    }

    pub fn with_version(mut self, version: impl Into<String>) -> Self {
        let version = version.into();
        self.version = (!version.trim().is_empty()).then_some(version);
        self
    }
}

fn blank_as_none<'de, D>(deserializer: D) -> Result<Option<String>, D::Error>
where
    D: Deserializer<'de>,
{
    let version = Option::<String>::deserialize(deserializer)?;
    Ok(version.filter(|version| !version.trim().is_empty()))
}

/// A chart after download, with the version that was actually pulled.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedChart {
    pub name: String,
    pub version: String,
    pub path: PathBuf,
}

#[derive(Debug, Clone)]
pub struct RenderedChart {
    pub chart: ResolvedChart,
    /// Multi-document YAML produced by rendering the chart with the given values.
    pub manifests: String,
}

/// Downloads a chart into `dest` and renders it with `values`.
pub trait ChartRenderer: Send + Sync {
    fn resolve<'a>(
        &'a self,
        chart: &'a ChartRef,
        values: &'a Mapping,
        dest: &'a Path,
    ) -> BoxFuture<'a, Result<RenderedChart>>;
}

#[derive(Deserialize)]
struct ChartMetadata {
    name: String,
    version: String,
}

/// [`ChartRenderer`] backed by the `helm` command line.
#[derive(Debug, Clone)]
pub struct HelmCli {
    program: String,
}

impl Default for HelmCli {
    fn default() -> Self {
        Self::new(DEFAULT_HELM_PROGRAM)
    }
}

impl HelmCli {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
        }
    }

    async fn pull(&self, chart: &ChartRef, dest: &Path) -> Result<PathBuf> {
        let mut args = vec![
            "pull".to_owned(),
            chart.name.clone(),
            "--repo".to_owned(),
            chart.url.clone(),
            "--untar".to_owned(),
            "--untardir".to_owned(),
            dest.display().to_string(),
        ];
        if let Some(version) = &chart.version {
            args.push("--version".to_owned());
            args.push(version.clone());
        }

        run_tool(&self.program, &args, None)
            .await
            .with_context(|| {
                format!("failed to download chart {} from {}", chart.name, chart.url)
            })?;
        Ok(dest.join(&chart.name))
    }

    async fn template(
        &self,
        chart: &ChartRef,
        chart_dir: &Path,
        values_file: &Path,
    ) -> Result<String> {
        let args = [
            "template".to_owned(),
            chart.name.clone(),
            chart_dir.display().to_string(),
            "--values".to_owned(),
            values_file.display().to_string(),
        ];
        let output = run_tool(&self.program, &args, None)
            .await
            .with_context(|| format!("failed to render chart {}", chart.name))?;
        Ok(output.stdout)
    }
}

impl ChartRenderer for HelmCli {
    fn resolve<'a>(
        &'a self,
        chart: &'a ChartRef,
        values: &'a Mapping,
        dest: &'a Path,
    ) -> BoxFuture<'a, Result<RenderedChart>> {
        Box::pin(async move {
            tokio::fs::create_dir_all(dest)
                .await
                .with_context(|| format!("failed to create {}", dest.display()))?;

            let chart_dir = self.pull(chart, dest).await?;
            let metadata = read_chart_metadata(&chart_dir).await?;
            tracing::info!(chart = %metadata.name, version = %metadata.version, "chart downloaded");

            let values_file = dest.join(format!("{}-values.yaml", chart.name));
            let values_yaml =
                serde_yaml::to_string(values).context("failed to serialize chart values")?;
            tokio::fs::write(&values_file, values_yaml)
                .await
                .with_context(|| format!("failed to write {}", values_file.display()))?;

            let manifests = self.template(chart, &chart_dir, &values_file).await?;

            Ok(RenderedChart {
                chart: ResolvedChart {
                    name: metadata.name,
                    version: metadata.version,
                    path: chart_dir,
                },
                manifests,
            })
        })
    }
}

async fn read_chart_metadata(chart_dir: &Path) -> Result<ChartMetadata> {
    let path = chart_dir.join("Chart.yaml");
    let raw = tokio::fs::read_to_string(&path)
        .await
        .with_context(|| format!("failed to read {}", path.display()))?;
    serde_yaml::from_str(&raw).with_context(|| format!("failed to parse {}", path.display()))
}
