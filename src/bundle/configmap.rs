//! Chart metadata cache stored in a Kubernetes ConfigMap.

use super::command::run_tool;
use anyhow::{Context, Result};
use futures::future::BoxFuture;
use serde::Serialize;
use std::collections::BTreeMap;

pub const DEFAULT_KUBECTL_PROGRAM: &str = "kubectl";
pub const CHART_CACHE_NAMESPACE: &str = "default";
pub const CHART_CACHE_NAME: &str = "wandb-charts";

/// Stores resolved chart metadata so later commands can reuse it.
pub trait ChartCache: Send + Sync {
    fn upsert<'a>(&'a self, data: &'a BTreeMap<String, String>) -> BoxFuture<'a, Result<()>>;
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct ConfigMapManifest<'a> {
    api_version: &'static str,
    kind: &'static str,
    metadata: ObjectMeta<'a>,
    data: &'a BTreeMap<String, String>,
}

#[derive(Serialize)]
struct ObjectMeta<'a> {
    name: &'a str,
    namespace: &'a str,
}

/// [`ChartCache`] that creates or replaces a ConfigMap through `kubectl`.
#[derive(Debug, Clone)]
pub struct KubectlConfigMap {
    program: String,
    namespace: String,
    name: String,
}

impl Default for KubectlConfigMap {
    fn default() -> Self {
        Self {
            program: DEFAULT_KUBECTL_PROGRAM.to_owned(),
            namespace: CHART_CACHE_NAMESPACE.to_owned(),
            name: CHART_CACHE_NAME.to_owned(),
        }
    }
}

impl KubectlConfigMap {
    pub fn with_program(mut self, program: impl Into<String>) -> Self {
        self.program = program.into();
        self
    }

    pub fn with_namespace(mut self, namespace: impl Into<String>) -> Self {
        self.namespace = namespace.into();
        self
    }

    fn manifest(&self, data: &BTreeMap<String, String>) -> Result<String> {
        serde_yaml::to_string(&ConfigMapManifest {
            api_version: "v1",
            kind: "ConfigMap",
            metadata: ObjectMeta {
                name: &self.name,
                namespace: &self.namespace,
            },
            data,
        })
        .context("failed to serialize ConfigMap manifest")
    }

    async fn exists(&self) -> bool {
        run_tool(
            &self.program,
            ["get", "configmap", self.name.as_str(), "--namespace", self.namespace.as_str()],
            None,
        )
        .await
        .is_ok()
    }
}

impl ChartCache for KubectlConfigMap {
    fn upsert<'a>(&'a self, data: &'a BTreeMap<String, String>) -> BoxFuture<'a, Result<()>> {
        Box::pin(async move {
            let manifest = self.manifest(data)?;
            let verb = if self.exists().await { "replace" } else { "create" };

            run_tool(&self.program, [verb, "-f", "-"], Some(manifest.as_bytes()))
                .await
                .with_context(|| {
                    format!(
                        "failed to {verb} ConfigMap {}/{}",
                        self.namespace, self.name
                    )
                })?;
            tracing::info!(
                namespace = %self.namespace,
                name = %self.name,
                verb,
                "chart cache updated"
            );
            Ok(())
        })
    }
}
