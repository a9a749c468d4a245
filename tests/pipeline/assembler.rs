use std::sync::{Arc, Mutex};

use crate::support::helpers::{
    init_tracing, CannedCharts, MemoryCache, RecordingFetcher, RegistryUnavailable,
    StaticChannel, StaticRelease,
};
use anyhow::Result;
use serde_yaml::{Mapping, Value};
use wsm::bundle::channel::ChannelSpec;
use wsm::bundle::charts::ChartRef;
use wsm::bundle::layout::BundleLayout;
use wsm::{fetch_fn, BundleAssembler, BundleError, RunnerConfig};

const OPERATOR_MANIFESTS: &str = r#"
apiVersion: apps/v1
kind: Deployment
spec:
  template:
    spec:
      containers:
        - name: manager
          image: wandb/controller:1.13.0
        - name: proxy
          image: quay.io/brancz/kube-rbac-proxy:v0.15.0
"#;

const PLATFORM_MANIFESTS: &str = r#"
apiVersion: apps/v1
kind: StatefulSet
spec:
  template:
    spec:
      initContainers:
        - name: init-db
          image: wandb/local:0.59.2
      containers:
        - name: app
          image: wandb/local:0.59.2
        - name: proxy
          image: quay.io/brancz/kube-rbac-proxy:v0.15.0
---
apiVersion: apps/v1
kind: Deployment
spec:
  template:
    spec:
      containers:
        - name: weave
          image: wandb/weave-trace:0.6.0
"#;

fn channel_spec() -> ChannelSpec {
    let values: Mapping = serde_yaml::from_str(
        "global:\n  host: https://wandb.example.com\nweave-trace:\n  install: false\n",
    )
    .unwrap();
    ChannelSpec {
        chart: ChartRef::latest("https://charts.wandb.ai", "operator-wandb").with_version("0.18.0"),
        values,
    }
}

fn charts() -> CannedCharts {
    CannedCharts::default()
        .with_chart("operator", OPERATOR_MANIFESTS)
        .with_chart("operator-wandb", PLATFORM_MANIFESTS)
}

fn quick_config() -> Result<RunnerConfig> {
    RunnerConfig::builder().concurrency(3).build()
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn assembles_bundle_from_both_charts() -> Result<()> {
    init_tracing();
    let tmp = tempfile::tempdir()?;
    let layout = BundleLayout::new(tmp.path().join("bundle"));
    std::fs::create_dir_all(layout.images_dir().join("stale"))?;

    let charts = Arc::new(charts());
    let cache = Arc::new(MemoryCache::default());
    let archive_layout = layout.clone();
    let fetched = Arc::new(Mutex::new(Vec::new()));
    let seen = fetched.clone();
    let fetcher = fetch_fn(move |image: String| {
        let layout = archive_layout.clone();
        let seen = seen.clone();
        async move {
            let archive = layout.image_archive(&image)?;
            tokio::fs::create_dir_all(archive.parent().unwrap()).await?;
            tokio::fs::write(&archive, image.as_bytes()).await?;
            seen.lock().unwrap().push(image);
            anyhow::Ok(())
        }
    });

    let report = BundleAssembler::new(
        Arc::new(StaticRelease("1.13.0")),
        Arc::new(StaticChannel(channel_spec())),
        charts.clone(),
    )
    .with_layout(layout.clone())
    .with_cache(cache.clone())
    .with_fetcher(Arc::new(fetcher))
    .with_config(quick_config()?)
    .assemble()
    .await?;

    assert_eq!(report.operator_tag, "1.13.0");
    assert_eq!(
        report.images,
        vec![
            "wandb/local:0.59.2",
            "quay.io/brancz/kube-rbac-proxy:v0.15.0",
            "wandb/weave-trace:0.6.0",
            "wandb/controller:1.13.0",
        ]
    );
    assert!(report.result.is_success());
    assert_eq!(report.result.succeeded, 4);
    assert_eq!(fetched.lock().unwrap().len(), 4);
    assert!(!layout.images_dir().join("stale").exists());
    for image in &report.images {
        assert!(layout.image_archive(image)?.is_file(), "{image} archive missing");
    }

    let operator_values = charts.values_for("operator").expect("operator rendered");
    assert_eq!(operator_values["image"]["tag"], Value::from("1.13.0"));
    let platform_values = charts.values_for("operator-wandb").expect("platform rendered");
    assert_eq!(platform_values["weave-trace"]["install"], Value::from(true));

    let spec: Value = serde_yaml::from_str(&std::fs::read_to_string(&report.spec_path)?)?;
    assert_eq!(spec["wandb"]["weave-trace"]["install"], Value::from(false));
    assert_eq!(
        spec["wandb"]["global"]["host"],
        Value::from("https://wandb.example.com")
    );

    let writes = cache.writes();
    assert_eq!(writes.len(), 1);
    assert!(writes[0].contains_key("operator"));
    assert!(writes[0]["operator-wandb"].contains("0.18.0"));

    assert_eq!(report.into_outcome()?.succeeded, 4);
    Ok(())
}

#[tokio::test]
async fn no_images_fails_before_fetching() -> Result<()> {
    init_tracing();
    let tmp = tempfile::tempdir()?;
    let layout = BundleLayout::new(tmp.path().join("bundle"));
    let fetcher = Arc::new(RecordingFetcher::instant());

    let err = BundleAssembler::new(
        Arc::new(StaticRelease("1.13.0")),
        Arc::new(StaticChannel(channel_spec())),
        Arc::new(CannedCharts::default()),
    )
    .with_layout(layout.clone())
    .with_fetcher(fetcher.clone())
    .assemble()
    .await
    .unwrap_err();

    assert!(matches!(
        err.downcast_ref::<BundleError>(),
        Some(BundleError::NoImages)
    ));
    assert_eq!(fetcher.total_calls(), 0);
    assert!(!layout.spec_path().exists());
    Ok(())
}

#[tokio::test]
async fn chart_failure_aborts_setup() -> Result<()> {
    init_tracing();
    let tmp = tempfile::tempdir()?;
    let fetcher = Arc::new(RecordingFetcher::instant());

    let err = BundleAssembler::new(
        Arc::new(StaticRelease("1.13.0")),
        Arc::new(StaticChannel(channel_spec())),
        Arc::new(charts().broken("operator-wandb")),
    )
    .with_layout(BundleLayout::new(tmp.path().join("bundle")))
    .with_fetcher(fetcher.clone())
    .assemble()
    .await
    .unwrap_err();

    assert_eq!(err.to_string(), "failed to resolve the operator-wandb chart");
    assert_eq!(fetcher.total_calls(), 0);
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn image_failures_are_reported_per_image() -> Result<()> {
    init_tracing();
    let tmp = tempfile::tempdir()?;
    let fetcher = Arc::new(RecordingFetcher::instant().failing_on(&["wandb/weave-trace:0.6.0"]));

    let report = BundleAssembler::new(
        Arc::new(StaticRelease("1.13.0")),
        Arc::new(StaticChannel(channel_spec())),
        Arc::new(charts()),
    )
    .with_layout(BundleLayout::new(tmp.path().join("bundle")))
    .with_cache(Arc::new(MemoryCache::unreachable()))
    .with_fetcher(fetcher.clone())
    .with_config(quick_config()?)
    .assemble()
    .await?;

    assert_eq!(fetcher.total_calls(), 4);
    assert_eq!(report.result.failed, 1);
    let error = report
        .result
        .failure("wandb/weave-trace:0.6.0")
        .expect("weave image should fail");
    assert!(error.downcast_ref::<RegistryUnavailable>().is_some());

    let err = report.into_outcome().unwrap_err();
    assert!(matches!(
        err.downcast_ref::<BundleError>(),
        Some(BundleError::FailedImages { failed: 1, total: 4 })
    ));
    Ok(())
}
