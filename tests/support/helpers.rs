use std::{
    collections::{BTreeMap, HashMap, HashSet},
    fmt,
    path::Path,
    sync::{
        atomic::{AtomicUsize, Ordering},
        Mutex,
    },
    time::Duration,
};

use anyhow::{bail, Result};
use futures::future::BoxFuture;
use once_cell::sync::Lazy;
use serde_yaml::Mapping;
use tokio::time::sleep;
use tracing_subscriber::EnvFilter;
use wsm::bundle::channel::{ChannelSource, ChannelSpec, ReleaseSource};
use wsm::bundle::charts::{ChartRef, ChartRenderer, RenderedChart, ResolvedChart};
use wsm::bundle::configmap::ChartCache;
use wsm::{FetchPackage, PackageFuture, ProgressSink, ProgressView};

static TRACING_SUBSCRIBER: Lazy<()> = Lazy::new(|| {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
});

pub fn init_tracing() {
    Lazy::force(&TRACING_SUBSCRIBER);
}

pub fn item_names(count: usize) -> Vec<String> {
    (0..count).map(|i| format!("registry.local/app-{i}:1.0")).collect()
}

pub fn names(items: &[&str]) -> Vec<String> {
    items.iter().map(|item| item.to_string()).collect()
}

/// Error type used to check that failures reach the result unchanged.
#[derive(Debug, PartialEq, Eq)]
pub struct RegistryUnavailable(pub String);

impl fmt::Display for RegistryUnavailable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "registry unavailable while pulling {}", self.0)
    }
}

impl std::error::Error for RegistryUnavailable {}

/// Fetcher that counts calls per item, tracks peak concurrency, and fails a chosen subset.
pub struct RecordingFetcher {
    calls: Mutex<HashMap<String, usize>>,
    in_flight: AtomicUsize,
    peak_in_flight: AtomicUsize,
    failing: HashSet<String>,
    delay: fn(&str) -> Duration,
}

impl RecordingFetcher {
    pub fn new(delay: fn(&str) -> Duration) -> Self {
        Self {
            calls: Mutex::new(HashMap::new()),
            in_flight: AtomicUsize::new(0),
            peak_in_flight: AtomicUsize::new(0),
            failing: HashSet::new(),
            delay,
        }
    }

    pub fn instant() -> Self {
        Self::new(|_| Duration::ZERO)
    }

    pub fn failing_on(mut self, items: &[&str]) -> Self {
        self.failing = items.iter().map(|item| item.to_string()).collect();
        self
    }

    pub fn calls(&self) -> HashMap<String, usize> {
        self.calls.lock().unwrap().clone()
    }

    pub fn total_calls(&self) -> usize {
        self.calls.lock().unwrap().values().sum()
    }

    pub fn peak_in_flight(&self) -> usize {
        self.peak_in_flight.load(Ordering::SeqCst)
    }
}

impl FetchPackage for RecordingFetcher {
    fn fetch<'a>(&'a self, item: &'a str) -> PackageFuture<'a> {
        Box::pin(async move {
            *self
                .calls
                .lock()
                .unwrap()
                .entry(item.to_owned())
                .or_default() += 1;
            let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
            self.peak_in_flight.fetch_max(now, Ordering::SeqCst);

            let delay = (self.delay)(item);
            if !delay.is_zero() {
                sleep(delay).await;
            } else {
                tokio::task::yield_now().await;
            }

            self.in_flight.fetch_sub(1, Ordering::SeqCst);
            if self.failing.contains(item) {
                return Err(RegistryUnavailable(item.to_owned()).into());
            }
            Ok(())
        })
    }
}

/// Progress sink that keeps every call for later inspection.
#[derive(Default)]
pub struct RecordingProgress {
    started: Mutex<Option<usize>>,
    updates: Mutex<Vec<ProgressView>>,
    finished: Mutex<Option<ProgressView>>,
}

impl RecordingProgress {
    pub fn started(&self) -> Option<usize> {
        *self.started.lock().unwrap()
    }

    pub fn updates(&self) -> Vec<ProgressView> {
        self.updates.lock().unwrap().clone()
    }

    pub fn finished(&self) -> Option<ProgressView> {
        self.finished.lock().unwrap().clone()
    }
}

impl ProgressSink for RecordingProgress {
    fn start(&self, total: usize) -> Result<()> {
        *self.started.lock().unwrap() = Some(total);
        Ok(())
    }

    fn update(&self, view: &ProgressView) -> Result<()> {
        self.updates.lock().unwrap().push(view.clone());
        Ok(())
    }

    fn finish(&self, view: &ProgressView) -> Result<()> {
        *self.finished.lock().unwrap() = Some(view.clone());
        Ok(())
    }
}

pub struct StaticRelease(pub &'static str);

impl ReleaseSource for StaticRelease {
    fn latest_tag<'a>(&'a self, repo: &'a str) -> BoxFuture<'a, Result<String>> {
        Box::pin(async move {
            assert_eq!(repo, "wandb/controller");
            Ok(self.0.to_owned())
        })
    }
}

pub struct StaticChannel(pub ChannelSpec);

impl ChannelSource for StaticChannel {
    fn channel_spec(&self) -> BoxFuture<'_, Result<ChannelSpec>> {
        Box::pin(async move { Ok(self.0.clone()) })
    }
}

/// Renders charts from canned manifests keyed by chart name and records the values used.
#[derive(Default)]
pub struct CannedCharts {
    manifests: HashMap<String, String>,
    broken: HashSet<String>,
    rendered_with: Mutex<Vec<(String, Mapping)>>,
}

impl CannedCharts {
    pub fn with_chart(mut self, name: &str, manifests: &str) -> Self {
        self.manifests.insert(name.to_owned(), manifests.to_owned());
        self
    }

    pub fn broken(mut self, name: &str) -> Self {
        self.broken.insert(name.to_owned());
        self
    }

    pub fn values_for(&self, name: &str) -> Option<Mapping> {
        self.rendered_with
            .lock()
            .unwrap()
            .iter()
            .find(|(chart, _)| chart == name)
            .map(|(_, values)| values.clone())
    }
}

impl ChartRenderer for CannedCharts {
    fn resolve<'a>(
        &'a self,
        chart: &'a ChartRef,
        values: &'a Mapping,
        dest: &'a Path,
    ) -> BoxFuture<'a, Result<RenderedChart>> {
        Box::pin(async move {
            if self.broken.contains(&chart.name) {
                bail!("helm pull {} failed", chart.name);
            }
            self.rendered_with
                .lock()
                .unwrap()
                .push((chart.name.clone(), values.clone()));
            Ok(RenderedChart {
                chart: ResolvedChart {
                    name: chart.name.clone(),
                    version: chart.version.clone().unwrap_or_else(|| "9.9.9".to_owned()),
                    path: dest.join(&chart.name),
                },
                manifests: self.manifests.get(&chart.name).cloned().unwrap_or_default(),
            })
        })
    }
}

#[derive(Default)]
pub struct MemoryCache {
    fail: bool,
    writes: Mutex<Vec<BTreeMap<String, String>>>,
}

impl MemoryCache {
    pub fn unreachable() -> Self {
        Self {
            fail: true,
            ..Self::default()
        }
    }

    pub fn writes(&self) -> Vec<BTreeMap<String, String>> {
        self.writes.lock().unwrap().clone()
    }
}

impl ChartCache for MemoryCache {
    fn upsert<'a>(&'a self, data: &'a BTreeMap<String, String>) -> BoxFuture<'a, Result<()>> {
        Box::pin(async move {
            if self.fail {
                bail!("the server could not find the requested resource");
            }
            self.writes.lock().unwrap().push(data.clone());
            Ok(())
        })
    }
}
