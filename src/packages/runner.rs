//! `PackageRunner` drives a fixed list of packages through a bounded worker pool.
//!
//! A run is composed of smaller pieces:
//! - `state` owns the per-item table every worker claims from;
//! - `worker_pool` spawns the workers and captures callback panics;
//! - `lifecycle` keeps the progress renderer alive for the run;
//! - `retry` optionally wraps the fetch callback with deadlines and backoff.

use super::fetch::{fetch_fn, FetchPackage};
use super::lifecycle::{LifecycleSpawnParams, RunLifecycle};
use super::result::RunResult;
use super::retry::{RetryingFetch, TimeoutFetch};
use super::state::PackageStates;
use super::worker_pool::{WorkerPool, WorkerPoolParams};
use crate::runtime::config::RunnerConfig;
use crate::runtime::progress::{NoopProgress, ProgressSink};
use crate::runtime::telemetry::Telemetry;
use anyhow::{Context, Result};
use std::future::Future;
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;

pub struct PackageRunner {
    items: Vec<String>,
    fetcher: Arc<dyn FetchPackage>,
    config: RunnerConfig,
    progress: Arc<dyn ProgressSink>,
    shutdown: CancellationToken,
    telemetry: Arc<Telemetry>,
}

impl PackageRunner {
    /// Creates a runner over `items` with the default configuration and no progress display.
    ///
    /// Items must be unique; the runner refuses to start otherwise.
    pub fn new(items: Vec<String>, fetcher: impl FetchPackage) -> Self {
        Self {
            items,
            fetcher: Arc::new(fetcher),
            config: RunnerConfig::default(),
            progress: Arc::new(NoopProgress),
            shutdown: CancellationToken::new(),
            telemetry: Arc::new(Telemetry::default()),
        }
    }

    /// Same as [`Self::new`] with an async closure as the fetch callback.
    pub fn from_fn<F, Fut>(items: Vec<String>, f: F) -> Self
    where
        F: Fn(String) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<()>> + Send + 'static,
    {
        Self::new(items, fetch_fn(f))
    }

    pub fn with_config(mut self, config: RunnerConfig) -> Self {
        self.config = config;
        self
    }

    pub fn with_progress(mut self, progress: Arc<dyn ProgressSink>) -> Self {
        self.progress = progress;
        self
    }

    /// Replaces the run's cancellation token so an existing shutdown mechanism can stop it.
    pub fn with_cancellation_token(mut self, token: CancellationToken) -> Self {
        self.shutdown = token;
        self
    }

    pub fn with_telemetry(mut self, telemetry: Arc<Telemetry>) -> Self {
        self.telemetry = telemetry;
        self
    }

    /// Returns a clone of the run's cancellation token. Cancelling it stops new claims;
    /// callbacks already running are allowed to finish.
    pub fn cancellation_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    pub fn telemetry(&self) -> Arc<Telemetry> {
        Arc::clone(&self.telemetry)
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    /// Fetches every item at most once and returns once no callback is running.
    ///
    /// Per-item failures are reported in the returned [`RunResult`]. An `Err` means the run
    /// could not be set up (duplicate items, invalid configuration, progress display failure)
    /// or the pool itself broke; in the setup cases no callback has been invoked.
    pub async fn run(self) -> Result<RunResult> {
        let Self {
            items,
            fetcher,
            config,
            progress,
            shutdown,
            telemetry,
        } = self;

        if items.is_empty() {
            tracing::debug!("no packages to fetch");
            return Ok(RunResult::empty());
        }

        config.validate()?;
        let states = Arc::new(PackageStates::new(items)?);
        let total = states.total();

        progress
            .start(total)
            .context("failed to initialize progress display")?;

        let fetcher = wrap_fetcher(fetcher, &config, &telemetry, &shutdown);
        let changed = Arc::new(Notify::new());
        let started_at = Instant::now();

        let lifecycle = RunLifecycle::spawn(LifecycleSpawnParams {
            states: Arc::clone(&states),
            sink: Arc::clone(&progress),
            changed: Arc::clone(&changed),
            render_interval: config.render_interval(),
        });

        let mut pool = WorkerPool::new(WorkerPoolParams {
            max_workers: config.concurrency(),
            fetcher,
            states: Arc::clone(&states),
            telemetry: Arc::clone(&telemetry),
            changed,
        });
        tracing::info!(
            total,
            workers = pool.max_workers(),
            retry_attempts = config.retry().max_attempts,
            "starting package run"
        );
        pool.launch(shutdown.clone());
        let joined = pool.join().await;

        lifecycle.shutdown().await;
        let final_view = states.snapshot();
        if let Err(err) = progress.finish(&final_view) {
            tracing::warn!(error = %err, "failed to finalize progress display");
        }
        joined?;

        let cancelled = shutdown.is_cancelled() && final_view.pending > 0;
        let result = states.drain_result(cancelled, started_at.elapsed());
        let counters = telemetry.snapshot();
        tracing::info!(
            total = result.total,
            succeeded = result.succeeded,
            failed = result.failed,
            pending = result.pending,
            cancelled = result.cancelled,
            retries = counters.retries,
            timeouts = counters.timeouts,
            panics = counters.panics,
            elapsed_ms = result.elapsed.as_millis().min(u128::from(u64::MAX)) as u64,
            "package run finished"
        );

        Ok(result)
    }
}

/// Applies the per-attempt deadline first, then retries around it, so every retry gets a
/// fresh deadline.
fn wrap_fetcher(
    fetcher: Arc<dyn FetchPackage>,
    config: &RunnerConfig,
    telemetry: &Arc<Telemetry>,
    shutdown: &CancellationToken,
) -> Arc<dyn FetchPackage> {
    let fetcher = match config.item_timeout() {
        Some(limit) => Arc::new(
            TimeoutFetch::new(fetcher, limit).with_telemetry(Arc::clone(telemetry)),
        ) as Arc<dyn FetchPackage>,
        None => fetcher,
    };

    if !config.retry().is_enabled() {
        return fetcher;
    }

    Arc::new(
        RetryingFetch::new(fetcher, config.retry())
            .with_telemetry(Arc::clone(telemetry))
            .with_cancellation(shutdown.clone()),
    )
}
