//! Worker pool orchestration for `PackageRunner`.
//!
//! This module owns worker creation, the claim/fetch/record loop each worker
//! runs, panic capture around fetch callbacks, and joining the pool.

use crate::packages::fetch::FetchPackage;
use crate::packages::state::{Claim, PackageStates};
use crate::runtime::telemetry::Telemetry;
use anyhow::{anyhow, Context, Result};
use futures::future::join_all;
use futures::FutureExt;
use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

pub(crate) struct WorkerPool {
    max_workers: usize,
    fetcher: Arc<dyn FetchPackage>,
    states: Arc<PackageStates>,
    telemetry: Arc<Telemetry>,
    changed: Arc<Notify>,
    workers: Vec<JoinHandle<Result<usize>>>,
}

pub(crate) struct WorkerPoolParams {
    pub max_workers: usize,
    pub fetcher: Arc<dyn FetchPackage>,
    pub states: Arc<PackageStates>,
    pub telemetry: Arc<Telemetry>,
    pub changed: Arc<Notify>,
}

impl WorkerPool {
    /// Sizes the pool to `min(max_workers, items)`; an empty item list gets no workers.
    pub(crate) fn new(params: WorkerPoolParams) -> Self {
        let max_workers = params.max_workers.max(1).min(params.states.total());
        Self {
            max_workers,
            fetcher: params.fetcher,
            states: params.states,
            telemetry: params.telemetry,
            changed: params.changed,
            workers: Vec::new(),
        }
    }

    pub(crate) fn max_workers(&self) -> usize {
        self.max_workers
    }

    pub(crate) fn launch(&mut self, run_token: CancellationToken) {
        self.workers.clear();

        for worker_id in 0..self.max_workers {
            let worker = Worker {
                id: worker_id,
                fetcher: Arc::clone(&self.fetcher),
                states: Arc::clone(&self.states),
                telemetry: Arc::clone(&self.telemetry),
                changed: Arc::clone(&self.changed),
                shutdown: run_token.clone(),
            };
            self.workers.push(tokio::spawn(worker.run()));
        }
    }

    /// Waits for every worker to exit. A worker that failed outside of a fetch callback is a
    /// bug in the pool itself and is reported as an error after all workers have stopped.
    pub(crate) async fn join(&mut self) -> Result<()> {
        let handles = std::mem::take(&mut self.workers);
        let mut first_error = None;

        for (worker_id, outcome) in join_all(handles).await.into_iter().enumerate() {
            let outcome = outcome
                .with_context(|| format!("worker {worker_id} task failed"))
                .and_then(|inner| {
                    inner.with_context(|| format!("worker {worker_id} exited with error"))
                });

            match outcome {
                Ok(processed) => {
                    tracing::debug!(worker = worker_id, processed, "worker finished");
                }
                Err(err) => {
                    tracing::error!(worker = worker_id, error = %err, "worker exited abnormally");
                    first_error.get_or_insert(err);
                }
            }
        }

        match first_error {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }
}

struct Worker {
    id: usize,
    fetcher: Arc<dyn FetchPackage>,
    states: Arc<PackageStates>,
    telemetry: Arc<Telemetry>,
    changed: Arc<Notify>,
    shutdown: CancellationToken,
}

impl Worker {
    #[tracing::instrument(name = "worker", skip_all, fields(worker = self.id))]
    async fn run(self) -> Result<usize> {
        let mut processed = 0usize;

        loop {
            if self.shutdown.is_cancelled() {
                tracing::info!(
                    worker = self.id,
                    "cancellation requested; claiming no more packages"
                );
                break;
            }

            let Some(claim) = self.states.claim(self.id) else {
                break;
            };
            self.telemetry.record_claim();
            self.changed.notify_one();

            let outcome = self.fetch(&claim).await;
            self.states.finish(claim.index, outcome)?;
            self.changed.notify_one();
            processed += 1;
        }

        Ok(processed)
    }

    async fn fetch(&self, claim: &Claim) -> Result<()> {
        tracing::debug!(worker = self.id, item = %claim.item, "fetching package");

        // Call inside the guard: a callback may panic before returning its future.
        let guarded = AssertUnwindSafe(async { self.fetcher.fetch(&claim.item).await });
        let outcome = match guarded.catch_unwind().await {
            Ok(outcome) => outcome,
            Err(panic_payload) => {
                self.telemetry.record_panic();
                let panic_msg = panic_message(panic_payload.as_ref());
                tracing::error!(
                    worker = self.id,
                    item = %claim.item,
                    panic = %panic_msg,
                    "fetch callback panicked"
                );
                Err(anyhow!("fetch panicked: {panic_msg}"))
            }
        };

        match &outcome {
            Ok(()) => tracing::info!(worker = self.id, item = %claim.item, "package fetched"),
            Err(err) => tracing::warn!(
                worker = self.id,
                item = %claim.item,
                error = %err,
                "package fetch failed"
            ),
        }
        outcome
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(message) = panic.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = panic.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic payload".to_string()
    }
}
