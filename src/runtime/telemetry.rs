use crate::packages::state::PackageStates;
use crate::runtime::progress::{ProgressSink, ProgressView};
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, OnceLock};
use std::time::Duration;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio::{select, time};
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;

/// Default interval at which the progress renderer re-samples the state table.
pub const DEFAULT_RENDER_INTERVAL: Duration = Duration::from_millis(250);

static TRACING_INIT: OnceLock<()> = OnceLock::new();

/// Installs a basic tracing subscriber (if one is not already active).
///
/// The subscriber honours `RUST_LOG` if it is present, otherwise it falls back to `info`.
/// Calling this function multiple times is harmless.
pub fn init_tracing() {
    init_tracing_with_default("info");
}

/// Same as [`init_tracing`] but with a caller-chosen fallback directive.
pub fn init_tracing_with_default(directive: &str) {
    if TRACING_INIT.get().is_some() {
        return;
    }

    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(directive));

    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_writer(std::io::stderr)
        .try_init();

    let _ = TRACING_INIT.set(());
}

/// Counters describing how fetch callbacks behaved during a run.
#[derive(Default, Debug)]
pub struct Telemetry {
    claimed: AtomicU64,
    retries: AtomicU64,
    timeouts: AtomicU64,
    panics: AtomicU64,
}

impl Telemetry {
    pub fn record_claim(&self) {
        self.claimed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_retry(&self) {
        self.retries.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_timeout(&self) {
        self.timeouts.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_panic(&self) {
        self.panics.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> TelemetrySnapshot {
        TelemetrySnapshot {
            claimed: self.claimed.load(Ordering::Relaxed),
            retries: self.retries.load(Ordering::Relaxed),
            timeouts: self.timeouts.load(Ordering::Relaxed),
            panics: self.panics.load(Ordering::Relaxed),
        }
    }
}

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct TelemetrySnapshot {
    pub claimed: u64,
    pub retries: u64,
    pub timeouts: u64,
    pub panics: u64,
}

/// Spawns the task that keeps a [`ProgressSink`] up to date.
///
/// The task re-renders whenever a worker signals `changed` and on every `interval` tick,
/// skipping views identical to the last one it drew. Sink errors and panics are logged and
/// swallowed; the task only stops when `shutdown` is cancelled.
pub fn spawn_progress_renderer(
    states: Arc<PackageStates>,
    sink: Arc<dyn ProgressSink>,
    changed: Arc<Notify>,
    shutdown: CancellationToken,
    interval: Duration,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = time::interval(interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut last_view: Option<ProgressView> = None;

        loop {
            select! {
                _ = shutdown.cancelled() => {
                    tracing::debug!(target: "wsm::progress", "progress renderer shutting down");
                    break;
                }
                _ = changed.notified() => {}
                _ = ticker.tick() => {}
            }

            let view = states.snapshot();
            if last_view.as_ref() == Some(&view) {
                continue;
            }

            render(sink.as_ref(), &view);
            last_view = Some(view);
        }
    })
}

fn render(sink: &dyn ProgressSink, view: &ProgressView) {
    match catch_unwind(AssertUnwindSafe(|| sink.update(view))) {
        Ok(Ok(())) => {}
        Ok(Err(err)) => {
            tracing::warn!(target: "wsm::progress", error = %err, "failed to render progress");
        }
        Err(_) => {
            tracing::warn!(target: "wsm::progress", "progress sink panicked while rendering");
        }
    }
}
