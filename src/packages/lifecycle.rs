//! Run-scoped background tasks for `PackageRunner`.

use crate::packages::state::PackageStates;
use crate::runtime::progress::ProgressSink;
use crate::runtime::telemetry;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// Owns the progress renderer for the duration of a run.
///
/// The renderer listens on its own token rather than the run token, so a cancelled run keeps
/// refreshing the display while in-flight items finish.
pub(crate) struct RunLifecycle {
    render_token: CancellationToken,
    renderer_handle: Option<JoinHandle<()>>,
}

pub(crate) struct LifecycleSpawnParams {
    pub states: Arc<PackageStates>,
    pub sink: Arc<dyn ProgressSink>,
    pub changed: Arc<Notify>,
    pub render_interval: Duration,
}

impl RunLifecycle {
    pub(crate) fn spawn(params: LifecycleSpawnParams) -> Self {
        let LifecycleSpawnParams {
            states,
            sink,
            changed,
            render_interval,
        } = params;

        let render_token = CancellationToken::new();
        let renderer_handle = telemetry::spawn_progress_renderer(
            states,
            sink,
            changed,
            render_token.clone(),
            render_interval,
        );

        Self {
            render_token,
            renderer_handle: Some(renderer_handle),
        }
    }

    pub(crate) async fn shutdown(mut self) {
        self.render_token.cancel();

        if let Some(handle) = self.renderer_handle.take() {
            if let Err(err) = handle.await {
                tracing::warn!(error = %err, "progress renderer task panicked");
            }
        }
    }
}

impl Drop for RunLifecycle {
    fn drop(&mut self) {
        self.render_token.cancel();
    }
}
