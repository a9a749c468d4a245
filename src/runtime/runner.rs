use crate::packages::result::RunResult;
use crate::packages::runner::PackageRunner;
use anyhow::Result;
use tokio::signal;
use tokio_util::sync::CancellationToken;

/// Drives a [`PackageRunner`] and turns OS interrupts into a cooperative cancellation.
pub struct Runner {
    packages: PackageRunner,
    shutdown: CancellationToken,
}

impl Runner {
    /// Wires a root [`CancellationToken`] into the package run.
    pub fn new(packages: PackageRunner) -> Self {
        let shutdown = CancellationToken::new();
        Self::with_cancellation_token(packages, shutdown)
    }

    pub fn with_cancellation_token(packages: PackageRunner, shutdown: CancellationToken) -> Self {
        let packages = packages.with_cancellation_token(shutdown.clone());
        Self { packages, shutdown }
    }

    /// Returns a clone of the root shutdown token so external callers can integrate
    /// with their own signal handlers or cancellation strategies.
    pub fn cancellation_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    /// Runs to completion without listening for signals.
    pub async fn run(self) -> Result<RunResult> {
        self.packages.run().await
    }

    /// Runs until every package is processed or a Ctrl-C (SIGINT) arrives.
    ///
    /// After an interrupt no further package is started; packages already being fetched are
    /// awaited and the partial result is returned with `cancelled` set.
    pub async fn run_until_ctrl_c(self) -> Result<RunResult> {
        let Self { packages, shutdown } = self;

        let listener_token = shutdown.clone();
        let listener = tokio::spawn(async move {
            tokio::select! {
                outcome = signal::ctrl_c() => match outcome {
                    Ok(()) => {
                        tracing::info!(
                            "Ctrl-C received; finishing in-flight packages before exiting"
                        );
                        listener_token.cancel();
                    }
                    Err(err) => {
                        tracing::warn!(error = %err, "failed to listen for Ctrl-C");
                    }
                },
                _ = listener_token.cancelled() => {}
            }
        });

        let outcome = packages.run().await;
        listener.abort();

        if let Ok(result) = &outcome {
            if result.cancelled {
                tracing::warn!(
                    pending = result.pending,
                    completed = result.completed(),
                    "package run cancelled before every package was fetched"
                );
            }
        }
        outcome
    }
}
