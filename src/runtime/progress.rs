//! Display side of a package run.
//!
//! [`ProgressView`] is a derived projection of the state table; nothing in the
//! scheduler reads it back. Renderers implement [`ProgressSink`].

use anyhow::{Context, Result};
use indicatif::{ProgressBar, ProgressDrawTarget, ProgressStyle};
use std::time::Duration;

const MAX_LISTED_IN_FLIGHT: usize = 4;
const TERMINAL_TEMPLATE: &str =
    "{spinner:.green} [{elapsed_precise}] [{bar:40.cyan/blue}] {pos}/{len} images {msg}";

/// Snapshot of a run used purely for display.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ProgressView {
    pub total: usize,
    pub pending: usize,
    pub running: usize,
    pub succeeded: usize,
    pub failed: usize,
    /// Items currently held by a worker, in submission order.
    pub in_flight: Vec<String>,
}

impl ProgressView {
    pub fn completed(&self) -> usize {
        self.succeeded + self.failed
    }

    pub fn is_finished(&self) -> bool {
        self.pending == 0 && self.running == 0
    }

    fn in_flight_summary(&self) -> String {
        let mut listed = self
            .in_flight
            .iter()
            .take(MAX_LISTED_IN_FLIGHT)
            .map(String::as_str)
            .collect::<Vec<_>>()
            .join(", ");
        let hidden = self.in_flight.len().saturating_sub(MAX_LISTED_IN_FLIGHT);
        if hidden > 0 {
            listed.push_str(&format!(" (+{hidden} more)"));
        }
        listed
    }
}

/// Receives progress updates from a package run.
///
/// `start` is part of run setup: an error there aborts the run before any fetch begins.
/// Errors from `update` and `finish` are logged and otherwise ignored.
pub trait ProgressSink: Send + Sync {
    fn start(&self, _total: usize) -> Result<()> {
        Ok(())
    }

    fn update(&self, view: &ProgressView) -> Result<()>;

    fn finish(&self, _view: &ProgressView) -> Result<()> {
        Ok(())
    }
}

#[derive(Debug, Default, Clone, Copy)]
pub struct NoopProgress;

impl ProgressSink for NoopProgress {
    fn update(&self, _view: &ProgressView) -> Result<()> {
        Ok(())
    }
}

/// Emits one structured log line per update. Suited to CI logs and non-TTY output.
#[derive(Debug, Default, Clone, Copy)]
pub struct LogProgress;

impl ProgressSink for LogProgress {
    fn start(&self, total: usize) -> Result<()> {
        tracing::info!(target: "wsm::progress", total, "fetching packages");
        Ok(())
    }

    fn update(&self, view: &ProgressView) -> Result<()> {
        tracing::info!(
            target: "wsm::progress",
            total = view.total,
            pending = view.pending,
            running = view.running,
            succeeded = view.succeeded,
            failed = view.failed,
            in_flight = %view.in_flight_summary(),
            "package progress"
        );
        Ok(())
    }

    fn finish(&self, view: &ProgressView) -> Result<()> {
        tracing::info!(
            target: "wsm::progress",
            succeeded = view.succeeded,
            failed = view.failed,
            pending = view.pending,
            "package fetch finished"
        );
        Ok(())
    }
}

/// Interactive progress bar on stderr listing the images currently being fetched.
#[derive(Clone)]
pub struct TerminalProgress {
    bar: ProgressBar,
}

impl Default for TerminalProgress {
    fn default() -> Self {
        Self::new()
    }
}

impl TerminalProgress {
    pub fn new() -> Self {
        Self::with_draw_target(ProgressDrawTarget::stderr_with_hz(12))
    }

    pub fn with_draw_target(target: ProgressDrawTarget) -> Self {
        Self {
            bar: ProgressBar::with_draw_target(Some(0), target),
        }
    }

    pub fn bar(&self) -> &ProgressBar {
        &self.bar
    }
}

impl ProgressSink for TerminalProgress {
    fn start(&self, total: usize) -> Result<()> {
        let style = ProgressStyle::with_template(TERMINAL_TEMPLATE)
            .context("invalid progress bar template")?
            .progress_chars("=>-");
        self.bar.set_style(style);
        self.bar.set_length(total as u64);
        self.bar.set_position(0);
        self.bar.enable_steady_tick(Duration::from_millis(120));
        Ok(())
    }

    fn update(&self, view: &ProgressView) -> Result<()> {
        self.bar.set_position(view.completed() as u64);
        let mut message = view.in_flight_summary();
        if view.failed > 0 {
            message = format!("[{} failed] {message}", view.failed);
        }
        self.bar.set_message(message);
        Ok(())
    }

    fn finish(&self, view: &ProgressView) -> Result<()> {
        self.bar.set_position(view.completed() as u64);
        self.bar.finish_with_message(format!(
            "{} downloaded, {} failed",
            view.succeeded, view.failed
        ));
        Ok(())
    }
}
