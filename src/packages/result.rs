use anyhow::Error as AnyError;
use std::fmt;
use std::time::Duration;

/// A package whose fetch returned an error, with the error kept exactly as returned.
#[derive(Debug)]
pub struct ItemFailure {
    pub item: String,
    pub error: AnyError,
}

/// Aggregate outcome of a package run.
///
/// `succeeded + failed + pending == total`. `pending` is only non-zero when the run was
/// cancelled before every item was claimed.
#[derive(Debug)]
pub struct RunResult {
    pub total: usize,
    pub succeeded: usize,
    pub failed: usize,
    pub pending: usize,
    pub cancelled: bool,
    pub elapsed: Duration,
    /// Failed items in submission order.
    pub failures: Vec<ItemFailure>,
}

impl RunResult {
    pub fn empty() -> Self {
        Self {
            total: 0,
            succeeded: 0,
            failed: 0,
            pending: 0,
            cancelled: false,
            elapsed: Duration::ZERO,
            failures: Vec::new(),
        }
    }

    /// `true` when every item was processed and none failed.
    pub fn is_success(&self) -> bool {
        !self.cancelled && self.failed == 0 && self.pending == 0
    }

    pub fn completed(&self) -> usize {
        self.succeeded + self.failed
    }

    pub fn failure(&self, item: &str) -> Option<&AnyError> {
        self.failures
            .iter()
            .find(|failure| failure.item == item)
            .map(|failure| &failure.error)
    }

    pub fn failed_items(&self) -> impl Iterator<Item = &str> {
        self.failures.iter().map(|failure| failure.item.as_str())
    }
}

impl fmt::Display for RunResult {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} succeeded, {} failed", self.succeeded, self.failed)?;
        if self.cancelled {
            write!(f, ", {} not started (cancelled)", self.pending)?;
        }
        write!(f, " of {} in {:.2}s", self.total, self.elapsed.as_secs_f64())
    }
}
