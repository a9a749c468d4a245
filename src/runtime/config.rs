use crate::packages::retry::RetryPolicy;
use crate::runtime::telemetry;
use anyhow::{bail, Result};
use std::time::Duration;

/// Image pulls are bandwidth bound; a handful of parallel pulls saturates most links.
pub const DEFAULT_CONCURRENCY: usize = 4;

/// Runtime configuration for the package runner.
///
/// All instances must be constructed via [`RunnerConfig::builder`] or [`RunnerConfig::new`]
/// so invariants are validated before any consumer observes the values.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunnerConfig {
    concurrency: usize,
    render_interval: Duration,
    retry: RetryPolicy,
    item_timeout: Option<Duration>,
}

pub struct RunnerConfigParams {
    pub concurrency: usize,
    pub render_interval: Duration,
    pub retry: RetryPolicy,
    pub item_timeout: Option<Duration>,
}

impl Default for RunnerConfig {
    fn default() -> Self {
        Self {
            concurrency: DEFAULT_CONCURRENCY,
            render_interval: telemetry::DEFAULT_RENDER_INTERVAL,
            retry: RetryPolicy::none(),
            item_timeout: None,
        }
    }
}

impl RunnerConfig {
    /// Returns a builder to incrementally construct and validate a configuration.
    pub fn builder() -> RunnerConfigBuilder {
        RunnerConfigBuilder::default()
    }

    /// Constructs a configuration directly from the provided values.
    pub fn new(params: RunnerConfigParams) -> Result<Self> {
        let RunnerConfigParams {
            concurrency,
            render_interval,
            retry,
            item_timeout,
        } = params;

        let config = Self {
            concurrency,
            render_interval,
            retry,
            item_timeout,
        };

        config.validate()?;
        Ok(config)
    }

    /// Maximum number of fetch callbacks running at the same time.
    pub fn concurrency(&self) -> usize {
        self.concurrency
    }

    /// Interval at which the progress display is refreshed even without state changes.
    pub fn render_interval(&self) -> Duration {
        self.render_interval
    }

    /// Retry policy applied around the fetch callback. Disabled by default.
    pub fn retry(&self) -> RetryPolicy {
        self.retry
    }

    /// Deadline for a single fetch attempt. Unlimited by default.
    pub fn item_timeout(&self) -> Option<Duration> {
        self.item_timeout
    }

    /// Performs validation on an existing configuration instance.
    pub fn validate(&self) -> Result<()> {
        if self.concurrency == 0 {
            bail!("concurrency must be greater than 0");
        }

        if self.render_interval.is_zero() {
            bail!("render_interval must be greater than 0");
        }

        if self.retry.max_attempts == 0 {
            bail!("retry max_attempts must be greater than 0");
        }

        if self.retry.is_enabled() && self.retry.max_delay < self.retry.initial_delay {
            bail!("retry max_delay must not be shorter than initial_delay");
        }

        if matches!(self.item_timeout, Some(limit) if limit.is_zero()) {
            bail!("item_timeout must be greater than 0 when set");
        }

        Ok(())
    }
}

#[derive(Debug, Default, Clone)]
pub struct RunnerConfigBuilder {
    concurrency: Option<usize>,
    render_interval: Option<Duration>,
    retry: Option<RetryPolicy>,
    item_timeout: Option<Duration>,
}

impl RunnerConfigBuilder {
    pub fn concurrency(mut self, workers: usize) -> Self {
        self.concurrency = Some(workers);
        self
    }

    pub fn render_interval(mut self, interval: Duration) -> Self {
        self.render_interval = Some(interval);
        self
    }

    pub fn retry(mut self, policy: RetryPolicy) -> Self {
        self.retry = Some(policy);
        self
    }

    pub fn item_timeout(mut self, limit: Duration) -> Self {
        self.item_timeout = Some(limit);
        self
    }

    pub fn build(self) -> Result<RunnerConfig> {
        let params = RunnerConfigParams {
            concurrency: self.concurrency.unwrap_or(DEFAULT_CONCURRENCY),
            render_interval: self
                .render_interval
                .unwrap_or(telemetry::DEFAULT_RENDER_INTERVAL),
            retry: self.retry.unwrap_or_default(),
            item_timeout: self.item_timeout,
        };

        RunnerConfig::new(params)
    }
}
