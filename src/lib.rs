pub mod bundle;
pub mod packages;
pub mod runtime;

pub use bundle::assembler::{BundleAssembler, BundleReport};
pub use bundle::error::BundleError;
pub use packages::fetch::{fetch_fn, FetchPackage, PackageFuture};
pub use packages::result::{ItemFailure, RunResult};
pub use packages::retry::{ItemTimeout, RetryPolicy, RetryingFetch, TimeoutFetch};
pub use packages::runner::PackageRunner;
pub use packages::state::{ItemState, ItemStatus};
pub use runtime::config::{RunnerConfig, RunnerConfigBuilder, RunnerConfigParams};
pub use runtime::progress::{
    LogProgress, NoopProgress, ProgressSink, ProgressView, TerminalProgress,
};
pub use runtime::runner::Runner;
pub use runtime::telemetry::{init_tracing, Telemetry, TelemetrySnapshot};
