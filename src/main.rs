use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use std::io::IsTerminal;
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;
use wsm::bundle::channel::{
    ChannelSource, FileChannel, FixedRelease, GithubReleases, HttpChannel, ReleaseSource,
    DEFAULT_CHANNEL_URL,
};
use wsm::bundle::charts::HelmCli;
use wsm::bundle::configmap::KubectlConfigMap;
use wsm::bundle::downloader::DEFAULT_PLATFORM;
use wsm::bundle::layout::{BundleLayout, DEFAULT_BUNDLE_DIR};
use wsm::runtime::config::DEFAULT_CONCURRENCY;
use wsm::runtime::telemetry::init_tracing_with_default;
use wsm::{
    BundleAssembler, BundleError, LogProgress, NoopProgress, ProgressSink,
    RetryPolicy, RunResult, RunnerConfig, TerminalProgress,
};

#[derive(Parser)]
#[command(name = "wsm", version, about = "W&B offline bundle manager")]
struct Cli {
    #[command(subcommand)]
    cmd: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Download the W&B charts and every container image they reference into a bundle
    Download(DownloadArgs),
}

#[derive(Args, Debug)]
struct DownloadArgs {
    /// Platform to download images for
    #[arg(short, long, env = "WSM_PLATFORM", default_value = DEFAULT_PLATFORM)]
    platform: String,

    /// Number of images downloaded at the same time
    #[arg(long, env = "WSM_CONCURRENCY", default_value_t = DEFAULT_CONCURRENCY)]
    concurrency: usize,

    /// Attempts per image, including the first one (at least 1)
    #[arg(
        long,
        env = "WSM_ATTEMPTS",
        default_value_t = 1,
        value_parser = clap::value_parser!(u32).range(1..)
    )]
    attempts: u32,

    /// Give up on a single image download after this many seconds
    #[arg(long, env = "WSM_TIMEOUT")]
    timeout: Option<u64>,

    /// Directory the bundle is written to (removed first)
    #[arg(long, env = "WSM_BUNDLE_DIR", default_value = DEFAULT_BUNDLE_DIR)]
    bundle_dir: PathBuf,

    /// Read the channel spec from a file instead of the deployer API
    #[arg(long, env = "WSM_CHANNEL_FILE")]
    channel_file: Option<PathBuf>,

    /// Deployer channel endpoint
    #[arg(long, env = "WSM_CHANNEL_URL", default_value = DEFAULT_CHANNEL_URL)]
    channel_url: String,

    /// Use this operator controller tag instead of looking up the latest release
    #[arg(long, env = "WSM_OPERATOR_TAG")]
    operator_tag: Option<String>,

    /// Do not record resolved chart versions in the wandb-charts ConfigMap
    #[arg(long, env = "WSM_NO_CACHE")]
    no_cache: bool,

    /// Disable the progress display
    #[arg(short, long, env = "WSM_QUIET")]
    quiet: bool,
}

/// How run progress is reported on stderr.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ProgressMode {
    Quiet,
    Bar,
    Log,
}

impl ProgressMode {
    /// Fallback log filter when `RUST_LOG` is unset; warnings only while the live bar is drawn.
    fn log_directive(self) -> &'static str {
        match self {
            ProgressMode::Bar => "warn",
            ProgressMode::Quiet | ProgressMode::Log => "info",
        }
    }

    fn progress(self) -> Arc<dyn ProgressSink> {
        match self {
            ProgressMode::Quiet => Arc::new(NoopProgress),
            ProgressMode::Bar => Arc::new(TerminalProgress::new()),
            ProgressMode::Log => Arc::new(LogProgress),
        }
    }
}

impl DownloadArgs {
    fn runner_config(&self) -> Result<RunnerConfig> {
        let mut builder = RunnerConfig::builder()
            .concurrency(self.concurrency)
            .retry(RetryPolicy::exponential(self.attempts as usize));
        if let Some(secs) = self.timeout {
            builder = builder.item_timeout(Duration::from_secs(secs));
        }
        builder.build().context("invalid download options")
    }

    fn progress_mode(&self) -> ProgressMode {
        if self.quiet {
            ProgressMode::Quiet
        } else if std::io::stderr().is_terminal() {
            ProgressMode::Bar
        } else {
            ProgressMode::Log
        }
    }

    fn channel(&self) -> Result<Arc<dyn ChannelSource>> {
        let channel: Arc<dyn ChannelSource> = match &self.channel_file {
            Some(path) => Arc::new(FileChannel::new(path.clone())),
            None => Arc::new(HttpChannel::new(self.channel_url.clone())?),
        };
        Ok(channel)
    }

    fn releases(&self) -> Result<Arc<dyn ReleaseSource>> {
        let releases: Arc<dyn ReleaseSource> = match &self.operator_tag {
            Some(tag) => Arc::new(FixedRelease(tag.clone())),
            None => Arc::new(
                GithubReleases::new()?.with_token(std::env::var("GITHUB_TOKEN").ok()),
            ),
        };
        Ok(releases)
    }
}

#[tokio::main(flavor = "multi_thread")]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    let outcome = match cli.cmd {
        Command::Download(args) => {
            let mode = args.progress_mode();
            init_tracing_with_default(mode.log_directive());
            download(args, mode).await
        }
    };

    match outcome {
        Ok(result) => {
            println!(
                "Downloaded {} images in {:.1}s.",
                result.succeeded,
                result.elapsed.as_secs_f64()
            );
            ExitCode::SUCCESS
        }
        Err(err) => {
            match err.downcast_ref::<BundleError>() {
                Some(BundleError::NoImages) => println!("No images to download."),
                Some(
                    error @ (BundleError::FailedImages { .. } | BundleError::Cancelled { .. }),
                ) => eprintln!("{error}"),
                _ => eprintln!("error: {err:#}"),
            }
            ExitCode::FAILURE
        }
    }
}

async fn download(args: DownloadArgs, mode: ProgressMode) -> Result<RunResult> {
    let charts = Arc::new(HelmCli::default());
    let mut assembler = BundleAssembler::new(args.releases()?, args.channel()?, charts)
        .with_layout(BundleLayout::new(args.bundle_dir.clone()))
        .with_platform(args.platform.clone())
        .with_config(args.runner_config()?)
        .with_progress(mode.progress())
        .handle_interrupts(true);
    if !args.no_cache {
        assembler = assembler.with_cache(Arc::new(KubectlConfigMap::default()));
    }

    let report = assembler.assemble().await?;
    if report.result.failed > 0 {
        println!(
            "{} of {} images failed to download:",
            report.result.failed, report.result.total
        );
        for failure in &report.result.failures {
            println!("  {}: {:#}", failure.item, failure.error);
        }
    }
    tracing::info!(
        tag = %report.operator_tag,
        spec = %report.spec_path.display(),
        summary = %report.result,
        "bundle assembled"
    );
    report.into_outcome()
}
