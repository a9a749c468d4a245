use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::support::helpers::{
    init_tracing, item_names, names, RecordingFetcher, RecordingProgress, RegistryUnavailable,
};
use anyhow::Result;
use tokio::time::{sleep, timeout};
use wsm::{PackageRunner, RunnerConfig, Runner};

fn pseudo_random_delay(item: &str) -> Duration {
    let seed = item
        .bytes()
        .fold(17u64, |acc, byte| acc.wrapping_mul(31).wrapping_add(u64::from(byte)));
    Duration::from_millis(5 + seed % 21)
}

fn config(concurrency: usize) -> Result<RunnerConfig> {
    RunnerConfig::builder()
        .concurrency(concurrency)
        .render_interval(Duration::from_millis(10))
        .build()
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn failures_keep_their_original_error() -> Result<()> {
    init_tracing();
    let fetcher = Arc::new(RecordingFetcher::instant().failing_on(&["b"]));

    let result = PackageRunner::new(names(&["a", "b", "c"]), fetcher.clone())
        .with_config(config(2)?)
        .run()
        .await?;

    assert_eq!(result.total, 3);
    assert_eq!(result.succeeded, 2);
    assert_eq!(result.failed, 1);
    assert_eq!(result.pending, 0);
    assert!(!result.cancelled);
    assert!(!result.is_success());
    assert_eq!(result.failed_items().collect::<Vec<_>>(), vec!["b"]);

    let error = result.failure("b").expect("b should be recorded as failed");
    assert_eq!(
        error.downcast_ref::<RegistryUnavailable>(),
        Some(&RegistryUnavailable("b".into()))
    );
    assert!(result.failure("a").is_none());
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn callback_panic_before_future_keeps_other_results() -> Result<()> {
    init_tracing();
    let items = names(&["ok1", "boom", "ok2", "ok3"]);

    let result = PackageRunner::from_fn(items, |item| {
        if item == "boom" {
            panic!("malformed reference {item}");
        }
        async { anyhow::Ok(()) }
    })
    .with_config(config(2)?)
    .run()
    .await?;

    assert_eq!(result.succeeded, 3);
    assert_eq!(result.failed, 1);
    assert_eq!(result.failed_items().collect::<Vec<_>>(), vec!["boom"]);
    let error = result.failure("boom").expect("boom should be recorded as failed");
    assert_eq!(error.to_string(), "fetch panicked: malformed reference boom");
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn each_item_is_fetched_exactly_once_for_any_pool_size() -> Result<()> {
    init_tracing();
    let items = item_names(25);

    for concurrency in [1, 2, 3, 8, 64] {
        let fetcher = Arc::new(RecordingFetcher::new(|_| Duration::from_millis(1)));
        let result = PackageRunner::new(items.clone(), fetcher.clone())
            .with_config(config(concurrency)?)
            .run()
            .await?;

        assert!(result.is_success(), "pool of {concurrency}: {result}");
        assert_eq!(result.succeeded + result.failed, items.len());

        let calls = fetcher.calls();
        assert_eq!(calls.len(), items.len());
        assert!(
            calls.values().all(|&count| count == 1),
            "pool of {concurrency} fetched an item twice: {calls:?}"
        );
        assert!(
            fetcher.peak_in_flight() <= concurrency,
            "pool of {concurrency} ran {} fetches at once",
            fetcher.peak_in_flight()
        );
    }
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn hundred_items_finish_well_below_serial_time() -> Result<()> {
    init_tracing();
    let items = item_names(100);
    let serial: Duration = items.iter().map(|item| pseudo_random_delay(item)).sum();
    let fetcher = Arc::new(RecordingFetcher::new(pseudo_random_delay));

    let started = Instant::now();
    let result = PackageRunner::new(items, fetcher.clone())
        .with_config(config(4)?)
        .run()
        .await?;
    let elapsed = started.elapsed();

    assert!(result.is_success());
    assert_eq!(result.succeeded, 100);
    assert!(fetcher.peak_in_flight() > 1, "fetches never overlapped");
    assert!(
        elapsed < serial / 2,
        "parallel run took {elapsed:?}, serial sum is {serial:?}"
    );
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn cancellation_stops_new_claims_and_drains_in_flight() -> Result<()> {
    init_tracing();
    let items = item_names(40);
    let fetcher = Arc::new(RecordingFetcher::new(|_| Duration::from_millis(20)));
    let runner = PackageRunner::new(items.clone(), fetcher.clone()).with_config(config(2)?);
    let token = runner.cancellation_token();

    let handle = tokio::spawn(runner.run());
    sleep(Duration::from_millis(50)).await;
    token.cancel();

    let result = timeout(Duration::from_secs(5), handle)
        .await
        .expect("run should stop promptly after cancellation")??;

    assert!(result.cancelled);
    assert!(result.pending > 0);
    assert!(result.succeeded > 0);
    assert_eq!(result.succeeded + result.failed + result.pending, items.len());
    assert_eq!(fetcher.total_calls(), result.completed());
    assert!(!result.is_success());
    Ok(())
}

#[tokio::test]
async fn run_cancelled_before_start_fetches_nothing() -> Result<()> {
    init_tracing();
    let fetcher = Arc::new(RecordingFetcher::instant());
    let runner = PackageRunner::new(item_names(5), fetcher.clone());
    runner.cancellation_token().cancel();

    let result = runner.run().await?;
    assert!(result.cancelled);
    assert_eq!(result.pending, 5);
    assert_eq!(result.completed(), 0);
    assert_eq!(fetcher.total_calls(), 0);
    Ok(())
}

#[tokio::test]
async fn empty_list_returns_immediately() -> Result<()> {
    init_tracing();
    let fetcher = Arc::new(RecordingFetcher::instant());
    let progress = Arc::new(RecordingProgress::default());

    let result = PackageRunner::new(Vec::new(), fetcher.clone())
        .with_progress(progress.clone())
        .run()
        .await?;

    assert_eq!(result.total, 0);
    assert_eq!(result.succeeded + result.failed, 0);
    assert!(result.is_success());
    assert_eq!(fetcher.total_calls(), 0);
    assert_eq!(progress.started(), None);
    assert!(progress.updates().is_empty());
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn progress_sees_consistent_views() -> Result<()> {
    init_tracing();
    let items = item_names(12);
    let fetcher = Arc::new(
        RecordingFetcher::new(|_| Duration::from_millis(15))
            .failing_on(&["registry.local/app-3:1.0"]),
    );
    let progress = Arc::new(RecordingProgress::default());

    let result = PackageRunner::new(items.clone(), fetcher)
        .with_config(config(3)?)
        .with_progress(progress.clone())
        .run()
        .await?;

    assert_eq!(result.failed, 1);
    assert_eq!(progress.started(), Some(items.len()));

    let updates = progress.updates();
    assert!(!updates.is_empty(), "renderer never drew a frame");
    for view in &updates {
        assert_eq!(view.total, items.len());
        assert_eq!(
            view.pending + view.running + view.succeeded + view.failed,
            view.total
        );
        assert_eq!(view.running, view.in_flight.len());
        assert!(view.running <= 3);
    }
    assert!(updates.iter().any(|view| view.running > 0));

    let finished = progress.finished().expect("finish should be called");
    assert!(finished.is_finished());
    assert_eq!(finished.succeeded, 11);
    assert_eq!(finished.failed, 1);
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn runner_returns_full_result_without_interrupt() -> Result<()> {
    init_tracing();
    let fetcher = Arc::new(RecordingFetcher::instant());
    let packages = PackageRunner::new(item_names(6), fetcher.clone()).with_config(config(2)?);

    let result = Runner::new(packages).run_until_ctrl_c().await?;

    assert!(result.is_success());
    assert_eq!(result.succeeded, 6);
    assert_eq!(fetcher.total_calls(), 6);
    Ok(())
}
