//! Executor behaviour across realistic pipeline shapes.

use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio_util::sync::CancellationToken;

use stagehouse_core::error::StageError;
use stagehouse_core::pipeline::{GraphBuilder, PipelineExecutor, RunStatus, StageState};
use stagehouse_core::retry::{RetryPolicy, StagePolicy};
use stagehouse_core::stage::{EmptyStage, RunContext, Runnable, StageKind, StageReport};

type Timeline = Arc<Mutex<Vec<(String, DateTime<Utc>, DateTime<Utc>)>>>;

/// Records start/end times; optionally sleeps or fails.
struct Recorder {
    timeline: Timeline,
    sleep: Duration,
    fail_with: Option<fn() -> StageError>,
    calls: AtomicU32,
}

impl Recorder {
    fn ok(timeline: &Timeline) -> Arc<Self> {
        Arc::new(Self {
            timeline: timeline.clone(),
            sleep: Duration::from_millis(5),
            fail_with: None,
            calls: AtomicU32::new(0),
        })
    }

    fn failing(timeline: &Timeline, err: fn() -> StageError) -> Arc<Self> {
        Arc::new(Self {
            timeline: timeline.clone(),
            sleep: Duration::from_millis(1),
            fail_with: Some(err),
            calls: AtomicU32::new(0),
        })
    }

    fn slow(timeline: &Timeline, sleep: Duration) -> Arc<Self> {
        Arc::new(Self {
            timeline: timeline.clone(),
            sleep,
            fail_with: None,
            calls: AtomicU32::new(0),
        })
    }
}

#[async_trait]
impl Runnable for Recorder {
    fn kind(&self) -> StageKind {
        StageKind::Fetch
    }

    fn describe(&self) -> String {
        "recorder".into()
    }

    async fn execute(&self, ctx: &RunContext) -> Result<StageReport, StageError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let start = Utc::now();
        tokio::time::sleep(self.sleep).await;
        self.timeline
            .lock()
            .unwrap()
            .push((ctx.stage_id.clone(), start, Utc::now()));
        match self.fail_with {
            Some(make) => Err(make()),
            None => Ok(StageReport::new("done").with_bytes(1)),
        }
    }
}

fn logical_date() -> NaiveDate {
    NaiveDate::from_ymd_opt(2024, 6, 1).unwrap()
}

fn no_retry() -> StagePolicy {
    StagePolicy::new(RetryPolicy::none())
}

fn fetch_members(
    timeline: &Timeline,
    failing: &str,
) -> Vec<(String, Arc<dyn Runnable>, Option<StagePolicy>)> {
    (1..=7)
        .map(|i| {
            let name = format!("file_{i}");
            let stage: Arc<dyn Runnable> = if name == failing {
                Recorder::failing(timeline, || StageError::transfer("http://src/f5", 404, b"gone"))
            } else {
                Recorder::ok(timeline)
            };
            (name, stage, None)
        })
        .collect()
}

#[tokio::test]
async fn test_fan_out_failure_is_isolated() {
    let timeline: Timeline = Arc::default();
    let graph = GraphBuilder::new("etl_imdb")
        .default_policy(no_retry())
        .stage("start", Arc::new(EmptyStage))
        .group("fetch_data", fetch_members(&timeline, "file_5"))
        .stage("create_tables", Arc::new(EmptyStage))
        .stage("end", Arc::new(EmptyStage))
        .chain(&["start", "fetch_data", "create_tables", "end"])
        .build()
        .unwrap();

    let run = PipelineExecutor::new()
        .run(&graph, logical_date(), CancellationToken::new())
        .await;

    assert_eq!(run.status, RunStatus::Failed);
    assert_eq!(run.stage("fetch_data.file_5").unwrap().state, StageState::Failed);
    for i in [1, 2, 3, 4, 6, 7] {
        let id = format!("fetch_data.file_{i}");
        assert_eq!(run.stage(&id).unwrap().state, StageState::Succeeded, "{id}");
    }
    assert_eq!(run.stage("create_tables").unwrap().state, StageState::UpstreamFailed);
    assert_eq!(run.stage("end").unwrap().state, StageState::UpstreamFailed);
    assert_eq!(run.metrics.stages_succeeded, 7);
    assert_eq!(run.metrics.stages_failed, 1);

    let error = run.stage("fetch_data.file_5").unwrap().error.clone().unwrap();
    assert!(error.message.contains("404"));
    // a 404 is still a transfer error, retried only if the policy allows
    assert_eq!(run.stage("fetch_data.file_5").unwrap().attempts.len(), 1);
}

#[tokio::test]
async fn test_downstream_starts_after_all_upstreams_finish() {
    let timeline: Timeline = Arc::default();
    let graph = GraphBuilder::new("etl_imdb")
        .default_policy(no_retry())
        .group(
            "fetch_data",
            vec![
                ("a".to_string(), Recorder::slow(&timeline, Duration::from_millis(30)) as Arc<dyn Runnable>, None),
                ("b".to_string(), Recorder::slow(&timeline, Duration::from_millis(5)) as Arc<dyn Runnable>, None),
            ],
        )
        .stage("load", Recorder::ok(&timeline))
        .chain(&["fetch_data", "load"])
        .build()
        .unwrap();

    let run = PipelineExecutor::new()
        .run(&graph, logical_date(), CancellationToken::new())
        .await;
    assert_eq!(run.status, RunStatus::Succeeded);

    let events = timeline.lock().unwrap().clone();
    let end_of = |id: &str| events.iter().find(|e| e.0 == id).unwrap().2;
    let start_of = |id: &str| events.iter().find(|e| e.0 == id).unwrap().1;
    assert!(start_of("load") >= end_of("fetch_data.a"));
    assert!(start_of("load") >= end_of("fetch_data.b"));
    // fan-out members overlap
    assert!(start_of("fetch_data.b") < end_of("fetch_data.a"));
}

#[tokio::test(start_paused = true)]
async fn test_quality_failure_is_not_retried() {
    let timeline: Timeline = Arc::default();
    let gate = Recorder::failing(&timeline, || StageError::DataQuality {
        failures: vec![stagehouse_core::QualityFailure::new("imdb_title_basics", "not_empty", "0 rows")],
    });
    let graph = GraphBuilder::new("etl_imdb")
        .stage_with_policy(
            "data_quality",
            gate.clone(),
            StagePolicy::new(RetryPolicy::fixed(3, Duration::from_secs(300))),
        )
        .build()
        .unwrap();
    let run = PipelineExecutor::new()
        .run(&graph, logical_date(), CancellationToken::new())
        .await;
    assert_eq!(gate.calls.load(Ordering::SeqCst), 1);
    let stage = run.stage("data_quality").unwrap();
    assert_eq!(stage.error.as_ref().unwrap().failing_tables, vec!["imdb_title_basics"]);
}

#[tokio::test(start_paused = true)]
async fn test_execution_timeout_counts_as_retryable_attempt() {
    let timeline: Timeline = Arc::default();
    let slow = Recorder::slow(&timeline, Duration::from_secs(120));
    let graph = GraphBuilder::new("etl_imdb")
        .stage_with_policy(
            "fetch",
            slow.clone(),
            StagePolicy::new(RetryPolicy::fixed(1, Duration::from_secs(10)))
                .with_timeout(Duration::from_secs(30)),
        )
        .build()
        .unwrap();
    let run = PipelineExecutor::new()
        .run(&graph, logical_date(), CancellationToken::new())
        .await;
    assert_eq!(run.status, RunStatus::Failed);
    assert_eq!(slow.calls.load(Ordering::SeqCst), 2);
    let stage = run.stage("fetch").unwrap();
    assert_eq!(stage.attempts.len(), 2);
    assert_eq!(
        stage.error.as_ref().unwrap().kind,
        stagehouse_core::ErrorKind::Timeout
    );
}

#[tokio::test(start_paused = true)]
async fn test_cancellation_stops_in_flight_and_pending_stages() {
    let timeline: Timeline = Arc::default();
    let graph = GraphBuilder::new("etl_imdb")
        .default_policy(no_retry())
        .stage("fetch", Recorder::slow(&timeline, Duration::from_secs(600)))
        .stage("load", Recorder::ok(&timeline))
        .chain(&["fetch", "load"])
        .build()
        .unwrap();

    let token = CancellationToken::new();
    let trigger = token.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_secs(5)).await;
        trigger.cancel();
    });
    let run = PipelineExecutor::new().run(&graph, logical_date(), token).await;

    assert_eq!(run.status, RunStatus::Cancelled);
    assert_eq!(run.stage("fetch").unwrap().state, StageState::Cancelled);
    assert_eq!(run.stage("load").unwrap().state, StageState::Cancelled);
    assert!(timeline.lock().unwrap().is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_run_timeout_cancels_run() {
    let timeline: Timeline = Arc::default();
    let graph = GraphBuilder::new("etl_imdb")
        .default_policy(no_retry())
        .stage("start", Arc::new(EmptyStage))
        .stage("fetch", Recorder::slow(&timeline, Duration::from_secs(3600)))
        .chain(&["start", "fetch"])
        .build()
        .unwrap();
    let run = PipelineExecutor::new()
        .with_run_timeout(Some(Duration::from_secs(60)))
        .run(&graph, logical_date(), CancellationToken::new())
        .await;
    assert_eq!(run.status, RunStatus::Cancelled);
    assert_eq!(run.stage("start").unwrap().state, StageState::Succeeded);
    assert_eq!(run.stage("fetch").unwrap().state, StageState::Cancelled);
    assert_eq!(run.cancel_reason.as_deref(), Some("run timed out after 60s"));
}

#[tokio::test]
async fn test_concurrent_runs_do_not_share_state() {
    let timeline: Timeline = Arc::default();
    let graph = GraphBuilder::new("etl_imdb")
        .default_policy(no_retry())
        .stage("fetch", Recorder::ok(&timeline))
        .build()
        .unwrap();
    let executor = PipelineExecutor::new();
    let day_one = NaiveDate::from_ymd_opt(2024, 6, 1).unwrap();
    let day_two = NaiveDate::from_ymd_opt(2024, 6, 2).unwrap();
    let (a, b) = tokio::join!(
        executor.run(&graph, day_one, CancellationToken::new()),
        executor.run(&graph, day_two, CancellationToken::new()),
    );
    assert_ne!(a.run_id, b.run_id);
    assert_eq!(a.logical_date, day_one);
    assert_eq!(b.logical_date, day_two);
    assert!(a.succeeded() && b.succeeded());
}
