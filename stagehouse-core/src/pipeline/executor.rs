//! Pipeline executor: runs a [`PipelineGraph`] for one logical date.
//!
//! Stages whose upstreams have all succeeded are spawned onto a `JoinSet`,
//! so members of a fan-out group run concurrently. Each spawned task owns
//! its stage's retry loop and returns the finished [`StageOutcome`]. A
//! failed stage marks its descendants `upstream_failed` while independent
//! branches keep running. Cancellation (external token or run timeout)
//! stops new stages from starting and interrupts the in-flight ones.

use chrono::NaiveDate;
use futures::FutureExt;
use std::collections::{HashMap, VecDeque};
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use super::graph::PipelineGraph;
use super::types::{PipelineRun, StageOutcome, StageState};
use crate::error::StageError;
use crate::retry::StagePolicy;
use crate::stage::{RunContext, Runnable};

#[derive(Debug, Clone, Default)]
pub struct PipelineExecutor {
    run_timeout: Option<Duration>,
    max_active_stages: Option<usize>,
}

impl PipelineExecutor {
    pub fn new() -> Self {
        Self::default()
    }

    /// Cancel the whole run once it has been going for `timeout`.
    pub fn with_run_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.run_timeout = timeout;
        self
    }

    pub fn with_max_active_stages(mut self, limit: Option<usize>) -> Self {
        self.max_active_stages = limit.filter(|&n| n > 0);
        self
    }

    /// Execute every stage of `graph` for `logical_date`.
    ///
    /// Always returns a finished run; stage failures are reported in it
    /// rather than as an error.
    pub async fn run(
        &self,
        graph: &PipelineGraph,
        logical_date: NaiveDate,
        cancel: CancellationToken,
    ) -> PipelineRun {
        let mut ctx = RunContext::new(graph.name(), logical_date);
        ctx.cancel = cancel.child_token();
        let run_token = ctx.cancel.clone();

        let mut run = PipelineRun::new(ctx.run_id, graph.name(), logical_date);
        run.stages = graph
            .nodes()
            .iter()
            .map(|n| StageOutcome::new(&n.id, n.runnable.kind(), n.upstream.clone()))
            .collect();

        info!(
            run_id = %run.run_id,
            pipeline = graph.name(),
            logical_date = %logical_date,
            stages = graph.len(),
            "Pipeline run started"
        );

        let mut waiting: HashMap<&str, usize> = graph
            .nodes()
            .iter()
            .map(|n| (n.id.as_str(), n.upstream.len()))
            .collect();
        let mut ready: VecDeque<String> = graph
            .nodes()
            .iter()
            .filter(|n| n.upstream.is_empty())
            .map(|n| n.id.clone())
            .collect();

        let deadline = async {
            match self.run_timeout {
                Some(timeout) => tokio::time::sleep(timeout).await,
                None => std::future::pending::<()>().await,
            }
        };
        tokio::pin!(deadline);
        let mut timed_out = false;

        let mut tasks: JoinSet<StageOutcome> = JoinSet::new();
        loop {
            while !run_token.is_cancelled() {
                if self
                    .max_active_stages
                    .is_some_and(|limit| tasks.len() >= limit)
                {
                    break;
                }
                let Some(id) = ready.pop_front() else { break };
                let Some(node) = graph.node(&id) else { continue };
                let Some(outcome) = run
                    .stage(&id)
                    .filter(|s| s.state == StageState::Pending)
                    .cloned()
                else {
                    continue;
                };
                tasks.spawn(run_stage(
                    Arc::clone(&node.runnable),
                    node.policy.clone(),
                    ctx.clone(),
                    outcome,
                ));
            }

            if tasks.is_empty() {
                break;
            }

            tokio::select! {
                _ = &mut deadline, if !timed_out => {
                    timed_out = true;
                    let secs = self.run_timeout.map(|t| t.as_secs()).unwrap_or_default();
                    warn!(run_id = %run.run_id, timeout_secs = secs, "Run timed out, cancelling");
                    run.cancel_reason = Some(format!("run timed out after {secs}s"));
                    run_token.cancel();
                }
                joined = tasks.join_next() => {
                    let Some(joined) = joined else { break };
                    let outcome = match joined {
                        Ok(outcome) => outcome,
                        Err(e) => {
                            error!(error = %e, "Stage task aborted");
                            continue;
                        }
                    };
                    let id = outcome.stage_id.clone();
                    let state = outcome.state;
                    if let Some(slot) = run.stage_mut(&id) {
                        *slot = outcome;
                    }

                    match state {
                        StageState::Succeeded => {
                            for next in graph.downstream(&id) {
                                if let Some(count) = waiting.get_mut(next.as_str()) {
                                    *count = count.saturating_sub(1);
                                    if *count == 0 {
                                        ready.push_back(next.clone());
                                    }
                                }
                            }
                        }
                        StageState::Failed => {
                            for desc in graph.descendants(&id) {
                                if let Some(stage) = run.stage_mut(&desc) {
                                    if stage.transition(StageState::UpstreamFailed) {
                                        info!(stage = %desc, state = %StageState::UpstreamFailed, upstream = %id, "Stage will not run");
                                    }
                                }
                            }
                        }
                        _ => {}
                    }
                }
            }
        }

        if cancel.is_cancelled() && run.cancel_reason.is_none() {
            run.cancel_reason = Some("cancelled".to_string());
        }
        for stage in run.stages.iter_mut() {
            if stage.state == StageState::Pending || stage.state == StageState::Running {
                // Pending stages were never started; Running ones lost their task.
                let next = if stage.state == StageState::Pending && run.cancel_reason.is_none() {
                    StageState::UpstreamFailed
                } else {
                    StageState::Cancelled
                };
                if !stage.transition(next) {
                    stage.transition(StageState::Failed);
                }
            }
        }

        run.finish();
        info!(
            run_id = %run.run_id,
            status = %run.status,
            succeeded = run.metrics.stages_succeeded,
            failed = run.metrics.stages_failed,
            retries = run.metrics.retries,
            "Pipeline run finished"
        );
        run
    }
}

fn log_state(outcome: &StageOutcome, attempt: u32) {
    info!(
        stage = %outcome.stage_id,
        attempt,
        state = %outcome.state,
        "Stage state changed"
    );
}

/// Run one stage to a terminal state, retrying per `policy`.
async fn run_stage(
    runnable: Arc<dyn Runnable>,
    policy: StagePolicy,
    ctx: RunContext,
    mut outcome: StageOutcome,
) -> StageOutcome {
    let max_attempts = policy.retry.max_attempts();
    let mut attempt = 1;
    loop {
        outcome.transition(StageState::Running);
        log_state(&outcome, attempt);
        outcome.begin_attempt(attempt);

        let stage_ctx = ctx.for_stage(&outcome.stage_id, attempt);
        let result = execute_once(runnable.as_ref(), &stage_ctx, &policy).await;

        match result {
            Ok(report) => {
                outcome.end_attempt(None);
                outcome.report = Some(report);
                outcome.transition(StageState::Succeeded);
                log_state(&outcome, attempt);
                return outcome;
            }
            Err(err) => {
                outcome.end_attempt(Some(&err));
                if matches!(err, StageError::Cancelled) {
                    outcome.error = Some((&err).into());
                    outcome.transition(StageState::Cancelled);
                    log_state(&outcome, attempt);
                    return outcome;
                }

                let retryable = err.is_retryable(runnable.idempotent());
                if !retryable || attempt >= max_attempts {
                    error!(
                        stage = %outcome.stage_id,
                        attempt,
                        kind = %err.kind(),
                        error = %err,
                        "Stage failed"
                    );
                    outcome.error = Some((&err).into());
                    outcome.transition(StageState::Failed);
                    return outcome;
                }

                let delay = policy.retry.delay_before(attempt + 1);
                outcome.transition(StageState::Retrying);
                warn!(
                    stage = %outcome.stage_id,
                    attempt,
                    state = %outcome.state,
                    delay_secs = delay.as_secs(),
                    error = %err,
                    "Stage attempt failed, retrying"
                );
                tokio::select! {
                    _ = ctx.cancel.cancelled() => {
                        outcome.error = Some((&StageError::Cancelled).into());
                        outcome.transition(StageState::Cancelled);
                        log_state(&outcome, attempt);
                        return outcome;
                    }
                    _ = tokio::time::sleep(delay) => {}
                }
                attempt += 1;
            }
        }
    }
}

/// One attempt: honours cancellation and the per-stage execution timeout,
/// and turns a panic in the stage body into an error.
async fn execute_once(
    runnable: &dyn Runnable,
    ctx: &RunContext,
    policy: &StagePolicy,
) -> Result<crate::stage::StageReport, StageError> {
    let body = AssertUnwindSafe(runnable.execute(ctx)).catch_unwind();
    let guarded = async {
        match policy.execution_timeout() {
            Some(limit) => match tokio::time::timeout(limit, body).await {
                Ok(result) => result,
                Err(_) => Ok(Err(StageError::Timeout {
                    timeout_secs: limit.as_secs(),
                })),
            },
            None => body.await,
        }
    };
    tokio::select! {
        biased;
        _ = ctx.cancel.cancelled() => Err(StageError::Cancelled),
        result = guarded => match result {
            Ok(inner) => inner,
            Err(_) => Err(StageError::invalid("stage body panicked")),
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::graph::GraphBuilder;
    use crate::pipeline::types::RunStatus;
    use crate::retry::RetryPolicy;
    use crate::stage::{EmptyStage, StageKind, StageReport};
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicU32, Ordering};

    struct Flaky {
        failures: u32,
        calls: AtomicU32,
    }

    #[async_trait]
    impl Runnable for Flaky {
        fn kind(&self) -> StageKind {
            StageKind::Fetch
        }
        fn describe(&self) -> String {
            "flaky".into()
        }
        async fn execute(&self, _ctx: &RunContext) -> Result<StageReport, StageError> {
            let n = self.calls.fetch_add(1, Ordering::SeqCst);
            if n < self.failures {
                Err(StageError::transfer("http://x", 503, b"busy"))
            } else {
                Ok(StageReport::new("ok").with_bytes(10))
            }
        }
    }

    struct Panics;

    #[async_trait]
    impl Runnable for Panics {
        fn kind(&self) -> StageKind {
            StageKind::Sql
        }
        fn describe(&self) -> String {
            "panics".into()
        }
        async fn execute(&self, _ctx: &RunContext) -> Result<StageReport, StageError> {
            panic!("boom");
        }
    }

    fn date() -> NaiveDate {
        NaiveDate::from_ymd_opt(2024, 5, 1).unwrap()
    }

    #[tokio::test(start_paused = true)]
    async fn test_retry_then_succeed() {
        let flaky = Arc::new(Flaky {
            failures: 2,
            calls: AtomicU32::new(0),
        });
        let graph = GraphBuilder::new("etl")
            .stage_with_policy(
                "fetch",
                flaky.clone(),
                StagePolicy::new(RetryPolicy::fixed(3, Duration::from_secs(300))),
            )
            .build()
            .unwrap();
        let run = PipelineExecutor::new()
            .run(&graph, date(), CancellationToken::new())
            .await;
        assert_eq!(run.status, RunStatus::Succeeded);
        let stage = run.stage("fetch").unwrap();
        assert_eq!(stage.attempts.len(), 3);
        assert!(stage.attempts[0].error.is_some());
        assert!(stage.attempts[2].error.is_none());
        assert_eq!(run.metrics.retries, 2);
        assert_eq!(run.metrics.bytes_staged, 10);
    }

    #[tokio::test(start_paused = true)]
    async fn test_exhausted_retries_fail_and_block_downstream() {
        let graph = GraphBuilder::new("etl")
            .stage_with_policy(
                "fetch",
                Arc::new(Flaky {
                    failures: 10,
                    calls: AtomicU32::new(0),
                }),
                StagePolicy::new(RetryPolicy::fixed(1, Duration::from_secs(5))),
            )
            .stage("load", Arc::new(EmptyStage))
            .stage("end", Arc::new(EmptyStage))
            .chain(&["fetch", "load", "end"])
            .build()
            .unwrap();
        let run = PipelineExecutor::new()
            .run(&graph, date(), CancellationToken::new())
            .await;
        assert_eq!(run.status, RunStatus::Failed);
        assert_eq!(run.stage("fetch").unwrap().attempts.len(), 2);
        assert_eq!(run.stage("load").unwrap().state, StageState::UpstreamFailed);
        assert_eq!(run.stage("end").unwrap().state, StageState::UpstreamFailed);
        assert!(run.stage("load").unwrap().attempts.is_empty());
    }

    #[tokio::test]
    async fn test_panicking_stage_is_failed_not_fatal() {
        let graph = GraphBuilder::new("etl")
            .stage_with_policy("boom", Arc::new(Panics), StagePolicy::new(RetryPolicy::none()))
            .stage("other", Arc::new(EmptyStage))
            .build()
            .unwrap();
        let run = PipelineExecutor::new()
            .run(&graph, date(), CancellationToken::new())
            .await;
        assert_eq!(run.stage("boom").unwrap().state, StageState::Failed);
        assert_eq!(run.stage("other").unwrap().state, StageState::Succeeded);
    }

    #[tokio::test]
    async fn test_pre_cancelled_run_starts_nothing() {
        let graph = GraphBuilder::new("etl")
            .stage("start", Arc::new(EmptyStage))
            .build()
            .unwrap();
        let token = CancellationToken::new();
        token.cancel();
        let run = PipelineExecutor::new().run(&graph, date(), token).await;
        assert_eq!(run.status, RunStatus::Cancelled);
        assert_eq!(run.stage("start").unwrap().state, StageState::Cancelled);
        assert_eq!(run.cancel_reason.as_deref(), Some("cancelled"));
    }
}
