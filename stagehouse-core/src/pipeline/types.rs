//! Run and stage state tracking.

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

use crate::error::{ErrorKind, StageError};
use crate::stage::{StageKind, StageReport};

/// Lifecycle state of one stage within one run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StageState {
    Pending,
    Running,
    Retrying,
    Succeeded,
    Failed,
    /// Never ran because an upstream stage failed.
    UpstreamFailed,
    /// Never finished because the run was cancelled or timed out.
    Cancelled,
}

impl StageState {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            StageState::Succeeded
                | StageState::Failed
                | StageState::UpstreamFailed
                | StageState::Cancelled
        )
    }

    /// Whether moving from `self` to `next` is a legal transition.
    pub fn can_transition_to(&self, next: StageState) -> bool {
        use StageState::*;
        matches!(
            (self, next),
            (Pending, Running)
                | (Pending, UpstreamFailed)
                | (Pending, Cancelled)
                | (Running, Succeeded)
                | (Running, Failed)
                | (Running, Retrying)
                | (Running, Cancelled)
                | (Retrying, Running)
                | (Retrying, Cancelled)
        )
    }
}

impl fmt::Display for StageState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StageState::Pending => write!(f, "pending"),
            StageState::Running => write!(f, "running"),
            StageState::Retrying => write!(f, "retrying"),
            StageState::Succeeded => write!(f, "succeeded"),
            StageState::Failed => write!(f, "failed"),
            StageState::UpstreamFailed => write!(f, "upstream_failed"),
            StageState::Cancelled => write!(f, "cancelled"),
        }
    }
}

/// Error as recorded in summaries.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorSummary {
    pub kind: ErrorKind,
    pub message: String,
    /// Tables that failed the quality gate.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub failing_tables: Vec<String>,
}

impl From<&StageError> for ErrorSummary {
    fn from(err: &StageError) -> Self {
        let mut failing_tables: Vec<String> = Vec::new();
        for failure in err.quality_failures() {
            if !failing_tables.contains(&failure.table) {
                failing_tables.push(failure.table.clone());
            }
        }
        Self {
            kind: err.kind(),
            message: err.to_string(),
            failing_tables,
        }
    }
}

/// One execution attempt of a stage.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AttemptRecord {
    pub attempt: u32,
    pub started_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub finished_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrorSummary>,
}

/// Per-stage result inside a run summary.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StageOutcome {
    pub stage_id: String,
    pub kind: StageKind,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub upstream: Vec<String>,
    pub state: StageState,
    #[serde(default)]
    pub attempts: Vec<AttemptRecord>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub finished_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub report: Option<StageReport>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrorSummary>,
}

impl StageOutcome {
    pub fn new(stage_id: impl Into<String>, kind: StageKind, upstream: Vec<String>) -> Self {
        Self {
            stage_id: stage_id.into(),
            kind,
            upstream,
            state: StageState::Pending,
            attempts: Vec::new(),
            started_at: None,
            finished_at: None,
            report: None,
            error: None,
        }
    }

    /// Move to `next`. Illegal transitions are refused and leave the state unchanged.
    pub fn transition(&mut self, next: StageState) -> bool {
        if !self.state.can_transition_to(next) {
            return false;
        }
        let now = Utc::now();
        if next == StageState::Running && self.started_at.is_none() {
            self.started_at = Some(now);
        }
        if next.is_terminal() {
            self.finished_at = Some(now);
        }
        self.state = next;
        true
    }

    pub fn begin_attempt(&mut self, attempt: u32) {
        self.attempts.push(AttemptRecord {
            attempt,
            started_at: Utc::now(),
            finished_at: None,
            error: None,
        });
    }

    pub fn end_attempt(&mut self, error: Option<&StageError>) {
        if let Some(record) = self.attempts.last_mut() {
            record.finished_at = Some(Utc::now());
            record.error = error.map(ErrorSummary::from);
        }
    }

    /// Retries used, i.e. attempts beyond the first.
    pub fn retries(&self) -> u32 {
        (self.attempts.len() as u32).saturating_sub(1)
    }

    pub fn duration_ms(&self) -> Option<i64> {
        match (self.started_at, self.finished_at) {
            (Some(start), Some(end)) => Some((end - start).num_milliseconds()),
            _ => None,
        }
    }
}

/// Overall status of a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Running,
    Succeeded,
    Failed,
    Cancelled,
}

impl fmt::Display for RunStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RunStatus::Running => write!(f, "running"),
            RunStatus::Succeeded => write!(f, "succeeded"),
            RunStatus::Failed => write!(f, "failed"),
            RunStatus::Cancelled => write!(f, "cancelled"),
        }
    }
}

/// Aggregates over a run's stages.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunMetrics {
    pub stages_total: usize,
    pub stages_succeeded: usize,
    pub stages_failed: usize,
    pub stages_upstream_failed: usize,
    pub stages_cancelled: usize,
    pub retries: u32,
    pub bytes_staged: u64,
    pub rows_loaded: u64,
}

/// Summary of one pipeline run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PipelineRun {
    pub run_id: Uuid,
    pub pipeline: String,
    pub logical_date: NaiveDate,
    pub status: RunStatus,
    pub started_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub finished_at: Option<DateTime<Utc>>,
    /// Why the run stopped early, if it did.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cancel_reason: Option<String>,
    /// Stage outcomes in topological order.
    pub stages: Vec<StageOutcome>,
    #[serde(default)]
    pub metrics: RunMetrics,
}

impl PipelineRun {
    pub fn new(run_id: Uuid, pipeline: impl Into<String>, logical_date: NaiveDate) -> Self {
        Self {
            run_id,
            pipeline: pipeline.into(),
            logical_date,
            status: RunStatus::Running,
            started_at: Utc::now(),
            finished_at: None,
            cancel_reason: None,
            stages: Vec::new(),
            metrics: RunMetrics::default(),
        }
    }

    pub fn stage(&self, stage_id: &str) -> Option<&StageOutcome> {
        self.stages.iter().find(|s| s.stage_id == stage_id)
    }

    pub fn stage_mut(&mut self, stage_id: &str) -> Option<&mut StageOutcome> {
        self.stages.iter_mut().find(|s| s.stage_id == stage_id)
    }

    /// Ids of stages in `state`, in topological order.
    pub fn stages_in(&self, state: StageState) -> Vec<&str> {
        self.stages
            .iter()
            .filter(|s| s.state == state)
            .map(|s| s.stage_id.as_str())
            .collect()
    }

    pub fn compute_metrics(&self) -> RunMetrics {
        let mut metrics = RunMetrics {
            stages_total: self.stages.len(),
            ..Default::default()
        };
        for stage in &self.stages {
            match stage.state {
                StageState::Succeeded => metrics.stages_succeeded += 1,
                StageState::Failed => metrics.stages_failed += 1,
                StageState::UpstreamFailed => metrics.stages_upstream_failed += 1,
                StageState::Cancelled => metrics.stages_cancelled += 1,
                _ => {}
            }
            metrics.retries += stage.retries();
            if let Some(report) = &stage.report {
                match stage.kind {
                    StageKind::Fetch => metrics.bytes_staged += report.bytes.unwrap_or(0),
                    StageKind::Load | StageKind::Transform => {
                        metrics.rows_loaded += report.rows.unwrap_or(0)
                    }
                    _ => {}
                }
            }
        }
        metrics
    }

    /// Derive the final status from stage states and stamp the run finished.
    ///
    /// A run succeeds only if every stage succeeded.
    pub fn finish(&mut self) {
        self.metrics = self.compute_metrics();
        self.status = if self.stages.iter().all(|s| s.state == StageState::Succeeded) {
            RunStatus::Succeeded
        } else if self.stages.iter().any(|s| s.state == StageState::Failed) {
            RunStatus::Failed
        } else if self.stages.iter().any(|s| s.state == StageState::Cancelled) {
            RunStatus::Cancelled
        } else {
            RunStatus::Failed
        };
        self.finished_at = Some(Utc::now());
    }

    pub fn succeeded(&self) -> bool {
        self.status == RunStatus::Succeeded
    }

    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string_pretty(self)
    }

    /// One line for terminal output.
    pub fn headline(&self) -> String {
        format!(
            "{} {} [{}] {}: {}/{} stages succeeded, {} retries, {} bytes staged, {} rows loaded",
            self.pipeline,
            self.logical_date,
            self.run_id,
            self.status,
            self.metrics.stages_succeeded,
            self.metrics.stages_total,
            self.metrics.retries,
            self.metrics.bytes_staged,
            self.metrics.rows_loaded
        )
    }
}
