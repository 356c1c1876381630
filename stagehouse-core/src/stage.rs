//! Stage capability trait and the per-attempt execution context.
//!
//! Every stage kind (fetch, create-schema, load, transform, quality gate) is
//! an independent value implementing [`Runnable`]. The executor owns retries,
//! timeouts, and dependency ordering; a stage body only does its one job.

use async_trait::async_trait;
use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use std::fmt;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::error::StageError;

/// Broad category of a stage, used in summaries and logs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StageKind {
    Marker,
    Fetch,
    Sql,
    Load,
    Transform,
    Quality,
}

impl fmt::Display for StageKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StageKind::Marker => write!(f, "marker"),
            StageKind::Fetch => write!(f, "fetch"),
            StageKind::Sql => write!(f, "sql"),
            StageKind::Load => write!(f, "load"),
            StageKind::Transform => write!(f, "transform"),
            StageKind::Quality => write!(f, "quality"),
        }
    }
}

/// Context handed to a stage for one attempt.
///
/// Cloned per attempt; nothing in here is shared mutably between stages or
/// between runs.
#[derive(Debug, Clone)]
pub struct RunContext {
    pub run_id: Uuid,
    pub pipeline: String,
    pub logical_date: NaiveDate,
    pub stage_id: String,
    /// 1-based attempt number.
    pub attempt: u32,
    pub cancel: CancellationToken,
}

impl RunContext {
    pub fn new(pipeline: impl Into<String>, logical_date: NaiveDate) -> Self {
        Self {
            run_id: Uuid::new_v4(),
            pipeline: pipeline.into(),
            logical_date,
            stage_id: String::new(),
            attempt: 1,
            cancel: CancellationToken::new(),
        }
    }

    /// Context for a specific stage and attempt within the same run.
    pub fn for_stage(&self, stage_id: &str, attempt: u32) -> Self {
        Self {
            stage_id: stage_id.to_string(),
            attempt,
            ..self.clone()
        }
    }

    /// Logical date as `YYYY-MM-DD`, the form used in templated keys.
    pub fn ds(&self) -> String {
        self.logical_date.format("%Y-%m-%d").to_string()
    }

    /// Fail fast if the run has been cancelled.
    pub fn check_cancelled(&self) -> Result<(), StageError> {
        if self.cancel.is_cancelled() {
            Err(StageError::Cancelled)
        } else {
            Ok(())
        }
    }
}

/// What a stage reports back on success.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StageReport {
    pub summary: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bytes: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rows: Option<u64>,
}

impl StageReport {
    pub fn new(summary: impl Into<String>) -> Self {
        Self {
            summary: summary.into(),
            bytes: None,
            rows: None,
        }
    }

    pub fn with_bytes(mut self, bytes: u64) -> Self {
        self.bytes = Some(bytes);
        self
    }

    pub fn with_rows(mut self, rows: u64) -> Self {
        self.rows = Some(rows);
        self
    }
}

/// Trait implemented by every stage body.
#[async_trait]
pub trait Runnable: Send + Sync {
    /// Category of this stage.
    fn kind(&self) -> StageKind;

    /// One-line human description, shown by `stagehouse graph`.
    fn describe(&self) -> String;

    /// Whether re-executing the whole body after a partial failure is safe.
    ///
    /// Statement failures are only retried for idempotent stages.
    fn idempotent(&self) -> bool {
        true
    }

    /// Execute the stage body once.
    async fn execute(&self, ctx: &RunContext) -> Result<StageReport, StageError>;
}

/// A no-op stage marking the start or end of a pipeline.
#[derive(Debug, Clone, Default)]
pub struct EmptyStage;

#[async_trait]
impl Runnable for EmptyStage {
    fn kind(&self) -> StageKind {
        StageKind::Marker
    }

    fn describe(&self) -> String {
        "marker".to_string()
    }

    async fn execute(&self, _ctx: &RunContext) -> Result<StageReport, StageError> {
        Ok(StageReport::default())
    }
}
