//! Schedule evaluation: which ticks are due and which logical date each covers.
//!
//! A tick closes an interval; the run it triggers is stamped with the start
//! of that interval. The daily tick at `D+1 00:00` therefore runs logical
//! date `D`.

use chrono::{DateTime, Duration, NaiveDate, Utc};
use cron::Schedule;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::str::FromStr;
use tracing::{info, warn};
use uuid::Uuid;

use crate::error::SchedulerError;
use crate::persistence::{atomic_write_json, load_json};
use crate::pipeline::{PipelineRun, RunStatus};

/// File name of the persisted scheduler state inside the state directory.
pub const STATE_FILE: &str = "scheduler_state.json";

/// Upper bound on ticks enumerated in one evaluation.
const MAX_TICKS: usize = 100_000;

/// Expand `@daily`-style aliases and 5-field expressions to the cron
/// crate's seconds-first syntax.
fn normalize(expr: &str) -> String {
    match expr.trim() {
        "@yearly" | "@annually" => "0 0 0 1 1 * *".to_string(),
        "@monthly" => "0 0 0 1 * * *".to_string(),
        "@weekly" => "0 0 0 * * SUN *".to_string(),
        "@daily" | "@midnight" => "0 0 0 * * * *".to_string(),
        "@hourly" => "0 0 * * * * *".to_string(),
        other if other.split_whitespace().count() == 5 => format!("0 {other}"),
        other => other.to_string(),
    }
}

/// A parsed pipeline schedule.
#[derive(Debug, Clone)]
pub struct PipelineSchedule {
    expression: String,
    schedule: Schedule,
}

impl PipelineSchedule {
    pub fn parse(expression: &str) -> Result<Self, SchedulerError> {
        let schedule =
            Schedule::from_str(&normalize(expression)).map_err(|e| SchedulerError::InvalidSchedule {
                expression: expression.to_string(),
                message: e.to_string(),
            })?;
        Ok(Self {
            expression: expression.to_string(),
            schedule,
        })
    }

    pub fn expression(&self) -> &str {
        &self.expression
    }

    /// First tick strictly after `after`.
    pub fn next_after(&self, after: DateTime<Utc>) -> Option<DateTime<Utc>> {
        self.schedule.after(&after).next()
    }

    /// Logical date of the interval closed by `tick`.
    ///
    /// The interval length is taken from the gap to the following tick.
    pub fn logical_date_for(&self, tick: DateTime<Utc>) -> NaiveDate {
        let interval = self
            .next_after(tick)
            .map(|next| next - tick)
            .unwrap_or_else(|| Duration::days(1));
        (tick - interval).date_naive()
    }

    /// Ticks at or before `now` that have not run yet.
    ///
    /// With `catchup = false`, or when there is no history to catch up
    /// from, only the most recent due tick is returned.
    pub fn due_ticks(
        &self,
        last_tick: Option<DateTime<Utc>>,
        now: DateTime<Utc>,
        catchup: bool,
        start_date: Option<NaiveDate>,
    ) -> Vec<DateTime<Utc>> {
        let start_anchor = start_date
            .and_then(|d| d.and_hms_opt(0, 0, 0))
            .map(|dt| dt.and_utc());
        let has_history = last_tick.is_some() || start_anchor.is_some();
        let anchor = match (last_tick, start_anchor) {
            (Some(last), Some(start)) => last.max(start),
            (Some(last), None) => last,
            (None, Some(start)) => start,
            (None, None) => {
                let interval = match (self.next_after(now), self.next_after(now).and_then(|n| self.next_after(n))) {
                    (Some(a), Some(b)) => b - a,
                    _ => Duration::days(1),
                };
                now - interval * 8
            }
        };

        let mut ticks: Vec<DateTime<Utc>> = self
            .schedule
            .after(&anchor)
            .take_while(|t| *t <= now)
            .take(MAX_TICKS)
            .filter(|t| start_date.is_none_or(|d| self.logical_date_for(*t) >= d))
            .collect();

        if (!catchup || !has_history) && ticks.len() > 1 {
            ticks = ticks.split_off(ticks.len() - 1);
        }
        ticks
    }
}

/// Scheduler progress persisted between invocations.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SchedulerState {
    #[serde(default)]
    pub pipeline: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_tick: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_logical_date: Option<NaiveDate>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_run_id: Option<Uuid>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_status: Option<RunStatus>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub updated_at: Option<DateTime<Utc>>,
}

impl SchedulerState {
    pub fn new(pipeline: impl Into<String>) -> Self {
        Self {
            pipeline: pipeline.into(),
            ..Default::default()
        }
    }

    /// Load state for `pipeline`, starting fresh if the file is missing,
    /// unreadable, or belongs to another pipeline.
    pub fn load(state_dir: &Path, pipeline: &str) -> Self {
        let path = state_dir.join(STATE_FILE);
        match load_json::<SchedulerState>(&path) {
            Ok(Some(state)) if state.pipeline == pipeline => {
                info!(last_tick = ?state.last_tick, "Loaded scheduler state");
                state
            }
            Ok(Some(state)) => {
                warn!(found = %state.pipeline, expected = pipeline, "Scheduler state belongs to another pipeline, starting fresh");
                Self::new(pipeline)
            }
            Ok(None) => Self::new(pipeline),
            Err(e) => {
                warn!("Failed to read scheduler state: {}, starting fresh", e);
                Self::new(pipeline)
            }
        }
    }

    pub fn save(&self, state_dir: &Path) -> Result<(), SchedulerError> {
        atomic_write_json(&state_dir.join(STATE_FILE), self).map_err(|e| {
            SchedulerError::PersistenceError {
                message: format!("Failed to write scheduler state: {e}"),
            }
        })
    }

    /// Record that the run for `tick` has finished.
    pub fn record(&mut self, tick: DateTime<Utc>, run: &PipelineRun) {
        self.last_tick = Some(tick);
        self.last_logical_date = Some(run.logical_date);
        self.last_run_id = Some(run.run_id);
        self.last_status = Some(run.status);
        self.updated_at = Some(Utc::now());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use pretty_assertions::assert_eq;
    use tempfile::TempDir;

    fn at(y: i32, m: u32, d: u32, h: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(y, m, d, h, 0, 0).unwrap()
    }

    fn day(y: i32, m: u32, d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, d).unwrap()
    }

    #[test]
    fn test_parse_aliases_and_five_field() {
        assert!(PipelineSchedule::parse("@daily").is_ok());
        assert!(PipelineSchedule::parse("@hourly").is_ok());
        assert!(PipelineSchedule::parse("30 6 * * *").is_ok());
        assert!(PipelineSchedule::parse("0 0 9 * * MON-FRI *").is_ok());
        let err = PipelineSchedule::parse("every day").unwrap_err();
        assert!(matches!(err, SchedulerError::InvalidSchedule { .. }));
    }

    #[test]
    fn test_logical_date_is_interval_start() {
        let daily = PipelineSchedule::parse("@daily").unwrap();
        assert_eq!(daily.logical_date_for(at(2024, 3, 2, 0)), day(2024, 3, 1));
    }

    #[test]
    fn test_no_catchup_returns_latest_only() {
        let daily = PipelineSchedule::parse("@daily").unwrap();
        let ticks = daily.due_ticks(Some(at(2024, 3, 1, 0)), at(2024, 3, 5, 12), false, None);
        assert_eq!(ticks, vec![at(2024, 3, 5, 0)]);
    }

    #[test]
    fn test_catchup_returns_every_missed_tick() {
        let daily = PipelineSchedule::parse("@daily").unwrap();
        let ticks = daily.due_ticks(Some(at(2024, 3, 1, 0)), at(2024, 3, 4, 0), true, None);
        assert_eq!(ticks, vec![at(2024, 3, 2, 0), at(2024, 3, 3, 0), at(2024, 3, 4, 0)]);
    }

    #[test]
    fn test_nothing_due_before_next_tick() {
        let daily = PipelineSchedule::parse("@daily").unwrap();
        let ticks = daily.due_ticks(Some(at(2024, 3, 5, 0)), at(2024, 3, 5, 23), false, None);
        assert!(ticks.is_empty());
    }

    #[test]
    fn test_first_evaluation_without_history() {
        let daily = PipelineSchedule::parse("@daily").unwrap();
        let ticks = daily.due_ticks(None, at(2024, 3, 5, 12), true, None);
        assert_eq!(ticks, vec![at(2024, 3, 5, 0)]);
    }

    #[test]
    fn test_start_date_bounds_catchup() {
        let daily = PipelineSchedule::parse("@daily").unwrap();
        let ticks = daily.due_ticks(None, at(2024, 3, 4, 6), true, Some(day(2024, 3, 2)));
        let dates: Vec<NaiveDate> = ticks.iter().map(|t| daily.logical_date_for(*t)).collect();
        assert_eq!(dates, vec![day(2024, 3, 2), day(2024, 3, 3)]);
    }

    #[test]
    fn test_state_roundtrip_and_pipeline_mismatch() {
        let dir = TempDir::new().unwrap();
        let mut run = PipelineRun::new(Uuid::new_v4(), "etl_imdb", day(2024, 3, 1));
        run.finish();
        let mut state = SchedulerState::new("etl_imdb");
        state.record(at(2024, 3, 2, 0), &run);
        state.save(dir.path()).unwrap();

        let loaded = SchedulerState::load(dir.path(), "etl_imdb");
        assert_eq!(loaded, state);
        assert_eq!(loaded.last_logical_date, Some(day(2024, 3, 1)));

        let other = SchedulerState::load(dir.path(), "another");
        assert!(other.last_tick.is_none());
    }

    #[test]
    fn test_corrupt_state_starts_fresh() {
        let dir = TempDir::new().unwrap();
        std::fs::write(dir.path().join(STATE_FILE), b"not json").unwrap();
        let state = SchedulerState::load(dir.path(), "etl_imdb");
        assert_eq!(state, SchedulerState::new("etl_imdb"));
    }
}
