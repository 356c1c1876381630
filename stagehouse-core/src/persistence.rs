//! Atomic JSON persistence and the on-disk run history.
//!
//! Every write goes to a `.tmp` sibling and is renamed into place, so a
//! crash mid-write never leaves a truncated summary behind.

use std::io;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

use crate::error::SchedulerError;
use crate::pipeline::PipelineRun;

/// Atomically write `data` as pretty-printed JSON, creating parent directories.
pub fn atomic_write_json<T: serde::Serialize>(path: &Path, data: &T) -> io::Result<()> {
    let json = serde_json::to_string_pretty(data).map_err(io::Error::other)?;
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let tmp = path.with_extension("json.tmp");
    std::fs::write(&tmp, json.as_bytes())?;
    std::fs::rename(&tmp, path)
}

/// Load JSON from `path`; `Ok(None)` if the file does not exist.
pub fn load_json<T: serde::de::DeserializeOwned>(path: &Path) -> io::Result<Option<T>> {
    let data = match std::fs::read_to_string(path) {
        Ok(data) => data,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(e),
    };
    serde_json::from_str(&data)
        .map(Some)
        .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))
}

/// Run summaries stored as `<state_dir>/runs/<run_id>.json`.
#[derive(Debug, Clone)]
pub struct RunStore {
    dir: PathBuf,
}

impl RunStore {
    pub fn new(state_dir: &Path) -> Self {
        Self {
            dir: state_dir.join("runs"),
        }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn save(&self, run: &PipelineRun) -> Result<PathBuf, SchedulerError> {
        let path = self.dir.join(format!("{}.json", run.run_id));
        atomic_write_json(&path, run).map_err(|e| SchedulerError::PersistenceError {
            message: format!("Failed to write run summary {}: {e}", path.display()),
        })?;
        debug!(run_id = %run.run_id, path = %path.display(), "Run summary saved");
        Ok(path)
    }

    /// Load a run by full id or unique id prefix.
    pub fn load(&self, run_id: &str) -> Result<PipelineRun, SchedulerError> {
        let not_found = || SchedulerError::RunNotFound {
            run_id: run_id.to_string(),
        };
        let exact = self.dir.join(format!("{run_id}.json"));
        let path = if exact.exists() {
            exact
        } else {
            let matches: Vec<PathBuf> = self
                .paths()?
                .into_iter()
                .filter(|p| {
                    p.file_stem()
                        .and_then(|s| s.to_str())
                        .is_some_and(|s| s.starts_with(run_id))
                })
                .collect();
            match matches.as_slice() {
                [only] => only.clone(),
                _ => return Err(not_found()),
            }
        };
        load_json(&path)
            .map_err(|e| SchedulerError::PersistenceError {
                message: format!("Failed to read run summary {}: {e}", path.display()),
            })?
            .ok_or_else(not_found)
    }

    /// All stored runs, newest first. Unreadable files are skipped.
    pub fn list(&self) -> Result<Vec<PipelineRun>, SchedulerError> {
        let mut runs = Vec::new();
        for path in self.paths()? {
            match load_json::<PipelineRun>(&path) {
                Ok(Some(run)) => runs.push(run),
                Ok(None) => {}
                Err(e) => warn!(path = %path.display(), error = %e, "Skipping unreadable run summary"),
            }
        }
        runs.sort_by(|a, b| b.started_at.cmp(&a.started_at));
        Ok(runs)
    }

    fn paths(&self) -> Result<Vec<PathBuf>, SchedulerError> {
        let entries = match std::fs::read_dir(&self.dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => {
                return Err(SchedulerError::PersistenceError {
                    message: format!("Failed to read {}: {e}", self.dir.display()),
                });
            }
        };
        Ok(entries
            .filter_map(|e| e.ok())
            .map(|e| e.path())
            .filter(|p| p.extension().is_some_and(|ext| ext == "json"))
            .collect())
    }
}
