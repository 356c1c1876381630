//! Error types for the Stagehouse core.
//!
//! Uses `thiserror` for public API error types. [`StageError`] is the
//! per-stage failure taxonomy the executor classifies for retries; the other
//! enums cover graph construction, configuration, and scheduling.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;

/// Maximum number of response-body bytes attached to a [`StageError::Transfer`].
pub const BODY_EXCERPT_LIMIT: usize = 512;

/// Top-level error type for the Stagehouse core library.
#[derive(Debug, thiserror::Error)]
pub enum StagehouseError {
    #[error("Stage error: {0}")]
    Stage(#[from] StageError),

    #[error("Graph error: {0}")]
    Graph(#[from] GraphError),

    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Scheduler error: {0}")]
    Scheduler(#[from] SchedulerError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// One failed data-quality predicate.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QualityFailure {
    pub table: String,
    pub check: String,
    pub message: String,
}

impl QualityFailure {
    pub fn new(
        table: impl Into<String>,
        check: impl Into<String>,
        message: impl Into<String>,
    ) -> Self {
        Self {
            table: table.into(),
            check: check.into(),
            message: message.into(),
        }
    }
}

impl fmt::Display for QualityFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} [{}]: {}", self.table, self.check, self.message)
    }
}

/// Failure of a single stage body.
#[derive(Debug, Clone, thiserror::Error)]
pub enum StageError {
    #[error("Connection '{conn_id}' could not be resolved: {reason}")]
    ConnectionResolution { conn_id: String, reason: String },

    #[error("HTTP transfer from {url} failed with status {status}: {body_excerpt}")]
    Transfer {
        url: String,
        status: u16,
        body_excerpt: String,
    },

    #[error("Object store write to {bucket}/{key} failed: {message}")]
    StorageWrite {
        bucket: String,
        key: String,
        message: String,
    },

    #[error("Object {bucket}/{key} already exists and replace is disabled")]
    ObjectExists { bucket: String, key: String },

    #[error("Statement failed: {message} (statement: {statement})")]
    Load { statement: String, message: String },

    #[error("Data quality checks failed for {}: {}", failing_tables(.failures).join(", "), render_failures(.failures))]
    DataQuality { failures: Vec<QualityFailure> },

    #[error("Invalid stage configuration: {message}")]
    InvalidStage { message: String },

    #[error("Stage timed out after {timeout_secs}s")]
    Timeout { timeout_secs: u64 },

    #[error("Stage was cancelled")]
    Cancelled,
}

fn failing_tables(failures: &[QualityFailure]) -> Vec<String> {
    let mut tables: Vec<String> = Vec::new();
    for failure in failures {
        if !tables.contains(&failure.table) {
            tables.push(failure.table.clone());
        }
    }
    tables
}

fn render_failures(failures: &[QualityFailure]) -> String {
    failures
        .iter()
        .map(|f| f.to_string())
        .collect::<Vec<_>>()
        .join("; ")
}

/// Stable, machine-readable name of a [`StageError`] variant.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    ConnectionResolution,
    Transfer,
    StorageWrite,
    ObjectExists,
    Load,
    DataQuality,
    InvalidStage,
    Timeout,
    Cancelled,
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ErrorKind::ConnectionResolution => "connection_resolution",
            ErrorKind::Transfer => "transfer",
            ErrorKind::StorageWrite => "storage_write",
            ErrorKind::ObjectExists => "object_exists",
            ErrorKind::Load => "load",
            ErrorKind::DataQuality => "data_quality",
            ErrorKind::InvalidStage => "invalid_stage",
            ErrorKind::Timeout => "timeout",
            ErrorKind::Cancelled => "cancelled",
        };
        f.write_str(name)
    }
}

impl StageError {
    /// Build a transfer error, keeping only a bounded excerpt of the body.
    pub fn transfer(url: impl Into<String>, status: u16, body: &[u8]) -> Self {
        Self::Transfer {
            url: url.into(),
            status,
            body_excerpt: body_excerpt(body),
        }
    }

    pub fn storage_write(
        bucket: impl Into<String>,
        key: impl Into<String>,
        message: impl Into<String>,
    ) -> Self {
        Self::StorageWrite {
            bucket: bucket.into(),
            key: key.into(),
            message: message.into(),
        }
    }

    pub fn load(statement: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Load {
            statement: statement.into(),
            message: message.into(),
        }
    }

    pub fn unresolved(conn_id: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::ConnectionResolution {
            conn_id: conn_id.into(),
            reason: reason.into(),
        }
    }

    pub fn invalid(message: impl Into<String>) -> Self {
        Self::InvalidStage {
            message: message.into(),
        }
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            StageError::ConnectionResolution { .. } => ErrorKind::ConnectionResolution,
            StageError::Transfer { .. } => ErrorKind::Transfer,
            StageError::StorageWrite { .. } => ErrorKind::StorageWrite,
            StageError::ObjectExists { .. } => ErrorKind::ObjectExists,
            StageError::Load { .. } => ErrorKind::Load,
            StageError::DataQuality { .. } => ErrorKind::DataQuality,
            StageError::InvalidStage { .. } => ErrorKind::InvalidStage,
            StageError::Timeout { .. } => ErrorKind::Timeout,
            StageError::Cancelled => ErrorKind::Cancelled,
        }
    }

    /// Whether the orchestrator may re-run the stage after this error.
    ///
    /// Statement failures are retried only when the stage body is safe to
    /// re-execute. Quality failures reproduce without remediation, and
    /// resolution or configuration problems never heal on their own.
    pub fn is_retryable(&self, idempotent: bool) -> bool {
        match self {
            StageError::Transfer { .. }
            | StageError::StorageWrite { .. }
            | StageError::Timeout { .. } => true,
            StageError::Load { .. } => idempotent,
            StageError::ConnectionResolution { .. }
            | StageError::ObjectExists { .. }
            | StageError::DataQuality { .. }
            | StageError::InvalidStage { .. }
            | StageError::Cancelled => false,
        }
    }

    /// Quality failures carried by this error, if any.
    pub fn quality_failures(&self) -> &[QualityFailure] {
        match self {
            StageError::DataQuality { failures } => failures,
            _ => &[],
        }
    }
}

/// Lossy UTF-8 excerpt of an HTTP body, capped at [`BODY_EXCERPT_LIMIT`] bytes.
pub fn body_excerpt(body: &[u8]) -> String {
    let end = body.len().min(BODY_EXCERPT_LIMIT);
    let mut excerpt = String::from_utf8_lossy(&body[..end]).into_owned();
    if body.len() > BODY_EXCERPT_LIMIT {
        excerpt.push_str("...");
    }
    excerpt
}

/// Errors from building a pipeline graph.
#[derive(Debug, thiserror::Error)]
pub enum GraphError {
    #[error("Stage already defined: {id}")]
    DuplicateStage { id: String },

    #[error("Stage '{stage}' depends on unknown stage '{upstream}'")]
    UnknownUpstream { stage: String, upstream: String },

    #[error("Dependency cycle detected at stage '{stage}'")]
    Cycle { stage: String },

    #[error("Group '{group}' has no members")]
    EmptyGroup { group: String },

    #[error("Pipeline '{pipeline}' has no stages")]
    EmptyPipeline { pipeline: String },
}

/// Errors from the configuration system.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Configuration file not found: {path}")]
    FileNotFound { path: PathBuf },

    #[error("Invalid configuration: {message}")]
    Invalid { message: String },

    #[error("Configuration parse error: {message}")]
    ParseError { message: String },
}

impl From<figment::Error> for ConfigError {
    fn from(err: figment::Error) -> Self {
        ConfigError::ParseError {
            message: err.to_string(),
        }
    }
}

/// Errors from schedule evaluation and run persistence.
#[derive(Debug, thiserror::Error)]
pub enum SchedulerError {
    #[error("Invalid schedule expression '{expression}': {message}")]
    InvalidSchedule { expression: String, message: String },

    #[error("Run not found: {run_id}")]
    RunNotFound { run_id: String },

    #[error("Persistence error: {message}")]
    PersistenceError { message: String },
}

/// A type alias for results using the top-level `StagehouseError`.
pub type Result<T> = std::result::Result<T, StagehouseError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display_transfer() {
        let err = StageError::transfer("https://example.com/a.tsv.gz", 404, b"Not Found");
        assert_eq!(
            err.to_string(),
            "HTTP transfer from https://example.com/a.tsv.gz failed with status 404: Not Found"
        );
    }

    #[test]
    fn test_body_excerpt_is_bounded() {
        let body = vec![b'x'; BODY_EXCERPT_LIMIT * 4];
        let excerpt = body_excerpt(&body);
        assert_eq!(excerpt.len(), BODY_EXCERPT_LIMIT + 3);
        assert!(excerpt.ends_with("..."));
    }

    #[test]
    fn test_data_quality_lists_every_table() {
        let err = StageError::DataQuality {
            failures: vec![
                QualityFailure {
                    table: "a".into(),
                    check: "not_empty".into(),
                    message: "table is empty".into(),
                },
                QualityFailure {
                    table: "c".into(),
                    check: "not_empty".into(),
                    message: "table is empty".into(),
                },
            ],
        };
        let text = err.to_string();
        assert!(text.contains("failed for a, c"));
        assert_eq!(err.quality_failures().len(), 2);
    }

    #[test]
    fn test_retry_classification() {
        assert!(StageError::transfer("u", 503, b"").is_retryable(false));
        assert!(StageError::storage_write("b", "k", "denied").is_retryable(false));
        assert!(StageError::Timeout { timeout_secs: 5 }.is_retryable(false));
        assert!(StageError::load("COPY", "bad row").is_retryable(true));
        assert!(!StageError::load("COPY", "bad row").is_retryable(false));
        assert!(!StageError::unresolved("imdb", "missing").is_retryable(true));
        assert!(!StageError::DataQuality { failures: vec![] }.is_retryable(true));
        assert!(!StageError::Cancelled.is_retryable(true));
    }

    #[test]
    fn test_error_kind_names() {
        assert_eq!(StageError::Cancelled.kind().to_string(), "cancelled");
        assert_eq!(
            StageError::unresolved("x", "y").kind(),
            ErrorKind::ConnectionResolution
        );
        let json = serde_json::to_string(&ErrorKind::DataQuality).unwrap();
        assert_eq!(json, "\"data_quality\"");
    }

    #[test]
    fn test_error_from_io() {
        let io_err = std::io::Error::new(std::io::ErrorKind::NotFound, "file not found");
        let err: StagehouseError = io_err.into();
        assert!(matches!(err, StagehouseError::Io(_)));
    }

    #[test]
    fn test_graph_error_display() {
        let err = GraphError::UnknownUpstream {
            stage: "load".into(),
            upstream: "fetch".into(),
        };
        assert_eq!(
            err.to_string(),
            "Stage 'load' depends on unknown stage 'fetch'"
        );
    }
}
