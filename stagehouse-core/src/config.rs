//! Configuration system for Stagehouse.
//!
//! Uses `figment` for layered configuration: defaults -> user config ->
//! workspace config -> environment -> CLI overrides. Configuration is loaded
//! from `~/.config/stagehouse/config.toml` and/or `stagehouse.toml` in the
//! workspace directory.

use chrono::NaiveDate;
use figment::{
    Figment,
    providers::{Env, Format, Serialized, Toml},
};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};
use std::path::{Path, PathBuf};

use crate::connection::Connection;
use crate::error::ConfigError;
use crate::retry::{RetryPolicy, StagePolicy};
use crate::scheduler::PipelineSchedule;
use crate::storage::{AccessPolicy, validate_location};
use crate::warehouse::{Compression, CopyOptions, SqlValue, WriteMode, validate_identifier};

/// Name of the workspace-level configuration file.
pub const WORKSPACE_CONFIG_FILE: &str = "stagehouse.toml";

/// Top-level pipeline configuration. Immutable once loaded.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    pub name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    pub owner: String,
    pub tags: Vec<String>,
    /// Cron expression or alias such as `@daily`.
    pub schedule: String,
    /// Back-fill missed intervals when the scheduler was down.
    pub catchup: bool,
    /// No logical date before this one is ever scheduled.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub start_date: Option<NaiveDate>,
    pub retry: RetryPolicy,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub run_timeout_secs: Option<u64>,
    /// Upper bound on concurrently running stages; unbounded when unset.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_active_stages: Option<usize>,
    /// Run summaries and scheduler state. Relative paths resolve against the workspace.
    pub state_dir: PathBuf,
    /// Target warehouse schema.
    pub schema: String,
    pub warehouse_conn_id: String,
    pub object_store_conn_id: String,
    pub connections: BTreeMap<String, Connection>,
    pub datasets: Vec<DatasetConfig>,
    pub transforms: TransformConfig,
    pub quality: QualityConfig,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        let mut connections = BTreeMap::new();
        connections.insert(
            "imdb_default".to_string(),
            Connection::new("imdb_default", "https").with_host("datasets.imdbws.com"),
        );
        connections.insert(
            "object_store".to_string(),
            Connection::new("object_store", "fs").with_host(".stagehouse/lake"),
        );
        connections.insert(
            "warehouse".to_string(),
            Connection::new("warehouse", "sqlite").with_host(".stagehouse/warehouse.db"),
        );
        Self {
            name: "etl_imdb".to_string(),
            description: Some("Load IMDb title datasets into the warehouse".to_string()),
            owner: "stagehouse".to_string(),
            tags: vec!["imdb".to_string()],
            schedule: "@daily".to_string(),
            catchup: false,
            start_date: None,
            retry: RetryPolicy::default(),
            run_timeout_secs: None,
            max_active_stages: None,
            state_dir: PathBuf::from(".stagehouse"),
            schema: "public".to_string(),
            warehouse_conn_id: "warehouse".to_string(),
            object_store_conn_id: "object_store".to_string(),
            connections,
            datasets: ["title.basics", "title.ratings", "title.episode"]
                .into_iter()
                .map(DatasetConfig::imdb)
                .collect(),
            transforms: TransformConfig::default(),
            quality: QualityConfig::default(),
        }
    }
}

/// What to do when `replace = false` and the object key is already present.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum OnExisting {
    /// Keep the existing object and report the fetch as skipped.
    #[default]
    Skip,
    /// Fail the fetch with an object-exists error.
    Fail,
}

/// One source file: where it comes from, where it is staged, which table it loads.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DatasetConfig {
    pub name: String,
    #[serde(default = "default_source_conn")]
    pub conn_id: String,
    /// Path appended to the connection's base URL.
    pub endpoint: String,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub params: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content_encoding: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content_type: Option<String>,
    pub bucket: String,
    pub key: String,
    #[serde(default = "default_true")]
    pub replace: bool,
    #[serde(default)]
    pub on_existing: OnExisting,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub access_policy: Option<AccessPolicy>,
    /// Re-encode the fetched body before staging.
    #[serde(default)]
    pub compression: Compression,
    pub table: String,
    /// Structured copy options; ignored when `copy_options` is given.
    #[serde(default = "CopyOptions::gzip_tsv_with_header")]
    pub format: CopyOptions,
    /// Redshift-style COPY clauses, e.g. `["IGNOREHEADER 1", "GZIP"]`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub copy_options: Option<Vec<String>>,
    #[serde(default)]
    pub write_mode: WriteMode,
    /// Merge key for upsert; defaults to the table's primary key.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub upsert_keys: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retry: Option<RetryPolicy>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub execution_timeout_secs: Option<u64>,
}

fn default_source_conn() -> String {
    "imdb_default".to_string()
}

fn default_true() -> bool {
    true
}

impl DatasetConfig {
    /// A dataset from the public IMDb dumps, e.g. `title.basics`.
    pub fn imdb(dataset: &str) -> Self {
        let file = format!("{dataset}.tsv.gz");
        Self {
            name: dataset.replace('.', "_"),
            conn_id: default_source_conn(),
            endpoint: file.clone(),
            params: BTreeMap::new(),
            content_encoding: Some("gzip".to_string()),
            content_type: None,
            bucket: "imdb-dend-analytics".to_string(),
            key: format!("imdb/{file}"),
            replace: true,
            on_existing: OnExisting::Skip,
            access_policy: None,
            compression: Compression::None,
            table: format!("imdb_{}", dataset.replace('.', "_")),
            format: CopyOptions::gzip_tsv_with_header(),
            copy_options: None,
            write_mode: WriteMode::Replace,
            upsert_keys: Vec::new(),
            retry: None,
            execution_timeout_secs: None,
        }
    }

    /// Effective copy options: explicit clauses win over the structured form.
    pub fn effective_copy_options(&self) -> Result<CopyOptions, ConfigError> {
        match &self.copy_options {
            Some(clauses) => CopyOptions::parse_clauses(clauses).map_err(|e| ConfigError::Invalid {
                message: format!("dataset '{}': {e}", self.name),
            }),
            None => Ok(self.format.clone()),
        }
    }

    /// Retry/timeout policy for this dataset's stages.
    pub fn stage_policy(&self, pipeline_retry: &RetryPolicy) -> StagePolicy {
        StagePolicy {
            retry: self.retry.clone().unwrap_or_else(|| pipeline_retry.clone()),
            execution_timeout_secs: self.execution_timeout_secs,
        }
    }
}

/// Star-schema projection of the staging tables.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TransformConfig {
    pub enabled: bool,
    /// Schema for the star tables; the pipeline schema when unset.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub schema: Option<String>,
}

/// A quality predicate.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "check", rename_all = "snake_case")]
pub enum QualityCheck {
    /// At least one row.
    NotEmpty,
    MinRows { rows: u64 },
    NoNulls { column: String },
    /// `query` must return `expected` as its scalar result.
    Sql { query: String, expected: SqlValue },
}

/// A predicate bound to one table.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TableCheck {
    pub table: String,
    #[serde(flatten)]
    pub check: QualityCheck,
}

/// Post-load quality gate.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct QualityConfig {
    /// Tables that must be non-empty. Empty means every loaded table.
    pub tables: Vec<String>,
    /// Additional predicates.
    pub checks: Vec<TableCheck>,
}

impl PipelineConfig {
    /// Structural validation; does not consult the table catalog.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let invalid = |message: String| ConfigError::Invalid { message };

        if self.name.trim().is_empty() {
            return Err(invalid("pipeline name must not be empty".into()));
        }
        PipelineSchedule::parse(&self.schedule).map_err(|e| invalid(e.to_string()))?;
        validate_identifier(&self.schema).map_err(|e| invalid(e.to_string()))?;
        if let Some(schema) = &self.transforms.schema {
            validate_identifier(schema).map_err(|e| invalid(e.to_string()))?;
        }
        if self.datasets.is_empty() {
            return Err(invalid("at least one dataset is required".into()));
        }
        if self.max_active_stages == Some(0) {
            return Err(invalid("max_active_stages must be at least 1".into()));
        }

        let mut names = HashSet::new();
        let mut tables = HashSet::new();
        let mut objects = HashSet::new();
        for dataset in &self.datasets {
            if !names.insert(dataset.name.as_str()) {
                return Err(invalid(format!("duplicate dataset name '{}'", dataset.name)));
            }
            if !tables.insert(dataset.table.as_str()) {
                return Err(invalid(format!(
                    "table '{}' is loaded by more than one dataset",
                    dataset.table
                )));
            }
            if !objects.insert((dataset.bucket.as_str(), dataset.key.as_str())) {
                return Err(invalid(format!(
                    "object {}/{} is written by more than one dataset",
                    dataset.bucket, dataset.key
                )));
            }
            validate_identifier(&dataset.name).map_err(|e| invalid(e.to_string()))?;
            validate_identifier(&dataset.table).map_err(|e| invalid(e.to_string()))?;
            validate_location(&dataset.bucket, &dataset.key).map_err(|e| invalid(e.to_string()))?;
            if dataset.endpoint.trim().is_empty() {
                return Err(invalid(format!("dataset '{}' has no endpoint", dataset.name)));
            }
            dataset.effective_copy_options()?;
        }

        for table in self.quality.tables.iter().chain(self.quality.checks.iter().map(|c| &c.table)) {
            validate_identifier(table).map_err(|e| invalid(e.to_string()))?;
        }
        Ok(())
    }

    /// Tables the quality gate checks for non-emptiness.
    pub fn quality_tables(&self) -> Vec<String> {
        if self.quality.tables.is_empty() {
            self.datasets.iter().map(|d| d.table.clone()).collect()
        } else {
            self.quality.tables.clone()
        }
    }

    /// Resolve the state directory against `workspace`.
    pub fn state_dir_in(&self, workspace: &Path) -> PathBuf {
        if self.state_dir.is_absolute() {
            self.state_dir.clone()
        } else {
            workspace.join(&self.state_dir)
        }
    }
}

/// Values given on the command line; only set fields override.
#[derive(Debug, Clone, Default, Serialize)]
pub struct ConfigOverrides {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub schedule: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub catchup: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub run_timeout_secs: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub state_dir: Option<PathBuf>,
}

/// Path of the user-level config file, if a home directory is known.
pub fn user_config_path() -> Option<PathBuf> {
    directories::ProjectDirs::from("dev", "stagehouse", "stagehouse")
        .map(|dirs| dirs.config_dir().join("config.toml"))
}

/// Load configuration from layered sources.
///
/// Priority (highest to lowest):
/// 1. Explicit overrides
/// 2. Environment variables (prefixed with `STAGEHOUSE_`, `__` nests)
/// 3. Explicit config file, or workspace `stagehouse.toml`
/// 4. User config (`~/.config/stagehouse/config.toml`)
/// 5. Built-in defaults
pub fn load_config(
    workspace: Option<&Path>,
    config_path: Option<&Path>,
    overrides: Option<&ConfigOverrides>,
) -> Result<PipelineConfig, ConfigError> {
    let mut figment = Figment::from(Serialized::defaults(PipelineConfig::default()));

    if let Some(user_config) = user_config_path().filter(|p| p.exists()) {
        figment = figment.merge(Toml::file(user_config));
    }

    match config_path {
        Some(path) => {
            if !path.exists() {
                return Err(ConfigError::FileNotFound {
                    path: path.to_path_buf(),
                });
            }
            figment = figment.merge(Toml::file(path));
        }
        None => {
            if let Some(ws) = workspace {
                let ws_config = ws.join(WORKSPACE_CONFIG_FILE);
                if ws_config.exists() {
                    figment = figment.merge(Toml::file(ws_config));
                }
            }
        }
    }

    // STAGEHOUSE_SCHEDULE, STAGEHOUSE_RETRY__RETRIES, ...; connection URIs are read separately.
    figment = figment.merge(
        Env::prefixed("STAGEHOUSE_")
            .filter(|key| !key.as_str().to_ascii_lowercase().starts_with("conn_"))
            .split("__"),
    );

    if let Some(overrides) = overrides {
        figment = figment.merge(Serialized::defaults(overrides));
    }

    let config: PipelineConfig = figment.extract()?;
    config.validate()?;
    Ok(config)
}

/// Starter configuration written by `config init`.
pub fn config_template() -> Result<String, ConfigError> {
    toml::to_string_pretty(&PipelineConfig::default()).map_err(|e| ConfigError::ParseError {
        message: e.to_string(),
    })
}
