//! # Stagehouse Core
//!
//! Core library for the Stagehouse batch pipeline engine.
//! Provides the error taxonomy, layered configuration, connection registry,
//! the stage capability trait, retry policy, pipeline graph and executor,
//! run persistence, schedule evaluation, and the object-store and warehouse
//! backends the stages run against.

pub mod config;
pub mod connection;
pub mod error;
pub mod persistence;
pub mod pipeline;
pub mod retry;
pub mod scheduler;
pub mod schema;
pub mod stage;
pub mod storage;
pub mod warehouse;

// Re-export commonly used types at the crate root.
pub use config::{
    ConfigOverrides, DatasetConfig, OnExisting, PipelineConfig, QualityCheck, QualityConfig,
    TableCheck, TransformConfig, load_config,
};
pub use connection::{Connection, ConnectionRegistry, HttpAuth, StaticConnectionRegistry};
pub use error::{
    ConfigError, ErrorKind, GraphError, QualityFailure, Result, SchedulerError, StageError,
    StagehouseError,
};
pub use persistence::RunStore;
pub use pipeline::{
    GraphBuilder, PipelineExecutor, PipelineGraph, PipelineRun, RunStatus, StageOutcome,
    StageState,
};
pub use retry::{Backoff, RetryPolicy, StagePolicy};
pub use scheduler::{PipelineSchedule, SchedulerState};
pub use schema::{ColumnDef, ColumnType, TableSchema};
pub use stage::{EmptyStage, RunContext, Runnable, StageKind, StageReport};
pub use storage::{AccessPolicy, ObjectMeta, ObjectStore, OperatorStore, PutOptions};
pub use warehouse::{
    Compression, CopyOptions, CopyRequest, SqlDialect, SqlValue, SqliteWarehouse, Statement,
    Warehouse, WriteMode,
};
