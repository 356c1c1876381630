//! Pipeline graph, executor, and run state.

pub mod executor;
pub mod graph;
pub mod types;

pub use executor::PipelineExecutor;
pub use graph::{GraphBuilder, GraphNode, PipelineGraph};
pub use types::{
    AttemptRecord, ErrorSummary, PipelineRun, RunMetrics, RunStatus, StageOutcome, StageState,
};
