//! # Stagehouse Operators
//!
//! Stage implementations for Stagehouse pipelines: the HTTP hook and fetch
//! transfer, SQL statement stage, bulk load transfer, star-schema transform,
//! data quality gate, the IMDb table catalog, and the configuration-driven
//! pipeline builder that wires them together.

pub mod catalog;
pub mod dag;
pub mod fetch;
pub mod http;
pub mod load;
pub mod quality;
pub mod sql;
pub mod transform;

pub use dag::{Backends, BuildError, build_pipeline, ddl_statements, validate};
pub use fetch::FetchTransfer;
pub use http::HttpHook;
pub use load::BulkLoadTransfer;
pub use quality::{BoundCheck, DataQualityGate};
pub use sql::SqlStage;
pub use transform::TransformStage;
