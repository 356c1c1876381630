//! Configuration-driven pipeline builder.
//!
//! One [`PipelineConfig`] yields one graph:
//!
//! ```text
//! start >> fetch_data.* >> create_tables.* >> stage_data.* [>> transform_data] >> data_quality >> end
//! ```
//!
//! Every `*` layer is a fan-out group with one member per dataset (or per
//! table). Backends are opened from the connection registry, so the same
//! configuration runs against a local lake and SQLite file or anything else
//! registered under the configured connection ids.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::info;

use stagehouse_core::config::{DatasetConfig, PipelineConfig, QualityCheck};
use stagehouse_core::connection::{Connection, ConnectionRegistry};
use stagehouse_core::error::{ConfigError, GraphError, StageError};
use stagehouse_core::pipeline::{GraphBuilder, PipelineGraph};
use stagehouse_core::retry::StagePolicy;
use stagehouse_core::schema::TableSchema;
use stagehouse_core::stage::{EmptyStage, Runnable};
use stagehouse_core::storage::{ObjectStore, OperatorStore};
use stagehouse_core::warehouse::{CopyRequest, SqlDialect, SqliteWarehouse, Warehouse, WriteMode};

use crate::catalog::{self, Projection};
use crate::fetch::FetchTransfer;
use crate::http::{DEFAULT_HTTP_TIMEOUT, HttpHook};
use crate::load::BulkLoadTransfer;
use crate::quality::{BoundCheck, DataQualityGate};
use crate::sql::SqlStage;
use crate::transform::TransformStage;

/// Errors from turning a configuration into a runnable graph.
#[derive(Debug, thiserror::Error)]
pub enum BuildError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Graph(#[from] GraphError),

    #[error("Backend could not be opened: {0}")]
    Backend(#[from] StageError),
}

/// Shared clients every stage of every run works through.
#[derive(Clone)]
pub struct Backends {
    pub registry: Arc<dyn ConnectionRegistry>,
    pub store: Arc<dyn ObjectStore>,
    pub warehouse: Arc<dyn Warehouse>,
    pub http: HttpHook,
}

impl Backends {
    /// Resolve the object store and warehouse connections and open them.
    /// Relative paths resolve against `workspace`.
    pub fn open(
        config: &PipelineConfig,
        registry: Arc<dyn ConnectionRegistry>,
        workspace: &Path,
    ) -> Result<Self, BuildError> {
        let store_conn = registry.resolve(&config.object_store_conn_id)?;
        let store = open_object_store(&store_conn, workspace)?;
        let warehouse_conn = registry.resolve(&config.warehouse_conn_id)?;
        let warehouse = open_warehouse(&warehouse_conn, store.clone(), &schemas(config), workspace)?;
        let http = HttpHook::new(DEFAULT_HTTP_TIMEOUT)?;
        Ok(Self {
            registry,
            store,
            warehouse,
            http,
        })
    }
}

fn resolve_path(location: &str, workspace: &Path) -> PathBuf {
    let path = PathBuf::from(location);
    if path.is_absolute() {
        path
    } else {
        workspace.join(path)
    }
}

/// Object store for an `fs` or `memory` connection.
pub fn open_object_store(
    conn: &Connection,
    workspace: &Path,
) -> Result<Arc<dyn ObjectStore>, StageError> {
    match conn.conn_type.as_str() {
        "fs" | "file" => {
            let root = resolve_path(conn.location()?, workspace);
            info!(conn_id = %conn.conn_id, root = %root.display(), "Using local object store");
            Ok(Arc::new(OperatorStore::local(&root)?))
        }
        "memory" => Ok(Arc::new(OperatorStore::memory()?)),
        other => Err(StageError::unresolved(
            &conn.conn_id,
            format!("unsupported object store type '{other}'"),
        )),
    }
}

/// Warehouse for a `sqlite` connection. `:memory:` opens a transient one.
pub fn open_warehouse(
    conn: &Connection,
    store: Arc<dyn ObjectStore>,
    schemas: &[String],
    workspace: &Path,
) -> Result<Arc<dyn Warehouse>, StageError> {
    match conn.conn_type.as_str() {
        "sqlite" => {
            let location = conn.location()?;
            if location == ":memory:" {
                Ok(Arc::new(SqliteWarehouse::open_in_memory(store, schemas)?))
            } else {
                let path = resolve_path(location, workspace);
                Ok(Arc::new(SqliteWarehouse::open(path, store, schemas)?))
            }
        }
        other => Err(StageError::unresolved(
            &conn.conn_id,
            format!("unsupported warehouse type '{other}'"),
        )),
    }
}

/// Warehouse schemas the pipeline writes to.
pub fn schemas(config: &PipelineConfig) -> Vec<String> {
    let mut schemas = vec![config.schema.clone()];
    if config.transforms.enabled {
        let target = transform_schema(config);
        if !schemas.contains(&target) {
            schemas.push(target);
        }
    }
    schemas
}

fn transform_schema(config: &PipelineConfig) -> String {
    config
        .transforms
        .schema
        .clone()
        .unwrap_or_else(|| config.schema.clone())
}

/// Star projections whose staging tables are all loaded by this pipeline.
pub fn active_projections(config: &PipelineConfig) -> Vec<Projection> {
    if !config.transforms.enabled {
        return Vec::new();
    }
    catalog::star_projections()
        .into_iter()
        .filter(|p| {
            p.sources
                .iter()
                .all(|source| config.datasets.iter().any(|d| d.table == *source))
        })
        .collect()
}

/// Schema a table lives in under this configuration.
fn schema_of(config: &PipelineConfig, table: &str) -> String {
    if config.transforms.enabled && catalog::is_star_table(table) {
        transform_schema(config)
    } else {
        config.schema.clone()
    }
}

fn catalog_table(name: &str) -> Result<TableSchema, ConfigError> {
    catalog::lookup(name).ok_or_else(|| ConfigError::Invalid {
        message: format!("table '{name}' is not in the table catalog"),
    })
}

/// Merge key for an upsert: explicit keys, else the catalog primary key.
fn upsert_keys(dataset: &DatasetConfig, table: &TableSchema) -> Result<Vec<String>, ConfigError> {
    if dataset.write_mode != WriteMode::Upsert {
        return Ok(Vec::new());
    }
    if table.primary_key.is_empty() {
        return Err(ConfigError::Invalid {
            message: format!(
                "dataset '{}': upsert requires a primary key, and table '{}' declares none",
                dataset.name, table.name
            ),
        });
    }
    if dataset.upsert_keys.is_empty() {
        return Ok(table.primary_key.clone());
    }
    for key in &dataset.upsert_keys {
        if table.column(key).is_none() {
            return Err(ConfigError::Invalid {
                message: format!(
                    "dataset '{}': upsert key '{key}' is not a column of '{}'",
                    dataset.name, table.name
                ),
            });
        }
    }
    Ok(dataset.upsert_keys.clone())
}

/// Structural validation plus checks against the table catalog.
pub fn validate(config: &PipelineConfig) -> Result<(), ConfigError> {
    config.validate()?;
    for dataset in &config.datasets {
        let table = catalog_table(&dataset.table)?;
        if config.transforms.enabled && catalog::is_star_table(&table.name) {
            return Err(ConfigError::Invalid {
                message: format!(
                    "dataset '{}' loads '{}', which the transform stage rebuilds",
                    dataset.name, table.name
                ),
            });
        }
        upsert_keys(dataset, &table)?;
    }
    if config.transforms.enabled && active_projections(config).is_empty() {
        return Err(ConfigError::Invalid {
            message: "transforms are enabled but no star table has all of its staging tables loaded"
                .into(),
        });
    }
    for check in &config.quality.checks {
        let table = catalog_table(&check.table)?;
        if let QualityCheck::NoNulls { column } = &check.check {
            if table.column(column).is_none() {
                return Err(ConfigError::Invalid {
                    message: format!("quality check column '{column}' is not in '{}'", table.name),
                });
            }
        }
    }
    for table in &config.quality.tables {
        catalog_table(table)?;
    }
    Ok(())
}

/// Every table the pipeline creates, with the schema it is created in.
pub fn managed_tables(config: &PipelineConfig) -> Result<Vec<(String, TableSchema)>, ConfigError> {
    let mut tables = Vec::new();
    for dataset in &config.datasets {
        tables.push((config.schema.clone(), catalog_table(&dataset.table)?));
    }
    let target = transform_schema(config);
    for projection in active_projections(config) {
        tables.push((target.clone(), projection.table));
    }
    Ok(tables)
}

/// `CREATE TABLE IF NOT EXISTS` statements for every managed table.
pub fn ddl_statements(config: &PipelineConfig, dialect: SqlDialect) -> Result<Vec<String>, ConfigError> {
    Ok(managed_tables(config)?
        .iter()
        .map(|(schema, table)| table.create_table_sql(schema, dialect))
        .collect())
}

/// Checks run by the quality gate.
///
/// Without explicit tables, every loaded table and every rebuilt star table
/// must be non-empty.
pub fn quality_checks(config: &PipelineConfig) -> Vec<BoundCheck> {
    let mut tables = config.quality_tables();
    if config.quality.tables.is_empty() {
        tables.extend(active_projections(config).into_iter().map(|p| p.table.name));
    }
    let mut checks: Vec<BoundCheck> = tables
        .iter()
        .map(|t| BoundCheck::new(schema_of(config, t), t.as_str(), QualityCheck::NotEmpty))
        .collect();
    checks.extend(
        config
            .quality
            .checks
            .iter()
            .map(|c| BoundCheck::new(schema_of(config, &c.table), c.table.as_str(), c.check.clone())),
    );
    checks
}

type Member = (String, Arc<dyn Runnable>, Option<StagePolicy>);

/// Build the pipeline graph for `config` over `backends`.
pub fn build_pipeline(config: &PipelineConfig, backends: &Backends) -> Result<PipelineGraph, BuildError> {
    validate(config)?;

    let fetches: Vec<Member> = config
        .datasets
        .iter()
        .map(|d| {
            let stage = FetchTransfer::new(
                d.clone(),
                backends.registry.clone(),
                backends.store.clone(),
                backends.http.clone(),
            );
            (d.name.clone(), Arc::new(stage) as Arc<dyn Runnable>, Some(d.stage_policy(&config.retry)))
        })
        .collect();

    let creates: Vec<Member> = managed_tables(config)?
        .into_iter()
        .map(|(schema, table)| {
            let stage = SqlStage::create_table(&table, &schema, backends.warehouse.clone());
            (table.name.clone(), Arc::new(stage) as Arc<dyn Runnable>, None)
        })
        .collect();

    let mut loads: Vec<Member> = Vec::with_capacity(config.datasets.len());
    for d in &config.datasets {
        let table = catalog_table(&d.table)?;
        let request = CopyRequest {
            schema: config.schema.clone(),
            table: d.table.clone(),
            bucket: d.bucket.clone(),
            key: d.key.clone(),
            options: d.effective_copy_options()?,
            write_mode: d.write_mode,
            upsert_keys: upsert_keys(d, &table)?,
        };
        let stage = BulkLoadTransfer::new(request, backends.warehouse.clone());
        loads.push((
            d.name.clone(),
            Arc::new(stage) as Arc<dyn Runnable>,
            Some(d.stage_policy(&config.retry)),
        ));
    }

    let mut builder = GraphBuilder::new(config.name.clone())
        .default_policy(StagePolicy::new(config.retry.clone()))
        .stage("start", Arc::new(EmptyStage))
        .group("fetch_data", fetches)
        .group("create_tables", creates)
        .group("stage_data", loads);
    let mut layers = vec!["start", "fetch_data", "create_tables", "stage_data"];

    let projections = active_projections(config);
    if !projections.is_empty() {
        let transform = TransformStage::new(
            transform_schema(config),
            config.schema.clone(),
            projections,
            backends.warehouse.clone(),
        );
        builder = builder.stage("transform_data", Arc::new(transform));
        layers.push("transform_data");
    }

    let gate = DataQualityGate::new(quality_checks(config), backends.warehouse.clone());
    layers.extend(["data_quality", "end"]);
    let graph = builder
        .stage("data_quality", Arc::new(gate))
        .stage("end", Arc::new(EmptyStage))
        .chain(&layers)
        .build()?;

    info!(pipeline = %config.name, stages = graph.len(), "Pipeline built");
    Ok(graph)
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use stagehouse_core::config::{TableCheck, TransformConfig};
    use stagehouse_core::connection::StaticConnectionRegistry;
    use tempfile::TempDir;

    fn memory_config() -> PipelineConfig {
        let mut config = PipelineConfig::default();
        config.connections.insert(
            "object_store".into(),
            Connection::new("object_store", "memory").with_host("lake"),
        );
        config.connections.insert(
            "warehouse".into(),
            Connection::new("warehouse", "sqlite").with_host(":memory:"),
        );
        config
    }

    fn backends(config: &PipelineConfig) -> Backends {
        let registry = Arc::new(StaticConnectionRegistry::from_config(&config.connections));
        Backends::open(config, registry, Path::new(".")).unwrap()
    }

    #[test]
    fn test_default_pipeline_shape() {
        let config = memory_config();
        let graph = build_pipeline(&config, &backends(&config)).unwrap();
        let ids: Vec<&str> = graph.nodes().iter().map(|n| n.id.as_str()).collect();
        assert_eq!(ids.first(), Some(&"start"));
        assert_eq!(ids.last(), Some(&"end"));
        assert_eq!(graph.len(), 1 + 3 + 3 + 3 + 1 + 1);

        let create = graph.node("create_tables.imdb_title_ratings").unwrap();
        assert_eq!(create.upstream.len(), 3);
        assert!(create.upstream.iter().all(|u| u.starts_with("fetch_data.")));
        let gate = graph.node("data_quality").unwrap();
        assert!(gate.upstream.iter().all(|u| u.starts_with("stage_data.")));
    }

    #[test]
    fn test_transform_layer_and_schema() {
        let mut config = memory_config();
        config.transforms = TransformConfig {
            enabled: true,
            schema: Some("star".into()),
        };
        assert_eq!(schemas(&config), vec!["public", "star"]);
        let graph = build_pipeline(&config, &backends(&config)).unwrap();
        assert!(graph.node("create_tables.dim_title").is_some());
        let transform = graph.node("transform_data").unwrap();
        assert_eq!(transform.upstream.len(), 3);
        assert_eq!(graph.node("data_quality").unwrap().upstream, vec!["transform_data"]);

        let checks = quality_checks(&config);
        let fact = checks.iter().find(|c| c.table == "fact_title_rating").unwrap();
        assert_eq!(fact.schema, "star");
    }

    #[test]
    fn test_unknown_table_is_rejected() {
        let mut config = memory_config();
        config.datasets[0].table = "imdb_reviews".into();
        let err = validate(&config).unwrap_err();
        assert!(err.to_string().contains("not in the table catalog"));
    }

    #[test]
    fn test_upsert_keys_default_to_primary_key() {
        let mut config = memory_config();
        config.datasets[0].write_mode = WriteMode::Upsert;
        assert!(validate(&config).is_ok());
        let staging = catalog::lookup(&config.datasets[0].table).unwrap();
        assert_eq!(upsert_keys(&config.datasets[0], &staging).unwrap(), staging.primary_key);

        let keyless = TableSchema::new("scratch", staging.columns.clone());
        let err = upsert_keys(&config.datasets[0], &keyless).unwrap_err();
        assert!(err.to_string().contains("declares none"), "{err}");

        let mut dim = memory_config();
        dim.datasets.truncate(1);
        dim.datasets[0].table = "dim_title".into();
        dim.datasets[0].write_mode = WriteMode::Upsert;
        assert!(validate(&dim).is_ok());
        let table = catalog::lookup("dim_title").unwrap();
        assert_eq!(upsert_keys(&dim.datasets[0], &table).unwrap(), vec!["tconst"]);
    }

    #[test]
    fn test_quality_check_column_must_exist() {
        let mut config = memory_config();
        config.quality.checks.push(TableCheck {
            table: "imdb_title_ratings".into(),
            check: QualityCheck::NoNulls { column: "rating".into() },
        });
        assert!(validate(&config).is_err());
    }

    #[test]
    fn test_ddl_covers_configured_tables() {
        let statements = ddl_statements(&memory_config(), SqlDialect::Redshift).unwrap();
        assert_eq!(statements.len(), 3);
        assert!(statements[0].starts_with("CREATE TABLE IF NOT EXISTS public.imdb_title_basics"));
    }

    #[test]
    fn test_file_backends_resolve_against_workspace() {
        let dir = TempDir::new().unwrap();
        let config = PipelineConfig::default();
        let registry = Arc::new(StaticConnectionRegistry::from_config(&config.connections));
        let backends = Backends::open(&config, registry, dir.path()).unwrap();
        assert_eq!(backends.store.name(), "fs");
        assert!(dir.path().join(".stagehouse").is_dir());
    }

    #[test]
    fn test_unsupported_backend_type() {
        let conn = Connection::new("object_store", "s3").with_host("bucket");
        let err = open_object_store(&conn, Path::new(".")).err().unwrap();
        assert!(matches!(err, StageError::ConnectionResolution { .. }));
    }
}
