//! SQLite-backed warehouse.
//!
//! Each warehouse schema is an attached database file next to the main one
//! (`<dir>/<stem>.<schema>.db`), or an attached in-memory database when the
//! warehouse itself is in memory. Bulk copies read the staged object through
//! the shared [`ObjectStore`], decode it up front, and write it inside one
//! transaction, so a failed copy leaves the table exactly as it was.

use async_trait::async_trait;
use rusqlite::types::{ToSqlOutput, Value, ValueRef};
use rusqlite::{params_from_iter, Connection, ToSql};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use tracing::{debug, info};

use super::delimited::decode_rows;
use super::{validate_identifier, CopyRequest, SqlDialect, SqlValue, Statement, Warehouse, WriteMode};
use crate::error::StageError;
use crate::schema::ColumnType;
use crate::storage::ObjectStore;

fn attach(conn: &Connection, schema: &str, file: &str) -> Result<(), StageError> {
    if schema.eq_ignore_ascii_case("main") || schema.eq_ignore_ascii_case("temp") {
        return Ok(());
    }
    let attached: bool = conn
        .prepare("SELECT 1 FROM pragma_database_list WHERE name = ?1")
        .and_then(|mut stmt| stmt.exists([schema]))
        .map_err(|e| StageError::load("ATTACH", e.to_string()))?;
    if attached {
        return Ok(());
    }
    let sql = format!("ATTACH DATABASE ?1 AS {schema}");
    conn.execute(&sql, [file])
        .map_err(|e| StageError::load(sql.clone(), e.to_string()))?;
    debug!(schema, "Schema attached");
    Ok(())
}

impl ToSql for SqlValue {
    fn to_sql(&self) -> rusqlite::Result<ToSqlOutput<'_>> {
        Ok(match self {
            SqlValue::Null => ToSqlOutput::Owned(Value::Null),
            SqlValue::Integer(i) => ToSqlOutput::Owned(Value::Integer(*i)),
            SqlValue::Float(f) => ToSqlOutput::Owned(Value::Real(*f)),
            SqlValue::Boolean(b) => ToSqlOutput::Owned(Value::Integer(i64::from(*b))),
            SqlValue::Text(s) => ToSqlOutput::Borrowed(ValueRef::Text(s.as_bytes())),
        })
    }
}

fn from_sqlite(value: Value) -> SqlValue {
    match value {
        Value::Null => SqlValue::Null,
        Value::Integer(i) => SqlValue::Integer(i),
        Value::Real(f) => SqlValue::Float(f),
        Value::Text(s) => SqlValue::Text(s),
        Value::Blob(b) => SqlValue::Text(String::from_utf8_lossy(&b).into_owned()),
    }
}

pub struct SqliteWarehouse {
    conn: Arc<Mutex<Connection>>,
    store: Arc<dyn ObjectStore>,
    path: Option<PathBuf>,
}

impl std::fmt::Debug for SqliteWarehouse {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SqliteWarehouse")
            .field("path", &self.path)
            .field("store", &self.store.name())
            .finish()
    }
}

impl SqliteWarehouse {
    /// Open (or create) a file-backed warehouse with the given schemas attached.
    pub fn open(
        path: impl AsRef<Path>,
        store: Arc<dyn ObjectStore>,
        schemas: &[String],
    ) -> Result<Self, StageError> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent).map_err(|e| {
                StageError::load("OPEN", format!("cannot create {}: {e}", parent.display()))
            })?;
        }
        let conn = Connection::open(&path)
            .map_err(|e| StageError::load("OPEN", format!("{}: {e}", path.display())))?;
        let warehouse = Self {
            conn: Arc::new(Mutex::new(conn)),
            store,
            path: Some(path),
        };
        for schema in schemas {
            warehouse.attach_blocking(schema)?;
        }
        info!(path = %warehouse.location(), schemas = schemas.len(), "Warehouse opened");
        Ok(warehouse)
    }

    /// Open a transient warehouse held in memory.
    pub fn open_in_memory(store: Arc<dyn ObjectStore>, schemas: &[String]) -> Result<Self, StageError> {
        let conn = Connection::open_in_memory().map_err(|e| StageError::load("OPEN", e.to_string()))?;
        let warehouse = Self {
            conn: Arc::new(Mutex::new(conn)),
            store,
            path: None,
        };
        for schema in schemas {
            warehouse.attach_blocking(schema)?;
        }
        Ok(warehouse)
    }

    pub fn location(&self) -> String {
        self.path
            .as_ref()
            .map(|p| p.display().to_string())
            .unwrap_or_else(|| ":memory:".to_string())
    }

    fn schema_file(&self, schema: &str) -> String {
        match &self.path {
            Some(path) => {
                let stem = path
                    .file_stem()
                    .and_then(|s| s.to_str())
                    .unwrap_or("warehouse");
                path.with_file_name(format!("{stem}.{schema}.db"))
                    .display()
                    .to_string()
            }
            None => ":memory:".to_string(),
        }
    }

    /// Attach while opening, before the warehouse is shared.
    fn attach_blocking(&self, schema: &str) -> Result<(), StageError> {
        validate_identifier(schema)?;
        let conn = self
            .conn
            .lock()
            .map_err(|_| StageError::load("ATTACH", "warehouse connection poisoned"))?;
        attach(&conn, schema, &self.schema_file(schema))
    }

    /// Attach another schema after opening. Attaching twice is a no-op.
    pub async fn attach_schema(&self, schema: &str) -> Result<(), StageError> {
        validate_identifier(schema)?;
        let file = self.schema_file(schema);
        let schema = schema.to_string();
        self.with_conn("ATTACH", move |conn| attach(conn, &schema, &file))
            .await
    }

    /// Run `f` against the connection on the blocking pool.
    async fn with_conn<T, F>(&self, label: &str, f: F) -> Result<T, StageError>
    where
        T: Send + 'static,
        F: FnOnce(&mut Connection) -> Result<T, StageError> + Send + 'static,
    {
        let conn = Arc::clone(&self.conn);
        let label_owned = label.to_string();
        tokio::task::spawn_blocking(move || {
            let mut guard = conn
                .lock()
                .map_err(|_| StageError::load(label_owned.clone(), "warehouse connection poisoned"))?;
            f(&mut guard)
        })
        .await
        .map_err(|e| StageError::load(label, format!("task join error: {e}")))?
    }
}

fn run_statement(conn: &Connection, statement: &Statement) -> Result<u64, StageError> {
    conn.execute(&statement.sql, params_from_iter(statement.params.iter()))
        .map(|n| n as u64)
        .map_err(|e| StageError::load(statement.sql.clone(), e.to_string()))
}

fn insert_rows(
    conn: &Connection,
    target: &str,
    columns: &[String],
    rows: &[Vec<SqlValue>],
) -> rusqlite::Result<()> {
    let placeholders = (1..=columns.len())
        .map(|i| format!("?{i}"))
        .collect::<Vec<_>>()
        .join(", ");
    let sql = format!(
        "INSERT INTO {target} ({}) VALUES ({placeholders})",
        columns.join(", ")
    );
    let mut stmt = conn.prepare(&sql)?;
    for row in rows {
        stmt.execute(params_from_iter(row.iter()))?;
    }
    Ok(())
}

#[async_trait]
impl Warehouse for SqliteWarehouse {
    fn dialect(&self) -> SqlDialect {
        SqlDialect::Sqlite
    }

    async fn execute(&self, statements: &[Statement], autocommit: bool) -> Result<u64, StageError> {
        let statements = statements.to_vec();
        self.with_conn("EXECUTE", move |conn| {
            let mut affected = 0;
            if autocommit {
                for statement in &statements {
                    affected += run_statement(conn, statement)?;
                }
            } else {
                let tx = conn
                    .transaction()
                    .map_err(|e| StageError::load("BEGIN", e.to_string()))?;
                for statement in &statements {
                    affected += run_statement(&tx, statement)?;
                }
                tx.commit()
                    .map_err(|e| StageError::load("COMMIT", e.to_string()))?;
            }
            Ok(affected)
        })
        .await
    }

    async fn query_scalar(&self, sql: &str) -> Result<SqlValue, StageError> {
        let sql = sql.to_string();
        self.with_conn("QUERY", move |conn| {
            let err = |e: rusqlite::Error| StageError::load(sql.clone(), e.to_string());
            let mut stmt = conn.prepare(&sql).map_err(err)?;
            let mut rows = stmt.query([]).map_err(err)?;
            match rows.next().map_err(err)? {
                Some(row) => row.get::<_, Value>(0).map(from_sqlite).map_err(err),
                None => Ok(SqlValue::Null),
            }
        })
        .await
    }

    async fn copy_from_object_store(&self, request: &CopyRequest) -> Result<u64, StageError> {
        validate_identifier(&request.schema)?;
        validate_identifier(&request.table)?;
        let statement = request.copy_statement();

        let columns = self.table_columns(&request.schema, &request.table).await?;
        if columns.is_empty() {
            return Err(StageError::load(
                statement,
                format!("table {} does not exist", request.qualified_table()),
            ));
        }
        let names: Vec<String> = columns.iter().map(|(n, _)| n.clone()).collect();

        if request.write_mode == WriteMode::Upsert {
            if request.upsert_keys.is_empty() {
                return Err(StageError::invalid("upsert requires at least one key column"));
            }
            for key in &request.upsert_keys {
                if !names.iter().any(|n| n.eq_ignore_ascii_case(key)) {
                    return Err(StageError::invalid(format!(
                        "upsert key '{key}' is not a column of {}",
                        request.qualified_table()
                    )));
                }
            }
        }

        let payload = self
            .store
            .get_object(&request.bucket, &request.key)
            .await
            .map_err(|e| StageError::load(statement.clone(), e.to_string()))?;
        let rows = decode_rows(&payload, &request.options, &columns)
            .map_err(|e| StageError::load(statement.clone(), e))?;
        let row_count = rows.len() as u64;

        let target = request.qualified_table();
        let mode = request.write_mode;
        let keys = request.upsert_keys.join(", ");
        let scratch = format!("temp.stagehouse_upsert_{}", request.table);
        let stmt_for_task = statement.clone();

        self.with_conn("COPY", move |conn| {
            let err = |e: rusqlite::Error| StageError::load(stmt_for_task.clone(), e.to_string());
            let tx = conn.transaction().map_err(err)?;
            match mode {
                WriteMode::Replace => {
                    tx.execute(&format!("DELETE FROM {target}"), []).map_err(err)?;
                    insert_rows(&tx, &target, &names, &rows).map_err(err)?;
                }
                WriteMode::Append => {
                    insert_rows(&tx, &target, &names, &rows).map_err(err)?;
                }
                WriteMode::Upsert => {
                    tx.execute_batch(&format!(
                        "DROP TABLE IF EXISTS {scratch};
                         CREATE TEMP TABLE {} AS SELECT * FROM {target} WHERE 0;",
                        scratch.trim_start_matches("temp.")
                    ))
                    .map_err(err)?;
                    insert_rows(&tx, &scratch, &names, &rows).map_err(err)?;
                    // A key staged twice keeps its last row.
                    tx.execute(
                        &format!(
                            "DELETE FROM {scratch} WHERE rowid NOT IN \
                             (SELECT MAX(rowid) FROM {scratch} GROUP BY {keys})"
                        ),
                        [],
                    )
                    .map_err(err)?;
                    tx.execute(
                        &format!("DELETE FROM {target} WHERE ({keys}) IN (SELECT {keys} FROM {scratch})"),
                        [],
                    )
                    .map_err(err)?;
                    tx.execute(&format!("INSERT INTO {target} SELECT * FROM {scratch}"), [])
                        .map_err(err)?;
                    tx.execute(&format!("DROP TABLE {scratch}"), []).map_err(err)?;
                }
            }
            tx.commit().map_err(err)
        })
        .await?;

        info!(
            table = %request.qualified_table(),
            mode = %request.write_mode,
            rows = row_count,
            "Bulk copy committed"
        );
        Ok(row_count)
    }

    async fn table_columns(
        &self,
        schema: &str,
        table: &str,
    ) -> Result<Vec<(String, ColumnType)>, StageError> {
        validate_identifier(schema)?;
        validate_identifier(table)?;
        let sql = format!("PRAGMA {schema}.table_info({table})");
        self.with_conn("PRAGMA", move |conn| {
            let err = |e: rusqlite::Error| StageError::load(sql.clone(), e.to_string());
            let mut stmt = conn.prepare(&sql).map_err(err)?;
            let columns = stmt
                .query_map([], |row| {
                    let name: String = row.get(1)?;
                    let declared: String = row.get(2)?;
                    Ok((name, ColumnType::from_declared(&declared)))
                })
                .map_err(err)?
                .collect::<rusqlite::Result<Vec<_>>>()
                .map_err(err)?;
            Ok(columns)
        })
        .await
    }
}
