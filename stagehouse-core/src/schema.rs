//! Table schema model and CREATE TABLE rendering.
//!
//! A [`TableSchema`] is the single source of truth for a table's column names
//! and types. DDL is always `CREATE TABLE IF NOT EXISTS`, so applying the
//! same definition twice is a no-op.

use serde::{Deserialize, Serialize};
use std::fmt;

use crate::warehouse::SqlDialect;

/// Semantic column type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ColumnType {
    /// Variable-length string; `None` means unbounded (`VARCHAR(MAX)`).
    Varchar(Option<u32>),
    Integer,
    Float,
    Boolean,
}

impl ColumnType {
    pub fn render(&self, dialect: SqlDialect) -> String {
        match (self, dialect) {
            (ColumnType::Varchar(Some(n)), _) => format!("VARCHAR({n})"),
            (ColumnType::Varchar(None), SqlDialect::Redshift) => "VARCHAR(MAX)".to_string(),
            (ColumnType::Varchar(None), SqlDialect::Sqlite) => "TEXT".to_string(),
            (ColumnType::Integer, _) => "INTEGER".to_string(),
            (ColumnType::Float, SqlDialect::Redshift) => "FLOAT".to_string(),
            (ColumnType::Float, SqlDialect::Sqlite) => "REAL".to_string(),
            (ColumnType::Boolean, _) => "BOOLEAN".to_string(),
        }
    }

    /// Map a declared SQL type name back to a semantic type.
    pub fn from_declared(declared: &str) -> ColumnType {
        let upper = declared.trim().to_ascii_uppercase();
        if upper.contains("INT") {
            ColumnType::Integer
        } else if upper.contains("BOOL") {
            ColumnType::Boolean
        } else if upper.contains("REAL")
            || upper.contains("FLOA")
            || upper.contains("DOUB")
            || upper.contains("NUMERIC")
            || upper.contains("DECIMAL")
        {
            ColumnType::Float
        } else {
            ColumnType::Varchar(declared_length(&upper))
        }
    }
}

/// Length bound of `VARCHAR(n)` / `CHAR(n)`; `None` for `MAX` or no bound.
fn declared_length(upper: &str) -> Option<u32> {
    let open = upper.find('(')?;
    let close = upper[open..].find(')')? + open;
    upper[open + 1..close].trim().parse().ok()
}

impl fmt::Display for ColumnType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ColumnType::Varchar(_) => write!(f, "string"),
            ColumnType::Integer => write!(f, "integer"),
            ColumnType::Float => write!(f, "float"),
            ColumnType::Boolean => write!(f, "boolean"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ColumnDef {
    pub name: String,
    pub ty: ColumnType,
    #[serde(default = "default_nullable")]
    pub nullable: bool,
}

fn default_nullable() -> bool {
    true
}

impl ColumnDef {
    pub fn new(name: impl Into<String>, ty: ColumnType) -> Self {
        Self {
            name: name.into(),
            ty,
            nullable: true,
        }
    }

    pub fn not_null(mut self) -> Self {
        self.nullable = false;
        self
    }
}

/// Table name, ordered columns, and optional primary key.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TableSchema {
    pub name: String,
    pub columns: Vec<ColumnDef>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub primary_key: Vec<String>,
}

impl TableSchema {
    pub fn new(name: impl Into<String>, columns: Vec<ColumnDef>) -> Self {
        Self {
            name: name.into(),
            columns,
            primary_key: Vec::new(),
        }
    }

    pub fn with_primary_key(mut self, columns: &[&str]) -> Self {
        self.primary_key = columns.iter().map(|c| c.to_string()).collect();
        self
    }

    pub fn column_names(&self) -> Vec<&str> {
        self.columns.iter().map(|c| c.name.as_str()).collect()
    }

    pub fn column(&self, name: &str) -> Option<&ColumnDef> {
        self.columns.iter().find(|c| c.name == name)
    }

    pub fn qualified_name(&self, schema: &str) -> String {
        format!("{schema}.{}", self.name)
    }

    /// Idempotent DDL for this table in `schema`.
    pub fn create_table_sql(&self, schema: &str, dialect: SqlDialect) -> String {
        let mut lines: Vec<String> = self
            .columns
            .iter()
            .map(|c| {
                let mut line = format!("    {} {}", c.name, c.ty.render(dialect));
                if !c.nullable {
                    line.push_str(" NOT NULL");
                }
                line
            })
            .collect();
        if !self.primary_key.is_empty() {
            lines.push(format!("    PRIMARY KEY ({})", self.primary_key.join(", ")));
        }
        format!(
            "CREATE TABLE IF NOT EXISTS {} (\n{}\n);",
            self.qualified_name(schema),
            lines.join(",\n")
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn ratings() -> TableSchema {
        TableSchema::new(
            "imdb_title_ratings",
            vec![
                ColumnDef::new("tconst", ColumnType::Varchar(Some(255))).not_null(),
                ColumnDef::new("averageRating", ColumnType::Float),
                ColumnDef::new("numVotes", ColumnType::Integer),
            ],
        )
    }

    #[test]
    fn test_create_table_redshift() {
        let sql = ratings().create_table_sql("public", SqlDialect::Redshift);
        assert_eq!(
            sql,
            "CREATE TABLE IF NOT EXISTS public.imdb_title_ratings (\n    tconst VARCHAR(255) NOT NULL,\n    averageRating FLOAT,\n    numVotes INTEGER\n);"
        );
    }

    #[test]
    fn test_create_table_sqlite_with_primary_key() {
        let table = TableSchema::new(
            "dim_title",
            vec![
                ColumnDef::new("tconst", ColumnType::Varchar(Some(255))).not_null(),
                ColumnDef::new("primary_title", ColumnType::Varchar(None)),
            ],
        )
        .with_primary_key(&["tconst"]);
        let sql = table.create_table_sql("main", SqlDialect::Sqlite);
        assert!(sql.starts_with("CREATE TABLE IF NOT EXISTS main.dim_title"));
        assert!(sql.contains("primary_title TEXT"));
        assert!(sql.contains("PRIMARY KEY (tconst)"));
    }

    #[test]
    fn test_from_declared() {
        assert_eq!(ColumnType::from_declared("VARCHAR(255)"), ColumnType::Varchar(Some(255)));
        assert_eq!(ColumnType::from_declared("VARCHAR(MAX)"), ColumnType::Varchar(None));
        assert_eq!(ColumnType::from_declared("TEXT"), ColumnType::Varchar(None));
        assert_eq!(ColumnType::from_declared("integer"), ColumnType::Integer);
        assert_eq!(ColumnType::from_declared("FLOAT"), ColumnType::Float);
        assert_eq!(ColumnType::from_declared("REAL"), ColumnType::Float);
        assert_eq!(ColumnType::from_declared("BOOLEAN"), ColumnType::Boolean);
        assert_eq!(ColumnType::from_declared(""), ColumnType::Varchar(None));
    }

    #[test]
    fn test_column_lookup() {
        let table = ratings();
        assert_eq!(table.column_names(), vec!["tconst", "averageRating", "numVotes"]);
        assert_eq!(table.column("numVotes").unwrap().ty, ColumnType::Integer);
        assert!(table.column("missing").is_none());
    }
}
