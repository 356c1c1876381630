//! Warehouse capability: statement execution and bulk copy from the
//! object store.
//!
//! The [`Warehouse`] trait is what stages program against; the bundled
//! [`SqliteWarehouse`] backend implements it on a local SQLite file.

pub mod delimited;
pub mod sqlite;

pub use sqlite::SqliteWarehouse;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt;

use crate::error::StageError;
use crate::schema::ColumnType;
use crate::storage::object_locator;

/// SQL flavour used when rendering DDL.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum SqlDialect {
    #[default]
    Redshift,
    Sqlite,
}

/// A bound statement parameter or scalar query result.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum SqlValue {
    Null,
    Integer(i64),
    Float(f64),
    Boolean(bool),
    Text(String),
}

impl SqlValue {
    pub fn as_i64(&self) -> Option<i64> {
        match self {
            SqlValue::Integer(i) => Some(*i),
            SqlValue::Float(f) if f.fract() == 0.0 => Some(*f as i64),
            SqlValue::Boolean(b) => Some(i64::from(*b)),
            SqlValue::Text(s) => s.trim().parse().ok(),
            _ => None,
        }
    }

    pub fn is_null(&self) -> bool {
        matches!(self, SqlValue::Null)
    }
}

impl fmt::Display for SqlValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SqlValue::Null => write!(f, "NULL"),
            SqlValue::Integer(i) => write!(f, "{i}"),
            SqlValue::Float(v) => write!(f, "{v}"),
            SqlValue::Boolean(b) => write!(f, "{b}"),
            SqlValue::Text(s) => write!(f, "{s}"),
        }
    }
}

/// SQL text plus positional parameters.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Statement {
    pub sql: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub params: Vec<SqlValue>,
}

impl Statement {
    pub fn new(sql: impl Into<String>) -> Self {
        Self {
            sql: sql.into(),
            params: Vec::new(),
        }
    }

    pub fn with_params(sql: impl Into<String>, params: Vec<SqlValue>) -> Self {
        Self {
            sql: sql.into(),
            params,
        }
    }
}

/// How staged files are parsed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum ParseFormat {
    /// Delimited text, one record per line.
    #[default]
    Delimited,
    /// One JSON object per line, fields matched to column names.
    Json,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum Compression {
    #[default]
    None,
    Gzip,
}

/// Declarative parsing options for a bulk copy.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CopyOptions {
    #[serde(default)]
    pub format: ParseFormat,
    #[serde(default = "default_delimiter")]
    pub delimiter: char,
    /// Quote character; `None` means fields are never quoted.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub quote: Option<char>,
    #[serde(default)]
    pub ignore_header: u32,
    #[serde(default)]
    pub compression: Compression,
    #[serde(default = "default_null_as")]
    pub null_as: String,
}

fn default_delimiter() -> char {
    '\t'
}

fn default_null_as() -> String {
    "\\N".to_string()
}

impl Default for CopyOptions {
    fn default() -> Self {
        Self {
            format: ParseFormat::Delimited,
            delimiter: default_delimiter(),
            quote: None,
            ignore_header: 0,
            compression: Compression::None,
            null_as: default_null_as(),
        }
    }
}

fn quote_literal(value: &str) -> String {
    let escaped: String = value
        .chars()
        .map(|c| match c {
            '\t' => "\\t".to_string(),
            '\n' => "\\n".to_string(),
            '\'' => "''".to_string(),
            other => other.to_string(),
        })
        .collect();
    format!("'{escaped}'")
}

fn unquote_literal(raw: &str) -> Option<String> {
    let inner = raw.trim().strip_prefix('\'')?.strip_suffix('\'')?;
    Some(
        inner
            .replace("\\t", "\t")
            .replace("\\n", "\n")
            .replace("''", "'"),
    )
}

impl CopyOptions {
    /// IMDb dump format: gzip TSV, one header line, `\N` nulls.
    pub fn gzip_tsv_with_header() -> Self {
        Self {
            ignore_header: 1,
            compression: Compression::Gzip,
            ..Default::default()
        }
    }

    /// Render as Redshift `COPY` option clauses.
    pub fn render(&self) -> Vec<String> {
        let mut clauses = Vec::new();
        match self.format {
            ParseFormat::Json => clauses.push("FORMAT AS JSON 'auto'".to_string()),
            ParseFormat::Delimited => {
                if let Some(q) = self.quote {
                    clauses.push(format!("CSV QUOTE AS {}", quote_literal(&q.to_string())));
                }
                if self.ignore_header > 0 {
                    clauses.push(format!("IGNOREHEADER {}", self.ignore_header));
                }
                clauses.push(format!("DELIMITER {}", quote_literal(&self.delimiter.to_string())));
                clauses.push(format!("NULL AS {}", quote_literal(&self.null_as)));
            }
        }
        if self.compression == Compression::Gzip {
            clauses.push("GZIP".to_string());
        }
        clauses
    }

    /// Parse Redshift-style option clauses such as
    /// `["IGNOREHEADER 1", "DELIMITER '\t'", "GZIP"]`.
    pub fn parse_clauses<S: AsRef<str>>(clauses: &[S]) -> Result<Self, StageError> {
        let mut options = CopyOptions::default();
        for clause in clauses {
            let clause = clause.as_ref().trim();
            let upper = clause.to_ascii_uppercase();
            let bad = || StageError::invalid(format!("unsupported COPY option: {clause}"));
            if upper == "GZIP" {
                options.compression = Compression::Gzip;
            } else if upper == "CSV" {
                options.quote.get_or_insert('"');
            } else if let Some(rest) = upper.strip_prefix("IGNOREHEADER") {
                let n = rest.trim().trim_start_matches("AS").trim();
                options.ignore_header = n.parse().map_err(|_| bad())?;
            } else if upper.starts_with("DELIMITER") {
                let raw = clause["DELIMITER".len()..].trim();
                let raw = raw.strip_prefix("AS").map(str::trim).unwrap_or(raw);
                let value = unquote_literal(raw).ok_or_else(bad)?;
                let mut chars = value.chars();
                options.delimiter = chars.next().ok_or_else(bad)?;
                if chars.next().is_some() {
                    return Err(bad());
                }
            } else if upper.starts_with("CSV QUOTE") || upper.starts_with("QUOTE") {
                let start = clause.find('\'').ok_or_else(bad)?;
                let value = unquote_literal(&clause[start..]).ok_or_else(bad)?;
                options.quote = Some(value.chars().next().ok_or_else(bad)?);
            } else if upper.starts_with("NULL AS") {
                options.null_as = unquote_literal(&clause["NULL AS".len()..]).ok_or_else(bad)?;
            } else if upper.starts_with("FORMAT AS JSON") || upper == "JSON 'AUTO'" {
                options.format = ParseFormat::Json;
            } else {
                return Err(bad());
            }
        }
        Ok(options)
    }
}

/// Policy for existing rows in the target table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum WriteMode {
    /// Target reflects exactly the staged file.
    #[default]
    Replace,
    /// Staged rows are added; duplicates possible.
    Append,
    /// Rows whose key matches a staged row are replaced; others kept.
    Upsert,
}

impl fmt::Display for WriteMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            WriteMode::Replace => write!(f, "replace"),
            WriteMode::Append => write!(f, "append"),
            WriteMode::Upsert => write!(f, "upsert"),
        }
    }
}

/// One bulk-copy request: staged object into a warehouse table.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CopyRequest {
    pub schema: String,
    pub table: String,
    pub bucket: String,
    pub key: String,
    pub options: CopyOptions,
    pub write_mode: WriteMode,
    /// Merge key for [`WriteMode::Upsert`].
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub upsert_keys: Vec<String>,
}

impl CopyRequest {
    pub fn qualified_table(&self) -> String {
        format!("{}.{}", self.schema, self.table)
    }

    /// The COPY statement this request corresponds to, for logs and errors.
    pub fn copy_statement(&self) -> String {
        let mut stmt = format!(
            "COPY {} FROM {}",
            self.qualified_table(),
            quote_literal(&object_locator(&self.bucket, &self.key))
        );
        for clause in self.options.render() {
            stmt.push(' ');
            stmt.push_str(&clause);
        }
        stmt
    }
}

/// Check that `name` is a plain SQL identifier.
pub fn validate_identifier(name: &str) -> Result<(), StageError> {
    let mut chars = name.chars();
    let valid = matches!(chars.next(), Some(c) if c.is_ascii_alphabetic() || c == '_')
        && chars.all(|c| c.is_ascii_alphanumeric() || c == '_');
    if valid {
        Ok(())
    } else {
        Err(StageError::invalid(format!("invalid SQL identifier: '{name}'")))
    }
}

/// Trait for warehouse backends.
#[async_trait]
pub trait Warehouse: Send + Sync {
    fn dialect(&self) -> SqlDialect;

    /// Execute statements in order. With `autocommit`, each statement
    /// commits on its own; otherwise all run in one transaction that is
    /// rolled back on the first failure. Returns total affected rows.
    async fn execute(&self, statements: &[Statement], autocommit: bool) -> Result<u64, StageError>;

    /// First column of the first row, or `Null` if there are no rows.
    async fn query_scalar(&self, sql: &str) -> Result<SqlValue, StageError>;

    /// Load a staged object into a table in a single transaction.
    /// Returns the number of rows written.
    async fn copy_from_object_store(&self, request: &CopyRequest) -> Result<u64, StageError>;

    /// Declared columns of a table, empty if the table does not exist.
    async fn table_columns(
        &self,
        schema: &str,
        table: &str,
    ) -> Result<Vec<(String, ColumnType)>, StageError>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn request(options: CopyOptions) -> CopyRequest {
        CopyRequest {
            schema: "public".into(),
            table: "imdb_title_basics".into(),
            bucket: "imdb-dend-analytics".into(),
            key: "imdb/title.basics.tsv.gz".into(),
            options,
            write_mode: WriteMode::Replace,
            upsert_keys: vec![],
        }
    }

    #[test]
    fn test_copy_statement_rendering() {
        let stmt = request(CopyOptions::gzip_tsv_with_header()).copy_statement();
        assert_eq!(
            stmt,
            "COPY public.imdb_title_basics FROM 's3://imdb-dend-analytics/imdb/title.basics.tsv.gz' IGNOREHEADER 1 DELIMITER '\\t' NULL AS '\\N' GZIP"
        );
    }

    #[test]
    fn test_parse_redshift_clauses() {
        let options =
            CopyOptions::parse_clauses(&["IGNOREHEADER 1", "DELIMITER '\\t'", "GZIP"]).unwrap();
        assert_eq!(options, CopyOptions::gzip_tsv_with_header());

        let csv = CopyOptions::parse_clauses(&["CSV", "DELIMITER ','", "NULL AS ''"]).unwrap();
        assert_eq!(csv.quote, Some('"'));
        assert_eq!(csv.delimiter, ',');
        assert_eq!(csv.null_as, "");

        let json = CopyOptions::parse_clauses(&["FORMAT AS JSON 'auto'", "GZIP"]).unwrap();
        assert_eq!(json.format, ParseFormat::Json);
    }

    #[test]
    fn test_parse_rejects_unknown_clause() {
        let err = CopyOptions::parse_clauses(&["MAXERROR 10"]).unwrap_err();
        assert!(matches!(err, StageError::InvalidStage { .. }));
    }

    #[test]
    fn test_validate_identifier() {
        assert!(validate_identifier("public").is_ok());
        assert!(validate_identifier("imdb_title_basics").is_ok());
        assert!(validate_identifier("1abc").is_err());
        assert!(validate_identifier("a; DROP TABLE x").is_err());
        assert!(validate_identifier("").is_err());
    }

    #[test]
    fn test_sql_value_as_i64() {
        assert_eq!(SqlValue::Integer(4).as_i64(), Some(4));
        assert_eq!(SqlValue::Float(2.0).as_i64(), Some(2));
        assert_eq!(SqlValue::Text(" 7 ".into()).as_i64(), Some(7));
        assert_eq!(SqlValue::Null.as_i64(), None);
    }

    #[test]
    fn test_copy_options_serde_defaults() {
        let options: CopyOptions = toml::from_str("ignore_header = 1\ncompression = \"gzip\"").unwrap();
        assert_eq!(options, CopyOptions::gzip_tsv_with_header());
    }
}
