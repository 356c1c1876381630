//! Data quality gate.
//!
//! Every check runs, pass or fail; the stage fails with one
//! [`StageError::DataQuality`] carrying every failure, so a single run
//! shows the whole picture.

use async_trait::async_trait;
use std::sync::Arc;
use tracing::{info, warn};

use stagehouse_core::config::QualityCheck;
use stagehouse_core::error::{QualityFailure, StageError};
use stagehouse_core::stage::{RunContext, Runnable, StageKind, StageReport};
use stagehouse_core::warehouse::{SqlValue, Warehouse, validate_identifier};

/// A predicate bound to a schema-qualified table.
#[derive(Debug, Clone, PartialEq)]
pub struct BoundCheck {
    pub schema: String,
    pub table: String,
    pub check: QualityCheck,
}

impl BoundCheck {
    pub fn new(schema: impl Into<String>, table: impl Into<String>, check: QualityCheck) -> Self {
        Self {
            schema: schema.into(),
            table: table.into(),
            check,
        }
    }

    pub fn name(&self) -> &'static str {
        match self.check {
            QualityCheck::NotEmpty => "not_empty",
            QualityCheck::MinRows { .. } => "min_rows",
            QualityCheck::NoNulls { .. } => "no_nulls",
            QualityCheck::Sql { .. } => "sql",
        }
    }

    fn qualified(&self) -> String {
        format!("{}.{}", self.schema, self.table)
    }

    /// Query whose scalar result the predicate is evaluated against.
    pub fn query(&self) -> Result<String, StageError> {
        validate_identifier(&self.schema)?;
        validate_identifier(&self.table)?;
        Ok(match &self.check {
            QualityCheck::NotEmpty | QualityCheck::MinRows { .. } => {
                format!("SELECT COUNT(*) FROM {}", self.qualified())
            }
            QualityCheck::NoNulls { column } => {
                validate_identifier(column)?;
                format!("SELECT COUNT(*) FROM {} WHERE {column} IS NULL", self.qualified())
            }
            QualityCheck::Sql { query, .. } => query
                .replace("{schema}", &self.schema)
                .replace("{table}", &self.qualified()),
        })
    }

    /// `None` when the predicate holds, otherwise the failure message.
    fn judge(&self, value: &SqlValue) -> Option<String> {
        match &self.check {
            QualityCheck::NotEmpty => match value.as_i64() {
                None => Some("count query returned no result".to_string()),
                Some(n) if n < 1 => Some("contained 0 rows".to_string()),
                Some(_) => None,
            },
            QualityCheck::MinRows { rows } => match value.as_i64() {
                None => Some("count query returned no result".to_string()),
                Some(n) if n < *rows as i64 => Some(format!("contained {n} rows, expected at least {rows}")),
                Some(_) => None,
            },
            QualityCheck::NoNulls { column } => match value.as_i64() {
                Some(0) => None,
                Some(n) => Some(format!("{n} rows have NULL {column}")),
                None => Some("null count query returned no result".to_string()),
            },
            QualityCheck::Sql { expected, .. } => {
                (!values_match(value, expected)).then(|| format!("expected {expected}, got {value}"))
            }
        }
    }
}

fn values_match(actual: &SqlValue, expected: &SqlValue) -> bool {
    if actual == expected {
        return true;
    }
    match (actual, expected) {
        (SqlValue::Null, _) | (_, SqlValue::Null) => false,
        (SqlValue::Float(a), SqlValue::Integer(b)) | (SqlValue::Integer(b), SqlValue::Float(a)) => {
            *a == *b as f64
        }
        _ => match (actual.as_i64(), expected.as_i64()) {
            (Some(a), Some(b)) => a == b,
            _ => actual.to_string() == expected.to_string(),
        },
    }
}

pub struct DataQualityGate {
    checks: Vec<BoundCheck>,
    warehouse: Arc<dyn Warehouse>,
}

impl DataQualityGate {
    pub fn new(checks: Vec<BoundCheck>, warehouse: Arc<dyn Warehouse>) -> Self {
        Self { checks, warehouse }
    }

    /// The minimum gate: every table must be non-empty.
    pub fn not_empty<S: AsRef<str>>(schema: &str, tables: &[S], warehouse: Arc<dyn Warehouse>) -> Self {
        let checks = tables
            .iter()
            .map(|t| BoundCheck::new(schema, t.as_ref(), QualityCheck::NotEmpty))
            .collect();
        Self::new(checks, warehouse)
    }

    pub fn checks(&self) -> &[BoundCheck] {
        &self.checks
    }

    /// Evaluate every check; returns the failures, empty when all hold.
    pub async fn evaluate(&self) -> Vec<QualityFailure> {
        let mut failures = Vec::new();
        for check in &self.checks {
            let outcome = match check.query() {
                Ok(sql) => match self.warehouse.query_scalar(&sql).await {
                    Ok(value) => check.judge(&value),
                    Err(e) => Some(format!("query failed: {e}")),
                },
                Err(e) => Some(e.to_string()),
            };
            match outcome {
                None => info!(table = %check.qualified(), check = check.name(), "Data quality check passed"),
                Some(message) => {
                    warn!(table = %check.qualified(), check = check.name(), %message, "Data quality check failed");
                    failures.push(QualityFailure::new(&check.table, check.name(), message));
                }
            }
        }
        failures
    }
}

#[async_trait]
impl Runnable for DataQualityGate {
    fn kind(&self) -> StageKind {
        StageKind::Quality
    }

    fn describe(&self) -> String {
        let mut tables: Vec<&str> = Vec::new();
        for check in &self.checks {
            if !tables.contains(&check.table.as_str()) {
                tables.push(&check.table);
            }
        }
        format!("{} check(s) on {}", self.checks.len(), tables.join(", "))
    }

    async fn execute(&self, ctx: &RunContext) -> Result<StageReport, StageError> {
        ctx.check_cancelled()?;
        let failures = self.evaluate().await;
        if failures.is_empty() {
            Ok(StageReport::new(format!("{} check(s) passed", self.checks.len())))
        } else {
            Err(StageError::DataQuality { failures })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;
    use pretty_assertions::assert_eq;
    use stagehouse_core::storage::OperatorStore;
    use stagehouse_core::warehouse::{SqliteWarehouse, Statement};

    async fn warehouse() -> Arc<SqliteWarehouse> {
        let wh = Arc::new(
            SqliteWarehouse::open_in_memory(Arc::new(OperatorStore::memory().unwrap()), &["public".to_string()])
                .unwrap(),
        );
        wh.execute(
            &[
                Statement::new("CREATE TABLE public.a (id INTEGER, name TEXT)"),
                Statement::new("CREATE TABLE public.b (id INTEGER, name TEXT)"),
                Statement::new("CREATE TABLE public.c (id INTEGER, name TEXT)"),
                Statement::new("INSERT INTO public.b VALUES (1, 'x'), (2, NULL)"),
            ],
            false,
        )
        .await
        .unwrap();
        wh
    }

    fn ctx() -> RunContext {
        RunContext::new("etl_imdb", NaiveDate::from_ymd_opt(2024, 1, 1).unwrap())
    }

    #[tokio::test]
    async fn test_reports_every_empty_table() {
        let gate = DataQualityGate::not_empty("public", &["a", "b", "c"], warehouse().await);
        let err = gate.execute(&ctx()).await.unwrap_err();
        let tables: Vec<&str> = err.quality_failures().iter().map(|f| f.table.as_str()).collect();
        assert_eq!(tables, vec!["a", "c"]);
        assert!(!err.is_retryable(true));
    }

    #[tokio::test]
    async fn test_all_predicates() {
        let checks = vec![
            BoundCheck::new("public", "b", QualityCheck::NotEmpty),
            BoundCheck::new("public", "b", QualityCheck::MinRows { rows: 3 }),
            BoundCheck::new("public", "b", QualityCheck::NoNulls { column: "id".into() }),
            BoundCheck::new("public", "b", QualityCheck::NoNulls { column: "name".into() }),
            BoundCheck::new(
                "public",
                "b",
                QualityCheck::Sql {
                    query: "SELECT MAX(id) FROM {table}".into(),
                    expected: SqlValue::Integer(2),
                },
            ),
        ];
        let gate = DataQualityGate::new(checks, warehouse().await);
        let failures = gate.evaluate().await;
        let names: Vec<(&str, &str)> = failures
            .iter()
            .map(|f| (f.check.as_str(), f.message.as_str()))
            .collect();
        assert_eq!(
            names,
            vec![
                ("min_rows", "contained 2 rows, expected at least 3"),
                ("no_nulls", "1 rows have NULL name"),
            ]
        );
    }

    #[tokio::test]
    async fn test_missing_table_is_a_failure_not_an_abort() {
        let gate = DataQualityGate::not_empty("public", &["missing", "b"], warehouse().await);
        let failures = gate.evaluate().await;
        assert_eq!(failures.len(), 1);
        assert_eq!(failures[0].table, "missing");
        assert!(failures[0].message.starts_with("query failed"));
    }

    #[tokio::test]
    async fn test_passing_gate_reports_count() {
        let gate = DataQualityGate::not_empty("public", &["b"], warehouse().await);
        let report = gate.execute(&ctx()).await.unwrap();
        assert_eq!(report.summary, "1 check(s) passed");
        assert_eq!(gate.describe(), "1 check(s) on b");
    }

    #[test]
    fn test_values_match_across_numeric_types() {
        assert!(values_match(&SqlValue::Float(2.0), &SqlValue::Integer(2)));
        assert!(values_match(&SqlValue::Text("5".into()), &SqlValue::Integer(5)));
        assert!(!values_match(&SqlValue::Null, &SqlValue::Integer(0)));
        assert!(values_match(&SqlValue::Null, &SqlValue::Null));
        assert!(values_match(&SqlValue::Text("ok".into()), &SqlValue::Text("ok".into())));
    }
}
