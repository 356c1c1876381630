//! Statement stage: runs a fixed list of SQL statements.

use async_trait::async_trait;
use std::sync::Arc;
use tracing::{debug, info};

use stagehouse_core::error::StageError;
use stagehouse_core::schema::TableSchema;
use stagehouse_core::stage::{RunContext, Runnable, StageKind, StageReport};
use stagehouse_core::warehouse::{Statement, Warehouse};

pub struct SqlStage {
    description: String,
    statements: Vec<Statement>,
    autocommit: bool,
    idempotent: bool,
    warehouse: Arc<dyn Warehouse>,
}

impl SqlStage {
    /// Arbitrary statements. Not assumed safe to re-run.
    pub fn new(
        description: impl Into<String>,
        statements: Vec<Statement>,
        warehouse: Arc<dyn Warehouse>,
    ) -> Self {
        Self {
            description: description.into(),
            statements,
            autocommit: true,
            idempotent: false,
            warehouse,
        }
    }

    /// `CREATE TABLE IF NOT EXISTS` for `table` in `schema`.
    pub fn create_table(table: &TableSchema, schema: &str, warehouse: Arc<dyn Warehouse>) -> Self {
        let sql = table.create_table_sql(schema, warehouse.dialect());
        Self {
            description: format!("create table {}", table.qualified_name(schema)),
            statements: vec![Statement::new(sql)],
            autocommit: true,
            idempotent: true,
            warehouse,
        }
    }

    pub fn with_autocommit(mut self, autocommit: bool) -> Self {
        self.autocommit = autocommit;
        self
    }

    /// Mark the statements as safe to re-execute after a partial failure.
    pub fn with_idempotent(mut self, idempotent: bool) -> Self {
        self.idempotent = idempotent;
        self
    }

    pub fn statements(&self) -> &[Statement] {
        &self.statements
    }
}

#[async_trait]
impl Runnable for SqlStage {
    fn kind(&self) -> StageKind {
        StageKind::Sql
    }

    fn describe(&self) -> String {
        self.description.clone()
    }

    fn idempotent(&self) -> bool {
        self.idempotent
    }

    async fn execute(&self, ctx: &RunContext) -> Result<StageReport, StageError> {
        ctx.check_cancelled()?;
        for statement in &self.statements {
            debug!(stage = %ctx.stage_id, sql = %statement.sql, params = statement.params.len(), "Executing statement");
        }
        let affected = self
            .warehouse
            .execute(&self.statements, self.autocommit)
            .await?;
        info!(stage = %ctx.stage_id, statements = self.statements.len(), affected, "Statements executed");
        Ok(StageReport::new(format!(
            "{} statement(s) executed",
            self.statements.len()
        ))
        .with_rows(affected))
    }
}
