//! Transform stage: rebuilds star tables from staging tables.
//!
//! Each target table is cleared and re-filled inside its own transaction,
//! so a retry never duplicates rows and a failure leaves that table as it
//! was. Tables already rebuilt earlier in the same attempt stay rebuilt:
//! there is no atomicity across tables.

use async_trait::async_trait;
use std::sync::Arc;
use tracing::{debug, info};

use stagehouse_core::error::StageError;
use stagehouse_core::stage::{RunContext, Runnable, StageKind, StageReport};
use stagehouse_core::warehouse::{Statement, Warehouse};

use crate::catalog::Projection;

pub struct TransformStage {
    target_schema: String,
    staging_schema: String,
    projections: Vec<Projection>,
    warehouse: Arc<dyn Warehouse>,
}

impl TransformStage {
    pub fn new(
        target_schema: impl Into<String>,
        staging_schema: impl Into<String>,
        projections: Vec<Projection>,
        warehouse: Arc<dyn Warehouse>,
    ) -> Self {
        Self {
            target_schema: target_schema.into(),
            staging_schema: staging_schema.into(),
            projections,
            warehouse,
        }
    }

    /// Statements rebuilding one target table, in execution order.
    pub fn statements_for(&self, projection: &Projection) -> Vec<Statement> {
        vec![
            Statement::new(format!(
                "DELETE FROM {}",
                projection.table.qualified_name(&self.target_schema)
            )),
            Statement::new(projection.insert_sql(&self.target_schema, &self.staging_schema)),
        ]
    }

    pub fn tables(&self) -> Vec<&str> {
        self.projections.iter().map(|p| p.table.name.as_str()).collect()
    }
}

#[async_trait]
impl Runnable for TransformStage {
    fn kind(&self) -> StageKind {
        StageKind::Transform
    }

    fn describe(&self) -> String {
        format!(
            "rebuild {}.{{{}}} from {}",
            self.target_schema,
            self.tables().join(", "),
            self.staging_schema
        )
    }

    async fn execute(&self, ctx: &RunContext) -> Result<StageReport, StageError> {
        let mut total = 0u64;
        for projection in &self.projections {
            ctx.check_cancelled()?;
            let statements = self.statements_for(projection);
            for statement in &statements {
                debug!(stage = %ctx.stage_id, sql = %statement.sql, "Executing statement");
            }
            let affected = self.warehouse.execute(&statements, false).await?;
            let inserted = self
                .warehouse
                .query_scalar(&format!(
                    "SELECT COUNT(*) FROM {}",
                    projection.table.qualified_name(&self.target_schema)
                ))
                .await?
                .as_i64()
                .map(|n| n.max(0) as u64)
                .unwrap_or(0);
            info!(
                stage = %ctx.stage_id,
                table = %projection.table.qualified_name(&self.target_schema),
                rows = inserted,
                affected,
                "Table rebuilt"
            );
            total += inserted;
        }
        Ok(StageReport::new(format!(
            "{} table(s) rebuilt in {}",
            self.projections.len(),
            self.target_schema
        ))
        .with_rows(total))
    }
}
