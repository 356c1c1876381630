//! Bulk load transfer: staged object into a warehouse table.

use async_trait::async_trait;
use std::sync::Arc;
use tracing::info;

use stagehouse_core::error::StageError;
use stagehouse_core::stage::{RunContext, Runnable, StageKind, StageReport};
use stagehouse_core::warehouse::{CopyRequest, Warehouse, WriteMode};

pub struct BulkLoadTransfer {
    request: CopyRequest,
    warehouse: Arc<dyn Warehouse>,
}

impl BulkLoadTransfer {
    pub fn new(request: CopyRequest, warehouse: Arc<dyn Warehouse>) -> Self {
        Self { request, warehouse }
    }

    pub fn request(&self) -> &CopyRequest {
        &self.request
    }
}

#[async_trait]
impl Runnable for BulkLoadTransfer {
    fn kind(&self) -> StageKind {
        StageKind::Load
    }

    fn describe(&self) -> String {
        format!("{} [{}]", self.request.copy_statement(), self.request.write_mode)
    }

    /// Appending the same file twice duplicates rows; the other modes
    /// converge on the same table contents.
    fn idempotent(&self) -> bool {
        self.request.write_mode != WriteMode::Append
    }

    async fn execute(&self, ctx: &RunContext) -> Result<StageReport, StageError> {
        ctx.check_cancelled()?;
        let rows = self.warehouse.copy_from_object_store(&self.request).await?;
        info!(
            stage = %ctx.stage_id,
            table = %self.request.qualified_table(),
            mode = %self.request.write_mode,
            rows,
            "Table loaded"
        );
        Ok(StageReport::new(format!(
            "{} row(s) into {}",
            rows,
            self.request.qualified_table()
        ))
        .with_rows(rows))
    }
}
