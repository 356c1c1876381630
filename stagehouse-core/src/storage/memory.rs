//! In-memory operator for tests and ephemeral runs.

use opendal::Operator;

pub fn build_memory_operator() -> opendal::Result<Operator> {
    Ok(Operator::new(opendal::services::Memory::default())?.finish())
}
