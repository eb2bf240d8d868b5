//! Transaction envelope boundary.
//!
//! The begin/commit implementation lives outside this crate. In
//! auto-transaction mode the dispatcher calls `begin` before the first unit
//! of a drained batch and `commit` after the last one settles, both while
//! holding the named lock.

use crate::engine::EngineHandle;
use crate::error::GateResult;

/// Begin/commit hooks wrapped around a batch of units.
pub trait TransactionEnvelope: Send + Sync {
    /// Runs before the first unit of a batch.
    fn begin(&self, engine: &EngineHandle) -> GateResult<()>;

    /// Runs after the last unit of a batch.
    fn commit(&self, engine: &EngineHandle) -> GateResult<()>;
}

/// Envelope that does nothing.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoTransaction;

impl TransactionEnvelope for NoTransaction {
    fn begin(&self, _engine: &EngineHandle) -> GateResult<()> {
        Ok(())
    }

    fn commit(&self, _engine: &EngineHandle) -> GateResult<()> {
        Ok(())
    }
}
