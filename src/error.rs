//! Pass-level error type. Each periodic pass reports failures through
//! [`StatsError`]; the scheduler logs them and retries on the next tick.

use crate::ledger::LedgerError;
use crate::reserve::ReserveError;
use crate::statistic::StoreError;
use crate::valuation::ValuationError;

#[derive(Debug, thiserror::Error)]
pub enum StatsError {
    #[error("ledger read failed: {0}")]
    Ledger(#[from] LedgerError),
    #[error("statistic store failed: {0}")]
    Store(#[from] StoreError),
    #[error("valuation failed: {0}")]
    Valuation(#[from] ValuationError),
    #[error("reserve reconciliation failed: {0}")]
    Reserve(#[from] ReserveError),
}
