//! Checkpointed statistics passes.
//!
//! Each accumulating pass reads the high-water mark of its stream(s),
//! fetches the grouped delta for every row's `(cursor, high_water]` range,
//! folds it into the stored totals and writes totals and cursor back
//! together. Gauge passes recompute their value from scratch each run.

mod address;
mod asset;
mod chain;
mod liquidity;
mod token;

use alloy::primitives::U256;
use std::collections::{BTreeSet, HashMap};
use std::future::Future;
use tracing::warn;

use crate::ledger::{IdRange, LedgerError, TokenBasic};
use crate::scheduler::PassOutcome;
use crate::valuation::ValuationError;

pub use address::{AssetAddressPass, ChainAddressPass};
pub use asset::AssetStatisticsPass;
pub use chain::ChainStatisticsPass;
pub use liquidity::TokenLiquidityPass;
pub use token::TokenStatisticsPass;

/// Why one row could not be advanced. The row keeps its old cursor and is
/// retried next tick; other rows are unaffected.
#[derive(Debug, thiserror::Error)]
pub(crate) enum FoldError {
    #[error("accumulated amount overflowed 256 bits")]
    AmountOverflow,
    #[error("counter overflowed")]
    CounterOverflow,
    #[error(transparent)]
    Valuation(#[from] ValuationError),
}

pub(crate) fn accumulate(total: U256, delta: U256) -> Result<U256, FoldError> {
    total.checked_add(delta).ok_or(FoldError::AmountOverflow)
}

pub(crate) fn count(total: u64, delta: u64) -> Result<u64, FoldError> {
    total.checked_add(delta).ok_or(FoldError::CounterOverflow)
}

/// Issues one grouped query per distinct cursor below `high_water`, so
/// rows sitting at different cursors each see exactly their own range.
pub(crate) async fn deltas_by_cursor<V, F, Fut>(
    cursors: impl IntoIterator<Item = u64>,
    high_water: u64,
    mut fetch: F,
) -> Result<HashMap<u64, V>, LedgerError>
where
    F: FnMut(IdRange) -> Fut,
    Fut: Future<Output = Result<V, LedgerError>>,
{
    let distinct: BTreeSet<u64> = cursors
        .into_iter()
        .filter(|cursor| *cursor < high_water)
        .collect();

    let mut deltas = HashMap::with_capacity(distinct.len());
    for after in distinct {
        deltas.insert(after, fetch(IdRange::new(after, high_water)).await?);
    }

    Ok(deltas)
}

/// Price of the BTC reference basic, or `None` (with a warning) when it
/// is missing or unpriced.
pub(crate) fn btc_reference_price(basics: &[TokenBasic], reference: &str) -> Option<u64> {
    match basics.iter().find(|basic| basic.name == reference) {
        Some(basic) if basic.price > 0 => Some(basic.price),
        Some(_) => {
            warn!(reference, "BTC reference asset has no price; BTC valuations left at zero");
            None
        }
        None => {
            warn!(reference, "BTC reference asset not in catalog; BTC valuations left at zero");
            None
        }
    }
}

#[derive(Debug, Default)]
pub(crate) struct Tally {
    pub(crate) updated: usize,
    pub(crate) failed: usize,
}

impl From<Tally> for PassOutcome {
    fn from(tally: Tally) -> Self {
        Self::Completed {
            updated: tally.updated,
            failed: tally.failed,
        }
    }
}

#[cfg(test)]
mod tests {
    use proptest::prelude::*;
    use std::sync::Mutex;

    use super::*;
    use crate::chain::ChainId;
    use crate::test_utils::WBTC_PRICE;

    fn basic(name: &str, price: u64) -> TokenBasic {
        TokenBasic {
            name: name.to_owned(),
            home_chain: ChainId::ETHEREUM,
            decimals: 8,
            price,
            reserve_tracked: true,
        }
    }

    #[tokio::test]
    async fn one_query_per_distinct_cursor_below_high_water() {
        let seen = Mutex::new(Vec::new());

        let deltas = deltas_by_cursor([0, 40, 0, 100, 120, 40], 100, |range| {
            seen.lock().unwrap().push(range);
            async move { Ok::<_, LedgerError>(range.through - range.after) }
        })
        .await
        .unwrap();

        assert_eq!(
            *seen.lock().unwrap(),
            vec![IdRange::new(0, 100), IdRange::new(40, 100)]
        );
        assert_eq!(deltas[&0], 100);
        assert_eq!(deltas[&40], 60);
        assert!(!deltas.contains_key(&100));
    }

    #[tokio::test]
    async fn nothing_is_fetched_when_every_cursor_is_current() {
        let deltas = deltas_by_cursor([7, 7], 7, |_| async {
            Err::<u64, _>(LedgerError::AmountOverflow)
        })
        .await
        .unwrap();

        assert!(deltas.is_empty());
    }

    #[test]
    fn btc_reference_price_requires_priced_basic() {
        let basics = vec![basic("WBTC", WBTC_PRICE), basic("FREE", 0)];

        assert_eq!(btc_reference_price(&basics, "WBTC"), Some(WBTC_PRICE));
        assert_eq!(btc_reference_price(&basics, "FREE"), None);
        assert_eq!(btc_reference_price(&basics, "renBTC"), None);
    }

    #[test]
    fn accumulate_reports_overflow() {
        assert!(matches!(
            accumulate(U256::MAX, U256::from(1u8)),
            Err(FoldError::AmountOverflow)
        ));
        assert!(matches!(count(u64::MAX, 1), Err(FoldError::CounterOverflow)));
    }

    proptest! {
        #[test]
        fn accumulate_is_exact_addition(
            old in any::<u128>(),
            delta in any::<u128>(),
        ) {
            let total = accumulate(U256::from(old), U256::from(delta)).unwrap();
            prop_assert_eq!(total, U256::from(old) + U256::from(delta));
            prop_assert_eq!(total - U256::from(delta), U256::from(old));
        }
    }
}
