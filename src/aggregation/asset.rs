use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, error};

use super::{FoldError, Tally, accumulate, btc_reference_price, count, deltas_by_cursor};
use crate::error::StatsError;
use crate::ledger::{CARRY_DIGITS, Delta, LedgerReader, Stream, TokenBasic};
use crate::scheduler::{PassOutcome, StatsPass};
use crate::statistic::{AssetStatistic, StatisticStore};
use crate::valuation::{ten_pow, valuate};

/// Source-transfer volume per Token Basic, normalised to the basic's
/// precision.
pub struct AssetStatisticsPass {
    ledger: Arc<dyn LedgerReader>,
    store: Arc<dyn StatisticStore>,
    btc_reference: String,
}

impl AssetStatisticsPass {
    pub fn new(
        ledger: Arc<dyn LedgerReader>,
        store: Arc<dyn StatisticStore>,
        btc_reference: impl Into<String>,
    ) -> Self {
        Self {
            ledger,
            store,
            btc_reference: btc_reference.into(),
        }
    }
}

fn fold_asset(
    row: &AssetStatistic,
    basic: &TokenBasic,
    btc_price: Option<u64>,
    delta: Delta,
    high_water: u64,
) -> Result<AssetStatistic, FoldError> {
    if row.last_check_id >= high_water {
        return Ok(row.clone());
    }

    let unit = ten_pow(CARRY_DIGITS)?;
    let fine = accumulate(row.carry, delta.amount)?;
    let amount = accumulate(row.amount, fine / unit)?;

    Ok(AssetStatistic {
        txn_count: count(row.txn_count, delta.count)?,
        valuation: valuate(amount, basic.decimals, basic.price, btc_price)?,
        amount,
        carry: fine % unit,
        last_check_id: high_water,
        ..row.clone()
    })
}

#[async_trait]
impl StatsPass for AssetStatisticsPass {
    fn name(&self) -> &'static str {
        "asset_statistics"
    }

    async fn run_once(&self) -> Result<PassOutcome, StatsError> {
        let high_water = self.ledger.highest_id(Stream::Source).await?;

        let basics = self.ledger.list_known_basics().await?;
        let btc_price = btc_reference_price(&basics, &self.btc_reference);

        let mut stored: HashMap<String, AssetStatistic> = self
            .store
            .load_asset_statistics()
            .await?
            .into_iter()
            .map(|row| (row.name.clone(), row))
            .collect();

        let pending: Vec<(&TokenBasic, AssetStatistic)> = basics
            .iter()
            .filter_map(|basic| {
                let (row, fresh) = match stored.remove(&basic.name) {
                    Some(row) => (row, false),
                    None => (AssetStatistic::empty(basic.name.clone()), true),
                };
                (fresh || row.last_check_id < high_water).then_some((basic, row))
            })
            .collect();

        if !stored.is_empty() {
            debug!(stale = stored.len(), "Asset statistics without catalog entry left as is");
        }

        if pending.is_empty() {
            return Ok(PassOutcome::UpToDate);
        }

        let deltas = deltas_by_cursor(
            pending.iter().map(|(_, row)| row.last_check_id),
            high_water,
            |range| self.ledger.basic_deltas_in_range(range),
        )
        .await?;

        let mut tally = Tally::default();

        for (basic, row) in pending {
            let delta = deltas
                .get(&row.last_check_id)
                .and_then(|by_basic| by_basic.get(&basic.name))
                .copied()
                .unwrap_or_default();

            let next = match fold_asset(&row, basic, btc_price, delta, high_water) {
                Ok(next) => next,
                Err(error) => {
                    error!(asset = %basic.name, %error, "Failed to fold asset statistic");
                    tally.failed += 1;
                    continue;
                }
            };

            match self.store.upsert_asset_statistic(&next).await {
                Ok(()) => tally.updated += 1,
                Err(error) => {
                    error!(asset = %basic.name, %error, "Failed to persist asset statistic");
                    tally.failed += 1;
                }
            }
        }

        Ok(tally.into())
    }
}
