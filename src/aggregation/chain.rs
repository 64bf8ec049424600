use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, error};

use super::{FoldError, Tally, count, deltas_by_cursor};
use crate::chain::ChainId;
use crate::error::StatsError;
use crate::ledger::{LedgerReader, Stream};
use crate::scheduler::{PassOutcome, StatsPass};
use crate::statistic::{ChainStatistic, StatisticStore};

/// Transfer counts per chain. The relay chain counts relay-chain
/// transactions on both sides instead of transfers.
pub struct ChainStatisticsPass {
    ledger: Arc<dyn LedgerReader>,
    store: Arc<dyn StatisticStore>,
    relay_chain: ChainId,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct HighWater {
    inbound: u64,
    outbound: u64,
}

impl ChainStatisticsPass {
    pub fn new(
        ledger: Arc<dyn LedgerReader>,
        store: Arc<dyn StatisticStore>,
        relay_chain: ChainId,
    ) -> Self {
        Self {
            ledger,
            store,
            relay_chain,
        }
    }
}

/// Adds `delta` and moves the cursor only when the cursor is behind.
fn advance(counter: u64, cursor: u64, delta: u64, high_water: u64) -> Result<(u64, u64), FoldError> {
    if cursor < high_water {
        Ok((count(counter, delta)?, high_water))
    } else {
        Ok((counter, cursor))
    }
}

fn fold_chain(
    row: &ChainStatistic,
    high_water: HighWater,
    in_delta: u64,
    out_delta: u64,
) -> Result<ChainStatistic, FoldError> {
    let (in_counter, last_in_check_id) =
        advance(row.in_counter, row.last_in_check_id, in_delta, high_water.inbound)?;
    let (out_counter, last_out_check_id) =
        advance(row.out_counter, row.last_out_check_id, out_delta, high_water.outbound)?;

    Ok(ChainStatistic {
        in_counter,
        out_counter,
        last_in_check_id,
        last_out_check_id,
        ..row.clone()
    })
}

fn count_for(counts: &HashMap<u64, HashMap<ChainId, u64>>, cursor: u64, chain_id: ChainId) -> u64 {
    counts
        .get(&cursor)
        .and_then(|by_chain| by_chain.get(&chain_id))
        .copied()
        .unwrap_or(0)
}

#[async_trait]
impl StatsPass for ChainStatisticsPass {
    fn name(&self) -> &'static str {
        "chain_statistics"
    }

    async fn run_once(&self) -> Result<PassOutcome, StatsError> {
        let high_in = self.ledger.highest_id(Stream::Destination).await?;
        let high_out = self.ledger.highest_id(Stream::Source).await?;
        let high_relay = self.ledger.highest_id(Stream::Relay).await?;

        let high_water_for = |chain_id: ChainId| {
            if chain_id == self.relay_chain {
                HighWater {
                    inbound: high_relay,
                    outbound: high_relay,
                }
            } else {
                HighWater {
                    inbound: high_in,
                    outbound: high_out,
                }
            }
        };

        let chains = self.ledger.list_known_chains().await?;
        let mut stored: HashMap<ChainId, ChainStatistic> = self
            .store
            .load_chain_statistics()
            .await?
            .into_iter()
            .map(|row| (row.chain_id, row))
            .collect();

        let pending: Vec<ChainStatistic> = chains
            .iter()
            .filter_map(|chain_id| {
                let (row, fresh) = match stored.remove(chain_id) {
                    Some(row) => (row, false),
                    None => (ChainStatistic::empty(*chain_id), true),
                };
                let high_water = high_water_for(*chain_id);
                (fresh
                    || row.last_in_check_id < high_water.inbound
                    || row.last_out_check_id < high_water.outbound)
                    .then_some(row)
            })
            .collect();

        if !stored.is_empty() {
            debug!(stale = stored.len(), "Chain statistics without catalog entry left as is");
        }

        if pending.is_empty() {
            return Ok(PassOutcome::UpToDate);
        }

        let (relay_rows, transfer_rows): (Vec<&ChainStatistic>, Vec<&ChainStatistic>) = pending
            .iter()
            .partition(|row| row.chain_id == self.relay_chain);

        let in_counts = deltas_by_cursor(
            transfer_rows.iter().map(|row| row.last_in_check_id),
            high_in,
            |range| self.ledger.chain_counts_in_range(Stream::Destination, range),
        )
        .await?;
        let out_counts = deltas_by_cursor(
            transfer_rows.iter().map(|row| row.last_out_check_id),
            high_out,
            |range| self.ledger.chain_counts_in_range(Stream::Source, range),
        )
        .await?;
        let relay_counts = deltas_by_cursor(
            relay_rows
                .iter()
                .flat_map(|row| [row.last_in_check_id, row.last_out_check_id]),
            high_relay,
            |range| self.ledger.relay_count_in_range(range),
        )
        .await?;

        let mut tally = Tally::default();

        for row in &pending {
            let (in_delta, out_delta) = if row.chain_id == self.relay_chain {
                (
                    relay_counts.get(&row.last_in_check_id).copied().unwrap_or(0),
                    relay_counts.get(&row.last_out_check_id).copied().unwrap_or(0),
                )
            } else {
                (
                    count_for(&in_counts, row.last_in_check_id, row.chain_id),
                    count_for(&out_counts, row.last_out_check_id, row.chain_id),
                )
            };

            let next = match fold_chain(row, high_water_for(row.chain_id), in_delta, out_delta) {
                Ok(next) => next,
                Err(error) => {
                    error!(chain_id = %row.chain_id, %error, "Failed to fold chain statistic");
                    tally.failed += 1;
                    continue;
                }
            };

            match self.store.upsert_chain_statistic(&next).await {
                Ok(()) => tally.updated += 1,
                Err(error) => {
                    error!(chain_id = %row.chain_id, %error, "Failed to persist chain statistic");
                    tally.failed += 1;
                }
            }
        }

        Ok(tally.into())
    }
}

#[cfg(test)]
mod tests {
    use sqlx::SqlitePool;

    use super::*;
    use crate::ledger::SqliteLedger;
    use crate::statistic::SqliteStatisticStore;
    use crate::test_utils::{
        TransferBuilder, WBTC_BSC, WBTC_ETH, insert_relay, seed_catalog, setup_test_db,
    };

    fn pass(pool: &SqlitePool) -> ChainStatisticsPass {
        ChainStatisticsPass::new(
            Arc::new(SqliteLedger::new(pool.clone())),
            Arc::new(SqliteStatisticStore::new(pool.clone())),
            ChainId::RELAY,
        )
    }

    async fn rows(pool: &SqlitePool) -> HashMap<ChainId, ChainStatistic> {
        SqliteStatisticStore::new(pool.clone())
            .load_chain_statistics()
            .await
            .unwrap()
            .into_iter()
            .map(|row| (row.chain_id, row))
            .collect()
    }

    #[tokio::test]
    async fn transfers_count_per_chain_and_relay_counts_both_ways() {
        let pool = setup_test_db().await;
        seed_catalog(&pool).await;
        TransferBuilder::new(ChainId::ETHEREUM, WBTC_ETH)
            .insert_source(&pool)
            .await;
        TransferBuilder::new(ChainId::ETHEREUM, WBTC_ETH)
            .insert_source(&pool)
            .await;
        TransferBuilder::new(ChainId::BSC, WBTC_BSC)
            .insert_destination(&pool)
            .await;
        insert_relay(&pool).await;
        insert_relay(&pool).await;
        insert_relay(&pool).await;

        pass(&pool).run_once().await.unwrap();

        let rows = rows(&pool).await;
        let eth = &rows[&ChainId::ETHEREUM];
        assert_eq!((eth.in_counter, eth.out_counter), (0, 2));
        let bsc = &rows[&ChainId::BSC];
        assert_eq!((bsc.in_counter, bsc.out_counter), (1, 0));
        assert_eq!((bsc.last_in_check_id, bsc.last_out_check_id), (1, 2));
        let relay = &rows[&ChainId::RELAY];
        assert_eq!((relay.in_counter, relay.out_counter), (3, 3));
        assert_eq!((relay.last_in_check_id, relay.last_out_check_id), (3, 3));
    }

    #[tokio::test]
    async fn relay_row_at_relay_high_water_is_unchanged() {
        let pool = setup_test_db().await;
        seed_catalog(&pool).await;
        for _ in 0..100 {
            insert_relay(&pool).await;
        }
        let store = SqliteStatisticStore::new(pool.clone());
        for chain_id in [ChainId::RELAY, ChainId::ETHEREUM, ChainId::BSC] {
            let mut row = ChainStatistic::empty(chain_id);
            row.in_counter = 7;
            if chain_id == ChainId::RELAY {
                row.last_in_check_id = 100;
                row.last_out_check_id = 100;
            }
            store.upsert_chain_statistic(&row).await.unwrap();
        }
        let before = rows(&pool).await;

        let outcome = pass(&pool).run_once().await.unwrap();

        assert_eq!(outcome, PassOutcome::UpToDate);
        assert_eq!(rows(&pool).await, before);
    }

    #[tokio::test]
    async fn rows_at_different_cursors_each_get_their_own_range() {
        let pool = setup_test_db().await;
        seed_catalog(&pool).await;
        TransferBuilder::new(ChainId::BSC, WBTC_BSC)
            .insert_destination(&pool)
            .await;
        TransferBuilder::new(ChainId::BSC, WBTC_BSC)
            .insert_destination(&pool)
            .await;
        TransferBuilder::new(ChainId::BSC, WBTC_BSC)
            .insert_destination(&pool)
            .await;
        let store = SqliteStatisticStore::new(pool.clone());
        let mut bsc = ChainStatistic::empty(ChainId::BSC);
        bsc.in_counter = 2;
        bsc.last_in_check_id = 2;
        store.upsert_chain_statistic(&bsc).await.unwrap();

        pass(&pool).run_once().await.unwrap();

        let rows = rows(&pool).await;
        assert_eq!(rows[&ChainId::BSC].in_counter, 3);
        assert_eq!(rows[&ChainId::BSC].last_in_check_id, 3);
        assert_eq!(rows[&ChainId::ETHEREUM].in_counter, 0);
        assert_eq!(rows[&ChainId::ETHEREUM].last_in_check_id, 3);
    }

    #[tokio::test]
    async fn second_run_without_new_data_is_up_to_date() {
        let pool = setup_test_db().await;
        seed_catalog(&pool).await;
        TransferBuilder::new(ChainId::ETHEREUM, WBTC_ETH)
            .insert_source(&pool)
            .await;
        insert_relay(&pool).await;
        let pass = pass(&pool);

        pass.run_once().await.unwrap();
        let before = rows(&pool).await;

        assert_eq!(pass.run_once().await.unwrap(), PassOutcome::UpToDate);
        assert_eq!(rows(&pool).await, before);
    }

    #[tokio::test]
    async fn counting_leaves_address_gauge_alone() {
        let pool = setup_test_db().await;
        seed_catalog(&pool).await;
        let store = SqliteStatisticStore::new(pool.clone());
        store.set_chain_addresses(ChainId::ETHEREUM, 12).await.unwrap();
        TransferBuilder::new(ChainId::ETHEREUM, WBTC_ETH)
            .insert_source(&pool)
            .await;

        pass(&pool).run_once().await.unwrap();

        let eth = &rows(&pool).await[&ChainId::ETHEREUM];
        assert_eq!(eth.addresses, 12);
        assert_eq!(eth.out_counter, 1);
    }

    #[test]
    fn advance_never_moves_cursor_backwards() {
        assert_eq!(advance(5, 10, 3, 8).unwrap(), (5, 10));
        assert_eq!(advance(5, 10, 3, 10).unwrap(), (5, 10));
        assert_eq!(advance(5, 10, 3, 11).unwrap(), (8, 11));
    }
}
