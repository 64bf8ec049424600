use async_trait::async_trait;
use std::sync::Arc;
use tracing::{debug, error, warn};

use super::Tally;
use crate::chain_data::{ChainData, ChainDataError};
use crate::error::StatsError;
use crate::ledger::LedgerReader;
use crate::scheduler::{PassOutcome, StatsPass};
use crate::statistic::StatisticStore;

/// Refreshes each catalog token's available amount from its live custody
/// balance.
pub struct TokenLiquidityPass {
    ledger: Arc<dyn LedgerReader>,
    store: Arc<dyn StatisticStore>,
    chain_data: Arc<dyn ChainData>,
}

impl TokenLiquidityPass {
    pub fn new(
        ledger: Arc<dyn LedgerReader>,
        store: Arc<dyn StatisticStore>,
        chain_data: Arc<dyn ChainData>,
    ) -> Self {
        Self {
            ledger,
            store,
            chain_data,
        }
    }
}

#[async_trait]
impl StatsPass for TokenLiquidityPass {
    fn name(&self) -> &'static str {
        "token_liquidity"
    }

    async fn run_once(&self) -> Result<PassOutcome, StatsError> {
        let tokens = self.ledger.list_known_assets().await?;

        let mut tally = Tally::default();

        for token in &tokens {
            let balance = match self.chain_data.balance(&token.key).await {
                Ok(balance) => balance,
                Err(ChainDataError::UnsupportedChain(chain_id)) => {
                    debug!(token = %token.key, %chain_id, "No chain access, skipping liquidity");
                    continue;
                }
                Err(error) => {
                    warn!(token = %token.key, %error, "Custody balance unavailable, skipping");
                    tally.failed += 1;
                    continue;
                }
            };

            match self.store.set_available_amount(&token.key, balance).await {
                Ok(()) => tally.updated += 1,
                Err(error) => {
                    error!(token = %token.key, %error, "Failed to persist available amount");
                    tally.failed += 1;
                }
            }
        }

        Ok(tally.into())
    }
}

#[cfg(test)]
mod tests {
    use alloy::primitives::U256;
    use sqlx::SqlitePool;

    use super::*;
    use crate::chain::ChainId;
    use crate::chain_data::mock::MockChainData;
    use crate::ledger::{AssetKey, SqliteLedger};
    use crate::statistic::SqliteStatisticStore;
    use crate::test_utils::{USDT_BSC, USDT_ETH, WBTC_BSC, WBTC_ETH, seed_catalog, setup_test_db};

    async fn available(pool: &SqlitePool, chain_id: ChainId, hash: &str) -> String {
        sqlx::query_scalar("SELECT available_amount FROM tokens WHERE chain_id = ?1 AND hash = ?2")
            .bind(chain_id.to_db())
            .bind(hash)
            .fetch_one(pool)
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn balances_are_written_and_failures_skipped() {
        let pool = setup_test_db().await;
        seed_catalog(&pool).await;
        sqlx::query("UPDATE tokens SET available_amount = '5' WHERE hash = ?1")
            .bind(WBTC_BSC)
            .execute(&pool)
            .await
            .unwrap();

        let chain_data = MockChainData::new()
            .with_balance(
                &AssetKey::new(ChainId::ETHEREUM, WBTC_ETH),
                U256::from(500_000_000u64),
            )
            .with_balance(
                &AssetKey::new(ChainId::ETHEREUM, USDT_ETH),
                U256::from(10u8).pow(U256::from(30u8)),
            )
            .broken(&AssetKey::new(ChainId::BSC, WBTC_BSC));
        let pass = TokenLiquidityPass::new(
            Arc::new(SqliteLedger::new(pool.clone())),
            Arc::new(SqliteStatisticStore::new(pool.clone())),
            Arc::new(chain_data),
        );

        let outcome = pass.run_once().await.unwrap();

        assert_eq!(
            outcome,
            PassOutcome::Completed {
                updated: 2,
                failed: 1
            }
        );
        assert_eq!(available(&pool, ChainId::ETHEREUM, WBTC_ETH).await, "500000000");
        assert_eq!(
            available(&pool, ChainId::ETHEREUM, USDT_ETH).await,
            "1000000000000000000000000000000"
        );
        assert_eq!(available(&pool, ChainId::BSC, WBTC_BSC).await, "5");
        assert_eq!(available(&pool, ChainId::BSC, USDT_BSC).await, "0");
    }
}
