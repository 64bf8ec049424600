//! Distinct-address gauges. Recomputed from the full ledger each run;
//! no cursor.

use async_trait::async_trait;
use std::sync::Arc;
use tracing::error;

use super::Tally;
use crate::error::StatsError;
use crate::ledger::LedgerReader;
use crate::scheduler::{PassOutcome, StatsPass};
use crate::statistic::StatisticStore;

pub struct ChainAddressPass {
    ledger: Arc<dyn LedgerReader>,
    store: Arc<dyn StatisticStore>,
}

impl ChainAddressPass {
    pub fn new(ledger: Arc<dyn LedgerReader>, store: Arc<dyn StatisticStore>) -> Self {
        Self { ledger, store }
    }
}

#[async_trait]
impl StatsPass for ChainAddressPass {
    fn name(&self) -> &'static str {
        "chain_addresses"
    }

    async fn run_once(&self) -> Result<PassOutcome, StatsError> {
        let counts = self.ledger.chain_address_counts().await?;
        let chains = self.ledger.list_known_chains().await?;

        let mut tally = Tally::default();

        for chain_id in chains {
            let addresses = counts.get(&chain_id).copied().unwrap_or(0);

            match self.store.set_chain_addresses(chain_id, addresses).await {
                Ok(()) => tally.updated += 1,
                Err(error) => {
                    error!(%chain_id, %error, "Failed to persist chain address count");
                    tally.failed += 1;
                }
            }
        }

        Ok(tally.into())
    }
}

pub struct AssetAddressPass {
    ledger: Arc<dyn LedgerReader>,
    store: Arc<dyn StatisticStore>,
}

impl AssetAddressPass {
    pub fn new(ledger: Arc<dyn LedgerReader>, store: Arc<dyn StatisticStore>) -> Self {
        Self { ledger, store }
    }
}

#[async_trait]
impl StatsPass for AssetAddressPass {
    fn name(&self) -> &'static str {
        "asset_addresses"
    }

    async fn run_once(&self) -> Result<PassOutcome, StatsError> {
        let counts = self.ledger.basic_address_counts().await?;
        let basics = self.ledger.list_known_basics().await?;

        let mut tally = Tally::default();

        for basic in basics {
            let addresses = counts.get(&basic.name).copied().unwrap_or(0);

            match self.store.set_asset_addresses(&basic.name, addresses).await {
                Ok(()) => tally.updated += 1,
                Err(error) => {
                    error!(asset = %basic.name, %error, "Failed to persist asset address count");
                    tally.failed += 1;
                }
            }
        }

        Ok(tally.into())
    }
}
