use alloy::primitives::U256;
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, error, warn};

use super::{FoldError, Tally, accumulate, btc_reference_price, count, deltas_by_cursor};
use crate::chain_data::{ChainData, ChainDataError};
use crate::error::StatsError;
use crate::ledger::{AssetKey, Delta, LedgerReader, Stream, Token, TokenBasic, TokenStandard};
use crate::scheduler::{PassOutcome, StatsPass};
use crate::statistic::{StatisticStore, TokenStatistic};
use crate::valuation::valuate;

/// Where a row's inbound amount comes from this run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Inbound {
    /// Previous amount plus the destination-stream delta.
    Ledger,
    /// Live custody balance on the asset's home chain.
    Live(U256),
    /// Home-chain balance could not be read; the previous amount stands.
    KeepPrevious,
}

#[derive(Debug, Clone, Copy)]
struct Side {
    delta: Delta,
    high_water: u64,
}

/// Per (chain, asset) volume: inbound from the destination stream,
/// outbound from the source stream.
pub struct TokenStatisticsPass {
    ledger: Arc<dyn LedgerReader>,
    store: Arc<dyn StatisticStore>,
    chain_data: Arc<dyn ChainData>,
    btc_reference: String,
}

impl TokenStatisticsPass {
    pub fn new(
        ledger: Arc<dyn LedgerReader>,
        store: Arc<dyn StatisticStore>,
        chain_data: Arc<dyn ChainData>,
        btc_reference: impl Into<String>,
    ) -> Self {
        Self {
            ledger,
            store,
            chain_data,
            btc_reference: btc_reference.into(),
        }
    }

    async fn home_chain_inbound(&self, key: &AssetKey) -> Inbound {
        match self.chain_data.balance(key).await {
            Ok(balance) => Inbound::Live(balance),
            Err(ChainDataError::UnsupportedChain(chain_id)) => {
                debug!(token = %key, %chain_id, "No chain access for home-chain balance");
                Inbound::KeepPrevious
            }
            Err(error) => {
                warn!(token = %key, %error, "Home-chain balance unavailable, keeping previous amount");
                Inbound::KeepPrevious
            }
        }
    }
}

/// NFT volume is measured in items moved, not in the raw amount field.
fn moved_amount(token: &Token, delta: &Delta) -> U256 {
    match token.standard {
        TokenStandard::Fungible => delta.amount,
        TokenStandard::NonFungible => U256::from(delta.count),
    }
}

fn fold_token(
    row: &TokenStatistic,
    token: &Token,
    basic: &TokenBasic,
    btc_price: Option<u64>,
    inbound_source: Inbound,
    inbound: Side,
    outbound: Side,
) -> Result<TokenStatistic, FoldError> {
    let mut next = row.clone();

    let in_advances = row.last_in_check_id < inbound.high_water;
    if in_advances {
        next.in_counter = count(row.in_counter, inbound.delta.count)?;
        next.last_in_check_id = inbound.high_water;
    }

    next.in_amount = match inbound_source {
        Inbound::Live(balance) => balance,
        Inbound::KeepPrevious => row.in_amount,
        Inbound::Ledger if in_advances => {
            accumulate(row.in_amount, moved_amount(token, &inbound.delta))?
        }
        Inbound::Ledger => row.in_amount,
    };

    if row.last_out_check_id < outbound.high_water {
        next.out_amount = accumulate(row.out_amount, moved_amount(token, &outbound.delta))?;
        next.out_counter = count(row.out_counter, outbound.delta.count)?;
        next.last_out_check_id = outbound.high_water;
    }

    next.in_valuation = valuate(next.in_amount, token.decimals, basic.price, btc_price)?;
    next.out_valuation = valuate(next.out_amount, token.decimals, basic.price, btc_price)?;

    Ok(next)
}

fn delta_for(
    deltas: &HashMap<u64, HashMap<AssetKey, Delta>>,
    cursor: u64,
    key: &AssetKey,
) -> Delta {
    deltas
        .get(&cursor)
        .and_then(|by_asset| by_asset.get(key))
        .copied()
        .unwrap_or_default()
}

#[async_trait]
impl StatsPass for TokenStatisticsPass {
    fn name(&self) -> &'static str {
        "token_statistics"
    }

    async fn run_once(&self) -> Result<PassOutcome, StatsError> {
        let high_in = self.ledger.highest_id(Stream::Destination).await?;
        let high_out = self.ledger.highest_id(Stream::Source).await?;

        let tokens = self.ledger.list_known_assets().await?;
        let basics = self.ledger.list_known_basics().await?;
        let btc_price = btc_reference_price(&basics, &self.btc_reference);
        let basics_by_name: HashMap<&str, &TokenBasic> = basics
            .iter()
            .map(|basic| (basic.name.as_str(), basic))
            .collect();

        let mut stored: HashMap<AssetKey, TokenStatistic> = self
            .store
            .load_token_statistics()
            .await?
            .into_iter()
            .map(|row| (row.key.clone(), row))
            .collect();

        let pending: Vec<(&Token, TokenStatistic)> = tokens
            .iter()
            .filter_map(|token| {
                let (row, fresh) = match stored.remove(&token.key) {
                    Some(row) => (row, false),
                    None => (TokenStatistic::empty(token.key.clone()), true),
                };
                (fresh || row.last_in_check_id < high_in || row.last_out_check_id < high_out)
                    .then_some((token, row))
            })
            .collect();

        if !stored.is_empty() {
            debug!(stale = stored.len(), "Token statistics without catalog entry left as is");
        }

        if pending.is_empty() {
            return Ok(PassOutcome::UpToDate);
        }

        let in_deltas = deltas_by_cursor(
            pending.iter().map(|(_, row)| row.last_in_check_id),
            high_in,
            |range| self.ledger.asset_deltas_in_range(Stream::Destination, range),
        )
        .await?;
        let out_deltas = deltas_by_cursor(
            pending.iter().map(|(_, row)| row.last_out_check_id),
            high_out,
            |range| self.ledger.asset_deltas_in_range(Stream::Source, range),
        )
        .await?;

        let mut tally = Tally::default();

        for (token, row) in pending {
            let Some(basic) = basics_by_name.get(token.basic_name.as_str()) else {
                warn!(token = %token.key, basic = %token.basic_name, "Token has no basic, skipping");
                continue;
            };

            let inbound_source = if token.key.chain_id == basic.home_chain {
                self.home_chain_inbound(&token.key).await
            } else {
                Inbound::Ledger
            };

            let inbound = Side {
                delta: delta_for(&in_deltas, row.last_in_check_id, &token.key),
                high_water: high_in,
            };
            let outbound = Side {
                delta: delta_for(&out_deltas, row.last_out_check_id, &token.key),
                high_water: high_out,
            };

            let next = match fold_token(&row, token, basic, btc_price, inbound_source, inbound, outbound)
            {
                Ok(next) => next,
                Err(error) => {
                    error!(token = %token.key, %error, "Failed to fold token statistic");
                    tally.failed += 1;
                    continue;
                }
            };

            match self.store.upsert_token_statistic(&next).await {
                Ok(()) => tally.updated += 1,
                Err(error) => {
                    error!(token = %token.key, %error, "Failed to persist token statistic");
                    tally.failed += 1;
                }
            }
        }

        Ok(tally.into())
    }
}
