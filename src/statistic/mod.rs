//! Derived statistic rows and the store that persists them.
//!
//! Every row carries its own checkpoint cursor(s) next to its accumulated
//! totals, and every write replaces both in a single statement. A reader
//! therefore never observes a cursor without the totals it accounts for.

mod sqlite;

use alloy::primitives::U256;
use async_trait::async_trait;

use crate::chain::{ChainId, InvalidChainId};
use crate::ledger::AssetKey;
use crate::valuation::Valuation;

pub use sqlite::SqliteStatisticStore;

/// Volume per (chain, asset). "In" is released on this chain by
/// destination transfers, "out" is locked by source transfers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TokenStatistic {
    pub key: AssetKey,
    pub in_amount: U256,
    pub out_amount: U256,
    pub in_counter: u64,
    pub out_counter: u64,
    pub in_valuation: Valuation,
    pub out_valuation: Valuation,
    pub last_in_check_id: u64,
    pub last_out_check_id: u64,
}

impl TokenStatistic {
    pub fn empty(key: AssetKey) -> Self {
        Self {
            key,
            in_amount: U256::ZERO,
            out_amount: U256::ZERO,
            in_counter: 0,
            out_counter: 0,
            in_valuation: Valuation::default(),
            out_valuation: Valuation::default(),
            last_in_check_id: 0,
            last_out_check_id: 0,
        }
    }
}

/// Transfer counts per chain. The address gauge is owned by a separate
/// pass and is never written through [`StatisticStore::upsert_chain_statistic`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChainStatistic {
    pub chain_id: ChainId,
    pub addresses: u64,
    pub in_counter: u64,
    pub out_counter: u64,
    pub last_in_check_id: u64,
    pub last_out_check_id: u64,
}

impl ChainStatistic {
    pub fn empty(chain_id: ChainId) -> Self {
        Self {
            chain_id,
            addresses: 0,
            in_counter: 0,
            out_counter: 0,
            last_in_check_id: 0,
            last_out_check_id: 0,
        }
    }
}

/// Source-transfer volume per Token Basic, in the basic's own precision.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AssetStatistic {
    pub name: String,
    pub addresses: u64,
    pub txn_count: u64,
    pub amount: U256,
    /// Sub-unit remainder of `amount`, scaled by `10^CARRY_DIGITS`.
    pub carry: U256,
    pub valuation: Valuation,
    pub last_check_id: u64,
}

impl AssetStatistic {
    pub fn empty(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            addresses: 0,
            txn_count: 0,
            amount: U256::ZERO,
            carry: U256::ZERO,
            valuation: Valuation::default(),
            last_check_id: 0,
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error(transparent)]
    Sqlx(#[from] sqlx::Error),
    #[error(transparent)]
    InvalidChainId(#[from] InvalidChainId),
    #[error("{table} row {key} has a malformed {column}: {value:?}")]
    Corrupt {
        table: &'static str,
        key: String,
        column: &'static str,
        value: String,
    },
    #[error("no catalog token {0}")]
    UnknownToken(AssetKey),
}

/// Persistence of statistic rows. Each call touches exactly one row and
/// is all-or-nothing.
#[async_trait]
pub trait StatisticStore: Send + Sync {
    async fn load_token_statistics(&self) -> Result<Vec<TokenStatistic>, StoreError>;

    async fn upsert_token_statistic(&self, row: &TokenStatistic) -> Result<(), StoreError>;

    async fn load_chain_statistics(&self) -> Result<Vec<ChainStatistic>, StoreError>;

    /// Writes counters and cursors, leaving the address gauge untouched.
    async fn upsert_chain_statistic(&self, row: &ChainStatistic) -> Result<(), StoreError>;

    /// Writes only the address gauge, creating the row if needed.
    async fn set_chain_addresses(&self, chain_id: ChainId, addresses: u64)
    -> Result<(), StoreError>;

    async fn load_asset_statistics(&self) -> Result<Vec<AssetStatistic>, StoreError>;

    /// Writes totals and cursor, leaving the address gauge untouched.
    async fn upsert_asset_statistic(&self, row: &AssetStatistic) -> Result<(), StoreError>;

    /// Writes only the address gauge, creating the row if needed.
    async fn set_asset_addresses(&self, name: &str, addresses: u64) -> Result<(), StoreError>;

    /// Records the live custody balance of a catalog token.
    async fn set_available_amount(&self, key: &AssetKey, amount: U256) -> Result<(), StoreError>;
}
