//! Read-only access to the bridge's append-only transfer ledger and to the
//! token catalog describing what the ledger's assets are.

mod sqlite;

use alloy::primitives::U256;
use async_trait::async_trait;
use std::collections::HashMap;
use std::fmt;

use crate::chain::{ChainId, InvalidChainId};

pub use sqlite::SqliteLedger;

/// SQLite integers are signed; ids and counters never go negative.
pub(crate) fn sql_id(id: u64) -> i64 {
    i64::try_from(id).unwrap_or(i64::MAX)
}

pub(crate) fn id_from_sql(raw: i64) -> u64 {
    u64::try_from(raw).unwrap_or(0)
}

/// One of the three ordered record streams. Each has its own
/// monotonically increasing id space.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Stream {
    /// Transfers locked on the chain they originate from.
    Source,
    /// Relay-chain transactions linking a source to a destination.
    Relay,
    /// Transfers released on the chain they land on.
    Destination,
}

impl Stream {
    pub(crate) const fn table(self) -> &'static str {
        match self {
            Self::Source => "src_transfers",
            Self::Relay => "relay_transactions",
            Self::Destination => "dst_transfers",
        }
    }
}

impl fmt::Display for Stream {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Source => "source",
            Self::Relay => "relay",
            Self::Destination => "destination",
        };
        f.write_str(name)
    }
}

/// Open-left, closed-right id range `(after, through]`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct IdRange {
    pub after: u64,
    pub through: u64,
}

impl IdRange {
    pub const fn new(after: u64, through: u64) -> Self {
        Self { after, through }
    }

    pub const fn is_empty(&self) -> bool {
        self.through <= self.after
    }
}

impl fmt::Display for IdRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "({}, {}]", self.after, self.through)
    }
}

/// Summed amount and record count over a range.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Delta {
    pub amount: U256,
    pub count: u64,
}

impl Delta {
    pub(crate) fn add(&mut self, amount: U256) -> Result<(), LedgerError> {
        self.amount = self
            .amount
            .checked_add(amount)
            .ok_or(LedgerError::AmountOverflow)?;
        self.count += 1;
        Ok(())
    }
}

/// Fractional digits kept below a basic's own precision when summing
/// finer-grained tokens, so sub-unit amounts are not lost between passes.
pub const CARRY_DIGITS: u8 = 18;

/// Chain-specific asset identity.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct AssetKey {
    pub chain_id: ChainId,
    pub hash: String,
}

impl AssetKey {
    pub fn new(chain_id: ChainId, hash: impl Into<String>) -> Self {
        Self {
            chain_id,
            hash: hash.into(),
        }
    }
}

impl fmt::Display for AssetKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.chain_id, self.hash)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TokenStandard {
    Fungible,
    NonFungible,
}

/// Logical asset family spanning several chain-specific tokens.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TokenBasic {
    pub name: String,
    pub home_chain: ChainId,
    pub decimals: u8,
    /// Scaled by [`crate::valuation::PRICE_PRECISION`].
    pub price: u64,
    /// Whether the reserve reconciler checks this family.
    pub reserve_tracked: bool,
}

/// A Token Basic's deployment on one chain.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Token {
    pub key: AssetKey,
    pub basic_name: String,
    pub decimals: u8,
    pub standard: TokenStandard,
    pub reserve_tracked: bool,
}

#[derive(Debug, thiserror::Error)]
pub enum LedgerError {
    #[error(transparent)]
    Sqlx(#[from] sqlx::Error),
    #[error(transparent)]
    InvalidChainId(#[from] InvalidChainId),
    #[error("{stream} record {id} has a malformed amount {value:?}")]
    InvalidAmount {
        stream: Stream,
        id: i64,
        value: String,
    },
    #[error("catalog entry {entry} has invalid {field}: {value}")]
    InvalidCatalog {
        entry: String,
        field: &'static str,
        value: i64,
    },
    #[error("{0} stream carries no asset amounts")]
    NotATransferStream(Stream),
    #[error("summed amount overflowed 256 bits")]
    AmountOverflow,
    #[error("rescaling amount for basic {basic}")]
    Rescale {
        basic: String,
        #[source]
        source: crate::valuation::ValuationError,
    },
}

/// Query surface the aggregation passes read the ledger through.
///
/// All `*_in_range` methods are grouped sum-and-count queries over the
/// records of one stream with ids in `range`.
#[async_trait]
pub trait LedgerReader: Send + Sync {
    /// Highest record id in `stream`, or `0` if the stream is empty.
    async fn highest_id(&self, stream: Stream) -> Result<u64, LedgerError>;

    /// Amount and count per (chain, asset) for a transfer stream.
    async fn asset_deltas_in_range(
        &self,
        stream: Stream,
        range: IdRange,
    ) -> Result<HashMap<AssetKey, Delta>, LedgerError>;

    /// Record count per chain for a transfer stream.
    async fn chain_counts_in_range(
        &self,
        stream: Stream,
        range: IdRange,
    ) -> Result<HashMap<ChainId, u64>, LedgerError>;

    /// Number of relay-chain transactions in `range`.
    async fn relay_count_in_range(&self, range: IdRange) -> Result<u64, LedgerError>;

    /// Source-transfer amount and count per Token Basic. Amounts carry
    /// [`CARRY_DIGITS`] digits beyond the basic's own precision; transfers
    /// of assets absent from the catalog are not attributed to any basic.
    async fn basic_deltas_in_range(
        &self,
        range: IdRange,
    ) -> Result<HashMap<String, Delta>, LedgerError>;

    /// Distinct sender and receiver addresses per chain across both
    /// transfer streams.
    async fn chain_address_counts(&self) -> Result<HashMap<ChainId, u64>, LedgerError>;

    /// Distinct sender and receiver addresses per Token Basic.
    async fn basic_address_counts(&self) -> Result<HashMap<String, u64>, LedgerError>;

    async fn list_known_assets(&self) -> Result<Vec<Token>, LedgerError>;

    async fn list_known_chains(&self) -> Result<Vec<ChainId>, LedgerError>;

    async fn list_known_basics(&self) -> Result<Vec<TokenBasic>, LedgerError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn range_with_equal_bounds_is_empty() {
        assert!(IdRange::new(100, 100).is_empty());
        assert!(IdRange::new(100, 90).is_empty());
        assert!(!IdRange::new(99, 100).is_empty());
    }

    #[test]
    fn range_display_shows_open_left_bound() {
        assert_eq!(IdRange::new(3, 9).to_string(), "(3, 9]");
    }

    #[test]
    fn delta_add_counts_each_record() {
        let mut delta = Delta::default();
        delta.add(U256::from(5u8)).unwrap();
        delta.add(U256::from(7u8)).unwrap();

        assert_eq!(
            delta,
            Delta {
                amount: U256::from(12u8),
                count: 2
            }
        );
    }

    #[test]
    fn delta_add_reports_overflow() {
        let mut delta = Delta {
            amount: U256::MAX,
            count: 1,
        };

        assert!(matches!(
            delta.add(U256::from(1u8)),
            Err(LedgerError::AmountOverflow)
        ));
    }
}
