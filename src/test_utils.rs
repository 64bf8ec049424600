//! Shared test fixtures: database setup and catalog/ledger seeding.

use sqlx::SqlitePool;
use std::sync::atomic::{AtomicU64, Ordering};

use crate::chain::ChainId;
use crate::valuation::PRICE_PRECISION;

pub(crate) const WBTC_PRICE: u64 = 30_000 * PRICE_PRECISION;
pub(crate) const ONE_USD: u64 = PRICE_PRECISION;

pub(crate) const ALICE: &str = "aaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaa";
pub(crate) const BOB: &str = "bbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbb";
pub(crate) const CAROL: &str = "cccccccccccccccccccccccccccccccccccccccc";

pub(crate) const WBTC_ETH: &str = "2260fac5e5542a773aa44fbcfedf7c193bc2c599";
pub(crate) const WBTC_BSC: &str = "7130d2a12b9bcbfae4f2634d864a1ee1ce3ead9c";
pub(crate) const USDT_ETH: &str = "dac17f958d2ee523a2206206994597c13d831ec7";
pub(crate) const USDT_BSC: &str = "55d398326f99059ff775485246999027b3197955";

static NEXT_TX: AtomicU64 = AtomicU64::new(1);

fn next_tx_hash() -> String {
    format!("{:064x}", NEXT_TX.fetch_add(1, Ordering::Relaxed))
}

/// Creates an in-memory SQLite database with all migrations applied.
pub(crate) async fn setup_test_db() -> SqlitePool {
    let pool = SqlitePool::connect(":memory:").await.unwrap();
    sqlx::migrate!().run(&pool).await.unwrap();
    pool
}

pub(crate) async fn insert_chain(pool: &SqlitePool, chain_id: ChainId, name: &str) {
    sqlx::query("INSERT INTO chains (chain_id, name) VALUES (?1, ?2)")
        .bind(chain_id.to_db())
        .bind(name)
        .execute(pool)
        .await
        .unwrap();
}

pub(crate) async fn insert_basic(
    pool: &SqlitePool,
    name: &str,
    home_chain: ChainId,
    decimals: u8,
    price: u64,
    reserve_tracked: bool,
) {
    sqlx::query(
        "INSERT INTO token_basics (name, chain_id, precision, price, property)
         VALUES (?1, ?2, ?3, ?4, ?5)",
    )
    .bind(name)
    .bind(home_chain.to_db())
    .bind(i64::from(decimals))
    .bind(i64::try_from(price).unwrap())
    .bind(reserve_tracked)
    .execute(pool)
    .await
    .unwrap();
}

pub(crate) async fn insert_token(
    pool: &SqlitePool,
    chain_id: ChainId,
    hash: &str,
    basic: &str,
    decimals: u8,
    reserve_tracked: bool,
) {
    sqlx::query(
        "INSERT INTO tokens (chain_id, hash, token_basic_name, precision, reserve_tracked)
         VALUES (?1, ?2, ?3, ?4, ?5)",
    )
    .bind(chain_id.to_db())
    .bind(hash)
    .bind(basic)
    .bind(i64::from(decimals))
    .bind(reserve_tracked)
    .execute(pool)
    .await
    .unwrap();
}

/// Seeds Ethereum + BSC with WBTC (home: Ethereum) and USDT (home:
/// Ethereum, 6 decimals on Ethereum, 18 on BSC).
pub(crate) async fn seed_catalog(pool: &SqlitePool) {
    insert_chain(pool, ChainId::RELAY, "poly").await;
    insert_chain(pool, ChainId::ETHEREUM, "ethereum").await;
    insert_chain(pool, ChainId::BSC, "bsc").await;

    insert_basic(pool, "WBTC", ChainId::ETHEREUM, 8, WBTC_PRICE, true).await;
    insert_basic(pool, "USDT", ChainId::ETHEREUM, 6, ONE_USD, true).await;

    insert_token(pool, ChainId::ETHEREUM, WBTC_ETH, "WBTC", 8, true).await;
    insert_token(pool, ChainId::BSC, WBTC_BSC, "WBTC", 8, true).await;
    insert_token(pool, ChainId::ETHEREUM, USDT_ETH, "USDT", 6, true).await;
    insert_token(pool, ChainId::BSC, USDT_BSC, "USDT", 18, true).await;
}

/// Builder for source/destination ledger rows with sensible defaults.
pub(crate) struct TransferBuilder {
    chain_id: ChainId,
    asset: String,
    amount: String,
    from: String,
    to: String,
    counterpart_chain: ChainId,
}

impl TransferBuilder {
    pub(crate) fn new(chain_id: ChainId, asset: &str) -> Self {
        Self {
            chain_id,
            asset: asset.to_owned(),
            amount: "1".to_owned(),
            from: ALICE.to_owned(),
            to: BOB.to_owned(),
            counterpart_chain: ChainId::BSC,
        }
    }

    #[must_use]
    pub(crate) fn amount(mut self, amount: impl ToString) -> Self {
        self.amount = amount.to_string();
        self
    }

    #[must_use]
    pub(crate) fn sender(mut self, address: &str) -> Self {
        self.from = address.to_owned();
        self
    }

    #[must_use]
    pub(crate) fn receiver(mut self, address: &str) -> Self {
        self.to = address.to_owned();
        self
    }

    /// Appends to the source stream, returning the new record id.
    pub(crate) async fn insert_source(self, pool: &SqlitePool) -> u64 {
        self.insert(pool, "src_transfers", "dst_chain_id").await
    }

    /// Appends to the destination stream, returning the new record id.
    pub(crate) async fn insert_destination(self, pool: &SqlitePool) -> u64 {
        self.insert(pool, "dst_transfers", "src_chain_id").await
    }

    async fn insert(self, pool: &SqlitePool, table: &str, counterpart_column: &str) -> u64 {
        let sql = format!(
            "INSERT INTO {table}
               (tx_hash, chain_id, asset, from_address, to_address, amount, {counterpart_column}, time)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, 1700000000)"
        );

        let id = sqlx::query(&sql)
            .bind(next_tx_hash())
            .bind(self.chain_id.to_db())
            .bind(self.asset)
            .bind(self.from)
            .bind(self.to)
            .bind(self.amount)
            .bind(self.counterpart_chain.to_db())
            .execute(pool)
            .await
            .unwrap()
            .last_insert_rowid();

        u64::try_from(id).unwrap()
    }
}

/// Appends a relay-chain transaction, returning its id.
pub(crate) async fn insert_relay(pool: &SqlitePool) -> u64 {
    let id = sqlx::query(
        "INSERT INTO relay_transactions
           (hash, src_chain_id, src_hash, dst_chain_id, dst_hash, time)
         VALUES (?1, 2, ?2, 6, ?3, 1700000000)",
    )
    .bind(next_tx_hash())
    .bind(next_tx_hash())
    .bind(next_tx_hash())
    .execute(pool)
    .await
    .unwrap()
    .last_insert_rowid();

    u64::try_from(id).unwrap()
}
