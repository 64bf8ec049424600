use alloy::primitives::U256;
use async_trait::async_trait;
use sqlx::SqlitePool;

use super::{AssetStatistic, ChainStatistic, StatisticStore, StoreError, TokenStatistic};
use crate::chain::ChainId;
use crate::ledger::{AssetKey, id_from_sql, sql_id};
use crate::valuation::Valuation;

#[derive(Debug, Clone)]
pub struct SqliteStatisticStore {
    pool: SqlitePool,
}

impl SqliteStatisticStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }
}

#[derive(sqlx::FromRow)]
struct TokenStatisticRow {
    chain_id: i64,
    hash: String,
    in_amount: String,
    out_amount: String,
    in_counter: i64,
    out_counter: i64,
    in_amount_usd: String,
    out_amount_usd: String,
    in_amount_btc: String,
    out_amount_btc: String,
    last_in_check_id: i64,
    last_out_check_id: i64,
}

#[derive(sqlx::FromRow)]
struct ChainStatisticRow {
    chain_id: i64,
    addresses: i64,
    #[sqlx(rename = "in")]
    in_counter: i64,
    #[sqlx(rename = "out")]
    out_counter: i64,
    last_in_check_id: i64,
    last_out_check_id: i64,
}

#[derive(sqlx::FromRow)]
struct AssetStatisticRow {
    name: String,
    addresses: i64,
    txn_count: i64,
    amount: String,
    amount_carry: String,
    amount_usd: String,
    amount_btc: String,
    last_check_id: i64,
}

/// Parses one base-10 amount column, naming the row on failure.
struct ColumnParser<'a> {
    table: &'static str,
    key: &'a str,
}

impl ColumnParser<'_> {
    fn amount(&self, column: &'static str, value: String) -> Result<U256, StoreError> {
        U256::from_str_radix(&value, 10).map_err(|_| StoreError::Corrupt {
            table: self.table,
            key: self.key.to_owned(),
            column,
            value,
        })
    }
}

impl TryFrom<TokenStatisticRow> for TokenStatistic {
    type Error = StoreError;

    fn try_from(row: TokenStatisticRow) -> Result<Self, Self::Error> {
        let key = AssetKey::new(ChainId::from_db(row.chain_id)?, row.hash);
        let label = key.to_string();
        let parse = ColumnParser {
            table: "token_statistics",
            key: &label,
        };

        Ok(Self {
            in_amount: parse.amount("in_amount", row.in_amount)?,
            out_amount: parse.amount("out_amount", row.out_amount)?,
            in_counter: id_from_sql(row.in_counter),
            out_counter: id_from_sql(row.out_counter),
            in_valuation: Valuation {
                usd: parse.amount("in_amount_usd", row.in_amount_usd)?,
                btc: parse.amount("in_amount_btc", row.in_amount_btc)?,
            },
            out_valuation: Valuation {
                usd: parse.amount("out_amount_usd", row.out_amount_usd)?,
                btc: parse.amount("out_amount_btc", row.out_amount_btc)?,
            },
            last_in_check_id: id_from_sql(row.last_in_check_id),
            last_out_check_id: id_from_sql(row.last_out_check_id),
            key,
        })
    }
}

impl TryFrom<ChainStatisticRow> for ChainStatistic {
    type Error = StoreError;

    fn try_from(row: ChainStatisticRow) -> Result<Self, Self::Error> {
        Ok(Self {
            chain_id: ChainId::from_db(row.chain_id)?,
            addresses: id_from_sql(row.addresses),
            in_counter: id_from_sql(row.in_counter),
            out_counter: id_from_sql(row.out_counter),
            last_in_check_id: id_from_sql(row.last_in_check_id),
            last_out_check_id: id_from_sql(row.last_out_check_id),
        })
    }
}

impl TryFrom<AssetStatisticRow> for AssetStatistic {
    type Error = StoreError;

    fn try_from(row: AssetStatisticRow) -> Result<Self, Self::Error> {
        let parse = ColumnParser {
            table: "asset_statistics",
            key: &row.name,
        };

        let amount = parse.amount("amount", row.amount)?;
        let carry = parse.amount("amount_carry", row.amount_carry)?;
        let valuation = Valuation {
            usd: parse.amount("amount_usd", row.amount_usd)?,
            btc: parse.amount("amount_btc", row.amount_btc)?,
        };

        Ok(Self {
            addresses: id_from_sql(row.addresses),
            txn_count: id_from_sql(row.txn_count),
            amount,
            carry,
            valuation,
            last_check_id: id_from_sql(row.last_check_id),
            name: row.name,
        })
    }
}

#[async_trait]
impl StatisticStore for SqliteStatisticStore {
    async fn load_token_statistics(&self) -> Result<Vec<TokenStatistic>, StoreError> {
        let rows = sqlx::query_as::<_, TokenStatisticRow>(
            "SELECT chain_id, hash, in_amount, out_amount, in_counter, out_counter,
                    in_amount_usd, out_amount_usd, in_amount_btc, out_amount_btc,
                    last_in_check_id, last_out_check_id
             FROM token_statistics
             ORDER BY chain_id, hash",
        )
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(TokenStatistic::try_from).collect()
    }

    async fn upsert_token_statistic(&self, row: &TokenStatistic) -> Result<(), StoreError> {
        sqlx::query(
            "INSERT INTO token_statistics (
                 chain_id, hash, in_amount, out_amount, in_counter, out_counter,
                 in_amount_usd, out_amount_usd, in_amount_btc, out_amount_btc,
                 last_in_check_id, last_out_check_id
             )
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)
             ON CONFLICT (chain_id, hash) DO UPDATE SET
                 in_amount = excluded.in_amount,
                 out_amount = excluded.out_amount,
                 in_counter = excluded.in_counter,
                 out_counter = excluded.out_counter,
                 in_amount_usd = excluded.in_amount_usd,
                 out_amount_usd = excluded.out_amount_usd,
                 in_amount_btc = excluded.in_amount_btc,
                 out_amount_btc = excluded.out_amount_btc,
                 last_in_check_id = excluded.last_in_check_id,
                 last_out_check_id = excluded.last_out_check_id",
        )
        .bind(row.key.chain_id.to_db())
        .bind(&row.key.hash)
        .bind(row.in_amount.to_string())
        .bind(row.out_amount.to_string())
        .bind(sql_id(row.in_counter))
        .bind(sql_id(row.out_counter))
        .bind(row.in_valuation.usd.to_string())
        .bind(row.out_valuation.usd.to_string())
        .bind(row.in_valuation.btc.to_string())
        .bind(row.out_valuation.btc.to_string())
        .bind(sql_id(row.last_in_check_id))
        .bind(sql_id(row.last_out_check_id))
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn load_chain_statistics(&self) -> Result<Vec<ChainStatistic>, StoreError> {
        let rows = sqlx::query_as::<_, ChainStatisticRow>(
            r#"SELECT chain_id, addresses, "in", "out", last_in_check_id, last_out_check_id
               FROM chain_statistics
               ORDER BY chain_id"#,
        )
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(ChainStatistic::try_from).collect()
    }

    async fn upsert_chain_statistic(&self, row: &ChainStatistic) -> Result<(), StoreError> {
        sqlx::query(
            r#"INSERT INTO chain_statistics
                   (chain_id, "in", "out", last_in_check_id, last_out_check_id)
               VALUES (?1, ?2, ?3, ?4, ?5)
               ON CONFLICT (chain_id) DO UPDATE SET
                   "in" = excluded."in",
                   "out" = excluded."out",
                   last_in_check_id = excluded.last_in_check_id,
                   last_out_check_id = excluded.last_out_check_id"#,
        )
        .bind(row.chain_id.to_db())
        .bind(sql_id(row.in_counter))
        .bind(sql_id(row.out_counter))
        .bind(sql_id(row.last_in_check_id))
        .bind(sql_id(row.last_out_check_id))
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn set_chain_addresses(
        &self,
        chain_id: ChainId,
        addresses: u64,
    ) -> Result<(), StoreError> {
        sqlx::query(
            "INSERT INTO chain_statistics (chain_id, addresses) VALUES (?1, ?2)
             ON CONFLICT (chain_id) DO UPDATE SET addresses = excluded.addresses",
        )
        .bind(chain_id.to_db())
        .bind(sql_id(addresses))
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn load_asset_statistics(&self) -> Result<Vec<AssetStatistic>, StoreError> {
        let rows = sqlx::query_as::<_, AssetStatisticRow>(
            "SELECT name, addresses, txn_count, amount, amount_carry, amount_usd, amount_btc,
                    last_check_id
             FROM asset_statistics
             ORDER BY name",
        )
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(AssetStatistic::try_from).collect()
    }

    async fn upsert_asset_statistic(&self, row: &AssetStatistic) -> Result<(), StoreError> {
        sqlx::query(
            "INSERT INTO asset_statistics
                 (name, txn_count, amount, amount_carry, amount_usd, amount_btc, last_check_id)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
             ON CONFLICT (name) DO UPDATE SET
                 txn_count = excluded.txn_count,
                 amount = excluded.amount,
                 amount_carry = excluded.amount_carry,
                 amount_usd = excluded.amount_usd,
                 amount_btc = excluded.amount_btc,
                 last_check_id = excluded.last_check_id",
        )
        .bind(&row.name)
        .bind(sql_id(row.txn_count))
        .bind(row.amount.to_string())
        .bind(row.carry.to_string())
        .bind(row.valuation.usd.to_string())
        .bind(row.valuation.btc.to_string())
        .bind(sql_id(row.last_check_id))
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn set_asset_addresses(&self, name: &str, addresses: u64) -> Result<(), StoreError> {
        sqlx::query(
            "INSERT INTO asset_statistics (name, addresses) VALUES (?1, ?2)
             ON CONFLICT (name) DO UPDATE SET addresses = excluded.addresses",
        )
        .bind(name)
        .bind(sql_id(addresses))
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn set_available_amount(&self, key: &AssetKey, amount: U256) -> Result<(), StoreError> {
        let result =
            sqlx::query("UPDATE tokens SET available_amount = ?1 WHERE chain_id = ?2 AND hash = ?3")
                .bind(amount.to_string())
                .bind(key.chain_id.to_db())
                .bind(&key.hash)
                .execute(&self.pool)
                .await?;

        if result.rows_affected() == 0 {
            return Err(StoreError::UnknownToken(key.clone()));
        }

        Ok(())
    }
}
