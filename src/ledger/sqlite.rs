use alloy::primitives::U256;
use async_trait::async_trait;
use futures_util::TryStreamExt;
use sqlx::SqlitePool;
use std::collections::HashMap;

use super::{
    AssetKey, CARRY_DIGITS, Delta, IdRange, LedgerError, LedgerReader, Stream, Token, TokenBasic,
    TokenStandard, id_from_sql, sql_id,
};
use crate::chain::ChainId;
use crate::valuation::{rescale, ten_pow};

/// Ledger and catalog tables living in the service's own SQLite database.
#[derive(Debug, Clone)]
pub struct SqliteLedger {
    pool: SqlitePool,
}

impl SqliteLedger {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }
}

fn parse_amount(stream: Stream, id: i64, value: String) -> Result<U256, LedgerError> {
    U256::from_str_radix(&value, 10).map_err(|_| LedgerError::InvalidAmount { stream, id, value })
}

fn catalog_decimals(entry: &str, value: i64) -> Result<u8, LedgerError> {
    u8::try_from(value).map_err(|_| LedgerError::InvalidCatalog {
        entry: entry.to_owned(),
        field: "precision",
        value,
    })
}

fn transfer_table(stream: Stream) -> Result<&'static str, LedgerError> {
    match stream {
        Stream::Source | Stream::Destination => Ok(stream.table()),
        Stream::Relay => Err(LedgerError::NotATransferStream(stream)),
    }
}

/// Per (chain, asset) accumulation for the basic fold, kept until the
/// whole range is read so each group is rescaled exactly once.
struct BasicGroup {
    basic: String,
    token_decimals: u8,
    basic_decimals: u8,
    standard: TokenStandard,
    delta: Delta,
}

#[async_trait]
impl LedgerReader for SqliteLedger {
    async fn highest_id(&self, stream: Stream) -> Result<u64, LedgerError> {
        let sql = format!("SELECT COALESCE(MAX(id), 0) FROM {}", stream.table());
        let highest: i64 = sqlx::query_scalar(&sql).fetch_one(&self.pool).await?;
        Ok(id_from_sql(highest))
    }

    async fn asset_deltas_in_range(
        &self,
        stream: Stream,
        range: IdRange,
    ) -> Result<HashMap<AssetKey, Delta>, LedgerError> {
        let mut deltas: HashMap<AssetKey, Delta> = HashMap::new();
        if range.is_empty() {
            return Ok(deltas);
        }

        let sql = format!(
            "SELECT id, chain_id, asset, amount FROM {} WHERE id > ?1 AND id <= ?2",
            transfer_table(stream)?
        );

        let mut rows = sqlx::query_as::<_, (i64, i64, String, String)>(&sql)
            .bind(sql_id(range.after))
            .bind(sql_id(range.through))
            .fetch(&self.pool);

        while let Some((id, chain_id, asset, amount)) = rows.try_next().await? {
            let key = AssetKey::new(ChainId::from_db(chain_id)?, asset);
            let amount = parse_amount(stream, id, amount)?;
            deltas.entry(key).or_default().add(amount)?;
        }

        Ok(deltas)
    }

    async fn chain_counts_in_range(
        &self,
        stream: Stream,
        range: IdRange,
    ) -> Result<HashMap<ChainId, u64>, LedgerError> {
        if range.is_empty() {
            return Ok(HashMap::new());
        }

        let sql = format!(
            "SELECT chain_id, COUNT(*) FROM {} WHERE id > ?1 AND id <= ?2 GROUP BY chain_id",
            transfer_table(stream)?
        );

        let rows = sqlx::query_as::<_, (i64, i64)>(&sql)
            .bind(sql_id(range.after))
            .bind(sql_id(range.through))
            .fetch_all(&self.pool)
            .await?;

        rows.into_iter()
            .map(|(chain_id, count)| {
                ChainId::from_db(chain_id)
                    .map(|chain_id| (chain_id, id_from_sql(count)))
                    .map_err(LedgerError::from)
            })
            .collect()
    }

    async fn relay_count_in_range(&self, range: IdRange) -> Result<u64, LedgerError> {
        if range.is_empty() {
            return Ok(0);
        }

        let count: i64 = sqlx::query_scalar(
            "SELECT COUNT(*) FROM relay_transactions WHERE id > ?1 AND id <= ?2",
        )
        .bind(sql_id(range.after))
        .bind(sql_id(range.through))
        .fetch_one(&self.pool)
        .await?;

        Ok(id_from_sql(count))
    }

    async fn basic_deltas_in_range(
        &self,
        range: IdRange,
    ) -> Result<HashMap<String, Delta>, LedgerError> {
        let mut basics: HashMap<String, Delta> = HashMap::new();
        if range.is_empty() {
            return Ok(basics);
        }

        let mut rows = sqlx::query_as::<_, (i64, i64, String, String, String, i64, i64, bool)>(
            "SELECT s.id, s.chain_id, s.asset, s.amount,
                    t.token_basic_name, t.precision, b.precision, t.standard
             FROM src_transfers s
             JOIN tokens t ON t.chain_id = s.chain_id AND t.hash = s.asset
             JOIN token_basics b ON b.name = t.token_basic_name
             WHERE s.id > ?1 AND s.id <= ?2",
        )
        .bind(sql_id(range.after))
        .bind(sql_id(range.through))
        .fetch(&self.pool);

        let mut groups: HashMap<AssetKey, BasicGroup> = HashMap::new();

        while let Some((id, chain_id, asset, amount, basic, token_precision, basic_precision, nft)) =
            rows.try_next().await?
        {
            let key = AssetKey::new(ChainId::from_db(chain_id)?, asset);
            let amount = parse_amount(Stream::Source, id, amount)?;

            let group = match groups.entry(key) {
                std::collections::hash_map::Entry::Occupied(entry) => entry.into_mut(),
                std::collections::hash_map::Entry::Vacant(entry) => {
                    let token_decimals = catalog_decimals(entry.key().hash.as_str(), token_precision)?;
                    let basic_decimals = catalog_decimals(&basic, basic_precision)?;
                    entry.insert(BasicGroup {
                        basic,
                        token_decimals,
                        basic_decimals,
                        standard: if nft {
                            TokenStandard::NonFungible
                        } else {
                            TokenStandard::Fungible
                        },
                        delta: Delta::default(),
                    })
                }
            };

            group.delta.add(amount)?;
        }

        for group in groups.into_values() {
            let rescale_error = |source| LedgerError::Rescale {
                basic: group.basic.clone(),
                source,
            };
            let fine_decimals = group.basic_decimals.saturating_add(CARRY_DIGITS);

            let amount = match group.standard {
                TokenStandard::Fungible => {
                    rescale(group.delta.amount, group.token_decimals, fine_decimals)
                        .map_err(rescale_error)?
                }
                // NFT amounts are token ids; each transfer moves one item.
                TokenStandard::NonFungible => U256::from(group.delta.count)
                    .checked_mul(ten_pow(CARRY_DIGITS).map_err(rescale_error)?)
                    .ok_or(LedgerError::AmountOverflow)?,
            };

            let total = basics.entry(group.basic).or_default();
            total.amount = total
                .amount
                .checked_add(amount)
                .ok_or(LedgerError::AmountOverflow)?;
            total.count += group.delta.count;
        }

        Ok(basics)
    }

    async fn chain_address_counts(&self) -> Result<HashMap<ChainId, u64>, LedgerError> {
        let rows = sqlx::query_as::<_, (i64, i64)>(
            "SELECT chain_id, COUNT(DISTINCT address) FROM (
                 SELECT chain_id, from_address AS address FROM src_transfers
                 UNION
                 SELECT chain_id, to_address AS address FROM dst_transfers
             )
             GROUP BY chain_id",
        )
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter()
            .map(|(chain_id, count)| {
                ChainId::from_db(chain_id)
                    .map(|chain_id| (chain_id, id_from_sql(count)))
                    .map_err(LedgerError::from)
            })
            .collect()
    }

    async fn basic_address_counts(&self) -> Result<HashMap<String, u64>, LedgerError> {
        let rows = sqlx::query_as::<_, (String, i64)>(
            "SELECT t.token_basic_name, COUNT(DISTINCT a.address) FROM (
                 SELECT chain_id, asset, from_address AS address FROM src_transfers
                 UNION
                 SELECT chain_id, asset, to_address AS address FROM dst_transfers
             ) a
             JOIN tokens t ON t.chain_id = a.chain_id AND t.hash = a.asset
             GROUP BY t.token_basic_name",
        )
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .into_iter()
            .map(|(basic, count)| (basic, id_from_sql(count)))
            .collect())
    }

    async fn list_known_assets(&self) -> Result<Vec<Token>, LedgerError> {
        let rows = sqlx::query_as::<_, (i64, String, String, i64, bool, bool)>(
            "SELECT chain_id, hash, token_basic_name, precision, standard, reserve_tracked
             FROM tokens
             ORDER BY chain_id, hash",
        )
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter()
            .map(
                |(chain_id, hash, basic_name, precision, nft, reserve_tracked)| -> Result<Token, LedgerError> {
                let decimals = catalog_decimals(&hash, precision)?;
                Ok(Token {
                    key: AssetKey::new(ChainId::from_db(chain_id)?, hash),
                    basic_name,
                    decimals,
                    standard: if nft {
                        TokenStandard::NonFungible
                    } else {
                        TokenStandard::Fungible
                    },
                    reserve_tracked,
                })
            })
            .collect()
    }

    async fn list_known_chains(&self) -> Result<Vec<ChainId>, LedgerError> {
        let rows: Vec<i64> = sqlx::query_scalar("SELECT chain_id FROM chains ORDER BY chain_id")
            .fetch_all(&self.pool)
            .await?;

        rows.into_iter()
            .map(|chain_id| ChainId::from_db(chain_id).map_err(LedgerError::from))
            .collect()
    }

    async fn list_known_basics(&self) -> Result<Vec<TokenBasic>, LedgerError> {
        let rows = sqlx::query_as::<_, (String, i64, i64, i64, bool)>(
            "SELECT name, chain_id, precision, price, property FROM token_basics ORDER BY name",
        )
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter()
            .map(
                |(name, chain_id, precision, price, property)| -> Result<TokenBasic, LedgerError> {
                let decimals = catalog_decimals(&name, precision)?;
                let price = u64::try_from(price).map_err(|_| LedgerError::InvalidCatalog {
                    entry: name.clone(),
                    field: "price",
                    value: price,
                })?;

                Ok(TokenBasic {
                    name,
                    home_chain: ChainId::from_db(chain_id)?,
                    decimals,
                    price,
                    reserve_tracked: property,
                })
            })
            .collect()
    }
}
