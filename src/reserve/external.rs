//! Balances held outside the bridge's own custody, read from HTTP
//! endpoints that answer `{"Balance": <integer>}`.

use alloy::primitives::U256;
use async_trait::async_trait;
use reqwest::Client;
use serde::Deserialize;
use serde_json::Value;
use url::Url;

use super::ReserveError;
use crate::chain::ChainId;

/// An externally held balance merged into one asset's reserve position
/// as if it were another chain.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExternalBalanceSource {
    pub asset: String,
    pub chain_id: ChainId,
    pub url: Url,
}

#[async_trait]
pub trait ExternalBalances: Send + Sync {
    async fn fetch(&self, source: &ExternalBalanceSource) -> Result<U256, ReserveError>;
}

#[derive(Deserialize)]
struct BalanceResponse {
    #[serde(rename = "Balance")]
    balance: Value,
}

pub struct HttpExternalBalances {
    client: Client,
}

impl Default for HttpExternalBalances {
    fn default() -> Self {
        Self::new()
    }
}

impl HttpExternalBalances {
    pub fn new() -> Self {
        Self {
            client: Client::new(),
        }
    }
}

/// Accepts the balance as a bare JSON integer of any size or as a quoted
/// decimal string.
fn parse_balance(url: &Url, value: &Value) -> Result<U256, ReserveError> {
    let invalid = || ReserveError::ExternalBody {
        url: url.clone(),
        body: value.to_string(),
    };

    match value {
        Value::Number(number) => {
            U256::from_str_radix(&number.to_string(), 10).map_err(|_| invalid())
        }
        Value::String(text) => U256::from_str_radix(text.trim(), 10).map_err(|_| invalid()),
        _ => Err(invalid()),
    }
}

#[async_trait]
impl ExternalBalances for HttpExternalBalances {
    async fn fetch(&self, source: &ExternalBalanceSource) -> Result<U256, ReserveError> {
        let response = self
            .client
            .get(source.url.clone())
            .send()
            .await
            .map_err(|error| ReserveError::ExternalRequest {
                url: source.url.clone(),
                source: error,
            })?;

        let status = response.status();
        if !status.is_success() {
            return Err(ReserveError::ExternalStatus {
                url: source.url.clone(),
                status,
            });
        }

        let body: BalanceResponse =
            response
                .json()
                .await
                .map_err(|error| ReserveError::ExternalRequest {
                    url: source.url.clone(),
                    source: error,
                })?;

        parse_balance(&source.url, &body.balance)
    }
}
