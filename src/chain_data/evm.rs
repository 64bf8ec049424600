use alloy::primitives::{Address, U256};
use alloy::providers::{DynProvider, Provider, ProviderBuilder};
use async_trait::async_trait;
use std::collections::HashMap;
use std::str::FromStr;
use url::Url;

use super::{ChainData, ChainDataError};
use crate::bindings::IERC20;
use crate::chain::ChainId;
use crate::ledger::AssetKey;

struct EvmChain {
    provider: DynProvider,
    custody: Address,
}

/// Reads balances and supplies over JSON-RPC from EVM chains.
///
/// The zero address stands for a chain's native asset.
#[derive(Default)]
pub struct EvmChainData {
    chains: HashMap<ChainId, EvmChain>,
}

impl EvmChainData {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a chain whose custody contract holds locked assets.
    #[must_use]
    pub fn with_chain(mut self, chain_id: ChainId, provider: DynProvider, custody: Address) -> Self {
        self.chains.insert(chain_id, EvmChain { provider, custody });
        self
    }

    #[must_use]
    pub fn with_http_chain(self, chain_id: ChainId, rpc_url: Url, custody: Address) -> Self {
        let provider = ProviderBuilder::new().connect_http(rpc_url).erased();
        self.with_chain(chain_id, provider, custody)
    }

    fn chain(&self, chain_id: ChainId) -> Result<&EvmChain, ChainDataError> {
        self.chains
            .get(&chain_id)
            .ok_or(ChainDataError::UnsupportedChain(chain_id))
    }
}

fn token_address(asset: &AssetKey) -> Result<Address, ChainDataError> {
    Address::from_str(&asset.hash).map_err(|_| ChainDataError::InvalidAssetHash(asset.hash.clone()))
}

#[async_trait]
impl ChainData for EvmChainData {
    async fn balance(&self, asset: &AssetKey) -> Result<U256, ChainDataError> {
        let chain = self.chain(asset.chain_id)?;
        let token = token_address(asset)?;

        if token == Address::ZERO {
            return Ok(chain.provider.get_balance(chain.custody).await?);
        }

        let erc20 = IERC20::new(token, &chain.provider);
        Ok(erc20.balanceOf(chain.custody).call().await?)
    }

    async fn total_supply(&self, asset: &AssetKey) -> Result<U256, ChainDataError> {
        let chain = self.chain(asset.chain_id)?;
        let token = token_address(asset)?;

        if token == Address::ZERO {
            return Err(ChainDataError::NativeSupply(asset.chain_id));
        }

        let erc20 = IERC20::new(token, &chain.provider);
        Ok(erc20.totalSupply().call().await?)
    }
}

#[cfg(test)]
mod tests {
    use alloy::primitives::{Bytes, address};
    use alloy::providers::mock::Asserter;
    use alloy::sol_types::SolCall;

    use super::*;
    use crate::bindings::IERC20::{balanceOfCall, totalSupplyCall};
    use crate::test_utils::WBTC_ETH;

    const CUSTODY: Address = address!("0x250e76987d838a75310c34bf422ea9f1ac4cc906");

    fn mocked(asserter: Asserter) -> EvmChainData {
        let provider = ProviderBuilder::new()
            .connect_mocked_client(asserter)
            .erased();
        EvmChainData::new().with_chain(ChainId::ETHEREUM, provider, CUSTODY)
    }

    #[tokio::test]
    async fn erc20_balance_is_read_for_custody_contract() {
        let asserter = Asserter::new();
        asserter.push_success(&Bytes::from(<balanceOfCall as SolCall>::abi_encode_returns(
            &U256::from(500_000_000u64),
        )));
        let chain_data = mocked(asserter);

        let balance = chain_data
            .balance(&AssetKey::new(ChainId::ETHEREUM, WBTC_ETH))
            .await
            .unwrap();

        assert_eq!(balance, U256::from(500_000_000u64));
    }

    #[tokio::test]
    async fn erc20_total_supply() {
        let asserter = Asserter::new();
        asserter.push_success(&Bytes::from(<totalSupplyCall as SolCall>::abi_encode_returns(
            &U256::from(21_000_000u64),
        )));
        let chain_data = mocked(asserter);

        let supply = chain_data
            .total_supply(&AssetKey::new(ChainId::ETHEREUM, WBTC_ETH))
            .await
            .unwrap();

        assert_eq!(supply, U256::from(21_000_000u64));
    }

    #[tokio::test]
    async fn native_balance_uses_account_balance() {
        let asserter = Asserter::new();
        asserter.push_success(&U256::from(3_000_000_000_000_000_000u64));
        let chain_data = mocked(asserter);

        let balance = chain_data
            .balance(&AssetKey::new(
                ChainId::ETHEREUM,
                "0000000000000000000000000000000000000000",
            ))
            .await
            .unwrap();

        assert_eq!(balance, U256::from(3_000_000_000_000_000_000u64));
    }

    #[tokio::test]
    async fn native_asset_has_no_total_supply() {
        let chain_data = mocked(Asserter::new());

        let err = chain_data
            .total_supply(&AssetKey::new(
                ChainId::ETHEREUM,
                "0000000000000000000000000000000000000000",
            ))
            .await
            .unwrap_err();

        assert!(matches!(err, ChainDataError::NativeSupply(ChainId::ETHEREUM)));
    }

    #[tokio::test]
    async fn unconfigured_chain_is_unsupported() {
        let chain_data = mocked(Asserter::new());

        let err = chain_data
            .balance(&AssetKey::new(ChainId::BSC, WBTC_ETH))
            .await
            .unwrap_err();

        assert!(matches!(err, ChainDataError::UnsupportedChain(ChainId::BSC)));
        assert!(!err.is_transient());
    }

    #[tokio::test]
    async fn non_evm_hash_is_rejected() {
        let chain_data = mocked(Asserter::new());

        let err = chain_data
            .balance(&AssetKey::new(ChainId::ETHEREUM, "AQ2x7qLVw1vBY1vA5DkmsSSmWSUeUyGR5b"))
            .await
            .unwrap_err();

        assert!(matches!(err, ChainDataError::InvalidAssetHash(_)));
    }

    #[tokio::test]
    async fn rpc_error_is_transient() {
        let asserter = Asserter::new();
        asserter.push_failure_msg("header not found");
        let chain_data = mocked(asserter);

        let err = chain_data
            .balance(&AssetKey::new(ChainId::ETHEREUM, WBTC_ETH))
            .await
            .unwrap_err();

        assert!(err.is_transient());
    }
}
