//! Live on-chain reads: custody balances and token total supplies.

mod evm;
#[cfg(test)]
pub(crate) mod mock;

use alloy::primitives::U256;
use async_trait::async_trait;
use backon::{ConstantBuilder, Retryable};
use std::time::Duration;
use tracing::warn;

use crate::chain::ChainId;
use crate::ledger::AssetKey;

pub use evm::EvmChainData;

#[derive(Debug, thiserror::Error)]
pub enum ChainDataError {
    #[error("no RPC endpoint configured for chain {0}")]
    UnsupportedChain(ChainId),
    #[error("asset hash {0:?} is not an EVM address")]
    InvalidAssetHash(String),
    #[error("native asset on chain {0} has no total supply")]
    NativeSupply(ChainId),
    #[error(transparent)]
    Transport(#[from] alloy::transports::TransportError),
    #[error(transparent)]
    Contract(#[from] alloy::contract::Error),
}

impl ChainDataError {
    /// Whether retrying the same read could succeed.
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Transport(_) | Self::Contract(_))
    }
}

#[async_trait]
pub trait ChainData: Send + Sync {
    /// Balance held by the bridge's custody contract on the asset's chain.
    async fn balance(&self, asset: &AssetKey) -> Result<U256, ChainDataError>;

    /// The asset's total supply as reported by its own contract.
    async fn total_supply(&self, asset: &AssetKey) -> Result<U256, ChainDataError>;
}

/// Fixed-backoff retry budget for chain reads.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub delay: Duration,
    pub balance_retries: usize,
    pub supply_retries: usize,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            delay: Duration::from_secs(1),
            balance_retries: 4,
            supply_retries: 2,
        }
    }
}

/// Wraps another [`ChainData`] with bounded fixed-delay retries of
/// transient failures.
pub struct RetryingChainData<C> {
    inner: C,
    policy: RetryPolicy,
}

impl<C> RetryingChainData<C> {
    pub fn new(inner: C, policy: RetryPolicy) -> Self {
        Self { inner, policy }
    }

    fn backoff(&self, retries: usize) -> ConstantBuilder {
        ConstantBuilder::default()
            .with_delay(self.policy.delay)
            .with_max_times(retries)
    }
}

#[async_trait]
impl<C: ChainData> ChainData for RetryingChainData<C> {
    async fn balance(&self, asset: &AssetKey) -> Result<U256, ChainDataError> {
        (|| async { self.inner.balance(asset).await })
            .retry(self.backoff(self.policy.balance_retries))
            .when(ChainDataError::is_transient)
            .notify(|err, dur| {
                warn!(%asset, %err, ?dur, "Retrying custody balance read");
            })
            .await
    }

    async fn total_supply(&self, asset: &AssetKey) -> Result<U256, ChainDataError> {
        (|| async { self.inner.total_supply(asset).await })
            .retry(self.backoff(self.policy.supply_retries))
            .when(ChainDataError::is_transient)
            .notify(|err, dur| {
                warn!(%asset, %err, ?dur, "Retrying total supply read");
            })
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chain_data::mock::MockChainData;
    use crate::test_utils::WBTC_ETH;

    fn instant_retries() -> RetryPolicy {
        RetryPolicy {
            delay: Duration::ZERO,
            ..RetryPolicy::default()
        }
    }

    #[test]
    fn default_policy_matches_reconciliation_budget() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.delay, Duration::from_secs(1));
        assert_eq!(policy.balance_retries, 4);
        assert_eq!(policy.supply_retries, 2);
    }

    #[tokio::test]
    async fn transient_balance_failures_are_retried_until_success() {
        let asset = AssetKey::new(ChainId::ETHEREUM, WBTC_ETH);
        let mock = MockChainData::new()
            .with_balance(&asset, U256::from(42u8))
            .failing_first(3);
        let chain_data = RetryingChainData::new(mock, instant_retries());

        let balance = chain_data.balance(&asset).await.unwrap();

        assert_eq!(balance, U256::from(42u8));
        assert_eq!(chain_data.inner.calls(), 4);
    }

    #[tokio::test]
    async fn balance_gives_up_after_four_retries() {
        let asset = AssetKey::new(ChainId::ETHEREUM, WBTC_ETH);
        let mock = MockChainData::new()
            .with_balance(&asset, U256::from(42u8))
            .failing_first(100);
        let chain_data = RetryingChainData::new(mock, instant_retries());

        let err = chain_data.balance(&asset).await.unwrap_err();

        assert!(err.is_transient());
        assert_eq!(chain_data.inner.calls(), 5);
    }

    #[tokio::test]
    async fn supply_gives_up_after_two_retries() {
        let asset = AssetKey::new(ChainId::ETHEREUM, WBTC_ETH);
        let mock = MockChainData::new()
            .with_supply(&asset, U256::from(42u8))
            .failing_first(100);
        let chain_data = RetryingChainData::new(mock, instant_retries());

        chain_data.total_supply(&asset).await.unwrap_err();

        assert_eq!(chain_data.inner.calls(), 3);
    }

    #[tokio::test]
    async fn permanent_failures_are_not_retried() {
        let asset = AssetKey::new(ChainId::NEO, "not-configured");
        let chain_data = RetryingChainData::new(MockChainData::new(), instant_retries());

        let err = chain_data.balance(&asset).await.unwrap_err();

        assert!(matches!(err, ChainDataError::UnsupportedChain(ChainId::NEO)));
        assert_eq!(chain_data.inner.calls(), 1);
    }
}
