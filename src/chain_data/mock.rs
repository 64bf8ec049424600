//! In-memory [`ChainData`] for tests.

use alloy::primitives::U256;
use alloy::transports::TransportErrorKind;
use async_trait::async_trait;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicUsize, Ordering};

use super::{ChainData, ChainDataError};
use crate::ledger::AssetKey;

#[derive(Default)]
pub(crate) struct MockChainData {
    balances: HashMap<AssetKey, U256>,
    supplies: HashMap<AssetKey, U256>,
    broken: HashSet<AssetKey>,
    failures_remaining: AtomicUsize,
    calls: AtomicUsize,
}

impl MockChainData {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub(crate) fn with_balance(mut self, asset: &AssetKey, balance: U256) -> Self {
        self.balances.insert(asset.clone(), balance);
        self
    }

    #[must_use]
    pub(crate) fn with_supply(mut self, asset: &AssetKey, supply: U256) -> Self {
        self.supplies.insert(asset.clone(), supply);
        self
    }

    /// Every read of `asset` fails with a transport error.
    #[must_use]
    pub(crate) fn broken(mut self, asset: &AssetKey) -> Self {
        self.broken.insert(asset.clone());
        self
    }

    /// The next `count` reads fail with a transport error.
    #[must_use]
    pub(crate) fn failing_first(self, count: usize) -> Self {
        self.failures_remaining.store(count, Ordering::SeqCst);
        self
    }

    pub(crate) fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    fn read(
        &self,
        table: &HashMap<AssetKey, U256>,
        asset: &AssetKey,
    ) -> Result<U256, ChainDataError> {
        self.calls.fetch_add(1, Ordering::SeqCst);

        let injected = self
            .failures_remaining
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |left| left.checked_sub(1))
            .is_ok();

        if injected || self.broken.contains(asset) {
            return Err(TransportErrorKind::custom_str("connection reset").into());
        }

        table
            .get(asset)
            .copied()
            .ok_or(ChainDataError::UnsupportedChain(asset.chain_id))
    }
}

#[async_trait]
impl ChainData for MockChainData {
    async fn balance(&self, asset: &AssetKey) -> Result<U256, ChainDataError> {
        self.read(&self.balances, asset)
    }

    async fn total_supply(&self, asset: &AssetKey) -> Result<U256, ChainDataError> {
        self.read(&self.supplies, asset)
    }
}
