//! Manual total-supply overrides for assets whose on-chain supply does not
//! reflect what the bridge actually minted.

use alloy::primitives::U256;
use std::collections::HashMap;

use crate::chain::ChainId;

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SupplyOverrides {
    entries: HashMap<(String, ChainId), U256>,
}

impl SupplyOverrides {
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn with(mut self, asset: impl Into<String>, chain_id: ChainId, supply: U256) -> Self {
        self.entries.insert((asset.into(), chain_id), supply);
        self
    }

    pub fn lookup(&self, asset: &str, chain_id: ChainId) -> Option<U256> {
        self.entries.get(&(asset.to_owned(), chain_id)).copied()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl FromIterator<(String, ChainId, U256)> for SupplyOverrides {
    fn from_iter<I: IntoIterator<Item = (String, ChainId, U256)>>(iter: I) -> Self {
        Self {
            entries: iter
                .into_iter()
                .map(|(asset, chain_id, supply)| ((asset, chain_id), supply))
                .collect(),
        }
    }
}
