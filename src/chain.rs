//! Bridge chain identifiers.
//!
//! Ids are assigned by the bridge, not by the chains themselves: chain `0`
//! is the relay chain every cross-chain transfer passes through.

use serde::{Deserialize, Serialize};
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ChainId(pub u32);

impl ChainId {
    pub const RELAY: Self = Self(0);
    pub const BITCOIN: Self = Self(1);
    pub const ETHEREUM: Self = Self(2);
    pub const ONTOLOGY: Self = Self(3);
    pub const NEO: Self = Self(4);
    pub const SWITCHEO: Self = Self(5);
    pub const BSC: Self = Self(6);
    pub const HECO: Self = Self(7);
    pub const O3: Self = Self(10);
    pub const NEO3: Self = Self(11);
    pub const OKEX: Self = Self(12);

    pub(crate) fn from_db(raw: i64) -> Result<Self, InvalidChainId> {
        u32::try_from(raw)
            .map(Self)
            .map_err(|_| InvalidChainId(raw))
    }

    pub(crate) fn to_db(self) -> i64 {
        i64::from(self.0)
    }
}

impl fmt::Display for ChainId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
#[error("chain id {0} is out of range")]
pub struct InvalidChainId(pub i64);
