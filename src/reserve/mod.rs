//! Cross-checks bridged supply against custody balances for every
//! reserve-tracked asset and raises one batched alert when the
//! outstanding difference of any asset is material.

mod external;
mod overrides;

use alloy::primitives::{I256, U256};
use async_trait::async_trait;
use reqwest::StatusCode;
use rust_decimal::Decimal;
use std::collections::HashSet;
use std::fmt::Write as _;
use std::sync::Arc;
use tracing::{error, info, warn};
use url::Url;

use crate::alert::{Alert, AlertSink};
use crate::chain::ChainId;
use crate::chain_data::ChainData;
use crate::error::StatsError;
use crate::ledger::{LedgerError, LedgerReader, Token, TokenBasic};
use crate::scheduler::{PassOutcome, StatsPass};
use crate::valuation::{rescale, usd_decimal};

pub use external::{ExternalBalanceSource, ExternalBalances, HttpExternalBalances};
pub use overrides::SupplyOverrides;

/// Assets whose on-chain figures are known not to reconcile; they are
/// reported separately and never alert.
pub const DEFAULT_UNRELIABLE_ASSETS: [&str; 9] = [
    "BLES", "GOF", "LEV", "mBTM", "MOZ", "O3", "STN", "USDT", "XMPT",
];

#[derive(Debug, thiserror::Error)]
pub enum ReserveError {
    #[error(transparent)]
    Ledger(#[from] LedgerError),
    #[error("request to {url} failed")]
    ExternalRequest {
        url: Url,
        #[source]
        source: reqwest::Error,
    },
    #[error("{url} answered with status {status}")]
    ExternalStatus { url: Url, status: StatusCode },
    #[error("{url} returned an unusable balance: {body}")]
    ExternalBody { url: Url, body: String },
}

#[derive(Debug, Clone)]
pub struct ReserveSettings {
    pub materiality_threshold_usd: Decimal,
    pub unreliable_assets: HashSet<String>,
    pub overrides: SupplyOverrides,
    pub external_balances: Vec<ExternalBalanceSource>,
    pub alert_title: String,
}

impl Default for ReserveSettings {
    fn default() -> Self {
        Self {
            materiality_threshold_usd: Decimal::from(10_000),
            unreliable_assets: DEFAULT_UNRELIABLE_ASSETS
                .iter()
                .map(|name| (*name).to_owned())
                .collect(),
            overrides: SupplyOverrides::default(),
            external_balances: Vec::new(),
            alert_title: "[bridge] reserve drift".to_owned(),
        }
    }
}

/// One chain's contribution to an asset's reserve position, in the
/// asset's own precision.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChainReserve {
    pub chain_id: ChainId,
    pub total_supply: U256,
    pub balance: U256,
    /// `total_supply - balance`.
    pub flow: I256,
    /// Why a figure was degraded to zero, if any read failed.
    pub failures: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AssetReserve {
    pub name: String,
    pub decimals: u8,
    pub price: u64,
    pub chains: Vec<ChainReserve>,
    /// Sum of every chain's flow.
    pub difference: I256,
    /// USD value of a positive difference.
    pub usd_value: Option<Decimal>,
}

impl AssetReserve {
    pub fn has_failures(&self) -> bool {
        self.chains.iter().any(|chain| !chain.failures.is_empty())
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReserveReport {
    pub reliable: Vec<AssetReserve>,
    pub unreliable: Vec<AssetReserve>,
    /// Assets included in the alert raised by this run.
    pub alerted: Vec<String>,
    pub alert_failed: bool,
}

pub struct ReserveReconciler {
    ledger: Arc<dyn LedgerReader>,
    chain_data: Arc<dyn ChainData>,
    external: Arc<dyn ExternalBalances>,
    alerts: Arc<dyn AlertSink>,
    settings: ReserveSettings,
}

impl ReserveReconciler {
    pub fn new(
        ledger: Arc<dyn LedgerReader>,
        chain_data: Arc<dyn ChainData>,
        external: Arc<dyn ExternalBalances>,
        alerts: Arc<dyn AlertSink>,
        settings: ReserveSettings,
    ) -> Self {
        Self {
            ledger,
            chain_data,
            external,
            alerts,
            settings,
        }
    }

    #[tracing::instrument(skip(self), level = tracing::Level::DEBUG)]
    pub async fn reconcile(&self) -> Result<ReserveReport, ReserveError> {
        let mut basics: Vec<TokenBasic> = self
            .ledger
            .list_known_basics()
            .await?
            .into_iter()
            .filter(|basic| basic.reserve_tracked)
            .collect();
        basics.sort_by(|a, b| a.name.cmp(&b.name));

        let tokens: Vec<Token> = self
            .ledger
            .list_known_assets()
            .await?
            .into_iter()
            .filter(|token| token.reserve_tracked)
            .collect();

        let mut report = ReserveReport::default();

        for basic in &basics {
            let unreliable = self.settings.unreliable_assets.contains(&basic.name);
            let position = self.assess(basic, &tokens, unreliable).await;
            log_position(&position, unreliable);

            if unreliable {
                report.unreliable.push(position);
            } else {
                report.reliable.push(position);
            }
        }

        let material: Vec<&AssetReserve> = report
            .reliable
            .iter()
            .filter(|asset| {
                asset
                    .usd_value
                    .is_some_and(|usd| usd > self.settings.materiality_threshold_usd)
            })
            .collect();

        if material.is_empty() {
            return Ok(report);
        }

        let alert = self.build_alert(&material);
        let alerted: Vec<String> = material.iter().map(|asset| asset.name.clone()).collect();

        match self.alerts.send(&alert).await {
            Ok(delivery) => {
                info!(?delivery, assets = ?alerted, "Reserve drift alert raised");
                report.alerted = alerted;
            }
            Err(error) => {
                error!(%error, assets = ?alerted, "Failed to deliver reserve drift alert");
                report.alert_failed = true;
            }
        }

        Ok(report)
    }

    async fn assess(
        &self,
        basic: &TokenBasic,
        tokens: &[Token],
        unreliable: bool,
    ) -> AssetReserve {
        let mut chains = Vec::new();

        for token in tokens.iter().filter(|token| token.basic_name == basic.name) {
            chains.push(self.chain_position(basic, token, unreliable).await);
        }

        for source in self
            .settings
            .external_balances
            .iter()
            .filter(|source| source.asset == basic.name)
        {
            chains.push(self.external_position(source).await);
        }

        let mut difference = I256::ZERO;
        for chain in &mut chains {
            match difference.checked_add(chain.flow) {
                Some(sum) => difference = sum,
                None => {
                    warn!(
                        asset = %basic.name,
                        chain_id = %chain.chain_id,
                        "Reserve difference overflows, excluding chain"
                    );
                    chain.failures.push("flow: sum exceeds the signed 256-bit range".to_owned());
                }
            }
        }

        let usd_value = if difference.is_positive() {
            match usd_decimal(difference.unsigned_abs(), basic.decimals, basic.price) {
                Ok(usd) => Some(usd),
                Err(error) => {
                    warn!(asset = %basic.name, %error, "Cannot value reserve difference");
                    None
                }
            }
        } else {
            None
        };

        AssetReserve {
            name: basic.name.clone(),
            decimals: basic.decimals,
            price: basic.price,
            chains,
            difference,
            usd_value,
        }
    }

    async fn chain_position(
        &self,
        basic: &TokenBasic,
        token: &Token,
        unreliable: bool,
    ) -> ChainReserve {
        let chain_id = token.key.chain_id;
        let mut failures = Vec::new();

        let balance = match self.chain_data.balance(&token.key).await {
            Ok(balance) => balance,
            Err(error) => {
                warn!(asset = %basic.name, token = %token.key, %error, "Custody balance unavailable");
                failures.push(format!("balance: {error}"));
                U256::ZERO
            }
        };

        // Supply minted on the home chain is the original issuance, not
        // bridged supply. An override replaces whatever the chain reports.
        let total_supply = if let Some(supply) = self.settings.overrides.lookup(&basic.name, chain_id) {
            supply
        } else if !unreliable && chain_id == basic.home_chain {
            U256::ZERO
        } else {
            match self.chain_data.total_supply(&token.key).await {
                Ok(supply) => supply,
                Err(error) => {
                    warn!(asset = %basic.name, token = %token.key, %error, "Total supply unavailable");
                    failures.push(format!("total supply: {error}"));
                    U256::ZERO
                }
            }
        };

        let balance = basic_units(balance, token, basic, "balance", &mut failures);
        let total_supply = basic_units(total_supply, token, basic, "total supply", &mut failures);

        let flow = signed(total_supply, "total supply", &mut failures)
            - signed(balance, "balance", &mut failures);

        ChainReserve {
            chain_id,
            total_supply,
            balance,
            flow,
            failures,
        }
    }

    async fn external_position(&self, source: &ExternalBalanceSource) -> ChainReserve {
        let mut failures = Vec::new();

        let amount = match self.external.fetch(source).await {
            Ok(amount) => amount,
            Err(error) => {
                warn!(asset = %source.asset, url = %source.url, %error, "External balance unavailable");
                failures.push(format!("external balance: {error}"));
                U256::ZERO
            }
        };

        let flow = signed(amount, "external balance", &mut failures);

        ChainReserve {
            chain_id: source.chain_id,
            total_supply: amount,
            balance: U256::ZERO,
            flow,
            failures,
        }
    }

    fn build_alert(&self, material: &[&AssetReserve]) -> Alert {
        let mut body = format!("### {}\n", self.settings.alert_title);

        for asset in material {
            let usd = asset.usd_value.unwrap_or_default();
            let _ = writeln!(
                body,
                "- **{}**: difference {} ({} USD)",
                asset.name, asset.difference, usd
            );
            for chain in &asset.chains {
                let _ = writeln!(
                    body,
                    "  - chain {}: supply {}, balance {}, flow {}",
                    chain.chain_id, chain.total_supply, chain.balance, chain.flow
                );
            }
        }

        Alert {
            title: self.settings.alert_title.clone(),
            body,
        }
    }
}

/// Converts `amount` from the token's precision to the basic's. A figure
/// that cannot be rescaled counts as zero.
fn basic_units(
    amount: U256,
    token: &Token,
    basic: &TokenBasic,
    label: &str,
    failures: &mut Vec<String>,
) -> U256 {
    match rescale(amount, token.decimals, basic.decimals) {
        Ok(amount) => amount,
        Err(error) => {
            warn!(asset = %basic.name, token = %token.key, label, %error, "Cannot rescale reserve figure");
            failures.push(format!("{label}: {error}"));
            U256::ZERO
        }
    }
}

/// A figure above `I256::MAX` counts as zero. Differences of two results
/// cannot overflow since both are non-negative.
fn signed(amount: U256, label: &str, failures: &mut Vec<String>) -> I256 {
    I256::try_from(amount).unwrap_or_else(|_| {
        failures.push(format!("{label}: {amount} exceeds the signed 256-bit range"));
        I256::ZERO
    })
}

fn log_position(position: &AssetReserve, unreliable: bool) {
    info!(
        asset = %position.name,
        difference = %position.difference,
        usd = ?position.usd_value,
        unreliable,
        "Reserve position"
    );

    for chain in &position.chains {
        info!(
            asset = %position.name,
            chain_id = %chain.chain_id,
            total_supply = %chain.total_supply,
            balance = %chain.balance,
            flow = %chain.flow,
            failures = ?chain.failures,
            "Reserve chain entry"
        );
    }
}

#[async_trait]
impl StatsPass for ReserveReconciler {
    fn name(&self) -> &'static str {
        "reserve_check"
    }

    async fn run_once(&self) -> Result<PassOutcome, StatsError> {
        let report = self.reconcile().await?;

        let failed = report
            .reliable
            .iter()
            .chain(&report.unreliable)
            .filter(|asset| asset.has_failures())
            .count()
            + usize::from(report.alert_failed);

        Ok(PassOutcome::Completed {
            updated: report.reliable.len() + report.unreliable.len(),
            failed,
        })
    }
}
