use alloy::primitives::{Address, U256};
use clap::Parser;
use rust_decimal::Decimal;
use serde::Deserialize;
use sqlx::SqlitePool;
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::Level;
use url::Url;

use crate::chain::ChainId;
use crate::chain_data::RetryPolicy;
use crate::reserve::{
    DEFAULT_UNRELIABLE_ASSETS, ExternalBalanceSource, ReserveSettings, SupplyOverrides,
};
use crate::telemetry::{TelemetryConfig, TelemetryCtx, TelemetrySecrets};

#[derive(Parser, Debug)]
pub struct Env {
    /// Path to plaintext TOML configuration file
    #[clap(long)]
    pub config: PathBuf,
    /// Path to TOML secrets file
    #[clap(long)]
    pub secrets: PathBuf,
}

/// Non-secret settings deserialized from the plaintext config TOML.
#[derive(Deserialize)]
struct Config {
    database_url: String,
    log_level: Option<LogLevel>,
    relay_chain_id: Option<ChainId>,
    btc_reference: Option<String>,
    intervals: IntervalsConfig,
    #[serde(default)]
    chains: Vec<ChainConfig>,
    retry: Option<RetryConfig>,
    reserve: Option<ReserveConfig>,
    alert: Option<AlertConfig>,
    telemetry: Option<TelemetryConfig>,
}

/// Secret credentials deserialized from the secrets TOML.
#[derive(Deserialize)]
struct Secrets {
    #[serde(default)]
    rpc: Vec<RpcSecrets>,
    alert: Option<AlertSecrets>,
    telemetry: Option<TelemetrySecrets>,
}

/// Seconds between runs of each pass. Every pass must be listed.
#[derive(Deserialize)]
struct IntervalsConfig {
    token_statistics: u64,
    chain_statistics: u64,
    asset_statistics: u64,
    chain_addresses: u64,
    asset_addresses: u64,
    token_liquidity: u64,
    reserve_check: u64,
}

#[derive(Deserialize)]
struct ChainConfig {
    chain_id: ChainId,
    name: String,
    custody: Address,
}

#[derive(Deserialize)]
struct RpcSecrets {
    chain_id: ChainId,
    url: Url,
}

#[derive(Deserialize)]
struct RetryConfig {
    delay_ms: Option<u64>,
    balance_retries: Option<usize>,
    supply_retries: Option<usize>,
}

#[derive(Deserialize)]
struct ReserveConfig {
    materiality_threshold_usd: Option<Decimal>,
    unreliable_assets: Option<Vec<String>>,
    #[serde(default)]
    supply_overrides: Vec<SupplyOverrideConfig>,
    #[serde(default)]
    external_balances: Vec<ExternalBalanceConfig>,
}

/// Raw supply as a decimal string; values routinely exceed `u64`.
#[derive(Deserialize)]
struct SupplyOverrideConfig {
    asset: String,
    chain_id: ChainId,
    total_supply: String,
}

#[derive(Deserialize)]
struct ExternalBalanceConfig {
    asset: String,
    chain_id: ChainId,
    url: Url,
}

#[derive(Deserialize)]
struct AlertConfig {
    title: Option<String>,
}

#[derive(Deserialize)]
struct AlertSecrets {
    webhook_url: Url,
}

// ===== Runtime types (assembled from Config + Secrets) =====

/// Combined runtime context for the service.
#[derive(Debug, Clone)]
pub struct Ctx {
    pub(crate) database_url: String,
    pub log_level: LogLevel,
    pub(crate) relay_chain: ChainId,
    pub(crate) btc_reference: String,
    pub(crate) intervals: PassIntervals,
    pub(crate) chains: Vec<ChainCtx>,
    pub(crate) retry: RetryPolicy,
    pub(crate) reserve: ReserveSettings,
    pub(crate) alert_webhook: Option<Url>,
    pub telemetry: Option<TelemetryCtx>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PassIntervals {
    pub token_statistics: Duration,
    pub chain_statistics: Duration,
    pub asset_statistics: Duration,
    pub chain_addresses: Duration,
    pub asset_addresses: Duration,
    pub token_liquidity: Duration,
    pub reserve_check: Duration,
}

/// An EVM chain the service can read from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChainCtx {
    pub chain_id: ChainId,
    pub name: String,
    pub custody: Address,
    pub rpc_url: Url,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Trace,
    Debug,
    Info,
    Warn,
    Error,
}

impl From<LogLevel> for Level {
    fn from(log_level: LogLevel) -> Self {
        Self::from(&log_level)
    }
}

impl From<&LogLevel> for Level {
    fn from(log_level: &LogLevel) -> Self {
        match log_level {
            LogLevel::Trace => Self::TRACE,
            LogLevel::Debug => Self::DEBUG,
            LogLevel::Info => Self::INFO,
            LogLevel::Warn => Self::WARN,
            LogLevel::Error => Self::ERROR,
        }
    }
}

pub(crate) async fn configure_sqlite_pool(database_url: &str) -> Result<SqlitePool, sqlx::Error> {
    let pool = SqlitePool::connect(database_url).await?;

    // The service only reads the ledger tables but other processes write
    // them; WAL lets those writes proceed alongside our reads.
    sqlx::query("PRAGMA journal_mode = WAL")
        .execute(&pool)
        .await?;

    // Wait up to 10 seconds on a locked database instead of failing the pass.
    sqlx::query("PRAGMA busy_timeout = 10000")
        .execute(&pool)
        .await?;

    Ok(pool)
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read config file")]
    Io(#[from] std::io::Error),
    #[error("failed to parse TOML")]
    Toml(#[from] toml::de::Error),
    #[error("invalid URL")]
    Url(#[from] url::ParseError),
    #[error("interval for {0} must be at least one second")]
    ZeroInterval(&'static str),
    #[error("chain {0} is configured without an RPC URL")]
    MissingRpcUrl(ChainId),
    #[error("chain {0} is configured more than once")]
    DuplicateChain(ChainId),
    #[error("supply override for {asset} on chain {chain_id} is not an integer: {value}")]
    InvalidAmount {
        asset: String,
        chain_id: ChainId,
        value: String,
    },
    #[error("alert config present in config but alert secrets missing")]
    AlertSecretsMissing,
    #[error("alert secrets present but alert config missing in config")]
    AlertConfigMissing,
    #[error("telemetry config present in config but telemetry secrets missing")]
    TelemetrySecretsMissing,
    #[error("telemetry secrets present but telemetry config missing in config")]
    TelemetryConfigMissing,
}

impl ConfigError {
    /// Short, secret-free description for operator output.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Io(_) => "failed to read config file",
            Self::Toml(_) => "failed to parse TOML",
            Self::Url(_) => "invalid URL",
            Self::ZeroInterval(_) => "zero pass interval",
            Self::MissingRpcUrl(_) => "chain without RPC URL",
            Self::DuplicateChain(_) => "duplicate chain",
            Self::InvalidAmount { .. } => "invalid supply override",
            Self::AlertSecretsMissing => "alert secrets missing",
            Self::AlertConfigMissing => "alert config missing",
            Self::TelemetrySecretsMissing => "telemetry secrets missing",
            Self::TelemetryConfigMissing => "telemetry config missing",
        }
    }
}

impl Ctx {
    pub fn load_files(config: &Path, secrets: &Path) -> Result<Self, ConfigError> {
        let config_str = std::fs::read_to_string(config)?;
        let secrets_str = std::fs::read_to_string(secrets)?;
        Self::from_toml(&config_str, &secrets_str)
    }

    pub fn from_toml(config_toml: &str, secrets_toml: &str) -> Result<Self, ConfigError> {
        let config: Config = toml::from_str(config_toml)?;
        let secrets: Secrets = toml::from_str(secrets_toml)?;

        let log_level = config.log_level.unwrap_or(LogLevel::Debug);

        let intervals = assemble_intervals(&config.intervals)?;
        let chains = assemble_chains(config.chains, secrets.rpc)?;
        let reserve = assemble_reserve(config.reserve, config.alert.as_ref())?;
        let alert_webhook = assemble_alert(config.alert, secrets.alert)?;
        let telemetry = assemble_telemetry(config.telemetry, secrets.telemetry, &log_level)?;

        Ok(Self {
            database_url: config.database_url,
            log_level,
            relay_chain: config.relay_chain_id.unwrap_or(ChainId::RELAY),
            btc_reference: config.btc_reference.unwrap_or_else(|| "WBTC".to_owned()),
            intervals,
            chains,
            retry: assemble_retry(config.retry),
            reserve,
            alert_webhook,
            telemetry,
        })
    }

    pub async fn get_sqlite_pool(&self) -> Result<SqlitePool, sqlx::Error> {
        configure_sqlite_pool(&self.database_url).await
    }

    pub fn intervals(&self) -> PassIntervals {
        self.intervals
    }

    pub fn chains(&self) -> &[ChainCtx] {
        &self.chains
    }

    pub fn reserve_settings(&self) -> &ReserveSettings {
        &self.reserve
    }
}

fn interval(name: &'static str, seconds: u64) -> Result<Duration, ConfigError> {
    if seconds == 0 {
        return Err(ConfigError::ZeroInterval(name));
    }
    Ok(Duration::from_secs(seconds))
}

fn assemble_intervals(config: &IntervalsConfig) -> Result<PassIntervals, ConfigError> {
    Ok(PassIntervals {
        token_statistics: interval("token_statistics", config.token_statistics)?,
        chain_statistics: interval("chain_statistics", config.chain_statistics)?,
        asset_statistics: interval("asset_statistics", config.asset_statistics)?,
        chain_addresses: interval("chain_addresses", config.chain_addresses)?,
        asset_addresses: interval("asset_addresses", config.asset_addresses)?,
        token_liquidity: interval("token_liquidity", config.token_liquidity)?,
        reserve_check: interval("reserve_check", config.reserve_check)?,
    })
}

fn assemble_chains(
    chains: Vec<ChainConfig>,
    rpc: Vec<RpcSecrets>,
) -> Result<Vec<ChainCtx>, ConfigError> {
    let mut seen = HashSet::new();

    chains
        .into_iter()
        .map(|chain| {
            if !seen.insert(chain.chain_id) {
                return Err(ConfigError::DuplicateChain(chain.chain_id));
            }

            let rpc_url = rpc
                .iter()
                .find(|secret| secret.chain_id == chain.chain_id)
                .map(|secret| secret.url.clone())
                .ok_or(ConfigError::MissingRpcUrl(chain.chain_id))?;

            Ok(ChainCtx {
                chain_id: chain.chain_id,
                name: chain.name,
                custody: chain.custody,
                rpc_url,
            })
        })
        .collect()
}

fn assemble_retry(config: Option<RetryConfig>) -> RetryPolicy {
    let defaults = RetryPolicy::default();
    let Some(config) = config else {
        return defaults;
    };

    RetryPolicy {
        delay: config
            .delay_ms
            .map_or(defaults.delay, Duration::from_millis),
        balance_retries: config.balance_retries.unwrap_or(defaults.balance_retries),
        supply_retries: config.supply_retries.unwrap_or(defaults.supply_retries),
    }
}

fn assemble_reserve(
    config: Option<ReserveConfig>,
    alert: Option<&AlertConfig>,
) -> Result<ReserveSettings, ConfigError> {
    let mut settings = ReserveSettings::default();

    if let Some(title) = alert.and_then(|alert| alert.title.clone()) {
        settings.alert_title = title;
    }

    let Some(config) = config else {
        return Ok(settings);
    };

    if let Some(threshold) = config.materiality_threshold_usd {
        settings.materiality_threshold_usd = threshold;
    }

    settings.unreliable_assets = config.unreliable_assets.map_or_else(
        || {
            DEFAULT_UNRELIABLE_ASSETS
                .iter()
                .map(|name| (*name).to_owned())
                .collect()
        },
        |assets| assets.into_iter().collect(),
    );

    settings.overrides = config
        .supply_overrides
        .into_iter()
        .map(|entry| {
            let supply = U256::from_str_radix(entry.total_supply.trim(), 10).map_err(|_| {
                ConfigError::InvalidAmount {
                    asset: entry.asset.clone(),
                    chain_id: entry.chain_id,
                    value: entry.total_supply.clone(),
                }
            })?;
            Ok((entry.asset, entry.chain_id, supply))
        })
        .collect::<Result<SupplyOverrides, ConfigError>>()?;

    settings.external_balances = config
        .external_balances
        .into_iter()
        .map(|entry| ExternalBalanceSource {
            asset: entry.asset,
            chain_id: entry.chain_id,
            url: entry.url,
        })
        .collect();

    Ok(settings)
}

fn assemble_alert(
    config: Option<AlertConfig>,
    secrets: Option<AlertSecrets>,
) -> Result<Option<Url>, ConfigError> {
    match (config, secrets) {
        (Some(_), Some(secrets)) => Ok(Some(secrets.webhook_url)),
        (Some(_), None) => Err(ConfigError::AlertSecretsMissing),
        (None, Some(_)) => Err(ConfigError::AlertConfigMissing),
        (None, None) => Ok(None),
    }
}

fn assemble_telemetry(
    config: Option<TelemetryConfig>,
    secrets: Option<TelemetrySecrets>,
    log_level: &LogLevel,
) -> Result<Option<TelemetryCtx>, ConfigError> {
    match (config, secrets) {
        (Some(config), Some(secrets)) => Ok(Some(TelemetryCtx::assemble(
            config,
            secrets,
            log_level.into(),
        )?)),
        (Some(_), None) => Err(ConfigError::TelemetrySecretsMissing),
        (None, Some(_)) => Err(ConfigError::TelemetryConfigMissing),
        (None, None) => Ok(None),
    }
}

pub(crate) fn default_filter(level: Level) -> String {
    format!("bridge_stats={level}")
}

pub fn setup_tracing(log_level: &LogLevel) {
    let default_filter = default_filter(log_level.into());

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| default_filter.into()),
        )
        .init();
}
