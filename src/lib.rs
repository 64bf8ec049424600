use sqlx::SqlitePool;
use std::sync::Arc;
use tracing::{info, info_span};

pub mod aggregation;
pub mod alert;
mod bindings;
pub mod chain;
pub mod chain_data;
pub mod config;
mod error;
pub mod ledger;
pub mod reserve;
pub mod scheduler;
pub mod statistic;
mod telemetry;
pub mod valuation;

pub use error::StatsError;
pub use telemetry::{TelemetryCtx, TelemetryError, TelemetryGuard};

#[cfg(test)]
pub(crate) mod test_utils;

use crate::aggregation::{
    AssetAddressPass, AssetStatisticsPass, ChainAddressPass, ChainStatisticsPass,
    TokenLiquidityPass, TokenStatisticsPass,
};
use crate::alert::{AlertSink, LogAlertSink, WebhookAlertSink};
use crate::chain_data::{ChainData, EvmChainData, RetryingChainData};
use crate::config::Ctx;
use crate::ledger::{LedgerReader, SqliteLedger};
use crate::reserve::{HttpExternalBalances, ReserveReconciler};
use crate::scheduler::StatsEngine;
use crate::statistic::{SqliteStatisticStore, StatisticStore};

pub async fn launch(ctx: Ctx) -> anyhow::Result<()> {
    let launch_span = info_span!("launch");
    let _enter = launch_span.enter();

    let pool = ctx.get_sqlite_pool().await?;
    sqlx::migrate!().run(&pool).await?;

    let engine = start_engine(&ctx, pool);
    info!(passes = engine.running(), "Statistics engine running");

    tokio::signal::ctrl_c().await?;
    info!("Received shutdown signal, waiting for in-flight passes...");

    engine.shutdown().await;

    info!("Shutdown complete");
    Ok(())
}

/// Wires every pass against `pool` and the chains in `ctx`, and starts
/// them on their configured intervals.
pub fn start_engine(ctx: &Ctx, pool: SqlitePool) -> StatsEngine {
    let ledger: Arc<dyn LedgerReader> = Arc::new(SqliteLedger::new(pool.clone()));
    let store: Arc<dyn StatisticStore> = Arc::new(SqliteStatisticStore::new(pool));

    let evm = ctx.chains.iter().fold(EvmChainData::new(), |evm, chain| {
        info!(chain_id = %chain.chain_id, name = %chain.name, "Registering chain");
        evm.with_http_chain(chain.chain_id, chain.rpc_url.clone(), chain.custody)
    });
    let chain_data: Arc<dyn ChainData> = Arc::new(RetryingChainData::new(evm, ctx.retry));

    let alerts: Arc<dyn AlertSink> = match &ctx.alert_webhook {
        Some(url) => Arc::new(WebhookAlertSink::new(url.clone())),
        None => Arc::new(LogAlertSink),
    };

    let intervals = ctx.intervals;
    let mut engine = StatsEngine::new();

    engine.spawn(
        Arc::new(TokenStatisticsPass::new(
            ledger.clone(),
            store.clone(),
            chain_data.clone(),
            ctx.btc_reference.clone(),
        )),
        intervals.token_statistics,
    );
    engine.spawn(
        Arc::new(ChainStatisticsPass::new(
            ledger.clone(),
            store.clone(),
            ctx.relay_chain,
        )),
        intervals.chain_statistics,
    );
    engine.spawn(
        Arc::new(AssetStatisticsPass::new(
            ledger.clone(),
            store.clone(),
            ctx.btc_reference.clone(),
        )),
        intervals.asset_statistics,
    );
    engine.spawn(
        Arc::new(ChainAddressPass::new(ledger.clone(), store.clone())),
        intervals.chain_addresses,
    );
    engine.spawn(
        Arc::new(AssetAddressPass::new(ledger.clone(), store.clone())),
        intervals.asset_addresses,
    );
    engine.spawn(
        Arc::new(TokenLiquidityPass::new(
            ledger.clone(),
            store,
            chain_data.clone(),
        )),
        intervals.token_liquidity,
    );
    engine.spawn(
        Arc::new(ReserveReconciler::new(
            ledger,
            chain_data,
            Arc::new(HttpExternalBalances::new()),
            alerts,
            ctx.reserve.clone(),
        )),
        intervals.reserve_check,
    );

    engine
}
