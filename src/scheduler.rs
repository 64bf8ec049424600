//! Runs each statistics pass on its own fixed interval until shutdown.

use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinSet;
use tokio::time::MissedTickBehavior;
use tracing::{Instrument, debug, error, info, info_span};

use crate::error::StatsError;

const MIN_PERIOD: Duration = Duration::from_millis(1);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PassOutcome {
    /// Nothing new since the last run.
    UpToDate,
    /// Rows were recomputed; `failed` of them could not be saved.
    Completed { updated: usize, failed: usize },
}

/// One independently scheduled unit of work.
#[async_trait]
pub trait StatsPass: Send + Sync {
    fn name(&self) -> &'static str;

    async fn run_once(&self) -> Result<PassOutcome, StatsError>;
}

/// Owns the running pass tasks and the signal that stops them.
///
/// A pass that is mid-run when shutdown is requested finishes that run
/// before its task exits.
pub struct StatsEngine {
    shutdown: watch::Sender<bool>,
    tasks: JoinSet<()>,
}

impl Default for StatsEngine {
    fn default() -> Self {
        Self::new()
    }
}

impl StatsEngine {
    pub fn new() -> Self {
        let (shutdown, _) = watch::channel(false);
        Self {
            shutdown,
            tasks: JoinSet::new(),
        }
    }

    pub fn spawn(&mut self, pass: Arc<dyn StatsPass>, period: Duration) {
        let span = info_span!("stats_pass", pass = pass.name());
        let shutdown = self.shutdown.subscribe();

        info!(pass = pass.name(), ?period, "Starting statistics pass");
        self.tasks
            .spawn(run_pass_loop(pass, period.max(MIN_PERIOD), shutdown).instrument(span));
    }

    pub fn running(&self) -> usize {
        self.tasks.len()
    }

    /// Signals every pass to stop and waits until all of them have exited.
    pub async fn shutdown(mut self) {
        self.shutdown.send_replace(true);

        while let Some(result) = self.tasks.join_next().await {
            if let Err(error) = result {
                error!(%error, "Statistics pass task ended abnormally");
            }
        }

        info!("All statistics passes stopped");
    }
}

async fn run_pass_loop(
    pass: Arc<dyn StatsPass>,
    period: Duration,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut interval = tokio::time::interval(period);
    interval.set_missed_tick_behavior(MissedTickBehavior::Skip);

    loop {
        tokio::select! {
            biased;

            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow_and_update() {
                    break;
                }
                continue;
            }
            _ = interval.tick() => {}
        }

        debug!("Running statistics pass");

        match pass.run_once().await {
            Ok(PassOutcome::UpToDate) => debug!("Statistics pass up to date"),
            Ok(PassOutcome::Completed { updated, failed }) => {
                info!(updated, failed, "Statistics pass completed");
            }
            Err(error) => error!(%error, "Statistics pass failed"),
        }
    }

    info!("Statistics pass stopped");
}
