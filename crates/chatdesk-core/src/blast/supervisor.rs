//! Supervisor - Periodic housekeeping for the blast engine

use std::sync::Arc;
use tokio::time::{interval, Instant, MissedTickBehavior};
use tracing::{debug, error, info};

use super::context::EngineContext;
use super::manager::CampaignManager;
use super::recovery::Recovery;

/// Starts due scheduled campaigns, revives missing pacers and reconciles counters
pub struct Supervisor {
    ctx: Arc<EngineContext>,
    manager: Arc<CampaignManager>,
    recovery: Arc<Recovery>,
}

impl Supervisor {
    pub fn new(
        ctx: Arc<EngineContext>,
        manager: Arc<CampaignManager>,
        recovery: Arc<Recovery>,
    ) -> Self {
        Self {
            ctx,
            manager,
            recovery,
        }
    }

    /// Run until the engine shuts down
    pub async fn run(self) {
        let settings = &self.ctx.settings;
        info!(
            tick_secs = settings.supervisor_tick.as_secs(),
            reconcile_secs = settings.reconcile_interval.as_secs(),
            "Blast supervisor started"
        );

        let mut ticker = interval(settings.supervisor_tick);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        let mut last_reconcile = Instant::now();

        loop {
            tokio::select! {
                _ = self.ctx.shutdown.cancelled() => break,
                _ = ticker.tick() => {
                    self.tick().await;

                    let every = settings.reconcile_interval;
                    if !every.is_zero() && last_reconcile.elapsed() >= every {
                        last_reconcile = Instant::now();
                        if let Err(e) = self.recovery.reconcile_all().await {
                            error!("Counter reconciliation failed: {}", e);
                        }
                    }
                }
            }
        }

        info!("Blast supervisor stopped");
    }

    pub async fn tick(&self) {
        match self.manager.start_due_scheduled().await {
            Ok(0) => {}
            Ok(n) => info!(started = n, "Started scheduled campaigns"),
            Err(e) => error!("Failed to start scheduled campaigns: {}", e),
        }

        match self.manager.ensure_pacers().await {
            Ok(0) => {}
            Ok(n) => debug!(spawned = n, "Revived delivery pacers"),
            Err(e) => error!("Failed to check delivery pacers: {}", e),
        }
    }
}
