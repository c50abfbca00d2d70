//! Startup recovery sweep and counter reconciliation

use chatdesk_storage::{CampaignCounters, CampaignStatus, CounterDrift};
use serde::Serialize;
use std::sync::Arc;
use tracing::{info, warn};

use super::context::EngineContext;
use super::error::BlastResult;

/// What the startup sweep repaired
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct RecoveryReport {
    /// Generation leases left behind by a previous process
    pub stale_generation_flags: u64,
    /// Recipients put back to pending
    pub generating_reset: u64,
    /// Recipients put back to approved; their send outcome is unknown
    pub sending_reset: u64,
    /// Interrupted sends of campaigns that had already ended, marked failed
    pub sending_failed: u64,
}

impl RecoveryReport {
    pub fn is_clean(&self) -> bool {
        *self == RecoveryReport::default()
    }
}

pub struct Recovery {
    ctx: Arc<EngineContext>,
}

impl Recovery {
    pub fn new(ctx: Arc<EngineContext>) -> Self {
        Self { ctx }
    }

    /// Undo everything an interrupted process may have left in flight.
    ///
    /// Must run before any pacer or generation batch is started.
    pub async fn startup_sweep(&self) -> BlastResult<RecoveryReport> {
        let stale_generation_flags = self.ctx.campaigns.clear_generation_flags().await?;
        let stuck = self.ctx.recipients.recover_stuck().await?;

        let report = RecoveryReport {
            stale_generation_flags,
            generating_reset: stuck.generating_reset,
            sending_reset: stuck.sending_reset,
            sending_failed: stuck.sending_failed,
        };

        self.ctx
            .metrics
            .record_recovered("generating", report.generating_reset);
        self.ctx.metrics.record_recovered("sending", report.sending_reset);
        self.ctx
            .metrics
            .record_recovered("sending_abandoned", report.sending_failed);

        if report.is_clean() {
            info!("Recovery sweep found nothing to repair");
        } else {
            warn!(
                stale_generation_flags = report.stale_generation_flags,
                generating_reset = report.generating_reset,
                sending_reset = report.sending_reset,
                sending_failed = report.sending_failed,
                "Recovered interrupted work"
            );
        }
        Ok(report)
    }

    /// Recount every campaign's counters from its recipient rows
    pub async fn reconcile_all(&self) -> BlastResult<Vec<CounterDrift>> {
        let mut drifts = Vec::new();

        for status in CampaignStatus::ALL {
            for id in self.ctx.campaigns.list_ids_by_status(status).await? {
                let Some(drift) = self.ctx.campaigns.reconcile_counters(id).await? else {
                    continue;
                };

                for counter in changed_counters(&drift.before, &drift.after) {
                    self.ctx.metrics.record_counter_correction(counter);
                }
                warn!(
                    campaign_id = %id,
                    before = ?drift.before,
                    after = ?drift.after,
                    "Corrected campaign counter drift"
                );
                drifts.push(drift);
            }
        }

        Ok(drifts)
    }
}

fn changed_counters(before: &CampaignCounters, after: &CampaignCounters) -> Vec<&'static str> {
    [
        ("total_recipients", before.total_recipients, after.total_recipients),
        ("generated_count", before.generated_count, after.generated_count),
        ("sent_count", before.sent_count, after.sent_count),
        ("failed_count", before.failed_count, after.failed_count),
        (
            "generation_failed_count",
            before.generation_failed_count,
            after.generation_failed_count,
        ),
    ]
    .into_iter()
    .filter(|(_, b, a)| b != a)
    .map(|(name, _, _)| name)
    .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_changed_counters_lists_only_differences() {
        let before = CampaignCounters {
            total_recipients: 3,
            sent_count: 5,
            ..Default::default()
        };
        let after = CampaignCounters {
            total_recipients: 3,
            sent_count: 2,
            failed_count: 1,
            ..Default::default()
        };
        assert_eq!(changed_counters(&before, &after), vec!["sent_count", "failed_count"]);
    }
}
