//! Blast campaigns
//!
//! A campaign moves through `draft -> running <-> paused -> completed`, with
//! `cancelled` reachable from every open status and `scheduled` as a timed
//! prelude to `running`. Its recipients are generated in batches by the
//! [`GenerationScheduler`], held in the [`ReviewGate`] until an operator
//! approves them, and dispatched one at a time by a per-campaign pacer task.
//!
//! All durable state lives in the store. The engine can be dropped at any
//! point and rebuilt with [`BlastEngine::recover`].

mod context;
mod error;
mod generator;
mod manager;
mod pacer;
mod recovery;
mod review;
mod supervisor;

pub use context::{EngineContext, EngineSettings};
pub use error::{BlastError, BlastResult};
pub use generator::{BatchReport, GenerationScheduler};
pub use manager::{CampaignManager, CampaignStats, NewCampaign};
pub use pacer::{sample_gap, PacerRegistry};
pub use recovery::{Recovery, RecoveryReport};
pub use review::{QueueView, ReviewGate, MAX_MESSAGE_CHARS};
pub use supervisor::Supervisor;

use std::sync::Arc;
use std::time::Duration;
use tracing::info;

use crate::metrics::BlastMetrics;

/// Wires the engine components around one shared context
pub struct BlastEngine {
    ctx: Arc<EngineContext>,
    manager: Arc<CampaignManager>,
    generator: Arc<GenerationScheduler>,
    review: ReviewGate,
    pacers: Arc<PacerRegistry>,
    recovery: Arc<Recovery>,
}

impl BlastEngine {
    pub fn new(ctx: EngineContext) -> Self {
        let ctx = Arc::new(ctx);
        let generator = Arc::new(GenerationScheduler::new(Arc::clone(&ctx)));
        let pacers = Arc::new(PacerRegistry::new(Arc::clone(&ctx)));
        let manager = Arc::new(CampaignManager::new(
            Arc::clone(&ctx),
            Arc::clone(&generator),
            Arc::clone(&pacers),
        ));

        Self {
            review: ReviewGate::new(Arc::clone(&ctx)),
            recovery: Arc::new(Recovery::new(Arc::clone(&ctx))),
            ctx,
            manager,
            generator,
            pacers,
        }
    }

    pub fn manager(&self) -> &CampaignManager {
        &self.manager
    }

    pub fn generator(&self) -> &Arc<GenerationScheduler> {
        &self.generator
    }

    pub fn review(&self) -> &ReviewGate {
        &self.review
    }

    pub fn pacers(&self) -> &Arc<PacerRegistry> {
        &self.pacers
    }

    pub fn recovery(&self) -> &Recovery {
        &self.recovery
    }

    pub fn metrics(&self) -> &BlastMetrics {
        &self.ctx.metrics
    }

    pub fn context(&self) -> &Arc<EngineContext> {
        &self.ctx
    }

    /// Housekeeping loop; spawn it once per process
    pub fn supervisor(&self) -> Supervisor {
        Supervisor::new(
            Arc::clone(&self.ctx),
            Arc::clone(&self.manager),
            Arc::clone(&self.recovery),
        )
    }

    /// Repair interrupted work, then resume delivery for running campaigns
    pub async fn recover(&self) -> BlastResult<RecoveryReport> {
        let report = self.recovery.startup_sweep().await?;
        let resumed = self.manager.ensure_pacers().await?;
        if resumed > 0 {
            info!(campaigns = resumed, "Resumed delivery for running campaigns");
        }
        Ok(report)
    }

    /// Stop background work; recipients in flight are picked up by the next recovery
    pub async fn shutdown(&self, grace: Duration) {
        info!("Stopping blast engine");
        self.pacers.shutdown(grace).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ai::{ContactContext, TextGenerator};
    use crate::channel::{ChannelAdapter, OutboundMessage};
    use async_trait::async_trait;
    use chatdesk_common::types::{CampaignId, ContactId, OperatorId, Page};
    use chatdesk_common::{Error, Result};
    use chatdesk_storage::{
        Campaign, CampaignRepository, CampaignStatus, ContactDirectory, CreateCampaign,
        CreateContact, MemoryStore, Recipient, RecipientRepository, RecipientStatus,
    };
    use pretty_assertions::assert_eq;
    use std::collections::HashSet;
    use std::sync::Mutex;
    use tokio::sync::Notify;
    use tokio::time::Instant;

    /// Holds every generation call until the test lets it through
    #[derive(Default)]
    struct Gate {
        entered: Notify,
        release: Notify,
    }

    /// Writes a greeting, failing for the configured contact names
    #[derive(Default)]
    struct ScriptedGenerator {
        fail_for: Mutex<HashSet<String>>,
        gate: Option<Arc<Gate>>,
    }

    impl ScriptedGenerator {
        fn failing(names: &[&str]) -> Self {
            Self {
                fail_for: Mutex::new(names.iter().map(|n| n.to_string()).collect()),
                gate: None,
            }
        }

        fn gated(gate: Arc<Gate>) -> Self {
            Self {
                gate: Some(gate),
                ..Default::default()
            }
        }

        fn heal(&self) {
            self.fail_for.lock().unwrap().clear();
        }
    }

    #[async_trait]
    impl TextGenerator for ScriptedGenerator {
        async fn generate(&self, prompt: &str, contact: &ContactContext) -> Result<String> {
            if let Some(gate) = &self.gate {
                gate.entered.notify_one();
                gate.release.notified().await;
            }
            if self.fail_for.lock().unwrap().contains(&contact.name) {
                return Err(Error::Generation("model overloaded".to_string()));
            }
            Ok(format!("Hi {}! {}", contact.name, prompt))
        }
    }

    /// Records every send with the tokio clock, failing for the configured destinations
    #[derive(Default)]
    struct RecordingChannel {
        sent: Mutex<Vec<(OutboundMessage, Instant)>>,
        fail_to: Mutex<HashSet<String>>,
    }

    impl RecordingChannel {
        fn fail_to(&self, destination: &str) {
            self.fail_to.lock().unwrap().insert(destination.to_string());
        }

        fn heal(&self) {
            self.fail_to.lock().unwrap().clear();
        }

        fn sends(&self) -> Vec<(OutboundMessage, Instant)> {
            self.sent.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl ChannelAdapter for RecordingChannel {
        async fn send(&self, message: &OutboundMessage) -> Result<String> {
            if self.fail_to.lock().unwrap().contains(&message.destination) {
                return Err(Error::Channel("number unreachable".to_string()));
            }
            let mut sent = self.sent.lock().unwrap();
            sent.push((message.clone(), Instant::now()));
            Ok(format!("wamid.{}", sent.len()))
        }
    }

    struct Harness {
        store: Arc<MemoryStore>,
        generator: Arc<ScriptedGenerator>,
        channel: Arc<RecordingChannel>,
        engine: BlastEngine,
        contacts: Vec<ContactId>,
    }

    fn settings() -> EngineSettings {
        EngineSettings {
            pacer_poll_interval: Duration::from_millis(100),
            ..EngineSettings::default()
        }
    }

    fn phone(index: usize) -> String {
        format!("+1555000{:04}", index + 1)
    }

    async fn harness(contacts: usize, generator: ScriptedGenerator) -> Harness {
        harness_with(contacts, generator, settings()).await
    }

    async fn harness_with(
        contacts: usize,
        generator: ScriptedGenerator,
        settings: EngineSettings,
    ) -> Harness {
        let generator = Arc::new(generator);
        let store = Arc::new(MemoryStore::new());
        let channel = Arc::new(RecordingChannel::default());

        let mut ids = Vec::new();
        for i in 0..contacts {
            let contact = ContactDirectory::create(
                store.as_ref(),
                CreateContact {
                    name: format!("Contact {}", i + 1),
                    phone: Some(phone(i)),
                    ..Default::default()
                },
            )
            .await
            .unwrap();
            ids.push(contact.id);
        }

        let ctx = EngineContext::new(
            store.clone(),
            store.clone(),
            store.clone(),
            generator.clone(),
            channel.clone(),
            BlastMetrics::new().unwrap(),
            settings,
        );

        Harness {
            store,
            generator,
            channel,
            engine: BlastEngine::new(ctx),
            contacts: ids,
        }
    }

    impl Harness {
        async fn campaign(&self, min: i32, max: i32) -> Campaign {
            self.engine
                .manager()
                .create(NewCampaign {
                    name: "Spring promo".to_string(),
                    prompt: "Tell them about the spring sale".to_string(),
                    contact_ids: self.contacts.clone(),
                    min_interval_secs: Some(min),
                    max_interval_secs: Some(max),
                    ..Default::default()
                })
                .await
                .unwrap()
        }

        async fn recipients(&self, id: CampaignId) -> Vec<Recipient> {
            RecipientRepository::list(self.store.as_ref(), id, &[], Page::new(500, 0))
                .await
                .unwrap()
        }

        async fn approve_all(&self, id: CampaignId) {
            let reviewer = OperatorId::new("ana");
            for recipient in self.recipients(id).await {
                if recipient.status == RecipientStatus::AwaitingReview {
                    self.engine
                        .review()
                        .approve(recipient.id, &reviewer, None)
                        .await
                        .unwrap();
                }
            }
        }

        async fn wait_for(&self, id: CampaignId, done: impl Fn(&Campaign) -> bool) -> Campaign {
            for _ in 0..1200 {
                let campaign = self.engine.manager().get(id).await.unwrap();
                if done(&campaign) {
                    return campaign;
                }
                tokio::time::sleep(Duration::from_millis(100)).await;
            }
            panic!("campaign {} never reached the expected state", id);
        }

        async fn assert_counters_match_rows(&self, id: CampaignId) {
            let campaign = self.engine.manager().get(id).await.unwrap();
            let counts = self.store.count_by_status(id).await.unwrap();
            assert_eq!(i64::from(campaign.sent_count), counts.sent);
            assert_eq!(
                i64::from(campaign.failed_count + campaign.generation_failed_count),
                counts.failed
            );
            assert!(campaign.sent_count + campaign.failed_count <= campaign.total_recipients);
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_happy_path_sends_both_one_interval_apart() {
        let h = harness(2, ScriptedGenerator::default()).await;
        let campaign = h.campaign(1, 1).await;

        let report = h.engine.generator().generate_batch(campaign.id, None).await.unwrap();
        assert_eq!(report.generated, 2);
        h.approve_all(campaign.id).await;

        let started = h.engine.manager().start(campaign.id).await.unwrap();
        assert_eq!(started.status, CampaignStatus::Running);
        assert!(started.started_at.is_some());

        let done = h.wait_for(campaign.id, |c| c.status == CampaignStatus::Completed).await;
        assert_eq!(done.sent_count, 2);
        assert!(done.completed_at.is_some());

        let sends = h.channel.sends();
        assert_eq!(sends.len(), 2);
        let gap = sends[1].1 - sends[0].1;
        assert!(gap >= Duration::from_secs(1), "gap was {:?}", gap);
        assert!(gap < Duration::from_millis(1500), "gap was {:?}", gap);

        for recipient in h.recipients(campaign.id).await {
            assert_eq!(recipient.status, RecipientStatus::Sent);
            assert!(recipient.external_message_id.is_some());
            assert!(recipient.conversation_id.is_some());
        }
        h.assert_counters_match_rows(campaign.id).await;
    }

    #[tokio::test]
    async fn test_generation_failure_does_not_abort_batch() {
        let h = harness(5, ScriptedGenerator::failing(&["Contact 3"])).await;
        let campaign = h.campaign(1, 2).await;

        let report = h.engine.generator().generate_batch(campaign.id, Some(5)).await.unwrap();
        assert_eq!(report.claimed, 5);
        assert_eq!(report.generated, 4);
        assert_eq!(report.failed, 1);

        let campaign = h.engine.manager().get(campaign.id).await.unwrap();
        assert_eq!(campaign.generated_count, 4);
        assert_eq!(campaign.generation_failed_count, 1);
        assert!(!campaign.is_generating);

        let recipients = h.recipients(campaign.id).await;
        let failed: Vec<&Recipient> = recipients
            .iter()
            .filter(|r| r.status == RecipientStatus::Failed)
            .collect();
        assert_eq!(failed.len(), 1);
        assert_eq!(failed[0].contact_id, h.contacts[2]);
        assert_eq!(failed[0].failure_stage.as_deref(), Some("generation"));
        assert!(failed[0].error_message.as_deref().unwrap().contains("overloaded"));
        h.assert_counters_match_rows(campaign.id).await;
    }

    #[tokio::test]
    async fn test_generate_batch_is_single_flight() {
        let h = harness(2, ScriptedGenerator::default()).await;
        let campaign = h.campaign(1, 2).await;

        h.store
            .try_acquire_generation(campaign.id, chrono::Duration::minutes(10))
            .await
            .unwrap();
        let err = h.engine.generator().generate_batch(campaign.id, None).await.unwrap_err();
        assert!(matches!(err, BlastError::AlreadyGenerating(_)));
    }

    #[tokio::test]
    async fn test_crash_recovery_resets_stuck_rows_and_stale_lease() {
        let h = harness(3, ScriptedGenerator::default()).await;
        let campaign = h.campaign(1, 2).await;

        // A previous process claimed two recipients and died mid-batch
        let claimed = h.store.claim_pending(campaign.id, 2).await.unwrap();
        assert_eq!(claimed.len(), 2);
        h.store
            .force_generation_flag(campaign.id, chrono::Utc::now())
            .unwrap();
        h.store
            .force_recipient_status(claimed[1].id, RecipientStatus::Sending)
            .unwrap();

        let report = h.engine.recover().await.unwrap();
        assert_eq!(report.stale_generation_flags, 1);
        assert_eq!(report.generating_reset, 1);
        assert_eq!(report.sending_reset, 1);

        let reset = RecipientRepository::get(h.store.as_ref(), claimed[0].id)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(reset.status, RecipientStatus::Pending);
        let interrupted = RecipientRepository::get(h.store.as_ref(), claimed[1].id)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(interrupted.status, RecipientStatus::Approved);
        assert!(interrupted.error_message.is_some());

        // The lease is free again
        let batch = h.engine.generator().generate_batch(campaign.id, None).await.unwrap();
        assert_eq!(batch.generated, 2);
    }

    #[tokio::test]
    async fn test_cancel_skips_everything_unfinished() {
        let h = harness(4, ScriptedGenerator::failing(&["Contact 4"])).await;
        let campaign = h.campaign(1, 2).await;

        h.engine.generator().generate_batch(campaign.id, Some(2)).await.unwrap();
        let first = h
            .recipients(campaign.id)
            .await
            .into_iter()
            .find(|r| r.status == RecipientStatus::AwaitingReview)
            .unwrap();
        h.engine
            .review()
            .approve(first.id, &OperatorId::default(), Some("Custom text".to_string()))
            .await
            .unwrap();

        let cancelled = h.engine.manager().cancel(campaign.id).await.unwrap();
        assert_eq!(cancelled.status, CampaignStatus::Cancelled);

        for recipient in h.recipients(campaign.id).await {
            assert!(
                recipient.status.is_terminal(),
                "{} left in {}",
                recipient.id,
                recipient.status
            );
        }

        let err = h.engine.manager().start(campaign.id).await.unwrap_err();
        assert!(matches!(err, BlastError::InvalidTransition { .. }));
        assert_eq!(err.status_code(), 409);
    }

    #[tokio::test]
    async fn test_empty_campaign_cannot_be_created_or_started() {
        let h = harness(0, ScriptedGenerator::default()).await;

        let err = h
            .engine
            .manager()
            .create(NewCampaign {
                name: "Empty".to_string(),
                prompt: "Hello".to_string(),
                ..Default::default()
            })
            .await
            .unwrap_err();
        assert!(matches!(err, BlastError::Validation(_)));

        // A recipient-less row can still exist if written directly
        let campaign = CampaignRepository::create(
            h.store.as_ref(),
            CreateCampaign {
                name: "Empty".to_string(),
                prompt: "Hello".to_string(),
                template_ref: None,
                min_interval_secs: 1,
                max_interval_secs: 2,
                contact_ids: vec![],
                created_by: None,
            },
        )
        .await
        .unwrap();

        let err = h.engine.manager().start(campaign.id).await.unwrap_err();
        assert!(matches!(err, BlastError::Validation(_)));
        let unchanged = h.engine.manager().get(campaign.id).await.unwrap();
        assert_eq!(unchanged.status, CampaignStatus::Draft);
    }

    #[tokio::test]
    async fn test_create_rejects_bad_intervals_and_unknown_contacts() {
        let h = harness(1, ScriptedGenerator::default()).await;

        let err = h
            .engine
            .manager()
            .create(NewCampaign {
                name: "Promo".to_string(),
                prompt: "Hello".to_string(),
                contact_ids: h.contacts.clone(),
                min_interval_secs: Some(10),
                max_interval_secs: Some(5),
                ..Default::default()
            })
            .await
            .unwrap_err();
        assert!(matches!(err, BlastError::Validation(_)));

        let stranger = uuid::Uuid::now_v7();
        let err = h
            .engine
            .manager()
            .create(NewCampaign {
                name: "Promo".to_string(),
                prompt: "Hello".to_string(),
                contact_ids: vec![h.contacts[0], stranger],
                ..Default::default()
            })
            .await
            .unwrap_err();
        assert!(matches!(err, BlastError::ContactNotFound(id) if id == stranger));
    }

    #[tokio::test(start_paused = true)]
    async fn test_pause_and_resume_never_resends() {
        let h = harness(3, ScriptedGenerator::default()).await;
        let campaign = h.campaign(1, 1).await;
        h.engine.generator().generate_batch(campaign.id, None).await.unwrap();
        h.approve_all(campaign.id).await;

        h.engine.manager().start(campaign.id).await.unwrap();
        h.wait_for(campaign.id, |c| c.sent_count >= 1).await;
        h.engine.manager().pause(campaign.id).await.unwrap();

        let sent_before = h.channel.sends().len();
        tokio::time::sleep(Duration::from_secs(5)).await;
        assert_eq!(h.channel.sends().len(), sent_before);

        // Starting a running campaign twice is harmless
        h.engine.manager().start(campaign.id).await.unwrap();
        h.engine.manager().start(campaign.id).await.unwrap();
        h.wait_for(campaign.id, |c| c.status == CampaignStatus::Completed).await;

        let sends = h.channel.sends();
        assert_eq!(sends.len(), 3);
        let distinct: HashSet<_> = sends.iter().map(|(m, _)| m.recipient_id).collect();
        assert_eq!(distinct.len(), 3);
        h.assert_counters_match_rows(campaign.id).await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_gaps_stay_within_campaign_interval() {
        let h = harness(5, ScriptedGenerator::default()).await;
        let campaign = h.campaign(2, 4).await;
        h.engine.generator().generate_batch(campaign.id, None).await.unwrap();
        h.approve_all(campaign.id).await;

        h.engine.manager().start(campaign.id).await.unwrap();
        h.wait_for(campaign.id, |c| c.status == CampaignStatus::Completed).await;

        let sends = h.channel.sends();
        assert_eq!(sends.len(), 5);
        for pair in sends.windows(2) {
            let gap = pair[1].1 - pair[0].1;
            assert!(gap >= Duration::from_secs(2), "gap was {:?}", gap);
            assert!(gap <= Duration::from_millis(4200), "gap was {:?}", gap);
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_delivery_failure_and_retry_keep_counters_exact() {
        let h = harness(2, ScriptedGenerator::default()).await;
        h.channel.fail_to(&phone(1));
        let campaign = h.campaign(0, 0).await;
        h.engine.generator().generate_batch(campaign.id, None).await.unwrap();
        h.approve_all(campaign.id).await;

        h.engine.manager().start(campaign.id).await.unwrap();
        let done = h.wait_for(campaign.id, |c| c.status == CampaignStatus::Completed).await;
        assert_eq!(done.sent_count, 1);
        assert_eq!(done.failed_count, 1);
        h.assert_counters_match_rows(campaign.id).await;

        let failed = h
            .recipients(campaign.id)
            .await
            .into_iter()
            .find(|r| r.status == RecipientStatus::Failed)
            .unwrap();
        assert_eq!(failed.retry_count, 1);
        assert_eq!(failed.failure_stage.as_deref(), Some("delivery"));

        // The campaign is finished, so nothing can be revived any more
        let err = h.engine.review().retry(failed.id).await.unwrap_err();
        assert!(matches!(err, BlastError::InvalidTransition { .. }));
        assert!(h.engine.recovery().reconcile_all().await.unwrap().is_empty());
        assert_eq!(h.engine.metrics().dispatch_count(false), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_retry_requeues_a_delivery_failure() {
        let h = harness(3, ScriptedGenerator::default()).await;
        h.channel.fail_to(&phone(0));
        let campaign = h.campaign(0, 0).await;
        h.engine.generator().generate_batch(campaign.id, None).await.unwrap();

        let first = h
            .recipients(campaign.id)
            .await
            .into_iter()
            .find(|r| r.contact_id == h.contacts[0])
            .unwrap();
        h.engine
            .review()
            .approve(first.id, &OperatorId::default(), None)
            .await
            .unwrap();

        h.engine.manager().start(campaign.id).await.unwrap();
        h.wait_for(campaign.id, |c| c.failed_count == 1).await;
        h.engine.manager().pause(campaign.id).await.unwrap();

        h.channel.heal();
        let retried = h.engine.review().retry(first.id).await.unwrap();
        assert_eq!(retried.status, RecipientStatus::Approved);
        let campaign_now = h.engine.manager().get(campaign.id).await.unwrap();
        assert_eq!(campaign_now.failed_count, 0);

        h.engine.manager().start(campaign.id).await.unwrap();
        let sent = h.wait_for(campaign.id, |c| c.sent_count == 1).await;
        assert_eq!(sent.status, CampaignStatus::Running);
        h.assert_counters_match_rows(campaign.id).await;
    }

    #[tokio::test]
    async fn test_reconcile_repairs_drifted_counters() {
        let h = harness(2, ScriptedGenerator::default()).await;
        let campaign = h.campaign(1, 2).await;
        h.engine.generator().generate_batch(campaign.id, None).await.unwrap();

        let mut drifted = campaign.counters();
        drifted.sent_count = 7;
        drifted.generated_count = 0;
        h.store.corrupt_counters(campaign.id, drifted).unwrap();

        let drifts = h.engine.recovery().reconcile_all().await.unwrap();
        assert_eq!(drifts.len(), 1);
        assert_eq!(drifts[0].after.sent_count, 0);
        assert_eq!(drifts[0].after.generated_count, 2);

        let repaired = h.engine.manager().get(campaign.id).await.unwrap();
        assert_eq!(repaired.sent_count, 0);
        assert_eq!(repaired.generated_count, 2);
    }

    #[tokio::test]
    async fn test_skip_last_open_recipient_completes_running_campaign() {
        let h = harness(1, ScriptedGenerator::default()).await;
        let campaign = h.campaign(1, 2).await;
        h.engine.generator().generate_batch(campaign.id, None).await.unwrap();

        h.store
            .transition(campaign.id, chatdesk_storage::CampaignAction::Start)
            .await
            .unwrap();
        let only = h.recipients(campaign.id).await[0].id;
        h.engine.review().skip(only).await.unwrap();

        let campaign = h.engine.manager().get(campaign.id).await.unwrap();
        assert_eq!(campaign.status, CampaignStatus::Completed);
        assert_eq!(campaign.sent_count + campaign.failed_count, 0);
    }

    #[tokio::test]
    async fn test_stats_report_progress() {
        let h = harness(4, ScriptedGenerator::failing(&["Contact 2"])).await;
        let campaign = h.campaign(1, 3).await;
        h.engine.generator().generate_batch(campaign.id, None).await.unwrap();
        let skip = h
            .recipients(campaign.id)
            .await
            .into_iter()
            .find(|r| r.status == RecipientStatus::AwaitingReview)
            .unwrap();
        h.engine.review().skip(skip.id).await.unwrap();

        let stats = h.engine.manager().stats(campaign.id).await.unwrap();
        assert_eq!(stats.counts.total(), 4);
        assert_eq!(stats.counts.failed, 1);
        assert_eq!(stats.counts.skipped, 1);
        assert_eq!(stats.progress_percent, 50.0);
        assert!(stats.estimated_completion_at.is_none());
    }

    #[tokio::test]
    async fn test_scheduled_campaign_starts_when_due() {
        let h = harness(1, ScriptedGenerator::default()).await;
        let campaign = h.campaign(1, 2).await;

        let err = h
            .engine
            .manager()
            .schedule(campaign.id, chrono::Utc::now() - chrono::Duration::minutes(1))
            .await
            .unwrap_err();
        assert!(matches!(err, BlastError::Validation(_)));

        let at = chrono::Utc::now() + chrono::Duration::milliseconds(50);
        let scheduled = h.engine.manager().schedule(campaign.id, at).await.unwrap();
        assert_eq!(scheduled.status, CampaignStatus::Scheduled);
        assert_eq!(h.engine.manager().start_due_scheduled().await.unwrap(), 0);

        tokio::time::sleep(Duration::from_millis(80)).await;
        assert_eq!(h.engine.manager().start_due_scheduled().await.unwrap(), 1);
        let running = h.engine.manager().get(campaign.id).await.unwrap();
        assert_eq!(running.status, CampaignStatus::Running);
        assert!(h.engine.pacers().is_running(campaign.id).await);

        h.engine.shutdown(Duration::from_secs(1)).await;
        assert_eq!(h.engine.pacers().active_count().await, 0);
    }

    #[tokio::test]
    async fn test_recovery_fails_send_interrupted_after_cancel() {
        let h = harness(2, ScriptedGenerator::default()).await;
        let campaign = h.campaign(1, 2).await;
        h.engine.generator().generate_batch(campaign.id, None).await.unwrap();
        h.approve_all(campaign.id).await;

        // The process died mid-send and the campaign was cancelled meanwhile
        let interrupted = h.recipients(campaign.id).await[0].id;
        h.store
            .force_recipient_status(interrupted, RecipientStatus::Sending)
            .unwrap();
        h.engine.manager().cancel(campaign.id).await.unwrap();

        let report = h.engine.recover().await.unwrap();
        assert_eq!(report.sending_reset, 0);
        assert_eq!(report.sending_failed, 1);

        let recipient = RecipientRepository::get(h.store.as_ref(), interrupted)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(recipient.status, RecipientStatus::Failed);
        assert_eq!(recipient.failure_stage.as_deref(), Some("delivery"));
        assert!(h
            .recipients(campaign.id)
            .await
            .iter()
            .all(|r| r.status.is_terminal()));

        let campaign = h.engine.manager().get(campaign.id).await.unwrap();
        assert_eq!(campaign.status, CampaignStatus::Cancelled);
        assert_eq!(campaign.failed_count, 1);
        h.assert_counters_match_rows(campaign.id).await;
    }

    #[tokio::test]
    async fn test_skip_while_generating_discards_the_text() {
        let gate = Arc::new(Gate::default());
        let h = harness(1, ScriptedGenerator::gated(gate.clone())).await;
        let campaign = h.campaign(1, 2).await;

        let generator = h.engine.generator().clone();
        let id = campaign.id;
        let batch = tokio::spawn(async move { generator.generate_batch(id, None).await });

        gate.entered.notified().await;
        let claimed = h.recipients(campaign.id).await[0].clone();
        assert_eq!(claimed.status, RecipientStatus::Generating);
        let skipped = h.engine.review().skip(claimed.id).await.unwrap();
        assert_eq!(skipped.status, RecipientStatus::Skipped);

        gate.release.notify_one();
        let report = batch.await.unwrap().unwrap();
        assert_eq!(report.claimed, 1);
        assert_eq!(report.generated, 0);
        assert_eq!(report.discarded, 1);

        let recipient = h.recipients(campaign.id).await[0].clone();
        assert_eq!(recipient.status, RecipientStatus::Skipped);
        assert!(recipient.generated_text.is_none());
        let campaign = h.engine.manager().get(campaign.id).await.unwrap();
        assert_eq!(campaign.generated_count, 0);
        assert!(!campaign.is_generating);
        assert_eq!(h.engine.metrics().generation_count(true), 0);
    }

    #[tokio::test]
    async fn test_cancel_during_generation_counts_nothing() {
        let gate = Arc::new(Gate::default());
        let h = harness(2, ScriptedGenerator::gated(gate.clone())).await;
        let campaign = h.campaign(1, 2).await;

        let generator = h.engine.generator().clone();
        let id = campaign.id;
        let batch = tokio::spawn(async move { generator.generate_batch(id, Some(2)).await });

        gate.entered.notified().await;
        h.engine.manager().cancel(campaign.id).await.unwrap();
        gate.release.notify_one();

        let report = batch.await.unwrap().unwrap();
        assert_eq!(report.claimed, 2);
        assert_eq!(report.generated, 0);
        assert_eq!(report.failed, 0);
        assert_eq!(report.discarded, 1);

        let campaign = h.engine.manager().get(campaign.id).await.unwrap();
        assert_eq!(campaign.status, CampaignStatus::Cancelled);
        assert_eq!(campaign.generated_count, 0);
        assert_eq!(campaign.generation_failed_count, 0);
        assert_eq!(h.engine.metrics().generation_count(true), 0);
        assert_eq!(h.engine.metrics().generation_count(false), 0);
        for recipient in h.recipients(campaign.id).await {
            assert_eq!(recipient.status, RecipientStatus::Skipped);
            assert!(recipient.generated_text.is_none());
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_start_generates_pending_recipients() {
        let h = harness(2, ScriptedGenerator::default()).await;
        let campaign = h.campaign(1, 1).await;

        h.engine.manager().start(campaign.id).await.unwrap();
        let generated = h
            .wait_for(campaign.id, |c| c.generated_count == 2 && !c.is_generating)
            .await;
        assert_eq!(generated.status, CampaignStatus::Running);
        assert!(h.channel.sends().is_empty());

        h.approve_all(campaign.id).await;
        let done = h.wait_for(campaign.id, |c| c.status == CampaignStatus::Completed).await;
        assert_eq!(done.sent_count, 2);
        assert_eq!(h.channel.sends().len(), 2);
        h.assert_counters_match_rows(campaign.id).await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_reviewed_text_is_what_gets_sent() {
        let h = harness(2, ScriptedGenerator::default()).await;
        let campaign = h.campaign(1, 1).await;
        h.engine.generator().generate_batch(campaign.id, None).await.unwrap();

        let reviewer = OperatorId::new("ana");
        let recipients = h.recipients(campaign.id).await;
        h.engine
            .review()
            .approve(recipients[0].id, &reviewer, Some("Custom A".to_string()))
            .await
            .unwrap();
        h.engine
            .review()
            .edit(recipients[1].id, "Edited B".to_string())
            .await
            .unwrap();
        let approved = h
            .engine
            .review()
            .approve(recipients[1].id, &reviewer, None)
            .await
            .unwrap();
        assert_eq!(approved.override_text.as_deref(), Some("Edited B"));

        h.engine.manager().start(campaign.id).await.unwrap();
        h.wait_for(campaign.id, |c| c.status == CampaignStatus::Completed).await;

        let sent: HashSet<String> = h.channel.sends().into_iter().map(|(m, _)| m.text).collect();
        let expected: HashSet<String> =
            ["Custom A", "Edited B"].iter().map(|t| t.to_string()).collect();
        assert_eq!(sent, expected);
    }

    #[tokio::test]
    async fn test_regenerate_undoes_failure_and_writes_again() {
        let h = harness(3, ScriptedGenerator::failing(&["Contact 1", "Contact 2"])).await;
        let campaign = h.campaign(1, 2).await;
        let report = h.engine.generator().generate_batch(campaign.id, Some(3)).await.unwrap();
        assert_eq!(report.failed, 2);

        let recipient_of = |recipients: &[Recipient], contact: ContactId| {
            recipients.iter().find(|r| r.contact_id == contact).map(|r| r.id).unwrap()
        };
        let recipients = h.recipients(campaign.id).await;
        let first = recipient_of(&recipients, h.contacts[0]);
        let second = recipient_of(&recipients, h.contacts[1]);

        h.generator.heal();
        let queued = h.engine.generator().regenerate(first).await.unwrap();
        assert_eq!(queued.status, RecipientStatus::Pending);
        assert!(queued.failure_stage.is_none());
        let campaign_now = h.engine.manager().get(campaign.id).await.unwrap();
        assert_eq!(campaign_now.generation_failed_count, 1);

        let rewritten = h
            .wait_for(campaign.id, |c| c.generated_count == 2 && !c.is_generating)
            .await;
        assert_eq!(rewritten.generation_failed_count, 1);
        let first_row = RecipientRepository::get(h.store.as_ref(), first)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(first_row.status, RecipientStatus::AwaitingReview);
        assert_eq!(
            first_row.generated_text.as_deref(),
            Some("Hi Contact 1! Tell them about the spring sale")
        );
        h.assert_counters_match_rows(campaign.id).await;

        h.engine.manager().cancel(campaign.id).await.unwrap();
        let err = h.engine.generator().regenerate(second).await.unwrap_err();
        assert!(matches!(err, BlastError::InvalidTransition { entity: "campaign", .. }));
        let still_failed = RecipientRepository::get(h.store.as_ref(), second)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(still_failed.status, RecipientStatus::Failed);
    }

    #[tokio::test]
    async fn test_auto_continue_generates_until_nothing_is_pending() {
        let batched = EngineSettings {
            generation_batch_size: 2,
            ..settings()
        };
        let h = harness_with(5, ScriptedGenerator::default(), batched.clone()).await;
        let campaign = h.campaign(1, 2).await;
        h.engine.generator().trigger(campaign.id).await.unwrap();
        h.wait_for(campaign.id, |c| c.generated_count == 2 && !c.is_generating)
            .await;
        let pending = h
            .recipients(campaign.id)
            .await
            .iter()
            .filter(|r| r.status == RecipientStatus::Pending)
            .count();
        assert_eq!(pending, 3);

        let continuing = EngineSettings {
            auto_continue_generation: true,
            ..batched
        };
        let h = harness_with(5, ScriptedGenerator::default(), continuing).await;
        let campaign = h.campaign(1, 2).await;
        h.engine.generator().trigger(campaign.id).await.unwrap();
        let done = h
            .wait_for(campaign.id, |c| c.generated_count == 5 && !c.is_generating)
            .await;
        assert_eq!(done.generation_failed_count, 0);
        assert!(h
            .recipients(campaign.id)
            .await
            .iter()
            .all(|r| r.status == RecipientStatus::AwaitingReview));
    }
}
