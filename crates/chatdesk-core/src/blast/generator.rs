//! Generation Scheduler - Claims pending recipients and fills in AI text

use chatdesk_common::types::{CampaignId, ContactId, RecipientId};
use chatdesk_storage::{Campaign, CampaignAction, Recipient, RecipientAction};
use serde::Serialize;
use std::sync::Arc;
use tracing::{debug, error, info, instrument, warn};

use super::context::EngineContext;
use super::error::{BlastError, BlastResult};
use crate::ai::ContactContext;

/// Outcome of one or more generation batches
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct BatchReport {
    /// Recipients moved from pending to generating
    pub claimed: usize,
    /// Recipients now awaiting review
    pub generated: usize,
    /// Recipients whose generation failed
    pub failed: usize,
    /// Claimed recipients handed back because the campaign stopped
    pub released: usize,
    /// Results thrown away because the recipient was skipped or cancelled
    /// while its text was being generated
    pub discarded: usize,
}

impl BatchReport {
    fn merge(&mut self, other: BatchReport) {
        self.claimed += other.claimed;
        self.generated += other.generated;
        self.failed += other.failed;
        self.released += other.released;
        self.discarded += other.discarded;
    }
}

enum Outcome {
    Generated,
    Failed,
    /// The recipient left `generating` during the AI call
    Discarded,
    /// The campaign no longer accepts generation
    Stopped,
}

/// Generation Scheduler
pub struct GenerationScheduler {
    ctx: Arc<EngineContext>,
}

impl GenerationScheduler {
    pub fn new(ctx: Arc<EngineContext>) -> Self {
        Self { ctx }
    }

    /// Run a single batch in the caller's task.
    ///
    /// Rejected with `AlreadyGenerating` while another batch for the same
    /// campaign holds the generation lease.
    #[instrument(skip(self), fields(campaign_id = %campaign_id))]
    pub async fn generate_batch(
        &self,
        campaign_id: CampaignId,
        batch_size: Option<u32>,
    ) -> BlastResult<BatchReport> {
        self.acquire(campaign_id).await?;
        let size = batch_size.unwrap_or(self.ctx.settings.generation_batch_size).max(1);
        let result = self.run_batch(campaign_id, size).await;
        self.release(campaign_id).await;
        result
    }

    /// Take the lease now and generate in the background.
    ///
    /// With auto-continue enabled the background run keeps claiming batches
    /// until nothing is pending or the campaign stops accepting generation.
    pub async fn trigger(self: &Arc<Self>, campaign_id: CampaignId) -> BlastResult<()> {
        self.acquire(campaign_id).await?;

        let this = Arc::clone(self);
        tokio::spawn(async move {
            match this.run_batches(campaign_id).await {
                Ok(report) => info!(
                    campaign_id = %campaign_id,
                    generated = report.generated,
                    failed = report.failed,
                    "Generation run finished"
                ),
                Err(e) => error!(campaign_id = %campaign_id, "Generation run failed: {}", e),
            }
        });

        Ok(())
    }

    /// Generate a message for a contact without persisting anything
    pub async fn preview(&self, campaign_id: CampaignId, contact_id: ContactId) -> BlastResult<String> {
        let campaign = self.ctx.campaign(campaign_id).await?;
        let contact = self
            .ctx
            .contacts
            .get(contact_id)
            .await?
            .ok_or(BlastError::ContactNotFound(contact_id))?;

        self.call_generator(&campaign.prompt, &ContactContext::from(&contact))
            .await
            .map_err(BlastError::Generation)
    }

    /// Send a recipient back to pending so the next batch writes it again
    pub async fn regenerate(self: &Arc<Self>, recipient_id: RecipientId) -> BlastResult<Recipient> {
        let recipient = self.ctx.recipient(recipient_id).await?;
        let campaign = self.ctx.campaign(recipient.campaign_id).await?;
        let action = RecipientAction::Regenerate;

        if campaign.status.is_terminal() {
            return Err(BlastError::InvalidTransition {
                entity: "campaign",
                from: campaign.status.to_string(),
                action: action.as_str(),
            });
        }
        if !action.allowed_from(recipient.status) {
            return Err(BlastError::recipient_transition(recipient.status, action));
        }

        let updated = match self.ctx.recipients.regenerate(recipient_id).await? {
            Some(updated) => updated,
            None => {
                let current = self.ctx.recipient(recipient_id).await?;
                return Err(BlastError::recipient_transition(current.status, action));
            }
        };

        info!(
            campaign_id = %campaign.id,
            recipient_id = %recipient_id,
            "Recipient queued for regeneration"
        );

        if CampaignAction::Generate.allowed_from(campaign.status) {
            match self.trigger(campaign.id).await {
                Ok(()) | Err(BlastError::AlreadyGenerating(_)) => {}
                Err(e) => warn!(campaign_id = %campaign.id, "Could not start regeneration: {}", e),
            }
        }

        Ok(updated)
    }

    async fn acquire(&self, campaign_id: CampaignId) -> BlastResult<Campaign> {
        let campaign = self.ctx.campaign(campaign_id).await?;
        if !CampaignAction::Generate.allowed_from(campaign.status) {
            return Err(BlastError::campaign_transition(
                campaign.status,
                CampaignAction::Generate,
            ));
        }

        let acquired = self
            .ctx
            .campaigns
            .try_acquire_generation(campaign_id, self.ctx.settings.generation_lease)
            .await?;
        if !acquired {
            return Err(BlastError::AlreadyGenerating(campaign_id));
        }

        debug!(campaign_id = %campaign_id, "Generation lease acquired");
        Ok(campaign)
    }

    async fn release(&self, campaign_id: CampaignId) {
        if let Err(e) = self.ctx.campaigns.release_generation(campaign_id).await {
            // The lease expires on its own and the startup sweep clears it
            error!(campaign_id = %campaign_id, "Failed to release generation lease: {}", e);
        }
    }

    /// Runs batches while holding the lease; always returns with it released
    async fn run_batches(&self, campaign_id: CampaignId) -> BlastResult<BatchReport> {
        let size = self.ctx.settings.generation_batch_size;
        let mut total = BatchReport::default();

        loop {
            let result = self.run_batch(campaign_id, size).await;
            // Released between batches so a long run never outlives its TTL
            self.release(campaign_id).await;
            let report = result?;
            total.merge(report);

            if !self.ctx.settings.auto_continue_generation
                || report.claimed == 0
                || report.released > 0
                || self.ctx.shutdown.is_cancelled()
            {
                return Ok(total);
            }

            match self.acquire(campaign_id).await {
                Ok(_) => {}
                Err(BlastError::AlreadyGenerating(_)) | Err(BlastError::InvalidTransition { .. }) => {
                    return Ok(total)
                }
                Err(e) => return Err(e),
            }
        }
    }

    async fn run_batch(&self, campaign_id: CampaignId, size: u32) -> BlastResult<BatchReport> {
        let claimed = self
            .ctx
            .recipients
            .claim_pending(campaign_id, i64::from(size))
            .await?;

        let mut report = BatchReport {
            claimed: claimed.len(),
            ..Default::default()
        };
        if claimed.is_empty() {
            return Ok(report);
        }

        debug!(campaign_id = %campaign_id, claimed = claimed.len(), "Generating batch");

        for (index, recipient) in claimed.iter().enumerate() {
            match self.process_one(campaign_id, recipient).await {
                Ok(Outcome::Generated) => report.generated += 1,
                Ok(Outcome::Failed) => report.failed += 1,
                Ok(Outcome::Discarded) => report.discarded += 1,
                Ok(Outcome::Stopped) => {
                    report.released += self.release_claims(&claimed[index..]).await;
                    break;
                }
                Err(e) => {
                    self.release_claims(&claimed[index..]).await;
                    return Err(e);
                }
            }
        }

        info!(
            campaign_id = %campaign_id,
            generated = report.generated,
            failed = report.failed,
            released = report.released,
            discarded = report.discarded,
            "Generation batch complete"
        );
        Ok(report)
    }

    async fn process_one(
        &self,
        campaign_id: CampaignId,
        recipient: &Recipient,
    ) -> BlastResult<Outcome> {
        // Re-read so pause/cancel and prompt edits apply before every AI call
        let campaign = self.ctx.campaign(campaign_id).await?;
        if !CampaignAction::Generate.allowed_from(campaign.status) || self.ctx.shutdown.is_cancelled() {
            return Ok(Outcome::Stopped);
        }

        let outcome = match self.ctx.contacts.get(recipient.contact_id).await {
            Ok(Some(contact)) => {
                self.call_generator(&campaign.prompt, &ContactContext::from(&contact))
                    .await
            }
            Ok(None) => Err(format!("Contact {} not found", recipient.contact_id)),
            Err(e) => Err(format!("Contact lookup failed: {}", e)),
        };

        match outcome {
            Ok(text) => {
                let stored = self
                    .ctx
                    .recipients
                    .complete_generation(recipient.id, &text)
                    .await?;
                if stored.is_none() {
                    debug!(recipient_id = %recipient.id, "Recipient left generating; text discarded");
                    return Ok(Outcome::Discarded);
                }
                self.ctx.metrics.record_generation(true);
                debug!(recipient_id = %recipient.id, "Recipient awaiting review");
                Ok(Outcome::Generated)
            }
            Err(reason) => {
                warn!(
                    campaign_id = %campaign_id,
                    recipient_id = %recipient.id,
                    "Generation failed: {}",
                    reason
                );
                let stored = self
                    .ctx
                    .recipients
                    .fail_generation(recipient.id, &reason)
                    .await?;
                if stored.is_none() {
                    return Ok(Outcome::Discarded);
                }
                self.ctx.metrics.record_generation(false);
                Ok(Outcome::Failed)
            }
        }
    }

    async fn call_generator(&self, prompt: &str, contact: &ContactContext) -> Result<String, String> {
        let call = self.ctx.generator.generate(prompt, contact);
        match tokio::time::timeout(self.ctx.settings.generation_timeout, call).await {
            Ok(Ok(text)) if !text.trim().is_empty() => Ok(text.trim().to_string()),
            Ok(Ok(_)) => Err("AI service returned an empty message".to_string()),
            Ok(Err(e)) => Err(e.to_string()),
            Err(_) => Err("AI request timed out".to_string()),
        }
    }

    async fn release_claims(&self, recipients: &[Recipient]) -> usize {
        let mut released = 0;
        for recipient in recipients {
            match self.ctx.recipients.release_claim(recipient.id).await {
                Ok(Some(_)) => released += 1,
                Ok(None) => {}
                Err(e) => error!(recipient_id = %recipient.id, "Failed to release claim: {}", e),
            }
        }
        released
    }
}
