//! Review Gate - Operator actions on generated messages

use chatdesk_common::types::{CampaignId, OperatorId, Page, RecipientId};
use chatdesk_storage::{Recipient, RecipientAction, RecipientCounts, RecipientStatus};
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::sync::Arc;
use tracing::{debug, info, warn};

use super::context::EngineContext;
use super::error::{BlastError, BlastResult};

/// Longest message body accepted from an operator
pub const MAX_MESSAGE_CHARS: usize = 4096;

/// Recipients still moving through generation and review
#[derive(Debug, Clone, Serialize)]
pub struct QueueView {
    pub campaign_id: CampaignId,
    pub pending: i64,
    pub generating: i64,
    pub awaiting_review: i64,
    pub approved: i64,
    pub recipients: Vec<Recipient>,
}

impl QueueView {
    fn new(campaign_id: CampaignId, counts: RecipientCounts, recipients: Vec<Recipient>) -> Self {
        Self {
            campaign_id,
            pending: counts.pending,
            generating: counts.generating,
            awaiting_review: counts.awaiting_review,
            approved: counts.approved,
            recipients,
        }
    }
}

/// Review Gate
pub struct ReviewGate {
    ctx: Arc<EngineContext>,
}

impl ReviewGate {
    pub fn new(ctx: Arc<EngineContext>) -> Self {
        Self { ctx }
    }

    /// Approve a generated message, optionally replacing its text
    pub async fn approve(
        &self,
        recipient_id: RecipientId,
        reviewer: &OperatorId,
        override_text: Option<String>,
    ) -> BlastResult<Recipient> {
        let override_text = override_text.map(|t| validate_text(&t)).transpose()?;
        self.check(recipient_id, RecipientAction::Approve).await?;

        let result = self
            .ctx
            .recipients
            .approve(recipient_id, reviewer, override_text.as_deref())
            .await?;
        let approved = self.finish(recipient_id, RecipientAction::Approve, result).await?;

        info!(
            campaign_id = %approved.campaign_id,
            recipient_id = %recipient_id,
            reviewer = %reviewer,
            edited = approved.override_text.is_some(),
            "Recipient approved"
        );
        Ok(approved)
    }

    /// Replace the text that will be sent, keeping the current status
    pub async fn edit(&self, recipient_id: RecipientId, text: String) -> BlastResult<Recipient> {
        let text = validate_text(&text)?;
        self.check(recipient_id, RecipientAction::Edit).await?;

        let result = self.ctx.recipients.edit(recipient_id, &text).await?;
        let edited = self.finish(recipient_id, RecipientAction::Edit, result).await?;

        debug!(recipient_id = %recipient_id, "Recipient text edited");
        Ok(edited)
    }

    /// Exclude a recipient from delivery
    pub async fn skip(&self, recipient_id: RecipientId) -> BlastResult<Recipient> {
        self.check(recipient_id, RecipientAction::Skip).await?;

        let result = self.ctx.recipients.skip(recipient_id).await?;
        let skipped = self.finish(recipient_id, RecipientAction::Skip, result).await?;

        info!(
            campaign_id = %skipped.campaign_id,
            recipient_id = %recipient_id,
            "Recipient skipped"
        );

        if let Some(campaign) = self.ctx.campaigns.complete_if_drained(skipped.campaign_id).await? {
            info!("Campaign {} completed", campaign.id);
        }
        Ok(skipped)
    }

    /// Queue a delivery failure for another send with its existing text
    pub async fn retry(&self, recipient_id: RecipientId) -> BlastResult<Recipient> {
        let action = RecipientAction::RetryDelivery;
        let recipient = self.check(recipient_id, action).await?;
        self.require_open_campaign(&recipient, action).await?;

        if recipient.failure_stage() != Some(chatdesk_storage::FailureStage::Delivery) {
            return Err(BlastError::Validation(
                "Only delivery failures can be retried; regenerate instead".to_string(),
            ));
        }
        if recipient.final_text().is_none() {
            return Err(BlastError::Validation(
                "Recipient has no message text to retry".to_string(),
            ));
        }

        let result = self.ctx.recipients.retry_delivery(recipient_id).await?;
        let retried = self.finish(recipient_id, action, result).await?;

        info!(
            campaign_id = %retried.campaign_id,
            recipient_id = %recipient_id,
            "Recipient queued for another delivery attempt"
        );
        Ok(retried)
    }

    /// Hold a recipient back until `at`, or clear the hold with `None`
    pub async fn schedule(
        &self,
        recipient_id: RecipientId,
        at: Option<DateTime<Utc>>,
    ) -> BlastResult<Recipient> {
        self.check(recipient_id, RecipientAction::Reschedule).await?;

        let result = self.ctx.recipients.set_schedule(recipient_id, at).await?;
        self.finish(recipient_id, RecipientAction::Reschedule, result)
            .await
    }

    /// Recipients in pending, generating, awaiting review or approved, with sub-counts
    pub async fn list_queue(&self, campaign_id: CampaignId, page: Page) -> BlastResult<QueueView> {
        self.ctx.campaign(campaign_id).await?;

        let recipients = self
            .ctx
            .recipients
            .list(campaign_id, &RecipientStatus::QUEUED, page)
            .await?;
        let counts = self.ctx.recipients.count_by_status(campaign_id).await?;

        Ok(QueueView::new(campaign_id, counts, recipients))
    }

    async fn check(&self, recipient_id: RecipientId, action: RecipientAction) -> BlastResult<Recipient> {
        let recipient = self.ctx.recipient(recipient_id).await?;
        if !action.allowed_from(recipient.status) {
            return Err(BlastError::recipient_transition(recipient.status, action));
        }
        Ok(recipient)
    }

    async fn require_open_campaign(
        &self,
        recipient: &Recipient,
        action: RecipientAction,
    ) -> BlastResult<()> {
        let campaign = self.ctx.campaign(recipient.campaign_id).await?;
        if campaign.status.is_terminal() {
            return Err(BlastError::InvalidTransition {
                entity: "campaign",
                from: campaign.status.to_string(),
                action: action.as_str(),
            });
        }
        Ok(())
    }

    /// Turn a rejected guarded update into the error for the status it lost to
    async fn finish(
        &self,
        recipient_id: RecipientId,
        action: RecipientAction,
        result: Option<Recipient>,
    ) -> BlastResult<Recipient> {
        match result {
            Some(recipient) => Ok(recipient),
            None => {
                let current = self.ctx.recipient(recipient_id).await?;
                warn!(
                    recipient_id = %recipient_id,
                    status = %current.status,
                    action = action.as_str(),
                    "Recipient changed status concurrently"
                );
                Err(BlastError::recipient_transition(current.status, action))
            }
        }
    }
}

fn validate_text(text: &str) -> BlastResult<String> {
    let trimmed = text.trim();
    if trimmed.is_empty() {
        return Err(BlastError::Validation("Message text must not be empty".to_string()));
    }
    if trimmed.chars().count() > MAX_MESSAGE_CHARS {
        return Err(BlastError::Validation(format!(
            "Message text exceeds {} characters",
            MAX_MESSAGE_CHARS
        )));
    }
    Ok(trimmed.to_string())
}
