//! Campaign State Manager - Lifecycle of blast campaigns

use chatdesk_common::types::{CampaignId, ContactId, Page};
use chatdesk_storage::{
    Campaign, CampaignAction, CampaignStatus, CreateCampaign, RecipientCounts, UpdateCampaign,
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::sync::Arc;
use tracing::{info, warn};

use super::context::EngineContext;
use super::error::{BlastError, BlastResult};
use super::generator::GenerationScheduler;
use super::pacer::PacerRegistry;

/// Operator input for a new campaign; missing intervals fall back to configuration
#[derive(Debug, Clone, Default, Deserialize)]
pub struct NewCampaign {
    pub name: String,
    pub prompt: String,
    pub contact_ids: Vec<ContactId>,
    pub min_interval_secs: Option<i32>,
    pub max_interval_secs: Option<i32>,
    pub template_ref: Option<String>,
    #[serde(skip)]
    pub created_by: Option<String>,
}

/// Live view of a campaign's progress
#[derive(Debug, Clone, Serialize)]
pub struct CampaignStats {
    pub campaign: Campaign,
    /// Counted from recipient rows, not from the cached counters
    pub counts: RecipientCounts,
    pub progress_percent: f64,
    pub estimated_completion_at: Option<DateTime<Utc>>,
}

/// Campaign State Manager
pub struct CampaignManager {
    ctx: Arc<EngineContext>,
    generator: Arc<GenerationScheduler>,
    pacers: Arc<PacerRegistry>,
}

impl CampaignManager {
    pub fn new(
        ctx: Arc<EngineContext>,
        generator: Arc<GenerationScheduler>,
        pacers: Arc<PacerRegistry>,
    ) -> Self {
        Self {
            ctx,
            generator,
            pacers,
        }
    }

    /// Create a draft campaign with one pending recipient per distinct contact
    pub async fn create(&self, input: NewCampaign) -> BlastResult<Campaign> {
        let name = required("name", &input.name)?;
        let prompt = required("prompt", &input.prompt)?;
        if input.contact_ids.is_empty() {
            return Err(BlastError::Validation(
                "Campaign needs at least one recipient".to_string(),
            ));
        }

        let min = input
            .min_interval_secs
            .unwrap_or(self.ctx.settings.default_min_interval_secs);
        // A lone min above the configured default max widens the default
        let max = match input.max_interval_secs {
            Some(max) => max,
            None => self.ctx.settings.default_max_interval_secs.max(min),
        };
        validate_intervals(min, max)?;

        let distinct: Vec<ContactId> = {
            let mut seen = HashSet::new();
            input
                .contact_ids
                .iter()
                .copied()
                .filter(|id| seen.insert(*id))
                .collect()
        };
        let found: HashSet<ContactId> = self
            .ctx
            .contacts
            .get_many(&distinct)
            .await?
            .into_iter()
            .map(|c| c.id)
            .collect();
        if let Some(missing) = distinct.iter().find(|id| !found.contains(id)) {
            return Err(BlastError::ContactNotFound(*missing));
        }

        let campaign = self
            .ctx
            .campaigns
            .create(CreateCampaign {
                name,
                prompt,
                template_ref: input.template_ref.filter(|t| !t.trim().is_empty()),
                min_interval_secs: min,
                max_interval_secs: max,
                contact_ids: distinct,
                created_by: input.created_by,
            })
            .await?;

        info!(
            campaign_id = %campaign.id,
            recipients = campaign.total_recipients,
            "Campaign created"
        );
        Ok(campaign)
    }

    /// Start or resume delivery; a running campaign is left as it is
    pub async fn start(&self, id: CampaignId) -> BlastResult<Campaign> {
        let campaign = self.ctx.campaign(id).await?;
        if campaign.status == CampaignStatus::Running {
            self.pacers.ensure_running(id).await;
            return Ok(campaign);
        }

        self.check(&campaign, CampaignAction::Start)?;
        if campaign.total_recipients == 0 {
            return Err(BlastError::Validation(
                "Campaign has no recipients".to_string(),
            ));
        }

        let started = self.transition(id, CampaignAction::Start).await?;
        info!(campaign_id = %id, from = %campaign.status, "Campaign started");

        self.pacers.ensure_running(id).await;
        self.kick_generation(id).await;
        Ok(started)
    }

    pub async fn pause(&self, id: CampaignId) -> BlastResult<Campaign> {
        let campaign = self.ctx.campaign(id).await?;
        self.check(&campaign, CampaignAction::Pause)?;

        let paused = self.transition(id, CampaignAction::Pause).await?;
        info!(campaign_id = %id, "Campaign paused");
        Ok(paused)
    }

    /// Cancel the campaign and skip every recipient that is not finished or in flight
    pub async fn cancel(&self, id: CampaignId) -> BlastResult<Campaign> {
        let campaign = self.ctx.campaign(id).await?;
        self.check(&campaign, CampaignAction::Cancel)?;

        match self.ctx.campaigns.cancel(id).await? {
            Some((cancelled, skipped)) => {
                info!(campaign_id = %id, skipped, "Campaign cancelled");
                Ok(cancelled)
            }
            None => Err(self.lost_race(id, CampaignAction::Cancel).await),
        }
    }

    pub async fn delete(&self, id: CampaignId) -> BlastResult<()> {
        let campaign = self.ctx.campaign(id).await?;
        self.check(&campaign, CampaignAction::Delete)?;

        if !self.ctx.campaigns.delete(id).await? {
            return Err(self.lost_race(id, CampaignAction::Delete).await);
        }
        info!(campaign_id = %id, "Campaign deleted");
        Ok(())
    }

    /// Change campaign settings; recipients already generated keep their text
    pub async fn update(&self, id: CampaignId, input: UpdateCampaign) -> BlastResult<Campaign> {
        let campaign = self.ctx.campaign(id).await?;
        self.check(&campaign, CampaignAction::Update)?;
        if input.is_empty() {
            return Ok(campaign);
        }

        let input = UpdateCampaign {
            name: input.name.map(|n| required("name", &n)).transpose()?,
            prompt: input.prompt.map(|p| required("prompt", &p)).transpose()?,
            ..input
        };
        validate_intervals(
            input.min_interval_secs.unwrap_or(campaign.min_interval_secs),
            input.max_interval_secs.unwrap_or(campaign.max_interval_secs),
        )?;

        match self.ctx.campaigns.update(id, input).await? {
            Some(updated) => {
                info!(campaign_id = %id, "Campaign updated");
                Ok(updated)
            }
            None => Err(self.lost_race(id, CampaignAction::Update).await),
        }
    }

    /// Arrange for a draft campaign to start at `at`
    pub async fn schedule(&self, id: CampaignId, at: DateTime<Utc>) -> BlastResult<Campaign> {
        let campaign = self.ctx.campaign(id).await?;
        self.check(&campaign, CampaignAction::Schedule)?;
        if at <= Utc::now() {
            return Err(BlastError::Validation(
                "Scheduled time must be in the future".to_string(),
            ));
        }
        if campaign.total_recipients == 0 {
            return Err(BlastError::Validation(
                "Campaign has no recipients".to_string(),
            ));
        }

        match self.ctx.campaigns.schedule(id, at).await? {
            Some(scheduled) => {
                info!(campaign_id = %id, scheduled_at = %at, "Campaign scheduled");
                Ok(scheduled)
            }
            None => Err(self.lost_race(id, CampaignAction::Schedule).await),
        }
    }

    pub async fn get(&self, id: CampaignId) -> BlastResult<Campaign> {
        self.ctx.campaign(id).await
    }

    /// Newest first, with the total matching `status`
    pub async fn list(
        &self,
        status: Option<CampaignStatus>,
        page: Page,
    ) -> BlastResult<(Vec<Campaign>, i64)> {
        let campaigns = self.ctx.campaigns.list(status, page).await?;
        let total = self.ctx.campaigns.count(status).await?;
        Ok((campaigns, total))
    }

    pub async fn stats(&self, id: CampaignId) -> BlastResult<CampaignStats> {
        let campaign = self.ctx.campaign(id).await?;
        let counts = self.ctx.recipients.count_by_status(id).await?;

        let total = counts.total();
        let progress_percent = if total == 0 {
            0.0
        } else {
            (counts.finished() as f64 * 1000.0 / total as f64).round() / 10.0
        };

        let estimated_completion_at = (campaign.status == CampaignStatus::Running
            && counts.approved > 0)
            .then(|| {
                let mean_ms =
                    (i64::from(campaign.min_interval_secs) + i64::from(campaign.max_interval_secs)) * 500;
                Utc::now() + chrono::Duration::milliseconds(mean_ms * counts.approved)
            });

        Ok(CampaignStats {
            campaign,
            counts,
            progress_percent,
            estimated_completion_at,
        })
    }

    /// Start every scheduled campaign whose time has come
    pub async fn start_due_scheduled(&self) -> BlastResult<usize> {
        let due = self.ctx.campaigns.scheduled_due(Utc::now()).await?;
        let mut started = 0;

        for campaign in due {
            match self.start(campaign.id).await {
                Ok(_) => started += 1,
                Err(e) => warn!(campaign_id = %campaign.id, "Scheduled start failed: {}", e),
            }
        }
        Ok(started)
    }

    /// Make sure every running campaign has a live pacer
    pub async fn ensure_pacers(&self) -> BlastResult<usize> {
        let running = self
            .ctx
            .campaigns
            .list_ids_by_status(CampaignStatus::Running)
            .await?;

        let mut spawned = 0;
        for id in running {
            if self.pacers.ensure_running(id).await {
                spawned += 1;
            }
        }
        Ok(spawned)
    }

    /// Start generating when pending recipients remain; a run already in progress is fine
    async fn kick_generation(&self, id: CampaignId) {
        let pending = match self.ctx.recipients.count_by_status(id).await {
            Ok(counts) => counts.pending,
            Err(e) => {
                warn!(campaign_id = %id, "Could not count pending recipients: {}", e);
                return;
            }
        };
        if pending == 0 {
            return;
        }

        match self.generator.trigger(id).await {
            Ok(()) | Err(BlastError::AlreadyGenerating(_)) => {}
            Err(e) => warn!(campaign_id = %id, "Could not start generation: {}", e),
        }
    }

    fn check(&self, campaign: &Campaign, action: CampaignAction) -> BlastResult<()> {
        if action.allowed_from(campaign.status) {
            Ok(())
        } else {
            Err(BlastError::campaign_transition(campaign.status, action))
        }
    }

    async fn transition(&self, id: CampaignId, action: CampaignAction) -> BlastResult<Campaign> {
        match self.ctx.campaigns.transition(id, action).await? {
            Some(campaign) => Ok(campaign),
            None => Err(self.lost_race(id, action).await),
        }
    }

    /// Error for a guarded write that found the campaign in another status
    async fn lost_race(&self, id: CampaignId, action: CampaignAction) -> BlastError {
        match self.ctx.campaign(id).await {
            Ok(current) => BlastError::campaign_transition(current.status, action),
            Err(e) => e,
        }
    }
}

fn required(field: &str, value: &str) -> BlastResult<String> {
    let trimmed = value.trim();
    if trimmed.is_empty() {
        return Err(BlastError::Validation(format!("{} must not be empty", field)));
    }
    Ok(trimmed.to_string())
}

fn validate_intervals(min: i32, max: i32) -> BlastResult<()> {
    if min < 0 {
        return Err(BlastError::Validation(
            "min_interval_secs must not be negative".to_string(),
        ));
    }
    if min > max {
        return Err(BlastError::Validation(format!(
            "min_interval_secs ({}) must not exceed max_interval_secs ({})",
            min, max
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_validate_intervals() {
        assert!(validate_intervals(1, 1).is_ok());
        assert!(validate_intervals(0, 90).is_ok());
        assert!(matches!(validate_intervals(5, 2), Err(BlastError::Validation(_))));
        assert!(matches!(validate_intervals(-1, 2), Err(BlastError::Validation(_))));
    }

    #[test]
    fn test_required_trims() {
        assert_eq!(required("name", "  Spring promo ").unwrap(), "Spring promo");
        assert!(required("prompt", "   ").is_err());
    }
}
