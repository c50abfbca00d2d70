//! In-process store
//!
//! Implements the repository traits over plain collections behind a single
//! mutex. Used by `database.backend = "memory"` and throughout the test
//! suites. Guards and counter updates mirror the PostgreSQL repositories.

use async_trait::async_trait;
use chatdesk_common::types::{
    CampaignId, ContactId, ConversationId, OperatorId, Page, RecipientId,
};
use chatdesk_common::{Error, Result};
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard};
use uuid::Uuid;

use crate::models::{
    Campaign, CampaignAction, CampaignCounters, CampaignStatus, Contact, CounterDelta,
    CounterDrift, CreateCampaign, CreateContact, FailureStage, Recipient, RecipientAction,
    RecipientCounts, RecipientStatus, StuckRecovery, UpdateCampaign,
};
use crate::repository::campaigns::dedupe_contacts;
use crate::repository::recipients::{ABANDONED_SEND_NOTE, INTERRUPTED_SEND_NOTE};
use crate::repository::{CampaignRepository, ContactDirectory, RecipientRepository};

#[derive(Default)]
struct State {
    campaigns: Vec<Campaign>,
    recipients: Vec<Recipient>,
    contacts: HashMap<ContactId, Contact>,
    conversations: HashMap<ContactId, ConversationId>,
}

impl State {
    fn campaign_mut(&mut self, id: CampaignId) -> Option<&mut Campaign> {
        self.campaigns.iter_mut().find(|c| c.id == id)
    }

    fn recipient_index(&self, id: RecipientId) -> Option<usize> {
        self.recipients.iter().position(|r| r.id == id)
    }

    fn bump(&mut self, campaign_id: CampaignId, delta: CounterDelta, now: DateTime<Utc>) {
        if delta.is_zero() {
            return;
        }
        if let Some(campaign) = self.campaign_mut(campaign_id) {
            let mut counters = campaign.counters();
            delta.apply(&mut counters);
            campaign.generated_count = counters.generated_count;
            campaign.sent_count = counters.sent_count;
            campaign.failed_count = counters.failed_count;
            campaign.generation_failed_count = counters.generation_failed_count;
            campaign.updated_at = now;
        }
    }

    fn campaign_status(&self, id: CampaignId) -> Option<CampaignStatus> {
        self.campaigns.iter().find(|c| c.id == id).map(|c| c.status)
    }

    fn recount(&self, campaign_id: CampaignId) -> CampaignCounters {
        let mut counters = CampaignCounters::default();
        for r in self.recipients.iter().filter(|r| r.campaign_id == campaign_id) {
            counters.total_recipients += 1;
            if r.first_generated_at.is_some() {
                counters.generated_count += 1;
            }
            match (r.status, r.failure_stage()) {
                (RecipientStatus::Sent, _) => counters.sent_count += 1,
                (RecipientStatus::Failed, Some(FailureStage::Delivery)) => counters.failed_count += 1,
                (RecipientStatus::Failed, _) => counters.generation_failed_count += 1,
                _ => {}
            }
        }
        counters
    }
}

/// In-memory implementation of every repository trait
#[derive(Default)]
pub struct MemoryStore {
    state: Mutex<State>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> Result<MutexGuard<'_, State>> {
        self.state
            .lock()
            .map_err(|_| Error::Internal("memory store lock poisoned".to_string()))
    }

    /// Apply a guarded recipient transition. `change` returns `None` to reject
    /// the transition before anything is modified.
    fn apply<F>(&self, id: RecipientId, action: RecipientAction, change: F) -> Result<Option<Recipient>>
    where
        F: FnOnce(&Recipient) -> Option<Change>,
    {
        let mut state = self.state()?;
        let Some(index) = state.recipient_index(id) else {
            return Ok(None);
        };
        if !action.allowed_from(state.recipients[index].status) {
            return Ok(None);
        }
        let Some(apply) = change(&state.recipients[index]) else {
            return Ok(None);
        };

        let now = Utc::now();
        let recipient = &mut state.recipients[index];
        let delta = apply(recipient, now);
        if let Some(target) = action.target() {
            recipient.status = target;
        }
        recipient.updated_at = now;
        let updated = recipient.clone();

        state.bump(updated.campaign_id, delta, now);
        Ok(Some(updated))
    }

    /// Overwrite a campaign's counters, bypassing the inline bookkeeping.
    /// Exists so reconciliation can be exercised against a drifted cache.
    pub fn corrupt_counters(&self, id: CampaignId, counters: CampaignCounters) -> Result<()> {
        let mut state = self.state()?;
        if let Some(campaign) = state.campaign_mut(id) {
            campaign.total_recipients = counters.total_recipients;
            campaign.generated_count = counters.generated_count;
            campaign.sent_count = counters.sent_count;
            campaign.failed_count = counters.failed_count;
            campaign.generation_failed_count = counters.generation_failed_count;
        }
        Ok(())
    }

    /// Force a recipient into a status, as a crashed process would leave it
    pub fn force_recipient_status(&self, id: RecipientId, status: RecipientStatus) -> Result<()> {
        let mut state = self.state()?;
        if let Some(index) = state.recipient_index(id) {
            state.recipients[index].status = status;
        }
        Ok(())
    }

    /// Force the generation lease on, as a crashed process would leave it
    pub fn force_generation_flag(&self, id: CampaignId, started_at: DateTime<Utc>) -> Result<()> {
        let mut state = self.state()?;
        if let Some(campaign) = state.campaign_mut(id) {
            campaign.is_generating = true;
            campaign.generation_started_at = Some(started_at);
        }
        Ok(())
    }
}

type Change = Box<dyn FnOnce(&mut Recipient, DateTime<Utc>) -> CounterDelta>;

fn change<F>(f: F) -> Option<Change>
where
    F: FnOnce(&mut Recipient, DateTime<Utc>) -> CounterDelta + 'static,
{
    Some(Box::new(f))
}

#[async_trait]
impl CampaignRepository for MemoryStore {
    async fn create(&self, input: CreateCampaign) -> Result<Campaign> {
        let now = Utc::now();
        let id = Uuid::now_v7();
        let contacts = dedupe_contacts(&input.contact_ids);

        let campaign = Campaign {
            id,
            name: input.name,
            prompt: input.prompt,
            template_ref: input.template_ref,
            min_interval_secs: input.min_interval_secs,
            max_interval_secs: input.max_interval_secs,
            status: CampaignStatus::Draft,
            total_recipients: contacts.len() as i32,
            generated_count: 0,
            sent_count: 0,
            failed_count: 0,
            generation_failed_count: 0,
            is_generating: false,
            generation_started_at: None,
            created_by: input.created_by,
            scheduled_at: None,
            created_at: now,
            updated_at: now,
            started_at: None,
            completed_at: None,
        };

        let mut state = self.state()?;
        state.campaigns.push(campaign.clone());
        for contact_id in contacts {
            state.recipients.push(Recipient {
                id: Uuid::now_v7(),
                campaign_id: id,
                contact_id,
                conversation_id: None,
                status: RecipientStatus::Pending,
                generated_text: None,
                override_text: None,
                generated_at: None,
                first_generated_at: None,
                approved_by: None,
                approved_at: None,
                error_message: None,
                failure_stage: None,
                retry_count: 0,
                scheduled_at: None,
                sent_at: None,
                external_message_id: None,
                created_at: now,
                updated_at: now,
            });
        }

        Ok(campaign)
    }

    async fn get(&self, id: CampaignId) -> Result<Option<Campaign>> {
        Ok(self.state()?.campaigns.iter().find(|c| c.id == id).cloned())
    }

    async fn list(&self, status: Option<CampaignStatus>, page: Page) -> Result<Vec<Campaign>> {
        let state = self.state()?;
        Ok(state
            .campaigns
            .iter()
            .rev()
            .filter(|c| status.map_or(true, |s| c.status == s))
            .skip(page.offset as usize)
            .take(page.limit as usize)
            .cloned()
            .collect())
    }

    async fn count(&self, status: Option<CampaignStatus>) -> Result<i64> {
        let state = self.state()?;
        Ok(state
            .campaigns
            .iter()
            .filter(|c| status.map_or(true, |s| c.status == s))
            .count() as i64)
    }

    async fn list_ids_by_status(&self, status: CampaignStatus) -> Result<Vec<CampaignId>> {
        let state = self.state()?;
        Ok(state
            .campaigns
            .iter()
            .filter(|c| c.status == status)
            .map(|c| c.id)
            .collect())
    }

    async fn update(&self, id: CampaignId, input: UpdateCampaign) -> Result<Option<Campaign>> {
        let mut state = self.state()?;
        let Some(campaign) = state.campaign_mut(id) else {
            return Ok(None);
        };
        if !CampaignAction::Update.allowed_from(campaign.status) {
            return Ok(None);
        }

        if let Some(name) = input.name {
            campaign.name = name;
        }
        if let Some(prompt) = input.prompt {
            campaign.prompt = prompt;
        }
        if let Some(template_ref) = input.template_ref {
            campaign.template_ref = Some(template_ref);
        }
        if let Some(min) = input.min_interval_secs {
            campaign.min_interval_secs = min;
        }
        if let Some(max) = input.max_interval_secs {
            campaign.max_interval_secs = max;
        }
        campaign.updated_at = Utc::now();
        Ok(Some(campaign.clone()))
    }

    async fn transition(&self, id: CampaignId, action: CampaignAction) -> Result<Option<Campaign>> {
        let target = action.target().ok_or_else(|| {
            Error::Internal(format!("'{}' does not change campaign status", action.as_str()))
        })?;

        let mut state = self.state()?;
        let Some(campaign) = state.campaign_mut(id) else {
            return Ok(None);
        };
        if !action.allowed_from(campaign.status) {
            return Ok(None);
        }

        let now = Utc::now();
        campaign.status = target;
        if target == CampaignStatus::Running && campaign.started_at.is_none() {
            campaign.started_at = Some(now);
        }
        if target.is_terminal() {
            campaign.completed_at = Some(now);
        }
        campaign.updated_at = now;
        Ok(Some(campaign.clone()))
    }

    async fn schedule(&self, id: CampaignId, at: DateTime<Utc>) -> Result<Option<Campaign>> {
        let mut state = self.state()?;
        let Some(campaign) = state.campaign_mut(id) else {
            return Ok(None);
        };
        if !CampaignAction::Schedule.allowed_from(campaign.status) {
            return Ok(None);
        }

        campaign.status = CampaignStatus::Scheduled;
        campaign.scheduled_at = Some(at);
        campaign.updated_at = Utc::now();
        Ok(Some(campaign.clone()))
    }

    async fn cancel(&self, id: CampaignId) -> Result<Option<(Campaign, u64)>> {
        let now = Utc::now();
        let mut state = self.state()?;
        let Some(campaign) = state.campaign_mut(id) else {
            return Ok(None);
        };
        if !CampaignAction::Cancel.allowed_from(campaign.status) {
            return Ok(None);
        }

        campaign.status = CampaignStatus::Cancelled;
        campaign.completed_at = Some(now);
        campaign.updated_at = now;
        let campaign = campaign.clone();

        let mut skipped = 0;
        for recipient in state.recipients.iter_mut().filter(|r| r.campaign_id == id) {
            if RecipientAction::Cancel.allowed_from(recipient.status) {
                recipient.status = RecipientStatus::Skipped;
                recipient.updated_at = now;
                skipped += 1;
            }
        }

        Ok(Some((campaign, skipped)))
    }

    async fn complete_if_drained(&self, id: CampaignId) -> Result<Option<Campaign>> {
        let mut state = self.state()?;
        let drained = state
            .recipients
            .iter()
            .filter(|r| r.campaign_id == id)
            .all(|r| r.status.is_terminal());
        let Some(campaign) = state.campaign_mut(id) else {
            return Ok(None);
        };
        if campaign.status != CampaignStatus::Running || !drained {
            return Ok(None);
        }

        let now = Utc::now();
        campaign.status = CampaignStatus::Completed;
        campaign.completed_at = Some(now);
        campaign.updated_at = now;
        Ok(Some(campaign.clone()))
    }

    async fn scheduled_due(&self, now: DateTime<Utc>) -> Result<Vec<Campaign>> {
        let state = self.state()?;
        let mut due: Vec<Campaign> = state
            .campaigns
            .iter()
            .filter(|c| c.status == CampaignStatus::Scheduled)
            .filter(|c| c.scheduled_at.map_or(false, |at| at <= now))
            .cloned()
            .collect();
        due.sort_by_key(|c| c.scheduled_at);
        Ok(due)
    }

    async fn try_acquire_generation(&self, id: CampaignId, ttl: chrono::Duration) -> Result<bool> {
        let now = Utc::now();
        let mut state = self.state()?;
        let Some(campaign) = state.campaign_mut(id) else {
            return Ok(false);
        };
        if campaign.generation_lease_active(now, ttl) {
            return Ok(false);
        }

        campaign.is_generating = true;
        campaign.generation_started_at = Some(now);
        campaign.updated_at = now;
        Ok(true)
    }

    async fn release_generation(&self, id: CampaignId) -> Result<()> {
        let mut state = self.state()?;
        if let Some(campaign) = state.campaign_mut(id) {
            campaign.is_generating = false;
            campaign.generation_started_at = None;
            campaign.updated_at = Utc::now();
        }
        Ok(())
    }

    async fn clear_generation_flags(&self) -> Result<u64> {
        let mut state = self.state()?;
        let mut cleared = 0;
        for campaign in state.campaigns.iter_mut().filter(|c| c.is_generating) {
            campaign.is_generating = false;
            campaign.generation_started_at = None;
            cleared += 1;
        }
        Ok(cleared)
    }

    async fn delete(&self, id: CampaignId) -> Result<bool> {
        let mut state = self.state()?;
        let deletable = state
            .campaign_status(id)
            .map_or(false, |s| CampaignAction::Delete.allowed_from(s));
        if !deletable {
            return Ok(false);
        }

        state.campaigns.retain(|c| c.id != id);
        state.recipients.retain(|r| r.campaign_id != id);
        Ok(true)
    }

    async fn reconcile_counters(&self, id: CampaignId) -> Result<Option<CounterDrift>> {
        let mut state = self.state()?;
        let actual = state.recount(id);
        let Some(campaign) = state.campaign_mut(id) else {
            return Ok(None);
        };

        let before = campaign.counters();
        if before == actual {
            return Ok(None);
        }

        campaign.total_recipients = actual.total_recipients;
        campaign.generated_count = actual.generated_count;
        campaign.sent_count = actual.sent_count;
        campaign.failed_count = actual.failed_count;
        campaign.generation_failed_count = actual.generation_failed_count;
        campaign.updated_at = Utc::now();

        Ok(Some(CounterDrift {
            campaign_id: id,
            before,
            after: actual,
        }))
    }
}

#[async_trait]
impl RecipientRepository for MemoryStore {
    async fn get(&self, id: RecipientId) -> Result<Option<Recipient>> {
        Ok(self.state()?.recipients.iter().find(|r| r.id == id).cloned())
    }

    async fn list(
        &self,
        campaign_id: CampaignId,
        statuses: &[RecipientStatus],
        page: Page,
    ) -> Result<Vec<Recipient>> {
        let state = self.state()?;
        Ok(state
            .recipients
            .iter()
            .filter(|r| r.campaign_id == campaign_id)
            .filter(|r| statuses.is_empty() || statuses.contains(&r.status))
            .skip(page.offset as usize)
            .take(page.limit as usize)
            .cloned()
            .collect())
    }

    async fn count_by_status(&self, campaign_id: CampaignId) -> Result<RecipientCounts> {
        let state = self.state()?;
        let mut counts = RecipientCounts::default();
        for r in state.recipients.iter().filter(|r| r.campaign_id == campaign_id) {
            counts.add(r.status);
        }
        Ok(counts)
    }

    async fn claim_pending(&self, campaign_id: CampaignId, limit: i64) -> Result<Vec<Recipient>> {
        let mut state = self.state()?;
        let generatable = state
            .campaign_status(campaign_id)
            .map_or(false, |s| CampaignAction::Generate.allowed_from(s));
        if !generatable {
            return Ok(Vec::new());
        }

        let now = Utc::now();
        let mut claimed = Vec::new();
        for recipient in state
            .recipients
            .iter_mut()
            .filter(|r| r.campaign_id == campaign_id && RecipientAction::Claim.allowed_from(r.status))
            .take(limit.max(0) as usize)
        {
            recipient.status = RecipientStatus::Generating;
            recipient.updated_at = now;
            claimed.push(recipient.clone());
        }
        Ok(claimed)
    }

    async fn complete_generation(&self, id: RecipientId, text: &str) -> Result<Option<Recipient>> {
        let text = text.to_string();
        self.apply(id, RecipientAction::CompleteGeneration, |_| {
            change(move |r, now| {
                let first_time = r.first_generated_at.is_none();
                r.generated_text = Some(text);
                r.generated_at = Some(now);
                r.first_generated_at.get_or_insert(now);
                r.error_message = None;
                r.failure_stage = None;
                CounterDelta {
                    generated: i32::from(first_time),
                    ..Default::default()
                }
            })
        })
    }

    async fn fail_generation(&self, id: RecipientId, error: &str) -> Result<Option<Recipient>> {
        let error = error.to_string();
        self.apply(id, RecipientAction::FailGeneration, |_| {
            change(move |r, _| {
                r.error_message = Some(error);
                r.failure_stage = Some(FailureStage::Generation.as_str().to_string());
                r.retry_count += 1;
                CounterDelta {
                    generation_failed: 1,
                    ..Default::default()
                }
            })
        })
    }

    async fn release_claim(&self, id: RecipientId) -> Result<Option<Recipient>> {
        self.apply(id, RecipientAction::ReleaseClaim, |_| {
            change(|_, _| CounterDelta::default())
        })
    }

    async fn approve(
        &self,
        id: RecipientId,
        reviewer: &OperatorId,
        override_text: Option<&str>,
    ) -> Result<Option<Recipient>> {
        let reviewer = reviewer.as_str().to_string();
        let override_text = override_text.map(str::to_string);
        self.apply(id, RecipientAction::Approve, |_| {
            change(move |r, now| {
                r.approved_by = Some(reviewer);
                r.approved_at = Some(now);
                if override_text.is_some() {
                    r.override_text = override_text;
                }
                CounterDelta::default()
            })
        })
    }

    async fn edit(&self, id: RecipientId, text: &str) -> Result<Option<Recipient>> {
        let text = text.to_string();
        self.apply(id, RecipientAction::Edit, |_| {
            change(move |r, _| {
                r.override_text = Some(text);
                CounterDelta::default()
            })
        })
    }

    async fn skip(&self, id: RecipientId) -> Result<Option<Recipient>> {
        self.apply(id, RecipientAction::Skip, |_| {
            change(|_, _| CounterDelta::default())
        })
    }

    async fn regenerate(&self, id: RecipientId) -> Result<Option<Recipient>> {
        self.apply(id, RecipientAction::Regenerate, |current| {
            let delta = if current.status == RecipientStatus::Failed {
                CounterDelta::leaving_failure(current.failure_stage())
            } else {
                CounterDelta::default()
            };
            change(move |r, _| {
                r.generated_text = None;
                r.override_text = None;
                r.generated_at = None;
                r.approved_by = None;
                r.approved_at = None;
                r.error_message = None;
                r.failure_stage = None;
                delta
            })
        })
    }

    async fn retry_delivery(&self, id: RecipientId) -> Result<Option<Recipient>> {
        self.apply(id, RecipientAction::RetryDelivery, |current| {
            if current.failure_stage() != Some(FailureStage::Delivery) || current.final_text().is_none() {
                return None;
            }
            change(|r, _| {
                r.error_message = None;
                r.failure_stage = None;
                CounterDelta::leaving_failure(Some(FailureStage::Delivery))
            })
        })
    }

    async fn set_schedule(
        &self,
        id: RecipientId,
        at: Option<DateTime<Utc>>,
    ) -> Result<Option<Recipient>> {
        self.apply(id, RecipientAction::Reschedule, |_| {
            change(move |r, _| {
                r.scheduled_at = at;
                CounterDelta::default()
            })
        })
    }

    async fn next_approved(
        &self,
        campaign_id: CampaignId,
        now: DateTime<Utc>,
    ) -> Result<Option<Recipient>> {
        let state = self.state()?;
        Ok(state
            .recipients
            .iter()
            .enumerate()
            .filter(|(_, r)| r.campaign_id == campaign_id && r.status == RecipientStatus::Approved)
            .filter(|(_, r)| r.is_due(now))
            .min_by_key(|(index, r)| (r.approved_at.is_none(), r.approved_at, *index))
            .map(|(_, r)| r.clone()))
    }

    async fn mark_sending(&self, id: RecipientId) -> Result<Option<Recipient>> {
        let mut state = self.state()?;
        let Some(index) = state.recipient_index(id) else {
            return Ok(None);
        };
        let campaign_status = state.campaign_status(state.recipients[index].campaign_id);
        if campaign_status != Some(CampaignStatus::Running)
            || !RecipientAction::Dispatch.allowed_from(state.recipients[index].status)
        {
            return Ok(None);
        }

        let recipient = &mut state.recipients[index];
        recipient.status = RecipientStatus::Sending;
        recipient.updated_at = Utc::now();
        Ok(Some(recipient.clone()))
    }

    async fn mark_sent(
        &self,
        id: RecipientId,
        external_message_id: &str,
        conversation_id: Option<ConversationId>,
    ) -> Result<Option<Recipient>> {
        let external_message_id = external_message_id.to_string();
        self.apply(id, RecipientAction::Deliver, |_| {
            change(move |r, now| {
                r.sent_at = Some(now);
                r.external_message_id = Some(external_message_id);
                if conversation_id.is_some() {
                    r.conversation_id = conversation_id;
                }
                r.error_message = None;
                CounterDelta {
                    sent: 1,
                    ..Default::default()
                }
            })
        })
    }

    async fn mark_delivery_failed(&self, id: RecipientId, error: &str) -> Result<Option<Recipient>> {
        let error = error.to_string();
        self.apply(id, RecipientAction::FailDelivery, |_| {
            change(move |r, _| {
                r.error_message = Some(error);
                r.failure_stage = Some(FailureStage::Delivery.as_str().to_string());
                r.retry_count += 1;
                CounterDelta {
                    failed: 1,
                    ..Default::default()
                }
            })
        })
    }

    async fn recover_stuck(&self) -> Result<StuckRecovery> {
        let now = Utc::now();
        let mut state = self.state()?;
        let mut recovery = StuckRecovery::default();

        let mut abandoned = Vec::new();
        for index in 0..state.recipients.len() {
            let status = state.recipients[index].status;
            let campaign_ended = state
                .campaign_status(state.recipients[index].campaign_id)
                .map_or(true, |s| s.is_terminal());

            let recipient = &mut state.recipients[index];
            if RecipientAction::RecoverGeneration.allowed_from(status) {
                recipient.status = RecipientStatus::Pending;
                recipient.updated_at = now;
                recovery.generating_reset += 1;
            } else if campaign_ended && RecipientAction::AbandonDispatch.allowed_from(status) {
                recipient.status = RecipientStatus::Failed;
                recipient.error_message = Some(ABANDONED_SEND_NOTE.to_string());
                recipient.failure_stage = Some(FailureStage::Delivery.as_str().to_string());
                recipient.retry_count += 1;
                recipient.updated_at = now;
                abandoned.push(recipient.campaign_id);
                recovery.sending_failed += 1;
            } else if RecipientAction::RecoverDispatch.allowed_from(status) {
                recipient.status = RecipientStatus::Approved;
                recipient.error_message = Some(INTERRUPTED_SEND_NOTE.to_string());
                recipient.updated_at = now;
                recovery.sending_reset += 1;
            }
        }

        for campaign_id in abandoned {
            let delta = CounterDelta {
                failed: 1,
                ..Default::default()
            };
            state.bump(campaign_id, delta, now);
        }

        Ok(recovery)
    }
}

#[async_trait]
impl ContactDirectory for MemoryStore {
    async fn get(&self, id: ContactId) -> Result<Option<Contact>> {
        Ok(self.state()?.contacts.get(&id).cloned())
    }

    async fn get_many(&self, ids: &[ContactId]) -> Result<Vec<Contact>> {
        let state = self.state()?;
        Ok(ids.iter().filter_map(|id| state.contacts.get(id).cloned()).collect())
    }

    async fn create(&self, input: CreateContact) -> Result<Contact> {
        let contact = Contact {
            id: Uuid::now_v7(),
            name: input.name,
            phone: input.phone,
            email: input.email,
            attributes: input.attributes.unwrap_or_else(|| serde_json::json!({})),
            created_at: Utc::now(),
        };
        self.state()?.contacts.insert(contact.id, contact.clone());
        Ok(contact)
    }

    async fn ensure_conversation(&self, contact_id: ContactId) -> Result<ConversationId> {
        let mut state = self.state()?;
        if !state.contacts.contains_key(&contact_id) {
            return Err(Error::NotFound(format!("Contact {}", contact_id)));
        }
        Ok(*state
            .conversations
            .entry(contact_id)
            .or_insert_with(Uuid::now_v7))
    }
}
