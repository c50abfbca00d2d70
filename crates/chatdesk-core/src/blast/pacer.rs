//! Delivery Pacer - Dispatches approved recipients at randomized intervals
//!
//! One task per running campaign. A pacer holds no state the store does not
//! also hold apart from its wait timer: every iteration re-reads the campaign
//! status and the oldest approved recipient, so pause, cancel and restarts
//! only ever need the persisted rows.

use chatdesk_common::types::{CampaignId, ConversationId};
use chatdesk_storage::{Campaign, CampaignStatus, Recipient};
use chrono::Utc;
use rand::Rng;
use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, error, info, instrument, warn};

use super::context::EngineContext;
use super::error::BlastResult;
use crate::channel::OutboundMessage;

const PERSIST_ATTEMPTS: u32 = 3;
const PERSIST_BACKOFF: Duration = Duration::from_millis(500);

/// Sample the wait before the next dispatch, uniformly within the campaign bounds
pub fn sample_gap(min_secs: i32, max_secs: i32) -> Duration {
    let min_ms = u64::try_from(min_secs).unwrap_or(0) * 1000;
    let max_ms = (u64::try_from(max_secs).unwrap_or(0) * 1000).max(min_ms);
    Duration::from_millis(rand::thread_rng().gen_range(min_ms..=max_ms))
}

/// Tracks the pacer task of every running campaign
pub struct PacerRegistry {
    ctx: Arc<EngineContext>,
    pacers: Mutex<HashMap<CampaignId, JoinHandle<()>>>,
}

impl PacerRegistry {
    pub fn new(ctx: Arc<EngineContext>) -> Self {
        Self {
            ctx,
            pacers: Mutex::new(HashMap::new()),
        }
    }

    /// Spawn a pacer for the campaign unless one is already alive.
    /// Returns whether a new pacer was started.
    pub async fn ensure_running(self: &Arc<Self>, campaign_id: CampaignId) -> bool {
        let mut pacers = self.pacers.lock().await;
        if pacers.get(&campaign_id).map_or(false, |h| !h.is_finished()) {
            return false;
        }

        let pacer = DeliveryPacer::new(Arc::clone(&self.ctx), campaign_id);
        let registry = Arc::clone(self);
        let handle = tokio::spawn(async move { pacer.run(registry).await });
        pacers.insert(campaign_id, handle);
        self.ctx.metrics.pacer_started();
        true
    }

    pub async fn is_running(&self, campaign_id: CampaignId) -> bool {
        self.pacers
            .lock()
            .await
            .get(&campaign_id)
            .map_or(false, |h| !h.is_finished())
    }

    pub async fn active_count(&self) -> usize {
        self.pacers
            .lock()
            .await
            .values()
            .filter(|h| !h.is_finished())
            .count()
    }

    /// Called by a pacer that saw its campaign leave `running`.
    ///
    /// The status is read again under the registry lock: if the campaign was
    /// resumed in between, the pacer keeps going, since `ensure_running`
    /// will not have spawned a second one while this handle is alive.
    async fn retire(&self, campaign_id: CampaignId) -> BlastResult<bool> {
        let mut pacers = self.pacers.lock().await;
        let status = self.ctx.campaigns.get(campaign_id).await?.map(|c| c.status);
        if status == Some(CampaignStatus::Running) {
            return Ok(false);
        }
        pacers.remove(&campaign_id);
        Ok(true)
    }

    /// Stop every pacer at its next wait and wait for them to exit
    pub async fn shutdown(&self, grace: Duration) {
        self.ctx.shutdown.cancel();
        let handles: Vec<(CampaignId, JoinHandle<()>)> = self.pacers.lock().await.drain().collect();

        for (campaign_id, handle) in handles {
            let abort = handle.abort_handle();
            if tokio::time::timeout(grace, handle).await.is_err() {
                warn!(campaign_id = %campaign_id, "Pacer did not stop in time, aborting");
                abort.abort();
            }
        }
    }
}

enum Step {
    /// Look for the next recipient straight away
    Continue,
    Wait(Duration),
    /// Campaign is no longer running
    Stop,
}

/// Dispatch loop for one campaign
struct DeliveryPacer {
    ctx: Arc<EngineContext>,
    campaign_id: CampaignId,
    last_dispatch: Option<Instant>,
    gap: Duration,
}

impl DeliveryPacer {
    fn new(ctx: Arc<EngineContext>, campaign_id: CampaignId) -> Self {
        Self {
            ctx,
            campaign_id,
            // The first dispatch after start goes out without a wait
            last_dispatch: None,
            gap: Duration::ZERO,
        }
    }

    #[instrument(skip_all, fields(campaign_id = %self.campaign_id))]
    async fn run(mut self, registry: Arc<PacerRegistry>) {
        info!("Delivery pacer started");
        let poll = self.ctx.settings.pacer_poll_interval;

        loop {
            if self.ctx.shutdown.is_cancelled() {
                break;
            }

            match self.step().await {
                Ok(Step::Continue) => {}
                Ok(Step::Wait(delay)) => {
                    if !self.wait(delay).await {
                        break;
                    }
                }
                Ok(Step::Stop) => match registry.retire(self.campaign_id).await {
                    Ok(true) => break,
                    Ok(false) => debug!("Campaign resumed while pacer was stopping"),
                    Err(e) => {
                        error!("Failed to retire pacer: {}", e);
                        if !self.wait(poll).await {
                            break;
                        }
                    }
                },
                Err(e) => {
                    error!("Pacer iteration failed: {}", e);
                    if !self.wait(poll).await {
                        break;
                    }
                }
            }
        }

        self.ctx.metrics.pacer_stopped();
        info!("Delivery pacer stopped");
    }

    /// Sleep unless shutdown arrives first; returns false on shutdown
    async fn wait(&self, delay: Duration) -> bool {
        tokio::select! {
            _ = self.ctx.shutdown.cancelled() => false,
            _ = tokio::time::sleep(delay) => true,
        }
    }

    async fn step(&mut self) -> BlastResult<Step> {
        let poll = self.ctx.settings.pacer_poll_interval;

        let Some(campaign) = self.ctx.campaigns.get(self.campaign_id).await? else {
            return Ok(Step::Stop);
        };
        if campaign.status != CampaignStatus::Running {
            return Ok(Step::Stop);
        }

        let next = self
            .ctx
            .recipients
            .next_approved(self.campaign_id, Utc::now())
            .await?;

        let Some(recipient) = next else {
            if let Some(done) = self.ctx.campaigns.complete_if_drained(self.campaign_id).await? {
                info!(
                    sent = done.sent_count,
                    failed = done.failed_count + done.generation_failed_count,
                    "Campaign {} completed",
                    done.id
                );
                return Ok(Step::Stop);
            }
            return Ok(Step::Wait(poll));
        };

        if let Some(last) = self.last_dispatch {
            let ready_at = last + self.gap;
            let now = Instant::now();
            if now < ready_at {
                // Wake at least every poll interval so pause and cancel apply promptly
                return Ok(Step::Wait((ready_at - now).min(poll)));
            }
        }

        self.dispatch(&campaign, recipient).await?;
        Ok(Step::Continue)
    }

    async fn dispatch(&mut self, campaign: &Campaign, recipient: Recipient) -> BlastResult<()> {
        let Some(recipient) = self.ctx.recipients.mark_sending(recipient.id).await? else {
            debug!(recipient_id = %recipient.id, "Recipient no longer dispatchable");
            return Ok(());
        };

        let outcome = self.deliver(campaign, &recipient).await;
        self.last_dispatch = Some(Instant::now());
        self.gap = sample_gap(campaign.min_interval_secs, campaign.max_interval_secs);

        match outcome {
            Ok((external_id, conversation_id)) => {
                let ctx = &self.ctx;
                self.persist("mark sent", || {
                    ctx.recipients
                        .mark_sent(recipient.id, &external_id, conversation_id)
                })
                .await?;
                self.ctx.metrics.record_dispatch(true);
                info!(
                    recipient_id = %recipient.id,
                    external_id = %external_id,
                    next_gap_ms = self.gap.as_millis() as u64,
                    "Message sent"
                );
            }
            Err(reason) => {
                let ctx = &self.ctx;
                self.persist("mark failed", || {
                    ctx.recipients.mark_delivery_failed(recipient.id, &reason)
                })
                .await?;
                self.ctx.metrics.record_dispatch(false);
                warn!(recipient_id = %recipient.id, "Delivery failed: {}", reason);
            }
        }

        if let Some(done) = self.ctx.campaigns.complete_if_drained(self.campaign_id).await? {
            info!("Campaign {} completed", done.id);
        }
        Ok(())
    }

    /// Resolve the destination and hand the message to the channel
    async fn deliver(
        &self,
        campaign: &Campaign,
        recipient: &Recipient,
    ) -> Result<(String, Option<ConversationId>), String> {
        let text = recipient
            .final_text()
            .ok_or_else(|| "Recipient has no message text".to_string())?
            .to_string();

        let contact = self
            .ctx
            .contacts
            .get(recipient.contact_id)
            .await
            .map_err(|e| format!("Contact lookup failed: {}", e))?
            .ok_or_else(|| format!("Contact {} not found", recipient.contact_id))?;

        let destination = contact
            .phone
            .clone()
            .or_else(|| contact.email.clone())
            .filter(|d| !d.trim().is_empty())
            .ok_or_else(|| "Contact has no destination address".to_string())?;

        let conversation_id = match recipient.conversation_id {
            Some(id) => Some(id),
            None => match self.ctx.contacts.ensure_conversation(contact.id).await {
                Ok(id) => Some(id),
                Err(e) => {
                    warn!(recipient_id = %recipient.id, "Could not open conversation: {}", e);
                    None
                }
            },
        };

        let message = OutboundMessage {
            campaign_id: campaign.id,
            recipient_id: recipient.id,
            conversation_id,
            destination,
            text,
            template_ref: campaign.template_ref.clone(),
        };

        let send = self.ctx.channel.send(&message);
        match tokio::time::timeout(self.ctx.settings.delivery_timeout, send).await {
            Ok(Ok(external_id)) => Ok((external_id, conversation_id)),
            Ok(Err(e)) => Err(e.to_string()),
            Err(_) => Err("Channel request timed out".to_string()),
        }
    }

    /// Retry a store write a few times; the outcome of a channel call must not be lost
    async fn persist<F, Fut>(&self, what: &str, op: F) -> BlastResult<Option<Recipient>>
    where
        F: Fn() -> Fut,
        Fut: Future<Output = chatdesk_common::Result<Option<Recipient>>>,
    {
        let mut attempt = 1;
        loop {
            match op().await {
                Ok(result) => return Ok(result),
                Err(e) if attempt < PERSIST_ATTEMPTS => {
                    warn!(attempt, "Failed to {}: {}", what, e);
                    tokio::time::sleep(PERSIST_BACKOFF * attempt).await;
                    attempt += 1;
                }
                Err(e) => return Err(e.into()),
            }
        }
    }
}
