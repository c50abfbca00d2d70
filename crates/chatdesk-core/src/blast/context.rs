//! Shared dependencies of the engine components

use chatdesk_common::config::Config;
use chatdesk_common::types::{CampaignId, RecipientId};
use chatdesk_storage::{
    Campaign, CampaignRepository, ContactDirectory, Recipient, RecipientRepository,
};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

use super::error::{BlastError, BlastResult};
use crate::ai::TextGenerator;
use crate::channel::ChannelAdapter;
use crate::metrics::BlastMetrics;

/// Tunables of the engine, resolved from configuration
#[derive(Debug, Clone)]
pub struct EngineSettings {
    pub generation_batch_size: u32,
    pub generation_lease: chrono::Duration,
    pub auto_continue_generation: bool,
    pub pacer_poll_interval: Duration,
    pub supervisor_tick: Duration,
    pub reconcile_interval: Duration,
    pub generation_timeout: Duration,
    pub delivery_timeout: Duration,
    pub default_min_interval_secs: i32,
    pub default_max_interval_secs: i32,
}

impl EngineSettings {
    pub fn from_config(config: &Config) -> Self {
        let blast = &config.blast;
        Self {
            generation_batch_size: blast.generation_batch_size.max(1),
            generation_lease: chrono::Duration::seconds(blast.generation_lease_secs as i64),
            auto_continue_generation: blast.auto_continue_generation,
            pacer_poll_interval: Duration::from_millis(blast.pacer_poll_interval_ms.max(1)),
            supervisor_tick: Duration::from_secs(blast.supervisor_tick_secs.max(1)),
            reconcile_interval: Duration::from_secs(blast.reconcile_interval_secs),
            // The HTTP clients carry their own timeouts; these bound any adapter
            generation_timeout: Duration::from_secs(config.ai.timeout_secs + 5),
            delivery_timeout: Duration::from_secs(config.channel.timeout_secs + 5),
            default_min_interval_secs: blast.default_min_interval_secs,
            default_max_interval_secs: blast.default_max_interval_secs,
        }
    }
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self::from_config(&Config::default())
    }
}

/// Stores, adapters and settings shared by every engine component
pub struct EngineContext {
    pub campaigns: Arc<dyn CampaignRepository>,
    pub recipients: Arc<dyn RecipientRepository>,
    pub contacts: Arc<dyn ContactDirectory>,
    pub generator: Arc<dyn TextGenerator>,
    pub channel: Arc<dyn ChannelAdapter>,
    pub metrics: BlastMetrics,
    pub settings: EngineSettings,
    /// Cancelled on shutdown; background loops stop at their next wait
    pub shutdown: CancellationToken,
}

impl EngineContext {
    pub fn new(
        campaigns: Arc<dyn CampaignRepository>,
        recipients: Arc<dyn RecipientRepository>,
        contacts: Arc<dyn ContactDirectory>,
        generator: Arc<dyn TextGenerator>,
        channel: Arc<dyn ChannelAdapter>,
        metrics: BlastMetrics,
        settings: EngineSettings,
    ) -> Self {
        Self {
            campaigns,
            recipients,
            contacts,
            generator,
            channel,
            metrics,
            settings,
            shutdown: CancellationToken::new(),
        }
    }

    pub(crate) async fn campaign(&self, id: CampaignId) -> BlastResult<Campaign> {
        self.campaigns
            .get(id)
            .await?
            .ok_or(BlastError::CampaignNotFound(id))
    }

    pub(crate) async fn recipient(&self, id: RecipientId) -> BlastResult<Recipient> {
        self.recipients
            .get(id)
            .await?
            .ok_or(BlastError::RecipientNotFound(id))
    }
}
