//! Outbound channel adapter

mod http;

pub use http::HttpChannelAdapter;

use async_trait::async_trait;
use chatdesk_common::types::{CampaignId, ConversationId, RecipientId};
use chatdesk_common::Result;
use serde::Serialize;

/// One message handed to the channel
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct OutboundMessage {
    pub campaign_id: CampaignId,
    pub recipient_id: RecipientId,
    pub conversation_id: Option<ConversationId>,
    /// Channel address of the contact, usually a phone number
    pub destination: String,
    pub text: String,
    pub template_ref: Option<String>,
}

/// Messaging channel
#[async_trait]
pub trait ChannelAdapter: Send + Sync {
    /// Deliver a message and return the channel's message id.
    /// Failures are reported as `Error::Channel`.
    async fn send(&self, message: &OutboundMessage) -> Result<String>;
}
