//! Common types for Chatdesk

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Unique identifier for blast campaigns
pub type CampaignId = Uuid;

/// Unique identifier for campaign recipients
pub type RecipientId = Uuid;

/// Unique identifier for contacts
pub type ContactId = Uuid;

/// Unique identifier for inbox conversations
pub type ConversationId = Uuid;

/// Message template reference as understood by the channel adapter
pub type TemplateRef = String;

/// Identity of the operator performing a review action
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct OperatorId(String);

impl OperatorId {
    /// Fallback identity when the caller did not name an operator
    pub const ANONYMOUS: &'static str = "operator";

    /// Create an operator identity, falling back to the anonymous one when blank
    pub fn new(id: impl Into<String>) -> Self {
        let id = id.into();
        let trimmed = id.trim();
        if trimmed.is_empty() {
            Self(Self::ANONYMOUS.to_string())
        } else {
            Self(trimmed.to_string())
        }
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for OperatorId {
    fn default() -> Self {
        Self(Self::ANONYMOUS.to_string())
    }
}

impl std::fmt::Display for OperatorId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Pagination window
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Page {
    pub limit: i64,
    pub offset: i64,
}

impl Page {
    /// Largest page the API hands out
    pub const MAX_LIMIT: i64 = 500;

    /// Clamp caller-supplied values into a sane window
    pub fn new(limit: i64, offset: i64) -> Self {
        Self {
            limit: limit.clamp(1, Self::MAX_LIMIT),
            offset: offset.max(0),
        }
    }
}

impl Default for Page {
    fn default() -> Self {
        Self::new(50, 0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_operator_id_fallback() {
        assert_eq!(OperatorId::new("  ").as_str(), "operator");
        assert_eq!(OperatorId::new(" alice ").as_str(), "alice");
        assert_eq!(OperatorId::default().to_string(), "operator");
    }

    #[test]
    fn test_page_clamp() {
        let page = Page::new(10_000, -5);
        assert_eq!(page.limit, Page::MAX_LIMIT);
        assert_eq!(page.offset, 0);
        assert_eq!(Page::new(0, 3).limit, 1);
    }
}
