//! Blast engine errors

use chatdesk_common::types::{CampaignId, ContactId, RecipientId};
use thiserror::Error;

/// Blast engine errors
#[derive(Error, Debug)]
pub enum BlastError {
    #[error("Campaign {0} not found")]
    CampaignNotFound(CampaignId),

    #[error("Recipient {0} not found")]
    RecipientNotFound(RecipientId),

    #[error("Contact {0} not found")]
    ContactNotFound(ContactId),

    #[error("{0}")]
    Validation(String),

    #[error("Cannot {action} {entity} in status '{from}'")]
    InvalidTransition {
        entity: &'static str,
        from: String,
        action: &'static str,
    },

    #[error("Generation already in progress for campaign {0}")]
    AlreadyGenerating(CampaignId),

    #[error("Generation failed: {0}")]
    Generation(String),

    #[error(transparent)]
    Storage(#[from] chatdesk_common::Error),
}

pub type BlastResult<T> = Result<T, BlastError>;

impl BlastError {
    pub(crate) fn campaign_transition(
        from: chatdesk_storage::CampaignStatus,
        action: chatdesk_storage::CampaignAction,
    ) -> Self {
        BlastError::InvalidTransition {
            entity: "campaign",
            from: from.to_string(),
            action: action.as_str(),
        }
    }

    pub(crate) fn recipient_transition(
        from: chatdesk_storage::RecipientStatus,
        action: chatdesk_storage::RecipientAction,
    ) -> Self {
        BlastError::InvalidTransition {
            entity: "recipient",
            from: from.to_string(),
            action: action.as_str(),
        }
    }

    /// HTTP status the API answers with
    pub fn status_code(&self) -> u16 {
        match self {
            BlastError::CampaignNotFound(_)
            | BlastError::RecipientNotFound(_)
            | BlastError::ContactNotFound(_) => 404,
            BlastError::Validation(_) => 422,
            BlastError::InvalidTransition { .. } | BlastError::AlreadyGenerating(_) => 409,
            BlastError::Generation(_) => 502,
            BlastError::Storage(e) => e.status_code(),
        }
    }

    /// Machine-readable error code
    pub fn code(&self) -> &'static str {
        match self {
            BlastError::CampaignNotFound(_) => "CAMPAIGN_NOT_FOUND",
            BlastError::RecipientNotFound(_) => "RECIPIENT_NOT_FOUND",
            BlastError::ContactNotFound(_) => "CONTACT_NOT_FOUND",
            BlastError::Validation(_) => "VALIDATION_ERROR",
            BlastError::InvalidTransition { .. } => "INVALID_TRANSITION",
            BlastError::AlreadyGenerating(_) => "ALREADY_GENERATING",
            BlastError::Generation(_) => "GENERATION_ERROR",
            BlastError::Storage(e) => e.code(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chatdesk_storage::{CampaignAction, CampaignStatus};

    #[test]
    fn test_transition_message_names_status_and_action() {
        let err = BlastError::campaign_transition(CampaignStatus::Completed, CampaignAction::Pause);
        assert_eq!(err.to_string(), "Cannot pause campaign in status 'completed'");
        assert_eq!(err.status_code(), 409);
    }

    #[test]
    fn test_storage_errors_keep_their_status() {
        let err = BlastError::from(chatdesk_common::Error::Database("down".to_string()));
        assert_eq!(err.status_code(), 500);
        assert_eq!(err.code(), "DATABASE_ERROR");
    }
}
