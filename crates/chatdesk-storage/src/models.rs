//! Data models for blast campaigns

use chatdesk_common::types::{CampaignId, ContactId, ConversationId, RecipientId};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;

/// Error returned when a stored status string is not recognised
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("Invalid {kind} status: {value}")]
pub struct ParseStatusError {
    pub kind: &'static str,
    pub value: String,
}

// ============================================================================
// Campaign status
// ============================================================================

/// Campaign lifecycle status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CampaignStatus {
    Draft,
    Scheduled,
    Running,
    Paused,
    Completed,
    Cancelled,
}

impl CampaignStatus {
    pub const ALL: [CampaignStatus; 6] = [
        CampaignStatus::Draft,
        CampaignStatus::Scheduled,
        CampaignStatus::Running,
        CampaignStatus::Paused,
        CampaignStatus::Completed,
        CampaignStatus::Cancelled,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            CampaignStatus::Draft => "draft",
            CampaignStatus::Scheduled => "scheduled",
            CampaignStatus::Running => "running",
            CampaignStatus::Paused => "paused",
            CampaignStatus::Completed => "completed",
            CampaignStatus::Cancelled => "cancelled",
        }
    }

    /// Completed and cancelled campaigns never change again
    pub fn is_terminal(&self) -> bool {
        matches!(self, CampaignStatus::Completed | CampaignStatus::Cancelled)
    }

    /// Statuses reachable in one step
    pub fn allowed_next(&self) -> &'static [CampaignStatus] {
        use CampaignStatus::*;
        match self {
            Draft => &[Scheduled, Running, Cancelled],
            Scheduled => &[Running, Cancelled],
            Running => &[Paused, Cancelled, Completed],
            Paused => &[Running, Cancelled],
            Completed | Cancelled => &[],
        }
    }

    pub fn can_transition_to(&self, next: CampaignStatus) -> bool {
        self.allowed_next().contains(&next)
    }
}

impl std::fmt::Display for CampaignStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for CampaignStatus {
    type Err = ParseStatusError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        CampaignStatus::ALL
            .iter()
            .copied()
            .find(|status| status.as_str() == s)
            .ok_or_else(|| ParseStatusError {
                kind: "campaign",
                value: s.to_string(),
            })
    }
}

impl TryFrom<String> for CampaignStatus {
    type Error = ParseStatusError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

/// Operator actions on a campaign and the statuses they may be taken from
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CampaignAction {
    Start,
    Schedule,
    Pause,
    Cancel,
    Complete,
    Generate,
    Update,
    Delete,
}

impl CampaignAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            CampaignAction::Start => "start",
            CampaignAction::Schedule => "schedule",
            CampaignAction::Pause => "pause",
            CampaignAction::Cancel => "cancel",
            CampaignAction::Complete => "complete",
            CampaignAction::Generate => "generate",
            CampaignAction::Update => "update",
            CampaignAction::Delete => "delete",
        }
    }

    pub fn sources(&self) -> &'static [CampaignStatus] {
        use CampaignStatus::*;
        match self {
            CampaignAction::Start => &[Draft, Scheduled, Paused],
            CampaignAction::Schedule => &[Draft],
            CampaignAction::Pause => &[Running],
            CampaignAction::Cancel => &[Draft, Scheduled, Running, Paused],
            CampaignAction::Complete => &[Running],
            CampaignAction::Generate => &[Draft, Scheduled, Running],
            CampaignAction::Update => &[Draft, Paused],
            CampaignAction::Delete => &[Draft, Completed, Cancelled],
        }
    }

    /// Status the action moves the campaign to, if it is a status change
    pub fn target(&self) -> Option<CampaignStatus> {
        match self {
            CampaignAction::Start => Some(CampaignStatus::Running),
            CampaignAction::Schedule => Some(CampaignStatus::Scheduled),
            CampaignAction::Pause => Some(CampaignStatus::Paused),
            CampaignAction::Cancel => Some(CampaignStatus::Cancelled),
            CampaignAction::Complete => Some(CampaignStatus::Completed),
            CampaignAction::Generate | CampaignAction::Update | CampaignAction::Delete => None,
        }
    }

    pub fn allowed_from(&self, status: CampaignStatus) -> bool {
        self.sources().contains(&status)
    }
}

// ============================================================================
// Recipient status
// ============================================================================

/// Per-recipient status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RecipientStatus {
    Pending,
    Generating,
    AwaitingReview,
    Approved,
    Sending,
    Sent,
    Failed,
    Skipped,
}

impl RecipientStatus {
    pub const ALL: [RecipientStatus; 8] = [
        RecipientStatus::Pending,
        RecipientStatus::Generating,
        RecipientStatus::AwaitingReview,
        RecipientStatus::Approved,
        RecipientStatus::Sending,
        RecipientStatus::Sent,
        RecipientStatus::Failed,
        RecipientStatus::Skipped,
    ];

    /// Statuses that still need operator or engine work before dispatch
    pub const QUEUED: [RecipientStatus; 4] = [
        RecipientStatus::Pending,
        RecipientStatus::Generating,
        RecipientStatus::AwaitingReview,
        RecipientStatus::Approved,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            RecipientStatus::Pending => "pending",
            RecipientStatus::Generating => "generating",
            RecipientStatus::AwaitingReview => "awaiting_review",
            RecipientStatus::Approved => "approved",
            RecipientStatus::Sending => "sending",
            RecipientStatus::Sent => "sent",
            RecipientStatus::Failed => "failed",
            RecipientStatus::Skipped => "skipped",
        }
    }

    /// Failed recipients count as terminal for campaign completion even
    /// though an operator may still regenerate or retry them.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            RecipientStatus::Sent | RecipientStatus::Failed | RecipientStatus::Skipped
        )
    }

    pub fn allowed_next(&self) -> &'static [RecipientStatus] {
        use RecipientStatus::*;
        match self {
            Pending => &[Generating, Skipped],
            Generating => &[AwaitingReview, Failed, Pending, Skipped],
            AwaitingReview => &[Approved, Pending, Skipped],
            Approved => &[Sending, Pending, Skipped],
            Sending => &[Sent, Failed, Approved],
            Failed => &[Pending, Approved],
            Sent | Skipped => &[],
        }
    }

    pub fn can_transition_to(&self, next: RecipientStatus) -> bool {
        self.allowed_next().contains(&next)
    }
}

impl std::fmt::Display for RecipientStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for RecipientStatus {
    type Err = ParseStatusError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        RecipientStatus::ALL
            .iter()
            .copied()
            .find(|status| status.as_str() == s)
            .ok_or_else(|| ParseStatusError {
                kind: "recipient",
                value: s.to_string(),
            })
    }
}

impl TryFrom<String> for RecipientStatus {
    type Error = ParseStatusError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

/// Actions applied to a single recipient.
///
/// Every repository method that changes a recipient's status is keyed by
/// one of these, so the set of legal source statuses lives in one place.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecipientAction {
    Claim,
    CompleteGeneration,
    FailGeneration,
    ReleaseClaim,
    Approve,
    Edit,
    Skip,
    Regenerate,
    RetryDelivery,
    Reschedule,
    Dispatch,
    Deliver,
    FailDelivery,
    RecoverGeneration,
    RecoverDispatch,
    /// Interrupted send whose campaign ended before the restart
    AbandonDispatch,
    Cancel,
}

impl RecipientAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            RecipientAction::Claim => "claim",
            RecipientAction::CompleteGeneration => "complete_generation",
            RecipientAction::FailGeneration => "fail_generation",
            RecipientAction::ReleaseClaim => "release_claim",
            RecipientAction::Approve => "approve",
            RecipientAction::Edit => "edit",
            RecipientAction::Skip => "skip",
            RecipientAction::Regenerate => "regenerate",
            RecipientAction::RetryDelivery => "retry",
            RecipientAction::Reschedule => "schedule",
            RecipientAction::Dispatch => "dispatch",
            RecipientAction::Deliver => "deliver",
            RecipientAction::FailDelivery => "fail_delivery",
            RecipientAction::RecoverGeneration => "recover_generation",
            RecipientAction::RecoverDispatch => "recover_dispatch",
            RecipientAction::AbandonDispatch => "abandon_dispatch",
            RecipientAction::Cancel => "cancel",
        }
    }

    pub fn sources(&self) -> &'static [RecipientStatus] {
        use RecipientStatus::*;
        match self {
            RecipientAction::Claim => &[Pending],
            RecipientAction::CompleteGeneration => &[Generating],
            RecipientAction::FailGeneration => &[Generating],
            RecipientAction::ReleaseClaim => &[Generating],
            RecipientAction::Approve => &[AwaitingReview],
            RecipientAction::Edit => &[AwaitingReview, Approved],
            RecipientAction::Skip => &[Pending, Generating, AwaitingReview, Approved],
            RecipientAction::Regenerate => &[AwaitingReview, Approved, Failed],
            RecipientAction::RetryDelivery => &[Failed],
            RecipientAction::Reschedule => &[Pending, Generating, AwaitingReview, Approved],
            RecipientAction::Dispatch => &[Approved],
            RecipientAction::Deliver => &[Sending],
            RecipientAction::FailDelivery => &[Sending],
            RecipientAction::RecoverGeneration => &[Generating],
            RecipientAction::RecoverDispatch => &[Sending],
            RecipientAction::AbandonDispatch => &[Sending],
            RecipientAction::Cancel => &[Pending, Generating, AwaitingReview, Approved],
        }
    }

    /// Status after the action, or `None` when only content changes
    pub fn target(&self) -> Option<RecipientStatus> {
        use RecipientStatus::*;
        match self {
            RecipientAction::Claim => Some(Generating),
            RecipientAction::CompleteGeneration => Some(AwaitingReview),
            RecipientAction::FailGeneration => Some(Failed),
            RecipientAction::ReleaseClaim => Some(Pending),
            RecipientAction::Approve => Some(Approved),
            RecipientAction::Edit | RecipientAction::Reschedule => None,
            RecipientAction::Skip | RecipientAction::Cancel => Some(Skipped),
            RecipientAction::Regenerate => Some(Pending),
            RecipientAction::RetryDelivery => Some(Approved),
            RecipientAction::Dispatch => Some(Sending),
            RecipientAction::Deliver => Some(Sent),
            RecipientAction::FailDelivery | RecipientAction::AbandonDispatch => Some(Failed),
            RecipientAction::RecoverGeneration => Some(Pending),
            RecipientAction::RecoverDispatch => Some(Approved),
        }
    }

    pub fn allowed_from(&self, status: RecipientStatus) -> bool {
        self.sources().contains(&status)
    }

    pub(crate) fn source_names(&self) -> Vec<String> {
        self.sources().iter().map(|s| s.as_str().to_string()).collect()
    }
}

/// Stage at which a failed recipient failed
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureStage {
    Generation,
    Delivery,
}

impl FailureStage {
    pub fn as_str(&self) -> &'static str {
        match self {
            FailureStage::Generation => "generation",
            FailureStage::Delivery => "delivery",
        }
    }
}

impl std::str::FromStr for FailureStage {
    type Err = ParseStatusError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "generation" => Ok(FailureStage::Generation),
            "delivery" => Ok(FailureStage::Delivery),
            _ => Err(ParseStatusError {
                kind: "failure stage",
                value: s.to_string(),
            }),
        }
    }
}

// ============================================================================
// Campaign
// ============================================================================

/// Blast campaign
#[derive(Debug, Clone, FromRow, Serialize, Deserialize)]
pub struct Campaign {
    pub id: CampaignId,
    pub name: String,
    pub prompt: String,
    pub template_ref: Option<String>,
    pub min_interval_secs: i32,
    pub max_interval_secs: i32,
    #[sqlx(try_from = "String")]
    pub status: CampaignStatus,
    pub total_recipients: i32,
    pub generated_count: i32,
    pub sent_count: i32,
    pub failed_count: i32,
    pub generation_failed_count: i32,
    pub is_generating: bool,
    pub generation_started_at: Option<DateTime<Utc>>,
    pub created_by: Option<String>,
    pub scheduled_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl Campaign {
    pub fn counters(&self) -> CampaignCounters {
        CampaignCounters {
            total_recipients: self.total_recipients,
            generated_count: self.generated_count,
            sent_count: self.sent_count,
            failed_count: self.failed_count,
            generation_failed_count: self.generation_failed_count,
        }
    }

    /// Whether a generation lease is currently held and not yet expired
    pub fn generation_lease_active(&self, now: DateTime<Utc>, ttl: chrono::Duration) -> bool {
        match (self.is_generating, self.generation_started_at) {
            (true, Some(started)) => started + ttl > now,
            (true, None) => true,
            _ => false,
        }
    }
}

/// Create campaign input
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CreateCampaign {
    pub name: String,
    pub prompt: String,
    pub template_ref: Option<String>,
    pub min_interval_secs: i32,
    pub max_interval_secs: i32,
    pub contact_ids: Vec<ContactId>,
    pub created_by: Option<String>,
}

/// Update campaign input
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct UpdateCampaign {
    pub name: Option<String>,
    pub prompt: Option<String>,
    pub template_ref: Option<String>,
    pub min_interval_secs: Option<i32>,
    pub max_interval_secs: Option<i32>,
}

impl UpdateCampaign {
    pub fn is_empty(&self) -> bool {
        self.name.is_none()
            && self.prompt.is_none()
            && self.template_ref.is_none()
            && self.min_interval_secs.is_none()
            && self.max_interval_secs.is_none()
    }
}

/// Denormalised campaign counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, FromRow, Serialize, Deserialize)]
pub struct CampaignCounters {
    pub total_recipients: i32,
    pub generated_count: i32,
    pub sent_count: i32,
    pub failed_count: i32,
    pub generation_failed_count: i32,
}

/// Increment applied to campaign counters alongside a recipient transition
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CounterDelta {
    pub generated: i32,
    pub sent: i32,
    pub failed: i32,
    pub generation_failed: i32,
}

impl CounterDelta {
    pub fn is_zero(&self) -> bool {
        *self == CounterDelta::default()
    }

    /// Undo the failure counter for a recipient leaving `failed`
    pub fn leaving_failure(stage: Option<FailureStage>) -> Self {
        match stage {
            Some(FailureStage::Generation) => CounterDelta {
                generation_failed: -1,
                ..Default::default()
            },
            Some(FailureStage::Delivery) => CounterDelta {
                failed: -1,
                ..Default::default()
            },
            None => CounterDelta::default(),
        }
    }

    pub fn apply(&self, counters: &mut CampaignCounters) {
        counters.generated_count += self.generated;
        counters.sent_count += self.sent;
        counters.failed_count += self.failed;
        counters.generation_failed_count += self.generation_failed;
    }
}

/// Counters before and after a reconciliation pass that found drift
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct CounterDrift {
    pub campaign_id: CampaignId,
    pub before: CampaignCounters,
    pub after: CampaignCounters,
}

// ============================================================================
// Recipient
// ============================================================================

/// Campaign recipient
#[derive(Debug, Clone, FromRow, Serialize, Deserialize)]
pub struct Recipient {
    pub id: RecipientId,
    pub campaign_id: CampaignId,
    pub contact_id: ContactId,
    pub conversation_id: Option<ConversationId>,
    #[sqlx(try_from = "String")]
    pub status: RecipientStatus,
    pub generated_text: Option<String>,
    pub override_text: Option<String>,
    pub generated_at: Option<DateTime<Utc>>,
    pub first_generated_at: Option<DateTime<Utc>>,
    pub approved_by: Option<String>,
    pub approved_at: Option<DateTime<Utc>>,
    pub error_message: Option<String>,
    pub failure_stage: Option<String>,
    pub retry_count: i32,
    pub scheduled_at: Option<DateTime<Utc>>,
    pub sent_at: Option<DateTime<Utc>>,
    pub external_message_id: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Recipient {
    /// Text that will be dispatched: the operator override wins
    pub fn final_text(&self) -> Option<&str> {
        self.override_text
            .as_deref()
            .or(self.generated_text.as_deref())
    }

    pub fn failure_stage(&self) -> Option<FailureStage> {
        self.failure_stage.as_deref().and_then(|s| s.parse().ok())
    }

    pub fn is_due(&self, now: DateTime<Utc>) -> bool {
        self.scheduled_at.map_or(true, |at| at <= now)
    }
}

/// Recipient counts grouped by status
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, FromRow, Serialize, Deserialize)]
pub struct RecipientCounts {
    pub pending: i64,
    pub generating: i64,
    pub awaiting_review: i64,
    pub approved: i64,
    pub sending: i64,
    pub sent: i64,
    pub failed: i64,
    pub skipped: i64,
}

impl RecipientCounts {
    pub fn total(&self) -> i64 {
        self.pending
            + self.generating
            + self.awaiting_review
            + self.approved
            + self.sending
            + self.sent
            + self.failed
            + self.skipped
    }

    pub fn get(&self, status: RecipientStatus) -> i64 {
        match status {
            RecipientStatus::Pending => self.pending,
            RecipientStatus::Generating => self.generating,
            RecipientStatus::AwaitingReview => self.awaiting_review,
            RecipientStatus::Approved => self.approved,
            RecipientStatus::Sending => self.sending,
            RecipientStatus::Sent => self.sent,
            RecipientStatus::Failed => self.failed,
            RecipientStatus::Skipped => self.skipped,
        }
    }

    pub fn add(&mut self, status: RecipientStatus) {
        let slot = match status {
            RecipientStatus::Pending => &mut self.pending,
            RecipientStatus::Generating => &mut self.generating,
            RecipientStatus::AwaitingReview => &mut self.awaiting_review,
            RecipientStatus::Approved => &mut self.approved,
            RecipientStatus::Sending => &mut self.sending,
            RecipientStatus::Sent => &mut self.sent,
            RecipientStatus::Failed => &mut self.failed,
            RecipientStatus::Skipped => &mut self.skipped,
        };
        *slot += 1;
    }

    /// Recipients in a terminal status
    pub fn finished(&self) -> i64 {
        self.sent + self.failed + self.skipped
    }

    /// Recipients that are neither terminal nor in flight
    pub fn non_terminal(&self) -> i64 {
        self.total() - self.finished()
    }
}

/// Rows moved by the startup recovery sweep
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct StuckRecovery {
    pub generating_reset: u64,
    pub sending_reset: u64,
    /// Sends interrupted in campaigns that have since ended, now failed
    pub sending_failed: u64,
}

// ============================================================================
// Contacts
// ============================================================================

/// Helpdesk contact
#[derive(Debug, Clone, FromRow, Serialize, Deserialize)]
pub struct Contact {
    pub id: ContactId,
    pub name: String,
    pub phone: Option<String>,
    pub email: Option<String>,
    pub attributes: serde_json::Value,
    pub created_at: DateTime<Utc>,
}

/// Create contact input
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CreateContact {
    pub name: String,
    pub phone: Option<String>,
    pub email: Option<String>,
    pub attributes: Option<serde_json::Value>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_status_round_trip_through_strings() {
        for status in RecipientStatus::ALL {
            assert_eq!(status.as_str().parse::<RecipientStatus>(), Ok(status));
        }
        for status in CampaignStatus::ALL {
            assert_eq!(CampaignStatus::try_from(status.to_string()), Ok(status));
        }
        assert!("sending".parse::<CampaignStatus>().is_err());
    }

    #[test]
    fn test_recipient_actions_follow_transition_table() {
        let actions = [
            RecipientAction::Claim,
            RecipientAction::CompleteGeneration,
            RecipientAction::FailGeneration,
            RecipientAction::ReleaseClaim,
            RecipientAction::Approve,
            RecipientAction::Skip,
            RecipientAction::Regenerate,
            RecipientAction::RetryDelivery,
            RecipientAction::Dispatch,
            RecipientAction::Deliver,
            RecipientAction::FailDelivery,
            RecipientAction::RecoverGeneration,
            RecipientAction::RecoverDispatch,
            RecipientAction::AbandonDispatch,
            RecipientAction::Cancel,
        ];
        for action in actions {
            let target = action.target().unwrap();
            for source in action.sources() {
                assert!(
                    source.can_transition_to(target),
                    "{} is not allowed from {} to {}",
                    action.as_str(),
                    source,
                    target
                );
            }
        }
    }

    #[test]
    fn test_campaign_actions_follow_transition_table() {
        let actions = [
            CampaignAction::Start,
            CampaignAction::Schedule,
            CampaignAction::Pause,
            CampaignAction::Cancel,
            CampaignAction::Complete,
        ];
        for action in actions {
            let target = action.target().unwrap();
            for source in action.sources() {
                assert!(source.can_transition_to(target));
            }
        }
    }

    #[test]
    fn test_terminal_statuses_have_no_exits() {
        assert!(RecipientStatus::Sent.allowed_next().is_empty());
        assert!(RecipientStatus::Skipped.allowed_next().is_empty());
        assert!(CampaignStatus::Completed.allowed_next().is_empty());
        assert!(CampaignStatus::Cancelled.allowed_next().is_empty());
        assert!(!RecipientStatus::Sending.is_terminal());
        assert!(RecipientStatus::Failed.is_terminal());
    }

    #[test]
    fn test_cancel_never_touches_sending() {
        assert!(!RecipientAction::Cancel.allowed_from(RecipientStatus::Sending));
        assert!(!RecipientAction::Skip.allowed_from(RecipientStatus::Sending));
        assert!(RecipientAction::Skip.allowed_from(RecipientStatus::Generating));
    }

    #[test]
    fn test_interrupted_send_is_never_marked_sent() {
        for action in [RecipientAction::RecoverDispatch, RecipientAction::AbandonDispatch] {
            assert_eq!(action.sources(), &[RecipientStatus::Sending]);
            assert_ne!(action.target(), Some(RecipientStatus::Sent));
        }
    }

    #[test]
    fn test_counts_helpers() {
        let mut counts = RecipientCounts::default();
        counts.add(RecipientStatus::Sent);
        counts.add(RecipientStatus::Failed);
        counts.add(RecipientStatus::Pending);
        counts.add(RecipientStatus::Sending);
        assert_eq!(counts.total(), 4);
        assert_eq!(counts.finished(), 2);
        assert_eq!(counts.non_terminal(), 2);
        assert_eq!(counts.get(RecipientStatus::Sending), 1);
    }

    #[test]
    fn test_final_text_prefers_override() {
        let now = Utc::now();
        let mut recipient = Recipient {
            id: uuid::Uuid::new_v4(),
            campaign_id: uuid::Uuid::new_v4(),
            contact_id: uuid::Uuid::new_v4(),
            conversation_id: None,
            status: RecipientStatus::AwaitingReview,
            generated_text: Some("generated".to_string()),
            override_text: None,
            generated_at: Some(now),
            first_generated_at: Some(now),
            approved_by: None,
            approved_at: None,
            error_message: None,
            failure_stage: None,
            retry_count: 1,
            scheduled_at: None,
            sent_at: None,
            external_message_id: None,
            created_at: now,
            updated_at: now,
        };
        assert_eq!(recipient.final_text(), Some("generated"));
        recipient.override_text = Some("edited".to_string());
        assert_eq!(recipient.final_text(), Some("edited"));
    }

    #[test]
    fn test_leaving_failure_delta() {
        let mut counters = CampaignCounters {
            failed_count: 2,
            generation_failed_count: 1,
            ..Default::default()
        };
        CounterDelta::leaving_failure(Some(FailureStage::Generation)).apply(&mut counters);
        assert_eq!(counters.generation_failed_count, 0);
        assert_eq!(counters.failed_count, 2);
    }
}
