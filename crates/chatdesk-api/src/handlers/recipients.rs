//! Recipient review handlers

use axum::{
    extract::{Path, State},
    Extension, Json,
};
use chatdesk_common::types::{CampaignId, ContactId, ConversationId, RecipientId};
use chatdesk_storage::{Recipient, RecipientStatus};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;

use crate::auth::{AppState, OperatorContext};
use crate::error::{engine_error, ApiError};

/// Recipient response
#[derive(Debug, Serialize, Deserialize)]
pub struct RecipientResponse {
    pub id: RecipientId,
    pub campaign_id: CampaignId,
    pub contact_id: ContactId,
    pub conversation_id: Option<ConversationId>,
    pub status: RecipientStatus,
    pub generated_text: Option<String>,
    pub override_text: Option<String>,
    /// Text that will be sent
    pub final_text: Option<String>,
    pub approved_by: Option<String>,
    pub approved_at: Option<DateTime<Utc>>,
    pub error_message: Option<String>,
    pub failure_stage: Option<String>,
    pub retry_count: i32,
    pub scheduled_at: Option<DateTime<Utc>>,
    pub sent_at: Option<DateTime<Utc>>,
    pub external_message_id: Option<String>,
    pub generated_at: Option<DateTime<Utc>>,
    pub updated_at: DateTime<Utc>,
}

impl From<Recipient> for RecipientResponse {
    fn from(r: Recipient) -> Self {
        let final_text = r.final_text().map(str::to_string);
        Self {
            id: r.id,
            campaign_id: r.campaign_id,
            contact_id: r.contact_id,
            conversation_id: r.conversation_id,
            status: r.status,
            generated_text: r.generated_text,
            override_text: r.override_text,
            final_text,
            approved_by: r.approved_by,
            approved_at: r.approved_at,
            error_message: r.error_message,
            failure_stage: r.failure_stage,
            retry_count: r.retry_count,
            scheduled_at: r.scheduled_at,
            sent_at: r.sent_at,
            external_message_id: r.external_message_id,
            generated_at: r.generated_at,
            updated_at: r.updated_at,
        }
    }
}

/// Request body for approving a recipient
#[derive(Debug, Default, Deserialize)]
pub struct ApproveRequest {
    pub override_text: Option<String>,
}

/// Request body for editing a recipient's text
#[derive(Debug, Deserialize)]
pub struct EditRequest {
    pub text: String,
}

/// Request body for holding a recipient back; `null` clears the hold
#[derive(Debug, Deserialize)]
pub struct ScheduleRecipientRequest {
    pub scheduled_at: Option<DateTime<Utc>>,
}

/// Approve a generated message
///
/// POST /api/v1/recipients/:recipient_id/approve
pub async fn approve_recipient(
    State(state): State<Arc<AppState>>,
    Extension(operator): Extension<OperatorContext>,
    Path(recipient_id): Path<RecipientId>,
    input: Option<Json<ApproveRequest>>,
) -> Result<Json<RecipientResponse>, ApiError> {
    let override_text = input.and_then(|Json(body)| body.override_text);

    let recipient = state
        .engine
        .review()
        .approve(recipient_id, &operator.operator, override_text)
        .await
        .map_err(|e| engine_error("Approve recipient", e))?;

    Ok(Json(RecipientResponse::from(recipient)))
}

/// Replace the text of a generated message
///
/// POST /api/v1/recipients/:recipient_id/edit
pub async fn edit_recipient(
    State(state): State<Arc<AppState>>,
    Path(recipient_id): Path<RecipientId>,
    Json(input): Json<EditRequest>,
) -> Result<Json<RecipientResponse>, ApiError> {
    let recipient = state
        .engine
        .review()
        .edit(recipient_id, input.text)
        .await
        .map_err(|e| engine_error("Edit recipient", e))?;

    Ok(Json(RecipientResponse::from(recipient)))
}

/// Exclude a recipient from delivery
///
/// POST /api/v1/recipients/:recipient_id/skip
pub async fn skip_recipient(
    State(state): State<Arc<AppState>>,
    Path(recipient_id): Path<RecipientId>,
) -> Result<Json<RecipientResponse>, ApiError> {
    let recipient = state
        .engine
        .review()
        .skip(recipient_id)
        .await
        .map_err(|e| engine_error("Skip recipient", e))?;

    Ok(Json(RecipientResponse::from(recipient)))
}

/// Queue a recipient for a fresh generation
///
/// POST /api/v1/recipients/:recipient_id/regenerate
pub async fn regenerate_recipient(
    State(state): State<Arc<AppState>>,
    Path(recipient_id): Path<RecipientId>,
) -> Result<Json<RecipientResponse>, ApiError> {
    let recipient = state
        .engine
        .generator()
        .regenerate(recipient_id)
        .await
        .map_err(|e| engine_error("Regenerate recipient", e))?;

    Ok(Json(RecipientResponse::from(recipient)))
}

/// Send a failed delivery again with the same text
///
/// POST /api/v1/recipients/:recipient_id/retry
pub async fn retry_recipient(
    State(state): State<Arc<AppState>>,
    Path(recipient_id): Path<RecipientId>,
) -> Result<Json<RecipientResponse>, ApiError> {
    let recipient = state
        .engine
        .review()
        .retry(recipient_id)
        .await
        .map_err(|e| engine_error("Retry recipient", e))?;

    Ok(Json(RecipientResponse::from(recipient)))
}

/// Set or clear the earliest send time of a recipient
///
/// PUT /api/v1/recipients/:recipient_id/schedule
pub async fn schedule_recipient(
    State(state): State<Arc<AppState>>,
    Path(recipient_id): Path<RecipientId>,
    Json(input): Json<ScheduleRecipientRequest>,
) -> Result<Json<RecipientResponse>, ApiError> {
    let recipient = state
        .engine
        .review()
        .schedule(recipient_id, input.scheduled_at)
        .await
        .map_err(|e| engine_error("Schedule recipient", e))?;

    Ok(Json(RecipientResponse::from(recipient)))
}
