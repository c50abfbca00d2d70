//! Campaign handlers

use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    Extension, Json,
};
use chatdesk_common::types::{CampaignId, ContactId, Page};
use chatdesk_core::{BatchReport, CampaignStats, NewCampaign, QueueView};
use chatdesk_storage::{Campaign, CampaignStatus, RecipientStatus, UpdateCampaign};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::info;

use super::recipients::RecipientResponse;
use crate::auth::{AppState, OperatorContext};
use crate::error::{engine_error, validation_error, ApiError};

/// Query parameters for listing campaigns
#[derive(Debug, Deserialize)]
pub struct ListCampaignsQuery {
    pub status: Option<String>,
    #[serde(default = "default_limit")]
    pub limit: i64,
    #[serde(default)]
    pub offset: i64,
}

/// Query parameters for paged recipient listings
#[derive(Debug, Deserialize)]
pub struct RecipientsQuery {
    /// Comma separated statuses; empty means all
    pub status: Option<String>,
    #[serde(default = "default_limit")]
    pub limit: i64,
    #[serde(default)]
    pub offset: i64,
}

fn default_limit() -> i64 {
    50
}

/// Campaign list response
#[derive(Debug, Serialize, Deserialize)]
pub struct CampaignListResponse {
    pub data: Vec<CampaignResponse>,
    pub total: i64,
    pub limit: i64,
    pub offset: i64,
}

/// Campaign response
#[derive(Debug, Serialize, Deserialize)]
pub struct CampaignResponse {
    pub id: CampaignId,
    pub name: String,
    pub prompt: String,
    pub template_ref: Option<String>,
    pub min_interval_secs: i32,
    pub max_interval_secs: i32,
    pub status: CampaignStatus,
    pub total_recipients: i32,
    pub generated_count: i32,
    pub sent_count: i32,
    pub failed_count: i32,
    pub generation_failed_count: i32,
    pub is_generating: bool,
    pub created_by: Option<String>,
    pub scheduled_at: Option<DateTime<Utc>>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl From<Campaign> for CampaignResponse {
    fn from(c: Campaign) -> Self {
        Self {
            id: c.id,
            name: c.name,
            prompt: c.prompt,
            template_ref: c.template_ref,
            min_interval_secs: c.min_interval_secs,
            max_interval_secs: c.max_interval_secs,
            status: c.status,
            total_recipients: c.total_recipients,
            generated_count: c.generated_count,
            sent_count: c.sent_count,
            failed_count: c.failed_count,
            generation_failed_count: c.generation_failed_count,
            is_generating: c.is_generating,
            created_by: c.created_by,
            scheduled_at: c.scheduled_at,
            started_at: c.started_at,
            completed_at: c.completed_at,
            created_at: c.created_at,
            updated_at: c.updated_at,
        }
    }
}

/// Request body for creating a campaign
#[derive(Debug, Deserialize)]
pub struct CreateCampaignRequest {
    pub name: String,
    pub prompt: String,
    pub contact_ids: Vec<ContactId>,
    pub min_interval_secs: Option<i32>,
    pub max_interval_secs: Option<i32>,
    pub template_ref: Option<String>,
}

/// Request body for updating a campaign
#[derive(Debug, Deserialize)]
pub struct UpdateCampaignRequest {
    pub name: Option<String>,
    pub prompt: Option<String>,
    pub template_ref: Option<String>,
    pub min_interval_secs: Option<i32>,
    pub max_interval_secs: Option<i32>,
}

/// Request body for scheduling a campaign
#[derive(Debug, Deserialize)]
pub struct ScheduleCampaignRequest {
    pub scheduled_at: DateTime<Utc>,
}

/// Request body for generating more messages
#[derive(Debug, Default, Deserialize)]
pub struct GenerateRequest {
    pub batch_size: Option<u32>,
}

/// Request body for previewing a message
#[derive(Debug, Deserialize)]
pub struct PreviewRequest {
    pub contact_id: ContactId,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct PreviewResponse {
    pub contact_id: ContactId,
    pub text: String,
}

/// Review queue response
#[derive(Debug, Serialize)]
pub struct QueueResponse {
    pub campaign_id: CampaignId,
    pub pending: i64,
    pub generating: i64,
    pub awaiting_review: i64,
    pub approved: i64,
    pub recipients: Vec<RecipientResponse>,
}

impl From<QueueView> for QueueResponse {
    fn from(q: QueueView) -> Self {
        Self {
            campaign_id: q.campaign_id,
            pending: q.pending,
            generating: q.generating,
            awaiting_review: q.awaiting_review,
            approved: q.approved,
            recipients: q.recipients.into_iter().map(RecipientResponse::from).collect(),
        }
    }
}

/// List campaigns, newest first
///
/// GET /api/v1/campaigns
pub async fn list_campaigns(
    State(state): State<Arc<AppState>>,
    Query(query): Query<ListCampaignsQuery>,
) -> Result<Json<CampaignListResponse>, ApiError> {
    let status = query
        .status
        .as_deref()
        .filter(|s| !s.is_empty())
        .map(str::parse::<CampaignStatus>)
        .transpose()
        .map_err(|e| validation_error(e.to_string()))?;
    let page = Page::new(query.limit, query.offset);

    let (campaigns, total) = state
        .engine
        .manager()
        .list(status, page)
        .await
        .map_err(|e| engine_error("List campaigns", e))?;

    Ok(Json(CampaignListResponse {
        data: campaigns.into_iter().map(CampaignResponse::from).collect(),
        total,
        limit: page.limit,
        offset: page.offset,
    }))
}

/// Create a new campaign
///
/// POST /api/v1/campaigns
pub async fn create_campaign(
    State(state): State<Arc<AppState>>,
    Extension(operator): Extension<OperatorContext>,
    Json(input): Json<CreateCampaignRequest>,
) -> Result<(StatusCode, Json<CampaignResponse>), ApiError> {
    let campaign = state
        .engine
        .manager()
        .create(NewCampaign {
            name: input.name,
            prompt: input.prompt,
            contact_ids: input.contact_ids,
            min_interval_secs: input.min_interval_secs,
            max_interval_secs: input.max_interval_secs,
            template_ref: input.template_ref,
            created_by: Some(operator.operator.to_string()),
        })
        .await
        .map_err(|e| engine_error("Create campaign", e))?;

    info!("Created campaign {} ({})", campaign.id, campaign.name);

    Ok((StatusCode::CREATED, Json(CampaignResponse::from(campaign))))
}

/// Get a campaign
///
/// GET /api/v1/campaigns/:campaign_id
pub async fn get_campaign(
    State(state): State<Arc<AppState>>,
    Path(campaign_id): Path<CampaignId>,
) -> Result<Json<CampaignResponse>, ApiError> {
    let campaign = state
        .engine
        .manager()
        .get(campaign_id)
        .await
        .map_err(|e| engine_error("Get campaign", e))?;

    Ok(Json(CampaignResponse::from(campaign)))
}

/// Update a draft or paused campaign
///
/// PUT /api/v1/campaigns/:campaign_id
pub async fn update_campaign(
    State(state): State<Arc<AppState>>,
    Path(campaign_id): Path<CampaignId>,
    Json(input): Json<UpdateCampaignRequest>,
) -> Result<Json<CampaignResponse>, ApiError> {
    let update = UpdateCampaign {
        name: input.name,
        prompt: input.prompt,
        template_ref: input.template_ref,
        min_interval_secs: input.min_interval_secs,
        max_interval_secs: input.max_interval_secs,
    };

    let campaign = state
        .engine
        .manager()
        .update(campaign_id, update)
        .await
        .map_err(|e| engine_error("Update campaign", e))?;

    Ok(Json(CampaignResponse::from(campaign)))
}

/// Delete a campaign and its recipients
///
/// DELETE /api/v1/campaigns/:campaign_id
pub async fn delete_campaign(
    State(state): State<Arc<AppState>>,
    Path(campaign_id): Path<CampaignId>,
) -> Result<StatusCode, ApiError> {
    state
        .engine
        .manager()
        .delete(campaign_id)
        .await
        .map_err(|e| engine_error("Delete campaign", e))?;

    Ok(StatusCode::NO_CONTENT)
}

/// Start or resume a campaign
///
/// POST /api/v1/campaigns/:campaign_id/start
pub async fn start_campaign(
    State(state): State<Arc<AppState>>,
    Path(campaign_id): Path<CampaignId>,
) -> Result<Json<CampaignResponse>, ApiError> {
    let campaign = state
        .engine
        .manager()
        .start(campaign_id)
        .await
        .map_err(|e| engine_error("Start campaign", e))?;

    Ok(Json(CampaignResponse::from(campaign)))
}

/// Pause a running campaign
///
/// POST /api/v1/campaigns/:campaign_id/pause
pub async fn pause_campaign(
    State(state): State<Arc<AppState>>,
    Path(campaign_id): Path<CampaignId>,
) -> Result<Json<CampaignResponse>, ApiError> {
    let campaign = state
        .engine
        .manager()
        .pause(campaign_id)
        .await
        .map_err(|e| engine_error("Pause campaign", e))?;

    Ok(Json(CampaignResponse::from(campaign)))
}

/// Cancel a campaign
///
/// POST /api/v1/campaigns/:campaign_id/cancel
pub async fn cancel_campaign(
    State(state): State<Arc<AppState>>,
    Path(campaign_id): Path<CampaignId>,
) -> Result<Json<CampaignResponse>, ApiError> {
    let campaign = state
        .engine
        .manager()
        .cancel(campaign_id)
        .await
        .map_err(|e| engine_error("Cancel campaign", e))?;

    Ok(Json(CampaignResponse::from(campaign)))
}

/// Schedule a draft campaign
///
/// POST /api/v1/campaigns/:campaign_id/schedule
pub async fn schedule_campaign(
    State(state): State<Arc<AppState>>,
    Path(campaign_id): Path<CampaignId>,
    Json(input): Json<ScheduleCampaignRequest>,
) -> Result<Json<CampaignResponse>, ApiError> {
    let campaign = state
        .engine
        .manager()
        .schedule(campaign_id, input.scheduled_at)
        .await
        .map_err(|e| engine_error("Schedule campaign", e))?;

    Ok(Json(CampaignResponse::from(campaign)))
}

/// Generate the next batch of messages
///
/// POST /api/v1/campaigns/:campaign_id/generate
pub async fn generate_batch(
    State(state): State<Arc<AppState>>,
    Path(campaign_id): Path<CampaignId>,
    input: Option<Json<GenerateRequest>>,
) -> Result<Json<BatchReport>, ApiError> {
    let batch_size = input.and_then(|Json(body)| body.batch_size);

    let report = state
        .engine
        .generator()
        .generate_batch(campaign_id, batch_size)
        .await
        .map_err(|e| engine_error("Generate batch", e))?;

    Ok(Json(report))
}

/// Preview a message for one contact without saving it
///
/// POST /api/v1/campaigns/:campaign_id/preview
pub async fn preview_message(
    State(state): State<Arc<AppState>>,
    Path(campaign_id): Path<CampaignId>,
    Json(input): Json<PreviewRequest>,
) -> Result<Json<PreviewResponse>, ApiError> {
    let text = state
        .engine
        .generator()
        .preview(campaign_id, input.contact_id)
        .await
        .map_err(|e| engine_error("Preview message", e))?;

    Ok(Json(PreviewResponse {
        contact_id: input.contact_id,
        text,
    }))
}

/// Campaign statistics
///
/// GET /api/v1/campaigns/:campaign_id/stats
pub async fn get_campaign_stats(
    State(state): State<Arc<AppState>>,
    Path(campaign_id): Path<CampaignId>,
) -> Result<Json<CampaignStats>, ApiError> {
    let stats = state
        .engine
        .manager()
        .stats(campaign_id)
        .await
        .map_err(|e| engine_error("Get campaign stats", e))?;

    Ok(Json(stats))
}

/// Recipients still in generation or review
///
/// GET /api/v1/campaigns/:campaign_id/queue
pub async fn get_queue(
    State(state): State<Arc<AppState>>,
    Path(campaign_id): Path<CampaignId>,
    Query(query): Query<RecipientsQuery>,
) -> Result<Json<QueueResponse>, ApiError> {
    let queue = state
        .engine
        .review()
        .list_queue(campaign_id, Page::new(query.limit, query.offset))
        .await
        .map_err(|e| engine_error("List queue", e))?;

    Ok(Json(QueueResponse::from(queue)))
}

/// All recipients of a campaign, optionally filtered by status
///
/// GET /api/v1/campaigns/:campaign_id/recipients
pub async fn list_recipients(
    State(state): State<Arc<AppState>>,
    Path(campaign_id): Path<CampaignId>,
    Query(query): Query<RecipientsQuery>,
) -> Result<Json<Vec<RecipientResponse>>, ApiError> {
    let statuses = parse_statuses(query.status.as_deref())?;
    let ctx = state.engine.context();

    // 404 for unknown campaigns rather than an empty list
    state
        .engine
        .manager()
        .get(campaign_id)
        .await
        .map_err(|e| engine_error("List recipients", e))?;

    let recipients = ctx
        .recipients
        .list(campaign_id, &statuses, Page::new(query.limit, query.offset))
        .await
        .map_err(|e| engine_error("List recipients", e.into()))?;

    Ok(Json(
        recipients.into_iter().map(RecipientResponse::from).collect(),
    ))
}

fn parse_statuses(raw: Option<&str>) -> Result<Vec<RecipientStatus>, ApiError> {
    raw.unwrap_or_default()
        .split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(|s| s.parse::<RecipientStatus>())
        .collect::<Result<Vec<_>, _>>()
        .map_err(|e| validation_error(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_parse_statuses() {
        assert_eq!(parse_statuses(None).unwrap(), vec![]);
        assert_eq!(
            parse_statuses(Some("approved, sent")).unwrap(),
            vec![RecipientStatus::Approved, RecipientStatus::Sent]
        );
        assert!(parse_statuses(Some("approved,bogus")).is_err());
    }
}
