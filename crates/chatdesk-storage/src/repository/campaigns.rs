//! Campaign repository

use async_trait::async_trait;
use chatdesk_common::types::{CampaignId, Page};
use chatdesk_common::{Error, Result};
use chrono::{DateTime, Utc};
use tracing::debug;
use uuid::Uuid;

use super::db_err;
use crate::db::DatabasePool;
use crate::models::{
    Campaign, CampaignAction, CampaignCounters, CampaignStatus, CounterDrift, CreateCampaign,
    RecipientAction, RecipientStatus, UpdateCampaign,
};

/// Campaign repository trait
#[async_trait]
pub trait CampaignRepository: Send + Sync {
    /// Create a draft campaign with one pending recipient per distinct contact
    async fn create(&self, input: CreateCampaign) -> Result<Campaign>;
    async fn get(&self, id: CampaignId) -> Result<Option<Campaign>>;
    async fn list(&self, status: Option<CampaignStatus>, page: Page) -> Result<Vec<Campaign>>;
    async fn count(&self, status: Option<CampaignStatus>) -> Result<i64>;
    async fn list_ids_by_status(&self, status: CampaignStatus) -> Result<Vec<CampaignId>>;
    /// Update content fields; `None` when the campaign is missing or not editable
    async fn update(&self, id: CampaignId, input: UpdateCampaign) -> Result<Option<Campaign>>;
    /// Apply a status-changing action; `None` when the current status does not allow it
    async fn transition(&self, id: CampaignId, action: CampaignAction) -> Result<Option<Campaign>>;
    async fn schedule(&self, id: CampaignId, at: DateTime<Utc>) -> Result<Option<Campaign>>;
    /// Cancel and skip every recipient that has not reached a terminal or in-flight status
    async fn cancel(&self, id: CampaignId) -> Result<Option<(Campaign, u64)>>;
    /// Move a running campaign to completed once no recipient is left non-terminal
    async fn complete_if_drained(&self, id: CampaignId) -> Result<Option<Campaign>>;
    async fn scheduled_due(&self, now: DateTime<Utc>) -> Result<Vec<Campaign>>;
    /// Take the generation lease unless another holder's lease is still fresh
    async fn try_acquire_generation(&self, id: CampaignId, ttl: chrono::Duration) -> Result<bool>;
    async fn release_generation(&self, id: CampaignId) -> Result<()>;
    async fn clear_generation_flags(&self) -> Result<u64>;
    async fn delete(&self, id: CampaignId) -> Result<bool>;
    /// Recount counters from recipient rows, returning the drift if any was corrected
    async fn reconcile_counters(&self, id: CampaignId) -> Result<Option<CounterDrift>>;
}

/// Database campaign repository
#[derive(Clone)]
pub struct DbCampaignRepository {
    pool: DatabasePool,
}

impl DbCampaignRepository {
    pub fn new(pool: DatabasePool) -> Self {
        Self { pool }
    }
}

pub(crate) fn dedupe_contacts(ids: &[Uuid]) -> Vec<Uuid> {
    let mut seen = std::collections::HashSet::with_capacity(ids.len());
    ids.iter().copied().filter(|id| seen.insert(*id)).collect()
}

fn status_names(statuses: &[CampaignStatus]) -> Vec<String> {
    statuses.iter().map(|s| s.as_str().to_string()).collect()
}

const COUNT_FROM_RECIPIENTS: &str = r#"
    SELECT
        COUNT(*)::INT AS total_recipients,
        COUNT(*) FILTER (WHERE first_generated_at IS NOT NULL)::INT AS generated_count,
        COUNT(*) FILTER (WHERE status = 'sent')::INT AS sent_count,
        COUNT(*) FILTER (WHERE status = 'failed' AND failure_stage = 'delivery')::INT AS failed_count,
        COUNT(*) FILTER (WHERE status = 'failed' AND failure_stage IS DISTINCT FROM 'delivery')::INT
            AS generation_failed_count
    FROM blast_recipients
    WHERE campaign_id = $1
"#;

#[async_trait]
impl CampaignRepository for DbCampaignRepository {
    async fn create(&self, input: CreateCampaign) -> Result<Campaign> {
        let id = Uuid::now_v7();
        let contacts = dedupe_contacts(&input.contact_ids);
        let recipient_ids: Vec<Uuid> = contacts.iter().map(|_| Uuid::now_v7()).collect();

        let mut tx = self.pool.pool().begin().await.map_err(db_err)?;

        sqlx::query(
            r#"
            INSERT INTO blast_campaigns (
                id, name, prompt, template_ref, min_interval_secs, max_interval_secs,
                status, created_by
            )
            VALUES ($1, $2, $3, $4, $5, $6, 'draft', $7)
            "#,
        )
        .bind(id)
        .bind(&input.name)
        .bind(&input.prompt)
        .bind(&input.template_ref)
        .bind(input.min_interval_secs)
        .bind(input.max_interval_secs)
        .bind(&input.created_by)
        .execute(&mut *tx)
        .await
        .map_err(db_err)?;

        let inserted = sqlx::query(
            r#"
            INSERT INTO blast_recipients (id, campaign_id, contact_id, status)
            SELECT rid, $1, cid, 'pending'
            FROM UNNEST($2::uuid[], $3::uuid[]) AS t(rid, cid)
            ON CONFLICT (campaign_id, contact_id) DO NOTHING
            "#,
        )
        .bind(id)
        .bind(&recipient_ids)
        .bind(&contacts)
        .execute(&mut *tx)
        .await
        .map_err(db_err)?
        .rows_affected();

        let campaign = sqlx::query_as::<_, Campaign>(
            "UPDATE blast_campaigns SET total_recipients = $2 WHERE id = $1 RETURNING *",
        )
        .bind(id)
        .bind(inserted as i32)
        .fetch_one(&mut *tx)
        .await
        .map_err(db_err)?;

        tx.commit().await.map_err(db_err)?;

        debug!(campaign_id = %id, recipients = inserted, "Campaign rows created");
        Ok(campaign)
    }

    async fn get(&self, id: CampaignId) -> Result<Option<Campaign>> {
        sqlx::query_as::<_, Campaign>("SELECT * FROM blast_campaigns WHERE id = $1")
            .bind(id)
            .fetch_optional(self.pool.pool())
            .await
            .map_err(db_err)
    }

    async fn list(&self, status: Option<CampaignStatus>, page: Page) -> Result<Vec<Campaign>> {
        sqlx::query_as::<_, Campaign>(
            r#"
            SELECT * FROM blast_campaigns
            WHERE ($1::TEXT IS NULL OR status = $1)
            ORDER BY created_at DESC
            LIMIT $2 OFFSET $3
            "#,
        )
        .bind(status.map(|s| s.as_str()))
        .bind(page.limit)
        .bind(page.offset)
        .fetch_all(self.pool.pool())
        .await
        .map_err(db_err)
    }

    async fn count(&self, status: Option<CampaignStatus>) -> Result<i64> {
        let row: (i64,) = sqlx::query_as(
            "SELECT COUNT(*) FROM blast_campaigns WHERE ($1::TEXT IS NULL OR status = $1)",
        )
        .bind(status.map(|s| s.as_str()))
        .fetch_one(self.pool.pool())
        .await
        .map_err(db_err)?;
        Ok(row.0)
    }

    async fn list_ids_by_status(&self, status: CampaignStatus) -> Result<Vec<CampaignId>> {
        let rows: Vec<(Uuid,)> =
            sqlx::query_as("SELECT id FROM blast_campaigns WHERE status = $1 ORDER BY created_at")
                .bind(status.as_str())
                .fetch_all(self.pool.pool())
                .await
                .map_err(db_err)?;
        Ok(rows.into_iter().map(|(id,)| id).collect())
    }

    async fn update(&self, id: CampaignId, input: UpdateCampaign) -> Result<Option<Campaign>> {
        sqlx::query_as::<_, Campaign>(
            r#"
            UPDATE blast_campaigns SET
                name = COALESCE($3, name),
                prompt = COALESCE($4, prompt),
                template_ref = COALESCE($5, template_ref),
                min_interval_secs = COALESCE($6, min_interval_secs),
                max_interval_secs = COALESCE($7, max_interval_secs),
                updated_at = NOW()
            WHERE id = $1 AND status = ANY($2)
            RETURNING *
            "#,
        )
        .bind(id)
        .bind(status_names(CampaignAction::Update.sources()))
        .bind(&input.name)
        .bind(&input.prompt)
        .bind(&input.template_ref)
        .bind(input.min_interval_secs)
        .bind(input.max_interval_secs)
        .fetch_optional(self.pool.pool())
        .await
        .map_err(db_err)
    }

    async fn transition(&self, id: CampaignId, action: CampaignAction) -> Result<Option<Campaign>> {
        let target = action.target().ok_or_else(|| {
            Error::Internal(format!("'{}' does not change campaign status", action.as_str()))
        })?;

        sqlx::query_as::<_, Campaign>(
            r#"
            UPDATE blast_campaigns SET
                status = $3,
                started_at = CASE WHEN $3 = 'running' THEN COALESCE(started_at, NOW()) ELSE started_at END,
                completed_at = CASE WHEN $3 IN ('completed', 'cancelled') THEN NOW() ELSE completed_at END,
                updated_at = NOW()
            WHERE id = $1 AND status = ANY($2)
            RETURNING *
            "#,
        )
        .bind(id)
        .bind(status_names(action.sources()))
        .bind(target.as_str())
        .fetch_optional(self.pool.pool())
        .await
        .map_err(db_err)
    }

    async fn schedule(&self, id: CampaignId, at: DateTime<Utc>) -> Result<Option<Campaign>> {
        sqlx::query_as::<_, Campaign>(
            r#"
            UPDATE blast_campaigns SET status = 'scheduled', scheduled_at = $3, updated_at = NOW()
            WHERE id = $1 AND status = ANY($2)
            RETURNING *
            "#,
        )
        .bind(id)
        .bind(status_names(CampaignAction::Schedule.sources()))
        .bind(at)
        .fetch_optional(self.pool.pool())
        .await
        .map_err(db_err)
    }

    async fn cancel(&self, id: CampaignId) -> Result<Option<(Campaign, u64)>> {
        let mut tx = self.pool.pool().begin().await.map_err(db_err)?;

        let campaign = sqlx::query_as::<_, Campaign>(
            r#"
            UPDATE blast_campaigns SET status = 'cancelled', completed_at = NOW(), updated_at = NOW()
            WHERE id = $1 AND status = ANY($2)
            RETURNING *
            "#,
        )
        .bind(id)
        .bind(status_names(CampaignAction::Cancel.sources()))
        .fetch_optional(&mut *tx)
        .await
        .map_err(db_err)?;

        let Some(campaign) = campaign else {
            tx.rollback().await.map_err(db_err)?;
            return Ok(None);
        };

        let skipped = sqlx::query(
            r#"
            UPDATE blast_recipients SET status = 'skipped', updated_at = NOW()
            WHERE campaign_id = $1 AND status = ANY($2)
            "#,
        )
        .bind(id)
        .bind(RecipientAction::Cancel.source_names())
        .execute(&mut *tx)
        .await
        .map_err(db_err)?
        .rows_affected();

        tx.commit().await.map_err(db_err)?;
        Ok(Some((campaign, skipped)))
    }

    async fn complete_if_drained(&self, id: CampaignId) -> Result<Option<Campaign>> {
        let finished: Vec<String> = RecipientStatus::ALL
            .iter()
            .filter(|s| s.is_terminal())
            .map(|s| s.as_str().to_string())
            .collect();

        sqlx::query_as::<_, Campaign>(
            r#"
            UPDATE blast_campaigns SET status = 'completed', completed_at = NOW(), updated_at = NOW()
            WHERE id = $1 AND status = 'running'
              AND NOT EXISTS (
                  SELECT 1 FROM blast_recipients
                  WHERE campaign_id = $1 AND NOT (status = ANY($2))
              )
            RETURNING *
            "#,
        )
        .bind(id)
        .bind(finished)
        .fetch_optional(self.pool.pool())
        .await
        .map_err(db_err)
    }

    async fn scheduled_due(&self, now: DateTime<Utc>) -> Result<Vec<Campaign>> {
        sqlx::query_as::<_, Campaign>(
            r#"
            SELECT * FROM blast_campaigns
            WHERE status = 'scheduled' AND scheduled_at <= $1
            ORDER BY scheduled_at ASC
            "#,
        )
        .bind(now)
        .fetch_all(self.pool.pool())
        .await
        .map_err(db_err)
    }

    async fn try_acquire_generation(&self, id: CampaignId, ttl: chrono::Duration) -> Result<bool> {
        let stale_before = Utc::now() - ttl;
        let result = sqlx::query(
            r#"
            UPDATE blast_campaigns SET is_generating = TRUE, generation_started_at = NOW(), updated_at = NOW()
            WHERE id = $1
              AND (is_generating = FALSE OR generation_started_at IS NULL OR generation_started_at < $2)
            "#,
        )
        .bind(id)
        .bind(stale_before)
        .execute(self.pool.pool())
        .await
        .map_err(db_err)?;

        Ok(result.rows_affected() > 0)
    }

    async fn release_generation(&self, id: CampaignId) -> Result<()> {
        sqlx::query(
            r#"
            UPDATE blast_campaigns SET is_generating = FALSE, generation_started_at = NULL, updated_at = NOW()
            WHERE id = $1
            "#,
        )
        .bind(id)
        .execute(self.pool.pool())
        .await
        .map_err(db_err)?;
        Ok(())
    }

    async fn clear_generation_flags(&self) -> Result<u64> {
        let result = sqlx::query(
            r#"
            UPDATE blast_campaigns SET is_generating = FALSE, generation_started_at = NULL, updated_at = NOW()
            WHERE is_generating = TRUE
            "#,
        )
        .execute(self.pool.pool())
        .await
        .map_err(db_err)?;
        Ok(result.rows_affected())
    }

    async fn delete(&self, id: CampaignId) -> Result<bool> {
        let result = sqlx::query("DELETE FROM blast_campaigns WHERE id = $1 AND status = ANY($2)")
            .bind(id)
            .bind(status_names(CampaignAction::Delete.sources()))
            .execute(self.pool.pool())
            .await
            .map_err(db_err)?;

        Ok(result.rows_affected() > 0)
    }

    async fn reconcile_counters(&self, id: CampaignId) -> Result<Option<CounterDrift>> {
        let mut tx = self.pool.pool().begin().await.map_err(db_err)?;

        let campaign = sqlx::query_as::<_, Campaign>(
            "SELECT * FROM blast_campaigns WHERE id = $1 FOR UPDATE",
        )
        .bind(id)
        .fetch_optional(&mut *tx)
        .await
        .map_err(db_err)?;

        let Some(campaign) = campaign else {
            tx.rollback().await.map_err(db_err)?;
            return Ok(None);
        };

        let actual = sqlx::query_as::<_, CampaignCounters>(COUNT_FROM_RECIPIENTS)
            .bind(id)
            .fetch_one(&mut *tx)
            .await
            .map_err(db_err)?;

        let before = campaign.counters();
        if before == actual {
            tx.rollback().await.map_err(db_err)?;
            return Ok(None);
        }

        sqlx::query(
            r#"
            UPDATE blast_campaigns SET
                total_recipients = $2,
                generated_count = $3,
                sent_count = $4,
                failed_count = $5,
                generation_failed_count = $6,
                updated_at = NOW()
            WHERE id = $1
            "#,
        )
        .bind(id)
        .bind(actual.total_recipients)
        .bind(actual.generated_count)
        .bind(actual.sent_count)
        .bind(actual.failed_count)
        .bind(actual.generation_failed_count)
        .execute(&mut *tx)
        .await
        .map_err(db_err)?;

        tx.commit().await.map_err(db_err)?;

        Ok(Some(CounterDrift {
            campaign_id: id,
            before,
            after: actual,
        }))
    }
}
