//! Recipient repository
//!
//! Every status change locks the recipient row, checks the current status
//! against the action's allowed sources, writes the new status and adjusts the
//! owning campaign's counters in the same transaction. Methods return `None`
//! when the row is missing or its status does not allow the action.

use async_trait::async_trait;
use chatdesk_common::types::{CampaignId, ConversationId, OperatorId, Page, RecipientId};
use chatdesk_common::Result;
use chrono::{DateTime, Utc};
use sqlx::{Postgres, Transaction};

use super::db_err;
use crate::db::DatabasePool;
use crate::models::{
    CampaignAction, CampaignStatus, CounterDelta, FailureStage, Recipient, RecipientAction, RecipientCounts,
    RecipientStatus, StuckRecovery,
};

/// Note stored on recipients whose dispatch was interrupted by a restart
pub const INTERRUPTED_SEND_NOTE: &str =
    "Dispatch interrupted before the channel confirmed delivery; re-queued for sending";

/// Note stored on interrupted dispatches whose campaign had already ended
pub const ABANDONED_SEND_NOTE: &str =
    "Dispatch interrupted before the channel confirmed delivery; campaign had already ended";

/// Recipient repository trait
#[async_trait]
pub trait RecipientRepository: Send + Sync {
    async fn get(&self, id: RecipientId) -> Result<Option<Recipient>>;
    /// List recipients of a campaign, optionally filtered to a set of statuses
    async fn list(
        &self,
        campaign_id: CampaignId,
        statuses: &[RecipientStatus],
        page: Page,
    ) -> Result<Vec<Recipient>>;
    async fn count_by_status(&self, campaign_id: CampaignId) -> Result<RecipientCounts>;

    /// Claim up to `limit` pending recipients for generation
    async fn claim_pending(&self, campaign_id: CampaignId, limit: i64) -> Result<Vec<Recipient>>;
    async fn complete_generation(&self, id: RecipientId, text: &str) -> Result<Option<Recipient>>;
    async fn fail_generation(&self, id: RecipientId, error: &str) -> Result<Option<Recipient>>;
    /// Return a claimed recipient to pending without counting an attempt
    async fn release_claim(&self, id: RecipientId) -> Result<Option<Recipient>>;

    async fn approve(
        &self,
        id: RecipientId,
        reviewer: &OperatorId,
        override_text: Option<&str>,
    ) -> Result<Option<Recipient>>;
    async fn edit(&self, id: RecipientId, text: &str) -> Result<Option<Recipient>>;
    async fn skip(&self, id: RecipientId) -> Result<Option<Recipient>>;
    async fn regenerate(&self, id: RecipientId) -> Result<Option<Recipient>>;
    /// Send a delivery-failed recipient again with its existing text
    async fn retry_delivery(&self, id: RecipientId) -> Result<Option<Recipient>>;
    async fn set_schedule(
        &self,
        id: RecipientId,
        at: Option<DateTime<Utc>>,
    ) -> Result<Option<Recipient>>;

    /// Oldest approved recipient that is due, by approval time
    async fn next_approved(
        &self,
        campaign_id: CampaignId,
        now: DateTime<Utc>,
    ) -> Result<Option<Recipient>>;
    /// Mark an approved recipient as sending, only while its campaign is running
    async fn mark_sending(&self, id: RecipientId) -> Result<Option<Recipient>>;
    async fn mark_sent(
        &self,
        id: RecipientId,
        external_message_id: &str,
        conversation_id: Option<ConversationId>,
    ) -> Result<Option<Recipient>>;
    async fn mark_delivery_failed(&self, id: RecipientId, error: &str) -> Result<Option<Recipient>>;

    /// Reset rows left mid-generation or mid-dispatch by a previous process
    async fn recover_stuck(&self) -> Result<StuckRecovery>;
}

/// Database recipient repository
#[derive(Clone)]
pub struct DbRecipientRepository {
    pool: DatabasePool,
}

impl DbRecipientRepository {
    pub fn new(pool: DatabasePool) -> Self {
        Self { pool }
    }

    async fn lock(
        tx: &mut Transaction<'_, Postgres>,
        id: RecipientId,
        action: RecipientAction,
    ) -> Result<Option<Recipient>> {
        sqlx::query_as::<_, Recipient>(
            "SELECT * FROM blast_recipients WHERE id = $1 AND status = ANY($2) FOR UPDATE",
        )
        .bind(id)
        .bind(action.source_names())
        .fetch_optional(&mut **tx)
        .await
        .map_err(db_err)
    }

    async fn bump(
        tx: &mut Transaction<'_, Postgres>,
        campaign_id: CampaignId,
        delta: CounterDelta,
    ) -> Result<()> {
        if delta.is_zero() {
            return Ok(());
        }

        sqlx::query(
            r#"
            UPDATE blast_campaigns SET
                generated_count = generated_count + $2,
                sent_count = sent_count + $3,
                failed_count = failed_count + $4,
                generation_failed_count = generation_failed_count + $5,
                updated_at = NOW()
            WHERE id = $1
            "#,
        )
        .bind(campaign_id)
        .bind(delta.generated)
        .bind(delta.sent)
        .bind(delta.failed)
        .bind(delta.generation_failed)
        .execute(&mut **tx)
        .await
        .map_err(db_err)?;
        Ok(())
    }

    /// Run one guarded transition: lock, update, adjust counters, commit
    async fn apply<F>(&self, id: RecipientId, action: RecipientAction, update: F) -> Result<Option<Recipient>>
    where
        F: for<'r> FnOnce(&'r Recipient) -> Option<(sqlx::query::QueryAs<'static, Postgres, Recipient, sqlx::postgres::PgArguments>, CounterDelta)>
            + Send,
    {
        let mut tx = self.pool.pool().begin().await.map_err(db_err)?;

        let Some(current) = Self::lock(&mut tx, id, action).await? else {
            tx.rollback().await.map_err(db_err)?;
            return Ok(None);
        };

        let Some((query, delta)) = update(&current) else {
            tx.rollback().await.map_err(db_err)?;
            return Ok(None);
        };

        let updated = query.fetch_one(&mut *tx).await.map_err(db_err)?;
        Self::bump(&mut tx, current.campaign_id, delta).await?;
        tx.commit().await.map_err(db_err)?;

        Ok(Some(updated))
    }
}

fn status_names(statuses: &[RecipientStatus]) -> Vec<String> {
    statuses.iter().map(|s| s.as_str().to_string()).collect()
}

#[async_trait]
impl RecipientRepository for DbRecipientRepository {
    async fn get(&self, id: RecipientId) -> Result<Option<Recipient>> {
        sqlx::query_as::<_, Recipient>("SELECT * FROM blast_recipients WHERE id = $1")
            .bind(id)
            .fetch_optional(self.pool.pool())
            .await
            .map_err(db_err)
    }

    async fn list(
        &self,
        campaign_id: CampaignId,
        statuses: &[RecipientStatus],
        page: Page,
    ) -> Result<Vec<Recipient>> {
        let filter = if statuses.is_empty() {
            None
        } else {
            Some(status_names(statuses))
        };

        sqlx::query_as::<_, Recipient>(
            r#"
            SELECT * FROM blast_recipients
            WHERE campaign_id = $1 AND ($2::TEXT[] IS NULL OR status = ANY($2))
            ORDER BY created_at ASC, id ASC
            LIMIT $3 OFFSET $4
            "#,
        )
        .bind(campaign_id)
        .bind(filter)
        .bind(page.limit)
        .bind(page.offset)
        .fetch_all(self.pool.pool())
        .await
        .map_err(db_err)
    }

    async fn count_by_status(&self, campaign_id: CampaignId) -> Result<RecipientCounts> {
        sqlx::query_as::<_, RecipientCounts>(
            r#"
            SELECT
                COUNT(*) FILTER (WHERE status = 'pending') AS pending,
                COUNT(*) FILTER (WHERE status = 'generating') AS generating,
                COUNT(*) FILTER (WHERE status = 'awaiting_review') AS awaiting_review,
                COUNT(*) FILTER (WHERE status = 'approved') AS approved,
                COUNT(*) FILTER (WHERE status = 'sending') AS sending,
                COUNT(*) FILTER (WHERE status = 'sent') AS sent,
                COUNT(*) FILTER (WHERE status = 'failed') AS failed,
                COUNT(*) FILTER (WHERE status = 'skipped') AS skipped
            FROM blast_recipients
            WHERE campaign_id = $1
            "#,
        )
        .bind(campaign_id)
        .fetch_one(self.pool.pool())
        .await
        .map_err(db_err)
    }

    async fn claim_pending(&self, campaign_id: CampaignId, limit: i64) -> Result<Vec<Recipient>> {
        let generatable: Vec<String> = CampaignAction::Generate
            .sources()
            .iter()
            .map(|s| s.as_str().to_string())
            .collect();

        let mut claimed = sqlx::query_as::<_, Recipient>(
            r#"
            UPDATE blast_recipients SET status = 'generating', updated_at = NOW()
            WHERE id IN (
                SELECT r.id FROM blast_recipients r
                JOIN blast_campaigns c ON c.id = r.campaign_id
                WHERE r.campaign_id = $1 AND r.status = 'pending' AND c.status = ANY($3)
                ORDER BY r.created_at ASC, r.id ASC
                LIMIT $2
                FOR UPDATE OF r SKIP LOCKED
            )
            AND status = 'pending'
            RETURNING *
            "#,
        )
        .bind(campaign_id)
        .bind(limit)
        .bind(generatable)
        .fetch_all(self.pool.pool())
        .await
        .map_err(db_err)?;

        claimed.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.id.cmp(&b.id)));
        Ok(claimed)
    }

    async fn complete_generation(&self, id: RecipientId, text: &str) -> Result<Option<Recipient>> {
        let text = text.to_string();
        self.apply(id, RecipientAction::CompleteGeneration, move |current| {
            let delta = CounterDelta {
                generated: i32::from(current.first_generated_at.is_none()),
                ..Default::default()
            };
            let query = sqlx::query_as::<_, Recipient>(
                r#"
                UPDATE blast_recipients SET
                    status = 'awaiting_review',
                    generated_text = $2,
                    generated_at = NOW(),
                    first_generated_at = COALESCE(first_generated_at, NOW()),
                    error_message = NULL,
                    failure_stage = NULL,
                    updated_at = NOW()
                WHERE id = $1
                RETURNING *
                "#,
            )
            .bind(id)
            .bind(text);
            Some((query, delta))
        })
        .await
    }

    async fn fail_generation(&self, id: RecipientId, error: &str) -> Result<Option<Recipient>> {
        let error = error.to_string();
        self.apply(id, RecipientAction::FailGeneration, move |_| {
            let query = sqlx::query_as::<_, Recipient>(
                r#"
                UPDATE blast_recipients SET
                    status = 'failed',
                    error_message = $2,
                    failure_stage = 'generation',
                    retry_count = retry_count + 1,
                    updated_at = NOW()
                WHERE id = $1
                RETURNING *
                "#,
            )
            .bind(id)
            .bind(error);
            let delta = CounterDelta {
                generation_failed: 1,
                ..Default::default()
            };
            Some((query, delta))
        })
        .await
    }

    async fn release_claim(&self, id: RecipientId) -> Result<Option<Recipient>> {
        self.apply(id, RecipientAction::ReleaseClaim, move |_| {
            let query = sqlx::query_as::<_, Recipient>(
                "UPDATE blast_recipients SET status = 'pending', updated_at = NOW() WHERE id = $1 RETURNING *",
            )
            .bind(id);
            Some((query, CounterDelta::default()))
        })
        .await
    }

    async fn approve(
        &self,
        id: RecipientId,
        reviewer: &OperatorId,
        override_text: Option<&str>,
    ) -> Result<Option<Recipient>> {
        let reviewer = reviewer.as_str().to_string();
        let override_text = override_text.map(str::to_string);
        self.apply(id, RecipientAction::Approve, move |_| {
            let query = sqlx::query_as::<_, Recipient>(
                r#"
                UPDATE blast_recipients SET
                    status = 'approved',
                    approved_by = $2,
                    approved_at = NOW(),
                    override_text = COALESCE($3, override_text),
                    updated_at = NOW()
                WHERE id = $1
                RETURNING *
                "#,
            )
            .bind(id)
            .bind(reviewer)
            .bind(override_text);
            Some((query, CounterDelta::default()))
        })
        .await
    }

    async fn edit(&self, id: RecipientId, text: &str) -> Result<Option<Recipient>> {
        let text = text.to_string();
        self.apply(id, RecipientAction::Edit, move |_| {
            let query = sqlx::query_as::<_, Recipient>(
                "UPDATE blast_recipients SET override_text = $2, updated_at = NOW() WHERE id = $1 RETURNING *",
            )
            .bind(id)
            .bind(text);
            Some((query, CounterDelta::default()))
        })
        .await
    }

    async fn skip(&self, id: RecipientId) -> Result<Option<Recipient>> {
        self.apply(id, RecipientAction::Skip, move |_| {
            let query = sqlx::query_as::<_, Recipient>(
                "UPDATE blast_recipients SET status = 'skipped', updated_at = NOW() WHERE id = $1 RETURNING *",
            )
            .bind(id);
            Some((query, CounterDelta::default()))
        })
        .await
    }

    async fn regenerate(&self, id: RecipientId) -> Result<Option<Recipient>> {
        self.apply(id, RecipientAction::Regenerate, move |current| {
            let delta = if current.status == RecipientStatus::Failed {
                CounterDelta::leaving_failure(current.failure_stage())
            } else {
                CounterDelta::default()
            };
            let query = sqlx::query_as::<_, Recipient>(
                r#"
                UPDATE blast_recipients SET
                    status = 'pending',
                    generated_text = NULL,
                    override_text = NULL,
                    generated_at = NULL,
                    approved_by = NULL,
                    approved_at = NULL,
                    error_message = NULL,
                    failure_stage = NULL,
                    updated_at = NOW()
                WHERE id = $1
                RETURNING *
                "#,
            )
            .bind(id);
            Some((query, delta))
        })
        .await
    }

    async fn retry_delivery(&self, id: RecipientId) -> Result<Option<Recipient>> {
        self.apply(id, RecipientAction::RetryDelivery, move |current| {
            if current.failure_stage() != Some(FailureStage::Delivery) || current.final_text().is_none() {
                return None;
            }
            let query = sqlx::query_as::<_, Recipient>(
                r#"
                UPDATE blast_recipients SET
                    status = 'approved',
                    error_message = NULL,
                    failure_stage = NULL,
                    updated_at = NOW()
                WHERE id = $1
                RETURNING *
                "#,
            )
            .bind(id);
            Some((query, CounterDelta::leaving_failure(Some(FailureStage::Delivery))))
        })
        .await
    }

    async fn set_schedule(
        &self,
        id: RecipientId,
        at: Option<DateTime<Utc>>,
    ) -> Result<Option<Recipient>> {
        self.apply(id, RecipientAction::Reschedule, move |_| {
            let query = sqlx::query_as::<_, Recipient>(
                "UPDATE blast_recipients SET scheduled_at = $2, updated_at = NOW() WHERE id = $1 RETURNING *",
            )
            .bind(id)
            .bind(at);
            Some((query, CounterDelta::default()))
        })
        .await
    }

    async fn next_approved(
        &self,
        campaign_id: CampaignId,
        now: DateTime<Utc>,
    ) -> Result<Option<Recipient>> {
        sqlx::query_as::<_, Recipient>(
            r#"
            SELECT * FROM blast_recipients
            WHERE campaign_id = $1
              AND status = 'approved'
              AND (scheduled_at IS NULL OR scheduled_at <= $2)
            ORDER BY approved_at ASC NULLS LAST, created_at ASC, id ASC
            LIMIT 1
            "#,
        )
        .bind(campaign_id)
        .bind(now)
        .fetch_optional(self.pool.pool())
        .await
        .map_err(db_err)
    }

    async fn mark_sending(&self, id: RecipientId) -> Result<Option<Recipient>> {
        sqlx::query_as::<_, Recipient>(
            r#"
            UPDATE blast_recipients r SET status = 'sending', updated_at = NOW()
            WHERE r.id = $1
              AND r.status = ANY($2)
              AND EXISTS (
                  SELECT 1 FROM blast_campaigns c
                  WHERE c.id = r.campaign_id AND c.status = 'running'
              )
            RETURNING r.*
            "#,
        )
        .bind(id)
        .bind(RecipientAction::Dispatch.source_names())
        .fetch_optional(self.pool.pool())
        .await
        .map_err(db_err)
    }

    async fn mark_sent(
        &self,
        id: RecipientId,
        external_message_id: &str,
        conversation_id: Option<ConversationId>,
    ) -> Result<Option<Recipient>> {
        let external_message_id = external_message_id.to_string();
        self.apply(id, RecipientAction::Deliver, move |_| {
            let query = sqlx::query_as::<_, Recipient>(
                r#"
                UPDATE blast_recipients SET
                    status = 'sent',
                    sent_at = NOW(),
                    external_message_id = $2,
                    conversation_id = COALESCE($3, conversation_id),
                    error_message = NULL,
                    updated_at = NOW()
                WHERE id = $1
                RETURNING *
                "#,
            )
            .bind(id)
            .bind(external_message_id)
            .bind(conversation_id);
            let delta = CounterDelta {
                sent: 1,
                ..Default::default()
            };
            Some((query, delta))
        })
        .await
    }

    async fn mark_delivery_failed(&self, id: RecipientId, error: &str) -> Result<Option<Recipient>> {
        let error = error.to_string();
        self.apply(id, RecipientAction::FailDelivery, move |_| {
            let query = sqlx::query_as::<_, Recipient>(
                r#"
                UPDATE blast_recipients SET
                    status = 'failed',
                    error_message = $2,
                    failure_stage = 'delivery',
                    retry_count = retry_count + 1,
                    updated_at = NOW()
                WHERE id = $1
                RETURNING *
                "#,
            )
            .bind(id)
            .bind(error);
            let delta = CounterDelta {
                failed: 1,
                ..Default::default()
            };
            Some((query, delta))
        })
        .await
    }

    async fn recover_stuck(&self) -> Result<StuckRecovery> {
        let mut tx = self.pool.pool().begin().await.map_err(db_err)?;

        let generating_reset = sqlx::query(
            "UPDATE blast_recipients SET status = 'pending', updated_at = NOW() WHERE status = ANY($1)",
        )
        .bind(RecipientAction::RecoverGeneration.source_names())
        .execute(&mut *tx)
        .await
        .map_err(db_err)?
        .rows_affected();

        let ended: Vec<String> = CampaignStatus::ALL
            .iter()
            .filter(|s| s.is_terminal())
            .map(|s| s.as_str().to_string())
            .collect();

        // Campaigns that ended mid-send never dispatch again, so the row fails
        let sending_failed: i64 = sqlx::query_scalar(
            r#"
            WITH abandoned AS (
                UPDATE blast_recipients r SET
                    status = 'failed',
                    error_message = $2,
                    failure_stage = 'delivery',
                    retry_count = r.retry_count + 1,
                    updated_at = NOW()
                FROM blast_campaigns c
                WHERE r.campaign_id = c.id
                  AND r.status = ANY($1)
                  AND c.status = ANY($3)
                RETURNING r.campaign_id
            ),
            per_campaign AS (
                SELECT campaign_id, COUNT(*) AS n FROM abandoned GROUP BY campaign_id
            ),
            bumped AS (
                UPDATE blast_campaigns c SET
                    failed_count = c.failed_count + p.n,
                    updated_at = NOW()
                FROM per_campaign p
                WHERE c.id = p.campaign_id
                RETURNING p.n
            )
            SELECT COALESCE(SUM(n), 0)::BIGINT FROM bumped
            "#,
        )
        .bind(RecipientAction::AbandonDispatch.source_names())
        .bind(ABANDONED_SEND_NOTE)
        .bind(&ended)
        .fetch_one(&mut *tx)
        .await
        .map_err(db_err)?;

        let sending_reset = sqlx::query(
            r#"
            UPDATE blast_recipients r SET status = 'approved', error_message = $2, updated_at = NOW()
            FROM blast_campaigns c
            WHERE r.campaign_id = c.id
              AND r.status = ANY($1)
              AND c.status <> ALL($3)
            "#,
        )
        .bind(RecipientAction::RecoverDispatch.source_names())
        .bind(INTERRUPTED_SEND_NOTE)
        .bind(&ended)
        .execute(&mut *tx)
        .await
        .map_err(db_err)?
        .rows_affected();

        tx.commit().await.map_err(db_err)?;

        Ok(StuckRecovery {
            generating_reset,
            sending_reset,
            sending_failed: sending_failed as u64,
        })
    }
}
