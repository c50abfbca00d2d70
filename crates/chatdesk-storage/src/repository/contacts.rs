//! Contact directory
//!
//! Contacts and conversations belong to the helpdesk inbox. The blast engine
//! only reads contacts and opens a conversation the first time it messages one.

use async_trait::async_trait;
use chatdesk_common::types::{ContactId, ConversationId};
use chatdesk_common::Result;
use uuid::Uuid;

use super::db_err;
use crate::db::DatabasePool;
use crate::models::{Contact, CreateContact};

/// Contact directory trait
#[async_trait]
pub trait ContactDirectory: Send + Sync {
    async fn get(&self, id: ContactId) -> Result<Option<Contact>>;
    /// Fetch several contacts; missing ids are simply absent from the result
    async fn get_many(&self, ids: &[ContactId]) -> Result<Vec<Contact>>;
    async fn create(&self, input: CreateContact) -> Result<Contact>;
    /// Return the contact's most recent conversation, opening one if none exists
    async fn ensure_conversation(&self, contact_id: ContactId) -> Result<ConversationId>;
}

/// Database contact directory
#[derive(Clone)]
pub struct DbContactDirectory {
    pool: DatabasePool,
}

impl DbContactDirectory {
    pub fn new(pool: DatabasePool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl ContactDirectory for DbContactDirectory {
    async fn get(&self, id: ContactId) -> Result<Option<Contact>> {
        sqlx::query_as::<_, Contact>("SELECT * FROM contacts WHERE id = $1")
            .bind(id)
            .fetch_optional(self.pool.pool())
            .await
            .map_err(db_err)
    }

    async fn get_many(&self, ids: &[ContactId]) -> Result<Vec<Contact>> {
        if ids.is_empty() {
            return Ok(Vec::new());
        }

        sqlx::query_as::<_, Contact>("SELECT * FROM contacts WHERE id = ANY($1)")
            .bind(ids)
            .fetch_all(self.pool.pool())
            .await
            .map_err(db_err)
    }

    async fn create(&self, input: CreateContact) -> Result<Contact> {
        let attributes = input.attributes.unwrap_or_else(|| serde_json::json!({}));

        sqlx::query_as::<_, Contact>(
            r#"
            INSERT INTO contacts (id, name, phone, email, attributes)
            VALUES ($1, $2, $3, $4, $5)
            RETURNING *
            "#,
        )
        .bind(Uuid::now_v7())
        .bind(&input.name)
        .bind(&input.phone)
        .bind(&input.email)
        .bind(&attributes)
        .fetch_one(self.pool.pool())
        .await
        .map_err(db_err)
    }

    async fn ensure_conversation(&self, contact_id: ContactId) -> Result<ConversationId> {
        let mut tx = self.pool.pool().begin().await.map_err(db_err)?;

        // Serialise concurrent openers for the same contact
        sqlx::query("SELECT id FROM contacts WHERE id = $1 FOR UPDATE")
            .bind(contact_id)
            .execute(&mut *tx)
            .await
            .map_err(db_err)?;

        let existing: Option<(Uuid,)> = sqlx::query_as(
            "SELECT id FROM conversations WHERE contact_id = $1 ORDER BY updated_at DESC LIMIT 1",
        )
        .bind(contact_id)
        .fetch_optional(&mut *tx)
        .await
        .map_err(db_err)?;

        let id = match existing {
            Some((id,)) => id,
            None => {
                let id = Uuid::now_v7();
                sqlx::query(
                    "INSERT INTO conversations (id, contact_id, channel, status) VALUES ($1, $2, 'blast', 'open')",
                )
                .bind(id)
                .bind(contact_id)
                .execute(&mut *tx)
                .await
                .map_err(db_err)?;
                id
            }
        };

        tx.commit().await.map_err(db_err)?;
        Ok(id)
    }
}
