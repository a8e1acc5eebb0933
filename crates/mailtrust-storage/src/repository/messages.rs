//! Message repository

use crate::db::{map_db_err, DatabasePool};
use crate::models::{CreateMessage, Message};
use async_trait::async_trait;
use mailtrust_common::types::{MailboxId, MessageId};
use mailtrust_common::Result;
use uuid::Uuid;

/// Message repository trait
#[async_trait]
pub trait MessageRepository: Send + Sync {
    /// Create a new message
    async fn create(&self, input: CreateMessage) -> Result<Message>;

    /// Get a message by ID
    async fn get(&self, id: MessageId) -> Result<Option<Message>>;

    /// List messages in a mailbox, newest first
    async fn list_for_mailbox(&self, mailbox_id: MailboxId, limit: i64) -> Result<Vec<Message>>;
}

/// PostgreSQL message repository implementation
pub struct DbMessageRepository {
    pool: DatabasePool,
}

impl DbMessageRepository {
    /// Create a new repository
    pub fn new(pool: DatabasePool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl MessageRepository for DbMessageRepository {
    async fn create(&self, input: CreateMessage) -> Result<Message> {
        let now = chrono::Utc::now();
        sqlx::query_as::<_, Message>(
            r#"
            INSERT INTO messages (
                id, mailbox_id, from_address, to_address, subject,
                text_body, html_body, dkim_verified, direction, received_at, created_at
            ) VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $10)
            RETURNING *
            "#,
        )
        .bind(Uuid::now_v7())
        .bind(input.mailbox_id)
        .bind(&input.from_address)
        .bind(&input.to_address)
        .bind(&input.subject)
        .bind(&input.text_body)
        .bind(&input.html_body)
        .bind(input.dkim_verified)
        .bind(input.direction.to_string())
        .bind(now)
        .fetch_one(self.pool.pool())
        .await
        .map_err(map_db_err)
    }

    async fn get(&self, id: MessageId) -> Result<Option<Message>> {
        sqlx::query_as::<_, Message>("SELECT * FROM messages WHERE id = $1")
            .bind(id)
            .fetch_optional(self.pool.pool())
            .await
            .map_err(map_db_err)
    }

    async fn list_for_mailbox(&self, mailbox_id: MailboxId, limit: i64) -> Result<Vec<Message>> {
        sqlx::query_as::<_, Message>(
            r#"
            SELECT * FROM messages
            WHERE mailbox_id = $1
            ORDER BY received_at DESC
            LIMIT $2
            "#,
        )
        .bind(mailbox_id)
        .bind(limit)
        .fetch_all(self.pool.pool())
        .await
        .map_err(map_db_err)
    }
}
