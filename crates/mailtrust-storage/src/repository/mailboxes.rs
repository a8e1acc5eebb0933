//! Mailbox repository
//!
//! Lookups return [`LocalMailbox`], the mailbox joined with its domain's
//! name and verification state.

use crate::db::{map_db_err, DatabasePool};
use crate::models::{CreateMailbox, LocalMailbox};
use async_trait::async_trait;
use mailtrust_common::types::MailboxId;
use mailtrust_common::{Error, Result};
use uuid::Uuid;

const SELECT_LOCAL: &str = r#"
    SELECT m.*, d.name AS domain_name, d.verified AS domain_verified
    FROM mailboxes m
    JOIN domains d ON d.id = m.domain_id
"#;

/// Mailbox repository trait
#[async_trait]
pub trait MailboxRepository: Send + Sync {
    async fn create(&self, input: CreateMailbox) -> Result<LocalMailbox>;
    async fn get(&self, id: MailboxId) -> Result<Option<LocalMailbox>>;
    /// Mailbox `local@domain` whose domain is verified
    async fn find_local(&self, local: &str, domain: &str) -> Result<Option<LocalMailbox>>;
}

/// Database mailbox repository
pub struct DbMailboxRepository {
    pool: DatabasePool,
}

impl DbMailboxRepository {
    pub fn new(pool: DatabasePool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl MailboxRepository for DbMailboxRepository {
    async fn create(&self, input: CreateMailbox) -> Result<LocalMailbox> {
        let id = Uuid::now_v7();
        let now = chrono::Utc::now();

        sqlx::query(
            r#"
            INSERT INTO mailboxes (id, domain_id, address, password_hash, smtp_secret_encrypted, is_active, quota_mb, created_at, updated_at)
            VALUES ($1, $2, $3, $4, $5, true, $6, $7, $8)
            "#,
        )
        .bind(id)
        .bind(input.domain_id)
        .bind(input.address.to_lowercase())
        .bind(&input.password_hash)
        .bind(&input.smtp_secret_encrypted)
        .bind(input.quota_mb)
        .bind(now)
        .bind(now)
        .execute(self.pool.pool())
        .await
        .map_err(map_db_err)?;

        self.get(id)
            .await?
            .ok_or_else(|| Error::Internal("Failed to create mailbox".to_string()))
    }

    async fn get(&self, id: MailboxId) -> Result<Option<LocalMailbox>> {
        sqlx::query_as::<_, LocalMailbox>(&format!("{} WHERE m.id = $1", SELECT_LOCAL))
            .bind(id)
            .fetch_optional(self.pool.pool())
            .await
            .map_err(map_db_err)
    }

    async fn find_local(&self, local: &str, domain: &str) -> Result<Option<LocalMailbox>> {
        sqlx::query_as::<_, LocalMailbox>(&format!(
            "{} WHERE m.address = $1 AND d.name = $2 AND d.verified = true LIMIT 1",
            SELECT_LOCAL
        ))
        .bind(local.to_lowercase())
        .bind(domain.to_lowercase())
        .fetch_optional(self.pool.pool())
        .await
        .map_err(map_db_err)
    }
}
