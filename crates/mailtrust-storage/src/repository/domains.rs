//! Domain repository

use crate::db::{map_db_err, DatabasePool};
use crate::models::{CreateDomain, Domain};
use async_trait::async_trait;
use mailtrust_common::types::{AdminId, DomainId};
use mailtrust_common::{Error, Result};
use uuid::Uuid;

/// Domain repository trait
#[async_trait]
pub trait DomainRepository: Send + Sync {
    /// Insert a domain; a duplicate `(admin_id, name)` yields [`Error::Conflict`]
    async fn create(&self, input: CreateDomain) -> Result<Domain>;
    async fn get(&self, id: DomainId) -> Result<Option<Domain>>;
    async fn find_for_admin(&self, admin_id: AdminId, name: &str) -> Result<Option<Domain>>;
    /// Cross-admin lookup used by mail routing; prefers a verified row
    async fn find_by_name(&self, name: &str) -> Result<Option<Domain>>;
    async fn set_verified(&self, id: DomainId, verified: bool) -> Result<()>;
}

/// Database domain repository
pub struct DbDomainRepository {
    pool: DatabasePool,
}

impl DbDomainRepository {
    pub fn new(pool: DatabasePool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl DomainRepository for DbDomainRepository {
    async fn create(&self, input: CreateDomain) -> Result<Domain> {
        let id = Uuid::now_v7();
        let now = chrono::Utc::now();

        sqlx::query(
            r#"
            INSERT INTO domains (id, admin_id, name, dkim_selector, dkim_private_key, dkim_public_key, verified, created_at, updated_at)
            VALUES ($1, $2, $3, $4, $5, $6, false, $7, $8)
            "#,
        )
        .bind(id)
        .bind(input.admin_id)
        .bind(&input.name)
        .bind(&input.dkim_selector)
        .bind(&input.dkim_private_key)
        .bind(&input.dkim_public_key)
        .bind(now)
        .bind(now)
        .execute(self.pool.pool())
        .await
        .map_err(map_db_err)?;

        self.get(id)
            .await?
            .ok_or_else(|| Error::Internal("Failed to create domain".to_string()))
    }

    async fn get(&self, id: DomainId) -> Result<Option<Domain>> {
        sqlx::query_as::<_, Domain>("SELECT * FROM domains WHERE id = $1")
            .bind(id)
            .fetch_optional(self.pool.pool())
            .await
            .map_err(map_db_err)
    }

    async fn find_for_admin(&self, admin_id: AdminId, name: &str) -> Result<Option<Domain>> {
        sqlx::query_as::<_, Domain>("SELECT * FROM domains WHERE admin_id = $1 AND name = $2")
            .bind(admin_id)
            .bind(name)
            .fetch_optional(self.pool.pool())
            .await
            .map_err(map_db_err)
    }

    async fn find_by_name(&self, name: &str) -> Result<Option<Domain>> {
        sqlx::query_as::<_, Domain>(
            "SELECT * FROM domains WHERE name = $1 ORDER BY verified DESC, created_at ASC LIMIT 1",
        )
        .bind(name)
        .fetch_optional(self.pool.pool())
        .await
        .map_err(map_db_err)
    }

    async fn set_verified(&self, id: DomainId, verified: bool) -> Result<()> {
        let now = chrono::Utc::now();
        sqlx::query("UPDATE domains SET verified = $2, updated_at = $3 WHERE id = $1")
            .bind(id)
            .bind(verified)
            .bind(now)
            .execute(self.pool.pool())
            .await
            .map_err(map_db_err)?;
        Ok(())
    }
}
