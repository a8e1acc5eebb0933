//! DNS record repository

use crate::db::{map_db_err, DatabasePool};
use crate::models::{DnsRecord, NewDnsRecord};
use async_trait::async_trait;
use mailtrust_common::types::{DnsRecordId, DomainId, RecordType};
use mailtrust_common::Result;
use uuid::Uuid;

/// DNS record repository trait
#[async_trait]
pub trait DnsRecordRepository: Send + Sync {
    /// Insert or update on `(domain_id, record_type, name)`; never duplicates
    async fn upsert_many(&self, domain_id: DomainId, records: &[NewDnsRecord]) -> Result<Vec<DnsRecord>>;
    async fn list_for_domain(&self, domain_id: DomainId) -> Result<Vec<DnsRecord>>;
    async fn list_by_type(&self, domain_id: DomainId, record_type: RecordType) -> Result<Vec<DnsRecord>>;
    async fn update_value(&self, id: DnsRecordId, value: &str) -> Result<()>;
}

/// Database DNS record repository
pub struct DbDnsRecordRepository {
    pool: DatabasePool,
}

impl DbDnsRecordRepository {
    pub fn new(pool: DatabasePool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl DnsRecordRepository for DbDnsRecordRepository {
    async fn upsert_many(&self, domain_id: DomainId, records: &[NewDnsRecord]) -> Result<Vec<DnsRecord>> {
        let mut tx = self.pool.pool().begin().await.map_err(map_db_err)?;
        let mut stored = Vec::with_capacity(records.len());

        for record in records {
            let now = chrono::Utc::now();
            let row = sqlx::query_as::<_, DnsRecord>(
                r#"
                INSERT INTO dns_records (id, domain_id, record_type, name, value, priority, ttl, created_at, updated_at)
                VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $8)
                ON CONFLICT (domain_id, record_type, name)
                DO UPDATE SET value = EXCLUDED.value, priority = EXCLUDED.priority,
                              ttl = EXCLUDED.ttl, updated_at = EXCLUDED.updated_at
                RETURNING *
                "#,
            )
            .bind(Uuid::now_v7())
            .bind(domain_id)
            .bind(record.record_type.as_str())
            .bind(&record.name)
            .bind(&record.value)
            .bind(record.priority)
            .bind(record.ttl)
            .bind(now)
            .fetch_one(&mut *tx)
            .await
            .map_err(map_db_err)?;
            stored.push(row);
        }

        tx.commit().await.map_err(map_db_err)?;
        Ok(stored)
    }

    async fn list_for_domain(&self, domain_id: DomainId) -> Result<Vec<DnsRecord>> {
        sqlx::query_as::<_, DnsRecord>(
            "SELECT * FROM dns_records WHERE domain_id = $1 ORDER BY created_at ASC",
        )
        .bind(domain_id)
        .fetch_all(self.pool.pool())
        .await
        .map_err(map_db_err)
    }

    async fn list_by_type(&self, domain_id: DomainId, record_type: RecordType) -> Result<Vec<DnsRecord>> {
        sqlx::query_as::<_, DnsRecord>(
            "SELECT * FROM dns_records WHERE domain_id = $1 AND record_type = $2 ORDER BY created_at ASC",
        )
        .bind(domain_id)
        .bind(record_type.as_str())
        .fetch_all(self.pool.pool())
        .await
        .map_err(map_db_err)
    }

    async fn update_value(&self, id: DnsRecordId, value: &str) -> Result<()> {
        let now = chrono::Utc::now();
        sqlx::query("UPDATE dns_records SET value = $2, updated_at = $3 WHERE id = $1")
            .bind(id)
            .bind(value)
            .bind(now)
            .execute(self.pool.pool())
            .await
            .map_err(map_db_err)?;
        Ok(())
    }
}
