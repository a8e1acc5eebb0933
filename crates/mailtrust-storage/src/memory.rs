//! In-process store implementing every repository trait
//!
//! Applies the same uniqueness rules as the SQL schema. Used by tests and
//! by embedders that do not need durable storage.

use crate::models::{
    CreateDomain, CreateMailbox, CreateMessage, DnsRecord, Domain, LocalMailbox, Mailbox, Message,
    NewDnsRecord,
};
use crate::repository::{DnsRecordRepository, DomainRepository, MailboxRepository, MessageRepository};
use async_trait::async_trait;
use chrono::Utc;
use mailtrust_common::types::{AdminId, DnsRecordId, DomainId, MailboxId, MessageId, RecordType};
use mailtrust_common::{Error, Result};
use std::sync::Arc;
use tokio::sync::Mutex;
use uuid::Uuid;

#[derive(Default)]
struct State {
    domains: Vec<Domain>,
    records: Vec<DnsRecord>,
    mailboxes: Vec<Mailbox>,
    messages: Vec<Message>,
    #[cfg(any(test, feature = "test-util"))]
    failing_mailboxes: std::collections::HashSet<MailboxId>,
}

impl State {
    fn local_mailbox(&self, mailbox: &Mailbox) -> Option<LocalMailbox> {
        let domain = self.domains.iter().find(|d| d.id == mailbox.domain_id)?;
        Some(LocalMailbox {
            mailbox: mailbox.clone(),
            domain_name: domain.name.clone(),
            domain_verified: domain.verified,
        })
    }
}

/// Shared in-memory store; clones see the same data
#[derive(Clone, Default)]
pub struct MemoryStore {
    state: Arc<Mutex<State>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every message write for `mailbox_id` fail with a database error
    #[cfg(any(test, feature = "test-util"))]
    pub async fn fail_deliveries_to(&self, mailbox_id: MailboxId) {
        self.state.lock().await.failing_mailboxes.insert(mailbox_id);
    }

    /// Snapshot of all stored messages in insertion order
    pub async fn all_messages(&self) -> Vec<Message> {
        self.state.lock().await.messages.clone()
    }
}

#[async_trait]
impl DomainRepository for MemoryStore {
    async fn create(&self, input: CreateDomain) -> Result<Domain> {
        let mut state = self.state.lock().await;
        if state
            .domains
            .iter()
            .any(|d| d.admin_id == input.admin_id && d.name == input.name)
        {
            return Err(Error::Conflict(format!(
                "domain {} already exists for admin",
                input.name
            )));
        }

        let now = Utc::now();
        let domain = Domain {
            id: Uuid::now_v7(),
            admin_id: input.admin_id,
            name: input.name,
            dkim_selector: Some(input.dkim_selector),
            dkim_private_key: Some(input.dkim_private_key),
            dkim_public_key: Some(input.dkim_public_key),
            verified: false,
            created_at: now,
            updated_at: now,
        };
        state.domains.push(domain.clone());
        Ok(domain)
    }

    async fn get(&self, id: DomainId) -> Result<Option<Domain>> {
        let state = self.state.lock().await;
        Ok(state.domains.iter().find(|d| d.id == id).cloned())
    }

    async fn find_for_admin(&self, admin_id: AdminId, name: &str) -> Result<Option<Domain>> {
        let state = self.state.lock().await;
        Ok(state
            .domains
            .iter()
            .find(|d| d.admin_id == admin_id && d.name == name)
            .cloned())
    }

    async fn find_by_name(&self, name: &str) -> Result<Option<Domain>> {
        let state = self.state.lock().await;
        let mut matches: Vec<&Domain> = state.domains.iter().filter(|d| d.name == name).collect();
        matches.sort_by(|a, b| {
            b.verified
                .cmp(&a.verified)
                .then(a.created_at.cmp(&b.created_at))
        });
        Ok(matches.first().map(|d| (*d).clone()))
    }

    async fn set_verified(&self, id: DomainId, verified: bool) -> Result<()> {
        let mut state = self.state.lock().await;
        if let Some(domain) = state.domains.iter_mut().find(|d| d.id == id) {
            domain.verified = verified;
            domain.updated_at = Utc::now();
        }
        Ok(())
    }
}

#[async_trait]
impl DnsRecordRepository for MemoryStore {
    async fn upsert_many(&self, domain_id: DomainId, records: &[NewDnsRecord]) -> Result<Vec<DnsRecord>> {
        let mut state = self.state.lock().await;
        let mut stored = Vec::with_capacity(records.len());

        for record in records {
            let now = Utc::now();
            let type_str = record.record_type.as_str();
            let existing = state.records.iter_mut().find(|r| {
                r.domain_id == domain_id && r.record_type == type_str && r.name == record.name
            });

            match existing {
                Some(row) => {
                    row.value = record.value.clone();
                    row.priority = record.priority;
                    row.ttl = record.ttl;
                    row.updated_at = now;
                    stored.push(row.clone());
                }
                None => {
                    let row = DnsRecord {
                        id: Uuid::now_v7(),
                        domain_id,
                        record_type: type_str.to_string(),
                        name: record.name.clone(),
                        value: record.value.clone(),
                        priority: record.priority,
                        ttl: record.ttl,
                        created_at: now,
                        updated_at: now,
                    };
                    state.records.push(row.clone());
                    stored.push(row);
                }
            }
        }

        Ok(stored)
    }

    async fn list_for_domain(&self, domain_id: DomainId) -> Result<Vec<DnsRecord>> {
        let state = self.state.lock().await;
        Ok(state
            .records
            .iter()
            .filter(|r| r.domain_id == domain_id)
            .cloned()
            .collect())
    }

    async fn list_by_type(&self, domain_id: DomainId, record_type: RecordType) -> Result<Vec<DnsRecord>> {
        let state = self.state.lock().await;
        Ok(state
            .records
            .iter()
            .filter(|r| r.domain_id == domain_id && r.record_type == record_type.as_str())
            .cloned()
            .collect())
    }

    async fn update_value(&self, id: DnsRecordId, value: &str) -> Result<()> {
        let mut state = self.state.lock().await;
        if let Some(row) = state.records.iter_mut().find(|r| r.id == id) {
            row.value = value.to_string();
            row.updated_at = Utc::now();
        }
        Ok(())
    }
}

#[async_trait]
impl MailboxRepository for MemoryStore {
    async fn create(&self, input: CreateMailbox) -> Result<LocalMailbox> {
        let mut state = self.state.lock().await;
        let address = input.address.to_lowercase();

        if !state.domains.iter().any(|d| d.id == input.domain_id) {
            return Err(Error::NotFound(format!("domain {}", input.domain_id)));
        }
        if state
            .mailboxes
            .iter()
            .any(|m| m.domain_id == input.domain_id && m.address == address)
        {
            return Err(Error::Conflict(format!("mailbox {} already exists", address)));
        }

        let now = Utc::now();
        let mailbox = Mailbox {
            id: Uuid::now_v7(),
            domain_id: input.domain_id,
            address,
            password_hash: input.password_hash,
            smtp_secret_encrypted: input.smtp_secret_encrypted,
            is_active: true,
            quota_mb: input.quota_mb,
            created_at: now,
            updated_at: now,
        };
        state.mailboxes.push(mailbox.clone());
        state
            .local_mailbox(&mailbox)
            .ok_or_else(|| Error::Internal("Failed to create mailbox".to_string()))
    }

    async fn get(&self, id: MailboxId) -> Result<Option<LocalMailbox>> {
        let state = self.state.lock().await;
        Ok(state
            .mailboxes
            .iter()
            .find(|m| m.id == id)
            .and_then(|m| state.local_mailbox(m)))
    }

    async fn find_local(&self, local: &str, domain: &str) -> Result<Option<LocalMailbox>> {
        let state = self.state.lock().await;
        let local = local.to_lowercase();
        let domain = domain.to_lowercase();
        Ok(state
            .mailboxes
            .iter()
            .filter(|m| m.address == local)
            .filter_map(|m| state.local_mailbox(m))
            .find(|lm| lm.domain_name == domain && lm.domain_verified))
    }
}

#[async_trait]
impl MessageRepository for MemoryStore {
    async fn create(&self, input: CreateMessage) -> Result<Message> {
        let mut state = self.state.lock().await;
        #[cfg(any(test, feature = "test-util"))]
        if let Some(mailbox_id) = input.mailbox_id {
            if state.failing_mailboxes.contains(&mailbox_id) {
                return Err(Error::Database(format!(
                    "write to mailbox {} failed",
                    mailbox_id
                )));
            }
        }

        let now = Utc::now();
        let message = Message {
            id: Uuid::now_v7(),
            mailbox_id: input.mailbox_id,
            from_address: input.from_address,
            to_address: input.to_address,
            subject: input.subject,
            text_body: input.text_body,
            html_body: input.html_body,
            dkim_verified: input.dkim_verified,
            direction: input.direction.to_string(),
            received_at: now,
            created_at: now,
        };
        state.messages.push(message.clone());
        Ok(message)
    }

    async fn get(&self, id: MessageId) -> Result<Option<Message>> {
        let state = self.state.lock().await;
        Ok(state.messages.iter().find(|m| m.id == id).cloned())
    }

    async fn list_for_mailbox(&self, mailbox_id: MailboxId, limit: i64) -> Result<Vec<Message>> {
        let state = self.state.lock().await;
        Ok(state
            .messages
            .iter()
            .rev()
            .filter(|m| m.mailbox_id == Some(mailbox_id))
            .take(limit.max(0) as usize)
            .cloned()
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mailtrust_common::types::MessageDirection;
    use pretty_assertions::assert_eq;

    fn create_domain(admin_id: AdminId, name: &str) -> CreateDomain {
        CreateDomain {
            admin_id,
            name: name.to_string(),
            dkim_selector: "dkim".to_string(),
            dkim_private_key: "private".to_string(),
            dkim_public_key: "public".to_string(),
        }
    }

    fn record(record_type: RecordType, name: &str, value: &str) -> NewDnsRecord {
        NewDnsRecord {
            record_type,
            name: name.to_string(),
            value: value.to_string(),
            priority: None,
            ttl: 3600,
        }
    }

    #[tokio::test]
    async fn test_duplicate_domain_conflicts() {
        let store = MemoryStore::new();
        let admin = Uuid::now_v7();
        DomainRepository::create(&store, create_domain(admin, "example.com"))
            .await
            .unwrap();

        let err = DomainRepository::create(&store, create_domain(admin, "example.com"))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Conflict(_)));

        // A different admin may claim the same name
        DomainRepository::create(&store, create_domain(Uuid::now_v7(), "example.com"))
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_find_by_name_prefers_verified() {
        let store = MemoryStore::new();
        DomainRepository::create(&store, create_domain(Uuid::now_v7(), "example.com"))
            .await
            .unwrap();
        let second = DomainRepository::create(&store, create_domain(Uuid::now_v7(), "example.com"))
            .await
            .unwrap();
        store.set_verified(second.id, true).await.unwrap();

        let found = store.find_by_name("example.com").await.unwrap().unwrap();
        assert_eq!(found.id, second.id);
    }

    #[tokio::test]
    async fn test_upsert_never_duplicates() {
        let store = MemoryStore::new();
        let domain = DomainRepository::create(&store, create_domain(Uuid::now_v7(), "example.com"))
            .await
            .unwrap();

        store
            .upsert_many(domain.id, &[record(RecordType::A, "@", "192.0.2.1")])
            .await
            .unwrap();
        store
            .upsert_many(
                domain.id,
                &[
                    record(RecordType::A, "@", "192.0.2.2"),
                    record(RecordType::A, "mail", "192.0.2.2"),
                ],
            )
            .await
            .unwrap();

        let rows = store.list_by_type(domain.id, RecordType::A).await.unwrap();
        assert_eq!(rows.len(), 2);
        assert!(rows.iter().all(|r| r.value == "192.0.2.2"));
    }

    #[tokio::test]
    async fn test_find_local_requires_verified_domain() {
        let store = MemoryStore::new();
        let domain = DomainRepository::create(&store, create_domain(Uuid::now_v7(), "example.com"))
            .await
            .unwrap();
        MailboxRepository::create(
            &store,
            CreateMailbox {
                domain_id: domain.id,
                address: "Alice".to_string(),
                password_hash: "hash".to_string(),
                smtp_secret_encrypted: None,
                quota_mb: 1024,
            },
        )
        .await
        .unwrap();

        assert!(store.find_local("alice", "example.com").await.unwrap().is_none());

        store.set_verified(domain.id, true).await.unwrap();
        let mailbox = store.find_local("ALICE", "Example.com").await.unwrap().unwrap();
        assert_eq!(mailbox.full_address(), "alice@example.com");
        assert!(mailbox.is_usable());
    }

    #[tokio::test]
    async fn test_fault_injection() {
        let store = MemoryStore::new();
        let mailbox_id = Uuid::now_v7();
        store.fail_deliveries_to(mailbox_id).await;

        let result = MessageRepository::create(
            &store,
            CreateMessage {
                mailbox_id: Some(mailbox_id),
                from_address: "a@example.org".to_string(),
                to_address: "b@example.com".to_string(),
                subject: "Hi".to_string(),
                text_body: None,
                html_body: None,
                dkim_verified: None,
                direction: MessageDirection::Inbound,
            },
        )
        .await;
        assert!(matches!(result, Err(Error::Database(_))));
        assert!(store.all_messages().await.is_empty());
    }
}
