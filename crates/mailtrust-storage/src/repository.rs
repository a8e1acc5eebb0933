//! Repository layer for data access

pub mod dns_records;
pub mod domains;
pub mod mailboxes;
pub mod messages;

// Re-export concrete repository implementations with simple names
pub use dns_records::DbDnsRecordRepository;
pub use domains::DbDomainRepository;
pub use mailboxes::DbMailboxRepository;
pub use messages::DbMessageRepository;

// Re-export repository traits
pub use dns_records::DnsRecordRepository;
pub use domains::DomainRepository;
pub use mailboxes::MailboxRepository;
pub use messages::MessageRepository;

use crate::db::DatabasePool;
use crate::memory::MemoryStore;
use std::sync::Arc;

/// Shared handles to every repository
#[derive(Clone)]
pub struct Repositories {
    pub domains: Arc<dyn DomainRepository>,
    pub dns_records: Arc<dyn DnsRecordRepository>,
    pub mailboxes: Arc<dyn MailboxRepository>,
    pub messages: Arc<dyn MessageRepository>,
}

impl Repositories {
    pub fn postgres(pool: &DatabasePool) -> Self {
        Self {
            domains: Arc::new(DbDomainRepository::new(pool.clone())),
            dns_records: Arc::new(DbDnsRecordRepository::new(pool.clone())),
            mailboxes: Arc::new(DbMailboxRepository::new(pool.clone())),
            messages: Arc::new(DbMessageRepository::new(pool.clone())),
        }
    }

    /// All four backed by one in-process store
    pub fn memory(store: &MemoryStore) -> Self {
        Self {
            domains: Arc::new(store.clone()),
            dns_records: Arc::new(store.clone()),
            mailboxes: Arc::new(store.clone()),
            messages: Arc::new(store.clone()),
        }
    }
}
