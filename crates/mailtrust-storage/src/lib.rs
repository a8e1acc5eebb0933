//! mailtrust Storage - Persistence for domains, DNS records, mailboxes and messages
//!
//! Repositories are expressed as traits with a PostgreSQL implementation
//! (`Db*Repository`) and an in-process [`MemoryStore`].

pub mod db;
pub mod memory;
pub mod models;
pub mod repository;

pub use db::DatabasePool;
pub use memory::MemoryStore;
pub use models::*;
pub use repository::*;
