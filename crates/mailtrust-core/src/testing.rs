//! Shared fixtures for unit tests

use crate::dkim::{generate_key_pair, KeyMaterial};
use argon2::password_hash::{rand_core::OsRng, PasswordHasher, SaltString};
use argon2::Argon2;
use mailtrust_common::SecretCipher;
use mailtrust_storage::models::{CreateDomain, CreateMailbox, Domain, LocalMailbox};
use mailtrust_storage::repository::{DomainRepository, MailboxRepository};
use mailtrust_storage::MemoryStore;
use std::sync::OnceLock;
use uuid::Uuid;

/// One 1024-bit key pair shared by every test in the process
pub fn test_keys() -> &'static KeyMaterial {
    static KEYS: OnceLock<KeyMaterial> = OnceLock::new();
    KEYS.get_or_init(|| generate_key_pair(1024).unwrap())
}

pub fn test_cipher() -> SecretCipher {
    SecretCipher::new(&[7u8; 32]).unwrap()
}

pub async fn seed_domain(store: &MemoryStore, name: &str, verified: bool) -> Domain {
    let keys = test_keys();
    let domain = DomainRepository::create(
        store,
        CreateDomain {
            admin_id: Uuid::now_v7(),
            name: name.to_string(),
            dkim_selector: "dkim".to_string(),
            dkim_private_key: keys.private_key_pem.clone(),
            dkim_public_key: keys.public_key.clone(),
        },
    )
    .await
    .unwrap();
    if verified {
        store.set_verified(domain.id, true).await.unwrap();
    }
    DomainRepository::get(store, domain.id).await.unwrap().unwrap()
}

/// Mailbox whose argon2 password and encrypted SMTP secret are both `secret`
pub async fn seed_mailbox(store: &MemoryStore, domain: &Domain, local: &str) -> LocalMailbox {
    let salt = SaltString::generate(&mut OsRng);
    let password_hash = Argon2::default()
        .hash_password(b"secret", &salt)
        .unwrap()
        .to_string();

    MailboxRepository::create(
        store,
        CreateMailbox {
            domain_id: domain.id,
            address: local.to_string(),
            password_hash,
            smtp_secret_encrypted: Some(test_cipher().encrypt("secret").unwrap()),
            quota_mb: 1024,
        },
    )
    .await
    .unwrap()
}
