//! SMTP AUTH (PLAIN and LOGIN)
//!
//! A mailbox authenticates with its full address. The presented secret is
//! compared in constant time against the decrypted SMTP secret; mailboxes
//! without one fall back to their argon2 password hash. Only active
//! mailboxes on verified domains can authenticate.
//!
//! Every attempt runs exactly one argon2 verification on the blocking pool,
//! against a placeholder hash when no mailbox hash applies, so unknown and
//! known accounts take the same time to refuse.

use argon2::password_hash::{rand_core::OsRng, PasswordHasher, SaltString};
use argon2::{Argon2, PasswordHash, PasswordVerifier};
use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use mailtrust_common::types::EmailAddress;
use mailtrust_common::{Error, Result, SecretCipher};
use mailtrust_storage::models::LocalMailbox;
use mailtrust_storage::repository::MailboxRepository;
use std::sync::{Arc, OnceLock};
use subtle::ConstantTimeEq;
use tracing::{debug, warn};

/// Username and password presented by the client
#[derive(Clone, PartialEq, Eq)]
pub struct Credentials {
    pub username: String,
    pub password: String,
}

impl std::fmt::Debug for Credentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Credentials")
            .field("username", &self.username)
            .finish_non_exhaustive()
    }
}

impl Credentials {
    /// Decode an AUTH PLAIN response: `[authzid] NUL authcid NUL password`
    pub fn from_plain(encoded: &str) -> Option<Self> {
        let decoded = BASE64.decode(encoded.trim()).ok()?;
        let parts: Vec<&[u8]> = decoded.split(|&b| b == 0).collect();

        let (username, password) = match parts.as_slice() {
            [authcid, password] => (*authcid, *password),
            [_authzid, authcid, password] => (*authcid, *password),
            _ => {
                debug!(parts = parts.len(), "AUTH PLAIN: malformed response");
                return None;
            }
        };

        Some(Self {
            username: String::from_utf8(username.to_vec()).ok()?,
            password: String::from_utf8(password.to_vec()).ok()?,
        })
    }

    /// Decode the two base64 AUTH LOGIN responses
    pub fn from_login(username: &str, password: &str) -> Option<Self> {
        let decode = |s: &str| {
            BASE64
                .decode(s.trim())
                .ok()
                .and_then(|bytes| String::from_utf8(bytes).ok())
        };
        Some(Self {
            username: decode(username)?,
            password: decode(password)?,
        })
    }
}

pub struct SmtpAuthenticator {
    mailboxes: Arc<dyn MailboxRepository>,
    cipher: Option<SecretCipher>,
}

impl SmtpAuthenticator {
    pub fn new(mailboxes: Arc<dyn MailboxRepository>, cipher: Option<SecretCipher>) -> Self {
        Self { mailboxes, cipher }
    }

    /// `Ok(None)` for any credential failure; `Err` only when the lookup
    /// itself failed
    pub async fn authenticate(&self, credentials: &Credentials) -> Result<Option<LocalMailbox>> {
        let mailbox = match EmailAddress::parse(&credentials.username) {
            Some(address) => self
                .mailboxes
                .find_local(&address.local, &address.domain)
                .await?
                .filter(|m| m.mailbox.is_active),
            None => {
                debug!("AUTH: username is not an address");
                None
            }
        };

        let sealed = mailbox
            .as_ref()
            .and_then(|m| self.sealed_secret_matches(m, &credentials.password));
        let hash = match (&mailbox, sealed) {
            (Some(m), None) => m.mailbox.password_hash.clone(),
            _ => placeholder_hash().to_string(),
        };
        let password = credentials.password.clone();
        let hash_matches = tokio::task::spawn_blocking(move || verify_password(&password, &hash))
            .await
            .map_err(|e| Error::Internal(format!("Password verification task failed: {}", e)))?;

        let Some(mailbox) = mailbox else {
            debug!(username = %credentials.username, "AUTH: no active mailbox");
            return Ok(None);
        };

        if sealed.unwrap_or(hash_matches) {
            debug!(address = %mailbox.full_address(), "AUTH: success");
            Ok(Some(mailbox))
        } else {
            debug!(address = %mailbox.full_address(), "AUTH: invalid secret");
            Ok(None)
        }
    }

    /// Compare against the decrypted SMTP secret; `None` when the mailbox
    /// has no stored secret or no cipher is configured
    fn sealed_secret_matches(&self, mailbox: &LocalMailbox, presented: &str) -> Option<bool> {
        let sealed = mailbox.mailbox.smtp_secret_encrypted.as_ref()?;
        let cipher = self.cipher.as_ref()?;
        Some(match cipher.decrypt(sealed) {
            Ok(secret) => bool::from(secret.as_bytes().ct_eq(presented.as_bytes())),
            Err(e) => {
                warn!(mailbox_id = %mailbox.mailbox.id, error = %e, "Stored SMTP secret unreadable");
                false
            }
        })
    }
}

/// Hash of a random value, verified when no mailbox hash applies
fn placeholder_hash() -> &'static str {
    static HASH: OnceLock<String> = OnceLock::new();
    HASH.get_or_init(|| {
        let salt = SaltString::generate(&mut OsRng);
        let mut secret = [0u8; 32];
        rand::RngCore::fill_bytes(&mut rand::thread_rng(), &mut secret);
        match Argon2::default().hash_password(&secret, &salt) {
            Ok(hash) => hash.to_string(),
            Err(e) => {
                warn!(error = %e, "Could not build placeholder password hash");
                String::new()
            }
        }
    })
}

fn verify_password(password: &str, hash: &str) -> bool {
    let Ok(parsed) = PasswordHash::new(hash) else {
        warn!("Stored password hash is malformed");
        return false;
    };
    Argon2::default()
        .verify_password(password.as_bytes(), &parsed)
        .is_ok()
}

/// Base64 `Username:` challenge for AUTH LOGIN
pub fn login_challenge_username() -> String {
    BASE64.encode(b"Username:")
}

/// Base64 `Password:` challenge for AUTH LOGIN
pub fn login_challenge_password() -> String {
    BASE64.encode(b"Password:")
}
