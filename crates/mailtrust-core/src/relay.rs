//! DKIM-signed outbound relay
//!
//! A message from a local mailbox is built, signed with its domain's key
//! and handed to a [`MailTransport`] once. Nothing is queued or retried.
//! After a successful hand-off a copy is stored for a local recipient.

use crate::dkim::{DkimSigner, DkimSigningConfig};
use crate::dns::records::DEFAULT_DKIM_SELECTOR;
use crate::router::{MessageRouter, RouteOutcome};
use async_trait::async_trait;
use mail_builder::MessageBuilder;
use mailtrust_common::config::{RelayConfig, RelaySecurity};
use mailtrust_common::types::{EmailAddress, MessageId};
use mailtrust_common::SecretCipher;
use mailtrust_storage::models::LocalMailbox;
use mailtrust_storage::repository::DomainRepository;
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Why a relay attempt failed
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RelayError {
    #[error("sender not authorized to relay: {0}")]
    Unauthorized(String),

    #[error("no DKIM key on file for {0}")]
    MissingDkimKey(String),

    #[error("DNS resolution failed for relay host: {0}")]
    DnsFailure(String),

    #[error("could not connect to relay: {0}")]
    ConnectionFailed(String),

    #[error("relay rejected credentials: {0}")]
    AuthRejected(String),

    #[error("relay rejected message: {message}")]
    Rejected { permanent: bool, message: String },

    #[error("relay timed out")]
    Timeout,

    #[error("failed to build message: {0}")]
    Build(String),

    #[error("storage error: {0}")]
    Storage(String),
}

/// A message to relay on behalf of a mailbox
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutboundMessage {
    pub from: EmailAddress,
    pub to: EmailAddress,
    pub subject: String,
    /// Sent as the HTML part
    pub html_body: String,
    pub text_body: Option<String>,
}

/// Outcome of a successful relay
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DeliveryReceipt {
    /// `Message-ID` header of the sent message, with angle brackets
    pub message_id: String,
    /// Final reply from the relay
    pub response: String,
    /// Copy stored for a local recipient
    pub stored_message_id: Option<MessageId>,
}

/// Login presented to the relay
#[derive(Clone, PartialEq, Eq)]
pub struct RelayCredentials {
    pub username: String,
    pub password: String,
}

impl std::fmt::Debug for RelayCredentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RelayCredentials")
            .field("username", &self.username)
            .finish_non_exhaustive()
    }
}

/// Single-attempt hand-off of a signed message
#[async_trait]
pub trait MailTransport: Send + Sync {
    /// Returns the relay's final reply text
    async fn deliver(
        &self,
        from: &EmailAddress,
        to: &EmailAddress,
        raw: &[u8],
        credentials: Option<&RelayCredentials>,
    ) -> Result<String, RelayError>;
}

/// `lettre` transport built fresh for every message
pub struct SmtpRelayTransport {
    config: RelayConfig,
}

impl SmtpRelayTransport {
    pub fn new(config: RelayConfig) -> Self {
        Self { config }
    }

    fn transport(
        &self,
        credentials: Option<&RelayCredentials>,
    ) -> Result<lettre::AsyncSmtpTransport<lettre::Tokio1Executor>, RelayError> {
        use lettre::transport::smtp::authentication::Credentials;
        use lettre::{AsyncSmtpTransport, Tokio1Executor};

        let host = self.config.host.as_str();
        let builder = match self.config.security {
            RelaySecurity::None => AsyncSmtpTransport::<Tokio1Executor>::builder_dangerous(host),
            RelaySecurity::Starttls => AsyncSmtpTransport::<Tokio1Executor>::starttls_relay(host)
                .map_err(|e| RelayError::ConnectionFailed(e.to_string()))?,
            RelaySecurity::Tls => AsyncSmtpTransport::<Tokio1Executor>::relay(host)
                .map_err(|e| RelayError::ConnectionFailed(e.to_string()))?,
        };

        let mut builder = builder
            .port(self.config.port)
            .timeout(Some(Duration::from_secs(self.config.timeout_secs.max(1))));
        if let Some(credentials) = credentials {
            builder = builder.credentials(Credentials::new(
                credentials.username.clone(),
                credentials.password.clone(),
            ));
        }
        Ok(builder.build())
    }
}

#[async_trait]
impl MailTransport for SmtpRelayTransport {
    async fn deliver(
        &self,
        from: &EmailAddress,
        to: &EmailAddress,
        raw: &[u8],
        credentials: Option<&RelayCredentials>,
    ) -> Result<String, RelayError> {
        use lettre::address::{Address, Envelope};
        use lettre::AsyncTransport;

        let parse = |a: &EmailAddress| {
            a.address()
                .parse::<Address>()
                .map_err(|e| RelayError::Build(format!("invalid address {}: {}", a, e)))
        };
        let envelope = Envelope::new(Some(parse(from)?), vec![parse(to)?])
            .map_err(|e| RelayError::Build(e.to_string()))?;

        let transport = self.transport(credentials)?;
        debug!(
            host = %self.config.host,
            port = self.config.port,
            security = ?self.config.security,
            "Connecting to relay"
        );

        let response = transport.send_raw(&envelope, raw).await.map_err(classify)?;
        Ok(format!(
            "{} {}",
            response.code(),
            response.message().collect::<Vec<_>>().join(" ")
        ))
    }
}

fn classify(e: lettre::transport::smtp::Error) -> RelayError {
    let message = e.to_string();
    if e.is_timeout() {
        return RelayError::Timeout;
    }
    if let Some(code) = e.status() {
        return match code.to_string().as_str() {
            "530" | "534" | "535" | "454" => RelayError::AuthRejected(message),
            _ => RelayError::Rejected {
                permanent: e.is_permanent(),
                message,
            },
        };
    }

    let lowered = message.to_ascii_lowercase();
    if lowered.contains("lookup") || lowered.contains("resolve") || lowered.contains("name or service") {
        RelayError::DnsFailure(message)
    } else {
        RelayError::ConnectionFailed(message)
    }
}

/// A delivery captured by [`RecordingTransport`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecordedDelivery {
    pub from: EmailAddress,
    pub to: EmailAddress,
    pub raw: Vec<u8>,
    pub username: Option<String>,
}

/// In-process transport that records deliveries instead of sending them
#[derive(Debug, Default, Clone)]
pub struct RecordingTransport {
    deliveries: Arc<Mutex<Vec<RecordedDelivery>>>,
    failure: Option<RelayError>,
}

impl RecordingTransport {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fail every delivery with `error`
    pub fn failing(error: RelayError) -> Self {
        Self {
            failure: Some(error),
            ..Self::default()
        }
    }

    pub async fn deliveries(&self) -> Vec<RecordedDelivery> {
        self.deliveries.lock().await.clone()
    }
}

#[async_trait]
impl MailTransport for RecordingTransport {
    async fn deliver(
        &self,
        from: &EmailAddress,
        to: &EmailAddress,
        raw: &[u8],
        credentials: Option<&RelayCredentials>,
    ) -> Result<String, RelayError> {
        if let Some(error) = &self.failure {
            return Err(error.clone());
        }
        self.deliveries.lock().await.push(RecordedDelivery {
            from: from.clone(),
            to: to.clone(),
            raw: raw.to_vec(),
            username: credentials.map(|c| c.username.clone()),
        });
        Ok("250 2.0.0 OK".to_string())
    }
}

pub struct OutboundRelayClient {
    domains: Arc<dyn DomainRepository>,
    router: Arc<MessageRouter>,
    transport: Arc<dyn MailTransport>,
    cipher: Option<SecretCipher>,
}

impl OutboundRelayClient {
    pub fn new(
        domains: Arc<dyn DomainRepository>,
        router: Arc<MessageRouter>,
        transport: Arc<dyn MailTransport>,
        cipher: Option<SecretCipher>,
    ) -> Self {
        Self {
            domains,
            router,
            transport,
            cipher,
        }
    }

    /// Sign and relay `message` as `mailbox`.
    ///
    /// The relay login is the mailbox address with `raw_password` when
    /// given, otherwise the decrypted stored secret. With neither, the
    /// message is sent without authentication.
    pub async fn send(
        &self,
        mailbox: &LocalMailbox,
        raw_password: Option<&str>,
        message: &OutboundMessage,
    ) -> Result<DeliveryReceipt, RelayError> {
        let sender = mailbox.full_address();
        if !mailbox.is_usable() {
            warn!(%sender, "Relay refused: mailbox inactive or domain unverified");
            return Err(RelayError::Unauthorized(sender));
        }

        let domain = self
            .domains
            .get(mailbox.mailbox.domain_id)
            .await
            .map_err(|e| RelayError::Storage(e.to_string()))?
            .ok_or_else(|| RelayError::Unauthorized(sender.clone()))?;

        let Some(private_key) = domain.dkim_private_key.as_deref().filter(|k| !k.trim().is_empty()) else {
            warn!(domain = %domain.name, "Relay refused: no DKIM key");
            return Err(RelayError::MissingDkimKey(domain.name.clone()));
        };
        let selector = domain
            .dkim_selector
            .clone()
            .unwrap_or_else(|| DEFAULT_DKIM_SELECTOR.to_string());

        let message_id = format!("{}@{}", Uuid::now_v7(), domain.name);
        let raw = build_message(message, &message_id)?;
        let signer = DkimSigner::new(DkimSigningConfig::new(domain.name.clone(), selector), private_key)
            .map_err(|e| RelayError::Build(e.to_string()))?;
        let signed = signer
            .sign_message(&raw)
            .map_err(|e| RelayError::Build(e.to_string()))?;

        let credentials = self.credentials(mailbox, raw_password);
        let response = self
            .transport
            .deliver(&message.from, &message.to, &signed, credentials.as_ref())
            .await?;
        info!(
            from = %message.from,
            to = %message.to,
            %message_id,
            %response,
            "Message relayed"
        );

        let stored_message_id = match self
            .router
            .store_outbound_copy(
                &message.from,
                &message.to,
                &message.subject,
                message.text_body.as_deref(),
                Some(&message.html_body),
            )
            .await
        {
            Ok(RouteOutcome::StoredLocal { message_id, .. }) => Some(message_id),
            Ok(RouteOutcome::AcceptedUnroutable) => None,
            Err(e) => {
                warn!(to = %message.to, error = %e, "Relayed, but storing the local copy failed");
                None
            }
        };

        Ok(DeliveryReceipt {
            message_id: format!("<{}>", message_id),
            response,
            stored_message_id,
        })
    }

    fn credentials(&self, mailbox: &LocalMailbox, raw_password: Option<&str>) -> Option<RelayCredentials> {
        let password = match raw_password {
            Some(password) => password.to_string(),
            None => {
                let sealed = mailbox.mailbox.smtp_secret_encrypted.as_deref()?;
                let cipher = self.cipher.as_ref()?;
                match cipher.decrypt(sealed) {
                    Ok(secret) => secret,
                    Err(e) => {
                        warn!(mailbox_id = %mailbox.mailbox.id, error = %e, "Stored SMTP secret unreadable");
                        return None;
                    }
                }
            }
        };
        Some(RelayCredentials {
            username: mailbox.full_address(),
            password,
        })
    }
}

fn build_message(message: &OutboundMessage, message_id: &str) -> Result<Vec<u8>, RelayError> {
    let mut builder = MessageBuilder::new()
        .from((message.from.local.clone(), message.from.address()))
        .to(message.to.address())
        .subject(message.subject.clone())
        .message_id(message_id.to_string())
        .date(chrono::Utc::now().timestamp())
        .html_body(message.html_body.clone());
    if let Some(text) = &message.text_body {
        builder = builder.text_body(text.clone());
    }
    builder
        .write_to_vec()
        .map_err(|e| RelayError::Build(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dkim::tag_value;
    use crate::testing::{seed_domain, seed_mailbox, test_cipher};
    use mailtrust_storage::repository::MailboxRepository;
    use mailtrust_storage::MemoryStore;
    use pretty_assertions::assert_eq;

    fn client(store: &MemoryStore, transport: RecordingTransport) -> OutboundRelayClient {
        let router = MessageRouter::new(Arc::new(store.clone()), Arc::new(store.clone()));
        OutboundRelayClient::new(
            Arc::new(store.clone()),
            Arc::new(router),
            Arc::new(transport),
            Some(test_cipher()),
        )
    }

    fn message(to: &str) -> OutboundMessage {
        OutboundMessage {
            from: EmailAddress::new("alice", "example.com"),
            to: EmailAddress::parse(to).unwrap(),
            subject: "Quarterly report".to_string(),
            html_body: "<p>Attached.</p>".to_string(),
            text_body: None,
        }
    }

    #[tokio::test]
    async fn test_relay_signs_and_delivers() {
        let store = MemoryStore::new();
        let domain = seed_domain(&store, "example.com", true).await;
        let alice = seed_mailbox(&store, &domain, "alice").await;
        let transport = RecordingTransport::new();

        let receipt = client(&store, transport.clone())
            .send(&alice, None, &message("dave@example.net"))
            .await
            .unwrap();
        assert!(receipt.message_id.ends_with("@example.com>"));
        assert_eq!(receipt.stored_message_id, None);

        let deliveries = transport.deliveries().await;
        assert_eq!(deliveries.len(), 1);
        assert_eq!(deliveries[0].username.as_deref(), Some("alice@example.com"));

        let raw = String::from_utf8(deliveries[0].raw.clone()).unwrap();
        assert!(raw.starts_with("DKIM-Signature: "));
        let signature = raw.lines().next().unwrap().trim_start_matches("DKIM-Signature: ");
        assert_eq!(tag_value(signature, "d"), Some("example.com"));
        assert_eq!(tag_value(signature, "s"), Some("dkim"));
        assert_eq!(tag_value(signature, "c"), Some("relaxed/relaxed"));
        assert!(raw.contains("Subject: Quarterly report"));
    }

    #[tokio::test]
    async fn test_local_recipient_gets_a_copy() {
        let store = MemoryStore::new();
        let domain = seed_domain(&store, "example.com", true).await;
        let alice = seed_mailbox(&store, &domain, "alice").await;
        let bob = seed_mailbox(&store, &domain, "bob").await;

        let receipt = client(&store, RecordingTransport::new())
            .send(&alice, Some("secret"), &message("bob@example.com"))
            .await
            .unwrap();

        let stored = store.all_messages().await;
        assert_eq!(stored.len(), 1);
        assert_eq!(receipt.stored_message_id, Some(stored[0].id));
        assert_eq!(stored[0].mailbox_id, Some(bob.mailbox.id));
        assert_eq!(stored[0].html_body.as_deref(), Some("<p>Attached.</p>"));
    }

    #[tokio::test]
    async fn test_unverified_domain_never_reaches_transport() {
        let store = MemoryStore::new();
        let domain = seed_domain(&store, "example.com", false).await;
        let alice = seed_mailbox(&store, &domain, "alice").await;
        let transport = RecordingTransport::new();

        let err = client(&store, transport.clone())
            .send(&alice, None, &message("dave@example.net"))
            .await
            .unwrap_err();
        assert_eq!(err, RelayError::Unauthorized("alice@example.com".to_string()));
        assert!(transport.deliveries().await.is_empty());
    }

    #[tokio::test]
    async fn test_inactive_mailbox_is_refused() {
        let store = MemoryStore::new();
        let domain = seed_domain(&store, "example.com", true).await;
        let mut alice = seed_mailbox(&store, &domain, "alice").await;
        alice.mailbox.is_active = false;
        let transport = RecordingTransport::new();

        let err = client(&store, transport.clone())
            .send(&alice, None, &message("dave@example.net"))
            .await
            .unwrap_err();
        assert!(matches!(err, RelayError::Unauthorized(_)));
        assert!(transport.deliveries().await.is_empty());
    }

    #[tokio::test]
    async fn test_transport_failure_stores_nothing() {
        let store = MemoryStore::new();
        let domain = seed_domain(&store, "example.com", true).await;
        let alice = seed_mailbox(&store, &domain, "alice").await;
        seed_mailbox(&store, &domain, "bob").await;
        let transport = RecordingTransport::failing(RelayError::Rejected {
            permanent: true,
            message: "550 5.7.1 relaying denied".to_string(),
        });

        let err = client(&store, transport)
            .send(&alice, None, &message("bob@example.com"))
            .await
            .unwrap_err();
        assert!(matches!(err, RelayError::Rejected { permanent: true, .. }));
        assert!(store.all_messages().await.is_empty());
    }

    #[tokio::test]
    async fn test_credentials_fall_back_to_stored_secret() {
        let store = MemoryStore::new();
        let domain = seed_domain(&store, "example.com", true).await;
        let alice = seed_mailbox(&store, &domain, "alice").await;
        let client = client(&store, RecordingTransport::new());

        let stored = client.credentials(&alice, None).unwrap();
        assert_eq!(stored.password, "secret");
        let explicit = client.credentials(&alice, Some("override")).unwrap();
        assert_eq!(explicit.password, "override");

        let fresh = MailboxRepository::get(&store, alice.mailbox.id).await.unwrap().unwrap();
        let mut without_secret = fresh.clone();
        without_secret.mailbox.smtp_secret_encrypted = None;
        assert_eq!(client.credentials(&without_secret, None), None);
    }
}
