//! Delivery of accepted messages to local mailboxes

use mailtrust_common::types::{EmailAddress, MailboxId, MessageDirection, MessageId};
use mailtrust_common::Result;
use mailtrust_storage::models::CreateMessage;
use mailtrust_storage::repository::{MailboxRepository, MessageRepository};
use serde::Serialize;
use std::sync::Arc;
use tracing::{debug, info};

/// The parts of a message the router persists
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ParsedMessage {
    pub subject: String,
    /// First address of the `From` header
    pub from_header: Option<String>,
    pub text_body: Option<String>,
    pub html_body: Option<String>,
}

impl ParsedMessage {
    /// Parse raw RFC 5322 bytes; unparseable input yields an empty message
    pub fn parse(raw: &[u8]) -> Self {
        let Some(message) = mail_parser::MessageParser::default().parse(raw) else {
            return Self::default();
        };

        Self {
            subject: message.subject().unwrap_or_default().to_string(),
            from_header: message
                .from()
                .and_then(|a| a.first())
                .and_then(|a| a.address())
                .map(|a| a.to_lowercase()),
            text_body: message.body_text(0).map(|b| b.into_owned()),
            html_body: message.body_html(0).map(|b| b.into_owned()),
        }
    }

    /// Domain of the header `From` address
    pub fn from_domain(&self) -> Option<String> {
        self.from_header
            .as_deref()
            .and_then(EmailAddress::parse)
            .map(|a| a.domain)
    }
}

/// Where a recipient's copy ended up
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case", tag = "outcome")]
pub enum RouteOutcome {
    StoredLocal {
        mailbox_id: MailboxId,
        message_id: MessageId,
    },
    /// No usable local mailbox; accepted at the protocol level, not stored
    AcceptedUnroutable,
}

pub struct MessageRouter {
    mailboxes: Arc<dyn MailboxRepository>,
    messages: Arc<dyn MessageRepository>,
}

impl MessageRouter {
    pub fn new(mailboxes: Arc<dyn MailboxRepository>, messages: Arc<dyn MessageRepository>) -> Self {
        Self { mailboxes, messages }
    }

    /// Store an inbound message for `recipient` if it is a local mailbox on
    /// a verified domain
    pub async fn route(
        &self,
        envelope_from: Option<&EmailAddress>,
        recipient: &EmailAddress,
        parsed: &ParsedMessage,
        dkim_verified: Option<bool>,
    ) -> Result<RouteOutcome> {
        let from_address = envelope_from
            .map(|a| a.address())
            .or_else(|| parsed.from_header.clone())
            .unwrap_or_default();

        self.store(
            recipient,
            CreateMessage {
                mailbox_id: None,
                from_address,
                to_address: recipient.address(),
                subject: parsed.subject.clone(),
                text_body: parsed.text_body.clone(),
                html_body: parsed.html_body.clone(),
                dkim_verified,
                direction: MessageDirection::Inbound,
            },
        )
        .await
    }

    /// Store the relayed copy of an outbound message for a local recipient
    pub async fn store_outbound_copy(
        &self,
        from: &EmailAddress,
        recipient: &EmailAddress,
        subject: &str,
        text_body: Option<&str>,
        html_body: Option<&str>,
    ) -> Result<RouteOutcome> {
        self.store(
            recipient,
            CreateMessage {
                mailbox_id: None,
                from_address: from.address(),
                to_address: recipient.address(),
                subject: subject.to_string(),
                text_body: text_body.map(str::to_string),
                html_body: html_body.map(str::to_string),
                dkim_verified: Some(true),
                direction: MessageDirection::Outbound,
            },
        )
        .await
    }

    async fn store(&self, recipient: &EmailAddress, mut message: CreateMessage) -> Result<RouteOutcome> {
        let mailbox = self
            .mailboxes
            .find_local(&recipient.local, &recipient.domain)
            .await?
            .filter(|m| m.is_usable());

        let Some(mailbox) = mailbox else {
            debug!(%recipient, "No local mailbox, not stored");
            return Ok(RouteOutcome::AcceptedUnroutable);
        };

        message.mailbox_id = Some(mailbox.mailbox.id);
        let direction = message.direction;
        let stored = self.messages.create(message).await?;
        info!(
            %recipient,
            mailbox_id = %mailbox.mailbox.id,
            message_id = %stored.id,
            %direction,
            "Message stored"
        );

        Ok(RouteOutcome::StoredLocal {
            mailbox_id: mailbox.mailbox.id,
            message_id: stored.id,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{seed_domain, seed_mailbox};
    use mailtrust_storage::MemoryStore;
    use pretty_assertions::assert_eq;

    const RAW: &[u8] = b"From: Carol <Carol@Example.org>\r\nTo: alice@example.com\r\nSubject: Lunch\r\n\r\nNoon?\r\n";

    fn router(store: &MemoryStore) -> MessageRouter {
        MessageRouter::new(Arc::new(store.clone()), Arc::new(store.clone()))
    }

    #[test]
    fn test_parse_message() {
        let parsed = ParsedMessage::parse(RAW);
        assert_eq!(parsed.subject, "Lunch");
        assert_eq!(parsed.from_header.as_deref(), Some("carol@example.org"));
        assert_eq!(parsed.from_domain().as_deref(), Some("example.org"));
        assert_eq!(parsed.text_body.as_deref().map(str::trim), Some("Noon?"));
    }

    #[tokio::test]
    async fn test_route_to_local_mailbox() {
        let store = MemoryStore::new();
        let domain = seed_domain(&store, "example.com", true).await;
        let mailbox = seed_mailbox(&store, &domain, "alice").await;

        let sender = EmailAddress::new("carol", "example.org");
        let outcome = router(&store)
            .route(
                Some(&sender),
                &EmailAddress::new("alice", "example.com"),
                &ParsedMessage::parse(RAW),
                Some(true),
            )
            .await
            .unwrap();

        let RouteOutcome::StoredLocal { mailbox_id, message_id } = outcome else {
            panic!("expected local delivery, got {:?}", outcome);
        };
        assert_eq!(mailbox_id, mailbox.mailbox.id);

        let stored = MessageRepository::get(&store, message_id).await.unwrap().unwrap();
        assert_eq!(stored.from_address, "carol@example.org");
        assert_eq!(stored.to_address, "alice@example.com");
        assert_eq!(stored.subject, "Lunch");
        assert_eq!(stored.direction, "inbound");
        assert_eq!(stored.dkim_verified, Some(true));
    }

    #[tokio::test]
    async fn test_unknown_recipient_is_not_stored() {
        let store = MemoryStore::new();
        seed_domain(&store, "example.com", true).await;

        let outcome = router(&store)
            .route(None, &EmailAddress::new("ghost", "example.com"), &ParsedMessage::parse(RAW), None)
            .await
            .unwrap();
        assert_eq!(outcome, RouteOutcome::AcceptedUnroutable);
        assert!(store.all_messages().await.is_empty());
    }

    #[tokio::test]
    async fn test_unverified_domain_is_not_routed() {
        let store = MemoryStore::new();
        let domain = seed_domain(&store, "example.com", false).await;
        seed_mailbox(&store, &domain, "alice").await;

        let outcome = router(&store)
            .route(None, &EmailAddress::new("alice", "example.com"), &ParsedMessage::parse(RAW), None)
            .await
            .unwrap();
        assert_eq!(outcome, RouteOutcome::AcceptedUnroutable);
    }

    #[tokio::test]
    async fn test_outbound_copy() {
        let store = MemoryStore::new();
        let domain = seed_domain(&store, "example.com", true).await;
        seed_mailbox(&store, &domain, "bob").await;

        let outcome = router(&store)
            .store_outbound_copy(
                &EmailAddress::new("alice", "example.com"),
                &EmailAddress::new("bob", "example.com"),
                "Hi",
                None,
                Some("<p>Hi</p>"),
            )
            .await
            .unwrap();
        assert!(matches!(outcome, RouteOutcome::StoredLocal { .. }));

        let messages = store.all_messages().await;
        assert_eq!(messages.len(), 1);
        assert_eq!(messages[0].direction, "outbound");
        assert_eq!(messages[0].html_body.as_deref(), Some("<p>Hi</p>"));
    }
}
