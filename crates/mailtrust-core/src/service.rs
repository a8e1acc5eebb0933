//! Entry points for the administrative and send-message surfaces

use crate::dns::records::{display_value, fqdn};
use crate::dns::resolver::DnsLookup;
use crate::relay::{MailTransport, OutboundMessage, OutboundRelayClient, RelayError};
use crate::router::MessageRouter;
use crate::trust::{OnboardOutcome, TrustReport, TrustStateManager};
use mailtrust_common::types::{AdminId, DomainId, EmailAddress, MailboxId, MessageId, RecordType};
use mailtrust_common::{Config, Error, Result, SecretCipher};
use mailtrust_storage::models::{DnsRecord, Message};
use mailtrust_storage::Repositories;
use serde::Serialize;
use std::sync::Arc;
use tracing::{info, warn};

/// A record as an operator enters it in their zone
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DnsRecordView {
    pub record_type: String,
    /// Fully-qualified name
    pub name: String,
    /// Long TXT values are quoted and split into 255-character strings
    pub value: String,
    pub priority: Option<i32>,
    pub ttl: i32,
}

impl DnsRecordView {
    pub fn new(record: &DnsRecord, domain: &str) -> Self {
        let value = match record.record_type_enum() {
            Some(record_type) => display_value(record_type, &record.value),
            None => record.value.clone(),
        };
        Self {
            record_type: record.record_type.clone(),
            name: fqdn(&record.name, domain),
            value,
            priority: record.priority,
            ttl: record.ttl,
        }
    }

    pub fn for_outcome(outcome: &OnboardOutcome) -> Vec<Self> {
        outcome
            .records
            .iter()
            .map(|r| Self::new(r, &outcome.domain.name))
            .collect()
    }
}

/// Result of relaying one message
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RelayOutcome {
    /// The relay accepted the message
    pub delivered: bool,
    /// Copy stored for a local recipient
    pub message_id: Option<MessageId>,
    /// `Message-ID` header of the relayed message
    pub smtp_message_id: String,
}

pub struct MailTrustService {
    repos: Repositories,
    trust: TrustStateManager,
    relay: OutboundRelayClient,
}

impl MailTrustService {
    pub fn new(
        config: &Config,
        repos: Repositories,
        resolver: Arc<dyn DnsLookup>,
        transport: Arc<dyn MailTransport>,
        cipher: Option<SecretCipher>,
    ) -> Self {
        let trust = TrustStateManager::new(
            repos.domains.clone(),
            repos.dns_records.clone(),
            resolver,
            config.dns.clone(),
            config.dkim.clone(),
        );
        let router = Arc::new(MessageRouter::new(repos.mailboxes.clone(), repos.messages.clone()));
        let relay = OutboundRelayClient::new(repos.domains.clone(), router, transport, cipher);
        Self { repos, trust, relay }
    }

    /// Create or return the domain and the records its operator must publish
    pub async fn onboard_domain(&self, admin_id: AdminId, domain_name: &str) -> Result<OnboardOutcome> {
        self.trust.onboard(admin_id, domain_name, None).await
    }

    /// Check one record type, or the configured set when `record_type` is
    /// `None` (the only form that updates the domain's `verified` flag)
    pub async fn check_domain_trust(
        &self,
        domain_id: DomainId,
        record_type: Option<RecordType>,
    ) -> Result<TrustReport> {
        self.trust.check_trust(domain_id, record_type).await
    }

    /// Relay a message as `mailbox_id`. `sender` must be that mailbox's
    /// own address.
    pub async fn relay_message(
        &self,
        mailbox_id: MailboxId,
        sender: &str,
        recipient: &str,
        subject: &str,
        body: &str,
    ) -> Result<RelayOutcome> {
        if sender.trim().is_empty() || recipient.trim().is_empty() || subject.trim().is_empty() || body.is_empty() {
            return Err(Error::Validation(
                "All fields (from, to, subject, body) are required".to_string(),
            ));
        }

        let mailbox = self
            .repos
            .mailboxes
            .get(mailbox_id)
            .await?
            .ok_or_else(|| Error::NotFound(format!("Mailbox {} not found", mailbox_id)))?;

        let from = EmailAddress::parse(sender)
            .ok_or_else(|| Error::Validation("Invalid sender email format".to_string()))?;
        if from.address() != mailbox.full_address() || !mailbox.is_usable() {
            warn!(%mailbox_id, %sender, "Relay refused: sender does not own mailbox or mailbox unusable");
            return Err(Error::PermissionDenied(
                "Unauthorized sender or unverified mailbox".to_string(),
            ));
        }

        let to = EmailAddress::parse(recipient)
            .ok_or_else(|| Error::Validation("Invalid recipient email format".to_string()))?;

        let message = OutboundMessage {
            from,
            to,
            subject: subject.to_string(),
            html_body: body.to_string(),
            text_body: None,
        };

        let receipt = self.relay.send(&mailbox, None, &message).await.map_err(relay_error)?;
        info!(
            %mailbox_id,
            to = %message.to,
            stored = receipt.stored_message_id.is_some(),
            "Relay complete"
        );

        Ok(RelayOutcome {
            delivered: true,
            message_id: receipt.stored_message_id,
            smtp_message_id: receipt.message_id,
        })
    }

    /// Most recent messages of a mailbox on a domain owned by `admin_id`
    pub async fn mailbox_messages(
        &self,
        admin_id: AdminId,
        mailbox_id: MailboxId,
        limit: i64,
    ) -> Result<Vec<Message>> {
        let mailbox = self.repos.mailboxes.get(mailbox_id).await?;
        let domain = match &mailbox {
            Some(m) => self.repos.domains.get(m.mailbox.domain_id).await?,
            None => None,
        };
        if !domain.is_some_and(|d| d.admin_id == admin_id) {
            return Err(Error::PermissionDenied("Unauthorized access to mailbox".to_string()));
        }
        self.repos.messages.list_for_mailbox(mailbox_id, limit.clamp(1, 500)).await
    }
}

fn relay_error(e: RelayError) -> Error {
    match e {
        RelayError::Unauthorized(_) => Error::PermissionDenied(e.to_string()),
        RelayError::MissingDkimKey(_) => Error::Config(e.to_string()),
        RelayError::DnsFailure(_) => Error::Dns(e.to_string()),
        RelayError::Build(_) => Error::Validation(e.to_string()),
        RelayError::Storage(_) => Error::Database(e.to_string()),
        RelayError::AuthRejected(_) => Error::Auth(e.to_string()),
        RelayError::ConnectionFailed(_)
        | RelayError::Rejected { .. }
        | RelayError::Timeout => Error::Smtp(e.to_string()),
    }
}
