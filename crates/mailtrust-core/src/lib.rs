//! mailtrust Core - domain trust, SMTP sessions and outbound relay
//!
//! This crate onboards sending domains (DKIM keys and the DNS records an
//! operator must publish), verifies those records against live DNS, accepts
//! inbound mail through an explicit SMTP state machine, routes it to local
//! mailboxes, and relays authenticated outbound mail signed with the
//! domain's DKIM key.

pub mod dkim;
pub mod dns;
pub mod relay;
pub mod router;
pub mod service;
pub mod smtp;
pub mod trust;

pub use dkim::{DkimCheck, DkimOutcome, DkimSigner, InboundDkimValidator, KeyMaterial};
pub use dns::{
    AggregateResult, DnsLookup, DnsLookupError, DnsVerifier, RecordOptions, SystemResolver,
    VerificationResult,
};
pub use relay::{
    DeliveryReceipt, MailTransport, OutboundMessage, OutboundRelayClient, RecordingTransport,
    RelayError, SmtpRelayTransport,
};
pub use router::{MessageRouter, RouteOutcome};
pub use service::{DnsRecordView, MailTrustService, RelayOutcome};
pub use smtp::{SessionConfig, SessionContext, SmtpAuthenticator, SmtpServer, SmtpServiceType};
pub use trust::{OnboardOutcome, TrustReport, TrustStateManager};

#[cfg(test)]
pub(crate) mod testing;
