//! Inbound DKIM key-match validation
//!
//! This compares the public key on file for the sender's domain with the
//! `p=` value currently published at `<selector>._domainkey.<domain>`. It
//! does not verify a signature over the message headers or body.

use super::keys::public_key_from_private_pem;
use super::tag_value;
use crate::dns::normalize::normalize_txt;
use crate::dns::records::{fqdn, DEFAULT_DKIM_SELECTOR};
use crate::dns::resolver::{DnsLookup, DnsLookupError};
use mailtrust_common::Result;
use mailtrust_storage::repository::DomainRepository;
use std::sync::Arc;
use tracing::{debug, warn};

/// Why a domain did or did not pass the key-match check
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DkimOutcome {
    Pass,
    UnknownDomain,
    Unverified,
    NoKeyOnFile,
    NoDnsKey,
    Mismatch,
    DnsError(String),
}

/// Result of validating one sender domain
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DkimCheck {
    pub domain: String,
    pub selector: Option<String>,
    pub outcome: DkimOutcome,
}

impl DkimCheck {
    pub fn passed(&self) -> bool {
        self.outcome == DkimOutcome::Pass
    }
}

/// Validates sender domains for the inbound session
pub struct InboundDkimValidator {
    domains: Arc<dyn DomainRepository>,
    resolver: Arc<dyn DnsLookup>,
}

impl InboundDkimValidator {
    pub fn new(domains: Arc<dyn DomainRepository>, resolver: Arc<dyn DnsLookup>) -> Self {
        Self { domains, resolver }
    }

    /// Check `domain`; storage failures are returned as errors, every other
    /// failure is a non-passing [`DkimOutcome`]
    pub async fn verify(&self, domain: &str) -> Result<DkimCheck> {
        let domain = domain.trim().trim_end_matches('.').to_ascii_lowercase();
        let check = |selector: Option<String>, outcome: DkimOutcome| DkimCheck {
            domain: domain.clone(),
            selector,
            outcome,
        };

        let Some(record) = self.domains.find_by_name(&domain).await? else {
            debug!(%domain, "DKIM: domain not on file");
            return Ok(check(None, DkimOutcome::UnknownDomain));
        };

        let selector = record
            .dkim_selector
            .clone()
            .unwrap_or_else(|| DEFAULT_DKIM_SELECTOR.to_string());

        if !record.verified {
            debug!(%domain, "DKIM: domain not verified");
            return Ok(check(Some(selector), DkimOutcome::Unverified));
        }

        let stored_key = match (&record.dkim_public_key, &record.dkim_private_key) {
            (Some(public), _) if !public.trim().is_empty() => public.clone(),
            (_, Some(private)) => match public_key_from_private_pem(private) {
                Ok(public) => public,
                Err(e) => {
                    warn!(%domain, error = %e, "DKIM: stored private key unusable");
                    return Ok(check(Some(selector), DkimOutcome::NoKeyOnFile));
                }
            },
            _ => return Ok(check(Some(selector), DkimOutcome::NoKeyOnFile)),
        };

        let name = fqdn(&format!("{}._domainkey", selector), &domain);
        let published = match self.resolver.lookup_txt(&name).await {
            Ok(values) => values,
            Err(DnsLookupError::NotFound(_)) => {
                return Ok(check(Some(selector), DkimOutcome::NoDnsKey));
            }
            Err(e) => {
                warn!(%name, error = %e, "DKIM: key lookup failed");
                return Ok(check(Some(selector), DkimOutcome::DnsError(e.to_string())));
            }
        };

        let expected = key_form(&stored_key);
        let live_keys: Vec<String> = published
            .iter()
            .filter_map(|txt| tag_value(txt, "p").map(key_form))
            .collect();

        let outcome = if live_keys.is_empty() {
            DkimOutcome::NoDnsKey
        } else if live_keys.iter().any(|k| *k == expected) {
            DkimOutcome::Pass
        } else {
            DkimOutcome::Mismatch
        };

        debug!(%domain, %selector, ?outcome, "DKIM key match");
        Ok(check(Some(selector), outcome))
    }
}

/// Normalized key text with interior spacing removed
fn key_form(key: &str) -> String {
    normalize_txt(key).replace(' ', "")
}
