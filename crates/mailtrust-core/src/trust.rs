//! Domain onboarding and the persisted `verified` flag

use crate::dkim::{generate_key_pair, public_key_from_private_pem};
use crate::dns::records::{is_valid_domain_name, is_valid_selector, synthesize, RecordOptions};
use crate::dns::resolver::DnsLookup;
use crate::dns::verifier::{DnsVerifier, VerificationResult};
use mailtrust_common::config::{DkimConfig, DnsConfig};
use mailtrust_common::types::{AdminId, DomainId, RecordType};
use mailtrust_common::{Error, Result};
use mailtrust_storage::models::{CreateDomain, DnsRecord, Domain};
use mailtrust_storage::repository::{DnsRecordRepository, DomainRepository};
use serde::Serialize;
use std::net::Ipv4Addr;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Result of onboarding a domain
#[derive(Debug, Clone, Serialize)]
pub struct OnboardOutcome {
    pub domain: Domain,
    pub records: Vec<DnsRecord>,
    /// False when the domain already existed for this admin
    pub created: bool,
}

/// Result of a trust check
#[derive(Debug, Clone, Serialize)]
pub struct TrustReport {
    pub domain: Domain,
    /// Every checked type matched
    pub verified: bool,
    /// The domain's `verified` flag was written by this check
    pub persisted: bool,
    pub results: Vec<VerificationResult>,
}

/// Owns onboarding and is the only writer of `Domain::verified`
pub struct TrustStateManager {
    domains: Arc<dyn DomainRepository>,
    records: Arc<dyn DnsRecordRepository>,
    verifier: DnsVerifier,
    dns: DnsConfig,
    dkim: DkimConfig,
}

impl TrustStateManager {
    pub fn new(
        domains: Arc<dyn DomainRepository>,
        records: Arc<dyn DnsRecordRepository>,
        resolver: Arc<dyn DnsLookup>,
        dns: DnsConfig,
        dkim: DkimConfig,
    ) -> Self {
        let verifier = DnsVerifier::new(records.clone(), resolver, dns.self_heal);
        Self {
            domains,
            records,
            verifier,
            dns,
            dkim,
        }
    }

    /// Onboard `domain_name` for `admin_id`.
    ///
    /// Idempotent per `(admin_id, name)`: an existing domain is returned with
    /// its records and its keys are never rotated.
    pub async fn onboard(
        &self,
        admin_id: AdminId,
        domain_name: &str,
        server_ip: Option<&str>,
    ) -> Result<OnboardOutcome> {
        let name = domain_name.trim().trim_end_matches('.').to_ascii_lowercase();
        if !is_valid_domain_name(&name) {
            return Err(Error::Validation(format!("Invalid domain name: {}", domain_name)));
        }

        if let Some(existing) = self.domains.find_for_admin(admin_id, &name).await? {
            debug!(domain = %name, "Domain already onboarded");
            return self.existing(existing, server_ip).await;
        }

        let server_ip = self.server_ip(server_ip)?;
        let selector = self.dkim.default_selector.clone();
        if !is_valid_selector(&selector) {
            return Err(Error::Config(format!("Invalid DKIM selector: {}", selector)));
        }

        let bits = self.dkim.key_bits;
        let keys = tokio::task::spawn_blocking(move || generate_key_pair(bits))
            .await
            .map_err(|e| Error::Internal(format!("Key generation task failed: {}", e)))??;

        let domain = match self
            .domains
            .create(CreateDomain {
                admin_id,
                name: name.clone(),
                dkim_selector: selector,
                dkim_private_key: keys.private_key_pem,
                dkim_public_key: keys.public_key,
            })
            .await
        {
            Ok(domain) => domain,
            Err(Error::Conflict(_)) => {
                // Lost a race with a concurrent onboarding of the same pair
                let existing = self
                    .domains
                    .find_for_admin(admin_id, &name)
                    .await?
                    .ok_or_else(|| Error::Internal(format!("Domain {} vanished after conflict", name)))?;
                return self.existing(existing, Some(&server_ip)).await;
            }
            Err(e) => return Err(e),
        };

        let records = self.publish_records(&domain, &server_ip).await?;
        info!(domain = %domain.name, domain_id = %domain.id, records = records.len(), "Domain onboarded");

        Ok(OnboardOutcome {
            domain,
            records,
            created: true,
        })
    }

    /// Verify one type without touching the flag, or the configured set and
    /// persist the aggregate
    pub async fn check_trust(
        &self,
        domain_id: DomainId,
        record_type: Option<RecordType>,
    ) -> Result<TrustReport> {
        let mut domain = self
            .domains
            .get(domain_id)
            .await?
            .ok_or_else(|| Error::NotFound(format!("Domain {} not found", domain_id)))?;

        if let Some(record_type) = record_type {
            let result = self.verifier.verify(&domain, record_type).await?;
            return Ok(TrustReport {
                domain,
                verified: result.matched,
                persisted: false,
                results: vec![result],
            });
        }

        let aggregate = self.verifier.verify_all(&domain, &self.dns.verify_types).await?;
        self.domains.set_verified(domain.id, aggregate.verified).await?;

        if domain.verified != aggregate.verified {
            info!(
                domain = %domain.name,
                verified = aggregate.verified,
                "Domain trust state changed"
            );
        }
        domain.verified = aggregate.verified;

        Ok(TrustReport {
            domain,
            verified: aggregate.verified,
            persisted: true,
            results: aggregate.results,
        })
    }

    async fn existing(&self, domain: Domain, server_ip: Option<&str>) -> Result<OnboardOutcome> {
        let mut records = self.records.list_for_domain(domain.id).await?;

        // A domain row without records (interrupted onboarding) gets them
        // regenerated from its stored key
        if records.is_empty() {
            match self.server_ip(server_ip) {
                Ok(ip) => records = self.publish_records(&domain, &ip).await?,
                Err(e) => warn!(domain = %domain.name, error = %e, "Cannot regenerate missing records"),
            }
        }

        Ok(OnboardOutcome {
            domain,
            records,
            created: false,
        })
    }

    async fn publish_records(&self, domain: &Domain, server_ip: &str) -> Result<Vec<DnsRecord>> {
        let selector = domain
            .dkim_selector
            .clone()
            .unwrap_or_else(|| self.dkim.default_selector.clone());

        let public_key = match (&domain.dkim_public_key, &domain.dkim_private_key) {
            (Some(public), _) => public.clone(),
            (None, Some(private)) => public_key_from_private_pem(private)?,
            (None, None) => {
                return Err(Error::Config(format!("No DKIM key on file for {}", domain.name)));
            }
        };

        let records = synthesize(
            &domain.name,
            server_ip,
            &selector,
            &public_key,
            &RecordOptions::from(&self.dns),
        )?;
        self.records.upsert_many(domain.id, &records).await
    }

    fn server_ip(&self, explicit: Option<&str>) -> Result<String> {
        let ip = explicit
            .map(str::to_string)
            .or_else(|| self.dns.server_ip.clone())
            .ok_or_else(|| Error::Config("Server IP is not configured".to_string()))?;

        ip.trim()
            .parse::<Ipv4Addr>()
            .map(|ip| ip.to_string())
            .map_err(|_| Error::Config(format!("Server IP {:?} is not a valid IPv4 address", ip)))
    }
}
