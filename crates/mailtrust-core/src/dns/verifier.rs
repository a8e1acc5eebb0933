//! Verification of stored records against live DNS, with self-healing
//!
//! A and MX values must match exactly (MX host names case-insensitively,
//! trailing dot ignored). A TXT value matches when its normalized form is
//! contained in a normalized live value. When a record resolved to at
//! least one value but did not match, and the self-heal policy allows the
//! type, the stored value is replaced with the first live value. The pass
//! that heals still reports the mismatch.

use super::normalize::normalize_txt;
use super::records::fqdn;
use super::resolver::DnsLookup;
use crate::dkim::join_txt_chunks;
use mailtrust_common::config::SelfHealPolicy;
use mailtrust_common::types::{DnsRecordId, RecordType};
use mailtrust_common::Result;
use mailtrust_storage::models::{DnsRecord, Domain};
use mailtrust_storage::repository::DnsRecordRepository;
use serde::Serialize;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Outcome for one stored record
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RecordCheck {
    pub record_id: DnsRecordId,
    /// Fully-qualified name that was queried
    pub name: String,
    pub expected: String,
    pub found: Vec<String>,
    pub matched: bool,
    pub error: Option<String>,
    /// Stored value was replaced with the live value
    pub healed: bool,
}

/// Outcome for one record type
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct VerificationResult {
    pub record_type: RecordType,
    pub matched: bool,
    pub expected: Vec<String>,
    pub found: Vec<String>,
    pub error: Option<String>,
    pub records: Vec<RecordCheck>,
}

/// Outcome for a set of record types
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct AggregateResult {
    pub verified: bool,
    pub results: Vec<VerificationResult>,
}

pub struct DnsVerifier {
    records: Arc<dyn DnsRecordRepository>,
    resolver: Arc<dyn DnsLookup>,
    self_heal: SelfHealPolicy,
}

impl DnsVerifier {
    pub fn new(
        records: Arc<dyn DnsRecordRepository>,
        resolver: Arc<dyn DnsLookup>,
        self_heal: SelfHealPolicy,
    ) -> Self {
        Self {
            records,
            resolver,
            self_heal,
        }
    }

    /// Verify every stored record of `record_type` for `domain`
    pub async fn verify(&self, domain: &Domain, record_type: RecordType) -> Result<VerificationResult> {
        let stored = self.records.list_by_type(domain.id, record_type).await?;

        if stored.is_empty() {
            return Ok(VerificationResult {
                record_type,
                matched: false,
                expected: Vec::new(),
                found: Vec::new(),
                error: Some(format!("no {} records on file", record_type)),
                records: Vec::new(),
            });
        }

        let mut checks = Vec::with_capacity(stored.len());
        for record in &stored {
            checks.push(self.check_record(domain, record_type, record).await?);
        }

        let result = VerificationResult {
            record_type,
            matched: checks.iter().all(|c| c.matched),
            expected: checks.iter().map(|c| c.expected.clone()).collect(),
            found: checks.iter().flat_map(|c| c.found.iter().cloned()).collect(),
            error: checks.iter().find_map(|c| c.error.clone()),
            records: checks,
        };

        debug!(
            domain = %domain.name,
            record_type = %record_type,
            matched = result.matched,
            "DNS verification"
        );
        Ok(result)
    }

    /// Verify each type; `verified` only when every type matched
    pub async fn verify_all(&self, domain: &Domain, types: &[RecordType]) -> Result<AggregateResult> {
        let mut results = Vec::with_capacity(types.len());
        for record_type in types {
            results.push(self.verify(domain, *record_type).await?);
        }
        Ok(AggregateResult {
            verified: !results.is_empty() && results.iter().all(|r| r.matched),
            results,
        })
    }

    async fn check_record(
        &self,
        domain: &Domain,
        record_type: RecordType,
        record: &DnsRecord,
    ) -> Result<RecordCheck> {
        let name = fqdn(&record.name, &domain.name);
        let mut check = RecordCheck {
            record_id: record.id,
            name: name.clone(),
            expected: record.value.clone(),
            found: Vec::new(),
            matched: false,
            error: None,
            healed: false,
        };

        match self.resolver.lookup(record_type, &name).await {
            Ok(found) => {
                check.matched = found.iter().any(|live| value_matches(record_type, &record.value, live));
                check.found = found;
            }
            Err(e) => {
                warn!(%name, record_type = %record_type, error = %e, "DNS lookup failed");
                check.error = Some(e.to_string());
                return Ok(check);
            }
        }

        if !check.matched {
            if let Some(live) = check.found.first() {
                if self.self_heal.allows(record_type) {
                    info!(
                        %name,
                        record_type = %record_type,
                        stored = %record.value,
                        live = %live,
                        "Adopting live DNS value for drifted record"
                    );
                    self.records.update_value(record.id, live).await?;
                    check.healed = true;
                } else {
                    warn!(%name, record_type = %record_type, "Record drifted; self-heal disabled for type");
                }
            }
        }

        Ok(check)
    }
}

fn value_matches(record_type: RecordType, expected: &str, live: &str) -> bool {
    match record_type {
        RecordType::Mx | RecordType::Cname => {
            expected.trim().trim_end_matches('.').eq_ignore_ascii_case(live.trim().trim_end_matches('.'))
        }
        RecordType::A => expected.trim() == live.trim(),
        RecordType::Txt => {
            normalize_txt(&join_txt_chunks(live)).contains(&normalize_txt(&join_txt_chunks(expected)))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dns::records::{synthesize, RecordOptions};
    use crate::dns::resolver::{DnsLookupError, StaticResolver};
    use crate::testing::seed_domain;
    use mailtrust_storage::MemoryStore;
    use pretty_assertions::assert_eq;

    async fn seeded(store: &MemoryStore) -> Domain {
        let domain = seed_domain(store, "example.com", false).await;
        let records =
            synthesize("example.com", "203.0.113.5", "dkim", "MIIBkey", &RecordOptions::default()).unwrap();
        store.upsert_many(domain.id, &records).await.unwrap();
        domain
    }

    fn correct_dns() -> StaticResolver {
        StaticResolver::new()
            .with(RecordType::A, "example.com", vec!["203.0.113.5".into()])
            .with(RecordType::A, "mail.example.com", vec!["203.0.113.5".into()])
            .with(RecordType::Mx, "example.com", vec!["MAIL.example.com".into()])
            .with(
                RecordType::Txt,
                "example.com",
                vec!["google-site-verification=abc".into(), "v=spf1 ip4:203.0.113.5 mx ~all".into()],
            )
            .with(RecordType::Txt, "dkim._domainkey.example.com", vec!["v=DKIM1; k=rsa; p=MIIBkey".into()])
            .with(
                RecordType::Txt,
                "_dmarc.example.com",
                vec!["v=DMARC1;  p=quarantine; rua=mailto:dmarc@example.com; fo=1".into()],
            )
    }

    fn verifier(store: &MemoryStore, resolver: StaticResolver, policy: SelfHealPolicy) -> DnsVerifier {
        DnsVerifier::new(Arc::new(store.clone()), Arc::new(resolver), policy)
    }

    #[tokio::test]
    async fn test_verified_when_dns_matches() {
        let store = MemoryStore::new();
        let domain = seeded(&store).await;
        let result = verifier(&store, correct_dns(), SelfHealPolicy::All)
            .verify_all(&domain, &[RecordType::Mx, RecordType::Txt, RecordType::A])
            .await
            .unwrap();

        assert!(result.verified, "{:?}", result);
        assert!(result.results.iter().all(|r| r.error.is_none()));
        assert!(result.results.iter().flat_map(|r| &r.records).all(|c| !c.healed));
    }

    #[tokio::test]
    async fn test_no_records_on_file() {
        let store = MemoryStore::new();
        let domain = seed_domain(&store, "example.com", false).await;
        let result = verifier(&store, correct_dns(), SelfHealPolicy::All)
            .verify(&domain, RecordType::Mx)
            .await
            .unwrap();
        assert!(!result.matched);
        assert_eq!(result.error.as_deref(), Some("no MX records on file"));
    }

    #[tokio::test]
    async fn test_timeout_is_never_a_pass() {
        let store = MemoryStore::new();
        let domain = seeded(&store).await;
        let resolver = correct_dns().with_error(RecordType::Mx, "example.com", DnsLookupError::Timeout(5));

        let result = verifier(&store, resolver, SelfHealPolicy::All)
            .verify_all(&domain, &[RecordType::Mx, RecordType::Txt])
            .await
            .unwrap();
        assert!(!result.verified);
        let mx = &result.results[0];
        assert!(!mx.matched);
        assert_eq!(mx.error.as_deref(), Some("lookup timed out after 5s"));
        // Failed lookups never heal
        let stored = store.list_by_type(domain.id, RecordType::Mx).await.unwrap();
        assert_eq!(stored[0].value, "mail.example.com");
    }

    #[tokio::test]
    async fn test_self_heal_converges() {
        let store = MemoryStore::new();
        let domain = seeded(&store).await;
        let resolver = correct_dns().with(
            RecordType::Txt,
            "_dmarc.example.com",
            vec!["v=DMARC1; p=reject; rua=mailto:reports@example.net".into()],
        );
        let verifier = verifier(&store, resolver, SelfHealPolicy::All);

        let first = verifier.verify(&domain, RecordType::Txt).await.unwrap();
        assert!(!first.matched);
        assert!(first.records.iter().any(|c| c.healed));

        let dmarc = store
            .list_by_type(domain.id, RecordType::Txt)
            .await
            .unwrap()
            .into_iter()
            .find(|r| r.name == "_dmarc")
            .unwrap();
        assert_eq!(dmarc.value, "v=DMARC1; p=reject; rua=mailto:reports@example.net");

        let second = verifier.verify(&domain, RecordType::Txt).await.unwrap();
        assert!(second.matched);
    }

    #[tokio::test]
    async fn test_txt_only_policy_never_heals_mx() {
        let store = MemoryStore::new();
        let domain = seeded(&store).await;
        let resolver = correct_dns().with(RecordType::Mx, "example.com", vec!["mx.attacker.test".into()]);

        let result = verifier(&store, resolver, SelfHealPolicy::TxtOnly)
            .verify(&domain, RecordType::Mx)
            .await
            .unwrap();
        assert!(!result.matched);
        assert!(!result.records[0].healed);
        let stored = store.list_by_type(domain.id, RecordType::Mx).await.unwrap();
        assert_eq!(stored[0].value, "mail.example.com");
    }

    #[test]
    fn test_match_rules() {
        assert!(value_matches(RecordType::A, "203.0.113.5", "203.0.113.5"));
        assert!(!value_matches(RecordType::A, "203.0.113.5", "203.0.113.50"));
        assert!(value_matches(RecordType::Mx, "mail.example.com", "Mail.Example.com."));
        assert!(!value_matches(RecordType::Mx, "mail.example.com", "mail.example.com.evil"));
        assert!(value_matches(
            RecordType::Txt,
            "v=DKIM1; k=rsa; p=ABC",
            "\"V=DKIM1;   k=rsa; p=abc\" \"\""
        ));
        assert!(!value_matches(RecordType::Txt, "v=spf1 ip4:1.2.3.4 mx ~all", "v=spf1 -all"));
    }
}
