//! Live DNS lookups

use async_trait::async_trait;
use mailtrust_common::config::DnsConfig;
use mailtrust_common::types::RecordType;
use mailtrust_common::{Error, Result};
use std::collections::HashMap;
use std::future::Future;
use std::net::IpAddr;
use std::time::Duration;
use tracing::{debug, info};
use trust_dns_resolver::config::{NameServerConfigGroup, ResolverConfig, ResolverOpts};
use trust_dns_resolver::error::{ResolveError, ResolveErrorKind};
use trust_dns_resolver::TokioAsyncResolver;

/// Lookup failure for a single name
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum DnsLookupError {
    #[error("no records found for {0}")]
    NotFound(String),

    #[error("lookup timed out after {0}s")]
    Timeout(u64),

    #[error("lookup failed: {0}")]
    Failed(String),
}

/// Resolver seam used by the verifier and the DKIM validator.
///
/// TXT values come back with their character-strings concatenated; MX
/// values are exchange host names without the trailing dot.
#[async_trait]
pub trait DnsLookup: Send + Sync {
    async fn lookup_a(&self, name: &str) -> std::result::Result<Vec<String>, DnsLookupError>;
    async fn lookup_mx(&self, name: &str) -> std::result::Result<Vec<String>, DnsLookupError>;
    async fn lookup_txt(&self, name: &str) -> std::result::Result<Vec<String>, DnsLookupError>;

    async fn lookup(
        &self,
        record_type: RecordType,
        name: &str,
    ) -> std::result::Result<Vec<String>, DnsLookupError> {
        match record_type {
            RecordType::A => self.lookup_a(name).await,
            RecordType::Mx => self.lookup_mx(name).await,
            RecordType::Txt => self.lookup_txt(name).await,
            RecordType::Cname => Err(DnsLookupError::Failed(format!(
                "{} lookups are not supported",
                record_type
            ))),
        }
    }
}

/// Resolver backed by `trust-dns` with a hard per-call timeout
pub struct SystemResolver {
    resolver: TokioAsyncResolver,
    timeout: Duration,
}

impl SystemResolver {
    pub fn new(config: &DnsConfig) -> Result<Self> {
        let timeout = Duration::from_secs(config.timeout_secs.max(1));
        let mut opts = ResolverOpts::default();
        opts.timeout = timeout;
        opts.attempts = 1;

        let resolver = if config.nameservers.is_empty() {
            match TokioAsyncResolver::tokio_from_system_conf() {
                Ok(resolver) => resolver,
                Err(e) => {
                    debug!(error = %e, "System resolver configuration unavailable, using defaults");
                    TokioAsyncResolver::tokio(ResolverConfig::default(), opts)
                }
            }
        } else {
            let ips = config
                .nameservers
                .iter()
                .map(|s| {
                    s.parse::<IpAddr>()
                        .map_err(|_| Error::Config(format!("Invalid nameserver address: {}", s)))
                })
                .collect::<Result<Vec<_>>>()?;
            info!(nameservers = ?ips, "Using configured nameservers");
            let group = NameServerConfigGroup::from_ips_clear(&ips, 53, true);
            TokioAsyncResolver::tokio(ResolverConfig::from_parts(None, vec![], group), opts)
        };

        Ok(Self { resolver, timeout })
    }

    async fn timed<T, F>(&self, name: &str, lookup: F) -> std::result::Result<T, DnsLookupError>
    where
        F: Future<Output = std::result::Result<T, ResolveError>>,
    {
        match tokio::time::timeout(self.timeout, lookup).await {
            Ok(Ok(found)) => Ok(found),
            Ok(Err(e)) => Err(classify(name, &e, self.timeout)),
            Err(_) => Err(DnsLookupError::Timeout(self.timeout.as_secs())),
        }
    }
}

fn classify(name: &str, e: &ResolveError, timeout: Duration) -> DnsLookupError {
    match e.kind() {
        ResolveErrorKind::NoRecordsFound { .. } => DnsLookupError::NotFound(name.to_string()),
        ResolveErrorKind::Timeout => DnsLookupError::Timeout(timeout.as_secs()),
        _ => DnsLookupError::Failed(e.to_string()),
    }
}

#[async_trait]
impl DnsLookup for SystemResolver {
    async fn lookup_a(&self, name: &str) -> std::result::Result<Vec<String>, DnsLookupError> {
        let lookup = self.timed(name, self.resolver.ipv4_lookup(name)).await?;
        Ok(lookup.iter().map(|a| a.to_string()).collect())
    }

    async fn lookup_mx(&self, name: &str) -> std::result::Result<Vec<String>, DnsLookupError> {
        let lookup = self.timed(name, self.resolver.mx_lookup(name)).await?;
        Ok(lookup
            .iter()
            .map(|mx| mx.exchange().to_utf8().trim_end_matches('.').to_string())
            .collect())
    }

    async fn lookup_txt(&self, name: &str) -> std::result::Result<Vec<String>, DnsLookupError> {
        let lookup = self.timed(name, self.resolver.txt_lookup(name)).await?;
        Ok(lookup
            .iter()
            .map(|txt| {
                txt.txt_data()
                    .iter()
                    .map(|segment| String::from_utf8_lossy(segment))
                    .collect::<String>()
            })
            .collect())
    }
}

/// Fixed answers keyed by type and name; unknown names are `NotFound`
#[derive(Debug, Clone, Default)]
pub struct StaticResolver {
    answers: HashMap<(RecordType, String), std::result::Result<Vec<String>, DnsLookupError>>,
}

impl StaticResolver {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, record_type: RecordType, name: &str, values: Vec<String>) -> Self {
        self.answers.insert((record_type, key(name)), Ok(values));
        self
    }

    pub fn with_error(mut self, record_type: RecordType, name: &str, error: DnsLookupError) -> Self {
        self.answers.insert((record_type, key(name)), Err(error));
        self
    }

    fn answer(&self, record_type: RecordType, name: &str) -> std::result::Result<Vec<String>, DnsLookupError> {
        self.answers
            .get(&(record_type, key(name)))
            .cloned()
            .unwrap_or_else(|| Err(DnsLookupError::NotFound(name.to_string())))
    }
}

fn key(name: &str) -> String {
    name.trim_end_matches('.').to_ascii_lowercase()
}

#[async_trait]
impl DnsLookup for StaticResolver {
    async fn lookup_a(&self, name: &str) -> std::result::Result<Vec<String>, DnsLookupError> {
        self.answer(RecordType::A, name)
    }

    async fn lookup_mx(&self, name: &str) -> std::result::Result<Vec<String>, DnsLookupError> {
        self.answer(RecordType::Mx, name)
    }

    async fn lookup_txt(&self, name: &str) -> std::result::Result<Vec<String>, DnsLookupError> {
        self.answer(RecordType::Txt, name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_static_resolver() {
        let resolver = StaticResolver::new()
            .with(RecordType::A, "Example.com.", vec!["192.0.2.1".to_string()])
            .with_error(RecordType::Txt, "example.com", DnsLookupError::Timeout(5));

        assert_eq!(
            resolver.lookup(RecordType::A, "example.com").await.unwrap(),
            vec!["192.0.2.1"]
        );
        assert_eq!(
            resolver.lookup_txt("example.com").await,
            Err(DnsLookupError::Timeout(5))
        );
        assert!(matches!(
            resolver.lookup_mx("example.com").await,
            Err(DnsLookupError::NotFound(_))
        ));
        assert!(resolver.lookup(RecordType::Cname, "example.com").await.is_err());
    }

    #[test]
    fn test_system_resolver_rejects_bad_nameserver() {
        let config = DnsConfig {
            nameservers: vec!["not-an-ip".to_string()],
            ..DnsConfig::default()
        };
        assert!(matches!(SystemResolver::new(&config), Err(Error::Config(_))));
    }
}
