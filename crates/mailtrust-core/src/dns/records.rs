//! Records an operator must publish for a domain

use crate::dkim::{chunk_for_txt, render_txt_chunks, TXT_CHUNK_LEN};
use mailtrust_common::config::DnsConfig;
use mailtrust_common::types::RecordType;
use mailtrust_common::{Error, Result};
use mailtrust_storage::models::NewDnsRecord;
use std::net::Ipv4Addr;

/// Selector used when a domain has none of its own
pub const DEFAULT_DKIM_SELECTOR: &str = "dkim";

/// Knobs for record synthesis
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecordOptions {
    pub mail_label: String,
    pub mx_priority: i32,
    pub ttl: i32,
    /// Policy id for `_mta-sts`; no record when `None`
    pub mta_sts_id: Option<String>,
    /// `rua` address for `_smtp._tls`; no record when `None`
    pub tls_report_address: Option<String>,
}

impl Default for RecordOptions {
    fn default() -> Self {
        Self::from(&DnsConfig::default())
    }
}

impl From<&DnsConfig> for RecordOptions {
    fn from(config: &DnsConfig) -> Self {
        Self {
            mail_label: config.mail_label.clone(),
            mx_priority: config.mx_priority,
            ttl: config.ttl,
            mta_sts_id: config
                .publish_mta_sts
                .then(|| chrono::Utc::now().format("%Y%m%d%H%M%S").to_string()),
            tls_report_address: config.tls_report_address.clone(),
        }
    }
}

/// Produce the record set for `domain`.
///
/// The DKIM TXT value holds the full, unchunked key; use [`display_value`]
/// for the quoted zone-file form.
pub fn synthesize(
    domain: &str,
    server_ip: &str,
    selector: &str,
    public_key: &str,
    options: &RecordOptions,
) -> Result<Vec<NewDnsRecord>> {
    let ip: Ipv4Addr = server_ip
        .trim()
        .parse()
        .map_err(|_| Error::Config(format!("Server IP {:?} is not a valid IPv4 address", server_ip)))?;

    if public_key.trim().is_empty() {
        return Err(Error::Config(format!("No DKIM public key for {}", domain)));
    }

    let record = |record_type, name: &str, value: String, priority| NewDnsRecord {
        record_type,
        name: name.to_string(),
        value,
        priority,
        ttl: options.ttl,
    };

    let mut records = vec![
        record(RecordType::A, "@", ip.to_string(), None),
        record(RecordType::A, &options.mail_label, ip.to_string(), None),
        record(
            RecordType::Mx,
            "@",
            format!("{}.{}", options.mail_label, domain),
            Some(options.mx_priority),
        ),
        record(RecordType::Txt, "@", format!("v=spf1 ip4:{} mx ~all", ip), None),
        record(
            RecordType::Txt,
            &format!("{}._domainkey", selector),
            format!("v=DKIM1; k=rsa; p={}", public_key.trim()),
            None,
        ),
        record(
            RecordType::Txt,
            "_dmarc",
            format!("v=DMARC1; p=quarantine; rua=mailto:dmarc@{}", domain),
            None,
        ),
    ];

    if let Some(id) = &options.mta_sts_id {
        records.push(record(RecordType::Txt, "_mta-sts", format!("v=STSv1; id={}", id), None));
    }
    if let Some(address) = &options.tls_report_address {
        records.push(record(
            RecordType::Txt,
            "_smtp._tls",
            format!("v=TLSRPTv1; rua=mailto:{}", address),
            None,
        ));
    }

    Ok(records)
}

/// Fully-qualified lookup name; `@` is the bare domain
pub fn fqdn(name: &str, domain: &str) -> String {
    if name == "@" || name.is_empty() {
        domain.to_string()
    } else {
        format!("{}.{}", name, domain)
    }
}

/// Value as an operator pastes it into a zone: long TXT values are quoted
/// and split into character-strings
pub fn display_value(record_type: RecordType, value: &str) -> String {
    if record_type == RecordType::Txt && value.len() > TXT_CHUNK_LEN {
        render_txt_chunks(&chunk_for_txt(value))
    } else {
        value.to_string()
    }
}

/// Domain name syntax: 1-253 characters, dot-separated labels of 1-63
/// alphanumerics or hyphens, not starting or ending with a hyphen, and at
/// least two labels
pub fn is_valid_domain_name(name: &str) -> bool {
    if name.is_empty() || name.len() > 253 {
        return false;
    }

    let labels: Vec<&str> = name.split('.').collect();
    if labels.len() < 2 {
        return false;
    }

    labels.iter().all(|label| is_valid_label(label))
}

/// DKIM selector syntax: one or more dot-separated labels
pub fn is_valid_selector(selector: &str) -> bool {
    !selector.is_empty() && selector.len() <= 63 && selector.split('.').all(is_valid_label)
}

fn is_valid_label(label: &str) -> bool {
    !label.is_empty()
        && label.len() <= 63
        && label.chars().all(|c| c.is_ascii_alphanumeric() || c == '-')
        && !label.starts_with('-')
        && !label.ends_with('-')
}
