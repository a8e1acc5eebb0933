//! DNS record synthesis and live verification

pub mod normalize;
pub mod records;
pub mod resolver;
pub mod verifier;

pub use normalize::normalize_txt;
pub use records::{display_value, fqdn, synthesize, RecordOptions, DEFAULT_DKIM_SELECTOR};
pub use resolver::{DnsLookup, DnsLookupError, StaticResolver, SystemResolver};
pub use verifier::{AggregateResult, DnsVerifier, RecordCheck, VerificationResult};
