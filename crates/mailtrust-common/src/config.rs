//! Configuration for mailtrust

use crate::types::RecordType;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Environment variable naming an explicit configuration file
pub const CONFIG_PATH_ENV: &str = "MAILTRUST_CONFIG";

/// Prefix for environment overrides, e.g. `MAILTRUST__DNS__SERVER_IP`
pub const ENV_PREFIX: &str = "MAILTRUST";

/// Main configuration structure
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Server configuration
    #[serde(default)]
    pub server: ServerConfig,

    /// Database configuration
    pub database: DatabaseConfig,

    /// SMTP configuration
    #[serde(default)]
    pub smtp: SmtpConfig,

    /// DNS publication and verification
    #[serde(default)]
    pub dns: DnsConfig,

    /// DKIM key generation
    #[serde(default)]
    pub dkim: DkimConfig,

    /// Outbound relay
    #[serde(default)]
    pub relay: RelayConfig,

    /// Secrets
    #[serde(default)]
    pub security: SecurityConfig,

    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,

    /// TLS configuration
    pub tls: Option<TlsConfig>,
}

/// Server configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// Hostname
    #[serde(default = "default_hostname")]
    pub hostname: String,

    /// Bind address
    #[serde(default = "default_bind_address")]
    pub bind_address: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            hostname: default_hostname(),
            bind_address: default_bind_address(),
        }
    }
}

fn default_hostname() -> String {
    "localhost".to_string()
}

fn default_bind_address() -> String {
    "0.0.0.0".to_string()
}

/// Database configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseConfig {
    /// Database backend: only "postgres" is supported
    #[serde(default = "default_db_backend")]
    pub backend: String,

    /// Database URL
    pub url: Option<String>,

    /// Maximum connections
    #[serde(default = "default_max_connections")]
    pub max_connections: u32,

    /// Minimum connections
    #[serde(default = "default_min_connections")]
    pub min_connections: u32,
}

fn default_db_backend() -> String {
    "postgres".to_string()
}

fn default_max_connections() -> u32 {
    20
}

fn default_min_connections() -> u32 {
    2
}

/// SMTP configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SmtpConfig {
    /// Hostname for SMTP banner
    #[serde(default = "default_hostname")]
    pub hostname: String,

    /// Bind host
    #[serde(default = "default_smtp_host")]
    pub host: String,

    /// SMTP port (inbound)
    #[serde(default = "default_smtp_port")]
    pub port: u16,

    /// Submission port
    #[serde(default = "default_submission_port")]
    pub submission_port: u16,

    /// Implicit-TLS port; only bound when TLS material is configured
    pub tls_port: Option<u16>,

    /// Maximum message size in bytes
    #[serde(default = "default_max_message_size")]
    pub max_message_size: usize,

    /// Maximum recipients per message
    #[serde(default = "default_max_recipients")]
    pub max_recipients: usize,

    /// Maximum concurrent connections
    #[serde(default = "default_smtp_max_connections")]
    pub max_connections: usize,

    /// Idle timeout per command in seconds
    #[serde(default = "default_connection_timeout")]
    pub connection_timeout_secs: u64,

    /// Require authentication on the inbound port
    #[serde(default)]
    pub auth_required: bool,

    /// Require TLS for authentication
    #[serde(default = "default_require_tls_for_auth")]
    pub require_tls_for_auth: bool,
}

impl Default for SmtpConfig {
    fn default() -> Self {
        Self {
            hostname: default_hostname(),
            host: default_smtp_host(),
            port: default_smtp_port(),
            submission_port: default_submission_port(),
            tls_port: None,
            max_message_size: default_max_message_size(),
            max_recipients: default_max_recipients(),
            max_connections: default_smtp_max_connections(),
            connection_timeout_secs: default_connection_timeout(),
            auth_required: false,
            require_tls_for_auth: default_require_tls_for_auth(),
        }
    }
}

fn default_smtp_host() -> String {
    "0.0.0.0".to_string()
}

fn default_smtp_port() -> u16 {
    25
}

fn default_submission_port() -> u16 {
    587
}

fn default_max_message_size() -> usize {
    10 * 1024 * 1024 // 10 MiB
}

fn default_max_recipients() -> usize {
    100
}

fn default_smtp_max_connections() -> usize {
    100
}

fn default_connection_timeout() -> u64 {
    300
}

fn default_require_tls_for_auth() -> bool {
    false
}

/// What the verifier may overwrite when live DNS disagrees with a stored record
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum SelfHealPolicy {
    /// Any record type with a resolved value
    #[default]
    All,
    /// TXT records only; A and MX drift is reported but never adopted
    TxtOnly,
    /// Never overwrite stored records
    Off,
}

impl SelfHealPolicy {
    /// Whether a drifted record of this type may be overwritten
    pub fn allows(&self, record_type: RecordType) -> bool {
        match self {
            SelfHealPolicy::All => true,
            SelfHealPolicy::TxtOnly => record_type == RecordType::Txt,
            SelfHealPolicy::Off => false,
        }
    }
}

/// DNS publication and verification configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DnsConfig {
    /// Public IPv4 of the mail server, used for A and SPF records
    pub server_ip: Option<String>,

    /// Label of the mail endpoint (`mail` → `mail.<domain>`)
    #[serde(default = "default_mail_label")]
    pub mail_label: String,

    /// MX priority
    #[serde(default = "default_mx_priority")]
    pub mx_priority: i32,

    /// TTL for published records
    #[serde(default = "default_ttl")]
    pub ttl: i32,

    /// Timeout for a single resolver call
    #[serde(default = "default_dns_timeout")]
    pub timeout_secs: u64,

    /// Self-healing policy
    #[serde(default)]
    pub self_heal: SelfHealPolicy,

    /// Record types checked by a full trust check
    #[serde(default = "default_verify_types")]
    pub verify_types: Vec<RecordType>,

    /// Publish an MTA-STS policy id record
    #[serde(default)]
    pub publish_mta_sts: bool,

    /// Address for TLS reporting (TLSRPT); no record when unset
    pub tls_report_address: Option<String>,

    /// Upstream nameservers (IP addresses); system configuration when empty
    #[serde(default)]
    pub nameservers: Vec<String>,
}

impl Default for DnsConfig {
    fn default() -> Self {
        Self {
            server_ip: None,
            mail_label: default_mail_label(),
            mx_priority: default_mx_priority(),
            ttl: default_ttl(),
            timeout_secs: default_dns_timeout(),
            self_heal: SelfHealPolicy::default(),
            verify_types: default_verify_types(),
            publish_mta_sts: false,
            tls_report_address: None,
            nameservers: Vec::new(),
        }
    }
}

fn default_mail_label() -> String {
    "mail".to_string()
}

fn default_mx_priority() -> i32 {
    10
}

fn default_ttl() -> i32 {
    3600
}

fn default_dns_timeout() -> u64 {
    5
}

fn default_verify_types() -> Vec<RecordType> {
    vec![RecordType::Mx, RecordType::Txt, RecordType::A]
}

/// DKIM configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DkimConfig {
    /// Selector used when a domain has none
    #[serde(default = "default_selector")]
    pub default_selector: String,

    /// RSA modulus size
    #[serde(default = "default_key_bits")]
    pub key_bits: usize,
}

impl Default for DkimConfig {
    fn default() -> Self {
        Self {
            default_selector: default_selector(),
            key_bits: default_key_bits(),
        }
    }
}

fn default_selector() -> String {
    "dkim".to_string()
}

fn default_key_bits() -> usize {
    2048
}

/// Transport security for the outbound relay
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum RelaySecurity {
    /// Plain SMTP (local smarthost only)
    None,
    /// STARTTLS upgrade
    #[default]
    Starttls,
    /// Implicit TLS
    Tls,
}

/// Outbound relay configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RelayConfig {
    /// Relay host
    #[serde(default = "default_relay_host")]
    pub host: String,

    /// Relay port
    #[serde(default = "default_submission_port")]
    pub port: u16,

    /// Transport security
    #[serde(default)]
    pub security: RelaySecurity,

    /// Send timeout in seconds
    #[serde(default = "default_relay_timeout")]
    pub timeout_secs: u64,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            host: default_relay_host(),
            port: default_submission_port(),
            security: RelaySecurity::default(),
            timeout_secs: default_relay_timeout(),
        }
    }
}

fn default_relay_host() -> String {
    "localhost".to_string()
}

fn default_relay_timeout() -> u64 {
    30
}

/// Secret material
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct SecurityConfig {
    /// Base64 AES-256 key for mailbox SMTP secrets
    pub secret_key: Option<String>,
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Log level
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Log format: "json" or "text"
    #[serde(default = "default_log_format")]
    pub format: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: default_log_format(),
        }
    }
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_log_format() -> String {
    "text".to_string()
}

/// TLS configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TlsConfig {
    /// Path to certificate file
    pub cert_path: PathBuf,

    /// Path to private key file
    pub key_path: PathBuf,
}

impl Config {
    /// Load configuration from a TOML file, with environment overrides
    pub fn from_file(path: &Path) -> crate::Result<Self> {
        ::config::Config::builder()
            .add_source(::config::File::from(path).format(::config::FileFormat::Toml))
            .add_source(
                ::config::Environment::with_prefix(ENV_PREFIX)
                    .prefix_separator("__")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()
            .and_then(|c| c.try_deserialize::<Config>())
            .map_err(|e| crate::Error::Config(format!("Failed to load {}: {}", path.display(), e)))
    }

    /// Parse configuration from a TOML string (no environment overrides)
    pub fn from_toml(content: &str) -> crate::Result<Self> {
        toml::from_str(content)
            .map_err(|e| crate::Error::Config(format!("Failed to parse config: {}", e)))
    }

    /// Load configuration from `MAILTRUST_CONFIG` or the default locations
    pub fn load() -> crate::Result<Self> {
        if let Ok(path) = std::env::var(CONFIG_PATH_ENV) {
            return Self::from_file(Path::new(&path));
        }

        let paths = [
            PathBuf::from("./mailtrust.toml"),
            PathBuf::from("./config.toml"),
            PathBuf::from("/etc/mailtrust/config.toml"),
        ];

        for path in paths {
            if path.exists() {
                return Self::from_file(&path);
            }
        }

        Err(crate::Error::Config(
            "No configuration file found".to_string(),
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let smtp = SmtpConfig::default();
        assert_eq!(smtp.port, 25);
        assert_eq!(smtp.submission_port, 587);
        assert_eq!(smtp.max_message_size, 10 * 1024 * 1024);

        let dns = DnsConfig::default();
        assert_eq!(dns.mx_priority, 10);
        assert_eq!(dns.self_heal, SelfHealPolicy::All);
        assert_eq!(
            dns.verify_types,
            vec![RecordType::Mx, RecordType::Txt, RecordType::A]
        );

        assert_eq!(DkimConfig::default().default_selector, "dkim");
    }

    #[test]
    fn test_parse_config() {
        let toml = r#"
[server]
hostname = "mail.example.com"

[database]
url = "postgres://localhost/mailtrust"

[dns]
server_ip = "203.0.113.5"
self_heal = "txt_only"
verify_types = ["MX", "TXT"]

[relay]
host = "smtp.example.com"
security = "tls"
"#;

        let config = Config::from_toml(toml).unwrap();
        assert_eq!(config.server.hostname, "mail.example.com");
        assert_eq!(config.database.backend, "postgres");
        assert_eq!(config.dns.server_ip.as_deref(), Some("203.0.113.5"));
        assert_eq!(config.dns.self_heal, SelfHealPolicy::TxtOnly);
        assert_eq!(config.dns.verify_types, vec![RecordType::Mx, RecordType::Txt]);
        assert_eq!(config.relay.security, RelaySecurity::Tls);
        assert_eq!(config.relay.port, 587);
    }

    #[test]
    fn test_self_heal_policy() {
        assert!(SelfHealPolicy::All.allows(RecordType::Mx));
        assert!(SelfHealPolicy::TxtOnly.allows(RecordType::Txt));
        assert!(!SelfHealPolicy::TxtOnly.allows(RecordType::Mx));
        assert!(!SelfHealPolicy::Off.allows(RecordType::Txt));
    }
}
