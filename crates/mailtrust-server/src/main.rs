//! mailtrust - SMTP server and operator commands
//!
//! `mailtrust` with no subcommand runs the SMTP listeners. Operator commands:
//!
//! ```text
//! mailtrust onboard <ADMIN_ID> <DOMAIN>
//! mailtrust check <DOMAIN_ID> [RECORD_TYPE]
//! ```

use anyhow::Result;
use clap::{Parser, Subcommand};
use mailtrust_common::config::{Config, LoggingConfig};
use mailtrust_common::types::RecordType;
use mailtrust_common::SecretCipher;
use mailtrust_core::{
    DnsRecordView, InboundDkimValidator, MailTrustService, MessageRouter, SessionContext, SmtpAuthenticator,
    SmtpRelayTransport, SmtpServer, SystemResolver,
};
use mailtrust_storage::{DatabasePool, Repositories};
use std::sync::Arc;
use tracing::{info, warn};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};
use uuid::Uuid;

/// mailtrust: domain trust, inbound SMTP and DKIM-signed relay
#[derive(Parser, Debug)]
#[command(name = "mailtrust", version)]
#[command(about = "SMTP server and domain trust operator commands")]
struct Args {
    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand, Debug, PartialEq)]
enum Command {
    /// Run the SMTP listeners (default)
    Serve,
    /// Onboard a domain for an admin and print the DNS records to publish
    Onboard {
        /// Owning admin
        admin_id: Uuid,
        /// Domain name, e.g. example.com
        domain: String,
    },
    /// Verify a domain's records against live DNS
    Check {
        domain_id: Uuid,
        /// Check a single type (A, MX or TXT) without updating the verified flag
        record_type: Option<RecordType>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    let config = Config::load()?;
    init_logging(&config.logging);

    let db_pool = DatabasePool::new(&config.database).await?;
    db_pool.migrate().await?;
    info!("Database ready");

    let repos = Repositories::postgres(&db_pool);
    let resolver = Arc::new(SystemResolver::new(&config.dns)?);
    let cipher = match &config.security.secret_key {
        Some(key) => Some(SecretCipher::from_base64(key)?),
        None => {
            warn!("security.secret_key not set, stored SMTP secrets cannot be decrypted");
            None
        }
    };

    match args.command.unwrap_or(Command::Serve) {
        Command::Serve => serve(&config, repos, resolver, cipher).await,
        Command::Onboard { admin_id, domain } => {
            let service = operator_service(&config, repos, resolver, cipher);

            let outcome = service.onboard_domain(admin_id, &domain).await?;
            let report = serde_json::json!({
                "domain": outcome.domain,
                "created": outcome.created,
                "dns_records": DnsRecordView::for_outcome(&outcome),
            });
            println!("{}", serde_json::to_string_pretty(&report)?);
            Ok(())
        }
        Command::Check { domain_id, record_type } => {
            let service = operator_service(&config, repos, resolver, cipher);

            let report = service.check_domain_trust(domain_id, record_type).await?;
            println!("{}", serde_json::to_string_pretty(&report)?);
            Ok(())
        }
    }
}

async fn serve(
    config: &Config,
    repos: Repositories,
    resolver: Arc<SystemResolver>,
    cipher: Option<SecretCipher>,
) -> Result<()> {
    info!(hostname = %config.smtp.hostname, "Starting mailtrust");

    let ctx = Arc::new(SessionContext {
        authenticator: SmtpAuthenticator::new(repos.mailboxes.clone(), cipher),
        validator: InboundDkimValidator::new(repos.domains.clone(), resolver),
        router: MessageRouter::new(repos.mailboxes.clone(), repos.messages.clone()),
        mailboxes: repos.mailboxes.clone(),
    });
    let smtp = Arc::new(SmtpServer::new(config.smtp.clone(), ctx).with_tls(config.tls.as_ref()));

    tokio::select! {
        result = smtp.run() => {
            result?;
        }
        signal = tokio::signal::ctrl_c() => {
            signal?;
            info!("Shutdown signal received");
        }
    }

    info!("mailtrust stopped");
    Ok(())
}

fn operator_service(
    config: &Config,
    repos: Repositories,
    resolver: Arc<SystemResolver>,
    cipher: Option<SecretCipher>,
) -> MailTrustService {
    let transport = Arc::new(SmtpRelayTransport::new(config.relay.clone()));
    MailTrustService::new(config, repos, resolver, transport, cipher)
}

fn init_logging(logging: &LoggingConfig) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(format!("{},mailtrust=debug", logging.level)));

    let registry = tracing_subscriber::registry().with(filter);
    if logging.format.eq_ignore_ascii_case("json") {
        registry.with(fmt::layer().json()).init();
    } else {
        registry.with(fmt::layer().with_target(true).with_level(true)).init();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_is_serve() {
        let args = Args::try_parse_from(["mailtrust"]).unwrap();
        assert_eq!(args.command, None);
        let args = Args::try_parse_from(["mailtrust", "serve"]).unwrap();
        assert_eq!(args.command, Some(Command::Serve));
    }

    #[test]
    fn test_onboard_arguments() {
        let admin = Uuid::now_v7();
        let args = Args::try_parse_from(["mailtrust", "onboard", &admin.to_string(), "example.com"]).unwrap();
        assert_eq!(
            args.command,
            Some(Command::Onboard {
                admin_id: admin,
                domain: "example.com".to_string(),
            })
        );
        assert!(Args::try_parse_from(["mailtrust", "onboard", "not-a-uuid", "example.com"]).is_err());
        assert!(Args::try_parse_from(["mailtrust", "onboard"]).is_err());
    }

    #[test]
    fn test_check_record_type() {
        let domain = Uuid::now_v7();
        let args = Args::try_parse_from(["mailtrust", "check", &domain.to_string(), "mx"]).unwrap();
        assert_eq!(
            args.command,
            Some(Command::Check {
                domain_id: domain,
                record_type: Some(RecordType::Mx),
            })
        );
        assert!(Args::try_parse_from(["mailtrust", "check", &domain.to_string(), "SRV"]).is_err());
    }
}
