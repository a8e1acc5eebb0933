//! SMTP listeners

use super::handler::{SessionContext, SmtpHandler};
use super::session::SessionConfig;
use super::tls::create_tls_acceptor;
use anyhow::Result;
use mailtrust_common::config::{SmtpConfig, TlsConfig};
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio_rustls::TlsAcceptor;
use tracing::{error, info, warn};

/// Which listener a connection arrived on
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SmtpServiceType {
    /// Port 25, inbound mail from other servers
    Smtp,
    /// Port 587, authenticated submission with STARTTLS
    Submission,
    /// Port 465, authenticated submission over implicit TLS
    SubmissionTls,
}

impl std::fmt::Display for SmtpServiceType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SmtpServiceType::Smtp => write!(f, "SMTP"),
            SmtpServiceType::Submission => write!(f, "Submission"),
            SmtpServiceType::SubmissionTls => write!(f, "Submission/TLS"),
        }
    }
}

pub struct SmtpServer {
    config: SmtpConfig,
    ctx: Arc<SessionContext>,
    connection_semaphore: Arc<Semaphore>,
    tls_acceptor: Option<TlsAcceptor>,
}

impl SmtpServer {
    pub fn new(config: SmtpConfig, ctx: Arc<SessionContext>) -> Self {
        Self {
            connection_semaphore: Arc::new(Semaphore::new(config.max_connections.max(1))),
            config,
            ctx,
            tls_acceptor: None,
        }
    }

    /// Enable STARTTLS and the implicit-TLS port. A certificate that fails
    /// to load leaves TLS disabled.
    pub fn with_tls(mut self, tls: Option<&TlsConfig>) -> Self {
        self.tls_acceptor = match tls.map(create_tls_acceptor) {
            Some(Ok(acceptor)) => Some(acceptor),
            Some(Err(e)) => {
                warn!(error = %e, "TLS unavailable, STARTTLS disabled");
                None
            }
            None => None,
        };
        self
    }

    pub fn services(&self) -> Vec<(SmtpServiceType, u16)> {
        let mut services = vec![
            (SmtpServiceType::Smtp, self.config.port),
            (SmtpServiceType::Submission, self.config.submission_port),
        ];
        match (self.config.tls_port, &self.tls_acceptor) {
            (Some(port), Some(_)) => services.push((SmtpServiceType::SubmissionTls, port)),
            (Some(port), None) => warn!(port, "Implicit TLS port configured without a certificate, skipping"),
            (None, _) => {}
        }
        services
    }

    /// Run every listener until one of them fails
    pub async fn run(self: Arc<Self>) -> Result<()> {
        let mut listeners = JoinSet::new();
        for (service, port) in self.services() {
            let server = self.clone();
            listeners.spawn(async move { server.run_service(service, port).await });
        }

        // Dropping the set aborts the remaining listeners
        match listeners.join_next().await {
            Some(Ok(result)) => result,
            Some(Err(e)) => Err(anyhow::anyhow!("SMTP listener task failed: {}", e)),
            None => Ok(()),
        }
    }

    pub async fn run_service(&self, service: SmtpServiceType, port: u16) -> Result<()> {
        let addr = format!("{}:{}", self.config.host, port);
        let listener = TcpListener::bind(&addr).await?;
        info!(
            %service,
            %addr,
            tls = self.tls_acceptor.is_some(),
            "SMTP listener started"
        );

        loop {
            let (stream, peer_addr) = match listener.accept().await {
                Ok(accepted) => accepted,
                Err(e) => {
                    error!(%service, error = %e, "Failed to accept connection");
                    continue;
                }
            };

            let Ok(permit) = self.connection_semaphore.clone().try_acquire_owned() else {
                warn!(%service, peer = %peer_addr, "Connection limit reached, dropping");
                continue;
            };

            let tls_available = self.tls_acceptor.is_some();
            let config = match service {
                SmtpServiceType::Smtp => SessionConfig::inbound(&self.config, tls_available),
                SmtpServiceType::Submission | SmtpServiceType::SubmissionTls => {
                    SessionConfig::submission(&self.config, tls_available)
                }
            };
            let handler = SmtpHandler::new(config, self.ctx.clone(), Some(peer_addr), self.tls_acceptor.clone());

            tokio::spawn(async move {
                let result = match service {
                    SmtpServiceType::SubmissionTls => handler.handle_tls(stream).await,
                    _ => handler.handle(stream).await,
                };
                if let Err(e) = result {
                    error!(%service, peer = %peer_addr, error = %e, "SMTP session error");
                }
                drop(permit);
            });
        }
    }
}
