//! SMTP server: inbound reception and authenticated submission

mod auth;
mod handler;
mod server;
mod session;
mod tls;

pub use auth::{Credentials, SmtpAuthenticator};
pub use handler::{SessionContext, SmtpHandler};
pub use server::{SmtpServer, SmtpServiceType};
pub use session::{Identity, Phase, Reply, SessionConfig, SmtpSession};
pub use tls::create_tls_acceptor;
