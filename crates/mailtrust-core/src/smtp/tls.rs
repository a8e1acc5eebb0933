//! TLS for STARTTLS and the implicit-TLS submission port

use mailtrust_common::config::TlsConfig;
use mailtrust_common::{Error, Result};
use rustls::pki_types::CertificateDer;
use rustls::ServerConfig;
use rustls_pemfile::{certs, private_key};
use std::fs::File;
use std::io::BufReader;
use std::sync::Arc;
use tokio_rustls::TlsAcceptor;
use tracing::info;

/// Build an acceptor from the PEM certificate chain and key on disk
pub fn create_tls_acceptor(tls: &TlsConfig) -> Result<TlsAcceptor> {
    let cert_file = File::open(&tls.cert_path).map_err(|e| {
        Error::Config(format!("Cannot open certificate {}: {}", tls.cert_path.display(), e))
    })?;
    let chain: Vec<CertificateDer<'static>> = certs(&mut BufReader::new(cert_file))
        .collect::<std::result::Result<_, _>>()
        .map_err(|e| Error::Config(format!("Invalid certificate PEM: {}", e)))?;
    if chain.is_empty() {
        return Err(Error::Config(format!(
            "No certificates in {}",
            tls.cert_path.display()
        )));
    }

    let key_file = File::open(&tls.key_path)
        .map_err(|e| Error::Config(format!("Cannot open key {}: {}", tls.key_path.display(), e)))?;
    let key = private_key(&mut BufReader::new(key_file))
        .map_err(|e| Error::Config(format!("Invalid key PEM: {}", e)))?
        .ok_or_else(|| Error::Config(format!("No private key in {}", tls.key_path.display())))?;

    let server_config = ServerConfig::builder()
        .with_no_client_auth()
        .with_single_cert(chain, key)
        .map_err(|e| Error::Config(format!("TLS configuration rejected: {}", e)))?;

    info!(cert = %tls.cert_path.display(), "TLS certificate loaded");
    Ok(TlsAcceptor::from(Arc::new(server_config)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    fn missing() -> TlsConfig {
        TlsConfig {
            cert_path: PathBuf::from("/nonexistent/mailtrust/cert.pem"),
            key_path: PathBuf::from("/nonexistent/mailtrust/key.pem"),
        }
    }

    #[test]
    fn test_missing_files() {
        assert!(matches!(create_tls_acceptor(&missing()), Err(Error::Config(_))));
    }
}
