//! SNI-based certificate resolution for the domain-facing TLS listener.
//!
//! Grounded on `rustls`'s own `ResolvesServerCert` trait; each configured
//! domain gets its own certified key, looked up by the TLS `ClientHello`'s
//! server name.

use std::collections::HashMap;
use std::fs::File;
use std::io::BufReader;
use std::sync::Arc;

use rustls::server::{ClientHello, ResolvesServerCert};
use rustls::sign::CertifiedKey;
use rustls::ServerConfig;

use crate::config::DomainConfig;

#[derive(Debug, thiserror::Error)]
pub enum TlsConfigError {
    #[error("reading certificate file '{path}': {source}")]
    CertificateFile { path: String, source: std::io::Error },
    #[error("reading private key file '{path}': {source}")]
    KeyFile { path: String, source: std::io::Error },
    #[error("no private key found in '{0}'")]
    NoPrivateKey(String),
    #[error("domain '{0}' has no certificate configured")]
    MissingCertificate(String),
    #[error(transparent)]
    Sign(#[from] rustls::Error),
}

#[derive(Debug)]
struct DomainCertResolver {
    by_name: HashMap<String, Arc<CertifiedKey>>,
}

impl ResolvesServerCert for DomainCertResolver {
    fn resolve(&self, client_hello: ClientHello) -> Option<Arc<CertifiedKey>> {
        let name = client_hello.server_name()?;
        self.by_name.get(name).cloned()
    }
}

fn load_certified_key(domain: &DomainConfig) -> Result<CertifiedKey, TlsConfigError> {
    let cert = domain
        .certificate
        .as_ref()
        .ok_or_else(|| TlsConfigError::MissingCertificate(domain.name.clone()))?;

    let cert_chain = {
        let file = File::open(&cert.file).map_err(|source| TlsConfigError::CertificateFile { path: cert.file.clone(), source })?;
        let mut reader = BufReader::new(file);
        rustls_pemfile::certs(&mut reader)
            .collect::<Result<Vec<_>, _>>()
            .map_err(|source| TlsConfigError::CertificateFile { path: cert.file.clone(), source })?
    };

    let key = {
        let file = File::open(&cert.key).map_err(|source| TlsConfigError::KeyFile { path: cert.key.clone(), source })?;
        let mut reader = BufReader::new(file);
        rustls_pemfile::private_key(&mut reader)
            .map_err(|source| TlsConfigError::KeyFile { path: cert.key.clone(), source })?
            .ok_or_else(|| TlsConfigError::NoPrivateKey(cert.key.clone()))?
    };

    let signing_key = rustls::crypto::ring::sign::any_supported_type(&key)?;
    Ok(CertifiedKey::new(cert_chain, signing_key))
}

/// Build one `rustls::ServerConfig` covering every configured domain,
/// dispatching by SNI at handshake time.
pub fn build_server_config(domains: &[DomainConfig]) -> Result<Arc<ServerConfig>, TlsConfigError> {
    let mut by_name = HashMap::new();
    for domain in domains {
        if domain.certificate.is_none() {
            continue;
        }
        let key = load_certified_key(domain)?;
        by_name.insert(domain.name.clone(), Arc::new(key));
    }

    let resolver = DomainCertResolver { by_name };
    let config = ServerConfig::builder()
        .with_no_client_auth()
        .with_cert_resolver(Arc::new(resolver));
    Ok(Arc::new(config))
}
