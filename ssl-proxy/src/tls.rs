//! TLS termination with per-handshake certificate selection.
//!
//! The certificate is chosen from the live registry by the SNI server name.
//! There is no default certificate: an unknown or missing name fails the
//! handshake.

use rustls::server::{ClientHello, ResolvesServerCert};
use rustls::sign::{self, CertifiedKey};
use rustls::{Certificate, PrivateKey, ServerConfig};
use rustls_pemfile::Item;
use std::io::BufReader;
use std::sync::Arc;
use tokio_rustls::TlsAcceptor;
use tracing::debug;

use crate::error::{ProxyError, Result};
use crate::registry::Registry;

/// Parse every certificate in a PEM bundle
pub fn parse_certificates(pem: &str) -> Result<Vec<Certificate>> {
    let mut reader = BufReader::new(pem.as_bytes());
    let certs: Vec<Certificate> = rustls_pemfile::certs(&mut reader)
        .map_err(|e| ProxyError::Tls(format!("Failed to read certificates: {}", e)))?
        .into_iter()
        .map(Certificate)
        .collect();

    if certs.is_empty() {
        return Err(ProxyError::Tls("No certificates found".to_string()));
    }
    Ok(certs)
}

/// Parse the first PKCS#8, RSA or EC private key in a PEM document
pub fn parse_private_key(pem: &str) -> Result<PrivateKey> {
    let mut reader = BufReader::new(pem.as_bytes());
    let items = rustls_pemfile::read_all(&mut reader)
        .map_err(|e| ProxyError::Tls(format!("Failed to read private key: {}", e)))?;

    items
        .into_iter()
        .find_map(|item| match item {
            Item::PKCS8Key(key) | Item::RSAKey(key) | Item::ECKey(key) => Some(PrivateKey(key)),
            _ => None,
        })
        .ok_or_else(|| ProxyError::Tls("No private key found".to_string()))
}

/// Build a signing key pair from PEM certificate and key
pub fn certified_key_from_pem(cert_pem: &str, key_pem: &str) -> Result<CertifiedKey> {
    let certs = parse_certificates(cert_pem)?;
    let key = parse_private_key(key_pem)?;
    let signing_key = sign::any_supported_type(&key)
        .map_err(|e| ProxyError::Tls(format!("Unsupported private key: {}", e)))?;
    Ok(CertifiedKey::new(certs, signing_key))
}

/// Resolves the certificate for a handshake from the registry
pub struct SniResolver {
    registry: Arc<Registry>,
}

impl SniResolver {
    pub fn new(registry: Arc<Registry>) -> Self {
        Self { registry }
    }
}

impl ResolvesServerCert for SniResolver {
    fn resolve(&self, client_hello: ClientHello<'_>) -> Option<Arc<CertifiedKey>> {
        let Some(name) = client_hello.server_name() else {
            debug!("Rejecting handshake without server name");
            return None;
        };

        let key = self.registry.certified_key_for(name);
        if key.is_none() {
            debug!(server_name = %name, "No certificate for server name");
        }
        key
    }
}

/// rustls server config backed by the registry
pub fn server_config(registry: Arc<Registry>) -> ServerConfig {
    let mut config = ServerConfig::builder()
        .with_safe_defaults()
        .with_no_client_auth()
        .with_cert_resolver(Arc::new(SniResolver::new(registry)));
    config.alpn_protocols = vec![b"h2".to_vec(), b"http/1.1".to_vec()];
    config
}

pub fn build_acceptor(registry: Arc<Registry>) -> TlsAcceptor {
    TlsAcceptor::from(Arc::new(server_config(registry)))
}
