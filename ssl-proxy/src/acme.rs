//! Certificate issuance for the proxy's own domain.
//!
//! Issuance is a single call behind [`CertificateIssuer`]. The ACME protocol
//! is not spoken here; [`SelfSignedIssuer`] covers development and tests.

use async_trait::async_trait;
use tracing::{info, warn};

use crate::error::{ProxyError, Result};

/// PEM encoded key pair returned by an issuer
#[derive(Clone, PartialEq, Eq)]
pub struct IssuedCertificate {
    pub private_key: String,
    pub certificate: String,
}

impl std::fmt::Debug for IssuedCertificate {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IssuedCertificate")
            .field("private_key", &"<redacted>")
            .field("certificate_len", &self.certificate.len())
            .finish()
    }
}

#[async_trait]
pub trait CertificateIssuer: Send + Sync {
    /// Obtain a certificate for `domain`, registering `email` as the contact
    async fn issue(&self, domain: &str, email: &str) -> Result<IssuedCertificate>;
}

/// Issues self-signed certificates with rcgen
#[derive(Debug, Default, Clone, Copy)]
pub struct SelfSignedIssuer;

#[async_trait]
impl CertificateIssuer for SelfSignedIssuer {
    async fn issue(&self, domain: &str, email: &str) -> Result<IssuedCertificate> {
        warn!(domain = %domain, "Issuing self-signed certificate");

        let cert = rcgen::generate_simple_self_signed(vec![domain.to_string()])
            .map_err(|e| ProxyError::Tls(format!("Failed to generate certificate: {}", e)))?;

        info!(domain = %domain, contact = %email, "Certificate issued");
        Ok(IssuedCertificate {
            private_key: cert.key_pair.serialize_pem(),
            certificate: cert.cert.pem(),
        })
    }
}
