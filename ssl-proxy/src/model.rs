//! Shared value types: desired servers, their certificates and the proxy settings.

use serde::{Deserialize, Serialize};

use crate::error::{ProxyError, Result};

/// Key material for a domain. Replaced as a whole, never patched.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Cert {
    pub domain: String,
    /// PEM encoded private key
    pub private_key: String,
    /// PEM encoded certificate, possibly a chain
    pub certificate: String,
}

impl Cert {
    pub fn new(
        domain: impl Into<String>,
        private_key: impl Into<String>,
        certificate: impl Into<String>,
    ) -> Self {
        Self {
            domain: domain.into(),
            private_key: private_key.into(),
            certificate: certificate.into(),
        }
    }

    /// Both halves of the key pair are present
    pub fn is_complete(&self) -> bool {
        !self.private_key.is_empty() && !self.certificate.is_empty()
    }
}

/// A desired virtual host: one routing snippet plus an optional certificate.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Server {
    pub domain: String,
    /// Routing fragment for the engine; may reference `{{ .CertsPath }}`
    pub snippets: String,
    /// Empty when the source has no certificate for the domain yet
    pub cert: Cert,
}

impl Server {
    pub fn new(domain: impl Into<String>, snippets: impl Into<String>, cert: Cert) -> Self {
        Self {
            domain: domain.into(),
            snippets: snippets.into(),
            cert,
        }
    }

    /// A server without certificate material (challenge-only records)
    pub fn without_cert(domain: impl Into<String>, snippets: impl Into<String>) -> Self {
        Self::new(domain, snippets, Cert::default())
    }

    pub fn has_cert(&self) -> bool {
        self.cert.is_complete()
    }
}

/// Change-detection equality. The domain is the join key and is not compared.
impl PartialEq for Server {
    fn eq(&self, other: &Self) -> bool {
        self.snippets == other.snippets
            && self.cert.certificate == other.cert.certificate
            && self.cert.private_key == other.cert.private_key
    }
}

impl Eq for Server {}

/// The single identity record of a proxy deployment.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Settings {
    /// Bearer token for the control API
    pub token: String,
    pub proxy_domain: String,
    pub destination_domain: String,
    pub email: String,
}

impl std::fmt::Debug for Settings {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Settings")
            .field("token", &"<redacted>")
            .field("proxy_domain", &self.proxy_domain)
            .field("destination_domain", &self.destination_domain)
            .field("email", &self.email)
            .finish()
    }
}

/// A control-plane registry row: a domain the live proxy terminates TLS for.
///
/// Serialized with the field names the control API accepts
/// (`Domain`, `SSLKey`, `SSLCert`).
#[derive(Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServerRegistryEntry {
    #[serde(rename = "Domain", alias = "domain", default)]
    pub domain: String,
    #[serde(rename = "SSLKey", alias = "ssl_key", default)]
    pub ssl_key: String,
    #[serde(rename = "SSLCert", alias = "ssl_cert", default)]
    pub ssl_cert: String,
}

impl ServerRegistryEntry {
    pub fn new(
        domain: impl Into<String>,
        ssl_key: impl Into<String>,
        ssl_cert: impl Into<String>,
    ) -> Self {
        Self {
            domain: domain.into(),
            ssl_key: ssl_key.into(),
            ssl_cert: ssl_cert.into(),
        }
    }

    /// Domain, key and certificate are all present
    pub fn is_complete(&self) -> bool {
        !self.domain.is_empty() && !self.ssl_key.is_empty() && !self.ssl_cert.is_empty()
    }
}

impl std::fmt::Debug for ServerRegistryEntry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ServerRegistryEntry")
            .field("domain", &self.domain)
            .field("ssl_key", &"<redacted>")
            .field("ssl_cert_len", &self.ssl_cert.len())
            .finish()
    }
}

/// Check that a domain can be used as a file name in the config directories.
pub fn validate_domain(domain: &str) -> Result<()> {
    let invalid = domain.is_empty()
        || domain.starts_with('.')
        || domain.contains(['/', '\\', '\0'])
        || domain.chars().any(char::is_whitespace);

    if invalid {
        return Err(ProxyError::Config(format!("Invalid domain '{}'", domain.escape_debug())));
    }
    Ok(())
}
