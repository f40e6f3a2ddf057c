//! Filesystem source: one snippet file per domain, certificates alongside.
//!
//! ```text
//! <snippets_path>/<domain>        snippet body, used as-is
//! <certs_path>/<domain>.crt       certificate chain
//! <certs_path>/<domain>.key       private key
//! ```
//!
//! A domain whose `.crt` or `.key` is missing is skipped entirely, except
//! when reading back an applied directory (see [`LocalSource::applied`]),
//! where the applier legitimately writes snippets without certificates.

use async_trait::async_trait;
use std::path::{Path, PathBuf};
use tokio::fs;
use tracing::{debug, warn};

use super::ServerSource;
use crate::error::{ProxyError, Result};
use crate::model::{validate_domain, Cert, Server};

pub struct LocalSource {
    name: String,
    snippets_path: PathBuf,
    certs_path: PathBuf,
    cert_optional: bool,
}

impl LocalSource {
    pub fn new(snippets_path: impl Into<PathBuf>, certs_path: impl Into<PathBuf>) -> Self {
        Self {
            name: "local".to_string(),
            snippets_path: snippets_path.into(),
            certs_path: certs_path.into(),
            cert_optional: false,
        }
    }

    /// Reader for directories the applier wrote. Snippets without a key pair
    /// are reported with an empty certificate instead of being skipped.
    pub fn applied(snippets_path: impl Into<PathBuf>, certs_path: impl Into<PathBuf>) -> Self {
        Self {
            cert_optional: true,
            ..Self::new(snippets_path, certs_path).with_name("applied")
        }
    }

    /// Override the name used in logs
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    async fn read_domain(&self, domain: &str, snippet_path: &Path) -> Option<Server> {
        let snippet = match fs::read_to_string(snippet_path).await {
            Ok(s) => s,
            Err(e) => {
                warn!(domain = %domain, "Failed to read snippet: {}", e);
                return None;
            }
        };

        let crt_path = self.certs_path.join(format!("{}.crt", domain));
        let key_path = self.certs_path.join(format!("{}.key", domain));

        let (certificate, private_key) =
            match (fs::read_to_string(&crt_path).await, fs::read_to_string(&key_path).await) {
                (Ok(certificate), Ok(private_key)) => (certificate, private_key),
                _ if self.cert_optional => {
                    debug!(domain = %domain, "No key pair on disk, reading snippet only");
                    return Some(Server::without_cert(domain, snippet));
                }
                (Err(e), _) => {
                    warn!(domain = %domain, path = ?crt_path, "Failed to read cert: {}", e);
                    return None;
                }
                (_, Err(e)) => {
                    warn!(domain = %domain, path = ?key_path, "Failed to read key: {}", e);
                    return None;
                }
            };

        Some(Server::new(
            domain,
            snippet,
            Cert::new(domain, private_key, certificate),
        ))
    }
}

#[async_trait]
impl ServerSource for LocalSource {
    fn name(&self) -> &str {
        &self.name
    }

    async fn read(&self) -> Result<Vec<Server>> {
        let mut entries = fs::read_dir(&self.snippets_path)
            .await
            .map_err(|e| ProxyError::source_unavailable(&self.name, e))?;

        let mut servers = Vec::new();
        loop {
            let entry = match entries.next_entry().await {
                Ok(Some(entry)) => entry,
                Ok(None) => break,
                Err(e) => return Err(ProxyError::source_unavailable(&self.name, e)),
            };

            match entry.file_type().await {
                Ok(t) if t.is_file() => {}
                Ok(_) => continue,
                Err(e) => {
                    warn!(path = ?entry.path(), "Failed to stat snippet: {}", e);
                    continue;
                }
            }

            let Some(domain) = entry.file_name().to_str().map(str::to_string) else {
                warn!(path = ?entry.path(), "Skipping snippet with non UTF-8 name");
                continue;
            };
            if validate_domain(&domain).is_err() {
                debug!(file = %domain, "Skipping file that is not a domain snippet");
                continue;
            }

            if let Some(server) = self.read_domain(&domain, &entry.path()).await {
                servers.push(server);
            }
        }

        // Directory order is not stable across platforms
        servers.sort_by(|a, b| a.domain.cmp(&b.domain));
        debug!(source = %self.name, count = servers.len(), "Read servers");
        Ok(servers)
    }
}
