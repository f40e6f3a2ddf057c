//! Artifacts directory: exported certificates and ACME HTTP-01 challenges.
//!
//! ```text
//! <path>/certs/<domain>.crt, <domain>.key
//! <path>/challenges/<domain>.path, <domain>.content
//! ```
//!
//! [`ArtifactsSource`] turns the directory into desired servers with
//! generated snippets. [`export_artifacts`] fills it from the cluster.

use async_trait::async_trait;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use tokio::fs;
use tracing::{debug, info, warn};

use super::kubernetes::ResourceStore;
use super::ServerSource;
use crate::error::{ProxyError, Result};
use crate::model::{validate_domain, Cert, Server};
use crate::template::render_snippet;

pub const CERTS_DIR: &str = "certs";
pub const CHALLENGES_DIR: &str = "challenges";

/// Annotation on TLS secrets naming the external domain they serve
pub const EXTERNAL_DOMAIN_ANNOTATION: &str = "website-builder/external-domain";
pub const CHALLENGE_PATH_ANNOTATION: &str = "website-builder/challenge-path";
pub const CHALLENGE_CONTENT_ANNOTATION: &str = "website-builder/challenge-content";

#[derive(Debug, Default)]
struct DomainArtifacts {
    cert: Option<Cert>,
    challenge: Option<(String, String)>,
}

/// Desired servers generated from an artifacts directory
pub struct ArtifactsSource {
    name: String,
    path: PathBuf,
    certs_path: PathBuf,
    backend: String,
}

impl ArtifactsSource {
    /// `certs_path` is where the applier will write certificates; `backend`
    /// is the `host:port` the generated snippets proxy to.
    pub fn new(path: impl Into<PathBuf>, certs_path: impl Into<PathBuf>, backend: impl Into<String>) -> Self {
        Self {
            name: "artifacts".to_string(),
            path: path.into(),
            certs_path: certs_path.into(),
            backend: backend.into(),
        }
    }

    async fn read_certs(&self, found: &mut BTreeMap<String, DomainArtifacts>) -> Result<()> {
        let dir = self.path.join(CERTS_DIR);
        for domain in stems_with_extension(&dir, "crt").await? {
            let crt_path = dir.join(format!("{}.crt", domain));
            let key_path = dir.join(format!("{}.key", domain));

            let certificate = match fs::read_to_string(&crt_path).await {
                Ok(c) => c,
                Err(e) => {
                    warn!(domain = %domain, "Failed to read cert: {}", e);
                    continue;
                }
            };
            let private_key = match fs::read_to_string(&key_path).await {
                Ok(k) => k,
                Err(_) => {
                    warn!(domain = %domain, "Key file missing for domain, skipping");
                    continue;
                }
            };

            let cert = Cert::new(domain.as_str(), private_key, certificate);
            found.entry(domain).or_default().cert = Some(cert);
        }
        Ok(())
    }

    async fn read_challenges(&self, found: &mut BTreeMap<String, DomainArtifacts>) -> Result<()> {
        let dir = self.path.join(CHALLENGES_DIR);
        for domain in stems_with_extension(&dir, "content").await? {
            let content = match fs::read_to_string(dir.join(format!("{}.content", domain))).await {
                Ok(c) => c,
                Err(e) => {
                    warn!(domain = %domain, "Failed to read challenge file: {}", e);
                    continue;
                }
            };
            let path = match fs::read_to_string(dir.join(format!("{}.path", domain))).await {
                Ok(p) => p.trim().to_string(),
                Err(e) => {
                    warn!(domain = %domain, "Failed to read challenge path file: {}", e);
                    continue;
                }
            };
            let unsafe_char = |c: char| c.is_whitespace() || matches!(c, ';' | '{' | '}' | '"');
            if !path.starts_with('/') || path.contains(unsafe_char) {
                warn!(domain = %domain, path = %path, "Skipping challenge with invalid path");
                continue;
            }

            found.entry(domain).or_default().challenge = Some((path, content.trim().to_string()));
        }
        Ok(())
    }

    fn snippet_for(&self, domain: &str, artifacts: &DomainArtifacts) -> String {
        let mut snippet = String::new();

        snippet.push_str("server {\n    listen 80;\n");
        snippet.push_str(&format!("    server_name {};\n", domain));
        if let Some((path, content)) = &artifacts.challenge {
            snippet.push_str(&format!(
                "    location = {} {{\n        default_type text/plain;\n        return 200 \"{}\";\n    }}\n",
                path,
                escape_nginx_string(content)
            ));
        }
        if artifacts.cert.is_some() {
            snippet.push_str("    location / {\n        return 301 https://$host$request_uri;\n    }\n");
        }
        snippet.push_str("}\n");

        if artifacts.cert.is_some() {
            snippet.push_str("server {\n    listen 443 ssl;\n");
            snippet.push_str(&format!("    server_name {};\n", domain));
            snippet.push_str(&format!("    ssl_certificate {{{{ .CertsPath }}}}/{}.crt;\n", domain));
            snippet.push_str(&format!("    ssl_certificate_key {{{{ .CertsPath }}}}/{}.key;\n", domain));
            snippet.push_str("    location / {\n");
            snippet.push_str(&format!("        proxy_pass https://{};\n", self.backend));
            snippet.push_str("        proxy_set_header Host $host;\n");
            snippet.push_str("        proxy_ssl_server_name on;\n");
            snippet.push_str("    }\n}\n");
        }

        snippet
    }
}

#[async_trait]
impl ServerSource for ArtifactsSource {
    fn name(&self) -> &str {
        &self.name
    }

    async fn read(&self) -> Result<Vec<Server>> {
        if !fs::try_exists(&self.path).await.unwrap_or(false) {
            return Err(ProxyError::source_unavailable(
                &self.name,
                format!("{} does not exist", self.path.display()),
            ));
        }

        let mut found = BTreeMap::new();
        self.read_certs(&mut found).await?;
        self.read_challenges(&mut found).await?;

        let mut servers = Vec::with_capacity(found.len());
        for (domain, artifacts) in &found {
            let snippets = match render_snippet(&self.snippet_for(domain, artifacts), &self.certs_path) {
                Ok(s) => s,
                Err(e) => {
                    warn!(domain = %domain, "Failed to render snippet: {}", e);
                    continue;
                }
            };
            let cert = artifacts.cert.clone().unwrap_or_default();
            servers.push(Server::new(domain.clone(), snippets, cert));
        }

        debug!(source = %self.name, count = servers.len(), "Read servers");
        Ok(servers)
    }
}

/// Domains of `<dir>/<domain>.<extension>` files. A missing directory is empty.
async fn stems_with_extension(dir: &Path, extension: &str) -> Result<Vec<String>> {
    let mut entries = match fs::read_dir(dir).await {
        Ok(entries) => entries,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => return Err(ProxyError::source_unavailable("artifacts", e)),
    };

    let suffix = format!(".{}", extension);
    let mut stems = Vec::new();
    while let Some(entry) = entries
        .next_entry()
        .await
        .map_err(|e| ProxyError::source_unavailable("artifacts", e))?
    {
        let Some(name) = entry.file_name().to_str().map(str::to_string) else {
            continue;
        };
        let Some(domain) = name.strip_suffix(&suffix) else {
            continue;
        };
        if validate_domain(domain).is_ok() {
            stems.push(domain.to_string());
        }
    }
    stems.sort();
    Ok(stems)
}

fn escape_nginx_string(value: &str) -> String {
    value.replace('\\', "\\\\").replace('"', "\\\"")
}

/// Counts of files written by [`export_artifacts`]
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct ExportSummary {
    pub certs: usize,
    pub challenges: usize,
}

/// Dump annotated TLS secrets and ACME challenges from the cluster.
///
/// A record that cannot be written is logged and skipped.
pub async fn export_artifacts(store: &dyn ResourceStore, dir: &Path) -> Result<ExportSummary> {
    let certs_dir = dir.join(CERTS_DIR);
    let challenges_dir = dir.join(CHALLENGES_DIR);
    fs::create_dir_all(&certs_dir).await?;
    fs::create_dir_all(&challenges_dir).await?;

    let mut summary = ExportSummary::default();

    for secret in store.list_secrets().await? {
        if secret.secret_type != super::kubernetes::TLS_SECRET_TYPE {
            continue;
        }
        let Some(domain) = secret.annotations.get(EXTERNAL_DOMAIN_ANNOTATION) else {
            continue;
        };
        if validate_domain(domain).is_err() {
            warn!(secret = %secret.name, "Skipping secret with invalid external domain");
            continue;
        }
        let Some((crt, key)) = secret.tls_pair() else {
            warn!(secret = %secret.name, domain = %domain, "Secret missing tls.crt or tls.key");
            continue;
        };

        let crt_path = certs_dir.join(format!("{}.crt", domain));
        let key_path = certs_dir.join(format!("{}.key", domain));
        if let Err(e) = write_private(&crt_path, &crt).await {
            warn!(path = ?crt_path, "Failed to write: {}", e);
            continue;
        }
        if let Err(e) = write_private(&key_path, &key).await {
            warn!(path = ?key_path, "Failed to write: {}", e);
            continue;
        }
        info!(domain = %domain, "Saved certificate artifacts");
        summary.certs += 1;
    }

    for ingress in store.list_ingresses().await? {
        let (Some(path), Some(content)) = (
            ingress.annotations.get(CHALLENGE_PATH_ANNOTATION),
            ingress.annotations.get(CHALLENGE_CONTENT_ANNOTATION),
        ) else {
            continue;
        };

        let domain = ingress
            .hosts
            .iter()
            .find(|host| !host.is_empty())
            .cloned()
            .unwrap_or_else(|| ingress.name.clone());
        if validate_domain(&domain).is_err() {
            warn!(ingress = %ingress.name, "Skipping challenge with invalid domain");
            continue;
        }

        let path_file = challenges_dir.join(format!("{}.path", domain));
        let content_file = challenges_dir.join(format!("{}.content", domain));
        if let Err(e) = write_private(&path_file, path).await {
            warn!(path = ?path_file, "Failed to write: {}", e);
            continue;
        }
        if let Err(e) = write_private(&content_file, content).await {
            warn!(path = ?content_file, "Failed to write: {}", e);
            continue;
        }
        info!(domain = %domain, "Saved challenge");
        summary.challenges += 1;
    }

    Ok(summary)
}

async fn write_private(path: &Path, contents: &str) -> std::io::Result<()> {
    fs::write(path, contents).await?;
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        fs::set_permissions(path, std::fs::Permissions::from_mode(0o600)).await?;
    }
    Ok(())
}
