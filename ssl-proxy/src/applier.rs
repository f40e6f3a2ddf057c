//! Writes desired servers into the routing engine's config directories.
//!
//! Per changed server the files are written in the order certificate, key,
//! snippet. Each file goes to a dot-prefixed temporary name first and is
//! renamed into place, so an interrupted pass leaves either the old or the
//! new content and the write can be retried as is.

use async_trait::async_trait;
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::fs;
use tokio::process::Command;
use tracing::{debug, error, info, warn};

use crate::error::{ProxyError, Result};
use crate::model::{validate_domain, Server};
use crate::template::render_snippet;

const CERT_MODE: u32 = 0o600;
const SNIPPET_MODE: u32 = 0o644;

/// Asks the routing engine to pick up new configuration
#[async_trait]
pub trait Reloader: Send + Sync {
    /// Returns the engine's output on success
    async fn reload(&self) -> Result<String>;
}

/// Runs an external command such as `nginx -s reload`
pub struct CommandReloader {
    command: Vec<String>,
    timeout: Duration,
}

impl CommandReloader {
    pub fn new(command: Vec<String>, timeout: Duration) -> Self {
        Self { command, timeout }
    }
}

#[async_trait]
impl Reloader for CommandReloader {
    async fn reload(&self) -> Result<String> {
        let (program, args) = self
            .command
            .split_first()
            .ok_or_else(|| ProxyError::Reload("empty reload command".to_string()))?;

        let mut command = Command::new(program);
        command.args(args).kill_on_drop(true);

        let output = tokio::time::timeout(self.timeout, command.output())
            .await
            .map_err(|_| ProxyError::Reload(format!("{} timed out after {:?}", program, self.timeout)))?
            .map_err(|e| ProxyError::Reload(format!("failed to run {}: {}", program, e)))?;

        let stdout = String::from_utf8_lossy(&output.stdout);
        let stderr = String::from_utf8_lossy(&output.stderr);

        if !output.status.success() {
            return Err(ProxyError::Reload(format!(
                "{} exited with {}: {}",
                program,
                output.status,
                stderr.trim()
            )));
        }

        Ok(format!("{}{}", stdout, stderr).trim().to_string())
    }
}

/// A domain the applier could not write or remove
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ApplyFailure {
    pub domain: String,
    pub error: String,
}

/// Outcome of one apply batch
#[derive(Debug, Default, Clone)]
pub struct ApplyReport {
    /// Domains whose files were written
    pub written: Vec<String>,
    /// Domains whose snippet was removed
    pub removed: Vec<String>,
    pub failures: Vec<ApplyFailure>,
    /// Whether a reload was attempted
    pub reloaded: bool,
    pub reload_error: Option<String>,
}

impl ApplyReport {
    /// No per-domain failures and no reload failure
    pub fn is_clean(&self) -> bool {
        self.failures.is_empty() && self.reload_error.is_none()
    }

    pub fn failed_domains(&self) -> HashSet<&str> {
        self.failures.iter().map(|f| f.domain.as_str()).collect()
    }
}

/// Writes certificates and rendered snippets, then reloads the engine once
pub struct ConfigApplier {
    certs_path: PathBuf,
    snippets_path: PathBuf,
    reloader: Arc<dyn Reloader>,
}

impl ConfigApplier {
    pub fn new(
        certs_path: impl Into<PathBuf>,
        snippets_path: impl Into<PathBuf>,
        reloader: Arc<dyn Reloader>,
    ) -> Self {
        Self {
            certs_path: certs_path.into(),
            snippets_path: snippets_path.into(),
            reloader,
        }
    }

    pub fn certs_path(&self) -> &Path {
        &self.certs_path
    }

    pub fn snippets_path(&self) -> &Path {
        &self.snippets_path
    }

    /// Create both target directories if they are missing
    pub async fn ensure_dirs(&self) -> Result<()> {
        fs::create_dir_all(&self.certs_path).await?;
        fs::create_dir_all(&self.snippets_path).await?;
        Ok(())
    }

    /// Apply one batch. Never fails as a whole: problems end up in the report.
    pub async fn apply(&self, changed: &[Server], removed: &[Server]) -> ApplyReport {
        let mut report = ApplyReport::default();

        for server in changed {
            match self.write_server(server).await {
                Ok(()) => {
                    info!(domain = %server.domain, cert = server.has_cert(), "Wrote server config");
                    report.written.push(server.domain.clone());
                }
                Err(e) => {
                    error!(domain = %server.domain, "Failed to write server config: {}", e);
                    report.failures.push(ApplyFailure {
                        domain: server.domain.clone(),
                        error: e.to_string(),
                    });
                }
            }
        }

        for server in removed {
            match self.remove_server(&server.domain).await {
                Ok(()) => {
                    info!(domain = %server.domain, "Removed server config");
                    report.removed.push(server.domain.clone());
                }
                Err(e) => {
                    error!(domain = %server.domain, "Failed to remove server config: {}", e);
                    report.failures.push(ApplyFailure {
                        domain: server.domain.clone(),
                        error: e.to_string(),
                    });
                }
            }
        }

        if report.written.is_empty() && report.removed.is_empty() {
            debug!("Nothing applied, skipping reload");
            return report;
        }

        report.reloaded = true;
        match self.reloader.reload().await {
            Ok(output) => {
                info!(output = %output, "Reloaded routing engine");
            }
            Err(e) => {
                // Files stay in place; the engine keeps serving the old config until a later reload
                warn!("Routing engine reload failed: {}", e);
                report.reload_error = Some(e.to_string());
            }
        }

        report
    }

    async fn write_server(&self, server: &Server) -> Result<()> {
        validate_domain(&server.domain)?;
        let snippet = render_snippet(&server.snippets, &self.certs_path)?;

        if server.has_cert() {
            let crt = self.certs_path.join(format!("{}.crt", server.domain));
            let key = self.certs_path.join(format!("{}.key", server.domain));
            write_atomic(&crt, server.cert.certificate.as_bytes(), CERT_MODE).await?;
            write_atomic(&key, server.cert.private_key.as_bytes(), CERT_MODE).await?;
        }

        let path = self.snippets_path.join(&server.domain);
        write_atomic(&path, snippet.as_bytes(), SNIPPET_MODE).await
    }

    /// Certificates of removed domains are left in place
    async fn remove_server(&self, domain: &str) -> Result<()> {
        validate_domain(domain)?;
        match fs::remove_file(self.snippets_path.join(domain)).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}

async fn write_atomic(path: &Path, contents: &[u8], mode: u32) -> Result<()> {
    let file_name = path
        .file_name()
        .and_then(|n| n.to_str())
        .ok_or_else(|| ProxyError::Config(format!("Invalid target path {}", path.display())))?;
    let tmp = path.with_file_name(format!(".{}.tmp", file_name));

    fs::write(&tmp, contents).await?;
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        fs::set_permissions(&tmp, std::fs::Permissions::from_mode(mode)).await?;
    }
    #[cfg(not(unix))]
    let _ = mode;

    if let Err(e) = fs::rename(&tmp, path).await {
        let _ = fs::remove_file(&tmp).await;
        return Err(e.into());
    }
    Ok(())
}
