//! Configuration for ssl-proxy

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::error::{ProxyError, Result};

/// Main proxy configuration
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct ProxyConfig {
    /// Live proxy / control plane
    #[serde(default)]
    pub server: ServerConfig,
    /// Reconciliation loop
    #[serde(default)]
    pub sync: SyncConfig,
    /// Desired-state sources
    #[serde(default)]
    pub sources: SourcesConfig,
}

/// Server configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ServerConfig {
    /// Listen address for HTTPS (e.g., "0.0.0.0:443")
    #[serde(default = "default_listen_addr")]
    pub listen_addr: String,
    /// SQLite URL of the settings/registry store
    #[serde(default = "default_database_url")]
    pub database_url: String,
    /// Scheme used to reach the destination domain
    #[serde(default = "default_upstream_scheme")]
    pub upstream_scheme: String,
    /// Request timeout in seconds
    #[serde(default = "default_timeout")]
    pub timeout_seconds: u64,
    /// Largest request body forwarded to the destination
    #[serde(default = "default_max_body_bytes")]
    pub max_body_bytes: usize,
}

/// Reconciliation configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct SyncConfig {
    /// Directory the routing engine reads certificates from
    #[serde(default = "default_certs_path")]
    pub certs_path: PathBuf,
    /// Directory the routing engine reads per-domain snippets from
    #[serde(default = "default_snippets_path")]
    pub snippets_path: PathBuf,
    /// Interval mode period
    #[serde(default = "default_interval")]
    pub interval_seconds: u64,
    /// Quiet window before a burst of filesystem events triggers a pass
    #[serde(default = "default_debounce")]
    pub debounce_millis: u64,
    /// Bound on a single source read
    #[serde(default = "default_source_timeout")]
    pub source_timeout_seconds: u64,
    /// Paths watched in event mode
    #[serde(default)]
    pub watch_paths: Vec<PathBuf>,
    /// Start the last-applied snapshot from the applied directories
    #[serde(default = "default_true")]
    pub seed_from_disk: bool,
    /// Routing engine reload
    #[serde(default)]
    pub reload: ReloadConfig,
}

/// Routing engine reload command
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ReloadConfig {
    /// Program and arguments (e.g., ["nginx", "-s", "reload"])
    #[serde(default = "default_reload_command")]
    pub command: Vec<String>,
    #[serde(default = "default_timeout")]
    pub timeout_seconds: u64,
}

/// Enabled desired-state sources
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct SourcesConfig {
    pub local: Option<LocalSourceConfig>,
    pub kube: Option<KubeSourceConfig>,
    pub artifacts: Option<ArtifactsSourceConfig>,
}

/// One snippet file per domain plus `<domain>.crt`/`<domain>.key`
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct LocalSourceConfig {
    pub snippets_path: PathBuf,
    pub certs_path: PathBuf,
}

/// Annotated ingresses and TLS secrets in one namespace
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct KubeSourceConfig {
    #[serde(default = "default_namespace")]
    pub namespace: String,
    #[serde(default = "default_annotation_prefix")]
    pub annotation_prefix: String,
}

/// Exported certificates and ACME challenges
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ArtifactsSourceConfig {
    pub path: PathBuf,
    /// `host:port` the generated snippets proxy to
    pub backend: String,
}

fn default_listen_addr() -> String {
    "0.0.0.0:443".to_string()
}

fn default_database_url() -> String {
    "sqlite://settings.db?mode=rwc".to_string()
}

fn default_upstream_scheme() -> String {
    "https".to_string()
}

fn default_timeout() -> u64 {
    30
}

fn default_max_body_bytes() -> usize {
    10 * 1024 * 1024
}

fn default_certs_path() -> PathBuf {
    PathBuf::from("/etc/nginx/certs")
}

fn default_snippets_path() -> PathBuf {
    PathBuf::from("/etc/nginx/servers")
}

fn default_interval() -> u64 {
    30
}

fn default_debounce() -> u64 {
    2000
}

fn default_source_timeout() -> u64 {
    20
}

fn default_true() -> bool {
    true
}

fn default_reload_command() -> Vec<String> {
    vec!["nginx".to_string(), "-s".to_string(), "reload".to_string()]
}

fn default_namespace() -> String {
    "website-builder".to_string()
}

fn default_annotation_prefix() -> String {
    "external-proxy/".to_string()
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen_addr: default_listen_addr(),
            database_url: default_database_url(),
            upstream_scheme: default_upstream_scheme(),
            timeout_seconds: default_timeout(),
            max_body_bytes: default_max_body_bytes(),
        }
    }
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            certs_path: default_certs_path(),
            snippets_path: default_snippets_path(),
            interval_seconds: default_interval(),
            debounce_millis: default_debounce(),
            source_timeout_seconds: default_source_timeout(),
            watch_paths: Vec::new(),
            seed_from_disk: true,
            reload: ReloadConfig::default(),
        }
    }
}

impl Default for KubeSourceConfig {
    fn default() -> Self {
        Self {
            namespace: default_namespace(),
            annotation_prefix: default_annotation_prefix(),
        }
    }
}

impl Default for ReloadConfig {
    fn default() -> Self {
        Self {
            command: default_reload_command(),
            timeout_seconds: default_timeout(),
        }
    }
}

impl SyncConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_seconds)
    }

    pub fn debounce(&self) -> Duration {
        Duration::from_millis(self.debounce_millis)
    }

    pub fn source_timeout(&self) -> Duration {
        Duration::from_secs(self.source_timeout_seconds)
    }
}

impl ProxyConfig {
    /// Load configuration from a TOML file
    pub fn from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| ProxyError::Config(format!("Failed to read config file: {}", e)))?;

        toml::from_str(&content)
            .map_err(|e| ProxyError::Config(format!("Failed to parse config: {}", e)))
    }

    /// Create a default development configuration
    pub fn development() -> Self {
        let base = PathBuf::from("./var");
        Self {
            server: ServerConfig {
                listen_addr: "0.0.0.0:8443".to_string(),
                database_url: "sqlite://settings.db?mode=rwc".to_string(),
                ..ServerConfig::default()
            },
            sync: SyncConfig {
                certs_path: base.join("nginx/certs"),
                snippets_path: base.join("nginx/servers"),
                watch_paths: vec![base.join("artifacts")],
                ..SyncConfig::default()
            },
            sources: SourcesConfig {
                artifacts: Some(ArtifactsSourceConfig {
                    path: base.join("artifacts"),
                    backend: "127.0.0.1:3000".to_string(),
                }),
                ..SourcesConfig::default()
            },
        }
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<()> {
        if self.server.listen_addr.is_empty() {
            return Err(ProxyError::Config("listen_addr must not be empty".to_string()));
        }

        if !matches!(self.server.upstream_scheme.as_str(), "http" | "https") {
            return Err(ProxyError::Config(format!(
                "Invalid upstream scheme '{}'",
                self.server.upstream_scheme
            )));
        }

        if self.sync.reload.command.first().map_or(true, |p| p.is_empty()) {
            return Err(ProxyError::Config("Reload command has no program".to_string()));
        }

        if self.sync.interval_seconds == 0 {
            return Err(ProxyError::Config("interval_seconds must be positive".to_string()));
        }

        if self.sync.debounce_millis == 0 {
            return Err(ProxyError::Config("debounce_millis must be positive".to_string()));
        }

        if let Some(artifacts) = &self.sources.artifacts {
            url::Url::parse(&format!("https://{}", artifacts.backend)).map_err(|e| {
                ProxyError::Config(format!("Invalid artifacts backend '{}': {}", artifacts.backend, e))
            })?;
        }

        Ok(())
    }

    /// Validate the parts needed by the reconciliation loop
    pub fn validate_sync(&self) -> Result<()> {
        self.validate()?;

        let sources = &self.sources;
        if sources.local.is_none() && sources.kube.is_none() && sources.artifacts.is_none() {
            return Err(ProxyError::Config("No sources configured".to_string()));
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = ProxyConfig::development();
        assert!(config.validate().is_ok());
        assert!(config.validate_sync().is_ok());
    }

    #[test]
    fn test_parse_config() {
        let toml = r#"
[server]
listen_addr = "0.0.0.0:443"

[sync]
certs_path = "/etc/nginx/certs"
snippets_path = "/etc/nginx/servers"
interval_seconds = 10

[sync.reload]
command = ["systemctl", "reload", "nginx"]

[sources.kube]
namespace = "sites"
"#;
        let config: ProxyConfig = toml::from_str(toml).unwrap();
        assert_eq!(config.server.listen_addr, "0.0.0.0:443");
        assert_eq!(config.server.upstream_scheme, "https");
        assert_eq!(config.sync.interval(), Duration::from_secs(10));
        assert_eq!(config.sync.debounce(), Duration::from_millis(2000));
        assert_eq!(config.sync.reload.command[0], "systemctl");

        let kube = config.sources.kube.as_ref().unwrap();
        assert_eq!(kube.namespace, "sites");
        assert_eq!(kube.annotation_prefix, "external-proxy/");
        assert!(config.validate_sync().is_ok());
    }

    #[test]
    fn test_validate_rejects_bad_values() {
        let mut config = ProxyConfig::development();
        config.server.upstream_scheme = "ftp".to_string();
        assert!(config.validate().is_err());

        let mut config = ProxyConfig::development();
        config.sync.reload.command.clear();
        assert!(config.validate().is_err());

        let mut config = ProxyConfig::development();
        config.sync.interval_seconds = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_sync_requires_a_source() {
        let config = ProxyConfig::default();
        assert!(config.validate().is_ok());
        assert!(config.validate_sync().is_err());
    }
}
