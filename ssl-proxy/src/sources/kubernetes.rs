//! Cluster source: annotated ingresses paired with TLS secrets.
//!
//! An ingress is wanted when it carries both `<prefix>domain` and
//! `<prefix>server-snippets`. The snippet is rendered with the certificate
//! directory; the certificate comes from a `kubernetes.io/tls` secret
//! annotated with the same `<prefix>domain`. Without such a secret the
//! server is reported with an empty certificate.

use async_trait::async_trait;
use k8s_openapi::api::core::v1::Secret;
use k8s_openapi::api::networking::v1::Ingress;
use kube::api::{Api, ListParams};
use kube::Client;
use std::collections::{BTreeMap, HashSet};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{debug, info, warn};

use super::ServerSource;
use crate::error::{ProxyError, Result};
use crate::model::{validate_domain, Cert, Server};
use crate::template::render_snippet;

pub const TLS_SECRET_TYPE: &str = "kubernetes.io/tls";
pub const TLS_CERT_KEY: &str = "tls.crt";
pub const TLS_PRIVATE_KEY: &str = "tls.key";

/// The parts of an ingress the sources look at
#[derive(Debug, Clone, Default)]
pub struct IngressRecord {
    pub name: String,
    pub annotations: BTreeMap<String, String>,
    /// Hosts of the ingress rules, in rule order
    pub hosts: Vec<String>,
}

/// The parts of a secret the sources look at
#[derive(Debug, Clone, Default)]
pub struct SecretRecord {
    pub name: String,
    pub secret_type: String,
    pub annotations: BTreeMap<String, String>,
    pub data: BTreeMap<String, Vec<u8>>,
}

impl SecretRecord {
    /// PEM certificate and key of a TLS secret, if both are present and UTF-8
    pub fn tls_pair(&self) -> Option<(String, String)> {
        let crt = self.data.get(TLS_CERT_KEY)?;
        let key = self.data.get(TLS_PRIVATE_KEY)?;
        let crt = String::from_utf8(crt.clone()).ok()?;
        let key = String::from_utf8(key.clone()).ok()?;
        Some((crt, key))
    }
}

/// Namespace-scoped listing of ingresses and secrets
#[async_trait]
pub trait ResourceStore: Send + Sync {
    async fn list_ingresses(&self) -> Result<Vec<IngressRecord>>;
    async fn list_secrets(&self) -> Result<Vec<SecretRecord>>;
}

/// [`ResourceStore`] backed by the Kubernetes API
pub struct KubeResourceStore {
    client: Client,
    namespace: String,
}

impl KubeResourceStore {
    pub fn new(client: Client, namespace: impl Into<String>) -> Self {
        Self {
            client,
            namespace: namespace.into(),
        }
    }

    /// Connect with the in-cluster config or the local kubeconfig
    pub async fn connect(namespace: impl Into<String>) -> Result<Self> {
        let client = Client::try_default()
            .await
            .map_err(|e| ProxyError::source_unavailable("kube", format!("failed to create k8s client: {}", e)))?;
        let namespace = namespace.into();
        info!(namespace = %namespace, "Connected to cluster");
        Ok(Self::new(client, namespace))
    }
}

#[async_trait]
impl ResourceStore for KubeResourceStore {
    async fn list_ingresses(&self) -> Result<Vec<IngressRecord>> {
        let api: Api<Ingress> = Api::namespaced(self.client.clone(), &self.namespace);
        let list = api
            .list(&ListParams::default())
            .await
            .map_err(|e| ProxyError::source_unavailable("kube", format!("failed to list ingresses: {}", e)))?;

        Ok(list
            .items
            .into_iter()
            .map(|ingress| IngressRecord {
                name: ingress.metadata.name.unwrap_or_default(),
                annotations: ingress.metadata.annotations.unwrap_or_default(),
                hosts: ingress
                    .spec
                    .and_then(|spec| spec.rules)
                    .unwrap_or_default()
                    .into_iter()
                    .filter_map(|rule| rule.host)
                    .collect(),
            })
            .collect())
    }

    async fn list_secrets(&self) -> Result<Vec<SecretRecord>> {
        let api: Api<Secret> = Api::namespaced(self.client.clone(), &self.namespace);
        let list = api
            .list(&ListParams::default())
            .await
            .map_err(|e| ProxyError::source_unavailable("kube", format!("failed to list secrets: {}", e)))?;

        Ok(list
            .items
            .into_iter()
            .map(|secret| SecretRecord {
                name: secret.metadata.name.unwrap_or_default(),
                secret_type: secret.type_.unwrap_or_default(),
                annotations: secret.metadata.annotations.unwrap_or_default(),
                data: secret
                    .data
                    .unwrap_or_default()
                    .into_iter()
                    .map(|(key, value)| (key, value.0))
                    .collect(),
            })
            .collect())
    }
}

/// Desired servers from annotated cluster resources
pub struct KubeSource {
    name: String,
    store: Arc<dyn ResourceStore>,
    certs_path: PathBuf,
    domain_annotation: String,
    snippets_annotation: String,
}

impl KubeSource {
    pub fn new(
        store: Arc<dyn ResourceStore>,
        certs_path: impl Into<PathBuf>,
        annotation_prefix: &str,
    ) -> Self {
        Self {
            name: "kube".to_string(),
            store,
            certs_path: certs_path.into(),
            domain_annotation: format!("{}domain", annotation_prefix),
            snippets_annotation: format!("{}server-snippets", annotation_prefix),
        }
    }

    fn find_cert(&self, domain: &str, secrets: &[SecretRecord]) -> Cert {
        let matching = secrets.iter().filter(|secret| {
            secret.secret_type == TLS_SECRET_TYPE
                && secret.annotations.get(&self.domain_annotation).map(String::as_str) == Some(domain)
        });

        for secret in matching {
            match secret.tls_pair() {
                Some((certificate, private_key)) => {
                    return Cert::new(domain, private_key, certificate);
                }
                None => {
                    warn!(
                        domain = %domain,
                        secret = %secret.name,
                        "Secret missing {} or {}", TLS_CERT_KEY, TLS_PRIVATE_KEY
                    );
                }
            }
        }

        Cert::default()
    }
}

#[async_trait]
impl ServerSource for KubeSource {
    fn name(&self) -> &str {
        &self.name
    }

    async fn read(&self) -> Result<Vec<Server>> {
        let ingresses = self.store.list_ingresses().await?;
        let secrets = self.store.list_secrets().await?;

        let mut seen = HashSet::new();
        let mut servers = Vec::new();
        for ingress in &ingresses {
            let (Some(domain), Some(snippet)) = (
                ingress.annotations.get(&self.domain_annotation),
                ingress.annotations.get(&self.snippets_annotation),
            ) else {
                continue;
            };

            if let Err(e) = validate_domain(domain) {
                warn!(ingress = %ingress.name, "Skipping ingress: {}", e);
                continue;
            }

            if !seen.insert(domain.clone()) {
                warn!(ingress = %ingress.name, domain = %domain, "Domain already claimed by another ingress");
                continue;
            }

            let snippets = match render_snippet(snippet, &self.certs_path) {
                Ok(s) => s,
                Err(e) => {
                    warn!(ingress = %ingress.name, domain = %domain, "Skipping ingress: {}", e);
                    continue;
                }
            };

            let cert = self.find_cert(domain, &secrets);
            if !cert.is_complete() {
                debug!(domain = %domain, "No TLS secret for domain yet");
            }

            servers.push(Server::new(domain.clone(), snippets, cert));
        }

        debug!(source = %self.name, count = servers.len(), "Read servers");
        Ok(servers)
    }
}
