//! Desired-state sources.
//!
//! A source reports the servers it currently wants. Per-record problems
//! (an unreadable file, a bad annotation) are logged and the record is
//! skipped; only a failure of the whole origin is returned as an error, so
//! the reconciler can tell "nothing wanted" apart from "could not ask".

use async_trait::async_trait;
use std::sync::Arc;
use tracing::info;

use crate::config::ProxyConfig;
use crate::error::Result;
use crate::model::Server;

pub mod artifacts;
pub mod kubernetes;
pub mod local;

pub use self::artifacts::ArtifactsSource;
pub use self::kubernetes::{KubeResourceStore, KubeSource, ResourceStore};
pub use self::local::LocalSource;

/// A single origin of desired servers
#[async_trait]
pub trait ServerSource: Send + Sync {
    /// Short name used in logs
    fn name(&self) -> &str;

    /// Read the servers this origin currently wants
    async fn read(&self) -> Result<Vec<Server>>;
}

/// Build the sources enabled in `config`, in the order local, kube, artifacts.
///
/// When two sources report the same domain the earlier one wins.
pub async fn from_config(config: &ProxyConfig) -> Result<Vec<Arc<dyn ServerSource>>> {
    let mut sources: Vec<Arc<dyn ServerSource>> = Vec::new();

    if let Some(local) = &config.sources.local {
        info!(path = ?local.snippets_path, "Enabling local source");
        sources.push(Arc::new(LocalSource::new(&local.snippets_path, &local.certs_path)));
    }

    if let Some(kube) = &config.sources.kube {
        let store = KubeResourceStore::connect(kube.namespace.clone()).await?;
        sources.push(Arc::new(KubeSource::new(
            Arc::new(store),
            &config.sync.certs_path,
            &kube.annotation_prefix,
        )));
    }

    if let Some(artifacts) = &config.sources.artifacts {
        info!(path = ?artifacts.path, backend = %artifacts.backend, "Enabling artifacts source");
        sources.push(Arc::new(ArtifactsSource::new(
            &artifacts.path,
            &config.sync.certs_path,
            artifacts.backend.clone(),
        )));
    }

    Ok(sources)
}
