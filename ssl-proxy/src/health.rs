//! Health of the control plane: store reachable, settings present, registry current.

use std::sync::Arc;
use tracing::warn;

use crate::registry::Registry;
use crate::store::Store;

/// Health status of the control plane
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HealthStatus {
    Healthy,
    /// The store did not answer
    StoreUnreachable(String),
    /// The store answered but setup never ran
    SettingsMissing,
    /// The registry could not be reloaded after a write
    RegistryStale,
}

impl HealthStatus {
    pub fn is_healthy(&self) -> bool {
        matches!(self, HealthStatus::Healthy)
    }

    /// Response body for the health endpoint
    pub fn message(&self) -> &'static str {
        match self {
            HealthStatus::Healthy => "OK",
            HealthStatus::StoreUnreachable(_) => "Database unreachable",
            HealthStatus::SettingsMissing => "Settings not loaded",
            HealthStatus::RegistryStale => "Servers not loaded",
        }
    }
}

pub struct HealthChecker {
    store: Store,
    registry: Arc<Registry>,
}

impl HealthChecker {
    pub fn new(store: Store, registry: Arc<Registry>) -> Self {
        Self { store, registry }
    }

    pub async fn check(&self) -> HealthStatus {
        if let Err(e) = self.store.ping().await {
            let status = HealthStatus::StoreUnreachable(e.to_string());
            warn!(status = ?status, "Health check failed");
            return status;
        }

        let status = match self.store.select_settings().await {
            Err(e) => HealthStatus::StoreUnreachable(e.to_string()),
            Ok(None) => HealthStatus::SettingsMissing,
            Ok(Some(_)) if self.registry.is_stale() => HealthStatus::RegistryStale,
            Ok(Some(_)) => HealthStatus::Healthy,
        };

        if !status.is_healthy() {
            warn!(status = ?status, "Health check failed");
        }
        status
    }
}
