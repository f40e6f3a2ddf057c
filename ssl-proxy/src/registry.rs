//! In-memory server registry shared by the TLS resolver and request handlers.
//!
//! Readers take the current snapshot without locking. Writers build a whole
//! new snapshot and swap it in, so a reader sees either the old list or the
//! new one and never a mix. Control-API writes are serialized with
//! [`Registry::lock_writes`].

use arc_swap::ArcSwap;
use rustls::sign::CertifiedKey;
use std::sync::Arc;
use tokio::sync::{Mutex, MutexGuard};
use tracing::{debug, warn};

use crate::error::Result;
use crate::model::ServerRegistryEntry;
use crate::router::normalize_host;
use crate::store::Store;
use crate::tls::certified_key_from_pem;

/// A registry entry with its key pair parsed ahead of time
#[derive(Clone)]
pub struct RegisteredServer {
    pub entry: ServerRegistryEntry,
    /// `None` when the stored PEM could not be parsed
    pub key: Option<Arc<CertifiedKey>>,
}

impl RegisteredServer {
    fn new(entry: ServerRegistryEntry) -> Self {
        let key = match certified_key_from_pem(&entry.ssl_cert, &entry.ssl_key) {
            Ok(key) => Some(Arc::new(key)),
            Err(e) => {
                warn!(domain = %entry.domain, "Unusable key pair in registry: {}", e);
                None
            }
        };
        Self { entry, key }
    }

    fn matches(&self, host: &str) -> bool {
        self.entry.domain.eq_ignore_ascii_case(host)
    }
}

/// One consistent view of the registry
#[derive(Clone, Default)]
pub struct RegistrySnapshot {
    pub servers: Vec<RegisteredServer>,
    /// The store changed but could not be read back
    pub stale: bool,
}

impl RegistrySnapshot {
    pub fn domains(&self) -> Vec<&str> {
        self.servers.iter().map(|s| s.entry.domain.as_str()).collect()
    }
}

pub struct Registry {
    current: ArcSwap<RegistrySnapshot>,
    write_lock: Mutex<()>,
}

impl Registry {
    pub fn new(entries: Vec<ServerRegistryEntry>) -> Self {
        Self {
            current: ArcSwap::from_pointee(build_snapshot(entries)),
            write_lock: Mutex::new(()),
        }
    }

    pub fn empty() -> Self {
        Self::new(Vec::new())
    }

    /// Load the registry from the store
    pub async fn load(store: &Store) -> Result<Self> {
        Ok(Self::new(store.select_servers().await?))
    }

    pub fn snapshot(&self) -> Arc<RegistrySnapshot> {
        self.current.load_full()
    }

    /// Swap in a fresh snapshot built from `entries`
    pub fn replace(&self, entries: Vec<ServerRegistryEntry>) {
        let snapshot = build_snapshot(entries);
        debug!(count = snapshot.servers.len(), "Replaced registry");
        self.current.store(Arc::new(snapshot));
    }

    /// Keep serving the current entries but report them as out of date
    pub fn mark_stale(&self) {
        let current = self.current.load();
        if current.stale {
            return;
        }
        let stale = RegistrySnapshot {
            servers: current.servers.clone(),
            stale: true,
        };
        self.current.store(Arc::new(stale));
    }

    pub fn is_stale(&self) -> bool {
        self.current.load().stale
    }

    /// Re-read every entry from the store and swap it in
    pub async fn reload_from(&self, store: &Store) -> Result<usize> {
        let entries = store.select_servers().await?;
        let count = entries.len();
        self.replace(entries);
        Ok(count)
    }

    /// Serializes control-API writes against each other
    pub async fn lock_writes(&self) -> MutexGuard<'_, ()> {
        self.write_lock.lock().await
    }

    /// Key pair for a TLS server name, by linear scan
    pub fn certified_key_for(&self, server_name: &str) -> Option<Arc<CertifiedKey>> {
        let name = normalize_host(server_name);
        self.current
            .load()
            .servers
            .iter()
            .find(|s| s.matches(&name))
            .and_then(|s| s.key.clone())
    }

    pub fn contains_host(&self, host: &str) -> bool {
        let host = normalize_host(host);
        self.current.load().servers.iter().any(|s| s.matches(&host))
    }
}

fn build_snapshot(entries: Vec<ServerRegistryEntry>) -> RegistrySnapshot {
    RegistrySnapshot {
        servers: entries.into_iter().map(RegisteredServer::new).collect(),
        stale: false,
    }
}
