//! ssl-proxy: TLS edge that keeps virtual servers in sync with their sources
//!
//! Two halves share the data model:
//!
//! - **Reconciliation**: desired servers are read from one or more sources
//!   (a snippets directory, annotated cluster resources, an artifacts
//!   directory), diffed against the last-applied snapshot, and written as
//!   certificates plus routing snippets for an external engine such as
//!   nginx, which is then reloaded. Passes run on an interval or after a
//!   debounced burst of filesystem events.
//! - **Live proxy**: an HTTPS server that picks the certificate for each
//!   handshake from an in-memory registry, forwards requests for registered
//!   hosts to one destination, and exposes an authenticated control API to
//!   add or update registry entries.
//!
//! # Example Configuration
//!
//! ```toml
//! [server]
//! listen_addr = "0.0.0.0:443"
//! database_url = "sqlite://settings.db"
//!
//! [sync]
//! certs_path = "/etc/nginx/certs"
//! snippets_path = "/etc/nginx/servers"
//! interval_seconds = 30
//!
//! [sync.reload]
//! command = ["nginx", "-s", "reload"]
//!
//! [sources.kube]
//! namespace = "website-builder"
//! annotation_prefix = "external-proxy/"
//! ```

pub mod acme;
pub mod applier;
pub mod config;
pub mod diff;
pub mod error;
pub mod health;
pub mod model;
pub mod proxy;
pub mod reconcile;
pub mod registry;
pub mod router;
pub mod setup;
pub mod sources;
pub mod store;
pub mod template;
pub mod tls;
pub mod watch;

pub use config::ProxyConfig;
pub use error::{ProxyError, Result};
pub use model::{Cert, Server, ServerRegistryEntry, Settings};
pub use proxy::{ProxyServer, ProxyState};
pub use reconcile::Reconciler;
pub use registry::Registry;
pub use store::Store;
