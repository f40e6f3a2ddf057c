//! ssl-proxy: TLS edge proxy and config reconciler
//!
//! # Usage
//!
//! ```bash
//! # One-time setup: settings row, API token, certificate for the proxy domain
//! ssl-proxy --config proxy.toml init --proxy proxy.example.com --destination app.example.com --email ops@example.com
//!
//! # Live proxy and control API
//! ssl-proxy --config proxy.toml run
//!
//! # Keep the routing engine in sync, on an interval or on file changes
//! ssl-proxy --config proxy.toml sync
//! ssl-proxy --config proxy.toml watch
//!
//! # Dump TLS secrets and ACME challenges from the cluster
//! ssl-proxy --config proxy.toml export-artifacts /var/lib/ssl-proxy/artifacts
//! ```

use anyhow::{anyhow, Context};
use clap::{Parser, Subcommand};
use ssl_proxy::acme::SelfSignedIssuer;
use ssl_proxy::config::KubeSourceConfig;
use ssl_proxy::setup::prepare_proxy;
use ssl_proxy::sources::artifacts::export_artifacts;
use ssl_proxy::sources::KubeResourceStore;
use ssl_proxy::watch::{run_watch, Debouncer, FsWatcher};
use ssl_proxy::{ProxyConfig, ProxyServer, ProxyState, Reconciler, Registry, Store};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser)]
#[command(name = "ssl-proxy")]
#[command(version, about = "TLS edge proxy and routing config reconciler", long_about = None)]
struct Cli {
    /// Configuration file (TOML). Development defaults when omitted.
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Create settings, API token and the proxy's own certificate
    Init {
        /// Domain the control API is served on
        #[arg(long)]
        proxy: String,
        /// Host every proxied request is forwarded to
        #[arg(long)]
        destination: String,
        /// Contact address for certificate issuance
        #[arg(long)]
        email: String,
    },
    /// Serve the live proxy and control API
    Run,
    /// Reconcile on a fixed interval
    Sync,
    /// Reconcile after filesystem changes
    Watch,
    /// Export TLS secrets and ACME challenges from the cluster
    ExportArtifacts {
        /// Target directory
        dir: PathBuf,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize logging
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "ssl_proxy=info,tower_http=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let cli = Cli::parse();
    info!("Starting ssl-proxy v{}", env!("CARGO_PKG_VERSION"));

    let config = load_config(cli.config.as_deref())?;
    let cancel = shutdown_token();

    match cli.command {
        Commands::Init {
            proxy,
            destination,
            email,
        } => {
            let store = Store::connect(&config.server.database_url).await?;
            let settings = prepare_proxy(&store, &proxy, &destination, &email, &SelfSignedIssuer).await?;
            info!(proxy_domain = %settings.proxy_domain, "Proxy prepared");
            println!("{}", settings.token);
        }
        Commands::Run => {
            config.validate()?;
            let store = Store::connect(&config.server.database_url).await?;
            store.init().await?;
            let settings = store
                .select_settings()
                .await?
                .ok_or_else(|| anyhow!("No settings found, run `ssl-proxy init` first"))?;

            let registry = Arc::new(Registry::load(&store).await?);
            let state = Arc::new(ProxyState::new(store, settings, registry, &config.server)?);
            ProxyServer::new(state)
                .run(&config.server.listen_addr, cancel)
                .await
                .context("Proxy server failed")?;
        }
        Commands::Sync => {
            config.validate_sync()?;
            let mut reconciler = Reconciler::from_config(&config).await?;
            reconciler.run_interval(config.sync.interval(), cancel).await;
        }
        Commands::Watch => {
            config.validate_sync()?;
            let paths = watch_paths(&config);
            if paths.is_empty() {
                return Err(anyhow!("Nothing to watch: set sync.watch_paths or a file based source"));
            }

            let mut reconciler = Reconciler::from_config(&config).await?;
            let (tx, debouncer) = Debouncer::channel(config.sync.debounce());
            let _watcher = FsWatcher::watch(&paths, tx)?;
            run_watch(&mut reconciler, debouncer, cancel).await;
        }
        Commands::ExportArtifacts { dir } => {
            let kube = config.sources.kube.clone().unwrap_or_else(KubeSourceConfig::default);
            let store = KubeResourceStore::connect(kube.namespace).await?;
            let summary = export_artifacts(&store, &dir).await?;
            info!(certs = summary.certs, challenges = summary.challenges, dir = ?dir, "Exported artifacts");
        }
    }

    Ok(())
}

fn load_config(path: Option<&Path>) -> anyhow::Result<ProxyConfig> {
    match path {
        Some(path) => {
            info!("Loading configuration from {}", path.display());
            Ok(ProxyConfig::from_file(path)?)
        }
        None => {
            info!("No config file specified, using development defaults");
            Ok(ProxyConfig::development())
        }
    }
}

/// Explicit watch paths, else the directories of the file based sources
fn watch_paths(config: &ProxyConfig) -> Vec<PathBuf> {
    if !config.sync.watch_paths.is_empty() {
        return config.sync.watch_paths.clone();
    }

    let mut paths = Vec::new();
    if let Some(local) = &config.sources.local {
        paths.push(local.snippets_path.clone());
        paths.push(local.certs_path.clone());
    }
    if let Some(artifacts) = &config.sources.artifacts {
        paths.push(artifacts.path.clone());
    }
    paths
}

/// Cancelled on Ctrl-C
fn shutdown_token() -> CancellationToken {
    let cancel = CancellationToken::new();
    let token = cancel.clone();
    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => {
                info!("Shutdown requested");
                token.cancel();
            }
            Err(e) => error!("Failed to listen for shutdown signal: {}", e),
        }
    });
    cancel
}
