//! Fetch, diff and apply, keeping the last-applied snapshot between passes.
//!
//! Sources are read concurrently, each bounded by a timeout. A source that
//! fails keeps the domains it reported last time (taken from the snapshot),
//! so an unreachable origin never reads as "everything removed". When a
//! source has failed on every read so far, the pass is skipped.
//!
//! The snapshot only advances for what actually reached the disk: a domain
//! that failed to write keeps its previous entry and is retried next pass,
//! and a failed reload keeps the whole previous snapshot.
//!
//! Snippets are compared in the form the engine sees them, rendered with the
//! certificate directory, so a snapshot read back from disk matches a
//! templated source snippet.

use futures::future::join_all;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::applier::{ApplyReport, CommandReloader, ConfigApplier};
use crate::config::ProxyConfig;
use crate::diff::{select_changed_servers, select_removed_servers};
use crate::error::Result;
use crate::model::Server;
use crate::sources::{self, LocalSource, ServerSource};
use crate::template::render_snippet;

/// What one pass did
#[derive(Debug, Default, Clone)]
pub struct PassSummary {
    /// No usable desired state; nothing was applied
    pub skipped: bool,
    pub changed: Vec<String>,
    pub removed: Vec<String>,
    pub report: ApplyReport,
}

impl PassSummary {
    fn skipped() -> Self {
        Self {
            skipped: true,
            ..Self::default()
        }
    }

    pub fn is_noop(&self) -> bool {
        self.changed.is_empty() && self.removed.is_empty()
    }
}

pub struct Reconciler {
    sources: Vec<Arc<dyn ServerSource>>,
    applier: ConfigApplier,
    source_timeout: Duration,
    snapshot: Vec<Server>,
    /// Domains each source reported on its last successful read
    owned: Vec<Option<HashSet<String>>>,
}

impl Reconciler {
    pub fn new(
        sources: Vec<Arc<dyn ServerSource>>,
        applier: ConfigApplier,
        source_timeout: Duration,
    ) -> Self {
        let owned = vec![None; sources.len()];
        Self {
            sources,
            applier,
            source_timeout,
            snapshot: Vec::new(),
            owned,
        }
    }

    /// Sources, applier and initial snapshot as configured
    pub async fn from_config(config: &ProxyConfig) -> Result<Self> {
        let sources = sources::from_config(config).await?;
        let reloader = Arc::new(CommandReloader::new(
            config.sync.reload.command.clone(),
            Duration::from_secs(config.sync.reload.timeout_seconds),
        ));
        let applier = ConfigApplier::new(&config.sync.certs_path, &config.sync.snippets_path, reloader);
        applier.ensure_dirs().await?;

        let mut reconciler = Self::new(sources, applier, config.sync.source_timeout());
        if config.sync.seed_from_disk {
            let applied = LocalSource::applied(
                reconciler.applier.snippets_path(),
                reconciler.applier.certs_path(),
            );
            reconciler.seed(&applied).await;
        }
        Ok(reconciler)
    }

    /// The last-applied snapshot
    pub fn snapshot(&self) -> &[Server] {
        &self.snapshot
    }

    /// Start from what `applied` reports, typically the engine's own directories
    pub async fn seed(&mut self, applied: &dyn ServerSource) {
        match tokio::time::timeout(self.source_timeout, applied.read()).await {
            Ok(Ok(servers)) => {
                info!(count = servers.len(), "Seeded snapshot from applied config");
                self.snapshot = servers;
            }
            Ok(Err(e)) => warn!("Could not seed snapshot, starting empty: {}", e),
            Err(_) => warn!("Seeding snapshot timed out, starting empty"),
        }
    }

    /// Desired state across all sources, or `None` if it cannot be trusted
    async fn fetch(&mut self) -> Option<Vec<Server>> {
        let timeout = self.source_timeout;
        let reads = self.sources.iter().map(|source| {
            let source = source.clone();
            async move { tokio::time::timeout(timeout, source.read()).await }
        });
        let results = join_all(reads).await;

        let mut desired = Vec::new();
        let mut seen = HashSet::new();

        for (index, result) in results.into_iter().enumerate() {
            let name = self.sources[index].name().to_string();
            let servers = match result {
                Ok(Ok(servers)) => {
                    self.owned[index] = Some(servers.iter().map(|s| s.domain.clone()).collect());
                    servers
                }
                failed => {
                    match failed {
                        Ok(Err(e)) => warn!(source = %name, "Source read failed: {}", e),
                        _ => warn!(source = %name, timeout = ?timeout, "Source read timed out"),
                    }

                    let Some(owned) = &self.owned[index] else {
                        warn!(source = %name, "Source has never been read, skipping pass");
                        return None;
                    };
                    self.snapshot
                        .iter()
                        .filter(|s| owned.contains(&s.domain))
                        .cloned()
                        .collect()
                }
            };

            for server in servers {
                if server.domain.is_empty() {
                    continue;
                }
                if seen.insert(server.domain.clone()) {
                    desired.push(server);
                } else {
                    warn!(source = %name, domain = %server.domain, "Domain claimed by an earlier source, ignoring");
                }
            }
        }

        Some(desired)
    }

    /// One fetch, diff and apply pass
    pub async fn run_pass(&mut self) -> PassSummary {
        let Some(desired) = self.fetch().await else {
            return PassSummary::skipped();
        };
        let desired = self.rendered(desired);

        let changed = select_changed_servers(&self.snapshot, &desired);
        let removed = select_removed_servers(&self.snapshot, &desired);

        let mut summary = PassSummary {
            skipped: false,
            changed: changed.iter().map(|s| s.domain.clone()).collect(),
            removed: removed.iter().map(|s| s.domain.clone()).collect(),
            report: ApplyReport::default(),
        };

        if summary.is_noop() {
            debug!(count = desired.len(), "Nothing to apply");
            self.snapshot = desired;
            return summary;
        }

        summary.report = self.applier.apply(&changed, &removed).await;
        self.advance_snapshot(desired, &summary.report);

        info!(
            changed = summary.changed.len(),
            removed = summary.removed.len(),
            failures = summary.report.failures.len(),
            reload_failed = summary.report.reload_error.is_some(),
            "Reconciliation pass finished"
        );
        summary
    }

    /// Snippets as the applier will write them. A snippet that fails to
    /// render is left as is; the applier reports it as a write failure.
    fn rendered(&self, servers: Vec<Server>) -> Vec<Server> {
        servers
            .into_iter()
            .map(|mut server| {
                match render_snippet(&server.snippets, self.applier.certs_path()) {
                    Ok(snippet) => server.snippets = snippet,
                    Err(e) => debug!(domain = %server.domain, "Snippet does not render: {}", e),
                }
                server
            })
            .collect()
    }

    fn advance_snapshot(&mut self, desired: Vec<Server>, report: &ApplyReport) {
        if report.reload_error.is_some() {
            warn!("Reload failed, keeping previous snapshot");
            return;
        }

        let failed = report.failed_domains();
        if failed.is_empty() {
            self.snapshot = desired;
            return;
        }

        let previous: HashMap<&str, &Server> =
            self.snapshot.iter().map(|s| (s.domain.as_str(), s)).collect();
        let desired_domains: HashSet<String> = desired.iter().map(|s| s.domain.clone()).collect();

        let mut next = Vec::with_capacity(desired.len());
        for server in desired {
            if failed.contains(server.domain.as_str()) {
                // Keep what is on disk so the diff picks the domain up again
                if let Some(prev) = previous.get(server.domain.as_str()) {
                    next.push((*prev).clone());
                }
            } else {
                next.push(server);
            }
        }
        for prev in &self.snapshot {
            if failed.contains(prev.domain.as_str()) && !desired_domains.contains(&prev.domain) {
                next.push(prev.clone());
            }
        }

        self.snapshot = next;
    }

    /// Interval drive mode. A pass in flight finishes before cancellation returns.
    pub async fn run_interval(&mut self, interval: Duration, cancel: CancellationToken) {
        info!(interval = ?interval, sources = self.sources.len(), "Starting interval reconciliation");
        loop {
            self.run_pass().await;
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = tokio::time::sleep(interval) => {}
            }
        }
        info!("Interval reconciliation stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::applier::tests::{tls_server, RecordingReloader};
    use crate::error::{ProxyError, Result};
    use async_trait::async_trait;
    use std::sync::Mutex;
    use tempfile::TempDir;

    /// Source whose answer the test controls
    struct ScriptedSource {
        name: &'static str,
        answer: Mutex<Option<Vec<Server>>>,
        delay: Duration,
    }

    impl ScriptedSource {
        fn new(name: &'static str, servers: Vec<Server>) -> Arc<Self> {
            Arc::new(Self {
                name,
                answer: Mutex::new(Some(servers)),
                delay: Duration::ZERO,
            })
        }

        fn set(&self, servers: Option<Vec<Server>>) {
            *self.answer.lock().unwrap() = servers;
        }
    }

    #[async_trait]
    impl ServerSource for ScriptedSource {
        fn name(&self) -> &str {
            self.name
        }

        async fn read(&self) -> Result<Vec<Server>> {
            if !self.delay.is_zero() {
                tokio::time::sleep(self.delay).await;
            }
            let answer = self.answer.lock().unwrap().clone();
            answer.ok_or_else(|| ProxyError::source_unavailable(self.name, "down"))
        }
    }

    fn reconciler(dir: &TempDir, sources: Vec<Arc<ScriptedSource>>) -> (Reconciler, Arc<RecordingReloader>) {
        let sources = sources
            .into_iter()
            .map(|s| s as Arc<dyn ServerSource>)
            .collect();
        let reloader = Arc::new(RecordingReloader::default());
        let applier = ConfigApplier::new(dir.path().join("certs"), dir.path().join("servers"), reloader.clone());
        std::fs::create_dir_all(dir.path().join("certs")).unwrap();
        std::fs::create_dir_all(dir.path().join("servers")).unwrap();
        (Reconciler::new(sources, applier, Duration::from_millis(200)), reloader)
    }

    fn domains(snapshot: &[Server]) -> Vec<&str> {
        snapshot.iter().map(|s| s.domain.as_str()).collect()
    }

    #[tokio::test]
    async fn test_failed_source_carries_forward_its_domains() {
        let dir = TempDir::new().unwrap();
        let kube = ScriptedSource::new("kube", vec![tls_server("a.com", "a")]);
        let local = ScriptedSource::new("local", vec![tls_server("b.com", "b")]);
        let (mut reconciler, reloader) = reconciler(&dir, vec![kube.clone(), local.clone()]);

        reconciler.run_pass().await;
        assert_eq!(domains(reconciler.snapshot()), vec!["a.com", "b.com"]);

        kube.set(None);
        local.set(Some(vec![tls_server("b.com", "b2")]));
        let summary = reconciler.run_pass().await;

        assert!(!summary.skipped);
        assert_eq!(summary.changed, vec!["b.com"]);
        assert!(summary.removed.is_empty());
        assert!(dir.path().join("servers/a.com").exists());
        assert_eq!(reloader.calls(), 2);
    }

    #[tokio::test]
    async fn test_source_never_read_skips_pass() {
        let dir = TempDir::new().unwrap();
        let down = ScriptedSource::new("kube", Vec::new());
        down.set(None);
        let (mut reconciler, reloader) = reconciler(&dir, vec![down]);

        let summary = reconciler.run_pass().await;
        assert!(summary.skipped);
        assert_eq!(reloader.calls(), 0);
    }

    #[tokio::test]
    async fn test_slow_source_times_out_without_blocking_others() {
        let dir = TempDir::new().unwrap();
        let fast = ScriptedSource::new("fast", vec![tls_server("a.com", "a")]);
        let slow = Arc::new(ScriptedSource {
            name: "slow",
            answer: Mutex::new(Some(vec![tls_server("b.com", "b")])),
            delay: Duration::from_secs(30),
        });
        let (mut reconciler, _) = reconciler(&dir, vec![fast, slow]);

        let started = std::time::Instant::now();
        let summary = reconciler.run_pass().await;

        assert!(summary.skipped);
        assert!(started.elapsed() < Duration::from_secs(5));
    }

    #[tokio::test]
    async fn test_first_source_wins_duplicate_domain() {
        let dir = TempDir::new().unwrap();
        let first = ScriptedSource::new("first", vec![tls_server("a.com", "from first")]);
        let second = ScriptedSource::new("second", vec![tls_server("a.com", "from second")]);
        let (mut reconciler, _) = reconciler(&dir, vec![first, second]);

        reconciler.run_pass().await;
        assert_eq!(reconciler.snapshot().len(), 1);
        assert_eq!(reconciler.snapshot()[0].snippets, "from first");
    }

    #[tokio::test]
    async fn test_failed_removal_stays_in_snapshot() {
        let dir = TempDir::new().unwrap();
        let source = ScriptedSource::new("local", vec![tls_server("a.com", "a")]);
        let (mut reconciler, _) = reconciler(&dir, vec![source.clone()]);
        reconciler.run_pass().await;

        // A non-empty directory in place of the snippet cannot be removed as a file
        std::fs::remove_file(dir.path().join("servers/a.com")).unwrap();
        std::fs::create_dir_all(dir.path().join("servers/a.com/x")).unwrap();
        source.set(Some(Vec::new()));

        let summary = reconciler.run_pass().await;
        assert_eq!(summary.removed, vec!["a.com"]);
        assert!(summary.report.failed_domains().contains("a.com"));
        assert_eq!(domains(reconciler.snapshot()), vec!["a.com"]);

        std::fs::remove_dir_all(dir.path().join("servers/a.com")).unwrap();
        let retry = reconciler.run_pass().await;
        assert_eq!(retry.removed, vec!["a.com"]);
        assert!(retry.report.is_clean());
        assert!(reconciler.snapshot().is_empty());
    }

    #[tokio::test]
    async fn test_seeded_snapshot_avoids_rewrite_on_restart() {
        let dir = TempDir::new().unwrap();
        for (snippets, certs) in [("servers", "certs"), ("desired", "desired-certs")] {
            std::fs::create_dir_all(dir.path().join(snippets)).unwrap();
            std::fs::create_dir_all(dir.path().join(certs)).unwrap();
            std::fs::write(dir.path().join(snippets).join("a.com"), "listen 443;").unwrap();
            std::fs::write(dir.path().join(certs).join("a.com.crt"), "CERT").unwrap();
            std::fs::write(dir.path().join(certs).join("a.com.key"), "KEY").unwrap();
        }

        let mut config = ProxyConfig::default();
        config.sync.certs_path = dir.path().join("certs");
        config.sync.snippets_path = dir.path().join("servers");
        config.sources.local = Some(crate::config::LocalSourceConfig {
            snippets_path: dir.path().join("desired"),
            certs_path: dir.path().join("desired-certs"),
        });

        let mut reconciler = Reconciler::from_config(&config).await.unwrap();
        assert_eq!(domains(reconciler.snapshot()), vec!["a.com"]);

        let summary = reconciler.run_pass().await;
        assert!(!summary.skipped);
        assert!(summary.is_noop());
        assert!(!summary.report.reloaded);
    }

    fn engine_config(dir: &TempDir) -> ProxyConfig {
        let mut config = ProxyConfig::default();
        config.sync.certs_path = dir.path().join("certs");
        config.sync.snippets_path = dir.path().join("servers");
        config.sync.reload.command = vec!["true".to_string()];
        config
    }

    #[tokio::test]
    async fn test_snippet_only_domain_is_removed_after_restart() {
        let dir = TempDir::new().unwrap();
        let challenges = dir.path().join("artifacts/challenges");
        std::fs::create_dir_all(&challenges).unwrap();
        std::fs::write(challenges.join("b.com.path"), "/.well-known/acme-challenge/tok").unwrap();
        std::fs::write(challenges.join("b.com.content"), "tok.thumbprint").unwrap();

        let mut config = engine_config(&dir);
        config.sources.artifacts = Some(crate::config::ArtifactsSourceConfig {
            path: dir.path().join("artifacts"),
            backend: "backend.example.com:443".to_string(),
        });

        let mut first = Reconciler::from_config(&config).await.unwrap();
        let summary = first.run_pass().await;
        assert_eq!(summary.changed, vec!["b.com"]);
        assert!(dir.path().join("servers/b.com").is_file());
        drop(first);

        std::fs::remove_file(challenges.join("b.com.path")).unwrap();
        std::fs::remove_file(challenges.join("b.com.content")).unwrap();

        let mut restarted = Reconciler::from_config(&config).await.unwrap();
        assert_eq!(domains(restarted.snapshot()), vec!["b.com"]);

        let summary = restarted.run_pass().await;
        assert_eq!(summary.removed, vec!["b.com"]);
        assert!(!dir.path().join("servers/b.com").exists());
    }

    #[tokio::test]
    async fn test_templated_snippet_is_not_rewritten_after_restart() {
        let dir = TempDir::new().unwrap();
        let desired = dir.path().join("desired");
        let desired_certs = dir.path().join("desired-certs");
        std::fs::create_dir_all(&desired).unwrap();
        std::fs::create_dir_all(&desired_certs).unwrap();
        std::fs::write(
            desired.join("a.com"),
            "ssl_certificate {{ .CertsPath }}/a.com.crt;\nssl_certificate_key {{ .CertsPath }}/a.com.key;",
        )
        .unwrap();
        std::fs::write(desired_certs.join("a.com.crt"), "CERT").unwrap();
        std::fs::write(desired_certs.join("a.com.key"), "KEY").unwrap();

        let mut config = engine_config(&dir);
        config.sources.local = Some(crate::config::LocalSourceConfig {
            snippets_path: desired,
            certs_path: desired_certs,
        });

        let mut first = Reconciler::from_config(&config).await.unwrap();
        assert_eq!(first.run_pass().await.changed, vec!["a.com"]);
        let written = std::fs::read_to_string(dir.path().join("servers/a.com")).unwrap();
        assert!(written.contains(&format!("{}/a.com.crt", dir.path().join("certs").display())));
        drop(first);

        let mut restarted = Reconciler::from_config(&config).await.unwrap();
        let summary = restarted.run_pass().await;
        assert!(!summary.skipped);
        assert!(summary.is_noop());
        assert!(!summary.report.reloaded);
    }

    #[tokio::test]
    async fn test_interval_mode_stops_on_cancel() {
        let dir = TempDir::new().unwrap();
        let source = ScriptedSource::new("local", vec![tls_server("a.com", "a")]);
        let (mut reconciler, reloader) = reconciler(&dir, vec![source]);

        let cancel = CancellationToken::new();
        cancel.cancel();
        reconciler.run_interval(Duration::from_secs(3600), cancel).await;

        assert_eq!(reloader.calls(), 1);
        assert_eq!(domains(reconciler.snapshot()), vec!["a.com"]);
    }
}
