//! Event drive mode: filesystem notifications collapsed by a debounce window.
//!
//! Every event pushes a single deadline forward; a pass runs once the window
//! passes with no further events. A pass in flight is never interrupted, and
//! events arriving meanwhile start the next window.

use notify::{Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use std::path::PathBuf;
use std::time::Duration;
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::error::{ProxyError, Result};
use crate::reconcile::Reconciler;

/// Collapses bursts of change signals into one trigger
pub struct Debouncer {
    rx: UnboundedReceiver<()>,
    window: Duration,
}

impl Debouncer {
    pub fn new(rx: UnboundedReceiver<()>, window: Duration) -> Self {
        Self { rx, window }
    }

    /// A debouncer and the sender that feeds it
    pub fn channel(window: Duration) -> (UnboundedSender<()>, Self) {
        let (tx, rx) = mpsc::unbounded_channel();
        (tx, Self::new(rx, window))
    }

    /// Wait for a burst of events followed by a quiet window.
    ///
    /// Returns `false` when cancelled or when the senders are gone.
    pub async fn next_burst(&mut self, cancel: &CancellationToken) -> bool {
        tokio::select! {
            _ = cancel.cancelled() => return false,
            event = self.rx.recv() => {
                if event.is_none() {
                    return false;
                }
            }
        }

        let deadline = tokio::time::sleep(self.window);
        tokio::pin!(deadline);
        let mut collapsed = 1usize;

        loop {
            tokio::select! {
                _ = cancel.cancelled() => return false,
                _ = &mut deadline => {
                    debug!(events = collapsed, "Debounce window elapsed");
                    return true;
                }
                event = self.rx.recv() => match event {
                    Some(()) => {
                        collapsed += 1;
                        deadline.as_mut().reset(Instant::now() + self.window);
                    }
                    // No more events can arrive; the burst is over
                    None => return true,
                },
            }
        }
    }
}

/// Watches directory trees and signals on create, modify and remove events
pub struct FsWatcher {
    _watcher: RecommendedWatcher,
}

impl FsWatcher {
    pub fn watch(paths: &[PathBuf], tx: UnboundedSender<()>) -> Result<Self> {
        let mut watcher = notify::recommended_watcher(move |result: notify::Result<Event>| match result {
            Ok(event) if is_change(&event.kind) => {
                let _ = tx.send(());
            }
            Ok(_) => {}
            Err(e) => warn!("Watch error: {}", e),
        })
        .map_err(|e| ProxyError::Config(format!("Failed to create watcher: {}", e)))?;

        for path in paths {
            watcher
                .watch(path, RecursiveMode::Recursive)
                .map_err(|e| ProxyError::Config(format!("Failed to watch {}: {}", path.display(), e)))?;
            info!(path = ?path, "Watching for changes");
        }

        Ok(Self { _watcher: watcher })
    }
}

fn is_change(kind: &EventKind) -> bool {
    matches!(kind, EventKind::Create(_) | EventKind::Modify(_) | EventKind::Remove(_))
}

/// One unconditional pass, then one pass per debounced burst
pub async fn run_watch(reconciler: &mut Reconciler, mut debouncer: Debouncer, cancel: CancellationToken) {
    info!("Running initial reconciliation pass");
    reconciler.run_pass().await;

    while debouncer.next_burst(&cancel).await {
        reconciler.run_pass().await;
    }
    info!("Watch reconciliation stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::applier::tests::RecordingReloader;
    use crate::applier::ConfigApplier;
    use crate::error::Result as ProxyResult;
    use crate::model::Server;
    use crate::sources::ServerSource;
    use async_trait::async_trait;
    use notify::event::{AccessKind, CreateKind};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    #[derive(Default)]
    struct CountingSource {
        reads: AtomicUsize,
    }

    #[async_trait]
    impl ServerSource for CountingSource {
        fn name(&self) -> &str {
            "counting"
        }

        async fn read(&self) -> ProxyResult<Vec<Server>> {
            self.reads.fetch_add(1, Ordering::SeqCst);
            Ok(Vec::new())
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_rapid_events_collapse_into_one_burst() {
        let (tx, mut debouncer) = Debouncer::channel(Duration::from_secs(2));
        let cancel = CancellationToken::new();

        let sender = tokio::spawn(async move {
            for _ in 0..3 {
                tx.send(()).unwrap();
                tokio::time::sleep(Duration::from_millis(500)).await;
            }
            // Keep the channel open past the window
            tokio::time::sleep(Duration::from_secs(10)).await;
            drop(tx);
        });

        let started = Instant::now();
        assert!(debouncer.next_burst(&cancel).await);
        // Last event at 1s, window of 2s
        let elapsed = started.elapsed();
        assert!(elapsed >= Duration::from_secs(3), "{:?}", elapsed);
        assert!(elapsed < Duration::from_millis(3100), "{:?}", elapsed);

        // No further events: the next wait ends when the sender closes
        assert!(!debouncer.next_burst(&cancel).await);
        sender.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_stops_waiting() {
        let (_tx, mut debouncer) = Debouncer::channel(Duration::from_secs(2));
        let cancel = CancellationToken::new();
        cancel.cancel();
        assert!(!debouncer.next_burst(&cancel).await);
    }

    #[tokio::test(start_paused = true)]
    async fn test_three_events_trigger_exactly_one_pass() {
        let source = Arc::new(CountingSource::default());
        let reloader = Arc::new(RecordingReloader::default());
        let applier = ConfigApplier::new("/nonexistent/certs", "/nonexistent/servers", reloader);
        let mut reconciler = Reconciler::new(vec![source.clone() as Arc<dyn ServerSource>], applier, Duration::from_secs(5));

        let (tx, debouncer) = Debouncer::channel(Duration::from_secs(2));
        let cancel = CancellationToken::new();

        let driver = {
            let cancel = cancel.clone();
            tokio::spawn(async move {
                for _ in 0..3 {
                    tx.send(()).unwrap();
                    tokio::time::sleep(Duration::from_millis(100)).await;
                }
                tokio::time::sleep(Duration::from_secs(5)).await;
                cancel.cancel();
                drop(tx);
            })
        };

        run_watch(&mut reconciler, debouncer, cancel).await;
        driver.await.unwrap();

        // Startup pass plus one debounced pass
        assert_eq!(source.reads.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_only_changes_count() {
        assert!(is_change(&EventKind::Create(CreateKind::File)));
        assert!(is_change(&EventKind::Remove(notify::event::RemoveKind::Any)));
        assert!(!is_change(&EventKind::Access(AccessKind::Any)));
    }

    #[tokio::test]
    async fn test_fs_watcher_signals_on_write() {
        let dir = tempfile::TempDir::new().unwrap();
        let (tx, mut rx) = mpsc::unbounded_channel();
        let _watcher = FsWatcher::watch(&[dir.path().to_path_buf()], tx).unwrap();

        std::fs::write(dir.path().join("a.com"), "listen 80;").unwrap();

        let signalled = tokio::time::timeout(Duration::from_secs(5), rx.recv()).await;
        assert!(matches!(signalled, Ok(Some(()))));
    }
}
