//! Background loop keeping the cache in sync with the store

use crate::config::Backoff;
use crate::discovery::Shared;
use crate::endpoint::{empty_set, parse_entries};
use crate::{DiscoveryError, Result};
use discovery_store::{KvStore, StoreLease, WatchBatch, WatchStream};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// The watch loop of one watcher. Owns a lease on the store connection, so
/// the connection is released when the loop ends, including by unwinding.
pub(crate) struct WatchLoop {
    shared: Arc<Shared>,
    store: StoreLease,
    stop: CancellationToken,
}

impl WatchLoop {
    pub(crate) fn new(shared: Arc<Shared>, store: StoreLease, stop: CancellationToken) -> Self {
        Self {
            shared,
            store,
            stop,
        }
    }

    pub(crate) async fn run(self) -> Result<()> {
        let result = self.watch().await;

        // Also ends pending deliveries when the loop gave up on its own
        self.stop.cancel();
        self.shared.subscribers.close().await;
        match &result {
            Ok(()) => info!("Discovery for {} has been closed", self.shared.base_path),
            Err(e) => error!("Discovery for {} stopped: {}", self.shared.base_path, e),
        }
        result
    }

    async fn watch(&self) -> Result<()> {
        loop {
            let Some(mut stream) = self.establish().await? else {
                return Ok(());
            };

            loop {
                tokio::select! {
                    biased;
                    _ = self.stop.cancelled() => return Ok(()),
                    batch = stream.recv() => match batch {
                        Some(batch) => self.apply(batch).await,
                        None => break,
                    }
                }
            }

            warn!(
                "Watch stream of {} is closed and will rewatch",
                self.shared.base_path
            );
            if let Some(metrics) = &self.shared.metrics {
                metrics.record_rewatch(&self.shared.base_path);
            }
        }
    }

    /// Open a subtree watch, retrying with backoff. Returns `None` when the
    /// watcher was closed meanwhile.
    async fn establish(&self) -> Result<Option<WatchStream>> {
        let path = &self.shared.base_path;
        let mut backoff = Backoff::new(&self.shared.config);

        loop {
            if self.stop.is_cancelled() {
                return Ok(None);
            }

            let attempt = tokio::select! {
                _ = self.stop.cancelled() => return Ok(None),
                attempt = self.store.watch_tree(path, self.stop.clone()) => attempt,
            };

            let err = match attempt {
                Ok(stream) => {
                    debug!("Watching {} on {} store", path, self.store.name());
                    return Ok(Some(stream));
                }
                Err(e) => e,
            };

            if let Some(metrics) = &self.shared.metrics {
                metrics.record_watch_failure(path);
            }

            let Some(delay) = backoff.on_failure() else {
                error!("Can't watch {}: {}", path, err);
                return Err(DiscoveryError::WatchAbandoned {
                    path: path.clone(),
                    source: err,
                });
            };

            warn!(
                "Can not watch tree (retries left {}, sleep {:?}): {}: {}",
                backoff.retries_left(),
                delay,
                path,
                err
            );
            tokio::select! {
                _ = self.stop.cancelled() => return Ok(None),
                _ = tokio::time::sleep(delay) => {}
            }
        }
    }

    /// Replace the cache with the content of `batch` and fan it out
    async fn apply(&self, batch: WatchBatch) {
        let shared = &self.shared;

        let services = match batch {
            None => empty_set(),
            Some(entries) => {
                let filter = shared.filter.read().await.clone();
                parse_entries(&shared.prefix, entries, filter.as_ref())
            }
        };

        *shared.services.write().await = services.clone();
        debug!("{} now has {} services", shared.base_path, services.len());
        if let Some(metrics) = &shared.metrics {
            metrics.record_update(&shared.base_path, services.len());
        }

        shared.subscribers.broadcast(services, &self.stop).await;
    }
}

/// Initial listing of the base path
pub(crate) async fn load_snapshot(
    store: &dyn KvStore,
    shared: &Shared,
) -> Result<crate::ServiceSet> {
    let entries = match store.list(&shared.base_path).await {
        Ok(entries) => entries,
        Err(e) if e.is_not_found() => Vec::new(),
        Err(e) => {
            warn!(
                "Cannot get services of {} from registry: {}",
                shared.base_path, e
            );
            return Err(e.into());
        }
    };

    let filter = shared.filter.read().await.clone();
    Ok(parse_entries(&shared.prefix, entries, filter.as_ref()))
}
