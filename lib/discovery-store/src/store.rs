//! Store trait and the shared connection handle

use crate::Result;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::ops::Deref;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::debug;

/// A raw key/value entry as returned by the store
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct KvEntry {
    /// Full key, including the listed prefix
    pub key: String,
    pub value: Vec<u8>,
}

impl KvEntry {
    pub fn new(key: impl Into<String>, value: impl Into<Vec<u8>>) -> Self {
        Self {
            key: key.into(),
            value: value.into(),
        }
    }
}

/// One delivery from a subtree watch.
///
/// `None` means the store reported that nothing exists under the watched
/// prefix, which is different from "nothing changed".
pub type WatchBatch = Option<Vec<KvEntry>>;

/// Stream of batches produced by `KvStore::watch_tree`. The stream ends when the
/// sender is dropped, either because the store expired the watch or because the
/// stop token was cancelled.
pub type WatchStream = mpsc::Receiver<WatchBatch>;

/// Connection options shared by every backend
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    /// Timeout for establishing a connection and for non-blocking requests
    pub connection_timeout: Duration,
    /// Maximum time a blocking watch request may be held open by the store
    pub watch_wait: Duration,
    /// Access token sent with every request, if any
    pub token: Option<String>,
    /// Buffered batches per watch stream
    pub watch_buffer: usize,
    /// Pause after a watch read that made no progress, and the first delay
    /// after a failed one. Consecutive failures double it up to 30s.
    pub watch_retry_delay: Duration,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            connection_timeout: Duration::from_secs(10),
            watch_wait: Duration::from_secs(300),
            token: None,
            watch_buffer: 16,
            watch_retry_delay: Duration::from_secs(1),
        }
    }
}

/// Coordination store operations the discovery watcher depends on
#[async_trait::async_trait]
pub trait KvStore: Send + Sync {
    /// Backend name used in logs
    fn name(&self) -> &'static str {
        "UnnamedStore"
    }

    /// List every entry whose key starts with `prefix`.
    ///
    /// Returns `StoreError::KeyNotFound` when the prefix does not exist. The
    /// match is a plain string prefix, so sibling keys sharing the prefix may be
    /// returned as well.
    async fn list(&self, prefix: &str) -> Result<Vec<KvEntry>>;

    /// Watch the subtree under `prefix`. Every batch carries the full current
    /// content of the subtree. Cancelling `stop` ends the stream.
    async fn watch_tree(&self, prefix: &str, stop: CancellationToken) -> Result<WatchStream>;

    /// Release the connection. Later calls fail with `StoreError::Closed`.
    fn close(&self);
}

/// Shared store connection.
///
/// Several watchers may run over one connection (a watcher and its clones).
/// Each running watcher holds a `StoreLease`; the connection is closed when
/// the last lease is dropped.
#[derive(Clone)]
pub struct StoreHandle {
    store: Arc<dyn KvStore>,
    leases: Arc<AtomicUsize>,
}

impl StoreHandle {
    pub fn new<S: KvStore + 'static>(store: S) -> Self {
        Self::from_arc(Arc::new(store))
    }

    pub fn from_arc(store: Arc<dyn KvStore>) -> Self {
        Self {
            store,
            leases: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// Take a lease on the connection
    pub fn lease(&self) -> StoreLease {
        self.leases.fetch_add(1, Ordering::SeqCst);
        StoreLease {
            store: self.store.clone(),
            leases: self.leases.clone(),
        }
    }

    /// Number of outstanding leases
    pub fn lease_count(&self) -> usize {
        self.leases.load(Ordering::SeqCst)
    }

    pub fn store(&self) -> &Arc<dyn KvStore> {
        &self.store
    }
}

impl fmt::Debug for StoreHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StoreHandle")
            .field("backend", &self.store.name())
            .field("leases", &self.lease_count())
            .finish()
    }
}

/// A counted reference to a store connection, see `StoreHandle`
pub struct StoreLease {
    store: Arc<dyn KvStore>,
    leases: Arc<AtomicUsize>,
}

impl Deref for StoreLease {
    type Target = dyn KvStore;

    fn deref(&self) -> &Self::Target {
        self.store.as_ref()
    }
}

impl Drop for StoreLease {
    fn drop(&mut self) {
        if self.leases.fetch_sub(1, Ordering::SeqCst) == 1 {
            debug!("Last lease released, closing {} store", self.store.name());
            self.store.close();
        }
    }
}
