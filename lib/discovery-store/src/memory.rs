//! In-process store backend

use crate::registry::{self, Backend};
use crate::store::{KvEntry, KvStore, StoreConfig, StoreHandle, WatchBatch, WatchStream};
use crate::{Result, StoreError};
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use tokio::sync::{mpsc, watch};
use tokio_util::sync::CancellationToken;
use tracing::debug;

/// Register the memory backend with the driver registry
pub fn register() {
    registry::register(Backend::Memory, new_memory_store);
}

fn new_memory_store(_addrs: &[String], config: &StoreConfig) -> Result<StoreHandle> {
    Ok(StoreHandle::new(MemoryStore::with_watch_buffer(config.watch_buffer)))
}

/// Key/value store held in memory.
///
/// Watches emit the current subtree right away and again after every mutation
/// that changes it. Cloning yields another handle to the same data.
#[derive(Clone)]
pub struct MemoryStore {
    inner: Arc<Inner>,
}

struct Inner {
    entries: RwLock<BTreeMap<String, Vec<u8>>>,
    version: watch::Sender<u64>,
    // Cancelled by `expire_watches`, then replaced
    expiry: Mutex<CancellationToken>,
    closed: CancellationToken,
    close_count: AtomicUsize,
    watch_buffer: usize,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::with_watch_buffer(StoreConfig::default().watch_buffer)
    }

    pub fn with_watch_buffer(watch_buffer: usize) -> Self {
        let (version, _) = watch::channel(0);
        Self {
            inner: Arc::new(Inner {
                entries: RwLock::new(BTreeMap::new()),
                version,
                expiry: Mutex::new(CancellationToken::new()),
                closed: CancellationToken::new(),
                close_count: AtomicUsize::new(0),
                watch_buffer: watch_buffer.max(1),
            }),
        }
    }

    /// Insert or update a key
    pub fn put(&self, key: impl Into<String>, value: impl Into<Vec<u8>>) {
        let key = key.into();
        if let Ok(mut entries) = self.inner.entries.write() {
            entries.insert(key, value.into());
        }
        self.bump();
    }

    /// Remove a key, returning whether it existed
    pub fn delete(&self, key: &str) -> bool {
        let removed = self
            .inner
            .entries
            .write()
            .map(|mut entries| entries.remove(key).is_some())
            .unwrap_or(false);
        if removed {
            self.bump();
        }
        removed
    }

    /// Remove every key starting with `prefix`
    pub fn delete_tree(&self, prefix: &str) {
        if let Ok(mut entries) = self.inner.entries.write() {
            entries.retain(|k, _| !k.starts_with(prefix));
        }
        self.bump();
    }

    /// End every open watch stream, as a store does when a watch expires
    /// server side. New watches are not affected.
    pub fn expire_watches(&self) {
        if let Ok(mut expiry) = self.inner.expiry.lock() {
            expiry.cancel();
            *expiry = CancellationToken::new();
        }
    }

    /// How many times `close` has been called
    pub fn close_count(&self) -> usize {
        self.inner.close_count.load(Ordering::SeqCst)
    }

    pub fn is_closed(&self) -> bool {
        self.inner.closed.is_cancelled()
    }

    fn bump(&self) {
        self.inner.version.send_modify(|v| *v += 1);
    }

    fn subtree(&self, prefix: &str) -> Vec<KvEntry> {
        self.inner
            .entries
            .read()
            .map(|entries| {
                entries
                    .range(prefix.to_string()..)
                    .take_while(|(k, _)| k.starts_with(prefix))
                    .map(|(k, v)| KvEntry::new(k.clone(), v.clone()))
                    .collect()
            })
            .unwrap_or_default()
    }

    fn ensure_open(&self) -> Result<()> {
        if self.is_closed() {
            Err(StoreError::Closed)
        } else {
            Ok(())
        }
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait::async_trait]
impl KvStore for MemoryStore {
    fn name(&self) -> &'static str {
        "memory"
    }

    async fn list(&self, prefix: &str) -> Result<Vec<KvEntry>> {
        self.ensure_open()?;
        let entries = self.subtree(prefix);
        if entries.is_empty() {
            return Err(StoreError::KeyNotFound(prefix.to_string()));
        }
        Ok(entries)
    }

    async fn watch_tree(&self, prefix: &str, stop: CancellationToken) -> Result<WatchStream> {
        self.ensure_open()?;

        let (tx, rx) = mpsc::channel(self.inner.watch_buffer);
        let mut version = self.inner.version.subscribe();
        let expiry = self
            .inner
            .expiry
            .lock()
            .map(|token| token.clone())
            .map_err(|e| StoreError::Internal(e.to_string()))?;
        let closed = self.inner.closed.clone();
        let store = self.clone();
        let prefix = prefix.to_string();

        tokio::spawn(async move {
            let mut last: Option<WatchBatch> = None;
            loop {
                let entries = store.subtree(&prefix);
                let batch = if entries.is_empty() { None } else { Some(entries) };

                if last.as_ref() != Some(&batch) {
                    tokio::select! {
                        _ = stop.cancelled() => break,
                        _ = closed.cancelled() => break,
                        _ = expiry.cancelled() => break,
                        sent = tx.send(batch.clone()) => {
                            if sent.is_err() {
                                break;
                            }
                        }
                    }
                    last = Some(batch);
                }

                tokio::select! {
                    _ = stop.cancelled() => break,
                    _ = closed.cancelled() => break,
                    _ = expiry.cancelled() => break,
                    _ = tx.closed() => break,
                    changed = version.changed() => {
                        if changed.is_err() {
                            break;
                        }
                    }
                }
            }
            debug!("Memory watch on {} ended", prefix);
        });

        Ok(rx)
    }

    fn close(&self) {
        self.inner.close_count.fetch_add(1, Ordering::SeqCst);
        self.inner.closed.cancel();
    }
}
