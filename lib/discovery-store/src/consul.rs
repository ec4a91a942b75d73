//! Consul KV backend over the HTTP API

use crate::registry::{self, Backend};
use crate::store::{KvEntry, KvStore, StoreConfig, StoreHandle, WatchBatch, WatchStream};
use crate::{Result, StoreError};
use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use reqwest::header::HeaderMap;
use reqwest::{Client, StatusCode};
use serde::Deserialize;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

const INDEX_HEADER: &str = "X-Consul-Index";
const TOKEN_HEADER: &str = "X-Consul-Token";
const MAX_RETRY_DELAY: Duration = Duration::from_secs(30);

/// Register the Consul backend with the driver registry
pub fn register() {
    registry::register(Backend::Consul, new_consul_store);
}

fn new_consul_store(addrs: &[String], config: &StoreConfig) -> Result<StoreHandle> {
    Ok(StoreHandle::new(ConsulStore::new(addrs, config)?))
}

/// One entry of a `GET /v1/kv/<prefix>?recurse` response
#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct ConsulKvPair {
    key: String,
    value: Option<String>,
}

/// Result of one read of a subtree
#[derive(Debug)]
struct TreeRead {
    index: u64,
    batch: WatchBatch,
}

/// HTTP client for the Consul KV endpoints
struct ConsulClient {
    http: Client,
    base_url: String,
    config: StoreConfig,
}

impl ConsulClient {
    fn new(addr: &str, config: &StoreConfig) -> Result<Self> {
        let http = Client::builder()
            .connect_timeout(config.connection_timeout)
            .build()?;

        Ok(Self {
            http,
            base_url: base_url(addr),
            config: config.clone(),
        })
    }

    fn kv_url(&self, prefix: &str) -> String {
        format!("{}/v1/kv/{}", self.base_url, prefix.trim_start_matches('/'))
    }

    /// Read the subtree. With `index` set this is a blocking query that returns
    /// once the subtree changes past `index` or the wait time elapses.
    async fn read_tree(&self, prefix: &str, index: Option<u64>) -> Result<TreeRead> {
        let mut request = self
            .http
            .get(self.kv_url(prefix))
            .query(&[("recurse", "true")]);

        request = match index {
            Some(index) => {
                let wait = self.config.watch_wait;
                request
                    .query(&[
                        ("index", index.to_string()),
                        ("wait", format!("{}s", wait.as_secs().max(1))),
                    ])
                    .timeout(blocking_timeout(wait))
            }
            None => request.timeout(self.config.connection_timeout),
        };

        if let Some(token) = &self.config.token {
            request = request.header(TOKEN_HEADER, token);
        }

        let response = request.send().await?;
        let status = response.status();
        let index = consul_index(response.headers());

        match status {
            StatusCode::NOT_FOUND => Ok(TreeRead { index, batch: None }),
            s if s.is_success() => {
                let body = response.text().await?;
                let entries = decode_entries(&body)?;
                let batch = if entries.is_empty() { None } else { Some(entries) };
                Ok(TreeRead { index, batch })
            }
            s => {
                let message = response.text().await.unwrap_or_default();
                Err(StoreError::UnexpectedResponse {
                    status: s.as_u16(),
                    message,
                })
            }
        }
    }
}

/// Store backed by a Consul agent
pub struct ConsulStore {
    client: Arc<ConsulClient>,
    closed: CancellationToken,
    // Blocking reads failed in a row, across watches
    read_failures: Arc<AtomicU32>,
}

impl ConsulStore {
    /// Create a store talking to the first address in `addrs`
    pub fn new(addrs: &[String], config: &StoreConfig) -> Result<Self> {
        let addr = addrs
            .iter()
            .map(|a| a.trim())
            .find(|a| !a.is_empty())
            .ok_or(StoreError::NoAddress)?;

        let client = ConsulClient::new(addr, config)?;
        debug!("Consul store using {}", client.base_url);

        Ok(Self {
            client: Arc::new(client),
            closed: CancellationToken::new(),
            read_failures: Arc::new(AtomicU32::new(0)),
        })
    }

    /// Base URL of the agent in use
    pub fn base_url(&self) -> &str {
        &self.client.base_url
    }

    fn ensure_open(&self) -> Result<()> {
        if self.closed.is_cancelled() {
            Err(StoreError::Closed)
        } else {
            Ok(())
        }
    }
}

#[async_trait::async_trait]
impl KvStore for ConsulStore {
    fn name(&self) -> &'static str {
        "consul"
    }

    async fn list(&self, prefix: &str) -> Result<Vec<KvEntry>> {
        self.ensure_open()?;
        match self.client.read_tree(prefix, None).await?.batch {
            Some(entries) => Ok(entries),
            None => Err(StoreError::KeyNotFound(prefix.to_string())),
        }
    }

    async fn watch_tree(&self, prefix: &str, stop: CancellationToken) -> Result<WatchStream> {
        self.ensure_open()?;

        // The first read happens here so connection errors reach the caller
        let initial = self.client.read_tree(prefix, None).await?;

        let (tx, rx) = mpsc::channel(self.client.config.watch_buffer.max(1));
        let client = self.client.clone();
        let closed = self.closed.clone();
        let failures = self.read_failures.clone();
        let prefix = prefix.to_string();

        tokio::spawn(async move {
            let retry_delay = client.config.watch_retry_delay;
            let mut index = initial.index.max(1);
            let mut pending = Some(initial.batch);

            loop {
                if let Some(batch) = pending.take() {
                    tokio::select! {
                        _ = stop.cancelled() => break,
                        _ = closed.cancelled() => break,
                        sent = tx.send(batch) => {
                            if sent.is_err() {
                                break;
                            }
                        }
                    }
                }

                let read = tokio::select! {
                    _ = stop.cancelled() => break,
                    _ = closed.cancelled() => break,
                    _ = tx.closed() => break,
                    read = client.read_tree(&prefix, Some(index)) => read,
                };

                let (pause, failed) = match read {
                    Ok(read) => {
                        failures.store(0, Ordering::Relaxed);
                        let current = read.index.max(1);
                        if current == index {
                            // Wait time elapsed, or the agent sent no index at all
                            (Some(retry_delay), false)
                        } else {
                            index = next_index(index, current);
                            pending = Some(read.batch);
                            (None, false)
                        }
                    }
                    Err(e) => {
                        let failed = failures.fetch_add(1, Ordering::Relaxed) + 1;
                        let delay = failure_delay(retry_delay, failed);
                        warn!(
                            "Consul watch on {} failed, ending in {:?}: {}",
                            prefix, delay, e
                        );
                        (Some(delay), true)
                    }
                };

                if let Some(pause) = pause {
                    tokio::select! {
                        _ = stop.cancelled() => break,
                        _ = closed.cancelled() => break,
                        _ = tx.closed() => break,
                        _ = tokio::time::sleep(pause) => {}
                    }
                }
                if failed {
                    break;
                }
            }
            debug!("Consul watch on {} ended", prefix);
        });

        Ok(rx)
    }

    fn close(&self) {
        self.closed.cancel();
    }
}

fn base_url(addr: &str) -> String {
    let addr = addr.trim().trim_end_matches('/');
    if addr.starts_with("http://") || addr.starts_with("https://") {
        addr.to_string()
    } else {
        format!("http://{}", addr)
    }
}

/// Client side timeout for a blocking query. Consul adds up to wait/16 of
/// jitter to the requested wait.
fn blocking_timeout(wait: Duration) -> Duration {
    wait + wait / 16 + Duration::from_secs(5)
}

fn consul_index(headers: &HeaderMap) -> u64 {
    headers
        .get(INDEX_HEADER)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.parse().ok())
        .unwrap_or(0)
}

/// Index to use for the next blocking query. Consul requires a reset when
/// the index goes backwards, and an index of 0 never blocks.
fn next_index(previous: u64, current: u64) -> u64 {
    if current < previous {
        1
    } else {
        current.max(1)
    }
}

/// Delay before giving up a watch after `failures` failed reads in a row
fn failure_delay(base: Duration, failures: u32) -> Duration {
    let factor = 1u32 << failures.saturating_sub(1).min(16);
    base.saturating_mul(factor).min(MAX_RETRY_DELAY)
}

fn decode_entries(body: &str) -> Result<Vec<KvEntry>> {
    let pairs: Vec<ConsulKvPair> = serde_json::from_str(body)?;

    pairs
        .into_iter()
        .map(|pair| {
            let value = match pair.value {
                Some(encoded) => {
                    STANDARD
                        .decode(encoded.as_bytes())
                        .map_err(|e| StoreError::MalformedValue {
                            key: pair.key.clone(),
                            reason: e.to_string(),
                        })?
                }
                None => Vec::new(),
            };
            Ok(KvEntry::new(pair.key, value))
        })
        .collect()
}
