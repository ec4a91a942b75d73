//! Service discovery over a hierarchical key/value store
//!
//! This library provides:
//! - `KvDiscovery`, a watcher keeping a local cache of the endpoints stored
//!   under one base path and pushing every change to its subscribers
//! - The `ServiceDiscovery` trait consumed by RPC client routing layers
//! - Prometheus metrics for the watch loop and subscriber delivery

pub mod config;
pub mod discovery;
pub mod endpoint;
pub mod error;
pub mod fanout;
pub mod metrics;
mod watch;

pub use config::DiscoveryConfig;
pub use discovery::{DiscoveryBuilder, KvDiscovery, ServiceDiscovery};
pub use endpoint::{normalize_base_path, KvPair, ServiceFilter, ServiceSet};
pub use error::{DiscoveryError, Result};
pub use fanout::{SubscriberId, Subscription};
pub use metrics::DiscoveryMetrics;
