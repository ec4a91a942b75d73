//! Coordination store abstraction for service discovery
//!
//! This library provides:
//! - The `KvStore` trait every backend implements (list, watch a subtree, close)
//! - A shared connection handle that closes the connection exactly once
//! - A process-wide driver registry keyed by backend name
//! - A Consul KV backend and an in-memory backend

pub mod consul;
pub mod error;
pub mod memory;
pub mod registry;
pub mod store;

pub use error::{Result, StoreError};
pub use memory::MemoryStore;
pub use registry::{new_store, register, Backend, StoreConstructor};
pub use store::{KvEntry, KvStore, StoreConfig, StoreHandle, StoreLease, WatchBatch, WatchStream};
