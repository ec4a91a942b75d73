//! Process-wide registry of store backends

use crate::store::{StoreConfig, StoreHandle};
use crate::{Result, StoreError};
use once_cell::sync::Lazy;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;
use std::sync::RwLock;
use tracing::debug;

/// Known store backends
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Backend {
    Consul,
    Memory,
}

impl Backend {
    pub fn as_str(&self) -> &'static str {
        match self {
            Backend::Consul => "consul",
            Backend::Memory => "memory",
        }
    }
}

impl fmt::Display for Backend {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Backend {
    type Err = StoreError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "consul" => Ok(Backend::Consul),
            "memory" => Ok(Backend::Memory),
            other => Err(StoreError::UnsupportedBackend(other.to_string())),
        }
    }
}

/// Builds a store connection from a list of addresses
pub type StoreConstructor = fn(&[String], &StoreConfig) -> Result<StoreHandle>;

static DRIVERS: Lazy<RwLock<HashMap<Backend, StoreConstructor>>> =
    Lazy::new(|| RwLock::new(HashMap::new()));

/// Register a backend constructor. Registering the same backend again
/// replaces the previous constructor, so repeated calls are harmless.
pub fn register(backend: Backend, constructor: StoreConstructor) {
    if let Ok(mut drivers) = DRIVERS.write() {
        drivers.insert(backend, constructor);
        debug!("Registered store backend: {}", backend);
    }
}

/// Whether a backend has been registered
pub fn is_registered(backend: Backend) -> bool {
    DRIVERS
        .read()
        .map(|drivers| drivers.contains_key(&backend))
        .unwrap_or(false)
}

/// Connect to a store through its registered backend
pub fn new_store(backend: Backend, addrs: &[String], config: &StoreConfig) -> Result<StoreHandle> {
    let constructor = DRIVERS
        .read()
        .map_err(|e| StoreError::Internal(e.to_string()))?
        .get(&backend)
        .copied()
        .ok_or_else(|| StoreError::UnsupportedBackend(backend.to_string()))?;

    constructor(addrs, config)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory;

    #[test]
    fn test_backend_from_str() {
        assert_eq!("consul".parse::<Backend>().unwrap(), Backend::Consul);
        assert_eq!(" Memory ".parse::<Backend>().unwrap(), Backend::Memory);
        assert!(matches!(
            "zookeeper".parse::<Backend>(),
            Err(StoreError::UnsupportedBackend(_))
        ));
    }

    #[test]
    fn test_register_is_idempotent() {
        memory::register();
        memory::register();
        assert!(is_registered(Backend::Memory));

        let handle = new_store(Backend::Memory, &[], &StoreConfig::default()).unwrap();
        assert_eq!(handle.store().name(), "memory");
    }
}
