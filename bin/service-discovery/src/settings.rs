//! Daemon settings read from the environment

use anyhow::{Context, Result};
use discovery_store::{Backend, StoreConfig};
use std::collections::HashMap;

/// What to watch and where
#[derive(Clone, Debug)]
pub struct Settings {
    pub backend: Backend,
    pub addrs: Vec<String>,
    pub base_path: String,
    pub service_path: Option<String>,
    pub retries_after_watch_failed: i64,
    pub store: StoreConfig,
}

impl Settings {
    /// Read settings from `DISCOVERY_*` environment variables
    pub fn from_env() -> Result<Self> {
        Self::from_vars(&std::env::vars().collect())
    }

    fn from_vars(vars: &HashMap<String, String>) -> Result<Self> {
        let get = |name: &str| vars.get(name).map(|v| v.trim()).filter(|v| !v.is_empty());

        let backend = get("DISCOVERY_BACKEND")
            .unwrap_or("consul")
            .parse::<Backend>()?;

        let addrs = get("DISCOVERY_ADDRS")
            .unwrap_or("127.0.0.1:8500")
            .split(',')
            .map(|a| a.trim().to_string())
            .filter(|a| !a.is_empty())
            .collect();

        let retries_after_watch_failed = match get("DISCOVERY_RETRIES") {
            Some(v) => v
                .parse()
                .with_context(|| format!("DISCOVERY_RETRIES is not an integer: {}", v))?,
            None => -1,
        };

        let store = StoreConfig {
            token: get("DISCOVERY_TOKEN").map(str::to_string),
            ..Default::default()
        };

        Ok(Self {
            backend,
            addrs,
            base_path: get("DISCOVERY_BASE_PATH").unwrap_or("rpcx").to_string(),
            service_path: get("DISCOVERY_SERVICE_PATH").map(str::to_string),
            retries_after_watch_failed,
            store,
        })
    }

    /// Path of the watched subtree
    pub fn watch_path(&self) -> String {
        match &self.service_path {
            Some(service) => format!("{}/{}", self.base_path, service),
            None => self.base_path.clone(),
        }
    }
}
