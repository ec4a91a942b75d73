//! Endpoint pairs and key parsing
use discovery_store::KvEntry;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

/// One service instance: its key relative to the base path and its metadata
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct KvPair {
    pub key: String,
    pub value: String,
}

impl KvPair {
    pub fn new(key: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            value: value.into(),
        }
    }
}

/// Immutable snapshot of the endpoints known at one point in time
pub type ServiceSet = Arc<[KvPair]>;

/// Caller supplied predicate; pairs for which it returns false are ignored
pub type ServiceFilter = Arc<dyn Fn(&KvPair) -> bool + Send + Sync>;

pub(crate) fn empty_set() -> ServiceSet {
    Arc::from(Vec::new())
}

/// Strip leading and trailing slashes from a base path
pub fn normalize_base_path(path: &str) -> String {
    path.trim_matches('/').to_string()
}

/// Turn raw store entries into endpoint pairs.
///
/// Prefix listings may return sibling keys (`svc` also matches `svcx/a`), so
/// every key is checked against `prefix` (the base path plus `/`) again.
/// Keys equal to the prefix itself carry no instance and are skipped.
pub(crate) fn parse_entries(
    prefix: &str,
    entries: Vec<KvEntry>,
    filter: Option<&ServiceFilter>,
) -> ServiceSet {
    entries
        .into_iter()
        .filter_map(|entry| {
            let key = entry.key.strip_prefix(prefix)?;
            if key.is_empty() {
                return None;
            }
            Some(KvPair {
                key: key.to_string(),
                value: String::from_utf8_lossy(&entry.value).into_owned(),
            })
        })
        .filter(|pair| filter.map_or(true, |f| f(pair)))
        .collect::<Vec<_>>()
        .into()
}
