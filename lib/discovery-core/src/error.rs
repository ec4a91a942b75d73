use discovery_store::StoreError;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, DiscoveryError>;

#[derive(Error, Debug)]
pub enum DiscoveryError {
    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    #[error("Gave up watching {path}: {source}")]
    WatchAbandoned {
        path: String,
        #[source]
        source: StoreError,
    },

    #[error("Invalid service path: {0}")]
    InvalidPath(String),

    #[error("Watch task failed: {0}")]
    TaskFailed(String),
}
