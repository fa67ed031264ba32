//! Per-installation key/value storage for automation state.
//!
//! Every installation owns a namespace of JSON objects keyed by name. Two
//! backends are provided: one JSON file per key on disk, or one row per key
//! in a PostgreSQL table per installation.

mod json_store;
mod postgres_store;

use std::sync::Arc;

use serde_json::Value;

pub use json_store::JsonFileStore;
pub use postgres_store::PostgresStore;

pub type InstallationId = u64;

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("postgres error: {0}")]
    Postgres(#[from] postgres::Error),
    #[error("pool error: {0}")]
    Pool(#[from] r2d2::Error),
    #[error("invalid store key: {0:?}")]
    InvalidKey(String),
    #[error("store config error: {0}")]
    Config(String),
}

/// Storage shared by all installations. Handlers never see this directly;
/// they get an [`InstallationStore`] bound to their own installation.
pub trait IntegrationStore: Send + Sync {
    /// Installations known to the backend. Entries that don't look like an
    /// installation id are skipped.
    fn list_installations(
        &self,
    ) -> Result<Box<dyn Iterator<Item = InstallationId> + '_>, StoreError>;

    /// Returns an empty object when nothing was written under `key`.
    fn get(&self, installation: InstallationId, key: &str) -> Result<Value, StoreError>;

    /// Creates the installation namespace on first write.
    fn write(&self, installation: InstallationId, key: &str, data: &Value)
        -> Result<(), StoreError>;

    /// Removing a missing key is not an error.
    fn remove(&self, installation: InstallationId, key: &str) -> Result<(), StoreError>;
}

/// Backend selection, usually straight from the daemon config.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StoreBackend {
    JsonFiles { dump_path: std::path::PathBuf },
    Postgres { database_url: String },
}

pub fn open_store(backend: &StoreBackend) -> Result<Arc<dyn IntegrationStore>, StoreError> {
    match backend {
        StoreBackend::JsonFiles { dump_path } => Ok(Arc::new(JsonFileStore::new(dump_path)?)),
        StoreBackend::Postgres { database_url } => {
            Ok(Arc::new(PostgresStore::new(database_url)?))
        }
    }
}

/// A store handle scoped to one installation.
#[derive(Clone)]
pub struct InstallationStore {
    inner: Arc<dyn IntegrationStore>,
    installation: InstallationId,
}

impl InstallationStore {
    pub fn new(inner: Arc<dyn IntegrationStore>, installation: InstallationId) -> Self {
        Self {
            inner,
            installation,
        }
    }

    pub fn installation(&self) -> InstallationId {
        self.installation
    }

    pub fn get(&self, key: &str) -> Result<Value, StoreError> {
        self.inner.get(self.installation, key)
    }

    pub fn write(&self, key: &str, data: &Value) -> Result<(), StoreError> {
        self.inner.write(self.installation, key, data)
    }

    pub fn remove(&self, key: &str) -> Result<(), StoreError> {
        self.inner.remove(self.installation, key)
    }
}

impl std::fmt::Debug for InstallationStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InstallationStore")
            .field("installation", &self.installation)
            .finish()
    }
}

pub(crate) fn validate_key(key: &str) -> Result<(), StoreError> {
    let trimmed = key.trim();
    if trimmed.is_empty()
        || trimmed != key
        || key.contains('/')
        || key.contains('\\')
        || key.contains("..")
        || key.contains('\0')
    {
        return Err(StoreError::InvalidKey(key.to_string()));
    }
    Ok(())
}

pub(crate) fn empty_object() -> Value {
    Value::Object(serde_json::Map::new())
}
