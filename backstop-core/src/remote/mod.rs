/*!
Remote stores for off-site copies of backup artifacts.

The engine depends only on the [`RemoteStore`] capability. Each provider
(mirror directory, S3, GCS) is an adapter registered by name in a
[`RemoteRegistry`]; a provider whose SDK feature is disabled or whose
credentials are missing is simply not registered.
*/

pub mod directory;
#[cfg(feature = "gcs")]
pub mod gcs;
#[cfg(feature = "s3")]
pub mod s3;

use std::collections::BTreeMap;
use std::fmt;
use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use backstop_retry::RetryableError;
use once_cell::sync::Lazy;
use thiserror::Error;
use tokio::runtime::Runtime;

use crate::config::{RemoteBackend, RemoteConfig};
use crate::{BackstopError, Result};

pub use directory::DirectoryStore;
#[cfg(feature = "gcs")]
pub use gcs::GcsStore;
#[cfg(feature = "s3")]
pub use s3::S3Store;

/// Runtime used by the synchronous engine facade to drive async remote I/O
pub(crate) static GLOBAL_RT: Lazy<Runtime> = Lazy::new(|| {
    tokio::runtime::Builder::new_multi_thread()
        .worker_threads(num_cpus::get().clamp(2, 4))
        .thread_name("backstop-remote")
        .enable_all()
        .build()
        .expect("Failed to create global async runtime")
});

/// Failure reported by a remote store adapter
#[derive(Debug, Error)]
pub enum RemoteError {
    /// Network hiccup, throttling or server-side 5xx; worth retrying
    #[error("{0}")]
    Transient(String),
    /// Credentials, missing bucket, bad request; retrying will not help
    #[error("{0}")]
    Permanent(String),
}

impl RemoteError {
    pub fn transient<S: Into<String>>(msg: S) -> Self {
        Self::Transient(msg.into())
    }

    pub fn permanent<S: Into<String>>(msg: S) -> Self {
        Self::Permanent(msg.into())
    }
}

impl RetryableError for RemoteError {
    fn is_transient(&self) -> bool {
        matches!(self, Self::Transient(_))
    }
}

impl From<std::io::Error> for RemoteError {
    fn from(err: std::io::Error) -> Self {
        if err.is_transient() {
            Self::Transient(err.to_string())
        } else {
            Self::Permanent(err.to_string())
        }
    }
}

impl From<RemoteError> for BackstopError {
    fn from(err: RemoteError) -> Self {
        BackstopError::remote(err.to_string())
    }
}

pub type RemoteResult<T> = std::result::Result<T, RemoteError>;

/// Capability for mirroring artifacts to one remote location
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait RemoteStore: Send + Sync {
    /// Provider name recorded in `remote_copies`
    fn provider(&self) -> String;

    /// Upload a local file under `key`, returning the URI of the stored object
    async fn upload_file(&self, local: &Path, key: &str) -> RemoteResult<String>;

    /// Upload an in-memory object under `key`, returning its URI
    async fn upload_bytes(&self, data: Vec<u8>, key: &str) -> RemoteResult<String>;

    async fn exists(&self, key: &str) -> RemoteResult<bool>;

    async fn delete(&self, key: &str) -> RemoteResult<()>;
}

/// Join a store prefix and an object name into a key
pub fn object_key(prefix: &str, name: &str) -> String {
    let prefix = prefix.trim_matches('/');
    if prefix.is_empty() {
        name.to_string()
    } else {
        format!("{prefix}/{name}")
    }
}

/// Named set of remote stores available for replication
#[derive(Clone, Default)]
pub struct RemoteRegistry {
    stores: BTreeMap<String, Arc<dyn RemoteStore>>,
}

impl RemoteRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a store under its provider name, replacing any previous one
    pub fn register(&mut self, store: Arc<dyn RemoteStore>) {
        self.stores.insert(store.provider(), store);
    }

    pub fn get(&self, provider: &str) -> Option<Arc<dyn RemoteStore>> {
        self.stores.get(provider).cloned()
    }

    pub fn providers(&self) -> Vec<String> {
        self.stores.keys().cloned().collect()
    }

    pub fn is_empty(&self) -> bool {
        self.stores.is_empty()
    }
}

impl fmt::Debug for RemoteRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RemoteRegistry")
            .field("providers", &self.providers())
            .finish()
    }
}

/// Build the adapter described by `config`
pub async fn connect(config: &RemoteConfig) -> Result<Arc<dyn RemoteStore>> {
    config.validate()?;
    match config.backend {
        RemoteBackend::Directory => Ok(Arc::new(DirectoryStore::new(&config.prefix))),
        #[cfg(feature = "s3")]
        RemoteBackend::S3 => {
            let store = S3Store::connect(
                config.bucket.clone().unwrap_or_default(),
                config.prefix.clone(),
                config.region.clone(),
            )
            .await?;
            Ok(Arc::new(store))
        }
        #[cfg(not(feature = "s3"))]
        RemoteBackend::S3 => Err(BackstopError::Unsupported(
            "S3 support not enabled. Recompile with --features s3".to_string(),
        )),
        #[cfg(feature = "gcs")]
        RemoteBackend::Gcs => {
            let store = GcsStore::connect(
                config.bucket.clone().unwrap_or_default(),
                config.prefix.clone(),
            )
            .await?;
            Ok(Arc::new(store))
        }
        #[cfg(not(feature = "gcs"))]
        RemoteBackend::Gcs => Err(BackstopError::Unsupported(
            "GCS support not enabled. Recompile with --features gcs".to_string(),
        )),
    }
}

/// Blocking variant of [`connect`] for synchronous callers
pub fn connect_blocking(config: &RemoteConfig) -> Result<Arc<dyn RemoteStore>> {
    GLOBAL_RT.block_on(connect(config))
}
