//! Configuration for the backup engine, retention policy and remote stores
//!
//! Engine settings are plain serde structures with builder-style setters so
//! the CLI, tests and embedding applications can assemble them the same way.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::compression::{Compression, CompressionLevels};
use crate::{BackstopError, Result};

/// File name of the catalog inside the backup directory
pub const CATALOG_FILE_NAME: &str = "catalog.json";

/// Engine-wide settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Locator of the live database (a path, optionally `sqlite:` prefixed)
    pub source: String,
    /// Directory holding artifacts and, by default, the catalog
    pub backup_dir: PathBuf,
    /// Catalog location override (defaults to `<backup_dir>/catalog.json`)
    pub catalog_path: Option<PathBuf>,
    /// Bound on waiting for the source's consistency point
    pub snapshot_timeout: Duration,
    /// Bound on a single provider's replication, retries included
    pub replication_timeout: Duration,
    /// Bound on waiting for the catalog's cross-process lock
    pub lock_timeout: Duration,
    /// Compression used when callers do not choose one
    pub default_compression: Compression,
    pub compression_levels: CompressionLevels,
}

impl EngineConfig {
    /// Create a configuration with defaults for everything but the two paths
    pub fn new<S: Into<String>, P: AsRef<Path>>(source: S, backup_dir: P) -> Self {
        Self {
            source: source.into(),
            backup_dir: backup_dir.as_ref().to_path_buf(),
            catalog_path: None,
            snapshot_timeout: Duration::from_secs(30),
            replication_timeout: Duration::from_secs(300),
            lock_timeout: Duration::from_secs(10),
            default_compression: Compression::Gzip,
            compression_levels: CompressionLevels::default(),
        }
    }

    pub fn with_catalog_path<P: AsRef<Path>>(mut self, path: P) -> Self {
        self.catalog_path = Some(path.as_ref().to_path_buf());
        self
    }

    pub fn with_snapshot_timeout(mut self, timeout: Duration) -> Self {
        self.snapshot_timeout = timeout;
        self
    }

    pub fn with_replication_timeout(mut self, timeout: Duration) -> Self {
        self.replication_timeout = timeout;
        self
    }

    pub fn with_lock_timeout(mut self, timeout: Duration) -> Self {
        self.lock_timeout = timeout;
        self
    }

    pub fn with_default_compression(mut self, compression: Compression) -> Self {
        self.default_compression = compression;
        self
    }

    pub fn with_compression_levels(mut self, levels: CompressionLevels) -> Self {
        self.compression_levels = levels;
        self
    }

    /// Resolved catalog file location
    pub fn catalog_path(&self) -> PathBuf {
        self.catalog_path
            .clone()
            .unwrap_or_else(|| self.backup_dir.join(CATALOG_FILE_NAME))
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<()> {
        if self.source.trim().is_empty() {
            return Err(BackstopError::validation("source descriptor cannot be empty"));
        }
        if self.backup_dir.as_os_str().is_empty() {
            return Err(BackstopError::validation("backup_dir cannot be empty"));
        }
        if self.snapshot_timeout.is_zero() {
            return Err(BackstopError::validation("snapshot_timeout must be positive"));
        }
        if self.replication_timeout.is_zero() {
            return Err(BackstopError::validation("replication_timeout must be positive"));
        }
        if self.compression_levels.gzip > 9 {
            return Err(BackstopError::validation("gzip level must be between 0 and 9"));
        }
        if !(1..=21).contains(&self.compression_levels.zstd) {
            return Err(BackstopError::validation("zstd level must be between 1 and 21"));
        }
        Ok(())
    }
}

/// Keep-counts per retention tier
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetentionPolicy {
    pub daily_keep: usize,
    pub weekly_keep: usize,
    pub monthly_keep: usize,
}

impl RetentionPolicy {
    pub fn new(daily_keep: usize, weekly_keep: usize, monthly_keep: usize) -> Self {
        Self {
            daily_keep,
            weekly_keep,
            monthly_keep,
        }
    }
}

impl Default for RetentionPolicy {
    fn default() -> Self {
        Self::new(7, 4, 12)
    }
}

/// Supported remote store providers
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum RemoteBackend {
    /// Mounted directory (NFS share, removable disk, ...)
    Directory,
    /// Amazon S3
    S3,
    /// Google Cloud Storage
    Gcs,
}

/// Description of one replication target
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemoteConfig {
    pub backend: RemoteBackend,
    /// Bucket name for object stores
    pub bucket: Option<String>,
    /// Key prefix (object stores) or root directory (directory backend)
    pub prefix: String,
    /// Region override for S3
    pub region: Option<String>,
}

impl RemoteConfig {
    /// Parse a remote URI
    ///
    /// Supports formats:
    /// - `s3://bucket-name/prefix`
    /// - `gs://bucket-name/prefix`
    /// - `file:///mnt/backups` or a bare path for a mirror directory
    pub fn from_uri(uri: &str) -> Result<Self> {
        let bucket_and_prefix = |rest: &str, scheme: &str| -> Result<(String, String)> {
            let mut parts = rest.splitn(2, '/');
            let bucket = parts.next().unwrap_or_default();
            if bucket.is_empty() {
                return Err(BackstopError::validation(format!(
                    "Invalid {scheme} URI: missing bucket name"
                )));
            }
            let prefix = parts.next().unwrap_or_default().trim_matches('/').to_string();
            Ok((bucket.to_string(), prefix))
        };

        if let Some(rest) = uri.strip_prefix("s3://") {
            let (bucket, prefix) = bucket_and_prefix(rest, "S3")?;
            Ok(Self {
                backend: RemoteBackend::S3,
                bucket: Some(bucket),
                prefix,
                region: None,
            })
        } else if let Some(rest) = uri.strip_prefix("gs://") {
            let (bucket, prefix) = bucket_and_prefix(rest, "GCS")?;
            Ok(Self {
                backend: RemoteBackend::Gcs,
                bucket: Some(bucket),
                prefix,
                region: None,
            })
        } else {
            let path = uri.strip_prefix("file://").unwrap_or(uri);
            if path.is_empty() {
                return Err(BackstopError::validation("Invalid remote URI: empty path"));
            }
            Ok(Self {
                backend: RemoteBackend::Directory,
                bucket: None,
                prefix: path.to_string(),
                region: None,
            })
        }
    }

    pub fn with_region<S: Into<String>>(mut self, region: S) -> Self {
        self.region = Some(region.into());
        self
    }

    /// Provider name under which the store is registered
    pub fn provider_name(&self) -> &'static str {
        match self.backend {
            RemoteBackend::Directory => "directory",
            RemoteBackend::S3 => "s3",
            RemoteBackend::Gcs => "gcs",
        }
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<()> {
        match self.backend {
            RemoteBackend::S3 | RemoteBackend::Gcs => {
                if self.bucket.as_deref().map_or(true, str::is_empty) {
                    return Err(BackstopError::validation(format!(
                        "{} backend requires a valid bucket name",
                        self.provider_name()
                    )));
                }
            }
            RemoteBackend::Directory => {
                if self.prefix.is_empty() {
                    return Err(BackstopError::validation(
                        "directory backend requires a target path",
                    ));
                }
            }
        }
        Ok(())
    }
}
