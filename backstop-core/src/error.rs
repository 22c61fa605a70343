/*!
Error types for the backstop engine.

Verification failures are deliberately absent from this taxonomy: a bad
artifact is reported as `Ok(false)` by the verifier, never as an error.
*/

use thiserror::Error;

/// Result type used throughout the backstop core.
pub type Result<T> = std::result::Result<T, BackstopError>;

/// Errors that can occur during backup, restore and maintenance operations.
#[derive(Error, Debug)]
pub enum BackstopError {
    /// A consistent snapshot of the source could not be obtained in time
    #[error("Source unavailable: {0}")]
    SourceUnavailable(String),

    /// Writing the artifact to local storage failed; no partial artifact remains
    #[error("Storage write failed for {path}: {reason}")]
    StorageWrite { path: String, reason: String },

    /// No catalog entry exists for the identifier
    #[error("Backup not found: {0}")]
    BackupNotFound(String),

    /// Integrity check failed before a restore touched the target
    #[error("Checksum mismatch: expected {expected}, got {actual}")]
    ChecksumMismatch { expected: String, actual: String },

    /// A remote store rejected or did not answer a replication request
    #[error("Replication to '{provider}' failed: {reason}")]
    ReplicationFailure { provider: String, reason: String },

    /// The operation would leave the catalog without any Active backup
    #[error("Refusing to delete {0}: it is the last active backup")]
    RetentionViolation(String),

    /// The catalog could not be read, locked or written
    #[error("Catalog error: {0}")]
    Catalog(String),

    /// Compression/decompression errors
    #[error("Compression error: {0}")]
    Compression(String),

    /// Remote store adapter errors
    #[error("Remote store error: {0}")]
    Remote(String),

    /// Invalid configuration or arguments
    #[error("Validation error: {0}")]
    Validation(String),

    /// Reserved backup kinds that have no creation algorithm yet
    #[error("Unsupported operation: {0}")]
    Unsupported(String),

    /// Metrics registry errors
    #[error("Metrics error: {0}")]
    Metrics(String),

    /// I/O errors outside of artifact creation
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON serialization/deserialization errors
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl BackstopError {
    /// Create a new source-unavailable error
    pub fn source_unavailable<S: Into<String>>(msg: S) -> Self {
        Self::SourceUnavailable(msg.into())
    }

    /// Create a new storage write error for the given path
    pub fn storage_write<P: AsRef<std::path::Path>, S: ToString>(path: P, reason: S) -> Self {
        Self::StorageWrite {
            path: path.as_ref().display().to_string(),
            reason: reason.to_string(),
        }
    }

    /// Create a new catalog error
    pub fn catalog<S: Into<String>>(msg: S) -> Self {
        Self::Catalog(msg.into())
    }

    /// Create a new compression error
    pub fn compression<S: Into<String>>(msg: S) -> Self {
        Self::Compression(msg.into())
    }

    /// Create a new remote store error
    pub fn remote<S: Into<String>>(msg: S) -> Self {
        Self::Remote(msg.into())
    }

    /// Create a new validation error
    pub fn validation<S: Into<String>>(msg: S) -> Self {
        Self::Validation(msg.into())
    }

    /// Create a new replication failure for a provider
    pub fn replication<P: Into<String>, S: Into<String>>(provider: P, reason: S) -> Self {
        Self::ReplicationFailure {
            provider: provider.into(),
            reason: reason.into(),
        }
    }

    /// Short, stable label used for metrics and log fields
    pub fn kind(&self) -> &'static str {
        match self {
            Self::SourceUnavailable(_) => "source_unavailable",
            Self::StorageWrite { .. } => "storage_write",
            Self::BackupNotFound(_) => "backup_not_found",
            Self::ChecksumMismatch { .. } => "checksum_mismatch",
            Self::ReplicationFailure { .. } => "replication_failure",
            Self::RetentionViolation(_) => "retention_violation",
            Self::Catalog(_) => "catalog",
            Self::Compression(_) => "compression",
            Self::Remote(_) => "remote",
            Self::Validation(_) => "validation",
            Self::Unsupported(_) => "unsupported",
            Self::Metrics(_) => "metrics",
            Self::Io(_) => "io",
            Self::Json(_) => "json",
        }
    }
}
