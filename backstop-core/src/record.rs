/*!
Catalog entry schema and backup identifiers.
*/

use crate::compression::Compression;
use crate::{BackstopError, Result};
use chrono::{DateTime, NaiveDateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;
use uuid::Uuid;

/// Kind of backup. Only `Full` has a creation algorithm; the others are
/// reserved so catalogs written by future versions still deserialize.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackupKind {
    Full,
    Incremental,
    WriteAheadLog,
}

impl BackupKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Full => "full",
            Self::Incremental => "incremental",
            Self::WriteAheadLog => "wal",
        }
    }
}

impl fmt::Display for BackupKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for BackupKind {
    type Err = BackstopError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "full" => Ok(Self::Full),
            "incremental" => Ok(Self::Incremental),
            "wal" | "write_ahead_log" => Ok(Self::WriteAheadLog),
            other => Err(BackstopError::validation(format!(
                "unknown backup kind '{other}'"
            ))),
        }
    }
}

/// Time-based retention bucket
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RetentionTier {
    Daily,
    Weekly,
    Monthly,
}

impl RetentionTier {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Daily => "daily",
            Self::Weekly => "weekly",
            Self::Monthly => "monthly",
        }
    }
}

impl Default for RetentionTier {
    fn default() -> Self {
        Self::Daily
    }
}

impl fmt::Display for RetentionTier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for RetentionTier {
    type Err = BackstopError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "daily" => Ok(Self::Daily),
            "weekly" => Ok(Self::Weekly),
            "monthly" => Ok(Self::Monthly),
            other => Err(BackstopError::validation(format!(
                "unknown retention tier '{other}'"
            ))),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackupStatus {
    Active,
    Deleted,
}

/// One successful mirror of an artifact on a remote store
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemoteCopy {
    pub provider: String,
    pub uri: String,
    pub replicated_at: DateTime<Utc>,
}

/// Catalog entry describing one backup artifact.
///
/// Everything except `verified_at`, `remote_copies`, `retention_tier`
/// (via reclassification) and `status` is fixed at creation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BackupRecord {
    pub id: String,
    pub backup_kind: BackupKind,
    pub compression: Compression,
    /// Locator of the database that was backed up, kept for audit only
    pub source_descriptor: String,
    pub artifact_location: PathBuf,
    /// Size of the stored (post-compression) artifact
    pub size_bytes: u64,
    /// Hex SHA-256 of the stored artifact bytes
    pub checksum: String,
    #[serde(default)]
    pub retention_tier: RetentionTier,
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub verified_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub remote_copies: Vec<RemoteCopy>,
    pub status: BackupStatus,
}

impl BackupRecord {
    pub fn is_active(&self) -> bool {
        self.status == BackupStatus::Active
    }

    /// Remote copy recorded for `provider`, if any
    pub fn remote_copy(&self, provider: &str) -> Option<&RemoteCopy> {
        self.remote_copies.iter().find(|c| c.provider == provider)
    }

    /// Record a remote copy, replacing any earlier entry for the same provider
    pub fn add_remote_copy(&mut self, copy: RemoteCopy) {
        match self
            .remote_copies
            .iter_mut()
            .find(|c| c.provider == copy.provider)
        {
            Some(existing) => *existing = copy,
            None => self.remote_copies.push(copy),
        }
    }

    /// Ordering key used everywhere records are listed: oldest first,
    /// identifier as tie-break.
    pub fn sort_key(&self) -> (DateTime<Utc>, &str) {
        (self.created_at, self.id.as_str())
    }

    /// Sanity check applied before a record is written to the catalog
    pub fn validate(&self) -> Result<()> {
        if self.id.is_empty() {
            return Err(BackstopError::validation("id cannot be empty"));
        }
        if !is_sha256_hex(&self.checksum) {
            return Err(BackstopError::validation(format!(
                "checksum for {} is not a 64-character hex digest",
                self.id
            )));
        }
        if self.source_descriptor.is_empty() {
            return Err(BackstopError::validation("source_descriptor cannot be empty"));
        }
        Ok(())
    }
}

pub(crate) fn is_sha256_hex(s: &str) -> bool {
    s.len() == 64 && s.bytes().all(|b| b.is_ascii_hexdigit())
}

const ID_TIME_FORMAT: &str = "%Y%m%dT%H%M%SZ";

/// Structured form of a backup identifier.
///
/// Format: `{kind}-{YYYYMMDD}T{HHMMSS}Z-{suffix}`, e.g.
/// `full-20250601T143000Z-9f3c2a1b`. The suffix is taken from a v4 UUID
/// so identifiers created within the same second stay distinct.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BackupId {
    kind: BackupKind,
    timestamp: DateTime<Utc>,
    suffix: String,
}

impl BackupId {
    /// Generate a fresh identifier for a backup taken at `timestamp`
    pub fn generate(kind: BackupKind, timestamp: DateTime<Utc>) -> Self {
        let suffix = Uuid::new_v4().simple().to_string()[..8].to_string();
        Self {
            kind,
            timestamp,
            suffix,
        }
    }

    /// Parse an identifier string; returns `None` for anything that is not
    /// a backup id (catalog files, staging files, foreign files).
    pub fn parse(id: &str) -> Option<Self> {
        let (kind, rest) = id.split_once('-')?;
        let (time, suffix) = rest.split_once('-')?;
        let kind = kind.parse::<BackupKind>().ok()?;
        let naive = NaiveDateTime::parse_from_str(time, ID_TIME_FORMAT).ok()?;
        if suffix.is_empty() || !suffix.bytes().all(|b| b.is_ascii_hexdigit()) {
            return None;
        }
        Some(Self {
            kind,
            timestamp: naive.and_utc(),
            suffix: suffix.to_string(),
        })
    }

    /// Extract the identifier from an artifact file name such as
    /// `full-20250601T143000Z-9f3c2a1b.db.gz`
    pub fn from_artifact_name(file_name: &str) -> Option<Self> {
        let stem = file_name.split_once('.').map_or(file_name, |(s, _)| s);
        Self::parse(stem)
    }

    pub fn kind(&self) -> BackupKind {
        self.kind
    }

    pub fn timestamp(&self) -> DateTime<Utc> {
        self.timestamp
    }

    pub fn suffix(&self) -> &str {
        &self.suffix
    }
}

impl fmt::Display for BackupId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}-{}-{}",
            self.kind,
            self.timestamp.format(ID_TIME_FORMAT),
            self.suffix
        )
    }
}

/// Identifier-or-record argument accepted by verify and restore.
///
/// Resolved exactly once, at the engine boundary, against the catalog.
#[derive(Debug, Clone, Copy)]
pub enum BackupRef<'a> {
    Id(&'a str),
    Record(&'a BackupRecord),
}

impl<'a> BackupRef<'a> {
    pub fn id(&self) -> &'a str {
        match self {
            Self::Id(id) => id,
            Self::Record(record) => record.id.as_str(),
        }
    }
}

impl<'a> From<&'a str> for BackupRef<'a> {
    fn from(id: &'a str) -> Self {
        Self::Id(id)
    }
}

impl<'a> From<&'a String> for BackupRef<'a> {
    fn from(id: &'a String) -> Self {
        Self::Id(id.as_str())
    }
}

impl<'a> From<&'a BackupRecord> for BackupRef<'a> {
    fn from(record: &'a BackupRecord) -> Self {
        Self::Record(record)
    }
}
