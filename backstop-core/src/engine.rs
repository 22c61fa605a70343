/*!
Backup engine that orchestrates snapshot, compression, cataloging and cleanup.

This module holds the engine type, its builder and the creation pipeline.
Verification, restore, retention and replication are implemented on the
same type in their own modules.
*/

use std::collections::{BTreeSet, HashMap};
use std::fs;
use std::io::{self, BufWriter, ErrorKind, Write};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant, SystemTime};

use chrono::Utc;
use tracing::{debug, error, info, warn};

use crate::catalog::Catalog;
use crate::compression::Compression;
use crate::config::EngineConfig;
use crate::integrity::HashingWriter;
use crate::observability::{CatalogGauges, MetricsSink, NoopMetrics};
use crate::record::{BackupId, BackupKind, BackupRecord, BackupRef, BackupStatus, RetentionTier};
use crate::remote::{RemoteRegistry, RemoteStore, GLOBAL_RT};
use crate::replicate::Replicator;
use crate::source::{resolve_source_path, SnapshotSource, SqliteSnapshotSource};
use crate::{BackstopError, Result};

const WRITE_BUFFER: usize = 256 * 1024;

/// File name prefix of artifacts still being written
pub(crate) const ARTIFACT_STAGING_PREFIX: &str = ".artifact-";
/// File name prefix of restores still being staged
pub(crate) const RESTORE_STAGING_PREFIX: &str = ".restore-";
const SNAPSHOT_STAGING_PREFIX: &str = ".snapshot-";

/// Staging files untouched for this long are reported as orphans
const STALE_STAGING_AGE: Duration = Duration::from_secs(3600);

/// Main entry point for backup, restore and maintenance operations
///
/// One engine instance is shared by the scheduler and on-demand callers.
/// Creation and restore against the same database are serialized by a
/// per-database lock; catalog reads and verification are lock-free.
///
/// # Example
/// ```rust,no_run
/// use backstop_core::{BackupEngine, BackupKind, Compression, EngineConfig, RetentionTier};
///
/// let engine = BackupEngine::open(EngineConfig::new("/data/app.db", "/var/backups/app"))?;
/// let record = engine.create_backup(BackupKind::Full, Compression::Gzip, RetentionTier::Daily)?;
/// assert!(engine.verify_backup(&record)?);
/// # Ok::<(), backstop_core::BackstopError>(())
/// ```
pub struct BackupEngine {
    pub(crate) config: EngineConfig,
    pub(crate) catalog: Arc<Catalog>,
    pub(crate) source: Arc<dyn SnapshotSource>,
    pub(crate) metrics: Arc<dyn MetricsSink>,
    pub(crate) replicator: Replicator,
    source_locks: Mutex<HashMap<PathBuf, Arc<Mutex<()>>>>,
    /// Serializes deletes and retention runs against each other
    pub(crate) maintenance: Mutex<()>,
}

/// Builder for [`BackupEngine`]
pub struct BackupEngineBuilder {
    config: EngineConfig,
    source: Option<Arc<dyn SnapshotSource>>,
    metrics: Option<Arc<dyn MetricsSink>>,
    remotes: RemoteRegistry,
}

impl BackupEngineBuilder {
    /// Use a custom snapshot source instead of SQLite
    pub fn with_source(mut self, source: Arc<dyn SnapshotSource>) -> Self {
        self.source = Some(source);
        self
    }

    pub fn with_metrics(mut self, metrics: Arc<dyn MetricsSink>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    /// Register a remote store for replication
    pub fn with_remote(mut self, store: Arc<dyn RemoteStore>) -> Self {
        self.remotes.register(store);
        self
    }

    pub fn with_remotes(mut self, remotes: RemoteRegistry) -> Self {
        self.remotes = remotes;
        self
    }

    /// Validate the configuration, prepare the backup directory and load the catalog
    pub fn build(self) -> Result<BackupEngine> {
        self.config.validate()?;
        fs::create_dir_all(&self.config.backup_dir)
            .map_err(|e| BackstopError::storage_write(&self.config.backup_dir, e))?;

        let catalog = Arc::new(Catalog::open(
            self.config.catalog_path(),
            self.config.lock_timeout,
        )?);
        let source = self.source.unwrap_or_else(|| {
            Arc::new(SqliteSnapshotSource::new().with_staging_dir(&self.config.backup_dir))
        });
        let metrics = self.metrics.unwrap_or_else(|| Arc::new(NoopMetrics));
        let replicator = Replicator::new(
            Arc::clone(&catalog),
            self.remotes,
            Arc::clone(&metrics),
            self.config.replication_timeout,
        );

        info!(
            backup_dir = %self.config.backup_dir.display(),
            records = catalog.list().len(),
            providers = ?replicator.providers(),
            "Backup engine ready"
        );

        let engine = BackupEngine {
            config: self.config,
            catalog,
            source,
            metrics,
            replicator,
            source_locks: Mutex::new(HashMap::new()),
            maintenance: Mutex::new(()),
        };
        engine.refresh_gauges();
        Ok(engine)
    }
}

impl BackupEngine {
    pub fn builder(config: EngineConfig) -> BackupEngineBuilder {
        BackupEngineBuilder {
            config,
            source: None,
            metrics: None,
            remotes: RemoteRegistry::new(),
        }
    }

    /// Engine with the SQLite source, no metrics and no remote stores
    pub fn open(config: EngineConfig) -> Result<Self> {
        Self::builder(config).build()
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn catalog(&self) -> &Arc<Catalog> {
        &self.catalog
    }

    pub fn replicator(&self) -> &Replicator {
        &self.replicator
    }

    /// Create a backup of the configured source
    ///
    /// The artifact is written to a staging file in the backup directory,
    /// hashed on the fly, renamed to `<id>.db[.gz|.zst]` and only then
    /// cataloged. Any failure removes the staging file and leaves no entry.
    ///
    /// # Errors
    /// * `BackstopError::Unsupported` - for kinds other than `Full`
    /// * `BackstopError::SourceUnavailable` - if no consistent snapshot could be taken in time
    /// * `BackstopError::StorageWrite` - if the artifact could not be written
    pub fn create_backup(
        &self,
        kind: BackupKind,
        compression: Compression,
        retention_tier: RetentionTier,
    ) -> Result<BackupRecord> {
        let source = self.config.source.clone();
        let lock = self.source_lock(&resolve_source_path(&source));
        let _guard = lock_ignoring_poison(&lock);
        self.create_locked(&source, kind, compression, retention_tier)
    }

    /// Create a Full backup whose tier follows the calendar rule
    pub fn create_scheduled_backup(&self, compression: Compression) -> Result<BackupRecord> {
        let tier = self.next_tier(Utc::now());
        self.create_backup(BackupKind::Full, compression, tier)
    }

    /// Creation pipeline; the caller holds the lock for `source_descriptor`
    pub(crate) fn create_locked(
        &self,
        source_descriptor: &str,
        kind: BackupKind,
        compression: Compression,
        retention_tier: RetentionTier,
    ) -> Result<BackupRecord> {
        let started = Instant::now();
        let result = self.write_artifact(source_descriptor, kind, compression, retention_tier);
        let elapsed = started.elapsed();

        match &result {
            Ok(record) => {
                self.metrics
                    .backup_created(kind, compression, record.size_bytes, elapsed);
                info!(
                    backup_id = %record.id,
                    size_bytes = record.size_bytes,
                    compression = %compression,
                    tier = %retention_tier,
                    duration_ms = elapsed.as_millis() as u64,
                    "Backup created"
                );
                self.refresh_gauges();
            }
            Err(e) => {
                self.metrics.backup_failed(kind, e.kind());
                error!(source = %source_descriptor, error = %e, "Backup failed");
            }
        }
        result
    }

    fn write_artifact(
        &self,
        source_descriptor: &str,
        kind: BackupKind,
        compression: Compression,
        retention_tier: RetentionTier,
    ) -> Result<BackupRecord> {
        if kind != BackupKind::Full {
            return Err(BackstopError::Unsupported(format!(
                "{kind} backups are not implemented; only full backups can be created"
            )));
        }

        let backup_dir = &self.config.backup_dir;
        let created_at = Utc::now();
        let id = BackupId::generate(kind, created_at).to_string();
        let final_path = backup_dir.join(format!("{id}.db{}", compression.file_suffix()));

        let mut snapshot = self
            .source
            .open_consistent_snapshot(source_descriptor, self.config.snapshot_timeout)?;
        debug!(backup_id = %id, "Consistent snapshot obtained");

        let staging = tempfile::Builder::new()
            .prefix(ARTIFACT_STAGING_PREFIX)
            .tempfile_in(backup_dir)
            .map_err(|e| BackstopError::storage_write(backup_dir, e))?;
        let write_error = |e: io::Error| BackstopError::storage_write(&final_path, e);

        let (checksum, size_bytes) = {
            let sink = HashingWriter::new(BufWriter::with_capacity(WRITE_BUFFER, staging.as_file()));
            let mut encoder = compression.writer(sink, self.config.compression_levels)?;
            io::copy(&mut snapshot, &mut encoder).map_err(write_error)?;
            let (mut buffered, checksum, size_bytes) = encoder.finish().map_err(write_error)?.finalize();
            buffered.flush().map_err(write_error)?;
            (checksum, size_bytes)
        };
        drop(snapshot);
        staging.as_file().sync_all().map_err(write_error)?;

        // from here on the artifact exists under its final name
        staging
            .persist_noclobber(&final_path)
            .map_err(|e| BackstopError::storage_write(&final_path, e.error))?;

        let record = BackupRecord {
            id,
            backup_kind: kind,
            compression,
            source_descriptor: source_descriptor.to_string(),
            artifact_location: final_path,
            size_bytes,
            checksum,
            retention_tier,
            created_at,
            verified_at: None,
            remote_copies: Vec::new(),
            status: BackupStatus::Active,
        };

        if let Err(e) = self.catalog.append(record.clone()) {
            if let Err(cleanup) = fs::remove_file(&record.artifact_location) {
                warn!(
                    path = %record.artifact_location.display(),
                    error = %cleanup,
                    "Failed to remove uncataloged artifact"
                );
            }
            return Err(e);
        }
        Ok(record)
    }

    /// All records, Deleted ones included, oldest first
    pub fn list_backups(&self) -> Vec<BackupRecord> {
        self.catalog.list()
    }

    /// Active records, oldest first
    pub fn list_active_backups(&self) -> Vec<BackupRecord> {
        self.catalog.active()
    }

    pub fn get_backup(&self, id: &str) -> Option<BackupRecord> {
        self.catalog.get(id)
    }

    /// Resolve an id-or-record argument against the catalog
    ///
    /// A passed-in record is re-read by id so callers holding a stale copy
    /// still act on the durable state.
    pub(crate) fn resolve(&self, backup: BackupRef<'_>) -> Result<BackupRecord> {
        self.catalog
            .get_fresh(backup.id())?
            .ok_or_else(|| BackstopError::BackupNotFound(backup.id().to_string()))
    }

    /// Delete a backup on operator request
    ///
    /// Returns `Ok(false)` if the record was already Deleted. Refuses with
    /// `RetentionViolation` when it is the only Active backup left.
    pub fn delete_backup(&self, id: &str) -> Result<bool> {
        self.delete_checked(id, false)
    }

    /// Delete a backup even if it is the last Active one
    pub fn force_delete_backup(&self, id: &str) -> Result<bool> {
        self.delete_checked(id, true)
    }

    fn delete_checked(&self, id: &str, force: bool) -> Result<bool> {
        let _maintenance = lock_ignoring_poison(&self.maintenance);
        let records = self.catalog.load()?;
        let record = records
            .iter()
            .find(|r| r.id == id)
            .cloned()
            .ok_or_else(|| BackstopError::BackupNotFound(id.to_string()))?;
        if !record.is_active() {
            debug!(backup_id = %id, "Backup already deleted");
            return Ok(false);
        }
        if !force && records.iter().filter(|r| r.is_active()).count() <= 1 {
            return Err(BackstopError::RetentionViolation(id.to_string()));
        }

        self.delete_record(&record)?;
        self.refresh_gauges();
        info!(backup_id = %id, forced = force, "Backup deleted");
        Ok(true)
    }

    /// Remove the artifact, then mark the record Deleted
    pub(crate) fn delete_record(&self, record: &BackupRecord) -> Result<()> {
        match fs::remove_file(&record.artifact_location) {
            Ok(()) => {}
            Err(e) if e.kind() == ErrorKind::NotFound => {
                warn!(
                    backup_id = %record.id,
                    path = %record.artifact_location.display(),
                    "Artifact already missing"
                );
            }
            Err(e) => return Err(BackstopError::Io(e)),
        }
        self.catalog.mark_deleted(&record.id)?;
        self.metrics.backup_deleted(record.backup_kind);
        Ok(())
    }

    /// Files the catalog does not account for
    ///
    /// Reports artifacts in the backup directory with no catalog entry (a
    /// crash between artifact rename and catalog write), artifacts of
    /// Deleted records, and staging files older than an hour. Restore
    /// staging files are also looked for next to every known source
    /// database. Nothing is removed.
    pub fn find_orphaned_artifacts(&self) -> Result<Vec<PathBuf>> {
        let mut orphans = Vec::new();
        for entry in fs::read_dir(&self.config.backup_dir)? {
            let entry = entry?;
            if !entry.file_type()?.is_file() {
                continue;
            }
            let name = entry.file_name();
            let Some(name) = name.to_str() else {
                continue;
            };
            let path = entry.path();

            if [ARTIFACT_STAGING_PREFIX, SNAPSHOT_STAGING_PREFIX, RESTORE_STAGING_PREFIX]
                .iter()
                .any(|prefix| name.starts_with(prefix))
            {
                if is_stale(&path) {
                    orphans.push(path);
                }
                continue;
            }

            let Some(id) = BackupId::from_artifact_name(name) else {
                continue;
            };
            match self.catalog.get(&id.to_string()) {
                None => orphans.push(path),
                Some(record) if !record.is_active() => orphans.push(path),
                Some(_) => {}
            }
        }

        for dir in self.restore_target_dirs() {
            orphans.extend(stale_restore_staging(&dir)?);
        }
        orphans.sort();
        orphans.dedup();
        Ok(orphans)
    }

    /// Directories holding the configured source and every cataloged one,
    /// excluding the backup directory itself
    fn restore_target_dirs(&self) -> BTreeSet<PathBuf> {
        let backup_dir = fs::canonicalize(&self.config.backup_dir)
            .unwrap_or_else(|_| self.config.backup_dir.clone());
        std::iter::once(self.config.source.clone())
            .chain(self.catalog.list().into_iter().map(|r| r.source_descriptor))
            .filter_map(|source| {
                let path = resolve_source_path(&source);
                let parent = path
                    .parent()
                    .filter(|p| !p.as_os_str().is_empty())
                    .unwrap_or_else(|| Path::new("."))
                    .to_path_buf();
                let parent = fs::canonicalize(&parent).unwrap_or(parent);
                (parent != backup_dir).then_some(parent)
            })
            .collect()
    }

    /// Replicate a backup to one provider, blocking until it finishes
    ///
    /// Must not be called from inside an async runtime; async callers use
    /// [`Replicator::replicate`] directly.
    pub fn replicate(&self, id: &str, provider: &str) -> Result<crate::record::RemoteCopy> {
        GLOBAL_RT.block_on(self.replicator.replicate(id, provider))
    }

    /// Push the current Active-set summary to the metrics sink
    pub(crate) fn refresh_gauges(&self) {
        self.metrics.catalog_state(&catalog_gauges(&self.catalog.active()));
    }

    /// Lock shared by creation and restore for one database path
    pub(crate) fn source_lock(&self, path: &Path) -> Arc<Mutex<()>> {
        let key = fs::canonicalize(path).unwrap_or_else(|_| path.to_path_buf());
        let mut locks = lock_ignoring_poison(&self.source_locks);
        Arc::clone(locks.entry(key).or_default())
    }
}

impl std::fmt::Debug for BackupEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BackupEngine")
            .field("config", &self.config)
            .field("catalog", &self.catalog.path())
            .field("replicator", &self.replicator)
            .finish()
    }
}

/// Summary of Active records for the catalog gauges
pub fn catalog_gauges(active: &[BackupRecord]) -> CatalogGauges {
    let now = Utc::now();
    let age = |r: &BackupRecord| (now - r.created_at).to_std().ok();
    CatalogGauges {
        active_backups: active.len(),
        active_bytes: active.iter().map(|r| r.size_bytes).sum(),
        oldest_age: active.iter().min_by_key(|r| r.sort_key()).and_then(age),
        newest_age: active.iter().max_by_key(|r| r.sort_key()).and_then(age),
    }
}

pub(crate) fn lock_ignoring_poison<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Restore staging files in `dir` older than the staging age
fn stale_restore_staging(dir: &Path) -> Result<Vec<PathBuf>> {
    let entries = match fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(e) if e.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => return Err(BackstopError::Io(e)),
    };
    let mut stale = Vec::new();
    for entry in entries {
        let entry = entry?;
        let is_staging = entry
            .file_name()
            .to_str()
            .is_some_and(|name| name.starts_with(RESTORE_STAGING_PREFIX));
        if is_staging && entry.file_type()?.is_file() && is_stale(&entry.path()) {
            stale.push(entry.path());
        }
    }
    Ok(stale)
}

fn is_stale(path: &Path) -> bool {
    fs::metadata(path)
        .and_then(|m| m.modified())
        .ok()
        .and_then(|modified| SystemTime::now().duration_since(modified).ok())
        .is_some_and(|age| age >= STALE_STAGING_AGE)
}
