/*!
Restore pipeline.

Order of operations:
1. resolve the backup through the catalog,
2. take a safety backup of the target if it is a managed database,
3. decompress the artifact into a staging file next to the target while
   hashing the artifact bytes,
4. compare the hash with the cataloged checksum and validate the staged
   database,
5. rename the staging file over the target.

Every error returned before step 5 leaves the target byte-identical to its
state before the call. The rename is the last fallible step.
*/

use std::fs::{self, File};
use std::io::{self, BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};
use std::time::Instant;

use serde::Serialize;
use tracing::{debug, error, info, warn};

use crate::engine::{lock_ignoring_poison, BackupEngine, RESTORE_STAGING_PREFIX};
use crate::integrity::HashingReader;
use crate::record::{BackupKind, BackupRecord, BackupRef, RetentionTier};
use crate::source::resolve_source_path;
use crate::{BackstopError, Result};

/// Outcome of a successful restore
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RestoreReport {
    pub backup_id: String,
    pub target: PathBuf,
    /// Backup taken of the previous target contents, if there were any
    pub safety_backup_id: Option<String>,
    /// Whether a file already existed at the target and was replaced
    pub replaced_existing: bool,
    /// Decompressed size written to the target
    pub bytes_restored: u64,
}

impl BackupEngine {
    /// Restore a backup over `target`, or over the backup's own source when `None`
    ///
    /// # Errors
    /// * `BackstopError::BackupNotFound` - unknown id, or the backup was deleted
    /// * `BackstopError::ChecksumMismatch` - the artifact failed its integrity check
    /// * `BackstopError::Validation` - the staged database failed its structural check
    ///
    /// In every error case the target has not been modified.
    pub fn restore_backup<'a>(
        &self,
        backup: impl Into<BackupRef<'a>>,
        target: Option<&Path>,
    ) -> Result<RestoreReport> {
        let started = Instant::now();
        let backup = backup.into();
        let result = self.restore_inner(backup, target);
        let elapsed = started.elapsed();

        self.metrics.restore(result.is_ok(), elapsed);
        match &result {
            Ok(report) => {
                info!(
                    backup_id = %report.backup_id,
                    target = %report.target.display(),
                    safety_backup = ?report.safety_backup_id,
                    duration_ms = elapsed.as_millis() as u64,
                    "Restore completed"
                );
                self.refresh_gauges();
            }
            Err(e) => {
                error!(
                    backup_id = %backup.id(),
                    error = %e,
                    "Restore failed; target was not modified"
                );
            }
        }
        result
    }

    fn restore_inner(&self, backup: BackupRef<'_>, target: Option<&Path>) -> Result<RestoreReport> {
        let record = self.resolve(backup)?;
        if !record.is_active() {
            return Err(BackstopError::BackupNotFound(format!(
                "{} (deleted)",
                record.id
            )));
        }

        let target = target
            .map(Path::to_path_buf)
            .unwrap_or_else(|| resolve_source_path(&record.source_descriptor));
        let lock = self.source_lock(&target);
        let _guard = lock_ignoring_poison(&lock);

        let replaced_existing = target.exists();
        let safety_backup_id = if replaced_existing {
            self.safety_backup(&target)?
        } else {
            None
        };

        let parent = target
            .parent()
            .filter(|p| !p.as_os_str().is_empty())
            .unwrap_or_else(|| Path::new("."));
        fs::create_dir_all(parent).map_err(|e| BackstopError::storage_write(parent, e))?;

        let staging = tempfile::Builder::new()
            .prefix(RESTORE_STAGING_PREFIX)
            .tempfile_in(parent)
            .map_err(|e| BackstopError::storage_write(parent, e))?;
        let bytes_restored = stage_artifact(&record, staging.as_file())?;
        debug!(backup_id = %record.id, staging = %staging.path().display(), "Artifact staged and verified");

        self.source.validate_restored(staging.path())?;

        if replaced_existing {
            if let Ok(metadata) = fs::metadata(&target) {
                fs::set_permissions(staging.path(), metadata.permissions())
                    .map_err(|e| BackstopError::storage_write(staging.path(), e))?;
            }
        }

        staging
            .persist(&target)
            .map_err(|e| BackstopError::storage_write(&target, e.error))?;
        self.source.finalize_restore(&target);

        Ok(RestoreReport {
            backup_id: record.id,
            target,
            safety_backup_id,
            replaced_existing,
            bytes_restored,
        })
    }

    /// Back up whatever lives at `target` if it is a database we manage
    fn safety_backup(&self, target: &Path) -> Result<Option<String>> {
        if !self.source.is_managed_database(target) {
            warn!(
                target = %target.display(),
                "Restore target exists but is not a managed database; replacing it without a safety backup"
            );
            return Ok(None);
        }

        let descriptor = target.to_string_lossy();
        let record = self.create_locked(
            &descriptor,
            BackupKind::Full,
            self.config.default_compression,
            RetentionTier::Daily,
        )?;
        info!(backup_id = %record.id, target = %target.display(), "Safety backup taken");
        Ok(Some(record.id))
    }
}

/// Decompress the artifact into `staging`, hashing the stored bytes on the way
///
/// The checksum comparison happens before any decoding error is reported,
/// so a corrupted artifact surfaces as `ChecksumMismatch`.
fn stage_artifact(record: &BackupRecord, staging: &File) -> Result<u64> {
    let artifact = File::open(&record.artifact_location).map_err(|e| {
        BackstopError::ChecksumMismatch {
            expected: record.checksum.clone(),
            actual: format!("unreadable artifact ({e})"),
        }
    })?;
    let mut hashing = HashingReader::new(BufReader::new(artifact));

    let decoded = {
        let mut writer = BufWriter::new(staging);
        record
            .compression
            .reader(&mut hashing)
            .and_then(|mut decoder| Ok(io::copy(&mut decoder, &mut writer)?))
            .and_then(|bytes| {
                writer.flush()?;
                Ok(bytes)
            })
    };
    // hash anything the decoder left unread (trailing bytes, or the rest after an error)
    let drained = io::copy(&mut hashing, &mut io::sink());
    let (actual, _) = hashing.finalize();

    if actual != record.checksum {
        return Err(BackstopError::ChecksumMismatch {
            expected: record.checksum.clone(),
            actual,
        });
    }
    drained?;
    let bytes = decoded.map_err(|e| {
        BackstopError::compression(format!("Failed to decode {}: {e}", record.id))
    })?;
    staging.sync_all()?;
    Ok(bytes)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{Compression, EngineConfig};
    use rusqlite::Connection;
    use tempfile::TempDir;

    fn create_db(path: &Path, rows: &[&str]) {
        let conn = Connection::open(path).unwrap();
        conn.execute_batch("CREATE TABLE IF NOT EXISTS items (id INTEGER PRIMARY KEY, name TEXT);")
            .unwrap();
        for row in rows {
            conn.execute("INSERT INTO items (name) VALUES (?1)", [row]).unwrap();
        }
    }

    fn names(path: &Path) -> Vec<String> {
        let conn = Connection::open(path).unwrap();
        let mut stmt = conn.prepare("SELECT name FROM items ORDER BY id").unwrap();
        stmt.query_map([], |r| r.get(0))
            .unwrap()
            .collect::<std::result::Result<_, _>>()
            .unwrap()
    }

    fn setup(dir: &TempDir) -> (BackupEngine, PathBuf) {
        let db = dir.path().join("app.db");
        create_db(&db, &["one", "two"]);
        let engine = BackupEngine::open(EngineConfig::new(
            db.to_str().unwrap(),
            dir.path().join("backups"),
        ))
        .unwrap();
        (engine, db)
    }

    #[test]
    fn test_restore_in_place_takes_safety_backup() {
        let dir = TempDir::new().unwrap();
        let (engine, db) = setup(&dir);
        let record = engine
            .create_backup(BackupKind::Full, Compression::Gzip, RetentionTier::Daily)
            .unwrap();

        create_db(&db, &["three"]);
        assert_eq!(names(&db), vec!["one", "two", "three"]);

        let report = engine.restore_backup(&record, None).unwrap();
        assert_eq!(report.target, db);
        assert!(report.replaced_existing);
        assert_eq!(names(&db), vec!["one", "two"]);

        // the pre-restore state is itself restorable
        let safety_id = report.safety_backup_id.unwrap();
        let safety = engine.get_backup(&safety_id).unwrap();
        assert!(safety.is_active());
        engine.restore_backup(safety_id.as_str(), None).unwrap();
        assert_eq!(names(&db), vec!["one", "two", "three"]);
    }

    #[test]
    fn test_restore_to_new_location_skips_safety_backup() {
        let dir = TempDir::new().unwrap();
        let (engine, _) = setup(&dir);
        let record = engine
            .create_backup(BackupKind::Full, Compression::Zstd, RetentionTier::Daily)
            .unwrap();

        let target = dir.path().join("restored").join("copy.db");
        let report = engine.restore_backup(&record, Some(&target)).unwrap();

        assert!(report.safety_backup_id.is_none());
        assert!(!report.replaced_existing);
        assert_eq!(names(&target), vec!["one", "two"]);
        assert_eq!(engine.list_backups().len(), 1);
    }

    #[test]
    fn test_unmanaged_target_is_replaced_without_safety_backup() {
        let dir = TempDir::new().unwrap();
        let (engine, _) = setup(&dir);
        let record = engine
            .create_backup(BackupKind::Full, Compression::None, RetentionTier::Daily)
            .unwrap();

        let target = dir.path().join("scratch.db");
        fs::write(&target, b"not a database").unwrap();
        let report = engine.restore_backup(&record, Some(&target)).unwrap();

        assert!(report.replaced_existing);
        assert!(report.safety_backup_id.is_none());
        assert_eq!(names(&target), vec!["one", "two"]);
    }

    #[test]
    fn test_corrupt_artifact_leaves_target_untouched() {
        let dir = TempDir::new().unwrap();
        let (engine, db) = setup(&dir);
        let record = engine
            .create_backup(BackupKind::Full, Compression::Gzip, RetentionTier::Daily)
            .unwrap();

        let mut bytes = fs::read(&record.artifact_location).unwrap();
        let mid = bytes.len() / 2;
        bytes[mid] ^= 0x55;
        fs::write(&record.artifact_location, &bytes).unwrap();

        let before = fs::read(&db).unwrap();
        let err = engine.restore_backup(&record, None).unwrap_err();
        assert!(matches!(err, BackstopError::ChecksumMismatch { .. }));
        assert_eq!(fs::read(&db).unwrap(), before);

        let stray: Vec<_> = fs::read_dir(dir.path())
            .unwrap()
            .map(|e| e.unwrap().file_name().into_string().unwrap())
            .filter(|n| n.starts_with(RESTORE_STAGING_PREFIX))
            .collect();
        assert!(stray.is_empty());
    }

    #[test]
    fn test_deleted_backup_cannot_be_restored() {
        let dir = TempDir::new().unwrap();
        let (engine, _) = setup(&dir);
        let first = engine
            .create_backup(BackupKind::Full, Compression::Gzip, RetentionTier::Daily)
            .unwrap();
        engine
            .create_backup(BackupKind::Full, Compression::Gzip, RetentionTier::Daily)
            .unwrap();
        engine.delete_backup(&first.id).unwrap();

        let err = engine.restore_backup(&first, None).unwrap_err();
        assert!(matches!(err, BackstopError::BackupNotFound(_)));
    }
}
