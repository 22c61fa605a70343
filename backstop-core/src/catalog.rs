/*!
Durable catalog of backup records.

The catalog is a single pretty-printed JSON document next to the artifacts.
It is loaded fully into memory, and every mutation goes through
[`Catalog::mutate`]:

1. take the in-process writer mutex,
2. take the cross-process lock file (bounded wait, stale-lock takeover),
3. re-read the document so writes from other instances are not lost,
4. apply the change and write a new document atomically (temp + rename),
5. refresh the in-memory view and release both locks.

The in-memory view only changes after the document is durable, so a crash
can at worst leave an artifact with no catalog entry, never the reverse.
*/

use std::fs::{self, OpenOptions};
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};
use std::sync::{Mutex, RwLock};
use std::time::{Duration, Instant, SystemTime};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tempfile::NamedTempFile;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::record::{BackupRecord, BackupStatus};
use crate::{BackstopError, Result};

/// Current on-disk format version
pub const CATALOG_FORMAT_VERSION: u8 = 1;

/// Lock files older than this are assumed to belong to a crashed process
const STALE_LOCK_AGE: Duration = Duration::from_secs(60);
const LOCK_POLL_INTERVAL: Duration = Duration::from_millis(10);

#[derive(Serialize, Deserialize)]
struct CatalogDocument {
    format_version: u8,
    updated_at: DateTime<Utc>,
    records: Vec<BackupRecord>,
}

/// In-memory index over the durable catalog document
#[derive(Debug)]
pub struct Catalog {
    path: PathBuf,
    lock_path: PathBuf,
    lock_timeout: Duration,
    records: RwLock<Vec<BackupRecord>>,
    writer: Mutex<()>,
}

impl Catalog {
    /// Open (and load) the catalog stored at `path`, creating its directory
    /// if needed. A missing or empty file yields an empty catalog.
    pub fn open<P: AsRef<Path>>(path: P, lock_timeout: Duration) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent).map_err(|e| {
                BackstopError::catalog(format!(
                    "Failed to create catalog directory {}: {e}",
                    parent.display()
                ))
            })?;
        }

        let mut lock_name = path.file_name().unwrap_or_default().to_os_string();
        lock_name.push(".lock");
        let lock_path = path.with_file_name(lock_name);

        let catalog = Self {
            path,
            lock_path,
            lock_timeout,
            records: RwLock::new(Vec::new()),
            writer: Mutex::new(()),
        };
        catalog.load()?;
        Ok(catalog)
    }

    /// Location of the catalog document
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Re-read the document from disk, replacing the in-memory view
    pub fn load(&self) -> Result<Vec<BackupRecord>> {
        let records = self.read_document()?;
        debug!(path = %self.path.display(), records = records.len(), "Loaded catalog");
        *self.records.write().unwrap_or_else(|e| e.into_inner()) = records.clone();
        Ok(records)
    }

    /// All records, oldest first
    pub fn list(&self) -> Vec<BackupRecord> {
        self.records.read().unwrap_or_else(|e| e.into_inner()).clone()
    }

    /// Active records, oldest first
    pub fn active(&self) -> Vec<BackupRecord> {
        self.records
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .iter()
            .filter(|r| r.is_active())
            .cloned()
            .collect()
    }

    pub fn get(&self, id: &str) -> Option<BackupRecord> {
        self.records
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .iter()
            .find(|r| r.id == id)
            .cloned()
    }

    /// Reload from disk, then look up `id`
    ///
    /// Use before decisions that must see writes from other instances.
    pub fn get_fresh(&self, id: &str) -> Result<Option<BackupRecord>> {
        Ok(self.load()?.into_iter().find(|r| r.id == id))
    }

    /// Add a new record; identifiers must be unique across the whole history
    pub fn append(&self, record: BackupRecord) -> Result<()> {
        record.validate()?;
        self.mutate(|records| {
            if records.iter().any(|r| r.id == record.id) {
                return Err(BackstopError::catalog(format!(
                    "duplicate backup id {}",
                    record.id
                )));
            }
            records.push(record);
            Ok(())
        })
    }

    /// Replace the stored record with the same id
    pub fn update(&self, record: BackupRecord) -> Result<()> {
        record.validate()?;
        self.update_with(&record.id.clone(), move |stored| {
            *stored = record;
            Ok(())
        })
        .map(|_| ())
    }

    /// Apply `f` to the freshest stored copy of a record and persist it
    pub fn update_with<F>(&self, id: &str, f: F) -> Result<BackupRecord>
    where
        F: FnOnce(&mut BackupRecord) -> Result<()>,
    {
        self.mutate(|records| {
            let stored = records
                .iter_mut()
                .find(|r| r.id == id)
                .ok_or_else(|| BackstopError::BackupNotFound(id.to_string()))?;
            f(stored)?;
            Ok(stored.clone())
        })
    }

    /// Mark a record Deleted. The caller must already have removed the artifact.
    pub fn mark_deleted(&self, id: &str) -> Result<BackupRecord> {
        self.update_with(id, |record| {
            record.status = BackupStatus::Deleted;
            Ok(())
        })
    }

    /// Purge a record from the catalog entirely
    pub fn remove(&self, id: &str) -> Result<Option<BackupRecord>> {
        self.mutate(|records| {
            Ok(records
                .iter()
                .position(|r| r.id == id)
                .map(|index| records.remove(index)))
        })
    }

    /// The single write path: lock, reload, apply, persist, refresh
    pub fn mutate<T, F>(&self, f: F) -> Result<T>
    where
        F: FnOnce(&mut Vec<BackupRecord>) -> Result<T>,
    {
        let _writer = self
            .writer
            .lock()
            .map_err(|_| BackstopError::catalog("catalog writer lock poisoned"))?;
        let _file_lock = CatalogLock::acquire(&self.lock_path, self.lock_timeout)?;

        let mut records = self.read_document()?;
        let result = f(&mut records)?;
        sort_records(&mut records);
        self.write_document(&records)?;

        *self.records.write().unwrap_or_else(|e| e.into_inner()) = records;
        Ok(result)
    }

    fn read_document(&self) -> Result<Vec<BackupRecord>> {
        let contents = match fs::read_to_string(&self.path) {
            Ok(contents) => contents,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => {
                return Err(BackstopError::catalog(format!(
                    "Failed to read catalog {}: {e}",
                    self.path.display()
                )))
            }
        };
        if contents.trim().is_empty() {
            return Ok(Vec::new());
        }

        let document: CatalogDocument = serde_json::from_str(&contents)?;
        if document.format_version > CATALOG_FORMAT_VERSION {
            return Err(BackstopError::catalog(format!(
                "Unsupported catalog format version {} (current: {CATALOG_FORMAT_VERSION})",
                document.format_version
            )));
        }
        let mut records = document.records;
        sort_records(&mut records);
        Ok(records)
    }

    fn write_document(&self, records: &[BackupRecord]) -> Result<()> {
        let document = CatalogDocument {
            format_version: CATALOG_FORMAT_VERSION,
            updated_at: Utc::now(),
            records: records.to_vec(),
        };
        let dir = self
            .path
            .parent()
            .filter(|p| !p.as_os_str().is_empty())
            .unwrap_or_else(|| Path::new("."));

        let write = || -> std::io::Result<()> {
            let mut tmp = NamedTempFile::new_in(dir)?;
            serde_json::to_writer_pretty(&mut tmp, &document)?;
            tmp.write_all(b"\n")?;
            tmp.as_file().sync_all()?;
            tmp.persist(&self.path).map_err(|e| e.error)?;
            Ok(())
        };
        write().map_err(|e| {
            BackstopError::catalog(format!(
                "Failed to write catalog {}: {e}",
                self.path.display()
            ))
        })
    }
}

fn sort_records(records: &mut [BackupRecord]) {
    records.sort_by(|a, b| a.sort_key().cmp(&b.sort_key()));
}

/// Exclusive lock file guarding the catalog document across processes
///
/// The file holds an owner token; only the owner removes it on release.
struct CatalogLock {
    path: PathBuf,
    token: String,
}

impl CatalogLock {
    fn acquire(path: &Path, timeout: Duration) -> Result<Self> {
        let token = format!("{}:{}", std::process::id(), Uuid::new_v4().simple());
        let started = Instant::now();
        loop {
            match OpenOptions::new().write(true).create_new(true).open(path) {
                Ok(mut file) => {
                    if let Err(e) = writeln!(file, "{token}").and_then(|_| file.sync_all()) {
                        if let Err(cleanup) = fs::remove_file(path) {
                            warn!(lock = %path.display(), error = %cleanup, "Failed to remove unwritten catalog lock");
                        }
                        return Err(BackstopError::catalog(format!(
                            "Failed to write catalog lock {}: {e}",
                            path.display()
                        )));
                    }
                    return Ok(Self {
                        path: path.to_path_buf(),
                        token,
                    });
                }
                Err(e) if e.kind() == ErrorKind::AlreadyExists => {
                    if is_stale(path) && break_stale_lock(path) {
                        continue;
                    }
                    if started.elapsed() >= timeout {
                        return Err(BackstopError::catalog(format!(
                            "Timed out after {timeout:?} waiting for catalog lock {}",
                            path.display()
                        )));
                    }
                    std::thread::sleep(LOCK_POLL_INTERVAL);
                }
                Err(e) => {
                    return Err(BackstopError::catalog(format!(
                        "Failed to create catalog lock {}: {e}",
                        path.display()
                    )))
                }
            }
        }
    }
}

impl Drop for CatalogLock {
    fn drop(&mut self) {
        match fs::read_to_string(&self.path) {
            Ok(owner) if owner.trim() == self.token => {
                if let Err(e) = fs::remove_file(&self.path) {
                    warn!(lock = %self.path.display(), error = %e, "Failed to release catalog lock");
                }
            }
            Ok(_) => warn!(lock = %self.path.display(), "Catalog lock was taken over; leaving it in place"),
            Err(e) => warn!(lock = %self.path.display(), error = %e, "Failed to read catalog lock on release"),
        }
    }
}

fn is_stale(path: &Path) -> bool {
    fs::metadata(path)
        .and_then(|m| m.modified())
        .ok()
        .and_then(|modified| SystemTime::now().duration_since(modified).ok())
        .map_or(false, |age| age > STALE_LOCK_AGE)
}

/// Move a stale lock aside and discard it.
///
/// Another waiter may have replaced the stale file with a live lock between
/// the staleness check and the rename. The moved file keeps its mtime, so it
/// is re-checked and a live lock is linked back into place.
fn break_stale_lock(path: &Path) -> bool {
    let mut aside_name = path.file_name().unwrap_or_default().to_os_string();
    aside_name.push(format!(".stale-{}", Uuid::new_v4().simple()));
    let aside = path.with_file_name(aside_name);

    if fs::rename(path, &aside).is_err() {
        // released or already taken over
        return false;
    }
    if is_stale(&aside) {
        warn!(lock = %path.display(), "Removed stale catalog lock");
        if let Err(e) = fs::remove_file(&aside) {
            warn!(lock = %aside.display(), error = %e, "Failed to remove stale catalog lock");
        }
        return true;
    }

    if let Err(e) = fs::hard_link(&aside, path) {
        warn!(lock = %path.display(), error = %e, "Failed to restore live catalog lock");
    }
    if let Err(e) = fs::remove_file(&aside) {
        warn!(lock = %aside.display(), error = %e, "Failed to remove moved catalog lock");
    }
    false
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::compression::Compression;
    use crate::record::{BackupKind, RetentionTier};
    use chrono::{Duration as ChronoDuration, TimeZone};
    use std::sync::Arc;
    use tempfile::TempDir;

    fn record(id: &str, minutes: i64) -> BackupRecord {
        BackupRecord {
            id: id.to_string(),
            backup_kind: BackupKind::Full,
            compression: Compression::None,
            source_descriptor: "/data/app.db".to_string(),
            artifact_location: PathBuf::from(format!("/backups/{id}.db")),
            size_bytes: 10,
            checksum: "0".repeat(64),
            retention_tier: RetentionTier::Daily,
            created_at: Utc.with_ymd_and_hms(2025, 1, 1, 0, 0, 0).unwrap()
                + ChronoDuration::minutes(minutes),
            verified_at: None,
            remote_copies: Vec::new(),
            status: BackupStatus::Active,
        }
    }

    fn open(dir: &TempDir) -> Catalog {
        Catalog::open(dir.path().join("catalog.json"), Duration::from_secs(2)).unwrap()
    }

    #[test]
    fn test_missing_catalog_is_empty() {
        let dir = TempDir::new().unwrap();
        let catalog = open(&dir);
        assert!(catalog.list().is_empty());
        assert!(!catalog.path().exists());
    }

    #[test]
    fn test_empty_file_is_empty_catalog() {
        let dir = TempDir::new().unwrap();
        fs::write(dir.path().join("catalog.json"), "").unwrap();
        let catalog = open(&dir);
        assert!(catalog.list().is_empty());
    }

    #[test]
    fn test_append_get_and_order() {
        let dir = TempDir::new().unwrap();
        let catalog = open(&dir);

        catalog.append(record("b", 5)).unwrap();
        catalog.append(record("a", 1)).unwrap();
        catalog.append(record("c", 5)).unwrap();

        let ids: Vec<_> = catalog.list().into_iter().map(|r| r.id).collect();
        assert_eq!(ids, vec!["a", "b", "c"]);
        assert_eq!(catalog.get("b").unwrap().id, "b");
        assert!(catalog.get("zzz").is_none());
    }

    #[test]
    fn test_duplicate_id_rejected() {
        let dir = TempDir::new().unwrap();
        let catalog = open(&dir);
        catalog.append(record("a", 1)).unwrap();
        assert!(catalog.append(record("a", 2)).is_err());
        assert_eq!(catalog.list().len(), 1);
    }

    #[test]
    fn test_persistence_across_instances() {
        let dir = TempDir::new().unwrap();
        let first = open(&dir);
        first.append(record("a", 1)).unwrap();
        first.append(record("b", 2)).unwrap();
        first.mark_deleted("a").unwrap();

        let second = open(&dir);
        assert_eq!(first.list(), second.list());
        assert_eq!(second.active().len(), 1);
    }

    #[test]
    fn test_writes_from_other_instance_are_merged() {
        let dir = TempDir::new().unwrap();
        let first = open(&dir);
        let second = open(&dir);

        first.append(record("a", 1)).unwrap();
        second.append(record("b", 2)).unwrap();

        // the second writer re-read the document before applying its change
        assert_eq!(second.list().len(), 2);
        first.load().unwrap();
        assert_eq!(first.list().len(), 2);
    }

    #[test]
    fn test_update_unknown_record() {
        let dir = TempDir::new().unwrap();
        let catalog = open(&dir);
        let err = catalog.update(record("ghost", 1)).unwrap_err();
        assert!(matches!(err, BackstopError::BackupNotFound(_)));
    }

    #[test]
    fn test_update_with_and_remove() {
        let dir = TempDir::new().unwrap();
        let catalog = open(&dir);
        catalog.append(record("a", 1)).unwrap();

        let verified_at = Utc::now();
        let updated = catalog
            .update_with("a", |r| {
                r.verified_at = Some(verified_at);
                Ok(())
            })
            .unwrap();
        assert_eq!(updated.verified_at, Some(verified_at));

        let removed = catalog.remove("a").unwrap();
        assert!(removed.is_some());
        assert!(catalog.list().is_empty());
        assert!(catalog.remove("a").unwrap().is_none());
    }

    #[test]
    fn test_failed_mutation_leaves_document_untouched() {
        let dir = TempDir::new().unwrap();
        let catalog = open(&dir);
        catalog.append(record("a", 1)).unwrap();
        let before = fs::read_to_string(catalog.path()).unwrap();

        let result: Result<()> = catalog.mutate(|records| {
            records.clear();
            Err(BackstopError::validation("abort"))
        });
        assert!(result.is_err());
        assert_eq!(fs::read_to_string(catalog.path()).unwrap(), before);
        assert_eq!(catalog.list().len(), 1);
    }

    #[test]
    fn test_lock_timeout_when_held() {
        let dir = TempDir::new().unwrap();
        let catalog = Catalog::open(dir.path().join("catalog.json"), Duration::from_millis(50)).unwrap();
        fs::write(dir.path().join("catalog.json.lock"), "12345").unwrap();

        let err = catalog.append(record("a", 1)).unwrap_err();
        assert!(err.to_string().contains("catalog lock"));
    }

    fn age(path: &Path, by: Duration) {
        fs::File::options()
            .write(true)
            .open(path)
            .unwrap()
            .set_modified(SystemTime::now() - by)
            .unwrap();
    }

    #[test]
    fn test_stale_lock_is_taken_over() {
        let dir = TempDir::new().unwrap();
        let lock = dir.path().join("catalog.json.lock");
        fs::write(&lock, "999999:crashed\n").unwrap();
        age(&lock, Duration::from_secs(120));

        let catalog = Catalog::open(dir.path().join("catalog.json"), Duration::from_millis(200)).unwrap();
        catalog.append(record("a", 1)).unwrap();

        assert!(!lock.exists());
        let leftovers: Vec<_> = fs::read_dir(dir.path())
            .unwrap()
            .map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
            .filter(|name| name.contains(".stale-"))
            .collect();
        assert!(leftovers.is_empty());
    }

    #[test]
    fn test_live_lock_survives_takeover_attempt() {
        let dir = TempDir::new().unwrap();
        let lock = dir.path().join("catalog.json.lock");
        let held = CatalogLock::acquire(&lock, Duration::from_millis(50)).unwrap();

        // a waiter that judged an earlier file stale must not discard this one
        assert!(!break_stale_lock(&lock));
        assert_eq!(fs::read_to_string(&lock).unwrap().trim(), held.token);

        let err = CatalogLock::acquire(&lock, Duration::from_millis(30)).err().unwrap();
        assert!(err.to_string().contains("Timed out"));

        drop(held);
        assert!(!lock.exists());
    }

    #[test]
    fn test_release_keeps_foreign_lock() {
        let dir = TempDir::new().unwrap();
        let lock = dir.path().join("catalog.json.lock");
        let held = CatalogLock::acquire(&lock, Duration::from_millis(50)).unwrap();
        fs::write(&lock, "4242:other-owner\n").unwrap();

        drop(held);
        assert_eq!(fs::read_to_string(&lock).unwrap(), "4242:other-owner\n");
    }

    #[test]
    fn test_concurrent_appends_are_serialized() {
        let dir = TempDir::new().unwrap();
        let catalog = Arc::new(open(&dir));

        let handles: Vec<_> = (0..8)
            .map(|i| {
                let catalog = Arc::clone(&catalog);
                std::thread::spawn(move || catalog.append(record(&format!("r{i}"), i)).unwrap())
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }

        assert_eq!(catalog.list().len(), 8);
        assert_eq!(open(&dir).list().len(), 8);
    }
}
