/*!
Consistent snapshots of the live database.

The engine never byte-copies a database file that may be changing under it.
It asks a [`SnapshotSource`] for a stream that reflects one instant, and the
source decides how to get there. [`SqliteSnapshotSource`] uses SQLite's
online backup API into a staging file, copying every page in a single step
under one read transaction so concurrent writers cannot tear the copy.
*/

use std::fs::File;
use std::io::{self, BufReader, ErrorKind, Read};
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use rusqlite::backup::{Backup, StepResult};
use rusqlite::{Connection, OpenFlags};
use tempfile::NamedTempFile;
use tracing::{debug, warn};

use crate::{BackstopError, Result};

/// First 16 bytes of every SQLite 3 database file
const SQLITE_HEADER: &[u8; 16] = b"SQLite format 3\0";

/// Capability the host application provides for reading its database
pub trait SnapshotSource: Send + Sync {
    /// Open a readable stream holding a self-consistent image of the
    /// database, waiting at most `timeout` for a consistency point.
    fn open_consistent_snapshot(
        &self,
        source_descriptor: &str,
        timeout: Duration,
    ) -> Result<Box<dyn Read + Send>>;

    /// Whether `path` holds a database this source manages. Used to decide
    /// if a restore target deserves a safety backup.
    fn is_managed_database(&self, path: &Path) -> bool;

    /// Structural check on a staged restore before it replaces the target
    fn validate_restored(&self, _staged: &Path) -> Result<()> {
        Ok(())
    }

    /// Housekeeping after the restored file has been swapped into place
    fn finalize_restore(&self, _target: &Path) {}
}

/// Turn a source descriptor (`/data/app.db`, `sqlite:/data/app.db`,
/// `sqlite:///data/app.db?mode=rwc`) into a filesystem path
pub fn resolve_source_path(source_descriptor: &str) -> PathBuf {
    let without_scheme = source_descriptor
        .strip_prefix("sqlite://")
        .or_else(|| source_descriptor.strip_prefix("sqlite:"))
        .unwrap_or(source_descriptor);
    let without_query = without_scheme
        .split_once('?')
        .map_or(without_scheme, |(path, _)| path);
    PathBuf::from(without_query)
}

/// Snapshot source for SQLite databases
#[derive(Debug, Clone)]
pub struct SqliteSnapshotSource {
    /// Where staging copies are written; should share a filesystem with the
    /// backup directory
    staging_dir: PathBuf,
    /// Pages per backup step; -1 copies the whole database in one step
    pages_per_step: i32,
    /// Pause between attempts while the source is busy or locked
    retry_interval: Duration,
}

impl SqliteSnapshotSource {
    pub fn new() -> Self {
        Self {
            staging_dir: std::env::temp_dir(),
            pages_per_step: -1,
            retry_interval: Duration::from_millis(50),
        }
    }

    pub fn with_staging_dir<P: AsRef<Path>>(mut self, dir: P) -> Self {
        self.staging_dir = dir.as_ref().to_path_buf();
        self
    }

    pub fn with_pages_per_step(mut self, pages: i32) -> Self {
        self.pages_per_step = if pages == 0 { -1 } else { pages };
        self
    }

    pub fn with_retry_interval(mut self, interval: Duration) -> Self {
        self.retry_interval = interval;
        self
    }

    fn copy_to_staging(&self, source: &Path, staging: &Path, timeout: Duration) -> Result<()> {
        let deadline = Instant::now() + timeout;

        let src = Connection::open_with_flags(
            source,
            OpenFlags::SQLITE_OPEN_READ_ONLY | OpenFlags::SQLITE_OPEN_NO_MUTEX,
        )
        .map_err(|e| {
            BackstopError::source_unavailable(format!(
                "Failed to open source database {}: {e}",
                source.display()
            ))
        })?;
        src.busy_timeout(timeout).map_err(|e| {
            BackstopError::source_unavailable(format!("Failed to set busy timeout: {e}"))
        })?;

        let mut dest = Connection::open(staging)
            .map_err(|e| BackstopError::storage_write(staging, e))?;

        {
            let backup = Backup::new(&src, &mut dest).map_err(|e| {
                BackstopError::source_unavailable(format!("Failed to initialize backup: {e}"))
            })?;

            loop {
                let step = backup.step(self.pages_per_step).map_err(|e| {
                    BackstopError::source_unavailable(format!(
                        "Backup of {} failed: {e}",
                        source.display()
                    ))
                })?;

                match step {
                    StepResult::Done => break,
                    StepResult::More => continue,
                    _ => {
                        if Instant::now() >= deadline {
                            return Err(BackstopError::source_unavailable(format!(
                                "{} stayed locked for longer than {timeout:?}",
                                source.display()
                            )));
                        }
                        debug!(source = %source.display(), "Source busy, waiting for consistency point");
                        std::thread::sleep(self.retry_interval);
                    }
                }
            }
        }

        dest.close()
            .map_err(|(_, e)| BackstopError::storage_write(staging, e))?;
        Ok(())
    }
}

impl Default for SqliteSnapshotSource {
    fn default() -> Self {
        Self::new()
    }
}

impl SnapshotSource for SqliteSnapshotSource {
    fn open_consistent_snapshot(
        &self,
        source_descriptor: &str,
        timeout: Duration,
    ) -> Result<Box<dyn Read + Send>> {
        let source = resolve_source_path(source_descriptor);
        if !source.is_file() {
            return Err(BackstopError::source_unavailable(format!(
                "{} does not exist or is not a file",
                source.display()
            )));
        }

        std::fs::create_dir_all(&self.staging_dir)
            .map_err(|e| BackstopError::storage_write(&self.staging_dir, e))?;
        let staging = tempfile::Builder::new()
            .prefix(".snapshot-")
            .suffix(".db")
            .tempfile_in(&self.staging_dir)
            .map_err(|e| BackstopError::storage_write(&self.staging_dir, e))?;

        self.copy_to_staging(&source, staging.path(), timeout)?;

        let file = staging
            .reopen()
            .map_err(|e| BackstopError::storage_write(staging.path(), e))?;
        Ok(Box::new(StagedSnapshot {
            reader: BufReader::new(file),
            _staging: staging,
        }))
    }

    fn is_managed_database(&self, path: &Path) -> bool {
        let mut header = [0u8; 16];
        File::open(path)
            .and_then(|mut f| f.read_exact(&mut header))
            .map(|_| &header == SQLITE_HEADER)
            .unwrap_or(false)
    }

    fn validate_restored(&self, staged: &Path) -> Result<()> {
        let conn = Connection::open_with_flags(staged, OpenFlags::SQLITE_OPEN_READ_ONLY)
            .map_err(|e| BackstopError::validation(format!("Restored database unreadable: {e}")))?;
        let verdict: String = conn
            .query_row("PRAGMA quick_check", [], |row| row.get(0))
            .map_err(|e| BackstopError::validation(format!("quick_check failed: {e}")))?;
        if verdict != "ok" {
            return Err(BackstopError::validation(format!(
                "Restored database failed quick_check: {verdict}"
            )));
        }
        Ok(())
    }

    fn finalize_restore(&self, target: &Path) {
        for suffix in ["-wal", "-shm"] {
            let mut sidecar = target.as_os_str().to_os_string();
            sidecar.push(suffix);
            match std::fs::remove_file(&sidecar) {
                Ok(()) => debug!(file = ?sidecar, "Removed stale journal sidecar"),
                Err(e) if e.kind() == ErrorKind::NotFound => {}
                Err(e) => warn!(file = ?sidecar, error = %e, "Failed to remove journal sidecar"),
            }
        }
    }
}

/// Reader over a staging copy; the staging file is deleted when dropped
struct StagedSnapshot {
    reader: BufReader<File>,
    _staging: NamedTempFile,
}

impl Read for StagedSnapshot {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.reader.read(buf)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn create_db(path: &Path) {
        let conn = Connection::open(path).unwrap();
        conn.execute_batch(
            "CREATE TABLE items (id INTEGER PRIMARY KEY, name TEXT);
             INSERT INTO items (name) VALUES ('one'), ('two');",
        )
        .unwrap();
    }

    #[test]
    fn test_resolve_source_path() {
        assert_eq!(resolve_source_path("/data/app.db"), PathBuf::from("/data/app.db"));
        assert_eq!(resolve_source_path("sqlite:/data/app.db"), PathBuf::from("/data/app.db"));
        assert_eq!(
            resolve_source_path("sqlite:///data/app.db?mode=rwc"),
            PathBuf::from("/data/app.db")
        );
    }

    #[test]
    fn test_snapshot_is_a_readable_database() {
        let dir = TempDir::new().unwrap();
        let db = dir.path().join("app.db");
        create_db(&db);

        let source = SqliteSnapshotSource::new().with_staging_dir(dir.path().join("staging"));
        let mut stream = source
            .open_consistent_snapshot(db.to_str().unwrap(), Duration::from_secs(5))
            .unwrap();
        let copy = dir.path().join("copy.db");
        let mut out = File::create(&copy).unwrap();
        io::copy(&mut stream, &mut out).unwrap();
        drop(stream);

        assert!(source.is_managed_database(&copy));
        let conn = Connection::open(&copy).unwrap();
        let count: i64 = conn
            .query_row("SELECT COUNT(*) FROM items", [], |r| r.get(0))
            .unwrap();
        assert_eq!(count, 2);

        // staging copy is cleaned up once the stream is dropped
        let leftovers = std::fs::read_dir(dir.path().join("staging")).unwrap().count();
        assert_eq!(leftovers, 0);
    }

    #[test]
    fn test_missing_source_is_unavailable() {
        let dir = TempDir::new().unwrap();
        let source = SqliteSnapshotSource::new().with_staging_dir(dir.path());
        let err = source
            .open_consistent_snapshot(
                dir.path().join("missing.db").to_str().unwrap(),
                Duration::from_secs(1),
            )
            .err()
            .unwrap();
        assert!(matches!(err, BackstopError::SourceUnavailable(_)));
    }

    #[test]
    fn test_locked_source_times_out() {
        let dir = TempDir::new().unwrap();
        let db = dir.path().join("app.db");
        create_db(&db);

        // an exclusive writer holds the database for the duration of the snapshot attempt
        let writer = Connection::open(&db).unwrap();
        writer.execute_batch("BEGIN EXCLUSIVE; INSERT INTO items (name) VALUES ('three');").unwrap();

        let source = SqliteSnapshotSource::new()
            .with_staging_dir(dir.path())
            .with_retry_interval(Duration::from_millis(10));
        let started = Instant::now();
        let result = source.open_consistent_snapshot(db.to_str().unwrap(), Duration::from_millis(200));

        assert!(matches!(result, Err(BackstopError::SourceUnavailable(_))));
        assert!(started.elapsed() < Duration::from_secs(5));
        writer.execute_batch("ROLLBACK;").unwrap();
    }

    #[test]
    fn test_is_managed_database() {
        let dir = TempDir::new().unwrap();
        let db = dir.path().join("app.db");
        create_db(&db);
        let text = dir.path().join("notes.txt");
        std::fs::write(&text, "hello").unwrap();

        let source = SqliteSnapshotSource::new();
        assert!(source.is_managed_database(&db));
        assert!(!source.is_managed_database(&text));
        assert!(!source.is_managed_database(&dir.path().join("absent.db")));
    }

    #[test]
    fn test_validate_restored_rejects_garbage() {
        let dir = TempDir::new().unwrap();
        let junk = dir.path().join("junk.db");
        std::fs::write(&junk, vec![0x42u8; 4096]).unwrap();
        let source = SqliteSnapshotSource::new();
        assert!(source.validate_restored(&junk).is_err());

        let db = dir.path().join("app.db");
        create_db(&db);
        assert!(source.validate_restored(&db).is_ok());
    }
}
