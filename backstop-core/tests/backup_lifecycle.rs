/*!
End-to-end tests for the backup engine.

These drive real SQLite databases through creation, verification, restore,
retention and scheduling, and check the engine's guarantees from the outside.
*/

use std::collections::{BTreeMap, HashSet};
use std::fs::{self, OpenOptions};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use backstop_core::{
    BackstopError, BackupEngine, BackupKind, BackupScheduler, BackupStatus, Compression,
    DirectoryStore, EngineConfig, RetentionPolicy, RetentionTier, Schedule, SchedulerConfig,
    TierAssignment, TriggerOutcome,
};
use chrono::{TimeZone, Utc};
use rayon::prelude::*;
use rusqlite::{Connection, TransactionBehavior};
use tempfile::TempDir;

fn create_db(path: &Path, rows: &[(&str, i64)]) {
    let conn = Connection::open(path).unwrap();
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS accounts (id INTEGER PRIMARY KEY, owner TEXT NOT NULL, balance INTEGER NOT NULL);",
    )
    .unwrap();
    for (owner, balance) in rows {
        conn.execute(
            "INSERT INTO accounts (owner, balance) VALUES (?1, ?2)",
            rusqlite::params![owner, balance],
        )
        .unwrap();
    }
}

fn accounts(path: &Path) -> Vec<(String, i64)> {
    let conn = Connection::open(path).unwrap();
    let mut stmt = conn
        .prepare("SELECT owner, balance FROM accounts ORDER BY id")
        .unwrap();
    stmt.query_map([], |row| Ok((row.get(0)?, row.get(1)?)))
        .unwrap()
        .collect::<Result<_, _>>()
        .unwrap()
}

fn open_engine(db: &Path, backups: &Path) -> BackupEngine {
    BackupEngine::open(EngineConfig::new(db.to_str().unwrap(), backups)).unwrap()
}

/// Path -> contents of every file under `root`
fn snapshot_tree(root: &Path) -> BTreeMap<PathBuf, Vec<u8>> {
    let mut files = BTreeMap::new();
    let mut pending = vec![root.to_path_buf()];
    while let Some(dir) = pending.pop() {
        for entry in fs::read_dir(&dir).unwrap() {
            let path = entry.unwrap().path();
            if path.is_dir() {
                pending.push(path);
            } else {
                files.insert(path.clone(), fs::read(&path).unwrap());
            }
        }
    }
    files
}

#[test]
fn test_gzip_backup_of_small_table() {
    let dir = TempDir::new().unwrap();
    let db = dir.path().join("bank.db");
    create_db(&db, &[("alice", 100), ("bob", 250)]);
    let engine = open_engine(&db, &dir.path().join("backups"));

    let record = engine
        .create_backup(BackupKind::Full, Compression::Gzip, RetentionTier::Daily)
        .unwrap();

    assert!(record.size_bytes > 0);
    assert_eq!(record.checksum.len(), 64);
    assert!(record.checksum.chars().all(|c| c.is_ascii_hexdigit()));
    assert_eq!(record.status, BackupStatus::Active);
    assert!(engine.verify_backup(&record).unwrap());
}

#[test]
fn test_every_new_backup_verifies() {
    let dir = TempDir::new().unwrap();
    let db = dir.path().join("bank.db");
    create_db(&db, &[("alice", 100)]);
    let engine = open_engine(&db, &dir.path().join("backups"));

    for compression in [Compression::None, Compression::Gzip, Compression::Zstd] {
        let record = engine
            .create_backup(BackupKind::Full, compression, RetentionTier::Daily)
            .unwrap();
        assert!(
            engine.verify_backup(&record).unwrap(),
            "{compression} backup failed verification"
        );
    }
}

#[test]
fn test_restore_round_trip_preserves_data() {
    let dir = TempDir::new().unwrap();
    let db = dir.path().join("bank.db");
    create_db(&db, &[("alice", 100), ("bob", 250), ("carol", 75)]);
    let engine = open_engine(&db, &dir.path().join("backups"));
    let original = engine
        .create_backup(BackupKind::Full, Compression::Zstd, RetentionTier::Daily)
        .unwrap();

    let restored = dir.path().join("restored").join("bank.db");
    engine.restore_backup(&original, Some(&restored)).unwrap();

    // back up the restored copy with its own engine and restore that again
    let second = open_engine(&restored, &dir.path().join("backups-restored"));
    let again = second
        .create_backup(BackupKind::Full, Compression::Gzip, RetentionTier::Daily)
        .unwrap();
    let final_copy = dir.path().join("final.db");
    second.restore_backup(&again, Some(&final_copy)).unwrap();

    assert_eq!(accounts(&restored), accounts(&db));
    assert_eq!(accounts(&final_copy), accounts(&db));
}

#[test]
fn test_restore_of_unknown_id_touches_nothing() {
    let dir = TempDir::new().unwrap();
    let db = dir.path().join("bank.db");
    create_db(&db, &[("alice", 100)]);
    let engine = open_engine(&db, &dir.path().join("backups"));
    engine
        .create_backup(BackupKind::Full, Compression::Gzip, RetentionTier::Daily)
        .unwrap();

    let before = snapshot_tree(dir.path());
    let err = engine
        .restore_backup("full-20240101T000000Z-00000000", None)
        .unwrap_err();
    assert!(matches!(err, BackstopError::BackupNotFound(_)));
    assert_eq!(snapshot_tree(dir.path()), before);
}

#[test]
fn test_truncated_artifact_fails_verification_quietly() {
    let dir = TempDir::new().unwrap();
    let db = dir.path().join("bank.db");
    create_db(&db, &[("alice", 100), ("bob", 250)]);
    let engine = open_engine(&db, &dir.path().join("backups"));
    let record = engine
        .create_backup(BackupKind::Full, Compression::Gzip, RetentionTier::Daily)
        .unwrap();

    let artifact = OpenOptions::new()
        .write(true)
        .open(&record.artifact_location)
        .unwrap();
    artifact.set_len(record.size_bytes / 2).unwrap();

    assert!(!engine.verify_backup(&record).unwrap());
    assert!(engine.get_backup(&record.id).unwrap().verified_at.is_none());

    // and a restore refuses to use it
    let target = dir.path().join("copy.db");
    let err = engine.restore_backup(&record, Some(&target)).unwrap_err();
    assert!(matches!(err, BackstopError::ChecksumMismatch { .. }));
    assert!(!target.exists());
}

#[test]
fn test_snapshots_stay_consistent_under_concurrent_writes() {
    let dir = TempDir::new().unwrap();
    let db = dir.path().join("ledger.db");
    {
        let conn = Connection::open(&db).unwrap();
        let mode: String = conn
            .query_row("PRAGMA journal_mode = WAL", [], |row| row.get(0))
            .unwrap();
        assert_eq!(mode, "wal");
        conn.execute_batch(
            "CREATE TABLE ledger (id INTEGER PRIMARY KEY, amount INTEGER NOT NULL);
             INSERT INTO ledger (amount) VALUES (1000);",
        )
        .unwrap();
    }
    let engine = open_engine(&db, &dir.path().join("backups"));

    // every transfer moves 5 out of the reserve row, so the total stays 1000
    let stop = Arc::new(AtomicBool::new(false));
    let commits = Arc::new(AtomicUsize::new(0));
    let writer = {
        let stop = Arc::clone(&stop);
        let commits = Arc::clone(&commits);
        let db = db.clone();
        thread::spawn(move || {
            let mut conn = Connection::open(&db).unwrap();
            conn.busy_timeout(Duration::from_secs(5)).unwrap();
            while !stop.load(Ordering::SeqCst) {
                let tx = conn
                    .transaction_with_behavior(TransactionBehavior::Immediate)
                    .unwrap();
                tx.execute("INSERT INTO ledger (amount) VALUES (5)", []).unwrap();
                tx.execute("UPDATE ledger SET amount = amount - 5 WHERE id = 1", [])
                    .unwrap();
                tx.commit().unwrap();
                commits.fetch_add(1, Ordering::SeqCst);
            }
        })
    };
    while commits.load(Ordering::SeqCst) == 0 {
        assert!(!writer.is_finished(), "writer stopped before its first commit");
        thread::yield_now();
    }

    let mut row_counts = Vec::new();
    for i in 0..10 {
        let record = engine
            .create_backup(BackupKind::Full, Compression::Zstd, RetentionTier::Daily)
            .unwrap();
        let target = dir.path().join("restored").join(format!("copy-{i}.db"));
        engine.restore_backup(&record, Some(&target)).unwrap();

        let conn = Connection::open(&target).unwrap();
        let check: String = conn
            .query_row("PRAGMA quick_check", [], |row| row.get(0))
            .unwrap();
        assert_eq!(check, "ok");
        let (rows, total): (i64, i64) = conn
            .query_row("SELECT COUNT(*), SUM(amount) FROM ledger", [], |row| {
                Ok((row.get(0)?, row.get(1)?))
            })
            .unwrap();
        assert_eq!(total, 1000, "copy {i} caught a transfer half-applied");
        row_counts.push(rows);
    }

    stop.store(true, Ordering::SeqCst);
    writer.join().unwrap();
    let total_commits = commits.load(Ordering::SeqCst);
    assert!(row_counts.iter().all(|&rows| rows as usize <= total_commits + 1));
    // snapshots never go back in time
    assert!(row_counts.windows(2).all(|w| w[0] <= w[1]));
}

#[test]
fn test_rapid_creation_yields_unique_ids() {
    let dir = TempDir::new().unwrap();
    let db = dir.path().join("bank.db");
    create_db(&db, &[("alice", 100)]);
    let engine = open_engine(&db, &dir.path().join("backups"));

    let ids: HashSet<String> = (0..100)
        .map(|_| {
            engine
                .create_backup(BackupKind::Full, Compression::None, RetentionTier::Daily)
                .unwrap()
                .id
        })
        .collect();

    assert_eq!(ids.len(), 100);
    assert_eq!(engine.list_backups().len(), 100);
}

#[test]
fn test_catalog_survives_restart() {
    let dir = TempDir::new().unwrap();
    let db = dir.path().join("bank.db");
    let backups = dir.path().join("backups");
    create_db(&db, &[("alice", 100)]);

    let before = {
        let engine = open_engine(&db, &backups);
        let first = engine
            .create_backup(BackupKind::Full, Compression::Gzip, RetentionTier::Monthly)
            .unwrap();
        engine
            .create_backup(BackupKind::Full, Compression::Zstd, RetentionTier::Daily)
            .unwrap();
        engine.verify_backup(&first).unwrap();
        engine.delete_backup(&first.id).unwrap();
        engine.list_backups()
    };

    let reopened = open_engine(&db, &backups);
    assert_eq!(reopened.list_backups(), before);
}

#[test]
fn test_decisions_see_writes_from_other_instances() {
    let dir = TempDir::new().unwrap();
    let db = dir.path().join("bank.db");
    let backups = dir.path().join("backups");
    create_db(&db, &[("alice", 100)]);
    let first = open_engine(&db, &backups);
    let older = first
        .create_backup(BackupKind::Full, Compression::Gzip, RetentionTier::Daily)
        .unwrap();
    let newer = first
        .create_backup(BackupKind::Full, Compression::Gzip, RetentionTier::Daily)
        .unwrap();

    let mirror = dir.path().join("mirror");
    let second = BackupEngine::builder(EngineConfig::new(db.to_str().unwrap(), &backups))
        .with_remote(Arc::new(DirectoryStore::new(&mirror)))
        .build()
        .unwrap();
    assert_eq!(second.list_active_backups().len(), 2);

    // the first instance leaves only one Active backup behind
    assert!(first.delete_backup(&older.id).unwrap());
    let err = second.delete_backup(&newer.id).unwrap_err();
    assert!(matches!(err, BackstopError::RetentionViolation(_)));
    assert!(newer.artifact_location.exists());

    // a backup the second instance has never seen can still be replicated
    let latest = first
        .create_backup(BackupKind::Full, Compression::Zstd, RetentionTier::Daily)
        .unwrap();
    let copy = second.replicate(&latest.id, "directory").unwrap();
    assert!(mirror.join(format!("{}.db.zst", latest.id)).exists());
    assert_eq!(first.catalog().get_fresh(&latest.id).unwrap().unwrap().remote_copies, vec![copy]);
}

#[test]
fn test_retention_keeps_two_newest_daily() {
    let dir = TempDir::new().unwrap();
    let db = dir.path().join("bank.db");
    create_db(&db, &[("alice", 100)]);
    let engine = open_engine(&db, &dir.path().join("backups"));

    let created: Vec<_> = (0..5)
        .map(|_| {
            engine
                .create_backup(BackupKind::Full, Compression::Gzip, RetentionTier::Daily)
                .unwrap()
        })
        .collect();

    let deleted = engine
        .enforce_retention(&RetentionPolicy::new(2, 0, 0))
        .unwrap();
    assert_eq!(deleted, 3);

    let active: Vec<String> = engine
        .list_active_backups()
        .into_iter()
        .map(|r| r.id)
        .collect();
    assert_eq!(active, vec![created[3].id.clone(), created[4].id.clone()]);
    for record in &created[..3] {
        assert!(!record.artifact_location.exists());
    }
    assert!(engine.find_orphaned_artifacts().unwrap().is_empty());
}

#[test]
fn test_retention_never_empties_the_catalog() {
    let dir = TempDir::new().unwrap();
    let db = dir.path().join("bank.db");
    create_db(&db, &[("alice", 100)]);
    let engine = open_engine(&db, &dir.path().join("backups"));
    let only = engine
        .create_backup(BackupKind::Full, Compression::Gzip, RetentionTier::Weekly)
        .unwrap();

    let deleted = engine
        .enforce_retention(&RetentionPolicy::new(0, 0, 0))
        .unwrap();
    assert_eq!(deleted, 0);
    assert_eq!(engine.list_active_backups(), vec![only.clone()]);
    assert!(only.artifact_location.exists());
}

#[test]
fn test_reclassify_applies_calendar_rule() {
    let dir = TempDir::new().unwrap();
    let db = dir.path().join("bank.db");
    create_db(&db, &[("alice", 100)]);
    let engine = open_engine(&db, &dir.path().join("backups"));
    let created: Vec<_> = (0..3)
        .map(|_| {
            engine
                .create_backup(BackupKind::Full, Compression::None, RetentionTier::Daily)
                .unwrap()
        })
        .collect();

    // Sunday closing ISO week 22, then Monday and Tuesday of week 23
    let pinned = [
        Utc.with_ymd_and_hms(2025, 6, 1, 2, 0, 0).unwrap(),
        Utc.with_ymd_and_hms(2025, 6, 2, 2, 0, 0).unwrap(),
        Utc.with_ymd_and_hms(2025, 6, 3, 2, 0, 0).unwrap(),
    ];
    for (record, at) in created.iter().zip(pinned) {
        engine
            .catalog()
            .update_with(&record.id, |stored| {
                stored.created_at = at;
                Ok(())
            })
            .unwrap();
    }

    assert_eq!(engine.reclassify_tiers().unwrap(), 2);
    let tiers: Vec<_> = engine
        .list_active_backups()
        .iter()
        .map(|r| r.retention_tier)
        .collect();
    assert_eq!(
        tiers,
        vec![RetentionTier::Monthly, RetentionTier::Weekly, RetentionTier::Daily]
    );
    assert_eq!(engine.reclassify_tiers().unwrap(), 0);
}

#[test]
fn test_concurrent_readers_see_consistent_catalog() {
    let dir = TempDir::new().unwrap();
    let db = dir.path().join("bank.db");
    create_db(&db, &[("alice", 100), ("bob", 250)]);
    let engine = Arc::new(open_engine(&db, &dir.path().join("backups")));
    let records: Vec<_> = (0..4)
        .map(|_| {
            engine
                .create_backup(BackupKind::Full, Compression::Zstd, RetentionTier::Daily)
                .unwrap()
        })
        .collect();

    let results: Vec<bool> = records
        .par_iter()
        .map(|record| {
            let listed = engine.list_active_backups();
            assert!(listed.iter().any(|r| r.id == record.id));
            engine.verify_backup(record).unwrap()
        })
        .collect();

    assert!(results.into_iter().all(|passed| passed));
    assert!(engine
        .list_active_backups()
        .iter()
        .all(|r| r.verified_at.is_some()));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_scheduled_run_replicates_and_prunes() {
    let dir = TempDir::new().unwrap();
    let db = dir.path().join("bank.db");
    create_db(&db, &[("alice", 100)]);
    let mirror = dir.path().join("mirror");
    let engine = Arc::new(
        BackupEngine::builder(EngineConfig::new(db.to_str().unwrap(), dir.path().join("backups")))
            .with_remote(Arc::new(DirectoryStore::new(&mirror)))
            .build()
            .unwrap(),
    );
    let scheduler = BackupScheduler::new(
        Arc::clone(&engine),
        SchedulerConfig::new(Schedule::Daily { hour: 2, minute: 0 })
            .with_providers(["directory"])
            .with_tier(TierAssignment::Fixed(RetentionTier::Daily))
            .with_retention(RetentionPolicy::new(1, 0, 0)),
    )
    .unwrap();

    for _ in 0..2 {
        let TriggerOutcome::Completed(report) = scheduler.trigger().await else {
            panic!("sequential trigger was skipped");
        };
        assert!(report.is_success(), "run failed: {report:?}");
    }

    let active = engine.list_active_backups();
    assert_eq!(active.len(), 1);
    assert_eq!(active[0].remote_copies.len(), 1);
    assert!(mirror.join(format!("{}.json", active[0].id)).exists());
}
