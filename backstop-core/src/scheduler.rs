/*!
Timer-driven backup runs.

Each trigger creates a backup, replicates it to the configured providers and
then enforces retention. Stage failures are logged and recorded in the
[`RunReport`]; they never stop later stages or later triggers. A trigger
that fires while the previous run is still going is skipped, not queued.
*/

use std::io;
use std::str::FromStr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use cron::Schedule as CronSchedule;
use serde::{Deserialize, Serialize};
use tokio::task::JoinError;
use tracing::{debug, error, info, warn};

use crate::compression::Compression;
use crate::config::RetentionPolicy;
use crate::engine::BackupEngine;
use crate::record::{BackupKind, RetentionTier};
use crate::{BackstopError, Result};

const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(1);

/// When scheduled runs fire
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Schedule {
    /// Cron expression with seconds, e.g. `"0 30 2 * * *"`
    Cron { expression: String },
    /// Once a day at the given UTC time
    Daily { hour: u32, minute: u32 },
    /// Fixed number of seconds between runs
    Interval { seconds: u64 },
}

impl Schedule {
    /// Next fire time strictly after `after`, `None` if the schedule is exhausted
    pub fn next_run_time(&self, after: DateTime<Utc>) -> Result<Option<DateTime<Utc>>> {
        match self {
            Self::Cron { expression } => Ok(parse_cron(expression)?.after(&after).next()),
            Self::Daily { hour, minute } => {
                let today = after
                    .date_naive()
                    .and_hms_opt(*hour, *minute, 0)
                    .ok_or_else(|| {
                        BackstopError::validation(format!("Invalid daily time {hour:02}:{minute:02}"))
                    })?
                    .and_utc();
                if today > after {
                    Ok(Some(today))
                } else {
                    Ok(Some(today + chrono::Duration::days(1)))
                }
            }
            Self::Interval { seconds } => {
                let seconds = i64::try_from(*seconds)
                    .map_err(|_| BackstopError::validation("Interval is too large"))?;
                Ok(Some(after + chrono::Duration::seconds(seconds)))
            }
        }
    }

    pub fn validate(&self) -> Result<()> {
        match self {
            Self::Cron { expression } => parse_cron(expression).map(|_| ()),
            Self::Daily { hour, minute } => {
                if *hour > 23 || *minute > 59 {
                    return Err(BackstopError::validation(format!(
                        "Invalid daily time {hour:02}:{minute:02}"
                    )));
                }
                Ok(())
            }
            Self::Interval { seconds } => {
                if *seconds == 0 {
                    return Err(BackstopError::validation("Interval must be greater than 0"));
                }
                Ok(())
            }
        }
    }
}

fn parse_cron(expression: &str) -> Result<CronSchedule> {
    CronSchedule::from_str(expression).map_err(|e| {
        BackstopError::validation(format!("Invalid cron expression '{expression}': {e}"))
    })
}

/// How scheduled backups get their retention tier
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TierAssignment {
    /// First of the month is Monthly, first of the ISO week is Weekly
    #[default]
    Automatic,
    Fixed(RetentionTier),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchedulerConfig {
    pub schedule: Schedule,
    /// Providers every new backup is replicated to
    #[serde(default)]
    pub providers: Vec<String>,
    pub compression: Compression,
    #[serde(default)]
    pub tier: TierAssignment,
    #[serde(default)]
    pub retention: RetentionPolicy,
}

impl SchedulerConfig {
    pub fn new(schedule: Schedule) -> Self {
        Self {
            schedule,
            providers: Vec::new(),
            compression: Compression::Gzip,
            tier: TierAssignment::Automatic,
            retention: RetentionPolicy::default(),
        }
    }

    pub fn with_providers<I, S>(mut self, providers: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.providers = providers.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_compression(mut self, compression: Compression) -> Self {
        self.compression = compression;
        self
    }

    pub fn with_tier(mut self, tier: TierAssignment) -> Self {
        self.tier = tier;
        self
    }

    pub fn with_retention(mut self, retention: RetentionPolicy) -> Self {
        self.retention = retention;
        self
    }

    pub fn validate(&self) -> Result<()> {
        self.schedule.validate()
    }
}

/// Outcome of replicating the run's backup to one provider
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ReplicationOutcome {
    pub provider: String,
    pub uri: Option<String>,
    pub error: Option<String>,
}

/// Per-stage outcome of one scheduled run
#[derive(Debug, Clone, Serialize)]
pub struct RunReport {
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub backup_id: Option<String>,
    pub backup_error: Option<String>,
    pub replications: Vec<ReplicationOutcome>,
    pub retention_deleted: Option<usize>,
    pub retention_error: Option<String>,
}

impl RunReport {
    /// True when every stage succeeded
    pub fn is_success(&self) -> bool {
        self.backup_error.is_none()
            && self.retention_error.is_none()
            && self.replications.iter().all(|r| r.error.is_none())
    }
}

#[derive(Debug, Clone)]
pub enum TriggerOutcome {
    Completed(RunReport),
    /// The previous run was still in progress
    Skipped,
}

/// Runs backups for one engine on a schedule
///
/// `trigger` may also be called on demand while [`BackupScheduler::run`] is
/// active; both go through the same running flag.
pub struct BackupScheduler {
    engine: Arc<BackupEngine>,
    config: SchedulerConfig,
    poll_interval: Duration,
    running: AtomicBool,
    shutdown: AtomicBool,
}

impl BackupScheduler {
    pub fn new(engine: Arc<BackupEngine>, config: SchedulerConfig) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            engine,
            config,
            poll_interval: DEFAULT_POLL_INTERVAL,
            running: AtomicBool::new(false),
            shutdown: AtomicBool::new(false),
        })
    }

    /// How often the run loop checks for shutdown while waiting
    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    pub fn config(&self) -> &SchedulerConfig {
        &self.config
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Signal the run loop to stop; an in-flight run finishes on its own
    pub fn shutdown(&self) {
        info!("Scheduler shutdown requested");
        self.shutdown.store(true, Ordering::SeqCst);
    }

    /// Wait for each fire time and spawn a trigger, until shutdown
    pub async fn run(self: Arc<Self>) -> Result<()> {
        info!(schedule = ?self.config.schedule, providers = ?self.config.providers, "Scheduler started");

        while !self.shutdown.load(Ordering::SeqCst) {
            let Some(next) = self.config.schedule.next_run_time(Utc::now())? else {
                info!("Schedule has no further fire times");
                break;
            };
            debug!(next_run = %next, "Waiting for next scheduled run");

            if !self.sleep_until(next).await {
                break;
            }

            let this = Arc::clone(&self);
            tokio::spawn(async move {
                match this.trigger().await {
                    TriggerOutcome::Completed(report) if report.is_success() => {
                        debug!(backup_id = ?report.backup_id, "Scheduled run succeeded");
                    }
                    TriggerOutcome::Completed(report) => {
                        warn!(
                            backup_error = ?report.backup_error,
                            retention_error = ?report.retention_error,
                            "Scheduled run finished with failures"
                        );
                    }
                    TriggerOutcome::Skipped => {}
                }
            });
        }

        info!("Scheduler stopped");
        Ok(())
    }

    /// Sleep until `deadline`, returning false if shutdown was requested first
    async fn sleep_until(&self, deadline: DateTime<Utc>) -> bool {
        loop {
            if self.shutdown.load(Ordering::SeqCst) {
                return false;
            }
            let remaining = (deadline - Utc::now()).to_std().unwrap_or(Duration::ZERO);
            if remaining.is_zero() {
                return true;
            }
            tokio::time::sleep(remaining.min(self.poll_interval)).await;
        }
    }

    /// Run create, replicate and retention once, unless a run is in progress
    pub async fn trigger(&self) -> TriggerOutcome {
        if self
            .running
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            warn!("Previous backup run still in progress; skipping trigger");
            return TriggerOutcome::Skipped;
        }
        let _running = RunningGuard(&self.running);
        TriggerOutcome::Completed(self.run_stages().await)
    }

    async fn run_stages(&self) -> RunReport {
        let started_at = Utc::now();
        info!("Scheduled backup run started");

        let engine = Arc::clone(&self.engine);
        let compression = self.config.compression;
        let tier = self.config.tier;
        let created = tokio::task::spawn_blocking(move || match tier {
            TierAssignment::Automatic => engine.create_scheduled_backup(compression),
            TierAssignment::Fixed(tier) => {
                engine.create_backup(BackupKind::Full, compression, tier)
            }
        })
        .await
        .map_err(join_failure)
        .and_then(|created| created);

        let (backup_id, backup_error) = match created {
            Ok(record) => (Some(record.id), None),
            Err(e) => {
                error!(error = %e, "Backup stage failed");
                (None, Some(e.to_string()))
            }
        };

        let mut replications = Vec::new();
        if let Some(id) = &backup_id {
            for (provider, outcome) in self
                .engine
                .replicator()
                .replicate_to_all(id, &self.config.providers)
                .await
            {
                replications.push(match outcome {
                    Ok(copy) => ReplicationOutcome {
                        provider,
                        uri: Some(copy.uri),
                        error: None,
                    },
                    Err(e) => ReplicationOutcome {
                        provider,
                        uri: None,
                        error: Some(e.to_string()),
                    },
                });
            }
        }

        let engine = Arc::clone(&self.engine);
        let policy = self.config.retention;
        let retained = tokio::task::spawn_blocking(move || engine.enforce_retention(&policy))
            .await
            .map_err(join_failure)
            .and_then(|deleted| deleted);
        let (retention_deleted, retention_error) = match retained {
            Ok(deleted) => (Some(deleted), None),
            Err(e) => {
                error!(error = %e, "Retention stage failed");
                (None, Some(e.to_string()))
            }
        };

        let report = RunReport {
            started_at,
            finished_at: Utc::now(),
            backup_id,
            backup_error,
            replications,
            retention_deleted,
            retention_error,
        };
        info!(
            backup_id = ?report.backup_id,
            replicated = report.replications.iter().filter(|r| r.error.is_none()).count(),
            retention_deleted = ?report.retention_deleted,
            success = report.is_success(),
            "Scheduled backup run finished"
        );
        report
    }
}

impl std::fmt::Debug for BackupScheduler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BackupScheduler")
            .field("config", &self.config)
            .field("running", &self.is_running())
            .finish()
    }
}

/// Clears the running flag when a run ends, however it ends
struct RunningGuard<'a>(&'a AtomicBool);

impl Drop for RunningGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

fn join_failure(e: JoinError) -> BackstopError {
    BackstopError::Io(io::Error::other(e))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::source::SnapshotSource;
    use crate::EngineConfig;
    use chrono::TimeZone;
    use rusqlite::Connection;
    use std::io::{Cursor, Read};
    use std::path::Path;
    use std::sync::mpsc::{channel, Receiver, Sender};
    use std::sync::Mutex;
    use tempfile::TempDir;

    #[test]
    fn test_cron_next_run_time() {
        let schedule = Schedule::Cron {
            expression: "0 30 2 * * *".to_string(),
        };
        let after = Utc.with_ymd_and_hms(2025, 6, 1, 3, 0, 0).unwrap();
        let next = schedule.next_run_time(after).unwrap().unwrap();
        assert_eq!(next, Utc.with_ymd_and_hms(2025, 6, 2, 2, 30, 0).unwrap());
    }

    #[test]
    fn test_daily_next_run_time() {
        let schedule = Schedule::Daily { hour: 2, minute: 30 };
        let before = Utc.with_ymd_and_hms(2025, 6, 1, 1, 0, 0).unwrap();
        assert_eq!(
            schedule.next_run_time(before).unwrap(),
            Some(Utc.with_ymd_and_hms(2025, 6, 1, 2, 30, 0).unwrap())
        );
        let exactly = Utc.with_ymd_and_hms(2025, 6, 1, 2, 30, 0).unwrap();
        assert_eq!(
            schedule.next_run_time(exactly).unwrap(),
            Some(Utc.with_ymd_and_hms(2025, 6, 2, 2, 30, 0).unwrap())
        );
    }

    #[test]
    fn test_interval_next_run_time() {
        let schedule = Schedule::Interval { seconds: 300 };
        let now = Utc::now();
        let next = schedule.next_run_time(now).unwrap().unwrap();
        assert_eq!((next - now).num_seconds(), 300);
    }

    #[test]
    fn test_validate() {
        assert!(Schedule::Cron { expression: "invalid".into() }.validate().is_err());
        assert!(Schedule::Interval { seconds: 0 }.validate().is_err());
        assert!(Schedule::Daily { hour: 24, minute: 0 }.validate().is_err());
        assert!(Schedule::Daily { hour: 23, minute: 59 }.validate().is_ok());
    }

    #[test]
    fn test_config_serde() {
        let config = SchedulerConfig::new(Schedule::Daily { hour: 1, minute: 15 })
            .with_providers(["s3"])
            .with_tier(TierAssignment::Fixed(RetentionTier::Weekly));
        let json = serde_json::to_string(&config).unwrap();
        assert!(json.contains(r#""type":"daily""#));
        let back: SchedulerConfig = serde_json::from_str(&json).unwrap();
        assert_eq!(back.schedule, config.schedule);
        assert_eq!(back.tier, config.tier);
        assert_eq!(back.providers, vec!["s3".to_string()]);
    }

    fn engine_in(dir: &TempDir) -> Arc<BackupEngine> {
        let db = dir.path().join("app.db");
        let conn = Connection::open(&db).unwrap();
        conn.execute_batch("CREATE TABLE t (x INTEGER); INSERT INTO t VALUES (1);")
            .unwrap();
        Arc::new(
            BackupEngine::open(EngineConfig::new(db.to_str().unwrap(), dir.path().join("backups")))
                .unwrap(),
        )
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_trigger_runs_every_stage() {
        let dir = TempDir::new().unwrap();
        let engine = engine_in(&dir);
        let config = SchedulerConfig::new(Schedule::Interval { seconds: 60 })
            .with_providers(["missing"])
            .with_tier(TierAssignment::Fixed(RetentionTier::Daily))
            .with_retention(RetentionPolicy::new(2, 0, 0));
        let scheduler = BackupScheduler::new(Arc::clone(&engine), config).unwrap();

        let mut last = None;
        for _ in 0..3 {
            match scheduler.trigger().await {
                TriggerOutcome::Completed(report) => last = Some(report),
                TriggerOutcome::Skipped => panic!("sequential triggers must not be skipped"),
            }
        }

        // replication to an unregistered provider fails without stopping retention
        let report = last.unwrap();
        assert!(report.backup_id.is_some());
        assert!(report.replications[0].error.is_some());
        assert_eq!(report.retention_deleted, Some(1));
        assert!(!report.is_success());
        assert_eq!(engine.list_active_backups().len(), 2);
        assert!(!scheduler.is_running());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_failed_backup_still_enforces_retention() {
        let dir = TempDir::new().unwrap();
        let engine = Arc::new(
            BackupEngine::open(EngineConfig::new(
                dir.path().join("absent.db").to_str().unwrap(),
                dir.path().join("backups"),
            ))
            .unwrap(),
        );
        let scheduler = BackupScheduler::new(
            engine,
            SchedulerConfig::new(Schedule::Interval { seconds: 60 }).with_providers(["s3"]),
        )
        .unwrap();

        let TriggerOutcome::Completed(report) = scheduler.trigger().await else {
            panic!("trigger was skipped");
        };
        assert!(report.backup_error.is_some());
        assert!(report.replications.is_empty());
        assert_eq!(report.retention_deleted, Some(0));
    }

    /// Source that blocks inside the snapshot until released
    struct GatedSource {
        entered: Mutex<Sender<()>>,
        release: Mutex<Receiver<()>>,
    }

    impl SnapshotSource for GatedSource {
        fn open_consistent_snapshot(
            &self,
            _source: &str,
            _timeout: Duration,
        ) -> Result<Box<dyn Read + Send>> {
            self.entered.lock().unwrap().send(()).unwrap();
            self.release.lock().unwrap().recv().unwrap();
            Ok(Box::new(Cursor::new(vec![7u8; 4096])))
        }

        fn is_managed_database(&self, _path: &Path) -> bool {
            false
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_overlapping_trigger_is_skipped() {
        let dir = TempDir::new().unwrap();
        let (entered_tx, entered_rx) = channel();
        let (release_tx, release_rx) = channel();
        let engine = Arc::new(
            BackupEngine::builder(EngineConfig::new("/data/app.db", dir.path().join("backups")))
                .with_source(Arc::new(GatedSource {
                    entered: Mutex::new(entered_tx),
                    release: Mutex::new(release_rx),
                }))
                .build()
                .unwrap(),
        );
        let scheduler = Arc::new(
            BackupScheduler::new(
                Arc::clone(&engine),
                SchedulerConfig::new(Schedule::Interval { seconds: 60 }),
            )
            .unwrap(),
        );

        let first = tokio::spawn({
            let scheduler = Arc::clone(&scheduler);
            async move { scheduler.trigger().await }
        });
        tokio::task::spawn_blocking(move || entered_rx.recv_timeout(Duration::from_secs(10)))
            .await
            .unwrap()
            .unwrap();
        assert!(scheduler.is_running());

        assert!(matches!(scheduler.trigger().await, TriggerOutcome::Skipped));

        release_tx.send(()).unwrap();
        let TriggerOutcome::Completed(report) = first.await.unwrap() else {
            panic!("first trigger was skipped");
        };
        assert!(report.backup_id.is_some());
        assert_eq!(engine.list_active_backups().len(), 1);
        assert!(!scheduler.is_running());
    }

    #[tokio::test]
    async fn test_run_loop_stops_on_shutdown() {
        let dir = TempDir::new().unwrap();
        let scheduler = Arc::new(
            BackupScheduler::new(
                engine_in(&dir),
                SchedulerConfig::new(Schedule::Interval { seconds: 3600 }),
            )
            .unwrap()
            .with_poll_interval(Duration::from_millis(10)),
        );

        let handle = tokio::spawn(Arc::clone(&scheduler).run());
        tokio::time::sleep(Duration::from_millis(30)).await;
        scheduler.shutdown();

        tokio::time::timeout(Duration::from_secs(5), handle)
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        assert!(!scheduler.is_running());
    }
}
