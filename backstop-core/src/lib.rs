/*!
# Backstop Core Engine

Point-in-time backup and recovery for operational databases.

The engine produces verifiably intact copies of a database, catalogs them,
enforces a daily/weekly/monthly retention policy, restores with a safety net
and mirrors artifacts to remote stores on a best-effort basis:

- [`BackupEngine`] owns the creation, verification, restore and retention
  pipelines over one backup directory and its [`Catalog`]
- [`SnapshotSource`] abstracts how a consistent snapshot is taken; SQLite's
  online backup API is the built-in implementation
- [`RemoteStore`] adapters (mirror directory, S3, GCS) are driven by the
  [`Replicator`] with retries and a bounded wait
- [`BackupScheduler`] runs create, replicate and retention on a schedule

## Usage

```rust,no_run
use backstop_core::{BackupEngine, BackupKind, Compression, EngineConfig, RetentionPolicy, RetentionTier};

let engine = BackupEngine::open(EngineConfig::new("/data/app.db", "/var/backups/app"))?;

let record = engine.create_backup(BackupKind::Full, Compression::Zstd, RetentionTier::Daily)?;
assert!(engine.verify_backup(&record)?);

let report = engine.restore_backup(&record, None)?;
println!("restored {}, safety backup {:?}", report.backup_id, report.safety_backup_id);

engine.enforce_retention(&RetentionPolicy::default())?;
# Ok::<(), backstop_core::BackstopError>(())
```
*/

pub mod catalog;
pub mod compression;
pub mod config;
pub mod engine;
pub mod error;
pub mod integrity;
pub mod observability;
pub mod record;
pub mod remote;
pub mod replicate;
pub mod restore;
pub mod retention;
pub mod scheduler;
pub mod source;
pub mod verify;

pub use catalog::Catalog;
pub use compression::{Compression, CompressionLevels};
pub use config::{EngineConfig, RemoteBackend, RemoteConfig, RetentionPolicy};
pub use engine::{catalog_gauges, BackupEngine, BackupEngineBuilder};
pub use error::{BackstopError, Result};
pub use observability::{init_default_observability, init_observability, CatalogGauges, MetricsSink, NoopMetrics};
#[cfg(feature = "metrics")]
pub use observability::PrometheusMetrics;
pub use record::{BackupId, BackupKind, BackupRecord, BackupRef, BackupStatus, RemoteCopy, RetentionTier};
pub use remote::{DirectoryStore, RemoteError, RemoteRegistry, RemoteStore};
pub use replicate::Replicator;
pub use restore::RestoreReport;
pub use retention::{assign_tier, plan_retention};
pub use scheduler::{
    BackupScheduler, ReplicationOutcome, RunReport, Schedule, SchedulerConfig, TierAssignment,
    TriggerOutcome,
};
pub use source::{SnapshotSource, SqliteSnapshotSource};
