/*!
Backstop CLI - operator interface for the backstop backup engine.

Creates, lists, verifies, restores and prunes backups of one database, and
can run the backup scheduler in the foreground.
*/

use std::io::{self, Write};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context};
use backstop_core::{
    remote, BackstopError, BackupEngine, BackupRecord, BackupScheduler, Compression, EngineConfig,
    RemoteConfig, RetentionPolicy, RetentionTier, Schedule, SchedulerConfig, TierAssignment,
    TriggerOutcome,
};
use chrono::{DateTime, Local, Utc};
use clap::{Args, Parser, Subcommand, ValueEnum};
use tabled::{Table, Tabled};
use tracing::{info, warn};

#[derive(Parser)]
#[command(name = "backstop")]
#[command(about = "Point-in-time database backups with verification, retention and restore")]
#[command(version)]
struct Cli {
    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Emit logs as JSON lines
    #[arg(long, global = true)]
    json_logs: bool,

    /// Database to back up (path, optionally `sqlite:` prefixed)
    #[arg(long, global = true, env = "BACKSTOP_SOURCE")]
    source: Option<String>,

    /// Directory holding artifacts and the catalog
    #[arg(long, global = true, env = "BACKSTOP_BACKUP_DIR", default_value = "./backups")]
    backup_dir: PathBuf,

    /// Remote store URI (s3://bucket/prefix, gs://bucket/prefix, or a directory); repeatable
    #[arg(long, global = true, env = "BACKSTOP_REMOTE", value_delimiter = ',')]
    remote: Vec<String>,

    /// Seconds to wait for a consistent snapshot
    #[arg(long, global = true, env = "BACKSTOP_SNAPSHOT_TIMEOUT", default_value_t = 30)]
    snapshot_timeout: u64,

    /// Seconds allowed for one replication, retries included
    #[arg(long, global = true, env = "BACKSTOP_REPLICATION_TIMEOUT", default_value_t = 300)]
    replication_timeout: u64,

    /// Print Prometheus metrics to stderr when the command finishes
    #[cfg(feature = "metrics")]
    #[arg(long, global = true)]
    print_metrics: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(ValueEnum, Clone, Copy, Debug)]
enum CompressionArg {
    None,
    Gzip,
    Zstd,
}

impl From<CompressionArg> for Compression {
    fn from(arg: CompressionArg) -> Self {
        match arg {
            CompressionArg::None => Compression::None,
            CompressionArg::Gzip => Compression::Gzip,
            CompressionArg::Zstd => Compression::Zstd,
        }
    }
}

#[derive(ValueEnum, Clone, Copy, Debug)]
enum TierArg {
    /// First of the month is monthly, first of the week is weekly
    Auto,
    Daily,
    Weekly,
    Monthly,
}

impl From<TierArg> for TierAssignment {
    fn from(arg: TierArg) -> Self {
        match arg {
            TierArg::Auto => TierAssignment::Automatic,
            TierArg::Daily => TierAssignment::Fixed(RetentionTier::Daily),
            TierArg::Weekly => TierAssignment::Fixed(RetentionTier::Weekly),
            TierArg::Monthly => TierAssignment::Fixed(RetentionTier::Monthly),
        }
    }
}

#[derive(Args, Clone, Copy, Debug)]
struct RetentionArgs {
    /// Daily backups to keep
    #[arg(long, env = "BACKSTOP_KEEP_DAILY", default_value_t = 7)]
    keep_daily: usize,
    /// Weekly backups to keep
    #[arg(long, env = "BACKSTOP_KEEP_WEEKLY", default_value_t = 4)]
    keep_weekly: usize,
    /// Monthly backups to keep
    #[arg(long, env = "BACKSTOP_KEEP_MONTHLY", default_value_t = 12)]
    keep_monthly: usize,
}

impl From<RetentionArgs> for RetentionPolicy {
    fn from(args: RetentionArgs) -> Self {
        RetentionPolicy::new(args.keep_daily, args.keep_weekly, args.keep_monthly)
    }
}

#[derive(Subcommand)]
enum Commands {
    /// Take a full backup now
    Create {
        #[arg(short, long, value_enum, default_value = "gzip")]
        compression: CompressionArg,
        #[arg(short, long, value_enum, default_value = "auto")]
        tier: TierArg,
        /// Replicate to every configured remote afterwards
        #[arg(long)]
        replicate: bool,
    },
    /// List backups
    List {
        /// Include deleted backups
        #[arg(short, long)]
        all: bool,
    },
    /// Show the full record of one backup as JSON
    Show { backup_id: String },
    /// Verify one backup, or every active backup when no id is given
    Verify { backup_id: Option<String> },
    /// Restore a backup over its source or to another location
    Restore {
        backup_id: String,
        /// Restore here instead of over the original database
        #[arg(long)]
        target: Option<PathBuf>,
        /// Skip confirmation prompt
        #[arg(short, long)]
        yes: bool,
    },
    /// Delete a backup
    Delete {
        backup_id: String,
        /// Allow deleting the last active backup
        #[arg(long)]
        force: bool,
        /// Skip confirmation prompt
        #[arg(short, long)]
        yes: bool,
    },
    /// Apply the retention policy
    Retention {
        #[command(flatten)]
        policy: RetentionArgs,
        /// Only print what would be deleted
        #[arg(long)]
        dry_run: bool,
    },
    /// Copy a backup to remote stores
    Replicate {
        backup_id: String,
        /// Provider to replicate to (defaults to every configured remote)
        #[arg(short, long)]
        provider: Vec<String>,
    },
    /// List files in the backup directory the catalog does not account for
    Orphans,
    /// Recompute retention tiers of active backups from their creation time
    Reclassify,
    /// Run the scheduler in the foreground until Ctrl-C
    Schedule {
        /// Cron expression with seconds, e.g. "0 30 2 * * *"
        #[arg(long, conflicts_with_all = ["daily_at", "interval"])]
        cron: Option<String>,
        /// Daily UTC time as HH:MM
        #[arg(long, conflicts_with = "interval")]
        daily_at: Option<String>,
        /// Seconds between runs
        #[arg(long)]
        interval: Option<u64>,
        #[arg(short, long, value_enum, default_value = "gzip")]
        compression: CompressionArg,
        #[arg(short, long, value_enum, default_value = "auto")]
        tier: TierArg,
        #[command(flatten)]
        policy: RetentionArgs,
        /// Run once immediately before waiting for the schedule
        #[arg(long)]
        now: bool,
    },
}

#[derive(Tabled)]
struct BackupRow {
    #[tabled(rename = "ID")]
    id: String,
    #[tabled(rename = "Tier")]
    tier: String,
    #[tabled(rename = "Status")]
    status: String,
    #[tabled(rename = "Created")]
    created: String,
    #[tabled(rename = "Size")]
    size: String,
    #[tabled(rename = "Compression")]
    compression: String,
    #[tabled(rename = "Verified")]
    verified: String,
    #[tabled(rename = "Remotes")]
    remotes: String,
}

impl From<&BackupRecord> for BackupRow {
    fn from(record: &BackupRecord) -> Self {
        Self {
            id: record.id.clone(),
            tier: record.retention_tier.to_string(),
            status: if record.is_active() { "active" } else { "deleted" }.to_string(),
            created: format_timestamp(record.created_at),
            size: format_size(record.size_bytes),
            compression: record.compression.to_string(),
            verified: record
                .verified_at
                .map(format_timestamp)
                .unwrap_or_else(|| "-".to_string()),
            remotes: if record.remote_copies.is_empty() {
                "-".to_string()
            } else {
                record
                    .remote_copies
                    .iter()
                    .map(|c| c.provider.as_str())
                    .collect::<Vec<_>>()
                    .join(",")
            },
        }
    }
}

#[tokio::main]
async fn main() -> Result<(), anyhow::Error> {
    let cli = Cli::parse();

    init_logging(cli.verbose, cli.json_logs);

    #[cfg(feature = "metrics")]
    let metrics = Arc::new(backstop_core::PrometheusMetrics::new()?);
    #[cfg(feature = "metrics")]
    let engine = Arc::new(build_engine(&cli, Some(metrics.clone())).await?);
    #[cfg(not(feature = "metrics"))]
    let engine = Arc::new(build_engine(&cli, None).await?);

    let outcome = run_command(cli.command, Arc::clone(&engine), &cli.remote).await;

    #[cfg(feature = "metrics")]
    if cli.print_metrics {
        eprintln!("{}", metrics.gather_metrics()?);
    }

    outcome
}

fn init_logging(verbose: bool, json: bool) {
    let filter = if verbose {
        tracing_subscriber::EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("debug"))
    } else {
        tracing_subscriber::EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("backstop=info,backstop_core=info"))
    };

    if json {
        tracing_subscriber::fmt()
            .json()
            .with_env_filter(filter)
            .with_target(false)
            .with_writer(io::stderr)
            .init();
    } else {
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_target(false)
            .with_writer(io::stderr)
            .init();
    }
}

async fn build_engine(
    cli: &Cli,
    metrics: Option<Arc<dyn backstop_core::MetricsSink>>,
) -> Result<BackupEngine, anyhow::Error> {
    let source = cli
        .source
        .clone()
        .context("No source database given; pass --source or set BACKSTOP_SOURCE")?;
    let config = EngineConfig::new(source, &cli.backup_dir)
        .with_snapshot_timeout(Duration::from_secs(cli.snapshot_timeout))
        .with_replication_timeout(Duration::from_secs(cli.replication_timeout));

    let mut builder = BackupEngine::builder(config);
    if let Some(metrics) = metrics {
        builder = builder.with_metrics(metrics);
    }
    for uri in &cli.remote {
        let remote_config = RemoteConfig::from_uri(uri)?;
        // an unreachable remote must not block local operations
        match remote::connect(&remote_config).await {
            Ok(store) => builder = builder.with_remote(store),
            Err(e) => warn!(remote = %uri, error = %e, "Remote store unavailable; continuing without it"),
        }
    }
    Ok(builder.build()?)
}

async fn run_command(
    command: Commands,
    engine: Arc<BackupEngine>,
    remotes: &[String],
) -> Result<(), anyhow::Error> {
    match command {
        Commands::Create {
            compression,
            tier,
            replicate,
        } => create_backup(&engine, compression.into(), tier.into(), replicate).await,
        Commands::List { all } => list_backups(&engine, all),
        Commands::Show { backup_id } => show_backup(&engine, &backup_id),
        Commands::Verify { backup_id } => verify_backups(&engine, backup_id.as_deref()),
        Commands::Restore {
            backup_id,
            target,
            yes,
        } => restore_backup(&engine, &backup_id, target, yes),
        Commands::Delete {
            backup_id,
            force,
            yes,
        } => delete_backup(&engine, &backup_id, force, yes),
        Commands::Retention { policy, dry_run } => enforce_retention(&engine, policy.into(), dry_run),
        Commands::Replicate {
            backup_id,
            provider,
        } => replicate_backup(&engine, &backup_id, provider).await,
        Commands::Orphans => list_orphans(&engine),
        Commands::Reclassify => {
            let changed = engine.reclassify_tiers()?;
            println!("✓ Reclassified {changed} backup(s)");
            Ok(())
        }
        Commands::Schedule {
            cron,
            daily_at,
            interval,
            compression,
            tier,
            policy,
            now,
        } => {
            let schedule = parse_schedule(cron, daily_at, interval)?;
            let config = SchedulerConfig::new(schedule)
                .with_providers(engine.replicator().providers())
                .with_compression(compression.into())
                .with_tier(tier.into())
                .with_retention(policy.into());
            if !remotes.is_empty() && config.providers.is_empty() {
                warn!("No configured remote could be reached; scheduled runs will not replicate");
            }
            run_scheduler(engine, config, now).await
        }
    }
}

async fn create_backup(
    engine: &BackupEngine,
    compression: Compression,
    tier: TierAssignment,
    replicate: bool,
) -> Result<(), anyhow::Error> {
    let record = match tier {
        TierAssignment::Automatic => engine.create_scheduled_backup(compression)?,
        TierAssignment::Fixed(tier) => {
            engine.create_backup(backstop_core::BackupKind::Full, compression, tier)?
        }
    };
    println!("✓ Created backup {}", record.id);
    println!("  Artifact: {}", record.artifact_location.display());
    println!("  Size: {}", format_size(record.size_bytes));
    println!("  Tier: {}", record.retention_tier);
    println!("  SHA-256: {}", record.checksum);

    if replicate {
        let providers = engine.replicator().providers();
        for (provider, outcome) in engine
            .replicator()
            .replicate_to_all(&record.id, &providers)
            .await
        {
            match outcome {
                Ok(copy) => println!("✓ Replicated to {provider}: {}", copy.uri),
                Err(e) => println!("✗ Replication to {provider} failed: {e}"),
            }
        }
    }
    Ok(())
}

fn list_backups(engine: &BackupEngine, all: bool) -> Result<(), anyhow::Error> {
    let records = if all {
        engine.list_backups()
    } else {
        engine.list_active_backups()
    };

    if records.is_empty() {
        println!("No backups found in {}", engine.config().backup_dir.display());
    } else {
        let rows: Vec<BackupRow> = records.iter().map(BackupRow::from).collect();
        println!("{}", Table::new(rows));
    }
    Ok(())
}

fn show_backup(engine: &BackupEngine, backup_id: &str) -> Result<(), anyhow::Error> {
    let record = engine
        .get_backup(backup_id)
        .ok_or_else(|| BackstopError::BackupNotFound(backup_id.to_string()))?;
    println!("{}", serde_json::to_string_pretty(&record)?);
    Ok(())
}

fn verify_backups(engine: &BackupEngine, backup_id: Option<&str>) -> Result<(), anyhow::Error> {
    let results = match backup_id {
        Some(id) => vec![(id.to_string(), engine.verify_backup(id)?)],
        None => engine.verify_all()?,
    };

    let mut failed = 0;
    for (id, passed) in &results {
        if *passed {
            println!("✓ {id}: integrity check passed");
        } else {
            failed += 1;
            println!("✗ {id}: integrity check FAILED");
        }
    }

    if failed > 0 {
        bail!("{failed} of {} backup(s) failed verification", results.len());
    }
    Ok(())
}

fn restore_backup(
    engine: &BackupEngine,
    backup_id: &str,
    target: Option<PathBuf>,
    yes: bool,
) -> Result<(), anyhow::Error> {
    let record = engine
        .get_backup(backup_id)
        .ok_or_else(|| BackstopError::BackupNotFound(backup_id.to_string()))?;
    let destination = target
        .clone()
        .map(|p| p.display().to_string())
        .unwrap_or_else(|| record.source_descriptor.clone());

    if !yes && !confirm(&format!("Restore '{backup_id}' over '{destination}'?"))? {
        println!("Restore cancelled");
        return Ok(());
    }

    match engine.restore_backup(&record, target.as_deref()) {
        Ok(report) => {
            println!(
                "✓ Restored {} to {} ({})",
                report.backup_id,
                report.target.display(),
                format_size(report.bytes_restored)
            );
            match &report.safety_backup_id {
                Some(id) => println!("  Previous contents saved as backup {id}"),
                None if report.replaced_existing => {
                    println!("  Previous file was not a managed database; no safety backup taken")
                }
                None => println!("  Target did not exist before the restore"),
            }
            Ok(())
        }
        Err(e) => {
            eprintln!("✗ Restore failed; the target was not modified");
            Err(e.into())
        }
    }
}

fn delete_backup(
    engine: &BackupEngine,
    backup_id: &str,
    force: bool,
    yes: bool,
) -> Result<(), anyhow::Error> {
    if !yes && !confirm(&format!("Are you sure you want to delete backup '{backup_id}'?"))? {
        println!("Deletion cancelled");
        return Ok(());
    }

    let deleted = if force {
        engine.force_delete_backup(backup_id)
    } else {
        engine.delete_backup(backup_id)
    };
    match deleted {
        Ok(true) => println!("✓ Backup deleted successfully"),
        Ok(false) => println!("Backup {backup_id} was already deleted"),
        Err(e @ BackstopError::RetentionViolation(_)) => {
            eprintln!("✗ {e}. Use --force to delete it anyway.");
            return Err(e.into());
        }
        Err(e) => return Err(e.into()),
    }
    Ok(())
}

fn enforce_retention(
    engine: &BackupEngine,
    policy: RetentionPolicy,
    dry_run: bool,
) -> Result<(), anyhow::Error> {
    if dry_run {
        let planned = backstop_core::plan_retention(&engine.list_backups(), &policy);
        if planned.is_empty() {
            println!("Nothing to delete");
        }
        for id in planned {
            println!("would delete {id}");
        }
        return Ok(());
    }

    let deleted = engine.enforce_retention(&policy)?;
    println!(
        "✓ Deleted {deleted} backup(s) (keeping {} daily, {} weekly, {} monthly)",
        policy.daily_keep, policy.weekly_keep, policy.monthly_keep
    );
    Ok(())
}

async fn replicate_backup(
    engine: &BackupEngine,
    backup_id: &str,
    providers: Vec<String>,
) -> Result<(), anyhow::Error> {
    let providers = if providers.is_empty() {
        engine.replicator().providers()
    } else {
        providers
    };
    if providers.is_empty() {
        bail!("No remote stores configured; pass --remote or set BACKSTOP_REMOTE");
    }

    let mut failed = 0;
    for (provider, outcome) in engine
        .replicator()
        .replicate_to_all(backup_id, &providers)
        .await
    {
        match outcome {
            Ok(copy) => println!("✓ {provider}: {}", copy.uri),
            Err(e) => {
                failed += 1;
                println!("✗ {provider}: {e}");
            }
        }
    }
    if failed > 0 {
        bail!("Replication failed for {failed} provider(s)");
    }
    Ok(())
}

fn list_orphans(engine: &BackupEngine) -> Result<(), anyhow::Error> {
    let orphans = engine.find_orphaned_artifacts()?;
    if orphans.is_empty() {
        println!("No orphaned files");
    }
    for path in orphans {
        println!("{}", path.display());
    }
    Ok(())
}

fn parse_schedule(
    cron: Option<String>,
    daily_at: Option<String>,
    interval: Option<u64>,
) -> Result<Schedule, anyhow::Error> {
    match (cron, daily_at, interval) {
        (Some(expression), _, _) => Ok(Schedule::Cron { expression }),
        (None, Some(time), _) => {
            let (hour, minute) = time
                .split_once(':')
                .context("--daily-at expects HH:MM")?;
            Ok(Schedule::Daily {
                hour: hour.parse().context("invalid hour in --daily-at")?,
                minute: minute.parse().context("invalid minute in --daily-at")?,
            })
        }
        (None, None, Some(seconds)) => Ok(Schedule::Interval { seconds }),
        (None, None, None) => bail!("One of --cron, --daily-at or --interval is required"),
    }
}

async fn run_scheduler(
    engine: Arc<BackupEngine>,
    config: SchedulerConfig,
    run_now: bool,
) -> Result<(), anyhow::Error> {
    let scheduler = Arc::new(BackupScheduler::new(engine, config)?);

    if run_now {
        if let TriggerOutcome::Completed(report) = scheduler.trigger().await {
            println!("{}", serde_json::to_string_pretty(&report)?);
        }
    }

    let handle = tokio::spawn(Arc::clone(&scheduler).run());
    tokio::signal::ctrl_c().await?;
    info!("Interrupt received, stopping scheduler");
    scheduler.shutdown();
    handle.await??;
    Ok(())
}

fn confirm(prompt: &str) -> Result<bool, anyhow::Error> {
    print!("{prompt} (y/N): ");
    io::stdout().flush()?;

    let mut input = String::new();
    io::stdin().read_line(&mut input)?;
    Ok(input.trim().to_lowercase().starts_with('y'))
}

fn format_size(bytes: u64) -> String {
    const UNITS: &[&str] = &["B", "KB", "MB", "GB", "TB"];
    let mut size = bytes as f64;
    let mut unit_index = 0;

    while size >= 1024.0 && unit_index < UNITS.len() - 1 {
        size /= 1024.0;
        unit_index += 1;
    }

    if unit_index == 0 {
        format!("{} {}", bytes, UNITS[unit_index])
    } else {
        format!("{:.1} {}", size, UNITS[unit_index])
    }
}

fn format_timestamp(timestamp: DateTime<Utc>) -> String {
    timestamp
        .with_timezone(&Local)
        .format("%Y-%m-%d %H:%M:%S")
        .to_string()
}
