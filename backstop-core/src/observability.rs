/*!
Observability for the backstop engine.

Logging goes through `tracing`; [`init_observability`] installs a subscriber
for binaries. Metrics are reported through the [`MetricsSink`] trait so the
engine stays usable without Prometheus. With the `metrics` feature enabled,
[`PrometheusMetrics`] exposes counters, histograms and catalog gauges that
can be scraped via [`PrometheusMetrics::gather_metrics`].
*/

use std::fmt::Debug;
use std::time::Duration;

use tracing::subscriber::set_global_default;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::{EnvFilter, Registry as TracingRegistry};

use crate::compression::Compression;
use crate::record::BackupKind;
use crate::{BackstopError, Result};

#[cfg(feature = "metrics")]
use prometheus::{
    Encoder, Gauge, Histogram, HistogramOpts, HistogramVec, IntCounterVec, IntGauge, Opts,
    Registry, TextEncoder,
};

/// Default filter when `RUST_LOG` is not set
const DEFAULT_LOG_FILTER: &str = "backstop_core=info,backstop=info";

/// Point-in-time view of the Active part of the catalog
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct CatalogGauges {
    pub active_backups: usize,
    pub active_bytes: u64,
    /// Age of the oldest Active backup, `None` when there are none
    pub oldest_age: Option<Duration>,
    pub newest_age: Option<Duration>,
}

/// Receiver for engine metrics. Every method defaults to a no-op.
pub trait MetricsSink: Send + Sync + Debug {
    fn backup_created(
        &self,
        _kind: BackupKind,
        _compression: Compression,
        _size_bytes: u64,
        _duration: Duration,
    ) {
    }

    fn backup_failed(&self, _kind: BackupKind, _reason: &'static str) {}

    fn backup_deleted(&self, _kind: BackupKind) {}

    fn verification(&self, _passed: bool) {}

    fn restore(&self, _succeeded: bool, _duration: Duration) {}

    fn replication(&self, _provider: &str, _succeeded: bool, _duration: Duration) {}

    /// Called after every operation that changed the catalog
    fn catalog_state(&self, _gauges: &CatalogGauges) {}
}

/// Sink that discards everything
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopMetrics;

impl MetricsSink for NoopMetrics {}

/// Prometheus-backed metrics
#[cfg(feature = "metrics")]
#[derive(Debug)]
pub struct PrometheusMetrics {
    backups_created_total: IntCounterVec,
    backup_failures_total: IntCounterVec,
    backups_deleted_total: IntCounterVec,
    backup_size_bytes: Histogram,
    backup_duration_seconds: Histogram,
    verifications_total: IntCounterVec,
    restores_total: IntCounterVec,
    restore_duration_seconds: Histogram,
    replications_total: IntCounterVec,
    replication_duration_seconds: HistogramVec,
    active_backups: IntGauge,
    active_bytes: IntGauge,
    oldest_backup_age_seconds: Gauge,
    newest_backup_age_seconds: Gauge,

    // Prometheus registry for scraping
    registry: Registry,
}

#[cfg(feature = "metrics")]
fn metric_error(name: &str, e: prometheus::Error) -> BackstopError {
    BackstopError::Metrics(format!("Failed to set up {name}: {e}"))
}

#[cfg(feature = "metrics")]
impl PrometheusMetrics {
    /// Create and register all metrics in a fresh registry
    pub fn new() -> Result<Self> {
        let registry = Registry::new();

        let backups_created_total = IntCounterVec::new(
            Opts::new(
                "backstop_backups_created_total",
                "Backups successfully written and cataloged",
            ),
            &["kind", "compression"],
        )
        .map_err(|e| metric_error("backups_created_total", e))?;

        let backup_failures_total = IntCounterVec::new(
            Opts::new("backstop_backup_failures_total", "Failed backup attempts"),
            &["kind", "reason"],
        )
        .map_err(|e| metric_error("backup_failures_total", e))?;

        let backups_deleted_total = IntCounterVec::new(
            Opts::new("backstop_backups_deleted_total", "Backups soft-deleted"),
            &["kind"],
        )
        .map_err(|e| metric_error("backups_deleted_total", e))?;

        let backup_size_bytes = Histogram::with_opts(
            HistogramOpts::new("backstop_backup_size_bytes", "Stored artifact size in bytes")
                .buckets(prometheus::exponential_buckets(4096.0, 4.0, 12).map_err(|e| {
                    metric_error("backup_size_bytes buckets", e)
                })?),
        )
        .map_err(|e| metric_error("backup_size_bytes", e))?;

        let backup_duration_seconds = Histogram::with_opts(HistogramOpts::new(
            "backstop_backup_duration_seconds",
            "Duration of backup creation in seconds",
        ))
        .map_err(|e| metric_error("backup_duration_seconds", e))?;

        let verifications_total = IntCounterVec::new(
            Opts::new("backstop_verifications_total", "Artifact verifications"),
            &["result"],
        )
        .map_err(|e| metric_error("verifications_total", e))?;

        let restores_total = IntCounterVec::new(
            Opts::new("backstop_restores_total", "Restore attempts"),
            &["result"],
        )
        .map_err(|e| metric_error("restores_total", e))?;

        let restore_duration_seconds = Histogram::with_opts(HistogramOpts::new(
            "backstop_restore_duration_seconds",
            "Duration of restores in seconds",
        ))
        .map_err(|e| metric_error("restore_duration_seconds", e))?;

        let replications_total = IntCounterVec::new(
            Opts::new("backstop_replications_total", "Replication attempts per provider"),
            &["provider", "result"],
        )
        .map_err(|e| metric_error("replications_total", e))?;

        let replication_duration_seconds = HistogramVec::new(
            HistogramOpts::new(
                "backstop_replication_duration_seconds",
                "Duration of replication per provider in seconds",
            ),
            &["provider"],
        )
        .map_err(|e| metric_error("replication_duration_seconds", e))?;

        let active_backups = IntGauge::new("backstop_active_backups", "Active backups in the catalog")
            .map_err(|e| metric_error("active_backups", e))?;

        let active_bytes = IntGauge::new(
            "backstop_active_bytes",
            "Total stored bytes of active backups",
        )
        .map_err(|e| metric_error("active_bytes", e))?;

        let oldest_backup_age_seconds = Gauge::new(
            "backstop_oldest_backup_age_seconds",
            "Age of the oldest active backup",
        )
        .map_err(|e| metric_error("oldest_backup_age_seconds", e))?;

        let newest_backup_age_seconds = Gauge::new(
            "backstop_newest_backup_age_seconds",
            "Age of the newest active backup",
        )
        .map_err(|e| metric_error("newest_backup_age_seconds", e))?;

        registry
            .register(Box::new(backups_created_total.clone()))
            .map_err(|e| metric_error("backups_created_total", e))?;
        registry
            .register(Box::new(backup_failures_total.clone()))
            .map_err(|e| metric_error("backup_failures_total", e))?;
        registry
            .register(Box::new(backups_deleted_total.clone()))
            .map_err(|e| metric_error("backups_deleted_total", e))?;
        registry
            .register(Box::new(backup_size_bytes.clone()))
            .map_err(|e| metric_error("backup_size_bytes", e))?;
        registry
            .register(Box::new(backup_duration_seconds.clone()))
            .map_err(|e| metric_error("backup_duration_seconds", e))?;
        registry
            .register(Box::new(verifications_total.clone()))
            .map_err(|e| metric_error("verifications_total", e))?;
        registry
            .register(Box::new(restores_total.clone()))
            .map_err(|e| metric_error("restores_total", e))?;
        registry
            .register(Box::new(restore_duration_seconds.clone()))
            .map_err(|e| metric_error("restore_duration_seconds", e))?;
        registry
            .register(Box::new(replications_total.clone()))
            .map_err(|e| metric_error("replications_total", e))?;
        registry
            .register(Box::new(replication_duration_seconds.clone()))
            .map_err(|e| metric_error("replication_duration_seconds", e))?;
        registry
            .register(Box::new(active_backups.clone()))
            .map_err(|e| metric_error("active_backups", e))?;
        registry
            .register(Box::new(active_bytes.clone()))
            .map_err(|e| metric_error("active_bytes", e))?;
        registry
            .register(Box::new(oldest_backup_age_seconds.clone()))
            .map_err(|e| metric_error("oldest_backup_age_seconds", e))?;
        registry
            .register(Box::new(newest_backup_age_seconds.clone()))
            .map_err(|e| metric_error("newest_backup_age_seconds", e))?;

        Ok(Self {
            backups_created_total,
            backup_failures_total,
            backups_deleted_total,
            backup_size_bytes,
            backup_duration_seconds,
            verifications_total,
            restores_total,
            restore_duration_seconds,
            replications_total,
            replication_duration_seconds,
            active_backups,
            active_bytes,
            oldest_backup_age_seconds,
            newest_backup_age_seconds,
            registry,
        })
    }

    /// Gather metrics in Prometheus text format
    pub fn gather_metrics(&self) -> Result<String> {
        let encoder = TextEncoder::new();
        let metric_families = self.registry.gather();
        let mut buffer = Vec::new();

        encoder
            .encode(&metric_families, &mut buffer)
            .map_err(|e| BackstopError::Metrics(format!("Failed to encode metrics: {e}")))?;

        String::from_utf8(buffer)
            .map_err(|e| BackstopError::Metrics(format!("Failed to convert metrics to string: {e}")))
    }
}

#[cfg(feature = "metrics")]
fn outcome(ok: bool) -> &'static str {
    if ok {
        "success"
    } else {
        "failure"
    }
}

#[cfg(feature = "metrics")]
impl MetricsSink for PrometheusMetrics {
    fn backup_created(
        &self,
        kind: BackupKind,
        compression: Compression,
        size_bytes: u64,
        duration: Duration,
    ) {
        self.backups_created_total
            .with_label_values(&[kind.as_str(), compression.algorithm_name()])
            .inc();
        self.backup_size_bytes.observe(size_bytes as f64);
        self.backup_duration_seconds.observe(duration.as_secs_f64());
    }

    fn backup_failed(&self, kind: BackupKind, reason: &'static str) {
        self.backup_failures_total
            .with_label_values(&[kind.as_str(), reason])
            .inc();
    }

    fn backup_deleted(&self, kind: BackupKind) {
        self.backups_deleted_total
            .with_label_values(&[kind.as_str()])
            .inc();
    }

    fn verification(&self, passed: bool) {
        self.verifications_total
            .with_label_values(&[outcome(passed)])
            .inc();
    }

    fn restore(&self, succeeded: bool, duration: Duration) {
        self.restores_total
            .with_label_values(&[outcome(succeeded)])
            .inc();
        self.restore_duration_seconds.observe(duration.as_secs_f64());
    }

    fn replication(&self, provider: &str, succeeded: bool, duration: Duration) {
        self.replications_total
            .with_label_values(&[provider, outcome(succeeded)])
            .inc();
        self.replication_duration_seconds
            .with_label_values(&[provider])
            .observe(duration.as_secs_f64());
    }

    fn catalog_state(&self, gauges: &CatalogGauges) {
        self.active_backups.set(gauges.active_backups as i64);
        self.active_bytes
            .set(i64::try_from(gauges.active_bytes).unwrap_or(i64::MAX));
        self.oldest_backup_age_seconds
            .set(gauges.oldest_age.map_or(0.0, |d| d.as_secs_f64()));
        self.newest_backup_age_seconds
            .set(gauges.newest_age.map_or(0.0, |d| d.as_secs_f64()));
    }
}

/// Install the global tracing subscriber.
///
/// `RUST_LOG` overrides the default filter. With `json` set, log lines are
/// emitted as JSON objects for log shippers; otherwise a compact
/// human-readable format is used.
pub fn init_observability(json: bool) -> Result<()> {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(DEFAULT_LOG_FILTER));

    let json_layer = json.then(|| {
        tracing_subscriber::fmt::layer()
            .json()
            .with_target(false)
            .with_current_span(false)
    });
    let text_layer = (!json).then(|| tracing_subscriber::fmt::layer().with_target(false));

    let subscriber = TracingRegistry::default()
        .with(filter)
        .with(json_layer)
        .with(text_layer);

    set_global_default(subscriber).map_err(|e| {
        BackstopError::validation(format!("Failed to set global tracing subscriber: {e}"))
    })?;

    tracing::debug!("Backstop observability initialized");
    Ok(())
}

/// Initialize observability with default settings (human-readable logs)
pub fn init_default_observability() -> Result<()> {
    init_observability(false)
}
