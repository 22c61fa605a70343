/*!
Best-effort replication of artifacts to remote stores.

A replication uploads the artifact under its file name and a `<id>.json`
copy of the record next to it, retrying transient failures with backoff,
all inside one bounded wait. Only after both uploads succeed is the copy
recorded in the catalog. A failure is reported to the caller and leaves the
record and the local artifact exactly as they were.
*/

use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use backoff::ExponentialBackoff;
use backstop_retry::{
    classify, cloud_storage_backoff_policy, with_custom_backoff, RetryError, DEFAULT_MAX_ATTEMPTS,
};
use chrono::Utc;
use futures::future::join_all;
use tracing::{debug, info, warn};

use crate::catalog::Catalog;
use crate::observability::MetricsSink;
use crate::record::{BackupRecord, RemoteCopy};
use crate::remote::{RemoteRegistry, RemoteStore};
use crate::{BackstopError, Result};

/// Uploads artifacts to registered remote stores and records the copies
#[derive(Clone)]
pub struct Replicator {
    catalog: Arc<Catalog>,
    remotes: RemoteRegistry,
    metrics: Arc<dyn MetricsSink>,
    timeout: Duration,
    max_attempts: usize,
    policy: fn() -> ExponentialBackoff,
}

impl Replicator {
    pub fn new(
        catalog: Arc<Catalog>,
        remotes: RemoteRegistry,
        metrics: Arc<dyn MetricsSink>,
        timeout: Duration,
    ) -> Self {
        Self {
            catalog,
            remotes,
            metrics,
            timeout,
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            policy: cloud_storage_backoff_policy,
        }
    }

    /// Override the attempt ceiling and backoff policy for uploads
    pub fn with_retry(mut self, max_attempts: usize, policy: fn() -> ExponentialBackoff) -> Self {
        self.max_attempts = max_attempts;
        self.policy = policy;
        self
    }

    pub fn providers(&self) -> Vec<String> {
        self.remotes.providers()
    }

    /// Replicate one backup to one provider
    ///
    /// Already-replicated backups are skipped and the recorded copy is
    /// returned. The whole upload, retries included, is bounded by the
    /// replication timeout.
    ///
    /// # Errors
    /// * `BackstopError::BackupNotFound` - unknown id
    /// * `BackstopError::ReplicationFailure` - deleted backup, unknown
    ///   provider, upload failure or timeout
    pub async fn replicate(&self, id: &str, provider: &str) -> Result<RemoteCopy> {
        let catalog = Arc::clone(&self.catalog);
        let lookup = id.to_string();
        let record = tokio::task::spawn_blocking(move || catalog.get_fresh(&lookup))
            .await
            .map_err(|e| BackstopError::catalog(format!("catalog read task failed: {e}")))??
            .ok_or_else(|| BackstopError::BackupNotFound(id.to_string()))?;
        if !record.is_active() {
            return Err(BackstopError::replication(
                provider,
                format!("backup {id} has been deleted"),
            ));
        }
        if let Some(copy) = record.remote_copy(provider) {
            debug!(backup_id = %id, provider = %provider, uri = %copy.uri, "Already replicated; skipping");
            return Ok(copy.clone());
        }
        let store = self.remotes.get(provider).ok_or_else(|| {
            BackstopError::replication(provider, "no remote store registered under this name")
        })?;

        let started = Instant::now();
        let result = self.upload_and_record(store, record, provider).await;
        let elapsed = started.elapsed();
        self.metrics.replication(provider, result.is_ok(), elapsed);

        match &result {
            Ok(copy) => info!(
                backup_id = %id,
                provider = %provider,
                uri = %copy.uri,
                duration_ms = elapsed.as_millis() as u64,
                "Backup replicated"
            ),
            Err(e) => warn!(
                backup_id = %id,
                provider = %provider,
                error = %e,
                "Replication failed; local backup is unaffected"
            ),
        }
        result
    }

    /// Replicate one backup to several providers concurrently
    ///
    /// Each provider's outcome is reported independently, in input order.
    pub async fn replicate_to_all(
        &self,
        id: &str,
        providers: &[String],
    ) -> Vec<(String, Result<RemoteCopy>)> {
        join_all(providers.iter().map(|provider| async move {
            (provider.clone(), self.replicate(id, provider).await)
        }))
        .await
    }

    async fn upload_and_record(
        &self,
        store: Arc<dyn RemoteStore>,
        record: BackupRecord,
        provider: &str,
    ) -> Result<RemoteCopy> {
        let artifact_key = record
            .artifact_location
            .file_name()
            .and_then(|n| n.to_str())
            .map(str::to_string)
            .ok_or_else(|| {
                BackstopError::replication(
                    provider,
                    format!("invalid artifact path {}", record.artifact_location.display()),
                )
            })?;
        let sidecar = serde_json::to_vec_pretty(&record)?;
        let sidecar_key = format!("{}.json", record.id);

        let upload = self.upload(
            store,
            record.artifact_location.clone(),
            artifact_key,
            sidecar,
            sidecar_key,
        );
        let uri = match tokio::time::timeout(self.timeout, upload).await {
            Ok(Ok(uri)) => uri,
            Ok(Err(e)) => {
                warn!(
                    backup_id = %record.id,
                    provider = %provider,
                    stage = e.operation(),
                    "Upload stage gave up"
                );
                return Err(BackstopError::replication(provider, e.to_string()));
            }
            Err(_) => {
                return Err(BackstopError::replication(
                    provider,
                    format!("timed out after {}s", self.timeout.as_secs_f64()),
                ))
            }
        };

        let copy = RemoteCopy {
            provider: provider.to_string(),
            uri,
            replicated_at: Utc::now(),
        };
        let catalog = Arc::clone(&self.catalog);
        let id = record.id.clone();
        let recorded = copy.clone();
        tokio::task::spawn_blocking(move || {
            catalog.update_with(&id, |stored| {
                stored.add_remote_copy(recorded);
                Ok(())
            })
        })
        .await
        .map_err(|e| BackstopError::catalog(format!("catalog update task failed: {e}")))??;

        Ok(copy)
    }

    /// Upload the artifact, then its metadata sidecar, each with retries
    async fn upload(
        &self,
        store: Arc<dyn RemoteStore>,
        local: PathBuf,
        artifact_key: String,
        sidecar: Vec<u8>,
        sidecar_key: String,
    ) -> std::result::Result<String, RetryError> {
        let artifact_store = Arc::clone(&store);
        let uri = with_custom_backoff(
            "upload_artifact",
            (self.policy)(),
            self.max_attempts,
            move |attempt| {
                let store = Arc::clone(&artifact_store);
                let local = local.clone();
                let key = artifact_key.clone();
                Box::pin(async move {
                    debug!(key = %key, attempt, "Uploading artifact");
                    store
                        .upload_file(&local, &key)
                        .await
                        .map_err(|e| classify("upload_artifact", e))
                })
            },
        )
        .await?;

        with_custom_backoff(
            "upload_metadata",
            (self.policy)(),
            self.max_attempts,
            move |_| {
                let store = Arc::clone(&store);
                let data = sidecar.clone();
                let key = sidecar_key.clone();
                Box::pin(async move {
                    store
                        .upload_bytes(data, &key)
                        .await
                        .map_err(|e| classify("upload_metadata", e))
                })
            },
        )
        .await?;

        Ok(uri)
    }
}

impl std::fmt::Debug for Replicator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Replicator")
            .field("providers", &self.remotes.providers())
            .field("timeout", &self.timeout)
            .field("max_attempts", &self.max_attempts)
            .finish()
    }
}
