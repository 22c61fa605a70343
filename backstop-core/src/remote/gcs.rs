/*!
Google Cloud Storage remote store.

Authentication follows the default GCP chain:
1. GOOGLE_APPLICATION_CREDENTIALS pointing to a service account JSON file
2. Service account attached to the compute instance (GCE, GKE, Cloud Run)
3. gcloud user credentials when running locally
*/

use std::path::Path;

use async_trait::async_trait;
use google_cloud_storage::client::{Client as GcsClient, ClientConfig};
use google_cloud_storage::http::buckets::get::GetBucketRequest;
use google_cloud_storage::http::objects::delete::DeleteObjectRequest;
use google_cloud_storage::http::objects::get::GetObjectRequest;
use google_cloud_storage::http::objects::upload::{Media, UploadObjectRequest, UploadType};
use tokio::fs::File;
use tokio_util::io::ReaderStream;
use tracing::{debug, error, info};

use super::{object_key, RemoteError, RemoteResult, RemoteStore};
use crate::{BackstopError, Result};

const UPLOAD_CHUNK_SIZE: usize = 1024 * 1024;

/// Remote store backed by a GCS bucket
#[derive(Clone)]
pub struct GcsStore {
    client: GcsClient,
    bucket: String,
    prefix: String,
}

impl std::fmt::Debug for GcsStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GcsStore")
            .field("bucket", &self.bucket)
            .field("prefix", &self.prefix)
            .finish()
    }
}

impl GcsStore {
    /// Authenticate and check that the bucket is reachable
    pub async fn connect(bucket: String, prefix: String) -> Result<Self> {
        let config = ClientConfig::default()
            .with_auth()
            .await
            .map_err(|e| BackstopError::remote(format!("GCS authentication failed: {e}")))?;
        let client = GcsClient::new(config);

        // fail fast on a missing bucket or insufficient permissions
        client
            .get_bucket(&GetBucketRequest {
                bucket: bucket.clone(),
                ..Default::default()
            })
            .await
            .map_err(|e| {
                BackstopError::remote(format!(
                    "Failed to access GCS bucket '{bucket}': {e}. Ensure the bucket exists and you have proper permissions."
                ))
            })?;

        info!(bucket = %bucket, prefix = %prefix, "Initialized GCS remote store");
        Ok(Self {
            client,
            bucket,
            prefix,
        })
    }

    fn full_key(&self, key: &str) -> String {
        object_key(&self.prefix, key)
    }

    fn uri(&self, full_key: &str) -> String {
        format!("gs://{}/{}", self.bucket, full_key)
    }
}

#[async_trait]
impl RemoteStore for GcsStore {
    fn provider(&self) -> String {
        "gcs".to_string()
    }

    async fn upload_file(&self, local: &Path, key: &str) -> RemoteResult<String> {
        let full_key = self.full_key(key);
        let (stream, size) = open_upload_stream(local).await?;
        let req = UploadObjectRequest {
            bucket: self.bucket.clone(),
            ..Default::default()
        };
        let mut media = Media::new(full_key.clone());
        media.content_length = Some(size);
        let upload_type = UploadType::Simple(media);

        self.client
            .upload_streamed_object(&req, stream, &upload_type)
            .await
            .map_err(|e| {
                let mapped = map_gcs_error("upload_streamed_object", &e, &full_key);
                error!(bucket = %self.bucket, key = %full_key, error = %mapped, "GCS upload failed");
                mapped
            })?;

        debug!(bucket = %self.bucket, key = %full_key, size, "Streamed artifact to GCS");
        Ok(self.uri(&full_key))
    }

    async fn upload_bytes(&self, data: Vec<u8>, key: &str) -> RemoteResult<String> {
        let full_key = self.full_key(key);
        let size = data.len();
        let req = UploadObjectRequest {
            bucket: self.bucket.clone(),
            ..Default::default()
        };
        let upload_type = UploadType::Simple(Media::new(full_key.clone()));

        self.client
            .upload_object(&req, data, &upload_type)
            .await
            .map_err(|e| {
                let mapped = map_gcs_error("upload_object", &e, &full_key);
                error!(bucket = %self.bucket, key = %full_key, error = %mapped, "GCS upload failed");
                mapped
            })?;

        debug!(bucket = %self.bucket, key = %full_key, size, "Uploaded object to GCS");
        Ok(self.uri(&full_key))
    }

    async fn exists(&self, key: &str) -> RemoteResult<bool> {
        let full_key = self.full_key(key);
        let req = GetObjectRequest {
            bucket: self.bucket.clone(),
            object: full_key.clone(),
            ..Default::default()
        };
        match self.client.get_object(&req).await {
            Ok(_) => Ok(true),
            Err(e) if is_not_found(&e.to_string()) => Ok(false),
            Err(e) => Err(map_gcs_error("get_object", &e, &full_key)),
        }
    }

    async fn delete(&self, key: &str) -> RemoteResult<()> {
        let full_key = self.full_key(key);
        let req = DeleteObjectRequest {
            bucket: self.bucket.clone(),
            object: full_key.clone(),
            ..Default::default()
        };
        match self.client.delete_object(&req).await {
            Ok(()) => Ok(()),
            Err(e) if is_not_found(&e.to_string()) => Ok(()),
            Err(e) => Err(map_gcs_error("delete_object", &e, &full_key)),
        }
    }
}

/// Open `local` as a chunked byte stream, returning it with the file size
async fn open_upload_stream(local: &Path) -> RemoteResult<(ReaderStream<File>, u64)> {
    let read_failed =
        |e: std::io::Error| RemoteError::permanent(format!("Failed to read {}: {e}", local.display()));
    let file = File::open(local).await.map_err(read_failed)?;
    let size = file.metadata().await.map_err(read_failed)?.len();
    Ok((ReaderStream::with_capacity(file, UPLOAD_CHUNK_SIZE), size))
}

fn is_not_found(error_str: &str) -> bool {
    error_str.contains("404") || error_str.to_ascii_lowercase().contains("not found")
}

fn is_transient(error_str: &str) -> bool {
    const TRANSIENT_MARKERS: &[&str] = &[
        "429", "499", "500", "502", "503", "504", "timeout", "timed out", "connection", "network",
    ];
    let lower = error_str.to_ascii_lowercase();
    TRANSIENT_MARKERS.iter().any(|m| lower.contains(m))
}

/// Map GCS client errors to a transient or permanent remote error
fn map_gcs_error(
    operation: &str,
    error: &google_cloud_storage::http::Error,
    key: &str,
) -> RemoteError {
    classify_gcs_message(operation, &error.to_string(), key)
}

fn classify_gcs_message(operation: &str, error_str: &str, key: &str) -> RemoteError {
    if error_str.contains("403") || error_str.contains("401") {
        RemoteError::permanent(format!(
            "GCS permission denied for object '{key}': Ensure you have proper IAM permissions. Error: {error_str}"
        ))
    } else if is_not_found(error_str) {
        RemoteError::permanent(format!("GCS object or bucket not found: {key}"))
    } else if is_transient(error_str) {
        RemoteError::transient(format!(
            "GCS {operation} failed for object '{key}' (transient): {error_str}"
        ))
    } else {
        RemoteError::permanent(format!("GCS {operation} error for object '{key}': {error_str}"))
    }
}
