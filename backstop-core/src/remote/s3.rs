/*!
Amazon S3 remote store.

Uses the official AWS SDK and the standard credential provider chain:
1. Environment variables (AWS_ACCESS_KEY_ID, AWS_SECRET_ACCESS_KEY, AWS_SESSION_TOKEN)
2. AWS credentials file (~/.aws/credentials)
3. IAM roles for EC2 instances and ECS task roles
*/

use std::path::Path;

use async_trait::async_trait;
use aws_config::{BehaviorVersion, Region, SdkConfig};
use aws_sdk_s3::error::{ProvideErrorMetadata, SdkError};
use aws_sdk_s3::primitives::ByteStream;
use aws_sdk_s3::Client as S3Client;
use tracing::{debug, error, info};

use super::{object_key, RemoteError, RemoteResult, RemoteStore};
use crate::{BackstopError, Result};

/// S3 service error codes worth retrying
const TRANSIENT_CODES: &[&str] = &[
    "InternalError",
    "ServiceUnavailable",
    "SlowDown",
    "RequestTimeout",
    "RequestTimeTooSkewed",
];

/// Remote store backed by an S3 bucket
#[derive(Debug, Clone)]
pub struct S3Store {
    client: S3Client,
    bucket: String,
    prefix: String,
}

impl S3Store {
    /// Load AWS configuration from the environment and build a client
    pub async fn connect(bucket: String, prefix: String, region: Option<String>) -> Result<Self> {
        let mut loader = aws_config::defaults(BehaviorVersion::latest());
        if let Some(region) = region {
            loader = loader.region(Region::new(region));
        }
        let sdk_config = loader.load().await;

        if sdk_config.credentials_provider().is_none() {
            return Err(BackstopError::remote(
                "AWS credentials not found. Set AWS_ACCESS_KEY_ID, AWS_SECRET_ACCESS_KEY and AWS_REGION",
            ));
        }

        Ok(Self::with_config(bucket, prefix, &sdk_config))
    }

    /// Build a store from an explicit SDK configuration
    pub fn with_config(bucket: String, prefix: String, config: &SdkConfig) -> Self {
        Self::with_client(S3Client::new(config), bucket, prefix)
    }

    /// Use a preconfigured client, e.g. one with path-style addressing
    pub fn with_client(client: S3Client, bucket: String, prefix: String) -> Self {
        info!(bucket = %bucket, prefix = %prefix, "Initialized S3 remote store");
        Self {
            client,
            bucket,
            prefix,
        }
    }

    pub fn bucket(&self) -> &str {
        &self.bucket
    }

    fn full_key(&self, key: &str) -> String {
        object_key(&self.prefix, key)
    }

    fn uri(&self, full_key: &str) -> String {
        format!("s3://{}/{}", self.bucket, full_key)
    }

    async fn put(&self, body: ByteStream, key: &str) -> RemoteResult<String> {
        let full_key = self.full_key(key);
        debug!(bucket = %self.bucket, key = %full_key, "Starting S3 put_object operation");

        self.client
            .put_object()
            .bucket(&self.bucket)
            .key(&full_key)
            .body(body)
            .send()
            .await
            .map_err(|e| {
                let mapped = map_s3_error("put_object", e, &full_key);
                error!(bucket = %self.bucket, key = %full_key, error = %mapped, "S3 upload failed");
                mapped
            })?;

        Ok(self.uri(&full_key))
    }
}

#[async_trait]
impl RemoteStore for S3Store {
    fn provider(&self) -> String {
        "s3".to_string()
    }

    async fn upload_file(&self, local: &Path, key: &str) -> RemoteResult<String> {
        let body = ByteStream::from_path(local).await.map_err(|e| {
            RemoteError::permanent(format!("Failed to open {}: {e}", local.display()))
        })?;
        self.put(body, key).await
    }

    async fn upload_bytes(&self, data: Vec<u8>, key: &str) -> RemoteResult<String> {
        self.put(ByteStream::from(data), key).await
    }

    async fn exists(&self, key: &str) -> RemoteResult<bool> {
        let full_key = self.full_key(key);
        match self
            .client
            .head_object()
            .bucket(&self.bucket)
            .key(&full_key)
            .send()
            .await
        {
            Ok(_) => Ok(true),
            Err(e) if e.as_service_error().is_some_and(|se| se.is_not_found()) => Ok(false),
            Err(e) => Err(map_s3_error("head_object", e, &full_key)),
        }
    }

    async fn delete(&self, key: &str) -> RemoteResult<()> {
        let full_key = self.full_key(key);
        self.client
            .delete_object()
            .bucket(&self.bucket)
            .key(&full_key)
            .send()
            .await
            .map_err(|e| map_s3_error("delete_object", e, &full_key))?;
        debug!(bucket = %self.bucket, key = %full_key, "Deleted S3 object");
        Ok(())
    }
}

/// Map AWS SDK errors to a transient or permanent remote error
fn map_s3_error<E: ProvideErrorMetadata + std::fmt::Debug>(
    op: &str,
    error: SdkError<E>,
    key: &str,
) -> RemoteError {
    match &error {
        SdkError::DispatchFailure(dispatch_err) => RemoteError::transient(format!(
            "S3 {op} request failed to dispatch: {dispatch_err:?}"
        )),
        SdkError::TimeoutError(_) => {
            RemoteError::transient(format!("S3 {op} request timed out (key: {key})"))
        }
        SdkError::ResponseError(response_err) => {
            RemoteError::transient(format!("S3 {op} response error: {response_err:?}"))
        }
        SdkError::ServiceError(service_err) => {
            let status = service_err.raw().status().as_u16();
            let message = service_err.err().message().unwrap_or("Unknown error");
            match service_err.err().code() {
                Some(code) if TRANSIENT_CODES.contains(&code) => {
                    RemoteError::transient(format!("S3 service error ({code}): {message}"))
                }
                Some("NoSuchBucket") => RemoteError::permanent("S3 bucket not found"),
                Some("AccessDenied") | Some("Forbidden") => RemoteError::permanent(
                    "Access denied to S3 (check credentials and permissions)",
                ),
                Some(code) if status >= 500 => {
                    RemoteError::transient(format!("S3 service error ({code}): {message}"))
                }
                Some(code) => {
                    RemoteError::permanent(format!("S3 service error ({code}): {message}"))
                }
                None if status >= 500 => {
                    RemoteError::transient(format!("S3 {op} failed with HTTP {status}"))
                }
                None => RemoteError::permanent(format!("S3 {op} service error: {service_err:?}")),
            }
        }
        _ => RemoteError::permanent(format!("S3 {op} error: {error:?}")),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use aws_sdk_s3::operation::put_object::PutObjectError;
    use backstop_retry::RetryableError;

    #[test]
    fn test_timeout_is_transient() {
        let err: SdkError<PutObjectError> = SdkError::timeout_error("request timed out");
        let mapped = map_s3_error("put_object", err, "db/full-x.db.gz");

        assert!(mapped.is_transient());
        assert!(mapped.to_string().contains("timed out"));
        assert!(mapped.to_string().contains("db/full-x.db.gz"));
    }

    #[test]
    fn test_construction_failure_is_permanent() {
        let err: SdkError<PutObjectError> = SdkError::construction_failure("missing bucket");
        assert!(map_s3_error("put_object", err, "k").is_permanent());
    }

    #[test]
    fn test_keys_and_uris_include_prefix() {
        let config = SdkConfig::builder()
            .behavior_version(BehaviorVersion::latest())
            .region(Region::new("us-east-1"))
            .build();
        let store = S3Store::with_config("bucket".into(), "db/prod".into(), &config);

        let key = store.full_key("full-x.db.gz");
        assert_eq!(key, "db/prod/full-x.db.gz");
        assert_eq!(store.uri(&key), "s3://bucket/db/prod/full-x.db.gz");
        assert_eq!(store.provider(), "s3");
    }
}
