//! S3-compatible object store (AWS S3, MinIO, R2, ...) on the AWS SDK.

use async_trait::async_trait;
use aws_config::{BehaviorVersion, Region};
use aws_sdk_s3::config::timeout::TimeoutConfig;
use aws_sdk_s3::error::SdkError;
use aws_sdk_s3::presigning::PresigningConfig;
use aws_sdk_s3::primitives::ByteStream as SdkByteStream;
use aws_sdk_s3::Client;
use bytes::Bytes;
use futures::TryStreamExt;
use std::path::Path;
use std::time::Duration;
use tokio_util::io::ReaderStream;

use super::{ByteStream, ObjectStore, ObjectStoreError};
use crate::storage::models::StorageType;

/// Longest presigned URL lifetime S3 accepts (7 days).
const MAX_PRESIGN_SECS: u64 = 7 * 24 * 3600;

#[derive(Clone)]
pub struct S3Credentials {
    pub access_key_id: String,
    pub secret_access_key: String,
}

impl std::fmt::Debug for S3Credentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("S3Credentials")
            .field("access_key_id", &self.access_key_id)
            .field("secret_access_key", &"<redacted>")
            .finish()
    }
}

pub struct S3Store {
    client: Client,
    bucket: String,
}

fn is_not_found<E>(err: &SdkError<E>) -> bool {
    matches!(err, SdkError::ServiceError(se) if se.raw().status().as_u16() == 404)
}

fn backend_error<E>(what: &str, err: SdkError<E>) -> ObjectStoreError
where
    E: std::error::Error + Send + Sync + 'static,
{
    match err {
        SdkError::TimeoutError(_) => ObjectStoreError::Backend(format!("S3 {what} timed out")),
        other => ObjectStoreError::Backend(format!("S3 {what} failed: {other}")),
    }
}

impl S3Store {
    /// `path_style` addresses objects as `endpoint/bucket/key`, which MinIO
    /// and most self-hosted clones need.
    pub fn new(
        endpoint: &str,
        bucket: &str,
        region: &str,
        credentials: S3Credentials,
        path_style: bool,
        timeout: Duration,
    ) -> Result<Self, anyhow::Error> {
        if bucket.is_empty() {
            anyhow::bail!("S3 bucket name is empty");
        }
        let endpoint = if endpoint.starts_with("http://") || endpoint.starts_with("https://") {
            endpoint.trim_end_matches('/').to_string()
        } else {
            format!("https://{}", endpoint.trim_end_matches('/'))
        };

        let credentials = aws_sdk_s3::config::Credentials::new(
            credentials.access_key_id,
            credentials.secret_access_key,
            None,
            None,
            "storage-orchestrator",
        );
        let config = aws_sdk_s3::config::Builder::new()
            .behavior_version(BehaviorVersion::latest())
            .region(Region::new(region.to_string()))
            .endpoint_url(endpoint)
            .credentials_provider(credentials)
            .force_path_style(path_style)
            .timeout_config(TimeoutConfig::builder().operation_timeout(timeout).build())
            .build();

        Ok(Self {
            client: Client::from_conf(config),
            bucket: bucket.to_string(),
        })
    }

    async fn upload(&self, key: &str, body: SdkByteStream) -> Result<(), ObjectStoreError> {
        self.client
            .put_object()
            .bucket(&self.bucket)
            .key(key)
            .content_type("application/octet-stream")
            .body(body)
            .send()
            .await
            .map_err(|e| backend_error("upload", e))?;
        Ok(())
    }

    async fn fetch(
        &self,
        key: &str,
    ) -> Result<aws_sdk_s3::operation::get_object::GetObjectOutput, ObjectStoreError> {
        self.client
            .get_object()
            .bucket(&self.bucket)
            .key(key)
            .send()
            .await
            .map_err(|e| {
                if is_not_found(&e) {
                    ObjectStoreError::NotFound(key.to_string())
                } else {
                    backend_error("download", e)
                }
            })
    }
}

#[async_trait]
impl ObjectStore for S3Store {
    fn storage_type(&self) -> StorageType {
        StorageType::S3Compatible
    }

    async fn put(&self, key: &str, data: Bytes) -> Result<(), ObjectStoreError> {
        self.upload(key, data.into()).await
    }

    async fn put_file(&self, key: &str, path: &Path) -> Result<(), ObjectStoreError> {
        let body = SdkByteStream::from_path(path)
            .await
            .map_err(|e| ObjectStoreError::Backend(format!("S3 upload body: {e}")))?;
        self.upload(key, body).await
    }

    async fn get(&self, key: &str) -> Result<Bytes, ObjectStoreError> {
        let output = self.fetch(key).await?;
        let data = output
            .body
            .collect()
            .await
            .map_err(|e| ObjectStoreError::Backend(e.to_string()))?;
        Ok(data.into_bytes())
    }

    async fn get_stream(&self, key: &str) -> Result<ByteStream, ObjectStoreError> {
        let output = self.fetch(key).await?;
        let stream =
            ReaderStream::new(output.body.into_async_read()).map_err(ObjectStoreError::Io);
        Ok(Box::pin(stream))
    }

    async fn delete(&self, key: &str) -> Result<(), ObjectStoreError> {
        // S3 answers 204 for missing keys too; 404 only comes from some clones.
        match self
            .client
            .delete_object()
            .bucket(&self.bucket)
            .key(key)
            .send()
            .await
        {
            Ok(_) => Ok(()),
            Err(e) if is_not_found(&e) => Ok(()),
            Err(e) => Err(backend_error("delete", e)),
        }
    }

    async fn exists(&self, key: &str) -> Result<bool, ObjectStoreError> {
        match self
            .client
            .head_object()
            .bucket(&self.bucket)
            .key(key)
            .send()
            .await
        {
            Ok(_) => Ok(true),
            Err(e) if is_not_found(&e) => Ok(false),
            Err(e) => Err(backend_error("head", e)),
        }
    }

    async fn signed_url(&self, key: &str, ttl: Duration) -> Result<String, ObjectStoreError> {
        let expires = Duration::from_secs(ttl.as_secs().clamp(1, MAX_PRESIGN_SECS));
        let presigning = PresigningConfig::expires_in(expires)
            .map_err(|e| ObjectStoreError::Config(e.to_string()))?;
        let request = self
            .client
            .get_object()
            .bucket(&self.bucket)
            .key(key)
            .presigned(presigning)
            .await
            .map_err(|e| backend_error("presign", e))?;
        Ok(request.uri().to_string())
    }
}
