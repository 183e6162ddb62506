use super::{ImageObject, StorageBackend, CACHE_CONTROL};
use crate::config::ObjectStorageConfig;
use crate::types::{PipelineError, Result};
use async_trait::async_trait;
use aws_sdk_s3::config::{BehaviorVersion, Credentials, Region};
use aws_sdk_s3::primitives::ByteStream;
use aws_sdk_s3::types::ObjectCannedAcl;
use aws_sdk_s3::Client;
use tracing::debug;

/// S3-compatible object storage (OVH, MinIO, AWS).
pub struct ObjectStorageBackend {
    client: Client,
    bucket: String,
    public_base: String,
}

impl ObjectStorageBackend {
    pub fn new(config: &ObjectStorageConfig) -> Self {
        let credentials = Credentials::new(
            config.access_key.clone(),
            config.secret_key.clone(),
            None,
            None,
            "news-ingestion",
        );
        let s3_config = aws_sdk_s3::config::Builder::new()
            .behavior_version(BehaviorVersion::latest())
            .region(Region::new(config.region.clone()))
            .endpoint_url(config.endpoint.clone())
            .credentials_provider(credentials)
            .force_path_style(true)
            .build();

        Self {
            client: Client::from_conf(s3_config),
            bucket: config.bucket.clone(),
            public_base: config.public_base_url(),
        }
    }
}

#[async_trait]
impl StorageBackend for ObjectStorageBackend {
    fn name(&self) -> &str {
        "object-storage"
    }

    async fn store(&self, object: &ImageObject) -> Result<String> {
        self.client
            .put_object()
            .bucket(&self.bucket)
            .key(&object.key)
            .body(ByteStream::from(object.bytes.clone()))
            .content_type(&object.content_type)
            .acl(ObjectCannedAcl::PublicRead)
            .cache_control(CACHE_CONTROL)
            .send()
            .await
            .map_err(|e| PipelineError::Storage(format!("put_object {}: {}", object.key, e)))?;

        debug!("Uploaded {} to bucket {}", object.key, self.bucket);
        Ok(format!("{}/{}", self.public_base.trim_end_matches('/'), object.key))
    }
}
