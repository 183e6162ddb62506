use super::{ImageObject, StorageBackend};
use crate::config::SupabaseStorageConfig;
use crate::types::{PipelineError, Result};
use async_trait::async_trait;
use reqwest::{header, Client};
use std::time::Duration;
use tracing::debug;

/// Supabase storage over its REST API.
pub struct SupabaseStorageBackend {
    client: Client,
    base_url: String,
    service_key: String,
    bucket: String,
}

impl SupabaseStorageBackend {
    pub fn new(config: &SupabaseStorageConfig, timeout: Duration) -> Result<Self> {
        let client = Client::builder().timeout(timeout).build()?;
        Ok(Self {
            client,
            base_url: config.url.trim_end_matches('/').to_string(),
            service_key: config.service_key.clone(),
            bucket: config.bucket.clone(),
        })
    }

    fn public_url(&self, key: &str) -> String {
        format!("{}/storage/v1/object/public/{}/{}", self.base_url, self.bucket, key)
    }
}

#[async_trait]
impl StorageBackend for SupabaseStorageBackend {
    fn name(&self) -> &str {
        "supabase-storage"
    }

    async fn store(&self, object: &ImageObject) -> Result<String> {
        let upload_url = format!("{}/storage/v1/object/{}/{}", self.base_url, self.bucket, object.key);

        let response = self
            .client
            .post(&upload_url)
            .bearer_auth(&self.service_key)
            .header("apikey", &self.service_key)
            .header(header::CONTENT_TYPE, &object.content_type)
            .header(header::CACHE_CONTROL, "max-age=31536000")
            .header("x-upsert", "true")
            .body(object.bytes.clone())
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(PipelineError::Storage(format!(
                "upload of {} returned {}: {}",
                object.key, status, body
            )));
        }

        debug!("Uploaded {} to storage bucket {}", object.key, self.bucket);
        Ok(self.public_url(&object.key))
    }
}
