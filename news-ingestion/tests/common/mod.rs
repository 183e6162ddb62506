#![allow(dead_code)]

use async_trait::async_trait;
use news_ingestion::config::PipelineConfig;
use news_ingestion::images::{ImageObject, StorageBackend};
use news_ingestion::types::{PipelineError, Result};
use std::sync::Mutex;
use std::time::Duration;
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_max_level(tracing::Level::INFO)
        .try_init();
}

/// Config tuned for local mock servers: no host pacing, short timeouts.
pub fn test_config() -> PipelineConfig {
    let mut config = PipelineConfig::default();
    config.fetch.min_host_interval_ms = 0;
    config.fetch.retry_delay_seconds = 1;
    config.fetch.max_retries = 1;
    config.fetch.timeout_seconds = 5;
    config.images.download_timeout_secs = 2;
    config.images.upload_timeout_secs = 2;
    config
}

pub struct Item<'a> {
    pub title: &'a str,
    pub link: &'a str,
    pub image: Option<&'a str>,
}

pub fn rss(items: &[Item<'_>]) -> String {
    let body: String = items
        .iter()
        .map(|item| {
            let media = item
                .image
                .map(|url| format!(r#"<media:content url="{}" type="image/jpeg"/>"#, url))
                .unwrap_or_default();
            format!(
                r#"<item><title>{title}</title><link>{link}</link><guid>{link}</guid>
                <pubDate>Tue, 05 Mar 2024 08:00:00 GMT</pubDate>
                <description>&lt;p&gt;Source text for {title}.&lt;/p&gt;</description>{media}</item>"#,
                title = item.title,
                link = item.link,
                media = media,
            )
        })
        .collect();

    format!(
        r#"<?xml version="1.0" encoding="UTF-8"?>
<rss version="2.0" xmlns:media="http://search.yahoo.com/mrss/">
<channel><title>Test feed</title><link>https://x/</link><description>fixture</description>
{}
</channel></rss>"#,
        body
    )
}

pub async fn mount_feed(server: &MockServer, route: &str, xml: String) {
    Mock::given(method("GET"))
        .and(path(route))
        .respond_with(ResponseTemplate::new(200).set_body_raw(xml, "application/rss+xml"))
        .mount(server)
        .await;
}

pub async fn mount_image(server: &MockServer, route: &str) {
    Mock::given(method("GET"))
        .and(path(route))
        .respond_with(ResponseTemplate::new(200).set_body_raw(vec![0xFF, 0xD8, 0xFF, 0xE0, 1, 2, 3], "image/jpeg"))
        .mount(server)
        .await;
}

/// Backend that records what it stores and serves it from a fake CDN.
#[derive(Default)]
pub struct RecordingBackend {
    pub stored: Mutex<Vec<ImageObject>>,
}

#[async_trait]
impl StorageBackend for RecordingBackend {
    fn name(&self) -> &str {
        "recording"
    }

    async fn store(&self, object: &ImageObject) -> Result<String> {
        if let Ok(mut stored) = self.stored.lock() {
            stored.push(object.clone());
        }
        Ok(format!("https://cdn.test/{}", object.key))
    }
}

pub struct FailingBackend;

#[async_trait]
impl StorageBackend for FailingBackend {
    fn name(&self) -> &str {
        "failing"
    }

    async fn store(&self, _object: &ImageObject) -> Result<String> {
        Err(PipelineError::Storage("bucket not writable".to_string()))
    }
}

pub struct SlowBackend(pub Duration);

#[async_trait]
impl StorageBackend for SlowBackend {
    fn name(&self) -> &str {
        "slow"
    }

    async fn store(&self, object: &ImageObject) -> Result<String> {
        tokio::time::sleep(self.0).await;
        Ok(format!("https://slow.test/{}", object.key))
    }
}
