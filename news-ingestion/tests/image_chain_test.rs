mod common;

use anyhow::Result;
use common::{init_tracing, mount_image, test_config, FailingBackend, RecordingBackend, SlowBackend};
use news_ingestion::config::ImageConfig;
use news_ingestion::images::{defaults_for, ImageAcquirer};
use news_ingestion::Fetcher;
use std::sync::Arc;
use std::time::Duration;
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

fn acquirer(images: ImageConfig) -> Result<ImageAcquirer> {
    let fetcher = Arc::new(Fetcher::new(test_config().fetch)?);
    Ok(ImageAcquirer::new(fetcher, images))
}

#[tokio::test]
async fn missing_candidate_gets_a_default() -> Result<()> {
    init_tracing();
    let backend = Arc::new(RecordingBackend::default());
    let chain = acquirer(test_config().images)?.with_backend(backend.clone());

    let url = chain.acquire(None, "quiet-day", "culture").await;
    assert!(defaults_for("culture").contains(&url.as_str()));
    assert!(backend.stored.lock().expect("lock").is_empty());

    // deterministic per slug
    assert_eq!(url, chain.acquire(None, "quiet-day", "culture").await);
    Ok(())
}

#[tokio::test]
async fn unreachable_candidate_gets_a_default() -> Result<()> {
    init_tracing();
    let chain = acquirer(test_config().images)?.with_backend(Arc::new(RecordingBackend::default()));

    let url = chain.acquire(Some("http://127.0.0.1:9/gone.jpg"), "gone", "sport").await;
    assert!(defaults_for("sport").contains(&url.as_str()));
    Ok(())
}

#[tokio::test]
async fn slow_download_gets_a_default() -> Result<()> {
    init_tracing();
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/slow.jpg"))
        .respond_with(
            ResponseTemplate::new(200)
                .set_body_raw(vec![1, 2, 3], "image/jpeg")
                .set_delay(Duration::from_secs(3)),
        )
        .mount(&server)
        .await;

    let images = ImageConfig { download_timeout_secs: 1, ..test_config().images };
    let chain = acquirer(images)?;

    let url = chain.acquire(Some(&format!("{}/slow.jpg", server.uri())), "slow", "news").await;
    assert!(defaults_for("news").contains(&url.as_str()));
    Ok(())
}

#[tokio::test]
async fn non_image_response_is_never_uploaded() -> Result<()> {
    init_tracing();
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/page.jpg"))
        .respond_with(ResponseTemplate::new(200).set_body_raw("<html>login</html>", "text/html"))
        .mount(&server)
        .await;

    let backend = Arc::new(RecordingBackend::default());
    let chain = acquirer(test_config().images)?.with_backend(backend.clone());

    let url = chain.acquire(Some(&format!("{}/page.jpg", server.uri())), "walled", "economy").await;
    assert!(defaults_for("economy").contains(&url.as_str()));
    assert!(backend.stored.lock().expect("lock").is_empty());
    Ok(())
}

#[tokio::test]
async fn falls_through_failing_backends_in_order() -> Result<()> {
    init_tracing();
    let server = MockServer::start().await;
    mount_image(&server, "/photo.jpg").await;

    let images = ImageConfig { upload_timeout_secs: 1, ..test_config().images };
    let backend = Arc::new(RecordingBackend::default());
    let chain = acquirer(images)?
        .with_backend(Arc::new(FailingBackend))
        .with_backend(Arc::new(SlowBackend(Duration::from_secs(3))))
        .with_backend(backend.clone());
    assert_eq!(chain.backend_names(), vec!["failing", "slow", "recording"]);

    let url = chain.acquire(Some(&format!("{}/photo.jpg", server.uri())), "new-square", "Society").await;
    assert!(url.starts_with("https://cdn.test/society/"));
    assert!(url.contains("/new-square-"));
    assert!(url.ends_with(".jpg"));

    let stored = backend.stored.lock().expect("lock");
    assert_eq!(stored.len(), 1);
    assert_eq!(stored[0].bytes, vec![0xFF, 0xD8, 0xFF, 0xE0, 1, 2, 3]);
    Ok(())
}

#[tokio::test]
async fn proxy_is_used_when_every_backend_fails() -> Result<()> {
    init_tracing();
    let server = MockServer::start().await;
    mount_image(&server, "/photo.jpg").await;
    let original = format!("{}/photo.jpg", server.uri());

    let images = ImageConfig { proxy_base: "https://site.test".to_string(), ..test_config().images };
    let chain = acquirer(images)?.with_backend(Arc::new(FailingBackend));

    let url = chain.acquire(Some(&original), "proxied", "news").await;
    assert!(url.starts_with("https://site.test/images/proxy?url="));
    assert!(url.ends_with("&slug=proxied"));
    Ok(())
}

#[tokio::test]
async fn disabled_proxy_goes_straight_to_default() -> Result<()> {
    init_tracing();
    let server = MockServer::start().await;
    mount_image(&server, "/photo.jpg").await;

    let images = ImageConfig { proxy_enabled: false, ..test_config().images };
    let chain = acquirer(images)?.with_backend(Arc::new(FailingBackend));

    let url = chain.acquire(Some(&format!("{}/photo.jpg", server.uri())), "no-proxy", "politics").await;
    assert!(defaults_for("politics").contains(&url.as_str()));
    Ok(())
}

#[tokio::test]
async fn supabase_backend_uploads_and_returns_public_url() -> Result<()> {
    use news_ingestion::config::SupabaseStorageConfig;
    use news_ingestion::images::{ImageObject, StorageBackend, SupabaseStorageBackend};
    use wiremock::matchers::header;

    init_tracing();
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/storage/v1/object/article-images/news/2024/tram-abcd.jpg"))
        .and(header("authorization", "Bearer service-key"))
        .and(header("apikey", "service-key"))
        .and(header("content-type", "image/jpeg"))
        .and(header("x-upsert", "true"))
        .respond_with(ResponseTemplate::new(200).set_body_string(r#"{"Key":"ok"}"#))
        .expect(1)
        .mount(&server)
        .await;

    let backend = SupabaseStorageBackend::new(
        &SupabaseStorageConfig {
            url: format!("{}/", server.uri()),
            service_key: "service-key".to_string(),
            bucket: "article-images".to_string(),
        },
        Duration::from_secs(2),
    )?;
    let object = ImageObject {
        key: "news/2024/tram-abcd.jpg".to_string(),
        content_type: "image/jpeg".to_string(),
        bytes: vec![1, 2, 3],
    };

    let url = backend.store(&object).await?;
    assert_eq!(
        url,
        format!("{}/storage/v1/object/public/article-images/news/2024/tram-abcd.jpg", server.uri())
    );
    Ok(())
}

#[tokio::test]
async fn supabase_rejection_is_a_storage_error() -> Result<()> {
    use news_ingestion::config::SupabaseStorageConfig;
    use news_ingestion::images::{ImageObject, StorageBackend, SupabaseStorageBackend};
    use news_ingestion::PipelineError;

    init_tracing();
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(403).set_body_string("bucket policy"))
        .mount(&server)
        .await;

    let backend = SupabaseStorageBackend::new(
        &SupabaseStorageConfig {
            url: server.uri(),
            service_key: "k".to_string(),
            bucket: "b".to_string(),
        },
        Duration::from_secs(2),
    )?;
    let object = ImageObject { key: "k.png".to_string(), content_type: "image/png".to_string(), bytes: vec![1] };

    assert!(matches!(backend.store(&object).await, Err(PipelineError::Storage(_))));
    Ok(())
}
