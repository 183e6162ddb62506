//! Lead image acquisition.
//!
//! The chain downloads the candidate image once, then tries each
//! configured storage backend in order, then a same-origin proxy URL, and
//! finally a curated stock image. `acquire` always returns a usable URL.

pub mod defaults;
pub mod s3;
pub mod supabase;

pub use defaults::{default_image, defaults_for};
pub use s3::ObjectStorageBackend;
pub use supabase::SupabaseStorageBackend;

use crate::config::ImageConfig;
use crate::fetcher::Fetcher;
use crate::slug::short_hash;
use crate::types::{FetchedBytes, Result};
use async_trait::async_trait;
use chrono::{Datelike, Utc};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

pub const CACHE_CONTROL: &str = "public, max-age=31536000";

/// Outcome of one step of the chain.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ImageResult {
    Resolved(String),
    Unavailable(String),
}

/// A validated image ready to be written to a backend.
#[derive(Debug, Clone)]
pub struct ImageObject {
    pub key: String,
    pub content_type: String,
    pub bytes: Vec<u8>,
}

#[async_trait]
pub trait StorageBackend: Send + Sync {
    fn name(&self) -> &str;

    /// Write the object and return its public URL.
    async fn store(&self, object: &ImageObject) -> Result<String>;
}

pub struct ImageAcquirer {
    fetcher: Arc<Fetcher>,
    backends: Vec<Arc<dyn StorageBackend>>,
    config: ImageConfig,
}

impl ImageAcquirer {
    /// A chain with no storage backends.
    pub fn new(fetcher: Arc<Fetcher>, config: ImageConfig) -> Self {
        Self { fetcher, backends: Vec::new(), config }
    }

    /// A chain with every backend whose credentials are present.
    pub fn from_config(fetcher: Arc<Fetcher>, config: ImageConfig) -> Result<Self> {
        let mut backends: Vec<Arc<dyn StorageBackend>> = Vec::new();

        match &config.object_storage {
            Some(storage) => backends.push(Arc::new(ObjectStorageBackend::new(storage))),
            None => info!("Object storage not configured, skipping"),
        }
        match &config.supabase {
            Some(storage) => backends.push(Arc::new(SupabaseStorageBackend::new(
                storage,
                Duration::from_secs(config.upload_timeout_secs),
            )?)),
            None => info!("Supabase storage not configured, skipping"),
        }

        Ok(Self { fetcher, backends, config })
    }

    pub fn with_backend(mut self, backend: Arc<dyn StorageBackend>) -> Self {
        self.backends.push(backend);
        self
    }

    pub fn backend_names(&self) -> Vec<&str> {
        self.backends.iter().map(|b| b.name()).collect()
    }

    pub async fn acquire(&self, candidate: Option<&str>, slug: &str, category: &str) -> String {
        let downloaded = match candidate {
            Some(url) => match self.download(url).await {
                Ok(image) => Some(image),
                Err(reason) => {
                    warn!(slug, url, reason = %reason, "Candidate image unusable");
                    None
                }
            },
            None => {
                debug!("No candidate image for {}", slug);
                None
            }
        };

        if let Some(image) = downloaded {
            let object = build_object(image, slug, category);

            for backend in &self.backends {
                match self.try_backend(backend.as_ref(), &object).await {
                    ImageResult::Resolved(url) => return url,
                    ImageResult::Unavailable(reason) => {
                        warn!(slug, backend = backend.name(), reason = %reason, "Storage backend failed, falling through");
                    }
                }
            }

            if let (ImageResult::Resolved(url), Some(original)) = (self.proxy_url(candidate, slug), candidate) {
                debug!("Serving {} through proxy for {}", original, slug);
                return url;
            }
        }

        let fallback = default_image(category, slug);
        debug!("Using default image for {} ({})", slug, category);
        fallback.to_string()
    }

    async fn download(&self, url: &str) -> std::result::Result<FetchedBytes, String> {
        let timeout = Duration::from_secs(self.config.download_timeout_secs);
        let image = tokio::time::timeout(timeout, self.fetcher.fetch_bytes(url, self.config.max_image_bytes))
            .await
            .map_err(|_| format!("download timed out after {:?}", timeout))?
            .map_err(|e| e.to_string())?;

        match image.content_type.as_deref().map(base_mime) {
            Some(mime) if mime.starts_with("image/") => {}
            Some(mime) => return Err(format!("not an image: {}", mime)),
            None => return Err("no content type".to_string()),
        }
        if image.bytes.is_empty() {
            return Err("empty body".to_string());
        }
        Ok(image)
    }

    async fn try_backend(&self, backend: &dyn StorageBackend, object: &ImageObject) -> ImageResult {
        let timeout = Duration::from_secs(self.config.upload_timeout_secs);
        match tokio::time::timeout(timeout, backend.store(object)).await {
            Ok(Ok(url)) if !url.is_empty() => {
                info!("Stored image {} via {}", object.key, backend.name());
                ImageResult::Resolved(url)
            }
            Ok(Ok(_)) => ImageResult::Unavailable("backend returned an empty URL".to_string()),
            Ok(Err(e)) => ImageResult::Unavailable(e.to_string()),
            Err(_) => ImageResult::Unavailable(format!("upload timed out after {:?}", timeout)),
        }
    }

    fn proxy_url(&self, candidate: Option<&str>, slug: &str) -> ImageResult {
        match candidate {
            Some(original) if self.config.proxy_enabled => {
                ImageResult::Resolved(proxy_url(&self.config.proxy_base, original, slug))
            }
            Some(_) => ImageResult::Unavailable("proxy disabled".to_string()),
            None => ImageResult::Unavailable("no candidate".to_string()),
        }
    }
}

/// `{base}/images/proxy?url=<encoded original>&slug=<slug>`
pub fn proxy_url(base: &str, original: &str, slug: &str) -> String {
    let query = url::form_urlencoded::Serializer::new(String::new())
        .append_pair("url", original)
        .append_pair("slug", slug)
        .finish();
    format!("{}/images/proxy?{}", base.trim_end_matches('/'), query)
}

fn build_object(image: FetchedBytes, slug: &str, category: &str) -> ImageObject {
    let extension = resolve_extension(&image.url, image.content_type.as_deref());
    let content_type = image
        .content_type
        .as_deref()
        .map(base_mime)
        .filter(|m| known_mime_extension(m).is_some())
        .unwrap_or_else(|| mime_for_extension(extension).to_string());

    let key = object_key(category, Utc::now().year(), slug, &image.url, extension);
    ImageObject { key, content_type, bytes: image.bytes }
}

/// `{category}/{year}/{slug}-{hash}.{ext}`; stable for a given source URL.
pub fn object_key(category: &str, year: i32, slug: &str, source_url: &str, extension: &str) -> String {
    let category = crate::slug::slug(category, None);
    format!("{}/{}/{}-{}.{}", category, year, slug, short_hash(source_url), extension)
}

/// Pick a file extension, preferring a recognised MIME subtype over the
/// URL's extension, and `jpg` when neither is recognised.
pub fn resolve_extension(url: &str, content_type: Option<&str>) -> &'static str {
    content_type
        .map(base_mime)
        .and_then(|m| known_mime_extension(&m))
        .or_else(|| url_extension(url))
        .unwrap_or("jpg")
}

fn base_mime(content_type: &str) -> String {
    content_type.split(';').next().unwrap_or("").trim().to_ascii_lowercase()
}

fn known_mime_extension(mime: &str) -> Option<&'static str> {
    match mime {
        "image/jpeg" | "image/jpg" | "image/pjpeg" => Some("jpg"),
        "image/png" => Some("png"),
        "image/webp" => Some("webp"),
        "image/gif" => Some("gif"),
        _ => None,
    }
}

fn url_extension(url: &str) -> Option<&'static str> {
    let path = url::Url::parse(url).ok()?.path().to_ascii_lowercase();
    let (_, ext) = path.rsplit_once('.')?;
    match ext {
        "jpg" | "jpeg" => Some("jpg"),
        "png" => Some("png"),
        "webp" => Some("webp"),
        "gif" => Some("gif"),
        _ => None,
    }
}

fn mime_for_extension(extension: &str) -> &'static str {
    match extension {
        "png" => "image/png",
        "webp" => "image/webp",
        "gif" => "image/gif",
        _ => "image/jpeg",
    }
}
