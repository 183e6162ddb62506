use crate::types::{FetchConfig, FetchResult, FetchedBytes, PipelineError, Result};
use backoff::{backoff::Backoff, exponential::ExponentialBackoff};
use reqwest::{header, Client, Response};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::RwLock;
use tracing::{debug, error, info, warn};
use url::Url;

pub struct Fetcher {
    client: Client,
    config: FetchConfig,
    // next instant at which each host may be contacted again
    rate_limiter: Arc<RwLock<HashMap<String, Instant>>>,
}

impl Fetcher {
    pub fn new(config: FetchConfig) -> Result<Self> {
        let client = Client::builder()
            .user_agent(&config.user_agent)
            .timeout(Duration::from_secs(config.timeout_seconds))
            .gzip(true)
            .deflate(true)
            .brotli(true)
            .redirect(reqwest::redirect::Policy::limited(config.max_redirects))
            .build()?;

        Ok(Self {
            client,
            config,
            rate_limiter: Arc::new(RwLock::new(HashMap::new())),
        })
    }

    pub fn config(&self) -> &FetchConfig {
        &self.config
    }

    /// Fetch a feed document, retrying transient failures with exponential
    /// backoff.
    pub async fn fetch_feed(&self, url: &str) -> Result<FetchResult> {
        let start_time = Instant::now();
        debug!("Fetching feed: {}", url);

        let mut backoff = self.backoff();
        let mut attempt = 0;

        loop {
            self.apply_rate_limit(url).await?;

            let error = match self.send(url).await {
                Ok(response) => match self.read_text(url, response).await {
                    Ok((status, content)) => {
                        info!("Fetched feed {} ({} bytes)", url, content.len());
                        return Ok(FetchResult {
                            url: url.to_string(),
                            http_status: status,
                            response_time_ms: start_time.elapsed().as_millis() as u64,
                            content,
                        });
                    }
                    Err(e) => e,
                },
                Err(e) => e,
            };

            if !error.is_transient() || attempt >= self.config.max_retries {
                error!("Failed to fetch feed after {} attempts: {}: {}", attempt + 1, url, error);
                return Err(error);
            }

            match backoff.next_backoff() {
                Some(delay) => {
                    warn!("Attempt {} failed for {}, retrying in {:?}: {}", attempt + 1, url, delay, error);
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                None => return Err(error),
            }
        }
    }

    /// Download a binary body once, capped at `max_bytes`.
    pub async fn fetch_bytes(&self, url: &str, max_bytes: usize) -> Result<FetchedBytes> {
        self.apply_rate_limit(url).await?;

        let mut response = self.send(url).await?;
        if let Some(length) = response.content_length() {
            if length as usize > max_bytes {
                return Err(PipelineError::TooLarge { url: url.to_string(), limit_bytes: max_bytes });
            }
        }

        let content_type = response
            .headers()
            .get(header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .map(|s| s.to_string());

        let mut bytes = Vec::new();
        while let Some(chunk) = response.chunk().await? {
            if bytes.len() + chunk.len() > max_bytes {
                return Err(PipelineError::TooLarge { url: url.to_string(), limit_bytes: max_bytes });
            }
            bytes.extend_from_slice(&chunk);
        }

        debug!("Downloaded {} bytes from {}", bytes.len(), url);
        Ok(FetchedBytes { url: url.to_string(), content_type, bytes })
    }

    async fn send(&self, url: &str) -> Result<Response> {
        let response = self.client.get(url).send().await?;
        let status = response.status();
        if !status.is_success() {
            return Err(PipelineError::HttpStatus { url: url.to_string(), status: status.as_u16() });
        }
        Ok(response)
    }

    async fn read_text(&self, url: &str, response: Response) -> Result<(u16, String)> {
        let status = response.status().as_u16();
        let limit_bytes = self.config.max_feed_size_mb * 1024 * 1024;

        if let Some(content_length) = response.content_length() {
            if content_length as usize > limit_bytes {
                return Err(PipelineError::TooLarge { url: url.to_string(), limit_bytes });
            }
        }

        let content = response.text().await?;
        if content.len() > limit_bytes {
            return Err(PipelineError::TooLarge { url: url.to_string(), limit_bytes });
        }
        Ok((status, content))
    }

    fn backoff(&self) -> ExponentialBackoff<backoff::SystemClock> {
        let initial = Duration::from_secs(self.config.retry_delay_seconds);
        ExponentialBackoff {
            current_interval: initial,
            initial_interval: initial,
            max_interval: initial * 32,
            multiplier: 2.0,
            max_elapsed_time: Some(initial * 60),
            ..Default::default()
        }
    }

    async fn apply_rate_limit(&self, url: &str) -> Result<()> {
        let parsed_url = Url::parse(url)?;
        let host = parsed_url.host_str().unwrap_or("").to_string();
        let min_interval = Duration::from_millis(self.config.min_host_interval_ms);

        // Reserve the next slot under the lock, sleep outside it so other
        // hosts are not held up.
        let wait = {
            let mut rate_limiter = self.rate_limiter.write().await;
            let now = Instant::now();
            let slot = match rate_limiter.get(&host) {
                Some(next_allowed) if *next_allowed > now => *next_allowed,
                _ => now,
            };
            rate_limiter.insert(host.clone(), slot + min_interval);
            slot - now
        };

        if !wait.is_zero() {
            debug!("Rate limiting {}: waiting {:?}", host, wait);
            tokio::time::sleep(wait).await;
        }
        Ok(())
    }
}
