use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

pub use interfaces::defs::{
    Article, ArticleStatus, FeedRunRequest, RewrittenContent, RunSummary, SourceFields,
    StoredLifecycle, TransitionError,
};

/// A registered feed with its run bookkeeping.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FeedSource {
    pub id: Uuid,
    pub name: String,
    pub feed_url: String,
    /// Category hint given to every entry of this feed.
    pub category: String,
    pub is_active: bool,
    pub last_scraped_at: Option<DateTime<Utc>>,
    /// Records created by all runs of this feed so far.
    pub total_articles_scraped: u64,
}

impl FeedSource {
    pub fn new(name: impl Into<String>, feed_url: impl Into<String>, category: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            name: name.into(),
            feed_url: feed_url.into(),
            category: category.into(),
            is_active: true,
            last_scraped_at: None,
            total_articles_scraped: 0,
        }
    }

    pub fn run_request(&self) -> FeedRunRequest {
        FeedRunRequest {
            feed_url: self.feed_url.clone(),
            category: self.category.clone(),
            source_name: self.name.clone(),
        }
    }
}

/// Output of the rewrite step.
pub type RewriteResult = RewrittenContent;

/// One entry read from a syndication feed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CandidateEntry {
    pub guid: Option<String>,
    pub title: String,
    pub link: String,
    pub description: Option<String>,
    pub content: Option<String>,
    pub published_at: Option<DateTime<Utc>>,
    pub image_url: Option<String>,
}

#[derive(Debug)]
pub struct ParsedFeed {
    pub title: Option<String>,
    pub description: Option<String>,
    pub entries: Vec<CandidateEntry>,
}

#[derive(Debug, Clone)]
pub struct FetchResult {
    pub url: String,
    pub http_status: u16,
    pub response_time_ms: u64,
    pub content: String,
}

/// A binary body, e.g. a downloaded image.
#[derive(Debug, Clone)]
pub struct FetchedBytes {
    pub url: String,
    pub content_type: Option<String>,
    pub bytes: Vec<u8>,
}

#[derive(Debug, Clone)]
pub struct FetchConfig {
    pub user_agent: String,
    pub timeout_seconds: u64,
    pub max_retries: u32,
    pub retry_delay_seconds: u64,
    pub max_feed_size_mb: usize,
    pub max_redirects: usize,
    /// Minimum spacing between two requests to the same host.
    pub min_host_interval_ms: u64,
}

impl Default for FetchConfig {
    fn default() -> Self {
        Self {
            user_agent: "NewsIngestion/1.0".to_string(),
            timeout_seconds: 30,
            max_retries: 3,
            retry_delay_seconds: 2,
            max_feed_size_mb: 10,
            max_redirects: 5,
            min_host_interval_ms: 1000,
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum PipelineError {
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("HTTP {status} from {url}")]
    HttpStatus { url: String, status: u16 },

    #[error("Feed parse error: {0}")]
    Parse(String),

    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Migration error: {0}")]
    Migration(#[from] sqlx::migrate::MigrateError),

    #[error("Invalid URL: {0}")]
    InvalidUrl(#[from] url::ParseError),

    #[error("Response from {url} exceeds limit of {limit_bytes} bytes")]
    TooLarge { url: String, limit_bytes: usize },

    #[error("Article not found: {id}")]
    ArticleNotFound { id: Uuid },

    #[error("Generation failed: {0}")]
    Generation(String),

    #[error("Generation API returned {status}: {message}")]
    GenerationStatus { status: u16, message: String },

    #[error("Invalid generation output: {0}")]
    InvalidOutput(String),

    #[error("Storage error: {0}")]
    Storage(String),

    #[error("Transition rejected: {0}")]
    Transition(#[from] TransitionError),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Timed out after {0:?}")]
    Timeout(std::time::Duration),
}

impl PipelineError {
    /// Whether retrying the same call could succeed.
    pub fn is_transient(&self) -> bool {
        match self {
            PipelineError::Http(e) => e.is_timeout() || e.is_connect() || e.is_request(),
            PipelineError::HttpStatus { status, .. } | PipelineError::GenerationStatus { status, .. } => {
                *status == 429 || *status >= 500
            }
            PipelineError::Timeout(_) => true,
            _ => false,
        }
    }
}

pub type Result<T> = std::result::Result<T, PipelineError>;
