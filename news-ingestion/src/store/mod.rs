//! Article persistence.

pub mod memory;
pub mod postgres;

pub use memory::MemoryArticleStore;
pub use postgres::PgArticleStore;

use crate::types::{Article, ArticleStatus, FeedSource, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::time::Duration;
use uuid::Uuid;

/// Result of the conditional insert of a freshly scraped article.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InsertOutcome {
    Inserted,
    /// A live record with the same source URL already exists.
    DuplicateSource,
    /// Another live record already owns this slug.
    SlugTaken,
}

#[async_trait]
pub trait ArticleStore: Send + Sync {
    /// The non-archived record for `source_url`, if any.
    async fn find_by_source_url(&self, source_url: &str) -> Result<Option<Article>>;

    /// Insert unless a live record with the same source URL or the same
    /// slug exists. The caller holds the claim on an inserted record.
    async fn insert_scraped(&self, article: &Article) -> Result<InsertOutcome>;

    /// Take the processing claim on a record still at `scraped`. Fails when
    /// another run claimed it less than `lease` ago.
    async fn claim(&self, id: Uuid, lease: Duration) -> Result<bool>;

    /// Drop the claim so the next run can resume the record straight away.
    async fn release(&self, id: Uuid) -> Result<()>;

    /// Persist `article` only if the stored record is still at `expected`.
    /// Returns false when the record moved on or vanished. Clears the claim.
    async fn save_transition(&self, article: &Article, expected: ArticleStatus) -> Result<bool>;

    async fn get(&self, id: Uuid) -> Result<Option<Article>>;

    /// `Published` is ordered newest publication first, `Rewritten` oldest
    /// rewrite first, everything else by scrape time.
    async fn list_by_status(&self, status: ArticleStatus, limit: usize) -> Result<Vec<Article>>;
}

/// Registered feeds and their run bookkeeping.
#[async_trait]
pub trait SourceRegistry: Send + Sync {
    /// Register `source`, or refresh name and category of the source with
    /// the same feed URL. Returns the stored row.
    async fn upsert_source(&self, source: &FeedSource) -> Result<FeedSource>;

    /// Sources ordered by name.
    async fn list_sources(&self, active_only: bool) -> Result<Vec<FeedSource>>;

    /// False when no such source exists.
    async fn set_source_active(&self, id: Uuid, active: bool) -> Result<bool>;

    /// Stamp a finished run and add its new records to the running total.
    async fn record_source_run(&self, id: Uuid, at: DateTime<Utc>, new_records: usize) -> Result<()>;
}

/// `now - lease`, the oldest claim still considered held.
pub(crate) fn claim_cutoff(now: DateTime<Utc>, lease: Duration) -> Result<DateTime<Utc>> {
    let lease = chrono::Duration::from_std(lease)
        .map_err(|e| crate::types::PipelineError::Config(format!("claim lease {:?}: {}", lease, e)))?;
    Ok(now - lease)
}
