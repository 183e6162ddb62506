use super::{claim_cutoff, ArticleStore, InsertOutcome, SourceRegistry};
use crate::types::{Article, ArticleStatus, FeedSource, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use interfaces::state::ArticleReader;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;
use uuid::Uuid;

#[derive(Clone)]
struct Row {
    article: Article,
    claimed_at: Option<DateTime<Utc>>,
}

fn is_live(row: &Row) -> bool {
    row.article.status() != ArticleStatus::Archived
}

/// In-process store with the same uniqueness and claim rules as the
/// `articles` and `sources` tables. Used by tests and dry runs.
#[derive(Clone, Default)]
pub struct MemoryArticleStore {
    articles: Arc<RwLock<HashMap<Uuid, Row>>>,
    sources: Arc<RwLock<HashMap<Uuid, FeedSource>>>,
}

impl MemoryArticleStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn len(&self) -> usize {
        self.articles.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.articles.read().await.is_empty()
    }

    pub async fn all(&self) -> Vec<Article> {
        self.articles.read().await.values().map(|r| r.article.clone()).collect()
    }

    /// Seed an unclaimed record as-is, bypassing the uniqueness checks.
    pub async fn seed(&self, article: Article) {
        self.articles
            .write()
            .await
            .insert(article.id, Row { article, claimed_at: None });
    }
}

#[async_trait]
impl ArticleStore for MemoryArticleStore {
    async fn find_by_source_url(&self, source_url: &str) -> Result<Option<Article>> {
        let articles = self.articles.read().await;
        Ok(articles
            .values()
            .find(|r| r.article.source_url == source_url && is_live(r))
            .map(|r| r.article.clone()))
    }

    async fn insert_scraped(&self, article: &Article) -> Result<InsertOutcome> {
        // check and insert under one write lock, like the unique indexes do
        let mut articles = self.articles.write().await;

        if articles
            .values()
            .any(|r| r.article.source_url == article.source_url && is_live(r))
        {
            return Ok(InsertOutcome::DuplicateSource);
        }
        if articles.values().any(|r| r.article.slug == article.slug && is_live(r)) {
            return Ok(InsertOutcome::SlugTaken);
        }

        articles.insert(
            article.id,
            Row { article: article.clone(), claimed_at: Some(Utc::now()) },
        );
        Ok(InsertOutcome::Inserted)
    }

    async fn claim(&self, id: Uuid, lease: Duration) -> Result<bool> {
        let now = Utc::now();
        let cutoff = claim_cutoff(now, lease)?;
        let mut articles = self.articles.write().await;
        match articles.get_mut(&id) {
            Some(row)
                if row.article.status() == ArticleStatus::Scraped
                    && row.claimed_at.map_or(true, |at| at < cutoff) =>
            {
                row.claimed_at = Some(now);
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn release(&self, id: Uuid) -> Result<()> {
        if let Some(row) = self.articles.write().await.get_mut(&id) {
            if row.article.status() == ArticleStatus::Scraped {
                row.claimed_at = None;
            }
        }
        Ok(())
    }

    async fn save_transition(&self, article: &Article, expected: ArticleStatus) -> Result<bool> {
        let mut articles = self.articles.write().await;
        match articles.get_mut(&article.id) {
            Some(row) if row.article.status() == expected => {
                row.article = article.clone();
                row.claimed_at = None;
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn get(&self, id: Uuid) -> Result<Option<Article>> {
        Ok(self.articles.read().await.get(&id).map(|r| r.article.clone()))
    }

    async fn list_by_status(&self, status: ArticleStatus, limit: usize) -> Result<Vec<Article>> {
        let mut matching: Vec<Article> = self
            .articles
            .read()
            .await
            .values()
            .filter(|r| r.article.status() == status)
            .map(|r| r.article.clone())
            .collect();

        match status {
            ArticleStatus::Published => matching.sort_by(|a, b| b.published_at().cmp(&a.published_at())),
            ArticleStatus::Rewritten => matching.sort_by_key(|a| a.rewritten_at()),
            _ => matching.sort_by_key(|a| a.scraped_at),
        }
        matching.truncate(limit);
        Ok(matching)
    }
}

#[async_trait]
impl SourceRegistry for MemoryArticleStore {
    async fn upsert_source(&self, source: &FeedSource) -> Result<FeedSource> {
        let mut sources = self.sources.write().await;
        if let Some(existing) = sources.values_mut().find(|s| s.feed_url == source.feed_url) {
            existing.name = source.name.clone();
            existing.category = source.category.clone();
            return Ok(existing.clone());
        }
        sources.insert(source.id, source.clone());
        Ok(source.clone())
    }

    async fn list_sources(&self, active_only: bool) -> Result<Vec<FeedSource>> {
        let mut listed: Vec<FeedSource> = self
            .sources
            .read()
            .await
            .values()
            .filter(|s| s.is_active || !active_only)
            .cloned()
            .collect();
        listed.sort_by(|a, b| a.name.cmp(&b.name).then_with(|| a.feed_url.cmp(&b.feed_url)));
        Ok(listed)
    }

    async fn set_source_active(&self, id: Uuid, active: bool) -> Result<bool> {
        match self.sources.write().await.get_mut(&id) {
            Some(source) => {
                source.is_active = active;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn record_source_run(&self, id: Uuid, at: DateTime<Utc>, new_records: usize) -> Result<()> {
        if let Some(source) = self.sources.write().await.get_mut(&id) {
            source.last_scraped_at = Some(at);
            source.total_articles_scraped += new_records as u64;
        }
        Ok(())
    }
}

#[async_trait]
impl ArticleReader for MemoryArticleStore {
    async fn published(&self, limit: usize) -> anyhow::Result<Vec<Article>> {
        Ok(self.list_by_status(ArticleStatus::Published, limit).await?)
    }

    async fn review_queue(&self, limit: usize) -> anyhow::Result<Vec<Article>> {
        Ok(self.list_by_status(ArticleStatus::Rewritten, limit).await?)
    }
}
