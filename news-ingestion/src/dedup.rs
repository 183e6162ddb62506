use crate::store::ArticleStore;
use crate::types::{Article, ArticleStatus};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

/// What to do when the existence check cannot be answered.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UnknownPolicy {
    /// Skip the entry (fail closed).
    #[default]
    Skip,
    /// Process it anyway; the conditional insert is then the only guard.
    Proceed,
}

#[derive(Debug, Clone)]
pub enum DedupDecision {
    New,
    Duplicate,
    /// A record left at `scraped`, by a failed run or one still in flight.
    /// Claim it before doing any work on it.
    Resume(Article),
    Unknown(String),
}

pub struct Deduplicator {
    store: Arc<dyn ArticleStore>,
    lookup_timeout: Duration,
    policy: UnknownPolicy,
}

impl Deduplicator {
    pub fn new(store: Arc<dyn ArticleStore>, lookup_timeout: Duration, policy: UnknownPolicy) -> Self {
        Self { store, lookup_timeout, policy }
    }

    pub fn policy(&self) -> UnknownPolicy {
        self.policy
    }

    pub async fn check(&self, source_url: &str) -> DedupDecision {
        let lookup = tokio::time::timeout(self.lookup_timeout, self.store.find_by_source_url(source_url));

        match lookup.await {
            Ok(Ok(None)) => DedupDecision::New,
            Ok(Ok(Some(existing))) if existing.status() == ArticleStatus::Scraped => {
                debug!("Resuming {} left at scraped ({})", source_url, existing.id);
                DedupDecision::Resume(existing)
            }
            Ok(Ok(Some(_))) => DedupDecision::Duplicate,
            Ok(Err(e)) => {
                warn!(source_url, error = %e, "Dedup lookup failed");
                DedupDecision::Unknown(e.to_string())
            }
            Err(_) => {
                warn!(source_url, timeout = ?self.lookup_timeout, "Dedup lookup timed out");
                DedupDecision::Unknown(format!("lookup timed out after {:?}", self.lookup_timeout))
            }
        }
    }

    /// Boolean view of [`Deduplicator::check`]; `None` when unanswered.
    pub async fn exists(&self, source_url: &str) -> Option<bool> {
        match self.check(source_url).await {
            DedupDecision::New => Some(false),
            DedupDecision::Duplicate | DedupDecision::Resume(_) => Some(true),
            DedupDecision::Unknown(_) => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::{InsertOutcome, MemoryArticleStore};
    use crate::types::{PipelineError, Result, SourceFields};
    use async_trait::async_trait;
    use chrono::Utc;
    use uuid::Uuid;

    struct SlowStore;

    #[async_trait]
    impl ArticleStore for SlowStore {
        async fn find_by_source_url(&self, _: &str) -> Result<Option<Article>> {
            tokio::time::sleep(Duration::from_secs(5)).await;
            Ok(None)
        }
        async fn insert_scraped(&self, _: &Article) -> Result<InsertOutcome> {
            Err(PipelineError::Storage("unused".into()))
        }
        async fn claim(&self, _: Uuid, _: Duration) -> Result<bool> {
            Ok(false)
        }
        async fn release(&self, _: Uuid) -> Result<()> {
            Ok(())
        }
        async fn save_transition(&self, _: &Article, _: ArticleStatus) -> Result<bool> {
            Ok(false)
        }
        async fn get(&self, _: Uuid) -> Result<Option<Article>> {
            Ok(None)
        }
        async fn list_by_status(&self, _: ArticleStatus, _: usize) -> Result<Vec<Article>> {
            Ok(Vec::new())
        }
    }

    fn article(url: &str) -> Article {
        Article::scraped(
            "slug".to_string(),
            url.to_string(),
            SourceFields {
                name: "s".to_string(),
                title: "t".to_string(),
                content: None,
                excerpt: None,
                image_url: None,
                published_at: None,
            },
            "news".to_string(),
            Utc::now(),
        )
    }

    #[tokio::test]
    async fn new_resume_and_duplicate() {
        let store = Arc::new(MemoryArticleStore::new());
        let dedup = Deduplicator::new(store.clone(), Duration::from_secs(1), UnknownPolicy::Skip);

        assert!(matches!(dedup.check("https://x/a").await, DedupDecision::New));
        assert_eq!(dedup.exists("https://x/a").await, Some(false));

        store.seed(article("https://x/a")).await;
        assert!(matches!(dedup.check("https://x/a").await, DedupDecision::Resume(_)));

        let mut archived = article("https://x/b");
        archived.advance(ArticleStatus::Archived, Utc::now()).unwrap();
        store.seed(archived).await;
        assert!(matches!(dedup.check("https://x/b").await, DedupDecision::New));
    }

    #[tokio::test]
    async fn slow_lookup_is_unknown() {
        let dedup = Deduplicator::new(Arc::new(SlowStore), Duration::from_millis(20), UnknownPolicy::Skip);
        assert!(matches!(dedup.check("https://x/a").await, DedupDecision::Unknown(_)));
        assert_eq!(dedup.exists("https://x/a").await, None);
    }
}
