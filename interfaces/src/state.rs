use async_trait::async_trait;

use crate::defs::{Article, FeedRunRequest, RunSummary};

// Consumers of the ingestion pipeline (listing pages, review tools,
// newsletter compilers, scheduled triggers) depend on these traits only.

/// Read access to persisted articles.
#[async_trait]
pub trait ArticleReader: Send + Sync {
    /// Published articles, most recently published first.
    async fn published(&self, limit: usize) -> anyhow::Result<Vec<Article>>;

    /// Articles held at `rewritten` for manual review, oldest first.
    async fn review_queue(&self, limit: usize) -> anyhow::Result<Vec<Article>>;
}

/// Entry point used by schedulers and admin actions to ingest one feed.
#[async_trait]
pub trait PipelineTrigger: Send + Sync {
    async fn run_feed(&self, request: FeedRunRequest) -> anyhow::Result<RunSummary>;
}
