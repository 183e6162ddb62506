use crate::fetcher::Fetcher;
use crate::parser::FeedParser;
use crate::types::{CandidateEntry, Result};
use std::sync::Arc;
use tracing::info;

/// Fetches and parses one feed per call. Nothing is cached between calls.
pub struct FeedReader {
    fetcher: Arc<Fetcher>,
}

impl FeedReader {
    pub fn new(fetcher: Arc<Fetcher>) -> Self {
        Self { fetcher }
    }

    pub async fn read_feed(&self, feed_url: &str) -> Result<Vec<CandidateEntry>> {
        let fetched = self.fetcher.fetch_feed(feed_url).await?;

        // a fresh parser per read so within-document duplicate tracking
        // does not leak across runs
        let mut parser = FeedParser::new()?;
        let parsed = parser.parse_feed(&fetched.content)?;

        info!(
            "Read {} entries from {} ({}) in {}ms",
            parsed.entries.len(),
            feed_url,
            parsed.title.as_deref().unwrap_or("untitled feed"),
            fetched.response_time_ms
        );
        Ok(parsed.entries)
    }
}
