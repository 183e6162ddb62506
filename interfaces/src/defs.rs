use std::collections::BTreeSet;
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Lifecycle of an ingested article.
///
/// Status only moves forward: `Scraped -> Rewritten -> Published`, or into
/// `Archived` from either of the first two. `Published` and `Archived` are
/// terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ArticleStatus {
    Scraped,
    Rewritten,
    Published,
    Archived,
}

impl ArticleStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ArticleStatus::Scraped => "scraped",
            ArticleStatus::Rewritten => "rewritten",
            ArticleStatus::Published => "published",
            ArticleStatus::Archived => "archived",
        }
    }

    pub fn can_transition_to(&self, next: ArticleStatus) -> bool {
        use ArticleStatus::*;
        matches!(
            (self, next),
            (Scraped, Rewritten) | (Rewritten, Published) | (Scraped, Archived) | (Rewritten, Archived)
        )
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, ArticleStatus::Published | ArticleStatus::Archived)
    }
}

impl fmt::Display for ArticleStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.pad(self.as_str())
    }
}

impl FromStr for ArticleStatus {
    type Err = UnknownStatus;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "scraped" => Ok(ArticleStatus::Scraped),
            "rewritten" => Ok(ArticleStatus::Rewritten),
            "published" => Ok(ArticleStatus::Published),
            "archived" => Ok(ArticleStatus::Archived),
            other => Err(UnknownStatus(other.to_string())),
        }
    }
}

#[derive(Debug, thiserror::Error)]
#[error("unknown article status: {0}")]
pub struct UnknownStatus(pub String);

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum TransitionError {
    #[error("illegal transition {from} -> {to}")]
    Illegal { from: ArticleStatus, to: ArticleStatus },

    #[error("cannot enter {to}: {missing} is missing")]
    MissingField { to: ArticleStatus, missing: &'static str },
}

/// Fields produced by the rewrite step.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RewrittenContent {
    pub title: String,
    /// Markdown, second-level headings and below only.
    pub body: String,
    pub excerpt: String,
    pub meta_description: String,
    pub keywords: BTreeSet<String>,
    pub category: String,
    pub confidence_score: f64,
    /// Total tokens the generator reported for this rewrite.
    #[serde(default)]
    pub tokens_used: Option<u32>,
}

/// Source-of-truth fields copied from the syndication entry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SourceFields {
    pub name: String,
    pub title: String,
    pub content: Option<String>,
    pub excerpt: Option<String>,
    pub image_url: Option<String>,
    pub published_at: Option<DateTime<Utc>>,
}

/// Lifecycle columns as they were persisted. Only storage backends
/// rehydrating a record should build one of these.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct StoredLifecycle {
    pub status: ArticleStatus,
    pub rewritten_at: Option<DateTime<Utc>>,
    pub published_at: Option<DateTime<Utc>>,
}

/// The persisted unit of work.
///
/// Status and the lifecycle timestamps are private; they change only
/// through [`Article::advance`]. Records can be serialized for display but
/// never deserialized, so a payload cannot forge a lifecycle:
///
/// ```compile_fail
/// let forged: interfaces::Article = serde_json::from_str(r#"{"status":"published"}"#).unwrap();
/// ```
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Article {
    pub id: Uuid,
    pub slug: String,
    pub source_url: String,
    pub source: SourceFields,
    /// Category hint at scrape time, replaced by the rewrite's category.
    pub category: String,
    pub content: Option<RewrittenContent>,
    pub featured_image_url: Option<String>,
    pub scraped_at: DateTime<Utc>,
    status: ArticleStatus,
    rewritten_at: Option<DateTime<Utc>>,
    published_at: Option<DateTime<Utc>>,
}

impl Article {
    pub fn scraped(
        slug: String,
        source_url: String,
        source: SourceFields,
        category: String,
        scraped_at: DateTime<Utc>,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            slug,
            source_url,
            source,
            category,
            content: None,
            featured_image_url: None,
            scraped_at,
            status: ArticleStatus::Scraped,
            rewritten_at: None,
            published_at: None,
        }
    }

    pub fn with_lifecycle(mut self, lifecycle: StoredLifecycle) -> Self {
        self.status = lifecycle.status;
        self.rewritten_at = lifecycle.rewritten_at;
        self.published_at = lifecycle.published_at;
        self
    }

    pub fn status(&self) -> ArticleStatus {
        self.status
    }

    pub fn rewritten_at(&self) -> Option<DateTime<Utc>> {
        self.rewritten_at
    }

    pub fn published_at(&self) -> Option<DateTime<Utc>> {
        self.published_at
    }

    pub fn confidence_score(&self) -> Option<f64> {
        match self.status {
            ArticleStatus::Rewritten | ArticleStatus::Published => {
                self.content.as_ref().map(|c| c.confidence_score)
            }
            _ => None,
        }
    }

    /// Move the article to `next`, stamping the matching timestamp.
    ///
    /// Rejects transitions the lifecycle does not define and transitions
    /// into `Rewritten`/`Published` without rewritten content and a
    /// featured image.
    pub fn advance(&mut self, next: ArticleStatus, at: DateTime<Utc>) -> Result<(), TransitionError> {
        if !self.status.can_transition_to(next) {
            return Err(TransitionError::Illegal { from: self.status, to: next });
        }

        if matches!(next, ArticleStatus::Rewritten | ArticleStatus::Published) {
            if self.content.is_none() {
                return Err(TransitionError::MissingField { to: next, missing: "content" });
            }
            if self.featured_image_url.as_deref().map_or(true, str::is_empty) {
                return Err(TransitionError::MissingField { to: next, missing: "featured_image_url" });
            }
        }

        match next {
            ArticleStatus::Rewritten => self.rewritten_at = Some(at),
            ArticleStatus::Published => self.published_at = Some(at),
            _ => {}
        }
        self.status = next;
        Ok(())
    }
}

/// A request to ingest one feed.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FeedRunRequest {
    pub feed_url: String,
    pub category: String,
    pub source_name: String,
}

/// Counts reported at the end of a feed run.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunSummary {
    pub fetched: usize,
    /// Records created by this run, whatever became of them afterwards.
    pub new_records: usize,
    pub skipped_duplicate: usize,
    pub published: usize,
    pub held_for_review: usize,
    pub failed: usize,
    /// Entries never started: the run was cancelled or hit its entry limit.
    pub not_processed: usize,
}
