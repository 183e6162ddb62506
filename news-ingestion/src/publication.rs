use crate::store::ArticleStore;
use crate::types::{Article, ArticleStatus, PipelineError, Result, RewriteResult, TransitionError};
use chrono::{DateTime, Utc};
use std::sync::Arc;
use tracing::{debug, info};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PublicationDecision {
    Published,
    HeldForReview,
}

/// Sole owner of status changes on articles.
#[derive(Debug, Clone, Copy)]
pub struct PublicationStateMachine {
    threshold: f64,
}

impl PublicationStateMachine {
    pub fn new(threshold: f64) -> Result<Self> {
        if !(0.0..=1.0).contains(&threshold) {
            return Err(PipelineError::Config(format!("publish threshold {} outside [0, 1]", threshold)));
        }
        Ok(Self { threshold })
    }

    pub fn threshold(&self) -> f64 {
        self.threshold
    }

    /// Attach the rewrite and image to a scraped article, move it to
    /// `rewritten`, then on to `published` if the score clears the
    /// threshold.
    ///
    /// On error the article is left exactly as it was.
    pub fn apply_rewrite(
        &self,
        article: &mut Article,
        rewrite: RewriteResult,
        featured_image_url: String,
        now: DateTime<Utc>,
    ) -> Result<PublicationDecision> {
        self.apply_rewrite_with_issues(article, rewrite, featured_image_url, &[], now)
    }

    /// Like [`apply_rewrite`](Self::apply_rewrite), but any quality issue
    /// holds the article for review whatever its score.
    pub fn apply_rewrite_with_issues(
        &self,
        article: &mut Article,
        rewrite: RewriteResult,
        featured_image_url: String,
        issues: &[String],
        now: DateTime<Utc>,
    ) -> Result<PublicationDecision> {
        if article.status() != ArticleStatus::Scraped {
            return Err(PipelineError::Transition(TransitionError::Illegal {
                from: article.status(),
                to: ArticleStatus::Rewritten,
            }));
        }

        let mut next = article.clone();
        next.category = rewrite.category.clone();
        let score = rewrite.confidence_score;
        next.content = Some(rewrite);
        next.featured_image_url = Some(featured_image_url);
        next.advance(ArticleStatus::Rewritten, now)?;

        let decision = if score >= self.threshold && issues.is_empty() {
            next.advance(ArticleStatus::Published, now)?;
            info!("Published {} (confidence {:.2})", next.slug, score);
            PublicationDecision::Published
        } else if !issues.is_empty() {
            info!("Holding {} for review: {}", next.slug, issues.join("; "));
            PublicationDecision::HeldForReview
        } else {
            info!(
                "Holding {} for review (confidence {:.2} < {:.2})",
                next.slug, score, self.threshold
            );
            PublicationDecision::HeldForReview
        };

        *article = next;
        Ok(decision)
    }

    /// Manual approval of a held article.
    pub fn promote(&self, article: &mut Article, now: DateTime<Utc>) -> Result<()> {
        article.advance(ArticleStatus::Published, now)?;
        debug!("Promoted {} to published", article.slug);
        Ok(())
    }

    pub fn archive(&self, article: &mut Article, now: DateTime<Utc>) -> Result<()> {
        article.advance(ArticleStatus::Archived, now)?;
        debug!("Archived {}", article.slug);
        Ok(())
    }
}

/// Manual review actions on stored articles.
pub struct ReviewDesk {
    store: Arc<dyn ArticleStore>,
    machine: PublicationStateMachine,
}

impl ReviewDesk {
    pub fn new(store: Arc<dyn ArticleStore>, machine: PublicationStateMachine) -> Self {
        Self { store, machine }
    }

    /// Publish an article held at `rewritten`.
    pub async fn promote(&self, id: Uuid) -> Result<Article> {
        let mut article = self.load(id).await?;
        let expected = article.status();
        self.machine.promote(&mut article, Utc::now())?;
        self.persist(&article, expected).await?;
        Ok(article)
    }

    pub async fn archive(&self, id: Uuid) -> Result<Article> {
        let mut article = self.load(id).await?;
        let expected = article.status();
        self.machine.archive(&mut article, Utc::now())?;
        self.persist(&article, expected).await?;
        Ok(article)
    }

    async fn load(&self, id: Uuid) -> Result<Article> {
        self.store.get(id).await?.ok_or(PipelineError::ArticleNotFound { id })
    }

    async fn persist(&self, article: &Article, expected: ArticleStatus) -> Result<()> {
        if self.store.save_transition(article, expected).await? {
            Ok(())
        } else {
            Err(PipelineError::Storage(format!(
                "{} changed status concurrently, transition not saved",
                article.id
            )))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::SourceFields;
    use std::collections::BTreeSet;

    fn scraped() -> Article {
        Article::scraped(
            "slug".to_string(),
            "https://x/a".to_string(),
            SourceFields {
                name: "src".to_string(),
                title: "Title".to_string(),
                content: Some("body".to_string()),
                excerpt: None,
                image_url: None,
                published_at: None,
            },
            "culture".to_string(),
            Utc::now(),
        )
    }

    fn rewrite(score: f64) -> RewriteResult {
        RewriteResult {
            title: "New".to_string(),
            body: "## Body".to_string(),
            excerpt: "Excerpt".to_string(),
            meta_description: "Meta".to_string(),
            keywords: BTreeSet::from(["lyon".to_string()]),
            category: "news".to_string(),
            confidence_score: score,
            tokens_used: Some(1200),
        }
    }

    #[test]
    fn below_threshold_is_held() {
        let machine = PublicationStateMachine::new(0.85).unwrap();
        let mut article = scraped();
        let decision = machine
            .apply_rewrite(&mut article, rewrite(0.84), "https://img/a.jpg".to_string(), Utc::now())
            .unwrap();

        assert_eq!(decision, PublicationDecision::HeldForReview);
        assert_eq!(article.status(), ArticleStatus::Rewritten);
        assert!(article.published_at().is_none());
        assert!(article.rewritten_at().is_some());
        assert_eq!(article.category, "news");
    }

    #[test]
    fn threshold_is_inclusive() {
        let machine = PublicationStateMachine::new(0.85).unwrap();
        let mut article = scraped();
        let decision = machine
            .apply_rewrite(&mut article, rewrite(0.85), "https://img/a.jpg".to_string(), Utc::now())
            .unwrap();

        assert_eq!(decision, PublicationDecision::Published);
        assert_eq!(article.status(), ArticleStatus::Published);
        assert!(article.published_at().is_some());
        assert_eq!(article.featured_image_url.as_deref(), Some("https://img/a.jpg"));
    }

    #[test]
    fn quality_issues_hold_a_confident_rewrite() {
        let machine = PublicationStateMachine::new(0.85).unwrap();
        let mut article = scraped();
        let issues = vec!["body has 7 chars, needs 1000".to_string()];
        let decision = machine
            .apply_rewrite_with_issues(&mut article, rewrite(0.99), "https://img/a.jpg".to_string(), &issues, Utc::now())
            .unwrap();

        assert_eq!(decision, PublicationDecision::HeldForReview);
        assert_eq!(article.status(), ArticleStatus::Rewritten);
        assert_eq!(article.content.as_ref().and_then(|c| c.tokens_used), Some(1200));
    }

    #[test]
    fn empty_image_leaves_article_untouched() {
        let machine = PublicationStateMachine::new(0.85).unwrap();
        let mut article = scraped();
        let before = article.clone();
        assert!(machine
            .apply_rewrite(&mut article, rewrite(0.99), String::new(), Utc::now())
            .is_err());
        assert_eq!(article, before);
    }

    #[test]
    fn promote_and_archive() {
        let machine = PublicationStateMachine::new(0.85).unwrap();
        let mut held = scraped();
        machine
            .apply_rewrite(&mut held, rewrite(0.2), "https://img/a.jpg".to_string(), Utc::now())
            .unwrap();
        machine.promote(&mut held, Utc::now()).unwrap();
        assert_eq!(held.status(), ArticleStatus::Published);
        assert!(machine.archive(&mut held, Utc::now()).is_err());

        let mut fresh = scraped();
        assert!(machine.promote(&mut fresh, Utc::now()).is_err());
        machine.archive(&mut fresh, Utc::now()).unwrap();
        assert_eq!(fresh.status(), ArticleStatus::Archived);
    }

    #[test]
    fn rejects_rewrite_of_non_scraped() {
        let machine = PublicationStateMachine::new(0.85).unwrap();
        let mut article = scraped();
        machine
            .apply_rewrite(&mut article, rewrite(0.9), "https://img/a.jpg".to_string(), Utc::now())
            .unwrap();
        assert!(machine
            .apply_rewrite(&mut article, rewrite(0.9), "https://img/b.jpg".to_string(), Utc::now())
            .is_err());
    }

    #[tokio::test]
    async fn review_desk_persists_transitions() -> Result<()> {
        let store = Arc::new(crate::store::MemoryArticleStore::new());
        let machine = PublicationStateMachine::new(0.85)?;
        let mut held = scraped();
        store.seed(held.clone()).await;
        machine.apply_rewrite(&mut held, rewrite(0.3), "https://img/a.jpg".to_string(), Utc::now())?;
        assert!(store.save_transition(&held, ArticleStatus::Scraped).await?);

        let desk = ReviewDesk::new(store.clone(), machine);
        let promoted = desk.promote(held.id).await?;
        assert_eq!(promoted.status(), ArticleStatus::Published);
        let stored = store.get(held.id).await?.unwrap();
        assert_eq!(stored.status(), ArticleStatus::Published);
        assert!(stored.published_at().is_some());

        assert!(matches!(desk.archive(held.id).await, Err(PipelineError::Transition(_))));
        assert!(matches!(
            desk.promote(Uuid::new_v4()).await,
            Err(PipelineError::ArticleNotFound { .. })
        ));
        Ok(())
    }

    #[test]
    fn threshold_must_be_a_probability() {
        assert!(PublicationStateMachine::new(1.2).is_err());
        assert!(PublicationStateMachine::new(-0.1).is_err());
    }
}
