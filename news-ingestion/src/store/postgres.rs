use super::{ArticleStore, InsertOutcome, SourceRegistry};
use crate::types::{
    Article, ArticleStatus, FeedSource, PipelineError, Result, RewrittenContent, SourceFields,
    StoredLifecycle,
};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use interfaces::state::ArticleReader;
use sqlx::postgres::{PgPoolOptions, PgRow};
use sqlx::{PgPool, Row};
use std::time::Duration;
use tracing::{debug, info};
use uuid::Uuid;

const ARTICLE_COLUMNS: &str = r#"
    id, slug, source_url, source_name, source_title, source_content, source_excerpt,
    source_image_url, source_published_at, category, title, body, excerpt, meta_description,
    keywords, confidence_score, tokens_used, featured_image_url, status, scraped_at, rewritten_at,
    published_at
"#;

const SOURCE_COLUMNS: &str =
    "id, name, feed_url, category, is_active, last_scraped_at, total_articles_scraped";

pub struct PgArticleStore {
    db: PgPool,
}

impl PgArticleStore {
    pub async fn connect(database_url: &str, max_connections: u32) -> Result<Self> {
        let db = PgPoolOptions::new()
            .max_connections(max_connections)
            .connect(database_url)
            .await?;
        Ok(Self { db })
    }

    pub fn from_pool(db: PgPool) -> Self {
        Self { db }
    }

    pub async fn migrate(&self) -> Result<()> {
        sqlx::migrate!("./migrations").run(&self.db).await?;
        info!("Database migrations applied");
        Ok(())
    }

    pub async fn close(&self) {
        self.db.close().await;
    }
}

#[async_trait]
impl ArticleStore for PgArticleStore {
    async fn find_by_source_url(&self, source_url: &str) -> Result<Option<Article>> {
        let query = format!(
            "SELECT {} FROM articles WHERE source_url = $1 AND status <> 'archived'",
            ARTICLE_COLUMNS
        );
        let row = sqlx::query(&query)
            .bind(source_url)
            .fetch_optional(&self.db)
            .await?;

        row.as_ref().map(article_from_row).transpose()
    }

    async fn insert_scraped(&self, article: &Article) -> Result<InsertOutcome> {
        let result = sqlx::query(
            r#"
            INSERT INTO articles (
                id, slug, source_url, source_name, source_title, source_content, source_excerpt,
                source_image_url, source_published_at, category, status, scraped_at, claimed_at
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, NOW())
            ON CONFLICT DO NOTHING
            "#,
        )
        .bind(article.id)
        .bind(&article.slug)
        .bind(&article.source_url)
        .bind(&article.source.name)
        .bind(&article.source.title)
        .bind(&article.source.content)
        .bind(&article.source.excerpt)
        .bind(&article.source.image_url)
        .bind(article.source.published_at)
        .bind(&article.category)
        .bind(article.status().as_str())
        .bind(article.scraped_at)
        .execute(&self.db)
        .await?;

        if result.rows_affected() == 1 {
            debug!("Inserted article {} for {}", article.id, article.source_url);
            return Ok(InsertOutcome::Inserted);
        }

        // Lost to a unique index; find out which one.
        if self.find_by_source_url(&article.source_url).await?.is_some() {
            Ok(InsertOutcome::DuplicateSource)
        } else {
            Ok(InsertOutcome::SlugTaken)
        }
    }

    async fn claim(&self, id: Uuid, lease: Duration) -> Result<bool> {
        // database clock on both sides of the comparison
        let result = sqlx::query(
            r#"
            UPDATE articles SET claimed_at = NOW()
            WHERE id = $1 AND status = 'scraped'
              AND (claimed_at IS NULL OR claimed_at < NOW() - $2::float8 * INTERVAL '1 second')
            "#,
        )
        .bind(id)
        .bind(lease.as_secs_f64())
        .execute(&self.db)
        .await?;

        Ok(result.rows_affected() == 1)
    }

    async fn release(&self, id: Uuid) -> Result<()> {
        sqlx::query("UPDATE articles SET claimed_at = NULL WHERE id = $1 AND status = 'scraped'")
            .bind(id)
            .execute(&self.db)
            .await?;
        Ok(())
    }

    async fn save_transition(&self, article: &Article, expected: ArticleStatus) -> Result<bool> {
        let content = article.content.as_ref();
        let keywords: Vec<String> = content
            .map(|c| c.keywords.iter().cloned().collect())
            .unwrap_or_default();

        let result = sqlx::query(
            r#"
            UPDATE articles
            SET category = $2, title = $3, body = $4, excerpt = $5, meta_description = $6,
                keywords = $7, confidence_score = $8, featured_image_url = $9, status = $10,
                rewritten_at = $11, published_at = $12, tokens_used = $14, claimed_at = NULL
            WHERE id = $1 AND status = $13
            "#,
        )
        .bind(article.id)
        .bind(&article.category)
        .bind(content.map(|c| c.title.as_str()))
        .bind(content.map(|c| c.body.as_str()))
        .bind(content.map(|c| c.excerpt.as_str()))
        .bind(content.map(|c| c.meta_description.as_str()))
        .bind(keywords)
        .bind(content.map(|c| c.confidence_score))
        .bind(&article.featured_image_url)
        .bind(article.status().as_str())
        .bind(article.rewritten_at())
        .bind(article.published_at())
        .bind(expected.as_str())
        .bind(content.and_then(|c| c.tokens_used).map(|t| t as i32))
        .execute(&self.db)
        .await?;

        Ok(result.rows_affected() == 1)
    }

    async fn get(&self, id: Uuid) -> Result<Option<Article>> {
        let query = format!("SELECT {} FROM articles WHERE id = $1", ARTICLE_COLUMNS);
        let row = sqlx::query(&query).bind(id).fetch_optional(&self.db).await?;
        row.as_ref().map(article_from_row).transpose()
    }

    async fn list_by_status(&self, status: ArticleStatus, limit: usize) -> Result<Vec<Article>> {
        let order = match status {
            ArticleStatus::Published => "published_at DESC",
            ArticleStatus::Rewritten => "rewritten_at ASC",
            _ => "scraped_at ASC",
        };
        let query = format!(
            "SELECT {} FROM articles WHERE status = $1 ORDER BY {} LIMIT $2",
            ARTICLE_COLUMNS, order
        );
        let rows = sqlx::query(&query)
            .bind(status.as_str())
            .bind(limit as i64)
            .fetch_all(&self.db)
            .await?;

        rows.iter().map(article_from_row).collect()
    }
}

#[async_trait]
impl SourceRegistry for PgArticleStore {
    async fn upsert_source(&self, source: &FeedSource) -> Result<FeedSource> {
        let query = format!(
            r#"
            INSERT INTO sources (id, name, feed_url, category, is_active)
            VALUES ($1, $2, $3, $4, $5)
            ON CONFLICT (feed_url) DO UPDATE SET name = EXCLUDED.name, category = EXCLUDED.category
            RETURNING {}
            "#,
            SOURCE_COLUMNS
        );
        let row = sqlx::query(&query)
            .bind(source.id)
            .bind(&source.name)
            .bind(&source.feed_url)
            .bind(&source.category)
            .bind(source.is_active)
            .fetch_one(&self.db)
            .await?;
        source_from_row(&row)
    }

    async fn list_sources(&self, active_only: bool) -> Result<Vec<FeedSource>> {
        let query = format!(
            "SELECT {} FROM sources WHERE is_active OR NOT $1 ORDER BY name, feed_url",
            SOURCE_COLUMNS
        );
        let rows = sqlx::query(&query).bind(active_only).fetch_all(&self.db).await?;
        rows.iter().map(source_from_row).collect()
    }

    async fn set_source_active(&self, id: Uuid, active: bool) -> Result<bool> {
        let result = sqlx::query("UPDATE sources SET is_active = $2 WHERE id = $1")
            .bind(id)
            .bind(active)
            .execute(&self.db)
            .await?;
        Ok(result.rows_affected() == 1)
    }

    async fn record_source_run(&self, id: Uuid, at: DateTime<Utc>, new_records: usize) -> Result<()> {
        sqlx::query(
            r#"
            UPDATE sources
            SET last_scraped_at = $2, total_articles_scraped = total_articles_scraped + $3
            WHERE id = $1
            "#,
        )
        .bind(id)
        .bind(at)
        .bind(new_records as i64)
        .execute(&self.db)
        .await?;
        Ok(())
    }
}

#[async_trait]
impl ArticleReader for PgArticleStore {
    async fn published(&self, limit: usize) -> anyhow::Result<Vec<Article>> {
        Ok(self.list_by_status(ArticleStatus::Published, limit).await?)
    }

    async fn review_queue(&self, limit: usize) -> anyhow::Result<Vec<Article>> {
        Ok(self.list_by_status(ArticleStatus::Rewritten, limit).await?)
    }
}

fn article_from_row(row: &PgRow) -> Result<Article> {
    let status: String = row.try_get("status")?;
    let status = status
        .parse::<ArticleStatus>()
        .map_err(|e| PipelineError::Storage(e.to_string()))?;

    let body: Option<String> = row.try_get("body")?;
    let category: String = row.try_get("category")?;

    let content = match body {
        Some(body) => {
            let keywords: Vec<String> = row.try_get("keywords")?;
            Some(RewrittenContent {
                title: row.try_get::<Option<String>, _>("title")?.unwrap_or_default(),
                body,
                excerpt: row.try_get::<Option<String>, _>("excerpt")?.unwrap_or_default(),
                meta_description: row
                    .try_get::<Option<String>, _>("meta_description")?
                    .unwrap_or_default(),
                keywords: keywords.into_iter().collect(),
                category: category.clone(),
                confidence_score: row.try_get::<Option<f64>, _>("confidence_score")?.unwrap_or(0.0),
                tokens_used: row.try_get::<Option<i32>, _>("tokens_used")?.map(|t| t.max(0) as u32),
            })
        }
        None => None,
    };

    let mut article = Article::scraped(
        row.try_get("slug")?,
        row.try_get("source_url")?,
        SourceFields {
            name: row.try_get("source_name")?,
            title: row.try_get("source_title")?,
            content: row.try_get("source_content")?,
            excerpt: row.try_get("source_excerpt")?,
            image_url: row.try_get("source_image_url")?,
            published_at: row.try_get("source_published_at")?,
        },
        category,
        row.try_get("scraped_at")?,
    )
    .with_lifecycle(StoredLifecycle {
        status,
        rewritten_at: row.try_get("rewritten_at")?,
        published_at: row.try_get("published_at")?,
    });
    article.id = row.try_get("id")?;
    article.content = content;
    article.featured_image_url = row.try_get("featured_image_url")?;
    Ok(article)
}

fn source_from_row(row: &PgRow) -> Result<FeedSource> {
    let total: i64 = row.try_get("total_articles_scraped")?;
    Ok(FeedSource {
        id: row.try_get("id")?,
        name: row.try_get("name")?,
        feed_url: row.try_get("feed_url")?,
        category: row.try_get("category")?,
        is_active: row.try_get("is_active")?,
        last_scraped_at: row.try_get("last_scraped_at")?,
        total_articles_scraped: total.max(0) as u64,
    })
}
