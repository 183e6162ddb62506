use anyhow::Context;
use clap::{Parser, Subcommand};
use interfaces::state::ArticleReader;
use news_ingestion::{
    Article, FeedRunRequest, FeedSource, IngestionPipeline, PgArticleStore, PipelineConfig,
    PublicationStateMachine, ReviewDesk, SourceRegistry,
};
use std::sync::Arc;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;
use uuid::Uuid;

#[derive(Parser)]
#[command(name = "news-ingestion", about = "Ingest news feeds into rewritten, image-backed articles")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Ingest one feed
    Run {
        #[arg(long)]
        feed_url: String,
        /// Category hint for the feed's entries
        #[arg(long)]
        category: String,
        /// Source name recorded on each article (defaults to the feed host)
        #[arg(long)]
        source_name: Option<String>,
        #[command(flatten)]
        overrides: RunOverrides,
    },
    /// Ingest every active registered source
    RunAll {
        #[command(flatten)]
        overrides: RunOverrides,
    },
    /// Register a feed, or update the one with the same URL
    AddSource {
        #[arg(long)]
        name: String,
        #[arg(long)]
        feed_url: String,
        #[arg(long)]
        category: String,
    },
    /// List registered sources
    Sources {
        /// Include disabled sources
        #[arg(long)]
        all: bool,
    },
    /// Include a source in run-all again
    EnableSource { id: Uuid },
    /// Leave a source out of run-all
    DisableSource { id: Uuid },
    /// List articles held for manual review
    Review {
        #[arg(long, default_value_t = 20)]
        limit: usize,
    },
    /// List published articles
    Published {
        #[arg(long, default_value_t = 20)]
        limit: usize,
    },
    /// Publish a held article
    Promote { id: Uuid },
    /// Archive an article
    Archive { id: Uuid },
    /// Apply database migrations
    Migrate,
}

#[derive(clap::Args)]
struct RunOverrides {
    #[arg(long)]
    max_entries: Option<usize>,
    #[arg(long)]
    concurrency: Option<usize>,
    #[arg(long)]
    threshold: Option<f64>,
}

impl RunOverrides {
    fn apply(self, config: &mut PipelineConfig) {
        if let Some(max) = self.max_entries {
            config.max_entries_per_run = Some(max);
        }
        if let Some(concurrency) = self.concurrency {
            config.max_concurrency = concurrency;
        }
        if let Some(threshold) = self.threshold {
            config.publish_threshold = threshold;
        }
    }
}

/// Stop starting new entries on Ctrl-C.
fn interruptible(pipeline: &IngestionPipeline) {
    let cancel = pipeline.cancellation_token();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("Interrupt received, finishing in-flight articles");
            cancel.cancel();
        }
    });
}

fn print_sources(sources: &[FeedSource]) {
    for source in sources {
        let last = source
            .last_scraped_at
            .map(|at| at.format("%Y-%m-%d %H:%M").to_string())
            .unwrap_or_else(|| "never".to_string());
        let state = if source.is_active { "active" } else { "disabled" };
        println!(
            "{}  {:<8}  {:<10}  {:>5}  {:<16}  {}  {}",
            source.id, state, source.category, source.total_articles_scraped, last, source.name, source.feed_url
        );
    }
}

fn init_logging() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).with_target(false).init();
}

/// Connection string with the password masked.
fn redacted(database_url: &str) -> String {
    match url::Url::parse(database_url) {
        Ok(mut parsed) if parsed.password().is_some() => {
            let _ = parsed.set_password(Some("***"));
            parsed.to_string()
        }
        Ok(parsed) => parsed.to_string(),
        Err(_) => "<unparseable database url>".to_string(),
    }
}

fn print_articles(articles: &[Article]) {
    for article in articles {
        let title = article.content.as_ref().map_or(article.source.title.as_str(), |c| c.title.as_str());
        let score = article
            .confidence_score()
            .map(|s| format!("{:.2}", s))
            .unwrap_or_else(|| "-".to_string());
        println!("{}  {:<9}  {}  {}  {}", article.id, article.status(), score, article.slug, title);
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let _ = dotenvy::dotenv();
    init_logging();

    let cli = Cli::parse();
    let mut config = PipelineConfig::from_env()?;

    info!("Connecting to database: {}", redacted(&config.database_url));
    let store = Arc::new(
        PgArticleStore::connect(&config.database_url, config.max_concurrency as u32 + 2)
            .await
            .context("failed to connect to the database")?,
    );

    match cli.command {
        Command::Migrate => {
            store.migrate().await?;
        }
        Command::Review { limit } => {
            print_articles(&store.review_queue(limit).await?);
        }
        Command::Published { limit } => {
            print_articles(&store.published(limit).await?);
        }
        Command::Promote { id } => {
            let desk = ReviewDesk::new(store.clone(), PublicationStateMachine::new(config.publish_threshold)?);
            let article = desk.promote(id).await?;
            info!("Promoted {} ({})", article.slug, article.id);
        }
        Command::Archive { id } => {
            let desk = ReviewDesk::new(store.clone(), PublicationStateMachine::new(config.publish_threshold)?);
            let article = desk.archive(id).await?;
            info!("Archived {} ({})", article.slug, article.id);
        }
        Command::AddSource { name, feed_url, category } => {
            url::Url::parse(&feed_url).with_context(|| format!("invalid feed URL {}", feed_url))?;
            let source = store.upsert_source(&FeedSource::new(name, feed_url, category)).await?;
            info!("Registered {} ({})", source.name, source.id);
        }
        Command::Sources { all } => {
            print_sources(&store.list_sources(!all).await?);
        }
        Command::EnableSource { id } => {
            if !store.set_source_active(id, true).await? {
                warn!("No source with id {}", id);
            }
        }
        Command::DisableSource { id } => {
            if !store.set_source_active(id, false).await? {
                warn!("No source with id {}", id);
            }
        }
        Command::RunAll { overrides } => {
            overrides.apply(&mut config);
            let pipeline = IngestionPipeline::builder(config).store(store.clone()).build()?;
            interruptible(&pipeline);

            let runs = pipeline.run_sources(&*store).await?;
            for run in &runs {
                match &run.result {
                    Ok(summary) => println!("{}: {}", run.source.name, serde_json::to_string(summary)?),
                    Err(e) => println!("{}: failed: {}", run.source.name, e),
                }
            }
        }
        Command::Run { feed_url, category, source_name, overrides } => {
            overrides.apply(&mut config);

            let source_name = source_name
                .or_else(|| url::Url::parse(&feed_url).ok()?.host_str().map(str::to_string))
                .unwrap_or_else(|| feed_url.clone());

            let pipeline = IngestionPipeline::builder(config).store(store.clone()).build()?;
            interruptible(&pipeline);

            let request = FeedRunRequest { feed_url, category, source_name };
            match pipeline.run_feed(&request).await {
                Ok(summary) => println!("{}", serde_json::to_string_pretty(&summary)?),
                Err(e) => {
                    error!("Run for {} failed: {}", request.feed_url, e);
                    store.close().await;
                    return Err(e.into());
                }
            }
        }
    }

    store.close().await;
    Ok(())
}
