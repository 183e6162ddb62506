use crate::config::PipelineConfig;
use crate::dedup::{DedupDecision, Deduplicator, UnknownPolicy};
use crate::feed_reader::FeedReader;
use crate::fetcher::Fetcher;
use crate::generator::{OpenAiGenerator, TextGenerator};
use crate::images::{ImageAcquirer, StorageBackend};
use crate::parser::html_to_text;
use crate::publication::{PublicationDecision, PublicationStateMachine};
use crate::rewriter::{truncate_at_word, ContentRewriter, RewriteInput};
use crate::slug::{short_hash, slug_for_source};
use crate::store::{ArticleStore, InsertOutcome, SourceRegistry};
use crate::types::{
    Article, ArticleStatus, CandidateEntry, FeedRunRequest, FeedSource, PipelineError, Result,
    RunSummary, SourceFields,
};
use async_trait::async_trait;
use chrono::Utc;
use futures::stream::{self, StreamExt};
use interfaces::state::PipelineTrigger;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

const MAX_SOURCE_EXCERPT_CHARS: usize = 500;

/// How a single entry ended up.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntryOutcome {
    Published,
    HeldForReview,
    Duplicate,
    Failed,
    NotProcessed,
}

/// What a multi-feed run did with one registered source.
#[derive(Debug)]
pub struct SourceRun {
    pub source: FeedSource,
    pub result: Result<RunSummary>,
}

/// Runs feeds through dedup, image acquisition, rewriting and publication.
pub struct IngestionPipeline {
    reader: FeedReader,
    dedup: Deduplicator,
    store: Arc<dyn ArticleStore>,
    images: ImageAcquirer,
    rewriter: ContentRewriter,
    publisher: PublicationStateMachine,
    max_concurrency: usize,
    max_entries_per_run: Option<usize>,
    claim_lease: Duration,
    cancel: CancellationToken,
}

impl IngestionPipeline {
    pub fn builder(config: PipelineConfig) -> PipelineBuilder {
        PipelineBuilder::new(config)
    }

    /// Token that stops the pipeline from starting further entries.
    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    pub fn store(&self) -> Arc<dyn ArticleStore> {
        self.store.clone()
    }

    pub async fn run_feed(&self, request: &FeedRunRequest) -> Result<RunSummary> {
        self.run_feed_until(request, &self.cancel).await
    }

    /// Run one feed, starting no new entry once `cancel` fires. Entries
    /// already in flight are finished.
    pub async fn run_feed_until(&self, request: &FeedRunRequest, cancel: &CancellationToken) -> Result<RunSummary> {
        info!("Starting run for {} (category {})", request.feed_url, request.category);

        let mut entries = self.reader.read_feed(&request.feed_url).await?;
        let mut summary = RunSummary { fetched: entries.len(), ..Default::default() };

        if let Some(max) = self.max_entries_per_run {
            if entries.len() > max {
                debug!("Limiting run to {} of {} entries", max, entries.len());
                summary.not_processed += entries.len() - max;
                entries.truncate(max);
            }
        }

        let outcomes: Vec<(EntryOutcome, bool)> = stream::iter(entries)
            .map(|entry| self.process(entry, request, cancel))
            .buffer_unordered(self.max_concurrency)
            .collect()
            .await;

        for (outcome, inserted) in outcomes {
            if inserted {
                summary.new_records += 1;
            }
            match outcome {
                EntryOutcome::Published => summary.published += 1,
                EntryOutcome::HeldForReview => summary.held_for_review += 1,
                EntryOutcome::Duplicate => summary.skipped_duplicate += 1,
                EntryOutcome::Failed => summary.failed += 1,
                EntryOutcome::NotProcessed => summary.not_processed += 1,
            }
        }

        info!(
            "Run for {} done: fetched={} new={} duplicates={} published={} held={} failed={} not_processed={}",
            request.feed_url,
            summary.fetched,
            summary.new_records,
            summary.skipped_duplicate,
            summary.published,
            summary.held_for_review,
            summary.failed,
            summary.not_processed
        );
        Ok(summary)
    }

    /// Run every active registered source in turn, stamping each one
    /// that was read. A failing source does not stop the others.
    pub async fn run_sources(&self, registry: &dyn SourceRegistry) -> Result<Vec<SourceRun>> {
        let sources = registry.list_sources(true).await?;
        info!("Running {} active sources", sources.len());

        let mut runs = Vec::with_capacity(sources.len());
        for source in sources {
            if self.cancel.is_cancelled() {
                info!("Run cancelled, not starting {}", source.name);
                break;
            }

            let result = self.run_feed(&source.run_request()).await;
            match &result {
                Ok(summary) => {
                    if let Err(e) = registry.record_source_run(source.id, Utc::now(), summary.new_records).await {
                        error!(source = %source.name, error = %e, "Could not record source run");
                    }
                }
                Err(e) => error!(source = %source.name, feed_url = %source.feed_url, error = %e, "Source run failed"),
            }
            runs.push(SourceRun { source, result });
        }

        let new_records: usize = runs
            .iter()
            .filter_map(|r| r.result.as_ref().ok())
            .map(|s| s.new_records)
            .sum();
        let published: usize = runs
            .iter()
            .filter_map(|r| r.result.as_ref().ok())
            .map(|s| s.published)
            .sum();
        info!("All sources done: {} runs, {} new records, {} published", runs.len(), new_records, published);
        Ok(runs)
    }

    pub async fn process_entry(
        &self,
        entry: CandidateEntry,
        request: &FeedRunRequest,
        cancel: &CancellationToken,
    ) -> EntryOutcome {
        self.process(entry, request, cancel).await.0
    }

    /// The outcome, and whether this call created the record.
    async fn process(
        &self,
        entry: CandidateEntry,
        request: &FeedRunRequest,
        cancel: &CancellationToken,
    ) -> (EntryOutcome, bool) {
        if cancel.is_cancelled() {
            debug!("Run cancelled, not starting {}", entry.link);
            return (EntryOutcome::NotProcessed, false);
        }

        let (article, inserted) = match self.dedup.check(&entry.link).await {
            DedupDecision::New => match self.insert_new(&entry, request).await {
                Ok(Some(article)) => (article, true),
                Ok(None) => return (EntryOutcome::Duplicate, false),
                Err(e) => {
                    error!(source_url = %entry.link, error = %e, "Could not persist scraped article");
                    return (EntryOutcome::Failed, false);
                }
            },
            DedupDecision::Duplicate => {
                debug!("Skipping duplicate {}", entry.link);
                return (EntryOutcome::Duplicate, false);
            }
            DedupDecision::Resume(article) => match self.store.claim(article.id, self.claim_lease).await {
                Ok(true) => {
                    info!("Retrying {} left at scraped by an earlier run", entry.link);
                    (article, false)
                }
                Ok(false) => {
                    debug!("{} is being processed by another run", entry.link);
                    return (EntryOutcome::Duplicate, false);
                }
                Err(e) => {
                    error!(source_url = %entry.link, error = %e, "Could not claim scraped article");
                    return (EntryOutcome::Failed, false);
                }
            },
            DedupDecision::Unknown(reason) => match self.dedup.policy() {
                UnknownPolicy::Skip => {
                    warn!(source_url = %entry.link, reason = %reason, "Existence unknown, skipping");
                    return (EntryOutcome::Failed, false);
                }
                UnknownPolicy::Proceed => match self.insert_new(&entry, request).await {
                    Ok(Some(article)) => (article, true),
                    Ok(None) => return (EntryOutcome::Duplicate, false),
                    Err(e) => {
                        error!(source_url = %entry.link, error = %e, "Could not persist scraped article");
                        return (EntryOutcome::Failed, false);
                    }
                },
            },
        };

        let outcome = self.rewrite_claimed(article).await;
        (outcome, inserted)
    }

    /// Image, rewrite and transition for a record this run has claimed.
    /// The claim is released on every path that leaves it at `scraped`.
    async fn rewrite_claimed(&self, mut article: Article) -> EntryOutcome {
        let body = article
            .source
            .content
            .as_deref()
            .or(article.source.excerpt.as_deref())
            .map(html_to_text)
            .unwrap_or_default();
        let input = RewriteInput {
            title: &article.source.title,
            body: &body,
            slug: &article.slug,
            category_hint: &article.category,
        };

        let (image_url, rewrite) = tokio::join!(
            self.images.acquire(article.source.image_url.as_deref(), &article.slug, &article.category),
            self.rewriter.rewrite(&input),
        );

        let rewrite = match rewrite {
            Ok(rewrite) => rewrite,
            Err(e) => {
                error!(slug = %article.slug, error = %e, "Rewrite failed, article stays scraped");
                self.release(&article).await;
                return EntryOutcome::Failed;
            }
        };

        let issues = self.rewriter.quality_issues(&rewrite);
        let decision = match self
            .publisher
            .apply_rewrite_with_issues(&mut article, rewrite, image_url, &issues, Utc::now())
        {
            Ok(decision) => decision,
            Err(e) => {
                error!(slug = %article.slug, error = %e, "Transition rejected");
                self.release(&article).await;
                return EntryOutcome::Failed;
            }
        };

        match self.store.save_transition(&article, ArticleStatus::Scraped).await {
            Ok(true) => match decision {
                PublicationDecision::Published => EntryOutcome::Published,
                PublicationDecision::HeldForReview => EntryOutcome::HeldForReview,
            },
            Ok(false) => {
                warn!("{} was moved on by another run, dropping this result", article.slug);
                EntryOutcome::Duplicate
            }
            Err(e) => {
                error!(slug = %article.slug, error = %e, "Could not persist rewritten article");
                self.release(&article).await;
                EntryOutcome::Failed
            }
        }
    }

    async fn release(&self, article: &Article) {
        if let Err(e) = self.store.release(article.id).await {
            warn!(slug = %article.slug, error = %e, "Could not release claim, it will lapse");
        }
    }

    /// Insert a scraped record. `None` when another record already owns
    /// the source URL.
    async fn insert_new(&self, entry: &CandidateEntry, request: &FeedRunRequest) -> Result<Option<Article>> {
        let scraped_at = Utc::now();
        let date = entry.published_at.unwrap_or(scraped_at).format("%Y-%m-%d").to_string();

        let source = SourceFields {
            name: request.source_name.clone(),
            title: entry.title.clone(),
            content: entry.content.clone().or_else(|| entry.description.clone()),
            excerpt: entry
                .description
                .as_deref()
                .map(|d| truncate_at_word(&html_to_text(d), MAX_SOURCE_EXCERPT_CHARS))
                .filter(|d| !d.is_empty()),
            image_url: entry.image_url.clone(),
            published_at: entry.published_at,
        };

        let first_slug = slug_for_source(&entry.title, &entry.link, Some(&date));
        let retry_slug = slug_for_source(
            &entry.title,
            &entry.link,
            Some(&format!("{}-{}", date, short_hash(&entry.link))),
        );

        for slug in [first_slug, retry_slug] {
            let article = Article::scraped(
                slug,
                entry.link.clone(),
                source.clone(),
                request.category.clone(),
                scraped_at,
            );

            match self.store.insert_scraped(&article).await? {
                InsertOutcome::Inserted => {
                    debug!("Stored {} as {}", entry.link, article.slug);
                    return Ok(Some(article));
                }
                InsertOutcome::DuplicateSource => {
                    debug!("Lost insert race for {}", entry.link);
                    return Ok(None);
                }
                InsertOutcome::SlugTaken => {
                    debug!("Slug {} taken, disambiguating", article.slug);
                }
            }
        }

        Err(PipelineError::Storage(format!("no free slug for {}", entry.link)))
    }
}

#[async_trait]
impl PipelineTrigger for IngestionPipeline {
    async fn run_feed(&self, request: FeedRunRequest) -> anyhow::Result<RunSummary> {
        Ok(IngestionPipeline::run_feed(self, &request).await?)
    }
}

pub struct PipelineBuilder {
    config: PipelineConfig,
    store: Option<Arc<dyn ArticleStore>>,
    generator: Option<Arc<dyn TextGenerator>>,
    extra_backends: Vec<Arc<dyn StorageBackend>>,
    cancel: Option<CancellationToken>,
}

impl PipelineBuilder {
    pub fn new(config: PipelineConfig) -> Self {
        Self {
            config,
            store: None,
            generator: None,
            extra_backends: Vec::new(),
            cancel: None,
        }
    }

    pub fn store(mut self, store: Arc<dyn ArticleStore>) -> Self {
        self.store = Some(store);
        self
    }

    /// Defaults to an [`OpenAiGenerator`] built from the config.
    pub fn generator(mut self, generator: Arc<dyn TextGenerator>) -> Self {
        self.generator = Some(generator);
        self
    }

    /// Append a backend after the configured ones.
    pub fn storage_backend(mut self, backend: Arc<dyn StorageBackend>) -> Self {
        self.extra_backends.push(backend);
        self
    }

    pub fn cancellation_token(mut self, token: CancellationToken) -> Self {
        self.cancel = Some(token);
        self
    }

    pub fn build(self) -> Result<IngestionPipeline> {
        let config = self.config;
        config.validate()?;

        let store = self
            .store
            .ok_or_else(|| PipelineError::Config("an article store is required".to_string()))?;
        let generator = match self.generator {
            Some(generator) => generator,
            None => Arc::new(OpenAiGenerator::new(&config.generator)?),
        };

        let fetcher = Arc::new(Fetcher::new(config.fetch.clone())?);
        let mut images = ImageAcquirer::from_config(fetcher.clone(), config.images.clone())?;
        for backend in self.extra_backends {
            images = images.with_backend(backend);
        }
        info!("Image backends: {:?}", images.backend_names());

        Ok(IngestionPipeline {
            reader: FeedReader::new(fetcher),
            dedup: Deduplicator::new(store.clone(), config.dedup_timeout, config.unknown_policy),
            store,
            images,
            rewriter: ContentRewriter::new(generator, config.rewriter.clone())
                .with_sampling(config.generator.temperature, config.generator.max_tokens),
            publisher: PublicationStateMachine::new(config.publish_threshold)?,
            max_concurrency: config.max_concurrency,
            max_entries_per_run: config.max_entries_per_run,
            claim_lease: config.claim_lease,
            cancel: self.cancel.unwrap_or_default(),
        })
    }
}
