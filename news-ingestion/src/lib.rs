pub mod config;
pub mod dedup;
pub mod feed_reader;
pub mod fetcher;
pub mod generator;
pub mod images;
pub mod parser;
pub mod pipeline;
pub mod publication;
pub mod rewriter;
pub mod slug;
pub mod store;
pub mod types;

pub use types::*;
pub use config::PipelineConfig;
pub use dedup::{DedupDecision, Deduplicator, UnknownPolicy};
pub use feed_reader::FeedReader;
pub use fetcher::Fetcher;
pub use generator::{GeneratedText, GenerationRequest, MockTextGenerator, OpenAiGenerator, TextGenerator};
pub use images::{ImageAcquirer, ImageResult, StorageBackend};
pub use parser::FeedParser;
pub use pipeline::{EntryOutcome, IngestionPipeline, PipelineBuilder, SourceRun};
pub use publication::{PublicationDecision, PublicationStateMachine, ReviewDesk};
pub use rewriter::{ContentRewriter, RewriteInput};
pub use slug::slug;
pub use store::{ArticleStore, InsertOutcome, MemoryArticleStore, PgArticleStore, SourceRegistry};
