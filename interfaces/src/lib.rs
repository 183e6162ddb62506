pub mod defs;
pub mod state;

pub use defs::{
    Article, ArticleStatus, FeedRunRequest, RewrittenContent, RunSummary, SourceFields,
    StoredLifecycle, TransitionError,
};
pub use state::{ArticleReader, PipelineTrigger};
