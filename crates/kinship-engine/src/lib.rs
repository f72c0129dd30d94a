use kinship_github::GithubError;
use kinship_store::StoreError;
use thiserror::Error;

pub mod aggregator;
pub mod differ;
pub mod event;
pub mod formatter;
pub mod policy;
pub mod reply;
pub mod sync;

pub use aggregator::{find_similar, log_similar_issues};
pub use differ::{UpsertOutcome, diff, upsert_issue, values_differ};
pub use event::{AckStatus, EventAck, IssueEventHandler};
pub use formatter::{HIGH_CONFIDENCE_DISTANCE, MAX_COMMENT_CANDIDATES, format_comment, similarity_label};
pub use policy::CommentPolicy;
pub use reply::{ReplyTrigger, trigger_reply};
pub use sync::{SyncError, SyncOrchestrator, SyncReport, init_tables};

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("github error: {0}")]
    Github(#[from] GithubError),
    #[error("store error: {0}")]
    Store(#[from] StoreError),
}
