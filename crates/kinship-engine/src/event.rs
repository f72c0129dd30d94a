use std::sync::Arc;

use kinship_config::TriageConfig;
use kinship_core::{Issue, IssueAction};
use kinship_github::{CommentPublisher, parse_issues_event};
use kinship_store::{IssueStore, SimilaritySearch};
use serde::Serialize;
use serde_json::Value;

use crate::EngineError;
use crate::aggregator::{find_similar, log_similar_issues};
use crate::differ::{UpsertOutcome, upsert_issue};
use crate::formatter::format_comment;
use crate::policy::CommentPolicy;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum AckStatus {
    Success,
    Ignored,
    Error,
}

/// Structured acknowledgement returned for every delivery.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct EventAck {
    pub status: AckStatus,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub action: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub issue_number: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub outcome: Option<UpsertOutcome>,
    pub comment_posted: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub notification_error: Option<String>,
}

impl EventAck {
    fn with_status(status: AckStatus, message: impl Into<String>) -> Self {
        Self {
            status,
            message: message.into(),
            action: None,
            issue_number: None,
            outcome: None,
            comment_posted: false,
            notification_error: None,
        }
    }

    pub fn success(message: impl Into<String>) -> Self {
        Self::with_status(AckStatus::Success, message)
    }

    pub fn ignored(message: impl Into<String>) -> Self {
        Self::with_status(AckStatus::Ignored, message)
    }

    pub fn error(message: impl Into<String>) -> Self {
        Self::with_status(AckStatus::Error, message)
    }

    pub fn is_error(&self) -> bool {
        self.status == AckStatus::Error
    }
}

/// Persists an `issues` delivery and, for new issues, may reply with related ones.
pub struct IssueEventHandler {
    store: Arc<dyn IssueStore>,
    search: Arc<dyn SimilaritySearch>,
    publisher: Option<Arc<dyn CommentPublisher>>,
    policy: CommentPolicy,
    limit_per_field: u32,
    distance_threshold: f32,
    default_repository: Option<String>,
}

impl IssueEventHandler {
    pub fn new(
        store: Arc<dyn IssueStore>,
        search: Arc<dyn SimilaritySearch>,
        triage: &TriageConfig,
    ) -> Self {
        Self {
            store,
            search,
            publisher: None,
            policy: CommentPolicy::from_config(triage),
            limit_per_field: triage.limit_per_field,
            distance_threshold: triage.distance_threshold,
            default_repository: None,
        }
    }

    pub fn with_publisher(mut self, publisher: Arc<dyn CommentPublisher>) -> Self {
        self.publisher = Some(publisher);
        self
    }

    /// Used when a delivery does not name its repository.
    pub fn with_default_repository(mut self, repository: impl Into<String>) -> Self {
        self.default_repository = Some(repository.into());
        self
    }

    pub async fn handle(&self, action: &str, payload: &Value) -> EventAck {
        let action = IssueAction::parse(action);

        let event = match parse_issues_event(payload) {
            Ok(event) => event,
            Err(err) => {
                tracing::error!(action = %action, error = %err, "invalid issues delivery");
                return EventAck::error(format!("invalid issues payload: {err}"));
            }
        };

        let Some(repository) = event
            .repository_name()
            .map(str::to_owned)
            .or_else(|| self.default_repository.clone())
        else {
            return EventAck::error("delivery does not name a repository");
        };

        let issue = event.issue.into_issue(&repository);
        let number = issue.number;
        tracing::info!(
            action = %action,
            number,
            repository = %repository,
            author = %issue.author_login,
            state = issue.state.as_str(),
            title = %issue.title,
            "received issues event"
        );

        let outcome = match upsert_issue(self.store.as_ref(), issue.clone()).await {
            Ok(outcome) => outcome,
            Err(err) => {
                tracing::error!(action = %action, number, error = %err, "failed to persist issue");
                let mut ack = EventAck::error(format!("failed to persist issue #{number}: {err}"));
                ack.action = Some(action.to_string());
                ack.issue_number = Some(number);
                return ack;
            }
        };

        let mut ack = EventAck::success("issues webhook processed");
        ack.action = Some(action.to_string());
        ack.issue_number = Some(number);
        ack.outcome = Some(outcome);

        if action.is_creation() {
            match self.notify(&action, &issue).await {
                Ok(posted) => ack.comment_posted = posted,
                Err(err) => {
                    tracing::error!(number, error = %err, "failed to post similar issues comment");
                    ack.notification_error = Some(err.to_string());
                }
            }
        }

        tracing::info!(action = %action, number, "processed issues event");
        ack
    }

    /// Runs the similar-issues reply; `Ok(true)` when a comment was posted.
    async fn notify(&self, action: &IssueAction, issue: &Issue) -> Result<bool, EngineError> {
        let candidates = find_similar(
            self.search.as_ref(),
            issue,
            self.limit_per_field,
            self.distance_threshold,
        )
        .await;
        log_similar_issues(&candidates, issue);

        if !self.policy.should_notify(action, issue, &candidates) {
            return Ok(false);
        }

        let Some(publisher) = self.publisher.as_ref() else {
            tracing::info!(
                number = issue.number,
                "comment warranted but no publisher is configured"
            );
            return Ok(false);
        };

        let body = format_comment(&candidates);
        publisher.post_comment(issue.number, &body).await?;
        Ok(true)
    }
}
