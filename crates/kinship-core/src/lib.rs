use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

mod issue;
mod secret;

pub use issue::{
    ExternalId, FieldChanges, FieldValue, Issue, IssueField, IssueState, PROTECTED_FIELDS,
    SearchField, SimilarIssue,
};
pub use secret::Secret;

/// Smallest time step of the upstream `since` filter.
pub const SYNC_TICK: Duration = Duration::seconds(1);

#[derive(Debug, Error, PartialEq, Eq)]
pub enum CoreError {
    #[error("field {field} expects a {expected} value, got {found}")]
    FieldType {
        field: IssueField,
        expected: &'static str,
        found: &'static str,
    },
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum IssueAction {
    Opened,
    Edited,
    Closed,
    Reopened,
    Labeled,
    Unlabeled,
    Assigned,
    Unassigned,
    Deleted,
    Transferred,
    Other(String),
}

impl IssueAction {
    pub fn parse(value: &str) -> Self {
        match value.trim() {
            "opened" => Self::Opened,
            "edited" => Self::Edited,
            "closed" => Self::Closed,
            "reopened" => Self::Reopened,
            "labeled" => Self::Labeled,
            "unlabeled" => Self::Unlabeled,
            "assigned" => Self::Assigned,
            "unassigned" => Self::Unassigned,
            "deleted" => Self::Deleted,
            "transferred" => Self::Transferred,
            other => Self::Other(other.to_owned()),
        }
    }

    pub fn as_str(&self) -> &str {
        match self {
            Self::Opened => "opened",
            Self::Edited => "edited",
            Self::Closed => "closed",
            Self::Reopened => "reopened",
            Self::Labeled => "labeled",
            Self::Unlabeled => "unlabeled",
            Self::Assigned => "assigned",
            Self::Unassigned => "unassigned",
            Self::Deleted => "deleted",
            Self::Transferred => "transferred",
            Self::Other(value) => value.as_str(),
        }
    }

    /// Only a freshly opened issue can trigger an automated reply.
    pub fn is_creation(&self) -> bool {
        matches!(self, Self::Opened)
    }
}

impl From<String> for IssueAction {
    fn from(value: String) -> Self {
        Self::parse(&value)
    }
}

impl From<IssueAction> for String {
    fn from(value: IssueAction) -> Self {
        value.as_str().to_owned()
    }
}

impl std::fmt::Display for IssueAction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Next `since` value after a batch whose newest record was updated at `latest`.
pub fn advance_watermark(latest: DateTime<Utc>) -> DateTime<Utc> {
    latest + SYNC_TICK
}

pub fn truncate_for_display(text: &str, max_chars: usize) -> String {
    let mut chars = text.chars();
    let head: String = chars.by_ref().take(max_chars).collect();
    if chars.next().is_some() {
        format!("{head}...")
    } else {
        head
    }
}
