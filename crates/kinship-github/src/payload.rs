use std::collections::BTreeSet;

use chrono::{DateTime, Utc};
use kinship_core::{Issue, IssueAction, IssueState};
use serde::Deserialize;

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct RawUser {
    pub login: String,
}

/// Labels arrive as objects from the REST API and occasionally as bare names.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(untagged)]
pub enum RawLabel {
    Named { name: String },
    Plain(String),
}

impl RawLabel {
    pub fn name(&self) -> &str {
        match self {
            Self::Named { name } | Self::Plain(name) => name,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct RawMilestone {
    pub title: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct RawRepository {
    pub full_name: String,
}

/// Issue JSON shared by the REST listing and `issues` webhook deliveries.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct RawIssue {
    pub id: i64,
    pub number: i64,
    pub title: String,
    #[serde(default)]
    pub body: Option<String>,
    pub state: IssueState,
    #[serde(default)]
    pub locked: bool,
    pub user: RawUser,
    #[serde(default)]
    pub labels: Vec<RawLabel>,
    #[serde(default)]
    pub assignee: Option<RawUser>,
    #[serde(default)]
    pub assignees: Vec<RawUser>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(default)]
    pub closed_at: Option<DateTime<Utc>>,
    pub html_url: String,
    #[serde(default)]
    pub comments: i64,
    #[serde(default)]
    pub milestone: Option<RawMilestone>,
    #[serde(default)]
    pub author_association: Option<String>,
    #[serde(default)]
    pub state_reason: Option<String>,
}

impl RawIssue {
    pub fn into_issue(self, repository: &str) -> Issue {
        let labels = self
            .labels
            .iter()
            .map(|label| label.name().to_owned())
            .collect::<BTreeSet<_>>();
        let assignees = self
            .assignees
            .into_iter()
            .chain(self.assignee)
            .map(|user| user.login)
            .collect::<BTreeSet<_>>();

        Issue {
            external_id: self.id,
            number: self.number,
            repository: repository.to_owned(),
            title: self.title,
            body: self.body,
            state: self.state,
            locked: self.locked,
            author_login: self.user.login,
            labels,
            assignees,
            created_at: self.created_at,
            updated_at: self.updated_at,
            closed_at: self.closed_at,
            html_url: self.html_url,
            comments_count: self.comments,
            milestone_title: self.milestone.map(|milestone| milestone.title),
            author_association: self.author_association,
            state_reason: self.state_reason,
            title_vec: None,
            body_vec: None,
        }
    }
}

/// Body of an `issues` webhook delivery.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct IssuesEvent {
    #[serde(default)]
    pub action: Option<IssueAction>,
    pub issue: RawIssue,
    #[serde(default)]
    pub repository: Option<RawRepository>,
}

impl IssuesEvent {
    pub fn repository_name(&self) -> Option<&str> {
        self.repository
            .as_ref()
            .map(|repository| repository.full_name.as_str())
    }
}
