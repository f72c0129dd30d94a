use std::collections::{BTreeMap, BTreeSet};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::CoreError;

pub type ExternalId = i64;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum IssueState {
    #[default]
    Open,
    Closed,
}

impl IssueState {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Open => "open",
            Self::Closed => "closed",
        }
    }
}

impl std::str::FromStr for IssueState {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim() {
            "open" => Ok(Self::Open),
            "closed" => Ok(Self::Closed),
            other => Err(format!(
                "invalid issue state '{other}', expected one of: open, closed"
            )),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Issue {
    pub external_id: ExternalId,
    pub number: i64,
    pub repository: String,
    pub title: String,
    pub body: Option<String>,
    pub state: IssueState,
    pub locked: bool,
    pub author_login: String,
    pub labels: BTreeSet<String>,
    pub assignees: BTreeSet<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub closed_at: Option<DateTime<Utc>>,
    pub html_url: String,
    pub comments_count: i64,
    pub milestone_title: Option<String>,
    pub author_association: Option<String>,
    pub state_reason: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub title_vec: Option<Vec<f32>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub body_vec: Option<Vec<f32>>,
}

/// The statically declared schema of [`Issue`], in column order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IssueField {
    ExternalId,
    Number,
    Repository,
    Title,
    Body,
    State,
    Locked,
    AuthorLogin,
    Labels,
    Assignees,
    CreatedAt,
    UpdatedAt,
    ClosedAt,
    HtmlUrl,
    CommentsCount,
    MilestoneTitle,
    AuthorAssociation,
    StateReason,
    TitleVec,
    BodyVec,
}

impl IssueField {
    pub const ALL: [IssueField; 20] = [
        Self::ExternalId,
        Self::Number,
        Self::Repository,
        Self::Title,
        Self::Body,
        Self::State,
        Self::Locked,
        Self::AuthorLogin,
        Self::Labels,
        Self::Assignees,
        Self::CreatedAt,
        Self::UpdatedAt,
        Self::ClosedAt,
        Self::HtmlUrl,
        Self::CommentsCount,
        Self::MilestoneTitle,
        Self::AuthorAssociation,
        Self::StateReason,
        Self::TitleVec,
        Self::BodyVec,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Self::ExternalId => "external_id",
            Self::Number => "number",
            Self::Repository => "repository",
            Self::Title => "title",
            Self::Body => "body",
            Self::State => "state",
            Self::Locked => "locked",
            Self::AuthorLogin => "author_login",
            Self::Labels => "labels",
            Self::Assignees => "assignees",
            Self::CreatedAt => "created_at",
            Self::UpdatedAt => "updated_at",
            Self::ClosedAt => "closed_at",
            Self::HtmlUrl => "html_url",
            Self::CommentsCount => "comments_count",
            Self::MilestoneTitle => "milestone_title",
            Self::AuthorAssociation => "author_association",
            Self::StateReason => "state_reason",
            Self::TitleVec => "title_vec",
            Self::BodyVec => "body_vec",
        }
    }

    /// Vector fields are computed by the storage layer and never written directly.
    pub fn is_derived(self) -> bool {
        matches!(self, Self::TitleVec | Self::BodyVec)
    }

    /// The derived vector field recomputed when this field changes, if any.
    pub fn derived_vector(self) -> Option<IssueField> {
        match self {
            Self::Title => Some(Self::TitleVec),
            Self::Body => Some(Self::BodyVec),
            _ => None,
        }
    }
}

impl std::fmt::Display for IssueField {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Identity key plus derived vectors: never part of a diff-based update.
pub const PROTECTED_FIELDS: [IssueField; 3] =
    [IssueField::ExternalId, IssueField::TitleVec, IssueField::BodyVec];

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "value", rename_all = "snake_case")]
pub enum FieldValue {
    Absent,
    Text(String),
    Integer(i64),
    Bool(bool),
    Timestamp(DateTime<Utc>),
    Set(BTreeSet<String>),
    Vector(Vec<f32>),
    State(IssueState),
}

impl FieldValue {
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Absent => "absent",
            Self::Text(_) => "text",
            Self::Integer(_) => "integer",
            Self::Bool(_) => "bool",
            Self::Timestamp(_) => "timestamp",
            Self::Set(_) => "set",
            Self::Vector(_) => "vector",
            Self::State(_) => "state",
        }
    }
}

impl From<Option<String>> for FieldValue {
    fn from(value: Option<String>) -> Self {
        value.map(FieldValue::Text).unwrap_or(FieldValue::Absent)
    }
}

impl From<Option<DateTime<Utc>>> for FieldValue {
    fn from(value: Option<DateTime<Utc>>) -> Self {
        value.map(FieldValue::Timestamp).unwrap_or(FieldValue::Absent)
    }
}

impl From<Option<Vec<f32>>> for FieldValue {
    fn from(value: Option<Vec<f32>>) -> Self {
        value.map(FieldValue::Vector).unwrap_or(FieldValue::Absent)
    }
}

/// Field name to new value; an empty map means "nothing to persist".
pub type FieldChanges = BTreeMap<IssueField, FieldValue>;

impl Issue {
    pub fn field(&self, field: IssueField) -> FieldValue {
        match field {
            IssueField::ExternalId => FieldValue::Integer(self.external_id),
            IssueField::Number => FieldValue::Integer(self.number),
            IssueField::Repository => FieldValue::Text(self.repository.clone()),
            IssueField::Title => FieldValue::Text(self.title.clone()),
            IssueField::Body => self.body.clone().into(),
            IssueField::State => FieldValue::State(self.state),
            IssueField::Locked => FieldValue::Bool(self.locked),
            IssueField::AuthorLogin => FieldValue::Text(self.author_login.clone()),
            IssueField::Labels => FieldValue::Set(self.labels.clone()),
            IssueField::Assignees => FieldValue::Set(self.assignees.clone()),
            IssueField::CreatedAt => FieldValue::Timestamp(self.created_at),
            IssueField::UpdatedAt => FieldValue::Timestamp(self.updated_at),
            IssueField::ClosedAt => self.closed_at.into(),
            IssueField::HtmlUrl => FieldValue::Text(self.html_url.clone()),
            IssueField::CommentsCount => FieldValue::Integer(self.comments_count),
            IssueField::MilestoneTitle => self.milestone_title.clone().into(),
            IssueField::AuthorAssociation => self.author_association.clone().into(),
            IssueField::StateReason => self.state_reason.clone().into(),
            IssueField::TitleVec => self.title_vec.clone().into(),
            IssueField::BodyVec => self.body_vec.clone().into(),
        }
    }

    pub fn set_field(&mut self, field: IssueField, value: FieldValue) -> Result<(), CoreError> {
        let mismatch = |value: &FieldValue, expected: &'static str| CoreError::FieldType {
            field,
            expected,
            found: value.kind(),
        };

        match (field, value) {
            (IssueField::ExternalId, FieldValue::Integer(value)) => self.external_id = value,
            (IssueField::Number, FieldValue::Integer(value)) => self.number = value,
            (IssueField::CommentsCount, FieldValue::Integer(value)) => {
                self.comments_count = value
            }
            (IssueField::Repository, FieldValue::Text(value)) => self.repository = value,
            (IssueField::Title, FieldValue::Text(value)) => self.title = value,
            (IssueField::AuthorLogin, FieldValue::Text(value)) => self.author_login = value,
            (IssueField::HtmlUrl, FieldValue::Text(value)) => self.html_url = value,
            (IssueField::Body, value) => self.body = optional_text(field, value)?,
            (IssueField::MilestoneTitle, value) => {
                self.milestone_title = optional_text(field, value)?
            }
            (IssueField::AuthorAssociation, value) => {
                self.author_association = optional_text(field, value)?
            }
            (IssueField::StateReason, value) => self.state_reason = optional_text(field, value)?,
            (IssueField::State, FieldValue::State(value)) => self.state = value,
            (IssueField::Locked, FieldValue::Bool(value)) => self.locked = value,
            (IssueField::Labels, FieldValue::Set(value)) => self.labels = value,
            (IssueField::Assignees, FieldValue::Set(value)) => self.assignees = value,
            (IssueField::CreatedAt, FieldValue::Timestamp(value)) => self.created_at = value,
            (IssueField::UpdatedAt, FieldValue::Timestamp(value)) => self.updated_at = value,
            (IssueField::ClosedAt, FieldValue::Timestamp(value)) => self.closed_at = Some(value),
            (IssueField::ClosedAt, FieldValue::Absent) => self.closed_at = None,
            (IssueField::TitleVec, FieldValue::Vector(value)) => self.title_vec = Some(value),
            (IssueField::TitleVec, FieldValue::Absent) => self.title_vec = None,
            (IssueField::BodyVec, FieldValue::Vector(value)) => self.body_vec = Some(value),
            (IssueField::BodyVec, FieldValue::Absent) => self.body_vec = None,
            (
                IssueField::ExternalId | IssueField::Number | IssueField::CommentsCount,
                value,
            ) => return Err(mismatch(&value, "integer")),
            (
                IssueField::Repository
                | IssueField::Title
                | IssueField::AuthorLogin
                | IssueField::HtmlUrl,
                value,
            ) => return Err(mismatch(&value, "text")),
            (IssueField::State, value) => return Err(mismatch(&value, "state")),
            (IssueField::Locked, value) => return Err(mismatch(&value, "bool")),
            (IssueField::Labels | IssueField::Assignees, value) => {
                return Err(mismatch(&value, "set"));
            }
            (IssueField::CreatedAt | IssueField::UpdatedAt | IssueField::ClosedAt, value) => {
                return Err(mismatch(&value, "timestamp"));
            }
            (IssueField::TitleVec | IssueField::BodyVec, value) => {
                return Err(mismatch(&value, "vector"));
            }
        }

        Ok(())
    }

    pub fn apply_changes(&mut self, changes: &FieldChanges) -> Result<(), CoreError> {
        for (field, value) in changes {
            self.set_field(*field, value.clone())?;
        }
        Ok(())
    }

    /// Non-blank source text for a searchable field.
    pub fn searchable_text(&self, field: SearchField) -> Option<&str> {
        let text = match field {
            SearchField::Title => Some(self.title.as_str()),
            SearchField::Body => self.body.as_deref(),
        };
        text.filter(|value| !value.trim().is_empty())
    }
}

fn optional_text(field: IssueField, value: FieldValue) -> Result<Option<String>, CoreError> {
    match value {
        FieldValue::Text(text) => Ok(Some(text)),
        FieldValue::Absent => Ok(None),
        other => Err(CoreError::FieldType {
            field,
            expected: "text",
            found: other.kind(),
        }),
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum SearchField {
    #[serde(rename = "title_vec")]
    Title,
    #[serde(rename = "body_vec")]
    Body,
}

impl SearchField {
    pub const ALL: [SearchField; 2] = [Self::Title, Self::Body];

    /// The vector column searched for this field.
    pub fn as_str(self) -> &'static str {
        self.vector_field().as_str()
    }

    pub fn vector_field(self) -> IssueField {
        match self {
            Self::Title => IssueField::TitleVec,
            Self::Body => IssueField::BodyVec,
        }
    }

    pub fn source_field(self) -> IssueField {
        match self {
            Self::Title => IssueField::Title,
            Self::Body => IssueField::Body,
        }
    }

    pub fn label(self) -> &'static str {
        match self {
            Self::Title => "title",
            Self::Body => "body",
        }
    }
}

impl std::str::FromStr for SearchField {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim() {
            "title_vec" | "title" => Ok(Self::Title),
            "body_vec" | "body" => Ok(Self::Body),
            other => Err(format!(
                "invalid search field '{other}', expected one of: title_vec, body_vec"
            )),
        }
    }
}

/// A stored issue matched by nearest-neighbour search on one vector field.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SimilarIssue {
    pub issue: Issue,
    pub distance: f32,
    pub matched_field: SearchField,
}
