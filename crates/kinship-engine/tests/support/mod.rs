#![allow(dead_code)]

use std::collections::{BTreeMap, BTreeSet, HashMap, VecDeque};
use std::sync::Mutex;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use kinship_core::{
    ExternalId, FieldChanges, Issue, IssueField, IssueState, SearchField, SimilarIssue,
};
use kinship_github::{
    CommentPublisher, GithubError, IssueLabeler, IssueSource, IssueStateFilter,
};
use kinship_store::{IssueStore, SimilaritySearch, StoreError};
use serde_json::{Value, json};

pub const REPOSITORY: &str = "acme/widgets";

pub fn raw_issue(id: i64, number: i64, title: &str, body: Option<&str>, updated_at: &str) -> Value {
    json!({
        "id": id,
        "number": number,
        "title": title,
        "body": body,
        "state": "open",
        "locked": false,
        "user": { "login": "octocat" },
        "labels": [{ "name": "bug" }],
        "assignees": [],
        "created_at": "2024-01-01T00:00:00Z",
        "updated_at": updated_at,
        "closed_at": null,
        "html_url": format!("https://github.com/{REPOSITORY}/issues/{number}"),
        "comments": 0,
        "milestone": null,
        "author_association": "CONTRIBUTOR",
        "state_reason": null
    })
}

pub fn delivery(action: &str, issue: Value) -> Value {
    json!({
        "action": action,
        "issue": issue,
        "repository": { "full_name": REPOSITORY }
    })
}

pub fn stored_issue(external_id: ExternalId, number: i64, title: &str) -> Issue {
    Issue {
        external_id,
        number,
        repository: REPOSITORY.to_owned(),
        title: title.to_owned(),
        body: None,
        state: IssueState::Open,
        locked: false,
        author_login: "octocat".to_owned(),
        labels: BTreeSet::new(),
        assignees: BTreeSet::new(),
        created_at: "2024-01-01T00:00:00Z".parse().expect("timestamp"),
        updated_at: "2024-01-01T00:00:00Z".parse().expect("timestamp"),
        closed_at: None,
        html_url: format!("https://github.com/{REPOSITORY}/issues/{number}"),
        comments_count: 0,
        milestone_title: None,
        author_association: None,
        state_reason: None,
        title_vec: None,
        body_vec: None,
    }
}

pub fn similar(issue: Issue, distance: f32, field: SearchField) -> SimilarIssue {
    SimilarIssue {
        issue,
        distance,
        matched_field: field,
    }
}

/// Keyed issue table held in memory.
#[derive(Default)]
pub struct MemoryStore {
    pub issues: Mutex<BTreeMap<ExternalId, Issue>>,
    pub tables: Mutex<BTreeSet<String>>,
    pub inserts: Mutex<usize>,
    pub updates: Mutex<Vec<FieldChanges>>,
    pub fail_writes: bool,
}

impl MemoryStore {
    pub fn failing() -> Self {
        Self {
            fail_writes: true,
            ..Self::default()
        }
    }

    pub fn len(&self) -> usize {
        self.issues.lock().expect("lock").len()
    }

    pub fn issue(&self, external_id: ExternalId) -> Option<Issue> {
        self.issues.lock().expect("lock").get(&external_id).cloned()
    }

    pub fn insert_count(&self) -> usize {
        *self.inserts.lock().expect("lock")
    }
}

#[async_trait]
impl IssueStore for MemoryStore {
    async fn has_table(&self, name: &str) -> Result<bool, StoreError> {
        Ok(self.tables.lock().expect("lock").contains(name))
    }

    async fn create_table(&self, name: &str) -> Result<(), StoreError> {
        self.tables.lock().expect("lock").insert(name.to_owned());
        Ok(())
    }

    async fn get(&self, external_id: ExternalId) -> Result<Option<Issue>, StoreError> {
        Ok(self.issue(external_id))
    }

    async fn insert(&self, issue: Issue) -> Result<(), StoreError> {
        if self.fail_writes {
            return Err(StoreError::LockPoisoned);
        }
        *self.inserts.lock().expect("lock") += 1;
        self.issues
            .lock()
            .expect("lock")
            .insert(issue.external_id, issue);
        Ok(())
    }

    async fn update(
        &self,
        changes: &FieldChanges,
        external_id: ExternalId,
    ) -> Result<(), StoreError> {
        if self.fail_writes {
            return Err(StoreError::LockPoisoned);
        }
        if let Some(field) = changes
            .keys()
            .find(|field| field.is_derived() || **field == IssueField::ExternalId)
        {
            return Err(StoreError::ProtectedField(*field));
        }

        let mut issues = self.issues.lock().expect("lock");
        let issue = issues
            .get_mut(&external_id)
            .ok_or(StoreError::NotFound(external_id))?;
        issue.apply_changes(changes)?;
        self.updates.lock().expect("lock").push(changes.clone());
        Ok(())
    }
}

/// Returns canned rows per field and records every query.
#[derive(Default)]
pub struct ScriptedSearch {
    pub rows: HashMap<SearchField, Vec<SimilarIssue>>,
    pub queries: Mutex<Vec<(SearchField, String)>>,
    pub fail: bool,
}

impl ScriptedSearch {
    pub fn with_rows(rows: Vec<SimilarIssue>) -> Self {
        let mut by_field: HashMap<SearchField, Vec<SimilarIssue>> = HashMap::new();
        for row in rows {
            by_field.entry(row.matched_field).or_default().push(row);
        }
        Self {
            rows: by_field,
            ..Self::default()
        }
    }

    pub fn failing() -> Self {
        Self {
            fail: true,
            ..Self::default()
        }
    }

    pub fn queried_fields(&self) -> Vec<SearchField> {
        self.queries
            .lock()
            .expect("lock")
            .iter()
            .map(|(field, _)| *field)
            .collect()
    }
}

#[async_trait]
impl SimilaritySearch for ScriptedSearch {
    async fn search(
        &self,
        query_text: &str,
        field: SearchField,
        limit: u32,
        distance_threshold: f32,
    ) -> Result<Vec<SimilarIssue>, StoreError> {
        self.queries
            .lock()
            .expect("lock")
            .push((field, query_text.to_owned()));
        if self.fail {
            return Err(StoreError::LanceDb("vector index offline".to_owned()));
        }

        let mut rows = self
            .rows
            .get(&field)
            .cloned()
            .unwrap_or_default()
            .into_iter()
            .filter(|row| row.distance <= distance_threshold)
            .collect::<Vec<_>>();
        rows.sort_by(|left, right| left.distance.total_cmp(&right.distance));
        rows.truncate(limit as usize);
        Ok(rows)
    }
}

/// Emulates the upstream `since` filter over a fixed set of payloads.
pub struct UpstreamIssues {
    pub issues: Vec<Value>,
    pub per_page: usize,
    pub calls: Mutex<Vec<Option<DateTime<Utc>>>>,
}

impl UpstreamIssues {
    pub fn new(issues: Vec<Value>, per_page: usize) -> Self {
        Self {
            issues,
            per_page,
            calls: Mutex::new(Vec::new()),
        }
    }

    pub fn calls(&self) -> Vec<Option<DateTime<Utc>>> {
        self.calls.lock().expect("lock").clone()
    }
}

fn updated_at(payload: &Value) -> Option<DateTime<Utc>> {
    payload.get("updated_at")?.as_str()?.parse().ok()
}

#[async_trait]
impl IssueSource for UpstreamIssues {
    async fn get_page(
        &self,
        _state: IssueStateFilter,
        since: Option<DateTime<Utc>>,
    ) -> Result<Vec<Value>, GithubError> {
        self.calls.lock().expect("lock").push(since);

        let mut page = self
            .issues
            .iter()
            .filter(|payload| match (since, updated_at(payload)) {
                (None, _) => true,
                (Some(since), Some(updated)) => updated >= since,
                (Some(_), None) => false,
            })
            .cloned()
            .collect::<Vec<_>>();
        page.sort_by_key(updated_at);
        page.truncate(self.per_page);
        Ok(page)
    }
}

/// Replays queued responses, then empty pages.
#[derive(Default)]
pub struct ScriptedPages {
    pub responses: Mutex<VecDeque<Result<Vec<Value>, String>>>,
    pub calls: Mutex<Vec<Option<DateTime<Utc>>>>,
}

impl ScriptedPages {
    pub fn new(responses: Vec<Result<Vec<Value>, String>>) -> Self {
        Self {
            responses: Mutex::new(responses.into()),
            calls: Mutex::new(Vec::new()),
        }
    }
}

#[async_trait]
impl IssueSource for ScriptedPages {
    async fn get_page(
        &self,
        _state: IssueStateFilter,
        since: Option<DateTime<Utc>>,
    ) -> Result<Vec<Value>, GithubError> {
        self.calls.lock().expect("lock").push(since);
        match self.responses.lock().expect("lock").pop_front() {
            Some(Ok(page)) => Ok(page),
            Some(Err(message)) => Err(GithubError::UnexpectedResponse(message)),
            None => Ok(Vec::new()),
        }
    }
}

#[derive(Default)]
pub struct RecordingPublisher {
    pub comments: Mutex<Vec<(i64, String)>>,
    pub fail: bool,
}

impl RecordingPublisher {
    pub fn failing() -> Self {
        Self {
            fail: true,
            ..Self::default()
        }
    }

    pub fn comments(&self) -> Vec<(i64, String)> {
        self.comments.lock().expect("lock").clone()
    }
}

#[async_trait]
impl CommentPublisher for RecordingPublisher {
    async fn post_comment(&self, issue_number: i64, body: &str) -> Result<(), GithubError> {
        if self.fail {
            return Err(GithubError::UnexpectedResponse(
                "403 resource not accessible".to_owned(),
            ));
        }
        self.comments
            .lock()
            .expect("lock")
            .push((issue_number, body.to_owned()));
        Ok(())
    }
}

/// In-memory label set per issue that records every call.
#[derive(Default)]
pub struct RecordingLabeler {
    pub labels: Mutex<HashMap<i64, BTreeSet<String>>>,
    pub calls: Mutex<Vec<String>>,
    pub fail_adds: bool,
}

impl RecordingLabeler {
    pub fn with_label(issue_number: i64, label: &str) -> Self {
        let labeler = Self::default();
        labeler
            .labels
            .lock()
            .expect("lock")
            .entry(issue_number)
            .or_default()
            .insert(label.to_owned());
        labeler
    }

    pub fn labels(&self, issue_number: i64) -> BTreeSet<String> {
        self.labels
            .lock()
            .expect("lock")
            .get(&issue_number)
            .cloned()
            .unwrap_or_default()
    }

    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().expect("lock").clone()
    }
}

#[async_trait]
impl IssueLabeler for RecordingLabeler {
    async fn remove_label(&self, issue_number: i64, label: &str) -> Result<bool, GithubError> {
        self.calls
            .lock()
            .expect("lock")
            .push(format!("remove {issue_number} {label}"));
        Ok(self
            .labels
            .lock()
            .expect("lock")
            .get_mut(&issue_number)
            .is_some_and(|labels| labels.remove(label)))
    }

    async fn add_labels(&self, issue_number: i64, labels: &[&str]) -> Result<(), GithubError> {
        self.calls
            .lock()
            .expect("lock")
            .push(format!("add {issue_number} {}", labels.join(",")));
        if self.fail_adds {
            return Err(GithubError::UnexpectedResponse(
                "422 validation failed".to_owned(),
            ));
        }
        self.labels
            .lock()
            .expect("lock")
            .entry(issue_number)
            .or_default()
            .extend(labels.iter().map(|label| (*label).to_owned()));
        Ok(())
    }
}
