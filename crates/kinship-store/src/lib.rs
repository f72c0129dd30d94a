use std::collections::BTreeSet;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use kinship_config::kinship_dir;
use kinship_core::{ExternalId, FieldChanges, FieldValue, Issue, IssueField, SearchField, SimilarIssue};
use rusqlite::types::{Type, Value};
use rusqlite::{Connection, OptionalExtension, Row, params, params_from_iter};
use thiserror::Error;

mod indexed;
mod vector;

pub use indexed::IndexedIssueStore;
pub use vector::{
    LanceVectorStore, SqliteVectorStore, VectorRecord, VectorSearchResult, VectorStore,
    cosine_distance, open_vector_store,
};

pub const ISSUE_TABLE_NAME: &str = "issues";
const SQLITE_FILE_NAME: &str = "meta.sqlite";

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("lancedb error: {0}")]
    LanceDb(String),
    #[error("config error: {0}")]
    Config(#[from] kinship_config::ConfigError),
    #[error("embedding error: {0}")]
    Embedding(#[from] kinship_infer::InferError),
    #[error("invalid field change: {0}")]
    Field(#[from] kinship_core::CoreError),
    #[error("issue {0} not found")]
    NotFound(ExternalId),
    #[error("field {0} is protected and cannot be updated")]
    ProtectedField(IssueField),
    #[error("field {field} cannot hold a {found} value")]
    InvalidFieldValue {
        field: IssueField,
        found: &'static str,
    },
    #[error("unknown table {0}")]
    UnknownTable(String),
    #[error("store lock poisoned")]
    LockPoisoned,
}

/// Persistent issue table keyed by `external_id`.
#[async_trait]
pub trait IssueStore: Send + Sync {
    async fn has_table(&self, name: &str) -> Result<bool, StoreError>;
    async fn create_table(&self, name: &str) -> Result<(), StoreError>;
    async fn get(&self, external_id: ExternalId) -> Result<Option<Issue>, StoreError>;
    async fn insert(&self, issue: Issue) -> Result<(), StoreError>;
    async fn update(
        &self,
        changes: &FieldChanges,
        external_id: ExternalId,
    ) -> Result<(), StoreError>;
}

/// Nearest-neighbour lookup over one vector field, ordered by ascending distance.
#[async_trait]
pub trait SimilaritySearch: Send + Sync {
    async fn search(
        &self,
        query_text: &str,
        field: SearchField,
        limit: u32,
        distance_threshold: f32,
    ) -> Result<Vec<SimilarIssue>, StoreError>;
}

pub struct SqliteStore {
    conn: Mutex<Connection>,
    kinship_dir: PathBuf,
}

impl SqliteStore {
    pub fn open(workspace_root: impl AsRef<Path>) -> Result<Self, StoreError> {
        let kinship_dir = kinship_dir(workspace_root);
        let sqlite_path = kinship_dir.join(SQLITE_FILE_NAME);

        fs::create_dir_all(&kinship_dir)?;

        let conn = Connection::open(sqlite_path)?;
        conn.pragma_update(None, "journal_mode", "WAL")?;
        conn.busy_timeout(Duration::from_secs(5))?;
        run_migrations(&conn)?;

        Ok(Self {
            conn: Mutex::new(conn),
            kinship_dir,
        })
    }

    pub fn kinship_dir(&self) -> &Path {
        &self.kinship_dir
    }

    pub fn sqlite_path(&self) -> PathBuf {
        self.kinship_dir.join(SQLITE_FILE_NAME)
    }

    pub(crate) fn conn(&self) -> Result<MutexGuard<'_, Connection>, StoreError> {
        self.conn.lock().map_err(|_| StoreError::LockPoisoned)
    }

    pub fn has_table(&self, name: &str) -> Result<bool, StoreError> {
        let exists = self
            .conn()?
            .query_row(
                "SELECT 1 FROM sqlite_master WHERE type='table' AND name=?1 LIMIT 1",
                params![name],
                |row| row.get::<_, i64>(0),
            )
            .optional()?
            .is_some();
        Ok(exists)
    }

    pub fn create_table(&self, name: &str) -> Result<(), StoreError> {
        if name != ISSUE_TABLE_NAME {
            return Err(StoreError::UnknownTable(name.to_owned()));
        }

        self.conn()?.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS issues (
                external_id INTEGER PRIMARY KEY,
                number INTEGER NOT NULL,
                repository TEXT NOT NULL,
                title TEXT NOT NULL,
                body TEXT,
                state TEXT NOT NULL,
                locked INTEGER NOT NULL DEFAULT 0,
                author_login TEXT NOT NULL,
                labels TEXT NOT NULL DEFAULT '[]',
                assignees TEXT NOT NULL DEFAULT '[]',
                created_at INTEGER NOT NULL,
                updated_at INTEGER NOT NULL,
                closed_at INTEGER,
                html_url TEXT NOT NULL,
                comments_count INTEGER NOT NULL DEFAULT 0,
                milestone_title TEXT,
                author_association TEXT,
                state_reason TEXT
            );

            CREATE INDEX IF NOT EXISTS idx_issues_repository_number
                ON issues(repository, number);
            CREATE INDEX IF NOT EXISTS idx_issues_updated_at ON issues(updated_at);
            "#,
        )?;

        Ok(())
    }

    pub fn get_issue(&self, external_id: ExternalId) -> Result<Option<Issue>, StoreError> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(&format!(
            "SELECT {ISSUE_COLUMNS} FROM issues WHERE external_id = ?1"
        ))?;

        let issue = stmt
            .query_row(params![external_id], issue_from_row)
            .optional()?;
        Ok(issue)
    }

    pub fn insert_issue(&self, issue: &Issue) -> Result<(), StoreError> {
        self.conn()?.execute(
            r#"
            INSERT INTO issues (
                external_id, number, repository, title, body, state, locked, author_login,
                labels, assignees, created_at, updated_at, closed_at, html_url, comments_count,
                milestone_title, author_association, state_reason
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16, ?17, ?18)
            "#,
            params![
                issue.external_id,
                issue.number,
                issue.repository,
                issue.title,
                issue.body,
                issue.state.as_str(),
                issue.locked,
                issue.author_login,
                serde_json::to_string(&issue.labels)?,
                serde_json::to_string(&issue.assignees)?,
                issue.created_at.timestamp_millis(),
                issue.updated_at.timestamp_millis(),
                issue.closed_at.map(|value| value.timestamp_millis()),
                issue.html_url,
                issue.comments_count,
                issue.milestone_title,
                issue.author_association,
                issue.state_reason,
            ],
        )?;

        Ok(())
    }

    /// Writes only the listed columns of the row matching `external_id`.
    pub fn update_issue(
        &self,
        changes: &FieldChanges,
        external_id: ExternalId,
    ) -> Result<(), StoreError> {
        if changes.is_empty() {
            return Ok(());
        }

        let mut assignments = Vec::with_capacity(changes.len());
        let mut values = Vec::with_capacity(changes.len() + 1);
        for (index, (field, value)) in changes.iter().enumerate() {
            assignments.push(format!("{} = ?{}", field.as_str(), index + 1));
            values.push(column_value(*field, value)?);
        }
        values.push(Value::Integer(external_id));

        let sql = format!(
            "UPDATE issues SET {} WHERE external_id = ?{}",
            assignments.join(", "),
            values.len()
        );
        let updated = self.conn()?.execute(&sql, params_from_iter(values.iter()))?;
        if updated == 0 {
            return Err(StoreError::NotFound(external_id));
        }

        Ok(())
    }

    /// Returns whether a row was removed.
    pub fn delete_issue(&self, external_id: ExternalId) -> Result<bool, StoreError> {
        let deleted = self
            .conn()?
            .execute("DELETE FROM issues WHERE external_id = ?1", params![external_id])?;
        Ok(deleted > 0)
    }

    pub fn count_issues(&self) -> Result<i64, StoreError> {
        let count = self
            .conn()?
            .query_row("SELECT COUNT(*) FROM issues", [], |row| row.get(0))?;
        Ok(count)
    }
}

const ISSUE_COLUMNS: &str = "external_id, number, repository, title, body, state, locked, \
     author_login, labels, assignees, created_at, updated_at, closed_at, html_url, \
     comments_count, milestone_title, author_association, state_reason";

fn issue_from_row(row: &Row<'_>) -> rusqlite::Result<Issue> {
    let state: String = row.get(5)?;
    let state = state
        .parse()
        .map_err(|err: String| rusqlite::Error::FromSqlConversionFailure(5, Type::Text, err.into()))?;

    Ok(Issue {
        external_id: row.get(0)?,
        number: row.get(1)?,
        repository: row.get(2)?,
        title: row.get(3)?,
        body: row.get(4)?,
        state,
        locked: row.get(6)?,
        author_login: row.get(7)?,
        labels: string_set_at(row, 8)?,
        assignees: string_set_at(row, 9)?,
        created_at: timestamp_at(row, 10)?,
        updated_at: timestamp_at(row, 11)?,
        closed_at: row
            .get::<_, Option<i64>>(12)?
            .map(|millis| millis_to_datetime(12, millis))
            .transpose()?,
        html_url: row.get(13)?,
        comments_count: row.get(14)?,
        milestone_title: row.get(15)?,
        author_association: row.get(16)?,
        state_reason: row.get(17)?,
        title_vec: None,
        body_vec: None,
    })
}

fn string_set_at(row: &Row<'_>, index: usize) -> rusqlite::Result<BTreeSet<String>> {
    let raw: String = row.get(index)?;
    serde_json::from_str(&raw)
        .map_err(|err| rusqlite::Error::FromSqlConversionFailure(index, Type::Text, Box::new(err)))
}

fn timestamp_at(row: &Row<'_>, index: usize) -> rusqlite::Result<DateTime<Utc>> {
    millis_to_datetime(index, row.get(index)?)
}

fn millis_to_datetime(index: usize, millis: i64) -> rusqlite::Result<DateTime<Utc>> {
    DateTime::from_timestamp_millis(millis)
        .ok_or(rusqlite::Error::IntegralValueOutOfRange(index, millis))
}

fn column_value(field: IssueField, value: &FieldValue) -> Result<Value, StoreError> {
    if field == IssueField::ExternalId || field.is_derived() {
        return Err(StoreError::ProtectedField(field));
    }

    let converted = match (field, value) {
        (IssueField::Number | IssueField::CommentsCount, FieldValue::Integer(value)) => {
            Value::Integer(*value)
        }
        (
            IssueField::Repository
            | IssueField::Title
            | IssueField::AuthorLogin
            | IssueField::HtmlUrl
            | IssueField::Body
            | IssueField::MilestoneTitle
            | IssueField::AuthorAssociation
            | IssueField::StateReason,
            FieldValue::Text(value),
        ) => Value::Text(value.clone()),
        (
            IssueField::Body
            | IssueField::MilestoneTitle
            | IssueField::AuthorAssociation
            | IssueField::StateReason
            | IssueField::ClosedAt,
            FieldValue::Absent,
        ) => Value::Null,
        (IssueField::State, FieldValue::State(state)) => Value::Text(state.as_str().to_owned()),
        (IssueField::Locked, FieldValue::Bool(value)) => Value::Integer(i64::from(*value)),
        (IssueField::Labels | IssueField::Assignees, FieldValue::Set(values)) => {
            Value::Text(serde_json::to_string(values)?)
        }
        (
            IssueField::CreatedAt | IssueField::UpdatedAt | IssueField::ClosedAt,
            FieldValue::Timestamp(value),
        ) => Value::Integer(value.timestamp_millis()),
        (field, value) => {
            return Err(StoreError::InvalidFieldValue {
                field,
                found: value.kind(),
            });
        }
    };

    Ok(converted)
}

fn run_migrations(conn: &Connection) -> Result<(), StoreError> {
    conn.execute_batch(
        r#"
        CREATE TABLE IF NOT EXISTS issue_embeddings (
            external_id INTEGER NOT NULL,
            field TEXT NOT NULL,
            provider TEXT NOT NULL,
            model TEXT NOT NULL,
            embedding_json TEXT NOT NULL,
            updated_at INTEGER NOT NULL,
            PRIMARY KEY (external_id, field)
        );
        "#,
    )?;

    Ok(())
}
