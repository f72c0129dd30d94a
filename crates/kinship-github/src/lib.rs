use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use kinship_config::{KinshipConfig, github_app_settings, require_repository};
use kinship_core::{Issue, Secret};
use serde::Deserialize;
use serde_json::Value;
use thiserror::Error;

mod auth;
mod payload;

pub use auth::{AppAuth, GithubAuth};
pub use payload::{IssuesEvent, RawIssue, RawLabel, RawMilestone, RawRepository, RawUser};

const GITHUB_ACCEPT: &str = "application/vnd.github+json";
const GITHUB_API_VERSION: &str = "2022-11-28";
const USER_AGENT: &str = concat!("kinship/", env!("CARGO_PKG_VERSION"));

#[derive(Debug, Error)]
pub enum GithubError {
    #[error("config error: {0}")]
    Config(#[from] kinship_config::ConfigError),
    #[error("github token missing: set environment variable {0}")]
    MissingToken(String),
    #[error("request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("invalid payload: {0}")]
    Json(#[from] serde_json::Error),
    #[error("unexpected response: {0}")]
    UnexpectedResponse(String),
    #[error("invalid github app private key: {0}")]
    PrivateKey(String),
    #[error("failed to sign github app jwt: {0}")]
    Jwt(#[from] jsonwebtoken::errors::Error),
    #[error("invalid request url: {0}")]
    InvalidUrl(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum IssueStateFilter {
    Open,
    Closed,
    #[default]
    All,
}

impl IssueStateFilter {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Open => "open",
            Self::Closed => "closed",
            Self::All => "all",
        }
    }
}

impl std::str::FromStr for IssueStateFilter {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim() {
            "open" => Ok(Self::Open),
            "closed" => Ok(Self::Closed),
            "all" => Ok(Self::All),
            other => Err(format!(
                "invalid issue state '{other}', expected one of: open, closed, all"
            )),
        }
    }
}

/// Paginated upstream of raw issue payloads ordered by update time ascending.
#[async_trait]
pub trait IssueSource: Send + Sync {
    async fn get_page(
        &self,
        state: IssueStateFilter,
        since: Option<DateTime<Utc>>,
    ) -> Result<Vec<Value>, GithubError>;
}

#[async_trait]
pub trait CommentPublisher: Send + Sync {
    async fn post_comment(&self, issue_number: i64, body: &str) -> Result<(), GithubError>;
}

#[async_trait]
pub trait IssueLabeler: Send + Sync {
    /// Returns `false` when the issue did not carry the label.
    async fn remove_label(&self, issue_number: i64, label: &str) -> Result<bool, GithubError>;
    async fn add_labels(&self, issue_number: i64, labels: &[&str]) -> Result<(), GithubError>;
}

/// `updated_at` of a raw payload, when it carries a parseable one.
pub fn payload_updated_at(payload: &Value) -> Option<DateTime<Utc>> {
    payload
        .get("updated_at")?
        .as_str()
        .and_then(|raw| DateTime::parse_from_rfc3339(raw).ok())
        .map(|value| value.with_timezone(&Utc))
}

/// GitHub also lists pull requests on the issues endpoint.
pub fn payload_is_pull_request(payload: &Value) -> bool {
    payload
        .get("pull_request")
        .is_some_and(|value| !value.is_null())
}

#[derive(Debug, Clone)]
pub struct GithubClient {
    client: reqwest::Client,
    api_base: String,
    repository: String,
    auth: Arc<GithubAuth>,
    per_page: u32,
}

impl GithubClient {
    pub fn new(api_base: &str, repository: &str, auth: GithubAuth, per_page: u32) -> Self {
        Self {
            client: reqwest::Client::new(),
            api_base: api_base.trim_end_matches('/').to_owned(),
            repository: repository.to_owned(),
            auth: Arc::new(auth),
            per_page: per_page.clamp(1, 100),
        }
    }

    /// GitHub App credentials win when configured; otherwise the token in `token_env`.
    pub fn from_config(config: &KinshipConfig) -> Result<Self, GithubError> {
        let repository = require_repository(config)?;
        let auth = match github_app_settings(config)? {
            Some(settings) => {
                tracing::debug!(
                    app_id = settings.app_id,
                    installation_id = settings.installation_id,
                    "using github app authentication"
                );
                GithubAuth::App(AppAuth::from_settings(settings)?)
            }
            None => Secret::from_env(&config.github.token_env)
                .map(GithubAuth::Token)
                .ok_or_else(|| GithubError::MissingToken(config.github.token_env.clone()))?,
        };

        Ok(Self::new(
            &config.github.api_base,
            repository,
            auth,
            config.github.per_page,
        ))
    }

    pub fn repository(&self) -> &str {
        &self.repository
    }

    fn issues_url(&self) -> String {
        format!("{}/repos/{}/issues", self.api_base, self.repository)
    }

    fn comments_url(&self, issue_number: i64) -> String {
        format!(
            "{}/repos/{}/issues/{issue_number}/comments",
            self.api_base, self.repository
        )
    }

    fn labels_url(&self, issue_number: i64) -> String {
        format!(
            "{}/repos/{}/issues/{issue_number}/labels",
            self.api_base, self.repository
        )
    }

    fn label_url(&self, issue_number: i64, label: &str) -> Result<reqwest::Url, GithubError> {
        let mut url = reqwest::Url::parse(&self.labels_url(issue_number))
            .map_err(|err| GithubError::InvalidUrl(err.to_string()))?;
        url.path_segments_mut()
            .map_err(|()| GithubError::InvalidUrl(self.api_base.clone()))?
            .push(label);
        Ok(url)
    }

    fn issues_query(
        &self,
        state: IssueStateFilter,
        since: Option<DateTime<Utc>>,
    ) -> Vec<(&'static str, String)> {
        let mut query = vec![
            ("state", state.as_str().to_owned()),
            ("sort", "updated".to_owned()),
            ("direction", "asc".to_owned()),
            ("per_page", self.per_page.to_string()),
        ];
        if let Some(since) = since {
            query.push(("since", since.to_rfc3339_opts(SecondsFormat::Secs, true)));
        }
        query
    }

    async fn request(
        &self,
        method: reqwest::Method,
        url: impl reqwest::IntoUrl,
    ) -> Result<reqwest::RequestBuilder, GithubError> {
        let token = self.auth.bearer(&self.client, &self.api_base).await?;
        Ok(self
            .client
            .request(method, url)
            .bearer_auth(token.expose())
            .header(reqwest::header::ACCEPT, GITHUB_ACCEPT)
            .header("X-GitHub-Api-Version", GITHUB_API_VERSION)
            .header(reqwest::header::USER_AGENT, USER_AGENT))
    }
}

#[async_trait]
impl IssueSource for GithubClient {
    async fn get_page(
        &self,
        state: IssueStateFilter,
        since: Option<DateTime<Utc>>,
    ) -> Result<Vec<Value>, GithubError> {
        tracing::debug!(
            repository = %self.repository,
            state = state.as_str(),
            since = ?since,
            "fetching issue page"
        );

        let response: Value = self
            .request(reqwest::Method::GET, self.issues_url())
            .await?
            .query(&self.issues_query(state, since))
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;

        match response {
            Value::Array(items) => Ok(items),
            other => Err(GithubError::UnexpectedResponse(format!(
                "expected an array of issues, got {}",
                json_kind(&other)
            ))),
        }
    }
}

#[async_trait]
impl CommentPublisher for GithubClient {
    async fn post_comment(&self, issue_number: i64, body: &str) -> Result<(), GithubError> {
        self.request(reqwest::Method::POST, self.comments_url(issue_number))
            .await?
            .json(&CommentRequest { body })
            .send()
            .await?
            .error_for_status()?;

        tracing::info!(
            repository = %self.repository,
            issue_number,
            "posted comment"
        );
        Ok(())
    }
}

#[async_trait]
impl IssueLabeler for GithubClient {
    async fn remove_label(&self, issue_number: i64, label: &str) -> Result<bool, GithubError> {
        let response = self
            .request(reqwest::Method::DELETE, self.label_url(issue_number, label)?)
            .await?
            .send()
            .await?;
        if response.status() == reqwest::StatusCode::NOT_FOUND {
            tracing::debug!(issue_number, label, "label was not on the issue");
            return Ok(false);
        }
        response.error_for_status()?;

        tracing::info!(repository = %self.repository, issue_number, label, "removed label");
        Ok(true)
    }

    async fn add_labels(&self, issue_number: i64, labels: &[&str]) -> Result<(), GithubError> {
        self.request(reqwest::Method::POST, self.labels_url(issue_number))
            .await?
            .json(&LabelsRequest { labels })
            .send()
            .await?
            .error_for_status()?;

        tracing::info!(repository = %self.repository, issue_number, ?labels, "added labels");
        Ok(())
    }
}

#[derive(Debug, serde::Serialize)]
struct CommentRequest<'a> {
    body: &'a str,
}

#[derive(Debug, serde::Serialize)]
struct LabelsRequest<'a> {
    labels: &'a [&'a str],
}

fn json_kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "bool",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

/// Materialises a raw REST or webhook issue payload.
pub fn parse_issue(payload: &Value, repository: &str) -> Result<Issue, GithubError> {
    let raw = RawIssue::deserialize(payload)?;
    Ok(raw.into_issue(repository))
}

/// Parses an `issues` webhook delivery body.
pub fn parse_issues_event(payload: &Value) -> Result<IssuesEvent, GithubError> {
    Ok(IssuesEvent::deserialize(payload)?)
}
