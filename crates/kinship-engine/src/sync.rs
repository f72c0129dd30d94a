use std::sync::Arc;

use chrono::{DateTime, Utc};
use kinship_core::advance_watermark;
use kinship_github::{
    GithubError, IssueSource, IssueStateFilter, parse_issue, payload_is_pull_request,
    payload_updated_at,
};
use kinship_store::{ISSUE_TABLE_NAME, IssueStore, StoreError};
use serde::Serialize;
use serde_json::Value;
use thiserror::Error;

use crate::EngineError;
use crate::differ::{UpsertOutcome, upsert_issue};

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct SyncReport {
    pub batches: usize,
    pub processed: usize,
    pub errors: usize,
    pub inserted: usize,
    pub updated: usize,
    pub unchanged: usize,
    pub skipped: usize,
    pub watermark: Option<DateTime<Utc>>,
}

impl SyncReport {
    fn record(&mut self, outcome: &UpsertOutcome) {
        self.processed += 1;
        match outcome {
            UpsertOutcome::Inserted => self.inserted += 1,
            UpsertOutcome::Updated(_) => self.updated += 1,
            UpsertOutcome::Unchanged => self.unchanged += 1,
        }
    }
}

/// Fatal sync failures; `report` holds the progress made before the failure.
#[derive(Debug, Error)]
pub enum SyncError {
    #[error("failed to fetch batch {batch} (since {since:?}): {source}")]
    Fetch {
        batch: usize,
        since: Option<DateTime<Utc>>,
        #[source]
        source: GithubError,
        report: Box<SyncReport>,
    },
    #[error("batch {batch} did not move the watermark forward (since {since:?})")]
    StalledWatermark {
        batch: usize,
        since: Option<DateTime<Utc>>,
        report: Box<SyncReport>,
    },
}

impl SyncError {
    pub fn report(&self) -> &SyncReport {
        match self {
            Self::Fetch { report, .. } | Self::StalledWatermark { report, .. } => report,
        }
    }
}

/// Creates the issue table unless it exists; returns whether it was created.
pub async fn init_tables(store: &dyn IssueStore) -> Result<bool, StoreError> {
    if store.has_table(ISSUE_TABLE_NAME).await? {
        tracing::info!(table = ISSUE_TABLE_NAME, "table already exists");
        return Ok(false);
    }

    store.create_table(ISSUE_TABLE_NAME).await?;
    tracing::info!(table = ISSUE_TABLE_NAME, "table created");
    Ok(true)
}

/// Watermark-driven incremental ingestion of one repository.
pub struct SyncOrchestrator {
    source: Arc<dyn IssueSource>,
    store: Arc<dyn IssueStore>,
    repository: String,
    state: IssueStateFilter,
}

impl SyncOrchestrator {
    pub fn new(
        source: Arc<dyn IssueSource>,
        store: Arc<dyn IssueStore>,
        repository: impl Into<String>,
    ) -> Self {
        Self {
            source,
            store,
            repository: repository.into(),
            state: IssueStateFilter::All,
        }
    }

    pub fn with_state(mut self, state: IssueStateFilter) -> Self {
        self.state = state;
        self
    }

    pub async fn sync_all(&self) -> Result<SyncReport, SyncError> {
        let mut report = SyncReport::default();
        let mut since: Option<DateTime<Utc>> = None;

        tracing::info!(
            repository = %self.repository,
            state = self.state.as_str(),
            "starting issue sync"
        );

        loop {
            let batch_number = report.batches + 1;
            let batch = match self.source.get_page(self.state, since).await {
                Ok(batch) => batch,
                Err(source) => {
                    tracing::error!(
                        batch = batch_number,
                        since = ?since,
                        error = %source,
                        "failed to fetch issue batch"
                    );
                    return Err(SyncError::Fetch {
                        batch: batch_number,
                        since,
                        source,
                        report: Box::new(report),
                    });
                }
            };

            if batch.is_empty() {
                tracing::info!(batch = batch_number, "no more issues to fetch");
                break;
            }

            report.batches = batch_number;
            tracing::info!(
                batch = batch_number,
                size = batch.len(),
                since = ?since,
                "processing issue batch"
            );

            let mut latest: Option<DateTime<Utc>> = None;
            for payload in &batch {
                if let Some(updated_at) = payload_updated_at(payload) {
                    latest = Some(latest.map_or(updated_at, |current| current.max(updated_at)));
                }

                if payload_is_pull_request(payload) {
                    report.skipped += 1;
                    continue;
                }

                match self.process(payload).await {
                    Ok(outcome) => report.record(&outcome),
                    Err(err) => {
                        report.errors += 1;
                        tracing::warn!(
                            batch = batch_number,
                            number = payload.get("number").and_then(serde_json::Value::as_i64),
                            error = %err,
                            "failed to process issue, continuing"
                        );
                    }
                }
            }

            let next = latest.map(advance_watermark);
            match (next, since) {
                (Some(next), Some(previous)) if next <= previous => {
                    return Err(self.stalled(batch_number, since, report));
                }
                (None, _) => return Err(self.stalled(batch_number, since, report)),
                _ => {}
            }
            since = next;
            report.watermark = since;

            tracing::info!(
                batch = batch_number,
                processed = report.processed,
                errors = report.errors,
                next_since = ?since,
                "batch completed"
            );
        }

        tracing::info!(
            processed = report.processed,
            errors = report.errors,
            inserted = report.inserted,
            updated = report.updated,
            unchanged = report.unchanged,
            skipped = report.skipped,
            "issue sync completed"
        );
        Ok(report)
    }

    async fn process(&self, payload: &Value) -> Result<UpsertOutcome, EngineError> {
        let issue = parse_issue(payload, &self.repository)?;
        Ok(upsert_issue(self.store.as_ref(), issue).await?)
    }

    fn stalled(
        &self,
        batch: usize,
        since: Option<DateTime<Utc>>,
        report: SyncReport,
    ) -> SyncError {
        tracing::error!(
            batch,
            since = ?since,
            "batch carries no timestamp past the current watermark"
        );
        SyncError::StalledWatermark {
            batch,
            since,
            report: Box::new(report),
        }
    }
}
