use std::io::{Read, Write};
use std::path::Path;
use std::sync::Arc;

use anyhow::{Context, Result, bail};
use kinship_config::{
    ConfigError, KinshipConfig, config_path, ensure_workspace_config, load_workspace_config, require_repository,
    validate_config,
};
use kinship_core::{SimilarIssue, truncate_for_display};
use kinship_engine::{
    EventAck, IssueEventHandler, SyncOrchestrator, find_similar, format_comment, init_tables,
    trigger_reply,
};
use kinship_github::{GithubClient, GithubError};
use kinship_store::{IndexedIssueStore, IssueStore, SimilaritySearch};
use serde::Serialize;
use serde_json::Value;

use crate::cli::{HandleEventArgs, SimilarArgs, SyncArgs, TriggerReplyArgs};

const TITLE_COLUMN_CHARS: usize = 60;

/// Loads the workspace config and surfaces validation warnings in the log.
pub fn load_config(workspace: &Path) -> Result<KinshipConfig> {
    let config = load_workspace_config(workspace).with_context(|| {
        format!(
            "failed to load workspace config at {}",
            config_path(workspace).display()
        )
    })?;
    for warning in validate_config(&config) {
        tracing::warn!(code = warning.code, "{}", warning.message);
    }
    Ok(config)
}

pub async fn open_store(workspace: &Path) -> Result<Arc<IndexedIssueStore>> {
    let store = IndexedIssueStore::open(workspace)
        .await
        .with_context(|| format!("failed to open issue store under {}", workspace.display()))?;
    init_tables(&store)
        .await
        .context("failed to initialise issue table")?;
    Ok(Arc::new(store))
}

pub async fn run_init(workspace: &Path, out: &mut dyn Write) -> Result<()> {
    let config = ensure_workspace_config(workspace).with_context(|| {
        format!(
            "failed to load or create workspace config at {}",
            config_path(workspace).display()
        )
    })?;
    for warning in validate_config(&config) {
        tracing::warn!(code = warning.code, "{}", warning.message);
    }

    let store = IndexedIssueStore::open(workspace)
        .await
        .with_context(|| format!("failed to open issue store under {}", workspace.display()))?;
    let created = init_tables(&store)
        .await
        .context("failed to initialise issue table")?;

    writeln!(out, "config: {}", config_path(workspace).display())?;
    writeln!(
        out,
        "issue table: {}",
        if created { "created" } else { "already present" }
    )?;
    if config.github.repository.is_none() {
        writeln!(
            out,
            "set github.repository in the config before running sync or serve"
        )?;
    }
    Ok(())
}

pub async fn run_sync(workspace: &Path, args: &SyncArgs, out: &mut dyn Write) -> Result<()> {
    let config = load_config(workspace)?;
    let repository = require_repository(&config)?.to_owned();
    let client = GithubClient::from_config(&config).context("failed to build GitHub client")?;
    let store = open_store(workspace).await?;

    let orchestrator = SyncOrchestrator::new(Arc::new(client), store, repository)
        .with_state(args.state);
    match orchestrator.sync_all().await {
        Ok(report) => {
            writeln!(out, "{}", serde_json::to_string_pretty(&report)?)?;
            Ok(())
        }
        Err(err) => {
            writeln!(out, "{}", serde_json::to_string_pretty(err.report())?)?;
            Err(err).context("issue sync aborted")
        }
    }
}

#[derive(Debug, Serialize)]
struct CandidateRow<'a> {
    external_id: i64,
    number: i64,
    state: &'static str,
    matched_field: &'static str,
    distance: f32,
    title: &'a str,
    html_url: &'a str,
}

impl<'a> From<&'a SimilarIssue> for CandidateRow<'a> {
    fn from(candidate: &'a SimilarIssue) -> Self {
        Self {
            external_id: candidate.issue.external_id,
            number: candidate.issue.number,
            state: candidate.issue.state.as_str(),
            matched_field: candidate.matched_field.label(),
            distance: candidate.distance,
            title: &candidate.issue.title,
            html_url: &candidate.issue.html_url,
        }
    }
}

pub async fn run_similar(workspace: &Path, args: &SimilarArgs, out: &mut dyn Write) -> Result<()> {
    let config = load_config(workspace)?;
    let store = open_store(workspace).await?;

    let Some(subject) = store
        .get(args.issue)
        .await
        .with_context(|| format!("failed to read issue {}", args.issue))?
    else {
        bail!("issue {} is not stored; run sync first", args.issue);
    };

    let limit = args.limit.unwrap_or(config.triage.limit_per_field).max(1);
    let search: &dyn SimilaritySearch = store.as_ref();
    let candidates =
        find_similar(search, &subject, limit, config.triage.distance_threshold).await;
    let rows = candidates.iter().map(CandidateRow::from).collect::<Vec<_>>();

    if args.json {
        let payload = serde_json::json!({
            "issue": subject.number,
            "candidates": rows,
            "comment": format_comment(&candidates),
        });
        writeln!(out, "{}", serde_json::to_string_pretty(&payload)?)?;
        return Ok(());
    }

    writeln!(
        out,
        "similar to #{} {}",
        subject.number,
        truncate_for_display(&subject.title, TITLE_COLUMN_CHARS)
    )?;
    if rows.is_empty() {
        writeln!(out, "(no candidates within distance {})", config.triage.distance_threshold)?;
    }
    for row in &rows {
        writeln!(
            out,
            "#{:<6} {:.3}  {:<5} {:<6} {}",
            row.number,
            row.distance,
            row.matched_field,
            row.state,
            truncate_for_display(row.title, TITLE_COLUMN_CHARS)
        )?;
    }
    writeln!(out)?;
    writeln!(out, "{}", format_comment(&candidates))?;
    Ok(())
}

/// Wires the webhook handler to the workspace store and, when a token is available, GitHub.
pub fn build_event_handler(
    config: &KinshipConfig,
    store: Arc<IndexedIssueStore>,
    publisher: Option<GithubClient>,
) -> IssueEventHandler {
    let issues: Arc<dyn IssueStore> = store.clone();
    let search: Arc<dyn SimilaritySearch> = store;
    let mut handler = IssueEventHandler::new(issues, search, &config.triage);
    if let Some(repository) = config.github.repository.as_deref() {
        handler = handler.with_default_repository(repository);
    }
    if let Some(client) = publisher {
        handler = handler.with_publisher(Arc::new(client));
    }
    handler
}

pub async fn run_handle_event(
    workspace: &Path,
    args: &HandleEventArgs,
    out: &mut dyn Write,
) -> Result<EventAck> {
    let payload = read_payload(&args.payload)?;
    let config = load_config(workspace)?;
    let store = open_store(workspace).await?;

    let publisher = optional_github_client(&config)?;
    let handler = build_event_handler(&config, store, publisher);

    let ack = handler.handle(&args.action, &payload).await;
    writeln!(out, "{}", serde_json::to_string_pretty(&ack)?)?;
    Ok(ack)
}

/// `None` when no repository or token is configured; broken App credentials stay fatal.
pub fn optional_github_client(config: &KinshipConfig) -> Result<Option<GithubClient>> {
    match GithubClient::from_config(config) {
        Ok(client) => Ok(Some(client)),
        Err(
            err @ (GithubError::MissingToken(_)
            | GithubError::Config(ConfigError::MissingRepository)),
        ) => {
            tracing::warn!(error = %err, "GitHub access disabled");
            Ok(None)
        }
        Err(err) => Err(err).context("invalid GitHub configuration"),
    }
}

pub async fn run_trigger_reply(
    workspace: &Path,
    args: &TriggerReplyArgs,
    out: &mut dyn Write,
) -> Result<()> {
    let config = load_config(workspace)?;
    let client = GithubClient::from_config(&config).context("failed to build GitHub client")?;

    let trigger = trigger_reply(&client, args.issue, &config.triage.reply_label)
        .await
        .with_context(|| format!("failed to trigger reply for issue #{}", args.issue))?;
    writeln!(out, "{}", serde_json::to_string_pretty(&trigger)?)?;
    Ok(())
}

fn read_payload(path: &Path) -> Result<Value> {
    let raw = if path == Path::new("-") {
        let mut raw = String::new();
        std::io::stdin()
            .read_to_string(&mut raw)
            .context("failed to read delivery from stdin")?;
        raw
    } else {
        std::fs::read_to_string(path)
            .with_context(|| format!("failed to read delivery {}", path.display()))?
    };

    serde_json::from_str(&raw).context("delivery is not valid JSON")
}
