use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;

use anyhow::{Context, Result};
use kinship_github::GithubClient;
use kinship_github::IssueLabeler;
use kinshipd::cli::{Cli, Commands, ServeArgs, parse_cli};
use kinshipd::commands::{
    build_event_handler, load_config, open_store, run_handle_event, run_init, run_similar,
    run_sync, run_trigger_reply,
};
use kinshipd::logging::init_logging;
use kinshipd::server;

#[tokio::main]
async fn main() -> Result<ExitCode> {
    dotenvy::dotenv().ok();
    let cli = parse_cli();
    init_logging(cli.log_format, cli.log_level.as_deref())?;
    run(cli).await
}

async fn run(cli: Cli) -> Result<ExitCode> {
    let workspace = resolve_workspace(&cli.workspace)?;
    let mut out = std::io::stdout();

    match &cli.command {
        Commands::Init => run_init(&workspace, &mut out).await?,
        Commands::Sync(args) => run_sync(&workspace, args, &mut out).await?,
        Commands::Similar(args) => run_similar(&workspace, args, &mut out).await?,
        Commands::HandleEvent(args) => {
            let ack = run_handle_event(&workspace, args, &mut out).await?;
            if ack.is_error() {
                return Ok(ExitCode::FAILURE);
            }
        }
        Commands::TriggerReply(args) => run_trigger_reply(&workspace, args, &mut out).await?,
        Commands::Serve(args) => run_serve(&workspace, args).await?,
    }

    Ok(ExitCode::SUCCESS)
}

fn resolve_workspace(workspace: &Path) -> Result<PathBuf> {
    std::fs::create_dir_all(workspace)
        .with_context(|| format!("failed to create workspace {}", workspace.display()))?;
    workspace
        .canonicalize()
        .with_context(|| format!("failed to resolve workspace path {}", workspace.display()))
}

async fn run_serve(workspace: &Path, args: &ServeArgs) -> Result<()> {
    let config = load_config(workspace)?;
    let client = GithubClient::from_config(&config).context("failed to build GitHub client")?;
    let store = open_store(workspace).await?;
    let labeler: Arc<dyn IssueLabeler> = Arc::new(client.clone());
    let handler = build_event_handler(&config, store, Some(client));

    let bind = args.bind.as_deref().unwrap_or(&config.webhook.bind);
    let listener = tokio::net::TcpListener::bind(bind)
        .await
        .with_context(|| format!("failed to bind {bind}"))?;
    tracing::info!(
        path = %config.webhook.path,
        repository = config.github.repository.as_deref().unwrap_or_default(),
        "webhook endpoint ready"
    );

    server::serve(
        listener,
        server::router(Arc::new(handler), Some(labeler), &config),
    )
    .await
}
