use std::ffi::OsStr;
use std::path::PathBuf;

use clap::{Args, Parser, Subcommand};
use kinship_core::ExternalId;
use kinship_github::IssueStateFilter;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LogFormat {
    #[default]
    Human,
    Json,
}

impl LogFormat {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Human => "human",
            Self::Json => "json",
        }
    }
}

impl std::str::FromStr for LogFormat {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim() {
            "human" => Ok(Self::Human),
            "json" => Ok(Self::Json),
            other => Err(format!(
                "invalid log format '{other}', expected one of: human, json"
            )),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Args)]
pub struct SyncArgs {
    #[arg(
        long,
        default_value = "all",
        value_parser = parse_state_filter,
        help = "Upstream issue state to fetch: open, closed, or all"
    )]
    pub state: IssueStateFilter,
}

#[derive(Debug, Clone, PartialEq, Eq, Args)]
pub struct SimilarArgs {
    #[arg(long, help = "External id of a stored issue")]
    pub issue: ExternalId,

    #[arg(long, help = "Per-field result limit (defaults to triage.limit_per_field)")]
    pub limit: Option<u32>,

    #[arg(long, help = "Print candidates as JSON instead of a table")]
    pub json: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Args)]
pub struct HandleEventArgs {
    #[arg(long, help = "Webhook action, e.g. opened or edited")]
    pub action: String,

    #[arg(long, help = "Path to a saved delivery body, or - for stdin")]
    pub payload: PathBuf,
}

#[derive(Debug, Clone, PartialEq, Eq, Args)]
pub struct TriggerReplyArgs {
    #[arg(long, help = "Issue number whose reply label is toggled")]
    pub issue: i64,
}

#[derive(Debug, Clone, PartialEq, Eq, Args)]
pub struct ServeArgs {
    #[arg(long, help = "Listen address (defaults to webhook.bind)")]
    pub bind: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Subcommand)]
pub enum Commands {
    /// Create the workspace config and the issue table
    Init,
    /// Pull all issues, oldest update first
    Sync(SyncArgs),
    /// Show related issues and the comment that would be posted
    Similar(SimilarArgs),
    /// Run the issues webhook handler on a saved delivery
    HandleEvent(HandleEventArgs),
    /// Remove and re-add the reply label on an issue
    TriggerReply(TriggerReplyArgs),
    /// Serve the issues webhook over HTTP
    Serve(ServeArgs),
}

#[derive(Debug, Clone, Parser)]
#[command(author, version, about = "Related-issue triage for GitHub repositories")]
pub struct Cli {
    #[arg(
        long,
        global = true,
        default_value = ".",
        help = "Workspace root holding .kinship/"
    )]
    pub workspace: PathBuf,

    #[arg(
        long,
        global = true,
        default_value = "human",
        value_parser = parse_log_format,
        help = "Log format: human or json"
    )]
    pub log_format: LogFormat,

    #[arg(
        long,
        global = true,
        help = "Log filter directive, e.g. info or kinship_engine=debug (overrides RUST_LOG)"
    )]
    pub log_level: Option<String>,

    #[command(subcommand)]
    pub command: Commands,
}

pub fn parse_cli() -> Cli {
    let mut args: Vec<_> = std::env::args_os().collect();
    if args.get(1).is_some_and(|arg| arg == OsStr::new("--")) {
        args.remove(1);
    }

    Cli::parse_from(args)
}

fn parse_log_format(value: &str) -> Result<LogFormat, String> {
    value.parse()
}

fn parse_state_filter(value: &str) -> Result<IssueStateFilter, String> {
    value.parse()
}

#[cfg(test)]
mod tests {
    use std::path::PathBuf;

    use clap::Parser;
    use kinship_github::IssueStateFilter;

    use super::{Cli, Commands, LogFormat};

    #[test]
    fn sync_defaults_to_all_states_and_human_logs() {
        let cli = Cli::try_parse_from(["kinshipd", "sync"]).expect("sync should parse");

        assert_eq!(cli.workspace, PathBuf::from("."));
        assert_eq!(cli.log_format, LogFormat::Human);
        assert!(cli.log_level.is_none());
        match cli.command {
            Commands::Sync(args) => assert_eq!(args.state, IssueStateFilter::All),
            other => panic!("unexpected command: {other:?}"),
        }
    }

    #[test]
    fn global_flags_parse_after_subcommand() {
        let cli = Cli::try_parse_from([
            "kinshipd",
            "sync",
            "--state",
            "open",
            "--workspace",
            "/srv/triage",
            "--log-format",
            "json",
            "--log-level",
            "debug",
        ])
        .expect("sync with globals should parse");

        assert_eq!(cli.workspace, PathBuf::from("/srv/triage"));
        assert_eq!(cli.log_format.as_str(), "json");
        assert_eq!(cli.log_level.as_deref(), Some("debug"));
        match cli.command {
            Commands::Sync(args) => assert_eq!(args.state, IssueStateFilter::Open),
            other => panic!("unexpected command: {other:?}"),
        }
    }

    #[test]
    fn similar_requires_issue_id() {
        assert!(Cli::try_parse_from(["kinshipd", "similar"]).is_err());

        let cli = Cli::try_parse_from(["kinshipd", "similar", "--issue", "1234", "--json"])
            .expect("similar should parse");
        match cli.command {
            Commands::Similar(args) => {
                assert_eq!(args.issue, 1234);
                assert_eq!(args.limit, None);
                assert!(args.json);
            }
            other => panic!("unexpected command: {other:?}"),
        }
    }

    #[test]
    fn handle_event_accepts_stdin_payload() {
        let cli = Cli::try_parse_from([
            "kinshipd",
            "handle-event",
            "--action",
            "opened",
            "--payload",
            "-",
        ])
        .expect("handle-event should parse");

        match cli.command {
            Commands::HandleEvent(args) => {
                assert_eq!(args.action, "opened");
                assert_eq!(args.payload, PathBuf::from("-"));
            }
            other => panic!("unexpected command: {other:?}"),
        }
    }

    #[test]
    fn invalid_log_format_and_state_are_rejected() {
        assert!(Cli::try_parse_from(["kinshipd", "--log-format", "xml", "init"]).is_err());
        assert!(Cli::try_parse_from(["kinshipd", "sync", "--state", "merged"]).is_err());
    }

    #[test]
    fn serve_bind_override_is_optional() {
        let cli = Cli::try_parse_from(["kinshipd", "serve", "--bind", "0.0.0.0:9000"])
            .expect("serve should parse");
        match cli.command {
            Commands::Serve(args) => assert_eq!(args.bind.as_deref(), Some("0.0.0.0:9000")),
            other => panic!("unexpected command: {other:?}"),
        }
    }

    #[test]
    fn trigger_reply_takes_issue_number() {
        assert!(Cli::try_parse_from(["kinshipd", "trigger-reply"]).is_err());

        let cli = Cli::try_parse_from(["kinshipd", "trigger-reply", "--issue", "42"])
            .expect("trigger-reply should parse");
        match cli.command {
            Commands::TriggerReply(args) => assert_eq!(args.issue, 42),
            other => panic!("unexpected command: {other:?}"),
        }
    }
}
