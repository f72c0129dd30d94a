use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use thiserror::Error;

pub const KINSHIP_DIR_NAME: &str = ".kinship";
pub const CONFIG_FILE_NAME: &str = "config.toml";
pub const DEFAULT_GITHUB_TOKEN_ENV: &str = "GITHUB_TOKEN";
pub const DEFAULT_GITHUB_API_BASE: &str = "https://api.github.com";
pub const DEFAULT_ISSUES_PER_PAGE: u32 = 100;
pub const DEFAULT_QWEN_EMBEDDING_ENDPOINT: &str = "http://127.0.0.1:11434/api/embeddings";
pub const DEFAULT_QWEN_MODEL: &str = "qwen3-embeddings-0.6B";
pub const DEFAULT_LIMIT_PER_FIELD: u32 = 5;
pub const DEFAULT_DISTANCE_THRESHOLD: f32 = 0.7;
pub const DEFAULT_BOT_MARKER: &str = "[bot]";
pub const DEFAULT_REPLY_LABEL: &str = "tiara";
pub const DEFAULT_WEBHOOK_BIND: &str = "127.0.0.1:8080";
pub const DEFAULT_WEBHOOK_PATH: &str = "/github/webhook";

// Cosine distance lives in [0, 2].
const MAX_COSINE_DISTANCE: f32 = 2.0;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum EmbeddingProviderKind {
    #[default]
    Mock,
    Qwen3Local,
}

impl EmbeddingProviderKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Mock => "mock",
            Self::Qwen3Local => "qwen3_local",
        }
    }
}

impl std::str::FromStr for EmbeddingProviderKind {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim() {
            "mock" => Ok(Self::Mock),
            "qwen3_local" => Ok(Self::Qwen3Local),
            other => Err(format!(
                "invalid embedding provider '{other}', expected one of: mock, qwen3_local"
            )),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum EmbeddingVectorBackend {
    #[default]
    Sqlite,
    Lancedb,
}

impl EmbeddingVectorBackend {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Sqlite => "sqlite",
            Self::Lancedb => "lancedb",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct KinshipConfig {
    #[serde(default)]
    pub github: GithubConfig,
    #[serde(default)]
    pub embeddings: EmbeddingsConfig,
    #[serde(default)]
    pub triage: TriageConfig,
    #[serde(default)]
    pub webhook: WebhookConfig,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GithubConfig {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub repository: Option<String>,
    #[serde(default = "default_token_env")]
    pub token_env: String,
    #[serde(default = "default_api_base")]
    pub api_base: String,
    #[serde(default = "default_per_page")]
    pub per_page: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub app_id: Option<u64>,
    /// Path to the App's PEM private key, or the PEM text itself.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub private_key: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub installation_id: Option<u64>,
}

impl Default for GithubConfig {
    fn default() -> Self {
        Self {
            repository: None,
            token_env: default_token_env(),
            api_base: default_api_base(),
            per_page: default_per_page(),
            app_id: None,
            private_key: None,
            installation_id: None,
        }
    }
}

/// Complete GitHub App identity used to mint installation tokens.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GithubAppSettings<'a> {
    pub app_id: u64,
    pub installation_id: u64,
    pub private_key: &'a str,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct EmbeddingsConfig {
    #[serde(default)]
    pub provider: EmbeddingProviderKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub endpoint: Option<String>,
    #[serde(default)]
    pub vector_backend: EmbeddingVectorBackend,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TriageConfig {
    #[serde(default = "default_limit_per_field")]
    pub limit_per_field: u32,
    #[serde(default = "default_distance_threshold")]
    pub distance_threshold: f32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub comment_threshold: Option<f32>,
    #[serde(default = "default_bot_marker")]
    pub bot_marker: String,
    /// Label toggled off and on to re-trigger reply automation on an issue.
    #[serde(default = "default_reply_label")]
    pub reply_label: String,
}

impl TriageConfig {
    pub fn effective_comment_threshold(&self) -> f32 {
        self.comment_threshold.unwrap_or(self.distance_threshold)
    }
}

impl Default for TriageConfig {
    fn default() -> Self {
        Self {
            limit_per_field: default_limit_per_field(),
            distance_threshold: default_distance_threshold(),
            comment_threshold: None,
            bot_marker: default_bot_marker(),
            reply_label: default_reply_label(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WebhookConfig {
    #[serde(default = "default_webhook_bind")]
    pub bind: String,
    #[serde(default = "default_webhook_path")]
    pub path: String,
}

impl Default for WebhookConfig {
    fn default() -> Self {
        Self {
            bind: default_webhook_bind(),
            path: default_webhook_path(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConfigWarning {
    pub code: &'static str,
    pub message: String,
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("failed to parse config TOML: {0}")]
    TomlParse(#[from] toml::de::Error),
    #[error("failed to serialize config TOML: {0}")]
    TomlSerialize(#[from] toml::ser::Error),
    #[error("github.repository is not configured (expected \"owner/name\")")]
    MissingRepository,
    #[error("invalid github.repository '{0}', expected \"owner/name\"")]
    InvalidRepository(String),
    #[error("github app auth is partially configured: github.{0} is missing")]
    IncompleteGithubApp(&'static str),
}

pub fn kinship_dir(workspace_root: impl AsRef<Path>) -> PathBuf {
    workspace_root.as_ref().join(KINSHIP_DIR_NAME)
}

pub fn config_path(workspace_root: impl AsRef<Path>) -> PathBuf {
    kinship_dir(workspace_root).join(CONFIG_FILE_NAME)
}

pub fn load_workspace_config(
    workspace_root: impl AsRef<Path>,
) -> Result<KinshipConfig, ConfigError> {
    let path = config_path(workspace_root);
    if !path.exists() {
        return Ok(KinshipConfig::default());
    }

    let raw = fs::read_to_string(path)?;
    let parsed: KinshipConfig = toml::from_str(&raw)?;
    Ok(normalize_config(parsed))
}

pub fn ensure_workspace_config(
    workspace_root: impl AsRef<Path>,
) -> Result<KinshipConfig, ConfigError> {
    let workspace_root = workspace_root.as_ref();
    fs::create_dir_all(kinship_dir(workspace_root))?;

    let path = config_path(workspace_root);
    if path.exists() {
        return load_workspace_config(workspace_root);
    }

    let config = KinshipConfig::default();
    let content = toml::to_string_pretty(&config)?;
    fs::write(path, content)?;

    Ok(config)
}

/// Returns the configured `owner/name` repository or a fatal configuration error.
pub fn require_repository(config: &KinshipConfig) -> Result<&str, ConfigError> {
    let repository = config
        .github
        .repository
        .as_deref()
        .ok_or(ConfigError::MissingRepository)?;

    let mut parts = repository.split('/');
    match (parts.next(), parts.next(), parts.next()) {
        (Some(owner), Some(name), None) if !owner.is_empty() && !name.is_empty() => {
            Ok(repository)
        }
        _ => Err(ConfigError::InvalidRepository(repository.to_owned())),
    }
}

/// App credentials when any of them is configured; a partial set is a fatal error.
pub fn github_app_settings(
    config: &KinshipConfig,
) -> Result<Option<GithubAppSettings<'_>>, ConfigError> {
    let github = &config.github;
    match (github.app_id, github.private_key.as_deref(), github.installation_id) {
        (None, None, None) => Ok(None),
        (Some(app_id), Some(private_key), Some(installation_id)) => Ok(Some(GithubAppSettings {
            app_id,
            installation_id,
            private_key,
        })),
        (None, _, _) => Err(ConfigError::IncompleteGithubApp("app_id")),
        (_, None, _) => Err(ConfigError::IncompleteGithubApp("private_key")),
        (_, _, None) => Err(ConfigError::IncompleteGithubApp("installation_id")),
    }
}

pub fn validate_config(config: &KinshipConfig) -> Vec<ConfigWarning> {
    let mut warnings = Vec::new();
    let triage = &config.triage;

    if !(0.0..=MAX_COSINE_DISTANCE).contains(&triage.distance_threshold) {
        warnings.push(ConfigWarning {
            code: "distance_threshold_out_of_range",
            message: format!(
                "triage.distance_threshold = {} is outside [0, {MAX_COSINE_DISTANCE}]",
                triage.distance_threshold
            ),
        });
    }

    if let Some(comment_threshold) = triage.comment_threshold
        && comment_threshold > triage.distance_threshold
    {
        warnings.push(ConfigWarning {
            code: "comment_threshold_looser_than_search",
            message: format!(
                "triage.comment_threshold = {comment_threshold} is looser than triage.distance_threshold = {}; no candidate can exceed the search threshold",
                triage.distance_threshold
            ),
        });
    }

    if triage.limit_per_field == 0 {
        warnings.push(ConfigWarning {
            code: "limit_per_field_zero",
            message: "triage.limit_per_field = 0 disables similarity search".to_owned(),
        });
    }

    if triage.bot_marker.is_empty() {
        warnings.push(ConfigWarning {
            code: "bot_marker_empty",
            message: "triage.bot_marker is empty; bot authors will not be recognised".to_owned(),
        });
    }

    if config.github.repository.is_none() {
        warnings.push(ConfigWarning {
            code: "github_repository_missing",
            message: "github.repository is not set; sync and comment posting are unavailable"
                .to_owned(),
        });
    }

    warnings
}

fn default_token_env() -> String {
    DEFAULT_GITHUB_TOKEN_ENV.to_owned()
}

fn default_api_base() -> String {
    DEFAULT_GITHUB_API_BASE.to_owned()
}

fn default_per_page() -> u32 {
    DEFAULT_ISSUES_PER_PAGE
}

fn default_limit_per_field() -> u32 {
    DEFAULT_LIMIT_PER_FIELD
}

fn default_distance_threshold() -> f32 {
    DEFAULT_DISTANCE_THRESHOLD
}

fn default_bot_marker() -> String {
    DEFAULT_BOT_MARKER.to_owned()
}

fn default_reply_label() -> String {
    DEFAULT_REPLY_LABEL.to_owned()
}

fn default_webhook_bind() -> String {
    DEFAULT_WEBHOOK_BIND.to_owned()
}

fn default_webhook_path() -> String {
    DEFAULT_WEBHOOK_PATH.to_owned()
}

fn normalize_optional(input: Option<String>) -> Option<String> {
    input
        .map(|value| value.trim().to_owned())
        .filter(|value| !value.is_empty())
}

fn normalize_or_default(value: &str, default: fn() -> String) -> String {
    let trimmed = value.trim();
    if trimmed.is_empty() {
        default()
    } else {
        trimmed.to_owned()
    }
}

fn normalize_config(mut config: KinshipConfig) -> KinshipConfig {
    config.github.repository = normalize_optional(config.github.repository.take());
    config.github.token_env = normalize_or_default(&config.github.token_env, default_token_env);
    config.github.api_base = normalize_or_default(&config.github.api_base, default_api_base)
        .trim_end_matches('/')
        .to_owned();
    config.github.per_page = config.github.per_page.clamp(1, DEFAULT_ISSUES_PER_PAGE);

    config.embeddings.model = normalize_optional(config.embeddings.model.take());
    config.embeddings.endpoint = normalize_optional(config.embeddings.endpoint.take());

    config.github.private_key = normalize_optional(config.github.private_key.take());

    config.triage.bot_marker = config.triage.bot_marker.trim().to_owned();
    config.triage.reply_label =
        normalize_or_default(&config.triage.reply_label, default_reply_label);

    config.webhook.bind = normalize_or_default(&config.webhook.bind, default_webhook_bind);
    let path = normalize_or_default(&config.webhook.path, default_webhook_path);
    config.webhook.path = if path.starts_with('/') {
        path
    } else {
        format!("/{path}")
    };

    config
}

#[cfg(test)]
mod tests {
    use std::fs;

    use tempfile::tempdir;

    use super::*;

    #[test]
    fn ensure_workspace_config_creates_default_file() {
        let temp = tempdir().expect("tempdir");
        let workspace = temp.path();

        let config = ensure_workspace_config(workspace).expect("ensure config");

        assert_eq!(config.embeddings.provider, EmbeddingProviderKind::Mock);
        assert_eq!(config.github.token_env, DEFAULT_GITHUB_TOKEN_ENV);
        assert_eq!(config.triage.limit_per_field, DEFAULT_LIMIT_PER_FIELD);
        assert!(config_path(workspace).exists());

        let content = fs::read_to_string(config_path(workspace)).expect("read config file");
        assert!(content.contains("[triage]"));
        assert!(content.contains("bot_marker = \"[bot]\""));
    }

    #[test]
    fn load_workspace_config_parses_and_normalizes_values() {
        let temp = tempdir().expect("tempdir");
        let workspace = temp.path();
        fs::create_dir_all(kinship_dir(workspace)).expect("create .kinship");

        let raw = r#"
[github]
repository = "  acme/widgets "
token_env = "CUSTOM_TOKEN"
api_base = "https://github.example.com/api/v3/"
per_page = 500

[embeddings]
provider = "qwen3_local"
model = "  "
vector_backend = "lancedb"

[triage]
limit_per_field = 3
distance_threshold = 0.5
comment_threshold = 0.4

[webhook]
path = "hooks/github"
"#;
        fs::write(config_path(workspace), raw).expect("write config");

        let config = load_workspace_config(workspace).expect("load config");

        assert_eq!(config.github.repository.as_deref(), Some("acme/widgets"));
        assert_eq!(config.github.token_env, "CUSTOM_TOKEN");
        assert_eq!(config.github.api_base, "https://github.example.com/api/v3");
        assert_eq!(config.github.per_page, 100);
        assert_eq!(
            config.embeddings.provider,
            EmbeddingProviderKind::Qwen3Local
        );
        assert_eq!(config.embeddings.model, None);
        assert_eq!(
            config.embeddings.vector_backend,
            EmbeddingVectorBackend::Lancedb
        );
        assert_eq!(config.triage.limit_per_field, 3);
        assert_eq!(config.triage.effective_comment_threshold(), 0.4);
        assert_eq!(config.triage.bot_marker, DEFAULT_BOT_MARKER);
        assert_eq!(config.triage.reply_label, DEFAULT_REPLY_LABEL);
        assert_eq!(config.webhook.path, "/hooks/github");
        assert_eq!(config.webhook.bind, DEFAULT_WEBHOOK_BIND);
    }

    #[test]
    fn require_repository_rejects_missing_and_malformed_names() {
        let mut config = KinshipConfig::default();
        assert!(matches!(
            require_repository(&config),
            Err(ConfigError::MissingRepository)
        ));

        config.github.repository = Some("widgets".to_owned());
        assert!(matches!(
            require_repository(&config),
            Err(ConfigError::InvalidRepository(_))
        ));

        config.github.repository = Some("acme/widgets".to_owned());
        assert_eq!(require_repository(&config).expect("repo"), "acme/widgets");
    }

    #[test]
    fn validate_config_flags_loose_comment_threshold() {
        let mut config = KinshipConfig::default();
        config.github.repository = Some("acme/widgets".to_owned());
        assert!(validate_config(&config).is_empty());

        config.triage.comment_threshold = Some(0.9);
        let warnings = validate_config(&config);
        assert_eq!(warnings.len(), 1);
        assert_eq!(warnings[0].code, "comment_threshold_looser_than_search");
    }

    #[test]
    fn github_app_settings_require_all_three_values() {
        let mut config = KinshipConfig::default();
        assert_eq!(github_app_settings(&config).expect("no app"), None);

        config.github.app_id = Some(12345);
        assert!(matches!(
            github_app_settings(&config),
            Err(ConfigError::IncompleteGithubApp("private_key"))
        ));

        config.github.private_key = Some("/etc/kinship/app.pem".to_owned());
        assert!(matches!(
            github_app_settings(&config),
            Err(ConfigError::IncompleteGithubApp("installation_id"))
        ));

        config.github.installation_id = Some(678);
        assert_eq!(
            github_app_settings(&config).expect("complete app"),
            Some(GithubAppSettings {
                app_id: 12345,
                installation_id: 678,
                private_key: "/etc/kinship/app.pem",
            })
        );

        config.github.app_id = None;
        assert!(matches!(
            github_app_settings(&config),
            Err(ConfigError::IncompleteGithubApp("app_id"))
        ));
    }

    #[test]
    fn app_and_reply_settings_load_from_toml() {
        let temp = tempdir().expect("tempdir");
        let workspace = temp.path();
        fs::create_dir_all(kinship_dir(workspace)).expect("create .kinship");
        let raw = r#"
[github]
repository = "acme/widgets"
app_id = 12345
private_key = "  keys/app.pem "
installation_id = 678

[triage]
reply_label = " needs-reply "
"#;
        fs::write(config_path(workspace), raw).expect("write config");

        let config = load_workspace_config(workspace).expect("load config");

        assert_eq!(config.github.private_key.as_deref(), Some("keys/app.pem"));
        assert_eq!(config.triage.reply_label, "needs-reply");
        assert!(github_app_settings(&config).expect("settings").is_some());
    }
}
