use std::fmt;

use chrono::{DateTime, Duration, Utc};
use jsonwebtoken::{Algorithm, EncodingKey, Header};
use kinship_config::GithubAppSettings;
use kinship_core::Secret;
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;

use crate::{GITHUB_ACCEPT, GITHUB_API_VERSION, GithubError, USER_AGENT};

// GitHub rejects App JWTs that expire more than ten minutes out.
const JWT_LIFETIME_SECS: i64 = 540;
const JWT_BACKDATE_SECS: i64 = 60;
const TOKEN_REFRESH_MARGIN_SECS: i64 = 300;
const PEM_PREFIX: &str = "-----BEGIN";

/// How requests to the REST API are authorised.
pub enum GithubAuth {
    /// A personal or fine-grained token read from the environment.
    Token(Secret),
    /// Short-lived installation tokens minted for a GitHub App.
    App(AppAuth),
}

impl GithubAuth {
    /// Bearer token for the next request, minting an installation token when needed.
    pub(crate) async fn bearer(
        &self,
        client: &reqwest::Client,
        api_base: &str,
    ) -> Result<Secret, GithubError> {
        match self {
            Self::Token(token) => Ok(token.clone()),
            Self::App(app) => app.installation_token(client, api_base).await,
        }
    }
}

impl fmt::Debug for GithubAuth {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Token(token) => f.debug_tuple("Token").field(token).finish(),
            Self::App(app) => f
                .debug_struct("App")
                .field("app_id", &app.app_id)
                .field("installation_id", &app.installation_id)
                .finish_non_exhaustive(),
        }
    }
}

pub struct AppAuth {
    app_id: u64,
    installation_id: u64,
    key: EncodingKey,
    cached: Mutex<Option<InstallationToken>>,
}

#[derive(Clone)]
struct InstallationToken {
    token: Secret,
    expires_at: DateTime<Utc>,
}

#[derive(Debug, Serialize, Deserialize, PartialEq, Eq)]
pub(crate) struct AppClaims {
    pub iat: i64,
    pub exp: i64,
    pub iss: u64,
}

#[derive(Debug, Deserialize)]
struct AccessTokenResponse {
    token: String,
    expires_at: DateTime<Utc>,
}

impl AppAuth {
    /// `private_key` is either PEM text or a path to a PEM file.
    pub fn from_settings(settings: GithubAppSettings<'_>) -> Result<Self, GithubError> {
        let pem = if settings.private_key.trim_start().starts_with(PEM_PREFIX) {
            settings.private_key.to_owned()
        } else {
            std::fs::read_to_string(settings.private_key).map_err(|err| {
                GithubError::PrivateKey(format!("{}: {err}", settings.private_key))
            })?
        };
        let key = EncodingKey::from_rsa_pem(pem.as_bytes())
            .map_err(|err| GithubError::PrivateKey(err.to_string()))?;

        Ok(Self {
            app_id: settings.app_id,
            installation_id: settings.installation_id,
            key,
            cached: Mutex::new(None),
        })
    }

    pub(crate) fn claims(&self, now: DateTime<Utc>) -> AppClaims {
        let issued_at = now.timestamp() - JWT_BACKDATE_SECS;
        AppClaims {
            iat: issued_at,
            exp: now.timestamp() + JWT_LIFETIME_SECS,
            iss: self.app_id,
        }
    }

    pub(crate) fn app_jwt(&self, now: DateTime<Utc>) -> Result<String, GithubError> {
        Ok(jsonwebtoken::encode(
            &Header::new(Algorithm::RS256),
            &self.claims(now),
            &self.key,
        )?)
    }

    fn access_tokens_url(&self, api_base: &str) -> String {
        format!(
            "{api_base}/app/installations/{}/access_tokens",
            self.installation_id
        )
    }

    async fn installation_token(
        &self,
        client: &reqwest::Client,
        api_base: &str,
    ) -> Result<Secret, GithubError> {
        let mut cached = self.cached.lock().await;
        let now = Utc::now();
        if let Some(current) = cached.as_ref()
            && current.expires_at - Duration::seconds(TOKEN_REFRESH_MARGIN_SECS) > now
        {
            return Ok(current.token.clone());
        }

        let jwt = self.app_jwt(now)?;
        let response: AccessTokenResponse = client
            .post(self.access_tokens_url(api_base))
            .bearer_auth(jwt)
            .header(reqwest::header::ACCEPT, GITHUB_ACCEPT)
            .header("X-GitHub-Api-Version", GITHUB_API_VERSION)
            .header(reqwest::header::USER_AGENT, USER_AGENT)
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;

        tracing::info!(
            installation_id = self.installation_id,
            expires_at = %response.expires_at,
            "minted github app installation token"
        );
        let token = Secret::new(response.token);
        *cached = Some(InstallationToken {
            token: token.clone(),
            expires_at: response.expires_at,
        });
        Ok(token)
    }
}
