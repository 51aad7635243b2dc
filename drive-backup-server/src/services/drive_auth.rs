use crate::error::ConfigError;
use backup_rotation::StorageError;
use serde::Deserialize;
use std::path::Path;
use std::time::{Duration, Instant};
use tokio::sync::Mutex;

const DEFAULT_TOKEN_URI: &str = "https://oauth2.googleapis.com/token";
/// Refresh this long before the reported expiry.
const REFRESH_MARGIN: Duration = Duration::from_secs(60);

#[derive(Debug, Clone, Deserialize)]
struct ClientSecret {
    client_id: String,
    client_secret: String,
    #[serde(default = "default_token_uri")]
    token_uri: String,
}

fn default_token_uri() -> String {
    DEFAULT_TOKEN_URI.to_string()
}

/// Layout of the OAuth client file downloaded from the cloud console.
#[derive(Debug, Deserialize)]
struct CredentialsFile {
    installed: Option<ClientSecret>,
    web: Option<ClientSecret>,
}

#[derive(Debug, Deserialize)]
struct StoredToken {
    refresh_token: Option<String>,
}

#[derive(Debug, Deserialize)]
struct TokenResponse {
    access_token: String,
    #[serde(default = "default_expires_in")]
    expires_in: u64,
}

fn default_expires_in() -> u64 {
    3600
}

struct CachedToken {
    value: String,
    refresh_at: Instant,
}

/// Hands out bearer tokens, refreshing through the OAuth token endpoint
/// when the cached one is about to expire.
pub struct TokenProvider {
    http: reqwest::Client,
    client: ClientSecret,
    refresh_token: String,
    cached: Mutex<Option<CachedToken>>,
}

impl TokenProvider {
    pub fn from_files(http: reqwest::Client, credentials: &Path, token: &Path) -> Result<Self, ConfigError> {
        let file: CredentialsFile = read_json(credentials)?;
        let client = file.installed.or(file.web).ok_or_else(|| ConfigError::Credentials {
            path: credentials.to_path_buf(),
            reason: "expected an \"installed\" or \"web\" client".into(),
        })?;

        let stored: StoredToken = read_json(token)?;
        let refresh_token = stored
            .refresh_token
            .filter(|t| !t.is_empty())
            .ok_or_else(|| ConfigError::Credentials {
                path: token.to_path_buf(),
                reason: "missing refresh_token".into(),
            })?;

        Ok(Self {
            http,
            client,
            refresh_token,
            cached: Mutex::new(None),
        })
    }

    pub async fn access_token(&self) -> Result<String, StorageError> {
        let mut cached = self.cached.lock().await;
        if let Some(token) = cached.as_ref() {
            if Instant::now() < token.refresh_at {
                return Ok(token.value.clone());
            }
        }

        let fresh = self.refresh().await?;
        let value = fresh.access_token.clone();
        *cached = Some(CachedToken {
            value: fresh.access_token,
            refresh_at: Instant::now() + Duration::from_secs(fresh.expires_in).saturating_sub(REFRESH_MARGIN),
        });
        Ok(value)
    }

    /// Drop the cached token after the API rejected it.
    pub async fn invalidate(&self) {
        *self.cached.lock().await = None;
    }

    async fn refresh(&self) -> Result<TokenResponse, StorageError> {
        tracing::debug!("Refreshing Drive access token");
        let response = self
            .http
            .post(&self.client.token_uri)
            .form(&[
                ("client_id", self.client.client_id.as_str()),
                ("client_secret", self.client.client_secret.as_str()),
                ("refresh_token", self.refresh_token.as_str()),
                ("grant_type", "refresh_token"),
            ])
            .send()
            .await
            .map_err(|e| StorageError::Authentication(e.to_string()))?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(StorageError::Authentication(format!("token refresh returned {status}: {body}")));
        }

        response
            .json()
            .await
            .map_err(|e| StorageError::Authentication(format!("malformed token response: {e}")))
    }
}

fn read_json<T: serde::de::DeserializeOwned>(path: &Path) -> Result<T, ConfigError> {
    let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
        path: path.to_path_buf(),
        source,
    })?;
    serde_json::from_str(&content).map_err(|source| ConfigError::Parse {
        path: path.to_path_buf(),
        source,
    })
}
