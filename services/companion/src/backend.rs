//! HTTP client for the companion backend: login, health and profile.

use async_trait::async_trait;
use buddychat_core::{AuthError, Authenticator, Token};
use reqwest::StatusCode;
use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::{debug, info, warn};
use url::Url;

const REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, thiserror::Error)]
pub enum BackendError {
    #[error("invalid backend URL: {0}")]
    InvalidUrl(String),
    #[error("request failed: {0}")]
    Request(String),
    #[error("HTTP {status} from {url}")]
    Status { status: u16, url: String },
    #[error("unexpected response body: {0}")]
    Body(String),
}

#[derive(Serialize)]
struct LoginRequest<'a> {
    username: &'a str,
    password: &'a str,
}

#[derive(Deserialize)]
struct LoginResponse {
    access: String,
}

/// The person the companion is talking with.
#[derive(Debug, Clone, Deserialize, PartialEq)]
pub struct Person {
    #[serde(default)]
    pub first_name: String,
    #[serde(default)]
    pub last_name: String,
    pub username: String,
}

#[derive(Debug, Clone, Deserialize, PartialEq)]
pub struct Profile {
    pub plwd: Person,
}

pub struct BackendClient {
    base: Url,
    username: String,
    password: SecretString,
    http_client: reqwest::Client,
}

impl BackendClient {
    pub fn new(
        base_url: &str,
        username: impl Into<String>,
        password: SecretString,
    ) -> Result<Self, BackendError> {
        let mut base = Url::parse(base_url).map_err(|e| BackendError::InvalidUrl(e.to_string()))?;
        if !base.path().ends_with('/') {
            let path = format!("{}/", base.path());
            base.set_path(&path);
        }
        let http_client = reqwest::Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .user_agent(concat!("buddychat-companion/", env!("CARGO_PKG_VERSION")))
            .build()
            .unwrap_or_default();

        Ok(Self {
            base,
            username: username.into(),
            password,
            http_client,
        })
    }

    fn endpoint(&self, path: &str) -> Result<Url, BackendError> {
        self.base
            .join(path)
            .map_err(|e| BackendError::InvalidUrl(e.to_string()))
    }

    /// Exchanges the configured credentials for an access token.
    pub async fn login(&self) -> Result<String, AuthError> {
        let url = self
            .endpoint("api/token/")
            .map_err(|e| AuthError::Request(e.to_string()))?;
        debug!(url = %url, user = %self.username, "Requesting access token");

        let response = self
            .http_client
            .post(url)
            .json(&LoginRequest {
                username: &self.username,
                password: self.password.expose_secret(),
            })
            .send()
            .await
            .map_err(|e| AuthError::Request(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            return Err(login_failure(status));
        }

        let body: LoginResponse = response
            .json()
            .await
            .map_err(|e| AuthError::Request(format!("unreadable token response: {e}")))?;
        if body.access.is_empty() {
            return Err(AuthError::Rejected("empty access token".to_string()));
        }
        Ok(body.access)
    }

    /// `GET /api/health/`; success means the backend is reachable.
    pub async fn ping_health(&self) -> Result<(), BackendError> {
        let url = self.endpoint("api/health/")?;
        let response = self
            .http_client
            .get(url.clone())
            .send()
            .await
            .map_err(|e| BackendError::Request(e.to_string()))?;
        if !response.status().is_success() {
            return Err(BackendError::Status {
                status: response.status().as_u16(),
                url: url.to_string(),
            });
        }
        Ok(())
    }

    pub async fn fetch_profile(&self, token: &Token) -> Result<Profile, BackendError> {
        let url = self.endpoint("api/profile/")?;
        let response = self
            .http_client
            .get(url.clone())
            .bearer_auth(token.expose())
            .send()
            .await
            .map_err(|e| BackendError::Request(e.to_string()))?;
        if !response.status().is_success() {
            return Err(BackendError::Status {
                status: response.status().as_u16(),
                url: url.to_string(),
            });
        }
        response
            .json()
            .await
            .map_err(|e| BackendError::Body(e.to_string()))
    }

    /// Logs the health check outcome; the companion keeps going either way.
    pub async fn log_health(&self) {
        match self.ping_health().await {
            Ok(()) => info!("Backend health check passed."),
            Err(e) => warn!("Backend health check failed: {}", e),
        }
    }
}

#[async_trait]
impl Authenticator for BackendClient {
    async fn authenticate(&self) -> Result<String, AuthError> {
        self.login().await
    }
}

fn login_failure(status: StatusCode) -> AuthError {
    match status {
        StatusCode::BAD_REQUEST | StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => {
            AuthError::Rejected(format!("HTTP {}", status.as_u16()))
        }
        _ => AuthError::Request(format!("HTTP {}", status.as_u16())),
    }
}
