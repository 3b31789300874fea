use buddychat_core::session::DEFAULT_FAREWELL;
use buddychat_core::{ConnectPolicy, TokenPolicy};
use secrecy::SecretString;
use std::str::FromStr;
use std::time::Duration;
use tracing::Level;

/// Backend used by the deployed companion.
pub const DEFAULT_BACKEND_URL: &str = "https://cognibot.org";
/// Host loopback as seen from the emulator, used when testing locally.
pub const LOCAL_BACKEND_URL: &str = "http://10.0.2.2:8000";
pub const DEFAULT_CLIENT_SOURCE: &str = "buddyrobot";

/// A custom error type for configuration loading failures.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Missing environment variable: {0}")]
    MissingVar(String),
    #[error("Invalid value for environment variable {0}: {1}")]
    InvalidValue(String, String),
}

/// Holds all configuration loaded from the environment at startup.
#[derive(Debug)]
pub struct Config {
    pub backend_url: String,
    pub client_source: String,
    pub username: String,
    pub password: SecretString,
    pub token: TokenPolicy,
    pub connect: ConnectPolicy,
    pub farewell: String,
    pub farewell_timeout: Duration,
    pub log_level: Level,
}

impl Config {
    /// Loads configuration from environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        // Only load from .env in non-test mode to avoid contamination
        if !cfg!(test) {
            dotenvy::dotenv().ok();
        }

        let local = std::env::var("TEST_LOCAL").is_ok_and(|v| v == "1" || v == "true");
        let backend_url = if local {
            LOCAL_BACKEND_URL.to_string()
        } else {
            std::env::var("BACKEND_URL").unwrap_or_else(|_| DEFAULT_BACKEND_URL.to_string())
        };
        let client_source =
            std::env::var("CLIENT_SOURCE").unwrap_or_else(|_| DEFAULT_CLIENT_SOURCE.to_string());

        let username = std::env::var("BUDDY_USERNAME")
            .map_err(|_| ConfigError::MissingVar("BUDDY_USERNAME".to_string()))?;
        let password = std::env::var("BUDDY_PASSWORD")
            .map(SecretString::from)
            .map_err(|_| ConfigError::MissingVar("BUDDY_PASSWORD".to_string()))?;

        let token = TokenPolicy {
            max_attempts: parse_or("LOGIN_MAX_ATTEMPTS", 3)?,
            retry_delay: Duration::from_millis(parse_or("LOGIN_RETRY_DELAY_MS", 2_000)?),
            ttl: Duration::from_secs(parse_or("TOKEN_TTL_SECS", 900)?),
            refresh_interval: Duration::from_secs(parse_or("TOKEN_REFRESH_SECS", 840)?),
        };
        if token.refresh_interval >= token.ttl {
            return Err(ConfigError::InvalidValue(
                "TOKEN_REFRESH_SECS".to_string(),
                "must be shorter than TOKEN_TTL_SECS".to_string(),
            ));
        }

        let connect = ConnectPolicy {
            max_attempts: parse_or("CONNECT_MAX_ATTEMPTS", 3)?,
            retry_delay: Duration::from_millis(parse_or("CONNECT_RETRY_DELAY_MS", 3_000)?),
            connect_timeout: Duration::from_millis(parse_or("CONNECT_TIMEOUT_MS", 10_000)?),
        };

        let farewell =
            std::env::var("FAREWELL_TEXT").unwrap_or_else(|_| DEFAULT_FAREWELL.to_string());
        let farewell_timeout = Duration::from_millis(parse_or("FAREWELL_TIMEOUT_MS", 15_000)?);

        let log_level_str = std::env::var("RUST_LOG").unwrap_or_else(|_| "INFO".to_string());
        let log_level = log_level_str.parse::<Level>().map_err(|_| {
            ConfigError::InvalidValue(
                "RUST_LOG".to_string(),
                format!("'{}' is not a valid log level", log_level_str),
            )
        })?;

        Ok(Self {
            backend_url,
            client_source,
            username,
            password,
            token,
            connect,
            farewell,
            farewell_timeout,
            log_level,
        })
    }

    /// Points the companion at the local development backend.
    pub fn use_local_backend(&mut self) {
        self.backend_url = LOCAL_BACKEND_URL.to_string();
    }
}

fn parse_or<T>(var: &str, default: T) -> Result<T, ConfigError>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    match std::env::var(var) {
        Ok(raw) => raw
            .trim()
            .parse::<T>()
            .map_err(|e| ConfigError::InvalidValue(var.to_string(), e.to_string())),
        Err(_) => Ok(default),
    }
}
