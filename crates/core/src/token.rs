//! Token Lifecycle
//!
//! Acquires the backend access token and keeps it fresh. The manager is a
//! single long-lived service: constructed once at startup, shared through an
//! `Arc`, and consulted by the session whenever a connection is opened.
//!
//! The refresh timer runs as its own task. A failed refresh is logged and
//! leaves the cached token untouched, so an active session never notices it.

use crate::error::AuthError;
use async_trait::async_trait;
use chrono::{DateTime, TimeDelta, Utc};
use parking_lot::{Mutex, RwLock};
use secrecy::{ExposeSecret, SecretString};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Attempts used by each background refresh.
const REFRESH_ATTEMPTS: u32 = 3;

/// Callback run once after the initial login succeeds.
pub type ReadyCallback = Box<dyn FnOnce(Arc<Token>) + Send + 'static>;

/// An access credential with its issue time and lifetime.
#[derive(Debug)]
pub struct Token {
    value: SecretString,
    issued_at: DateTime<Utc>,
    ttl: Duration,
}

impl Token {
    pub fn new(value: impl Into<String>, ttl: Duration) -> Self {
        Self {
            value: SecretString::from(value.into()),
            issued_at: Utc::now(),
            ttl,
        }
    }

    /// The raw credential, for embedding in a request.
    pub fn expose(&self) -> &str {
        self.value.expose_secret()
    }

    pub fn issued_at(&self) -> DateTime<Utc> {
        self.issued_at
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    pub fn expires_at(&self) -> DateTime<Utc> {
        TimeDelta::from_std(self.ttl)
            .ok()
            .and_then(|ttl| self.issued_at.checked_add_signed(ttl))
            .unwrap_or(DateTime::<Utc>::MAX_UTC)
    }

    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        now >= self.expires_at()
    }
}

/// Obtains a fresh credential from the backend.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait Authenticator: Send + Sync {
    async fn authenticate(&self) -> Result<String, AuthError>;
}

/// Retry and refresh timing for the token lifecycle.
#[derive(Debug, Clone)]
pub struct TokenPolicy {
    /// Total login attempts made by `initial_login`.
    pub max_attempts: u32,
    pub retry_delay: Duration,
    pub ttl: Duration,
    /// Refresh a little before `ttl` runs out.
    pub refresh_interval: Duration,
}

impl Default for TokenPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            retry_delay: Duration::from_secs(2),
            ttl: Duration::from_secs(15 * 60),
            refresh_interval: Duration::from_secs(14 * 60),
        }
    }
}

struct Refresher {
    cancel: CancellationToken,
    task: JoinHandle<()>,
}

/// Acquires and silently refreshes the access token.
pub struct TokenManager {
    authenticator: Arc<dyn Authenticator>,
    policy: TokenPolicy,
    token: RwLock<Option<Arc<Token>>>,
    refresher: Mutex<Option<Refresher>>,
}

impl TokenManager {
    pub fn new(authenticator: Arc<dyn Authenticator>, policy: TokenPolicy) -> Arc<Self> {
        Arc::new(Self {
            authenticator,
            policy,
            token: RwLock::new(None),
            refresher: Mutex::new(None),
        })
    }

    /// The cached token, if any login has succeeded.
    pub fn access_token(&self) -> Option<Arc<Token>> {
        let token = self.token.read().clone();
        if token.is_none() {
            warn!("Access token requested before login completed");
        }
        token
    }

    /// The cached token, or `AuthError::MissingToken`.
    pub fn ensure_token(&self) -> Result<Arc<Token>, AuthError> {
        self.access_token().ok_or(AuthError::MissingToken)
    }

    /// Runs the initial login with the configured attempt count. On success the
    /// refresh timer is started and `on_ready` runs exactly once.
    pub async fn initial_login<F>(self: &Arc<Self>, on_ready: F) -> Result<Arc<Token>, AuthError>
    where
        F: FnOnce(Arc<Token>) + Send + 'static,
    {
        info!("Starting initial login sequence...");
        self.login(self.policy.max_attempts, true, Some(Box::new(on_ready)))
            .await
    }

    /// Attempts to authenticate up to `max_attempts` times, waiting
    /// `retry_delay` between attempts. Exhausting the attempts is terminal for
    /// this call; the error is returned to the caller.
    pub async fn login(
        self: &Arc<Self>,
        max_attempts: u32,
        is_initial: bool,
        on_ready: Option<ReadyCallback>,
    ) -> Result<Arc<Token>, AuthError> {
        let max_attempts = max_attempts.max(1);
        let mut last_error = AuthError::MissingToken;

        for attempt in 1..=max_attempts {
            debug!(attempt, max_attempts, "Attempting login...");
            match self.authenticator.authenticate().await {
                Ok(value) => {
                    let token = Arc::new(Token::new(value, self.policy.ttl));
                    *self.token.write() = Some(token.clone());
                    if is_initial {
                        info!("Initial login successful. Starting refresh timer.");
                        self.start_refresher();
                        if let Some(on_ready) = on_ready {
                            on_ready(token.clone());
                        }
                    } else {
                        info!("Token background refresh successful.");
                    }
                    return Ok(token);
                }
                Err(e) => {
                    let remaining = max_attempts - attempt;
                    warn!(attempt, remaining, error = %e, "Login failed");
                    last_error = e;
                    if remaining > 0 {
                        tokio::time::sleep(self.policy.retry_delay).await;
                    }
                }
            }
        }

        error!(attempts = max_attempts, "All login attempts failed.");
        Err(AuthError::Exhausted {
            attempts: max_attempts,
            last: last_error.to_string(),
        })
    }

    /// Starts the periodic refresh, replacing any timer already running. The
    /// next refresh is scheduled a full period after the previous one ends.
    pub fn start_refresher(self: &Arc<Self>) {
        self.stop_refresher();

        let cancel = CancellationToken::new();
        let period = self.policy.refresh_interval;
        let manager = Arc::downgrade(self);
        let token = cancel.clone();

        let task = tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    _ = tokio::time::sleep(period) => {}
                }
                let Some(manager) = manager.upgrade() else {
                    break;
                };
                debug!("Timer triggered: refreshing token now...");
                tokio::select! {
                    _ = token.cancelled() => break,
                    result = manager.login(REFRESH_ATTEMPTS, false, None) => {
                        if let Err(e) = result {
                            warn!(
                                error = %e,
                                "Background token refresh failed; keeping the current token."
                            );
                        }
                    }
                }
            }
            debug!("Token refresher stopped.");
        });

        *self.refresher.lock() = Some(Refresher { cancel, task });
    }

    /// Cancels the refresh timer. Safe to call any number of times.
    pub fn stop_refresher(&self) {
        if let Some(refresher) = self.refresher.lock().take() {
            refresher.cancel.cancel();
            refresher.task.abort();
        }
    }

    pub fn is_refreshing(&self) -> bool {
        self.refresher
            .lock()
            .as_ref()
            .is_some_and(|r| !r.task.is_finished())
    }

    #[cfg(test)]
    pub(crate) fn with_token(authenticator: Arc<dyn Authenticator>, value: &str) -> Arc<Self> {
        let manager = Self::new(authenticator, TokenPolicy::default());
        *manager.token.write() = Some(Arc::new(Token::new(value, manager.policy.ttl)));
        manager
    }
}

impl Drop for TokenManager {
    fn drop(&mut self) {
        self.stop_refresher();
    }
}
