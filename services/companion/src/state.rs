//! Long-lived services, constructed once at startup.

use crate::backend::{BackendClient, BackendError};
use crate::config::Config;
use crate::console::{Console, ConsoleInput, ConsoleStatus};
use buddychat_core::{
    Endpoint, SessionController, SessionSettings, TokenManager, TransportError, WsConnector,
};
use std::sync::Arc;
use tokio::runtime::Handle;

#[derive(Debug, thiserror::Error)]
pub enum StateError {
    #[error(transparent)]
    Backend(#[from] BackendError),
    #[error(transparent)]
    Endpoint(#[from] TransportError),
}

/// Everything the companion process shares between its tasks.
#[derive(Clone)]
pub struct AppState {
    pub backend: Arc<BackendClient>,
    pub tokens: Arc<TokenManager>,
    pub session: Arc<SessionController>,
    pub input: Arc<ConsoleInput>,
}

impl AppState {
    /// Must be called from within the Tokio runtime.
    pub fn new(config: Config) -> Result<Self, StateError> {
        let backend = Arc::new(BackendClient::new(
            &config.backend_url,
            config.username,
            config.password,
        )?);
        let tokens = TokenManager::new(backend.clone(), config.token);

        let endpoint = Endpoint::new(&config.backend_url, config.client_source)?;
        let settings = SessionSettings {
            endpoint,
            connect: config.connect,
            farewell: config.farewell,
            farewell_timeout: config.farewell_timeout,
        };

        let console = Console::new(Handle::current());
        let session = Arc::new(SessionController::spawn(
            tokens.clone(),
            Arc::new(WsConnector),
            console.capabilities,
            settings,
        ));
        session.set_listener(Arc::new(ConsoleStatus));

        Ok(Self {
            backend,
            tokens,
            session,
            input: console.input,
        })
    }
}
