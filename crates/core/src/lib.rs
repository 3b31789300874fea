//! Realtime session core for the companion client.
//!
//! The [`TokenManager`] keeps a backend credential fresh, the
//! [`TransportClient`] owns the chat WebSocket, the [`MessageDispatcher`] turns
//! inbound frames into speech and expressions, and the [`SessionController`]
//! sequences all of it through a single state machine.

pub mod capabilities;
pub mod cues;
pub mod dispatcher;
pub mod error;
pub mod intent;
pub mod protocol;
pub mod session;
pub mod token;
pub mod transport;

#[cfg(test)]
pub(crate) mod testing;

pub use capabilities::{
    BehaviorAnimator, Capabilities, Completion, MoodSetter, SpeechInput, SpeechOutput,
};
pub use dispatcher::MessageDispatcher;
pub use error::{AuthError, ProtocolError, SessionError, SubsystemStartError, TransportError};
pub use session::{SessionController, SessionSettings, SessionState, StateListener};
pub use token::{Authenticator, Token, TokenManager, TokenPolicy};
pub use transport::{ConnectPolicy, Connector, Endpoint, TransportClient, WsConnector};
