//! Error taxonomy for the session core.
//!
//! Every error is `Clone` so it can be handed to a [`StateListener`] on its own
//! delivery task after being logged by the component that produced it.
//!
//! [`StateListener`]: crate::session::StateListener

use thiserror::Error;

/// Authentication failures raised by the token lifecycle.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum AuthError {
    /// A token was requested before any login succeeded.
    #[error("no access token available; login has not completed")]
    MissingToken,
    /// The backend answered but refused the credentials.
    #[error("login rejected: {0}")]
    Rejected(String),
    /// The login request itself could not be completed.
    #[error("login request failed: {0}")]
    Request(String),
    /// Every configured attempt failed; no further automatic attempt is made.
    #[error("login failed after {attempts} attempts: {last}")]
    Exhausted { attempts: u32, last: String },
}

/// Failures of the realtime channel.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum TransportError {
    #[error("invalid endpoint: {0}")]
    InvalidEndpoint(String),
    #[error("connection attempt failed: {0}")]
    Connect(String),
    #[error("connection failed after {attempts} attempts: {last}")]
    ConnectExhausted { attempts: u32, last: String },
    #[error("failed to send frame: {0}")]
    Send(String),
    #[error("connection lost: {0}")]
    ConnectionLost(String),
}

/// A malformed inbound frame. Always recovered locally by dropping the frame.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ProtocolError {
    #[error("frame is not valid JSON: {0}")]
    Malformed(String),
    #[error("frame is not a JSON object")]
    NotAnObject,
    #[error("frame has no string `type` field")]
    MissingType,
}

/// A speech or behavior capability could not be brought up during start.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum SubsystemStartError {
    #[error("{0} reported it is not available")]
    Unavailable(&'static str),
    #[error("{subsystem} panicked: {message}")]
    Panicked {
        subsystem: &'static str,
        message: String,
    },
}

/// Any error that ends (or prevents) a session.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum SessionError {
    #[error(transparent)]
    Auth(#[from] AuthError),
    #[error(transparent)]
    Transport(#[from] TransportError),
    #[error(transparent)]
    Subsystem(#[from] SubsystemStartError),
}
