use thiserror::Error;

/// Errors reported by a messaging client or connector.
#[derive(Debug, Clone, Error)]
pub enum ClientError {
    #[error("connection failed: {0}")]
    Connect(String),
    #[error("send failed: {0}")]
    Send(String),
    #[error("client closed")]
    Closed,
}

/// Errors from the external reply backend.
#[derive(Debug, Clone, Error)]
pub enum ResponderError {
    /// Network reset/abort. Eligible for the single retry.
    #[error("transient network error: {0}")]
    Transient(String),
    #[error("responder returned HTTP {status}: {body}")]
    Status { status: u16, body: String },
    #[error("responder protocol error: {0}")]
    Protocol(String),
}

impl ResponderError {
    pub fn is_transient(&self) -> bool {
        matches!(self, ResponderError::Transient(_))
    }
}

/// Errors surfaced by session operations.
#[derive(Debug, Error)]
pub enum SessionError {
    #[error("transient network error: {0}")]
    TransientNetwork(String),
    #[error("upstream protocol error: {0}")]
    UpstreamProtocol(String),
    #[error("could not remove auth directory (step: {step})")]
    AuthTeardown { step: &'static str },
    #[error("send failed: {0}")]
    Send(String),
    #[error("connection error: {0}")]
    Connection(String),
    #[error("session is not connected")]
    NotConnected,
    #[error("invalid recipient: {0:?}")]
    InvalidRecipient(String),
    #[error("invalid agent id: {0:?}")]
    InvalidAgentId(String),
    #[error("session limit reached ({0} running)")]
    SessionLimit(usize),
    #[error("session actor is gone")]
    ActorGone,
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl From<ResponderError> for SessionError {
    fn from(err: ResponderError) -> Self {
        match err {
            ResponderError::Transient(msg) => SessionError::TransientNetwork(msg),
            other => SessionError::UpstreamProtocol(other.to_string()),
        }
    }
}

impl From<ClientError> for SessionError {
    fn from(err: ClientError) -> Self {
        match err {
            ClientError::Send(msg) => SessionError::Send(msg),
            other => SessionError::Connection(other.to_string()),
        }
    }
}
