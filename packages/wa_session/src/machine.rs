//! Pure session lifecycle transitions.
//!
//! [`SessionState`] knows nothing about I/O; the session actor feeds it
//! protocol events and acts on what it returns. Every method upholds the
//! rule that a QR payload only exists while the status is `waiting-qr`.

use crate::client::DisconnectReason;
use crate::status::{Identity, SessionSnapshot, SessionStatus};

#[derive(Debug, Clone, PartialEq)]
pub struct SessionState {
    agent: String,
    status: SessionStatus,
    qr: Option<String>,
    identity: Option<Identity>,
    last_error: Option<String>,
}

impl SessionState {
    pub fn new(agent: impl Into<String>) -> Self {
        Self {
            agent: agent.into(),
            status: SessionStatus::Init,
            qr: None,
            identity: None,
            last_error: None,
        }
    }

    pub fn agent(&self) -> &str {
        &self.agent
    }

    pub fn status(&self) -> SessionStatus {
        self.status
    }

    pub fn qr(&self) -> Option<&str> {
        self.qr.as_deref()
    }

    pub fn identity(&self) -> Option<&Identity> {
        self.identity.as_ref()
    }

    pub fn last_error(&self) -> Option<&str> {
        self.last_error.as_deref()
    }

    pub fn is_connected(&self) -> bool {
        self.status == SessionStatus::Connected
    }

    pub fn snapshot(&self) -> SessionSnapshot {
        SessionSnapshot {
            agent: self.agent.clone(),
            latest_qr: self.qr.clone(),
            connection_status: self.status,
            last_error: self.last_error.clone(),
            me_id: self.identity.as_ref().map(|i| i.id.clone()),
            me_name: self.identity.as_ref().and_then(|i| i.name.clone()),
        }
    }

    fn set_status(&mut self, status: SessionStatus) {
        self.status = status;
        if status != SessionStatus::WaitingQr {
            self.qr = None;
        }
    }

    /// A login payload arrived. Returns whether anything changed.
    pub fn on_qr(&mut self, rendered: String) -> bool {
        if self.is_connected() {
            return false;
        }
        self.status = SessionStatus::WaitingQr;
        self.qr = Some(rendered);
        true
    }

    /// The connection opened. An identity already known from credentials
    /// counts as linked even when the open event carries none.
    pub fn on_open(&mut self, identity: Option<Identity>) {
        if identity.is_some() {
            self.identity = identity;
        }
        if self.identity.is_some() {
            self.set_status(SessionStatus::Connected);
            self.last_error = None;
        } else {
            self.set_status(SessionStatus::OpenButNotLinked);
        }
    }

    /// The connection closed. Terminal reasons go straight to `logged-out`;
    /// the caller is then responsible for tearing credentials down.
    pub fn on_close(&mut self, status_code: Option<u16>, message: &str) -> DisconnectReason {
        let reason = DisconnectReason::classify(status_code, message);
        if reason.is_terminal() {
            self.identity = None;
            self.set_status(SessionStatus::LoggedOut);
        } else {
            self.set_status(SessionStatus::Reconnecting);
        }
        if !message.is_empty() {
            self.last_error = Some(message.to_string());
        }
        reason
    }

    /// Credentials changed; pick up the identity if it resolved.
    /// Returns whether the snapshot changed.
    pub fn on_creds(&mut self, identity: Option<Identity>) -> bool {
        let Some(identity) = identity else {
            return false;
        };
        if self.identity.as_ref() == Some(&identity) {
            return false;
        }
        self.identity = Some(identity);
        if self.status == SessionStatus::OpenButNotLinked {
            self.set_status(SessionStatus::Connected);
            self.last_error = None;
        }
        true
    }

    pub fn begin_logout(&mut self) {
        self.set_status(SessionStatus::LoggingOut);
    }

    /// Credentials are gone; nothing about the old account survives.
    pub fn logged_out(&mut self) {
        self.identity = None;
        self.last_error = None;
        self.set_status(SessionStatus::LoggedOut);
    }

    pub fn restart(&mut self) {
        self.set_status(SessionStatus::Init);
    }

    pub fn teardown_failed(&mut self, error: impl Into<String>) {
        self.last_error = Some(error.into());
        self.set_status(SessionStatus::Closed);
    }

    pub fn connect_failed(&mut self, error: impl Into<String>) {
        self.last_error = Some(error.into());
        self.set_status(SessionStatus::Reconnecting);
    }

    pub fn reconnect_exhausted(&mut self) {
        self.set_status(SessionStatus::Closed);
    }
}
