use serde::{Deserialize, Serialize};

/// Connection status of a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum SessionStatus {
    Init,
    WaitingQr,
    OpenButNotLinked,
    Connected,
    Reconnecting,
    LoggingOut,
    LoggedOut,
    Closed,
}

impl SessionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            SessionStatus::Init => "init",
            SessionStatus::WaitingQr => "waiting-qr",
            SessionStatus::OpenButNotLinked => "open-but-not-linked",
            SessionStatus::Connected => "connected",
            SessionStatus::Reconnecting => "reconnecting",
            SessionStatus::LoggingOut => "logging-out",
            SessionStatus::LoggedOut => "logged-out",
            SessionStatus::Closed => "closed",
        }
    }
}

impl std::fmt::Display for SessionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The account a session is linked as.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Identity {
    pub id: String,
    #[serde(default)]
    pub name: Option<String>,
}

/// Point-in-time view of a session, pushed to status subscribers.
///
/// Field names match what the dashboard expects on the wire.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionSnapshot {
    pub agent: String,
    #[serde(rename = "latestQR")]
    pub latest_qr: Option<String>,
    pub connection_status: SessionStatus,
    pub last_error: Option<String>,
    pub me_id: Option<String>,
    pub me_name: Option<String>,
}

/// Inbound message notice pushed to status subscribers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MessageNotice {
    pub is_group: bool,
    pub number: Option<String>,
    pub group_id: Option<String>,
    pub text: String,
}

/// Events published on a session's status channel.
#[derive(Debug, Clone, PartialEq)]
pub enum SessionEvent {
    Update(SessionSnapshot),
    Message(MessageNotice),
}

impl SessionEvent {
    /// SSE event name.
    pub fn name(&self) -> &'static str {
        match self {
            SessionEvent::Update(_) => "update",
            SessionEvent::Message(_) => "msg",
        }
    }

    pub fn payload(&self) -> serde_json::Value {
        match self {
            SessionEvent::Update(s) => serde_json::to_value(s).unwrap_or_default(),
            SessionEvent::Message(m) => serde_json::to_value(m).unwrap_or_default(),
        }
    }
}
