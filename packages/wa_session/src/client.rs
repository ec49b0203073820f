//! Boundary to the messaging protocol library.
//!
//! The protocol itself is opaque: a [`Connector`] produces a [`Connection`]
//! holding a [`MessagingClient`] for outbound calls and a channel of
//! [`ClientEvent`]s for everything the library reports back. Dropping the
//! event receiver detaches all listeners.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

use crate::error::ClientError;
use crate::status::Identity;

/// Status code the protocol uses for an explicit logout.
pub const LOGGED_OUT_STATUS: u16 = 401;

/// Error text the protocol uses when the login payload was refreshed too often.
const QR_EXHAUSTED_PATTERN: &str = "qr refs attempts ended";

/// Serialized credential material for one session.
pub type Credentials = serde_json::Value;

/// Key of a protocol message.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MessageKey {
    #[serde(default)]
    pub remote_jid: Option<String>,
    #[serde(default)]
    pub from_me: bool,
    #[serde(default)]
    pub id: Option<String>,
    #[serde(default)]
    pub participant: Option<String>,
}

/// An inbound message as delivered by the protocol library.
///
/// `message` is the raw content tree; see [`crate::summary`] for how it is read.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InboundMessage {
    pub key: MessageKey,
    #[serde(default)]
    pub push_name: Option<String>,
    #[serde(default)]
    pub message_timestamp: Option<i64>,
    #[serde(default)]
    pub message: Option<serde_json::Value>,
}

/// Kind of a message upsert batch. Only `Notify` carries new traffic.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum UpsertKind {
    Notify,
    Append,
}

/// Events emitted by the messaging client.
#[derive(Debug, Clone, PartialEq)]
pub enum ClientEvent {
    /// A scannable login payload (raw, not yet rendered).
    Qr(String),
    /// The connection opened. `identity` is `None` when the account is not linked yet.
    Open { identity: Option<Identity> },
    /// The connection closed.
    Close {
        status_code: Option<u16>,
        message: String,
    },
    /// Credential material changed and must be persisted.
    CredsUpdate {
        creds: Credentials,
        identity: Option<Identity>,
    },
    Messages {
        kind: UpsertKind,
        messages: Vec<InboundMessage>,
    },
}

/// Why a connection closed, as far as the lifecycle is concerned.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DisconnectReason {
    LoggedOut,
    QrExhausted,
    Transient,
}

impl DisconnectReason {
    pub fn classify(status_code: Option<u16>, message: &str) -> Self {
        if message.to_lowercase().contains(QR_EXHAUSTED_PATTERN) {
            DisconnectReason::QrExhausted
        } else if status_code == Some(LOGGED_OUT_STATUS) {
            DisconnectReason::LoggedOut
        } else {
            DisconnectReason::Transient
        }
    }

    /// Terminal reasons force a credential wipe instead of a reconnect.
    pub fn is_terminal(&self) -> bool {
        !matches!(self, DisconnectReason::Transient)
    }
}

/// Outbound operations on a live connection.
#[async_trait]
pub trait MessagingClient: Send + Sync {
    async fn send_text(&self, peer_id: &str, text: &str) -> Result<(), ClientError>;
    async fn logout(&self) -> Result<(), ClientError>;
    async fn end(&self);
}

/// A live connection: client handle plus its event stream.
pub struct Connection {
    pub client: Box<dyn MessagingClient>,
    pub events: mpsc::Receiver<ClientEvent>,
}

/// Opens connections for a named session.
#[async_trait]
pub trait Connector: Send + Sync {
    async fn connect(
        &self,
        agent: &str,
        credentials: Option<Credentials>,
    ) -> Result<Connection, ClientError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_classify_logged_out() {
        let r = DisconnectReason::classify(Some(401), "Connection Failure");
        assert_eq!(r, DisconnectReason::LoggedOut);
        assert!(r.is_terminal());
    }

    #[test]
    fn test_classify_qr_exhausted_wins_over_code() {
        let r = DisconnectReason::classify(Some(408), "QR refs attempts ended");
        assert_eq!(r, DisconnectReason::QrExhausted);
        assert!(r.is_terminal());
    }

    #[test]
    fn test_classify_transient() {
        assert_eq!(
            DisconnectReason::classify(Some(428), "Connection Closed"),
            DisconnectReason::Transient
        );
        assert_eq!(
            DisconnectReason::classify(None, "stream errored"),
            DisconnectReason::Transient
        );
    }

    #[test]
    fn test_inbound_message_deserializes_protocol_shape() {
        let raw = serde_json::json!({
            "key": { "remoteJid": "34600000000@s.whatsapp.net", "fromMe": false, "id": "ABC" },
            "pushName": "Ana",
            "messageTimestamp": 1_700_000_000,
            "message": { "conversation": "hola" }
        });
        let msg: InboundMessage = serde_json::from_value(raw).unwrap();
        assert_eq!(msg.key.remote_jid.as_deref(), Some("34600000000@s.whatsapp.net"));
        assert_eq!(msg.push_name.as_deref(), Some("Ana"));
        assert!(!msg.key.from_me);
    }
}
