//! Scripted collaborators for session tests.

use async_trait::async_trait;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::mpsc;

use crate::client::{
    ClientEvent, Connection, Connector, Credentials, InboundMessage, MessageKey, MessagingClient,
};
use crate::error::{ClientError, ResponderError};
use crate::responder::{ReplyRequest, Responder};
use crate::session::SessionHandle;
use crate::status::{SessionEvent, SessionStatus};

#[derive(Default)]
struct Shared {
    connects: AtomicU32,
    logouts: AtomicU32,
    sent: Mutex<Vec<(String, String)>>,
}

/// Connector whose connections are driven by the test.
///
/// Every successful `connect` hands the event sender of the new connection
/// to [`FakeConnector::next_connection`].
#[derive(Clone)]
pub struct FakeConnector {
    shared: Arc<Shared>,
    refuse: bool,
    opened_tx: mpsc::UnboundedSender<mpsc::Sender<ClientEvent>>,
    opened_rx: Arc<tokio::sync::Mutex<mpsc::UnboundedReceiver<mpsc::Sender<ClientEvent>>>>,
}

impl FakeConnector {
    pub fn new() -> Self {
        let (opened_tx, opened_rx) = mpsc::unbounded_channel();
        Self {
            shared: Arc::new(Shared::default()),
            refuse: false,
            opened_tx,
            opened_rx: Arc::new(tokio::sync::Mutex::new(opened_rx)),
        }
    }

    pub fn refusing() -> Self {
        Self {
            refuse: true,
            ..Self::new()
        }
    }

    pub async fn next_connection(&self) -> mpsc::Sender<ClientEvent> {
        let mut rx = self.opened_rx.lock().await;
        tokio::time::timeout(Duration::from_secs(5), rx.recv())
            .await
            .expect("timed out waiting for a connection")
            .expect("connector dropped")
    }

    pub fn connect_count(&self) -> u32 {
        self.shared.connects.load(Ordering::SeqCst)
    }

    pub fn logout_count(&self) -> u32 {
        self.shared.logouts.load(Ordering::SeqCst)
    }

    pub fn sent(&self) -> Vec<(String, String)> {
        self.shared.sent.lock().unwrap().clone()
    }
}

struct FakeClient {
    shared: Arc<Shared>,
}

#[async_trait]
impl MessagingClient for FakeClient {
    async fn send_text(&self, peer_id: &str, text: &str) -> Result<(), ClientError> {
        if peer_id.starts_with("0") {
            return Err(ClientError::Send("unreachable".into()));
        }
        self.shared
            .sent
            .lock()
            .unwrap()
            .push((peer_id.to_string(), text.to_string()));
        Ok(())
    }

    async fn logout(&self) -> Result<(), ClientError> {
        self.shared.logouts.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn end(&self) {}
}

#[async_trait]
impl Connector for FakeConnector {
    async fn connect(
        &self,
        _agent: &str,
        _credentials: Option<Credentials>,
    ) -> Result<Connection, ClientError> {
        self.shared.connects.fetch_add(1, Ordering::SeqCst);
        if self.refuse {
            return Err(ClientError::Connect("network unreachable".into()));
        }
        let (tx, rx) = mpsc::channel(16);
        let _ = self.opened_tx.send(tx);
        Ok(Connection {
            client: Box::new(FakeClient {
                shared: self.shared.clone(),
            }),
            events: rx,
        })
    }
}

pub struct FakeResponder {
    reply: Option<String>,
}

impl FakeResponder {
    pub fn reply(text: &str) -> Self {
        Self {
            reply: Some(text.to_string()),
        }
    }

    pub fn failing() -> Self {
        Self { reply: None }
    }
}

#[async_trait]
impl Responder for FakeResponder {
    async fn get_reply(&self, _request: &ReplyRequest) -> Result<String, ResponderError> {
        self.reply
            .clone()
            .ok_or_else(|| ResponderError::Protocol("missing text".into()))
    }
}

pub fn inbound_text(peer: &str, text: &str) -> InboundMessage {
    InboundMessage {
        key: MessageKey {
            remote_jid: Some(peer.to_string()),
            from_me: false,
            id: Some("ABC".into()),
            participant: None,
        },
        push_name: Some("Ana".into()),
        message_timestamp: Some(1_700_000_000),
        message: Some(serde_json::json!({ "conversation": text })),
    }
}

pub async fn wait_for_status(handle: &SessionHandle, status: SessionStatus) {
    let mut sub = handle.subscribe();
    let wait = async {
        while let Some(event) = sub.recv().await {
            if let SessionEvent::Update(snap) = event
                && snap.connection_status == status
            {
                return;
            }
        }
    };
    tokio::time::timeout(Duration::from_secs(5), wait)
        .await
        .unwrap_or_else(|_| panic!("timed out waiting for {}", status));
}
