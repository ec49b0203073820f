use async_trait::async_trait;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::mpsc;

use wa_session::{
    AuthStore, AutoReplySettings, BatchSender, BatchSettings, ClientError, ClientEvent, Connection,
    Connector, Credentials, EventLog, Identity, MessagingClient, ReconnectPolicy, ReplyRequest,
    Responder, ResponderError, SessionContext, SessionHandle, SessionManager, SessionStatus,
    SessionTimings,
};

use crate::AppState;
use crate::config::{FileConfig, RelayPaths, SseConfig};
use crate::metrics::RelayMetrics;

/// Connector whose connections either link straight away or sit on a QR.
pub struct ScriptedConnector {
    linked: bool,
    sent: Arc<Mutex<Vec<(String, String)>>>,
    // Keeps event streams open for the lifetime of the test.
    streams: Mutex<Vec<mpsc::Sender<ClientEvent>>>,
}

impl ScriptedConnector {
    pub fn new(linked: bool) -> Self {
        Self {
            linked,
            sent: Arc::new(Mutex::new(Vec::new())),
            streams: Mutex::new(Vec::new()),
        }
    }

    pub fn sent(&self) -> Vec<(String, String)> {
        self.sent.lock().unwrap().clone()
    }
}

#[async_trait]
impl Connector for ScriptedConnector {
    async fn connect(
        &self,
        _agent: &str,
        _credentials: Option<Credentials>,
    ) -> Result<Connection, ClientError> {
        let (tx, rx) = mpsc::channel(16);
        let first = if self.linked {
            ClientEvent::Open {
                identity: Some(Identity {
                    id: "34611111111@s.whatsapp.net".into(),
                    name: Some("Relay".into()),
                }),
            }
        } else {
            ClientEvent::Qr("2@scripted-login".into())
        };
        tx.try_send(first).unwrap();
        self.streams.lock().unwrap().push(tx);
        Ok(Connection {
            client: Box::new(ScriptedClient {
                sent: self.sent.clone(),
            }),
            events: rx,
        })
    }
}

struct ScriptedClient {
    sent: Arc<Mutex<Vec<(String, String)>>>,
}

#[async_trait]
impl MessagingClient for ScriptedClient {
    async fn send_text(&self, peer_id: &str, text: &str) -> Result<(), ClientError> {
        self.sent
            .lock()
            .unwrap()
            .push((peer_id.to_string(), text.to_string()));
        Ok(())
    }

    async fn logout(&self) -> Result<(), ClientError> {
        Ok(())
    }

    async fn end(&self) {}
}

pub struct CannedResponder(pub &'static str);

#[async_trait]
impl Responder for CannedResponder {
    async fn get_reply(&self, _request: &ReplyRequest) -> Result<String, ResponderError> {
        Ok(self.0.to_string())
    }
}

/// Build a fully-wired `AppState` over a temp data dir.
///
/// Sessions link as soon as they connect. Callers **must** hold the
/// `TempDir` for the lifetime of the test.
pub async fn test_app_state() -> (AppState, tempfile::TempDir) {
    test_app_state_with(Arc::new(ScriptedConnector::new(true))).await
}

/// Like `test_app_state`, but sessions stay on the QR screen.
pub async fn test_app_state_unlinked() -> (AppState, tempfile::TempDir) {
    test_app_state_with(Arc::new(ScriptedConnector::new(false))).await
}

pub async fn test_app_state_with(connector: Arc<dyn Connector>) -> (AppState, tempfile::TempDir) {
    let tmp = tempfile::tempdir().expect("tempdir");
    let paths = RelayPaths::new(Some(tmp.path().to_path_buf())).expect("paths");
    let file_config = FileConfig::default();

    let log = Arc::new(EventLog::open(&paths.events_path).await.expect("event log"));
    let ctx = SessionContext {
        connector,
        auth: AuthStore::new(&paths.auth_dir),
        log: log.clone(),
        responder: Arc::new(CannedResponder("auto reply")),
        timings: SessionTimings {
            reconnect: ReconnectPolicy {
                delay: Duration::from_millis(10),
                ..Default::default()
            },
            teardown_grace: Duration::from_millis(5),
        },
    };
    let batch = BatchSender::new(
        BatchSettings {
            rate: Duration::ZERO,
            ..Default::default()
        },
        log.clone(),
    );

    let state = AppState {
        manager: Arc::new(
            SessionManager::new(ctx, AutoReplySettings::default())
                .with_max_sessions(file_config.sessions.session_limit()),
        ),
        log,
        batch: Arc::new(batch),
        metrics: Arc::new(RelayMetrics::new()),
        sse: Arc::new(SseConfig::from_file(&file_config.sse)),
        send_config: Arc::new(file_config.send),
    };

    (state, tmp)
}

/// Wait (bounded) until the session publishes `status`.
pub async fn wait_for_status(handle: &SessionHandle, status: SessionStatus) {
    let mut sub = handle.subscribe();
    tokio::time::timeout(Duration::from_secs(5), async {
        while let Some(event) = sub.recv().await {
            if let wa_session::SessionEvent::Update(snapshot) = event
                && snapshot.connection_status == status
            {
                return;
            }
        }
    })
    .await
    .expect("status not reached in time");
}
