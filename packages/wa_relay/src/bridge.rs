//! Connector that reaches the messaging protocol library through a
//! WebSocket sidecar.
//!
//! Every session opens its own socket. Frames are JSON objects tagged by
//! `type`. The relay sends `hello`, `send` and `logout`; the sidecar answers
//! with `qr`, `open`, `close`, `creds`, `messages.upsert` and `sent`. Sends
//! carry a `ref` that the matching `sent` frame echoes back.

use async_trait::async_trait;
use futures::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio_tungstenite::tungstenite;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use wa_session::client::{InboundMessage, UpsertKind};
use wa_session::{ClientError, ClientEvent, Connection, Connector, Credentials, Identity, MessagingClient};

const SEND_TIMEOUT: Duration = Duration::from_secs(30);
const FRAME_CAPACITY: usize = 64;

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "lowercase")]
enum OutFrame {
    Hello {
        agent: String,
        creds: Option<Credentials>,
    },
    Send {
        #[serde(rename = "ref")]
        reference: u64,
        to: String,
        text: String,
    },
    Logout,
}

#[derive(Debug, Deserialize)]
#[serde(tag = "type")]
enum InFrame {
    #[serde(rename = "qr")]
    Qr { qr: String },
    #[serde(rename = "open")]
    Open {
        #[serde(default)]
        me: Option<Identity>,
    },
    #[serde(rename = "close")]
    Close {
        #[serde(default, rename = "statusCode")]
        status_code: Option<u16>,
        #[serde(default)]
        message: String,
    },
    #[serde(rename = "creds")]
    Creds {
        creds: Credentials,
        #[serde(default)]
        me: Option<Identity>,
    },
    #[serde(rename = "messages.upsert")]
    Upsert {
        kind: UpsertKind,
        #[serde(default)]
        messages: Vec<InboundMessage>,
    },
    #[serde(rename = "sent")]
    Sent {
        #[serde(rename = "ref")]
        reference: u64,
        ok: bool,
        #[serde(default)]
        error: Option<String>,
    },
}

type Pending = Arc<Mutex<HashMap<u64, oneshot::Sender<Result<(), ClientError>>>>>;

pub struct WsConnector {
    url: String,
}

impl WsConnector {
    pub fn new(url: impl Into<String>) -> Self {
        Self { url: url.into() }
    }
}

#[async_trait]
impl Connector for WsConnector {
    async fn connect(
        &self,
        agent: &str,
        credentials: Option<Credentials>,
    ) -> Result<Connection, ClientError> {
        let (ws_stream, _) = tokio_tungstenite::connect_async(&self.url)
            .await
            .map_err(|e| ClientError::Connect(format!("{}: {}", self.url, e)))?;
        let (mut ws_write, mut ws_read) = ws_stream.split();
        debug!("Bridge socket open for '{}'", agent);

        let cancel = CancellationToken::new();
        let pending: Pending = Arc::new(Mutex::new(HashMap::new()));
        let (out_tx, mut out_rx) = mpsc::channel::<OutFrame>(FRAME_CAPACITY);
        let (events_tx, events_rx) = mpsc::channel::<ClientEvent>(FRAME_CAPACITY);
        // The reader never waits on the session, so `sent` acks keep flowing
        // while it is busy. The forwarder applies backpressure instead.
        let (inbound_tx, mut inbound_rx) = mpsc::unbounded_channel::<ClientEvent>();

        out_tx
            .send(OutFrame::Hello {
                agent: agent.to_string(),
                creds: credentials,
            })
            .await
            .map_err(|_| ClientError::Closed)?;

        // Writer
        let writer_cancel = cancel.clone();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = writer_cancel.cancelled() => break,
                    frame = out_rx.recv() => {
                        let Some(frame) = frame else { break };
                        let json = match serde_json::to_string(&frame) {
                            Ok(json) => json,
                            Err(e) => {
                                warn!("Could not encode bridge frame: {}", e);
                                continue;
                            }
                        };
                        if ws_write.send(tungstenite::Message::Text(json.into())).await.is_err() {
                            break;
                        }
                    }
                }
            }
            let _ = ws_write.close().await;
        });

        // Forwarder
        tokio::spawn(async move {
            while let Some(event) = inbound_rx.recv().await {
                if events_tx.send(event).await.is_err() {
                    break;
                }
            }
        });

        // Reader
        let reader_cancel = cancel.clone();
        let reader_pending = pending.clone();
        let agent_name = agent.to_string();
        tokio::spawn(async move {
            let mut close_reported = false;
            loop {
                let msg = tokio::select! {
                    _ = reader_cancel.cancelled() => break,
                    msg = ws_read.next() => msg,
                };
                let text = match msg {
                    Some(Ok(tungstenite::Message::Text(text))) => text,
                    Some(Ok(tungstenite::Message::Close(_))) | Some(Err(_)) | None => break,
                    Some(Ok(_)) => continue,
                };
                let frame = match serde_json::from_str::<InFrame>(&text) {
                    Ok(frame) => frame,
                    Err(e) => {
                        warn!("Ignoring bad bridge frame for '{}': {}", agent_name, e);
                        continue;
                    }
                };
                let event = match frame {
                    InFrame::Sent {
                        reference,
                        ok,
                        error,
                    } => {
                        let waiter = reader_pending
                            .lock()
                            .unwrap_or_else(PoisonError::into_inner)
                            .remove(&reference);
                        if let Some(waiter) = waiter {
                            let result = if ok {
                                Ok(())
                            } else {
                                Err(ClientError::Send(
                                    error.unwrap_or_else(|| "send rejected".to_string()),
                                ))
                            };
                            let _ = waiter.send(result);
                        }
                        continue;
                    }
                    InFrame::Qr { qr } => ClientEvent::Qr(qr),
                    InFrame::Open { me } => ClientEvent::Open { identity: me },
                    InFrame::Close {
                        status_code,
                        message,
                    } => {
                        close_reported = true;
                        ClientEvent::Close {
                            status_code,
                            message,
                        }
                    }
                    InFrame::Creds { creds, me } => ClientEvent::CredsUpdate {
                        creds,
                        identity: me,
                    },
                    InFrame::Upsert { kind, messages } => ClientEvent::Messages { kind, messages },
                };
                if inbound_tx.send(event).is_err() {
                    break;
                }
            }

            let ended_locally = reader_cancel.is_cancelled();
            reader_cancel.cancel();
            let waiters: Vec<_> = reader_pending
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .drain()
                .map(|(_, w)| w)
                .collect();
            for waiter in waiters {
                let _ = waiter.send(Err(ClientError::Closed));
            }
            if !close_reported && !ended_locally {
                let _ = inbound_tx.send(ClientEvent::Close {
                    status_code: None,
                    message: "bridge connection lost".to_string(),
                });
            }
            debug!("Bridge reader for '{}' finished", agent_name);
        });

        Ok(Connection {
            client: Box::new(BridgeClient {
                out: out_tx,
                pending,
                next_ref: AtomicU64::new(1),
                cancel,
            }),
            events: events_rx,
        })
    }
}

struct BridgeClient {
    out: mpsc::Sender<OutFrame>,
    pending: Pending,
    next_ref: AtomicU64,
    cancel: CancellationToken,
}

impl BridgeClient {
    fn forget(&self, reference: u64) {
        self.pending
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&reference);
    }
}

#[async_trait]
impl MessagingClient for BridgeClient {
    async fn send_text(&self, peer_id: &str, text: &str) -> Result<(), ClientError> {
        if self.cancel.is_cancelled() {
            return Err(ClientError::Closed);
        }
        let reference = self.next_ref.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = oneshot::channel();
        self.pending
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(reference, tx);

        let frame = OutFrame::Send {
            reference,
            to: peer_id.to_string(),
            text: text.to_string(),
        };
        if self.out.send(frame).await.is_err() {
            self.forget(reference);
            return Err(ClientError::Closed);
        }

        tokio::select! {
            biased;
            ack = rx => ack.unwrap_or(Err(ClientError::Closed)),
            _ = self.cancel.cancelled() => {
                self.forget(reference);
                Err(ClientError::Closed)
            }
            _ = tokio::time::sleep(SEND_TIMEOUT) => {
                self.forget(reference);
                Err(ClientError::Send("no acknowledgement from bridge".to_string()))
            }
        }
    }

    async fn logout(&self) -> Result<(), ClientError> {
        self.out
            .send(OutFrame::Logout)
            .await
            .map_err(|_| ClientError::Closed)
    }

    async fn end(&self) {
        self.cancel.cancel();
    }
}

impl Drop for BridgeClient {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}
