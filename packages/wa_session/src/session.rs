//! One actor task per messaging session.
//!
//! The actor is the only owner of the client connection and the lifecycle
//! state. Protocol events, reconnect timers and commands from
//! [`SessionHandle`]s are processed one at a time on the same task, so
//! inbound handling, auto-replies and their log entries never interleave
//! within a session.

use std::collections::HashSet;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use crate::auth_store::{AuthStore, WipeOutcome};
use crate::client::{ClientEvent, Connector, InboundMessage, MessagingClient, UpsertKind};
use crate::error::SessionError;
use crate::event_log::{EventLog, EventRecord, SendSource};
use crate::machine::SessionState;
use crate::notifier::{Notifier, Subscription};
use crate::phone::{is_group, number_to_peer, peer_to_number};
use crate::qr::render_data_url;
use crate::responder::{ReplyRequest, Responder};
use crate::status::{MessageNotice, SessionEvent, SessionSnapshot, SessionStatus};
use crate::summary::summarize;

const COMMAND_CAPACITY: usize = 32;

/// Delay schedule between reconnect attempts.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ReconnectPolicy {
    pub delay: Duration,
    /// Growth factor per consecutive failure. `1.0` keeps the delay fixed.
    pub multiplier: f64,
    pub max_delay: Duration,
    /// `None` retries forever.
    pub max_attempts: Option<u32>,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            delay: Duration::from_millis(750),
            multiplier: 1.0,
            max_delay: Duration::from_secs(30),
            max_attempts: None,
        }
    }
}

impl ReconnectPolicy {
    /// Delay before the `attempt`-th consecutive reconnect (1-based), or
    /// `None` once the attempt budget is spent.
    pub fn delay_for(&self, attempt: u32) -> Option<Duration> {
        if let Some(max) = self.max_attempts
            && attempt > max
        {
            return None;
        }
        let exponent = attempt.saturating_sub(1).min(64) as i32;
        let factor = self.multiplier.max(1.0).powi(exponent);
        let delay = self.delay.mul_f64(factor.min(1e6));
        Some(delay.min(self.max_delay.max(self.delay)))
    }
}

#[derive(Debug, Clone, Copy)]
pub struct SessionTimings {
    pub reconnect: ReconnectPolicy,
    /// Pause between closing the client and wiping credentials.
    pub teardown_grace: Duration,
}

impl Default for SessionTimings {
    fn default() -> Self {
        Self {
            reconnect: ReconnectPolicy::default(),
            teardown_grace: Duration::from_millis(600),
        }
    }
}

/// Which inbound senders get an automatic reply.
#[derive(Debug, Clone, Default)]
pub struct AutoReplyPolicy {
    pub enabled: bool,
    /// Empty means everyone.
    pub whitelist: HashSet<String>,
}

impl AutoReplyPolicy {
    pub fn allows(&self, number: &str) -> bool {
        self.enabled && (self.whitelist.is_empty() || self.whitelist.contains(number))
    }
}

/// Collaborators shared by every session.
#[derive(Clone)]
pub struct SessionContext {
    pub connector: Arc<dyn Connector>,
    pub auth: AuthStore,
    pub log: Arc<EventLog>,
    pub responder: Arc<dyn Responder>,
    pub timings: SessionTimings,
}

#[derive(Debug, Clone)]
pub struct OutboundRequest {
    pub to: String,
    pub text: String,
    pub template: Option<String>,
    pub source: SendSource,
}

#[derive(Debug)]
pub enum SessionCommand {
    Send {
        request: OutboundRequest,
        respond_to: oneshot::Sender<Result<String, SessionError>>,
    },
    Logout {
        respond_to: oneshot::Sender<Result<WipeOutcome, SessionError>>,
    },
    Shutdown {
        respond_to: oneshot::Sender<()>,
    },
}

/// Last published snapshot plus the subscribers that saw it.
///
/// Publishing and subscribing both happen under the snapshot lock, so a new
/// subscriber never misses an update that raced its registration.
struct Published {
    snapshot: Mutex<SessionSnapshot>,
    notifier: Notifier<SessionEvent>,
}

impl Published {
    fn update(&self, snapshot: SessionSnapshot) {
        let mut current = self.snapshot.lock().unwrap_or_else(PoisonError::into_inner);
        *current = snapshot.clone();
        let delivery = self.notifier.broadcast(SessionEvent::Update(snapshot));
        if delivery.failed > 0 {
            debug!("{} status subscriber(s) lagging", delivery.failed);
        }
    }

    fn message(&self, notice: MessageNotice) {
        let _guard = self.snapshot.lock().unwrap_or_else(PoisonError::into_inner);
        self.notifier.broadcast(SessionEvent::Message(notice));
    }

    fn subscribe(&self) -> Subscription<SessionEvent> {
        let current = self.snapshot.lock().unwrap_or_else(PoisonError::into_inner);
        self.notifier.subscribe(SessionEvent::Update(current.clone()))
    }

    fn current(&self) -> SessionSnapshot {
        self.snapshot
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

/// Handle to communicate with a session actor
#[derive(Clone)]
pub struct SessionHandle {
    agent: String,
    sender: mpsc::Sender<SessionCommand>,
    published: Arc<Published>,
}

impl SessionHandle {
    pub fn agent(&self) -> &str {
        &self.agent
    }

    /// Most recently published state. Does not round-trip through the actor.
    pub fn snapshot(&self) -> SessionSnapshot {
        self.published.current()
    }

    pub fn is_connected(&self) -> bool {
        self.snapshot().connection_status == SessionStatus::Connected
    }

    /// Subscribe to status and message events. The first event is always
    /// the current snapshot.
    pub fn subscribe(&self) -> Subscription<SessionEvent> {
        self.published.subscribe()
    }

    pub fn subscriber_count(&self) -> usize {
        self.published.notifier.subscriber_count()
    }

    /// Send a text message. Returns the resolved peer id.
    pub async fn send(&self, request: OutboundRequest) -> Result<String, SessionError> {
        let (tx, rx) = oneshot::channel();
        self.sender
            .send(SessionCommand::Send {
                request,
                respond_to: tx,
            })
            .await
            .map_err(|_| SessionError::ActorGone)?;
        rx.await.map_err(|_| SessionError::ActorGone)?
    }

    /// Log out, wipe credentials and start over with a fresh login.
    pub async fn logout(&self) -> Result<WipeOutcome, SessionError> {
        let (tx, rx) = oneshot::channel();
        self.sender
            .send(SessionCommand::Logout { respond_to: tx })
            .await
            .map_err(|_| SessionError::ActorGone)?;
        rx.await.map_err(|_| SessionError::ActorGone)?
    }

    pub async fn shutdown(&self) {
        let (tx, rx) = oneshot::channel();
        if self
            .sender
            .send(SessionCommand::Shutdown { respond_to: tx })
            .await
            .is_ok()
        {
            let _ = rx.await;
        }
    }
}

struct SessionActor {
    state: SessionState,
    ctx: SessionContext,
    auto_reply: AutoReplyPolicy,
    published: Arc<Published>,
    receiver: mpsc::Receiver<SessionCommand>,
    client: Option<Box<dyn MessagingClient>>,
    events: Option<mpsc::Receiver<ClientEvent>>,
    reconnect_at: Option<Instant>,
    attempts: u32,
}

/// Start the actor for `agent` and return its handle.
pub fn spawn_session(
    agent: impl Into<String>,
    ctx: SessionContext,
    auto_reply: AutoReplyPolicy,
) -> SessionHandle {
    let agent = agent.into();
    let state = SessionState::new(agent.clone());
    let published = Arc::new(Published {
        snapshot: Mutex::new(state.snapshot()),
        notifier: Notifier::new(),
    });
    let (sender, receiver) = mpsc::channel(COMMAND_CAPACITY);

    let actor = SessionActor {
        state,
        ctx,
        auto_reply,
        published: published.clone(),
        receiver,
        client: None,
        events: None,
        reconnect_at: None,
        attempts: 0,
    };
    tokio::spawn(actor.run());

    SessionHandle {
        agent,
        sender,
        published,
    }
}

async fn recv_event(events: &mut Option<mpsc::Receiver<ClientEvent>>) -> Option<ClientEvent> {
    match events {
        Some(rx) => rx.recv().await,
        None => std::future::pending().await,
    }
}

async fn sleep_until(deadline: Option<Instant>) {
    match deadline {
        Some(at) => tokio::time::sleep_until(at).await,
        None => std::future::pending().await,
    }
}

impl SessionActor {
    fn agent(&self) -> &str {
        self.state.agent()
    }

    fn publish(&self) {
        self.published.update(self.state.snapshot());
    }

    async fn run(mut self) {
        info!("Session '{}' started", self.agent());
        self.connect().await;

        loop {
            tokio::select! {
                cmd = self.receiver.recv() => match cmd {
                    Some(SessionCommand::Shutdown { respond_to }) => {
                        self.close_client().await;
                        let _ = respond_to.send(());
                        break;
                    }
                    Some(cmd) => self.handle_command(cmd).await,
                    None => {
                        self.close_client().await;
                        break;
                    }
                },
                event = recv_event(&mut self.events) => match event {
                    Some(event) => self.handle_client_event(event).await,
                    None => {
                        self.events = None;
                        self.on_close(None, "connection stream ended").await;
                    }
                },
                _ = sleep_until(self.reconnect_at) => {
                    self.reconnect_at = None;
                    info!("Session '{}' reconnecting (attempt {})", self.agent(), self.attempts);
                    self.connect().await;
                }
            }
        }

        info!("Session '{}' stopped", self.agent());
    }

    async fn handle_command(&mut self, cmd: SessionCommand) {
        match cmd {
            SessionCommand::Send {
                request,
                respond_to,
            } => {
                let result = self.send(request).await;
                let _ = respond_to.send(result);
            }
            SessionCommand::Logout { respond_to } => {
                info!("Logout requested for session '{}'", self.agent());
                let client = self.client.take();
                let result = self.teardown(client).await;
                let _ = respond_to.send(result);
            }
            SessionCommand::Shutdown { respond_to } => {
                let _ = respond_to.send(());
            }
        }
    }

    async fn connect(&mut self) {
        let agent = self.agent().to_string();
        if let Err(e) = self.ctx.auth.ensure(&agent).await {
            warn!("Could not create auth dir for '{}': {}", agent, e);
        }
        let credentials = self.ctx.auth.load(&agent).await;
        debug!(
            "Connecting session '{}' ({} stored credentials)",
            agent,
            if credentials.is_some() { "with" } else { "without" }
        );

        match self.ctx.connector.connect(&agent, credentials).await {
            Ok(connection) => {
                self.client = Some(connection.client);
                self.events = Some(connection.events);
            }
            Err(e) => {
                warn!("Session '{}' failed to connect: {}", agent, e);
                self.state.connect_failed(e.to_string());
                self.publish();
                self.schedule_reconnect();
            }
        }
    }

    fn schedule_reconnect(&mut self) {
        self.attempts += 1;
        match self.ctx.timings.reconnect.delay_for(self.attempts) {
            Some(delay) => {
                debug!(
                    "Session '{}' will reconnect in {:?}",
                    self.agent(),
                    delay
                );
                self.reconnect_at = Some(Instant::now() + delay);
            }
            None => {
                warn!(
                    "Session '{}' giving up after {} reconnect attempts",
                    self.agent(),
                    self.attempts - 1
                );
                self.reconnect_at = None;
                self.state.reconnect_exhausted();
                self.publish();
            }
        }
    }

    async fn close_client(&mut self) {
        self.events = None;
        self.reconnect_at = None;
        if let Some(client) = self.client.take() {
            client.end().await;
        }
    }

    async fn handle_client_event(&mut self, event: ClientEvent) {
        match event {
            ClientEvent::Qr(raw) => match render_data_url(&raw) {
                Ok(image) => {
                    if self.state.on_qr(image) {
                        info!("Session '{}' waiting for QR scan", self.agent());
                        self.publish();
                    }
                }
                Err(e) => warn!("Could not render QR for '{}': {}", self.agent(), e),
            },
            ClientEvent::Open { identity } => {
                self.state.on_open(identity);
                if self.state.is_connected() {
                    self.attempts = 0;
                    info!(
                        "Session '{}' connected as {:?}",
                        self.agent(),
                        self.state.identity().map(|i| i.id.as_str())
                    );
                } else {
                    info!("Session '{}' open but not linked yet", self.agent());
                }
                self.publish();
            }
            ClientEvent::Close {
                status_code,
                message,
            } => {
                self.on_close(status_code, &message).await;
            }
            ClientEvent::CredsUpdate { creds, identity } => {
                let agent = self.agent().to_string();
                if let Err(e) = self.ctx.auth.save(&agent, &creds).await {
                    warn!("Could not persist credentials for '{}': {}", agent, e);
                }
                if self.state.on_creds(identity) {
                    if self.state.is_connected() {
                        self.attempts = 0;
                    }
                    self.publish();
                }
            }
            ClientEvent::Messages { kind, messages } => {
                if kind != UpsertKind::Notify {
                    debug!("Ignoring {:?} upsert of {} message(s)", kind, messages.len());
                    return;
                }
                for message in messages {
                    self.handle_inbound(message).await;
                }
            }
        }
    }

    async fn on_close(&mut self, status_code: Option<u16>, message: &str) {
        self.events = None;
        let client = self.client.take();
        let reason = self.state.on_close(status_code, message);
        self.publish();

        if reason.is_terminal() {
            warn!(
                "Session '{}' closed with {:?} ({}), wiping credentials",
                self.agent(),
                reason,
                message
            );
            if let Err(e) = self.teardown(client).await {
                error!("Session '{}' teardown failed: {}", self.agent(), e);
            }
        } else {
            info!(
                "Session '{}' disconnected (code {:?}): {}",
                self.agent(),
                status_code,
                message
            );
            if let Some(client) = client {
                client.end().await;
            }
            self.schedule_reconnect();
        }
    }

    /// Close the client, wipe credentials and reconnect for a fresh login.
    async fn teardown(
        &mut self,
        client: Option<Box<dyn MessagingClient>>,
    ) -> Result<WipeOutcome, SessionError> {
        let agent = self.agent().to_string();
        self.state.begin_logout();
        self.publish();
        self.events = None;
        self.reconnect_at = None;

        if let Some(client) = client {
            if let Err(e) = client.logout().await {
                debug!("Logout call for '{}' failed: {}", agent, e);
            }
            client.end().await;
        }

        tokio::time::sleep(self.ctx.timings.teardown_grace).await;

        match self.ctx.auth.wipe(&agent).await {
            Ok(outcome) => {
                if let Err(e) = self.ctx.auth.ensure(&agent).await {
                    warn!("Could not recreate auth dir for '{}': {}", agent, e);
                }
                self.state.logged_out();
                self.publish();
                self.attempts = 0;
                self.state.restart();
                self.publish();
                self.connect().await;
                Ok(outcome)
            }
            Err(e) => {
                error!("Could not wipe credentials for '{}': {}", agent, e);
                self.state.teardown_failed(e.to_string());
                self.publish();
                Err(e)
            }
        }
    }

    async fn send(&mut self, request: OutboundRequest) -> Result<String, SessionError> {
        if !self.state.is_connected() {
            return Err(SessionError::NotConnected);
        }
        let agent = self.agent().to_string();

        let Some(peer) = number_to_peer(&request.to) else {
            let err = SessionError::InvalidRecipient(request.to.clone());
            self.ctx
                .log
                .append(
                    &EventRecord::send_failed(
                        &agent,
                        Some(&request.to),
                        Some(&request.text),
                        request.source,
                        err.to_string(),
                    )
                    .with_template(request.template),
                )
                .await;
            return Err(err);
        };
        let Some(client) = self.client.as_ref() else {
            return Err(SessionError::NotConnected);
        };

        let number = peer_to_number(&peer).to_string();
        let result = client.send_text(&peer, &request.text).await;
        let record = match &result {
            Ok(()) => EventRecord::sent(&agent, &number, &request.text, request.source),
            Err(e) => {
                warn!("Send to {} failed: {}", peer, e);
                EventRecord::send_failed(
                    &agent,
                    Some(&number),
                    Some(&request.text),
                    request.source,
                    e.to_string(),
                )
            }
        };
        self.ctx
            .log
            .append(&record.with_template(request.template))
            .await;
        result.map(|()| peer).map_err(SessionError::from)
    }

    async fn handle_inbound(&mut self, message: InboundMessage) {
        if message.key.from_me || message.message.is_none() {
            return;
        }
        let Some(peer) = message.key.remote_jid.clone() else {
            return;
        };
        let summary = summarize(&message);

        if is_group(&peer) {
            info!("Ignoring group message in {}", peer);
            self.published.message(MessageNotice {
                is_group: true,
                number: Some(summary.from.number).filter(|n| !n.is_empty()),
                group_id: summary.group_id,
                text: summary.text,
            });
            return;
        }

        let agent = self.agent().to_string();
        let number = peer_to_number(&peer).to_string();
        info!("Message from {} on '{}' ({})", number, agent, summary.msg_type);

        self.ctx
            .log
            .append(&EventRecord::inbound(
                &agent,
                &number,
                summary.from.name.clone(),
                &summary.text,
                &summary.msg_type,
            ))
            .await;
        self.published.message(MessageNotice {
            is_group: false,
            number: Some(number.clone()),
            group_id: None,
            text: summary.text.clone(),
        });

        if summary.text.trim().is_empty() || !self.auto_reply.allows(&number) {
            return;
        }

        let request = ReplyRequest {
            from_number: number.clone(),
            text: summary.text,
            peer_id: peer.clone(),
        };
        match self.ctx.responder.get_reply(&request).await {
            Ok(reply) => {
                let outbound = OutboundRequest {
                    to: peer,
                    text: reply,
                    template: None,
                    source: SendSource::Auto,
                };
                if let Err(e) = self.send(outbound).await {
                    warn!("Auto-reply to {} failed: {}", number, e);
                }
            }
            Err(e) => {
                warn!("No auto-reply for {}: {}", number, e);
                self.ctx
                    .log
                    .append(&EventRecord::send_failed(
                        &agent,
                        Some(&number),
                        None,
                        SendSource::Auto,
                        SessionError::from(e).to_string(),
                    ))
                    .await;
            }
        }
    }
}
