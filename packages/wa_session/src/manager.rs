use std::collections::{HashMap, HashSet};
use tokio::sync::RwLock;
use tracing::{info, warn};

use crate::auth_store::validate_agent_id;
use crate::error::SessionError;
use crate::session::{AutoReplyPolicy, SessionContext, SessionHandle, spawn_session};
use crate::status::SessionSnapshot;

/// Auto-reply settings for all sessions.
#[derive(Debug, Clone, Default)]
pub struct AutoReplySettings {
    pub enabled: bool,
    /// Per-agent whitelists. Agents without an entry reply to everyone.
    pub whitelists: HashMap<String, HashSet<String>>,
}

impl AutoReplySettings {
    pub fn policy_for(&self, agent: &str) -> AutoReplyPolicy {
        AutoReplyPolicy {
            enabled: self.enabled,
            whitelist: self.whitelists.get(agent).cloned().unwrap_or_default(),
        }
    }
}

/// Registry of running sessions, started lazily on first reference.
pub struct SessionManager {
    ctx: SessionContext,
    auto_reply: AutoReplySettings,
    max_sessions: Option<usize>,
    sessions: RwLock<HashMap<String, SessionHandle>>,
}

impl SessionManager {
    pub fn new(ctx: SessionContext, auto_reply: AutoReplySettings) -> Self {
        Self {
            ctx,
            auto_reply,
            max_sessions: None,
            sessions: RwLock::new(HashMap::new()),
        }
    }

    /// Refuse to start more than `max` sessions. Running ones stay reachable.
    pub fn with_max_sessions(mut self, max: usize) -> Self {
        self.max_sessions = Some(max);
        self
    }

    pub fn context(&self) -> &SessionContext {
        &self.ctx
    }

    /// Handle for `agent`, starting its session if this is the first reference.
    pub async fn get_or_start(&self, agent: &str) -> Result<SessionHandle, SessionError> {
        validate_agent_id(agent)?;
        if let Some(handle) = self.sessions.read().await.get(agent) {
            return Ok(handle.clone());
        }

        let mut sessions = self.sessions.write().await;
        // Someone may have started it while we waited for the write lock.
        if let Some(handle) = sessions.get(agent) {
            return Ok(handle.clone());
        }
        if let Some(max) = self.max_sessions {
            if sessions.len() >= max {
                warn!("Not starting session '{}': {} sessions running", agent, sessions.len());
                return Err(SessionError::SessionLimit(max));
            }
        }
        info!("Starting session '{}'", agent);
        let handle = spawn_session(agent, self.ctx.clone(), self.auto_reply.policy_for(agent));
        sessions.insert(agent.to_string(), handle.clone());
        Ok(handle)
    }

    /// Handle for an already running session.
    pub async fn get(&self, agent: &str) -> Option<SessionHandle> {
        self.sessions.read().await.get(agent).cloned()
    }

    /// Snapshots of every running session, ordered by agent id.
    pub async fn snapshots(&self) -> Vec<SessionSnapshot> {
        let mut out: Vec<SessionSnapshot> = self
            .sessions
            .read()
            .await
            .values()
            .map(SessionHandle::snapshot)
            .collect();
        out.sort_by(|a, b| a.agent.cmp(&b.agent));
        out
    }

    pub async fn shutdown_all(&self) {
        let handles: Vec<SessionHandle> = self.sessions.write().await.drain().map(|(_, h)| h).collect();
        for handle in handles {
            handle.shutdown().await;
        }
    }
}
