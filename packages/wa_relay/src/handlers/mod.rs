pub mod events;
pub mod health;
pub mod send;
pub mod sessions;

use axum::{Json, http::StatusCode};
use serde::Deserialize;
use wa_session::{SessionError, SessionHandle};

use crate::AppState;

// Re-export all handlers for easy route registration
pub use events::{clear_events, events_csv, events_stream, list_events, stats};
pub use health::{health_handler, metrics_handler};
pub use send::{send_batch, send_batch_demo, send_test};
pub use sessions::{auth_path, logout, qr_events, root_redirect};

pub const DEFAULT_AGENT: &str = "default";

/// `?agent=` selector shared by the session-scoped routes.
#[derive(Debug, Default, Deserialize)]
pub struct AgentQuery {
    #[serde(default)]
    pub agent: Option<String>,
}

impl AgentQuery {
    pub fn agent(&self) -> &str {
        self.agent
            .as_deref()
            .map(str::trim)
            .filter(|a| !a.is_empty())
            .unwrap_or(DEFAULT_AGENT)
    }
}

pub type ApiError = (StatusCode, Json<serde_json::Value>);

/// `{ "ok": false, <key>: message }`
pub fn api_error(status: StatusCode, key: &str, message: impl Into<String>) -> ApiError {
    let mut body = serde_json::Map::new();
    body.insert("ok".into(), false.into());
    body.insert(key.into(), serde_json::Value::String(message.into()));
    (status, Json(serde_json::Value::Object(body)))
}

pub fn session_status_code(err: &SessionError) -> StatusCode {
    match err {
        SessionError::NotConnected | SessionError::SessionLimit(_) => {
            StatusCode::SERVICE_UNAVAILABLE
        }
        SessionError::InvalidRecipient(_) | SessionError::InvalidAgentId(_) => {
            StatusCode::BAD_REQUEST
        }
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

/// Look up or lazily start the session named by the query.
pub async fn resolve_session(state: &AppState, agent: &str, key: &str) -> Result<SessionHandle, ApiError> {
    state
        .manager
        .get_or_start(agent)
        .await
        .map_err(|e| api_error(session_status_code(&e), key, e.to_string()))
}
