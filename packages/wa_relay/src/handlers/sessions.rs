use axum::{
    Json,
    extract::{Query, State},
    http::{StatusCode, header},
    response::IntoResponse,
};
use tracing::{info, warn};

use wa_session::auth_store::validate_agent_id;

use crate::AppState;
use crate::handlers::{AgentQuery, ApiError, DEFAULT_AGENT, api_error, resolve_session, session_status_code};
use crate::sse::push_response;

/// `GET /qr-events?agent=` - status stream for one session.
pub async fn qr_events(
    State(state): State<AppState>,
    Query(query): Query<AgentQuery>,
) -> Result<impl IntoResponse, ApiError> {
    let handle = resolve_session(&state, query.agent(), "msg").await?;
    Ok(push_response(
        handle.subscribe(),
        &state.sse,
        state.metrics.clone(),
    ))
}

/// `POST /logout?agent=` - log out, wipe credentials and start a fresh login.
pub async fn logout(
    State(state): State<AppState>,
    Query(query): Query<AgentQuery>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let handle = resolve_session(&state, query.agent(), "msg").await?;
    match handle.logout().await {
        Ok(outcome) => {
            state.metrics.logout_result(true);
            info!(
                "Logged out '{}' ({})",
                handle.agent(),
                outcome.strategy.as_str()
            );
            Ok(Json(serde_json::json!({
                "ok": true,
                "msg": "Session closed. Generating new QR...",
                "removed": true,
                "strategy": outcome.strategy,
                "authPath": outcome.path,
            })))
        }
        Err(e) => {
            state.metrics.logout_result(false);
            warn!("Logout of '{}' failed: {}", handle.agent(), e);
            Err(api_error(session_status_code(&e), "msg", e.to_string()))
        }
    }
}

/// `GET /auth-path?agent=` - where the credentials live and what is there.
pub async fn auth_path(
    State(state): State<AppState>,
    Query(query): Query<AgentQuery>,
) -> Result<impl IntoResponse, ApiError> {
    let agent = query.agent();
    validate_agent_id(agent)
        .map_err(|e| api_error(StatusCode::BAD_REQUEST, "msg", e.to_string()))?;
    Ok(Json(state.manager.context().auth.describe(agent).await))
}

/// `GET /` - dashboard when the default session is linked, QR page otherwise.
pub async fn root_redirect(State(state): State<AppState>) -> impl IntoResponse {
    let connected = match state.manager.get(DEFAULT_AGENT).await {
        Some(handle) => handle.is_connected(),
        None => false,
    };
    let target = if connected { "/dashboard.html" } else { "/qr.html" };
    (StatusCode::FOUND, [(header::LOCATION, target)])
}
