use axum::{Json, extract::State, response::IntoResponse};
use serde::Serialize;
use std::collections::BTreeMap;

use wa_session::SessionStatus;

use crate::AppState;

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionHealth {
    pub status: SessionStatus,
    pub me_id: Option<String>,
    pub me_name: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct HealthStatus {
    pub ok: bool,
    pub states: BTreeMap<String, SessionHealth>,
}

/// Health check endpoint - one entry per running session
pub async fn health_handler(State(state): State<AppState>) -> impl IntoResponse {
    let states = state
        .manager
        .snapshots()
        .await
        .into_iter()
        .map(|s| {
            (
                s.agent,
                SessionHealth {
                    status: s.connection_status,
                    me_id: s.me_id,
                    me_name: s.me_name,
                },
            )
        })
        .collect();
    Json(HealthStatus { ok: true, states })
}

/// Metrics endpoint - returns relay counters
pub async fn metrics_handler(State(state): State<AppState>) -> impl IntoResponse {
    Json(state.metrics.snapshot())
}
