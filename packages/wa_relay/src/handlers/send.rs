use axum::{
    Json,
    extract::{Query, State},
    http::StatusCode,
};
use serde::Deserialize;
use tracing::info;

use wa_session::{BatchItem, BatchReport, OutboundRequest, SendSource, SessionHandle};

use crate::AppState;
use crate::handlers::{AgentQuery, ApiError, api_error, resolve_session, session_status_code};

#[derive(Debug, Deserialize)]
pub struct SendTestRequest {
    #[serde(default)]
    pub to: Option<String>,
    #[serde(default)]
    pub text: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct BatchRequest {
    #[serde(default)]
    pub items: Option<Vec<BatchItem>>,
}

fn non_empty(value: Option<String>) -> Option<String> {
    value.filter(|v| !v.trim().is_empty())
}

/// `POST /send-test {to, text}`
pub async fn send_test(
    State(state): State<AppState>,
    Query(query): Query<AgentQuery>,
    Json(req): Json<SendTestRequest>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let handle = resolve_session(&state, query.agent(), "msg").await?;
    if !handle.is_connected() {
        return Err(api_error(
            StatusCode::SERVICE_UNAVAILABLE,
            "msg",
            "session is not connected",
        ));
    }
    let (Some(to), Some(text)) = (non_empty(req.to), non_empty(req.text)) else {
        return Err(api_error(
            StatusCode::BAD_REQUEST,
            "msg",
            "missing fields {to, text}",
        ));
    };

    let result = handle
        .send(OutboundRequest {
            to,
            text,
            template: None,
            source: SendSource::SendTest,
        })
        .await;
    state.metrics.send_result(result.is_ok());
    match result {
        Ok(peer) => {
            info!("Test message sent to {} via '{}'", peer, handle.agent());
            Ok(Json(serde_json::json!({ "ok": true })))
        }
        Err(e) => Err(api_error(session_status_code(&e), "msg", e.to_string())),
    }
}

async fn run_batch(
    state: &AppState,
    handle: &SessionHandle,
    items: Vec<BatchItem>,
) -> Result<Json<BatchReport>, ApiError> {
    let report = state
        .batch
        .send(handle, items)
        .await
        .map_err(|e| api_error(session_status_code(&e), "error", e.to_string()))?;
    state.metrics.batch_sent();
    for result in &report.results {
        state.metrics.send_result(result.ok);
    }
    Ok(Json(report))
}

/// `POST /send-batch {items: [...]}`
pub async fn send_batch(
    State(state): State<AppState>,
    Query(query): Query<AgentQuery>,
    Json(req): Json<BatchRequest>,
) -> Result<Json<BatchReport>, ApiError> {
    let Some(items) = req.items else {
        return Err(api_error(
            StatusCode::BAD_REQUEST,
            "error",
            "body must include 'items' (array)",
        ));
    };
    let handle = resolve_session(&state, query.agent(), "error").await?;
    run_batch(&state, &handle, items).await
}

/// `GET /send-batch-demo` - one default-text message to the configured recipient.
pub async fn send_batch_demo(
    State(state): State<AppState>,
    Query(query): Query<AgentQuery>,
) -> Result<Json<BatchReport>, ApiError> {
    let Some(recipient) = state.send_config.demo_recipient.clone() else {
        return Err(api_error(
            StatusCode::BAD_REQUEST,
            "error",
            "no demo recipient configured",
        ));
    };
    let handle = resolve_session(&state, query.agent(), "error").await?;
    let items = vec![BatchItem {
        to: Some(recipient),
        text: Some(state.send_config.default_text.clone()),
        ..Default::default()
    }];
    run_batch(&state, &handle, items).await
}
