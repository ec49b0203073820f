use axum::{
    Json,
    extract::{Query, State},
    http::{StatusCode, header},
    response::IntoResponse,
};
use serde::Deserialize;
use tracing::{info, warn};

use crate::AppState;
use crate::export::{attachment_name, to_csv};
use crate::handlers::{ApiError, api_error};
use crate::sse::push_response;

const STATS_WINDOW: usize = 1000;

#[derive(Debug, Default, Deserialize)]
pub struct TailQuery {
    #[serde(default)]
    pub limit: Option<usize>,
    #[serde(default)]
    pub since: Option<i64>,
}

impl TailQuery {
    fn limit(&self, default: usize, max: usize) -> usize {
        self.limit.unwrap_or(default).clamp(1, max)
    }

    fn since(&self) -> i64 {
        self.since.unwrap_or(0)
    }
}

/// `GET /api/events?limit&since`
pub async fn list_events(
    State(state): State<AppState>,
    Query(query): Query<TailQuery>,
) -> impl IntoResponse {
    let items = state.log.tail(query.limit(300, 1000), query.since()).await;
    Json(serde_json::json!({ "ok": true, "items": items }))
}

/// `GET /api/events.csv?limit&since`
pub async fn events_csv(
    State(state): State<AppState>,
    Query(query): Query<TailQuery>,
) -> impl IntoResponse {
    let items = state.log.tail(query.limit(1000, 5000), query.since()).await;
    let disposition = format!("attachment; filename=\"{}\"", attachment_name());
    (
        [
            (header::CONTENT_TYPE, "text/csv; charset=utf-8".to_string()),
            (header::CONTENT_DISPOSITION, disposition),
        ],
        to_csv(&items),
    )
}

/// `DELETE /api/events`
pub async fn clear_events(State(state): State<AppState>) -> Result<Json<serde_json::Value>, ApiError> {
    match state.log.clear().await {
        Ok(()) => {
            info!("Event log cleared");
            Ok(Json(serde_json::json!({ "ok": true })))
        }
        Err(e) => {
            warn!("Could not clear event log: {}", e);
            Err(api_error(StatusCode::INTERNAL_SERVER_ERROR, "msg", e.to_string()))
        }
    }
}

/// `GET /api/stats` over the most recent records.
pub async fn stats(State(state): State<AppState>) -> impl IntoResponse {
    let stats = state.log.stats(STATS_WINDOW).await;
    Json(serde_json::json!({ "ok": true, "stats": stats }))
}

/// `GET /events-stream` - log-update pulses for the dashboard.
pub async fn events_stream(State(state): State<AppState>) -> impl IntoResponse {
    push_response(state.log.subscribe(), &state.sse, state.metrics.clone())
}
