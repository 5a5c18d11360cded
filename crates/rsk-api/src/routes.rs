//! Axum router and all HTTP handlers for the API service.
//!
//! `build_router` is the single entry point; `main.rs` calls it and attaches
//! middleware layers. All handlers are `pub(crate)` so the scenario tests in
//! `tests/` can compose the router directly.

use std::sync::Arc;

use axum::extract::{Path, Query, State};
use axum::http::{header, StatusCode};
use axum::response::IntoResponse;
use axum::routing::{get, post};
use axum::{Json, Router};
use chrono::Utc;
use serde::Deserialize;
use serde_json::Value;
use tracing::{error, info, warn};

use rsk_db::{DlqRow, EventInsert, NewEvent, RiskScoreRow};
use rsk_schemas::{
    payload_hash, DlqEntryResponse, DlqListResponse, Event, EventAcceptedResponse, EventType,
    HealthResponse, RiskScoreResponse,
};

use crate::error::ApiError;
use crate::state::AppState;

// ---------------------------------------------------------------------------
// Router
// ---------------------------------------------------------------------------

/// Build the complete application router wired to the given shared state.
///
/// Middleware layers (metrics, CORS, tracing) are **not** applied here;
/// `main.rs` attaches them after this call so tests can use the bare router.
pub fn build_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/events", post(ingest_event))
        .route("/score/:user_id", get(get_latest_score))
        .route("/score/:user_id/history", get(get_score_history))
        .route("/dlq", get(list_dlq_entries))
        .route("/dlq/:dlq_id", get(get_dlq_entry))
        .route("/health", get(health))
        .route("/metrics", get(metrics_exposition))
        .with_state(state)
}

// ---------------------------------------------------------------------------
// POST /events
// ---------------------------------------------------------------------------

/// Ingest one event.
///
/// The row is durable before any publish attempt, publication is
/// at-least-once, and a duplicate POST re-drives the publish when the first
/// attempt never reached the broker. Duplicates are transparent to the
/// client: 202 either way.
pub(crate) async fn ingest_event(
    State(st): State<Arc<AppState>>,
    Json(body): Json<Value>,
) -> Result<impl IntoResponse, ApiError> {
    let event = match rsk_schemas::parse_event(&body) {
        Ok(event) => event,
        Err(err) => {
            st.metrics
                .events_ingested_total
                .with_label_values(&[event_type_label(&body), "invalid"])
                .inc();
            return Err(ApiError::Validation(err));
        }
    };

    let raw_payload_hash = payload_hash(&body);
    let new_event = NewEvent::from_event(&event, raw_payload_hash, Utc::now());

    match rsk_db::insert_event_if_absent(&st.pool, &new_event).await? {
        EventInsert::Inserted => {
            st.metrics
                .events_ingested_total
                .with_label_values(&[event.event_type().as_str(), "accepted"])
                .inc();
            publish_and_mark(&st, &event).await;
        }
        EventInsert::AlreadyExists(row) => {
            st.metrics
                .events_ingested_total
                .with_label_values(&[event.event_type().as_str(), "duplicate"])
                .inc();
            if row.published_at.is_none() {
                // First attempt never reached the broker; retry with the
                // stored row so key and value are identical.
                match stored_row_to_event(&row) {
                    Ok(stored) => publish_and_mark(&st, &stored).await,
                    Err(err) => warn!(
                        event_id = %row.event_id,
                        error = %err,
                        "stored event no longer decodes; skipping re-publish"
                    ),
                }
            }
        }
    }

    Ok((
        StatusCode::ACCEPTED,
        Json(EventAcceptedResponse::accepted(event.event_id)),
    ))
}

/// Publish and flip the publication flag. Publish failures are swallowed by
/// design: the row is durable and a later duplicate POST or operational
/// retry job re-drives the publish.
async fn publish_and_mark(st: &AppState, event: &Event) {
    match st.producer.publish(event).await {
        Ok(()) => {
            info!(event_id = %event.event_id, "event published");
            if let Err(err) = rsk_db::mark_published(&st.pool, event.event_id, Utc::now()).await {
                error!(
                    event_id = %event.event_id,
                    error = ?err,
                    "publish succeeded but mark_published failed; duplicate POST will repair"
                );
            }
        }
        Err(err) => {
            error!(
                event_id = %event.event_id,
                error = ?err,
                "publish failed; row remains unpublished"
            );
        }
    }
}

fn stored_row_to_event(row: &rsk_db::EventRow) -> Result<Event, rsk_schemas::ValidationError> {
    let event_type = EventType::parse(&row.event_type).ok_or_else(|| {
        rsk_schemas::ValidationError::UnknownEventType(row.event_type.clone())
    })?;
    Event::from_parts(
        row.event_id,
        row.user_id.clone(),
        event_type,
        row.ts,
        row.schema_version,
        &row.payload_json,
    )
}

fn event_type_label(body: &Value) -> &str {
    body.get("event_type")
        .and_then(Value::as_str)
        .and_then(EventType::parse)
        .map(|et| et.as_str())
        .unwrap_or("unknown")
}

// ---------------------------------------------------------------------------
// GET /score/{user_id}  and  /score/{user_id}/history
// ---------------------------------------------------------------------------

pub(crate) async fn get_latest_score(
    State(st): State<Arc<AppState>>,
    Path(user_id): Path<String>,
) -> Result<Json<RiskScoreResponse>, ApiError> {
    let row = rsk_db::latest_score(&st.pool, &user_id)
        .await?
        .ok_or_else(|| ApiError::NotFound(format!("No score found for user {user_id}")))?;
    Ok(Json(score_response(row)))
}

#[derive(Debug, Deserialize)]
pub(crate) struct HistoryParams {
    limit: Option<i64>,
}

pub(crate) async fn get_score_history(
    State(st): State<Arc<AppState>>,
    Path(user_id): Path<String>,
    Query(params): Query<HistoryParams>,
) -> Result<Json<Vec<RiskScoreResponse>>, ApiError> {
    let limit = params.limit.unwrap_or(20).clamp(1, 1000);
    let rows = rsk_db::score_history(&st.pool, &user_id, limit).await?;
    Ok(Json(rows.into_iter().map(score_response).collect()))
}

fn score_response(row: RiskScoreRow) -> RiskScoreResponse {
    RiskScoreResponse {
        user_id: row.user_id,
        score: row.score,
        band: row.band,
        computed_at: row.computed_at,
        top_features: row.top_features_json,
        model_version: row.model_version,
    }
}

// ---------------------------------------------------------------------------
// GET /dlq  and  /dlq/{id}
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
pub(crate) struct DlqParams {
    limit: Option<i64>,
    offset: Option<i64>,
}

pub(crate) async fn list_dlq_entries(
    State(st): State<Arc<AppState>>,
    Query(params): Query<DlqParams>,
) -> Result<Json<DlqListResponse>, ApiError> {
    let limit = params.limit.unwrap_or(100).clamp(1, 1000);
    let offset = params.offset.unwrap_or(0).max(0);
    let (rows, total) = rsk_db::dlq_list(&st.pool, limit, offset).await?;
    Ok(Json(DlqListResponse {
        entries: rows.into_iter().map(dlq_response).collect(),
        total,
    }))
}

pub(crate) async fn get_dlq_entry(
    State(st): State<Arc<AppState>>,
    Path(dlq_id): Path<i32>,
) -> Result<Json<DlqEntryResponse>, ApiError> {
    let row = rsk_db::dlq_get(&st.pool, dlq_id)
        .await?
        .ok_or_else(|| ApiError::NotFound(format!("DLQ entry {dlq_id} not found")))?;
    Ok(Json(dlq_response(row)))
}

fn dlq_response(row: DlqRow) -> DlqEntryResponse {
    DlqEntryResponse {
        id: row.id,
        event_id: row.event_id,
        raw_payload: row.raw_payload,
        failure_reason: row.failure_reason,
        created_at: row.created_at,
        retry_count: row.retry_count,
    }
}

// ---------------------------------------------------------------------------
// GET /health  and  /metrics
// ---------------------------------------------------------------------------

pub(crate) async fn health(State(st): State<Arc<AppState>>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "healthy".to_string(),
        version: st.build.version.to_string(),
    })
}

pub(crate) async fn metrics_exposition(
    State(st): State<Arc<AppState>>,
) -> Result<impl IntoResponse, ApiError> {
    let body = st.metrics.render()?;
    Ok((
        [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
        body,
    ))
}
