use crate::handlers::common::{map_service_error, success_response, validate_input};
use crate::{
    entities::commerce::AbandonmentStage, errors::ApiError,
    repositories::AbandonmentFilter, AppState,
};
use axum::{
    extract::{Json, Path, Query, State},
    response::IntoResponse,
    routing::{get, post},
    Router,
};
use serde::Deserialize;
use std::sync::Arc;
use uuid::Uuid;
use validator::Validate;

/// Abandonment signals, nested under `/carts`
pub fn cart_abandonment_routes() -> Router<Arc<AppState>> {
    Router::new()
        .route("/:id/abandonment", post(track_abandonment))
        .route("/:id/abandonment/recovered", post(mark_recovered))
        .route("/:id/abandonment/email", post(record_recovery_email))
        .route("/:id/abandonment/click", post(record_recovery_click))
}

/// Reporting over tracking rows
pub fn abandoned_carts_routes() -> Router<Arc<AppState>> {
    Router::new().route("/", get(list_abandoned_carts))
}

async fn track_abandonment(
    State(state): State<Arc<AppState>>,
    Path(cart_id): Path<Uuid>,
    Json(payload): Json<TrackAbandonmentRequest>,
) -> Result<impl IntoResponse, ApiError> {
    validate_input(&payload)?;

    let row = state
        .services
        .abandonment
        .track_abandonment(cart_id, payload.stage, payload.last_page)
        .await
        .map_err(map_service_error)?;

    Ok(success_response(row))
}

/// Returns the updated row, or null when the cart was never tracked
async fn mark_recovered(
    State(state): State<Arc<AppState>>,
    Path(cart_id): Path<Uuid>,
    Json(payload): Json<MarkRecoveredRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let row = state
        .services
        .abandonment
        .mark_recovered(cart_id, payload.order_id)
        .await
        .map_err(map_service_error)?;

    Ok(success_response(row))
}

async fn record_recovery_email(
    State(state): State<Arc<AppState>>,
    Path(cart_id): Path<Uuid>,
) -> Result<impl IntoResponse, ApiError> {
    let row = state
        .services
        .abandonment
        .record_recovery_email(cart_id)
        .await
        .map_err(map_service_error)?;

    Ok(success_response(row))
}

async fn record_recovery_click(
    State(state): State<Arc<AppState>>,
    Path(cart_id): Path<Uuid>,
) -> Result<impl IntoResponse, ApiError> {
    let row = state
        .services
        .abandonment
        .record_recovery_click(cart_id)
        .await
        .map_err(map_service_error)?;

    Ok(success_response(row))
}

async fn list_abandoned_carts(
    State(state): State<Arc<AppState>>,
    Query(filter): Query<AbandonmentFilter>,
) -> Result<impl IntoResponse, ApiError> {
    let rows = state
        .services
        .abandonment
        .list_abandoned(&filter)
        .await
        .map_err(map_service_error)?;

    Ok(success_response(rows))
}

#[derive(Debug, Deserialize, Validate)]
pub struct TrackAbandonmentRequest {
    pub stage: AbandonmentStage,
    #[validate(length(max = 2048))]
    pub last_page: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct MarkRecoveredRequest {
    pub order_id: Uuid,
}
