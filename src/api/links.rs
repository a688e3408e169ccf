//! Identity link endpoints
//!
//! Management surface for the identity link registry. All routes here
//! sit behind the API token middleware (wired up in `build_router`).

use axum::{
    Router,
    extract::{Path, State},
    response::Json,
    routing::{get, patch, post},
};

use super::dto::{AckResponse, LinkAccountRequest, LinkResponse, UpdatePreferencesRequest};
use crate::AppState;
use crate::error::AppError;
use crate::metrics::HTTP_REQUESTS_TOTAL;

/// Create links router
///
/// Routes:
/// - POST /links - link a source account to a sink account
/// - GET /links/:source_handle - fetch the active link
/// - DELETE /links/:source_handle - unlink (idempotent)
/// - PATCH /links/:source_handle/preferences - toggle notifications
pub fn links_router() -> Router<AppState> {
    Router::new()
        .route("/links", post(create_link))
        .route(
            "/links/:source_handle",
            get(get_link).delete(delete_link),
        )
        .route(
            "/links/:source_handle/preferences",
            patch(update_preferences),
        )
}

/// POST /api/v1/links
///
/// Registers a link between a source handle and a sink account. When the
/// handle is already linked to a different sink account this fails with
/// 409 unless `supersede` is set.
async fn create_link(
    State(state): State<AppState>,
    Json(req): Json<LinkAccountRequest>,
) -> Result<Json<LinkResponse>, AppError> {
    let link = state
        .registry
        .link_account(
            &req.source_handle,
            req.sink_id,
            &req.delivery_token,
            &req.callback_endpoint,
            req.supersede,
        )
        .await?;

    HTTP_REQUESTS_TOTAL
        .with_label_values(&["POST", "/api/v1/links", "200"])
        .inc();

    Ok(Json(LinkResponse::new(link)))
}

/// GET /api/v1/links/:source_handle
async fn get_link(
    State(state): State<AppState>,
    Path(source_handle): Path<String>,
) -> Result<Json<LinkResponse>, AppError> {
    let link = state.registry.get_link(&source_handle).await?;

    Ok(Json(LinkResponse::new(link)))
}

/// DELETE /api/v1/links/:source_handle
///
/// Revokes the link. Deleting an already-revoked or unknown handle is a
/// no-op that still reports success, so retries are harmless.
async fn delete_link(
    State(state): State<AppState>,
    Path(source_handle): Path<String>,
) -> Result<Json<AckResponse>, AppError> {
    state.registry.unlink_account(&source_handle).await?;

    HTTP_REQUESTS_TOTAL
        .with_label_values(&["DELETE", "/api/v1/links/:source_handle", "200"])
        .inc();

    Ok(Json(AckResponse::ok()))
}

/// PATCH /api/v1/links/:source_handle/preferences
async fn update_preferences(
    State(state): State<AppState>,
    Path(source_handle): Path<String>,
    Json(req): Json<UpdatePreferencesRequest>,
) -> Result<Json<LinkResponse>, AppError> {
    let link = state
        .registry
        .update_preferences(&source_handle, req.notifications_enabled)
        .await?;

    Ok(Json(LinkResponse::new(link)))
}
