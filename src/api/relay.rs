//! Relay control endpoints
//!
//! On-demand entry points into the delivery scheduler. The periodic
//! timer task in `main.rs` drives the same code path.

use axum::{Router, extract::State, response::Json, routing::post};

use super::dto::{CycleResponse, TriggerRequest, TriggerResponse};
use crate::AppState;
use crate::error::AppError;
use crate::metrics::HTTP_REQUESTS_TOTAL;
use crate::service::CycleTrigger;

/// Create relay router
///
/// Routes:
/// - POST /relay/trigger - deliver for a single handle
/// - POST /relay/run - run a full cycle across eligible accounts
pub fn relay_router() -> Router<AppState> {
    Router::new()
        .route("/relay/trigger", post(trigger_for_handle))
        .route("/relay/run", post(run_full_cycle))
}

/// POST /api/v1/relay/trigger
///
/// Fetches, filters and delivers pending events for one handle. 404 when
/// the handle has no active link. A handle whose notifications are off or
/// that is mid-cycle elsewhere reports zero deliveries.
async fn trigger_for_handle(
    State(state): State<AppState>,
    Json(req): Json<TriggerRequest>,
) -> Result<Json<TriggerResponse>, AppError> {
    let notifications_sent = state.scheduler.run_for_handle(&req.source_handle).await?;

    HTTP_REQUESTS_TOTAL
        .with_label_values(&["POST", "/api/v1/relay/trigger", "200"])
        .inc();

    Ok(Json(TriggerResponse {
        success: true,
        notifications_sent,
    }))
}

/// POST /api/v1/relay/run
///
/// Runs one delivery cycle over every eligible account, exactly like the
/// periodic timer, and reports the per-account tallies.
async fn run_full_cycle(State(state): State<AppState>) -> Result<Json<CycleResponse>, AppError> {
    let report = state.scheduler.run_cycle(CycleTrigger::OnDemand).await?;

    HTTP_REQUESTS_TOTAL
        .with_label_values(&["POST", "/api/v1/relay/run", "200"])
        .inc();

    Ok(Json(CycleResponse {
        success: true,
        report,
    }))
}
