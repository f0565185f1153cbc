//! Read-only observability endpoint (§6).

use axum::extract::State;
use axum::routing::get;
use axum::{Json, Router};
use model::wire::CoordinatorStatus;

use crate::AppState;

/// Routes this module owns.
pub(crate) fn routes() -> Router<AppState> {
    Router::new().route("/api/coordinator", get(status))
}

async fn status(State(state): State<AppState>) -> Json<CoordinatorStatus> {
    Json(state.arbiter.status().await)
}
