//! Worker sync endpoint (§4.H, §6): the one stateful round-trip between
//! a worker and the coordinator.

use axum::extract::State;
use axum::routing::post;
use axum::{Json, Router};
use model::wire::{SyncRequest, SyncResponse};

use crate::AppState;

/// Routes this module owns.
pub(crate) fn routes() -> Router<AppState> {
    Router::new().route("/api/worker/sync", post(sync))
}

async fn sync(State(state): State<AppState>, Json(body): Json<SyncRequest>) -> Json<SyncResponse> {
    Json(state.arbiter.sync(body.worker_id, body.metrics).await)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tests::test_state;
    use axum::body::Body;
    use axum::http::{Request, StatusCode};
    use http_body_util::BodyExt;
    use tower::ServiceExt;

    #[tokio::test]
    async fn bootstrap_sync_with_no_metrics_returns_defaults() {
        let app = routes().with_state(test_state());
        let body = SyncRequest { worker_id: "w1".to_string(), metrics: None };
        let request = Request::builder()
            .method("POST")
            .uri("/api/worker/sync")
            .header("content-type", "application/json")
            .body(Body::from(serde_json::to_vec(&body).unwrap()))
            .unwrap();
        let response = app.oneshot(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let body = response.into_body().collect().await.unwrap().to_bytes();
        let parsed: SyncResponse = serde_json::from_slice(&body).unwrap();
        assert!(!parsed.block.active);
    }
}
