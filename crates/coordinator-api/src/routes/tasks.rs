//! Task backlog endpoints (§6): pull, submit results, release.

use axum::extract::{Query, State};
use axum::http::StatusCode;
use axum::routing::{get, post};
use axum::{Json, Router};
use model::wire::{PullTasksResponse, ReleaseTasksRequest, SubmitResultsRequest};
use serde::Deserialize;

use crate::AppState;

/// Routes this module owns.
pub(crate) fn routes() -> Router<AppState> {
    Router::new()
        .route("/api/tasks/pull", get(pull))
        .route("/api/tasks/result/batch", post(submit_results))
        .route("/api/tasks/release", post(release))
}

#[derive(Debug, Deserialize)]
pub(crate) struct PullQuery {
    worker_id: String,
    count: u32,
}

async fn pull(State(state): State<AppState>, Query(query): Query<PullQuery>) -> Json<PullTasksResponse> {
    let tasks = state.arbiter.pull_tasks(&query.worker_id, query.count).await;
    Json(PullTasksResponse { tasks })
}

async fn submit_results(State(state): State<AppState>, Json(body): Json<SubmitResultsRequest>) -> StatusCode {
    state.arbiter.submit_results(body.results).await;
    StatusCode::NO_CONTENT
}

async fn release(State(state): State<AppState>, Json(body): Json<ReleaseTasksRequest>) -> StatusCode {
    state.arbiter.release_tasks(body.task_ids).await;
    StatusCode::NO_CONTENT
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tests::test_state;
    use axum::body::Body;
    use axum::http::Request;
    use http_body_util::BodyExt;
    use tower::ServiceExt;

    #[tokio::test]
    async fn pull_returns_empty_when_backlog_is_empty() {
        let app = routes().with_state(test_state());
        let response = app
            .oneshot(Request::builder().uri("/api/tasks/pull?worker_id=w1&count=5").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let body = response.into_body().collect().await.unwrap().to_bytes();
        let parsed: PullTasksResponse = serde_json::from_slice(&body).unwrap();
        assert!(parsed.tasks.is_empty());
    }
}
