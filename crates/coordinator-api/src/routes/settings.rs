//! Settings endpoints (§6): read the current version, or validate and
//! apply a full replacement.

use axum::extract::State;
use axum::http::StatusCode;
use axum::routing::{get, put};
use axum::{Json, Router};
use model::wire::FieldErrorDetail;
use model::{RuntimeSettings, SettingsError};

use crate::AppState;

/// Routes this module owns.
pub(crate) fn routes() -> Router<AppState> {
    Router::new().route("/api/settings", get(get_settings).put(put_settings))
}

async fn get_settings(State(state): State<AppState>) -> Json<RuntimeSettings> {
    Json(state.arbiter.get_settings().await)
}

async fn put_settings(
    State(state): State<AppState>,
    Json(candidate): Json<RuntimeSettings>,
) -> Result<Json<RuntimeSettings>, (StatusCode, Json<FieldErrorDetail>)> {
    state.arbiter.put_settings(candidate).await.map(Json).map_err(|error| {
        let detail = match error {
            SettingsError::OutOfRange { field, message } => FieldErrorDetail { field, message },
            SettingsError::CrossField(message) => FieldErrorDetail { field: "_cross_field".to_string(), message },
        };
        (StatusCode::UNPROCESSABLE_ENTITY, Json(detail))
    })
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
    async fn invalid_update_returns_422_with_field_detail() {
        let app = routes().with_state(test_state());
        let mut bad = RuntimeSettings::default();
        bad.min_concurrency = 20;
        bad.initial_concurrency = 5;
        let request = Request::builder()
            .method("PUT")
            .uri("/api/settings")
            .header("content-type", "application/json")
            .body(Body::from(serde_json::to_vec(&bad).unwrap()))
            .unwrap();
        let response = app.oneshot(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::UNPROCESSABLE_ENTITY);
        let body = response.into_body().collect().await.unwrap().to_bytes();
        let detail: FieldErrorDetail = serde_json::from_slice(&body).unwrap();
        assert_eq!(detail.field, "_cross_field");
    }
}
