//! Liveness and readiness probes (§6), grounded on the sibling `admin`
//! crate's `/livez`/`/readyz` routes. This coordinator holds all state
//! in-memory behind the arbiter rather than against an external store, so
//! there is no downstream dependency to probe: both routes report healthy
//! once the HTTP server itself is able to answer.

use axum::http::StatusCode;
use axum::routing::get;
use axum::{Json, Router};
use serde::Serialize;

use crate::AppState;

/// Routes this module owns.
pub(crate) fn routes() -> Router<AppState> {
    Router::new().route("/livez", get(livez)).route("/readyz", get(readyz))
}

#[derive(Serialize)]
struct ProbeResponse {
    probe: &'static str,
    status: &'static str,
}

async fn livez() -> (StatusCode, Json<ProbeResponse>) {
    (StatusCode::OK, Json(ProbeResponse { probe: "livez", status: "ok" }))
}

async fn readyz() -> (StatusCode, Json<ProbeResponse>) {
    (StatusCode::OK, Json(ProbeResponse { probe: "readyz", status: "ok" }))
}

#[cfg(test)]
mod tests {
    use axum::body::Body;
    use axum::http::{Request, StatusCode};
    use tower::ServiceExt;

    use crate::tests::test_state;

    #[tokio::test]
    async fn livez_reports_ok() {
        let app = super::routes().with_state(test_state());
        let response = app.oneshot(Request::builder().uri("/livez").body(Body::empty()).unwrap()).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn readyz_reports_ok() {
        let app = super::routes().with_state(test_state());
        let response = app.oneshot(Request::builder().uri("/readyz").body(Body::empty()).unwrap()).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }
}
